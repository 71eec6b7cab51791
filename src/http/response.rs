//! Response building for produced files.
//!
//! # Responsibilities
//! - Sniff the content type of an output file
//! - Build and parse `Content-Disposition` values
//! - Stream a file back as an attachment, cleaning up after the last byte
//!
//! # Design Decisions
//! - Streaming responses avoid buffering entire body
//! - The context guard lives inside the body stream, so the working
//!   directory is removed once the body is fully sent or dropped

use std::path::Path;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use futures_util::StreamExt;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

use crate::context::ContextGuard;
use crate::http::error::ApiError;

const SNIFF_LEN: usize = 512;

/// Guess a MIME type from the first bytes of a file.
pub fn detect_content_type(head: &[u8]) -> &'static str {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"%PDF-", "application/pdf"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xFF\xD8\xFF", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
    ];

    if let Some(mime) = SIGNATURES
        .iter()
        .find(|(magic, _)| head.starts_with(magic))
        .map(|(_, mime)| *mime)
    {
        return mime;
    }

    let start = head
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(head.len());
    let trimmed = &head[start..];
    let lower: Vec<u8> = trimmed.iter().take(14).map(u8::to_ascii_lowercase).collect();
    if lower.starts_with(b"<!doctype html") || lower.starts_with(b"<html") {
        return "text/html; charset=utf-8";
    }
    if lower.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }

    let is_text = std::str::from_utf8(head).is_ok()
        && !head
            .iter()
            .any(|b| b.is_ascii_control() && !matches!(b, b'\t' | b'\n' | b'\r' | 0x0c));
    if is_text && !head.is_empty() {
        return "text/plain; charset=utf-8";
    }

    "application/octet-stream"
}

/// Content type and size of a file on disk.
pub async fn sniff_file(path: &Path) -> std::io::Result<(&'static str, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let length = file.metadata().await?.len();

    let mut head = vec![0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < SNIFF_LEN {
        let read = file.read(&mut head[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    head.truncate(filled);

    Ok((detect_content_type(&head), length))
}

/// `attachment; filename="..."`, with an RFC 5987 variant for non-ASCII names.
pub fn content_disposition(filename: &str) -> String {
    let ascii: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if ascii == filename {
        format!("attachment; filename=\"{ascii}\"")
    } else {
        format!(
            "attachment; filename=\"{ascii}\"; filename*=UTF-8''{}",
            urlencoding::encode(filename)
        )
    }
}

/// Extract the filename from a `Content-Disposition` value.
/// `filename*` wins over `filename` when both are present.
pub fn parse_content_disposition_filename(value: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;

    for param in split_params(value).into_iter().skip(1) {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "filename" => plain = Some(unquote(raw.trim())),
            "filename*" => {
                let raw = raw.trim();
                let encoded = raw.split_once("''").map_or(raw, |(_, rest)| rest);
                extended = urlencoding::decode(encoded).ok().map(|s| s.into_owned());
            }
            _ => {}
        }
    }

    extended.or(plain).filter(|name| !name.is_empty())
}

fn split_params(value: &str) -> Vec<String> {
    let mut params = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut escaped = false;

    for c in value.chars() {
        match c {
            _ if escaped => {
                current.push(c);
                escaped = false;
            }
            '\\' if quoted => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                current.push(c);
                quoted = !quoted;
            }
            ';' if !quoted => params.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    params.push(current);
    params
}

fn unquote(raw: &str) -> String {
    match raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(inner) => {
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else {
                    out.push(c);
                }
            }
            out
        }
        None => raw.to_string(),
    }
}

/// Stream `path` back to the client as `filename`.
pub async fn attachment(path: &Path, filename: &str, guard: ContextGuard) -> Result<Response, ApiError> {
    let (content_type, length) = sniff_file(path).await.map_err(ApiError::internal)?;
    let file = tokio::fs::File::open(path).await.map_err(ApiError::internal)?;

    let stream = ReaderStream::new(file).map(move |chunk| {
        let _cleanup = &guard;
        chunk
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, length)
        .header(header::CONTENT_DISPOSITION, content_disposition(filename))
        .body(Body::from_stream(stream))
        .map_err(ApiError::internal)
}
