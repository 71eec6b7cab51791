//! Filesystem helpers for working directories and uploaded filenames.

use std::path::{Path, PathBuf};

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

/// Normalize a client-supplied filename and keep only its last component.
///
/// Accents are decomposed and their combining marks dropped, so `Résumé.docx`
/// becomes `Resume.docx`. Returns `None` when nothing usable is left.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let base = raw
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(raw);

    let normalized: String = base
        .nfd()
        .filter(|c| !is_combining_mark(*c) && !c.is_control())
        .nfc()
        .collect();
    let normalized = normalized.trim();

    match normalized {
        "" | "." | ".." => None,
        name => Some(name.to_string()),
    }
}

/// Extension of `path` including its dot, or an empty string.
pub fn dotted_extension(path: &Path) -> String {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}

/// Base name of `path` as a string.
pub fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Create a fresh, uniquely named directory under `root`.
pub async fn create_working_dir(root: &Path) -> std::io::Result<PathBuf> {
    let dir = root.join(Uuid::new_v4().to_string());
    tokio::fs::create_dir_all(&dir).await?;
    Ok(dir)
}
