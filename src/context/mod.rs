//! Per-request working context.
//!
//! # Responsibilities
//! - Own one request's working directory and everything written into it
//! - Expose parsed form values and uploaded files to handlers
//! - Collect output paths and assemble them into one file or a zip archive
//! - Carry the soft deadline and a cancellation token
//!
//! # Lifecycle
//! ```text
//! multipart body accepted → directory created, files/values ingested
//!     → handler adds output paths
//!     → build_output_file (single file or archive)
//!     → cancel() / close(): token cancelled, directory removed (exactly once)
//! ```
//!
//! Cancellation is triggered by a [`ContextGuard`] going out of scope: after the
//! response body is streamed, when the hard timeout fires, or when the client
//! goes away and the request future is dropped. Dropping the last reference to
//! the context cancels it too.

pub mod download;
pub mod fs;
pub mod multipart;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use axum::http::{HeaderMap, HeaderName};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::form::FormData;
use crate::http::error::ApiError;
use fs::{base_name, dotted_extension, sanitize_filename};

pub use download::Downloader;
pub use multipart::{BodyBudget, IngestOptions};

/// Overrides the base name of the returned file.
pub const OUTPUT_FILENAME_HEADER: &str = "Gotenberg-Output-Filename";

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("context already closed")]
    AlreadyClosed,

    #[error("output path '{}' is not within context's working directory", .0.display())]
    OutOfBounds(PathBuf),

    #[error("no output path")]
    NoOutput,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive output files: {0}")]
    Archive(#[from] zip::result::ZipError),
}

pub struct RequestContext {
    dir: PathBuf,
    values: HashMap<String, Vec<String>>,
    files: HashMap<String, PathBuf>,
    outputs: Mutex<Vec<PathBuf>>,
    cancelled: AtomicBool,
    deadline: Instant,
    token: CancellationToken,
    headers: HeaderMap,
    trace: String,
    trace_header: HeaderName,
}

impl RequestContext {
    /// An empty context over an existing directory.
    pub fn new(dir: PathBuf, deadline: Instant) -> Self {
        Self {
            dir,
            values: HashMap::new(),
            files: HashMap::new(),
            outputs: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
            deadline,
            token: CancellationToken::new(),
            headers: HeaderMap::new(),
            trace: String::new(),
            trace_header: HeaderName::from_static(crate::http::request::DEFAULT_TRACE_HEADER),
        }
    }

    /// Attach the originating request's headers and trace id.
    pub fn with_request(mut self, headers: HeaderMap, trace: String, trace_header: HeaderName) -> Self {
        self.headers = headers;
        self.trace = trace;
        self.trace_header = trace_header;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn trace(&self) -> &str {
        &self.trace
    }

    pub fn trace_header(&self) -> &HeaderName {
        &self.trace_header
    }

    pub fn values(&self) -> &HashMap<String, Vec<String>> {
        &self.values
    }

    pub fn files(&self) -> &HashMap<String, PathBuf> {
        &self.files
    }

    /// Instant after which cooperative work should stop.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Token cancelled together with this context.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the deadline passes or the context is cancelled.
    pub async fn done(&self) {
        tokio::select! {
            _ = tokio::time::sleep_until(self.deadline) => {}
            _ = self.token.cancelled() => {}
        }
    }

    /// Drive `fut` until it completes, the deadline passes, or the context closes.
    pub async fn run_until_deadline<F, T>(&self, fut: F) -> Result<T, ApiError>
    where
        F: Future<Output = Result<T, ApiError>>,
    {
        tokio::select! {
            result = fut => result,
            _ = tokio::time::sleep_until(self.deadline) => Err(ApiError::DeadlineExceeded),
            _ = self.token.cancelled() => Err(ApiError::Context(ContextError::AlreadyClosed)),
        }
    }

    pub fn form_data(&self) -> FormData<'_> {
        FormData::new(&self.values, &self.files)
    }

    /// A fresh path inside the working directory. No file is created.
    pub fn generate_path(&self, extension: &str) -> PathBuf {
        self.dir.join(format!("{}{}", Uuid::new_v4(), extension))
    }

    /// A path keeping `filename`, inside a new unique sub-directory.
    /// The sub-directory is created, the file is not.
    pub async fn generate_path_from_filename(&self, filename: &str) -> Result<PathBuf, ContextError> {
        self.ensure_open()?;
        let name = sanitize_filename(filename).unwrap_or_else(|| Uuid::new_v4().to_string());
        let sub_dir = self.dir.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&sub_dir).await?;
        Ok(sub_dir.join(name))
    }

    /// Register files to return. All paths must live in the working directory;
    /// nothing is registered if one of them does not.
    pub fn add_output_paths<I, P>(&self, paths: I) -> Result<(), ContextError>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.ensure_open()?;

        let paths: Vec<PathBuf> = paths.into_iter().map(Into::into).collect();
        if let Some(outside) = paths.iter().find(|path| !self.contains(path)) {
            return Err(ContextError::OutOfBounds(outside.clone()));
        }

        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(paths);
        Ok(())
    }

    pub fn output_paths(&self) -> Vec<PathBuf> {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.dir)
            && path != self.dir
            && !path.components().any(|c| matches!(c, Component::ParentDir))
    }

    fn ensure_open(&self) -> Result<(), ContextError> {
        if self.is_cancelled() {
            Err(ContextError::AlreadyClosed)
        } else {
            Ok(())
        }
    }

    /// The single output as-is, or a new zip archive of all outputs.
    pub async fn build_output_file(&self) -> Result<PathBuf, ContextError> {
        self.ensure_open()?;

        let outputs = self.output_paths();
        match outputs.as_slice() {
            [] => Err(ContextError::NoOutput),
            [single] => {
                tracing::debug!(
                    path = %single.display(),
                    "Only one output file, skipping archive creation"
                );
                Ok(single.clone())
            }
            _ => {
                let archive = self.generate_path(".zip");
                let target = archive.clone();
                tokio::task::spawn_blocking(move || write_archive(&target, &outputs))
                    .await
                    .map_err(|e| ContextError::Io(std::io::Error::other(e)))??;

                tracing::debug!(path = %archive.display(), "Archive created");
                Ok(archive)
            }
        }
    }

    /// Filename for `path` in the response, honouring the output filename header.
    pub fn output_filename(&self, path: &Path) -> String {
        let custom = self
            .headers
            .get(OUTPUT_FILENAME_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(sanitize_filename);

        match custom {
            Some(name) => format!("{name}{}", dotted_extension(path)),
            None => base_name(path),
        }
    }

    /// Cancel the context and remove its working directory. Idempotent.
    ///
    /// Inside a runtime the removal runs on the blocking pool and this returns
    /// right away; without one it runs inline.
    pub fn cancel(&self) {
        if !self.mark_cancelled() {
            return;
        }

        let dir = self.dir.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_working_dir(&dir));
            }
            Err(_) => remove_working_dir(&dir),
        }
    }

    /// Like [`cancel`](Self::cancel), but waits until the directory is gone.
    pub async fn close(&self) {
        if !self.mark_cancelled() {
            return;
        }

        let dir = self.dir.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || remove_working_dir(&dir)).await {
            tracing::error!(dir = %self.dir.display(), error = %e, "Working directory cleanup panicked");
        }
    }

    /// `true` for the first caller only.
    fn mark_cancelled(&self) -> bool {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        true
    }
}

fn remove_working_dir(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {
            tracing::debug!(dir = %dir.display(), "Working directory removed");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::error!(
                dir = %dir.display(),
                error = %e,
                "Failed to remove working directory"
            );
        }
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("dir", &self.dir)
            .field("values", &self.values)
            .field("files", &self.files)
            .field("cancelled", &self.is_cancelled())
            .field("trace", &self.trace)
            .finish()
    }
}

fn write_archive(archive: &Path, files: &[PathBuf]) -> Result<(), ContextError> {
    let file = std::fs::File::create(archive)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    let mut used = HashSet::new();
    for path in files {
        let name = unique_entry_name(&base_name(path), &mut used);
        writer.start_file(name, options)?;
        let mut input = std::fs::File::open(path)?;
        std::io::copy(&mut input, &mut writer)?;
    }

    writer.finish()?;
    Ok(())
}

fn unique_entry_name(name: &str, used: &mut HashSet<String>) -> String {
    if used.insert(name.to_string()) {
        return name.to_string();
    }

    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = dotted_extension(path);

    let mut n = 1;
    loop {
        let candidate = format!("{stem}_{n}{ext}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Cancels its context when dropped, unless disarmed.
#[derive(Debug)]
pub struct ContextGuard {
    ctx: Option<Arc<RequestContext>>,
}

impl ContextGuard {
    pub fn new(ctx: Arc<RequestContext>) -> Self {
        Self { ctx: Some(ctx) }
    }

    /// Hand cleanup over to whoever else holds the context.
    pub fn disarm(mut self) {
        self.ctx.take();
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            ctx.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::io::Read;
    use std::time::Duration;

    async fn context(root: &Path) -> RequestContext {
        let dir = fs::create_working_dir(root).await.unwrap();
        RequestContext::new(dir, Instant::now() + Duration::from_secs(5))
    }

    #[tokio::test]
    async fn output_paths_must_stay_inside() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path()).await;

        let inside = ctx.generate_path(".pdf");
        assert!(inside.starts_with(ctx.dir()));
        ctx.add_output_paths([&inside]).unwrap();

        let escape = ctx.dir().join("../elsewhere.pdf");
        let outside = root.path().join("other.pdf");
        for bad in [escape, outside, PathBuf::from("relative.pdf")] {
            let err = ctx.add_output_paths([inside.clone(), bad.clone()]).unwrap_err();
            assert!(matches!(err, ContextError::OutOfBounds(p) if p == bad));
        }

        assert_eq!(ctx.output_paths(), vec![inside]);
    }

    /// Cleanup after `cancel()` happens on the blocking pool.
    async fn wait_removed(dir: &Path) {
        for _ in 0..200 {
            if !dir.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} was not removed", dir.display());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path()).await;
        let dir = ctx.dir().to_path_buf();
        let token = ctx.cancellation_token();
        assert!(dir.is_dir());

        ctx.close().await;
        assert!(!dir.exists());
        assert!(token.is_cancelled());

        // Something else recreating the path must not be removed by a second call.
        std::fs::create_dir_all(&dir).unwrap();
        ctx.cancel();
        ctx.close().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dir.exists());

        assert!(matches!(
            ctx.add_output_paths([dir.join("a.pdf")]),
            Err(ContextError::AlreadyClosed)
        ));
        assert!(matches!(
            ctx.build_output_file().await,
            Err(ContextError::AlreadyClosed)
        ));
    }

    #[tokio::test]
    async fn single_output_is_returned_unchanged() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path()).await;
        assert!(matches!(ctx.build_output_file().await, Err(ContextError::NoOutput)));

        let path = ctx.generate_path(".pdf");
        std::fs::write(&path, b"%PDF-1.7").unwrap();
        ctx.add_output_paths([&path]).unwrap();

        assert_eq!(ctx.build_output_file().await.unwrap(), path);
    }

    #[tokio::test]
    async fn several_outputs_are_zipped() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path()).await;

        let mut outputs = Vec::new();
        for (name, body) in [("one.pdf", "1"), ("two.pdf", "22"), ("three.pdf", "333")] {
            let path = ctx.generate_path_from_filename(name).await.unwrap();
            std::fs::write(&path, body).unwrap();
            outputs.push(path);
        }
        ctx.add_output_paths(outputs.clone()).unwrap();

        let archive = ctx.build_output_file().await.unwrap();
        assert!(archive.starts_with(ctx.dir()));
        assert_eq!(archive.extension().unwrap(), "zip");

        let mut zip = zip::ZipArchive::new(std::fs::File::open(&archive).unwrap()).unwrap();
        assert_eq!(zip.len(), 3);
        let mut names: Vec<String> = zip.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["one.pdf", "three.pdf", "two.pdf"]);

        let mut content = String::new();
        zip.by_name("three.pdf").unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "333");
    }

    #[tokio::test]
    async fn duplicate_names_in_archive_are_renamed() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path()).await;

        let a = ctx.generate_path_from_filename("page.pdf").await.unwrap();
        let b = ctx.generate_path_from_filename("page.pdf").await.unwrap();
        assert_ne!(a, b);
        std::fs::write(&a, "a").unwrap();
        std::fs::write(&b, "b").unwrap();
        ctx.add_output_paths([a, b]).unwrap();

        let archive = ctx.build_output_file().await.unwrap();
        let zip = zip::ZipArchive::new(std::fs::File::open(&archive).unwrap()).unwrap();
        let mut names: Vec<&str> = zip.file_names().collect();
        names.sort();
        assert_eq!(names, vec!["page.pdf", "page_1.pdf"]);
    }

    #[tokio::test]
    async fn output_filename_header() {
        let root = tempfile::tempdir().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(OUTPUT_FILENAME_HEADER, HeaderValue::from_static("report"));
        let ctx = context(root.path())
            .await
            .with_request(headers, "trace-1".into(), HeaderName::from_static("gotenberg-trace"));

        assert_eq!(ctx.output_filename(Path::new("/x/abc.pdf")), "report.pdf");
        assert_eq!(ctx.output_filename(Path::new("/x/abc.zip")), "report.zip");

        let plain = context(root.path()).await;
        assert_eq!(plain.output_filename(Path::new("/x/abc.pdf")), "abc.pdf");
    }

    #[tokio::test]
    async fn guard_cancels_on_drop_unless_disarmed() {
        let root = tempfile::tempdir().unwrap();

        let ctx = Arc::new(context(root.path()).await);
        drop(ContextGuard::new(ctx.clone()));
        assert!(ctx.is_cancelled());

        let ctx = Arc::new(context(root.path()).await);
        ContextGuard::new(ctx.clone()).disarm();
        assert!(!ctx.is_cancelled());
        let dir = ctx.dir().to_path_buf();
        drop(ctx);
        wait_removed(&dir).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_inside_runtime_removes_in_background() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path()).await;
        let dir = ctx.dir().to_path_buf();

        ctx.cancel();
        assert!(ctx.is_cancelled());
        wait_removed(&dir).await;
    }

    #[test]
    fn cancel_outside_runtime_removes_inline() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("ctx");
        std::fs::create_dir_all(dir.join("nested")).unwrap();

        let ctx = RequestContext::new(dir.clone(), Instant::now() + Duration::from_secs(5));
        ctx.cancel();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn soft_deadline() {
        let root = tempfile::tempdir().unwrap();
        let dir = fs::create_working_dir(root.path()).await.unwrap();
        let ctx = RequestContext::new(dir, Instant::now() + Duration::from_millis(20));

        let err = ctx
            .run_until_deadline(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::DeadlineExceeded));
    }
}
