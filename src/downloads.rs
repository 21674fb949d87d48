//! Staging area for finished downloads.
//!
//! Every POST gets its own randomly named file, so concurrent requests never
//! touch the same path and no locking is needed. A file lives until the first
//! GET for it has been streamed, then it is removed.

use std::{
    fs, io,
    path::{Component, Path, PathBuf},
    pin::Pin,
    task::{Context as TaskContext, Poll},
    time::Duration,
};

use anyhow::{Context, Result};
use axum::body::Bytes;
use futures::Stream;
use rand_core::{OsRng, RngCore};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::error::DownloadError;

pub const DEFAULT_EXTENSION: &str = "mp4";
const MAX_EXTENSION_LEN: usize = 8;

/// Root of the staged files.
#[derive(Debug, Clone)]
pub struct DownloadsDir {
    root: PathBuf,
}

/// A freshly allocated, not yet written, download target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub name: String,
    pub path: PathBuf,
}

impl DownloadsDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating {}", self.root.display()))
    }

    /// Picks `<random id>.<ext>`; unusable extensions fall back to mp4.
    pub fn allocate(&self, ext: Option<&str>) -> StagedFile {
        let name = format!("{}.{}", generate_id(), sanitize_extension(ext));
        let path = self.root.join(&name);
        StagedFile { name, path }
    }

    /// Maps a client supplied name onto an existing file in the directory.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        if !is_plain_file_name(name) {
            return None;
        }
        let path = self.root.join(name);
        path.is_file().then_some(path)
    }
}

/// 128 bits from the OS generator, hex encoded.
pub fn generate_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn sanitize_extension(ext: Option<&str>) -> &str {
    match ext.map(str::trim) {
        Some(ext)
            if !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext
        }
        _ => DEFAULT_EXTENSION,
    }
}

pub(crate) fn is_plain_file_name(name: &str) -> bool {
    if name.is_empty() || name.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// How long to keep looking for a file once the tool has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlePolicy {
    pub initial_delay: Duration,
    pub retry_delay: Duration,
    pub retries: u32,
}

impl Default for SettlePolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            retry_delay: Duration::from_millis(500),
            retries: 3,
        }
    }
}

impl SettlePolicy {
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            retry_delay: Duration::ZERO,
            retries: 0,
        }
    }
}

/// Waits for the downloaded file to show up with a non-zero size and returns
/// that size. An empty file is deleted before reporting the failure.
pub async fn settle(path: &Path, policy: SettlePolicy) -> Result<u64, DownloadError> {
    tokio::time::sleep(policy.initial_delay).await;

    let mut size = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "file not found after download");
            return Err(DownloadError::FileMissing);
        }
        Err(err) => return Err(err.into()),
    };

    let mut attempt = 0;
    while size == 0 && attempt < policy.retries {
        attempt += 1;
        debug!(path = %path.display(), attempt, "file still empty, re-checking");
        tokio::time::sleep(policy.retry_delay).await;
        size = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "file vanished while waiting for it");
                return Err(DownloadError::FileMissing);
            }
            Err(err) => return Err(err.into()),
        };
    }

    if size == 0 {
        if let Err(err) = tokio::fs::remove_file(path).await {
            debug!(path = %path.display(), %err, "could not remove empty file");
        }
        warn!(path = %path.display(), "download produced an empty file");
        return Err(DownloadError::EmptyFile);
    }

    info!(path = %path.display(), size, "download complete");
    Ok(size)
}

/// Byte stream over a staged file that deletes the file once dropped,
/// whether the client read it all or went away half way.
pub struct ServeOnce {
    // Declared first so the handle is closed before `_cleanup` runs.
    inner: ReaderStream<File>,
    _cleanup: RemoveOnDrop,
}

impl ServeOnce {
    /// Opens `path` and returns the stream together with the file length.
    pub async fn open(path: PathBuf) -> io::Result<(Self, u64)> {
        let file = File::open(&path).await?;
        let len = file.metadata().await?.len();
        Ok((
            Self {
                inner: ReaderStream::new(file),
                _cleanup: RemoveOnDrop::new(path),
            },
            len,
        ))
    }
}

impl Stream for ServeOnce {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

/// Deletes a staged file when dropped unless [`RemoveOnDrop::keep`] was
/// called first.
pub struct RemoveOnDrop {
    path: Option<PathBuf>,
}

impl RemoveOnDrop {
    pub fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    pub fn keep(mut self) {
        self.path = None;
    }
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        match fs::remove_file(&path) {
            Ok(()) => info!(path = %path.display(), "removed staged file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), %err, "failed to remove staged file"),
        }
    }
}
