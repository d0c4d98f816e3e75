//! Filesystem layout and finalization merge for the download engine.
//!
//! One temp directory per download, one file per chunk, merged in
//! chunk-id order into the final artifact. This crate owns no engine
//! types; it is driven entirely through plain paths and byte ranges so it
//! stays testable without spinning up a Coordinator.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Number of times [`merge_chunks`] retries on a filesystem error before
/// giving up, per the engine's finalization error policy.
pub const MERGE_RETRIES: u32 = 3;

/// Linear backoff between merge attempts.
const MERGE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Read buffer size used while copying chunk files into the final file.
const MERGE_BUFFER_SIZE: usize = 512 * 1024;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("merged file size {actual} does not match expected size {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
}

/// A single download's working directory: `{temp_root}/{filename}`.
#[derive(Debug, Clone)]
pub struct TempLayout {
    dir: PathBuf,
}

impl TempLayout {
    pub fn new(temp_root: &Path, filename: &str) -> Self {
        Self { dir: temp_root.join(filename) }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the temp file backing chunk `id`.
    pub fn chunk_path(&self, id: u32) -> PathBuf {
        self.dir.join(format!("chunk_{id}"))
    }

    /// Creates the temp directory (and ancestors) if missing.
    pub async fn ensure(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).await?;
        platform::create_dir_with_mode(&self.dir)?;
        Ok(())
    }

    /// Removes the temp directory and everything under it.
    ///
    /// Best-effort: callers that must report failure (cancel) should
    /// inspect the result; finalization's own cleanup step treats failure
    /// as log-only per the engine's finalization contract.
    pub async fn remove(&self) -> Result<(), StorageError> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Opens (creating if necessary) the temp file for `id` positioned for a
/// worker to resume writing at `progress` bytes.
pub async fn open_chunk_file(layout: &TempLayout, id: u32) -> Result<File, StorageError> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .read(true)
        .open(layout.chunk_path(id))
        .await?;
    Ok(file)
}

/// Concatenates `chunk_{0..n}` from `layout` into `destination` in chunk-id
/// order, verifying the final size equals `expected_size` exactly.
///
/// Retries up to [`MERGE_RETRIES`] additional times with a fixed linear
/// delay on any filesystem error, per the engine's finalization policy
/// ("merge is retried up to 3 times with linear backoff"). Chunk temp files
/// are left in place regardless of outcome; the caller deletes the temp
/// directory only after a successful merge.
pub async fn merge_chunks(
    layout: &TempLayout,
    chunk_count: u32,
    destination: &Path,
    expected_size: u64,
) -> Result<(), StorageError> {
    let mut last_err = None;

    for attempt in 0..=MERGE_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(MERGE_RETRY_DELAY * attempt).await;
        }

        match merge_chunks_once(layout, chunk_count, destination, expected_size).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "merge attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.expect("loop executes at least once"))
}

async fn merge_chunks_once(
    layout: &TempLayout,
    chunk_count: u32,
    destination: &Path,
    expected_size: u64,
) -> Result<(), StorageError> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await?;
        platform::create_dir_with_mode(parent)?;
    }

    let mut out = File::create(destination).await?;
    let mut buf = vec![0u8; MERGE_BUFFER_SIZE];

    for id in 0..chunk_count {
        let mut chunk_file = File::open(layout.chunk_path(id)).await?;
        loop {
            let n = chunk_file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).await?;
        }
    }
    out.flush().await?;
    drop(out);

    let actual = fs::metadata(destination).await?.len();
    if actual != expected_size {
        return Err(StorageError::SizeMismatch { expected: expected_size, actual });
    }
    Ok(())
}
