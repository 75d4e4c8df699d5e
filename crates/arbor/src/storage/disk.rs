//! File-level helpers shared by the persisted tiers
//!
//! Records are written to a temporary sibling and renamed into place, so a
//! reader sees either the previous record or the new one, never a torn write.

use std::future::Future;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{ArborError, Result};

const TMP_MARKER: &str = ".tmp-";

/// Write `bytes` to `path` atomically
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "record path has no file name"))?;
    let tmp = path.with_file_name(format!("{file_name}{TMP_MARKER}{}", Uuid::new_v4()));

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Remove a file, treating "already gone" as success. Returns whether a file was removed.
pub async fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read a file, mapping "not found" to `None`
pub async fn read_if_exists(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// List record files with the given extension in `dir`.
///
/// Leftover temporary files from interrupted writes are deleted.
pub async fn list_records(dir: &Path, extension: &str) -> io::Result<Vec<PathBuf>> {
    let mut records = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.contains(TMP_MARKER) {
            tracing::debug!("Removing leftover temporary file {}", path.display());
            let _ = tokio::fs::remove_file(&path).await;
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) == Some(extension) {
            records.push(path);
        }
    }

    records.sort();
    Ok(records)
}

/// Parse the id out of a `<uuid>.<ext>` record path
pub fn record_id(path: &Path) -> Option<Uuid> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}

/// Run an I/O operation, retrying once after `backoff` when the first
/// failure looks transient. Anything that still fails becomes
/// [`ArborError::StorageIo`].
pub async fn with_retry<T, F, Fut>(operation: &str, backoff: Duration, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    match attempt().await {
        Ok(value) => Ok(value),
        Err(e) if is_transient(&e) => {
            tracing::warn!("{operation} failed ({e}), retrying in {backoff:?}");
            tokio::time::sleep(backoff).await;
            attempt()
                .await
                .map_err(|e| ArborError::StorageIo(format!("{operation}: {e}")))
        }
        Err(e) => Err(ArborError::StorageIo(format!("{operation}: {e}"))),
    }
}

/// Await `future` and log how long it took
pub async fn timed<T, Fut>(operation: &'static str, future: Fut) -> T
where
    Fut: Future<Output = T>,
{
    let started = Instant::now();
    let output = future.await;
    tracing::debug!(
        operation,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "operation finished"
    );
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");

        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"second");
        let listed = list_records(dir.path(), "json").await.unwrap();
        assert_eq!(listed, vec![path]);
    }

    #[tokio::test]
    async fn test_list_records_cleans_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let keep = dir.path().join(format!("{id}.rec"));
        let stale = dir.path().join(format!("{id}.rec{TMP_MARKER}abc"));
        tokio::fs::write(&keep, b"x").await.unwrap();
        tokio::fs::write(&stale, b"y").await.unwrap();

        let listed = list_records(dir.path(), "rec").await.unwrap();
        assert_eq!(listed, vec![keep.clone()]);
        assert!(!stale.exists());
        assert_eq!(record_id(&keep), Some(id));
    }

    #[tokio::test]
    async fn test_remove_and_read_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        assert!(!remove_if_exists(&path).await.unwrap());
        assert!(read_if_exists(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_with_retry_retries_transient_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result = with_retry("flaky write", Duration::from_millis(1), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(io::Error::new(ErrorKind::Interrupted, "interrupted"))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_second_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<()> = with_retry("doomed write", Duration::from_millis(1), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(io::Error::new(ErrorKind::TimedOut, "slow disk"))
            }
        })
        .await;

        assert!(matches!(result, Err(ArborError::StorageIo(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_permanent_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<()> = with_retry("denied write", Duration::from_millis(1), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(io::Error::new(ErrorKind::PermissionDenied, "read-only"))
            }
        })
        .await;

        assert!(matches!(result, Err(ArborError::StorageIo(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timed_passes_output_through() {
        let value = timed("noop", async { 42 }).await;
        assert_eq!(value, 42);
    }
}
