//! Encrypted long-term archive
//!
//! One file per entry under `<data_dir>/archive/<id>.rec`, each sealed with
//! its own salt. Writes to the same id are serialized; different ids proceed
//! in parallel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crypto::{self, CryptoError, KdfParams, MasterSecret};
use crate::error::{ArborError, Result};
use crate::memory::types::Entry;
use crate::storage::disk;

const RECORD_EXTENSION: &str = "rec";

/// Where and when an entry was archived
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveHandle {
    pub id: Uuid,
    pub path: PathBuf,
    /// Encrypted record size on disk
    pub size_bytes: u64,
    pub archived_at: DateTime<Utc>,
    /// `updated_at` of the entry version that was sealed
    pub version: DateTime<Utc>,
}

/// Tunables for the archive
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub kdf: KdfParams,
    /// Upper bound on one seal or open, key derivation included
    pub crypto_deadline: Duration,
    pub io_backoff: Duration,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            crypto_deadline: Duration::from_secs(30),
            io_backoff: Duration::from_millis(50),
        }
    }
}

/// The encrypted archive tier
pub struct Archive {
    dir: PathBuf,
    secret: MasterSecret,
    options: ArchiveOptions,
    /// Known record ids and their on-disk sizes
    records: DashMap<Uuid, u64>,
    write_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl Archive {
    /// Open (or create) the archive directory under `data_dir`
    pub async fn open(data_dir: &Path, secret: MasterSecret, options: ArchiveOptions) -> Result<Self> {
        let dir = data_dir.join("archive");
        tokio::fs::create_dir_all(&dir).await?;

        let records = DashMap::new();
        for path in disk::list_records(&dir, RECORD_EXTENSION).await? {
            let Some(id) = disk::record_id(&path) else {
                warn!("Ignoring archive file with unexpected name: {}", path.display());
                continue;
            };
            let size = tokio::fs::metadata(&path).await?.len();
            records.insert(id, size);
        }

        info!(
            "Opened archive at {} with {} records",
            dir.display(),
            records.len()
        );

        Ok(Self {
            dir,
            secret,
            options,
            records,
            write_locks: DashMap::new(),
        })
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.{RECORD_EXTENSION}"))
    }

    fn write_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the per-id lock once no other writer holds or waits on it
    fn release_lock(&self, id: Uuid, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.write_locks
            .remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Encrypt and persist a copy of `entry`, replacing any earlier copy
    pub async fn archive(&self, entry: &Entry) -> Result<ArchiveHandle> {
        let lock = self.write_lock(entry.id);
        let result = {
            let _guard = lock.lock().await;
            self.seal_and_write(entry).await
        };
        self.release_lock(entry.id, lock);
        result
    }

    async fn seal_and_write(&self, entry: &Entry) -> Result<ArchiveHandle> {
        let id = entry.id;
        let plaintext = serde_json::to_vec(entry)?;
        let secret = self.secret.clone();
        let kdf = self.options.kdf;
        let record = crypto::with_deadline("archive encryption", self.options.crypto_deadline, move || {
            crypto::seal_record(&secret, &plaintext, &kdf)
        })
        .await??;

        let path = self.record_path(id);
        disk::with_retry("archive write", self.options.io_backoff, || {
            disk::write_atomic(&path, &record)
        })
        .await?;

        let size_bytes = record.len() as u64;
        self.records.insert(id, size_bytes);
        debug!("Archived entry {} ({} bytes)", id, size_bytes);

        Ok(ArchiveHandle {
            id,
            path,
            size_bytes,
            archived_at: Utc::now(),
            version: entry.updated_at,
        })
    }

    /// Decrypt and return the archived copy of `id`.
    ///
    /// Fails with [`ArborError::Integrity`] if the record was modified or
    /// truncated, and with [`ArborError::Timeout`] if decryption overran.
    pub async fn retrieve(&self, id: Uuid) -> Result<Option<Entry>> {
        if !self.records.contains_key(&id) {
            return Ok(None);
        }

        let path = self.record_path(id);
        let Some(record) = disk::with_retry("archive read", self.options.io_backoff, || {
            disk::read_if_exists(&path)
        })
        .await?
        else {
            self.records.remove(&id);
            return Ok(None);
        };

        let secret = self.secret.clone();
        let kdf = self.options.kdf;
        let opened = crypto::with_deadline("archive decryption", self.options.crypto_deadline, move || {
            crypto::open_record(&secret, &record, &kdf)
        })
        .await?;

        let plaintext = match opened {
            Ok(plaintext) => plaintext,
            Err(CryptoError::Authentication | CryptoError::Truncated(_)) => {
                warn!("Archive record {} failed integrity check", id);
                return Err(ArborError::Integrity { id });
            }
            Err(e) => return Err(e.into()),
        };

        let entry: Entry = serde_json::from_slice(&plaintext)?;
        Ok(Some(entry))
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.records.contains_key(&id)
    }

    /// Delete the archived copy of `id`. Returns whether one existed.
    pub async fn remove(&self, id: Uuid) -> Result<bool> {
        let lock = self.write_lock(id);
        let result = {
            let _guard = lock.lock().await;
            let path = self.record_path(id);
            let removed = disk::with_retry("archive delete", self.options.io_backoff, || {
                disk::remove_if_exists(&path)
            })
            .await;
            if removed.is_ok() {
                self.records.remove(&id);
            }
            removed
        };
        self.release_lock(id, lock);
        result
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.records.iter().map(|r| *r.key()).collect();
        ids.sort();
        ids
    }

    /// Total encrypted bytes on disk
    pub fn size_bytes(&self) -> u64 {
        self.records.iter().map(|r| *r.value()).sum()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
