//! Durable custody state.
//!
//! [`JsonFileStore`] keeps the record in a single JSON document and replaces it
//! atomically on save. [`Ledger`] is the only way the rest of the crate reaches
//! a store: it serializes every load-modify-save cycle behind one lock and
//! never caches the record between operations.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::model::CustodyRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file unreadable: {0}")]
    Read(String),
    #[error("state file corrupt: {0}")]
    Parse(String),
    #[error("state write failed: {0}")]
    Write(String),
}

#[async_trait]
pub trait CustodyStore: Send + Sync {
    /// Current record, or the empty default when nothing was saved yet.
    async fn load(&self) -> Result<CustodyRecord, StoreError>;

    /// Replaces the stored record. Last save wins.
    async fn save(&self, record: &CustodyRecord) -> Result<(), StoreError>;
}

/// JSON document on disk, in the same shape as the bot's `database.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CustodyStore for JsonFileStore {
    async fn load(&self) -> Result<CustodyRecord, StoreError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no state file yet; starting empty");
                return Ok(CustodyRecord::default());
            }
            Err(e) => return Err(StoreError::Read(format!("{}: {e}", self.path.display()))),
        };
        serde_json::from_str(&raw).map_err(|e| StoreError::Parse(format!("{}: {e}", self.path.display())))
    }

    async fn save(&self, record: &CustodyRecord) -> Result<(), StoreError> {
        let mut bytes = serde_json::to_vec_pretty(record).map_err(|e| StoreError::Write(format!("{e}")))?;
        bytes.push(b'\n');
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(|e| StoreError::Write(format!("writer task failed: {e}")))?
    }
}

/// Writes to a sibling temp file and renames it over `path`, so readers only
/// ever see the old or the new document.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(|e| StoreError::Write(format!("{}: {e}", dir.display())))?;

    let mut staged = NamedTempFile::new_in(&dir).map_err(|e| StoreError::Write(format!("{e}")))?;
    staged.write_all(bytes).map_err(|e| StoreError::Write(format!("{e}")))?;
    staged
        .as_file()
        .sync_all()
        .map_err(|e| StoreError::Write(format!("{e}")))?;
    staged
        .persist(path)
        .map_err(|e| StoreError::Write(format!("{}: {}", path.display(), e.error)))?;
    Ok(())
}

/// Serialized access to the custody record.
pub struct Ledger {
    store: Mutex<Box<dyn CustodyStore>>,
}

impl Ledger {
    pub fn new(store: impl CustodyStore + 'static) -> Self {
        Self {
            store: Mutex::new(Box::new(store)),
        }
    }

    /// Fresh copy of the record as currently stored.
    pub async fn read(&self) -> Result<CustodyRecord, StoreError> {
        let store = self.store.lock().await;
        store.load().await
    }

    /// Loads the record, applies `mutate`, and saves it, all under the lock.
    ///
    /// The record is only saved when `mutate` returns `Ok`; nothing else can
    /// load or save in between.
    pub async fn update<T, E, F>(&self, mutate: F) -> Result<T, E>
    where
        F: FnOnce(&mut CustodyRecord) -> Result<T, E>,
        E: From<StoreError>,
    {
        let store = self.store.lock().await;
        let mut record = store.load().await?;
        let value = mutate(&mut record)?;
        store.save(&record).await?;
        Ok(value)
    }
}
