//! Persistent artifact index backed by redb.
//!
//! Every record is stored as JSON under its artifact id. Writes are
//! synchronous (write txn + commit); redb serializes writers and lets readers
//! proceed concurrently against the last committed snapshot.

use crate::tables;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error};
use welcomer_common::ArtifactRecord;

/// Error type for artifact index operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Artifact id → [`ArtifactRecord`] index.
#[derive(Clone)]
pub struct ArtifactStore {
    db: Arc<Database>,
}

impl ArtifactStore {
    /// Open (or create) the index at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path)?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::IMAGES)?;
        }
        write_txn.commit()?;

        debug!("Opened artifact index at {}", path.display());
        Ok(Self { db: Arc::new(db) })
    }

    /// Insert or replace a record.
    pub fn put(&self, record: &ArtifactRecord) -> StoreResult<()> {
        let json = serde_json::to_string(record)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::IMAGES)?;
            table.insert(record.id.as_str(), json.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> StoreResult<Option<ArtifactRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::IMAGES)?;
        match table.get(id)? {
            Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
            None => Ok(None),
        }
    }

    /// All records in key order.
    ///
    /// Records that no longer decode are logged and skipped so one bad value
    /// cannot stall the janitor.
    pub fn list(&self) -> StoreResult<Vec<ArtifactRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::IMAGES)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let key = entry.0.value();
            match serde_json::from_str::<ArtifactRecord>(entry.1.value()) {
                Ok(record) => result.push(record),
                Err(e) => error!("Failed to decode artifact record '{}': {}", key, e),
            }
        }
        Ok(result)
    }

    /// Remove the records in `ids` that are still expired as of `now`, in a
    /// single transaction.
    ///
    /// Each record is re-read inside the write transaction, so an id that was
    /// re-persisted with a fresh expiry since the caller's snapshot is kept.
    /// Returns the ids actually removed.
    pub fn delete_expired(&self, ids: &[String], now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let write_txn = self.db.begin_write()?;
        let mut removed = Vec::new();
        {
            let mut table = write_txn.open_table(tables::IMAGES)?;
            for id in ids {
                let expired = match table.get(id.as_str())? {
                    Some(value) => serde_json::from_str::<ArtifactRecord>(value.value())
                        .is_ok_and(|r| r.is_expired(now)),
                    None => false,
                };
                if !expired {
                    continue;
                }
                table.remove(id.as_str())?;
                removed.push(id.clone());
            }
        }
        write_txn.commit()?;
        Ok(removed)
    }

    pub fn count(&self) -> StoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::IMAGES)?;
        Ok(table.len()?)
    }
}
