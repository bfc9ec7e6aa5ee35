use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use kyc_core::{CoreError, KycRecord, KycStatus};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::PipelineError;

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, PipelineError>> + Send + 'a>>;

/// Persistence for KYC records.
///
/// `insert` enforces at most one active (pending or approved) record per
/// user and fails with [`PipelineError::DuplicateActiveRecord`] otherwise.
pub trait RecordStore: Send + Sync {
    fn insert<'a>(&'a self, record: &'a KycRecord) -> StoreFuture<'a, Uuid>;

    /// Replace a stored record whose current status is `expected`.
    ///
    /// Fails with an invalid transition if the stored status has moved on,
    /// so two reviewers acting on the same record cannot both succeed.
    fn update<'a>(&'a self, record: &'a KycRecord, expected: KycStatus) -> StoreFuture<'a, ()>;

    fn get<'a>(&'a self, id: Uuid) -> StoreFuture<'a, Option<KycRecord>>;

    fn find_active_for_user<'a>(&'a self, user_id: &'a str) -> StoreFuture<'a, Option<KycRecord>>;

    /// The record built from a given queue message, if one was stored.
    fn find_by_message<'a>(&'a self, message_id: Uuid) -> StoreFuture<'a, Option<KycRecord>>;

    /// Records with the given status (all when `None`), newest first.
    fn list<'a>(&'a self, status: Option<KycStatus>) -> StoreFuture<'a, Vec<KycRecord>>;
}

/// Record counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    pub total: usize,
}

pub async fn status_counts(store: &dyn RecordStore) -> Result<StatusCounts, PipelineError> {
    let mut counts = StatusCounts::default();
    for record in store.list(None).await? {
        match record.status {
            KycStatus::Pending => counts.pending += 1,
            KycStatus::Approved => counts.approved += 1,
            KycStatus::Rejected => counts.rejected += 1,
        }
        counts.total += 1;
    }
    Ok(counts)
}

/// Directory-backed record store.
///
/// ```text
/// base_dir/
///   records/<record_id>.json   -- one file per record
///   active/<user_key>          -- holds the id of the user's active record
///                                 (user_key is the SHA-256 of the user id)
///   messages/<message_id>      -- holds the id of the record built from a message
/// ```
///
/// Marker files are created with `create_new`, so two writers cannot both
/// claim the active slot for a user.
pub struct FileRecordStore {
    base_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRecordStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn init(&self) -> Result<(), PipelineError> {
        for dir in [self.records_dir(), self.active_dir(), self.messages_dir()] {
            tokio::fs::create_dir_all(dir).await.map_err(persistence)?;
        }
        Ok(())
    }

    fn records_dir(&self) -> PathBuf {
        self.base_dir.join("records")
    }

    fn active_dir(&self) -> PathBuf {
        self.base_dir.join("active")
    }

    fn messages_dir(&self) -> PathBuf {
        self.base_dir.join("messages")
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.records_dir().join(format!("{id}.json"))
    }

    fn active_marker(&self, user_id: &str) -> PathBuf {
        self.active_dir().join(user_key(user_id))
    }

    fn message_marker(&self, message_id: Uuid) -> PathBuf {
        self.messages_dir().join(message_id.to_string())
    }

    async fn read_record(&self, id: Uuid) -> Result<Option<KycRecord>, PipelineError> {
        let path = self.record_path(id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(persistence(e)),
        }
    }

    async fn write_record(&self, record: &KycRecord) -> Result<(), PipelineError> {
        let path = self.record_path(record.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&tmp, json).await.map_err(persistence)?;
        tokio::fs::rename(&tmp, &path).await.map_err(persistence)?;
        Ok(())
    }

    async fn read_marker(path: &Path) -> Result<Option<Uuid>, PipelineError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Uuid::parse_str(content.trim()).ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(persistence(e)),
        }
    }

    /// Create `path` holding `id`, failing with `AlreadyExists` if it exists.
    async fn create_marker(path: &Path, id: Uuid) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        file.write_all(id.to_string().as_bytes()).await?;
        file.sync_all().await
    }

    /// Take the user's active slot for `record`.
    ///
    /// Returns the id of an already stored record built from the same
    /// message, which happens when a previous insert stopped before writing
    /// its message marker.
    async fn claim_active_slot(&self, record: &KycRecord) -> Result<Option<Uuid>, PipelineError> {
        let marker = self.active_marker(&record.user_id);
        match Self::create_marker(&marker, record.id).await {
            Ok(()) => Ok(None),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = match Self::read_marker(&marker).await? {
                    Some(id) => self.read_record(id).await?,
                    None => None,
                };
                if let Some(holder) = holder.filter(|r| r.status.is_active()) {
                    if record.message_id.is_some() && holder.message_id == record.message_id {
                        return Ok(Some(holder.id));
                    }
                    return Err(PipelineError::DuplicateActiveRecord {
                        user_id: record.user_id.clone(),
                    });
                }
                // A marker pointing at a missing or inactive record is stale.
                tracing::warn!(user_id = %record.user_id, "Replacing stale active-record marker");
                tokio::fs::write(&marker, record.id.to_string())
                    .await
                    .map_err(persistence)?;
                Ok(None)
            }
            Err(e) => Err(persistence(e)),
        }
    }

    async fn mark_message(&self, message_id: Uuid, record_id: Uuid) -> Result<(), PipelineError> {
        match Self::create_marker(&self.message_marker(message_id), record_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(persistence(e)),
        }
    }

    async fn release_active_slot(&self, record: &KycRecord) -> Result<(), PipelineError> {
        let marker = self.active_marker(&record.user_id);
        if Self::read_marker(&marker).await? == Some(record.id) {
            match tokio::fs::remove_file(&marker).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(persistence(e)),
            }
        }
        Ok(())
    }

    async fn insert_locked(&self, record: &KycRecord) -> Result<Uuid, PipelineError> {
        if let Some(message_id) = record.message_id
            && let Some(existing) = Self::read_marker(&self.message_marker(message_id)).await?
        {
            tracing::info!(
                message_id = %message_id,
                record_id = %existing,
                "Record for message already stored"
            );
            return Ok(existing);
        }

        if record.status.is_active()
            && let Some(existing) = self.claim_active_slot(record).await?
        {
            if let Some(message_id) = record.message_id {
                self.mark_message(message_id, existing).await?;
            }
            tracing::info!(
                message_id = ?record.message_id,
                record_id = %existing,
                "Active record for message already stored"
            );
            return Ok(existing);
        }

        if let Err(e) = self.write_record(record).await {
            if record.status.is_active()
                && let Err(release) = self.release_active_slot(record).await
            {
                tracing::warn!(
                    user_id = %record.user_id,
                    error = %release,
                    "Failed to release active-record marker"
                );
            }
            return Err(e);
        }

        if let Some(message_id) = record.message_id {
            self.mark_message(message_id, record.id).await?;
        }

        tracing::info!(
            record_id = %record.id,
            user_id = %record.user_id,
            status = %record.status,
            "Record stored"
        );
        Ok(record.id)
    }
}

impl RecordStore for FileRecordStore {
    fn insert<'a>(&'a self, record: &'a KycRecord) -> StoreFuture<'a, Uuid> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            self.insert_locked(record).await
        })
    }

    fn update<'a>(&'a self, record: &'a KycRecord, expected: KycStatus) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            let Some(current) = self.read_record(record.id).await? else {
                return Err(PipelineError::NotFound(record.id));
            };
            if current.status != expected {
                return Err(CoreError::InvalidTransition {
                    from: current.status,
                    to: record.status,
                }
                .into());
            }
            self.write_record(record).await?;
            if !record.status.is_active() {
                self.release_active_slot(record).await?;
            }
            tracing::info!(record_id = %record.id, status = %record.status, "Record updated");
            Ok(())
        })
    }

    fn get<'a>(&'a self, id: Uuid) -> StoreFuture<'a, Option<KycRecord>> {
        Box::pin(async move { self.read_record(id).await })
    }

    fn find_active_for_user<'a>(&'a self, user_id: &'a str) -> StoreFuture<'a, Option<KycRecord>> {
        Box::pin(async move {
            let Some(id) = Self::read_marker(&self.active_marker(user_id)).await? else {
                return Ok(None);
            };
            Ok(self
                .read_record(id)
                .await?
                .filter(|r| r.status.is_active()))
        })
    }

    fn find_by_message<'a>(&'a self, message_id: Uuid) -> StoreFuture<'a, Option<KycRecord>> {
        Box::pin(async move {
            match Self::read_marker(&self.message_marker(message_id)).await? {
                Some(id) => self.read_record(id).await,
                None => Ok(None),
            }
        })
    }

    fn list<'a>(&'a self, status: Option<KycStatus>) -> StoreFuture<'a, Vec<KycRecord>> {
        Box::pin(async move {
            let mut entries = tokio::fs::read_dir(self.records_dir())
                .await
                .map_err(persistence)?;
            let mut records = Vec::new();
            while let Some(entry) = entries.next_entry().await.map_err(persistence)? {
                let path = entry.path();
                if !path.extension().is_some_and(|e| e == "json") {
                    continue;
                }
                let content = tokio::fs::read_to_string(&path).await.map_err(persistence)?;
                let record: KycRecord = serde_json::from_str(&content)?;
                if status.is_none_or(|s| s == record.status) {
                    records.push(record);
                }
            }
            records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(records)
        })
    }
}

fn persistence(e: std::io::Error) -> PipelineError {
    PipelineError::Persistence(e.to_string())
}

/// Filesystem-safe, fixed-length key for a user id.
fn user_key(user_id: &str) -> String {
    hex::encode(Sha256::digest(user_id.as_bytes()))
}
