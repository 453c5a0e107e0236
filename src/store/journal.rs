//! Commit Journals
//!
//! Durable-write backends for committed transactions. The file journal is an
//! append-only JSON-lines log that is replayed into the table store at
//! startup.

use crate::domain::ports::PersistenceBackend;
use crate::error::{Error, Result};
use crate::store::tables::ConfigTableStore;
use crate::store::transaction::CommitRecord;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// =============================================================================
// Memory Journal
// =============================================================================

/// Journal kept in memory, with injectable write failures
#[derive(Debug, Default)]
pub struct MemoryJournal {
    records: RwLock<Vec<CommitRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail until cleared
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<CommitRecord> {
        self.records.read().clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl PersistenceBackend for MemoryJournal {
    async fn persist(&self, record: &CommitRecord) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::PersistFailed(format!(
                "journal write refused for {}",
                record.txn_id
            )));
        }
        self.records.write().push(record.clone());
        Ok(())
    }
}

// =============================================================================
// File Journal
// =============================================================================

/// Append-only JSON-lines journal.
///
/// A failed append is truncated away, so the file only ever holds whole
/// records plus at most a torn tail left by a crash.
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
    sync_writes: bool,
    written: AtomicU64,
    tear_next: AtomicUsize,
}

impl FileJournal {
    /// Open (creating if needed) a journal for appending
    pub async fn open(path: impl Into<PathBuf>, sync_writes: bool) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        info!(path = %path.display(), sync_writes, "Commit journal opened");

        Ok(Self {
            path,
            file: Mutex::new(file),
            sync_writes,
            written: AtomicU64::new(0),
            tear_next: AtomicUsize::new(usize::MAX),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records appended since open
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Fail the next append after `bytes` bytes reach the file, the way a
    /// device error mid-write does
    pub fn tear_next_write(&self, bytes: usize) {
        self.tear_next.store(bytes, Ordering::SeqCst);
    }

    async fn append(&self, file: &mut File, line: &[u8]) -> std::io::Result<()> {
        let tear_at = self.tear_next.swap(usize::MAX, Ordering::SeqCst);
        if tear_at < line.len() {
            file.write_all(&line[..tear_at]).await?;
            file.flush().await?;
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "append torn mid-record",
            ));
        }
        file.write_all(line).await?;
        file.flush().await?;
        if self.sync_writes {
            file.sync_data().await?;
        }
        Ok(())
    }

    /// Read every record in a journal file; a missing file is empty
    pub async fn load(path: impl AsRef<Path>) -> Result<Vec<CommitRecord>> {
        let path = path.as_ref();
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CommitRecord>(line) {
                Ok(record) => records.push(record),
                // a torn final line is what a crash mid-append leaves behind
                Err(e) if line_no + 1 == text.lines().count() => {
                    warn!(path = %path.display(), line = line_no + 1, error = %e, "Ignoring torn journal tail");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(records)
    }

    /// Rebuild the store from a journal file; returns records replayed
    pub async fn replay_into(path: impl AsRef<Path>, store: &ConfigTableStore) -> Result<usize> {
        let records = Self::load(path.as_ref()).await?;
        for record in &records {
            store.replay(record)?;
        }
        info!(path = %path.as_ref().display(), records = records.len(), "Journal replayed");
        Ok(records.len())
    }
}

#[async_trait]
impl PersistenceBackend for FileJournal {
    async fn persist(&self, record: &CommitRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = self.file.lock().await;
        let persist_failed = |e: std::io::Error| {
            Error::PersistFailed(format!("{}: {}", self.path.display(), e))
        };
        let start = file.metadata().await.map_err(persist_failed)?.len();

        if let Err(e) = self.append(&mut file, line.as_bytes()).await {
            if let Err(trunc) = file.set_len(start).await {
                warn!(
                    path = %self.path.display(),
                    error = %trunc,
                    "Truncating failed journal append failed"
                );
            }
            return Err(persist_failed(e));
        }

        self.written.fetch_add(1, Ordering::Relaxed);
        debug!(txn = %record.txn_id, ops = record.ops.len(), "Journal record appended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformLimits;
    use crate::domain::ports::ObjectId;
    use crate::store::entry::{
        ClassId, EntryKey, EntryRecord, ObjectConfig, ObjectEntry, VirtualDriveConfig,
    };
    use crate::store::transaction::{JournalOp, TransactionId};
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(txn: u64, ops: Vec<JournalOp>) -> CommitRecord {
        CommitRecord {
            txn_id: TransactionId(txn),
            job_number: txn,
            committed_at: Utc::now(),
            ops,
        }
    }

    fn vd(id: u32) -> EntryRecord {
        EntryRecord::Object(ObjectEntry::new(
            ObjectId(id),
            ClassId::VirtualDrive,
            ObjectConfig::VirtualDrive(VirtualDriveConfig {
                exported_capacity: 0x800,
                imported_capacity: 0x800,
                default_offset: 0,
                generation_number: 1,
            }),
        ))
    }

    #[tokio::test]
    async fn test_memory_journal_failure_injection() {
        let journal = MemoryJournal::new();
        journal.persist(&record(1, vec![])).await.unwrap();
        journal.fail_writes(true);
        assert!(journal.persist(&record(2, vec![])).await.is_err());
        journal.fail_writes(false);
        journal.persist(&record(3, vec![])).await.unwrap();
        assert_eq!(journal.len(), 2);
    }

    #[tokio::test]
    async fn test_file_journal_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal").join("commits.jsonl");

        let journal = FileJournal::open(&path, true).await.unwrap();
        journal
            .persist(&record(1, vec![JournalOp::Upsert(vd(0x120)), JournalOp::Upsert(vd(0x121))]))
            .await
            .unwrap();
        journal
            .persist(&record(2, vec![JournalOp::Remove(EntryKey::Object(ObjectId(0x121)))]))
            .await
            .unwrap();
        assert_eq!(journal.written(), 2);

        let store = ConfigTableStore::with_limits(&PlatformLimits::default()).unwrap();
        let replayed = FileJournal::replay_into(&path, &store).await.unwrap();
        assert_eq!(replayed, 2);
        assert!(store.get_entry_by_id(ObjectId(0x120)).is_some());
        assert!(store.get_entry_by_id(ObjectId(0x121)).is_none());
    }

    #[tokio::test]
    async fn test_torn_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commits.jsonl");
        let journal = FileJournal::open(&path, false).await.unwrap();
        journal
            .persist(&record(1, vec![JournalOp::Upsert(vd(0x120))]))
            .await
            .unwrap();
        drop(journal);

        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push_str("{\"txnId\":2,\"jobNum");
        std::fs::write(&path, text).unwrap();

        let records = FileJournal::load(&path).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_journal_is_empty() {
        let dir = TempDir::new().unwrap();
        let records = FileJournal::load(dir.path().join("absent.jsonl")).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_failed_append_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commits.jsonl");
        let journal = FileJournal::open(&path, false).await.unwrap();

        journal
            .persist(&record(1, vec![JournalOp::Upsert(vd(0x120))]))
            .await
            .unwrap();
        journal.tear_next_write(12);
        assert!(matches!(
            journal
                .persist(&record(2, vec![JournalOp::Upsert(vd(0x121))]))
                .await,
            Err(Error::PersistFailed(_))
        ));
        journal
            .persist(&record(3, vec![JournalOp::Upsert(vd(0x122))]))
            .await
            .unwrap();
        assert_eq!(journal.written(), 2);

        let records = FileJournal::load(&path).await.unwrap();
        let txns: Vec<u64> = records.iter().map(|r| r.txn_id.0).collect();
        assert_eq!(txns, vec![1, 3]);
    }
}
