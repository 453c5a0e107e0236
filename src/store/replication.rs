//! Peer Replication
//!
//! Committed records travel to the peer controller as messages over a
//! bounded channel; the peer applies them to its own store and answers on a
//! one-shot acknowledgement channel.

use crate::error::{Error, Result};
use crate::store::tables::ConfigTableStore;
use crate::store::transaction::CommitRecord;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Peer's answer to a replicated commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAck {
    Applied,
    Rejected { reason: String },
}

/// A commit in flight to the peer
#[derive(Debug)]
pub struct PeerMessage {
    pub record: CommitRecord,
    pub ack: oneshot::Sender<PeerAck>,
}

pub type PeerInbox = mpsc::Receiver<PeerMessage>;

/// Sending half, held by the transaction manager
#[derive(Debug, Clone)]
pub struct PeerReplicator {
    tx: mpsc::Sender<PeerMessage>,
    ack_timeout: Duration,
}

impl PeerReplicator {
    pub fn channel(capacity: usize, ack_timeout: Duration) -> (Self, PeerInbox) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, ack_timeout }, rx)
    }

    /// Send a record and wait, bounded, for the peer's answer
    pub async fn replicate(&self, record: &CommitRecord) -> Result<PeerAck> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(PeerMessage {
                record: record.clone(),
                ack: ack_tx,
            })
            .await
            .map_err(|_| Error::ReplicationFailed("peer channel closed".into()))?;

        match tokio::time::timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(Error::ReplicationFailed(
                "peer dropped the acknowledgement".into(),
            )),
            Err(_) => Err(Error::Timeout {
                what: format!("peer acknowledgement of {}", record.txn_id),
            }),
        }
    }
}

/// Receiving half, owning the peer controller's store
pub struct PeerApplier {
    store: Arc<ConfigTableStore>,
    inbox: PeerInbox,
}

impl PeerApplier {
    pub fn new(store: Arc<ConfigTableStore>, inbox: PeerInbox) -> Self {
        Self { store, inbox }
    }

    /// Apply records until every sender is gone; returns records applied
    pub async fn run(mut self) -> usize {
        info!("Peer applier started");
        let mut applied = 0;
        while let Some(message) = self.inbox.recv().await {
            let ack = self.apply(&message.record);
            if ack == PeerAck::Applied {
                applied += 1;
            }
            if message.ack.send(ack).is_err() {
                debug!(txn = %message.record.txn_id, "Replicator stopped waiting for ack");
            }
        }
        info!(applied, "Peer applier stopped");
        applied
    }

    /// The record is checked as a whole before any entry is written, so a
    /// rejected commit leaves this store exactly as it was. A newer-schema
    /// entry puts the store into service mode.
    fn apply(&self, record: &CommitRecord) -> PeerAck {
        match self.store.apply_replicated(record) {
            Ok(()) => {
                debug!(txn = %record.txn_id, ops = record.ops.len(), "Replicated commit applied");
                PeerAck::Applied
            }
            Err(e) => {
                warn!(txn = %record.txn_id, error = %e, "Rejecting replicated commit");
                PeerAck::Rejected {
                    reason: e.to_string(),
                }
            }
        }
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
    use crate::store::tables::StoreStatus;
    use crate::store::transaction::{JournalOp, TransactionId};
    use assert_matches::assert_matches;
    use chrono::Utc;

    fn vd_upsert(id: u32, version_bump: u32) -> JournalOp {
        let mut entry = ObjectEntry::new(
            ObjectId(id),
            ClassId::VirtualDrive,
            ObjectConfig::VirtualDrive(VirtualDriveConfig {
                exported_capacity: 0x800,
                imported_capacity: 0x800,
                default_offset: 0,
                generation_number: 1,
            }),
        );
        entry.header.version_size += version_bump;
        JournalOp::Upsert(EntryRecord::Object(entry))
    }

    fn commit_record(txn: u64, ops: Vec<JournalOp>) -> CommitRecord {
        CommitRecord {
            txn_id: TransactionId(txn),
            job_number: 1,
            committed_at: Utc::now(),
            ops,
        }
    }

    fn vd_record(txn: u64, version_bump: u32) -> CommitRecord {
        commit_record(txn, vec![vd_upsert(0x140, version_bump)])
    }

    fn peer() -> (PeerReplicator, Arc<ConfigTableStore>, tokio::task::JoinHandle<usize>) {
        let store = Arc::new(ConfigTableStore::with_limits(&PlatformLimits::default()).unwrap());
        let (replicator, inbox) = PeerReplicator::channel(8, Duration::from_secs(1));
        let task = tokio::spawn(PeerApplier::new(store.clone(), inbox).run());
        (replicator, store, task)
    }

    #[tokio::test]
    async fn test_replicated_commit_applied() {
        let (replicator, store, task) = peer();
        let ack = replicator.replicate(&vd_record(1, 0)).await.unwrap();
        assert_eq!(ack, PeerAck::Applied);
        assert!(store.get_entry_by_id(ObjectId(0x140)).is_some());

        drop(replicator);
        assert_eq!(task.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_newer_schema_rejected_by_peer() {
        let (replicator, store, _task) = peer();
        let ack = replicator.replicate(&vd_record(1, 32)).await.unwrap();
        assert_matches!(ack, PeerAck::Rejected { .. });
        assert_matches!(store.status(), StoreStatus::ServiceMode { .. });
    }

    #[tokio::test]
    async fn test_closed_peer_fails_replication() {
        let (replicator, inbox) = PeerReplicator::channel(1, Duration::from_millis(50));
        drop(inbox);
        assert_matches!(
            replicator.replicate(&vd_record(1, 0)).await,
            Err(Error::ReplicationFailed(_))
        );
    }

    #[tokio::test]
    async fn test_rejected_commit_applies_nothing() {
        let (replicator, store, _task) = peer();
        let record = commit_record(1, vec![vd_upsert(0x140, 0), vd_upsert(0x141, 64)]);
        let ack = replicator.replicate(&record).await.unwrap();

        assert_matches!(ack, PeerAck::Rejected { .. });
        assert!(store.get_entry_by_id(ObjectId(0x140)).is_none());
        assert!(store.get_entry_by_id(ObjectId(0x141)).is_none());
    }

    #[tokio::test]
    async fn test_missing_removal_rejects_whole_commit() {
        let (replicator, store, _task) = peer();
        let record = commit_record(
            1,
            vec![
                vd_upsert(0x140, 0),
                JournalOp::Remove(EntryKey::Object(ObjectId(0x150))),
            ],
        );
        let ack = replicator.replicate(&record).await.unwrap();

        assert_matches!(ack, PeerAck::Rejected { .. });
        assert!(store.get_entry_by_id(ObjectId(0x140)).is_none());
        // nothing about a missing entry calls for service mode
        assert_eq!(store.status(), StoreStatus::Ready);

        let ack = replicator.replicate(&vd_record(2, 0)).await.unwrap();
        assert_eq!(ack, PeerAck::Applied);
    }

    #[tokio::test]
    async fn test_upsert_then_remove_in_one_commit() {
        let (replicator, store, _task) = peer();
        let record = commit_record(
            1,
            vec![
                vd_upsert(0x140, 0),
                JournalOp::Remove(EntryKey::Object(ObjectId(0x140))),
                vd_upsert(0x141, 0),
            ],
        );
        assert_eq!(replicator.replicate(&record).await.unwrap(), PeerAck::Applied);
        assert!(store.get_entry_by_id(ObjectId(0x140)).is_none());
        assert!(store.get_entry_by_id(ObjectId(0x141)).is_some());
    }
}
