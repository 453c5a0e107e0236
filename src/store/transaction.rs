//! Transaction Manager
//!
//! Stages entry mutations per transaction and applies them to the table
//! store atomically. Staged creates hold a slot reservation; staged updates
//! and destroys remember the generation of the entry they read. Commit
//! re-validates every generation under the commit lock and fences the staged
//! keys against direct writes, then persists, applies and finally replicates
//! to the peer controller.

use crate::domain::ports::{ObjectId, PersistenceBackendRef};
use crate::error::{Error, Result};
use crate::store::arena::EntryHandle;
use crate::store::entry::{
    ClassId, EdgeEntry, EntryKey, EntryRecord, EntryState, GlobalInfoEntry, GlobalInfoType,
    ObjectConfig, ObjectEntry, UserEntry, UserIdentity,
};
use crate::store::replication::{PeerAck, PeerReplicator};
use crate::store::tables::ConfigTableStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// =============================================================================
// Identifiers & Records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub u64);

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// A mutation staged inside a transaction
#[derive(Debug, Clone)]
pub enum StagedOp {
    /// New entry in a slot reserved for this transaction
    Create {
        record: EntryRecord,
        handle: EntryHandle,
    },
    /// Overwrite of the `Valid` entry observed at `expected`
    Update {
        record: EntryRecord,
        expected: EntryHandle,
    },
    /// Removal of the `Valid` entry observed at `expected`
    Destroy {
        key: EntryKey,
        expected: EntryHandle,
    },
}

impl StagedOp {
    pub fn key(&self) -> EntryKey {
        match self {
            StagedOp::Create { record, .. } | StagedOp::Update { record, .. } => record.key(),
            StagedOp::Destroy { key, .. } => *key,
        }
    }

    fn journal_op(&self) -> JournalOp {
        match self {
            StagedOp::Create { record, .. } | StagedOp::Update { record, .. } => {
                JournalOp::Upsert(record.clone())
            }
            StagedOp::Destroy { key, .. } => JournalOp::Remove(*key),
        }
    }
}

/// Durable form of one committed mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "entry", rename_all = "snake_case")]
pub enum JournalOp {
    Upsert(EntryRecord),
    Remove(EntryKey),
}

impl JournalOp {
    pub fn key(&self) -> EntryKey {
        match self {
            JournalOp::Upsert(record) => record.key(),
            JournalOp::Remove(key) => *key,
        }
    }
}

/// Everything one commit changed, as written to the journal and the peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRecord {
    pub txn_id: TransactionId,
    pub job_number: u64,
    pub committed_at: DateTime<Utc>,
    pub ops: Vec<JournalOp>,
}

#[derive(Debug)]
struct Transaction {
    job_number: u64,
    ops: Vec<StagedOp>,
    started_at: DateTime<Utc>,
}

// =============================================================================
// Transaction Manager
// =============================================================================

pub struct TransactionManager {
    store: Arc<ConfigTableStore>,
    persistence: PersistenceBackendRef,
    replicator: Option<PeerReplicator>,
    active: DashMap<TransactionId, Transaction>,
    next_id: AtomicU64,
    commit_lock: Mutex<()>,
}

impl TransactionManager {
    pub fn new(store: Arc<ConfigTableStore>, persistence: PersistenceBackendRef) -> Self {
        Self {
            store,
            persistence,
            replicator: None,
            active: DashMap::new(),
            next_id: AtomicU64::new(1),
            commit_lock: Mutex::new(()),
        }
    }

    /// Mirror every commit to the peer controller
    pub fn with_replicator(mut self, replicator: PeerReplicator) -> Self {
        self.replicator = Some(replicator);
        self
    }

    pub fn store(&self) -> &Arc<ConfigTableStore> {
        &self.store
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn begin(&self, job_number: u64) -> TransactionId {
        let id = TransactionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.active.insert(
            id,
            Transaction {
                job_number,
                ops: Vec::new(),
                started_at: Utc::now(),
            },
        );
        debug!(txn = %id, job_number, "Transaction started");
        id
    }

    fn push(&self, txn: TransactionId, op: StagedOp) -> Result<()> {
        let mut entry = self
            .active
            .get_mut(&txn)
            .ok_or(Error::TransactionNotFound(txn.0))?;
        entry.ops.push(op);
        Ok(())
    }

    fn ensure_active(&self, txn: TransactionId) -> Result<()> {
        if self.active.contains_key(&txn) {
            Ok(())
        } else {
            Err(Error::TransactionNotFound(txn.0))
        }
    }

    // =========================================================================
    // Staging
    // =========================================================================

    /// Stage a new entry, reserving its slot.
    ///
    /// Objects with an invalid id, user entries, and edges whose client index
    /// is `u32::MAX` take the first free slot; anything else reserves the
    /// slot its key names. The staged record carries the final key.
    pub fn stage_create(&self, txn: TransactionId, mut record: EntryRecord) -> Result<EntryKey> {
        self.ensure_active(txn)?;
        let handle = match &mut record {
            EntryRecord::Object(entry) if !entry.header.object_id.is_valid() => {
                let (id, handle) = self.store.get_free_object_entry()?;
                entry.header.object_id = id;
                entry.header.entry_id = id.0;
                handle
            }
            EntryRecord::User(entry) => {
                let (entry_id, handle) = self.store.get_free_user_entry()?;
                entry.header.entry_id = entry_id;
                handle
            }
            EntryRecord::Edge(edge) if edge.client_index == u32::MAX => {
                let (client_index, handle) = self.store.get_free_edge_entry(edge.client_id())?;
                *edge = EdgeEntry::new(
                    edge.client_id(),
                    client_index,
                    edge.server_id,
                    edge.server_index,
                    edge.capacity,
                    edge.offset,
                );
                handle
            }
            other => self.store.reserve_entry(&other.key())?,
        };

        let key = record.key();
        if let Err(e) = self.push(txn, StagedOp::Create { record, handle }) {
            let _ = self.store.release_reservation(&key, handle);
            return Err(e);
        }
        debug!(txn = %txn, key = %key, "Staged create");
        Ok(key)
    }

    /// Stage a new object; an invalid id allocates one
    pub fn stage_create_object(
        &self,
        txn: TransactionId,
        object_id: ObjectId,
        class_id: ClassId,
        config: ObjectConfig,
    ) -> Result<ObjectId> {
        let key = self.stage_create(
            txn,
            EntryRecord::Object(ObjectEntry::new(object_id, class_id, config)),
        )?;
        match key {
            EntryKey::Object(id) => Ok(id),
            other => Err(Error::Internal(format!("object create staged as {}", other))),
        }
    }

    /// Stage the user entry of an object
    pub fn stage_create_user(
        &self,
        txn: TransactionId,
        object_id: ObjectId,
        class_id: ClassId,
        identity: UserIdentity,
    ) -> Result<u32> {
        let key = self.stage_create(
            txn,
            EntryRecord::User(UserEntry::new(object_id, class_id, identity)),
        )?;
        match key {
            EntryKey::User(entry_id) => Ok(entry_id),
            other => Err(Error::Internal(format!("user create staged as {}", other))),
        }
    }

    pub fn stage_create_edge(&self, txn: TransactionId, edge: EdgeEntry) -> Result<()> {
        self.stage_create(txn, EntryRecord::Edge(edge)).map(|_| ())
    }

    /// Stage the default value of the first global-info type with no entry.
    /// Returns `None` once every type has one.
    pub fn stage_create_global_info(&self, txn: TransactionId) -> Result<Option<GlobalInfoType>> {
        self.ensure_active(txn)?;
        let (ty, handle) = match self.store.get_free_global_info_entry() {
            Ok(free) => free,
            Err(Error::TableFull { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let record = EntryRecord::GlobalInfo(GlobalInfoEntry::new(ty.default_info()));
        let key = record.key();
        if let Err(e) = self.push(txn, StagedOp::Create { record, handle }) {
            let _ = self.store.release_reservation(&key, handle);
            return Err(e);
        }
        debug!(txn = %txn, key = %key, "Staged global info default");
        Ok(Some(ty))
    }

    /// Stage an overwrite of an existing entry, or amend a staged create
    pub fn stage_update(&self, txn: TransactionId, record: EntryRecord) -> Result<()> {
        let key = record.key();
        {
            let mut entry = self
                .active
                .get_mut(&txn)
                .ok_or(Error::TransactionNotFound(txn.0))?;
            if let Some(op) = entry.ops.iter_mut().rev().find(|op| op.key() == key) {
                match op {
                    StagedOp::Create { record: staged, .. }
                    | StagedOp::Update { record: staged, .. } => {
                        *staged = record;
                        return Ok(());
                    }
                    StagedOp::Destroy { .. } => {
                        return Err(Error::InvalidStateTransition {
                            table: key.table().name(),
                            from: EntryState::Destroy,
                            to: EntryState::Valid,
                        })
                    }
                }
            }
        }

        let expected = self.store.valid_handle(&key)?;
        self.push(txn, StagedOp::Update { record, expected })?;
        debug!(txn = %txn, key = %key, "Staged update");
        Ok(())
    }

    pub fn stage_destroy(&self, txn: TransactionId, key: EntryKey) -> Result<()> {
        self.ensure_active(txn)?;
        let expected = self.store.valid_handle(&key)?;
        self.push(txn, StagedOp::Destroy { key, expected })?;
        debug!(txn = %txn, key = %key, "Staged destroy");
        Ok(())
    }

    /// Entry as this transaction sees it: staged value first, then the store
    pub fn staged_entry(&self, txn: TransactionId, key: &EntryKey) -> Result<Option<EntryRecord>> {
        let entry = self
            .active
            .get(&txn)
            .ok_or(Error::TransactionNotFound(txn.0))?;
        match entry.ops.iter().rev().find(|op| op.key() == *key) {
            Some(StagedOp::Create { record, .. }) | Some(StagedOp::Update { record, .. }) => {
                Ok(Some(record.clone()))
            }
            Some(StagedOp::Destroy { .. }) => Ok(None),
            None => Ok(self.store.get_entry(key)),
        }
    }

    /// Every record staged in a transaction
    pub fn staged_records(&self, txn: TransactionId) -> Result<Vec<EntryRecord>> {
        let entry = self
            .active
            .get(&txn)
            .ok_or(Error::TransactionNotFound(txn.0))?;
        Ok(entry
            .ops
            .iter()
            .filter_map(|op| match op {
                StagedOp::Create { record, .. } | StagedOp::Update { record, .. } => {
                    Some(record.clone())
                }
                StagedOp::Destroy { .. } => None,
            })
            .collect())
    }

    // =========================================================================
    // Commit / Abort
    // =========================================================================

    /// Validate, persist, apply and replicate a transaction.
    ///
    /// A conflict or persistence failure leaves the transaction staged; the
    /// caller must abort it.
    pub async fn commit(&self, txn: TransactionId) -> Result<CommitRecord> {
        let _guard = self.commit_lock.lock().await;

        let (job_number, ops, started_at) = {
            let entry = self
                .active
                .get(&txn)
                .ok_or(Error::TransactionNotFound(txn.0))?;
            (entry.job_number, entry.ops.clone(), entry.started_at)
        };

        self.store.ensure_writable()?;
        // staged keys stay fenced against direct writes until applied
        let fence = self
            .store
            .fence_staged(&ops)
            .map_err(|e| Error::TransactionConflict {
                txn_id: txn.0,
                detail: e.to_string(),
            })?;

        let record = CommitRecord {
            txn_id: txn,
            job_number,
            committed_at: Utc::now(),
            ops: ops.iter().map(StagedOp::journal_op).collect(),
        };

        if let Err(e) = self.persistence.persist(&record).await {
            warn!(txn = %txn, error = %e, "Persisting transaction failed");
            return Err(match e {
                Error::PersistFailed(_) => e,
                other => Error::PersistFailed(other.to_string()),
            });
        }

        self.store.apply_staged(ops, &fence)?;
        drop(fence);
        self.active.remove(&txn);

        let elapsed_ms = (record.committed_at - started_at).num_milliseconds();
        info!(txn = %txn, job_number, ops = record.ops.len(), elapsed_ms, "Transaction committed");

        if let Some(replicator) = &self.replicator {
            match replicator.replicate(&record).await {
                Ok(PeerAck::Applied) => debug!(txn = %txn, "Peer applied commit"),
                Ok(PeerAck::Rejected { reason }) => {
                    warn!(txn = %txn, reason = %reason, "Peer rejected commit")
                }
                Err(e) => warn!(txn = %txn, error = %e, "Peer replication failed"),
            }
        }

        Ok(record)
    }

    /// Discard a transaction and release its reservations
    pub fn abort(&self, txn: TransactionId) -> Result<()> {
        let (_, transaction) = self
            .active
            .remove(&txn)
            .ok_or(Error::TransactionNotFound(txn.0))?;

        let mut first_error = None;
        for op in transaction.ops {
            if let StagedOp::Create { record, handle } = op {
                if let Err(e) = self.store.release_reservation(&record.key(), handle) {
                    warn!(txn = %txn, key = %record.key(), error = %e, "Releasing reservation failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(txn = %txn, "Transaction aborted");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformLimits;
    use crate::store::entry::VirtualDriveConfig;
    use crate::store::journal::MemoryJournal;
    use assert_matches::assert_matches;

    fn setup() -> (Arc<ConfigTableStore>, Arc<MemoryJournal>, TransactionManager) {
        let store = Arc::new(ConfigTableStore::with_limits(&PlatformLimits::default()).unwrap());
        let journal = Arc::new(MemoryJournal::new());
        let manager = TransactionManager::new(store.clone(), journal.clone());
        (store, journal, manager)
    }

    fn vd_config(exported: u64) -> ObjectConfig {
        ObjectConfig::VirtualDrive(VirtualDriveConfig {
            exported_capacity: exported,
            imported_capacity: exported,
            default_offset: 0,
            generation_number: 1,
        })
    }

    #[tokio::test]
    async fn test_staged_entries_invisible_until_commit() {
        let (store, journal, manager) = setup();
        let txn = manager.begin(11);
        let id = manager
            .stage_create_object(txn, ObjectId::INVALID, ClassId::VirtualDrive, vd_config(64))
            .unwrap();

        assert!(store.get_entry_by_id(id).is_none());
        assert!(manager
            .staged_entry(txn, &EntryKey::Object(id))
            .unwrap()
            .is_some());

        let record = manager.commit(txn).await.unwrap();
        assert_eq!(record.job_number, 11);
        assert_eq!(record.ops.len(), 1);
        assert_eq!(journal.records().len(), 1);

        let entry = store.get_entry_by_id(id).unwrap();
        assert_eq!(entry.header.state, EntryState::Valid);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_releases_reservations() {
        let (store, journal, manager) = setup();
        let txn = manager.begin(1);
        let id = manager
            .stage_create_object(txn, ObjectId::INVALID, ClassId::VirtualDrive, vd_config(64))
            .unwrap();
        manager.abort(txn).unwrap();

        assert!(store.get_entry_by_id(id).is_none());
        assert_eq!(store.entry_state(&EntryKey::Object(id)).unwrap(), EntryState::Invalid);
        assert!(journal.records().is_empty());
        assert_matches!(manager.commit(txn).await, Err(Error::TransactionNotFound(_)));
    }

    #[tokio::test]
    async fn test_persist_failure_leaves_transaction_staged() {
        let (store, journal, manager) = setup();
        journal.fail_writes(true);

        let txn = manager.begin(2);
        let id = manager
            .stage_create_object(txn, ObjectId::INVALID, ClassId::VirtualDrive, vd_config(64))
            .unwrap();

        assert_matches!(manager.commit(txn).await, Err(Error::PersistFailed(_)));
        assert!(store.get_entry_by_id(id).is_none());
        assert_eq!(manager.active_count(), 1);

        manager.abort(txn).unwrap();
        assert_eq!(store.entry_state(&EntryKey::Object(id)).unwrap(), EntryState::Invalid);
    }

    #[tokio::test]
    async fn test_conflicting_update_rejected() {
        let (store, _journal, manager) = setup();
        let setup_txn = manager.begin(1);
        let id = manager
            .stage_create_object(setup_txn, ObjectId::INVALID, ClassId::VirtualDrive, vd_config(64))
            .unwrap();
        manager.commit(setup_txn).await.unwrap();

        let first = manager.begin(2);
        let second = manager.begin(3);
        let updated = |exported| {
            EntryRecord::Object(ObjectEntry::new(id, ClassId::VirtualDrive, vd_config(exported)))
        };
        manager.stage_update(first, updated(128)).unwrap();
        manager.stage_update(second, updated(256)).unwrap();

        manager.commit(first).await.unwrap();
        assert_matches!(
            manager.commit(second).await,
            Err(Error::TransactionConflict { txn_id, .. }) if txn_id == second.0
        );
        manager.abort(second).unwrap();

        let entry = store.get_entry_by_id(id).unwrap();
        assert_eq!(entry.config.exported_capacity(), Some(128));
    }

    #[tokio::test]
    async fn test_concurrent_creates_take_distinct_slots() {
        let (_store, _journal, manager) = setup();
        let a = manager.begin(1);
        let b = manager.begin(2);
        let id_a = manager
            .stage_create_object(a, ObjectId::INVALID, ClassId::VirtualDrive, vd_config(1))
            .unwrap();
        let id_b = manager
            .stage_create_object(b, ObjectId::INVALID, ClassId::VirtualDrive, vd_config(2))
            .unwrap();
        assert_ne!(id_a, id_b);
        manager.commit(b).await.unwrap();
        manager.commit(a).await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_commits_removal() {
        let (store, journal, manager) = setup();
        let txn = manager.begin(1);
        let id = manager
            .stage_create_object(txn, ObjectId::INVALID, ClassId::VirtualDrive, vd_config(64))
            .unwrap();
        manager.commit(txn).await.unwrap();

        let txn = manager.begin(2);
        manager.stage_destroy(txn, EntryKey::Object(id)).unwrap();
        assert!(manager.staged_entry(txn, &EntryKey::Object(id)).unwrap().is_none());
        manager.commit(txn).await.unwrap();

        assert!(store.get_entry_by_id(id).is_none());
        assert_eq!(
            journal.records()[1].ops,
            vec![JournalOp::Remove(EntryKey::Object(id))]
        );
    }

    /// Journal that races a direct write against the commit it is persisting
    struct RacingJournal {
        store: Arc<ConfigTableStore>,
        racing_write: EntryRecord,
        outcome: parking_lot::Mutex<Option<Result<()>>>,
    }

    #[async_trait::async_trait]
    impl crate::domain::ports::PersistenceBackend for RacingJournal {
        async fn persist(&self, _record: &CommitRecord) -> Result<()> {
            let outcome = self.store.update_entry(self.racing_write.clone());
            *self.outcome.lock() = Some(outcome);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_direct_write_fenced_while_persisting() {
        let (store, _journal, manager) = setup();
        let txn = manager.begin(1);
        let id = manager
            .stage_create_object(txn, ObjectId::INVALID, ClassId::VirtualDrive, vd_config(64))
            .unwrap();
        manager.commit(txn).await.unwrap();

        let racing = Arc::new(RacingJournal {
            store: store.clone(),
            racing_write: EntryRecord::Object(ObjectEntry::new(
                id,
                ClassId::VirtualDrive,
                vd_config(999),
            )),
            outcome: parking_lot::Mutex::new(None),
        });
        let manager = TransactionManager::new(store.clone(), racing.clone());
        let txn = manager.begin(2);
        manager
            .stage_update(
                txn,
                EntryRecord::Object(ObjectEntry::new(id, ClassId::VirtualDrive, vd_config(128))),
            )
            .unwrap();
        manager.commit(txn).await.unwrap();

        assert_matches!(racing.outcome.lock().take(), Some(Err(Error::EntryBusy(_))));
        let entry = store.get_entry_by_id(id).unwrap();
        assert_eq!(entry.config.exported_capacity(), Some(128));

        // the fence is gone once the commit has applied
        store
            .update_entry(EntryRecord::Object(ObjectEntry::new(
                id,
                ClassId::VirtualDrive,
                vd_config(256),
            )))
            .unwrap();
        assert_eq!(
            store.get_entry_by_id(id).unwrap().config.exported_capacity(),
            Some(256)
        );
    }
}
