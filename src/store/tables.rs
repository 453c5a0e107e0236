//! Configuration Table Store
//!
//! The object, user, edge, global-info and system-spare tables. Each table
//! has its own lock. Multi-entry writes take every table lock in one fixed
//! order; everything else holds a single table lock at a time. Readers only
//! ever observe `Valid` entries, so anything a transaction has reserved or
//! staged stays invisible until commit.

use crate::config::{PlatformLimits, Timeouts};
use crate::domain::ports::{
    EventArg, EventMessage, EventRecord, EventSeverity, EventSinkRef, LifecycleService, ObjectId,
};
use crate::error::{Error, Result};
use crate::store::arena::{EntryHandle, SlotArena};
use crate::store::entry::{
    edge_slot, ClassId, EdgeEntry, EntryKey, EntryRecord, EntryState, GlobalInfoEntry,
    GlobalInfoType, ObjectConfig, ObjectEntry, SystemSpareEntry, TableKind, UserEntry,
    UserIdentity, FIRST_SYSTEM_DRIVE_ID, MAX_EDGES_PER_OBJECT,
};
use crate::store::limits::TableSizes;
use crate::store::transaction::{CommitRecord, JournalOp, StagedOp};
use dashmap::DashSet;
use futures::future::join_all;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

// =============================================================================
// Store Status
// =============================================================================

/// Operating status of the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StoreStatus {
    Uninitialized,
    Ready,
    /// Table allocation failed; nothing can be stored
    Failed { reason: String },
    /// Replicated data could not be trusted; the store is read-only
    ServiceMode { reason: String },
}

impl std::fmt::Display for StoreStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreStatus::Uninitialized => write!(f, "uninitialized"),
            StoreStatus::Ready => write!(f, "ready"),
            StoreStatus::Failed { reason } => write!(f, "failed ({})", reason),
            StoreStatus::ServiceMode { reason } => write!(f, "service mode ({})", reason),
        }
    }
}

/// Occupancy of one table
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableUsage {
    pub table: &'static str,
    pub capacity: usize,
    pub valid: usize,
    pub uncommitted: usize,
}

// =============================================================================
// Untyped Slot Control
// =============================================================================

/// Value-independent slot operations, so key-addressed calls can reach any
/// table through one dispatch
trait SlotControl {
    fn reserve_slot(&mut self, index: usize) -> Result<EntryHandle>;
    fn release_slot(&mut self, handle: EntryHandle) -> Result<()>;
    fn check_slot(&self, handle: EntryHandle, expected: EntryState) -> Result<()>;
    fn slot_handle(&self, index: usize) -> Result<EntryHandle>;
    fn slot_state(&self, index: usize) -> Result<EntryState>;
    fn destroy_slot(&mut self, handle: EntryHandle) -> Result<()>;
    fn remove_slot(&mut self, index: usize) -> Result<bool>;
    fn usage(&self) -> TableUsage;
}

impl<T: Clone> SlotControl for SlotArena<T> {
    fn reserve_slot(&mut self, index: usize) -> Result<EntryHandle> {
        self.reserve(index)
    }

    fn release_slot(&mut self, handle: EntryHandle) -> Result<()> {
        self.release(handle)
    }

    fn check_slot(&self, handle: EntryHandle, expected: EntryState) -> Result<()> {
        self.check(handle, expected)
    }

    fn slot_handle(&self, index: usize) -> Result<EntryHandle> {
        self.handle(index)
    }

    fn slot_state(&self, index: usize) -> Result<EntryState> {
        self.state(index)
    }

    fn destroy_slot(&mut self, handle: EntryHandle) -> Result<()> {
        let handle = self.mark_destroy(handle)?;
        self.release(handle)
    }

    fn remove_slot(&mut self, index: usize) -> Result<bool> {
        Ok(self.remove(index)?.is_some())
    }

    fn usage(&self) -> TableUsage {
        TableUsage {
            table: self.table(),
            capacity: self.len(),
            valid: self.count(EntryState::Valid),
            uncommitted: self.count(EntryState::Uncommitted),
        }
    }
}

/// Every table lock at once, taken in declaration order
struct TableGuards<'a> {
    objects: MutexGuard<'a, SlotArena<ObjectEntry>>,
    users: MutexGuard<'a, SlotArena<UserEntry>>,
    edges: MutexGuard<'a, SlotArena<EdgeEntry>>,
    global_info: MutexGuard<'a, SlotArena<GlobalInfoEntry>>,
    system_spares: MutexGuard<'a, SlotArena<SystemSpareEntry>>,
}

impl TableGuards<'_> {
    fn slots(&mut self, table: TableKind) -> &mut dyn SlotControl {
        match table {
            TableKind::Object => &mut *self.objects,
            TableKind::User => &mut *self.users,
            TableKind::Edge => &mut *self.edges,
            TableKind::GlobalInfo => &mut *self.global_info,
            TableKind::SystemSpare => &mut *self.system_spares,
        }
    }

    fn install(&mut self, index: usize, record: EntryRecord) -> Result<EntryHandle> {
        match record {
            EntryRecord::Object(e) => self.objects.install(index, e),
            EntryRecord::User(e) => self.users.install(index, e),
            EntryRecord::Edge(e) => self.edges.install(index, e),
            EntryRecord::GlobalInfo(e) => self.global_info.install(index, e),
            EntryRecord::SystemSpare(e) => self.system_spares.install(index, e),
        }
    }

    fn commit(&mut self, handle: EntryHandle, record: EntryRecord) -> Result<EntryHandle> {
        match record {
            EntryRecord::Object(e) => self.objects.commit(handle, e),
            EntryRecord::User(e) => self.users.commit(handle, e),
            EntryRecord::Edge(e) => self.edges.commit(handle, e),
            EntryRecord::GlobalInfo(e) => self.global_info.commit(handle, e),
            EntryRecord::SystemSpare(e) => self.system_spares.commit(handle, e),
        }
    }

    fn replace(&mut self, expected: EntryHandle, record: EntryRecord) -> Result<EntryHandle> {
        match record {
            EntryRecord::Object(e) => self.objects.replace(expected, e),
            EntryRecord::User(e) => self.users.replace(expected, e),
            EntryRecord::Edge(e) => self.edges.replace(expected, e),
            EntryRecord::GlobalInfo(e) => self.global_info.replace(expected, e),
            EntryRecord::SystemSpare(e) => self.system_spares.replace(expected, e),
        }
    }
}

/// Keys of a commit between validation and apply. Direct writes to them are
/// refused with [`Error::EntryBusy`] until the fence drops.
pub(crate) struct CommitFence<'a> {
    store: &'a ConfigTableStore,
    keys: Vec<EntryKey>,
}

impl Drop for CommitFence<'_> {
    fn drop(&mut self) {
        for key in &self.keys {
            self.store.in_flight.remove(key);
        }
    }
}

// =============================================================================
// Configuration Table Store
// =============================================================================

/// Owner of every persisted configuration entry
pub struct ConfigTableStore {
    status: RwLock<StoreStatus>,
    sizes: RwLock<Option<TableSizes>>,
    objects: Mutex<SlotArena<ObjectEntry>>,
    users: Mutex<SlotArena<UserEntry>>,
    edges: Mutex<SlotArena<EdgeEntry>>,
    global_info: Mutex<SlotArena<GlobalInfoEntry>>,
    system_spares: Mutex<SlotArena<SystemSpareEntry>>,
    /// Keys fenced by a commit in flight
    in_flight: DashSet<EntryKey>,
    events: RwLock<Option<EventSinkRef>>,
}

impl Default for ConfigTableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigTableStore {
    /// Unallocated store; call [`allocate`](Self::allocate) before use
    pub fn new() -> Self {
        Self {
            status: RwLock::new(StoreStatus::Uninitialized),
            sizes: RwLock::new(None),
            objects: Mutex::new(SlotArena::new(TableKind::Object.name(), 0)),
            users: Mutex::new(SlotArena::new(TableKind::User.name(), 0)),
            edges: Mutex::new(SlotArena::new(TableKind::Edge.name(), 0)),
            global_info: Mutex::new(SlotArena::new(TableKind::GlobalInfo.name(), 0)),
            system_spares: Mutex::new(SlotArena::new(TableKind::SystemSpare.name(), 0)),
            in_flight: DashSet::new(),
            events: RwLock::new(None),
        }
    }

    /// Allocated store, for tests and tools
    pub fn with_limits(limits: &PlatformLimits) -> Result<Self> {
        let store = Self::new();
        store.allocate(limits)?;
        Ok(store)
    }

    /// Size every table from the platform limits.
    ///
    /// On failure the store moves to [`StoreStatus::Failed`].
    pub fn allocate(&self, limits: &PlatformLimits) -> Result<TableSizes> {
        let sizes = match TableSizes::compute(limits) {
            Ok(sizes) => sizes,
            Err(e) => {
                error!(error = %e, "Table allocation failed");
                *self.status.write() = StoreStatus::Failed {
                    reason: e.to_string(),
                };
                return Err(e);
            }
        };

        self.objects.lock().reset(sizes.object);
        self.users.lock().reset(sizes.user);
        self.edges.lock().reset(sizes.edge);
        self.global_info.lock().reset(sizes.global_info);
        self.system_spares.lock().reset(sizes.system_spare);
        *self.sizes.write() = Some(sizes);
        *self.status.write() = StoreStatus::Ready;

        info!(
            objects = sizes.object,
            edges = sizes.edge,
            reserved = sizes.reserved_objects,
            "Configuration tables allocated"
        );
        Ok(sizes)
    }

    /// Route service-mode and destroy-timeout events to a sink
    pub fn set_event_sink(&self, sink: EventSinkRef) {
        *self.events.write() = Some(sink);
    }

    pub fn status(&self) -> StoreStatus {
        self.status.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.status.read(), StoreStatus::Ready)
    }

    pub fn sizes(&self) -> Result<TableSizes> {
        self.sizes
            .read()
            .ok_or_else(|| Error::StoreNotReady("tables not allocated".into()))
    }

    pub fn usage(&self) -> Vec<TableUsage> {
        [
            TableKind::Object,
            TableKind::User,
            TableKind::Edge,
            TableKind::GlobalInfo,
            TableKind::SystemSpare,
        ]
        .into_iter()
        .map(|table| self.with_slots(table, |slots| slots.usage()))
        .collect()
    }

    /// Mutations are refused unless the store is `Ready`
    pub fn ensure_writable(&self) -> Result<()> {
        match &*self.status.read() {
            StoreStatus::Ready => Ok(()),
            StoreStatus::ServiceMode { reason } => Err(Error::ServiceMode {
                reason: reason.clone(),
            }),
            status => Err(Error::StoreNotReady(status.to_string())),
        }
    }

    /// Degrade to read-only service mode
    pub fn enter_service_mode(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut status = self.status.write();
            if matches!(*status, StoreStatus::ServiceMode { .. }) {
                return;
            }
            *status = StoreStatus::ServiceMode {
                reason: reason.clone(),
            };
        }
        error!(reason = %reason, "Entering service mode; configuration is read-only");
        self.log_event(EventRecord {
            message: EventMessage::ServiceModeEntered,
            severity: EventSeverity::Critical,
            args: vec![EventArg::Text(reason)],
        });
    }

    fn log_event(&self, record: EventRecord) {
        if let Some(sink) = self.events.read().as_ref() {
            sink.log_event(record);
        }
    }

    fn with_slots<R>(&self, table: TableKind, f: impl FnOnce(&mut dyn SlotControl) -> R) -> R {
        match table {
            TableKind::Object => f(&mut *self.objects.lock()),
            TableKind::User => f(&mut *self.users.lock()),
            TableKind::Edge => f(&mut *self.edges.lock()),
            TableKind::GlobalInfo => f(&mut *self.global_info.lock()),
            TableKind::SystemSpare => f(&mut *self.system_spares.lock()),
        }
    }

    /// Physical slot of a key
    fn slot_index(&self, key: &EntryKey) -> Result<usize> {
        let index = match key {
            EntryKey::Object(id) => id.index(),
            EntryKey::User(entry_id) => *entry_id as usize,
            EntryKey::Edge {
                object_id,
                client_index,
            } => {
                if *client_index >= MAX_EDGES_PER_OBJECT {
                    return Err(Error::EdgeLimitReached {
                        object_id: *object_id,
                    });
                }
                edge_slot(*object_id, *client_index)
            }
            EntryKey::GlobalInfo(ty) => ty.index(),
            EntryKey::SystemSpare(id) => id
                .0
                .checked_sub(FIRST_SYSTEM_DRIVE_ID)
                .map(|i| i as usize)
                .ok_or(Error::EntryIndexOutOfRange {
                    table: TableKind::SystemSpare.name(),
                    index: id.index(),
                })?,
        };
        Ok(index)
    }

    // =========================================================================
    // Slot Allocation
    // =========================================================================

    /// Reserve the first free object id above the reserved system range
    pub fn get_free_object_entry(&self) -> Result<(ObjectId, EntryHandle)> {
        self.ensure_writable()?;
        let reserved = self.sizes()?.reserved_objects;
        let mut objects = self.objects.lock();
        let len = objects.len();
        let index = objects
            .first_free(reserved..len)
            .ok_or(Error::TableFull {
                table: TableKind::Object.name(),
            })?;
        let handle = objects.reserve(index)?;
        Ok((ObjectId(index as u32), handle))
    }

    pub fn get_free_user_entry(&self) -> Result<(u32, EntryHandle)> {
        self.ensure_writable()?;
        let mut users = self.users.lock();
        let len = users.len();
        let index = users.first_free(0..len).ok_or(Error::TableFull {
            table: TableKind::User.name(),
        })?;
        let handle = users.reserve(index)?;
        Ok((index as u32, handle))
    }

    /// Reserve the lowest free client index of `object_id`
    pub fn get_free_edge_entry(&self, object_id: ObjectId) -> Result<(u32, EntryHandle)> {
        self.ensure_writable()?;
        let base = edge_slot(object_id, 0);
        let mut edges = self.edges.lock();
        if base >= edges.len() {
            return Err(Error::EntryIndexOutOfRange {
                table: TableKind::Edge.name(),
                index: base,
            });
        }
        let index = edges
            .first_free(base..base + MAX_EDGES_PER_OBJECT as usize)
            .ok_or(Error::EdgeLimitReached { object_id })?;
        let handle = edges.reserve(index)?;
        Ok(((index - base) as u32, handle))
    }

    /// Reserve the first global-info type that has no entry yet
    pub fn get_free_global_info_entry(&self) -> Result<(GlobalInfoType, EntryHandle)> {
        self.ensure_writable()?;
        let mut global_info = self.global_info.lock();
        let len = global_info.len();
        let index = global_info.first_free(0..len).ok_or(Error::TableFull {
            table: TableKind::GlobalInfo.name(),
        })?;
        let ty = GlobalInfoType::from_index(index).ok_or(Error::EntryIndexOutOfRange {
            table: TableKind::GlobalInfo.name(),
            index,
        })?;
        let handle = global_info.reserve(index)?;
        Ok((ty, handle))
    }

    /// Reserve a specific slot
    pub fn reserve_entry(&self, key: &EntryKey) -> Result<EntryHandle> {
        self.ensure_writable()?;
        let index = self.slot_index(key)?;
        self.with_slots(key.table(), |slots| slots.reserve_slot(index))
    }

    /// Return a reserved slot to `Invalid`
    pub fn release_reservation(&self, key: &EntryKey, handle: EntryHandle) -> Result<()> {
        self.with_slots(key.table(), |slots| slots.release_slot(handle))
    }

    /// Handle of a `Valid` entry, for staging updates and destroys
    pub fn valid_handle(&self, key: &EntryKey) -> Result<EntryHandle> {
        let index = self.slot_index(key)?;
        self.with_slots(key.table(), |slots| match slots.slot_state(index)? {
            EntryState::Valid => slots.slot_handle(index),
            _ => Err(Error::EntryNotFound(key.to_string())),
        })
    }

    pub fn entry_state(&self, key: &EntryKey) -> Result<EntryState> {
        let index = self.slot_index(key)?;
        self.with_slots(key.table(), |slots| slots.slot_state(index))
    }

    // =========================================================================
    // Point Reads
    // =========================================================================

    pub fn get_entry_by_id(&self, object_id: ObjectId) -> Option<ObjectEntry> {
        self.objects.lock().get(object_id.index()).cloned()
    }

    pub fn get_user_entry(&self, entry_id: u32) -> Option<UserEntry> {
        self.users.lock().get(entry_id as usize).cloned()
    }

    pub fn get_edge_entry(&self, object_id: ObjectId, client_index: u32) -> Option<EdgeEntry> {
        if client_index >= MAX_EDGES_PER_OBJECT {
            return None;
        }
        self.edges
            .lock()
            .get(edge_slot(object_id, client_index))
            .cloned()
    }

    pub fn get_global_info(&self, ty: GlobalInfoType) -> Option<GlobalInfoEntry> {
        self.global_info.lock().get(ty.index()).cloned()
    }

    pub fn get_system_spare(&self, drive: ObjectId) -> Option<SystemSpareEntry> {
        let index = self.slot_index(&EntryKey::SystemSpare(drive)).ok()?;
        self.system_spares.lock().get(index).cloned()
    }

    /// Any entry by key
    pub fn get_entry(&self, key: &EntryKey) -> Option<EntryRecord> {
        match key {
            EntryKey::Object(id) => self.get_entry_by_id(*id).map(EntryRecord::Object),
            EntryKey::User(entry_id) => self.get_user_entry(*entry_id).map(EntryRecord::User),
            EntryKey::Edge {
                object_id,
                client_index,
            } => self
                .get_edge_entry(*object_id, *client_index)
                .map(EntryRecord::Edge),
            EntryKey::GlobalInfo(ty) => self.get_global_info(*ty).map(EntryRecord::GlobalInfo),
            EntryKey::SystemSpare(id) => self.get_system_spare(*id).map(EntryRecord::SystemSpare),
        }
    }

    /// Downstream edges of a client object, by client index
    pub fn edges_of(&self, client: ObjectId) -> Vec<EdgeEntry> {
        let edges = self.edges.lock();
        (0..MAX_EDGES_PER_OBJECT)
            .filter_map(|i| edges.get(edge_slot(client, i)).cloned())
            .collect()
    }

    // =========================================================================
    // Secondary-Key Scans
    // =========================================================================

    /// Every edge whose server is `server_id`
    pub fn find_upstream_edges(&self, server_id: ObjectId) -> Vec<EdgeEntry> {
        self.edges
            .lock()
            .iter_valid()
            .filter(|(_, edge)| edge.server_id == server_id)
            .map(|(_, edge)| edge.clone())
            .collect()
    }

    pub fn find_user_by_raid_group_number(&self, number: u32) -> Option<UserEntry> {
        self.users
            .lock()
            .iter_valid()
            .find(|(_, user)| user.raid_group_number() == Some(number))
            .map(|(_, user)| user.clone())
    }

    pub fn find_user_by_lun_number(&self, number: u32) -> Option<UserEntry> {
        self.users
            .lock()
            .iter_valid()
            .find(|(_, user)| {
                matches!(user.identity, UserIdentity::Lun { lun_number, .. } if lun_number == number)
            })
            .map(|(_, user)| user.clone())
    }

    pub fn find_user_by_world_wide_name(&self, wwn: &str) -> Option<UserEntry> {
        self.users
            .lock()
            .iter_valid()
            .find(|(_, user)| {
                matches!(&user.identity, UserIdentity::Lun { world_wide_name, .. } if world_wide_name == wwn)
            })
            .map(|(_, user)| user.clone())
    }

    /// Provision drive configured with a serial number
    pub fn find_object_by_serial_number(&self, serial: &str) -> Option<ObjectEntry> {
        self.objects
            .lock()
            .iter_valid()
            .find(|(_, entry)| {
                matches!(&entry.config, ObjectConfig::ProvisionDrive(pvd) if pvd.serial_number == serial)
            })
            .map(|(_, entry)| entry.clone())
    }

    pub fn user_entry_for_object(&self, object_id: ObjectId) -> Option<UserEntry> {
        self.users
            .lock()
            .iter_valid()
            .find(|(_, user)| user.header.object_id == object_id)
            .map(|(_, user)| user.clone())
    }

    pub fn objects_of_class(&self, class_id: ClassId) -> Vec<ObjectEntry> {
        self.objects
            .lock()
            .iter_valid()
            .filter(|(_, entry)| entry.class_id == class_id)
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    /// User-created (non-system) raid groups
    pub fn count_user_raid_groups(&self) -> u32 {
        self.users
            .lock()
            .iter_valid()
            .filter(|(_, user)| matches!(user.identity, UserIdentity::RaidGroup { system: false, .. }))
            .count() as u32
    }

    pub fn raid_group_numbers(&self) -> Vec<u32> {
        let mut numbers: Vec<u32> = self
            .users
            .lock()
            .iter_valid()
            .filter_map(|(_, user)| user.raid_group_number())
            .collect();
        numbers.sort_unstable();
        numbers
    }

    // =========================================================================
    // Direct Writes
    // =========================================================================

    /// Checks an already-committed entry against the schema this build knows.
    ///
    /// An entry whose carried schema size is larger than the local one was
    /// written by newer software. Accepting it would drop fields, so the
    /// store enters service mode instead. An older entry is upgraded.
    fn admit_schema(&self, record: &mut EntryRecord) -> Result<()> {
        if let EntryRecord::Object(entry) = &*record {
            if !entry.config.fits_class(entry.class_id) {
                return Err(Error::MalformedEntry {
                    key: record.key().to_string(),
                    reason: format!("payload does not belong to class {}", entry.class_id),
                });
            }
        }

        let local = record.local_schema_size();
        let carried = record.header().version_size;
        if carried > local {
            let reason = format!(
                "{} carries schema size {} but this build knows {}",
                record.key(),
                carried,
                local
            );
            self.enter_service_mode(reason.clone());
            return Err(Error::ServiceMode { reason });
        }
        if carried < local {
            debug!(key = %record.key(), carried, local, "Upgrading entry from older schema");
            record.header_mut().version_size = local;
        }
        record.header_mut().state = EntryState::Valid;
        Ok(())
    }

    fn ensure_not_fenced(&self, key: &EntryKey) -> Result<()> {
        if self.in_flight.contains(key) {
            return Err(Error::EntryBusy(key.to_string()));
        }
        Ok(())
    }

    /// Write one already-committed entry into its slot
    pub fn update_entry(&self, record: EntryRecord) -> Result<()> {
        self.apply_ops(&[JournalOp::Upsert(record)], false)
    }

    /// Zero a `Valid` entry
    pub fn remove_entry(&self, key: &EntryKey) -> Result<()> {
        self.apply_ops(&[JournalOp::Remove(*key)], false)
    }

    /// Re-apply a journaled commit; removals of absent entries are skipped
    pub fn replay(&self, record: &CommitRecord) -> Result<()> {
        self.apply_ops(&record.ops, true)
    }

    /// Apply a commit replicated from the peer controller, all or nothing
    pub fn apply_replicated(&self, record: &CommitRecord) -> Result<()> {
        self.apply_ops(&record.ops, false)
    }

    /// Check every op against the tables as they would be after the ops
    /// before it, then apply them all under one hold of every table lock.
    /// Nothing is written unless every op can be.
    fn apply_ops(&self, ops: &[JournalOp], missing_ok: bool) -> Result<()> {
        self.ensure_writable()?;

        let mut prepared = Vec::with_capacity(ops.len());
        for op in ops {
            let prepared_op = match op {
                JournalOp::Upsert(record) => {
                    let mut record = record.clone();
                    self.admit_schema(&mut record)?;
                    JournalOp::Upsert(record)
                }
                JournalOp::Remove(key) => JournalOp::Remove(*key),
            };
            let index = self.slot_index(&prepared_op.key())?;
            prepared.push((index, prepared_op));
        }

        let mut tables = self.lock_all();
        let mut projected: HashMap<EntryKey, EntryState> = HashMap::new();
        let mut skip = vec![false; prepared.len()];
        for (i, (index, op)) in prepared.iter().enumerate() {
            let key = op.key();
            self.ensure_not_fenced(&key)?;
            let state = match projected.get(&key) {
                Some(state) => *state,
                None => tables.slots(key.table()).slot_state(*index)?,
            };
            let next = match (op, state) {
                (JournalOp::Upsert(_), EntryState::Valid | EntryState::Invalid) => {
                    EntryState::Valid
                }
                (JournalOp::Remove(_), EntryState::Valid) => EntryState::Invalid,
                (JournalOp::Remove(_), EntryState::Invalid) if missing_ok => {
                    skip[i] = true;
                    EntryState::Invalid
                }
                (JournalOp::Remove(_), EntryState::Invalid) => {
                    return Err(Error::EntryNotFound(key.to_string()))
                }
                (JournalOp::Upsert(_), from) => {
                    return Err(Error::InvalidStateTransition {
                        table: key.table().name(),
                        from,
                        to: EntryState::Valid,
                    })
                }
                (JournalOp::Remove(_), from) => {
                    return Err(Error::InvalidStateTransition {
                        table: key.table().name(),
                        from,
                        to: EntryState::Invalid,
                    })
                }
            };
            projected.insert(key, next);
        }

        for ((index, op), skipped) in prepared.into_iter().zip(skip) {
            if skipped {
                continue;
            }
            let key = op.key();
            match op {
                JournalOp::Upsert(record) => {
                    tables.install(index, record)?;
                    debug!(key = %key, "Entry updated");
                }
                JournalOp::Remove(_) => {
                    tables.slots(key.table()).remove_slot(index)?;
                    debug!(key = %key, "Entry removed");
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Transaction Commit
    // =========================================================================

    /// Check every staged handle still addresses what the transaction saw,
    /// then fence the staged keys against direct writes until the returned
    /// guard drops
    pub(crate) fn fence_staged(&self, ops: &[StagedOp]) -> Result<CommitFence<'_>> {
        let mut tables = self.lock_all();
        Self::check_staged(&mut tables, ops)?;
        let keys: Vec<EntryKey> = ops.iter().map(StagedOp::key).collect();
        for key in &keys {
            self.in_flight.insert(*key);
        }
        Ok(CommitFence { store: self, keys })
    }

    fn check_staged(tables: &mut TableGuards<'_>, ops: &[StagedOp]) -> Result<()> {
        for op in ops {
            let (table, handle, expected) = match op {
                StagedOp::Create { record, handle } => {
                    (record.key().table(), *handle, EntryState::Uncommitted)
                }
                StagedOp::Update { record, expected } => {
                    (record.key().table(), *expected, EntryState::Valid)
                }
                StagedOp::Destroy { key, expected } => (key.table(), *expected, EntryState::Valid),
            };
            tables.slots(table).check_slot(handle, expected)?;
        }
        Ok(())
    }

    /// Apply fenced staged operations. Every handle is re-checked under one
    /// hold of every table lock before the first write.
    pub(crate) fn apply_staged(
        &self,
        ops: Vec<StagedOp>,
        _fence: &CommitFence<'_>,
    ) -> Result<()> {
        let mut tables = self.lock_all();
        Self::check_staged(&mut tables, &ops)?;
        for op in ops {
            match op {
                StagedOp::Create { mut record, handle } => {
                    record.header_mut().state = EntryState::Valid;
                    tables.commit(handle, record)?;
                }
                StagedOp::Update {
                    mut record,
                    expected,
                } => {
                    record.header_mut().state = EntryState::Valid;
                    tables.replace(expected, record)?;
                }
                StagedOp::Destroy { key, expected } => {
                    tables.slots(key.table()).destroy_slot(expected)?;
                }
            }
        }
        Ok(())
    }

    fn lock_all(&self) -> TableGuards<'_> {
        TableGuards {
            objects: self.objects.lock(),
            users: self.users.lock(),
            edges: self.edges.lock(),
            global_info: self.global_info.lock(),
            system_spares: self.system_spares.lock(),
        }
    }

    // =========================================================================
    // Class Destroy
    // =========================================================================

    /// Destroy every `Valid` object of a class.
    ///
    /// Phase one asks each object to destroy itself; phase two polls for
    /// disappearance with bounded retries. Returns the ids that disappeared;
    /// their entries are left for the caller to remove transactionally.
    pub async fn destroy_all_objects_of_class(
        &self,
        class_id: ClassId,
        lifecycle: &dyn LifecycleService,
        timeouts: &Timeouts,
    ) -> Result<Vec<ObjectId>> {
        self.ensure_writable()?;
        let targets: Vec<ObjectId> = self
            .objects_of_class(class_id)
            .iter()
            .map(|entry| entry.object_id())
            .collect();
        if targets.is_empty() {
            return Ok(targets);
        }

        info!(class = %class_id, count = targets.len(), "Destroying all objects of class");
        let requests = targets.iter().map(|id| lifecycle.request_destroy(*id));
        for (id, result) in targets.iter().zip(join_all(requests).await) {
            if let Err(e) = result {
                warn!(object_id = %id, error = %e, "Destroy request failed");
            }
        }

        let mut remaining = targets.clone();
        for attempt in 0..=timeouts.destroy_poll_retries {
            let mut still_present = Vec::new();
            for id in remaining {
                match lifecycle.object_exists(id).await {
                    Ok(false) => {}
                    Ok(true) => still_present.push(id),
                    Err(e) => {
                        debug!(object_id = %id, error = %e, "Existence poll failed");
                        still_present.push(id);
                    }
                }
            }
            remaining = still_present;
            if remaining.is_empty() {
                break;
            }
            if attempt < timeouts.destroy_poll_retries {
                tokio::time::sleep(timeouts.destroy_poll_interval()).await;
            }
        }

        if !remaining.is_empty() {
            error!(
                class = %class_id,
                remaining = ?remaining,
                "CRITICAL: objects still exist after destroy poll bound"
            );
            self.log_event(EventRecord {
                message: EventMessage::DestroyTimeout,
                severity: EventSeverity::Critical,
                args: remaining.iter().map(|id| EventArg::ObjectId(*id)).collect(),
            });
            return Err(Error::DestroyTimeout {
                object_ids: remaining,
            });
        }

        Ok(targets)
    }
}
