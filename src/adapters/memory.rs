//! In-Memory Array Adapter
//!
//! Answers every collaborator port from process memory and the shared
//! configuration store. Drive extents are derived from committed edges, so
//! the capacity view always matches what the store holds. Used by the
//! standalone service and by every test that drives the pipeline.

use crate::capacity::extent::{ObjectExtents, UsedExtent};
use crate::config::StandaloneDrive;
use crate::domain::ports::{
    BlockTransport, Collaborators, DriveInfo, DriveInfoService, DriveLocation, DriveType,
    EventRecord, EventSink, LifecycleService, LifecycleState, ObjectId, PrivateSpaceLayout,
    PslRegion, PvdConfigType, TopologyResolver,
};
use crate::error::{Error, Result};
use crate::store::entry::{
    ClassId, ObjectConfig, ObjectEntry, ProvisionDriveConfig, FIRST_SYSTEM_DRIVE_ID,
};
use crate::store::tables::ConfigTableStore;
use crate::store::transaction::TransactionManager;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Blocks a provision drive keeps for itself below its first client
pub const PVD_DEFAULT_OFFSET: u64 = 0x800;

/// Physical drive ids live outside the object table
const FIRST_PHYSICAL_DRIVE_ID: u32 = 0x8000_0000;

// =============================================================================
// Drive Description
// =============================================================================

/// A drive to insert into the array
#[derive(Debug, Clone)]
pub struct DriveSpec {
    pub location: DriveLocation,
    /// Blocks usable by clients, above the provision drive's own offset
    pub capacity_blocks: u64,
    pub drive_type: DriveType,
    pub block_size: u32,
    pub serial_number: String,
    pub end_of_life: bool,
    pub config_type: PvdConfigType,
    /// System drive; its object id is fixed by its slot
    pub system: bool,
}

impl DriveSpec {
    pub fn new(location: DriveLocation, capacity_blocks: u64) -> Self {
        Self {
            location,
            capacity_blocks,
            drive_type: DriveType::Sas,
            block_size: 520,
            serial_number: format!("SN{:02}{:02}{:03}", location.bus, location.enclosure, location.slot),
            end_of_life: false,
            config_type: PvdConfigType::Unconsumed,
            system: false,
        }
    }

    pub fn with_drive_type(mut self, drive_type: DriveType) -> Self {
        self.drive_type = drive_type;
        self
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_serial(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = serial_number.into();
        self
    }

    pub fn end_of_life(mut self) -> Self {
        self.end_of_life = true;
        self
    }

    pub fn hot_spare(mut self) -> Self {
        self.config_type = PvdConfigType::HotSpare;
        self
    }

    /// System drive at `bus 0, enclosure 0, slot` with object id `slot + 1`
    pub fn system(slot: u32, capacity_blocks: u64) -> Self {
        Self {
            system: true,
            config_type: PvdConfigType::Special,
            ..Self::new(DriveLocation::new(0, 0, slot), capacity_blocks)
        }
    }
}

impl From<&StandaloneDrive> for DriveSpec {
    fn from(drive: &StandaloneDrive) -> Self {
        DriveSpec::new(drive.location, drive.capacity_blocks).with_drive_type(drive.drive_type)
    }
}

#[derive(Debug, Clone)]
struct DriveState {
    spec: DriveSpec,
    pvd: ObjectId,
    pd: ObjectId,
}

// =============================================================================
// In-Memory Array
// =============================================================================

/// Every collaborator port over process memory
pub struct InMemoryArray {
    store: Arc<ConfigTableStore>,
    drives: DashMap<DriveLocation, DriveState>,
    lifecycle: DashMap<ObjectId, LifecycleState>,
    /// State reported for objects with no override
    default_state: RwLock<LifecycleState>,
    /// Entries whose objects were asked to destroy themselves
    destroyed: DashMap<ObjectId, ObjectEntry>,
    regions: DashMap<u32, PslRegion>,
    events: Mutex<Vec<EventRecord>>,
    next_pd: AtomicU32,
}

impl InMemoryArray {
    pub fn new(store: Arc<ConfigTableStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            drives: DashMap::new(),
            lifecycle: DashMap::new(),
            default_state: RwLock::new(LifecycleState::Ready),
            destroyed: DashMap::new(),
            regions: DashMap::new(),
            events: Mutex::new(Vec::new()),
            next_pd: AtomicU32::new(FIRST_PHYSICAL_DRIVE_ID),
        })
    }

    /// Bundle this array as every collaborator the pipeline needs
    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            topology: self.clone(),
            drive_info: self.clone(),
            transport: self.clone(),
            lifecycle: self.clone(),
            layout: self.clone(),
            events: self.clone(),
        }
    }

    /// Insert a drive and commit its provision-drive object.
    ///
    /// A drive whose serial number is already configured keeps its object.
    pub async fn add_drive(&self, txn: &TransactionManager, spec: DriveSpec) -> Result<ObjectId> {
        if self.drives.contains_key(&spec.location) {
            return Err(Error::Configuration(format!(
                "a drive is already inserted at {}",
                spec.location
            )));
        }

        let pvd = match self.store.find_object_by_serial_number(&spec.serial_number) {
            Some(existing) => existing.object_id(),
            None => self.commit_provision_drive(txn, &spec).await?,
        };
        let pd = ObjectId(self.next_pd.fetch_add(1, Ordering::SeqCst));

        self.lifecycle.insert(pvd, LifecycleState::Ready);
        info!(
            location = %spec.location,
            pvd = %pvd,
            capacity = spec.capacity_blocks,
            drive_type = %spec.drive_type,
            "Drive inserted"
        );
        self.drives.insert(spec.location, DriveState { spec, pvd, pd });
        Ok(pvd)
    }

    async fn commit_provision_drive(
        &self,
        txn_manager: &TransactionManager,
        spec: &DriveSpec,
    ) -> Result<ObjectId> {
        let object_id = if spec.system {
            ObjectId(FIRST_SYSTEM_DRIVE_ID + spec.location.slot)
        } else {
            ObjectId::INVALID
        };
        let config = ObjectConfig::ProvisionDrive(ProvisionDriveConfig {
            config_type: spec.config_type,
            serial_number: spec.serial_number.clone(),
            configured_capacity: spec.capacity_blocks,
            configured_block_size: spec.block_size,
            generation_number: 0,
        });

        let txn = txn_manager.begin(0);
        let staged = txn_manager.stage_create_object(txn, object_id, ClassId::ProvisionDrive, config);
        let committed = match staged {
            Ok(id) => txn_manager.commit(txn).await.map(|_| id),
            Err(e) => Err(e),
        };
        if let Err(e) = &committed {
            if let Err(abort) = txn_manager.abort(txn) {
                warn!(
                    txn = %txn,
                    error = %abort,
                    cause = %e,
                    "Abort after failed drive commit also failed"
                );
            }
        }
        committed
    }

    /// Pull a drive; its provision drive stays configured
    pub fn remove_drive(&self, location: DriveLocation) -> Option<ObjectId> {
        self.drives.remove(&location).map(|(_, state)| {
            self.lifecycle.insert(state.pvd, LifecycleState::Fail);
            state.pvd
        })
    }

    /// Force the lifecycle state of one object
    pub fn set_lifecycle(&self, object_id: ObjectId, state: LifecycleState) {
        self.lifecycle.insert(object_id, state);
    }

    /// State reported for objects created from now on without an override
    pub fn set_default_new_object_state(&self, state: LifecycleState) {
        *self.default_state.write() = state;
    }

    pub fn add_system_region(&self, region: PslRegion) {
        self.regions.insert(region.raid_group_number, region);
    }

    /// Every event logged so far
    pub fn events(&self) -> Vec<EventRecord> {
        self.events.lock().clone()
    }

    fn drive_by_pvd(&self, pvd: ObjectId) -> Option<DriveState> {
        self.drives
            .iter()
            .find(|entry| entry.value().pvd == pvd)
            .map(|entry| entry.value().clone())
    }

    /// An object counts as destroyed while the entry it had when destroy
    /// was requested is still the one in the store
    fn is_destroyed(&self, object_id: ObjectId) -> bool {
        match (
            self.destroyed.get(&object_id),
            self.store.get_entry_by_id(object_id),
        ) {
            (Some(destroyed), Some(current)) => *destroyed == current,
            _ => false,
        }
    }

    fn used_extents(&self, object_id: ObjectId) -> Vec<UsedExtent> {
        self.store
            .find_upstream_edges(object_id)
            .into_iter()
            .map(|edge| UsedExtent {
                offset: edge.offset,
                capacity: edge.capacity,
                client_index: edge.server_index,
            })
            .collect()
    }
}

// =============================================================================
// Ports
// =============================================================================

#[async_trait]
impl TopologyResolver for InMemoryArray {
    async fn provision_drive_by_location(&self, location: DriveLocation) -> Result<ObjectId> {
        Ok(self
            .drives
            .get(&location)
            .map(|drive| drive.pvd)
            .unwrap_or(ObjectId::INVALID))
    }

    async fn physical_drive_by_location(&self, location: DriveLocation) -> Result<ObjectId> {
        Ok(self
            .drives
            .get(&location)
            .map(|drive| drive.pd)
            .unwrap_or(ObjectId::INVALID))
    }
}

#[async_trait]
impl DriveInfoService for InMemoryArray {
    async fn drive_info(&self, pvd: ObjectId) -> Result<DriveInfo> {
        let drive = self.drive_by_pvd(pvd).ok_or(Error::ObjectNotFound(pvd))?;
        let config_type = match self.store.get_entry_by_id(pvd).map(|entry| entry.config) {
            Some(ObjectConfig::ProvisionDrive(config)) => config.config_type,
            _ => drive.spec.config_type,
        };
        Ok(DriveInfo {
            drive_type: drive.spec.drive_type,
            configured_block_size: drive.spec.block_size,
            end_of_life: drive.spec.end_of_life,
            config_type,
            serial_number: drive.spec.serial_number.clone(),
            imported_capacity: PVD_DEFAULT_OFFSET + drive.spec.capacity_blocks,
            exported_capacity: drive.spec.capacity_blocks,
        })
    }
}

#[async_trait]
impl BlockTransport for InMemoryArray {
    async fn object_extents(&self, object_id: ObjectId) -> Result<ObjectExtents> {
        let extents = if let Some(drive) = self.drive_by_pvd(object_id) {
            ObjectExtents::fresh(
                object_id,
                PVD_DEFAULT_OFFSET + drive.spec.capacity_blocks,
                PVD_DEFAULT_OFFSET,
            )
        } else {
            let entry = self
                .store
                .get_entry_by_id(object_id)
                .ok_or(Error::ObjectNotFound(object_id))?;
            match entry.config {
                ObjectConfig::VirtualDrive(vd) => ObjectExtents::fresh(
                    object_id,
                    vd.default_offset + vd.exported_capacity,
                    vd.default_offset,
                ),
                ObjectConfig::RaidGroup(rg) => {
                    ObjectExtents::fresh(object_id, rg.exported_capacity, 0)
                }
                _ => return Err(Error::ObjectNotFound(object_id)),
            }
        };
        Ok(extents.with_used(self.used_extents(object_id)))
    }
}

#[async_trait]
impl LifecycleService for InMemoryArray {
    async fn lifecycle_state(&self, object_id: ObjectId) -> Result<LifecycleState> {
        if self.is_destroyed(object_id) {
            return Ok(LifecycleState::Destroy);
        }
        if let Some(state) = self.lifecycle.get(&object_id) {
            return Ok(*state);
        }
        if self.store.get_entry_by_id(object_id).is_some() {
            return Ok(*self.default_state.read());
        }
        Err(Error::ObjectNotFound(object_id))
    }

    async fn request_destroy(&self, object_id: ObjectId) -> Result<()> {
        let entry = self
            .store
            .get_entry_by_id(object_id)
            .ok_or(Error::ObjectNotFound(object_id))?;
        self.lifecycle.remove(&object_id);
        self.destroyed.insert(object_id, entry);
        debug!(object_id = %object_id, "Object destroyed");
        Ok(())
    }

    async fn object_exists(&self, object_id: ObjectId) -> Result<bool> {
        Ok(self.store.get_entry_by_id(object_id).is_some() && !self.is_destroyed(object_id))
    }
}

impl PrivateSpaceLayout for InMemoryArray {
    fn system_raid_group(&self, raid_group_number: u32) -> Option<PslRegion> {
        self.regions.get(&raid_group_number).map(|r| r.clone())
    }
}

impl EventSink for InMemoryArray {
    fn log_event(&self, record: EventRecord) {
        debug!(message = ?record.message, severity = ?record.severity, "Event logged");
        self.events.lock().push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformLimits;
    use crate::store::entry::EdgeEntry;
    use crate::store::journal::MemoryJournal;

    fn setup() -> (Arc<InMemoryArray>, TransactionManager) {
        let store = Arc::new(ConfigTableStore::with_limits(&PlatformLimits::default()).unwrap());
        let txn = TransactionManager::new(store.clone(), Arc::new(MemoryJournal::new()));
        (InMemoryArray::new(store), txn)
    }

    #[tokio::test]
    async fn test_add_drive_resolves() {
        let (array, txn) = setup();
        let location = DriveLocation::new(0, 0, 4);
        let pvd = array
            .add_drive(&txn, DriveSpec::new(location, 0x10000))
            .await
            .unwrap();

        assert_eq!(array.provision_drive_by_location(location).await.unwrap(), pvd);
        assert!(array.physical_drive_by_location(location).await.unwrap().is_valid());
        assert_eq!(
            array
                .provision_drive_by_location(DriveLocation::new(0, 0, 9))
                .await
                .unwrap(),
            ObjectId::INVALID
        );
        assert_eq!(array.lifecycle_state(pvd).await.unwrap(), LifecycleState::Ready);

        let info = array.drive_info(pvd).await.unwrap();
        assert_eq!(info.config_type, PvdConfigType::Unconsumed);
        assert_eq!(info.exported_capacity, 0x10000);
    }

    #[tokio::test]
    async fn test_reinserted_drive_keeps_object() {
        let (array, txn) = setup();
        let spec = DriveSpec::new(DriveLocation::new(0, 0, 4), 0x10000).with_serial("SERIAL-1");
        let first = array.add_drive(&txn, spec.clone()).await.unwrap();
        assert_eq!(array.remove_drive(spec.location), Some(first));

        let moved = DriveSpec {
            location: DriveLocation::new(0, 1, 0),
            ..spec
        };
        assert_eq!(array.add_drive(&txn, moved).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_extents_follow_committed_edges() {
        let (array, txn) = setup();
        let pvd = array
            .add_drive(&txn, DriveSpec::new(DriveLocation::new(0, 0, 4), 0x10000))
            .await
            .unwrap();

        let t = txn.begin(1);
        txn.stage_create_edge(t, EdgeEntry::new(ObjectId(0x200), 0, pvd, 0, 0x4000, PVD_DEFAULT_OFFSET))
            .unwrap();
        txn.commit(t).await.unwrap();

        let extents = array.object_extents(pvd).await.unwrap();
        assert_eq!(extents.used.len(), 1);
        let free = extents.largest_free(false).unwrap();
        assert_eq!(free.offset, PVD_DEFAULT_OFFSET + 0x4000);
        assert_eq!(free.capacity, 0xc000);
        assert_eq!(extents.next_client_index(), Some(1));
    }

    #[tokio::test]
    async fn test_destroy_hides_object() {
        let (array, txn) = setup();
        let pvd = array
            .add_drive(&txn, DriveSpec::new(DriveLocation::new(0, 0, 4), 0x10000))
            .await
            .unwrap();
        assert!(array.object_exists(pvd).await.unwrap());

        array.request_destroy(pvd).await.unwrap();
        assert!(!array.object_exists(pvd).await.unwrap());
        assert_eq!(array.lifecycle_state(pvd).await.unwrap(), LifecycleState::Destroy);
    }

    #[tokio::test]
    async fn test_failed_drive_commit_is_aborted() {
        let store = Arc::new(ConfigTableStore::with_limits(&PlatformLimits::default()).unwrap());
        let journal = Arc::new(MemoryJournal::new());
        let txn = TransactionManager::new(store.clone(), journal.clone());
        let array = InMemoryArray::new(store.clone());
        let location = DriveLocation::new(0, 0, 4);

        journal.fail_writes(true);
        assert!(matches!(
            array.add_drive(&txn, DriveSpec::new(location, 0x10000)).await,
            Err(Error::PersistFailed(_))
        ));
        assert_eq!(txn.active_count(), 0);
        assert!(store.usage().iter().all(|usage| usage.uncommitted == 0));
        assert_eq!(
            array.provision_drive_by_location(location).await.unwrap(),
            ObjectId::INVALID
        );

        journal.fail_writes(false);
        assert!(array.add_drive(&txn, DriveSpec::new(location, 0x10000)).await.is_ok());
    }

    #[tokio::test]
    async fn test_system_drive_ids() {
        let (array, txn) = setup();
        let pvd = array.add_drive(&txn, DriveSpec::system(2, 0x10000)).await.unwrap();
        assert_eq!(pvd, ObjectId(FIRST_SYSTEM_DRIVE_ID + 2));
        assert_eq!(array.drive_info(pvd).await.unwrap().config_type, PvdConfigType::Special);
    }
}
