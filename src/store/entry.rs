//! Table Entries
//!
//! Fixed-schema entry shapes for the object, user, edge, global-info and
//! system-spare tables. Every entry starts with a [`TableHeader`] whose
//! `version_size` records the byte length of the schema revision that wrote
//! it, so a replicated entry from newer software can be detected.

use crate::capacity::geometry::RaidType;
use crate::domain::ports::{ObjectId, PvdConfigType};
use serde::{Deserialize, Serialize};

/// Maximum downstream edges one object may have
pub const MAX_EDGES_PER_OBJECT: u32 = 16;

// Schema revision sizes, in bytes of the persisted layout. A field added to
// any shape grows its size here, which is what lets an older peer recognise
// an entry written by newer software.

/// state, entry id, object id, version size
pub const TABLE_HEADER_SCHEMA_SIZE: u32 = 16;
/// config type, 32-byte serial, capacity, block size, generation
const PROVISION_DRIVE_SCHEMA_SIZE: u32 = 56;
/// exported, imported, default offset, generation
const VIRTUAL_DRIVE_SCHEMA_SIZE: u32 = 32;
/// type, width, capacities, element geometry, flags, power saving, latency,
/// generation
const RAID_GROUP_SCHEMA_SIZE: u32 = 64;
/// capacity, offset, generation
const LUN_SCHEMA_SIZE: u32 = 24;
/// width, generation
const EXTENT_POOL_SCHEMA_SIZE: u32 = 16;

// =============================================================================
// Header
// =============================================================================

/// Lifecycle of a table slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Invalid,
    Uncommitted,
    Valid,
    Destroy,
}

impl EntryState {
    /// `Invalid -> Uncommitted -> Valid -> Destroy -> Invalid`, plus abort
    /// of an uncommitted reservation back to `Invalid`
    pub fn can_transition_to(self, next: EntryState) -> bool {
        matches!(
            (self, next),
            (EntryState::Invalid, EntryState::Uncommitted)
                | (EntryState::Uncommitted, EntryState::Valid)
                | (EntryState::Uncommitted, EntryState::Invalid)
                | (EntryState::Valid, EntryState::Destroy)
                | (EntryState::Destroy, EntryState::Invalid)
        )
    }
}

/// Common header of every entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableHeader {
    pub state: EntryState,
    pub entry_id: u32,
    pub object_id: ObjectId,
    /// Byte length of the schema revision that produced this entry
    pub version_size: u32,
}

impl TableHeader {
    pub fn new(entry_id: u32, object_id: ObjectId, version_size: u32) -> Self {
        Self {
            state: EntryState::Invalid,
            entry_id,
            object_id,
            version_size,
        }
    }
}

// =============================================================================
// Object Table
// =============================================================================

/// Object class stored in the object table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassId {
    ProvisionDrive,
    VirtualDrive,
    Mirror,
    Striper,
    Parity,
    Lun,
    ExtentPool,
}

impl ClassId {
    /// Whether objects of this class are raid groups
    pub fn is_raid_group(&self) -> bool {
        matches!(self, ClassId::Mirror | ClassId::Striper | ClassId::Parity)
    }

    /// Schema size compiled into this software for the class
    pub fn schema_size(&self) -> u32 {
        let payload = match self {
            ClassId::ProvisionDrive => PROVISION_DRIVE_SCHEMA_SIZE,
            ClassId::VirtualDrive => VIRTUAL_DRIVE_SCHEMA_SIZE,
            ClassId::Mirror | ClassId::Striper | ClassId::Parity => RAID_GROUP_SCHEMA_SIZE,
            ClassId::Lun => LUN_SCHEMA_SIZE,
            ClassId::ExtentPool => EXTENT_POOL_SCHEMA_SIZE,
        };
        TABLE_HEADER_SCHEMA_SIZE + payload
    }
}

impl std::fmt::Display for ClassId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClassId::ProvisionDrive => write!(f, "provision_drive"),
            ClassId::VirtualDrive => write!(f, "virtual_drive"),
            ClassId::Mirror => write!(f, "mirror"),
            ClassId::Striper => write!(f, "striper"),
            ClassId::Parity => write!(f, "parity"),
            ClassId::Lun => write!(f, "lun"),
            ClassId::ExtentPool => write!(f, "extent_pool"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionDriveConfig {
    pub config_type: PvdConfigType,
    pub serial_number: String,
    pub configured_capacity: u64,
    pub configured_block_size: u32,
    pub generation_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDriveConfig {
    /// Capacity offered to upstream raid groups
    pub exported_capacity: u64,
    /// Capacity consumed on the provision drive
    pub imported_capacity: u64,
    pub default_offset: u64,
    pub generation_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaidGroupConfig {
    pub raid_type: RaidType,
    pub width: u32,
    pub exported_capacity: u64,
    /// Capacity consumed on each member
    pub imported_per_member: u64,
    pub element_size: u32,
    pub elements_per_parity: u32,
    /// Mirror beneath a RAID10 striper; never user visible
    pub private: bool,
    pub power_saving_enabled: bool,
    pub power_saving_idle_secs: u64,
    pub max_raid_latency_secs: u64,
    pub generation_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LunConfig {
    pub capacity: u64,
    pub offset: u64,
    pub generation_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentPoolConfig {
    pub width: u32,
    pub generation_number: u64,
}

/// Class-specific configuration payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectConfig {
    ProvisionDrive(ProvisionDriveConfig),
    VirtualDrive(VirtualDriveConfig),
    RaidGroup(RaidGroupConfig),
    Lun(LunConfig),
    ExtentPool(ExtentPoolConfig),
}

impl ObjectConfig {
    /// Capacity this object offers to upstream consumers, if any
    pub fn exported_capacity(&self) -> Option<u64> {
        match self {
            ObjectConfig::ProvisionDrive(c) => Some(c.configured_capacity),
            ObjectConfig::VirtualDrive(c) => Some(c.exported_capacity),
            ObjectConfig::RaidGroup(c) => Some(c.exported_capacity),
            ObjectConfig::Lun(c) => Some(c.capacity),
            ObjectConfig::ExtentPool(_) => None,
        }
    }

    /// Whether this payload is the one objects of `class_id` carry
    pub fn fits_class(&self, class_id: ClassId) -> bool {
        matches!(
            (self, class_id),
            (ObjectConfig::ProvisionDrive(_), ClassId::ProvisionDrive)
                | (ObjectConfig::VirtualDrive(_), ClassId::VirtualDrive)
                | (
                    ObjectConfig::RaidGroup(_),
                    ClassId::Mirror | ClassId::Striper | ClassId::Parity
                )
                | (ObjectConfig::Lun(_), ClassId::Lun)
                | (ObjectConfig::ExtentPool(_), ClassId::ExtentPool)
        )
    }

    pub fn as_raid_group(&self) -> Option<&RaidGroupConfig> {
        match self {
            ObjectConfig::RaidGroup(c) => Some(c),
            _ => None,
        }
    }
}

/// Entry of the object table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub header: TableHeader,
    pub class_id: ClassId,
    pub config: ObjectConfig,
}

impl ObjectEntry {
    pub fn new(object_id: ObjectId, class_id: ClassId, config: ObjectConfig) -> Self {
        Self {
            header: TableHeader::new(object_id.0, object_id, class_id.schema_size()),
            class_id,
            config,
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.header.object_id
    }
}

// =============================================================================
// User Table
// =============================================================================

/// User-facing identity of an object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserIdentity {
    RaidGroup {
        raid_group_number: u32,
        system: bool,
    },
    Lun {
        lun_number: u32,
        world_wide_name: String,
        user_defined_name: String,
    },
    ExtentPool {
        pool_id: u32,
    },
    ProvisionDrive {
        serial_number: String,
    },
}

/// Header, class, then the widest identity: lun number, 16-byte world wide
/// name and 32-byte user defined name
pub const USER_ENTRY_SCHEMA_SIZE: u32 = TABLE_HEADER_SCHEMA_SIZE + 4 + 4 + 4 + 16 + 32;

/// Entry of the user table, 1:1 with an object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub header: TableHeader,
    pub class_id: ClassId,
    pub identity: UserIdentity,
}

impl UserEntry {
    /// New entry; the slot id is assigned on reservation
    pub fn new(object_id: ObjectId, class_id: ClassId, identity: UserIdentity) -> Self {
        Self {
            header: TableHeader::new(u32::MAX, object_id, USER_ENTRY_SCHEMA_SIZE),
            class_id,
            identity,
        }
    }

    pub fn raid_group_number(&self) -> Option<u32> {
        match self.identity {
            UserIdentity::RaidGroup {
                raid_group_number, ..
            } => Some(raid_group_number),
            _ => None,
        }
    }
}

// =============================================================================
// Edge Table
// =============================================================================

/// Header, client index, server id, server index, capacity, offset
pub const EDGE_ENTRY_SCHEMA_SIZE: u32 = TABLE_HEADER_SCHEMA_SIZE + 4 + 4 + 4 + 8 + 8;

/// Directed capacity relationship from a client object to a server object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeEntry {
    /// `object_id` is the client (upstream) object
    pub header: TableHeader,
    /// Position among the client's downstream edges
    pub client_index: u32,
    pub server_id: ObjectId,
    /// Upstream slot taken on the server
    pub server_index: u32,
    pub capacity: u64,
    pub offset: u64,
}

impl EdgeEntry {
    pub fn new(
        client: ObjectId,
        client_index: u32,
        server_id: ObjectId,
        server_index: u32,
        capacity: u64,
        offset: u64,
    ) -> Self {
        Self {
            header: TableHeader::new(
                edge_slot(client, client_index) as u32,
                client,
                EDGE_ENTRY_SCHEMA_SIZE,
            ),
            client_index,
            server_id,
            server_index,
            capacity,
            offset,
        }
    }

    pub fn client_id(&self) -> ObjectId {
        self.header.object_id
    }
}

/// Physical edge-table index of `(object, client_index)`
pub fn edge_slot(object_id: ObjectId, client_index: u32) -> usize {
    object_id.index() * MAX_EDGES_PER_OBJECT as usize + client_index as usize
}

// =============================================================================
// Global Info Table
// =============================================================================

/// Kind of a global-info slot; one slot per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalInfoType {
    PowerSave,
    SpareTriggerTime,
    GenerationCounter,
    TimeThreshold,
    EncryptionMode,
    PvdConfig,
}

impl GlobalInfoType {
    pub const ALL: [GlobalInfoType; 6] = [
        GlobalInfoType::PowerSave,
        GlobalInfoType::SpareTriggerTime,
        GlobalInfoType::GenerationCounter,
        GlobalInfoType::TimeThreshold,
        GlobalInfoType::EncryptionMode,
        GlobalInfoType::PvdConfig,
    ];

    pub fn index(&self) -> usize {
        match self {
            GlobalInfoType::PowerSave => 0,
            GlobalInfoType::SpareTriggerTime => 1,
            GlobalInfoType::GenerationCounter => 2,
            GlobalInfoType::TimeThreshold => 3,
            GlobalInfoType::EncryptionMode => 4,
            GlobalInfoType::PvdConfig => 5,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Value written the first time the array comes up
    pub fn default_info(&self) -> GlobalInfo {
        match self {
            GlobalInfoType::PowerSave => GlobalInfo::PowerSave {
                enabled: false,
                idle_time_secs: 1800,
                hibernation_wake_up_minutes: 60 * 24,
            },
            GlobalInfoType::SpareTriggerTime => GlobalInfo::SpareTriggerTime {
                trigger_time_secs: 300,
            },
            GlobalInfoType::GenerationCounter => GlobalInfo::GenerationCounter { next: 1 },
            GlobalInfoType::TimeThreshold => GlobalInfo::TimeThreshold {
                threshold_minutes: 60,
            },
            GlobalInfoType::EncryptionMode => GlobalInfo::EncryptionMode {
                mode: EncryptionMode::Unencrypted,
            },
            GlobalInfoType::PvdConfig => GlobalInfo::PvdConfig {
                background_zeroing: true,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMode {
    Unencrypted,
    Encrypted,
    Rekeying,
}

/// Global-info payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlobalInfo {
    PowerSave {
        enabled: bool,
        idle_time_secs: u64,
        hibernation_wake_up_minutes: u64,
    },
    SpareTriggerTime {
        trigger_time_secs: u64,
    },
    GenerationCounter {
        next: u64,
    },
    TimeThreshold {
        threshold_minutes: u64,
    },
    EncryptionMode {
        mode: EncryptionMode,
    },
    PvdConfig {
        background_zeroing: bool,
    },
}

impl GlobalInfo {
    pub fn info_type(&self) -> GlobalInfoType {
        match self {
            GlobalInfo::PowerSave { .. } => GlobalInfoType::PowerSave,
            GlobalInfo::SpareTriggerTime { .. } => GlobalInfoType::SpareTriggerTime,
            GlobalInfo::GenerationCounter { .. } => GlobalInfoType::GenerationCounter,
            GlobalInfo::TimeThreshold { .. } => GlobalInfoType::TimeThreshold,
            GlobalInfo::EncryptionMode { .. } => GlobalInfoType::EncryptionMode,
            GlobalInfo::PvdConfig { .. } => GlobalInfoType::PvdConfig,
        }
    }
}

/// Header, info type, then the widest payload (power save)
pub const GLOBAL_INFO_SCHEMA_SIZE: u32 = TABLE_HEADER_SCHEMA_SIZE + 4 + 4 + 8 + 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalInfoEntry {
    pub header: TableHeader,
    pub info: GlobalInfo,
}

impl GlobalInfoEntry {
    pub fn new(info: GlobalInfo) -> Self {
        let index = info.info_type().index() as u32;
        Self {
            header: TableHeader::new(index, ObjectId::INVALID, GLOBAL_INFO_SCHEMA_SIZE),
            info,
        }
    }

    pub fn info_type(&self) -> GlobalInfoType {
        self.info.info_type()
    }
}

// =============================================================================
// System Spare Table
// =============================================================================

/// Object id of the first system drive
pub const FIRST_SYSTEM_DRIVE_ID: u32 = 1;

/// Header, trigger time, permanent spare flag padded to 8
pub const SYSTEM_SPARE_SCHEMA_SIZE: u32 = TABLE_HEADER_SCHEMA_SIZE + 8 + 8;

/// Spare-trigger configuration of one system drive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemSpareEntry {
    /// `object_id` is the system drive
    pub header: TableHeader,
    pub trigger_time_secs: u64,
    pub permanent_spare_enabled: bool,
}

impl SystemSpareEntry {
    pub fn new(drive: ObjectId, trigger_time_secs: u64) -> Self {
        Self {
            header: TableHeader::new(
                drive.0.saturating_sub(FIRST_SYSTEM_DRIVE_ID),
                drive,
                SYSTEM_SPARE_SCHEMA_SIZE,
            ),
            trigger_time_secs,
            permanent_spare_enabled: true,
        }
    }
}

// =============================================================================
// Generic Records
// =============================================================================

/// Table an entry lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Object,
    User,
    Edge,
    GlobalInfo,
    SystemSpare,
}

impl TableKind {
    pub fn name(&self) -> &'static str {
        match self {
            TableKind::Object => "object",
            TableKind::User => "user",
            TableKind::Edge => "edge",
            TableKind::GlobalInfo => "global_info",
            TableKind::SystemSpare => "system_spare",
        }
    }
}

/// Address of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKey {
    Object(ObjectId),
    User(u32),
    Edge { object_id: ObjectId, client_index: u32 },
    GlobalInfo(GlobalInfoType),
    SystemSpare(ObjectId),
}

impl EntryKey {
    pub fn table(&self) -> TableKind {
        match self {
            EntryKey::Object(_) => TableKind::Object,
            EntryKey::User(_) => TableKind::User,
            EntryKey::Edge { .. } => TableKind::Edge,
            EntryKey::GlobalInfo(_) => TableKind::GlobalInfo,
            EntryKey::SystemSpare(_) => TableKind::SystemSpare,
        }
    }
}

impl std::fmt::Display for EntryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKey::Object(id) => write!(f, "object {}", id),
            EntryKey::User(entry_id) => write!(f, "user entry {}", entry_id),
            EntryKey::Edge {
                object_id,
                client_index,
            } => write!(f, "edge {}:{}", object_id, client_index),
            EntryKey::GlobalInfo(ty) => write!(f, "global info {:?}", ty),
            EntryKey::SystemSpare(id) => write!(f, "system spare {}", id),
        }
    }
}

/// Any table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryRecord {
    Object(ObjectEntry),
    User(UserEntry),
    Edge(EdgeEntry),
    GlobalInfo(GlobalInfoEntry),
    SystemSpare(SystemSpareEntry),
}

impl EntryRecord {
    pub fn key(&self) -> EntryKey {
        match self {
            EntryRecord::Object(e) => EntryKey::Object(e.header.object_id),
            EntryRecord::User(e) => EntryKey::User(e.header.entry_id),
            EntryRecord::Edge(e) => EntryKey::Edge {
                object_id: e.header.object_id,
                client_index: e.client_index,
            },
            EntryRecord::GlobalInfo(e) => EntryKey::GlobalInfo(e.info_type()),
            EntryRecord::SystemSpare(e) => EntryKey::SystemSpare(e.header.object_id),
        }
    }

    pub fn header(&self) -> &TableHeader {
        match self {
            EntryRecord::Object(e) => &e.header,
            EntryRecord::User(e) => &e.header,
            EntryRecord::Edge(e) => &e.header,
            EntryRecord::GlobalInfo(e) => &e.header,
            EntryRecord::SystemSpare(e) => &e.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut TableHeader {
        match self {
            EntryRecord::Object(e) => &mut e.header,
            EntryRecord::User(e) => &mut e.header,
            EntryRecord::Edge(e) => &mut e.header,
            EntryRecord::GlobalInfo(e) => &mut e.header,
            EntryRecord::SystemSpare(e) => &mut e.header,
        }
    }

    /// Schema size this build compiles for the entry's shape
    pub fn local_schema_size(&self) -> u32 {
        match self {
            EntryRecord::Object(e) => e.class_id.schema_size(),
            EntryRecord::User(_) => USER_ENTRY_SCHEMA_SIZE,
            EntryRecord::Edge(_) => EDGE_ENTRY_SCHEMA_SIZE,
            EntryRecord::GlobalInfo(_) => GLOBAL_INFO_SCHEMA_SIZE,
            EntryRecord::SystemSpare(_) => SYSTEM_SPARE_SCHEMA_SIZE,
        }
    }
}
