//! Domain Ports - Collaborator trait definitions for the control plane
//!
//! These traits define the boundaries between the configuration database /
//! provisioning pipeline and the rest of the array. Adapters implement these
//! traits to provide concrete functionality.

use crate::capacity::extent::ObjectExtents;
use crate::capacity::geometry::RaidType;
use crate::error::Result;
use crate::store::transaction::CommitRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Object Identity
// =============================================================================

/// Identifier of a configured object; doubles as its object-table index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u32);

impl ObjectId {
    /// Sentinel returned by resolvers on a miss
    pub const INVALID: ObjectId = ObjectId(u32::MAX);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Physical location of a drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DriveLocation {
    pub bus: u32,
    pub enclosure: u32,
    pub slot: u32,
}

impl DriveLocation {
    pub fn new(bus: u32, enclosure: u32, slot: u32) -> Self {
        Self {
            bus,
            enclosure,
            slot,
        }
    }
}

impl std::fmt::Display for DriveLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}_{}", self.bus, self.enclosure, self.slot)
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Operational state of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Specialize,
    Activate,
    Ready,
    Hibernate,
    Fail,
    Destroy,
}

impl LifecycleState {
    /// Ready or Hibernate: can take a new consumer
    pub fn is_usable(&self) -> bool {
        matches!(self, LifecycleState::Ready | LifecycleState::Hibernate)
    }

    /// Fail or Destroy: will not become usable by waiting
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Fail | LifecycleState::Destroy)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Specialize => write!(f, "specialize"),
            LifecycleState::Activate => write!(f, "activate"),
            LifecycleState::Ready => write!(f, "ready"),
            LifecycleState::Hibernate => write!(f, "hibernate"),
            LifecycleState::Fail => write!(f, "fail"),
            LifecycleState::Destroy => write!(f, "destroy"),
        }
    }
}

// =============================================================================
// Drive Information
// =============================================================================

/// Drive media type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveType {
    SasFlashHe,
    SasFlashMe,
    SasFlashLe,
    SasFlashRi,
    SataFlash,
    Sas,
    NlSas,
    Sata,
    Unknown,
}

/// Performance tier used for drive-mix compatibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceTier {
    Flash,
    Performance,
    Capacity,
    Unknown,
}

impl DriveType {
    pub fn tier(&self) -> PerformanceTier {
        match self {
            DriveType::SasFlashHe
            | DriveType::SasFlashMe
            | DriveType::SasFlashLe
            | DriveType::SasFlashRi
            | DriveType::SataFlash => PerformanceTier::Flash,
            DriveType::Sas => PerformanceTier::Performance,
            DriveType::NlSas | DriveType::Sata => PerformanceTier::Capacity,
            DriveType::Unknown => PerformanceTier::Unknown,
        }
    }
}

impl PerformanceTier {
    /// Whether a raid group anchored on this tier may include `other`
    pub fn accepts(&self, other: DriveType) -> bool {
        match self {
            PerformanceTier::Unknown => false,
            tier => *tier == other.tier(),
        }
    }
}

impl std::fmt::Display for DriveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriveType::SasFlashHe => write!(f, "sas-flash-he"),
            DriveType::SasFlashMe => write!(f, "sas-flash-me"),
            DriveType::SasFlashLe => write!(f, "sas-flash-le"),
            DriveType::SasFlashRi => write!(f, "sas-flash-ri"),
            DriveType::SataFlash => write!(f, "sata-flash"),
            DriveType::Sas => write!(f, "sas"),
            DriveType::NlSas => write!(f, "nl-sas"),
            DriveType::Sata => write!(f, "sata"),
            DriveType::Unknown => write!(f, "unknown"),
        }
    }
}

/// How a provision drive is currently configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PvdConfigType {
    Unconsumed,
    RaidGroup,
    HotSpare,
    Special,
}

/// Characteristics of a provision drive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveInfo {
    pub drive_type: DriveType,
    /// Block size the drive is formatted with (520, 4160, ...)
    pub configured_block_size: u32,
    pub end_of_life: bool,
    pub config_type: PvdConfigType,
    pub serial_number: String,
    pub imported_capacity: u64,
    pub exported_capacity: u64,
}

// =============================================================================
// Private Space Layout
// =============================================================================

/// Static description of an array-internal raid group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PslRegion {
    pub raid_group_number: u32,
    pub object_id: ObjectId,
    pub raid_type: RaidType,
    pub width: u32,
    /// Capacity consumed on each member drive
    pub capacity: u64,
    pub starting_offset: u64,
    pub exported_capacity: u64,
    /// Member provision drives in position order
    pub drives: Vec<ObjectId>,
}

// =============================================================================
// Event Log
// =============================================================================

/// Event-log message identifiers; the text catalog lives elsewhere
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventMessage {
    RaidGroupCreated,
    RaidGroupCreateFailed,
    InsufficientCapacity,
    IncompatibleDriveTypes,
    IncompatibleBlockSize,
    PvdNotReady,
    RollbackFailed,
    DestroyTimeout,
    ServiceModeEntered,
}

impl EventMessage {
    /// Numeric message id used by the catalog
    pub fn id(&self) -> u32 {
        match self {
            EventMessage::RaidGroupCreated => 0x0068_0001,
            EventMessage::RaidGroupCreateFailed => 0x0068_0002,
            EventMessage::InsufficientCapacity => 0x0068_0003,
            EventMessage::IncompatibleDriveTypes => 0x0068_0004,
            EventMessage::IncompatibleBlockSize => 0x0068_0005,
            EventMessage::PvdNotReady => 0x0068_0006,
            EventMessage::RollbackFailed => 0x0068_8001,
            EventMessage::DestroyTimeout => 0x0068_8002,
            EventMessage::ServiceModeEntered => 0x0068_8003,
        }
    }
}

/// Severity of an event-log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Positional argument of an event-log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventArg {
    Location(DriveLocation),
    SerialNumber(String),
    ObjectId(ObjectId),
    RaidType(RaidType),
    DriveCount(u32),
    Capacity(u64),
    Text(String),
}

/// A structured event-log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub message: EventMessage,
    pub severity: EventSeverity,
    pub args: Vec<EventArg>,
}

// =============================================================================
// Topology / Drive-Info Ports
// =============================================================================

/// Port resolving physical locations to object ids
#[async_trait]
pub trait TopologyResolver: Send + Sync {
    /// Provision drive at a location
    async fn provision_drive_by_location(&self, location: DriveLocation) -> Result<ObjectId>;

    /// Physical drive at a location
    async fn physical_drive_by_location(&self, location: DriveLocation) -> Result<ObjectId>;
}

/// Port reporting provision drive characteristics
#[async_trait]
pub trait DriveInfoService: Send + Sync {
    async fn drive_info(&self, pvd: ObjectId) -> Result<DriveInfo>;
}

// =============================================================================
// Block Transport / Lifecycle Ports
// =============================================================================

/// Port reporting the capacity layout of live objects
#[async_trait]
pub trait BlockTransport: Send + Sync {
    /// Capacity, default offset and consumed extents of an object
    async fn object_extents(&self, object_id: ObjectId) -> Result<ObjectExtents>;
}

/// Port exposing object lifecycle
#[async_trait]
pub trait LifecycleService: Send + Sync {
    async fn lifecycle_state(&self, object_id: ObjectId) -> Result<LifecycleState>;

    /// Ask an object to destroy itself; completion is observed by polling
    async fn request_destroy(&self, object_id: ObjectId) -> Result<()>;

    async fn object_exists(&self, object_id: ObjectId) -> Result<bool>;
}

// =============================================================================
// Layout / Event / Persistence Ports
// =============================================================================

/// Port describing the static private-space layout
pub trait PrivateSpaceLayout: Send + Sync {
    fn system_raid_group(&self, raid_group_number: u32) -> Option<PslRegion>;
}

/// Fire-and-forget event log
pub trait EventSink: Send + Sync {
    fn log_event(&self, record: EventRecord);
}

/// Durable write of committed transactions
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    async fn persist(&self, record: &CommitRecord) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type TopologyResolverRef = Arc<dyn TopologyResolver>;
pub type DriveInfoServiceRef = Arc<dyn DriveInfoService>;
pub type BlockTransportRef = Arc<dyn BlockTransport>;
pub type LifecycleServiceRef = Arc<dyn LifecycleService>;
pub type PrivateSpaceLayoutRef = Arc<dyn PrivateSpaceLayout>;
pub type EventSinkRef = Arc<dyn EventSink>;
pub type PersistenceBackendRef = Arc<dyn PersistenceBackend>;

/// Bundle of every collaborator the pipeline talks to
#[derive(Clone)]
pub struct Collaborators {
    pub topology: TopologyResolverRef,
    pub drive_info: DriveInfoServiceRef,
    pub transport: BlockTransportRef,
    pub lifecycle: LifecycleServiceRef,
    pub layout: PrivateSpaceLayoutRef,
    pub events: EventSinkRef,
}
