//! Error types for the array control plane
//!
//! Provides structured error types for the configuration table store,
//! transaction manager, capacity negotiator and provisioning pipeline, plus
//! the structured job error codes reported to callers.

use crate::domain::ports::ObjectId;
use crate::store::entry::EntryState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for the control plane
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Table Store Errors
    // =========================================================================
    #[error("Table size {required} exceeds topology object ceiling {ceiling}")]
    TableSizeExceeded { required: usize, ceiling: usize },

    #[error("Table store is not ready: {0}")]
    StoreNotReady(String),

    #[error("Table store is in service mode: {reason}")]
    ServiceMode { reason: String },

    #[error("No free entry in {table} table")]
    TableFull { table: &'static str },

    #[error("Entry index {index} out of range for {table} table")]
    EntryIndexOutOfRange { table: &'static str, index: usize },

    #[error("Invalid entry state transition {from:?} -> {to:?} in {table} table")]
    InvalidStateTransition {
        table: &'static str,
        from: EntryState,
        to: EntryState,
    },

    #[error("Stale handle for {table} entry {index}")]
    StaleEntryHandle { table: &'static str, index: usize },

    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    #[error("Entry {0} is held by a commit in flight")]
    EntryBusy(String),

    #[error("Malformed entry {key}: {reason}")]
    MalformedEntry { key: String, reason: String },

    #[error("Edge limit reached on object {object_id}")]
    EdgeLimitReached { object_id: ObjectId },

    #[error("Objects still present after destroy: {object_ids:?}")]
    DestroyTimeout { object_ids: Vec<ObjectId> },

    // =========================================================================
    // Transaction Errors
    // =========================================================================
    #[error("Transaction not found: {0}")]
    TransactionNotFound(u64),

    #[error("Transaction {txn_id} conflicts with a concurrent commit: {detail}")]
    TransactionConflict { txn_id: u64, detail: String },

    #[error("Persistence failed: {0}")]
    PersistFailed(String),

    #[error("Peer replication failed: {0}")]
    ReplicationFailed(String),

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Invalid raid type: {0}")]
    InvalidRaidType(String),

    #[error("Invalid drive count {count} for {raid_type}: allowed {min}..={max}")]
    InvalidDriveCount {
        raid_type: String,
        count: u32,
        min: u32,
        max: u32,
    },

    #[error("Duplicate provision drive {object_id} in request")]
    DuplicatePvd { object_id: ObjectId },

    #[error("No drive at location {location}")]
    DriveNotFound { location: String },

    #[error("Provision drive {object_id} is not usable: {reason}")]
    BadPvdConfiguration { object_id: ObjectId, reason: String },

    #[error("Provision drive {object_id} is end-of-life")]
    DriveEndOfLife { object_id: ObjectId },

    #[error("Provision drive {object_id} is configured as a spare")]
    PvdConfiguredAsSpare { object_id: ObjectId },

    #[error("Incompatible drive types: {first} does not accept {other}")]
    IncompatibleDriveTypes { first: String, other: String },

    #[error("Incompatible block sizes: {first} vs {other}")]
    IncompatibleBlockSize { first: u32, other: u32 },

    #[error("Raid group number {0} is already in use")]
    RaidGroupIdInUse(u32),

    #[error("Object {object_id} already has upstream edges")]
    RequestObjectHasUpstreamEdges { object_id: ObjectId },

    #[error("System raid group definition mismatch: {0}")]
    SystemRgMismatch(String),

    // =========================================================================
    // Capacity Errors
    // =========================================================================
    #[error("Insufficient capacity: requested {requested} blocks, available {available} blocks")]
    InsufficientCapacity { requested: u64, available: u64 },

    #[error("Invalid capacity: {0}")]
    InvalidCapacity(String),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("Raid group limit of {limit} reached")]
    RaidGroupCountExceeded { limit: u32 },

    #[error("System raid group {raid_group_number} is double degraded")]
    SystemRgDoubleDegraded { raid_group_number: u32 },

    #[error("Timed out waiting for {what}")]
    Timeout { what: String },

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    #[error("Object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("Collaborator {service} failed: {reason}")]
    Collaborator { service: String, reason: String },

    // =========================================================================
    // API / Parse Errors
    // =========================================================================
    #[error("API request validation failed: {0}")]
    ApiValidation(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Structured Job Error Codes
// =============================================================================

/// Failure category a job error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Capacity,
    Configuration,
    System,
    SchemaVersion,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::Capacity => write!(f, "capacity"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::System => write!(f, "system"),
            ErrorCategory::SchemaVersion => write!(f, "schema_version"),
        }
    }
}

/// Error code reported with every failed job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRaidType,
    InvalidDriveCount,
    DuplicatePvd,
    DriveNotFound,
    BadPvdConfiguration,
    DriveEndOfLife,
    PvdConfiguredAsSpare,
    IncompatibleDriveTypes,
    IncompatibleBlockSize,
    RaidGroupIdInUse,
    RequestObjectHasUpstreamEdges,
    InsufficientCapacity,
    InvalidCapacity,
    SystemRgMismatch,
    InternalError,
    PersistFailed,
    RaidGroupCountExceeded,
    ObjectCountExceeded,
    SystemRgDoubleDegraded,
    Timeout,
    TransactionConflict,
    ServiceMode,
}

impl ErrorCode {
    /// Category this code is reported under
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorCode::InvalidRaidType
            | ErrorCode::InvalidDriveCount
            | ErrorCode::DuplicatePvd
            | ErrorCode::DriveNotFound
            | ErrorCode::BadPvdConfiguration
            | ErrorCode::DriveEndOfLife
            | ErrorCode::PvdConfiguredAsSpare
            | ErrorCode::IncompatibleDriveTypes
            | ErrorCode::IncompatibleBlockSize
            | ErrorCode::RaidGroupIdInUse
            | ErrorCode::RequestObjectHasUpstreamEdges => ErrorCategory::Validation,

            ErrorCode::InsufficientCapacity | ErrorCode::InvalidCapacity => {
                ErrorCategory::Capacity
            }

            ErrorCode::SystemRgMismatch | ErrorCode::InternalError | ErrorCode::PersistFailed => {
                ErrorCategory::Configuration
            }

            ErrorCode::RaidGroupCountExceeded
            | ErrorCode::ObjectCountExceeded
            | ErrorCode::SystemRgDoubleDegraded
            | ErrorCode::Timeout
            | ErrorCode::TransactionConflict => ErrorCategory::System,

            ErrorCode::ServiceMode => ErrorCategory::SchemaVersion,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error {
    /// Map this error to the structured code reported to job callers
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidRaidType(_) => ErrorCode::InvalidRaidType,
            Error::InvalidDriveCount { .. } => ErrorCode::InvalidDriveCount,
            Error::DuplicatePvd { .. } => ErrorCode::DuplicatePvd,
            Error::DriveNotFound { .. } => ErrorCode::DriveNotFound,
            Error::BadPvdConfiguration { .. } => ErrorCode::BadPvdConfiguration,
            Error::DriveEndOfLife { .. } => ErrorCode::DriveEndOfLife,
            Error::PvdConfiguredAsSpare { .. } => ErrorCode::PvdConfiguredAsSpare,
            Error::IncompatibleDriveTypes { .. } => ErrorCode::IncompatibleDriveTypes,
            Error::IncompatibleBlockSize { .. } => ErrorCode::IncompatibleBlockSize,
            Error::RaidGroupIdInUse(_) => ErrorCode::RaidGroupIdInUse,
            Error::RequestObjectHasUpstreamEdges { .. } => {
                ErrorCode::RequestObjectHasUpstreamEdges
            }
            Error::SystemRgMismatch(_) => ErrorCode::SystemRgMismatch,

            Error::InsufficientCapacity { .. } => ErrorCode::InsufficientCapacity,
            Error::InvalidCapacity(_) => ErrorCode::InvalidCapacity,

            Error::RaidGroupCountExceeded { .. } => ErrorCode::RaidGroupCountExceeded,
            Error::TableFull { .. }
            | Error::TableSizeExceeded { .. }
            | Error::EdgeLimitReached { .. } => ErrorCode::ObjectCountExceeded,
            Error::SystemRgDoubleDegraded { .. } => ErrorCode::SystemRgDoubleDegraded,
            Error::Timeout { .. } | Error::DestroyTimeout { .. } => ErrorCode::Timeout,

            Error::PersistFailed(_) => ErrorCode::PersistFailed,
            Error::TransactionConflict { .. } => ErrorCode::TransactionConflict,
            Error::ServiceMode { .. } => ErrorCode::ServiceMode,

            _ => ErrorCode::InternalError,
        }
    }

    /// Category of this error
    pub fn category(&self) -> ErrorCategory {
        self.code().category()
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. }
                | Error::DestroyTimeout { .. }
                | Error::TransactionConflict { .. }
                | Error::EntryBusy(_)
                | Error::PersistFailed(_)
                | Error::Collaborator { .. }
        )
    }
}

/// Result type alias for the control plane
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = Error::DuplicatePvd {
            object_id: ObjectId(7),
        };
        assert_eq!(err.code(), ErrorCode::DuplicatePvd);
        assert_eq!(err.category(), ErrorCategory::Validation);

        let err = Error::InsufficientCapacity {
            requested: 1000,
            available: 0,
        };
        assert_eq!(err.category(), ErrorCategory::Capacity);

        let err = Error::TableFull { table: "object" };
        assert_eq!(err.code(), ErrorCode::ObjectCountExceeded);
        assert_eq!(err.category(), ErrorCategory::System);

        let err = Error::ServiceMode {
            reason: "newer schema".into(),
        };
        assert_eq!(err.category(), ErrorCategory::SchemaVersion);

        let err = Error::Collaborator {
            service: "topology".into(),
            reason: "down".into(),
        };
        assert_eq!(err.code(), ErrorCode::InternalError);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::Timeout {
            what: "raid group ready".into(),
        };
        assert!(transient.is_retryable());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!Error::RaidGroupIdInUse(3).is_retryable());
    }
}
