//! Job Events
//!
//! Notifications broadcast when a job finishes, and the event-log entries
//! the pipeline writes for operators.

use crate::capacity::geometry::RaidType;
use crate::controlplane::job::{JobOutcome, JobStatus};
use crate::domain::ports::{
    DriveLocation, EventArg, EventMessage, EventRecord, EventSeverity, ObjectId,
};
use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};

/// State-change notification sent on both commit and rollback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobNotification {
    pub object_id: Option<ObjectId>,
    pub job_number: u64,
    pub status: JobStatus,
    pub error_code: Option<ErrorCode>,
}

impl From<&JobOutcome> for JobNotification {
    fn from(outcome: &JobOutcome) -> Self {
        Self {
            object_id: outcome.object_id,
            job_number: outcome.job_number,
            status: outcome.status,
            error_code: outcome.error_code(),
        }
    }
}

// =============================================================================
// Event-Log Entries
// =============================================================================

pub fn raid_group_created(object_id: ObjectId, raid_type: RaidType, width: u32) -> EventRecord {
    EventRecord {
        message: EventMessage::RaidGroupCreated,
        severity: EventSeverity::Info,
        args: vec![
            EventArg::ObjectId(object_id),
            EventArg::RaidType(raid_type),
            EventArg::DriveCount(width),
        ],
    }
}

pub fn raid_group_create_failed(raid_type: RaidType, width: u32, reason: &str) -> EventRecord {
    EventRecord {
        message: EventMessage::RaidGroupCreateFailed,
        severity: EventSeverity::Error,
        args: vec![
            EventArg::RaidType(raid_type),
            EventArg::DriveCount(width),
            EventArg::Text(reason.to_string()),
        ],
    }
}

pub fn insufficient_capacity(raid_type: RaidType, width: u32, requested: u64) -> EventRecord {
    EventRecord {
        message: EventMessage::InsufficientCapacity,
        severity: EventSeverity::Warning,
        args: vec![
            EventArg::RaidType(raid_type),
            EventArg::DriveCount(width),
            EventArg::Capacity(requested),
        ],
    }
}

pub fn incompatible_drive_types(
    raid_type: RaidType,
    width: u32,
    first: DriveLocation,
    other: DriveLocation,
) -> EventRecord {
    EventRecord {
        message: EventMessage::IncompatibleDriveTypes,
        severity: EventSeverity::Warning,
        args: vec![
            EventArg::RaidType(raid_type),
            EventArg::DriveCount(width),
            EventArg::Location(first),
            EventArg::Location(other),
        ],
    }
}

pub fn incompatible_block_size(
    raid_type: RaidType,
    width: u32,
    location: DriveLocation,
    serial_number: &str,
) -> EventRecord {
    EventRecord {
        message: EventMessage::IncompatibleBlockSize,
        severity: EventSeverity::Warning,
        args: vec![
            EventArg::RaidType(raid_type),
            EventArg::DriveCount(width),
            EventArg::Location(location),
            EventArg::SerialNumber(serial_number.to_string()),
        ],
    }
}

pub fn pvd_not_ready(location: DriveLocation, pvd: ObjectId) -> EventRecord {
    EventRecord {
        message: EventMessage::PvdNotReady,
        severity: EventSeverity::Warning,
        args: vec![EventArg::Location(location), EventArg::ObjectId(pvd)],
    }
}

pub fn rollback_failed(job_number: u64, reason: &str) -> EventRecord {
    EventRecord {
        message: EventMessage::RollbackFailed,
        severity: EventSeverity::Critical,
        args: vec![
            EventArg::Text(format!("job {}", job_number)),
            EventArg::Text(reason.to_string()),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::job::JobError;
    use crate::error::Error;

    #[test]
    fn test_notification_from_outcome() {
        let outcome = JobOutcome {
            job_number: 3,
            status: JobStatus::Failed,
            object_id: None,
            raid_group_number: Some(2),
            error: Some(JobError::from(Error::RaidGroupIdInUse(2))),
        };
        let notification = JobNotification::from(&outcome);
        assert_eq!(notification.job_number, 3);
        assert_eq!(notification.error_code, Some(ErrorCode::RaidGroupIdInUse));

        let json = serde_json::to_value(&notification).unwrap();
        assert_eq!(json["errorCode"], "raid_group_id_in_use");
    }

    #[test]
    fn test_incompatible_types_event_args() {
        let event = incompatible_drive_types(
            RaidType::Raid5,
            5,
            DriveLocation::new(0, 0, 4),
            DriveLocation::new(0, 0, 8),
        );
        assert_eq!(event.message.id(), EventMessage::IncompatibleDriveTypes.id());
        assert!(event.args.contains(&EventArg::RaidType(RaidType::Raid5)));
        assert!(event.args.contains(&EventArg::DriveCount(5)));
    }
}
