//! Raid Group Jobs
//!
//! The create-raid-group job payload, the working request the stages fill
//! in, and the explicit stage machine the orchestrator drives:
//!
//! ```text
//! Validate ──► UpdateInMemory ──► Persist ──► Commit ──► Completed
//!    │               │               │
//!    │               └──► Rollback ◄─┘
//!    ▼                       │
//!  Failed ◄──────────────────┘
//! ```

use crate::capacity::geometry::{RaidGeometry, RaidType};
use crate::capacity::negotiator::{MemberPlacement, RequestedCapacity};
use crate::config::Timeouts;
use crate::domain::ports::{DriveInfo, DriveLocation, ObjectId, PslRegion};
use crate::error::{Error, ErrorCategory, ErrorCode, Result};
use crate::store::transaction::TransactionId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Job Payload
// =============================================================================

fn default_capacity() -> RequestedCapacity {
    RequestedCapacity::Unspecified
}

/// Request to create one raid group
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRaidGroupJob {
    /// Assigned by the orchestrator when zero
    #[serde(default)]
    pub job_number: u64,
    pub raid_type: RaidType,
    /// Lowest unused number is assigned when absent
    #[serde(default)]
    pub raid_group_number: Option<u32>,
    pub drive_count: u32,
    #[serde(default)]
    pub is_system_rg: bool,
    #[serde(default = "default_capacity")]
    pub capacity: RequestedCapacity,
    pub drives: Vec<DriveLocation>,
    #[serde(default)]
    pub power_saving_enabled: bool,
    #[serde(default)]
    pub power_saving_idle_secs: u64,
    #[serde(default)]
    pub max_raid_latency_secs: u64,
    /// Block in Commit until the raid group is ready
    #[serde(default)]
    pub wait_ready: bool,
    #[serde(default)]
    pub ready_timeout_ms: Option<u64>,
}

impl CreateRaidGroupJob {
    /// User raid group consuming everything the drives offer
    pub fn new(raid_type: RaidType, drives: Vec<DriveLocation>) -> Self {
        Self {
            job_number: 0,
            raid_type,
            raid_group_number: None,
            drive_count: drives.len() as u32,
            is_system_rg: false,
            capacity: RequestedCapacity::Unspecified,
            drives,
            power_saving_enabled: false,
            power_saving_idle_secs: 0,
            max_raid_latency_secs: 0,
            wait_ready: false,
            ready_timeout_ms: None,
        }
    }

    /// Array-internal raid group described by the private-space layout
    pub fn system(raid_group_number: u32, raid_type: RaidType, drives: Vec<DriveLocation>) -> Self {
        Self {
            raid_group_number: Some(raid_group_number),
            is_system_rg: true,
            ..Self::new(raid_type, drives)
        }
    }

    pub fn with_raid_group_number(mut self, number: u32) -> Self {
        self.raid_group_number = Some(number);
        self
    }

    pub fn with_capacity(mut self, blocks: u64) -> Self {
        self.capacity = RequestedCapacity::Exact(blocks);
        self
    }

    pub fn with_drive_count(mut self, count: u32) -> Self {
        self.drive_count = count;
        self
    }

    pub fn wait_until_ready(mut self, timeout: Option<Duration>) -> Self {
        self.wait_ready = true;
        self.ready_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    /// Bound of the Commit wait, if the job waits at all
    pub fn ready_timeout(&self, timeouts: &Timeouts) -> Option<Duration> {
        if !self.wait_ready {
            return None;
        }
        Some(
            self.ready_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| timeouts.default_commit_timeout()),
        )
    }
}

// =============================================================================
// Working Request
// =============================================================================

/// Everything the stages resolve and decide for one job
#[derive(Debug, Clone)]
pub struct RaidGroupCreateRequest {
    pub job: CreateRaidGroupJob,
    pub job_number: u64,
    /// Requested or auto-assigned
    pub raid_group_number: Option<u32>,
    pub pvd_ids: Vec<ObjectId>,
    pub pd_ids: Vec<ObjectId>,
    pub drive_infos: Vec<DriveInfo>,
    pub vd_ids: Vec<ObjectId>,
    /// Private mirrors of a RAID10 group
    pub mirror_ids: Vec<ObjectId>,
    pub psl_region: Option<PslRegion>,
    pub geometry: Option<RaidGeometry>,
    /// Edges of the top-level raid group object
    pub placements: Vec<MemberPlacement>,
    pub member_capacity: u64,
    pub txn: Option<TransactionId>,
    pub raid_group_id: Option<ObjectId>,
    pub error_code: Option<ErrorCode>,
}

impl RaidGroupCreateRequest {
    pub fn new(job_number: u64, job: CreateRaidGroupJob) -> Self {
        Self {
            raid_group_number: job.raid_group_number,
            job,
            job_number,
            pvd_ids: Vec::new(),
            pd_ids: Vec::new(),
            drive_infos: Vec::new(),
            vd_ids: Vec::new(),
            mirror_ids: Vec::new(),
            psl_region: None,
            geometry: None,
            placements: Vec::new(),
            member_capacity: 0,
            txn: None,
            raid_group_id: None,
            error_code: None,
        }
    }

    pub fn raid_type(&self) -> RaidType {
        self.job.raid_type
    }

    pub fn width(&self) -> u32 {
        self.job.drive_count
    }
}

// =============================================================================
// Stages
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Validate,
    UpdateInMemory,
    Persist,
    Rollback,
    Commit,
}

impl JobStage {
    /// Next stage on success, if the pipeline continues
    pub fn next(&self) -> Option<JobStage> {
        match self {
            JobStage::Validate => Some(JobStage::UpdateInMemory),
            JobStage::UpdateInMemory => Some(JobStage::Persist),
            JobStage::Persist => Some(JobStage::Commit),
            JobStage::Rollback | JobStage::Commit => None,
        }
    }

    /// Whether a failure here must discard staged state
    pub fn can_roll_back(&self) -> bool {
        matches!(self, JobStage::UpdateInMemory | JobStage::Persist)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Validate => "validate",
            JobStage::UpdateInMemory => "update_in_memory",
            JobStage::Persist => "persist",
            JobStage::Rollback => "rollback",
            JobStage::Commit => "commit",
        }
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Structured failure carried by a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub message: String,
}

impl From<&Error> for JobError {
    fn from(e: &Error) -> Self {
        Self {
            code: e.code(),
            category: e.category(),
            message: e.to_string(),
        }
    }
}

impl From<Error> for JobError {
    fn from(e: Error) -> Self {
        Self::from(&e)
    }
}

/// Final result of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub job_number: u64,
    pub status: JobStatus,
    pub object_id: Option<ObjectId>,
    pub raid_group_number: Option<u32>,
    /// Set on failure, and on a completed job whose ready wait timed out
    pub error: Option<JobError>,
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == JobStatus::Completed
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

/// What a stage decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageResult {
    Advance(JobStage),
    Rollback(JobError),
    Terminal(JobOutcome),
}

// =============================================================================
// Job State Machine
// =============================================================================

/// One job moving through the pipeline
#[derive(Debug, Clone)]
pub struct RaidGroupJob {
    pub request: RaidGroupCreateRequest,
    stage: JobStage,
    failure: Option<JobError>,
    history: Vec<JobStage>,
    outcome: Option<JobOutcome>,
}

impl RaidGroupJob {
    pub fn new(job_number: u64, job: CreateRaidGroupJob) -> Self {
        Self {
            request: RaidGroupCreateRequest::new(job_number, job),
            stage: JobStage::Validate,
            failure: None,
            history: vec![JobStage::Validate],
            outcome: None,
        }
    }

    pub fn job_number(&self) -> u64 {
        self.request.job_number
    }

    pub fn stage(&self) -> JobStage {
        self.stage
    }

    /// Failure that sent the job to Rollback
    pub fn failure(&self) -> Option<&JobError> {
        self.failure.as_ref()
    }

    /// Stages entered so far, in order
    pub fn history(&self) -> &[JobStage] {
        &self.history
    }

    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// Apply a stage result, refusing transitions the pipeline does not have
    pub fn apply(&mut self, result: StageResult) -> Result<()> {
        if self.is_finished() {
            return Err(Error::Internal(format!(
                "job {} already finished",
                self.job_number()
            )));
        }
        match result {
            StageResult::Advance(next) => {
                if self.stage.next() != Some(next) {
                    return Err(Error::Internal(format!(
                        "job {} cannot advance from {} to {}",
                        self.job_number(),
                        self.stage,
                        next
                    )));
                }
                self.enter(next);
            }
            StageResult::Rollback(error) => {
                if !self.stage.can_roll_back() {
                    return Err(Error::Internal(format!(
                        "job {} cannot roll back from {}",
                        self.job_number(),
                        self.stage
                    )));
                }
                self.request.error_code = Some(error.code);
                self.failure = Some(error);
                self.enter(JobStage::Rollback);
            }
            StageResult::Terminal(outcome) => {
                if self.stage.can_roll_back() {
                    return Err(Error::Internal(format!(
                        "job {} cannot finish from {}",
                        self.job_number(),
                        self.stage
                    )));
                }
                if let Some(error) = &outcome.error {
                    self.request.error_code = Some(error.code);
                }
                self.outcome = Some(outcome);
            }
        }
        Ok(())
    }

    fn enter(&mut self, stage: JobStage) {
        self.stage = stage;
        self.history.push(stage);
    }

    /// Outcome of a job that ended in `status`
    pub fn finish(&self, status: JobStatus, error: Option<JobError>) -> JobOutcome {
        JobOutcome {
            job_number: self.job_number(),
            status,
            object_id: match status {
                JobStatus::Completed => self.request.raid_group_id,
                JobStatus::Failed => None,
            },
            raid_group_number: self.request.raid_group_number,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn job() -> RaidGroupJob {
        let drives = (0..3).map(|slot| DriveLocation::new(0, 0, slot)).collect();
        RaidGroupJob::new(7, CreateRaidGroupJob::new(RaidType::Raid5, drives))
    }

    fn failure() -> JobError {
        JobError::from(Error::InsufficientCapacity {
            requested: 10,
            available: 0,
        })
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = job();
        job.apply(StageResult::Advance(JobStage::UpdateInMemory)).unwrap();
        job.apply(StageResult::Advance(JobStage::Persist)).unwrap();
        job.apply(StageResult::Advance(JobStage::Commit)).unwrap();
        let outcome = job.finish(JobStatus::Completed, None);
        job.apply(StageResult::Terminal(outcome)).unwrap();

        assert!(job.is_finished());
        assert_eq!(
            job.history(),
            &[
                JobStage::Validate,
                JobStage::UpdateInMemory,
                JobStage::Persist,
                JobStage::Commit
            ]
        );
    }

    #[test]
    fn test_rollback_only_from_staging_stages() {
        let mut job = job();
        assert_matches!(job.apply(StageResult::Rollback(failure())), Err(Error::Internal(_)));

        job.apply(StageResult::Advance(JobStage::UpdateInMemory)).unwrap();
        job.apply(StageResult::Rollback(failure())).unwrap();
        assert_eq!(job.stage(), JobStage::Rollback);
        assert_eq!(job.request.error_code, Some(ErrorCode::InsufficientCapacity));
        assert_eq!(job.failure().map(|f| f.category), Some(ErrorCategory::Capacity));

        // rollback can only end the job
        assert_matches!(
            job.apply(StageResult::Advance(JobStage::Commit)),
            Err(Error::Internal(_))
        );
        let outcome = job.finish(JobStatus::Failed, Some(failure()));
        job.apply(StageResult::Terminal(outcome)).unwrap();
        assert!(job.outcome().unwrap().object_id.is_none());
    }

    #[test]
    fn test_no_skipping_stages() {
        let mut job = job();
        assert_matches!(
            job.apply(StageResult::Advance(JobStage::Commit)),
            Err(Error::Internal(_))
        );
        job.apply(StageResult::Advance(JobStage::UpdateInMemory)).unwrap();
        let outcome = job.finish(JobStatus::Completed, None);
        assert_matches!(job.apply(StageResult::Terminal(outcome)), Err(Error::Internal(_)));
    }

    #[test]
    fn test_job_payload_defaults() {
        let job: CreateRaidGroupJob = serde_json::from_str(
            r#"{"raidType":"raid10","driveCount":4,"drives":[
                {"bus":0,"enclosure":0,"slot":4},{"bus":0,"enclosure":0,"slot":5},
                {"bus":0,"enclosure":0,"slot":6},{"bus":0,"enclosure":0,"slot":7}]}"#,
        )
        .unwrap();
        assert_eq!(job.raid_type, RaidType::Raid10);
        assert_eq!(job.capacity, RequestedCapacity::Unspecified);
        assert!(!job.is_system_rg);
        assert_eq!(job.ready_timeout(&Timeouts::default()), None);

        let waiting = job.wait_until_ready(None);
        assert_eq!(
            waiting.ready_timeout(&Timeouts::default()),
            Some(Timeouts::default().default_commit_timeout())
        );
    }
}
