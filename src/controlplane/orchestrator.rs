//! Provisioning Orchestrator - The "Brain"
//!
//! Drives raid-group create jobs through the stage machine:
//! - Validate the request against the store and the collaborators
//! - Stage the object graph in a transaction (UpdateInMemory)
//! - Persist and apply the transaction, or roll it back
//! - Optionally wait for the new raid group to become ready (Commit)
//!
//! Also owns store bootstrap and class-wide destroy.

use crate::capacity::geometry::{RaidGeometryServiceRef, StandardRaidGeometry};
use crate::capacity::negotiator::{CapacityNegotiator, RequestedCapacity};
use crate::config::{ControllerRole, PlatformLimits, ServiceConfig, Timeouts};
use crate::controlplane::events::{self, JobNotification};
use crate::controlplane::graph;
use crate::controlplane::job::{
    CreateRaidGroupJob, JobError, JobOutcome, JobStage, JobStatus, RaidGroupJob, StageResult,
};
use crate::controlplane::validate;
use crate::domain::ports::{Collaborators, EventRecord, ObjectId};
use crate::error::{Error, ErrorCode, Result};
use crate::metrics::JobMetrics;
use crate::store::entry::{
    ClassId, EntryKey, EntryRecord, GlobalInfo, GlobalInfoType, SystemSpareEntry,
    FIRST_SYSTEM_DRIVE_ID,
};
use crate::store::tables::{ConfigTableStore, StoreStatus, TableUsage};
use crate::store::transaction::{TransactionId, TransactionManager};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

// =============================================================================
// Generation Sequence
// =============================================================================

/// Source of object generation numbers, seeded from the persisted counter
#[derive(Debug)]
pub struct GenerationSequence {
    next: AtomicU64,
}

impl GenerationSequence {
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start.max(1)),
        }
    }

    /// Continue from the store's generation-counter entry
    pub fn seeded_from(store: &ConfigTableStore) -> Self {
        Self::new(Self::persisted(store).unwrap_or(1))
    }

    fn persisted(store: &ConfigTableStore) -> Option<u64> {
        match store.get_global_info(GlobalInfoType::GenerationCounter)?.info {
            GlobalInfo::GenerationCounter { next } => Some(next),
            _ => None,
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Value the next call to [`next`](Self::next) returns
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }

    /// Never hand out anything below `value`
    pub fn advance_to(&self, value: u64) {
        self.next.fetch_max(value, Ordering::SeqCst);
    }

    /// Catch up with a counter persisted by the peer or a journal replay
    pub fn resync(&self, store: &ConfigTableStore) {
        if let Some(next) = Self::persisted(store) {
            self.advance_to(next);
        }
    }
}

// =============================================================================
// Provision Context
// =============================================================================

/// Everything the stages need, passed explicitly
#[derive(Clone)]
pub struct ProvisionContext {
    pub store: Arc<ConfigTableStore>,
    pub txn: Arc<TransactionManager>,
    pub negotiator: CapacityNegotiator,
    pub collaborators: Collaborators,
    pub limits: PlatformLimits,
    pub timeouts: Timeouts,
    pub controller: ControllerRole,
    pub sequence: Arc<GenerationSequence>,
}

impl ProvisionContext {
    pub fn new(
        txn: Arc<TransactionManager>,
        collaborators: Collaborators,
        config: &ServiceConfig,
    ) -> Self {
        let store = txn.store().clone();
        let sequence = Arc::new(GenerationSequence::seeded_from(&store));
        Self {
            store,
            txn,
            negotiator: CapacityNegotiator::new(Arc::new(StandardRaidGeometry::default())),
            collaborators,
            limits: config.limits.clone(),
            timeouts: config.timeouts.clone(),
            controller: config.controller,
            sequence,
        }
    }

    /// Replace the raid geometry service
    pub fn with_geometry(mut self, geometry: RaidGeometryServiceRef) -> Self {
        self.negotiator = CapacityNegotiator::new(geometry);
        self
    }

    pub fn log_event(&self, record: EventRecord) {
        self.collaborators.events.log_event(record);
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Pipeline driver for raid-group create jobs
pub struct Orchestrator {
    ctx: ProvisionContext,
    notifications: broadcast::Sender<JobNotification>,
    metrics: Arc<JobMetrics>,
    next_job: AtomicU64,
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(ctx: ProvisionContext, metrics: Arc<JobMetrics>) -> Arc<Self> {
        let (notifications, _) = broadcast::channel(256);
        Arc::new(Self {
            ctx,
            notifications,
            metrics,
            next_job: AtomicU64::new(1),
        })
    }

    pub fn context(&self) -> &ProvisionContext {
        &self.ctx
    }

    pub fn store(&self) -> &Arc<ConfigTableStore> {
        &self.ctx.store
    }

    pub fn metrics(&self) -> &Arc<JobMetrics> {
        &self.metrics
    }

    /// Receive a notification for every finished job
    pub fn subscribe(&self) -> broadcast::Receiver<JobNotification> {
        self.notifications.subscribe()
    }

    // =========================================================================
    // Bootstrap
    // =========================================================================

    /// Stage every missing global-info entry and the spare configuration of
    /// each system drive in one transaction. Returns the number of entries
    /// written.
    pub async fn initialize_defaults(&self) -> Result<usize> {
        let txn = self.ctx.txn.begin(0);
        let staged = match self.stage_defaults(txn) {
            Ok(staged) => staged,
            Err(e) => {
                self.abort_quietly(txn);
                return Err(e);
            }
        };

        if staged == 0 {
            self.ctx.txn.abort(txn)?;
            debug!("Configuration defaults already present");
            return Ok(0);
        }

        if let Err(e) = self.ctx.txn.commit(txn).await {
            self.abort_quietly(txn);
            return Err(e);
        }
        self.ctx.sequence.resync(&self.ctx.store);
        info!(entries = staged, "Configuration defaults initialized");
        Ok(staged)
    }

    fn stage_defaults(&self, txn: TransactionId) -> Result<usize> {
        let mut staged = 0;
        while let Some(ty) = self.ctx.txn.stage_create_global_info(txn)? {
            debug!(info_type = ?ty, "Staging global info default");
            staged += 1;
        }

        let trigger_time_secs = match self
            .ctx
            .txn
            .staged_entry(txn, &EntryKey::GlobalInfo(GlobalInfoType::SpareTriggerTime))?
        {
            Some(EntryRecord::GlobalInfo(entry)) => match entry.info {
                GlobalInfo::SpareTriggerTime { trigger_time_secs } => trigger_time_secs,
                _ => 300,
            },
            _ => 300,
        };

        for id in FIRST_SYSTEM_DRIVE_ID..FIRST_SYSTEM_DRIVE_ID + self.ctx.limits.system_drive_count
        {
            let drive = ObjectId(id);
            if self.ctx.store.get_system_spare(drive).is_none() {
                self.ctx.txn.stage_create(
                    txn,
                    EntryRecord::SystemSpare(SystemSpareEntry::new(drive, trigger_time_secs)),
                )?;
                staged += 1;
            }
        }
        Ok(staged)
    }

    fn abort_quietly(&self, txn: TransactionId) {
        if let Err(e) = self.ctx.txn.abort(txn) {
            warn!(txn = %txn, error = %e, "Abort after failure also failed");
        }
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Admit a job, assigning a job number when it has none
    pub fn new_job(&self, mut job: CreateRaidGroupJob) -> RaidGroupJob {
        if job.job_number == 0 {
            job.job_number = self.next_job.fetch_add(1, Ordering::SeqCst);
        } else {
            self.next_job.fetch_max(job.job_number + 1, Ordering::SeqCst);
        }
        self.metrics.record_started();
        info!(
            job_number = job.job_number,
            raid_type = %job.raid_type,
            drive_count = job.drive_count,
            system = job.is_system_rg,
            "Raid group job admitted"
        );
        RaidGroupJob::new(job.job_number, job)
    }

    /// Run a job to completion
    pub async fn create_raid_group(&self, job: CreateRaidGroupJob) -> JobOutcome {
        let job = self.new_job(job);
        self.run(job).await
    }

    /// Step a job until it finishes
    pub async fn run(&self, mut job: RaidGroupJob) -> JobOutcome {
        loop {
            match self.step(&mut job).await {
                Ok(Some(outcome)) => return outcome,
                Ok(None) => continue,
                Err(e) => {
                    error!(job_number = job.job_number(), error = %e, "Job state machine fault");
                    if let Some(txn) = job.request.txn.take() {
                        self.abort_quietly(txn);
                    }
                    let outcome = job.finish(JobStatus::Failed, Some(JobError::from(&e)));
                    self.publish(&outcome);
                    return outcome;
                }
            }
        }
    }

    /// Run the job's current stage once; one scheduler tick
    pub async fn step(&self, job: &mut RaidGroupJob) -> Result<Option<JobOutcome>> {
        let stage = job.stage();
        let started = Instant::now();
        let result = self.run_stage(job).await;
        self.metrics.observe_stage(stage, started.elapsed());

        debug!(job_number = job.job_number(), stage = %stage, result = ?result, "Stage finished");
        job.apply(result)?;

        match job.outcome() {
            Some(outcome) => {
                let outcome = outcome.clone();
                self.publish(&outcome);
                Ok(Some(outcome))
            }
            None => Ok(None),
        }
    }

    /// Execute the current stage and decide what comes next
    pub async fn run_stage(&self, job: &mut RaidGroupJob) -> StageResult {
        match job.stage() {
            JobStage::Validate => self.validate_stage(job).await,
            JobStage::UpdateInMemory => self.update_in_memory_stage(job).await,
            JobStage::Persist => self.persist_stage(job).await,
            JobStage::Rollback => self.rollback_stage(job),
            JobStage::Commit => self.commit_stage(job).await,
        }
    }

    async fn validate_stage(&self, job: &mut RaidGroupJob) -> StageResult {
        match validate::validate(&self.ctx, &mut job.request).await {
            Ok(()) => {
                info!(
                    job_number = job.job_number(),
                    raid_group_number = ?job.request.raid_group_number,
                    "Validation passed"
                );
                StageResult::Advance(JobStage::UpdateInMemory)
            }
            Err(e) => {
                warn!(job_number = job.job_number(), error = %e, "Validation rejected job");
                self.ctx.log_event(events::raid_group_create_failed(
                    job.request.raid_type(),
                    job.request.width(),
                    &e.to_string(),
                ));
                StageResult::Terminal(job.finish(JobStatus::Failed, Some(JobError::from(&e))))
            }
        }
    }

    async fn update_in_memory_stage(&self, job: &mut RaidGroupJob) -> StageResult {
        match graph::update_in_memory(&self.ctx, &mut job.request).await {
            Ok(()) => {
                info!(
                    job_number = job.job_number(),
                    raid_group_id = ?job.request.raid_group_id,
                    member_capacity = job.request.member_capacity,
                    "Object graph staged"
                );
                StageResult::Advance(JobStage::Persist)
            }
            Err(e) => {
                warn!(job_number = job.job_number(), error = %e, "Staging object graph failed");
                StageResult::Rollback(JobError::from(&e))
            }
        }
    }

    async fn persist_stage(&self, job: &mut RaidGroupJob) -> StageResult {
        let Some(txn) = job.request.txn else {
            return StageResult::Rollback(JobError::from(Error::Internal(
                "persist without a staged transaction".into(),
            )));
        };
        match self.ctx.txn.commit(txn).await {
            Ok(record) => {
                job.request.txn = None;
                self.metrics
                    .set_active_transactions(self.ctx.txn.active_count());
                info!(
                    job_number = job.job_number(),
                    txn = %txn,
                    entries = record.ops.len(),
                    "Raid group persisted"
                );
                StageResult::Advance(JobStage::Commit)
            }
            Err(e) => {
                warn!(job_number = job.job_number(), txn = %txn, error = %e, "Persist failed");
                StageResult::Rollback(JobError::from(&e))
            }
        }
    }

    fn rollback_stage(&self, job: &mut RaidGroupJob) -> StageResult {
        let failure = job.failure().cloned().unwrap_or_else(|| {
            JobError::from(Error::Internal("rollback without a recorded failure".into()))
        });

        if let Some(txn) = job.request.txn.take() {
            match self.ctx.txn.abort(txn) {
                Ok(()) => info!(job_number = job.job_number(), txn = %txn, "Staged graph discarded"),
                Err(e) => {
                    error!(
                        job_number = job.job_number(),
                        txn = %txn,
                        error = %e,
                        "CRITICAL: rollback failed; configuration may be inconsistent"
                    );
                    self.ctx
                        .log_event(events::rollback_failed(job.job_number(), &e.to_string()));
                }
            }
        }
        self.metrics
            .set_active_transactions(self.ctx.txn.active_count());

        let raid_type = job.request.raid_type();
        let width = job.request.width();
        if failure.code == ErrorCode::InsufficientCapacity {
            let requested = match job.request.job.capacity {
                RequestedCapacity::Exact(blocks) => blocks,
                RequestedCapacity::Unspecified => 0,
            };
            self.ctx
                .log_event(events::insufficient_capacity(raid_type, width, requested));
        }
        self.ctx
            .log_event(events::raid_group_create_failed(raid_type, width, &failure.message));

        error!(
            job_number = job.job_number(),
            code = %failure.code,
            "Raid group create rolled back"
        );
        StageResult::Terminal(job.finish(JobStatus::Failed, Some(failure)))
    }

    async fn commit_stage(&self, job: &mut RaidGroupJob) -> StageResult {
        let Some(raid_group) = job.request.raid_group_id else {
            return StageResult::Terminal(job.finish(
                JobStatus::Completed,
                Some(JobError::from(Error::Internal("committed without a raid group".into()))),
            ));
        };
        self.ctx.log_event(events::raid_group_created(
            raid_group,
            job.request.raid_type(),
            job.request.width(),
        ));

        let Some(timeout) = job.request.job.ready_timeout(&self.ctx.timeouts) else {
            info!(job_number = job.job_number(), raid_group = %raid_group, "Raid group created");
            return StageResult::Terminal(job.finish(JobStatus::Completed, None));
        };

        match self.wait_ready(raid_group, timeout).await {
            Ok(()) => {
                info!(job_number = job.job_number(), raid_group = %raid_group, "Raid group ready");
                StageResult::Terminal(job.finish(JobStatus::Completed, None))
            }
            Err(e) => {
                // the raid group stays configured; only the wait is reported
                warn!(job_number = job.job_number(), raid_group = %raid_group, error = %e, "Raid group not ready");
                StageResult::Terminal(job.finish(JobStatus::Completed, Some(JobError::from(&e))))
            }
        }
    }

    async fn wait_ready(&self, object_id: ObjectId, timeout: Duration) -> Result<()> {
        let lifecycle = &self.ctx.collaborators.lifecycle;
        let deadline = Instant::now() + timeout;
        loop {
            match lifecycle.lifecycle_state(object_id).await {
                Ok(state) if state.is_usable() => return Ok(()),
                Ok(state) if state.is_terminal() => {
                    return Err(Error::Collaborator {
                        service: "lifecycle".into(),
                        reason: format!("raid group {} entered {}", object_id, state),
                    })
                }
                Ok(_) => {}
                Err(e) => debug!(object_id = %object_id, error = %e, "Lifecycle poll failed"),
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    what: format!("raid group {} to become ready", object_id),
                });
            }
            tokio::time::sleep(self.ctx.timeouts.ready_poll_interval()).await;
        }
    }

    fn publish(&self, outcome: &JobOutcome) {
        self.metrics.record_outcome(outcome);
        // no subscribers is fine
        let _ = self.notifications.send(JobNotification::from(outcome));
    }

    // =========================================================================
    // Class Destroy
    // =========================================================================

    /// Destroy every object of a class and remove its entries, edges and user
    /// entries in one transaction
    pub async fn destroy_all_objects_of_class(&self, class_id: ClassId) -> Result<Vec<ObjectId>> {
        let destroyed = self
            .ctx
            .store
            .destroy_all_objects_of_class(
                class_id,
                self.ctx.collaborators.lifecycle.as_ref(),
                &self.ctx.timeouts,
            )
            .await?;
        if destroyed.is_empty() {
            return Ok(destroyed);
        }

        let mut keys = Vec::new();
        let mut seen = HashSet::new();
        for id in &destroyed {
            let edges = self
                .ctx
                .store
                .edges_of(*id)
                .into_iter()
                .chain(self.ctx.store.find_upstream_edges(*id));
            for edge in edges {
                let key = EntryKey::Edge {
                    object_id: edge.client_id(),
                    client_index: edge.client_index,
                };
                if seen.insert(key) {
                    keys.push(key);
                }
            }
            if let Some(user) = self.ctx.store.user_entry_for_object(*id) {
                keys.push(EntryKey::User(user.header.entry_id));
            }
            keys.push(EntryKey::Object(*id));
        }

        let txn = self.ctx.txn.begin(0);
        for key in keys {
            if let Err(e) = self.ctx.txn.stage_destroy(txn, key) {
                self.abort_quietly(txn);
                return Err(e);
            }
        }
        if let Err(e) = self.ctx.txn.commit(txn).await {
            self.abort_quietly(txn);
            return Err(e);
        }

        info!(class = %class_id, count = destroyed.len(), "Objects of class removed");
        Ok(destroyed)
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Get overall orchestrator status
    pub fn status(&self) -> OrchestratorStatus {
        let store = &self.ctx.store;
        let store_status = store.status();
        let raid_groups = store.raid_group_numbers().len() as u64;
        OrchestratorStatus {
            healthy: store_status == StoreStatus::Ready,
            store: store_status,
            controller: self.ctx.controller,
            raid_groups,
            user_raid_groups: store.count_user_raid_groups() as u64,
            active_transactions: self.ctx.txn.active_count() as u64,
            jobs_started: self.metrics.jobs_started(),
            jobs_completed: self.metrics.jobs_completed(),
            jobs_failed: self.metrics.jobs_failed(),
            next_generation: self.ctx.sequence.peek(),
            tables: store.usage(),
        }
    }
}

/// Orchestrator status summary
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    pub healthy: bool,
    pub store: StoreStatus,
    pub controller: ControllerRole,
    pub raid_groups: u64,
    pub user_raid_groups: u64,
    pub active_transactions: u64,
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub next_generation: u64,
    pub tables: Vec<TableUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{DriveSpec, InMemoryArray};
    use crate::capacity::geometry::RaidType;
    use crate::domain::ports::{DriveLocation, LifecycleState};
    use crate::store::journal::MemoryJournal;

    async fn setup() -> (Arc<Orchestrator>, Arc<InMemoryArray>, Arc<MemoryJournal>) {
        let config = ServiceConfig {
            timeouts: Timeouts::fast(),
            ..Default::default()
        };
        let store = Arc::new(ConfigTableStore::with_limits(&config.limits).unwrap());
        let journal = Arc::new(MemoryJournal::new());
        let txn = Arc::new(TransactionManager::new(store.clone(), journal.clone()));
        let array = InMemoryArray::new(store.clone());
        let ctx = ProvisionContext::new(txn, array.collaborators(), &config);
        let orchestrator = Orchestrator::new(ctx, Arc::new(JobMetrics::new().unwrap()));
        orchestrator.initialize_defaults().await.unwrap();
        (orchestrator, array, journal)
    }

    async fn add_drives(
        orchestrator: &Orchestrator,
        array: &InMemoryArray,
        slots: std::ops::Range<u32>,
    ) -> Vec<DriveLocation> {
        let mut locations = Vec::new();
        for slot in slots {
            let location = DriveLocation::new(0, 0, slot);
            array
                .add_drive(&orchestrator.context().txn, DriveSpec::new(location, 0x10000))
                .await
                .unwrap();
            locations.push(location);
        }
        locations
    }

    #[test]
    fn test_generation_sequence() {
        let sequence = GenerationSequence::new(5);
        assert_eq!(sequence.next(), 5);
        assert_eq!(sequence.peek(), 6);
        sequence.advance_to(3);
        assert_eq!(sequence.peek(), 6);
        sequence.advance_to(10);
        assert_eq!(sequence.next(), 10);
    }

    #[tokio::test]
    async fn test_initialize_defaults_is_idempotent() {
        let (orchestrator, _array, _journal) = setup().await;
        let store = orchestrator.store();
        for ty in GlobalInfoType::ALL {
            assert!(store.get_global_info(ty).is_some(), "missing {:?}", ty);
        }
        assert!(store.get_system_spare(ObjectId(FIRST_SYSTEM_DRIVE_ID)).is_some());
        assert_eq!(orchestrator.initialize_defaults().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_notifies_and_counts() {
        let (orchestrator, array, _journal) = setup().await;
        let drives = add_drives(&orchestrator, &array, 4..7).await;
        let mut notifications = orchestrator.subscribe();

        let outcome = orchestrator
            .create_raid_group(CreateRaidGroupJob::new(RaidType::Raid5, drives))
            .await;
        assert!(outcome.is_completed(), "{:?}", outcome);

        let notification = notifications.recv().await.unwrap();
        assert_eq!(notification.job_number, outcome.job_number);
        assert_eq!(notification.object_id, outcome.object_id);
        assert_eq!(notification.error_code, None);

        let status = orchestrator.status();
        assert_eq!(status.user_raid_groups, 1);
        assert_eq!(status.jobs_completed, 1);
        assert_eq!(status.active_transactions, 0);
    }

    #[tokio::test]
    async fn test_stepwise_history() {
        let (orchestrator, array, _journal) = setup().await;
        let drives = add_drives(&orchestrator, &array, 4..6).await;

        let mut job = orchestrator.new_job(CreateRaidGroupJob::new(RaidType::Raid1, drives));
        let mut ticks = 0;
        while orchestrator.step(&mut job).await.unwrap().is_none() {
            ticks += 1;
        }
        assert_eq!(ticks, 3);
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

    #[tokio::test]
    async fn test_persist_failure_rolls_back() {
        let (orchestrator, array, journal) = setup().await;
        let drives = add_drives(&orchestrator, &array, 4..7).await;
        let before = orchestrator.store().usage();
        journal.fail_writes(true);

        let outcome = orchestrator
            .create_raid_group(CreateRaidGroupJob::new(RaidType::Raid5, drives))
            .await;
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.error_code(), Some(ErrorCode::PersistFailed));
        assert_eq!(orchestrator.context().txn.active_count(), 0);

        let after = orchestrator.store().usage();
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.valid, a.valid, "{} table changed", a.table);
            assert_eq!(a.uncommitted, 0);
        }
    }

    #[tokio::test]
    async fn test_commit_wait_timeout_keeps_raid_group() {
        let (orchestrator, array, _journal) = setup().await;
        let drives = add_drives(&orchestrator, &array, 4..7).await;
        array.set_default_new_object_state(LifecycleState::Activate);

        let outcome = orchestrator
            .create_raid_group(
                CreateRaidGroupJob::new(RaidType::Raid5, drives)
                    .wait_until_ready(Some(Duration::from_millis(30))),
            )
            .await;
        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.error_code(), Some(ErrorCode::Timeout));
        let id = outcome.object_id.unwrap();
        assert!(orchestrator.store().get_entry_by_id(id).is_some());
    }

    #[tokio::test]
    async fn test_destroy_all_virtual_drives() {
        let (orchestrator, array, _journal) = setup().await;
        let drives = add_drives(&orchestrator, &array, 4..6).await;
        let outcome = orchestrator
            .create_raid_group(CreateRaidGroupJob::new(RaidType::Raid1, drives))
            .await;
        assert!(outcome.is_completed());

        let destroyed = orchestrator
            .destroy_all_objects_of_class(ClassId::VirtualDrive)
            .await
            .unwrap();
        assert_eq!(destroyed.len(), 2);
        let store = orchestrator.store();
        assert!(store.objects_of_class(ClassId::VirtualDrive).is_empty());
        for id in destroyed {
            assert!(store.find_upstream_edges(id).is_empty());
            assert!(store.edges_of(id).is_empty());
        }
    }
}
