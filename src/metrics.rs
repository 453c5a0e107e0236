//! Job Metrics
//!
//! Prometheus counters and histograms for the provisioning pipeline, kept
//! on a private registry so several orchestrators can coexist in one
//! process.

use crate::controlplane::job::{JobOutcome, JobStage, JobStatus};
use crate::error::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

pub struct JobMetrics {
    registry: Registry,
    jobs_started: IntCounter,
    jobs_completed: IntCounter,
    jobs_failed: IntCounterVec,
    ready_timeouts: IntCounter,
    stage_duration: HistogramVec,
    active_transactions: IntGauge,
}

impl JobMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let jobs_started = IntCounter::new(
            "array_raid_group_jobs_started_total",
            "Raid group create jobs started",
        )?;
        let jobs_completed = IntCounter::new(
            "array_raid_group_jobs_completed_total",
            "Raid group create jobs completed",
        )?;
        let jobs_failed = IntCounterVec::new(
            Opts::new(
                "array_raid_group_jobs_failed_total",
                "Raid group create jobs failed, by error category",
            ),
            &["category"],
        )?;
        let ready_timeouts = IntCounter::new(
            "array_raid_group_ready_timeouts_total",
            "Committed raid groups that did not reach ready in time",
        )?;
        let stage_duration = HistogramVec::new(
            HistogramOpts::new(
                "array_raid_group_stage_duration_seconds",
                "Duration of each pipeline stage",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["stage"],
        )?;
        let active_transactions = IntGauge::new(
            "array_config_active_transactions",
            "Transactions staged but not yet committed or aborted",
        )?;

        registry.register(Box::new(jobs_started.clone()))?;
        registry.register(Box::new(jobs_completed.clone()))?;
        registry.register(Box::new(jobs_failed.clone()))?;
        registry.register(Box::new(ready_timeouts.clone()))?;
        registry.register(Box::new(stage_duration.clone()))?;
        registry.register(Box::new(active_transactions.clone()))?;

        Ok(Self {
            registry,
            jobs_started,
            jobs_completed,
            jobs_failed,
            ready_timeouts,
            stage_duration,
            active_transactions,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_started(&self) {
        self.jobs_started.inc();
    }

    pub fn record_outcome(&self, outcome: &JobOutcome) {
        match (outcome.status, &outcome.error) {
            (JobStatus::Completed, None) => self.jobs_completed.inc(),
            (JobStatus::Completed, Some(_)) => {
                self.jobs_completed.inc();
                self.ready_timeouts.inc();
            }
            (JobStatus::Failed, error) => {
                let category = error
                    .as_ref()
                    .map(|e| e.category.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                self.jobs_failed.with_label_values(&[&category]).inc();
            }
        }
    }

    pub fn observe_stage(&self, stage: JobStage, elapsed: Duration) {
        self.stage_duration
            .with_label_values(&[stage.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn set_active_transactions(&self, count: usize) {
        self.active_transactions.set(count as i64);
    }

    pub fn jobs_started(&self) -> u64 {
        self.jobs_started.get()
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed.get()
    }

    /// Failed jobs across every category
    pub fn jobs_failed(&self) -> u64 {
        self.registry
            .gather()
            .iter()
            .filter(|family| family.get_name() == "array_raid_group_jobs_failed_total")
            .flat_map(|family| family.get_metric().iter())
            .map(|metric| metric.get_counter().get_value() as u64)
            .sum()
    }

    /// Text exposition of every metric
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::job::JobError;
    use crate::error::Error;

    #[test]
    fn test_outcome_counters() {
        let metrics = JobMetrics::new().unwrap();
        metrics.record_started();
        metrics.record_started();
        metrics.record_outcome(&JobOutcome {
            job_number: 1,
            status: JobStatus::Completed,
            object_id: None,
            raid_group_number: Some(0),
            error: None,
        });
        metrics.record_outcome(&JobOutcome {
            job_number: 2,
            status: JobStatus::Failed,
            object_id: None,
            raid_group_number: None,
            error: Some(JobError::from(Error::InvalidRaidType("raid7".into()))),
        });
        metrics.observe_stage(JobStage::Validate, Duration::from_millis(3));

        assert_eq!(metrics.jobs_started(), 2);
        assert_eq!(metrics.jobs_completed(), 1);
        assert_eq!(metrics.jobs_failed(), 1);

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("array_raid_group_jobs_failed_total{category=\"validation\"} 1"));
        assert!(text.contains("stage=\"validate\""));
    }
}
