//! Provisioning Control Plane
//!
//! Drives create-raid-group jobs through their stages and exposes them over
//! the API.

pub mod api;
pub mod events;
pub mod graph;
pub mod job;
pub mod orchestrator;
pub mod validate;

pub use api::*;
pub use job::{CreateRaidGroupJob, JobOutcome, JobStage, JobStatus, RaidGroupJob};
pub use orchestrator::*;
