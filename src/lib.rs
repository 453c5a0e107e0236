//! Array Control Plane
//!
//! Replicated object-configuration database and raid-group provisioning
//! engine for a dual-controller storage array.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        REST API / Metrics                            │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                  Raid Group Provisioning Orchestrator                │
//! │   Validate ──► UpdateInMemory ──► Persist ──► Commit (or Rollback)   │
//! ├───────────────────────────────┬──────────────────────────────────────┤
//! │     Capacity Negotiator       │        Transaction Manager           │
//! │  (geometry, extent fitting)   │  (staging, journal, peer replicate)  │
//! ├───────────────────────────────┴──────────────────────────────────────┤
//! │                      Config Table Store                              │
//! │     object │ user │ edge │ global info │ system spare tables         │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                     Collaborator Ports                               │
//! │  topology │ drive info │ block transport │ lifecycle │ layout │ events│
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`store`]: Configuration tables and transactions
//! - [`capacity`]: Raid geometry and extent negotiation
//! - [`controlplane`]: Create-raid-group jobs and the API
//! - [`adapters`]: In-memory collaborators for standalone operation
//! - [`domain`]: Identity types and collaborator ports
//! - [`error`]: Error types and handling

pub mod adapters;
pub mod capacity;
pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod store;

// Re-export commonly used types
pub use controlplane::{
    ApiServer, ApiServerConfig, CreateRaidGroupJob, JobOutcome, JobStatus, Orchestrator,
    OrchestratorStatus, ProvisionContext,
};

pub use capacity::{CapacityNegotiator, RaidType, RequestedCapacity};

pub use config::{ControllerRole, PlatformLimits, ServiceConfig, Timeouts};

pub use domain::ports::{Collaborators, DriveLocation, ObjectId};

pub use error::{Error, ErrorCategory, ErrorCode, Result};

pub use metrics::JobMetrics;

pub use store::{ConfigTableStore, FileJournal, MemoryJournal, TransactionManager};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
