//! Service Configuration
//!
//! Platform limits, bounded-wait timings and standalone fixtures, loaded
//! from YAML. Every field has a default so an empty document is valid.

use crate::domain::ports::{DriveLocation, DriveType};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Platform Limits
// =============================================================================

/// Platform figures the table store is sized from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlatformLimits {
    /// Maximum number of drive FRUs in the array
    pub max_fru_count: u32,
    /// Maximum raid groups (user and system)
    pub max_raid_groups: u32,
    /// Maximum user-created raid groups
    pub max_user_raid_groups: u32,
    /// Maximum LUNs
    pub max_luns: u32,
    /// Maximum extent pools
    pub max_extent_pools: u32,
    /// Object ids below this value are never handed out by general allocation
    pub reserved_system_objects: u32,
    /// Number of system drives (object ids 1..=system_drive_count)
    pub system_drive_count: u32,
    /// Floor for the object table size
    pub min_object_table_size: u32,
    /// Hard ceiling on topology objects for this platform
    pub topology_object_ceiling: u32,
}

impl Default for PlatformLimits {
    fn default() -> Self {
        Self {
            max_fru_count: 120,
            max_raid_groups: 64,
            max_user_raid_groups: 56,
            max_luns: 256,
            max_extent_pools: 8,
            reserved_system_objects: 0x100,
            system_drive_count: 4,
            min_object_table_size: 512,
            topology_object_ceiling: 4096,
        }
    }
}

// =============================================================================
// Timeouts
// =============================================================================

/// Bounds for every poll-sleep wait in the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Timeouts {
    /// How long Validate waits for a provision drive to become ready
    pub pvd_ready_timeout_ms: u64,
    pub pvd_ready_poll_interval_ms: u64,
    pub destroy_poll_interval_ms: u64,
    pub destroy_poll_retries: u32,
    pub ready_poll_interval_ms: u64,
    /// Commit wait used when a job asks to wait without giving a timeout
    pub default_commit_timeout_ms: u64,
    pub replication_ack_timeout_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            pvd_ready_timeout_ms: 30_000,
            pvd_ready_poll_interval_ms: 100,
            destroy_poll_interval_ms: 200,
            destroy_poll_retries: 100,
            ready_poll_interval_ms: 100,
            default_commit_timeout_ms: 120_000,
            replication_ack_timeout_ms: 5_000,
        }
    }
}

impl Timeouts {
    pub fn pvd_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.pvd_ready_timeout_ms)
    }

    pub fn pvd_ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pvd_ready_poll_interval_ms)
    }

    pub fn destroy_poll_interval(&self) -> Duration {
        Duration::from_millis(self.destroy_poll_interval_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn default_commit_timeout(&self) -> Duration {
        Duration::from_millis(self.default_commit_timeout_ms)
    }

    pub fn replication_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.replication_ack_timeout_ms)
    }

    /// Millisecond-scale timings for tests
    pub fn fast() -> Self {
        Self {
            pvd_ready_timeout_ms: 200,
            pvd_ready_poll_interval_ms: 5,
            destroy_poll_interval_ms: 5,
            destroy_poll_retries: 10,
            ready_poll_interval_ms: 5,
            default_commit_timeout_ms: 500,
            replication_ack_timeout_ms: 500,
        }
    }
}

// =============================================================================
// Standalone Fixture
// =============================================================================

/// A drive served by the in-memory collaborators in standalone mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandaloneDrive {
    pub location: DriveLocation,
    pub capacity_blocks: u64,
    #[serde(default = "default_drive_type")]
    pub drive_type: DriveType,
}

fn default_drive_type() -> DriveType {
    DriveType::Sas
}

/// Fixture for running without array hardware
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StandaloneConfig {
    pub drives: Vec<StandaloneDrive>,
}

// =============================================================================
// Service Configuration
// =============================================================================

/// Which half of the controller pair this process runs as
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerRole {
    #[default]
    Active,
    Passive,
}

impl std::fmt::Display for ControllerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerRole::Active => write!(f, "active"),
            ControllerRole::Passive => write!(f, "passive"),
        }
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceConfig {
    pub limits: PlatformLimits,
    pub timeouts: Timeouts,
    pub controller: ControllerRole,
    /// Mirror commits to an in-process peer store (standalone mode)
    pub peer_replication: bool,
    /// Append-only commit journal; in-memory when unset
    pub journal_path: Option<PathBuf>,
    /// fsync every journal append
    pub journal_sync: bool,
    pub standalone: StandaloneConfig,
}

impl ServiceConfig {
    /// Load configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.limits.reserved_system_objects, 0x100);
        assert_eq!(config.timeouts.pvd_ready_timeout(), Duration::from_secs(30));
        assert_eq!(config.timeouts.destroy_poll_retries, 100);
        assert!(config.journal_path.is_none());
        assert_eq!(config.controller, ControllerRole::Active);
    }

    #[test]
    fn test_empty_document() {
        let config = ServiceConfig::from_yaml("").unwrap();
        assert_eq!(config.limits.max_fru_count, 120);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "limits:\n  maxFruCount: 30\n  topologyObjectCeiling: 2048\n\
             timeouts:\n  pvdReadyTimeoutMs: 1000\n\
             controller: passive\n\
             standalone:\n  drives:\n    - location: {{ bus: 0, enclosure: 0, slot: 4 }}\n      capacityBlocks: 65536\n"
        )
        .unwrap();

        let config = ServiceConfig::load(file.path()).unwrap();
        assert_eq!(config.limits.max_fru_count, 30);
        assert_eq!(config.limits.max_luns, 256);
        assert_eq!(config.timeouts.pvd_ready_timeout_ms, 1000);
        assert_eq!(config.controller, ControllerRole::Passive);
        assert_eq!(config.standalone.drives.len(), 1);
        assert_eq!(config.standalone.drives[0].drive_type, DriveType::Sas);
        assert_eq!(config.standalone.drives[0].location.slot, 4);
    }

    #[test]
    fn test_invalid_yaml() {
        let result = ServiceConfig::from_yaml("limits: [1, 2");
        assert!(result.is_err());
    }
}
