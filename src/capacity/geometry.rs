//! RAID Geometry
//!
//! Raid types, the object class each one is built from, and the arithmetic
//! that turns a member capacity into an exported capacity and back.

use crate::error::{Error, Result};
use crate::store::entry::ClassId;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

// =============================================================================
// Constants
// =============================================================================

/// Maximum members of one raid group
pub const MAX_DISK_ARRAY_WIDTH: u32 = 16;

/// Blocks per element
pub const DEFAULT_ELEMENT_SIZE: u32 = 128;

/// Elements per parity stripe for parity types
pub const DEFAULT_ELEMENTS_PER_PARITY: u32 = 8;

/// Data blocks covered by one block of paged metadata
pub const METADATA_RATIO: u64 = 1024;

// =============================================================================
// Raid Type
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaidType {
    Raid0,
    Raid1,
    Raid3,
    Raid5,
    Raid6,
    Raid10,
    /// Array-internal mirror of the system drives
    RawMirror,
    #[serde(other)]
    Unknown,
}

impl RaidType {
    /// Allowed drive count, inclusive
    pub fn width_limits(&self) -> Option<(u32, u32)> {
        match self {
            RaidType::Raid0 => Some((1, MAX_DISK_ARRAY_WIDTH)),
            RaidType::Raid1 | RaidType::RawMirror => Some((2, 3)),
            RaidType::Raid3 | RaidType::Raid5 => Some((3, MAX_DISK_ARRAY_WIDTH)),
            RaidType::Raid6 => Some((4, MAX_DISK_ARRAY_WIDTH)),
            RaidType::Raid10 => Some((2, MAX_DISK_ARRAY_WIDTH)),
            RaidType::Unknown => None,
        }
    }

    /// Whether `width` drives can form this type
    pub fn check_width(&self, width: u32) -> Result<()> {
        let (min, max) = self
            .width_limits()
            .ok_or_else(|| Error::InvalidRaidType(self.to_string()))?;
        let even_ok = *self != RaidType::Raid10 || width % 2 == 0;
        if width < min || width > max || !even_ok {
            return Err(Error::InvalidDriveCount {
                raid_type: self.to_string(),
                count: width,
                min,
                max,
            });
        }
        Ok(())
    }

    /// Object class of the top-level raid group object
    pub fn group_class(&self) -> Option<ClassId> {
        match self {
            RaidType::Raid0 | RaidType::Raid10 => Some(ClassId::Striper),
            RaidType::Raid1 | RaidType::RawMirror => Some(ClassId::Mirror),
            RaidType::Raid3 | RaidType::Raid5 | RaidType::Raid6 => Some(ClassId::Parity),
            RaidType::Unknown => None,
        }
    }

    pub fn parity_count(&self) -> u32 {
        match self {
            RaidType::Raid3 | RaidType::Raid5 => 1,
            RaidType::Raid6 => 2,
            _ => 0,
        }
    }

    pub fn is_parity(&self) -> bool {
        self.parity_count() > 0
    }

    /// Downstream edges of the top-level object for `width` drives
    pub fn member_count(&self, width: u32) -> u32 {
        match self {
            RaidType::Raid10 => width / 2,
            _ => width,
        }
    }

    /// Members whose capacity counts towards the exported capacity
    pub fn data_members(&self, width: u32) -> u32 {
        match self {
            RaidType::Raid0 => width,
            RaidType::Raid10 => width / 2,
            RaidType::Raid1 | RaidType::RawMirror => 1,
            RaidType::Raid3 | RaidType::Raid5 | RaidType::Raid6 => {
                width.saturating_sub(self.parity_count())
            }
            RaidType::Unknown => 0,
        }
    }

    /// Types a user job may request
    pub fn is_user_creatable(&self) -> bool {
        !matches!(self, RaidType::RawMirror | RaidType::Unknown)
    }

    pub fn elements_per_parity(&self) -> u32 {
        if self.is_parity() {
            DEFAULT_ELEMENTS_PER_PARITY
        } else {
            1
        }
    }
}

impl std::fmt::Display for RaidType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaidType::Raid0 => write!(f, "raid0"),
            RaidType::Raid1 => write!(f, "raid1"),
            RaidType::Raid3 => write!(f, "raid3"),
            RaidType::Raid5 => write!(f, "raid5"),
            RaidType::Raid6 => write!(f, "raid6"),
            RaidType::Raid10 => write!(f, "raid10"),
            RaidType::RawMirror => write!(f, "raw_mirror"),
            RaidType::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for RaidType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "raid0" | "r0" => Ok(RaidType::Raid0),
            "raid1" | "r1" => Ok(RaidType::Raid1),
            "raid3" | "r3" => Ok(RaidType::Raid3),
            "raid5" | "r5" => Ok(RaidType::Raid5),
            "raid6" | "r6" => Ok(RaidType::Raid6),
            "raid10" | "r10" | "raid1_0" => Ok(RaidType::Raid10),
            "raw_mirror" => Ok(RaidType::RawMirror),
            other => Err(Error::InvalidRaidType(other.to_string())),
        }
    }
}

// =============================================================================
// Geometry
// =============================================================================

/// Capacity layout of one raid group layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaidGeometry {
    pub raid_type: RaidType,
    pub width: u32,
    pub element_size: u32,
    pub elements_per_parity: u32,
    /// User data stored on each member
    pub data_per_member: u64,
    /// Capacity consumed on each member, data plus metadata
    pub imported_per_member: u64,
    pub exported_capacity: u64,
}

/// Raid-class capacity arithmetic
pub trait RaidGeometryService: Send + Sync {
    /// Geometry needed to export at least `exported` blocks
    fn top_down(&self, raid_type: RaidType, width: u32, exported: u64) -> Result<RaidGeometry>;

    /// Largest geometry that fits `available_per_member` on each member
    fn bottom_up(
        &self,
        raid_type: RaidType,
        width: u32,
        available_per_member: u64,
    ) -> Result<RaidGeometry>;
}

pub type RaidGeometryServiceRef = Arc<dyn RaidGeometryService>;

/// Chunk-aligned data with paged metadata on every member
#[derive(Debug, Clone)]
pub struct StandardRaidGeometry {
    pub element_size: u32,
}

impl Default for StandardRaidGeometry {
    fn default() -> Self {
        Self {
            element_size: DEFAULT_ELEMENT_SIZE,
        }
    }
}

fn round_up(value: u64, align: u64) -> Option<u64> {
    value.div_ceil(align).checked_mul(align)
}

fn too_large(what: &str, value: u64) -> Error {
    Error::InvalidCapacity(format!("{} {} overflows the block address space", what, value))
}

impl StandardRaidGeometry {
    /// Alignment of per-member data
    pub fn chunk(&self, raid_type: RaidType) -> u64 {
        self.element_size as u64 * raid_type.elements_per_parity() as u64
    }

    /// Metadata blocks needed on a member holding `data` blocks
    pub fn metadata_size(&self, raid_type: RaidType, data: u64) -> Result<u64> {
        round_up(data.div_ceil(METADATA_RATIO), self.chunk(raid_type))
            .ok_or_else(|| too_large("metadata for", data))
    }

    /// Data plus metadata on one member
    fn member_footprint(&self, raid_type: RaidType, data: u64) -> Result<u64> {
        data.checked_add(self.metadata_size(raid_type, data)?)
            .ok_or_else(|| too_large("member data", data))
    }

    fn build(
        &self,
        raid_type: RaidType,
        width: u32,
        data_per_member: u64,
    ) -> Result<RaidGeometry> {
        let exported_capacity = data_per_member
            .checked_mul(raid_type.data_members(width) as u64)
            .ok_or_else(|| too_large("member data", data_per_member))?;
        Ok(RaidGeometry {
            raid_type,
            width,
            element_size: self.element_size,
            elements_per_parity: raid_type.elements_per_parity(),
            data_per_member,
            imported_per_member: self.member_footprint(raid_type, data_per_member)?,
            exported_capacity,
        })
    }
}

impl RaidGeometryService for StandardRaidGeometry {
    fn top_down(&self, raid_type: RaidType, width: u32, exported: u64) -> Result<RaidGeometry> {
        raid_type.check_width(width)?;
        if exported == 0 {
            return Err(Error::InvalidCapacity("exported capacity must be non-zero".into()));
        }
        let data_members = raid_type.data_members(width) as u64;
        let data = round_up(exported.div_ceil(data_members), self.chunk(raid_type))
            .ok_or_else(|| too_large("exported capacity", exported))?;
        self.build(raid_type, width, data)
    }

    fn bottom_up(
        &self,
        raid_type: RaidType,
        width: u32,
        available_per_member: u64,
    ) -> Result<RaidGeometry> {
        raid_type.check_width(width)?;
        let chunk = self.chunk(raid_type);

        // largest chunk count whose data plus metadata still fits
        let (mut lo, mut hi) = (0u64, available_per_member / chunk);
        while lo < hi {
            let mid = lo + (hi - lo).div_ceil(2);
            let fits = self
                .member_footprint(raid_type, mid * chunk)
                .is_ok_and(|footprint| footprint <= available_per_member);
            if fits {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }

        if lo == 0 {
            return Err(Error::InsufficientCapacity {
                requested: self.member_footprint(raid_type, chunk)?,
                available: available_per_member,
            });
        }
        self.build(raid_type, width, lo * chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_width_limits() {
        assert!(RaidType::Raid5.check_width(3).is_ok());
        assert!(RaidType::Raid5.check_width(16).is_ok());
        assert_matches!(
            RaidType::Raid5.check_width(2),
            Err(Error::InvalidDriveCount { min: 3, max: 16, .. })
        );
        assert_matches!(RaidType::Raid6.check_width(17), Err(Error::InvalidDriveCount { .. }));
        assert_matches!(RaidType::Raid10.check_width(5), Err(Error::InvalidDriveCount { .. }));
        assert!(RaidType::Raid10.check_width(4).is_ok());
        assert_matches!(RaidType::Unknown.check_width(4), Err(Error::InvalidRaidType(_)));
    }

    #[test]
    fn test_parse_and_classes() {
        assert_eq!("RAID5".parse::<RaidType>().unwrap(), RaidType::Raid5);
        assert_eq!("r10".parse::<RaidType>().unwrap(), RaidType::Raid10);
        assert!("raid7".parse::<RaidType>().is_err());

        assert_eq!(RaidType::Raid10.group_class(), Some(ClassId::Striper));
        assert_eq!(RaidType::Raid1.group_class(), Some(ClassId::Mirror));
        assert_eq!(RaidType::Raid6.group_class(), Some(ClassId::Parity));
        assert_eq!(RaidType::Raid10.member_count(6), 3);
        assert_eq!(RaidType::Raid6.data_members(6), 4);

        let parsed: RaidType = serde_json::from_str("\"raid7\"").unwrap();
        assert_eq!(parsed, RaidType::Unknown);
    }

    #[test]
    fn test_bottom_up_raid5() {
        let geometry = StandardRaidGeometry::default();
        let g = geometry.bottom_up(RaidType::Raid5, 5, 0x10000).unwrap();

        assert_eq!(g.data_per_member % 1024, 0);
        assert!(g.imported_per_member <= 0x10000);
        assert_eq!(g.exported_capacity, g.data_per_member * 4);
        // one more chunk would not fit
        let bigger = g.data_per_member + 1024;
        assert!(bigger + geometry.metadata_size(RaidType::Raid5, bigger).unwrap() > 0x10000);
    }

    #[test]
    fn test_top_down_inverts_bottom_up() {
        let geometry = StandardRaidGeometry::default();
        for (raid_type, width) in [
            (RaidType::Raid0, 3),
            (RaidType::Raid1, 2),
            (RaidType::Raid5, 5),
            (RaidType::Raid6, 8),
            (RaidType::Raid10, 4),
        ] {
            let up = geometry.bottom_up(raid_type, width, 0x2_0000).unwrap();
            let down = geometry
                .top_down(raid_type, width, up.exported_capacity)
                .unwrap();
            assert_eq!(up, down, "{} x{}", raid_type, width);
        }
    }

    #[test]
    fn test_too_small_member() {
        let geometry = StandardRaidGeometry::default();
        assert_matches!(
            geometry.bottom_up(RaidType::Raid5, 3, 1000),
            Err(Error::InsufficientCapacity { available: 1000, .. })
        );
    }

    #[test]
    fn test_exported_capacity_overflow() {
        let geometry = StandardRaidGeometry::default();
        for (raid_type, width) in [(RaidType::Raid0, 2), (RaidType::Raid5, 3), (RaidType::Raid1, 2)] {
            assert_matches!(
                geometry.top_down(raid_type, width, u64::MAX),
                Err(Error::InvalidCapacity(_)),
                "{} x{}",
                raid_type,
                width
            );
        }

        // a member spanning the whole address space still sizes
        let g = geometry.bottom_up(RaidType::Raid1, 2, u64::MAX).unwrap();
        assert!(g.data_per_member > 0);
        assert!(g.imported_per_member > g.data_per_member);
    }
}
