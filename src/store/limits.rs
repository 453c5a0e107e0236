//! Table sizing from platform limits

use crate::config::PlatformLimits;
use crate::error::{Error, Result};
use crate::store::entry::{GlobalInfoType, MAX_EDGES_PER_OBJECT};
use serde::Serialize;

/// Headroom added on top of the computed object count, in percent
pub const TABLE_HEADROOM_PERCENT: usize = 2;

/// Slot counts of every table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSizes {
    pub object: usize,
    pub user: usize,
    pub edge: usize,
    pub global_info: usize,
    pub system_spare: usize,
    /// Object ids below this are never handed out by general allocation
    pub reserved_objects: usize,
}

impl TableSizes {
    /// Size the tables for a platform.
    ///
    /// Each drive contributes a provision drive and a virtual drive, each raid
    /// group may carry a private mirror beneath it, then LUNs and pools are
    /// added on top of the reserved system range. The result is floored,
    /// padded by [`TABLE_HEADROOM_PERCENT`] and checked against the
    /// platform's topology ceiling.
    pub fn compute(limits: &PlatformLimits) -> Result<Self> {
        let reserved = limits.reserved_system_objects as usize;
        let base = reserved
            + 2 * limits.max_fru_count as usize
            + 2 * limits.max_raid_groups as usize
            + limits.max_luns as usize
            + limits.max_extent_pools as usize;

        let floored = base.max(limits.min_object_table_size as usize);
        let object = floored + (floored * TABLE_HEADROOM_PERCENT).div_ceil(100);

        let ceiling = limits.topology_object_ceiling as usize;
        if object > ceiling {
            return Err(Error::TableSizeExceeded {
                required: object,
                ceiling,
            });
        }
        if limits.system_drive_count as usize >= reserved {
            return Err(Error::Configuration(format!(
                "{} system drives do not fit in {} reserved object ids",
                limits.system_drive_count, reserved
            )));
        }

        Ok(Self {
            object,
            user: object,
            edge: object * MAX_EDGES_PER_OBJECT as usize,
            global_info: GlobalInfoType::ALL.len(),
            system_spare: limits.system_drive_count as usize,
            reserved_objects: reserved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_platform_sizes() {
        let sizes = TableSizes::compute(&PlatformLimits::default()).unwrap();
        // 0x100 + 240 + 128 + 256 + 8 = 888, plus 2% rounded up
        assert_eq!(sizes.object, 888 + 18);
        assert_eq!(sizes.user, sizes.object);
        assert_eq!(sizes.edge, sizes.object * 16);
        assert_eq!(sizes.global_info, 6);
        assert_eq!(sizes.system_spare, 4);
    }

    #[test]
    fn test_floor_applies_to_small_platforms() {
        let limits = PlatformLimits {
            max_fru_count: 4,
            max_raid_groups: 2,
            max_luns: 2,
            max_extent_pools: 1,
            reserved_system_objects: 16,
            min_object_table_size: 512,
            ..Default::default()
        };
        let sizes = TableSizes::compute(&limits).unwrap();
        assert_eq!(sizes.object, 512 + 11);
    }

    #[test]
    fn test_ceiling_exceeded() {
        let limits = PlatformLimits {
            max_fru_count: 2000,
            topology_object_ceiling: 4096,
            ..Default::default()
        };
        assert_matches!(
            TableSizes::compute(&limits),
            Err(Error::TableSizeExceeded { ceiling: 4096, .. })
        );
    }
}
