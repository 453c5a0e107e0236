//! Capacity Negotiator
//!
//! Sizes each layer of a raid group's object graph and agrees a single
//! extent across the members that will compose it.

use crate::capacity::extent::{Extent, ExtentLayout};
use crate::capacity::geometry::{RaidGeometry, RaidGeometryServiceRef, RaidType};
use crate::domain::ports::{BlockTransport, ObjectId};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Exported capacity of a virtual drive is rounded down to this many blocks
pub const VD_CAPACITY_ALIGNMENT: u64 = 0x800;

/// Region a virtual drive keeps for itself below its first client
pub const VD_DEFAULT_OFFSET: u64 = 0x800;

// =============================================================================
// Results
// =============================================================================

/// Sizing of a virtual drive over a provision-drive extent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VdCapacity {
    pub exported: u64,
    pub imported: u64,
}

/// Requested raid-group capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestedCapacity {
    /// Consume everything the members can offer
    Unspecified,
    Exact(u64),
}

impl RequestedCapacity {
    pub fn from_blocks(blocks: Option<u64>) -> Self {
        match blocks {
            Some(blocks) => RequestedCapacity::Exact(blocks),
            None => RequestedCapacity::Unspecified,
        }
    }
}

/// Where one member's edge lands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberPlacement {
    pub object_id: ObjectId,
    pub offset: u64,
    /// Upstream slot taken on the member
    pub client_index: u32,
}

/// Outcome of extent-fit: one capacity at one common offset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtentFit {
    pub capacity: u64,
    pub offset: u64,
    pub placements: Vec<MemberPlacement>,
}

// =============================================================================
// Negotiator
// =============================================================================

#[derive(Clone)]
pub struct CapacityNegotiator {
    geometry: RaidGeometryServiceRef,
}

impl CapacityNegotiator {
    pub fn new(geometry: RaidGeometryServiceRef) -> Self {
        Self { geometry }
    }

    pub fn geometry(&self) -> &RaidGeometryServiceRef {
        &self.geometry
    }

    /// Size a virtual drive over `importable` blocks of its provision drive
    pub fn virtual_drive_capacity(&self, importable: u64, offset: u64) -> Result<VdCapacity> {
        if importable <= offset {
            return Err(Error::InsufficientCapacity {
                requested: offset + VD_CAPACITY_ALIGNMENT,
                available: importable,
            });
        }
        let exported = (importable - offset) / VD_CAPACITY_ALIGNMENT * VD_CAPACITY_ALIGNMENT;
        if exported == 0 {
            return Err(Error::InsufficientCapacity {
                requested: offset + VD_CAPACITY_ALIGNMENT,
                available: importable,
            });
        }
        Ok(VdCapacity {
            exported,
            imported: importable,
        })
    }

    /// Exported capacity of a provision drive
    pub async fn provision_drive_exported_size(
        &self,
        transport: &dyn BlockTransport,
        pvd: ObjectId,
    ) -> Result<u64> {
        let extents = transport.object_extents(pvd).await?;
        Ok(extents.capacity.saturating_sub(extents.default_offset))
    }

    /// Largest free region of a provision drive above its default offset
    pub async fn unused_provision_drive_extent(
        &self,
        transport: &dyn BlockTransport,
        pvd: ObjectId,
    ) -> Result<Extent> {
        let extents = transport.object_extents(pvd).await?;
        extents
            .largest_free(false)
            .ok_or(Error::InsufficientCapacity {
                requested: 1,
                available: 0,
            })
    }

    /// Agree one offset and capacity across `objects`.
    ///
    /// Pass one takes each object's first region holding the candidate and
    /// keeps the highest offset seen; an object without such a region pins
    /// the offset to its end. Pass two re-queries every object at that
    /// offset and shrinks the capacity to what all of them support there.
    pub fn extent_fits(
        &self,
        layout: &ExtentLayout,
        objects: &[ObjectId],
        candidate: u64,
        ignore_offset: bool,
    ) -> Result<ExtentFit> {
        if objects.is_empty() || candidate == 0 {
            return Err(Error::InvalidCapacity(format!(
                "extent fit over {} objects for {} blocks",
                objects.len(),
                candidate
            )));
        }

        let mut offset = 0;
        for id in objects {
            let extents = layout.get(*id)?;
            let start = extents
                .first_fit(candidate, ignore_offset)
                .unwrap_or(extents.capacity);
            offset = offset.max(start);
        }

        let mut capacity = candidate;
        let mut placements = Vec::with_capacity(objects.len());
        for id in objects {
            let extents = layout.get(*id)?;
            capacity = capacity.min(extents.available_at(offset, ignore_offset));
            let client_index = extents
                .next_client_index()
                .ok_or(Error::EdgeLimitReached { object_id: *id })?;
            placements.push(MemberPlacement {
                object_id: *id,
                offset,
                client_index,
            });
        }

        if capacity == 0 {
            return Err(Error::InsufficientCapacity {
                requested: candidate,
                available: 0,
            });
        }

        debug!(
            members = objects.len(),
            candidate,
            capacity,
            offset,
            "Extent fit agreed"
        );
        Ok(ExtentFit {
            capacity,
            offset,
            placements,
        })
    }

    /// Geometry of a raid group over members offering `per_member_available`.
    ///
    /// An unspecified capacity sizes bottom-up from the smallest member; an
    /// exact one sizes top-down and must fit every member.
    pub fn calculate_raid_group_capacity(
        &self,
        raid_type: RaidType,
        width: u32,
        requested: RequestedCapacity,
        per_member_available: &[u64],
    ) -> Result<RaidGeometry> {
        let min_available = per_member_available.iter().copied().min().unwrap_or(0);
        let geometry = match requested {
            RequestedCapacity::Unspecified => {
                self.geometry.bottom_up(raid_type, width, min_available)?
            }
            RequestedCapacity::Exact(exported) => {
                let geometry = self.geometry.top_down(raid_type, width, exported)?;
                if geometry.imported_per_member > min_available {
                    return Err(Error::InsufficientCapacity {
                        requested: geometry.imported_per_member,
                        available: min_available,
                    });
                }
                geometry
            }
        };
        debug!(
            raid_type = %raid_type,
            width,
            exported = geometry.exported_capacity,
            per_member = geometry.imported_per_member,
            "Raid group capacity calculated"
        );
        Ok(geometry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::extent::{ObjectExtents, UsedExtent};
    use crate::capacity::geometry::StandardRaidGeometry;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn negotiator() -> CapacityNegotiator {
        CapacityNegotiator::new(Arc::new(StandardRaidGeometry::default()))
    }

    fn layout() -> (ExtentLayout, Vec<ObjectId>) {
        let mut layout = ExtentLayout::new();
        layout.insert(ObjectExtents::fresh(ObjectId(1), 0x10000, 0));
        layout.insert(ObjectExtents::fresh(ObjectId(2), 0x10000, 0).with_used(vec![UsedExtent {
            offset: 0,
            capacity: 0x3000,
            client_index: 0,
        }]));
        layout.insert(ObjectExtents::fresh(ObjectId(3), 0x0c000, 0));
        (layout, vec![ObjectId(1), ObjectId(2), ObjectId(3)])
    }

    #[test]
    fn test_virtual_drive_capacity() {
        let n = negotiator();
        let vd = n.virtual_drive_capacity(0x10000, VD_DEFAULT_OFFSET).unwrap();
        assert_eq!(vd.imported, 0x10000);
        assert_eq!(vd.exported, 0xf800);
        assert_matches!(
            n.virtual_drive_capacity(0x800, 0x800),
            Err(Error::InsufficientCapacity { .. })
        );
    }

    #[test]
    fn test_extent_fit_common_offset() {
        let (layout, ids) = layout();
        let fit = negotiator().extent_fits(&layout, &ids, 0x8000, false).unwrap();

        // object 2 is used below 0x3000, so everyone starts there
        assert_eq!(fit.offset, 0x3000);
        // object 3 ends at 0xc000
        assert_eq!(fit.capacity, 0x9000.min(0x8000));
        assert_eq!(fit.placements[1].client_index, 1);
        assert!(fit.placements.iter().all(|p| p.offset == 0x3000));
    }

    #[test]
    fn test_extent_fit_shrinks_in_pass_two() {
        let (layout, ids) = layout();
        let fit = negotiator().extent_fits(&layout, &ids, 0xa000, false).unwrap();
        assert_eq!(fit.offset, 0x3000);
        assert_eq!(fit.capacity, 0x9000);
    }

    #[test]
    fn test_extent_fit_is_deterministic() {
        let (layout, ids) = layout();
        let n = negotiator();
        let first = n.extent_fits(&layout, &ids, 0x8000, false).unwrap();
        let second = n.extent_fits(&layout, &ids, 0x8000, false).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_extent_fit_collapses_to_zero() {
        let (layout, ids) = layout();
        assert_matches!(
            negotiator().extent_fits(&layout, &ids, 0x20000, false),
            Err(Error::InsufficientCapacity { requested: 0x20000, available: 0 })
        );
    }

    #[test]
    fn test_calculate_capacity_modes() {
        let n = negotiator();
        let bottom = n
            .calculate_raid_group_capacity(
                RaidType::Raid5,
                3,
                RequestedCapacity::Unspecified,
                &[0x10000, 0x8000, 0x9000],
            )
            .unwrap();
        assert!(bottom.imported_per_member <= 0x8000);

        let top = n
            .calculate_raid_group_capacity(
                RaidType::Raid5,
                3,
                RequestedCapacity::Exact(0x4000),
                &[0x10000, 0x8000, 0x9000],
            )
            .unwrap();
        assert!(top.exported_capacity >= 0x4000);

        assert_matches!(
            n.calculate_raid_group_capacity(
                RaidType::Raid5,
                3,
                RequestedCapacity::Exact(0x100000),
                &[0x10000, 0x8000, 0x9000],
            ),
            Err(Error::InsufficientCapacity { .. })
        );
    }
}
