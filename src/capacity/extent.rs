//! Extent arithmetic
//!
//! Free-space views of objects that can take new upstream edges.

use crate::domain::ports::ObjectId;
use crate::error::{Error, Result};
use crate::store::entry::MAX_EDGES_PER_OBJECT;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Contiguous range of blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub offset: u64,
    pub capacity: u64,
}

impl Extent {
    pub fn end(&self) -> u64 {
        self.offset + self.capacity
    }
}

/// Range already consumed by an upstream edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsedExtent {
    pub offset: u64,
    pub capacity: u64,
    /// Upstream slot on the server that owns this range
    pub client_index: u32,
}

/// Capacity and consumed ranges of one object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectExtents {
    pub object_id: ObjectId,
    pub capacity: u64,
    /// Start of the region available to clients
    pub default_offset: u64,
    /// Sorted by offset
    pub used: Vec<UsedExtent>,
}

impl ObjectExtents {
    /// Object with nothing consumed yet
    pub fn fresh(object_id: ObjectId, capacity: u64, default_offset: u64) -> Self {
        Self {
            object_id,
            capacity,
            default_offset,
            used: Vec::new(),
        }
    }

    pub fn with_used(mut self, mut used: Vec<UsedExtent>) -> Self {
        used.sort_by_key(|u| u.offset);
        self.used = used;
        self
    }

    /// Gaps between consumed ranges, in offset order
    pub fn free_regions(&self, ignore_offset: bool) -> Vec<Extent> {
        let mut cursor = if ignore_offset { 0 } else { self.default_offset };
        let mut regions = Vec::new();
        for used in &self.used {
            if used.offset > cursor {
                regions.push(Extent {
                    offset: cursor,
                    capacity: used.offset - cursor,
                });
            }
            cursor = cursor.max(used.offset + used.capacity);
        }
        if self.capacity > cursor {
            regions.push(Extent {
                offset: cursor,
                capacity: self.capacity - cursor,
            });
        }
        regions
    }

    /// Largest free region; the lowest one wins a tie
    pub fn largest_free(&self, ignore_offset: bool) -> Option<Extent> {
        self.free_regions(ignore_offset)
            .into_iter()
            .fold(None, |best: Option<Extent>, region| match best {
                Some(b) if b.capacity >= region.capacity => Some(b),
                _ => Some(region),
            })
    }

    /// Offset of the first region holding at least `capacity`
    pub fn first_fit(&self, capacity: u64, ignore_offset: bool) -> Option<u64> {
        self.free_regions(ignore_offset)
            .into_iter()
            .find(|region| region.capacity >= capacity)
            .map(|region| region.offset)
    }

    /// Free blocks from `offset` to the end of its region
    pub fn available_at(&self, offset: u64, ignore_offset: bool) -> u64 {
        self.free_regions(ignore_offset)
            .into_iter()
            .find(|region| region.offset <= offset && offset < region.end())
            .map(|region| region.end() - offset)
            .unwrap_or(0)
    }

    /// Lowest upstream slot not yet taken
    pub fn next_client_index(&self) -> Option<u32> {
        (0..MAX_EDGES_PER_OBJECT).find(|i| self.used.iter().all(|u| u.client_index != *i))
    }

    /// Record a new consumed range
    pub fn reserve(&mut self, offset: u64, capacity: u64, client_index: u32) -> Result<()> {
        let fits = self
            .free_regions(true)
            .iter()
            .any(|region| region.offset <= offset && offset + capacity <= region.end());
        if !fits {
            return Err(Error::InsufficientCapacity {
                requested: capacity,
                available: self.available_at(offset, true),
            });
        }
        self.used.push(UsedExtent {
            offset,
            capacity,
            client_index,
        });
        self.used.sort_by_key(|u| u.offset);
        Ok(())
    }
}

/// Free-space snapshot of every object taking part in one negotiation
#[derive(Debug, Clone, Default)]
pub struct ExtentLayout {
    objects: BTreeMap<ObjectId, ObjectExtents>,
}

impl ExtentLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, extents: ObjectExtents) {
        self.objects.insert(extents.object_id, extents);
    }

    pub fn get(&self, object_id: ObjectId) -> Result<&ObjectExtents> {
        self.objects
            .get(&object_id)
            .ok_or(Error::ObjectNotFound(object_id))
    }

    pub fn get_mut(&mut self, object_id: ObjectId) -> Result<&mut ObjectExtents> {
        self.objects
            .get_mut(&object_id)
            .ok_or(Error::ObjectNotFound(object_id))
    }

    pub fn contains(&self, object_id: ObjectId) -> bool {
        self.objects.contains_key(&object_id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragmented() -> ObjectExtents {
        ObjectExtents::fresh(ObjectId(0x10), 0x10000, 0x100).with_used(vec![
            UsedExtent {
                offset: 0x4000,
                capacity: 0x1000,
                client_index: 1,
            },
            UsedExtent {
                offset: 0x100,
                capacity: 0x1f00,
                client_index: 0,
            },
        ])
    }

    #[test]
    fn test_free_regions() {
        let extents = fragmented();
        assert_eq!(
            extents.free_regions(false),
            vec![
                Extent { offset: 0x2000, capacity: 0x2000 },
                Extent { offset: 0x5000, capacity: 0xb000 },
            ]
        );
        // the default-offset area shows up only when ignored
        assert_eq!(extents.free_regions(true)[0], Extent { offset: 0, capacity: 0x100 });
    }

    #[test]
    fn test_fit_queries() {
        let extents = fragmented();
        assert_eq!(extents.largest_free(false), Some(Extent { offset: 0x5000, capacity: 0xb000 }));
        assert_eq!(extents.first_fit(0x1800, false), Some(0x2000));
        assert_eq!(extents.first_fit(0x3000, false), Some(0x5000));
        assert_eq!(extents.first_fit(0x20000, false), None);
        assert_eq!(extents.available_at(0x3000, false), 0x1000);
        assert_eq!(extents.available_at(0x4800, false), 0);
        assert_eq!(extents.next_client_index(), Some(2));
    }

    #[test]
    fn test_reserve() {
        let mut extents = fragmented();
        extents.reserve(0x2000, 0x2000, 2).unwrap();
        assert_eq!(extents.first_fit(1, false), Some(0x5000));
        assert!(extents.reserve(0x4800, 0x100, 3).is_err());
    }
}
