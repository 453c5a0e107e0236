//! Capacity negotiation: raid geometry, extent arithmetic and extent-fit

pub mod extent;
pub mod geometry;
pub mod negotiator;

pub use extent::{Extent, ExtentLayout, ObjectExtents, UsedExtent};
pub use geometry::{
    RaidGeometry, RaidGeometryService, RaidGeometryServiceRef, RaidType, StandardRaidGeometry,
    MAX_DISK_ARRAY_WIDTH,
};
pub use negotiator::{
    CapacityNegotiator, ExtentFit, MemberPlacement, RequestedCapacity, VdCapacity,
    VD_DEFAULT_OFFSET,
};
