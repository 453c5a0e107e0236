//! UpdateInMemory Stage
//!
//! Stages the object graph of a new raid group inside one transaction:
//! a virtual drive over each provision drive, then the raid group (or for
//! RAID10 the private mirrors and the striper over them), every edge, the
//! user entry and the advanced generation counter. Nothing is visible to
//! readers until Persist commits the transaction.

use crate::capacity::extent::{ExtentLayout, ObjectExtents};
use crate::capacity::geometry::{RaidGeometry, RaidType, DEFAULT_ELEMENT_SIZE};
use crate::capacity::negotiator::{
    ExtentFit, RequestedCapacity, VD_CAPACITY_ALIGNMENT, VD_DEFAULT_OFFSET,
};
use crate::controlplane::job::{CreateRaidGroupJob, RaidGroupCreateRequest};
use crate::controlplane::orchestrator::ProvisionContext;
use crate::domain::ports::{ObjectId, PvdConfigType};
use crate::error::{Error, Result};
use crate::store::entry::{
    ClassId, EdgeEntry, EntryKey, EntryRecord, GlobalInfo, GlobalInfoEntry, GlobalInfoType,
    ObjectConfig, RaidGroupConfig, UserIdentity, VirtualDriveConfig,
};
use crate::store::transaction::TransactionId;
use tracing::debug;

/// Begin the job's transaction and stage the whole object graph into it.
///
/// On error the transaction stays recorded on the request so Rollback can
/// abort it.
pub async fn update_in_memory(
    ctx: &ProvisionContext,
    request: &mut RaidGroupCreateRequest,
) -> Result<()> {
    ctx.store.ensure_writable()?;
    let txn = ctx.txn.begin(request.job_number);
    request.txn = Some(txn);

    if request.job.is_system_rg {
        stage_system(ctx, txn, request).await?;
    } else {
        stage_user(ctx, txn, request).await?;
    }
    stage_generation_counter(ctx, txn)
}

// =============================================================================
// User Raid Groups
// =============================================================================

async fn stage_user(
    ctx: &ProvisionContext,
    txn: TransactionId,
    request: &mut RaidGroupCreateRequest,
) -> Result<()> {
    let number = request
        .raid_group_number
        .ok_or_else(|| Error::Internal("raid group number not assigned".into()))?;

    let mut layout = ExtentLayout::new();
    request.vd_ids.clear();
    for pvd in request.pvd_ids.clone() {
        let vd = stage_virtual_drive(ctx, txn, pvd, &mut layout).await?;
        request.vd_ids.push(vd);
    }

    let raid_type = request.raid_type();
    let width = request.width();
    let vd_ids = request.vd_ids.clone();

    let (raid_group, geometry, fit) = if raid_type == RaidType::Raid10 {
        stage_raid10(ctx, txn, request, &mut layout, &vd_ids)?
    } else {
        let (geometry, fit) =
            negotiate_layer(ctx, &layout, &vd_ids, raid_type, width, request.job.capacity)?;
        let raid_group =
            stage_raid_group(ctx, txn, &request.job, &geometry, ObjectId::INVALID, false)?;
        stage_edges(ctx, txn, &mut layout, raid_group, &fit, geometry.imported_per_member)?;
        (raid_group, geometry, fit)
    };

    let class = group_class(raid_type)?;
    ctx.txn.stage_create_user(
        txn,
        raid_group,
        class,
        UserIdentity::RaidGroup {
            raid_group_number: number,
            system: false,
        },
    )?;

    debug!(
        raid_group = %raid_group,
        raid_group_number = number,
        exported = geometry.exported_capacity,
        per_member = geometry.imported_per_member,
        offset = fit.offset,
        "Raid group staged"
    );
    request.member_capacity = geometry.imported_per_member;
    request.geometry = Some(geometry);
    request.placements = fit.placements;
    request.raid_group_id = Some(raid_group);
    Ok(())
}

/// Stage a virtual drive over the largest free region of a provision drive
async fn stage_virtual_drive(
    ctx: &ProvisionContext,
    txn: TransactionId,
    pvd: ObjectId,
    layout: &mut ExtentLayout,
) -> Result<ObjectId> {
    // one raid group per provision drive
    if !ctx.store.find_upstream_edges(pvd).is_empty() {
        return Err(Error::RequestObjectHasUpstreamEdges { object_id: pvd });
    }

    let extents = ctx.collaborators.transport.object_extents(pvd).await?;
    let region = extents
        .largest_free(false)
        .ok_or(Error::InsufficientCapacity {
            requested: VD_DEFAULT_OFFSET + VD_CAPACITY_ALIGNMENT,
            available: 0,
        })?;
    let capacity = ctx
        .negotiator
        .virtual_drive_capacity(region.capacity, VD_DEFAULT_OFFSET)?;
    let server_index = extents
        .next_client_index()
        .ok_or(Error::EdgeLimitReached { object_id: pvd })?;

    let vd = ctx.txn.stage_create_object(
        txn,
        ObjectId::INVALID,
        ClassId::VirtualDrive,
        ObjectConfig::VirtualDrive(VirtualDriveConfig {
            exported_capacity: capacity.exported,
            imported_capacity: capacity.imported,
            default_offset: VD_DEFAULT_OFFSET,
            generation_number: ctx.sequence.next(),
        }),
    )?;
    ctx.txn.stage_create_edge(
        txn,
        EdgeEntry::new(vd, 0, pvd, server_index, capacity.imported, region.offset),
    )?;
    mark_pvd_consumed(ctx, txn, pvd)?;

    layout.insert(ObjectExtents::fresh(
        vd,
        VD_DEFAULT_OFFSET + capacity.exported,
        VD_DEFAULT_OFFSET,
    ));
    debug!(pvd = %pvd, vd = %vd, exported = capacity.exported, offset = region.offset, "Virtual drive staged");
    Ok(vd)
}

fn mark_pvd_consumed(ctx: &ProvisionContext, txn: TransactionId, pvd: ObjectId) -> Result<()> {
    let Some(mut entry) = ctx.store.get_entry_by_id(pvd) else {
        return Ok(());
    };
    if let ObjectConfig::ProvisionDrive(config) = &mut entry.config {
        config.config_type = PvdConfigType::RaidGroup;
        ctx.txn.stage_update(txn, EntryRecord::Object(entry))?;
    }
    Ok(())
}

/// RAID10: private 2-wide mirrors over consecutive virtual-drive pairs and
/// a striper over the mirrors.
///
/// An exact capacity sizes the striper first and derives the mirrors from
/// it. An unspecified one sizes the mirrors from the smallest pair fit and
/// builds the striper on top.
fn stage_raid10(
    ctx: &ProvisionContext,
    txn: TransactionId,
    request: &mut RaidGroupCreateRequest,
    layout: &mut ExtentLayout,
    vd_ids: &[ObjectId],
) -> Result<(ObjectId, RaidGeometry, ExtentFit)> {
    let width = request.width();
    let geometry = ctx.negotiator.geometry();
    let pairs: Vec<&[ObjectId]> = vd_ids.chunks(2).collect();

    let (striper, mirror, pair_fits) = match request.job.capacity {
        RequestedCapacity::Exact(blocks) => {
            let striper = geometry.top_down(RaidType::Raid10, width, blocks)?;
            let mirror = geometry.top_down(RaidType::Raid1, 2, striper.imported_per_member)?;
            let fits = pairs
                .iter()
                .map(|pair| fit_exact(ctx, layout, pair, mirror.imported_per_member))
                .collect::<Result<Vec<_>>>()?;
            (striper, mirror, fits)
        }
        RequestedCapacity::Unspecified => {
            let fits = pairs
                .iter()
                .map(|pair| {
                    let candidate = smallest_largest_free(layout, pair)?;
                    ctx.negotiator.extent_fits(layout, pair, candidate, false)
                })
                .collect::<Result<Vec<_>>>()?;
            let smallest = fits.iter().map(|f| f.capacity).min().unwrap_or(0);
            let mirror_max = geometry.bottom_up(RaidType::Raid1, 2, smallest)?;
            let striper =
                geometry.bottom_up(RaidType::Raid10, width, mirror_max.exported_capacity)?;
            let mirror = geometry.top_down(RaidType::Raid1, 2, striper.imported_per_member)?;
            (striper, mirror, fits)
        }
    };
    debug!(
        mirrors = pairs.len(),
        mirror_per_member = mirror.imported_per_member,
        striper_per_member = striper.imported_per_member,
        "RAID10 sizing decided"
    );

    request.mirror_ids.clear();
    for fit in &pair_fits {
        let mirror_id = stage_raid_group(ctx, txn, &request.job, &mirror, ObjectId::INVALID, true)?;
        stage_edges(ctx, txn, layout, mirror_id, fit, mirror.imported_per_member)?;
        layout.insert(ObjectExtents::fresh(mirror_id, mirror.exported_capacity, 0));
        request.mirror_ids.push(mirror_id);
    }

    let mirror_ids = request.mirror_ids.clone();
    let fit = fit_exact(ctx, layout, &mirror_ids, striper.imported_per_member)?;
    let striper_id = stage_raid_group(ctx, txn, &request.job, &striper, ObjectId::INVALID, false)?;
    stage_edges(ctx, txn, layout, striper_id, &fit, striper.imported_per_member)?;
    Ok((striper_id, striper, fit))
}

// =============================================================================
// System Raid Groups
// =============================================================================

/// Stage a raid group at the fixed id and offsets of its private-space region
async fn stage_system(
    ctx: &ProvisionContext,
    txn: TransactionId,
    request: &mut RaidGroupCreateRequest,
) -> Result<()> {
    let region = request
        .psl_region
        .clone()
        .ok_or_else(|| Error::Internal("system raid group without a layout region".into()))?;

    let mut server_indexes = Vec::with_capacity(region.drives.len());
    for pvd in &region.drives {
        let extents = ctx.collaborators.transport.object_extents(*pvd).await?;
        let available = extents.available_at(region.starting_offset, true);
        if available < region.capacity {
            return Err(Error::SystemRgMismatch(format!(
                "drive {} has {} blocks at offset {:#x}, region needs {}",
                pvd, available, region.starting_offset, region.capacity
            )));
        }
        let server_index = extents
            .next_client_index()
            .ok_or(Error::EdgeLimitReached { object_id: *pvd })?;
        server_indexes.push(server_index);
    }

    let geometry = RaidGeometry {
        raid_type: region.raid_type,
        width: region.width,
        element_size: DEFAULT_ELEMENT_SIZE,
        elements_per_parity: region.raid_type.elements_per_parity(),
        data_per_member: region.capacity,
        imported_per_member: region.capacity,
        exported_capacity: region.exported_capacity,
    };
    let raid_group = stage_raid_group(ctx, txn, &request.job, &geometry, region.object_id, false)?;

    for (client_index, (pvd, server_index)) in region.drives.iter().zip(server_indexes).enumerate() {
        ctx.txn.stage_create_edge(
            txn,
            EdgeEntry::new(
                raid_group,
                client_index as u32,
                *pvd,
                server_index,
                region.capacity,
                region.starting_offset,
            ),
        )?;
    }
    ctx.txn.stage_create_user(
        txn,
        raid_group,
        group_class(region.raid_type)?,
        UserIdentity::RaidGroup {
            raid_group_number: region.raid_group_number,
            system: true,
        },
    )?;

    debug!(raid_group = %raid_group, raid_group_number = region.raid_group_number, "System raid group staged");
    request.member_capacity = region.capacity;
    request.geometry = Some(geometry);
    request.raid_group_id = Some(raid_group);
    Ok(())
}

// =============================================================================
// Shared Helpers
// =============================================================================

fn group_class(raid_type: RaidType) -> Result<ClassId> {
    raid_type
        .group_class()
        .ok_or_else(|| Error::InvalidRaidType(raid_type.to_string()))
}

/// Size one raid-group layer over `members` and agree where it lands
fn negotiate_layer(
    ctx: &ProvisionContext,
    layout: &ExtentLayout,
    members: &[ObjectId],
    raid_type: RaidType,
    width: u32,
    requested: RequestedCapacity,
) -> Result<(RaidGeometry, ExtentFit)> {
    match requested {
        RequestedCapacity::Unspecified => {
            let candidate = smallest_largest_free(layout, members)?;
            let fit = ctx.negotiator.extent_fits(layout, members, candidate, false)?;
            let geometry = ctx.negotiator.calculate_raid_group_capacity(
                raid_type,
                width,
                requested,
                &[fit.capacity],
            )?;
            Ok((geometry, fit))
        }
        RequestedCapacity::Exact(blocks) => {
            let geometry = ctx.negotiator.geometry().top_down(raid_type, width, blocks)?;
            let fit = fit_exact(ctx, layout, members, geometry.imported_per_member)?;
            Ok((geometry, fit))
        }
    }
}

/// Extent fit that must keep the full `required` capacity
fn fit_exact(
    ctx: &ProvisionContext,
    layout: &ExtentLayout,
    members: &[ObjectId],
    required: u64,
) -> Result<ExtentFit> {
    let fit = ctx.negotiator.extent_fits(layout, members, required, false)?;
    if fit.capacity < required {
        return Err(Error::InsufficientCapacity {
            requested: required,
            available: fit.capacity,
        });
    }
    Ok(fit)
}

/// The smallest of each member's largest free region
fn smallest_largest_free(layout: &ExtentLayout, members: &[ObjectId]) -> Result<u64> {
    let mut smallest = u64::MAX;
    for id in members {
        let largest = layout
            .get(*id)?
            .largest_free(false)
            .map(|region| region.capacity)
            .unwrap_or(0);
        smallest = smallest.min(largest);
    }
    if smallest == 0 || smallest == u64::MAX {
        return Err(Error::InsufficientCapacity {
            requested: 1,
            available: 0,
        });
    }
    Ok(smallest)
}

fn stage_raid_group(
    ctx: &ProvisionContext,
    txn: TransactionId,
    job: &CreateRaidGroupJob,
    geometry: &RaidGeometry,
    object_id: ObjectId,
    private: bool,
) -> Result<ObjectId> {
    let class = group_class(geometry.raid_type)?;
    let config = RaidGroupConfig {
        raid_type: geometry.raid_type,
        width: geometry.width,
        exported_capacity: geometry.exported_capacity,
        imported_per_member: geometry.imported_per_member,
        element_size: geometry.element_size,
        elements_per_parity: geometry.elements_per_parity,
        private,
        power_saving_enabled: job.power_saving_enabled,
        power_saving_idle_secs: job.power_saving_idle_secs,
        max_raid_latency_secs: job.max_raid_latency_secs,
        generation_number: ctx.sequence.next(),
    };
    ctx.txn
        .stage_create_object(txn, object_id, class, ObjectConfig::RaidGroup(config))
}

/// Edge `client` to every placement of `fit` and consume the extents
fn stage_edges(
    ctx: &ProvisionContext,
    txn: TransactionId,
    layout: &mut ExtentLayout,
    client: ObjectId,
    fit: &ExtentFit,
    capacity: u64,
) -> Result<()> {
    for (client_index, placement) in fit.placements.iter().enumerate() {
        ctx.txn.stage_create_edge(
            txn,
            EdgeEntry::new(
                client,
                client_index as u32,
                placement.object_id,
                placement.client_index,
                capacity,
                placement.offset,
            ),
        )?;
        layout
            .get_mut(placement.object_id)?
            .reserve(placement.offset, capacity, placement.client_index)?;
    }
    Ok(())
}

/// Persist the next unused generation number with the graph.
///
/// Two jobs staging concurrently both touch this entry, so the second to
/// commit fails its generation check and rolls back with a retryable
/// conflict.
fn stage_generation_counter(ctx: &ProvisionContext, txn: TransactionId) -> Result<()> {
    let record = EntryRecord::GlobalInfo(GlobalInfoEntry::new(GlobalInfo::GenerationCounter {
        next: ctx.sequence.peek(),
    }));
    let key = EntryKey::GlobalInfo(GlobalInfoType::GenerationCounter);
    match ctx.txn.staged_entry(txn, &key)? {
        Some(_) => ctx.txn.stage_update(txn, record),
        None => ctx.txn.stage_create(txn, record).map(|_| ()),
    }
}
