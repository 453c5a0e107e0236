//! Validate Stage
//!
//! Everything that can reject a create job before a transaction exists:
//! raid type and width, drive resolution and duplicates, provision-drive
//! lifecycle and compatibility, raid-group limits and numbering, and the
//! one-raid-group-per-drive rule.

use crate::capacity::geometry::RaidType;
use crate::config::ControllerRole;
use crate::controlplane::events;
use crate::controlplane::job::RaidGroupCreateRequest;
use crate::controlplane::orchestrator::ProvisionContext;
use crate::domain::ports::{DriveLocation, ObjectId, PvdConfigType};
use crate::error::{Error, Result};
use std::collections::HashSet;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Run every validation check, filling in resolved ids and drive info
pub async fn validate(ctx: &ProvisionContext, request: &mut RaidGroupCreateRequest) -> Result<()> {
    ctx.store.ensure_writable()?;
    if ctx.controller == ControllerRole::Passive {
        return Err(Error::Configuration(
            "raid groups are created on the active controller".into(),
        ));
    }

    check_raid_type(request)?;
    request.raid_type().check_width(request.width())?;
    if request.job.drives.len() as u32 != request.width() {
        let (min, max) = request.raid_type().width_limits().unwrap_or((0, 0));
        return Err(Error::InvalidDriveCount {
            raid_type: request.raid_type().to_string(),
            count: request.job.drives.len() as u32,
            min,
            max,
        });
    }

    resolve_drives(ctx, request).await?;
    check_duplicates(&request.pvd_ids)?;

    if request.job.is_system_rg {
        validate_system(ctx, request).await
    } else {
        validate_user(ctx, request).await
    }
}

fn check_raid_type(request: &RaidGroupCreateRequest) -> Result<()> {
    let raid_type = request.raid_type();
    let allowed = match raid_type {
        RaidType::Unknown => false,
        RaidType::RawMirror => request.job.is_system_rg,
        _ => true,
    };
    if !allowed {
        return Err(Error::InvalidRaidType(raid_type.to_string()));
    }
    Ok(())
}

async fn resolve_drives(ctx: &ProvisionContext, request: &mut RaidGroupCreateRequest) -> Result<()> {
    let topology = &ctx.collaborators.topology;
    request.pvd_ids.clear();
    request.pd_ids.clear();
    for location in &request.job.drives {
        let pvd = topology
            .provision_drive_by_location(*location)
            .await
            .ok()
            .filter(ObjectId::is_valid)
            .ok_or(Error::DriveNotFound {
                location: location.to_string(),
            })?;
        let pd = topology
            .physical_drive_by_location(*location)
            .await
            .ok()
            .filter(ObjectId::is_valid)
            .ok_or(Error::DriveNotFound {
                location: location.to_string(),
            })?;
        request.pvd_ids.push(pvd);
        request.pd_ids.push(pd);
    }
    debug!(pvds = ?request.pvd_ids, "Drive locations resolved");
    Ok(())
}

fn check_duplicates(pvd_ids: &[ObjectId]) -> Result<()> {
    let mut seen = HashSet::with_capacity(pvd_ids.len());
    match pvd_ids.iter().find(|id| !seen.insert(**id)) {
        Some(duplicate) => Err(Error::DuplicatePvd {
            object_id: *duplicate,
        }),
        None => Ok(()),
    }
}

// =============================================================================
// User Raid Groups
// =============================================================================

async fn validate_user(ctx: &ProvisionContext, request: &mut RaidGroupCreateRequest) -> Result<()> {
    for (pvd, location) in request.pvd_ids.clone().into_iter().zip(request.job.drives.clone()) {
        wait_for_pvd_ready(ctx, pvd, location).await?;
    }

    request.drive_infos.clear();
    for pvd in &request.pvd_ids {
        let info = ctx.collaborators.drive_info.drive_info(*pvd).await?;
        if info.config_type == PvdConfigType::HotSpare {
            return Err(Error::PvdConfiguredAsSpare { object_id: *pvd });
        }
        if info.end_of_life {
            return Err(Error::DriveEndOfLife { object_id: *pvd });
        }
        request.drive_infos.push(info);
    }
    check_compatibility(ctx, request)?;

    let limit = ctx.limits.max_user_raid_groups;
    if ctx.store.count_user_raid_groups() >= limit {
        return Err(Error::RaidGroupCountExceeded { limit });
    }

    match request.raid_group_number {
        Some(number) => {
            if ctx.store.find_user_by_raid_group_number(number).is_some() {
                return Err(Error::RaidGroupIdInUse(number));
            }
        }
        None => {
            let number = lowest_unused(&ctx.store.raid_group_numbers());
            debug!(raid_group_number = number, "Raid group number assigned");
            request.raid_group_number = Some(number);
        }
    }

    for pvd in &request.pvd_ids {
        if !ctx.store.find_upstream_edges(*pvd).is_empty() {
            return Err(Error::RequestObjectHasUpstreamEdges { object_id: *pvd });
        }
    }
    Ok(())
}

/// Bounded wait for a provision drive to become usable
async fn wait_for_pvd_ready(
    ctx: &ProvisionContext,
    pvd: ObjectId,
    location: DriveLocation,
) -> Result<()> {
    let lifecycle = &ctx.collaborators.lifecycle;
    let deadline = Instant::now() + ctx.timeouts.pvd_ready_timeout();
    loop {
        let state = lifecycle.lifecycle_state(pvd).await?;
        if state.is_usable() {
            return Ok(());
        }
        if state.is_terminal() {
            return Err(Error::BadPvdConfiguration {
                object_id: pvd,
                reason: format!("lifecycle state {}", state),
            });
        }
        if Instant::now() >= deadline {
            warn!(pvd = %pvd, location = %location, state = %state, "Provision drive never became ready");
            ctx.log_event(events::pvd_not_ready(location, pvd));
            return Err(Error::BadPvdConfiguration {
                object_id: pvd,
                reason: format!("still {} after {:?}", state, ctx.timeouts.pvd_ready_timeout()),
            });
        }
        tokio::time::sleep(ctx.timeouts.pvd_ready_poll_interval()).await;
    }
}

/// The first drive's tier must accept every drive, and block sizes must match
fn check_compatibility(ctx: &ProvisionContext, request: &RaidGroupCreateRequest) -> Result<()> {
    let Some(first) = request.drive_infos.first() else {
        return Ok(());
    };
    let tier = first.drive_type.tier();
    let first_location = request.job.drives[0];

    for (info, location) in request.drive_infos.iter().zip(&request.job.drives).skip(1) {
        if !tier.accepts(info.drive_type) {
            warn!(first = %first.drive_type, other = %info.drive_type, location = %location, "Incompatible drive types");
            ctx.log_event(events::incompatible_drive_types(
                request.raid_type(),
                request.width(),
                first_location,
                *location,
            ));
            return Err(Error::IncompatibleDriveTypes {
                first: first.drive_type.to_string(),
                other: info.drive_type.to_string(),
            });
        }
        if info.configured_block_size != first.configured_block_size {
            warn!(
                first = first.configured_block_size,
                other = info.configured_block_size,
                location = %location,
                "Incompatible block sizes"
            );
            ctx.log_event(events::incompatible_block_size(
                request.raid_type(),
                request.width(),
                *location,
                &info.serial_number,
            ));
            return Err(Error::IncompatibleBlockSize {
                first: first.configured_block_size,
                other: info.configured_block_size,
            });
        }
    }
    Ok(())
}

fn lowest_unused(sorted: &[u32]) -> u32 {
    let mut candidate = 0;
    for number in sorted {
        if *number == candidate {
            candidate += 1;
        } else if *number > candidate {
            break;
        }
    }
    candidate
}

// =============================================================================
// System Raid Groups
// =============================================================================

async fn validate_system(
    ctx: &ProvisionContext,
    request: &mut RaidGroupCreateRequest,
) -> Result<()> {
    let number = request.raid_group_number.ok_or_else(|| {
        Error::SystemRgMismatch("system raid group requires a raid group number".into())
    })?;
    let region = ctx
        .collaborators
        .layout
        .system_raid_group(number)
        .ok_or_else(|| Error::SystemRgMismatch(format!("no private-space region for {}", number)))?;

    if region.raid_type != request.raid_type() {
        return Err(Error::SystemRgMismatch(format!(
            "raid group {} is {} in the layout, requested {}",
            number,
            region.raid_type,
            request.raid_type()
        )));
    }
    if region.width != request.width() || region.drives != request.pvd_ids {
        return Err(Error::SystemRgMismatch(format!(
            "raid group {} members {:?} do not match the layout {:?}",
            number, request.pvd_ids, region.drives
        )));
    }

    let mut degraded = 0;
    for pvd in &request.pvd_ids {
        let usable = ctx
            .collaborators
            .lifecycle
            .lifecycle_state(*pvd)
            .await
            .map(|state| state.is_usable())
            .unwrap_or(false);
        if !usable {
            degraded += 1;
        }
    }
    if degraded >= 2 {
        return Err(Error::SystemRgDoubleDegraded {
            raid_group_number: number,
        });
    }

    if ctx.store.find_user_by_raid_group_number(number).is_some()
        || ctx.store.get_entry_by_id(region.object_id).is_some()
    {
        return Err(Error::RaidGroupIdInUse(number));
    }

    request.psl_region = Some(region);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_unused() {
        assert_eq!(lowest_unused(&[]), 0);
        assert_eq!(lowest_unused(&[0, 1, 2]), 3);
        assert_eq!(lowest_unused(&[0, 2, 3]), 1);
        assert_eq!(lowest_unused(&[1, 2]), 0);
        assert_eq!(lowest_unused(&[0, 0, 1, 1000]), 2);
    }

    #[test]
    fn test_duplicate_detection() {
        assert!(check_duplicates(&[ObjectId(4), ObjectId(5)]).is_ok());
        assert!(matches!(
            check_duplicates(&[ObjectId(4), ObjectId(5), ObjectId(4)]),
            Err(Error::DuplicatePvd { object_id }) if object_id == ObjectId(4)
        ));
    }
}
