//! Allocation and accounting over the inventory.
//!
//! Everything here runs inside the caller's open [`Transaction`] so a
//! failure at any step rolls the whole operation back. Pool and library
//! aggregates are maintained on every path that touches a side:
//! `pool.capacity` is the sum of native capacities of its member sides and
//! `pool.tot_free_space` counts only sides whose status currently lets them
//! take data.

use crate::error::HandlerError;
use crate::protocol::{codes, limits};
use crate::store::Transaction;
use crate::types::{
    status, Allocation, DeviceGroupWeight, Tag, TapeSide, TapeVolume, DEFAULT_POOL, LABEL_TYPES,
};
use log::info;

/// Parameters of a volume-enter operation.
#[derive(Debug, Clone, Default)]
pub struct EnterVolume {
    pub vid: String,
    pub vsn: String,
    pub library: String,
    pub density: String,
    pub lbltype: String,
    pub model: String,
    pub media_letter: String,
    pub manufacturer: String,
    pub sn: String,
    pub nbsides: u16,
    pub poolname: String,
    pub side_status: i32,
}

/// Registers a new volume: validates every referenced entity, creates the
/// sides at native capacity, and adjusts pool and library aggregates.
pub fn enter_volume(
    tx: &mut Transaction<'_>,
    mut req: EnterVolume,
    now: i64,
) -> Result<(), HandlerError> {
    if req.vsn.is_empty() {
        req.vsn = req.vid.clone();
    }
    if req.lbltype.is_empty() {
        req.lbltype = "al".into();
    } else if !LABEL_TYPES.contains(&req.lbltype.as_str()) {
        return Err(HandlerError::code(codes::EINVAL));
    }
    if req.poolname.is_empty() {
        req.poolname = DEFAULT_POOL.into();
    }
    if req.nbsides == 0 {
        return Err(HandlerError::code(codes::EINVAL));
    }

    let mut pool = tx
        .get_pool(&req.poolname)
        .map_err(|err| not_found_becomes(err, "No such pool"))?;
    let model = tx
        .get_model(&req.model)
        .map_err(|err| not_found_becomes(err, "No such model"))?;
    if !req.media_letter.is_empty()
        && req.media_letter != " "
        && req.media_letter != model.media_letter
    {
        return Err(HandlerError::code(codes::EINVAL));
    }
    req.media_letter = model.media_letter.clone();

    let mut library = tx
        .get_library(&req.library)
        .map_err(|err| not_found_becomes(err, "No such library"))?;
    tx.get_dgnmap(&req.model, &req.library)
        .map_err(|err| not_found_becomes(err, "Combination library/model does not exist"))?;
    let denmap = tx
        .get_denmap(&req.model, &req.media_letter, &req.density)
        .map_err(|err| not_found_becomes(err, "Unsupported density for this model"))?;

    let tape = TapeVolume {
        vid: req.vid.clone(),
        vsn: req.vsn,
        library: req.library,
        density: req.density,
        lbltype: req.lbltype,
        model: req.model,
        media_letter: req.media_letter,
        manufacturer: req.manufacturer,
        sn: req.sn,
        nbsides: req.nbsides,
        etime: now,
        rhost: "N/A".into(),
        whost: "N/A".into(),
        ..Default::default()
    };
    tx.insert_tape(tape)?;

    for side in 0..req.nbsides {
        tx.insert_side(TapeSide {
            vid: req.vid.clone(),
            side,
            poolname: req.poolname.clone(),
            status: req.side_status,
            estimated_free_space: denmap.native_capacity,
            nbfiles: 0,
        })?;
        pool.capacity += denmap.native_capacity;
        // A side entered FULL may still report free space; count it.
        if req.side_status == 0 || req.side_status == status::TAPE_FULL {
            pool.tot_free_space += denmap.native_capacity;
        }
    }

    library.nb_free_slots -= 1;
    tx.update_library(&library)?;
    tx.update_pool(&pool)?;
    Ok(())
}

/// Picks a side of `pool` able to hold `size` bytes, marks the whole
/// volume busy and bumps the serving device group's weight. A pool without
/// a single free side is `ENOSPC`.
pub fn allocate_side(
    tx: &mut Transaction<'_>,
    pool: &str,
    size: u64,
) -> Result<Allocation, HandlerError> {
    let mut side = tx.side_for_write(pool, size).map_err(|err| {
        if err.code() == codes::ENOENT {
            HandlerError::code(codes::ENOSPC)
        } else {
            err.into()
        }
    })?;

    side.status = status::TAPE_BUSY;
    tx.update_side(&side)?;

    let tape = tx.get_tape(&side.vid)?;

    // The volume mounts as a whole: no sibling side may be handed out
    // while this one is in use.
    for i in 0..tape.nbsides {
        if i == side.side {
            continue;
        }
        let mut sibling = tx.get_side(&side.vid, i)?;
        if sibling.is_free() {
            sibling.status = status::TAPE_BUSY;
            tx.update_side(&sibling)?;
        }
    }

    let mapping = tx.get_dgnmap(&tape.model, &tape.library)?;
    let mut weight = tx
        .get_weight(&mapping.dgn)
        .unwrap_or_else(|_| DeviceGroupWeight {
            dgn: mapping.dgn.clone(),
            weight: 0,
            delta_weight: 1,
        });
    weight.weight += weight.delta_weight;
    tx.put_weight(weight);

    let fseq = side.nbfiles + 1;
    info!(
        "event=side_allocated pool={} vid={} side={} fseq={} free={}",
        pool, side.vid, side.side, fseq, side.estimated_free_space
    );
    Ok(Allocation {
        vid: tape.vid,
        vsn: tape.vsn,
        dgn: mapping.dgn,
        density: tape.density,
        lbltype: tape.lbltype,
        model: tape.model,
        side: side.side,
        fseq,
        estimated_free_space: side.estimated_free_space,
    })
}

/// Post-write accounting parameters.
#[derive(Debug, Clone, Copy)]
pub struct WriteAccounting {
    pub bytes_written: u64,
    /// Percentage; 0 means "no compression information", use raw bytes.
    pub compression_factor: u16,
    pub files_written: u16,
    pub flags: i32,
}

/// Applies the outcome of a write session to a side and its pool.
pub fn update_after_write(
    tx: &mut Transaction<'_>,
    vid: &str,
    side_index: u16,
    acct: WriteAccounting,
) -> Result<(), HandlerError> {
    let mut side = tx.get_side(vid, side_index)?;
    let mut pool = tx.get_pool(&side.poolname)?;

    let normalized = if acct.bytes_written == 0 {
        0
    } else if acct.compression_factor == 0 {
        acct.bytes_written
    } else {
        acct.bytes_written * 100 / u64::from(acct.compression_factor)
    };
    // Consumption can never exceed what the side still reported free.
    let normalized = normalized.min(side.estimated_free_space);

    side.estimated_free_space -= normalized;
    side.nbfiles += i32::from(acct.files_written);
    side.status &= !status::TAPE_BUSY;
    side.status |= acct.flags;
    if side.estimated_free_space == 0 {
        side.status |= status::TAPE_FULL;
    }
    tx.update_side(&side)?;

    if acct.flags & status::TAPE_BUSY == 0 {
        // The session is over: release every sibling side, propagating
        // EXPORTED when the caller is exporting the cartridge.
        let tape = tx.get_tape(vid)?;
        for i in 0..tape.nbsides {
            if i == side.side {
                continue;
            }
            let mut sibling = tx.get_side(vid, i)?;
            if sibling.status & status::TAPE_BUSY == 0 && acct.flags == 0 {
                continue;
            }
            sibling.status &= !status::TAPE_BUSY;
            if acct.flags & status::EXPORTED != 0 {
                sibling.status |= status::EXPORTED;
            }
            tx.update_side(&sibling)?;
        }
    }

    if normalized > 0 {
        pool.tot_free_space = pool.tot_free_space.saturating_sub(normalized);
        tx.update_pool(&pool)?;
    }
    Ok(())
}

/// Resets a volume's content accounting: all sides back to native
/// capacity, no files, status clear.
pub fn reclaim_volume(tx: &mut Transaction<'_>, vid: &str) -> Result<(), HandlerError> {
    let tape = tx.get_tape(vid)?;
    let denmap = tx.get_denmap(&tape.model, &tape.media_letter, &tape.density)?;

    let mut pool = None;
    for i in 0..tape.nbsides {
        let mut side = tx.get_side(vid, i)?;
        let mut pool_entry = match pool.take() {
            Some(entry) => entry,
            None => tx.get_pool(&side.poolname)?,
        };

        // Space this side already contributed to the pool's free total.
        let counted = if side.is_free() {
            side.estimated_free_space
        } else {
            0
        };
        pool_entry.tot_free_space += denmap.native_capacity.saturating_sub(counted);

        side.estimated_free_space = denmap.native_capacity;
        side.nbfiles = 0;
        side.status = 0;
        tx.update_side(&side)?;
        pool = Some(pool_entry);
    }
    if let Some(pool) = pool {
        tx.update_pool(&pool)?;
    }
    Ok(())
}

/// Removes a volume once no side holds files any more, releasing its
/// library slot and pool capacity.
pub fn delete_volume(tx: &mut Transaction<'_>, vid: &str) -> Result<(), HandlerError> {
    let tape = tx.get_tape(vid)?;

    match tx.delete_tag(vid) {
        Ok(()) | Err(crate::error::StoreError::NotFound { .. }) => {}
        Err(err) => return Err(err.into()),
    }

    let denmap = tx.get_denmap(&tape.model, &tape.media_letter, &tape.density)?;

    let mut pool = None;
    for i in 0..tape.nbsides {
        let side = tx.get_side(vid, i)?;
        if side.nbfiles != 0 {
            return Err(HandlerError::code(codes::EEXIST));
        }
        let mut pool_entry = match pool.take() {
            Some(entry) => entry,
            None => tx.get_pool(&side.poolname)?,
        };
        pool_entry.capacity -= denmap.native_capacity;
        if side.is_free() {
            pool_entry.tot_free_space =
                pool_entry.tot_free_space.saturating_sub(side.estimated_free_space);
        }
        tx.delete_side(vid, i)?;
        pool = Some(pool_entry);
    }
    tx.delete_tape(vid)?;

    let mut library = tx.get_library(&tape.library)?;
    library.nb_free_slots += 1;
    tx.update_library(&library)?;
    if let Some(pool) = pool {
        tx.update_pool(&pool)?;
    }
    Ok(())
}

/// Parameters of a volume modification; empty strings leave the field
/// unchanged, a negative status leaves the status bits unchanged.
#[derive(Debug, Clone, Default)]
pub struct ModifyVolume {
    pub vid: String,
    pub vsn: String,
    pub library: String,
    pub density: String,
    pub lbltype: String,
    pub manufacturer: String,
    pub sn: String,
    pub poolname: String,
    pub status: i32,
}

/// Mutates an existing volume, keeping library slot counts and the pool
/// capacity/free-space aggregates consistent through library moves,
/// density changes, pool moves and status flips.
pub fn modify_volume(tx: &mut Transaction<'_>, req: ModifyVolume) -> Result<(), HandlerError> {
    if !req.lbltype.is_empty() && !LABEL_TYPES.contains(&req.lbltype.as_str()) {
        return Err(HandlerError::code(codes::EINVAL));
    }

    let mut tape = tx.get_tape(&req.vid)?;
    let mut need_update = false;

    if !req.vsn.is_empty() && req.vsn != tape.vsn {
        tape.vsn = req.vsn.clone();
        need_update = true;
    }

    if !req.library.is_empty() && req.library != tape.library {
        let mut new_library = tx
            .get_library(&req.library)
            .map_err(|err| not_found_becomes(err, "No such library"))?;
        tx.get_dgnmap(&tape.model, &req.library)
            .map_err(|err| not_found_becomes(err, "Combination library/model does not exist"))?;
        new_library.nb_free_slots -= 1;
        tx.update_library(&new_library)?;

        let mut old_library = tx.get_library(&tape.library)?;
        old_library.nb_free_slots += 1;
        tx.update_library(&old_library)?;

        tape.library = req.library.clone();
        need_update = true;
    }

    let old_denmap = tx.get_denmap(&tape.model, &tape.media_letter, &tape.density)?;
    let mut capacity_changed = false;
    let mut density_changed = false;
    let denmap = if !req.density.is_empty() && req.density != tape.density {
        let denmap = tx
            .get_denmap(&tape.model, &tape.media_letter, &req.density)
            .map_err(|err| not_found_becomes(err, "Unsupported density for this model"))?;
        tape.density = req.density.clone();
        density_changed = true;
        capacity_changed = denmap.native_capacity != old_denmap.native_capacity;
        need_update = true;
        denmap
    } else {
        old_denmap.clone()
    };

    let mut lbltype_changed = false;
    if !req.lbltype.is_empty() && req.lbltype != tape.lbltype {
        tape.lbltype = req.lbltype.clone();
        lbltype_changed = true;
        need_update = true;
    }
    if !req.manufacturer.is_empty() && req.manufacturer != tape.manufacturer {
        tape.manufacturer = req.manufacturer.clone();
        need_update = true;
    }
    if !req.sn.is_empty() && req.sn != tape.sn {
        tape.sn = req.sn.clone();
        need_update = true;
    }
    if need_update {
        tx.update_tape(&tape)?;
    }

    for i in 0..tape.nbsides {
        let mut side = tx.get_side(&req.vid, i)?;
        let mut side_dirty = false;
        let mut status = req.status;

        // Density and label rewrites are only legal on empty, idle sides.
        if (density_changed || lbltype_changed)
            && (side.nbfiles != 0 || side.status & status::TAPE_BUSY != 0)
        {
            return Err(HandlerError::code(codes::EEXIST));
        }

        if req.poolname.is_empty() || req.poolname == side.poolname {
            let usable_flip = (side.status & !status::TAPE_BUSY == 0
                && status & !status::TAPE_BUSY > 0)
                || (side.status & !status::TAPE_BUSY > 0 && status & !status::TAPE_BUSY == 0);
            if usable_flip || capacity_changed {
                let mut pool = tx.get_pool(&side.poolname)?;
                if capacity_changed {
                    pool.capacity = pool
                        .capacity
                        .wrapping_add(denmap.native_capacity)
                        .wrapping_sub(old_denmap.native_capacity);
                    if side.is_free() {
                        pool.tot_free_space =
                            pool.tot_free_space.saturating_sub(side.estimated_free_space);
                    }
                    side.estimated_free_space = denmap.native_capacity;
                    side_dirty = true;
                    if status == 0 || (status < 0 && side.is_free()) {
                        pool.tot_free_space += side.estimated_free_space;
                    }
                } else if status & !status::TAPE_BUSY != 0 {
                    pool.tot_free_space =
                        pool.tot_free_space.saturating_sub(side.estimated_free_space);
                } else {
                    pool.tot_free_space += side.estimated_free_space;
                }
                tx.update_pool(&pool)?;
            }
        } else {
            // Move to another pool.
            let mut old_pool = tx.get_pool(&side.poolname)?;
            old_pool.capacity = old_pool.capacity.saturating_sub(old_denmap.native_capacity);
            if side.is_free() {
                old_pool.tot_free_space =
                    old_pool.tot_free_space.saturating_sub(side.estimated_free_space);
            }
            tx.update_pool(&old_pool)?;

            if capacity_changed {
                side.estimated_free_space = denmap.native_capacity;
                side_dirty = true;
            }
            let mut new_pool = tx
                .get_pool(&req.poolname)
                .map_err(|err| not_found_becomes(err, "No such pool"))?;
            new_pool.capacity += denmap.native_capacity;
            if status == 0 || (status < 0 && side.is_free()) {
                new_pool.tot_free_space += side.estimated_free_space;
            }
            tx.update_pool(&new_pool)?;
            side.poolname = req.poolname.clone();
            side_dirty = true;
        }

        if status >= 0 {
            if side.estimated_free_space == 0 {
                status |= status::TAPE_FULL;
            }
            side.status = status;
            side_dirty = true;
        }
        if side_dirty {
            tx.update_side(&side)?;
        }
    }
    Ok(())
}

/// Records a mount event against the volume's read or write counters.
pub fn record_mount(
    tx: &mut Transaction<'_>,
    vid: &str,
    write_mode: bool,
    jid: i32,
    client_host: &str,
    now: i64,
) -> Result<(), HandlerError> {
    let mut tape = tx.get_tape(vid)?;
    let host = short_host(client_host);
    if write_mode {
        tape.wcount += 1;
        tape.whost = host;
        tape.wjid = jid;
        tape.wtime = now;
    } else {
        tape.rcount += 1;
        tape.rhost = host;
        tape.rjid = jid;
        tape.rtime = now;
    }
    tx.update_tape(&tape)?;
    Ok(())
}

/// True when (uid, gid) owns the pool holding side 0 of `vid`. A zero
/// owner field means unrestricted.
pub fn caller_owns_volume_pool(
    tx: &Transaction<'_>,
    vid: &str,
    uid: u32,
    gid: u32,
) -> Result<bool, HandlerError> {
    let side = tx.get_side(vid, 0)?;
    let pool = tx.get_pool(&side.poolname)?;
    Ok((pool.uid == 0 || pool.uid == uid) && (pool.gid == 0 || pool.gid == gid))
}

/// Insert-or-replace of the volume's annotation.
pub fn set_tag(tx: &mut Transaction<'_>, vid: &str, text: &str) -> Result<(), HandlerError> {
    let tag = Tag {
        vid: vid.to_string(),
        text: text.to_string(),
    };
    match tx.insert_tag(tag.clone()) {
        Ok(()) => Ok(()),
        Err(crate::error::StoreError::Exists { .. }) => {
            tx.update_tag(&tag)?;
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Strips the domain from a hostname; numeric addresses pass through.
fn short_host(host: &str) -> String {
    let short = match host.split('.').next() {
        Some(label) if !label.is_empty() && !label.chars().all(|c| c.is_ascii_digit()) => label,
        _ => host,
    };
    short.chars().take(limits::HOST - 1).collect()
}

fn not_found_becomes(err: crate::error::StoreError, text: &str) -> HandlerError {
    if err.code() == codes::ENOENT {
        HandlerError::with_text(codes::EINVAL, text)
    } else {
        err.into()
    }
}
