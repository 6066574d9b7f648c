// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use tracing::{debug, info, warn};

use crate::error::{QdlError, Result};
use crate::firehose::{
    firehose_configure, firehose_erase, firehose_fix_gpt, firehose_program, firehose_read_buffer,
    firehose_set_bootable, ERASE_MAX_SECTORS,
};
use crate::gpt::{self, entries_sectors, AbSlot, GPTPartitionEntry, Gpt};
use crate::sahara::{sahara_probe, sahara_upload_loader, DeviceMode};
use crate::sparse::Sparse;
use crate::types::QdlChan;

/// Partitions that survive an `erase_lun` by default.
pub const DEFAULT_PRESERVE: [&str; 3] = ["mbr", "gpt", "persist"];

/// Bring the device from whatever EDL state it's in to a configured
/// Firehose session. Returns the chip serial when Sahara handed it out.
pub fn connect<T: QdlChan>(channel: &mut T, programmer: &[u8]) -> Result<Option<String>> {
    if !channel.rw().connected() {
        return Err(QdlError::Connection("transport is not connected".to_string()));
    }

    let serial = match sahara_probe(channel)? {
        DeviceMode::Firehose => {
            info!("device is already running a Firehose loader");
            None
        }
        DeviceMode::Sahara => {
            let outcome = sahara_upload_loader(channel, programmer)?;
            if outcome.mode != DeviceMode::Firehose {
                return Err(QdlError::Connection(
                    "loader upload didn't end in Firehose".to_string(),
                ));
            }
            outcome.serial
        }
    };

    firehose_configure(channel)?;
    Ok(serial)
}

fn configured_luns<T: QdlChan>(channel: &T) -> Result<Vec<u8>> {
    let luns = channel.fh_config().luns.clone();
    if luns.is_empty() {
        return Err(QdlError::Validation {
            field: "luns",
            reason: "device is not configured yet".to_string(),
        });
    }
    Ok(luns)
}

fn gpt_view<T: QdlChan>(channel: &mut T, lun: u8, header_lba: u64) -> Result<Gpt> {
    let sector_size = channel.fh_config().storage_sector_size as u64;

    let hdr_buf = firehose_read_buffer(channel, lun, header_lba, 1)?;
    let (header, header_crc_ok) =
        gpt::parse_header(&hdr_buf, sector_size as usize, header_lba, lun)?;

    let esectors = entries_sectors(&header, sector_size);
    if esectors == 0 || esectors * sector_size > 16 * 1024 * 1024 {
        return Err(QdlError::gpt(
            lun,
            format!("implausible entry array of {esectors} sectors"),
        ));
    }
    let ebuf = firehose_read_buffer(channel, lun, header.partition_entry_lba, esectors)?;
    let (entries, entries_crc_ok) = gpt::parse_entries(&header, &ebuf, lun)?;

    Ok(Gpt {
        lun,
        sector_size,
        header,
        entries,
        header_crc_ok,
        entries_crc_ok,
    })
}

/// Read the partition table of one LUN.
///
/// With an explicit `sector`, returns exactly that view. Otherwise reads
/// both the primary and its alternate and reconciles: a corrupt primary
/// falls back to the backup, disagreement between two intact tables
/// prefers the primary, and two corrupt tables are an error. Nothing is
/// rewritten on the device here; that's what [`repair_gpt`] is for.
pub fn read_gpt<T: QdlChan>(channel: &mut T, lun: u8, sector: Option<u64>) -> Result<Gpt> {
    if let Some(lba) = sector {
        return gpt_view(channel, lun, lba);
    }

    let primary = gpt_view(channel, lun, 1)?;
    let primary_ok = primary.header_crc_ok && primary.entries_crc_ok;

    match gpt_view(channel, lun, primary.header.backup_lba) {
        Ok(backup) => {
            let backup_ok = backup.header_crc_ok && backup.entries_crc_ok;
            if !primary_ok && !backup_ok {
                Err(QdlError::gpt(
                    lun,
                    "both primary and backup tables are corrupt".to_string(),
                ))
            } else if !primary_ok {
                warn!("LUN {lun}: primary GPT is corrupt, using the backup");
                Ok(backup)
            } else {
                if primary.header.partition_entry_array_crc32
                    != backup.header.partition_entry_array_crc32
                {
                    warn!(
                        "LUN {lun}: primary and backup entry arrays disagree, preferring the primary"
                    );
                }
                Ok(primary)
            }
        }
        Err(e) => {
            if primary_ok {
                warn!("LUN {lun}: couldn't read the backup GPT: {e}");
                Ok(primary)
            } else {
                Err(QdlError::gpt(
                    lun,
                    "both primary and backup tables are corrupt".to_string(),
                ))
            }
        }
    }
}

/// Scan every LUN for a partition by name.
pub fn find_partition<T: QdlChan>(
    channel: &mut T,
    name: &str,
) -> Result<Option<(Gpt, GPTPartitionEntry)>> {
    for lun in configured_luns(channel)? {
        let gpt = match read_gpt(channel, lun, None) {
            Ok(gpt) => gpt,
            Err(e) => {
                debug!("skipping LUN {lun} while looking for '{name}': {e}");
                continue;
            }
        };
        if let Some(entry) = gpt.find_partition(name) {
            let entry = entry.clone();
            return Ok(Some((gpt, entry)));
        }
    }
    Ok(None)
}

/// Erase a sector range, split into device-digestible calls.
pub fn erase_range<T: QdlChan>(channel: &mut T, lun: u8, start: u64, num: u64) -> Result<bool> {
    let mut start = start;
    let mut left = num;
    while left > 0 {
        let n = left.min(ERASE_MAX_SECTORS);
        if !firehose_erase(channel, lun, start, n)? {
            warn!("erase of {n} sectors at LUN {lun}:{start} failed");
            return Ok(false);
        }
        start += n;
        left -= n;
    }
    Ok(true)
}

/// Erase one named partition.
pub fn erase_partition<T: QdlChan>(channel: &mut T, name: &str) -> Result<bool> {
    let Some((gpt, part)) = find_partition(channel, name)? else {
        return Err(QdlError::flash(name, "partition not found on any LUN"));
    };
    let num_sectors = part.ending_lba - part.starting_lba + 1;

    info!(
        "erasing '{name}' on LUN {}: {num_sectors} sectors at {}",
        gpt.lun, part.starting_lba
    );
    erase_range(channel, gpt.lun, part.starting_lba, num_sectors)
}

/// Flash a blob into a named partition, expanding sparse images on the fly.
pub fn flash_blob<T: QdlChan>(
    channel: &mut T,
    name: &str,
    blob: &[u8],
    mut on_progress: Option<&mut dyn FnMut(u64)>,
) -> Result<bool> {
    if name.eq_ignore_ascii_case("gpt") {
        warn!("refusing to flash over the partition table; use repair_gpt instead");
        return Ok(true);
    }

    let Some((gpt, part)) = find_partition(channel, name)? else {
        return Err(QdlError::flash(name, "partition not found on any LUN"));
    };
    let lun = gpt.lun;
    let sector_size = gpt.sector_size;
    let part_sectors = part.ending_lba - part.starting_lba + 1;

    let blob_sectors = (blob.len() as u64).div_ceil(sector_size);
    if blob_sectors > part_sectors {
        return Err(QdlError::flash(
            name,
            format!("image needs {blob_sectors} sectors, partition has {part_sectors}"),
        ));
    }

    let Some(sparse) = Sparse::from(blob)? else {
        info!("flashing '{name}' on LUN {lun}: {} bytes", blob.len());
        return firehose_program(channel, lun, part.starting_lba, blob, on_progress);
    };

    let expanded_sectors = sparse.expanded_size().div_ceil(sector_size);
    if expanded_sectors > part_sectors {
        return Err(QdlError::flash(
            name,
            format!(
                "sparse image expands to {expanded_sectors} sectors, partition has {part_sectors}"
            ),
        ));
    }

    info!(
        "flashing '{name}' on LUN {lun}: sparse image, {} bytes expanded",
        sparse.expanded_size()
    );

    // Holes are never streamed, so the range has to start out clean
    if !erase_range(channel, lun, part.starting_lba, part_sectors)? {
        return Ok(false);
    }

    for seg in sparse.read() {
        let seg = seg?;
        let Some(data) = seg.data else { continue };

        if seg.offset % sector_size != 0 {
            return Err(QdlError::flash(
                name,
                format!("sparse segment offset {:#x} is not sector-aligned", seg.offset),
            ));
        }
        let sector = part.starting_lba + seg.offset / sector_size;

        let base = seg.offset;
        let ok = match on_progress.as_mut() {
            Some(cb) => {
                let mut adapter = |n: u64| cb(base + n);
                firehose_program(channel, lun, sector, &data, Some(&mut adapter))?
            }
            None => firehose_program(channel, lun, sector, &data, None)?,
        };
        if !ok {
            return Ok(false);
        }
    }

    if let Some(cb) = on_progress.as_mut() {
        cb(sparse.expanded_size());
    }
    Ok(true)
}

pub(crate) fn coalesce_ranges(mut ranges: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    ranges.sort_unstable();
    let mut out: Vec<(u64, u64)> = vec![];
    for (start, end) in ranges {
        if let Some(last) = out.last_mut() {
            if start <= last.1.saturating_add(1) {
                last.1 = last.1.max(end);
                continue;
            }
        }
        out.push((start, end));
    }
    out
}

pub(crate) fn invert_ranges(protected: &[(u64, u64)], max_lba: u64) -> Vec<(u64, u64)> {
    let mut out = vec![];
    let mut cursor = 0u64;
    for &(start, end) in protected {
        if start > cursor {
            out.push((cursor, start - 1));
        }
        cursor = cursor.max(end.saturating_add(1));
    }
    if cursor <= max_lba {
        out.push((cursor, max_lba));
    }
    out
}

/// Wipe a LUN except for the protective MBR, both GPT areas and any
/// partitions named in `preserve`.
pub fn erase_lun<T: QdlChan>(channel: &mut T, lun: u8, preserve: &[&str]) -> Result<bool> {
    let gpt = read_gpt(channel, lun, None)?;
    let header = &gpt.header;

    let mut protected: Vec<(u64, u64)> = vec![];
    for name in preserve {
        match *name {
            "mbr" => protected.push((0, 0)),
            "gpt" => {
                protected.push((header.primary_lba, header.first_usable_lba.saturating_sub(1)));
                protected.push((header.last_usable_lba + 1, header.backup_lba));
            }
            name => {
                if let Some(part) = gpt.find_partition(name) {
                    protected.push((part.starting_lba, part.ending_lba));
                }
            }
        }
    }

    let protected = coalesce_ranges(protected);
    let erasable = invert_ranges(&protected, header.backup_lba);

    for &(start, end) in &erasable {
        info!("erasing LUN {lun} sectors {start}..={end}");
        if !erase_range(channel, lun, start, end - start + 1)? {
            warn!("erase of LUN {lun} aborted in sectors {start}..={end}");
            return Ok(false);
        }
    }
    Ok(true)
}

/// Rewrite the primary GPT from `primary_blob` (PMBR + header + entries),
/// have the loader sanity-check it, then mirror it into the backup slots.
pub fn repair_gpt<T: QdlChan>(channel: &mut T, lun: u8, primary_blob: &[u8]) -> Result<()> {
    info!("rewriting the primary GPT on LUN {lun}");
    if !firehose_program(channel, lun, 0, primary_blob, None)? {
        return Err(QdlError::gpt(lun, "device rejected the primary GPT image".to_string()));
    }

    firehose_fix_gpt(channel, lun)?;

    let primary = read_gpt(channel, lun, Some(1))?;
    let mut alt = primary.as_alternate();
    let entries = alt.build_entries()?;
    let header = alt.build_header(Some(&entries))?;

    if !firehose_program(channel, lun, alt.header.partition_entry_lba, &entries, None)? {
        return Err(QdlError::gpt(lun, "couldn't write the backup entry array".to_string()));
    }
    if !firehose_program(channel, lun, alt.header.primary_lba, &header, None)? {
        return Err(QdlError::gpt(lun, "couldn't write the backup header".to_string()));
    }

    Ok(())
}

/// The active slot, as seen by the first LUN that carries slotted
/// partitions; `'a'` when nothing does.
pub fn get_active_slot<T: QdlChan>(channel: &mut T) -> Result<char> {
    for lun in configured_luns(channel)? {
        let gpt = match read_gpt(channel, lun, None) {
            Ok(gpt) => gpt,
            Err(e) => {
                debug!("skipping LUN {lun} while looking for the active slot: {e}");
                continue;
            }
        };
        if gpt.partitions().any(|e| e.slot_suffix().is_some()) {
            return Ok(gpt.get_active_slot());
        }
    }
    Ok('a')
}

/// Flip every LUN's slotted partitions to `slot` and point the boot LUN
/// at the matching XBL copy.
pub fn set_active_slot<T: QdlChan>(channel: &mut T, slot: char) -> Result<()> {
    if slot != 'a' && slot != 'b' {
        return Err(QdlError::Validation {
            field: "slot",
            reason: format!("expected 'a' or 'b', got '{slot}'"),
        });
    }

    for lun in configured_luns(channel)? {
        let mut gpt = read_gpt(channel, lun, None)?;
        if !gpt.partitions().any(|e| e.slot_suffix().is_some()) {
            continue;
        }

        gpt.set_active_slot(slot)?;
        let entries = gpt.build_entries()?;
        let header = gpt.build_header(Some(&entries))?;

        if !firehose_program(channel, lun, gpt.header.partition_entry_lba, &entries, None)? {
            return Err(QdlError::gpt(lun, "couldn't write the updated entry array".to_string()));
        }
        if !firehose_program(channel, lun, gpt.header.primary_lba, &header, None)? {
            return Err(QdlError::gpt(lun, "couldn't write the updated header".to_string()));
        }
    }

    firehose_set_bootable(channel, if slot == 'a' { 1 } else { 2 })
}
