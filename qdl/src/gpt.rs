// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::io::Cursor;

use tracing::warn;

use crate::error::{QdlError, Result};

pub use gptman::{GPTHeader, GPTPartitionEntry};

pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
pub const GPT_REVISION: u32 = 0x0001_0000;
pub const GPT_HEADER_MIN_SIZE: usize = 92;

// A/B scheme attribute flags, in the byte at bit offset 48
const AB_FLAG_SHIFT: u32 = 48;
const AB_SLOT_ACTIVE: u64 = 1 << 2;
const AB_BOOT_SUCCESSFUL: u64 = 1 << 6;
const AB_UNBOOTABLE: u64 = 1 << 7;
const AB_TRIES_SHIFT: u32 = 8;
const AB_TRIES_MASK: u64 = 0xF << AB_TRIES_SHIFT;
const AB_ALL: u64 = AB_SLOT_ACTIVE | AB_BOOT_SUCCESSFUL | AB_UNBOOTABLE | AB_TRIES_MASK;

/// Mixed-endian GUID rendering: the first three groups are little-endian
/// fields, the last two are big-endian byte runs.
pub fn format_guid(guid: &[u8; 16]) -> String {
    format!(
        "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        u32::from_le_bytes(guid[0..4].try_into().unwrap()),
        u16::from_le_bytes([guid[4], guid[5]]),
        u16::from_le_bytes([guid[6], guid[7]]),
        guid[8],
        guid[9],
        guid[10],
        guid[11],
        guid[12],
        guid[13],
        guid[14],
        guid[15],
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AbFlags {
    pub active: bool,
    pub successful: bool,
    pub unbootable: bool,
    pub tries_remaining: u8,
}

/// A/B slot state layered over a partition entry's raw `attribute_bits`.
pub trait AbSlot {
    /// `Some('a')`/`Some('b')` for slotted partition names.
    fn slot_suffix(&self) -> Option<char>;
    fn ab_flags(&self) -> AbFlags;
    fn set_ab_flags(&mut self, flags: AbFlags);
}

impl AbSlot for GPTPartitionEntry {
    fn slot_suffix(&self) -> Option<char> {
        let name = self.partition_name.as_str();
        if name.ends_with("_a") {
            Some('a')
        } else if name.ends_with("_b") {
            Some('b')
        } else {
            None
        }
    }

    fn ab_flags(&self) -> AbFlags {
        let ab = self.attribute_bits >> AB_FLAG_SHIFT;
        AbFlags {
            active: ab & AB_SLOT_ACTIVE != 0,
            successful: ab & AB_BOOT_SUCCESSFUL != 0,
            unbootable: ab & AB_UNBOOTABLE != 0,
            tries_remaining: ((ab & AB_TRIES_MASK) >> AB_TRIES_SHIFT) as u8,
        }
    }

    fn set_ab_flags(&mut self, flags: AbFlags) {
        let mut ab = 0u64;
        if flags.active {
            ab |= AB_SLOT_ACTIVE;
        }
        if flags.successful {
            ab |= AB_BOOT_SUCCESSFUL;
        }
        if flags.unbootable {
            ab |= AB_UNBOOTABLE;
        }
        ab |= ((flags.tries_remaining as u64) << AB_TRIES_SHIFT) & AB_TRIES_MASK;

        self.attribute_bits =
            (self.attribute_bits & !(AB_ALL << AB_FLAG_SHIFT)) | ab << AB_FLAG_SHIFT;
    }
}

/// Sectors occupied by the partition entry array.
pub fn entries_sectors(header: &GPTHeader, sector_size: u64) -> u64 {
    (header.number_of_partition_entries as u64 * header.size_of_partition_entry as u64)
        .div_ceil(sector_size)
}

/// Decode one header sector. Signature, revision and size violations are
/// hard errors; a CRC32 mismatch is reported through the status flag so
/// callers can reconcile against the alternate table.
pub fn parse_header(
    buf: &[u8],
    sector_size: usize,
    read_lba: u64,
    lun: u8,
) -> Result<(GPTHeader, bool)> {
    if buf.len() < GPT_HEADER_MIN_SIZE {
        return Err(QdlError::gpt(lun, format!("short header read ({} bytes)", buf.len())));
    }
    if &buf[0..8] != GPT_SIGNATURE {
        return Err(QdlError::gpt(lun, "bad signature".to_string()));
    }
    if buf[8..12] != GPT_REVISION.to_le_bytes() {
        return Err(QdlError::gpt(lun, "bad revision".to_string()));
    }

    let header: GPTHeader = bincode::deserialize_from(&mut Cursor::new(buf))
        .map_err(|e| QdlError::gpt(lun, format!("couldn't parse the header: {e}")))?;

    let header_size = header.header_size as usize;
    if header_size < GPT_HEADER_MIN_SIZE || header_size > sector_size || header_size > buf.len() {
        return Err(QdlError::gpt(lun, format!("implausible header size {header_size}")));
    }

    if header.primary_lba != read_lba {
        warn!(
            "LUN {lun}: GPT header read from LBA {read_lba} claims to live at LBA {}",
            header.primary_lba
        );
    }

    // Checksum status per the standard: field zeroed, header_size bytes
    let mut scratch = buf[..header_size].to_vec();
    scratch[16..20].fill(0);
    let crc_ok = crc32fast::hash(&scratch) == header.crc32_checksum;

    Ok((header, crc_ok))
}

/// Decode the entry array that belongs to `header`. Short buffers are hard
/// errors; a CRC32 mismatch comes back as a status flag.
pub fn parse_entries(
    header: &GPTHeader,
    buf: &[u8],
    lun: u8,
) -> Result<(Vec<GPTPartitionEntry>, bool)> {
    let entry_size = header.size_of_partition_entry as usize;
    let total = header.number_of_partition_entries as usize * entry_size;
    if entry_size < 128 {
        return Err(QdlError::gpt(lun, format!("implausible entry size {entry_size}")));
    }
    if buf.len() < total {
        return Err(QdlError::gpt(
            lun,
            format!("entry array needs {total} bytes, got {}", buf.len()),
        ));
    }

    let crc_ok = crc32fast::hash(&buf[..total]) == header.partition_entry_array_crc32;

    let mut entries = Vec::with_capacity(header.number_of_partition_entries as usize);
    for i in 0..header.number_of_partition_entries as usize {
        let entry = GPTPartitionEntry::read_from(&mut Cursor::new(&buf[i * entry_size..]))
            .map_err(|e| QdlError::gpt(lun, format!("couldn't parse entry {i}: {e}")))?;
        entries.push(entry);
    }

    Ok((entries, crc_ok))
}

/// One parsed view of a partition table, tied to the LUN it was read from.
#[derive(Debug, Clone)]
pub struct Gpt {
    pub lun: u8,
    pub sector_size: u64,
    pub header: GPTHeader,
    pub entries: Vec<GPTPartitionEntry>,
    pub header_crc_ok: bool,
    pub entries_crc_ok: bool,
}

impl Gpt {
    pub fn build_entries(&self) -> Result<Vec<u8>> {
        let entry_size = self.header.size_of_partition_entry as usize;
        let mut buf = Vec::with_capacity(self.entries.len() * entry_size);
        for (i, entry) in self.entries.iter().enumerate() {
            let mut cur = Cursor::new(Vec::with_capacity(entry_size));
            bincode::serialize_into(&mut cur, entry)
                .map_err(|e| QdlError::gpt(self.lun, format!("couldn't serialize entry {i}: {e}")))?;
            let mut one = cur.into_inner();
            one.resize(entry_size, 0);
            buf.extend(one);
        }
        Ok(buf)
    }

    /// Serialize the header, recomputing both CRCs. Pass a pre-built entry
    /// array to avoid serializing it twice when writing both to disk.
    pub fn build_header(&mut self, entries: Option<&[u8]>) -> Result<Vec<u8>> {
        let owned;
        let entry_bytes = match entries {
            Some(e) => e,
            None => {
                owned = self.build_entries()?;
                &owned
            }
        };

        self.header.partition_entry_array_crc32 = crc32fast::hash(entry_bytes);

        let header_size = self.header.header_size as usize;
        if header_size < GPT_HEADER_MIN_SIZE {
            return Err(QdlError::gpt(self.lun, format!("implausible header size {header_size}")));
        }

        let mut cur = Cursor::new(Vec::with_capacity(header_size));
        bincode::serialize_into(&mut cur, &self.header)
            .map_err(|e| QdlError::gpt(self.lun, format!("couldn't serialize the header: {e}")))?;
        let mut buf = cur.into_inner();
        // Bytes past the serialized struct are reserved and read as zero
        buf.resize(header_size, 0);

        buf[16..20].fill(0);
        let header_crc = crc32fast::hash(&buf);
        if header_crc == 0 || self.header.partition_entry_array_crc32 == 0 {
            return Err(QdlError::gpt(self.lun, "refusing to emit a zero CRC32".to_string()));
        }
        self.header.crc32_checksum = header_crc;
        buf[16..20].copy_from_slice(&header_crc.to_le_bytes());

        self.header_crc_ok = true;
        self.entries_crc_ok = true;

        Ok(buf)
    }

    /// A fresh view describing the backup table: primary/backup LBAs
    /// swapped, entries relocated to just below the backup header, the
    /// entry array cloned verbatim.
    pub fn as_alternate(&self) -> Gpt {
        let mut alt = self.clone();
        alt.header.primary_lba = self.header.backup_lba;
        alt.header.backup_lba = self.header.primary_lba;
        alt.header.partition_entry_lba =
            self.header.backup_lba - entries_sectors(&self.header, self.sector_size);
        alt
    }

    /// Present entries only.
    pub fn partitions(&self) -> impl Iterator<Item = &GPTPartitionEntry> {
        self.entries.iter().filter(|e| e.is_used())
    }

    pub fn find_partition(&self, name: &str) -> Option<&GPTPartitionEntry> {
        self.partitions().find(|e| e.partition_name.as_str() == name)
    }

    pub(crate) fn find_active_slot(&self) -> Option<char> {
        self.partitions()
            .filter(|e| e.slot_suffix().is_some())
            .find(|e| e.ab_flags().active)
            .and_then(|e| e.slot_suffix())
    }

    /// The suffix letter of the first slotted partition with the active
    /// attribute set; `'a'` when nothing is marked.
    pub fn get_active_slot(&self) -> char {
        self.find_active_slot().unwrap_or('a')
    }

    /// Retarget every slotted entry at `slot`. Entries of the boot
    /// partition drive the actual slot choice; the rest become inert
    /// mirrors (unbootable, not successful) for the inactive slot.
    pub fn set_active_slot(&mut self, slot: char) -> Result<()> {
        if slot != 'a' && slot != 'b' {
            return Err(QdlError::Validation {
                field: "slot",
                reason: format!("expected 'a' or 'b', got '{slot}'"),
            });
        }

        for entry in self.entries.iter_mut().filter(|e| e.is_used()) {
            let Some(suffix) = entry.slot_suffix() else {
                continue;
            };
            let active = suffix == slot;

            let mut flags = AbFlags {
                active,
                ..Default::default()
            };
            let name = entry.partition_name.as_str();
            if name == "boot_a" || name == "boot_b" {
                flags.successful = active;
            } else {
                flags.unbootable = true;
                flags.successful = false;
            }
            entry.set_ab_flags(flags);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{gpt_entry, gpt_entry_bytes, gpt_header_bytes, sample_gpt, GPT_SECTOR};

    fn slotted_gpt(lun: u8) -> Gpt {
        sample_gpt(
            lun,
            vec![
                gpt_entry("persist", 6, 261, 1),
                gpt_entry("boot_a", 262, 517, 2),
                gpt_entry("boot_b", 518, 773, 3),
                gpt_entry("system_a", 774, 1029, 4),
                gpt_entry("system_b", 1030, 1285, 5),
            ],
        )
    }

    #[test]
    fn header_round_trip() {
        let mut gpt = slotted_gpt(0);
        let entries = gpt.build_entries().unwrap();
        let header = gpt.build_header(Some(&entries)).unwrap();

        let (parsed, crc_ok) = parse_header(&header, GPT_SECTOR as usize, 1, 0).unwrap();
        assert!(crc_ok);
        assert_eq!(parsed.primary_lba, gpt.header.primary_lba);
        assert_eq!(parsed.backup_lba, gpt.header.backup_lba);
        assert_eq!(parsed.partition_entry_lba, gpt.header.partition_entry_lba);
        assert_eq!(parsed.number_of_partition_entries, 5);
        assert_eq!(parsed.partition_entry_array_crc32, gpt.header.partition_entry_array_crc32);
        assert_eq!(parsed.crc32_checksum, gpt.header.crc32_checksum);

        let (parsed_entries, entries_ok) = parse_entries(&parsed, &entries, 0).unwrap();
        assert!(entries_ok);
        assert_eq!(gpt_entry_bytes(&parsed_entries), entries);
        assert_eq!(parsed_entries[1].partition_name.as_str(), "boot_a");
        assert_eq!(parsed_entries[1].starting_lba, 262);
    }

    #[test]
    fn rejects_bad_signature_and_revision() {
        let good = gpt_header_bytes(1, 0xDEAD, 1, 8191, 2, 4, 8188);

        let mut bad_sig = good.clone();
        bad_sig[0] = b'X';
        assert!(parse_header(&bad_sig, GPT_SECTOR as usize, 1, 3).is_err());

        let mut bad_rev = good.clone();
        bad_rev[8..12].copy_from_slice(&0x00020000u32.to_le_bytes());
        assert!(parse_header(&bad_rev, GPT_SECTOR as usize, 1, 3).is_err());
    }

    #[test]
    fn crc_mismatch_is_a_status_not_an_error() {
        let mut header = gpt_header_bytes(1, 0xDEAD, 1, 8191, 2, 4, 8188);
        header[40] ^= 0xFF;

        let (_, crc_ok) = parse_header(&header, GPT_SECTOR as usize, 1, 0).unwrap();
        assert!(!crc_ok);
    }

    #[test]
    fn header_size_bounds() {
        // 92 bytes is the minimum and what the fixture emits
        let min = gpt_header_bytes(1, 0xDEAD, 1, 8191, 2, 4, 8188);
        let (parsed, crc_ok) = parse_header(&min, GPT_SECTOR as usize, 1, 0).unwrap();
        assert!(crc_ok);
        assert_eq!(parsed.header_size, 92);

        // A sector-sized header with a reserved zero tail is still valid
        let mut max = min.clone();
        max.resize(GPT_SECTOR as usize, 0);
        max[12..16].copy_from_slice(&(GPT_SECTOR as u32).to_le_bytes());
        max[16..20].fill(0);
        let crc = crc32fast::hash(&max);
        max[16..20].copy_from_slice(&crc.to_le_bytes());

        let (parsed, crc_ok) = parse_header(&max, GPT_SECTOR as usize, 1, 0).unwrap();
        assert!(crc_ok);
        assert_eq!(parsed.header_size, GPT_SECTOR as u32);

        // Anything past the sector is rejected outright
        let mut too_big = min.clone();
        too_big[12..16].copy_from_slice(&(GPT_SECTOR as u32 + 1).to_le_bytes());
        assert!(parse_header(&too_big, GPT_SECTOR as usize, 1, 0).is_err());
    }

    #[test]
    fn alternate_view() {
        let gpt = slotted_gpt(0);
        let alt = gpt.as_alternate();

        assert_eq!(alt.header.primary_lba, 8191);
        assert_eq!(alt.header.backup_lba, 1);
        // 5 entries * 128 B round up to two sectors of 512
        assert_eq!(alt.header.partition_entry_lba, 8189);
        assert_eq!(alt.entries.len(), gpt.entries.len());
        assert_eq!(
            alt.header.partition_entry_array_crc32,
            gpt.header.partition_entry_array_crc32
        );
    }

    #[test]
    fn slot_toggle() {
        let mut gpt = slotted_gpt(4);

        // Nothing marked yet: documented fallback
        assert_eq!(gpt.get_active_slot(), 'a');

        gpt.set_active_slot('a').unwrap();
        assert_eq!(gpt.get_active_slot(), 'a');

        gpt.set_active_slot('b').unwrap();
        assert_eq!(gpt.get_active_slot(), 'b');

        let flags = gpt.find_partition("boot_b").unwrap().ab_flags();
        assert!(flags.active && flags.successful && !flags.unbootable);

        let flags = gpt.find_partition("boot_a").unwrap().ab_flags();
        assert!(!flags.active && !flags.successful);

        let flags = gpt.find_partition("system_a").unwrap().ab_flags();
        assert!(!flags.active && flags.unbootable && !flags.successful);
        assert_eq!(flags.tries_remaining, 0);

        let header = gpt.build_header(None).unwrap();
        assert_ne!(u32::from_le_bytes(header[16..20].try_into().unwrap()), 0);
        assert_ne!(gpt.header.partition_entry_array_crc32, 0);

        // Unslotted partitions are left alone
        assert_eq!(gpt.find_partition("persist").unwrap().attribute_bits, 0);
    }

    #[test]
    fn rejects_bogus_slot() {
        let mut gpt = slotted_gpt(0);
        assert!(gpt.set_active_slot('c').is_err());
    }

    #[test]
    fn ab_flags_round_trip() {
        let mut entry = gpt_entry("system_a", 0, 1, 9);
        entry.attribute_bits = 0x1234;
        entry.set_ab_flags(AbFlags {
            active: true,
            successful: false,
            unbootable: true,
            tries_remaining: 5,
        });

        let flags = entry.ab_flags();
        assert!(flags.active && flags.unbootable && !flags.successful);
        assert_eq!(flags.tries_remaining, 5);
        // Bits outside the A/B byte survive
        assert_eq!(entry.attribute_bits & 0xFFFF, 0x1234);
    }

    #[test]
    fn guid_formatting() {
        let guid: [u8; 16] = [
            0x28, 0x73, 0x2a, 0xc1, 0x1f, 0xf8, 0xd2, 0x11, 0xba, 0x4b, 0x00, 0xa0, 0xc9, 0x3e,
            0xc9, 0x3b,
        ];
        // EFI system partition type GUID
        assert_eq!(format_guid(&guid), "c12a7328-f81f-11d2-ba4b-00a0c93ec93b");
    }
}
