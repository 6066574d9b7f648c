// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Scripted in-memory channel for protocol tests (queued reads on one side,
//! captured writes on the other) plus wire fixtures for GPT tests.

use std::collections::VecDeque;
use std::io;
use std::io::Cursor;
use std::time::Duration;

use crate::firehose::DeviceMessages;
use crate::gpt::{self, GPTPartitionEntry, Gpt};
use crate::types::{FirehoseConfiguration, QdlChan, QdlReadWrite};

pub(crate) struct ScriptedRw {
    /// Upcoming device->host transfers. An empty entry simulates a read
    /// timeout, as does queue exhaustion.
    pub reads: VecDeque<Vec<u8>>,
    /// Every host->device transfer, including zero-length packets.
    pub writes: Vec<Vec<u8>>,
    pub packet_size: usize,
}

impl ScriptedRw {
    fn new() -> Self {
        ScriptedRw {
            reads: VecDeque::new(),
            writes: vec![],
            packet_size: 512,
        }
    }
}

impl QdlReadWrite for ScriptedRw {
    fn connected(&self) -> bool {
        true
    }

    fn max_packet_size(&self) -> usize {
        self.packet_size
    }

    fn read_packet(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        let Some(mut pkt) = self.reads.pop_front() else {
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        };
        if pkt.is_empty() {
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }

        let n = pkt.len().min(buf.len());
        buf[..n].copy_from_slice(&pkt[..n]);
        if n < pkt.len() {
            self.reads.push_front(pkt.split_off(n));
        }
        Ok(n)
    }

    fn write_chunk(&mut self, buf: &[u8], _timeout: Duration) -> io::Result<usize> {
        self.writes.push(buf.to_vec());
        Ok(buf.len())
    }
}

pub(crate) struct TestChan {
    pub rw: ScriptedRw,
    pub cfg: FirehoseConfiguration,
    pub messages: DeviceMessages,
}

impl TestChan {
    pub fn new() -> Self {
        TestChan {
            rw: ScriptedRw::new(),
            cfg: FirehoseConfiguration::default(),
            messages: DeviceMessages::new(),
        }
    }

    /// A channel with small buffers so tests exercise chunking without
    /// megabyte fixtures.
    pub fn small() -> Self {
        let mut chan = Self::new();
        chan.cfg.storage_sector_size = 512;
        chan.cfg.send_buffer_size = 1024;
        chan
    }

    pub fn push_xml(&mut self, inner: &str) {
        self.rw
            .reads
            .push_back(format!("<?xml version=\"1.0\" ?><data>{inner}</data>").into_bytes());
    }
}

impl QdlChan for TestChan {
    fn rw(&mut self) -> &mut dyn QdlReadWrite {
        &mut self.rw
    }

    fn fh_config(&self) -> &FirehoseConfiguration {
        &self.cfg
    }

    fn mut_fh_config(&mut self) -> &mut FirehoseConfiguration {
        &mut self.cfg
    }

    fn messages(&mut self) -> &mut DeviceMessages {
        &mut self.messages
    }
}

pub(crate) const GPT_SECTOR: u64 = 512;

pub(crate) fn gpt_entry(name: &str, start: u64, end: u64, seed: u8) -> GPTPartitionEntry {
    GPTPartitionEntry {
        partition_type_guid: [seed | 1; 16],
        unique_partition_guid: [seed.wrapping_add(17) | 1; 16],
        starting_lba: start,
        ending_lba: end,
        attribute_bits: 0,
        partition_name: name.into(),
    }
}

pub(crate) fn gpt_entry_bytes(entries: &[GPTPartitionEntry]) -> Vec<u8> {
    let mut buf = vec![];
    for e in entries {
        let mut cur = Cursor::new(Vec::with_capacity(128));
        bincode::serialize_into(&mut cur, e).unwrap();
        let mut one = cur.into_inner();
        one.resize(128, 0);
        buf.extend(one);
    }
    buf
}

/// A sealed 92-byte header for 128-byte entries, checksummed over its own
/// fields so `parse_header` reports an intact table.
pub(crate) fn gpt_header_bytes(
    num_entries: u32,
    entries_crc: u32,
    primary_lba: u64,
    backup_lba: u64,
    entry_lba: u64,
    first_usable: u64,
    last_usable: u64,
) -> Vec<u8> {
    let mut buf = vec![0u8; 92];
    buf[0..8].copy_from_slice(b"EFI PART");
    buf[8..12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
    buf[12..16].copy_from_slice(&92u32.to_le_bytes());
    buf[24..32].copy_from_slice(&primary_lba.to_le_bytes());
    buf[32..40].copy_from_slice(&backup_lba.to_le_bytes());
    buf[40..48].copy_from_slice(&first_usable.to_le_bytes());
    buf[48..56].copy_from_slice(&last_usable.to_le_bytes());
    buf[56..72].copy_from_slice(&[0x11; 16]);
    buf[72..80].copy_from_slice(&entry_lba.to_le_bytes());
    buf[80..84].copy_from_slice(&num_entries.to_le_bytes());
    buf[84..88].copy_from_slice(&128u32.to_le_bytes());
    buf[88..92].copy_from_slice(&entries_crc.to_le_bytes());

    let crc = crc32fast::hash(&buf);
    buf[16..20].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// A fully parsed table on a small 8192-sector disk: primary header at
/// LBA 1, entries from LBA 2, backup header at LBA 8191.
pub(crate) fn sample_gpt(lun: u8, entries: Vec<GPTPartitionEntry>) -> Gpt {
    let entry_bytes = gpt_entry_bytes(&entries);
    let esectors = (entry_bytes.len() as u64).div_ceil(GPT_SECTOR).max(1);
    let header_bytes = gpt_header_bytes(
        entries.len() as u32,
        crc32fast::hash(&entry_bytes),
        1,
        8191,
        2,
        2 + esectors,
        8190 - esectors,
    );

    let (header, header_crc_ok) =
        gpt::parse_header(&header_bytes, GPT_SECTOR as usize, 1, lun).unwrap();
    let (entries, entries_crc_ok) = gpt::parse_entries(&header, &entry_bytes, lun).unwrap();

    Gpt {
        lun,
        sector_size: GPT_SECTOR,
        header,
        entries,
        header_crc_ok,
        entries_crc_ok,
    }
}
