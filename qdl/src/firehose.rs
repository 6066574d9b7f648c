// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::error::{QdlError, Result};
use crate::transport::{read_some, write_buf, write_zlp};
use crate::types::{FirehoseResetMode, QdlBackend, QdlChan};
use crate::xml::{get_log, get_response, xml_build};
use crate::contains_bytes;

const POLL_READ_TIMEOUT: Duration = Duration::from_millis(150);
const RAW_READ_TIMEOUT: Duration = Duration::from_secs(2);
const XML_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const PROGRAM_CHUNK_TIMEOUT: Duration = Duration::from_secs(5);
const WAIT_FOR_DATA_RETRIES: u32 = 3;

/// Largest range a single `<erase>`/zero-fill call may cover; orchestrator
/// callers split anything bigger.
pub const ERASE_MAX_SECTORS: u64 = 512 * 1024;

const PROGRESS_EVERY_CHUNKS: u32 = 10;

#[derive(Debug, Default)]
pub struct FirehoseResponse {
    pub ok: bool,
    pub attrs: IndexMap<String, String>,
    pub logs: Vec<String>,
}

impl FirehoseResponse {
    fn rawmode(&self) -> Option<&str> {
        self.attrs.get("rawmode").map(String::as_str)
    }
}

/// Accumulate bulk reads until a `<response>` fragment shows up or the
/// budget of empty polls runs out.
fn wait_for_data<T: QdlChan>(channel: &mut T, retries: u32) -> Result<Vec<u8>> {
    let mut buf = vec![];
    let mut empty = 0;

    while empty < retries && !contains_bytes("<response", &buf) {
        let pkt = read_some(channel.rw(), 0, POLL_READ_TIMEOUT)?;
        if pkt.is_empty() {
            empty += 1;
        } else {
            buf.extend(pkt);
        }
    }

    Ok(buf)
}

/// Merge another batch of concatenated documents into `resp`, feeding the
/// log lines through the device-message accumulator.
fn ingest<T: QdlChan>(channel: &mut T, data: &[u8], resp: &mut FirehoseResponse) {
    let logs = get_log(data);
    for line in &logs {
        channel.messages().push(line);
    }

    resp.attrs.extend(get_response(data));
    resp.logs.extend(logs);
    resp.ok = match resp.attrs.get("value") {
        None => true,
        Some(v) => v == "ACK" || v == "true",
    };
}

/// Send one command document and collect the response that trails the
/// device's log chatter.
fn xml_send<T: QdlChan>(
    channel: &mut T,
    op: &str,
    kvps: &[(&str, String)],
    wait: bool,
) -> Result<FirehoseResponse> {
    let xml = xml_build(op, kvps)?;
    let max = channel.fh_config().xml_buf_size;
    if xml.len() > max {
        return Err(QdlError::Validation {
            field: "xml",
            reason: format!("<{op}> document is {} bytes, limit is {max}", xml.len()),
        });
    }

    debug!("SEND: {}", String::from_utf8_lossy(&xml));
    write_buf(channel.rw(), &xml, wait, XML_WRITE_TIMEOUT)?;

    let data = wait_for_data(channel, WAIT_FOR_DATA_RETRIES)?;
    let mut resp = FirehoseResponse::default();
    ingest(channel, &data, &mut resp);
    Ok(resp)
}

fn sector_kvps(
    sector_size: usize,
    num_sectors: u64,
    lun: u8,
    start_sector: u64,
) -> Vec<(&'static str, String)> {
    vec![
        ("SECTOR_SIZE_IN_BYTES", sector_size.to_string()),
        ("num_partition_sectors", num_sectors.to_string()),
        ("physical_partition_number", lun.to_string()),
        ("start_sector", start_sector.to_string()),
    ]
}

/// Send the host capabilities to the loader and sanity-check that its
/// configure handler actually ran.
pub fn firehose_configure<T: QdlChan>(channel: &mut T) -> Result<()> {
    let mut renegotiated = false;

    loop {
        let kvps = {
            let cfg = channel.fh_config();
            assert!(cfg.send_buffer_size % cfg.storage_sector_size == 0);
            vec![
                ("MemoryName", cfg.storage_type.to_string()),
                (
                    "MaxPayloadSizeToTargetInBytes",
                    cfg.send_buffer_size.to_string(),
                ),
                ("ZLPAwareHost", "1".to_string()),
                ("SkipStorageInit", (cfg.skip_storage_init as u32).to_string()),
                ("SkipWrite", (cfg.skip_write as u32).to_string()),
            ]
        };

        // The loader doesn't ACK the raw transfer here, don't wait on it
        let mut resp = xml_send(channel, "configure", &kvps, false)?;
        if !resp.attrs.contains_key("MemoryName") {
            // The first batch can be log-only; the real response trails it
            let more = wait_for_data(channel, WAIT_FOR_DATA_RETRIES)?;
            ingest(channel, &more, &mut resp);
        }

        if !resp.ok {
            // The device may counter-offer a payload size it can handle
            let counter = resp
                .attrs
                .get("MaxPayloadSizeToTargetInBytes")
                .and_then(|v| v.parse::<usize>().ok());
            if let (false, Some(max)) = (renegotiated, counter) {
                warn!("device limits the payload size to {max} bytes, reconfiguring");
                channel.mut_fh_config().send_buffer_size = max;
                renegotiated = true;
                continue;
            }
            return Err(QdlError::firehose("<configure> was NAKed".to_string()));
        }

        let memory = channel.fh_config().storage_type.to_string();
        let handler_ran = resp
            .logs
            .iter()
            .any(|l| l.contains("Calling handler for configure"));
        let storage_set = resp
            .logs
            .iter()
            .any(|l| l.contains(&format!("Storage type set to value {memory}")));
        if !handler_ran || !storage_set {
            return Err(QdlError::firehose(
                "configure handler never ran on the device".to_string(),
            ));
        }

        let max_lun = channel.fh_config().max_lun;
        channel.mut_fh_config().luns = (0..max_lun).collect();
        info!("configured {memory} target, {max_lun} LUNs");
        return Ok(());
    }
}

/// Read `num_sectors` sectors of storage into memory.
pub fn firehose_read_buffer<T: QdlChan>(
    channel: &mut T,
    lun: u8,
    start_sector: u64,
    num_sectors: u64,
) -> Result<Vec<u8>> {
    let sector_size = channel.fh_config().storage_sector_size;
    let kvps = sector_kvps(sector_size, num_sectors, lun, start_sector);

    let resp = xml_send(channel, "read", &kvps, true)?;
    if !resp.ok || resp.rawmode() != Some("true") {
        return Err(QdlError::firehose(format!(
            "<read> of {num_sectors} sectors at LUN {lun}:{start_sector} was rejected"
        )));
    }

    let want = num_sectors as usize * sector_size;
    let mut data = read_some(channel.rw(), want, RAW_READ_TIMEOUT)?;
    if data.len() < want {
        return Err(QdlError::Timeout(RAW_READ_TIMEOUT.as_millis() as u64));
    }
    data.truncate(want);

    // The data phase is closed out by a second ACK
    let tail = wait_for_data(channel, WAIT_FOR_DATA_RETRIES)?;
    let mut fin = FirehoseResponse::default();
    ingest(channel, &tail, &mut fin);
    if !fin.ok {
        return Err(QdlError::firehose("read data phase was NAKed".to_string()));
    }

    Ok(data)
}

/// Stream `num_sectors` worth of payload for an already-ACKed `<program>`:
/// `blob` bytes first, zeros after (covers both tail padding and the
/// zero-fill erase path).
fn stream_program_payload<T: QdlChan>(
    channel: &mut T,
    blob: &[u8],
    num_sectors: u64,
    on_progress: &mut Option<&mut dyn FnMut(u64)>,
) -> Result<()> {
    let (chunk_size, is_usb) = {
        let cfg = channel.fh_config();
        (cfg.send_buffer_size, cfg.backend == QdlBackend::Usb)
    };
    let total = num_sectors as usize * channel.fh_config().storage_sector_size;

    let mut sent = 0usize;
    let mut chunks = 0u32;
    while sent < total {
        let n = chunk_size.min(total - sent);
        let mut buf = vec![0u8; n];
        let avail = blob.len().saturating_sub(sent).min(n);
        if avail > 0 {
            buf[..avail].copy_from_slice(&blob[sent..sent + avail]);
        }

        write_buf(channel.rw(), &buf, true, PROGRAM_CHUNK_TIMEOUT)?;
        if is_usb {
            // Flush the bulk pipe so the loader commits the chunk
            write_zlp(channel.rw(), PROGRAM_CHUNK_TIMEOUT)?;
        }

        sent += n;
        chunks += 1;
        if chunks % PROGRESS_EVERY_CHUNKS == 0 {
            if let Some(cb) = on_progress.as_mut() {
                cb(sent.min(blob.len()) as u64);
            }
        }
    }

    Ok(())
}

fn program_sectors<T: QdlChan>(
    channel: &mut T,
    lun: u8,
    start_sector: u64,
    num_sectors: u64,
    blob: &[u8],
    mut on_progress: Option<&mut dyn FnMut(u64)>,
) -> Result<bool> {
    let sector_size = channel.fh_config().storage_sector_size;
    let kvps = sector_kvps(sector_size, num_sectors, lun, start_sector);

    let resp = xml_send(channel, "program", &kvps, true)?;
    if !resp.ok {
        warn!("<program> of {num_sectors} sectors at LUN {lun}:{start_sector} was NAKed");
        return Ok(false);
    }

    stream_program_payload(channel, blob, num_sectors, &mut on_progress)?;

    let tail = wait_for_data(channel, WAIT_FOR_DATA_RETRIES)?;
    let mut fin = FirehoseResponse::default();
    ingest(channel, &tail, &mut fin);

    if let Some(cb) = on_progress.as_mut() {
        cb(blob.len() as u64);
    }

    Ok(fin.ok)
}

/// Write a blob at `start_sector`, padding the tail up to a sector boundary.
pub fn firehose_program<T: QdlChan>(
    channel: &mut T,
    lun: u8,
    start_sector: u64,
    blob: &[u8],
    on_progress: Option<&mut dyn FnMut(u64)>,
) -> Result<bool> {
    let sector_size = channel.fh_config().storage_sector_size;
    let num_sectors = blob.len().div_ceil(sector_size) as u64;
    program_sectors(channel, lun, start_sector, num_sectors, blob, on_progress)
}

/// Erase a sector range. Prefers the `<erase>` fast path; older loaders
/// only honor a zero-payload `<program>`, so a NAK falls back to that.
pub fn firehose_erase<T: QdlChan>(
    channel: &mut T,
    lun: u8,
    start_sector: u64,
    num_sectors: u64,
) -> Result<bool> {
    if channel.fh_config().fast_erase {
        let sector_size = channel.fh_config().storage_sector_size;
        let kvps = sector_kvps(sector_size, num_sectors, lun, start_sector);
        let resp = xml_send(channel, "erase", &kvps, true)?;
        if resp.ok {
            return Ok(true);
        }
        warn!("device NAKed <erase>, falling back to a zero-fill <program>");
    }

    program_sectors(channel, lun, start_sector, num_sectors, &[], None)
}

/// Mark a physical storage partition as bootable.
pub fn firehose_set_bootable<T: QdlChan>(channel: &mut T, lun: u8) -> Result<()> {
    let resp = xml_send(
        channel,
        "setbootablestoragedrive",
        &[("value", lun.to_string())],
        true,
    )?;
    if !resp.ok {
        return Err(QdlError::firehose(format!(
            "couldn't set partition {lun} as bootable"
        )));
    }
    Ok(())
}

/// Reboot or power off the device.
pub fn firehose_reset<T: QdlChan>(
    channel: &mut T,
    mode: &FirehoseResetMode,
    delay_in_sec: u32,
) -> Result<()> {
    let resp = xml_send(
        channel,
        "power",
        &[
            ("value", mode.to_string()),
            ("DelayInSeconds", delay_in_sec.to_string()),
        ],
        true,
    )?;
    if !resp.ok {
        return Err(QdlError::firehose("couldn't reset the device".to_string()));
    }
    Ok(())
}

/// Do nothing, hopefully successfully.
pub fn firehose_nop<T: QdlChan>(channel: &mut T) -> Result<()> {
    let resp = xml_send(channel, "nop", &[("value", "ping".to_string())], true)?;
    if !resp.ok {
        return Err(QdlError::firehose("NOP was NAKed".to_string()));
    }
    Ok(())
}

/// Ask the loader to regenerate a consistent GPT from the primary copy.
pub fn firehose_fix_gpt<T: QdlChan>(channel: &mut T, lun: u8) -> Result<()> {
    let resp = xml_send(
        channel,
        "fixgpt",
        &[
            ("physical_partition_number", lun.to_string()),
            ("GrowLastPartition", "1".to_string()),
        ],
        true,
    )?;
    if !resp.ok {
        return Err(QdlError::firehose(format!(
            "couldn't fix the GPT on LUN {lun}"
        )));
    }
    Ok(())
}

/// Query storage geometry; the answer only shows up in the log stream.
pub fn firehose_get_storage_info<T: QdlChan>(channel: &mut T, lun: u8) -> Result<Vec<String>> {
    let resp = xml_send(
        channel,
        "getstorageinfo",
        &[("physical_partition_number", lun.to_string())],
        true,
    )?;
    if !resp.ok {
        return Err(QdlError::firehose(format!(
            "couldn't get storage info for LUN {lun}"
        )));
    }
    Ok(resp.logs)
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageInfo {
    pub total_blocks: u64,
    pub block_size: u32,
    #[serde(default)]
    pub page_size: u32,
    #[serde(default)]
    pub num_physical: u32,
    #[serde(default)]
    pub manufacturer_id: Option<u64>,
    #[serde(default)]
    pub serial_num: Option<u64>,
    #[serde(default)]
    pub fw_version: Option<String>,
    #[serde(default)]
    pub mem_type: Option<String>,
    #[serde(default)]
    pub prod_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StorageInfoEnvelope {
    storage_info: StorageInfo,
}

/// Dig the `storage_info` JSON payload out of a `getstorageinfo` log array.
pub fn parse_storage_info(logs: &[String]) -> Option<StorageInfo> {
    for line in logs {
        let Some(rest) = line.strip_prefix("INFO: ") else {
            continue;
        };
        if !rest.contains("storage_info") {
            continue;
        }
        if let Ok(envelope) = serde_json::from_str::<StorageInfoEnvelope>(rest) {
            return Some(envelope.storage_info);
        }
    }
    None
}

const DEDUP_DEBOUNCE: Duration = Duration::from_millis(100);

/// Forwards device `<log>` traffic, coalescing identical consecutive
/// messages into a repeat count. One instance per session.
#[derive(Debug)]
pub struct DeviceMessages {
    last: Option<String>,
    repeats: u32,
    last_at: Instant,
}

impl Default for DeviceMessages {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceMessages {
    pub fn new() -> Self {
        DeviceMessages {
            last: None,
            repeats: 0,
            last_at: Instant::now(),
        }
    }

    pub fn push(&mut self, line: &str) {
        for msg in self.coalesce(line, Instant::now()) {
            forward(&msg);
        }
    }

    /// Surface a pending repeat summary, e.g. at end of session.
    pub fn flush(&mut self) {
        for msg in self.drain_repeats() {
            forward(&msg);
        }
    }

    fn coalesce(&mut self, line: &str, now: Instant) -> Vec<String> {
        if self.last.as_deref() == Some(line) {
            self.repeats += 1;
            // Don't stay silent forever on a long repeating run
            if now.duration_since(self.last_at) >= DEDUP_DEBOUNCE {
                self.last_at = now;
                return self.drain_repeats();
            }
            return vec![];
        }

        let mut out = self.drain_repeats();
        out.push(line.to_string());
        self.last = Some(line.to_string());
        self.last_at = now;
        out
    }

    fn drain_repeats(&mut self) -> Vec<String> {
        if self.repeats == 0 {
            return vec![];
        }
        let summary = format!("last message repeated {} times", self.repeats);
        self.repeats = 0;
        vec![summary]
    }
}

fn forward(line: &str) {
    if line.starts_with("ERROR:") {
        error!("device: {line}");
    } else if line.starts_with("INFO:") {
        info!("device: {line}");
    } else {
        debug!("device: {line}");
    }
}
