// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{QdlError, Result};
use crate::transport::{read_some, write_buf};
use crate::types::QdlChan;
use crate::xml::xml_build;
use crate::contains_bytes;

pub const SAHARA_HELLO_REQ: u32 = 0x01;
pub const SAHARA_HELLO_RSP: u32 = 0x02;
pub const SAHARA_READ_DATA: u32 = 0x03;
pub const SAHARA_END_TRANSFER: u32 = 0x04;
pub const SAHARA_DONE_REQ: u32 = 0x05;
pub const SAHARA_DONE_RSP: u32 = 0x06;
pub const SAHARA_RESET_RSP: u32 = 0x08;
pub const SAHARA_CMD_READY: u32 = 0x0B;
pub const SAHARA_SWITCH_MODE: u32 = 0x0C;
pub const SAHARA_EXECUTE_REQ: u32 = 0x0D;
pub const SAHARA_EXECUTE_RSP: u32 = 0x0E;
pub const SAHARA_EXECUTE_DATA: u32 = 0x0F;
pub const SAHARA_READ_DATA64: u32 = 0x12;

pub const SAHARA_MODE_IMAGE_TX_PENDING: u32 = 0x0;
pub const SAHARA_MODE_COMMAND: u32 = 0x3;

const SAHARA_EXEC_SERIAL_NUM_READ: u32 = 0x01;
const SAHARA_STATUS_SUCCESS: u32 = 0x0;

const SAHARA_VERSION: u32 = 2;
const SAHARA_VERSION_MIN: u32 = 1;

/// Firehose-capable loaders announce themselves with image IDs at or above
/// this value; anything lower is a boot chain we can't serve.
const SAHARA_IMAGE_ID_FIREHOSE_MIN: u64 = 0x0C;

const PROBE_READ_TIMEOUT: Duration = Duration::from_millis(500);
const PROBE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const PROBE_RETRY_READ_TIMEOUT: Duration = Duration::from_secs(2);
const FRAME_TIMEOUT: Duration = Duration::from_secs(2);
const FRAME_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// What the probe concluded the peer is speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    Sahara,
    Firehose,
}

#[derive(Debug, Clone)]
pub struct SaharaOutcome {
    pub mode: DeviceMode,
    /// Chip serial number, read in command mode, rendered as hex
    pub serial: Option<String>,
}

/// Pack up to 12 little-endian words into one 48-byte Sahara frame.
pub fn sahara_pack(words: &[u32]) -> [u8; 48] {
    let mut buf = [0u8; 48];
    for (i, w) in words.iter().take(12).enumerate() {
        buf[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
    }
    buf
}

/// A frame sliced down to the length its second word declares.
fn sahara_frame(words: &[u32]) -> Vec<u8> {
    let packed = sahara_pack(words);
    let len = (words[1] as usize).clamp(8, 48);
    packed[..len].to_vec()
}

fn word(buf: &[u8], idx: usize) -> Result<u32> {
    let off = idx * 4;
    buf.get(off..off + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
        .ok_or_else(|| QdlError::sahara(format!("frame too short for word {idx}")))
}

fn dword(buf: &[u8], idx: usize) -> Result<u64> {
    let lo = word(buf, idx)? as u64;
    let hi = word(buf, idx + 1)? as u64;
    Ok(hi << 32 | lo)
}

fn classify(buf: &[u8]) -> Option<DeviceMode> {
    if contains_bytes("<?xml", buf) {
        return Some(DeviceMode::Firehose);
    }
    if buf.len() >= 8 {
        match u32::from_le_bytes(buf[0..4].try_into().unwrap()) {
            SAHARA_HELLO_REQ | SAHARA_END_TRANSFER => return Some(DeviceMode::Sahara),
            _ => {}
        }
    }
    None
}

/// Figure out which protocol the peer is currently speaking.
///
/// A freshly enumerated EDL device greets us with a Sahara HELLO. A device
/// whose loader is already running answers XML. A silent device gets poked
/// with a Firehose no-op before we give up on it.
pub fn sahara_probe<T: QdlChan>(channel: &mut T) -> Result<DeviceMode> {
    let buf = read_some(channel.rw(), 48, PROBE_READ_TIMEOUT)?;
    if let Some(mode) = classify(&buf) {
        debug!("probe classified the peer as {mode:?}");
        return Ok(mode);
    }

    // Nothing sensible buffered; see if a loader answers a no-op
    let nop = xml_build("nop", &[("value", "ping".to_string())])?;
    write_buf(channel.rw(), &nop, true, PROBE_WRITE_TIMEOUT)?;

    let buf = read_some(channel.rw(), 0, PROBE_RETRY_READ_TIMEOUT)?;
    if let Some(mode) = classify(&buf) {
        debug!("probe classified the peer as {mode:?} after a nop");
        return Ok(mode);
    }

    Err(QdlError::Connection(
        "device is in an unknown state; reboot it back into EDL mode".to_string(),
    ))
}

fn read_frame<T: QdlChan>(channel: &mut T, timeout: Duration) -> Result<Vec<u8>> {
    let buf = read_some(channel.rw(), 0, timeout)?;
    if buf.is_empty() {
        return Err(QdlError::sahara("no frame from the device".to_string()));
    }
    Ok(buf)
}

fn expect_frame<T: QdlChan>(channel: &mut T, cmd: u32, what: &str) -> Result<Vec<u8>> {
    let frame = read_frame(channel, FRAME_TIMEOUT)?;
    let got = word(&frame, 0)?;
    if got != cmd {
        return Err(QdlError::sahara(format!(
            "expected {what} ({cmd:#04x}), got command {got:#04x}"
        )));
    }
    Ok(frame)
}

pub fn sahara_send_hello_rsp<T: QdlChan>(channel: &mut T, mode: u32) -> Result<()> {
    let frame = sahara_frame(&[
        SAHARA_HELLO_RSP,
        0x30,
        SAHARA_VERSION,
        SAHARA_VERSION_MIN,
        0, // max command packet length: no preference
        mode,
        1,
        2,
        3,
        4,
        5,
        6,
    ]);
    write_buf(channel.rw(), &frame, true, FRAME_WRITE_TIMEOUT)
}

fn sahara_switch_mode<T: QdlChan>(channel: &mut T, mode: u32) -> Result<()> {
    let frame = sahara_frame(&[SAHARA_SWITCH_MODE, 0x0C, mode]);
    write_buf(channel.rw(), &frame, true, FRAME_WRITE_TIMEOUT)
}

/// Command-mode exchange for the chip serial number. Assumes the hello
/// handshake with `mode=COMMAND` is already done and CMD_READY was seen.
fn sahara_read_serial<T: QdlChan>(channel: &mut T) -> Result<String> {
    let req = sahara_frame(&[SAHARA_EXECUTE_REQ, 0x0C, SAHARA_EXEC_SERIAL_NUM_READ]);
    write_buf(channel.rw(), &req, true, FRAME_WRITE_TIMEOUT)?;

    let rsp = expect_frame(channel, SAHARA_EXECUTE_RSP, "EXECUTE_RSP")?;
    let data_len = word(&rsp, 3)? as usize;
    if data_len < 4 {
        return Err(QdlError::sahara(format!(
            "serial number response is {data_len} bytes"
        )));
    }

    let data_req = sahara_frame(&[SAHARA_EXECUTE_DATA, 0x0C, SAHARA_EXEC_SERIAL_NUM_READ]);
    write_buf(channel.rw(), &data_req, true, FRAME_WRITE_TIMEOUT)?;

    let data = read_some(channel.rw(), data_len, FRAME_TIMEOUT)?;
    if data.len() < data_len {
        return Err(QdlError::sahara(format!(
            "short serial number read ({} of {data_len} bytes)",
            data.len()
        )));
    }

    let sn = u32::from_le_bytes(data[0..4].try_into().unwrap());
    Ok(format!("{sn:x}"))
}

/// Serve the boot ROM's pull requests for the programmer image.
///
/// The caller has classified the peer as Sahara (the greeting HELLO is
/// consumed). On success the loader is executing and the device is ready
/// for Firehose configuration.
pub fn sahara_upload_loader<T: QdlChan>(channel: &mut T, programmer: &[u8]) -> Result<SaharaOutcome> {
    // Detour through command mode to grab the chip serial
    sahara_send_hello_rsp(channel, SAHARA_MODE_COMMAND)?;
    expect_frame(channel, SAHARA_CMD_READY, "CMD_READY")?;
    let serial = sahara_read_serial(channel)?;
    info!("chip serial number: 0x{serial}");

    // Leaving command mode resets the Sahara transport; the device
    // greets us again before pulling the image
    sahara_switch_mode(channel, SAHARA_MODE_COMMAND)?;
    if sahara_probe(channel)? != DeviceMode::Sahara {
        return Err(QdlError::sahara(
            "device left Sahara during the mode switch".to_string(),
        ));
    }
    sahara_send_hello_rsp(channel, SAHARA_MODE_IMAGE_TX_PENDING)?;

    let mut firehose_bound = false;
    loop {
        let frame = read_frame(channel, FRAME_TIMEOUT)?;
        match word(&frame, 0)? {
            SAHARA_READ_DATA64 => {
                let image_id = dword(&frame, 2)?;
                let offset = dword(&frame, 4)?;
                let len = dword(&frame, 6)?;
                serve_read(channel, programmer, image_id, offset, len)?;
                firehose_bound = true;
            }
            // Pre-ARMv8 boot ROMs use the 32-bit variant
            SAHARA_READ_DATA => {
                let image_id = word(&frame, 2)? as u64;
                let offset = word(&frame, 3)? as u64;
                let len = word(&frame, 4)? as u64;
                serve_read(channel, programmer, image_id, offset, len)?;
                firehose_bound = true;
            }
            SAHARA_END_TRANSFER => {
                let status = word(&frame, 3)?;
                if status != SAHARA_STATUS_SUCCESS {
                    return Err(QdlError::sahara(format!(
                        "image transfer ended with status {status:#x}"
                    )));
                }

                let done = sahara_frame(&[SAHARA_DONE_REQ, 0x08]);
                write_buf(channel.rw(), &done, true, FRAME_WRITE_TIMEOUT)?;
                expect_frame(channel, SAHARA_DONE_RSP, "DONE_RSP")?;
                break;
            }
            cmd => {
                return Err(QdlError::sahara(format!(
                    "unexpected command {cmd:#04x} during image transfer"
                )));
            }
        }
    }

    if !firehose_bound {
        warn!("device finished the transfer without pulling any image data");
    }

    Ok(SaharaOutcome {
        mode: DeviceMode::Firehose,
        serial: Some(serial),
    })
}

fn serve_read<T: QdlChan>(
    channel: &mut T,
    programmer: &[u8],
    image_id: u64,
    offset: u64,
    len: u64,
) -> Result<()> {
    if image_id < SAHARA_IMAGE_ID_FIREHOSE_MIN {
        return Err(QdlError::sahara(format!(
            "device requested non-loader image {image_id:#x}"
        )));
    }
    if len > 16 * 1024 * 1024 {
        return Err(QdlError::sahara(format!(
            "device requested an implausible {len} byte read"
        )));
    }

    debug!("serving programmer range {offset:#x}+{len:#x} for image {image_id:#x}");

    // The ROM may read past the end of the blob; the tail reads as zeros
    let mut chunk = vec![0u8; len as usize];
    let start = (offset as usize).min(programmer.len());
    let end = ((offset + len) as usize).min(programmer.len());
    if start < end {
        chunk[..end - start].copy_from_slice(&programmer[start..end]);
    }

    write_buf(channel.rw(), &chunk, true, FRAME_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestChan;

    #[test]
    fn pack_layout() {
        let buf = sahara_pack(&[0x2, 0x30, 2, 1, 0, 0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(buf.len(), 48);
        assert_eq!(&buf[0..4], &[0x02, 0x00, 0x00, 0x00]);
        assert_eq!(&buf[4..8], &[0x30, 0x00, 0x00, 0x00]);
        for (i, val) in (1u8..=6).enumerate() {
            assert_eq!(buf[24 + i * 4], val);
            assert_eq!(&buf[24 + i * 4 + 1..24 + i * 4 + 4], &[0, 0, 0]);
        }
    }

    #[test]
    fn probe_classifies_hello() {
        let mut chan = TestChan::new();
        chan.rw
            .reads
            .push_back(sahara_pack(&[SAHARA_HELLO_REQ, 0x30, 2, 1, 0, 0]).to_vec());

        assert_eq!(sahara_probe(&mut chan).unwrap(), DeviceMode::Sahara);
    }

    #[test]
    fn probe_classifies_firehose_logs() {
        let mut chan = TestChan::new();
        chan.rw.reads.push_back(
            b"<?xml version=\"1.0\" ?><data><log value=\"hi\"/></data>".to_vec(),
        );

        assert_eq!(sahara_probe(&mut chan).unwrap(), DeviceMode::Firehose);
    }

    #[test]
    fn probe_pokes_a_silent_device() {
        let mut chan = TestChan::new();
        // First read times out, the nop provokes an XML response
        chan.rw.reads.push_back(vec![]);
        chan.rw.reads.push_back(
            b"<?xml version=\"1.0\" ?><data><response value=\"ACK\"/></data>".to_vec(),
        );

        assert_eq!(sahara_probe(&mut chan).unwrap(), DeviceMode::Firehose);
        // The nop itself went over the wire
        assert!(chan
            .rw
            .writes
            .iter()
            .any(|w| w.windows(5).any(|s| s == b"<nop ")));
    }

    #[test]
    fn probe_gives_up_on_garbage() {
        let mut chan = TestChan::new();
        chan.rw.reads.push_back(vec![0xAB; 16]);
        chan.rw.reads.push_back(vec![0xCD; 16]);

        assert!(matches!(
            sahara_probe(&mut chan),
            Err(QdlError::Connection(_))
        ));
    }

    fn end_transfer(status: u32) -> Vec<u8> {
        sahara_frame(&[SAHARA_END_TRANSFER, 0x10, 0x13, status])
    }

    fn read_data64(image_id: u64, offset: u64, len: u64) -> Vec<u8> {
        sahara_frame(&[
            SAHARA_READ_DATA64,
            0x20,
            image_id as u32,
            (image_id >> 32) as u32,
            offset as u32,
            (offset >> 32) as u32,
            len as u32,
            (len >> 32) as u32,
        ])
    }

    fn scripted_upload_chan() -> TestChan {
        let mut chan = TestChan::new();
        let reads = &mut chan.rw.reads;
        // Command-mode detour
        reads.push_back(sahara_frame(&[SAHARA_CMD_READY, 0x08]));
        reads.push_back(sahara_frame(&[
            SAHARA_EXECUTE_RSP,
            0x10,
            SAHARA_EXEC_SERIAL_NUM_READ,
            4,
        ]));
        reads.push_back(0xDEADBEEFu32.to_le_bytes().to_vec());
        // Transport reset after the mode switch
        reads.push_back(sahara_pack(&[SAHARA_HELLO_REQ, 0x30, 2, 1, 0, 0]).to_vec());
        // Image pull
        reads.push_back(read_data64(0x13, 0, 8192));
        reads.push_back(read_data64(0x13, 8192, 4096));
        reads.push_back(end_transfer(SAHARA_STATUS_SUCCESS));
        reads.push_back(sahara_frame(&[SAHARA_DONE_RSP, 0x0C, 0]));
        chan
    }

    #[test]
    fn uploads_the_programmer() {
        let mut chan = scripted_upload_chan();
        let programmer: Vec<u8> = (0..10_000).map(|i| (i % 255) as u8).collect();

        let outcome = sahara_upload_loader(&mut chan, &programmer).unwrap();
        assert_eq!(outcome.mode, DeviceMode::Firehose);
        assert_eq!(outcome.serial.as_deref(), Some("deadbeef"));

        // Collect the payload writes: both requested slices, in order
        let payloads: Vec<&Vec<u8>> = chan
            .rw
            .writes
            .iter()
            .filter(|w| w.len() == 8192 || w.len() == 4096)
            .collect();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0][..], programmer[..8192]);

        // Second slice runs past the blob: 10 000 - 8192 = 1808 real bytes
        assert_eq!(payloads[1][..1808], programmer[8192..]);
        assert!(payloads[1][1808..].iter().all(|&b| b == 0));
    }

    #[test]
    fn rejects_non_loader_image_ids() {
        let mut chan = TestChan::new();
        let reads = &mut chan.rw.reads;
        reads.push_back(sahara_frame(&[SAHARA_CMD_READY, 0x08]));
        reads.push_back(sahara_frame(&[
            SAHARA_EXECUTE_RSP,
            0x10,
            SAHARA_EXEC_SERIAL_NUM_READ,
            4,
        ]));
        reads.push_back(vec![1, 0, 0, 0]);
        reads.push_back(sahara_pack(&[SAHARA_HELLO_REQ, 0x30, 2, 1, 0, 0]).to_vec());
        reads.push_back(read_data64(0x2, 0, 4096));

        assert!(matches!(
            sahara_upload_loader(&mut chan, &[0u8; 4096]),
            Err(QdlError::Protocol { .. })
        ));
    }

    #[test]
    fn failed_end_transfer_is_an_error() {
        let mut chan = TestChan::new();
        let reads = &mut chan.rw.reads;
        reads.push_back(sahara_frame(&[SAHARA_CMD_READY, 0x08]));
        reads.push_back(sahara_frame(&[
            SAHARA_EXECUTE_RSP,
            0x10,
            SAHARA_EXEC_SERIAL_NUM_READ,
            4,
        ]));
        reads.push_back(vec![1, 0, 0, 0]);
        reads.push_back(sahara_pack(&[SAHARA_HELLO_REQ, 0x30, 2, 1, 0, 0]).to_vec());
        reads.push_back(end_transfer(0x05));

        assert!(sahara_upload_loader(&mut chan, &[0u8; 16]).is_err());
    }
}
