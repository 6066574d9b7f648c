// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::io;
use std::time::Duration;

use crate::error::{QdlError, Result};
use crate::types::QdlReadWrite;

/// Largest single outgoing transfer the boot ROM accepts.
pub const MAX_WRITE_CHUNK: usize = 16 * 1024;

/// Upper bound for a single aggregated read buffer.
const MAX_READ_BUF: usize = 1024 * 1024;

// A couple of zero-length reads in a row means the device has nothing
// more queued for us, not that more data is coming.
const MAX_CONSECUTIVE_ZLPS: u32 = 4;

/// Read from the channel.
///
/// With `n == 0`, performs a single read of up to one endpoint packet and
/// returns whatever arrived (empty on timeout). With `n > 0`, aggregates
/// reads until at least `n` bytes were received; a timeout mid-stream
/// returns the partial buffer and callers validate the length themselves.
pub fn read_some(rw: &mut dyn QdlReadWrite, n: usize, timeout: Duration) -> Result<Vec<u8>> {
    let packet_size = rw.max_packet_size().max(64);

    if n == 0 {
        let mut buf = vec![0u8; packet_size];
        return match rw.read_packet(&mut buf, timeout) {
            Ok(len) => {
                buf.truncate(len);
                Ok(buf)
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(vec![]),
            Err(e) => Err(QdlError::Usb(e)),
        };
    }

    let mut out = Vec::with_capacity(n);
    let mut zlps = 0;
    while out.len() < n {
        let remaining = n - out.len();
        let buf_len = remaining
            .div_ceil(packet_size)
            .saturating_mul(packet_size)
            .min(MAX_READ_BUF)
            .max(packet_size);
        let mut buf = vec![0u8; buf_len];

        match rw.read_packet(&mut buf, timeout) {
            Ok(0) => {
                zlps += 1;
                if zlps >= MAX_CONSECUTIVE_ZLPS {
                    break;
                }
            }
            Ok(len) => {
                zlps = 0;
                buf.truncate(len);
                out.append(&mut buf);
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
            Err(e) => return Err(QdlError::Usb(e)),
        }
    }

    Ok(out)
}

/// Write a buffer, chunked to [`MAX_WRITE_CHUNK`] per transfer.
///
/// With `wait == false` the final chunk is fire-and-forget: some loader
/// states never acknowledge it and the transfer completion is lost.
pub fn write_buf(rw: &mut dyn QdlReadWrite, data: &[u8], wait: bool, timeout: Duration) -> Result<()> {
    if data.is_empty() {
        return write_zlp(rw, timeout);
    }

    let mut chunks = data.chunks(MAX_WRITE_CHUNK).peekable();
    while let Some(chunk) = chunks.next() {
        let last = chunks.peek().is_none();

        match rw.write_chunk(chunk, timeout) {
            Ok(len) if len == chunk.len() => {}
            Ok(len) => {
                return Err(QdlError::Usb(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("wrote an unexpected number of bytes ({len})"),
                )))
            }
            Err(e) if last && !wait && e.kind() == io::ErrorKind::TimedOut => return Ok(()),
            Err(e) => return Err(QdlError::from_io(e, timeout)),
        }
    }

    Ok(())
}

/// Send a zero-length packet to mark the end of a logical stream.
pub fn write_zlp(rw: &mut dyn QdlReadWrite, timeout: Duration) -> Result<()> {
    rw.write_chunk(&[], timeout)
        .map(|_| ())
        .map_err(|e| QdlError::from_io(e, timeout))
}
