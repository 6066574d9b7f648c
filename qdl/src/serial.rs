// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::io;
use std::time::Duration;

use serial2::{self, SerialPort};

use crate::error::{QdlError, Result};
use crate::types::QdlReadWrite;

pub struct QdlSerialConfig {
    serport: SerialPort,
}

impl QdlReadWrite for QdlSerialConfig {
    fn connected(&self) -> bool {
        true
    }

    fn max_packet_size(&self) -> usize {
        // No packet framing on a serial line; pick a sane poll granularity
        4096
    }

    fn read_packet(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.serport.set_read_timeout(timeout)?;
        self.serport.read(buf)
    }

    fn write_chunk(&mut self, buf: &[u8], timeout: Duration) -> io::Result<usize> {
        self.serport.set_write_timeout(timeout)?;
        self.serport.write(buf)
    }
}

pub fn setup_serial_device(dev_path: Option<String>) -> Result<QdlSerialConfig> {
    let Some(path) = dev_path else {
        return Err(QdlError::Validation {
            field: "dev_path",
            reason: "serial port path unspecified".to_string(),
        });
    };

    let serport = SerialPort::open(&path, |mut settings: serial2::Settings| {
        settings.set_raw();
        settings.set_baud_rate(115200)?;
        Ok(settings)
    })
    .map_err(|e| QdlError::Connection(format!("couldn't open {path}: {e}")))?;

    Ok(QdlSerialConfig { serport })
}
