// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{QdlError, Result};
use crate::firehose::DeviceMessages;

/// Raw channel to a device in EDL mode.
///
/// Implementations are packet-oriented: one `read_packet` maps to one bulk
/// transfer (or the serial equivalent), one `write_chunk` to one outgoing
/// transfer of at most [`crate::transport::MAX_WRITE_CHUNK`] bytes.
pub trait QdlReadWrite {
    fn connected(&self) -> bool;

    /// Largest packet the IN endpoint can deliver in one transfer.
    fn max_packet_size(&self) -> usize;

    fn read_packet(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    fn write_chunk(&mut self, buf: &[u8], timeout: Duration) -> io::Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QdlBackend {
    #[default]
    Usb,
    Serial,
}

impl FromStr for QdlBackend {
    type Err = QdlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "usb" => Ok(QdlBackend::Usb),
            "serial" => Ok(QdlBackend::Serial),
            _ => Err(QdlError::Validation {
                field: "backend",
                reason: format!("unknown backend '{s}', expected usb/serial"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirehoseStorageType {
    #[default]
    Ufs,
    Emmc,
    Nvme,
    Nand,
    Spinor,
}

impl FirehoseStorageType {
    pub fn default_sector_size(&self) -> usize {
        match self {
            FirehoseStorageType::Emmc | FirehoseStorageType::Nvme => 512,
            FirehoseStorageType::Ufs | FirehoseStorageType::Nand | FirehoseStorageType::Spinor => {
                4096
            }
        }
    }
}

impl fmt::Display for FirehoseStorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The loader expects the MemoryName spelling
        match self {
            FirehoseStorageType::Ufs => write!(f, "UFS"),
            FirehoseStorageType::Emmc => write!(f, "eMMC"),
            FirehoseStorageType::Nvme => write!(f, "NVMe"),
            FirehoseStorageType::Nand => write!(f, "NAND"),
            FirehoseStorageType::Spinor => write!(f, "SPINOR"),
        }
    }
}

impl FromStr for FirehoseStorageType {
    type Err = QdlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ufs" => Ok(FirehoseStorageType::Ufs),
            "emmc" => Ok(FirehoseStorageType::Emmc),
            "nvme" => Ok(FirehoseStorageType::Nvme),
            "nand" => Ok(FirehoseStorageType::Nand),
            "spinor" => Ok(FirehoseStorageType::Spinor),
            _ => Err(QdlError::Validation {
                field: "storage type",
                reason: format!("unknown storage type '{s}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirehoseResetMode {
    #[default]
    Reset,
    ResetToEdl,
    Off,
}

impl fmt::Display for FirehoseResetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirehoseResetMode::Reset => write!(f, "reset"),
            FirehoseResetMode::ResetToEdl => write!(f, "reset_to_edl"),
            FirehoseResetMode::Off => write!(f, "off"),
        }
    }
}

impl FromStr for FirehoseResetMode {
    type Err = QdlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reset" | "system" => Ok(FirehoseResetMode::Reset),
            "reset_to_edl" | "edl" => Ok(FirehoseResetMode::ResetToEdl),
            "off" => Ok(FirehoseResetMode::Off),
            _ => Err(QdlError::Validation {
                field: "reset mode",
                reason: format!("unknown reset mode '{s}'"),
            }),
        }
    }
}

/// Session-wide Firehose knobs. The defaults describe a UFS target and are
/// what gets advertised to the loader in the `<configure>` handshake.
#[derive(Debug, Clone)]
pub struct FirehoseConfiguration {
    pub storage_type: FirehoseStorageType,
    pub storage_sector_size: usize,
    /// MaxPayloadSizeToTargetInBytes; must stay a multiple of the sector size
    pub send_buffer_size: usize,
    /// MaxXMLSizeInBytes
    pub xml_buf_size: usize,
    pub max_lun: u8,
    /// Use the `<erase>` fast path; zero-fill `<program>` otherwise
    pub fast_erase: bool,
    pub skip_storage_init: bool,
    pub skip_write: bool,
    pub backend: QdlBackend,
    /// Populated by the configure handshake
    pub luns: Vec<u8>,
}

impl Default for FirehoseConfiguration {
    fn default() -> Self {
        FirehoseConfiguration {
            storage_type: FirehoseStorageType::Ufs,
            storage_sector_size: 4096,
            send_buffer_size: 1024 * 1024,
            xml_buf_size: 4096,
            max_lun: 6,
            fast_erase: true,
            skip_storage_init: false,
            skip_write: false,
            backend: QdlBackend::Usb,
            luns: vec![],
        }
    }
}

/// What the protocol layers operate on: a raw channel plus the session
/// configuration and the device-message accumulator.
pub trait QdlChan {
    fn rw(&mut self) -> &mut dyn QdlReadWrite;
    fn fh_config(&self) -> &FirehoseConfiguration;
    fn mut_fh_config(&mut self) -> &mut FirehoseConfiguration;
    fn messages(&mut self) -> &mut DeviceMessages;
}

pub struct QdlDevice<'a> {
    pub rw: &'a mut dyn QdlReadWrite,
    pub fh_cfg: FirehoseConfiguration,
    pub messages: DeviceMessages,
}

impl<'a> QdlDevice<'a> {
    pub fn new(rw: &'a mut dyn QdlReadWrite, fh_cfg: FirehoseConfiguration) -> Self {
        QdlDevice {
            rw,
            fh_cfg,
            messages: DeviceMessages::new(),
        }
    }
}

impl QdlChan for QdlDevice<'_> {
    fn rw(&mut self) -> &mut dyn QdlReadWrite {
        self.rw
    }

    fn fh_config(&self) -> &FirehoseConfiguration {
        &self.fh_cfg
    }

    fn mut_fh_config(&mut self) -> &mut FirehoseConfiguration {
        &mut self.fh_cfg
    }

    fn messages(&mut self) -> &mut DeviceMessages {
        &mut self.messages
    }
}
