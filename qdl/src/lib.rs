// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Host-side driver for Qualcomm devices in Emergency Download (EDL) mode.
//!
//! Talks Sahara to hand the boot ROM a Firehose loader, then Firehose to
//! read, write and erase storage. GPT and Android sparse image handling
//! live in-crate so the higher-level flows (flash, erase-LUN, repair-GPT,
//! slot switching) can address storage by partition name.

pub mod device;
pub mod error;
pub mod firehose;
pub mod gpt;
pub mod sahara;
pub mod sparse;
pub mod transport;
pub mod types;
pub mod xml;

#[cfg(feature = "serial")]
pub mod serial;
#[cfg(feature = "usb")]
pub mod usb;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Protocol, QdlError, Result};
pub use types::{
    FirehoseConfiguration, FirehoseResetMode, FirehoseStorageType, QdlBackend, QdlChan, QdlDevice,
    QdlReadWrite,
};

pub fn setup_target_device(
    backend: QdlBackend,
    serial_no: Option<String>,
    dev_path: Option<String>,
) -> Result<Box<dyn QdlReadWrite>> {
    match backend {
        #[cfg(feature = "usb")]
        QdlBackend::Usb => {
            let _ = dev_path;
            Ok(Box::new(usb::setup_usb_device(serial_no)?))
        }
        #[cfg(feature = "serial")]
        QdlBackend::Serial => {
            let _ = serial_no;
            Ok(Box::new(serial::setup_serial_device(dev_path)?))
        }
        #[allow(unreachable_patterns)]
        other => Err(QdlError::Validation {
            field: "backend",
            reason: format!("support for {other:?} wasn't compiled in"),
        }),
    }
}

/// Byte-level substring search; the haystack may be arbitrary binary.
pub fn contains_bytes(needle: &str, haystack: &[u8]) -> bool {
    let needle = needle.as_bytes();
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}
