// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::io;
use std::time::Duration;

use rusb::{self, Device, DeviceHandle, GlobalContext};

use crate::error::{QdlError, Result};
use crate::types::QdlReadWrite;

const USB_VID_QCOM: u16 = 0x05c6;
const USB_PID_EDL: u16 = 0x9008;
const INTF_DESC_PROTO_CODES: [u8; 3] = [0x10, 0x11, 0xFF];

pub struct QdlUsbConfig {
    dev_handle: DeviceHandle<GlobalContext>,
    in_ep: u8,
    out_ep: u8,
    in_max_packet_size: usize,
}

impl QdlReadWrite for QdlUsbConfig {
    fn connected(&self) -> bool {
        self.dev_handle.device().device_descriptor().is_ok()
    }

    fn max_packet_size(&self) -> usize {
        self.in_max_packet_size
    }

    fn read_packet(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.dev_handle
            .read_bulk(self.in_ep, buf, timeout)
            .map_err(rusb_err_xlate)
    }

    fn write_chunk(&mut self, buf: &[u8], timeout: Duration) -> io::Result<usize> {
        self.dev_handle
            .write_bulk(self.out_ep, buf, timeout)
            .map_err(rusb_err_xlate)
    }
}

fn find_usb_handle_by_sn(
    devices: &mut dyn Iterator<Item = Device<GlobalContext>>,
    serial_no: &str,
) -> Result<DeviceHandle<GlobalContext>> {
    for d in devices {
        let Ok(dh) = d.open() else { continue };
        let Ok(desc) = d.device_descriptor() else {
            continue;
        };

        // EDL devices encode the serial in the product string, "..._SN:<sn>"
        let Ok(prod_str) = dh.read_product_string_ascii(&desc) else {
            continue;
        };
        let Some(pos) = prod_str.find("_SN:") else {
            continue;
        };
        if prod_str[pos + "_SN:".len()..].eq_ignore_ascii_case(serial_no) {
            return Ok(dh);
        }
    }

    Err(QdlError::Connection(format!(
        "found no devices in EDL mode with serial number {serial_no}"
    )))
}

pub fn setup_usb_device(serial_no: Option<String>) -> Result<QdlUsbConfig> {
    let rusb_devices = rusb::devices().map_err(|e| QdlError::Usb(rusb_err_xlate(e)))?;
    let mut devices = rusb_devices.iter().filter(|d: &Device<GlobalContext>| {
        d.device_descriptor().is_ok_and(|desc| {
            desc.vendor_id() == USB_VID_QCOM && desc.product_id() == USB_PID_EDL
        })
    });

    let dev_handle = match serial_no {
        Some(s) => find_usb_handle_by_sn(&mut devices, &s)?,
        None => devices
            .next()
            .ok_or_else(|| QdlError::Connection("found no devices in EDL mode".to_string()))?
            .open()
            .map_err(|e| QdlError::Usb(rusb_err_xlate(e)))?,
    };

    let cfg_desc = dev_handle
        .device()
        .active_config_descriptor()
        .map_err(|e| QdlError::Usb(rusb_err_xlate(e)))?;
    let intf_desc = cfg_desc
        .interfaces()
        .flat_map(|i| i.descriptors())
        .find(|d| {
            d.class_code() == 0xFF
                && d.sub_class_code() == 0xFF
                && INTF_DESC_PROTO_CODES.contains(&d.protocol_code())
                && d.num_endpoints() >= 2
        })
        .ok_or_else(|| QdlError::Connection("no EDL interface on the device".to_string()))?;

    let in_ep = intf_desc
        .endpoint_descriptors()
        .find(|e| {
            e.direction() == rusb::Direction::In && e.transfer_type() == rusb::TransferType::Bulk
        })
        .ok_or_else(|| QdlError::Connection("no bulk IN endpoint".to_string()))?;
    let out_ep = intf_desc
        .endpoint_descriptors()
        .find(|e| {
            e.direction() == rusb::Direction::Out && e.transfer_type() == rusb::TransferType::Bulk
        })
        .ok_or_else(|| QdlError::Connection("no bulk OUT endpoint".to_string()))?;

    let in_addr = in_ep.address();
    let out_addr = out_ep.address();
    let in_max_packet_size = in_ep.max_packet_size() as usize;

    // Make sure we can actually poke at the device
    dev_handle.set_auto_detach_kernel_driver(true).ok();
    dev_handle
        .claim_interface(intf_desc.interface_number())
        .map_err(|e| {
            QdlError::Connection(format!(
                "couldn't claim interface {}: {e}",
                intf_desc.interface_number()
            ))
        })?;

    Ok(QdlUsbConfig {
        dev_handle,
        in_ep: in_addr,
        out_ep: out_addr,
        in_max_packet_size,
    })
}

fn rusb_err_xlate(e: rusb::Error) -> io::Error {
    io::Error::from(match e {
        rusb::Error::Timeout => io::ErrorKind::TimedOut,
        rusb::Error::Access => io::ErrorKind::PermissionDenied,
        rusb::Error::NoDevice => io::ErrorKind::NotConnected,
        _ => io::ErrorKind::Other,
    })
}
