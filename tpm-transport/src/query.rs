// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Status and capability queries
//!
//! None of these touch session state. Values the transport knows itself are
//! answered locally; manufacturer and firmware version are read from the TPM
//! with TPM2_GetCapability.

use tracing::{debug, warn};

use crate::channel::{driver_version, ChannelState, DeviceChannel};
use crate::constants::*;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::types::{StatusType, StatusValue};

/// Report driver or device status without taking the device lock.
pub fn get_status(device: &Device, status_type: StatusType) -> StatusValue {
    let state = device.shared().state();
    match status_type {
        StatusType::Driver => match state {
            ChannelState::Open => StatusValue::DriverOk,
            ChannelState::Faulted => StatusValue::DriverFailed,
            ChannelState::Closed => StatusValue::DriverNotOpened,
        },
        StatusType::Device => match state {
            ChannelState::Open => StatusValue::DeviceOk,
            ChannelState::Faulted => StatusValue::DeviceUnrecoverable,
            ChannelState::Closed => probe_device(device),
        },
    }
}

/// Check a closed device is reachable by opening and closing it once.
fn probe_device(device: &Device) -> StatusValue {
    match device.connector().connect() {
        Ok(mut backend) => {
            if let Err(err) = backend.close() {
                debug!("closing status probe failed: {err}");
            }
            StatusValue::DeviceOk
        }
        // Present but held by someone else.
        Err(Error::AlreadyOpen | Error::DeviceBusy) => StatusValue::DeviceOk,
        Err(Error::DeviceUnavailable(reason)) => {
            debug!("device probe: {reason}");
            StatusValue::DeviceNotFound
        }
        Err(err) => {
            debug!("device probe failed: {err}");
            StatusValue::DeviceUnrecoverable
        }
    }
}

pub fn get_capability(device: &Device, area: u32, sub_cap: u32) -> Result<Vec<u8>> {
    let shared = device.shared();
    match (area, sub_cap) {
        (cap_area::VERSION, cap_version::DRIVER) => Ok(driver_version().to_vec()),
        (cap_area::VERSION, cap_version::FIRMWARE) => {
            tpm_property(device, area, sub_cap, tpm_cap::PT_FIRMWARE_VERSION_1)
        }
        (cap_area::PROPERTY, cap_prop::MANUFACTURER) => {
            tpm_property(device, area, sub_cap, tpm_cap::PT_MANUFACTURER)
        }
        (cap_area::PROPERTY, cap_prop::MODULE_TYPE) => Ok(vec![shared.kind() as u8]),
        (cap_area::PROPERTY, cap_prop::GLOBAL_STATE) => Ok(vec![shared.state() as u8]),
        (cap_area::PROPERTY, cap_prop::MAX_BUFFER) => {
            Ok((shared.max_response_len() as u32).to_be_bytes().to_vec())
        }
        (cap_area::PROPERTY, cap_prop::TIMEOUT_MS) => {
            Ok((shared.timeout().as_millis() as u32).to_be_bytes().to_vec())
        }
        _ => Err(Error::UnsupportedCapability { area, sub_cap }),
    }
}

pub fn set_capability(device: &Device, area: u32, sub_cap: u32, value: &[u8]) -> Result<()> {
    let shared = device.shared();
    match (area, sub_cap) {
        (cap_area::PROPERTY, cap_prop::MAX_BUFFER) => {
            let len = be_u32(value)? as usize;
            if !(TPM_HEADER_SIZE..=MAX_NEGOTIABLE_BUFFER_SIZE).contains(&len) {
                return Err(Error::Config(format!(
                    "response buffer of {len} bytes is outside \
                     {TPM_HEADER_SIZE}..={MAX_NEGOTIABLE_BUFFER_SIZE}"
                )));
            }
            debug!("response buffer set to {len} bytes");
            shared.set_max_response_len(len);
            Ok(())
        }
        (cap_area::PROPERTY, cap_prop::TIMEOUT_MS) => {
            let ms = be_u32(value)?;
            if ms == 0 {
                return Err(Error::Config("transmit timeout must be non-zero".into()));
            }
            debug!("transmit timeout set to {ms} ms");
            shared.set_timeout(std::time::Duration::from_millis(ms as u64));
            Ok(())
        }
        (cap_area::VERSION, cap_version::DRIVER | cap_version::FIRMWARE)
        | (
            cap_area::PROPERTY,
            cap_prop::MANUFACTURER | cap_prop::MODULE_TYPE | cap_prop::GLOBAL_STATE,
        ) => Err(Error::PermissionDenied(format!(
            "capability 0x{area:04x}/0x{sub_cap:04x} is read-only"
        ))),
        _ => Err(Error::UnsupportedCapability { area, sub_cap }),
    }
}

fn be_u32(value: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = value.try_into().map_err(|_| {
        Error::Config(format!(
            "expected a 4-byte big-endian value, got {} bytes",
            value.len()
        ))
    })?;
    Ok(u32::from_be_bytes(bytes))
}

/// Read a TPM property and return it as 4 big-endian bytes.
///
/// With the channel open this goes out of band when the device allows a
/// second connection, and otherwise queues on the device lock like any
/// command. With the channel closed a transient channel is opened under the
/// lock so no session can grab the device halfway.
fn tpm_property(device: &Device, area: u32, sub_cap: u32, property: u32) -> Result<Vec<u8>> {
    let value = if device.shared().state() == ChannelState::Open && device.out_of_band_queries()
    {
        debug!("reading TPM property 0x{property:x} out of band");
        let probe = DeviceChannel::transient(device.connector().clone(), device.shared());
        read_transient(probe, property)?
    } else {
        let mut channel = device.lock();
        match channel.state() {
            ChannelState::Closed => {
                let probe = DeviceChannel::transient(device.connector().clone(), device.shared());
                read_transient(probe, property)?
            }
            _ => channel.tpm_property(property)?,
        }
    };
    match value {
        Some(value) => Ok(value.to_be_bytes().to_vec()),
        None => Err(Error::UnsupportedCapability { area, sub_cap }),
    }
}

fn read_transient(mut channel: DeviceChannel, property: u32) -> Result<Option<u32>> {
    let handle = channel.open()?;
    let value = channel.tpm_property(property);
    if let Err(err) = channel.close(handle) {
        warn!("failed to close transient channel: {err}");
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_be_u32_requires_four_bytes() {
        assert_eq!(be_u32(&[0, 0, 0x10, 0]).unwrap(), 4096);
        assert!(matches!(be_u32(&[1, 2, 3]), Err(Error::Config(_))));
    }
}
