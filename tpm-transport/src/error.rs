// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy and native status codes

use std::fmt;
use std::io;

use thiserror::Error;

use crate::types::Locality;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the transport core.
///
/// Every variant has a stable numeric [`StatusCode`], which is what gets
/// recorded as the sticky last-result of a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("TPM device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("device channel is already open")]
    AlreadyOpen,
    #[error("a session is already open on this device")]
    SessionAlreadyOpen,
    #[error("session is not open")]
    SessionNotOpen,
    #[error("command of {len} bytes exceeds the {max}-byte limit")]
    CommandTooLarge { len: usize, max: usize },
    #[error("response does not fit in the offered buffer")]
    BufferTooSmall,
    #[error("device busy")]
    DeviceBusy,
    #[error("transport error: {0}")]
    TransportError(String),
    #[error("transmit timed out")]
    TransportTimeout,
    #[error("device channel is faulted")]
    ChannelFaulted,
    #[error("unsupported capability: area 0x{area:04x}, sub-capability 0x{sub_cap:04x}")]
    UnsupportedCapability { area: u32, sub_cap: u32 },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("no outstanding command to cancel")]
    NothingToCancel,
    #[error("locality {0} is not supported by this backend")]
    UnsupportedLocality(Locality),
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Numeric status recorded for this failure.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::DeviceUnavailable(_) => StatusCode::DEVICE_UNAVAILABLE,
            Error::AlreadyOpen => StatusCode::ALREADY_OPEN,
            Error::SessionAlreadyOpen => StatusCode::SESSION_ALREADY_OPEN,
            Error::SessionNotOpen => StatusCode::SESSION_NOT_OPEN,
            Error::CommandTooLarge { .. } => StatusCode::COMMAND_TOO_LARGE,
            Error::BufferTooSmall => StatusCode::BUFFER_TOO_SMALL,
            Error::DeviceBusy => StatusCode::DEVICE_BUSY,
            Error::TransportError(_) => StatusCode::TRANSPORT_ERROR,
            Error::TransportTimeout => StatusCode::TRANSPORT_TIMEOUT,
            Error::ChannelFaulted => StatusCode::CHANNEL_FAULTED,
            Error::UnsupportedCapability { .. } => StatusCode::UNSUPPORTED_CAPABILITY,
            Error::PermissionDenied(_) => StatusCode::PERMISSION_DENIED,
            Error::NothingToCancel => StatusCode::NOTHING_TO_CANCEL,
            Error::UnsupportedLocality(_) => StatusCode::UNSUPPORTED_LOCALITY,
            Error::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            Error::Config(_) => StatusCode::CONFIG,
        }
    }

    /// Translate a status code reported by a device binding.
    ///
    /// Returns `None` for success. Codes that only the core itself can
    /// produce, and codes outside the known range, become `TransportError`.
    pub fn from_native(code: StatusCode) -> Option<Self> {
        let err = match code {
            StatusCode::SUCCESS => return None,
            StatusCode::DEVICE_UNAVAILABLE => {
                Error::DeviceUnavailable(format!("native status {code}"))
            }
            StatusCode::ALREADY_OPEN => Error::AlreadyOpen,
            StatusCode::BUFFER_TOO_SMALL => Error::BufferTooSmall,
            StatusCode::DEVICE_BUSY => Error::DeviceBusy,
            StatusCode::TRANSPORT_TIMEOUT => Error::TransportTimeout,
            StatusCode::CHANNEL_FAULTED => Error::ChannelFaulted,
            StatusCode::PERMISSION_DENIED => {
                Error::PermissionDenied(format!("native status {code}"))
            }
            StatusCode::NOTHING_TO_CANCEL => Error::NothingToCancel,
            StatusCode::NOT_IMPLEMENTED => Error::NotImplemented("native operation"),
            _ => Error::TransportError(format!("native status {code}")),
        };
        Some(err)
    }

    /// Whether this failure leaves the device handle unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::TransportTimeout | Error::ChannelFaulted)
    }

    /// Map an I/O failure on an open channel. `EBUSY` here means the device
    /// still holds an unread response or is executing another command.
    pub(crate) fn io(context: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::TransportTimeout,
            _ if is_ebusy(&err) => Error::DeviceBusy,
            _ => Error::TransportError(format!("{context}: {err}")),
        }
    }

    pub(crate) fn unavailable(context: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => Error::PermissionDenied(format!("{context}: {err}")),
            _ if is_ebusy(&err) => Error::AlreadyOpen,
            _ => Error::DeviceUnavailable(format!("{context}: {err}")),
        }
    }
}

#[cfg(unix)]
fn is_ebusy(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EBUSY)
}

#[cfg(not(unix))]
fn is_ebusy(_err: &io::Error) -> bool {
    false
}

const TDDL_LAYER: u32 = 0x0000_1000;

/// Numeric result code, laid out after the TSS TDDL layer codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const SUCCESS: Self = Self(0);
    pub const DEVICE_UNAVAILABLE: Self = Self(TDDL_LAYER | 0x01);
    pub const ALREADY_OPEN: Self = Self(TDDL_LAYER | 0x02);
    pub const TRANSPORT_TIMEOUT: Self = Self(TDDL_LAYER | 0x04);
    pub const BUFFER_TOO_SMALL: Self = Self(TDDL_LAYER | 0x05);
    pub const DEVICE_BUSY: Self = Self(TDDL_LAYER | 0x06);
    pub const NOTHING_TO_CANCEL: Self = Self(TDDL_LAYER | 0x08);
    pub const TRANSPORT_ERROR: Self = Self(TDDL_LAYER | 0x09);
    pub const UNSUPPORTED_CAPABILITY: Self = Self(TDDL_LAYER | 0x0A);
    pub const PERMISSION_DENIED: Self = Self(TDDL_LAYER | 0x0B);
    pub const CHANNEL_FAULTED: Self = Self(TDDL_LAYER | 0x0C);
    pub const SESSION_ALREADY_OPEN: Self = Self(TDDL_LAYER | 0x10);
    pub const SESSION_NOT_OPEN: Self = Self(TDDL_LAYER | 0x11);
    pub const COMMAND_TOO_LARGE: Self = Self(TDDL_LAYER | 0x12);
    pub const UNSUPPORTED_LOCALITY: Self = Self(TDDL_LAYER | 0x13);
    pub const NOT_IMPLEMENTED: Self = Self(TDDL_LAYER | 0x14);
    pub const CONFIG: Self = Self(TDDL_LAYER | 0x15);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    pub fn to_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl<T> From<&Result<T>> for StatusCode {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => StatusCode::SUCCESS,
            Err(err) => err.status_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_round_trip_for_device_errors() {
        for err in [
            Error::AlreadyOpen,
            Error::BufferTooSmall,
            Error::DeviceBusy,
            Error::TransportTimeout,
            Error::ChannelFaulted,
            Error::NothingToCancel,
        ] {
            assert_eq!(Error::from_native(err.status_code()), Some(err));
        }
    }

    #[test]
    fn test_native_success_and_unknown() {
        assert_eq!(Error::from_native(StatusCode::SUCCESS), None);
        let err = Error::from_native(StatusCode(0x8028_400f)).unwrap();
        assert!(matches!(err, Error::TransportError(msg) if msg.contains("0x8028400f")));
    }

    #[test]
    fn test_io_timeout_maps_to_transport_timeout() {
        let err = Error::io("read", io::Error::from(io::ErrorKind::TimedOut));
        assert_eq!(err, Error::TransportTimeout);
        assert!(err.is_fatal());
    }

    #[cfg(unix)]
    #[test]
    fn test_ebusy_on_open_channel_is_device_busy() {
        let err = Error::io("write", io::Error::from_raw_os_error(libc::EBUSY));
        assert_eq!(err, Error::DeviceBusy);
        assert!(!err.is_fatal());
    }

    #[cfg(unix)]
    #[test]
    fn test_ebusy_on_open_is_already_open() {
        let err = Error::unavailable("open", io::Error::from_raw_os_error(libc::EBUSY));
        assert_eq!(err, Error::AlreadyOpen);
    }

    #[test]
    fn test_result_status_code() {
        let ok: Result<()> = Ok(());
        let err: Result<()> = Err(Error::SessionNotOpen);
        assert!(StatusCode::from(&ok).is_success());
        assert_eq!(StatusCode::from(&err), StatusCode::SESSION_NOT_OPEN);
    }
}
