// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Command, response and handle types

use std::fmt;

use super::constants::*;

/// Privilege level a command is issued at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum Locality {
    #[default]
    Zero = 0,
    One = 1,
    Two = 2,
    Three = 3,
    Four = 4,
}

impl Locality {
    pub const ALL: [Locality; 5] = [
        Locality::Zero,
        Locality::One,
        Locality::Two,
        Locality::Three,
        Locality::Four,
    ];

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }
}

impl fmt::Display for Locality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_u8())
    }
}

/// Scheduling hint attached to a command (TBS priority classes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    System,
}

impl Priority {
    /// Numeric value used by TBS
    pub fn to_u32(self) -> u32 {
        match self {
            Priority::Low => 100,
            Priority::Normal => 200,
            Priority::High => 300,
            Priority::System => 400,
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "system" => Ok(Priority::System),
            _ => Err(format!("unknown priority: {s}")),
        }
    }
}

/// A request unit submitted to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub payload: Vec<u8>,
    pub locality: Locality,
    pub priority: Priority,
}

impl Command {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            locality: Locality::default(),
            priority: Priority::default(),
        }
    }

    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = locality;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Bytes produced by the device for one command.
///
/// Transport failures never produce a `Response`; the result code here is
/// the one the TPM put in the response header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub payload: Vec<u8>,
    /// TPM response code, `None` when the payload is shorter than a header
    pub result_code: Option<u32>,
}

impl Response {
    pub(crate) fn new(payload: Vec<u8>) -> Self {
        let result_code = payload
            .get(RESPONSE_CODE_OFFSET..TPM_HEADER_SIZE)
            .map(|rc| u32::from_be_bytes([rc[0], rc[1], rc[2], rc[3]]));
        Self {
            payload,
            result_code,
        }
    }

    /// TPM response code from the header, if the payload carries a header
    pub fn tpm_rc(&self) -> Option<u32> {
        self.result_code
    }

    /// Whether the TPM reported `TPM_RC_SUCCESS`
    pub fn is_success(&self) -> bool {
        self.result_code == Some(TPM_RC_SUCCESS)
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Identifier of an open device channel. Generation numbered, so a handle
/// from before a close/reopen never matches the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub(crate) u64);

impl DeviceHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

/// Caller-visible session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(pub(crate) u64);

impl SessionHandle {
    /// Rebuild a handle from an id previously returned by [`id`](Self::id)
    pub fn from_id(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Open,
    Closed,
    Faulted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Faulted)
    }
}

/// What `get_status` is asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusType {
    Driver,
    Device,
}

impl StatusType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            status::DRIVER => Some(StatusType::Driver),
            status::DEVICE => Some(StatusType::Device),
            _ => None,
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            StatusType::Driver => status::DRIVER,
            StatusType::Device => status::DEVICE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusValue {
    DriverOk,
    DriverFailed,
    DriverNotOpened,
    DeviceOk,
    DeviceUnrecoverable,
    DeviceNotFound,
}

impl StatusValue {
    pub fn to_u32(self) -> u32 {
        match self {
            StatusValue::DriverOk => status::DRIVER_OK,
            StatusValue::DriverFailed => status::DRIVER_FAILED,
            StatusValue::DriverNotOpened => status::DRIVER_NOT_OPENED,
            StatusValue::DeviceOk => status::DEVICE_OK,
            StatusValue::DeviceUnrecoverable => status::DEVICE_UNRECOVERABLE,
            StatusValue::DeviceNotFound => status::DEVICE_NOT_FOUND,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_rc() {
        let response = Response::new(vec![
            0x80, 0x01, // TPM_ST_NO_SESSIONS
            0x00, 0x00, 0x00, 0x0A, // Size = 10
            0x00, 0x00, 0x01, 0x01, // TPM_RC_FAILURE
        ]);
        assert_eq!(response.tpm_rc(), Some(0x101));
        assert!(!response.is_success());
        let short = Response::new(vec![0x80, 0x01]);
        assert_eq!(short.tpm_rc(), None);
        assert!(!short.is_success());
    }

    #[test]
    fn test_locality_from_u8() {
        assert_eq!(Locality::from_u8(3), Some(Locality::Three));
        assert_eq!(Locality::from_u8(5), None);
    }

    #[test]
    fn test_command_defaults() {
        let cmd = Command::new([1u8, 2, 3]);
        assert_eq!(cmd.locality, Locality::Zero);
        assert_eq!(cmd.priority, Priority::Normal);
        assert_eq!(cmd.len(), 3);
    }
}
