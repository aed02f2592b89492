// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Wire constants, capability areas and defaults

use std::time::Duration;

/// Default command/response buffer size (`TPM_MAX_BUFF_SIZE` of the 1.2 stacks)
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 4096;

/// Upper bound accepted for a negotiated buffer size
pub const MAX_NEGOTIABLE_BUFFER_SIZE: usize = 64 * 1024;

/// Tag (2) + paramSize (4) + code (4)
pub const TPM_HEADER_SIZE: usize = 10;

/// Offset of the paramSize field in command and response headers
pub const PARAM_SIZE_OFFSET: usize = 2;

/// Offset of the response code in a response header
pub const RESPONSE_CODE_OFFSET: usize = 6;

pub const TPM_RC_SUCCESS: u32 = 0;

pub const DEFAULT_TRANSMIT_TIMEOUT: Duration = Duration::from_secs(120);

/// TPM 2.0 structure tags (TPM_ST)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSt {
    NoSessions = 0x8001,
}

impl TpmSt {
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// TPM 2.0 command codes used internally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmCc {
    GetCapability = 0x0000017A,
}

impl TpmCc {
    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

/// TPM 2.0 GetCapability selectors
pub mod tpm_cap {
    pub const TPM_PROPERTIES: u32 = 0x0000_0006;

    pub const PT_MANUFACTURER: u32 = 0x0000_0105;
    pub const PT_FIRMWARE_VERSION_1: u32 = 0x0000_010B;
}

/// Driver-level capability areas, numbered after the TDDL interface
pub mod cap_area {
    pub const VERSION: u32 = 0x0100;
    pub const PROPERTY: u32 = 0x0200;
}

/// Sub-capabilities of [`cap_area::VERSION`]
pub mod cap_version {
    pub const DRIVER: u32 = 0x0101;
    pub const FIRMWARE: u32 = 0x0102;
}

/// Sub-capabilities of [`cap_area::PROPERTY`]
pub mod cap_prop {
    pub const MANUFACTURER: u32 = 0x0201;
    pub const MODULE_TYPE: u32 = 0x0202;
    pub const GLOBAL_STATE: u32 = 0x0203;
    pub const MAX_BUFFER: u32 = 0x0204;
    pub const TIMEOUT_MS: u32 = 0x0205;
}

/// Status request types and their values
pub mod status {
    pub const DRIVER: u32 = 0x0010;
    pub const DRIVER_OK: u32 = 0x0010;
    pub const DRIVER_FAILED: u32 = 0x0011;
    pub const DRIVER_NOT_OPENED: u32 = 0x0012;

    pub const DEVICE: u32 = 0x0020;
    pub const DEVICE_OK: u32 = 0x0020;
    pub const DEVICE_UNRECOVERABLE: u32 = 0x0021;
    pub const DEVICE_NOT_FOUND: u32 = 0x0023;
}

/// Microsoft TPM simulator TCP protocol
pub mod mssim {
    pub const DEFAULT_HOST: &str = "127.0.0.1";
    pub const DEFAULT_COMMAND_PORT: u16 = 2321;
    pub const DEFAULT_PLATFORM_PORT: u16 = 2322;

    pub const SIGNAL_POWER_ON: u32 = 1;
    pub const SEND_COMMAND: u32 = 8;
    pub const SIGNAL_CANCEL_ON: u32 = 9;
    pub const SIGNAL_CANCEL_OFF: u32 = 10;
    pub const SIGNAL_NV_ON: u32 = 11;
    pub const SESSION_END: u32 = 20;
}

/// Linux character devices probed when no path is configured
pub const DEFAULT_DEVICE_PATHS: [&str; 2] = ["/dev/tpmrm0", "/dev/tpm0"];
