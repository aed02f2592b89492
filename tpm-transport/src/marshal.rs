// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Big-endian buffer helpers for headers and framing
//!
//! Command and response payloads are opaque to the transport. These helpers
//! only read the fixed 10-byte header and build the few frames the transport
//! itself emits.

use super::constants::*;
use super::error::{Error, Result};

/// Buffer for building frames
#[derive(Debug, Default)]
pub struct CommandBuffer {
    data: Vec<u8>,
}

impl CommandBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Update a u32 at a specific position (for size fields)
    pub fn update_u32(&mut self, pos: usize, v: u32) {
        self.data[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
    }
}

/// Cursor over a received buffer
#[derive(Debug)]
pub struct ResponseBuffer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ResponseBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::TransportError(format!(
                "buffer underflow reading {what} (remaining: {})",
                self.remaining()
            )));
        }
        let v = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(v)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let b = self.take(2, "u16")?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4, "u32")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Fixed part of every TPM command and response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: u16,
    pub param_size: u32,
    pub code: u32,
}

impl Header {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < TPM_HEADER_SIZE {
            return Err(Error::TransportError(format!(
                "TPM response too short: {} bytes",
                bytes.len()
            )));
        }
        let mut buf = ResponseBuffer::new(bytes);
        Ok(Self {
            tag: buf.get_u16()?,
            param_size: buf.get_u32()?,
            code: buf.get_u32()?,
        })
    }
}

/// Trim a raw device read to the size announced in its header.
///
/// `max_len` is the buffer the caller offered. A header announcing more than
/// that is `BufferTooSmall`; one announcing more than was read, or less than a
/// header, is a malformed response.
pub fn trim_to_param_size(mut raw: Vec<u8>, max_len: usize) -> Result<Vec<u8>> {
    let header = Header::parse(&raw)?;
    let size = header.param_size as usize;
    if size > max_len {
        tracing::debug!("response needs {size} bytes, buffer offers {max_len}");
        return Err(Error::BufferTooSmall);
    }
    if size < TPM_HEADER_SIZE || size > raw.len() {
        return Err(Error::TransportError(format!(
            "response paramSize {size} does not match {} bytes read",
            raw.len()
        )));
    }
    raw.truncate(size);
    Ok(raw)
}

/// Build a TPM2_GetCapability request for one TPM property
pub fn get_capability_command(capability: u32, property: u32) -> Vec<u8> {
    let mut buf = CommandBuffer::with_capacity(22);

    // Header: tag (2) + size (4) + command code (4)
    buf.put_u16(TpmSt::NoSessions.to_u16());
    buf.put_u32(0); // Size placeholder
    buf.put_u32(TpmCc::GetCapability.to_u32());
    buf.put_u32(capability);
    buf.put_u32(property);
    buf.put_u32(1); // propertyCount

    let size = buf.len() as u32;
    buf.update_u32(PARAM_SIZE_OFFSET, size);
    buf.into_vec()
}

/// Extract the value of `property` from a TPM2_GetCapability response.
///
/// Returns `Ok(None)` when the TPM answered with an error code or did not
/// report the requested property.
pub fn parse_tpm_property(response: &[u8], property: u32) -> Result<Option<u32>> {
    let header = Header::parse(response)?;
    if header.code != TPM_RC_SUCCESS {
        tracing::debug!("GetCapability returned TPM error: 0x{:08x}", header.code);
        return Ok(None);
    }
    let mut buf = ResponseBuffer::new(&response[TPM_HEADER_SIZE..]);
    let _more_data = buf.get_u8()?;
    let _capability = buf.get_u32()?;
    let count = buf.get_u32()?;
    for _ in 0..count {
        let prop = buf.get_u32()?;
        let value = buf.get_u32()?;
        if prop == property {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn property_response(property: u32, value: u32) -> Vec<u8> {
        let mut buf = CommandBuffer::with_capacity(27);
        buf.put_u16(TpmSt::NoSessions.to_u16());
        buf.put_u32(0);
        buf.put_u32(TPM_RC_SUCCESS);
        buf.put_u8(0); // moreData
        buf.put_u32(tpm_cap::TPM_PROPERTIES);
        buf.put_u32(1);
        buf.put_u32(property);
        buf.put_u32(value);
        let size = buf.len() as u32;
        buf.update_u32(PARAM_SIZE_OFFSET, size);
        buf.into_vec()
    }

    #[test]
    fn test_get_capability_command() {
        let bytes = get_capability_command(tpm_cap::TPM_PROPERTIES, tpm_cap::PT_MANUFACTURER);

        assert_eq!(&bytes[0..2], &[0x80, 0x01]); // TPM_ST_NO_SESSIONS
        assert_eq!(&bytes[6..10], &[0x00, 0x00, 0x01, 0x7A]); // TPM_CC_GetCapability
        let size = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        assert_eq!(size as usize, bytes.len());
        assert_eq!(bytes.len(), 22);
    }

    #[test]
    fn test_parse_tpm_property() {
        let response = property_response(tpm_cap::PT_MANUFACTURER, 0x4946_5800);
        let value = parse_tpm_property(&response, tpm_cap::PT_MANUFACTURER).unwrap();
        assert_eq!(value, Some(0x4946_5800)); // "IFX\0"
        let missing = parse_tpm_property(&response, tpm_cap::PT_FIRMWARE_VERSION_1).unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn test_trim_to_param_size() {
        let mut raw = vec![0x80, 0x01, 0x00, 0x00, 0x00, 0x0C, 0, 0, 0, 0, 0xAA, 0xBB];
        raw.resize(DEFAULT_MAX_BUFFER_SIZE, 0);
        let trimmed = trim_to_param_size(raw, DEFAULT_MAX_BUFFER_SIZE).unwrap();
        assert_eq!(trimmed.len(), 12);
        assert_eq!(&trimmed[10..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_trim_rejects_oversized_and_short() {
        let raw = vec![0x80, 0x01, 0x00, 0x00, 0x20, 0x00, 0, 0, 0, 0];
        assert_eq!(
            trim_to_param_size(raw, DEFAULT_MAX_BUFFER_SIZE),
            Err(Error::BufferTooSmall)
        );

        let raw = vec![0x80, 0x01, 0x00, 0x00, 0x00, 0x04, 0, 0, 0, 0];
        assert!(matches!(
            trim_to_param_size(raw, DEFAULT_MAX_BUFFER_SIZE),
            Err(Error::TransportError(_))
        ));
    }

    #[test]
    fn test_buffer_underflow() {
        let mut buf = ResponseBuffer::new(&[0x01]);
        assert!(buf.get_u16().is_err());
        assert_eq!(buf.get_u8().unwrap(), 0x01);
        assert_eq!(buf.remaining(), 0);
    }
}
