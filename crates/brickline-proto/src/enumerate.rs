//! Enumerate callback payload.
//!
//! Devices broadcast an enumerate callback (function ID 253) when they appear
//! or disappear, and on request (function ID 254). The 26-byte payload
//! describes the device and where it sits in the stack.

/// Size of the enumerate callback payload in bytes.
pub const ENUMERATE_PAYLOAD_SIZE: usize = 26;

/// Why a device sent an enumerate callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnumerationType {
    /// Device is available; triggered by an enumerate request. Can occur
    /// multiple times for the same device.
    Available = 0,
    /// Device was newly connected and has potentially lost its previous
    /// configuration.
    Connected = 1,
    /// Device was disconnected (USB stacks only). Only the UID and the
    /// enumeration type are valid in this case.
    Disconnected = 2,
}

impl EnumerationType {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Available),
            1 => Some(Self::Connected),
            2 => Some(Self::Disconnected),
            _ => None,
        }
    }
}

/// Decoded enumerate callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumerateResponse {
    /// UID of the device.
    pub uid: String,
    /// UID of the Brick the device is connected to; `"0"` for the bottom
    /// Master Brick of a stack.
    pub connected_uid: String,
    /// `'0'`..`'8'` for Bricks (position in the stack), `'a'`..`'d'` for
    /// Bricklets (port on the Brick).
    pub position: char,
    /// Major, minor and release number of the hardware version.
    pub hardware_version: [u8; 3],
    /// Major, minor and release number of the firmware version.
    pub firmware_version: [u8; 3],
    /// Number identifying the device type.
    pub device_identifier: u16,
    /// Why this callback was sent.
    pub enumeration_type: EnumerationType,
}

impl EnumerateResponse {
    /// Decode the 26-byte little-endian payload.
    ///
    /// Returns `None` for truncated payloads or an unknown enumeration type.
    /// UID fields are NUL-padded ASCII and trimmed at the first NUL.
    pub fn from_le_bytes(payload: &[u8]) -> Option<Self> {
        if payload.len() < ENUMERATE_PAYLOAD_SIZE {
            return None;
        }
        Some(Self {
            uid: packed_string(&payload[0..8]),
            connected_uid: packed_string(&payload[8..16]),
            position: char::from(payload[16]),
            hardware_version: [payload[17], payload[18], payload[19]],
            firmware_version: [payload[20], payload[21], payload[22]],
            device_identifier: u16::from_le_bytes([payload[23], payload[24]]),
            enumeration_type: EnumerationType::from_byte(payload[25])?,
        })
    }
}

/// NUL-padded ASCII field to string, trimmed at the first NUL.
fn packed_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
