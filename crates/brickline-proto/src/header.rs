//! Packet header codec.
//!
//! Every packet on the wire starts with the same fixed 8-byte header, all
//! integers little-endian:
//!
//! ```text
//! offset 0  u32  UID (0 = broadcast, 1 = the daemon itself)
//! offset 4  u8   total packet length, 8..=80
//! offset 5  u8   function ID
//! offset 6  u8   bits 7..4 sequence number, bit 3 response-expected flag
//! offset 7  u8   bits 7..6 error code (responses only)
//! ```
//!
//! Sequence numbers cycle 1..=15; 0 is reserved for callbacks pushed by
//! devices. The codec is pure and infallible on 8-byte inputs.

/// Size of the packet header in bytes.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Maximum payload size in bytes.
pub const MAX_PAYLOAD_SIZE: usize = 64;

/// Maximum total packet size in bytes (header + payload + slack).
pub const MAX_PACKET_SIZE: usize = PACKET_HEADER_SIZE + MAX_PAYLOAD_SIZE + 8;

/// Fixed-size packet buffer as assembled by the frame reader.
///
/// Packets shorter than [`MAX_PACKET_SIZE`] are zero-padded; the real length
/// is in the header.
pub type PacketBuf = [u8; MAX_PACKET_SIZE];

/// Function IDs with a protocol-wide meaning, independent of any device type.
pub mod function_id {
    /// Requests the 4-byte server nonce for the authentication handshake.
    pub const GET_AUTHENTICATION_NONCE: u8 = 1;

    /// Submits the client nonce and HMAC-SHA1 digest to authenticate.
    pub const AUTHENTICATE: u8 = 2;

    /// Liveness probe sent by the client while the connection is idle.
    pub const DISCONNECT_PROBE: u8 = 128;

    /// Broadcast callback advertising a device (see `EnumerateResponse`).
    pub const CALLBACK_ENUMERATE: u8 = 253;

    /// Asks every device in the stack to send an enumerate callback.
    pub const ENUMERATE: u8 = 254;

    /// Queries a device's identity (UID, position, versions, identifier).
    pub const GET_IDENTITY: u8 = 255;
}

/// Decoded form of the 8-byte packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Internal 32-bit UID of the addressed device.
    pub uid: u32,
    /// Total packet length including the header, 8..=80.
    pub length: u8,
    /// Function ID selecting the operation on the device.
    pub function_id: u8,
    /// Sequence number, 1..=15 for requests, 0 for callbacks.
    pub sequence_number: u8,
    /// Whether the peer should answer this packet.
    pub response_expected: bool,
    /// Error code reported in a response, 0 on success.
    pub error_code: u8,
}

impl PacketHeader {
    /// Header for an outbound packet carrying `payload_len` payload bytes.
    ///
    /// The sequence number is left at 0; the connection task stamps it right
    /// before the packet goes out.
    pub fn with_payload_len(uid: u32, function_id: u8, payload_len: u8, response_expected: bool) -> Self {
        Self {
            uid,
            length: PACKET_HEADER_SIZE as u8 + payload_len,
            function_id,
            sequence_number: 0,
            response_expected,
            error_code: 0,
        }
    }

    /// Encode into wire order.
    ///
    /// The sequence nibble lands in the high half of byte 6 with the
    /// response-expected flag at bit 3, the error code in the top two bits of
    /// byte 7.
    pub fn to_le_bytes(&self) -> [u8; PACKET_HEADER_SIZE] {
        let uid = self.uid.to_le_bytes();
        let mut flags = self.sequence_number << 4;
        if self.response_expected {
            flags |= 1 << 3;
        }
        [
            uid[0],
            uid[1],
            uid[2],
            uid[3],
            self.length,
            self.function_id,
            flags,
            self.error_code << 6,
        ]
    }

    /// Decode from wire order.
    pub fn from_le_bytes(bytes: &[u8; PACKET_HEADER_SIZE]) -> Self {
        Self {
            uid: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            length: bytes[4],
            function_id: bytes[5],
            sequence_number: bytes[6] >> 4,
            response_expected: bytes[6] & 0x08 != 0,
            error_code: bytes[7] >> 6,
        }
    }

    /// Decode the header at the front of an assembled packet.
    pub fn from_packet(packet: &PacketBuf) -> Self {
        Self::from_le_bytes(&[
            packet[0], packet[1], packet[2], packet[3], packet[4], packet[5], packet[6], packet[7],
        ])
    }
}
