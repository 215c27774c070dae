//! Wire format for the Brick Daemon TCP/IP protocol.
//!
//! The daemon fronts a stack of Brick and Bricklet devices and multiplexes
//! requests, responses and asynchronous callbacks over a single TCP stream.
//! Every packet starts with a fixed 8-byte little-endian header; payloads are
//! at most 64 bytes. This crate holds the pure, I/O-free pieces of that
//! format:
//!
//! - [`PacketHeader`]: the 8-byte header with its packed sequence/flag/error
//!   fields
//! - [`base58_to_u32`]: decoding of the short base-58 device UIDs used on the
//!   wire
//! - [`EnumerateResponse`]: the payload of the broadcast enumerate callback
//! - [`ErrorCode`]: the result code devices report in the header
//!
//! The connection runtime lives in `brickline-client`; per-device proxy types
//! are generated elsewhere and only depend on the types here.

#![forbid(unsafe_code)]

mod enumerate;
mod error;
mod header;
mod uid;

pub use enumerate::{ENUMERATE_PAYLOAD_SIZE, EnumerateResponse, EnumerationType};
pub use error::{ErrorCode, ResponseError};
pub use header::{
    MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE, PACKET_HEADER_SIZE, PacketBuf, PacketHeader, function_id,
};
pub use uid::{UidError, base58_to_u32};
