//! Client runtime for the Brick Daemon TCP/IP protocol.
//!
//! A Brick Daemon (or a WIFI/Ethernet Extension) fronts a stack of Brick and
//! Bricklet devices behind one TCP stream. This crate multiplexes many
//! device proxies over that single stream: synchronous request/response
//! calls, asynchronous device callbacks and connection lifecycle events all
//! share the socket.
//!
//! # Architecture
//!
//! Three kinds of long-lived tasks cooperate through bounded channels:
//!
//! - The **connection task** owns the socket's write half, the pending-reply
//!   table and the sequence counter. It dials, reconnects, probes idle
//!   connections and routes every inbound packet either to the waiting
//!   caller or to the dispatcher.
//! - One **frame reader task** per live connection owns the read half and
//!   slices the byte stream into packets.
//! - The **dispatcher task** owns the callback registries and fans out
//!   device callbacks, enumerate callbacks and lifecycle events; each device
//!   callback delivery runs on its own spawned task.
//!
//! The user-facing pieces are [`IpConnection`] (connect, disconnect,
//! enumerate, authenticate, lifecycle callbacks) and [`Device`], the base
//! that generated per-device proxy types build on.
//!
//! # Example
//!
//! ```no_run
//! use brickline_client::IpConnection;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let ipcon = IpConnection::new();
//! ipcon.connect("localhost:4223").await?;
//! ipcon
//!     .register_enumerate_callback(|device| {
//!         println!("{} at {}", device.uid, device.position);
//!     })
//!     .await;
//! ipcon.enumerate().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

mod connection;
mod device;
mod dispatch;
mod error;
mod reader;
mod request;
mod socket;
mod stream;

pub use brickline_proto::{
    ENUMERATE_PAYLOAD_SIZE, EnumerateResponse, EnumerationType, ErrorCode, MAX_PACKET_SIZE,
    MAX_PAYLOAD_SIZE, PACKET_HEADER_SIZE, PacketBuf, PacketHeader, ResponseError, UidError,
    base58_to_u32, function_id,
};
pub use connection::{
    ConnectReason, ConnectionState, DEFAULT_REQUEST_TIMEOUT, DisconnectReason, IpConnection,
};
pub use device::{Device, ResponseExpected};
pub use error::{AuthenticateError, ConnectError, DeviceError, RequestError};
pub use stream::{LowLevelRead, LowLevelWrite};
