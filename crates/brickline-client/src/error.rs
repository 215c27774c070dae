//! Error types for the client runtime.
//!
//! Strongly-typed errors per layer: connecting the socket, waiting for a
//! reply, talking to a device, and the authentication handshake. Errors that
//! break the whole session are not returned here; they surface through the
//! disconnect lifecycle callback with reason `Error`.

use std::io;

use brickline_proto::{ResponseError, UidError};
use thiserror::Error;

/// Errors establishing the TCP connection to the daemon.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The TCP dial did not complete within the connect timeout.
    #[error("connect timed out")]
    Timeout,

    /// The TCP dial failed.
    #[error("connection failed: {0}")]
    Io(#[from] io::Error),

    /// The connection object was closed with `close()`.
    #[error("connection is closed")]
    Closed,
}

/// Errors waiting for the reply to a single request.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    /// No response arrived within the timeout in effect when the request was
    /// submitted. Also reported when the request was submitted while
    /// disconnected.
    #[error("request timed out")]
    Timeout,

    /// The connection object was closed with `close()`.
    #[error("connection is closed")]
    Closed,
}

/// Errors reported by device proxy operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The UID string passed to the proxy constructor did not decode.
    #[error(transparent)]
    Uid(#[from] UidError),

    /// The function ID is not known to this device type.
    #[error("unknown function with ID {0}")]
    UnknownFunction(u8),

    /// The response-expected flag of this function cannot be disabled.
    #[error("response expected for function with ID {0} is always true")]
    ResponseExpectedAlwaysTrue(u8),

    /// The device at the proxy's UID reported a different device identifier
    /// than the proxy type expects.
    #[error(
        "UID {uid} belongs to a device with identifier {reported} instead of the expected {expected}"
    )]
    WrongDevice {
        /// UID the proxy was constructed with.
        uid: String,
        /// Device identifier the device actually reported.
        reported: u16,
        /// Display name of the expected device type.
        expected: &'static str,
    },

    /// A high-level read lost its position in the chunk stream.
    #[error("stream is out of sync, please retry")]
    OutOfSync,

    /// The request was not answered.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// The device answered with a non-success error code.
    #[error(transparent)]
    Response(#[from] ResponseError),
}

/// Errors from the authentication handshake.
#[derive(Debug, Error)]
pub enum AuthenticateError {
    /// The server nonce request went unanswered.
    #[error("could not get server nonce: {0}")]
    Nonce(#[source] RequestError),

    /// The authenticate request went unanswered, usually because the daemon
    /// silently drops handshakes with a bad digest.
    #[error("received no response before timeout, maybe the secret is wrong: {0}")]
    Handshake(#[source] RequestError),

    /// The daemon rejected the handshake outright.
    #[error("daemon rejected the handshake: {0}")]
    Response(#[from] ResponseError),
}
