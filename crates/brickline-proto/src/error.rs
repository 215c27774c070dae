//! Device result codes.
//!
//! A response header carries a 2-bit error code in the top bits of byte 7.
//! Requests always send 0; anything non-zero in a response means the device
//! rejected the call.

use thiserror::Error;

/// Result code reported by a device in the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// The call succeeded.
    Success = 0,
    /// A parameter was out of range for the device.
    InvalidParameter = 1,
    /// The device does not implement the requested function.
    FunctionNotSupported = 2,
    /// Reserved, currently unused.
    Reserved = 3,
}

impl ErrorCode {
    /// Decode from the two error bits of header byte 7.
    ///
    /// Only the low two bits of `bits` are considered, so any header value
    /// maps to a code.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::Success,
            1 => Self::InvalidParameter,
            2 => Self::FunctionNotSupported,
            _ => Self::Reserved,
        }
    }

    /// Turn a non-success code into its error.
    pub fn check(self) -> Result<(), ResponseError> {
        match self {
            Self::Success => Ok(()),
            Self::InvalidParameter => Err(ResponseError::InvalidParameter),
            Self::FunctionNotSupported => Err(ResponseError::FunctionNotSupported),
            Self::Reserved => Err(ResponseError::Reserved),
        }
    }
}

/// A device answered with a non-success [`ErrorCode`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ResponseError {
    /// A parameter was out of range for the device.
    #[error("invalid parameter")]
    InvalidParameter,

    /// The device does not implement the requested function.
    #[error("function not supported")]
    FunctionNotSupported,

    /// Reserved, currently unused.
    #[error("currently unused error code")]
    Reserved,
}
