//! Device proxy base.
//!
//! Generated per-device proxy types do not inherit from anything; they hold a
//! [`Device`] and dispatch through it. The base keeps the per-device state
//! the proxies share: the decoded UID, the response-expected table, the
//! per-high-level-function locks and the lazily verified device identity.
//!
//! Every user call funnels through [`Device::get`] or [`Device::set`]. The
//! first one triggers an identity check: a get-identity request whose reply
//! must carry the device identifier the proxy type expects. A proxy pointed
//! at the wrong UID fails every call from then on instead of silently
//! misdriving unrelated hardware.

use std::sync::atomic::{AtomicU8, AtomicU16, Ordering};

use brickline_proto::{
    ErrorCode, PACKET_HEADER_SIZE, PacketBuf, PacketHeader, base58_to_u32, function_id,
};
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::{
    connection::IpConnection,
    dispatch::{PacketCallback, RegistryCommand},
    error::DeviceError,
    request::{self, Request},
};

/// Offset of the device identifier within a get-identity reply packet:
/// header, UID string, connected-UID string, position, hardware version,
/// firmware version.
const IDENTITY_DEVICE_IDENTIFIER_OFFSET: usize = PACKET_HEADER_SIZE + 8 + 8 + 1 + 3 + 3;

/// Per-function response-expected configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ResponseExpected {
    /// The function ID is not part of this device's API.
    #[default]
    InvalidFunctionId = 0,
    /// Fire-and-forget: the device sends no reply.
    False = 1,
    /// The device replies; the flag may be turned off.
    True = 2,
    /// The device replies and the flag cannot be turned off (getters and
    /// setters whose errors must be observable).
    AlwaysTrue = 3,
}

const IDENTITY_UNCHECKED: u8 = 0;
const IDENTITY_MATCH: u8 = 1;
const IDENTITY_MISMATCH: u8 = 2;

/// Shared state of one device proxy.
pub struct Device {
    api_version: [u8; 3],
    response_expected: [ResponseExpected; 256],
    internal_uid: u32,
    uid_string: String,
    expected_device_identifier: u16,
    display_name: &'static str,
    req_tx: mpsc::Sender<Request>,
    command_tx: mpsc::Sender<RegistryCommand>,
    high_level_locks: Vec<Mutex<()>>,
    identity_state: AtomicU8,
    identity_mutex: Mutex<()>,
    reported_device_identifier: AtomicU16,
}

impl Device {
    /// Create the base state for a device proxy.
    ///
    /// `high_level_function_count` sizes the lock vector serializing
    /// high-level operations; `expected_device_identifier` and
    /// `display_name` describe the proxy type for the identity check.
    ///
    /// # Errors
    ///
    /// Fails when `uid` is not a valid base-58 UID.
    pub fn new(
        api_version: [u8; 3],
        uid: &str,
        ipcon: &IpConnection,
        high_level_function_count: usize,
        expected_device_identifier: u16,
        display_name: &'static str,
    ) -> Result<Self, DeviceError> {
        let internal_uid = base58_to_u32(uid)?;
        Ok(Self {
            api_version,
            response_expected: [ResponseExpected::InvalidFunctionId; 256],
            internal_uid,
            uid_string: uid.to_owned(),
            expected_device_identifier,
            display_name,
            req_tx: ipcon.req_tx().clone(),
            command_tx: ipcon.command_tx().clone(),
            high_level_locks: (0..high_level_function_count).map(|_| Mutex::new(())).collect(),
            identity_state: AtomicU8::new(IDENTITY_UNCHECKED),
            identity_mutex: Mutex::new(()),
            reported_device_identifier: AtomicU16::new(0),
        })
    }

    /// API version of the bindings for this device type.
    pub fn api_version(&self) -> [u8; 3] {
        self.api_version
    }

    /// Seed the response-expected table; called by proxy constructors for
    /// every function ID the device implements.
    pub fn set_response_expected_flag(&mut self, function_id: u8, flag: ResponseExpected) {
        self.response_expected[usize::from(function_id)] = flag;
    }

    /// Whether the device answers calls to `function_id`.
    ///
    /// # Errors
    ///
    /// Fails for function IDs outside this device's API.
    pub fn get_response_expected(&self, function_id: u8) -> Result<bool, DeviceError> {
        match self.response_expected[usize::from(function_id)] {
            ResponseExpected::AlwaysTrue | ResponseExpected::True => Ok(true),
            ResponseExpected::False => Ok(false),
            ResponseExpected::InvalidFunctionId => {
                Err(DeviceError::UnknownFunction(function_id))
            }
        }
    }

    /// Enable or disable replies for a setter function.
    ///
    /// Disabling replies halves the round-trips of a setter at the cost of
    /// losing its error reporting.
    ///
    /// # Errors
    ///
    /// Fails for function IDs outside this device's API and for functions
    /// whose flag is always true.
    pub fn set_response_expected(
        &mut self,
        function_id: u8,
        response_expected: bool,
    ) -> Result<(), DeviceError> {
        match self.response_expected[usize::from(function_id)] {
            ResponseExpected::AlwaysTrue => {
                Err(DeviceError::ResponseExpectedAlwaysTrue(function_id))
            }
            ResponseExpected::InvalidFunctionId => {
                Err(DeviceError::UnknownFunction(function_id))
            }
            ResponseExpected::True | ResponseExpected::False => {
                self.response_expected[usize::from(function_id)] = if response_expected {
                    ResponseExpected::True
                } else {
                    ResponseExpected::False
                };
                Ok(())
            }
        }
    }

    /// Apply [`set_response_expected`](Self::set_response_expected) to every
    /// configurable function of the device.
    pub fn set_response_expected_all(&mut self, response_expected: bool) {
        for flag in &mut self.response_expected {
            if matches!(flag, ResponseExpected::True | ResponseExpected::False) {
                *flag = if response_expected {
                    ResponseExpected::True
                } else {
                    ResponseExpected::False
                };
            }
        }
    }

    /// Call a getter: send the request and wait for the device's reply.
    ///
    /// # Errors
    ///
    /// Fails when the proxy sits on the wrong device, the request times out
    /// or the device reports an error code.
    pub async fn get(&self, function_id: u8, payload: &[u8]) -> Result<PacketBuf, DeviceError> {
        self.check_device_identifier().await?;
        self.get_unchecked(function_id, payload).await
    }

    /// Call a setter, honoring its response-expected flag.
    ///
    /// Returns the acknowledgement packet when a reply was requested, `None`
    /// for fire-and-forget.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get); a fire-and-forget call only fails when the
    /// connection object was closed.
    pub async fn set(
        &self,
        function_id: u8,
        payload: &[u8],
    ) -> Result<Option<PacketBuf>, DeviceError> {
        self.check_device_identifier().await?;

        if self.response_expected[usize::from(function_id)] != ResponseExpected::False {
            return Ok(Some(self.get_unchecked(function_id, payload).await?));
        }

        let packet = self.build_packet(function_id, payload, false);
        request::send_oneway(&self.req_tx, packet).await?;
        Ok(None)
    }

    /// Register a handler for callback packets of one function of this
    /// device. Returns the registration ID used to deregister.
    pub async fn register_callback<F>(&self, function_id: u8, callback: F) -> u64
    where
        F: Fn(PacketBuf) + Send + Sync + 'static,
    {
        let callback: PacketCallback = std::sync::Arc::new(callback);
        let (reg_id_tx, reg_id_rx) = oneshot::channel();
        let _ = self
            .command_tx
            .send(RegistryCommand::RegisterCallback {
                uid: self.internal_uid,
                function_id,
                callback,
                reg_id_tx,
            })
            .await;
        reg_id_rx.await.unwrap_or(u64::MAX)
    }

    /// Deregister the callback with the given registration ID.
    pub async fn deregister_callback(&self, function_id: u8, reg_id: u64) {
        let _ = self
            .command_tx
            .send(RegistryCommand::DeregisterCallback {
                uid: self.internal_uid,
                function_id,
                reg_id,
            })
            .await;
    }

    pub(crate) fn high_level_lock(&self, index: u8) -> Result<&Mutex<()>, DeviceError> {
        self.high_level_locks.get(usize::from(index)).ok_or(DeviceError::UnknownFunction(index))
    }

    async fn get_unchecked(
        &self,
        function_id: u8,
        payload: &[u8],
    ) -> Result<PacketBuf, DeviceError> {
        let packet = self.build_packet(function_id, payload, true);
        let response = request::submit(&self.req_tx, packet).await?;
        ErrorCode::from_bits(PacketHeader::from_packet(&response).error_code).check()?;
        Ok(response)
    }

    fn build_packet(&self, function_id: u8, payload: &[u8], response_expected: bool) -> Vec<u8> {
        let header = PacketHeader::with_payload_len(
            self.internal_uid,
            function_id,
            payload.len() as u8,
            response_expected,
        );
        let mut packet = header.to_le_bytes().to_vec();
        packet.extend_from_slice(payload);
        packet
    }

    /// Verify once that the device at this UID is of the expected type.
    ///
    /// The result is cached: after a match the check is a single atomic load,
    /// after a mismatch every call keeps failing with the cached identity.
    async fn check_device_identifier(&self) -> Result<(), DeviceError> {
        match self.identity_state.load(Ordering::Acquire) {
            IDENTITY_MATCH => return Ok(()),
            IDENTITY_MISMATCH => return Err(self.wrong_device_error()),
            _ => {}
        }

        let _guard = self.identity_mutex.lock().await;
        // Another task may have completed the probe while we waited.
        match self.identity_state.load(Ordering::Acquire) {
            IDENTITY_MATCH => return Ok(()),
            IDENTITY_MISMATCH => return Err(self.wrong_device_error()),
            _ => {}
        }

        let response = self.get_unchecked(function_id::GET_IDENTITY, &[]).await?;
        let reported = u16::from_le_bytes([
            response[IDENTITY_DEVICE_IDENTIFIER_OFFSET],
            response[IDENTITY_DEVICE_IDENTIFIER_OFFSET + 1],
        ]);

        if reported == self.expected_device_identifier {
            self.identity_state.store(IDENTITY_MATCH, Ordering::Release);
            Ok(())
        } else {
            self.reported_device_identifier.store(reported, Ordering::Release);
            self.identity_state.store(IDENTITY_MISMATCH, Ordering::Release);
            Err(self.wrong_device_error())
        }
    }

    fn wrong_device_error(&self) -> DeviceError {
        DeviceError::WrongDevice {
            uid: self.uid_string.clone(),
            reported: self.reported_device_identifier.load(Ordering::Acquire),
            expected: self.display_name,
        }
    }
}
