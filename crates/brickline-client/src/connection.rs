//! The user-facing connection handle.
//!
//! An [`IpConnection`] manages the communication between device proxies and
//! the Brick Daemon or a WIFI/Ethernet Extension. Creating one spawns the
//! connection task and the dispatcher task; the handle itself is a bundle of
//! channel senders plus a few atomics and is cheap to clone. Devices can only
//! be controlled once [`IpConnection::connect`] succeeded.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
    },
    time::Duration,
};

use brickline_proto::{
    EnumerateResponse, ErrorCode, PACKET_HEADER_SIZE, PacketBuf, PacketHeader, function_id,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::{
    dispatch::{DispatcherTask, PacketCallback, RegistryCommand},
    error::{AuthenticateError, ConnectError},
    request::{self, Request},
    socket::{CHANNEL_SIZE, CONNECT_REQUEST_CHANNEL_SIZE, ConnectRequest, ConnectionTask},
};

/// Default timeout for getters and for setters with the response-expected
/// flag set.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2500);

/// UID addressing the daemon itself, used by the authentication handshake.
const DAEMON_UID: u32 = 1;

/// State of the TCP connection, readable at any time with
/// [`IpConnection::get_connection_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ConnectionState {
    /// No connection is established.
    Disconnected = 0,
    /// The connection is established and devices can be controlled.
    Connected = 1,
    /// A connect or reconnect attempt is in progress.
    Pending = 2,
}

impl ConnectionState {
    fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Connected,
            2 => Self::Pending,
            _ => Self::Disconnected,
        }
    }
}

/// Why a connection was established; reported to connect callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReason {
    /// Connection established after a user request.
    Request = 0,
    /// Connection established by auto-reconnect.
    AutoReconnect = 1,
}

/// Why a connection ended; reported to disconnect callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    /// Disconnect was requested by the user.
    Request = 0,
    /// Disconnect because of an unresolvable error.
    Error = 1,
    /// Disconnect initiated by the daemon or the extension.
    Shutdown = 2,
}

/// Handle to the connection shared by all device proxies.
///
/// Created with [`IpConnection::new`], which spawns the two background tasks
/// onto the ambient Tokio runtime; the constructor must therefore run inside
/// one. All clones refer to the same connection.
#[derive(Clone)]
pub struct IpConnection {
    req_tx: mpsc::Sender<Request>,
    conn_req_tx: mpsc::Sender<ConnectRequest>,
    disconn_req_tx: mpsc::Sender<oneshot::Sender<()>>,
    socket_terminate_tx: mpsc::Sender<()>,
    dispatcher_terminate_tx: mpsc::Sender<()>,
    auto_reconnect_tx: mpsc::Sender<bool>,
    command_tx: mpsc::Sender<RegistryCommand>,
    timeout_nanos: Arc<AtomicI64>,
    connection_state: Arc<AtomicU32>,
    auto_reconnect_cache: Arc<AtomicBool>,
    authenticate_mutex: Arc<Mutex<()>>,
}

impl Default for IpConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl IpConnection {
    /// Create a connection object and spawn its background tasks.
    ///
    /// The object can immediately be used to construct device proxies and to
    /// register callbacks; requests fail until [`connect`](Self::connect)
    /// succeeded.
    pub fn new() -> Self {
        let (req_tx, req_rx) = mpsc::channel(CHANNEL_SIZE);
        let (conn_req_tx, conn_req_rx) = mpsc::channel(CONNECT_REQUEST_CHANNEL_SIZE);
        let (disconn_req_tx, disconn_req_rx) = mpsc::channel(CHANNEL_SIZE);
        let (socket_terminate_tx, socket_terminate_rx) = mpsc::channel(CHANNEL_SIZE);
        let (dispatcher_terminate_tx, dispatcher_terminate_rx) = mpsc::channel(CHANNEL_SIZE);
        let (auto_reconnect_tx, auto_reconnect_rx) = mpsc::channel(CHANNEL_SIZE);
        let (command_tx, command_rx) = mpsc::channel(CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_SIZE);
        let (callback_tx, callback_rx) = mpsc::channel(CHANNEL_SIZE);

        let timeout_nanos =
            Arc::new(AtomicI64::new(DEFAULT_REQUEST_TIMEOUT.as_nanos() as i64));
        let connection_state = Arc::new(AtomicU32::new(ConnectionState::Disconnected as u32));

        tokio::spawn(
            ConnectionTask {
                connection_state: Arc::clone(&connection_state),
                timeout_nanos: Arc::clone(&timeout_nanos),
                terminate_rx: socket_terminate_rx,
                auto_reconnect_rx,
                conn_req_tx: conn_req_tx.clone(),
                conn_req_rx,
                disconn_req_rx,
                req_rx,
                event_tx,
                callback_tx,
            }
            .run(),
        );
        tokio::spawn(
            DispatcherTask {
                terminate_rx: dispatcher_terminate_rx,
                event_rx,
                callback_rx,
                command_rx,
            }
            .run(),
        );

        Self {
            req_tx,
            conn_req_tx,
            disconn_req_tx,
            socket_terminate_tx,
            dispatcher_terminate_tx,
            auto_reconnect_tx,
            command_tx,
            timeout_nanos,
            connection_state,
            auto_reconnect_cache: Arc::new(AtomicBool::new(true)),
            authenticate_mutex: Arc::new(Mutex::new(())),
        }
    }

    /// Create a TCP connection to the daemon at `addr` (`host:port`).
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectError`] when the dial fails or times out, or when
    /// the connection object was already closed.
    pub async fn connect(&self, addr: &str) -> Result<(), ConnectError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.conn_req_tx
            .send(ConnectRequest {
                addr: addr.to_owned(),
                is_reconnect: false,
                done_tx: Some(done_tx),
            })
            .await
            .map_err(|_| ConnectError::Closed)?;
        done_rx.await.map_err(|_| ConnectError::Closed)?
    }

    /// Disconnect from the daemon.
    ///
    /// Completes once the connection task has closed the socket. Also turns
    /// off auto-reconnect until the next [`connect`](Self::connect) call.
    pub async fn disconnect(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.disconn_req_tx.send(ack_tx).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Stop the background tasks.
    ///
    /// After this the connection object and every device proxy holding it is
    /// defunct; requests fail with a closed error.
    pub async fn close(&self) {
        let _ = self.socket_terminate_tx.send(()).await;
        let _ = self.dispatcher_terminate_tx.send(()).await;
    }

    /// Broadcast an enumerate request. Every device answers with an
    /// enumerate callback.
    pub async fn enumerate(&self) {
        let header = PacketHeader::with_payload_len(0, function_id::ENUMERATE, 0, false);
        let _ = request::send_oneway(&self.req_tx, header.to_le_bytes().to_vec()).await;
    }

    /// Perform the authentication handshake with the daemon.
    ///
    /// Fetches the 4-byte server nonce, draws a random 4-byte client nonce
    /// and answers with `client_nonce || HMAC-SHA1(secret, server_nonce ||
    /// client_nonce)`. Concurrent handshakes on the same connection are
    /// serialized; they would collide on the daemon's sequence-number
    /// namespace.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthenticateError`] when either step goes unanswered
    /// (typically a wrong secret) or the daemon reports an error code.
    pub async fn authenticate(&self, secret: &str) -> Result<(), AuthenticateError> {
        let _guard = self.authenticate_mutex.lock().await;

        let header = PacketHeader::with_payload_len(
            DAEMON_UID,
            function_id::GET_AUTHENTICATION_NONCE,
            0,
            true,
        );
        let response = request::submit(&self.req_tx, header.to_le_bytes().to_vec())
            .await
            .map_err(AuthenticateError::Nonce)?;
        check_error_code(&response)?;
        let server_nonce = [
            response[PACKET_HEADER_SIZE],
            response[PACKET_HEADER_SIZE + 1],
            response[PACKET_HEADER_SIZE + 2],
            response[PACKET_HEADER_SIZE + 3],
        ];

        let mut client_nonce = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut client_nonce);

        let digest = authentication_mac(secret.as_bytes(), server_nonce, client_nonce);
        let mut packet = PacketHeader::with_payload_len(
            DAEMON_UID,
            function_id::AUTHENTICATE,
            (client_nonce.len() + digest.len()) as u8,
            true,
        )
        .to_le_bytes()
        .to_vec();
        packet.extend_from_slice(&client_nonce);
        packet.extend_from_slice(&digest);

        let response =
            request::submit(&self.req_tx, packet).await.map_err(AuthenticateError::Handshake)?;
        check_error_code(&response)?;
        Ok(())
    }

    /// Set the timeout for getters and for setters with the response-expected
    /// flag set. Takes effect for requests submitted from now on.
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_nanos.store(timeout.as_nanos() as i64, Ordering::SeqCst);
    }

    /// The timeout as set by [`set_timeout`](Self::set_timeout).
    pub fn get_timeout(&self) -> Duration {
        Duration::from_nanos(self.timeout_nanos.load(Ordering::SeqCst).max(0) as u64)
    }

    /// Enable or disable auto-reconnect.
    ///
    /// With auto-reconnect enabled the connection task redials the previous
    /// address whenever an established connection is lost, so it only does
    /// something after a successful [`connect`](Self::connect).
    pub async fn set_auto_reconnect(&self, enabled: bool) {
        let _ = self.auto_reconnect_tx.send(enabled).await;
        self.auto_reconnect_cache.store(enabled, Ordering::SeqCst);
    }

    /// Whether auto-reconnect is enabled.
    pub fn get_auto_reconnect(&self) -> bool {
        self.auto_reconnect_cache.load(Ordering::SeqCst)
    }

    /// The current connection state.
    pub fn get_connection_state(&self) -> ConnectionState {
        ConnectionState::from_u32(self.connection_state.load(Ordering::SeqCst))
    }

    /// Register a handler that runs whenever the connection to the daemon is
    /// established. Returns the registration ID used to deregister.
    pub async fn register_connect_callback<F>(&self, callback: F) -> u64
    where
        F: Fn(ConnectReason) + Send + Sync + 'static,
    {
        let (reg_id_tx, reg_id_rx) = oneshot::channel();
        let _ = self
            .command_tx
            .send(RegistryCommand::RegisterConnect { callback: Arc::new(callback), reg_id_tx })
            .await;
        reg_id_rx.await.unwrap_or(u64::MAX)
    }

    /// Register a handler that runs whenever the connection to the daemon is
    /// lost. Returns the registration ID used to deregister.
    pub async fn register_disconnect_callback<F>(&self, callback: F) -> u64
    where
        F: Fn(DisconnectReason) + Send + Sync + 'static,
    {
        let (reg_id_tx, reg_id_rx) = oneshot::channel();
        let _ = self
            .command_tx
            .send(RegistryCommand::RegisterDisconnect { callback: Arc::new(callback), reg_id_tx })
            .await;
        reg_id_rx.await.unwrap_or(u64::MAX)
    }

    /// Register a handler for enumerate callbacks. Returns the registration
    /// ID used to deregister.
    ///
    /// Malformed enumerate payloads are logged and dropped before they reach
    /// the handler.
    pub async fn register_enumerate_callback<F>(&self, callback: F) -> u64
    where
        F: Fn(EnumerateResponse) + Send + Sync + 'static,
    {
        let wrapper: PacketCallback = Arc::new(move |packet: PacketBuf| {
            match EnumerateResponse::from_le_bytes(&packet[PACKET_HEADER_SIZE..]) {
                Some(response) => callback(response),
                None => tracing::warn!("dropping malformed enumerate callback"),
            }
        });
        let (reg_id_tx, reg_id_rx) = oneshot::channel();
        let _ = self
            .command_tx
            .send(RegistryCommand::RegisterEnumerate { callback: wrapper, reg_id_tx })
            .await;
        reg_id_rx.await.unwrap_or(u64::MAX)
    }

    /// Deregister the connect callback with the given registration ID.
    pub async fn deregister_connect_callback(&self, reg_id: u64) {
        let _ = self.command_tx.send(RegistryCommand::DeregisterLifecycle { reg_id }).await;
    }

    /// Deregister the disconnect callback with the given registration ID.
    pub async fn deregister_disconnect_callback(&self, reg_id: u64) {
        let _ = self.command_tx.send(RegistryCommand::DeregisterLifecycle { reg_id }).await;
    }

    /// Deregister the enumerate callback with the given registration ID.
    pub async fn deregister_enumerate_callback(&self, reg_id: u64) {
        let _ = self.command_tx.send(RegistryCommand::DeregisterLifecycle { reg_id }).await;
    }

    pub(crate) fn req_tx(&self) -> &mpsc::Sender<Request> {
        &self.req_tx
    }

    pub(crate) fn command_tx(&self) -> &mpsc::Sender<RegistryCommand> {
        &self.command_tx
    }
}

/// Surface a non-success error code from a response header.
fn check_error_code(response: &PacketBuf) -> Result<(), AuthenticateError> {
    let header = PacketHeader::from_packet(response);
    ErrorCode::from_bits(header.error_code).check()?;
    Ok(())
}

/// The HMAC-SHA1 digest sent in the authenticate request.
fn authentication_mac(secret: &[u8], server_nonce: [u8; 4], client_nonce: [u8; 4]) -> [u8; 20] {
    let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(secret) else {
        unreachable!("HMAC accepts keys of any length");
    };
    mac.update(&server_nonce);
    mac.update(&client_nonce);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_mac_matches_reference_vector() {
        // HMAC-SHA1("key", 01 02 03 04 AA BB CC DD)
        let digest =
            authentication_mac(b"key", [0x01, 0x02, 0x03, 0x04], [0xAA, 0xBB, 0xCC, 0xDD]);

        let Ok(mut reference) = Hmac::<Sha1>::new_from_slice(b"key") else {
            unreachable!("HMAC accepts keys of any length");
        };
        reference.update(&[0x01, 0x02, 0x03, 0x04, 0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(digest, <[u8; 20]>::from(reference.finalize().into_bytes()));
    }

    #[test]
    fn connection_state_from_u32_maps_all_values() {
        assert_eq!(ConnectionState::from_u32(0), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::from_u32(1), ConnectionState::Connected);
        assert_eq!(ConnectionState::from_u32(2), ConnectionState::Pending);
    }
}
