//! Connection task.
//!
//! Sole owner of the socket's write half, the pending-reply table and the
//! sequence counter. The task lives for the lifetime of the
//! [`IpConnection`](crate::IpConnection) and drives a two-level state
//! machine:
//!
//! - The outer loop waits for a connect request (from the user, or an
//!   internal reconnect) and dials the daemon.
//! - The inner loop multiplexes over the request channel, the frame reader's
//!   packet channel, disconnect/terminate/toggle signals and a 5-second idle
//!   timer that sends disconnect probes to keep NAT state alive and detect
//!   dead links.
//!
//! Inbound packets with a zero sequence number are callbacks and go to the
//! dispatcher; everything else is matched FIFO against the pending-reply
//! table keyed by `(uid, function ID, sequence number)`.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU32, Ordering},
    },
    time::Duration,
};

use brickline_proto::{PACKET_HEADER_SIZE, PacketBuf, PacketHeader, function_id};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::timeout,
};

use crate::{
    connection::{ConnectReason, ConnectionState, DisconnectReason},
    error::ConnectError,
    reader,
    request::Request,
};

/// Capacity of the bulk channels between the user-facing handle, the
/// connection task and the dispatcher.
pub(crate) const CHANNEL_SIZE: usize = 1 << 16;

/// Capacity of the connect-request channel.
///
/// Don't shrink this below the expected count of concurrent connect
/// attempts: the connection task puts reconnect requests into the same
/// channel it reads from, so it would deadlock itself if the buffer were
/// full.
pub(crate) const CONNECT_REQUEST_CHANNEL_SIZE: usize = 1 << 16;

/// TCP dial timeout.
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle time after which a disconnect probe goes out.
const DISCONNECT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Byte of the packet header holding the sequence nibble.
const PACKET_SEQ_NUM_OFFSET: usize = 6;

/// A user or internal request to establish the TCP connection.
pub(crate) struct ConnectRequest {
    /// `host:port` of the daemon.
    pub addr: String,
    /// Whether this request was enqueued internally after a lost connection.
    pub is_reconnect: bool,
    /// Reports the dial result to a waiting caller.
    pub done_tx: Option<oneshot::Sender<Result<(), ConnectError>>>,
}

/// Connection lifecycle notification, fanned out by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LifecycleEvent {
    /// The TCP connection was established.
    Connected(ConnectReason),
    /// The TCP connection ended.
    Disconnected(DisconnectReason),
}

/// Key of the pending-reply table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ResponseKey {
    uid: u32,
    function_id: u8,
    sequence_number: u8,
}

impl ResponseKey {
    fn of(header: &PacketHeader) -> Self {
        Self {
            uid: header.uid,
            function_id: header.function_id,
            sequence_number: header.sequence_number,
        }
    }
}

/// State owned by the connection task; see the module docs.
pub(crate) struct ConnectionTask {
    pub connection_state: Arc<AtomicU32>,
    pub timeout_nanos: Arc<AtomicI64>,
    pub terminate_rx: mpsc::Receiver<()>,
    pub auto_reconnect_rx: mpsc::Receiver<bool>,
    pub conn_req_tx: mpsc::Sender<ConnectRequest>,
    pub conn_req_rx: mpsc::Receiver<ConnectRequest>,
    pub disconn_req_rx: mpsc::Receiver<oneshot::Sender<()>>,
    pub req_rx: mpsc::Receiver<Request>,
    pub event_tx: mpsc::Sender<LifecycleEvent>,
    pub callback_tx: mpsc::Sender<PacketBuf>,
}

impl ConnectionTask {
    /// Drive the connection state machine until terminated.
    pub(crate) async fn run(mut self) {
        let mut auto_reconnect_allowed = true;
        let mut auto_reconnect_enabled = true;

        'task: loop {
            self.set_state(ConnectionState::Disconnected);

            // Fresh session: reply table and sequence counter start over.
            let mut seq_num: u8 = 1;
            let mut response_queues: HashMap<ResponseKey, VecDeque<oneshot::Sender<PacketBuf>>> =
                HashMap::new();
            let disconnect_reason;

            let connect_request = loop {
                tokio::select! {
                    _ = self.terminate_rx.recv() => break 'task,
                    Some(enabled) = self.auto_reconnect_rx.recv() => {
                        auto_reconnect_enabled = enabled;
                    }
                    Some(request) = self.conn_req_rx.recv() => {
                        if request.is_reconnect
                            && (!auto_reconnect_allowed || !auto_reconnect_enabled)
                        {
                            continue;
                        }
                        break request;
                    }
                    Some(ack_tx) = self.disconn_req_rx.recv() => {
                        auto_reconnect_allowed = false;
                        let _ = ack_tx.send(());
                    }
                    Some(request) = self.req_rx.recv() => {
                        // Not connected: stamp a zero timeout so the caller
                        // fails immediately.
                        if let Some(timeout_tx) = request.timeout_tx {
                            let _ = timeout_tx.send(Duration::ZERO);
                        }
                    }
                }
            };

            // A user connect lifts the ban a previous disconnect imposed on
            // auto-reconnects.
            if !connect_request.is_reconnect {
                auto_reconnect_allowed = true;
            }
            let is_auto_reconnect = connect_request.is_reconnect;
            let addr = connect_request.addr;

            self.set_state(ConnectionState::Pending);

            let stream = match dial(&addr).await {
                Ok(stream) => stream,
                Err(err) => {
                    if is_auto_reconnect {
                        tracing::debug!(%addr, %err, "reconnect attempt failed");
                    }
                    if let Some(done_tx) = connect_request.done_tx {
                        let _ = done_tx.send(Err(err));
                    }
                    let _ = self
                        .conn_req_tx
                        .send(ConnectRequest { addr, is_reconnect: true, done_tx: None })
                        .await;
                    continue 'task;
                }
            };

            let (read_half, mut write_half) = stream.into_split();
            let (socket_closed_tx, mut socket_closed_rx) = mpsc::channel(1);
            let (packet_tx, mut packet_rx) = mpsc::channel(1);
            let reader_handle =
                tokio::spawn(reader::read_packets(read_half, socket_closed_tx, packet_tx));

            if let Some(done_tx) = connect_request.done_tx {
                let _ = done_tx.send(Ok(()));
            }
            self.set_state(ConnectionState::Connected);
            let reason = if is_auto_reconnect {
                ConnectReason::AutoReconnect
            } else {
                ConnectReason::Request
            };
            let _ = self.event_tx.send(LifecycleEvent::Connected(reason)).await;
            tracing::debug!(%addr, ?reason, "connected");

            'connection: loop {
                tokio::select! {
                    _ = self.terminate_rx.recv() => {
                        reader_handle.abort();
                        break 'task;
                    }
                    Some(enabled) = self.auto_reconnect_rx.recv() => {
                        auto_reconnect_enabled = enabled;
                    }
                    Some(ack_tx) = self.disconn_req_rx.recv() => {
                        reader_handle.abort();
                        disconnect_reason = DisconnectReason::Request;
                        let _ = ack_tx.send(());
                        break 'connection;
                    }
                    Some(was_shutdown) = socket_closed_rx.recv() => {
                        if auto_reconnect_enabled {
                            let _ = self
                                .conn_req_tx
                                .send(ConnectRequest {
                                    addr: addr.clone(),
                                    is_reconnect: true,
                                    done_tx: None,
                                })
                                .await;
                        }
                        disconnect_reason = if was_shutdown {
                            DisconnectReason::Shutdown
                        } else {
                            DisconnectReason::Error
                        };
                        break 'connection;
                    }
                    () = tokio::time::sleep(DISCONNECT_PROBE_INTERVAL) => {
                        let probe = PacketHeader {
                            uid: 0,
                            length: PACKET_HEADER_SIZE as u8,
                            function_id: function_id::DISCONNECT_PROBE,
                            sequence_number: 1,
                            response_expected: false,
                            error_code: 0,
                        };
                        // A failed probe shows up as a reader error moments
                        // later, so the result is not inspected here.
                        let _ = timeout(
                            self.request_timeout(),
                            write_half.write_all(&probe.to_le_bytes()),
                        )
                        .await;
                    }
                    Some(mut request) = self.req_rx.recv() => {
                        if let Some(byte) = request.packet.get_mut(PACKET_SEQ_NUM_OFFSET) {
                            *byte |= seq_num << 4;
                        }
                        seq_num = if seq_num >= 15 { 1 } else { seq_num + 1 };

                        let mut reply_key = None;
                        if let Some(response_tx) = request.response_tx.take()
                            && let Some(head) = request.packet.first_chunk::<PACKET_HEADER_SIZE>()
                        {
                            let key = ResponseKey::of(&PacketHeader::from_le_bytes(head));
                            response_queues.entry(key).or_default().push_back(response_tx);
                            reply_key = Some(key);
                        }

                        let request_timeout = self.request_timeout();
                        if let Some(timeout_tx) = request.timeout_tx.take() {
                            let _ = timeout_tx.send(request_timeout);
                        }

                        match timeout(request_timeout, write_half.write_all(&request.packet))
                            .await
                        {
                            Ok(Ok(())) => {}
                            Err(_) => {
                                // Write deadline passed; the caller times out
                                // on its own, so only the fresh reply slot is
                                // taken back.
                                if let Some(key) = reply_key
                                    && let Some(queue) = response_queues.get_mut(&key)
                                {
                                    queue.pop_back();
                                }
                            }
                            Ok(Err(err)) => {
                                tracing::debug!(%err, "socket write failed");
                                reader_handle.abort();
                                if auto_reconnect_enabled {
                                    let _ = self
                                        .conn_req_tx
                                        .send(ConnectRequest {
                                            addr: addr.clone(),
                                            is_reconnect: true,
                                            done_tx: None,
                                        })
                                        .await;
                                }
                                disconnect_reason = DisconnectReason::Error;
                                break 'connection;
                            }
                        }
                    }
                    Some(packet) = packet_rx.recv() => {
                        let header = PacketHeader::from_packet(&packet);
                        if header.sequence_number == 0 {
                            let _ = self.callback_tx.send(packet).await;
                        } else {
                            match response_queues
                                .get_mut(&ResponseKey::of(&header))
                                .and_then(VecDeque::pop_front)
                            {
                                Some(response_tx) => {
                                    // An orphaned receiver (timed-out caller)
                                    // makes this send fail; that is fine.
                                    let _ = response_tx.send(packet);
                                }
                                None => tracing::trace!(
                                    uid = header.uid,
                                    function_id = header.function_id,
                                    sequence_number = header.sequence_number,
                                    "dropping reply nobody waits for"
                                ),
                            }
                        }
                    }
                }
            }

            let _ = self.event_tx.send(LifecycleEvent::Disconnected(disconnect_reason)).await;
            tracing::debug!(reason = ?disconnect_reason, "disconnected");
        }

        self.set_state(ConnectionState::Disconnected);
        let _ = self
            .event_tx
            .send(LifecycleEvent::Disconnected(DisconnectReason::Request))
            .await;
    }

    fn set_state(&self, state: ConnectionState) {
        self.connection_state.store(state as u32, Ordering::SeqCst);
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_nanos(self.timeout_nanos.load(Ordering::SeqCst).max(0) as u64)
    }
}

/// Dial the daemon with the fixed TCP connect timeout and `TCP_NODELAY` set.
async fn dial(addr: &str) -> Result<TcpStream, ConnectError> {
    let stream = timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| ConnectError::Timeout)??;
    stream.set_nodelay(true)?;
    Ok(stream)
}
