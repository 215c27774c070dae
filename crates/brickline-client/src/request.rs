//! Request envelope and the synchronous request/response façade.
//!
//! Device proxies and the connection handle talk to the connection task
//! through [`Request`] values on a bounded channel. A request that expects a
//! reply carries two one-shot channels: one on which the connection task
//! reports the timeout in effect when it accepted the request, and one for
//! the reply packet itself.

use std::time::Duration;

use brickline_proto::PacketBuf;
use tokio::sync::{mpsc, oneshot};

use crate::error::RequestError;

/// One outbound packet handed to the connection task.
pub(crate) struct Request {
    /// Complete packet bytes; the sequence nibble is still zero and is
    /// stamped by the connection task.
    pub packet: Vec<u8>,

    /// Reports the request timeout in effect at send time. Receiving on this
    /// channel is the caller's guarantee that the connection task has
    /// accepted the request.
    pub timeout_tx: Option<oneshot::Sender<Duration>>,

    /// Receives the matching reply packet, if one is expected.
    pub response_tx: Option<oneshot::Sender<PacketBuf>>,
}

/// Submit a request and wait for its reply.
///
/// Blocks until the connection task has accepted the request and stamped it
/// with the current timeout, then races the reply against a timer started at
/// that point. A request submitted while disconnected is stamped with a zero
/// timeout and fails immediately.
///
/// A timed-out request leaves its slot in the connection task's reply table;
/// a reply that arrives later is silently dropped there.
pub(crate) async fn submit(
    req_tx: &mpsc::Sender<Request>,
    packet: Vec<u8>,
) -> Result<PacketBuf, RequestError> {
    let (timeout_tx, timeout_rx) = oneshot::channel();
    let (response_tx, response_rx) = oneshot::channel();

    req_tx
        .send(Request { packet, timeout_tx: Some(timeout_tx), response_tx: Some(response_tx) })
        .await
        .map_err(|_| RequestError::Closed)?;

    let timeout = timeout_rx.await.map_err(|_| RequestError::Closed)?;

    match tokio::time::timeout(timeout, response_rx).await {
        Ok(Ok(packet)) => Ok(packet),
        // The reply sender was dropped (session torn down) or the timer won.
        Ok(Err(_)) | Err(_) => Err(RequestError::Timeout),
    }
}

/// Enqueue a packet that expects no reply.
pub(crate) async fn send_oneway(
    req_tx: &mpsc::Sender<Request>,
    packet: Vec<u8>,
) -> Result<(), RequestError> {
    req_tx
        .send(Request { packet, timeout_tx: None, response_tx: None })
        .await
        .map_err(|_| RequestError::Closed)
}
