//! Frame reader task.
//!
//! Sole reader of the socket. Pulls bytes into a staging buffer and slices
//! them into complete packets: 8 bytes of header first, then however many
//! payload bytes the header's length field announces. Completed packets are
//! forwarded to the connection task as fixed 80-byte buffers with unused
//! trailing bytes zeroed.
//!
//! A read of zero bytes means the peer closed the connection in an orderly
//! fashion; that is reported as a shutdown, everything else as an error.

use brickline_proto::{MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketBuf, PacketHeader};
use bytes::BytesMut;
use tokio::{io::AsyncReadExt, net::tcp::OwnedReadHalf, sync::mpsc};

/// Staging buffer capacity, sized for roughly 100 maximum packets.
const READ_BUFFER_SIZE: usize = MAX_PACKET_SIZE * 100;

/// Read packets off the socket until it closes or the session is torn down.
///
/// `socket_closed_tx` receives exactly one message when the task ends on its
/// own: `true` for an orderly peer shutdown, `false` for a read or framing
/// error. Nothing is sent when the packet channel is dropped underneath us,
/// which is how the connection task tears the reader down.
pub(crate) async fn read_packets(
    mut stream: OwnedReadHalf,
    socket_closed_tx: mpsc::Sender<bool>,
    packet_tx: mpsc::Sender<PacketBuf>,
) {
    let mut staging = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        match stream.read_buf(&mut staging).await {
            Ok(0) => {
                let _ = socket_closed_tx.send(true).await;
                return;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(%err, "socket read failed");
                let _ = socket_closed_tx.send(false).await;
                return;
            }
        }

        while staging.len() >= PACKET_HEADER_SIZE {
            let header = PacketHeader::from_le_bytes(&[
                staging[0], staging[1], staging[2], staging[3], staging[4], staging[5],
                staging[6], staging[7],
            ]);
            let length = usize::from(header.length);

            if !(PACKET_HEADER_SIZE..=MAX_PACKET_SIZE).contains(&length) {
                tracing::warn!(length, "peer sent a packet with an impossible length");
                let _ = socket_closed_tx.send(false).await;
                return;
            }
            if staging.len() < length {
                break;
            }

            let mut packet: PacketBuf = [0; MAX_PACKET_SIZE];
            packet[..length].copy_from_slice(&staging.split_to(length));
            if packet_tx.send(packet).await.is_err() {
                return;
            }
        }

        // Read only when at least one maximum packet fits. reserve reclaims
        // the space split_to released before it ever grows the allocation.
        if staging.capacity() - staging.len() < MAX_PACKET_SIZE {
            staging.reserve(MAX_PACKET_SIZE);
        }
    }
}
