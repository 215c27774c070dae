//! Integration tests for the authentication handshake.
//!
//! The mock daemon implements the two handshake functions on UID 1: it hands
//! out a fixed server nonce and verifies the submitted HMAC-SHA1 digest the
//! same way brickd does.

use std::time::Duration;

use brickline_client::{
    AuthenticateError, IpConnection, PACKET_HEADER_SIZE, PacketHeader, ResponseError,
    function_id,
};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

const SERVER_NONCE: [u8; 4] = [0x01, 0x02, 0x03, 0x04];

async fn bind_daemon() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

async fn read_packet(stream: &mut TcpStream) -> Option<(PacketHeader, Vec<u8>)> {
    let mut head = [0u8; PACKET_HEADER_SIZE];
    stream.read_exact(&mut head).await.ok()?;
    let header = PacketHeader::from_le_bytes(&head);
    let mut payload = vec![0u8; usize::from(header.length) - PACKET_HEADER_SIZE];
    stream.read_exact(&mut payload).await.ok()?;
    Some((header, payload))
}

fn reply_bytes(request: &PacketHeader, payload: &[u8], error_code: u8) -> Vec<u8> {
    let mut header = PacketHeader::with_payload_len(
        request.uid,
        request.function_id,
        payload.len() as u8,
        false,
    );
    header.sequence_number = request.sequence_number;
    header.error_code = error_code;
    let mut packet = header.to_le_bytes().to_vec();
    packet.extend_from_slice(payload);
    packet
}

fn expected_digest(secret: &[u8], client_nonce: &[u8]) -> [u8; 20] {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret).unwrap();
    mac.update(&SERVER_NONCE);
    mac.update(client_nonce);
    mac.finalize().into_bytes().into()
}

/// Daemon enforcing the handshake with `secret`. Like brickd it silently
/// ignores authenticate requests whose digest does not verify. Reports every
/// verification result.
fn spawn_auth_daemon(listener: TcpListener, secret: &'static str) -> mpsc::UnboundedReceiver<bool> {
    let (verified_tx, verified_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        while let Some((header, payload)) = read_packet(&mut stream).await {
            match (header.uid, header.function_id) {
                (1, function_id::GET_AUTHENTICATION_NONCE) => {
                    stream.write_all(&reply_bytes(&header, &SERVER_NONCE, 0)).await.unwrap();
                }
                (1, function_id::AUTHENTICATE) => {
                    assert_eq!(payload.len(), 24, "nonce plus HMAC-SHA1 digest expected");
                    let (client_nonce, digest) = payload.split_at(4);
                    let ok = digest == expected_digest(secret.as_bytes(), client_nonce);
                    let _ = verified_tx.send(ok);
                    if ok {
                        stream.write_all(&reply_bytes(&header, &[], 0)).await.unwrap();
                    }
                }
                _ => {}
            }
        }
    });
    verified_rx
}

#[tokio::test]
async fn handshake_with_the_right_secret_succeeds() {
    let (listener, addr) = bind_daemon().await;
    let mut verified = spawn_auth_daemon(listener, "key");

    let ipcon = IpConnection::new();
    ipcon.connect(&addr).await.unwrap();

    ipcon.authenticate("key").await.unwrap();
    assert_eq!(verified.recv().await, Some(true));

    ipcon.close().await;
}

#[tokio::test]
async fn handshake_with_the_wrong_secret_times_out() {
    let (listener, addr) = bind_daemon().await;
    let mut verified = spawn_auth_daemon(listener, "key");

    let ipcon = IpConnection::new();
    ipcon.connect(&addr).await.unwrap();
    ipcon.set_timeout(Duration::from_millis(100));

    let result = ipcon.authenticate("not the key").await;
    match result {
        Err(err @ AuthenticateError::Handshake(_)) => {
            let message = err.to_string();
            assert!(message.contains("maybe the secret is wrong"), "message: {message}");
        }
        other => panic!("expected a handshake timeout, got {other:?}"),
    }
    assert_eq!(verified.recv().await, Some(false));

    ipcon.close().await;
}

#[tokio::test]
async fn nonce_request_error_code_aborts_the_handshake() {
    let (listener, addr) = bind_daemon().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        while let Some((header, _)) = read_packet(&mut stream).await {
            if header.uid == 1 && header.function_id == function_id::GET_AUTHENTICATION_NONCE {
                stream.write_all(&reply_bytes(&header, &[0; 4], 1)).await.unwrap();
            }
        }
    });

    let ipcon = IpConnection::new();
    ipcon.connect(&addr).await.unwrap();

    let result = ipcon.authenticate("key").await;
    assert!(matches!(
        result,
        Err(AuthenticateError::Response(ResponseError::InvalidParameter))
    ));

    ipcon.close().await;
}

#[tokio::test]
async fn unconnected_handshake_reports_the_nonce_step() {
    let ipcon = IpConnection::new();

    let result = ipcon.authenticate("key").await;
    assert!(matches!(result, Err(AuthenticateError::Nonce(_))));

    ipcon.close().await;
}
