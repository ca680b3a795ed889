//! Server-side wire mechanics for the PSK handshake responder. Mirrors `grainrpc_client::handshake`'s client half.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use grainrpc_common::directory::DirectoryClient;
use grainrpc_common::error::SecurityError;
use grainrpc_common::security::{
	derive_session_keys, random_challenge, verify_response, Psk, SecuritySession, ACK_PAYLOAD, FRAME_CHALLENGE, FRAME_ENCRYPTED, FRAME_HELLO,
	FRAME_RESPONSE,
};
use grainrpc_common::transport::{ConnectionId, DeliveryClass, Event, UdpTransport};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::ServerHandshakeError;

async fn expect_frame(
	events: &mut mpsc::UnboundedReceiver<Event>,
	conn_id: ConnectionId,
	want: u8,
	deadline: Instant,
) -> Result<Bytes, SecurityError> {
	loop {
		let remaining = deadline.saturating_duration_since(Instant::now());
		if remaining.is_zero() {
			return Err(SecurityError::HandshakeTimeout);
		}
		let event = match tokio::time::timeout(remaining, events.recv()).await {
			Ok(Some(event)) => event,
			Ok(None) | Err(_) => return Err(SecurityError::HandshakeTimeout),
		};
		match event {
			Event::DataReceived(id, bytes) if id == conn_id && bytes.first() == Some(&want) => return Ok(bytes.slice(1..)),
			Event::DataReceived(id, bytes) if id == conn_id => {
				debug!(got = bytes.first(), expected = want, "unexpected frame type during handshake, ignoring");
			}
			Event::PeerClosed(id, reason) if id == conn_id => {
				debug!(reason, "peer closed during handshake");
				return Err(SecurityError::HandshakeTimeout);
			}
			_ => {}
		}
	}
}

/// Runs the server side of the PSK handshake: parse HELLO, validate the presented
/// key against the directory, CHALLENGE, verify RESPONSE, derive keys and send an
/// encrypted ACK sealed under them. Returns the live `SecuritySession` and the
/// player id HELLO carried.
pub async fn run_server_handshake(
	transport: &UdpTransport,
	conn_id: ConnectionId,
	events: &mut mpsc::UnboundedReceiver<Event>,
	directory: &Arc<dyn DirectoryClient>,
	timeout: Duration,
) -> Result<(SecuritySession, Uuid), ServerHandshakeError> {
	let deadline = Instant::now() + timeout;

	let hello = expect_frame(events, conn_id, FRAME_HELLO, deadline).await?;
	if hello.len() != 16 + 32 {
		return Err(ServerHandshakeError::MalformedHello(format!("expected 48 bytes, got {}", hello.len())));
	}
	let player_id = Uuid::from_slice(&hello[0..16]).map_err(|err| ServerHandshakeError::MalformedHello(err.to_string()))?;
	let psk_bytes: [u8; 32] = hello[16..48].try_into().expect("checked length above");
	let psk = Psk(psk_bytes);

	let provided_key_b64 = base64::engine::general_purpose::STANDARD.encode(psk_bytes);
	let validation = directory.validate_session(player_id, &provided_key_b64).await?;
	if !validation.ok {
		return Err(ServerHandshakeError::Security(SecurityError::SessionRejected));
	}

	let challenge = random_challenge();
	let mut challenge_frame = Vec::with_capacity(1 + challenge.len());
	challenge_frame.push(FRAME_CHALLENGE);
	challenge_frame.extend_from_slice(&challenge);
	transport.send(conn_id, DeliveryClass::ReliableOrdered, Bytes::from(challenge_frame)).await?;

	let response = expect_frame(events, conn_id, FRAME_RESPONSE, deadline).await?;
	if !verify_response(&psk, &challenge, &response) {
		return Err(ServerHandshakeError::Security(SecurityError::HmacMismatch));
	}

	let keys = derive_session_keys(&psk, &challenge);
	let mut session = SecuritySession::from_keys(&keys, false);

	let (seq, ciphertext) = session.outbound.seal(ACK_PAYLOAD).map_err(ServerHandshakeError::Security)?;
	let mut ack_frame = Vec::with_capacity(9 + ciphertext.len());
	ack_frame.push(FRAME_ENCRYPTED);
	ack_frame.extend_from_slice(&seq.to_be_bytes());
	ack_frame.extend_from_slice(&ciphertext);
	transport.send(conn_id, DeliveryClass::ReliableOrdered, Bytes::from(ack_frame)).await?;

	Ok((session, player_id))
}
