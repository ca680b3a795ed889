//! Client-side wire mechanics for bringing a transport connection to `Live`.

use std::time::Duration;

use bytes::Bytes;
use grainrpc_common::error::{ConnectError, SecurityError};
use grainrpc_common::security::{
	compute_response, derive_session_keys, Psk, SecuritySession, ACK_PAYLOAD, FRAME_CHALLENGE, FRAME_ENCRYPTED, FRAME_HELLO, FRAME_RESPONSE,
};
use grainrpc_common::transport::{ConnectionId, DeliveryClass, Event, UdpTransport};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

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

/// Runs the client side of the PSK handshake: Start → AwaitChallenge → Computing →
/// AwaitAck → Live. The ACK is an ordinary `FRAME_ENCRYPTED` frame sealed under the
/// just-derived keys; the client only reaches Live once it decrypts that frame and
/// finds the expected marker inside, proving the server derived matching keys.
/// Returns the live `SecuritySession`.
///
/// The server has no independent channel to learn which PSK a connecting socket
/// should use, so HELLO carries `playerId` (16 bytes) followed by the raw session
/// key (32 bytes) the directory minted at registration; the server confirms it
/// against the directory's `/session/validate` endpoint before using it for the rest of the exchange.
pub async fn run_client_handshake(
	transport: &UdpTransport,
	conn_id: ConnectionId,
	events: &mut mpsc::UnboundedReceiver<Event>,
	player_id: Uuid,
	psk: &Psk,
	timeout: Duration,
) -> Result<SecuritySession, ConnectError> {
	let deadline = Instant::now() + timeout;

	let mut hello = Vec::with_capacity(1 + 16 + 32);
	hello.push(FRAME_HELLO);
	hello.extend_from_slice(player_id.as_bytes());
	hello.extend_from_slice(&psk.0);
	transport.send(conn_id, DeliveryClass::ReliableOrdered, Bytes::from(hello)).await?;

	let challenge_bytes = expect_frame(events, conn_id, FRAME_CHALLENGE, deadline).await.map_err(ConnectError::SecurityFailed)?;
	let challenge: [u8; 16] = challenge_bytes
		.as_ref()
		.try_into()
		.map_err(|_| ConnectError::SecurityFailed(SecurityError::Malformed("challenge was not 16 bytes".into())))?;

	let keys = derive_session_keys(psk, &challenge);
	let response = compute_response(psk, &challenge);
	let mut body = Vec::with_capacity(1 + response.len());
	body.push(FRAME_RESPONSE);
	body.extend_from_slice(&response);
	transport.send(conn_id, DeliveryClass::ReliableOrdered, Bytes::from(body)).await?;

	let security = SecuritySession::from_keys(&keys, true);

	let ack_bytes = expect_frame(events, conn_id, FRAME_ENCRYPTED, deadline).await.map_err(ConnectError::SecurityFailed)?;
	if ack_bytes.len() < 8 {
		return Err(ConnectError::SecurityFailed(SecurityError::Malformed("ACK frame shorter than the sequence prefix".into())));
	}
	let seq = u64::from_be_bytes(ack_bytes[0..8].try_into().expect("checked length above"));
	let plaintext = security.inbound.open(seq, &ack_bytes[8..]).map_err(ConnectError::SecurityFailed)?;
	if plaintext != ACK_PAYLOAD {
		return Err(ConnectError::SecurityFailed(SecurityError::Malformed("ACK payload did not match after decryption".into())));
	}

	Ok(security)
}
