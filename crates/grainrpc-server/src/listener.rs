//! Binds the RPC listening socket and fans the transport's single event stream out
//! into one task per connected player.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use grainrpc_common::config::{RpcConfig, SecurityMode};
use grainrpc_common::directory::DirectoryClient;
use grainrpc_common::error::ProtocolError;
use grainrpc_common::rpc::Frame;
use grainrpc_common::security::{derive_session_keys, Psk, SecuritySession, FRAME_ENCRYPTED, FRAME_PLAINTEXT};
use grainrpc_common::transport::{ConnectionId, DeliveryClass, Event, TransportError, UdpTransport};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::grain::GameGrain;
use crate::handshake::run_server_handshake;
use crate::session::{FrameSender, ServerSession};

/// Binds `bind_addr` and runs the dispatcher loop until the process is torn down.
pub async fn run(bind_addr: SocketAddr, directory: Arc<dyn DirectoryClient>, grain: Arc<GameGrain>, config: Arc<RpcConfig>) -> Result<SocketAddr, TransportError> {
	let (transport, mut events) = UdpTransport::new();
	let local_addr = transport.bind(bind_addr).await?;
	info!(addr = %local_addr, "listening for players");

	let conns: Arc<DashMap<ConnectionId, mpsc::UnboundedSender<Event>>> = Arc::new(DashMap::new());

	tokio::spawn(async move {
		while let Some(event) = events.recv().await {
			match &event {
				Event::PeerConnected(id) => {
					let id = *id;
					let (tx, rx) = mpsc::unbounded_channel();
					conns.insert(id, tx);
					let transport = transport.clone();
					let directory = directory.clone();
					let grain = grain.clone();
					let config = config.clone();
					let conns = conns.clone();
					tokio::spawn(async move {
						run_connection(transport, id, rx, directory, grain, config).await;
						conns.remove(&id);
					});
					continue;
				}
				Event::NetworkError(err) => {
					warn!(error = %err, "transport network error");
					continue;
				}
				_ => {}
			}
			let id = match &event {
				Event::DataReceived(id, _) => *id,
				Event::PeerClosed(id, _) => *id,
				_ => unreachable!("handled above"),
			};
			if let Some(tx) = conns.get(&id) {
				let _ = tx.send(event);
			}
		}
	});

	Ok(local_addr)
}

#[instrument(skip_all, fields(conn = %conn_id))]
async fn run_connection(
	transport: UdpTransport,
	conn_id: ConnectionId,
	mut events: mpsc::UnboundedReceiver<Event>,
	directory: Arc<dyn DirectoryClient>,
	grain: Arc<GameGrain>,
	config: Arc<RpcConfig>,
) {
	let (security, player_id) = match config.security_mode {
		SecurityMode::Psk => match run_server_handshake(&transport, conn_id, &mut events, &directory, config.handshake_timeout).await {
			Ok(result) => result,
			Err(err) => {
				warn!(error = %err, "handshake failed, dropping connection");
				transport.close(conn_id);
				return;
			}
		},
		SecurityMode::None => {
			warn!("security.mode=none: skipping PSK handshake and AEAD framing (local development only)");
			let keys = derive_session_keys(&Psk([0u8; 32]), &[0u8; 16]);
			(SecuritySession::from_keys(&keys, false), uuid::Uuid::nil())
		}
	};
	let security = Arc::new(Mutex::new(security));

	let (writer_tx, writer_rx) = mpsc::unbounded_channel::<Frame>();
	let send_frame: FrameSender = {
		let writer_tx = writer_tx.clone();
		Arc::new(move |frame: Frame| writer_tx.send(frame).is_ok())
	};
	let session = Arc::new(ServerSession::new(grain.clone(), send_frame));

	info!(%player_id, "player connected");

	let writer_handle = tokio::spawn(run_writer(transport.clone(), conn_id, session.clone(), security.clone(), writer_rx, config.security_mode));

	run_reader(events, conn_id, session, security, config.clone()).await;

	writer_handle.abort();
	transport.close(conn_id);
	if !player_id.is_nil() {
		let _ = directory.disconnect_player(player_id).await;
	}
	grain.disconnect_player(player_id);
	info!(%player_id, "player disconnected");
}

async fn run_writer(
	transport: UdpTransport,
	conn_id: ConnectionId,
	session: Arc<ServerSession>,
	security: Arc<Mutex<SecuritySession>>,
	mut writer_rx: mpsc::UnboundedReceiver<Frame>,
	security_mode: SecurityMode,
) {
	while let Some(frame) = writer_rx.recv().await {
		let encoded = match session.encode_frame(&frame).await {
			Ok(bytes) => bytes,
			Err(err) => {
				warn!(error = %err, "failed to encode outbound frame");
				continue;
			}
		};

		let wire = match security_mode {
			SecurityMode::Psk => {
				let mut sec = security.lock().await;
				match sec.outbound.seal(&encoded) {
					Ok((seq, ciphertext)) => {
						let mut buf = Vec::with_capacity(9 + ciphertext.len());
						buf.push(FRAME_ENCRYPTED);
						buf.extend_from_slice(&seq.to_be_bytes());
						buf.extend_from_slice(&ciphertext);
						Bytes::from(buf)
					}
					Err(err) => {
						warn!(error = %err, "failed to seal outbound frame");
						continue;
					}
				}
			}
			SecurityMode::None => {
				let mut buf = Vec::with_capacity(1 + encoded.len());
				buf.push(FRAME_PLAINTEXT);
				buf.extend_from_slice(&encoded);
				Bytes::from(buf)
			}
		};

		if let Err(err) = transport.send(conn_id, DeliveryClass::ReliableOrdered, wire).await {
			warn!(error = %err, "failed to send frame, connection is likely dead");
			break;
		}
	}
}

enum ReaderFatal {
	TooManyDecryptFailures,
	Protocol(ProtocolError),
}

async fn handle_inbound_datagram(bytes: &Bytes, session: &Arc<ServerSession>, security: &Mutex<SecuritySession>, config: &RpcConfig) -> Result<(), ReaderFatal> {
	let Some(&frame_type) = bytes.first() else {
		return Ok(());
	};
	match frame_type {
		FRAME_ENCRYPTED => {
			if bytes.len() < 9 {
				return Ok(());
			}
			let seq = u64::from_be_bytes(bytes[1..9].try_into().expect("checked length above"));
			let ciphertext = &bytes[9..];
			let mut sec = security.lock().await;
			if !sec.replay_window.accept(seq) {
				debug!(seq, "dropped replayed or out-of-window frame");
				return Ok(());
			}
			match sec.inbound.open(seq, ciphertext) {
				Ok(plaintext) => {
					sec.consecutive_decrypt_failures = 0;
					drop(sec);
					let frame = session.decode_frame(&Bytes::from(plaintext)).await.map_err(|err| ReaderFatal::Protocol(ProtocolError::Codec(err)))?;
					session.handle_inbound(frame).await;
					Ok(())
				}
				Err(_) => {
					sec.consecutive_decrypt_failures += 1;
					let failures = sec.consecutive_decrypt_failures;
					drop(sec);
					if failures >= config.max_consecutive_decrypt_failures {
						Err(ReaderFatal::TooManyDecryptFailures)
					} else {
						Ok(())
					}
				}
			}
		}
		FRAME_PLAINTEXT => {
			let frame = session.decode_frame(&bytes.slice(1..)).await.map_err(|err| ReaderFatal::Protocol(ProtocolError::Codec(err)))?;
			session.handle_inbound(frame).await;
			Ok(())
		}
		other => {
			debug!(frame_type = other, "ignoring frame with unexpected leading type byte");
			Ok(())
		}
	}
}

async fn run_reader(mut events: mpsc::UnboundedReceiver<Event>, conn_id: ConnectionId, session: Arc<ServerSession>, security: Arc<Mutex<SecuritySession>>, config: Arc<RpcConfig>) {
	while let Some(event) = events.recv().await {
		match event {
			Event::DataReceived(id, bytes) if id == conn_id => {
				if let Err(fatal) = handle_inbound_datagram(&bytes, &session, &security, &config).await {
					match fatal {
						ReaderFatal::TooManyDecryptFailures => warn!("too many consecutive decryption failures, tearing down connection"),
						ReaderFatal::Protocol(err) => warn!(error = %err, "fatal protocol error, tearing down connection"),
					}
					break;
				}
			}
			Event::PeerClosed(id, reason) if id == conn_id => {
				debug!(reason, "transport peer closed");
				break;
			}
			_ => {}
		}
	}
}
