//! C6: connection lifecycle: staged bootstrap, periodic timers, cooperative
//! teardown.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant as StdInstant};

use bytes::Bytes;
use grainrpc_common::config::{RpcConfig, SecurityMode};
use grainrpc_common::directory::{DirectoryClient, ServerInfo};
use grainrpc_common::error::{ConnectError, ProtocolError};
use grainrpc_common::ids::GridSquare;
use grainrpc_common::rpc::{ControlKind, Frame};
use grainrpc_common::security::{derive_session_keys, Psk, SecuritySession, FRAME_ENCRYPTED, FRAME_PLAINTEXT};
use grainrpc_common::transport::{ConnectionId, DeliveryClass, Event, UdpTransport};
use grainrpc_common::world::WorldState;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::handshake::run_client_handshake;
use crate::proxy::GameGrainProxy;
use crate::session::{FrameSender, RpcSession};

/// Best-effort timeout for the post-manifest startup probe.
/// Chosen so the happy-path scenario's "within 2s reach Ready" budget has headroom
/// left for the handshake and manifest steps that precede it.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
	Connecting,
	Handshaking,
	ManifestPending,
	Ready,
	Draining,
	Closed,
}

/// Where to connect and which zone that server currently owns.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
	pub server_id: String,
	pub addr: SocketAddr,
	pub assigned_square: GridSquare,
}

/// Resolves `ServerInfo` into a dialable address.
pub async fn resolve_server_addr(server: &ServerInfo) -> Result<SocketAddr, ConnectError> {
	if server.rpc_port == 0 {
		return Err(ConnectError::InvalidServerInfo("rpcPort is 0".into()));
	}
	if let Ok(ip) = server.ip_address.parse::<IpAddr>() {
		return Ok(SocketAddr::new(ip, server.rpc_port));
	}
	let lookup = format!("{}:{}", server.ip_address, server.rpc_port);
	let resolved = tokio::net::lookup_host(&lookup).await.ok().and_then(|mut addrs| addrs.next());
	match resolved {
		Some(addr) => Ok(addr),
		None => {
			warn!(host = %server.ip_address, "DNS resolution failed, falling back to loopback");
			Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), server.rpc_port))
		}
	}
}

/// One live connection to an action server: security session, RPC multiplexer,
/// periodic timers, and the world-state/available-zones feeds other components
/// subscribe to.
pub struct Connection {
	transport: UdpTransport,
	conn_id: ConnectionId,
	rpc: Arc<RpcSession>,
	security: Arc<Mutex<SecuritySession>>,
	state: watch::Sender<ConnectionState>,
	server_id: String,
	addr: SocketAddr,
	assigned_square: GridSquare,
	established_at: StdMutex<StdInstant>,
	config: Arc<RpcConfig>,
	world_state: watch::Sender<WorldState>,
	available_zones: watch::Sender<Vec<ServerInfo>>,
	transitioning: AtomicBool,
	writer_task: StdMutex<Option<JoinHandle<()>>>,
	reader_task: StdMutex<Option<JoinHandle<()>>>,
	timer_tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Connection {
	/// Transport connect, security handshake, manifest
	/// fetch with bounded retry, and the startup probe. Does not install the
	/// periodic timers; callers that want those call `install_timers`
	/// separately so the neighbour pool can reuse this same sequence
	/// while omitting them.
	#[instrument(skip_all, fields(server_id = %target.server_id, addr = %target.addr))]
	pub async fn connect_to_server(target: ConnectTarget, player_id: uuid::Uuid, psk: Psk, config: Arc<RpcConfig>) -> Result<Arc<Connection>, ConnectError> {
		let (transport, mut events) = UdpTransport::new();
		let conn_id = transport.connect(target.addr, config.handshake_timeout).await?;

		let security = match config.security_mode {
			SecurityMode::Psk => run_client_handshake(&transport, conn_id, &mut events, player_id, &psk, config.handshake_timeout).await?,
			SecurityMode::None => {
				warn!("security.mode=none: skipping PSK handshake and AEAD framing (local development only)");
				let keys = derive_session_keys(&psk, &[0u8; 16]);
				SecuritySession::from_keys(&keys, true)
			}
		};
		let security = Arc::new(Mutex::new(security));

		let (writer_tx, writer_rx) = mpsc::unbounded_channel::<Frame>();
		let send_frame: FrameSender = {
			let writer_tx = writer_tx.clone();
			Arc::new(move |frame: Frame| writer_tx.send(frame).map_err(|_| grainrpc_common::error::RpcError::ConnectionClosed))
		};
		let rpc = Arc::new(RpcSession::new(send_frame));

		let (state_tx, _) = watch::channel(ConnectionState::Handshaking);
		let (world_state_tx, _) = watch::channel(WorldState { sequence_number: WorldState::SEQUENCE_RESET, entities: Vec::new() });
		let (zones_tx, _) = watch::channel(Vec::new());

		let connection = Arc::new(Connection {
			transport: transport.clone(),
			conn_id,
			rpc: rpc.clone(),
			security: security.clone(),
			state: state_tx,
			server_id: target.server_id,
			addr: target.addr,
			assigned_square: target.assigned_square,
			established_at: StdMutex::new(StdInstant::now()),
			config: config.clone(),
			world_state: world_state_tx,
			available_zones: zones_tx,
			transitioning: AtomicBool::new(false),
			writer_task: StdMutex::new(None),
			reader_task: StdMutex::new(None),
			timer_tasks: StdMutex::new(Vec::new()),
		});

		let writer_handle = tokio::spawn(run_writer(transport.clone(), conn_id, rpc.clone(), security.clone(), writer_rx, config.security_mode));
		*connection.writer_task.lock().unwrap() = Some(writer_handle);

		let reader_handle = tokio::spawn(run_reader(events, conn_id, rpc.clone(), security.clone(), Arc::downgrade(&connection), config.clone()));
		*connection.reader_task.lock().unwrap() = Some(reader_handle);

		connection.set_state(ConnectionState::ManifestPending);
		fetch_manifest(&connection).await?;

		connection.proxy().get_world_state(PROBE_TIMEOUT).await.map_err(ConnectError::ProbeFailed)?;

		Ok(connection)
	}

	/// Full staged bootstrap: directory registration,
	/// host resolution, connect, handshake, manifest, probe, timers, Ready.
	pub async fn bootstrap(
		directory: Arc<dyn DirectoryClient>,
		config: Arc<RpcConfig>,
		player_id: uuid::Uuid,
		player_name: &str,
	) -> Result<(Arc<Connection>, Psk, grainrpc_common::directory::RegisterResponse), ConnectError> {
		let registration = directory.register(player_id, player_name).await?;
		let psk = psk_from_session_key(&registration.session_key)?;
		let addr = resolve_server_addr(&registration.action_server).await?;
		let target = ConnectTarget {
			server_id: registration.action_server.server_id.clone(),
			addr,
			assigned_square: registration.action_server.assigned_square.into(),
		};

		let connection = Self::connect_to_server(target, player_id, psk.clone(), config).await?;
		connection.install_timers(directory);
		connection.set_state(ConnectionState::Ready);
		Ok((connection, psk, registration))
	}

	/// Installs the three periodic timers.
	pub fn install_timers(self: &Arc<Self>, directory: Arc<dyn DirectoryClient>) {
		let mut timers = self.timer_tasks.lock().unwrap();
		timers.push(tokio::spawn(run_world_state_poll(self.clone())));
		timers.push(tokio::spawn(run_heartbeat(self.clone())));
		timers.push(tokio::spawn(run_available_zones_poll(self.clone(), directory)));
	}

	pub fn stop_timers(&self) {
		let mut timers = self.timer_tasks.lock().unwrap();
		for handle in timers.drain(..) {
			handle.abort();
		}
	}

	/// Cooperative teardown: cancel timers, drain
	/// pending RPCs, send CLOSE, drop the security session (zeroizing key material),
	/// close the transport endpoint.
	pub async fn close(self: &Arc<Self>, reason: impl Into<String> + Send) {
		self.stop_timers();
		self.rpc.fail_all_pending();
		let _ = self.rpc.send_control(ControlKind::Close(reason.into()));
		tokio::time::sleep(Duration::from_millis(20)).await;

		if let Some(handle) = self.writer_task.lock().unwrap().take() {
			handle.abort();
		}
		if let Some(handle) = self.reader_task.lock().unwrap().take() {
			handle.abort();
		}
		self.transport.close(self.conn_id);
		self.set_state(ConnectionState::Closed);
	}

	fn set_state(&self, state: ConnectionState) {
		let _ = self.state.send(state);
	}

	fn mark_closed(&self) {
		self.set_state(ConnectionState::Closed);
		self.rpc.fail_all_pending();
	}

	pub fn state(&self) -> ConnectionState {
		*self.state.borrow()
	}

	pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
		self.state.subscribe()
	}

	pub fn world_state_receiver(&self) -> watch::Receiver<WorldState> {
		self.world_state.subscribe()
	}

	pub fn available_zones_receiver(&self) -> watch::Receiver<Vec<ServerInfo>> {
		self.available_zones.subscribe()
	}

	pub fn proxy(&self) -> GameGrainProxy {
		GameGrainProxy::canonical(self.rpc.clone())
	}

	pub fn server_id(&self) -> &str {
		&self.server_id
	}

	pub fn assigned_square(&self) -> GridSquare {
		self.assigned_square
	}

	pub fn established_at(&self) -> StdInstant {
		*self.established_at.lock().unwrap()
	}

	/// Resets the "freshness" clock used by neighbour-pool eviction, so a connection
	/// just promoted out of the pool isn't evicted moments later.
	pub fn touch_established_at(&self) {
		*self.established_at.lock().unwrap() = StdInstant::now();
	}

	pub fn set_transitioning(&self, value: bool) {
		self.transitioning.store(value, Ordering::Release);
	}

	pub fn is_transitioning(&self) -> bool {
		self.transitioning.load(Ordering::Acquire)
	}

	fn publish_world_state(&self, state: WorldState) {
		self.world_state.send_if_modified(move |current| {
			if state.sequence_number == WorldState::SEQUENCE_RESET || state.sequence_number > current.sequence_number {
				*current = state.clone();
				true
			} else {
				false
			}
		});
	}

	/// Resets the client-visible sequence number ahead of a zone cutover.
	pub fn reset_sequence_number(&self) {
		self.world_state.send_modify(|state| {
			state.sequence_number = WorldState::SEQUENCE_RESET;
			state.entities.clear();
		});
	}
}

fn psk_from_session_key(session_key: &str) -> Result<Psk, ConnectError> {
	use base64::Engine;
	let bytes = base64::engine::general_purpose::STANDARD
		.decode(session_key)
		.map_err(|err| ConnectError::Bootstrap(grainrpc_common::error::BootstrapError::MalformedSessionKey(err.to_string())))?;
	let key: [u8; 32] = bytes
		.try_into()
		.map_err(|_| ConnectError::Bootstrap(grainrpc_common::error::BootstrapError::MalformedSessionKey("expected 32 bytes".into())))?;
	Ok(Psk(key))
}

async fn fetch_manifest(connection: &Arc<Connection>) -> Result<(), ConnectError> {
	let config = &connection.config;
	for attempt in 0..config.manifest_retries {
		if let Err(err) = connection.rpc.send_manifest_request() {
			warn!(attempt, error = %err, "failed to send manifest request");
		} else if connection.rpc.wait_for_manifest(Duration::from_millis(300)).await {
			return if connection.rpc.has_manifest().await {
				Ok(())
			} else {
				Err(ConnectError::Protocol(ProtocolError::ManifestEmpty))
			};
		}
		if let Some(delay) = config.manifest_retry_delays.get(attempt as usize) {
			tokio::time::sleep(*delay).await;
		}
	}
	Err(ConnectError::Protocol(ProtocolError::ManifestUnavailable))
}

async fn run_writer(
	transport: UdpTransport,
	conn_id: ConnectionId,
	rpc: Arc<RpcSession>,
	security: Arc<Mutex<SecuritySession>>,
	mut writer_rx: mpsc::UnboundedReceiver<Frame>,
	security_mode: SecurityMode,
) {
	while let Some(frame) = writer_rx.recv().await {
		let encoded = match rpc.encode_frame(&frame).await {
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

async fn handle_inbound_datagram(bytes: &Bytes, rpc: &RpcSession, security: &Mutex<SecuritySession>, config: &RpcConfig) -> Result<(), ReaderFatal> {
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
					let frame = rpc.decode_frame(&Bytes::from(plaintext)).await.map_err(|err| ReaderFatal::Protocol(ProtocolError::Codec(err)))?;
					dispatch_frame(frame, rpc).await;
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
			let frame = rpc.decode_frame(&bytes.slice(1..)).await.map_err(|err| ReaderFatal::Protocol(ProtocolError::Codec(err)))?;
			dispatch_frame(frame, rpc).await;
			Ok(())
		}
		other => {
			debug!(frame_type = other, "ignoring frame with unexpected leading type byte");
			Ok(())
		}
	}
}

async fn dispatch_frame(frame: Frame, rpc: &RpcSession) {
	match frame {
		Frame::Control(ControlKind::Close(reason)) => {
			debug!(reason, "peer sent CLOSE");
			rpc.fail_all_pending();
		}
		other => rpc.handle_inbound(other).await,
	}
}

async fn run_reader(
	mut events: mpsc::UnboundedReceiver<Event>,
	conn_id: ConnectionId,
	rpc: Arc<RpcSession>,
	security: Arc<Mutex<SecuritySession>>,
	connection: std::sync::Weak<Connection>,
	config: Arc<RpcConfig>,
) {
	while let Some(event) = events.recv().await {
		match event {
			Event::DataReceived(id, bytes) if id == conn_id => {
				if let Err(fatal) = handle_inbound_datagram(&bytes, &rpc, &security, &config).await {
					match fatal {
						ReaderFatal::TooManyDecryptFailures => warn!("too many consecutive decryption failures, tearing down connection"),
						ReaderFatal::Protocol(err) => warn!(error = %err, "fatal protocol error, tearing down connection"),
					}
					if let Some(connection) = connection.upgrade() {
						connection.mark_closed();
					}
					break;
				}
			}
			Event::PeerClosed(id, reason) if id == conn_id => {
				debug!(reason, "transport peer closed");
				if let Some(connection) = connection.upgrade() {
					connection.mark_closed();
				}
				break;
			}
			Event::NetworkError(err) => warn!(error = %err, "transport network error"),
			_ => {}
		}
	}
	rpc.fail_all_pending();
}

async fn run_world_state_poll(connection: Arc<Connection>) {
	let mut interval = tokio::time::interval(connection.config.world_state_period);
	interval.tick().await;
	loop {
		interval.tick().await;
		if connection.is_transitioning() {
			continue;
		}
		match connection.proxy().get_world_state(connection.config.world_state_period * 4).await {
			Ok(state) => connection.publish_world_state(state),
			Err(err) => debug!(error = %err, "world-state poll failed"),
		}
	}
}

async fn run_heartbeat(connection: Arc<Connection>) {
	tokio::time::sleep(connection.config.heartbeat_initial_delay).await;
	let mut interval = tokio::time::interval(connection.config.heartbeat_period);
	loop {
		interval.tick().await;
		if let Err(err) = connection.proxy().get_world_state(Duration::from_millis(500)).await {
			debug!(error = %err, "heartbeat call failed");
		}
	}
}

async fn run_available_zones_poll(connection: Arc<Connection>, directory: Arc<dyn DirectoryClient>) {
	let mut interval = tokio::time::interval(connection.config.available_zones_period);
	interval.tick().await;
	loop {
		interval.tick().await;
		match directory.list_action_servers().await {
			Ok(servers) => {
				let _ = connection.available_zones.send(servers);
			}
			Err(err) => debug!(error = %err, "available-zones poll failed"),
		}
	}
}
