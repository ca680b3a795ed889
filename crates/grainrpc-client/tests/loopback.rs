//! End-to-end loopback tests: a real `grainrpc-server` listener on `127.0.0.1`,
//! a fake directory standing in for the HTTP service, and the client's full
//! bootstrap sequence running against both over real UDP sockets.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use grainrpc_client::connection::Connection;
use grainrpc_common::config::RpcConfig;
use grainrpc_common::directory::{DirectoryClient, GridSquareDto, PlayerInfo, Position, RegisterResponse, ServerInfo, ValidateResponse};
use grainrpc_common::error::{BootstrapError, ConnectError};
use grainrpc_common::ids::Role;
use grainrpc_common::security::Psk;
use grainrpc_server::grain::GameGrain;
use uuid::Uuid;

/// Stands in for the directory HTTP API: mints one PSK per call to `register`
/// (constant for the test's lifetime) and validates it the way the real
/// `/session/validate` endpoint would.
struct FakeDirectory {
	psk: Psk,
	server_addr: SocketAddr,
	reject_all: bool,
}

impl FakeDirectory {
	fn psk_b64(&self) -> String {
		base64::engine::general_purpose::STANDARD.encode(self.psk.0)
	}
}

#[async_trait]
impl DirectoryClient for FakeDirectory {
	async fn register(&self, player_id: Uuid, name: &str) -> Result<RegisterResponse, BootstrapError> {
		Ok(RegisterResponse {
			player_info: PlayerInfo { player_id, name: name.to_owned(), position: Position { x: 0.0, y: 0.0 } },
			action_server: ServerInfo {
				server_id: "test-server".into(),
				ip_address: self.server_addr.ip().to_string(),
				udp_port: self.server_addr.port(),
				http_endpoint: String::new(),
				rpc_port: self.server_addr.port(),
				assigned_square: GridSquareDto { x: 0, y: 0 },
			},
			session_key: self.psk_b64(),
			session_expires_at: "2099-01-01T00:00:00Z".into(),
		})
	}

	async fn server_for_player(&self, _player_id: Uuid) -> Result<Option<ServerInfo>, BootstrapError> {
		Ok(None)
	}

	async fn list_action_servers(&self) -> Result<Vec<ServerInfo>, BootstrapError> {
		Ok(vec![])
	}

	async fn disconnect_player(&self, _player_id: Uuid) -> Result<bool, BootstrapError> {
		Ok(true)
	}

	async fn validate_session(&self, _player_id: Uuid, provided_key_b64: &str) -> Result<ValidateResponse, BootstrapError> {
		Ok(ValidateResponse { ok: !self.reject_all && provided_key_b64 == self.psk_b64(), role: Role::User })
	}
}

async fn start_server(directory: Arc<dyn DirectoryClient>) -> SocketAddr {
	let bind_addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
	let grain = Arc::new(GameGrain::new());
	let config = Arc::new(RpcConfig::default());
	grainrpc_server::listener::run(bind_addr, directory, grain, config).await.expect("server listener bind failed")
}

#[tokio::test]
async fn test_happy_path_connect_and_get_world_state() {
	let psk = Psk([7u8; 32]);
	let directory: Arc<dyn DirectoryClient> = Arc::new(FakeDirectory { psk: psk.clone(), server_addr: "127.0.0.1:1".parse().unwrap(), reject_all: false });
	// server_addr is filled in once the listener has actually bound, so build the
	// real directory after the bind.
	let addr = start_server(directory).await;
	let directory: Arc<dyn DirectoryClient> = Arc::new(FakeDirectory { psk, server_addr: addr, reject_all: false });

	let config = Arc::new(RpcConfig::default());
	let player_id = Uuid::new_v4();
	let (connection, _psk, _registration) = Connection::bootstrap(directory, config, player_id, "tester").await.expect("bootstrap should succeed");

	let state = connection.proxy().get_world_state(Duration::from_secs(2)).await.expect("get_world_state should succeed");
	assert_eq!(state.entities.len(), 1);
	assert_eq!(state.entities[0].entity_id, player_id.to_string());
}

#[tokio::test]
async fn test_connect_player_returns_success_token() {
	let psk = Psk([9u8; 32]);
	// bind first so the fake directory can report the real port.
	let addr = start_server(Arc::new(FakeDirectory { psk: psk.clone(), server_addr: "127.0.0.1:1".parse().unwrap(), reject_all: false })).await;
	let directory: Arc<dyn DirectoryClient> = Arc::new(FakeDirectory { psk, server_addr: addr, reject_all: false });

	let config = Arc::new(RpcConfig::default());
	let player_id = Uuid::new_v4();
	let (connection, _psk, _registration) = Connection::bootstrap(directory, config, player_id, "tester").await.expect("bootstrap should succeed");

	let reply = connection.proxy().connect_player(&player_id.to_string(), Duration::from_secs(2)).await.expect("connect_player should succeed");
	assert_eq!(reply, grainrpc_server::grain::CONNECT_PLAYER_SUCCESS);
}

#[tokio::test]
async fn test_directory_rejecting_presented_key_fails_the_handshake() {
	let psk = Psk([3u8; 32]);
	let addr = start_server(Arc::new(FakeDirectory { psk: psk.clone(), server_addr: "127.0.0.1:1".parse().unwrap(), reject_all: true })).await;
	let directory: Arc<dyn DirectoryClient> = Arc::new(FakeDirectory { psk, server_addr: addr, reject_all: true });

	let mut config = RpcConfig::default();
	config.handshake_timeout = Duration::from_millis(500);
	let player_id = Uuid::new_v4();
	let result = Connection::bootstrap(directory, Arc::new(config), player_id, "tester").await;

	assert!(matches!(result, Err(ConnectError::SecurityFailed(_))));
}
