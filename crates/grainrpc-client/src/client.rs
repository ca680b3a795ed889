//! Top-level owned client: wires the bootstrap sequence, the active
//! connection, and the zone transition controller together. An owned struct
//! passed by reference, not a process-wide singleton.

use std::sync::Arc;

use grainrpc_common::config::RpcConfig;
use grainrpc_common::directory::DirectoryClient;
use grainrpc_common::error::ConnectError;
use grainrpc_common::ids::PlayerId;
use tracing::instrument;

use crate::connection::{Connection, ConnectionState};
use crate::observer::{ClientObserver, ObserverState};
use crate::proxy::GameGrainProxy;
use crate::zone::ZoneTransitionController;

pub struct Client {
	zone: Arc<ZoneTransitionController>,
	player_id: PlayerId,
}

impl Client {
	/// Runs the full bootstrap (directory register through Ready)
	/// and starts the zone transition controller watching the resulting connection.
	#[instrument(skip_all, fields(player_id = %player_id))]
	pub async fn connect(
		directory: Arc<dyn DirectoryClient>,
		config: Arc<RpcConfig>,
		player_id: PlayerId,
		player_name: &str,
		observer: Option<Arc<dyn ClientObserver>>,
	) -> Result<Self, ConnectError> {
		if let Some(observer) = &observer {
			observer.on_connection_state_changed(ObserverState::Connecting, None);
		}

		let bootstrap_result = Connection::bootstrap(directory.clone(), config.clone(), player_id.into_uuid(), player_name).await;
		let (connection, psk, registration) = match bootstrap_result {
			Ok(ok) => ok,
			Err(err) => {
				if let Some(observer) = &observer {
					observer.on_connection_state_changed(ObserverState::Failed(err.to_string()), Some(err.to_string()));
				}
				return Err(err);
			}
		};

		let zone = ZoneTransitionController::new(
			directory,
			config,
			player_id,
			psk,
			observer.clone(),
			connection,
			registration.action_server.server_id.clone(),
			registration.action_server.assigned_square.into(),
		);

		if let Some(observer) = &observer {
			observer.on_connected();
			observer.on_connection_state_changed(ObserverState::Connected, None);
		}

		Ok(Self { zone, player_id })
	}

	/// A handle to the canonical "game" grain on whichever connection is
	/// currently active, surviving zone transitions transparently.
	pub async fn proxy(&self) -> GameGrainProxy {
		self.zone.active_connection().await.proxy()
	}

	pub async fn state(&self) -> ConnectionState {
		self.zone.active_connection().await.state()
	}

	pub async fn current_server_id(&self) -> String {
		self.zone.current_server_id().await
	}

	pub fn warm_standby_count(&self) -> usize {
		self.zone.pool_size()
	}

	pub fn player_id(&self) -> PlayerId {
		self.player_id
	}

	/// Closes every Connection this client owns.
	pub async fn close(&self) {
		self.zone.shutdown().await;
	}
}
