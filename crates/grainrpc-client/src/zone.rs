//! C7: boundary detection, the neighbour connection pool, and the atomic zone
//! cutover procedure.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use grainrpc_common::config::RpcConfig;
use grainrpc_common::directory::{DirectoryClient, ServerInfo};
use grainrpc_common::error::TransitionError;
use grainrpc_common::ids::{GridSquare, PlayerId};
use grainrpc_common::security::Psk;
use grainrpc_common::world::{Position, WorldState};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::connection::{resolve_server_addr, Connection, ConnectTarget};
use crate::observer::{ClientObserver, ObserverState};
use crate::proxy::CONNECT_PLAYER_SUCCESS;

/// Cell size used by `GridSquare::from_position` for this world. Not one of
/// the `rpc.*`/`security.*` tunables on `RpcConfig`; fixed at the one
/// concrete value the world's zoning scheme actually uses.
pub const DEFAULT_CELL_SIZE_UNITS: f64 = 1000.0;

struct ActiveState {
	connection: Arc<Connection>,
	server_id: String,
	zone: GridSquare,
}

struct PoolEntry {
	connection: Arc<Connection>,
	pending_eviction: bool,
	last_probe_ok: bool,
}

/// Watches world-state snapshots from the active connection, probes the
/// directory for boundary crossings, and maintains up to 8 warm standby
/// connections to the current zone's neighbours.
pub struct ZoneTransitionController {
	directory: Arc<dyn DirectoryClient>,
	config: Arc<RpcConfig>,
	player_id: PlayerId,
	psk: Psk,
	observer: Option<Arc<dyn ClientObserver>>,
	cell_size: f64,
	active: Mutex<ActiveState>,
	pool: DashMap<String, PoolEntry>,
	connecting: DashMap<String, ()>,
	last_boundary_check: StdMutex<Instant>,
	in_transition: AtomicBool,
	watcher_tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ZoneTransitionController {
	pub fn new(
		directory: Arc<dyn DirectoryClient>,
		config: Arc<RpcConfig>,
		player_id: PlayerId,
		psk: Psk,
		observer: Option<Arc<dyn ClientObserver>>,
		connection: Arc<Connection>,
		server_id: String,
		zone: GridSquare,
	) -> Arc<Self> {
		Self::with_cell_size(directory, config, player_id, psk, observer, connection, server_id, zone, DEFAULT_CELL_SIZE_UNITS)
	}

	pub fn with_cell_size(
		directory: Arc<dyn DirectoryClient>,
		config: Arc<RpcConfig>,
		player_id: PlayerId,
		psk: Psk,
		observer: Option<Arc<dyn ClientObserver>>,
		connection: Arc<Connection>,
		server_id: String,
		zone: GridSquare,
		cell_size: f64,
	) -> Arc<Self> {
		let controller = Arc::new(Self {
			directory,
			config,
			player_id,
			psk,
			observer,
			cell_size,
			active: Mutex::new(ActiveState { connection: connection.clone(), server_id, zone }),
			pool: DashMap::new(),
			connecting: DashMap::new(),
			last_boundary_check: StdMutex::new(Instant::now() - Duration::from_secs(1)),
			in_transition: AtomicBool::new(false),
			watcher_tasks: StdMutex::new(Vec::new()),
		});
		controller.clone().spawn_watchers(connection);
		controller
	}

	pub async fn current_server_id(&self) -> String {
		self.active.lock().await.server_id.clone()
	}

	pub async fn active_connection(&self) -> Arc<Connection> {
		self.active.lock().await.connection.clone()
	}

	pub fn pool_size(&self) -> usize {
		self.pool.len()
	}

	fn spawn_watchers(self: Arc<Self>, connection: Arc<Connection>) {
		let mut tasks = self.watcher_tasks.lock().unwrap();
		for handle in tasks.drain(..) {
			handle.abort();
		}

		let world_watcher = self.clone();
		let mut world_rx = connection.world_state_receiver();
		tasks.push(tokio::spawn(async move {
			loop {
				if world_rx.changed().await.is_err() {
					break;
				}
				let state = world_rx.borrow_and_update().clone();
				world_watcher.on_world_state(state).await;
			}
		}));

		let zones_watcher = self.clone();
		let mut zones_rx = connection.available_zones_receiver();
		tasks.push(tokio::spawn(async move {
			loop {
				if zones_rx.changed().await.is_err() {
					break;
				}
				zones_watcher.run_maintenance().await;
			}
		}));
	}

	/// Handles one world-state snapshot from the active connection.
	async fn on_world_state(self: &Arc<Self>, state: WorldState) {
		let player_key = self.player_id.uuid().to_string();
		match state.find_entity(&player_key) {
			Some(entity) => {
				if !self.boundary_check_due() {
					return;
				}
				let distance = nearest_edge_distance(entity.position, self.cell_size);
				if distance < self.config.boundary_threshold_units {
					debug!(distance, threshold = self.config.boundary_threshold_units, "boundary threshold crossed, probing directory");
					self.probe_transition().await;
				}
			}
			None => {
				debug!("local player missing from snapshot, probing directory immediately");
				self.probe_transition().await;
			}
		}
	}

	fn boundary_check_due(&self) -> bool {
		let mut last = self.last_boundary_check.lock().unwrap();
		if last.elapsed() >= Duration::from_secs(1) {
			*last = Instant::now();
			true
		} else {
			false
		}
	}

	#[instrument(skip_all)]
	async fn probe_transition(self: &Arc<Self>) {
		if self.in_transition.load(Ordering::Acquire) {
			return;
		}
		let player_uuid = self.player_id.into_uuid();
		let target = match self.directory.server_for_player(player_uuid).await {
			Ok(Some(server)) => server,
			Ok(None) => {
				warn!("directory has no owning server for this player");
				self.notify_state(ObserverState::Failed("player not found by directory".into()));
				return;
			}
			Err(err) => {
				warn!(error = %err, "transition probe against directory failed");
				return;
			}
		};

		let current_server_id = self.current_server_id().await;
		if target.server_id == current_server_id {
			return;
		}

		if let Err(err) = self.transition_to(target).await {
			warn!(error = %err, "zone transition failed, remaining on prior server");
		}
	}

	/// Runs the 9-step atomic cutover.
	async fn transition_to(self: &Arc<Self>, target: ServerInfo) -> Result<(), TransitionError> {
		self.in_transition.store(true, Ordering::Release);
		self.notify_state(ObserverState::Transitioning);

		let departing = self.active.lock().await.connection.clone();
		departing.set_transitioning(true); // step 1
		departing.stop_timers(); // step 2

		let target_key = GridSquare::from(target.assigned_square).pool_key();
		let new_connection = match self.acquire_target_connection(&target_key, &target).await {
			Ok(connection) => connection,
			Err(err) => return self.abort_transition(departing, err).await,
		};

		// step 4: probe the new connection before committing to the cutover.
		if let Err(err) = new_connection.proxy().get_world_state(Duration::from_secs(1)).await {
			new_connection.close("failed startup probe during transition").await;
			return self.abort_transition(departing, TransitionError::ProbeRpcFailed(err)).await;
		}

		departing.close("zone transition cutover").await; // step 5
		new_connection.reset_sequence_number(); // step 6
		new_connection.install_timers(self.directory.clone()); // step 7

		{
			let mut active = self.active.lock().await;
			active.connection = new_connection.clone();
			active.server_id = target.server_id.clone();
			active.zone = GridSquare::from(target.assigned_square);
		}
		self.clone().spawn_watchers(new_connection.clone());

		if let Some(observer) = &self.observer {
			observer.on_server_changed(&target.server_id); // step 8
		}

		new_connection.set_transitioning(false); // step 9
		self.in_transition.store(false, Ordering::Release);
		self.notify_state(ObserverState::Connected);

		Ok(())
	}

	/// Restores the departing connection to normal operation after a failed
	/// cutover attempt.
	async fn abort_transition(self: &Arc<Self>, departing: Arc<Connection>, err: TransitionError) -> Result<(), TransitionError> {
		departing.install_timers(self.directory.clone());
		departing.set_transitioning(false);
		self.in_transition.store(false, Ordering::Release);
		self.notify_state(ObserverState::Connected);
		Err(err)
	}

	async fn acquire_target_connection(&self, key: &str, target: &ServerInfo) -> Result<Arc<Connection>, TransitionError> {
		if let Some((_, entry)) = self.pool.remove(key) {
			entry.connection.touch_established_at();
			return self.confirm_connect_player(entry.connection).await;
		}

		let addr = resolve_server_addr(target).await.map_err(TransitionError::ConnectFailed)?;
		let connect_target = ConnectTarget { server_id: target.server_id.clone(), addr, assigned_square: target.assigned_square.into() };
		let connection = Connection::connect_to_server(connect_target, self.player_id.into_uuid(), self.psk.clone(), self.config.clone())
			.await
			.map_err(TransitionError::ConnectFailed)?;
		self.confirm_connect_player(connection).await
	}

	async fn confirm_connect_player(&self, connection: Arc<Connection>) -> Result<Arc<Connection>, TransitionError> {
		let player_id = self.player_id.uuid().to_string();
		match connection.proxy().connect_player(&player_id, Duration::from_secs(2)).await {
			Ok(reply) if reply == CONNECT_PLAYER_SUCCESS => Ok(connection),
			Ok(other) => {
				connection.close("ConnectPlayer refused").await;
				Err(TransitionError::ConnectPlayerRefused(other))
			}
			Err(err) => {
				connection.close("ConnectPlayer call failed").await;
				Err(TransitionError::ConnectPlayerRefused(err.to_string()))
			}
		}
	}

	/// Runs on every available-zones poll.
	async fn run_maintenance(self: &Arc<Self>) {
		let (zone, connection) = {
			let active = self.active.lock().await;
			(active.zone, active.connection.clone())
		};
		let available = connection.available_zones_receiver().borrow().clone();
		let by_zone: HashMap<String, ServerInfo> = available.into_iter().map(|s| (GridSquare::from(s.assigned_square).pool_key(), s)).collect();
		let keep: HashSet<String> = zone.neighbours().chain(std::iter::once(zone)).map(|z| z.pool_key()).collect();

		for neighbour in zone.neighbours() {
			let key = neighbour.pool_key();
			if self.pool.contains_key(&key) || self.connecting.contains_key(&key) {
				continue;
			}
			let Some(server) = by_zone.get(&key).cloned() else {
				continue;
			};
			self.connecting.insert(key.clone(), ());
			let controller = self.clone();
			tokio::spawn(async move { controller.connect_neighbour(key, server).await });
		}

		let mut to_evict = Vec::new();
		for mut entry in self.pool.iter_mut() {
			let key = entry.key().clone();
			if keep.contains(&key) || entry.connection.established_at().elapsed() < self.config.neighbour_eviction_age {
				entry.pending_eviction = false;
				continue;
			}
			if entry.pending_eviction {
				to_evict.push(key);
			} else {
				entry.pending_eviction = true;
			}
		}
		for key in to_evict {
			if let Some((_, entry)) = self.pool.remove(&key) {
				entry.connection.close("evicted from neighbour pool").await;
			}
		}
	}

	async fn connect_neighbour(self: Arc<Self>, key: String, server: ServerInfo) {
		let result = async {
			let addr = resolve_server_addr(&server).await.map_err(TransitionError::ConnectFailed)?;
			let target = ConnectTarget { server_id: server.server_id.clone(), addr, assigned_square: server.assigned_square.into() };
			Connection::connect_to_server(target, self.player_id.into_uuid(), self.psk.clone(), self.config.clone())
				.await
				.map_err(TransitionError::ConnectFailed)
		}
		.await;

		self.connecting.remove(&key);
		match result {
			Ok(connection) => {
				self.pool.insert(key, PoolEntry { connection, pending_eviction: false, last_probe_ok: true });
			}
			Err(err) => debug!(error = %err, "neighbour connect failed, will retry on next maintenance pass"),
		}
	}

	/// Closes the active connection and every warm standby.
	pub async fn shutdown(self: &Arc<Self>) {
		for handle in self.watcher_tasks.lock().unwrap().drain(..) {
			handle.abort();
		}
		let active = self.active.lock().await.connection.clone();
		active.close("client shutdown").await;

		let keys: Vec<String> = self.pool.iter().map(|e| e.key().clone()).collect();
		for key in keys {
			if let Some((_, entry)) = self.pool.remove(&key) {
				entry.connection.close("client shutdown").await;
			}
		}
	}

	fn notify_state(&self, state: ObserverState) {
		if let Some(observer) = &self.observer {
			observer.on_connection_state_changed(state, None);
		}
	}
}

/// Distance in world units from `position` to the nearest edge of its
/// containing cell, along either axis.
fn nearest_edge_distance(position: Position, cell_size: f64) -> f64 {
	distance_to_edge(position.x, cell_size).min(distance_to_edge(position.y, cell_size))
}

fn distance_to_edge(coord: f64, cell_size: f64) -> f64 {
	let offset = coord.rem_euclid(cell_size);
	offset.min(cell_size - offset)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_distance_to_edge_midpoint_is_half_cell() {
		assert_eq!(distance_to_edge(500.0, 1000.0), 500.0);
	}

	#[test]
	fn test_distance_to_edge_near_upper_boundary() {
		assert!((distance_to_edge(995.0, 1000.0) - 5.0).abs() < 1e-9);
	}

	#[test]
	fn test_distance_to_edge_near_lower_boundary_of_next_cell() {
		assert!((distance_to_edge(1005.0, 1000.0) - 5.0).abs() < 1e-9);
	}

	#[test]
	fn test_nearest_edge_distance_takes_minimum_axis() {
		let position = Position { x: 995.0, y: 500.0 };
		assert!((nearest_edge_distance(position, 1000.0) - 5.0).abs() < 1e-9);
	}
}
