//! The canonical "game" grain: the one authoritative object this server hosts.
//! A real deployment generates many grain types from a schema; this one is
//! written out by hand since it is the only interface the protocol exercises
//! end to end.

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use grainrpc_common::world::{EntityRecord, Position, WorldState};
use uuid::Uuid;

pub const CONNECT_PLAYER_SUCCESS: &str = "SUCCESS";

/// Holds the player registry for one zone and the monotonic sequence counter that
/// tags every `WorldState` snapshot.
pub struct GameGrain {
	players: DashMap<Uuid, EntityRecord>,
	sequence: AtomicI64,
}

impl GameGrain {
	pub fn new() -> Self {
		Self { players: DashMap::new(), sequence: AtomicI64::new(0) }
	}

	/// Answers `GetWorldState()`. Bumping the sequence number on every read
	/// rather than only on mutation keeps the "strictly increasing" invariant
	/// trivially true without a separate dirty flag.
	pub fn get_world_state(&self) -> WorldState {
		let sequence_number = self.sequence.fetch_add(1, Ordering::Relaxed);
		let entities = self.players.iter().map(|entry| entry.value().clone()).collect();
		WorldState { sequence_number, entities }
	}

	/// Answers `ConnectPlayer(System.String)`. `player_id` arrives as
	/// the invokable's sole string argument; admits the player at the origin and
	/// returns the literal success token the client proxy checks for.
	pub fn connect_player(&self, player_id: &str) -> &'static str {
		let Ok(id) = player_id.parse::<Uuid>() else {
			return "INVALID_PLAYER_ID";
		};
		self.players.entry(id).or_insert_with(|| EntityRecord {
			entity_id: player_id.to_owned(),
			position: Position { x: 0.0, y: 0.0 },
			type_tag: "player".into(),
		});
		CONNECT_PLAYER_SUCCESS
	}

	pub fn disconnect_player(&self, player_id: Uuid) {
		self.players.remove(&player_id);
	}

	pub fn player_count(&self) -> usize {
		self.players.len()
	}
}

impl Default for GameGrain {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_connect_player_is_idempotent() {
		let grain = GameGrain::new();
		let id = Uuid::new_v4();
		assert_eq!(grain.connect_player(&id.to_string()), CONNECT_PLAYER_SUCCESS);
		assert_eq!(grain.connect_player(&id.to_string()), CONNECT_PLAYER_SUCCESS);
		assert_eq!(grain.player_count(), 1);
	}

	#[test]
	fn test_connect_player_rejects_malformed_id() {
		let grain = GameGrain::new();
		assert_eq!(grain.connect_player("not-a-uuid"), "INVALID_PLAYER_ID");
		assert_eq!(grain.player_count(), 0);
	}

	#[test]
	fn test_world_state_sequence_is_strictly_increasing() {
		let grain = GameGrain::new();
		let a = grain.get_world_state();
		let b = grain.get_world_state();
		assert!(b.sequence_number > a.sequence_number);
	}

	#[test]
	fn test_world_state_reflects_connected_players() {
		let grain = GameGrain::new();
		let id = Uuid::new_v4();
		grain.connect_player(&id.to_string());
		let state = grain.get_world_state();
		assert_eq!(state.entities.len(), 1);
		assert_eq!(state.entities[0].entity_id, id.to_string());
	}

	#[test]
	fn test_disconnect_removes_player() {
		let grain = GameGrain::new();
		let id = Uuid::new_v4();
		grain.connect_player(&id.to_string());
		grain.disconnect_player(id);
		assert_eq!(grain.player_count(), 0);
	}
}
