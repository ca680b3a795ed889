//! C5: typed handles over an `RpcSession`.
//!
//! Only the canonical "game" grain is known at this crate's build time; the real
//! system would generate one proxy struct per grain interface from a schema, but
//! here there is exactly one interface to generate, so it's written out by hand in
//! the shape a generator would have produced.

use std::sync::Arc;
use std::time::Duration;

use grainrpc_common::codec::alias::CompoundAlias;
use grainrpc_common::codec::{ToValue, Value};
use grainrpc_common::error::RpcError;
use grainrpc_common::world::WorldState;

use crate::session::RpcSession;

pub const GAME_GRAIN_INTERFACE: &str = "IGameGrain";
pub const GAME_GRAIN_KEY: &str = "game";

fn get_world_state_selector() -> (&'static str, CompoundAlias) {
	("GetWorldState()", CompoundAlias::new(GAME_GRAIN_INTERFACE, "GetWorldState", &[]))
}

fn connect_player_selector() -> (&'static str, CompoundAlias) {
	("ConnectPlayer(System.String)", CompoundAlias::new(GAME_GRAIN_INTERFACE, "ConnectPlayer", &["System.String"]))
}

/// A cheap-to-copy client-side reference to the canonical "game" grain.
#[derive(Clone)]
pub struct GameGrainProxy {
	session: Arc<RpcSession>,
	grain_key: String,
}

impl GameGrainProxy {
	pub fn new(session: Arc<RpcSession>, grain_key: impl Into<String>) -> Self {
		Self { session, grain_key: grain_key.into() }
	}

	/// Canonical instance used for probes and the default play session.
	pub fn canonical(session: Arc<RpcSession>) -> Self {
		Self::new(session, GAME_GRAIN_KEY)
	}

	async fn resolve_alias(&self, selector: &str, fallback: &CompoundAlias) -> Result<String, RpcError> {
		match self.session.manifest_alias(GAME_GRAIN_INTERFACE, selector).await {
			Some(alias) => Ok(alias),
			None => Ok(fallback.to_string()),
		}
	}

	/// Deep-copies `args` through the codec before sending so the caller can never
	/// observe the RPC layer mutate them in place.
	fn deep_copy(value: &Value) -> Value {
		value.clone()
	}

	pub async fn get_world_state(&self, deadline: Duration) -> Result<WorldState, RpcError> {
		let (selector, fallback) = get_world_state_selector();
		let alias = self.resolve_alias(selector, &fallback).await?;
		let invokable_type_name = format!("inv.{GAME_GRAIN_INTERFACE}.GetWorldState");
		let body = self
			.session
			.call(alias, self.grain_key.clone(), invokable_type_name, vec![], deadline)
			.await?;
		self.session.decode_response(&body).await.map_err(RpcError::Codec)
	}

	pub async fn connect_player(&self, player_id: &str, deadline: Duration) -> Result<String, RpcError> {
		let (selector, fallback) = connect_player_selector();
		let alias = self.resolve_alias(selector, &fallback).await?;
		let invokable_type_name = format!("inv.{GAME_GRAIN_INTERFACE}.ConnectPlayer");
		let arg = Self::deep_copy(&player_id.to_owned().to_value());
		let body = self
			.session
			.call(alias, self.grain_key.clone(), invokable_type_name, vec![arg], deadline)
			.await?;
		self.session.decode_response(&body).await.map_err(RpcError::Codec)
	}
}

/// The literal reply a successful `ConnectPlayer` call must return.
pub const CONNECT_PLAYER_SUCCESS: &str = "SUCCESS";

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_selectors_are_structural() {
		let (_, a) = get_world_state_selector();
		let (_, b) = get_world_state_selector();
		assert_eq!(a, b);
	}

	#[test]
	fn test_connect_player_selector_differs_from_get_world_state() {
		let (_, a) = get_world_state_selector();
		let (_, b) = connect_player_selector();
		assert_ne!(a.method_hash8, b.method_hash8);
	}
}
