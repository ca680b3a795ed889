//! Builds the `IGameGrain` manifest this server replies with on `MANIFEST_REQUEST`.
//! Computed via the same `CompoundAlias` calls the client proxy uses, so both
//! peers land on identical aliases without a negotiation round trip.

use grainrpc_common::codec::alias::CompoundAlias;
use grainrpc_common::rpc::{InterfaceManifest, Manifest, ManifestMethod};

pub const GAME_GRAIN_INTERFACE: &str = "IGameGrain";
pub const GAME_GRAIN_TYPE_ID: u32 = 1;

pub fn game_grain_manifest() -> Manifest {
	let get_world_state = CompoundAlias::new(GAME_GRAIN_INTERFACE, "GetWorldState", &[]);
	let connect_player = CompoundAlias::new(GAME_GRAIN_INTERFACE, "ConnectPlayer", &["System.String"]);

	Manifest {
		interfaces: vec![InterfaceManifest {
			type_name: GAME_GRAIN_INTERFACE.into(),
			type_id: GAME_GRAIN_TYPE_ID,
			methods: vec![
				ManifestMethod { selector: "GetWorldState()".into(), invokable_alias: get_world_state.to_string() },
				ManifestMethod { selector: "ConnectPlayer(System.String)".into(), invokable_alias: connect_player.to_string() },
			],
		}],
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_manifest_aliases_resolve_both_methods() {
		let manifest = game_grain_manifest();
		assert!(manifest.alias_for(GAME_GRAIN_INTERFACE, "GetWorldState()").is_some());
		assert!(manifest.alias_for(GAME_GRAIN_INTERFACE, "ConnectPlayer(System.String)").is_some());
	}
}
