//! WorldState snapshots. The core treats per-entity payloads as opaque
//! beyond the fields it needs for zone-transition logic; the game simulation itself
//! is an external collaborator.

use serde::{Deserialize, Serialize};

use crate::codec::{CodecError, FromValue, ToValue, Value};

/// Position in world units. `GridSquare::from_position` converts this to a zone key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
	pub x: f64,
	pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
	pub entity_id: String,
	pub position: Position,
	pub type_tag: String,
}

/// Result of the canonical "game" grain's `GetWorldState`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
	pub sequence_number: i64,
	pub entities: Vec<EntityRecord>,
}

impl WorldState {
	/// The sentinel value the client resets its last-seen sequence number to on
	/// migration; any subsequent snapshot is accepted.
	pub const SEQUENCE_RESET: i64 = -1;

	pub fn find_entity<'a>(&'a self, entity_id: &str) -> Option<&'a EntityRecord> {
		self.entities.iter().find(|e| e.entity_id == entity_id)
	}
}

impl ToValue for Position {
	fn to_value(&self) -> Value {
		Value::Object { type_name: "world.Position".into(), identity: None, fields: vec![(0, Value::F64(self.x)), (1, Value::F64(self.y))] }
	}
}

impl FromValue for Position {
	fn from_value(value: &Value) -> Result<Self, CodecError> {
		let Value::Object { type_name, fields, .. } = value else {
			return Err(CodecError::TypeMismatch { expected: "Object", found: "other" });
		};
		if type_name != "world.Position" {
			return Err(CodecError::UnknownType(type_name.clone()));
		}
		let get = |id: u32| fields.iter().find(|(fid, _)| *fid == id).map(|(_, v)| v).ok_or_else(|| CodecError::Malformed(format!("missing field {id}")));
		Ok(Position { x: f64::from_value(get(0)?)?, y: f64::from_value(get(1)?)? })
	}
}

impl ToValue for EntityRecord {
	fn to_value(&self) -> Value {
		Value::Object {
			type_name: "world.EntityRecord".into(),
			identity: None,
			fields: vec![(0, Value::String(self.entity_id.clone())), (1, self.position.to_value()), (2, Value::String(self.type_tag.clone()))],
		}
	}
}

impl FromValue for EntityRecord {
	fn from_value(value: &Value) -> Result<Self, CodecError> {
		let Value::Object { type_name, fields, .. } = value else {
			return Err(CodecError::TypeMismatch { expected: "Object", found: "other" });
		};
		if type_name != "world.EntityRecord" {
			return Err(CodecError::UnknownType(type_name.clone()));
		}
		let get = |id: u32| fields.iter().find(|(fid, _)| *fid == id).map(|(_, v)| v).ok_or_else(|| CodecError::Malformed(format!("missing field {id}")));
		Ok(EntityRecord { entity_id: String::from_value(get(0)?)?, position: Position::from_value(get(1)?)?, type_tag: String::from_value(get(2)?)? })
	}
}

impl ToValue for WorldState {
	fn to_value(&self) -> Value {
		Value::Object {
			type_name: "world.WorldState".into(),
			identity: None,
			fields: vec![(0, Value::I64(self.sequence_number)), (1, self.entities.to_value())],
		}
	}
}

impl FromValue for WorldState {
	fn from_value(value: &Value) -> Result<Self, CodecError> {
		let Value::Object { type_name, fields, .. } = value else {
			return Err(CodecError::TypeMismatch { expected: "Object", found: "other" });
		};
		if type_name != "world.WorldState" {
			return Err(CodecError::UnknownType(type_name.clone()));
		}
		let get = |id: u32| fields.iter().find(|(fid, _)| *fid == id).map(|(_, v)| v).ok_or_else(|| CodecError::Malformed(format!("missing field {id}")));
		Ok(WorldState { sequence_number: i64::from_value(get(0)?)?, entities: Vec::<EntityRecord>::from_value(get(1)?)? })
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_find_entity() {
		let state = WorldState {
			sequence_number: 1,
			entities: vec![EntityRecord {
				entity_id: "p1".into(),
				position: Position { x: 0.0, y: 0.0 },
				type_tag: "player".into(),
			}],
		};
		assert!(state.find_entity("p1").is_some());
		assert!(state.find_entity("missing").is_none());
	}

	#[test]
	fn test_world_state_roundtrip_through_codec() {
		use crate::codec::{Decoder, Encoder};

		let state = WorldState {
			sequence_number: 7,
			entities: vec![EntityRecord { entity_id: "p1".into(), position: Position { x: 1.5, y: -2.0 }, type_tag: "player".into() }],
		};
		let mut enc = Encoder::new();
		let bytes = enc.encode(&state.to_value()).unwrap();
		let mut dec = Decoder::new();
		let value = dec.decode(&bytes).unwrap();
		assert_eq!(WorldState::from_value(&value).unwrap(), state);
	}
}
