//! The per-session manifest exchanged once after the security layer goes Live.

use std::collections::HashMap;

use crate::codec::{CodecError, FromValue, ToValue, Value};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ManifestMethod {
	pub selector: String,
	pub invokable_alias: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceManifest {
	pub type_name: String,
	pub type_id: u32,
	pub methods: Vec<ManifestMethod>,
}

/// `interfaceName -> interfaceTypeId`, and `(interfaceTypeId, selector) -> invokableAlias`
///. Built fresh from a `MANIFEST_REPLY` frame; a `Connection` holds
/// exactly one for its lifetime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
	pub interfaces: Vec<InterfaceManifest>,
}

impl Manifest {
	pub fn is_empty(&self) -> bool {
		self.interfaces.is_empty()
	}

	pub fn type_id_for(&self, interface_name: &str) -> Option<u32> {
		self.interfaces.iter().find(|i| i.type_name == interface_name).map(|i| i.type_id)
	}

	pub fn alias_for(&self, interface_name: &str, selector: &str) -> Option<&str> {
		let iface = self.interfaces.iter().find(|i| i.type_name == interface_name)?;
		iface.methods.iter().find(|m| m.selector == selector).map(|m| m.invokable_alias.as_str())
	}

	/// Builds the `selector -> alias` lookup table used by generated proxies
	///, keyed by interface name for convenience at call sites that
	/// already know the target interface.
	pub fn selector_table(&self, interface_name: &str) -> HashMap<String, String> {
		self.interfaces
			.iter()
			.filter(|i| i.type_name == interface_name)
			.flat_map(|i| i.methods.iter())
			.map(|m| (m.selector.clone(), m.invokable_alias.clone()))
			.collect()
	}
}

impl ToValue for Manifest {
	fn to_value(&self) -> Value {
		Value::Object {
			type_name: "rpc.Manifest".into(),
			identity: None,
			fields: vec![(0, Value::List(self.interfaces.iter().map(ToValue::to_value).collect()))],
		}
	}
}

impl FromValue for Manifest {
	fn from_value(value: &Value) -> Result<Self, CodecError> {
		let Value::Object { type_name, fields, .. } = value else {
			return Err(CodecError::TypeMismatch { expected: "Object", found: "other" });
		};
		if type_name != "rpc.Manifest" {
			return Err(CodecError::UnknownType(type_name.clone()));
		}
		let list = fields.iter().find(|(id, _)| *id == 0).map(|(_, v)| v).ok_or_else(|| CodecError::Malformed("manifest missing interfaces field".into()))?;
		let Value::List(items) = list else {
			return Err(CodecError::TypeMismatch { expected: "List", found: "other" });
		};
		let interfaces = items.iter().map(InterfaceManifest::from_value).collect::<Result<Vec<_>, _>>()?;
		Ok(Manifest { interfaces })
	}
}

impl ToValue for InterfaceManifest {
	fn to_value(&self) -> Value {
		Value::Object {
			type_name: "rpc.InterfaceManifest".into(),
			identity: None,
			fields: vec![
				(0, Value::String(self.type_name.clone())),
				(1, Value::U32(self.type_id)),
				(2, Value::List(self.methods.iter().map(ToValue::to_value).collect())),
			],
		}
	}
}

impl FromValue for InterfaceManifest {
	fn from_value(value: &Value) -> Result<Self, CodecError> {
		let Value::Object { type_name, fields, .. } = value else {
			return Err(CodecError::TypeMismatch { expected: "Object", found: "other" });
		};
		if type_name != "rpc.InterfaceManifest" {
			return Err(CodecError::UnknownType(type_name.clone()));
		}
		let get = |id: u32| fields.iter().find(|(fid, _)| *fid == id).map(|(_, v)| v).ok_or_else(|| CodecError::Malformed(format!("missing field {id}")));
		let Value::List(method_items) = get(2)? else {
			return Err(CodecError::TypeMismatch { expected: "List", found: "other" });
		};
		Ok(InterfaceManifest {
			type_name: String::from_value(get(0)?)?,
			type_id: u32::from_value(get(1)?)?,
			methods: method_items.iter().map(ManifestMethod::from_value).collect::<Result<Vec<_>, _>>()?,
		})
	}
}

impl ToValue for ManifestMethod {
	fn to_value(&self) -> Value {
		Value::Object {
			type_name: "rpc.ManifestMethod".into(),
			identity: None,
			fields: vec![(0, Value::String(self.selector.clone())), (1, Value::String(self.invokable_alias.clone()))],
		}
	}
}

impl FromValue for ManifestMethod {
	fn from_value(value: &Value) -> Result<Self, CodecError> {
		let Value::Object { type_name, fields, .. } = value else {
			return Err(CodecError::TypeMismatch { expected: "Object", found: "other" });
		};
		if type_name != "rpc.ManifestMethod" {
			return Err(CodecError::UnknownType(type_name.clone()));
		}
		let get = |id: u32| fields.iter().find(|(fid, _)| *fid == id).map(|(_, v)| v).ok_or_else(|| CodecError::Malformed(format!("missing field {id}")));
		Ok(ManifestMethod { selector: String::from_value(get(0)?)?, invokable_alias: String::from_value(get(1)?)? })
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::codec::{Decoder, Encoder};

	fn sample() -> Manifest {
		Manifest {
			interfaces: vec![InterfaceManifest {
				type_name: "IGameGrain".into(),
				type_id: 1,
				methods: vec![
					ManifestMethod { selector: "GetWorldState()".into(), invokable_alias: "inv/GrainReference/IGameGrain/aaaaaaaa".into() },
					ManifestMethod { selector: "ConnectPlayer(System.String)".into(), invokable_alias: "inv/GrainReference/IGameGrain/bbbbbbbb".into() },
				],
			}],
		}
	}

	#[test]
	fn test_lookup_helpers() {
		let manifest = sample();
		assert_eq!(manifest.type_id_for("IGameGrain"), Some(1));
		assert_eq!(manifest.alias_for("IGameGrain", "GetWorldState()"), Some("inv/GrainReference/IGameGrain/aaaaaaaa"));
		assert_eq!(manifest.alias_for("IGameGrain", "Missing()"), None);
		assert!(!manifest.is_empty());
	}

	#[test]
	fn test_manifest_roundtrip_through_codec() {
		let manifest = sample();
		let mut enc = Encoder::new();
		let bytes = enc.encode(&manifest.to_value()).unwrap();
		let mut dec = Decoder::new();
		let value = dec.decode(&bytes).unwrap();
		assert_eq!(Manifest::from_value(&value).unwrap(), manifest);
	}
}
