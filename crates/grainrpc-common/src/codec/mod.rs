//! C1: the tag-delimited wire codec.
//!
//! This is a hand-rolled binary format rather than a `serde` wrapper, because the
//! protocol needs things a generic serializer can't express on its own: delta-encoded
//! field ids with forward-compatible skipping, a per-session type name cache, and
//! reference tracking for shared/cyclic substructure.
//!
//! The encoder/decoder operate on a self-describing [`Value`] tree. Concrete argument
//! types (RPC invocation payloads) are converted to/from `Value` via [`ToValue`]/
//! [`FromValue`] rather than hand-writing TLV bytes at every call site.

pub mod alias;
mod limits;
mod varint;

pub use limits::Limits;

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use self::varint::{read_uvarint, write_uvarint, zigzag_decode, zigzag_encode};

#[derive(Error, Debug)]
pub enum CodecError {
	#[error("frame ended before the expected value was fully read")]
	TruncatedFrame,
	#[error("unknown type referenced on the wire: {0}")]
	UnknownType(String),
	#[error("nesting exceeded the configured depth limit")]
	DepthExceeded,
	#[error("collection exceeded the configured length limit")]
	CollectionTooLarge,
	#[error("string exceeded the configured byte limit")]
	StringTooLarge,
	#[error("message exceeded the configured total byte limit")]
	MessageTooLarge,
	#[error("reference to an object that was never encoded/decoded: {0}")]
	DanglingReference(u32),
	#[error("malformed wire data: {0}")]
	Malformed(String),
	#[error("expected {expected}, found {found}")]
	TypeMismatch { expected: &'static str, found: &'static str },
}

/// Low three bits of a field header. `EndObject` is a sentinel, not a "real" field.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
enum WireType {
	TagDelimited = 0,
	Reference = 1,
	Fixed = 2,
	LengthPrefixed = 3,
	VarInt = 4,
	EndObject = 7,
}

impl WireType {
	fn from_u8(v: u8) -> Result<Self, CodecError> {
		Ok(match v {
			0 => Self::TagDelimited,
			1 => Self::Reference,
			2 => Self::Fixed,
			3 => Self::LengthPrefixed,
			4 => Self::VarInt,
			7 => Self::EndObject,
			other => return Err(CodecError::Malformed(format!("unknown wire type {other}"))),
		})
	}
}

fn write_field_header(buf: &mut impl BufMut, delta_id: u32, wire_type: WireType) {
	let packed = ((delta_id as u64) << 3) | (wire_type as u64);
	write_uvarint(buf, packed);
}

fn read_field_header(buf: &mut impl Buf) -> Result<(u32, WireType), CodecError> {
	let packed = read_uvarint(buf)?;
	let wire_type = WireType::from_u8((packed & 0x7) as u8)?;
	let delta_id = (packed >> 3) as u32;
	Ok((delta_id, wire_type))
}

/// A globally unique handle assigned by the *caller* to a [`Value::Object`] that may
/// be shared or cyclic. The codec uses this, not Rust object identity, to decide when
/// to emit a [`WireType::Reference`] instead of the full payload.
pub type ObjectId = u64;

/// A self-describing value in the wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
	Null,
	Bool(bool),
	I32(i32),
	I64(i64),
	U32(u32),
	U64(u64),
	F32(f32),
	F64(f64),
	String(String),
	Bytes(Bytes),
	List(Vec<Value>),
	/// `fields` must be in ascending field-id order (matches declaration order).
	Object {
		type_name: String,
		identity: Option<ObjectId>,
		fields: Vec<(u32, Value)>,
	},
}

impl Value {
	pub fn as_i64(&self) -> Option<i64> {
		match self {
			Value::I64(v) => Some(*v),
			Value::I32(v) => Some(*v as i64),
			_ => None,
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Value::String(s) => Some(s.as_str()),
			_ => None,
		}
	}
}

/// Converts a Rust type into a codec [`Value`] tree.
pub trait ToValue {
	fn to_value(&self) -> Value;
}

/// Converts a codec [`Value`] tree back into a Rust type.
pub trait FromValue: Sized {
	fn from_value(value: &Value) -> Result<Self, CodecError>;
}

macro_rules! impl_primitive {
	($ty:ty, $variant:ident) => {
		impl ToValue for $ty {
			fn to_value(&self) -> Value {
				Value::$variant(*self)
			}
		}
		impl FromValue for $ty {
			fn from_value(value: &Value) -> Result<Self, CodecError> {
				match value {
					Value::$variant(v) => Ok(*v),
					other => Err(CodecError::TypeMismatch {
						expected: stringify!($variant),
						found: other.type_name(),
					}),
				}
			}
		}
	};
}

impl Value {
	fn type_name(&self) -> &'static str {
		match self {
			Value::Null => "Null",
			Value::Bool(_) => "Bool",
			Value::I32(_) => "I32",
			Value::I64(_) => "I64",
			Value::U32(_) => "U32",
			Value::U64(_) => "U64",
			Value::F32(_) => "F32",
			Value::F64(_) => "F64",
			Value::String(_) => "String",
			Value::Bytes(_) => "Bytes",
			Value::List(_) => "List",
			Value::Object { .. } => "Object",
		}
	}
}

impl_primitive!(bool, Bool);
impl_primitive!(i32, I32);
impl_primitive!(i64, I64);
impl_primitive!(u32, U32);
impl_primitive!(u64, U64);
impl_primitive!(f32, F32);
impl_primitive!(f64, F64);

impl ToValue for String {
	fn to_value(&self) -> Value {
		Value::String(self.clone())
	}
}
impl FromValue for String {
	fn from_value(value: &Value) -> Result<Self, CodecError> {
		match value {
			Value::String(s) => Ok(s.clone()),
			other => Err(CodecError::TypeMismatch { expected: "String", found: other.type_name() }),
		}
	}
}

impl ToValue for Bytes {
	fn to_value(&self) -> Value {
		Value::Bytes(self.clone())
	}
}
impl FromValue for Bytes {
	fn from_value(value: &Value) -> Result<Self, CodecError> {
		match value {
			Value::Bytes(b) => Ok(b.clone()),
			other => Err(CodecError::TypeMismatch { expected: "Bytes", found: other.type_name() }),
		}
	}
}

impl<T: ToValue> ToValue for Option<T> {
	fn to_value(&self) -> Value {
		match self {
			Some(v) => v.to_value(),
			None => Value::Null,
		}
	}
}
impl<T: FromValue> FromValue for Option<T> {
	fn from_value(value: &Value) -> Result<Self, CodecError> {
		match value {
			Value::Null => Ok(None),
			other => Ok(Some(T::from_value(other)?)),
		}
	}
}

impl<T: ToValue> ToValue for Vec<T> {
	fn to_value(&self) -> Value {
		Value::List(self.iter().map(ToValue::to_value).collect())
	}
}
impl<T: FromValue> FromValue for Vec<T> {
	fn from_value(value: &Value) -> Result<Self, CodecError> {
		match value {
			Value::List(items) => items.iter().map(T::from_value).collect(),
			other => Err(CodecError::TypeMismatch { expected: "List", found: other.type_name() }),
		}
	}
}

/// Per-session type name cache, mirrored independently by encoder and decoder.
#[derive(Debug, Default)]
struct TypeCache {
	name_to_index: HashMap<String, u32>,
	index_to_name: Vec<String>,
}

impl TypeCache {
	fn intern_for_encode(&mut self, name: &str) -> (bool, u32) {
		if let Some(&idx) = self.name_to_index.get(name) {
			(false, idx)
		} else {
			let idx = self.index_to_name.len() as u32;
			self.index_to_name.push(name.to_owned());
			self.name_to_index.insert(name.to_owned(), idx);
			(true, idx)
		}
	}

	fn install_for_decode(&mut self, name: String) -> u32 {
		let idx = self.index_to_name.len() as u32;
		self.index_to_name.push(name);
		idx
	}

	fn resolve(&self, idx: u32) -> Result<&str, CodecError> {
		self.index_to_name
			.get(idx as usize)
			.map(String::as_str)
			.ok_or_else(|| CodecError::UnknownType(format!("type cache index {idx}")))
	}
}

const NULL_REF: u32 = 0;

/// Encodes [`Value`] trees into a `BytesMut` buffer, maintaining a type cache and
/// object-identity reference map for the lifetime of one session.
#[derive(Debug, Default)]
pub struct Encoder {
	type_cache: TypeCache,
	object_refs: HashMap<ObjectId, u32>,
	next_ref: u32,
	limits: Limits,
}

impl Encoder {
	pub fn new() -> Self {
		Self { next_ref: 1, ..Default::default() }
	}

	pub fn with_limits(limits: Limits) -> Self {
		Self { limits, next_ref: 1, ..Default::default() }
	}

	pub fn encode(&mut self, value: &Value) -> Result<Bytes, CodecError> {
		let mut buf = BytesMut::new();
		self.encode_value(&mut buf, value, 0)?;
		if buf.len() > self.limits.max_message_bytes {
			return Err(CodecError::MessageTooLarge);
		}
		Ok(buf.freeze())
	}

	fn encode_value(&mut self, buf: &mut BytesMut, value: &Value, depth: usize) -> Result<(), CodecError> {
		if depth > self.limits.max_depth {
			return Err(CodecError::DepthExceeded);
		}
		match value {
			Value::Null => {
				write_field_header(buf, 0, WireType::Reference);
				write_uvarint(buf, NULL_REF as u64);
			}
			Value::Bool(b) => {
				write_field_header(buf, 0, WireType::VarInt);
				buf.put_u8(0); // subtype: bool
				buf.put_u8(*b as u8);
			}
			Value::I32(v) => {
				write_field_header(buf, 0, WireType::VarInt);
				buf.put_u8(1);
				write_uvarint(buf, zigzag_encode(*v as i64));
			}
			Value::I64(v) => {
				write_field_header(buf, 0, WireType::VarInt);
				buf.put_u8(2);
				write_uvarint(buf, zigzag_encode(*v));
			}
			Value::U32(v) => {
				write_field_header(buf, 0, WireType::VarInt);
				buf.put_u8(3);
				write_uvarint(buf, *v as u64);
			}
			Value::U64(v) => {
				write_field_header(buf, 0, WireType::VarInt);
				buf.put_u8(4);
				write_uvarint(buf, *v);
			}
			Value::F32(v) => {
				write_field_header(buf, 0, WireType::Fixed);
				buf.put_u8(0);
				buf.put_f32_le(*v);
			}
			Value::F64(v) => {
				write_field_header(buf, 0, WireType::Fixed);
				buf.put_u8(1);
				buf.put_f64_le(*v);
			}
			Value::String(s) => {
				if s.len() > self.limits.max_string_bytes {
					return Err(CodecError::StringTooLarge);
				}
				write_field_header(buf, 0, WireType::LengthPrefixed);
				buf.put_u8(0);
				write_uvarint(buf, s.len() as u64);
				buf.put_slice(s.as_bytes());
			}
			Value::Bytes(b) => {
				if b.len() > self.limits.max_string_bytes {
					return Err(CodecError::StringTooLarge);
				}
				write_field_header(buf, 0, WireType::LengthPrefixed);
				buf.put_u8(1);
				write_uvarint(buf, b.len() as u64);
				buf.put_slice(b);
			}
			Value::List(items) => {
				if items.len() > self.limits.max_collection_len {
					return Err(CodecError::CollectionTooLarge);
				}
				write_field_header(buf, 0, WireType::LengthPrefixed);
				buf.put_u8(2);
				write_uvarint(buf, items.len() as u64);
				for item in items {
					self.encode_value(buf, item, depth + 1)?;
				}
			}
			Value::Object { type_name, identity, fields } => {
				if let Some(id) = identity {
					if let Some(&r) = self.object_refs.get(id) {
						write_field_header(buf, 0, WireType::Reference);
						write_uvarint(buf, r as u64);
						return Ok(());
					}
					let r = self.next_ref;
					self.next_ref += 1;
					self.object_refs.insert(*id, r);
				}
				write_field_header(buf, 0, WireType::TagDelimited);
				self.write_type_token(buf, type_name);

				let mut prev_id = 0u32;
				for (field_id, field_value) in fields {
					let delta = field_id.checked_sub(prev_id).unwrap_or(*field_id);
					self.encode_field(buf, delta, field_value, depth + 1)?;
					prev_id = *field_id;
				}
				write_field_header(buf, 0, WireType::EndObject);
			}
		}
		Ok(())
	}

	/// Like [`Self::encode_value`] but writes the caller-supplied delta id into the
	/// header instead of the placeholder `0` used for top-level/list/reference writes.
	///
	/// `encode_value` always starts with `write_field_header(_, 0, wire_type)`, and
	/// since `wire_type` is at most 7 that header is always exactly one byte
	/// (`(0 << 3) | wire_type < 128`), so the placeholder can simply be dropped and
	/// replaced rather than parsed back out.
	fn encode_field(&mut self, buf: &mut BytesMut, delta_id: u32, value: &Value, depth: usize) -> Result<(), CodecError> {
		let mut scratch = BytesMut::new();
		self.encode_value(&mut scratch, value, depth)?;
		let (_, wire_type) = read_field_header(&mut scratch.clone().freeze())?;
		write_field_header(buf, delta_id, wire_type);
		buf.put_slice(&scratch[1..]);
		Ok(())
	}

	fn write_type_token(&mut self, buf: &mut BytesMut, type_name: &str) {
		let (is_new, idx) = self.type_cache.intern_for_encode(type_name);
		if is_new {
			write_uvarint(buf, 0);
			write_uvarint(buf, type_name.len() as u64);
			buf.put_slice(type_name.as_bytes());
		} else {
			write_uvarint(buf, (idx + 1) as u64);
		}
	}
}

/// Decodes [`Value`] trees from bytes, maintaining the mirror type cache and the
/// mirror reference table (indexed by assignment order, matching the encoder).
#[derive(Debug, Default)]
pub struct Decoder {
	type_cache: TypeCache,
	refs_by_order: Vec<Value>,
	limits: Limits,
}

impl Decoder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_limits(limits: Limits) -> Self {
		Self { limits, ..Default::default() }
	}

	pub fn decode(&mut self, bytes: &Bytes) -> Result<Value, CodecError> {
		if bytes.len() > self.limits.max_message_bytes {
			return Err(CodecError::MessageTooLarge);
		}
		let mut buf = bytes.clone();
		self.decode_value(&mut buf, 0)
	}

	fn decode_value(&mut self, buf: &mut Bytes, depth: usize) -> Result<Value, CodecError> {
		if depth > self.limits.max_depth {
			return Err(CodecError::DepthExceeded);
		}
		let (_, wire_type) = read_field_header(buf)?;
		self.decode_value_body(buf, wire_type, depth)
	}

	fn decode_value_body(&mut self, buf: &mut Bytes, wire_type: WireType, depth: usize) -> Result<Value, CodecError> {
		match wire_type {
			WireType::VarInt => {
				if !buf.has_remaining() {
					return Err(CodecError::TruncatedFrame);
				}
				let subtype = buf.get_u8();
				let raw = read_uvarint(buf)?;
				Ok(match subtype {
					0 => Value::Bool(raw != 0),
					1 => Value::I32(zigzag_decode(raw) as i32),
					2 => Value::I64(zigzag_decode(raw)),
					3 => Value::U32(raw as u32),
					4 => Value::U64(raw),
					other => return Err(CodecError::Malformed(format!("unknown varint subtype {other}"))),
				})
			}
			WireType::Fixed => {
				if buf.remaining() < 1 {
					return Err(CodecError::TruncatedFrame);
				}
				let subtype = buf.get_u8();
				match subtype {
					0 => {
						if buf.remaining() < 4 {
							return Err(CodecError::TruncatedFrame);
						}
						Ok(Value::F32(buf.get_f32_le()))
					}
					1 => {
						if buf.remaining() < 8 {
							return Err(CodecError::TruncatedFrame);
						}
						Ok(Value::F64(buf.get_f64_le()))
					}
					other => Err(CodecError::Malformed(format!("unknown fixed subtype {other}"))),
				}
			}
			WireType::LengthPrefixed => {
				if buf.remaining() < 1 {
					return Err(CodecError::TruncatedFrame);
				}
				let subtype = buf.get_u8();
				let len = read_uvarint(buf)? as usize;
				match subtype {
					0 => {
						if len > self.limits.max_string_bytes {
							return Err(CodecError::StringTooLarge);
						}
						if buf.remaining() < len {
							return Err(CodecError::TruncatedFrame);
						}
						let bytes = buf.copy_to_bytes(len);
						let s = String::from_utf8(bytes.to_vec())
							.map_err(|e| CodecError::Malformed(e.to_string()))?;
						Ok(Value::String(s))
					}
					1 => {
						if len > self.limits.max_string_bytes {
							return Err(CodecError::StringTooLarge);
						}
						if buf.remaining() < len {
							return Err(CodecError::TruncatedFrame);
						}
						Ok(Value::Bytes(buf.copy_to_bytes(len)))
					}
					2 => {
						if len > self.limits.max_collection_len {
							return Err(CodecError::CollectionTooLarge);
						}
						let mut items = Vec::with_capacity(len.min(1024));
						for _ in 0..len {
							items.push(self.decode_value(buf, depth + 1)?);
						}
						Ok(Value::List(items))
					}
					other => Err(CodecError::Malformed(format!("unknown length-prefixed subtype {other}"))),
				}
			}
			WireType::Reference => {
				let r = read_uvarint(buf)? as u32;
				if r == NULL_REF {
					return Ok(Value::Null);
				}
				self.refs_by_order
					.get((r - 1) as usize)
					.cloned()
					.ok_or(CodecError::DanglingReference(r))
			}
			WireType::TagDelimited => {
				let type_name = self.read_type_token(buf)?.to_owned();
				let identity = Some(self.refs_by_order.len() as u64 + 1);
				let mut fields = Vec::new();
				let mut prev_id = 0u32;
				loop {
					let (delta_id, inner_wire_type) = read_field_header(buf)?;
					if inner_wire_type == WireType::EndObject {
						break;
					}
					let field_id = prev_id + delta_id;
					prev_id = field_id;
					let value = self.decode_value_body(buf, inner_wire_type, depth + 1)?;
					fields.push((field_id, value));
				}
				let obj = Value::Object { type_name, identity, fields };
				self.refs_by_order.push(obj.clone());
				Ok(obj)
			}
			WireType::EndObject => Err(CodecError::Malformed("unexpected end-object marker".into())),
		}
	}

	fn read_type_token(&mut self, buf: &mut Bytes) -> Result<&str, CodecError> {
		let token = read_uvarint(buf)?;
		if token == 0 {
			let len = read_uvarint(buf)? as usize;
			if buf.remaining() < len {
				return Err(CodecError::TruncatedFrame);
			}
			let bytes = buf.copy_to_bytes(len);
			let name = String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::Malformed(e.to_string()))?;
			let idx = self.type_cache.install_for_decode(name);
			self.type_cache.resolve(idx)
		} else {
			self.type_cache.resolve((token - 1) as u32)
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn roundtrip(v: &Value) -> Value {
		let mut enc = Encoder::new();
		let bytes = enc.encode(v).unwrap();
		let mut dec = Decoder::new();
		dec.decode(&bytes).unwrap()
	}

	#[test]
	fn test_roundtrip_primitives() {
		assert_eq!(roundtrip(&Value::Null), Value::Null);
		assert_eq!(roundtrip(&Value::Bool(true)), Value::Bool(true));
		assert_eq!(roundtrip(&Value::I32(-42)), Value::I32(-42));
		assert_eq!(roundtrip(&Value::I64(i64::MIN)), Value::I64(i64::MIN));
		assert_eq!(roundtrip(&Value::U64(u64::MAX)), Value::U64(u64::MAX));
		assert_eq!(roundtrip(&Value::F64(1.5)), Value::F64(1.5));
		assert_eq!(roundtrip(&Value::String("hello".into())), Value::String("hello".into()));
		assert_eq!(
			roundtrip(&Value::Bytes(Bytes::from_static(b"bytes"))),
			Value::Bytes(Bytes::from_static(b"bytes"))
		);
	}

	#[test]
	fn test_roundtrip_list() {
		let v = Value::List(vec![Value::I32(1), Value::I32(2), Value::I32(3)]);
		assert_eq!(roundtrip(&v), v);
	}

	#[test]
	fn test_roundtrip_object() {
		let v = Value::Object {
			type_name: "my.Type".into(),
			identity: None,
			fields: vec![(0, Value::I32(1)), (2, Value::String("x".into()))],
		};
		let result = roundtrip(&v);
		match result {
			Value::Object { type_name, fields, .. } => {
				assert_eq!(type_name, "my.Type");
				assert_eq!(fields, vec![(0, Value::I32(1)), (2, Value::String("x".into()))]);
			}
			other => panic!("expected object, got {other:?}"),
		}
	}

	#[test]
	fn test_unknown_field_is_skippable() {
		// Simulates a peer with a superset of fields: the extra field must not break
		// decoding of the fields the reader does know about.
		let v = Value::Object {
			type_name: "my.Type".into(),
			identity: None,
			fields: vec![(0, Value::I32(1)), (1, Value::String("extra".into())), (5, Value::Bool(true))],
		};
		let decoded = roundtrip(&v);
		let Value::Object { fields, .. } = decoded else { panic!("expected object") };
		assert_eq!(fields.len(), 3);
	}

	#[test]
	fn test_shared_reference_preserved() {
		let shared = Value::Object {
			type_name: "Shared".into(),
			identity: Some(1),
			fields: vec![(0, Value::I32(7))],
		};
		let container = Value::Object {
			type_name: "Container".into(),
			identity: None,
			fields: vec![(0, shared.clone()), (1, shared.clone())],
		};
		let mut enc = Encoder::new();
		let bytes = enc.encode(&container).unwrap();
		let mut dec = Decoder::new();
		let decoded = dec.decode(&bytes).unwrap();
		let Value::Object { fields, .. } = decoded else { panic!("expected object") };
		assert_eq!(fields[0].1, fields[1].1);
	}

	#[test]
	fn test_depth_exceeded() {
		let limits = Limits { max_depth: 2, ..Default::default() };
		let mut enc = Encoder::with_limits(limits);
		let deep = Value::List(vec![Value::List(vec![Value::List(vec![Value::I32(1)])])]);
		assert!(matches!(enc.encode(&deep), Err(CodecError::DepthExceeded)));
	}

	#[test]
	fn test_collection_too_large() {
		let limits = Limits { max_collection_len: 2, ..Default::default() };
		let mut enc = Encoder::with_limits(limits);
		let big = Value::List(vec![Value::I32(1), Value::I32(2), Value::I32(3)]);
		assert!(matches!(enc.encode(&big), Err(CodecError::CollectionTooLarge)));
	}

	#[test]
	fn test_truncated_frame() {
		let mut dec = Decoder::new();
		let short = Bytes::from_static(&[0x04, 0x01]); // VarInt header + subtype, no payload
		assert!(matches!(dec.decode(&short), Err(CodecError::TruncatedFrame)));
	}
}
