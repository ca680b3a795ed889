//! The application frames exchanged above the security layer.
//!
//! Each frame is carried as one C1 `Value::Object`, encoded/decoded through the
//! same [`crate::codec::Encoder`]/[`crate::codec::Decoder`] the connection already
//! holds for its session-scoped type cache, rather than a second ad hoc format.

use bytes::Bytes;

use crate::codec::{CodecError, FromValue, ToValue, Value};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RequestStatus {
	Ok,
	Error { code: i32, msg: String },
	Cancelled,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ControlKind {
	Ping,
	Pong,
	Close(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
	ManifestRequest,
	ManifestReply(super::manifest::Manifest),
	Request {
		request_id: u32,
		invokable_alias: String,
		grain_key: String,
		body: Bytes,
		deadline_ms: u64,
		cancellable: bool,
	},
	Response {
		request_id: u32,
		status: RequestStatus,
		body: Bytes,
	},
	Cancel {
		request_id: u32,
	},
	Control(ControlKind),
}

impl Frame {
	fn type_name(&self) -> &'static str {
		match self {
			Frame::ManifestRequest => "rpc.ManifestRequest",
			Frame::ManifestReply(_) => "rpc.ManifestReply",
			Frame::Request { .. } => "rpc.Request",
			Frame::Response { .. } => "rpc.Response",
			Frame::Cancel { .. } => "rpc.Cancel",
			Frame::Control(_) => "rpc.Control",
		}
	}
}

impl ToValue for Frame {
	fn to_value(&self) -> Value {
		let fields = match self {
			Frame::ManifestRequest => vec![],
			Frame::ManifestReply(manifest) => vec![(0, manifest.to_value())],
			Frame::Request { request_id, invokable_alias, grain_key, body, deadline_ms, cancellable } => vec![
				(0, Value::U32(*request_id)),
				(1, Value::String(invokable_alias.clone())),
				(2, Value::String(grain_key.clone())),
				(3, Value::Bytes(body.clone())),
				(4, Value::U64(*deadline_ms)),
				(5, Value::Bool(*cancellable)),
			],
			Frame::Response { request_id, status, body } => vec![
				(0, Value::U32(*request_id)),
				(1, status.to_value()),
				(2, Value::Bytes(body.clone())),
			],
			Frame::Cancel { request_id } => vec![(0, Value::U32(*request_id))],
			Frame::Control(kind) => vec![(0, kind.to_value())],
		};
		Value::Object { type_name: self.type_name().to_owned(), identity: None, fields }
	}
}

impl FromValue for Frame {
	fn from_value(value: &Value) -> Result<Self, CodecError> {
		let Value::Object { type_name, fields, .. } = value else {
			return Err(CodecError::TypeMismatch { expected: "Object", found: "other" });
		};
		let field = |id: u32| fields.iter().find(|(fid, _)| *fid == id).map(|(_, v)| v);
		let require = |id: u32| field(id).ok_or_else(|| CodecError::Malformed(format!("missing field {id}")));

		match type_name.as_str() {
			"rpc.ManifestRequest" => Ok(Frame::ManifestRequest),
			"rpc.ManifestReply" => Ok(Frame::ManifestReply(super::manifest::Manifest::from_value(require(0)?)?)),
			"rpc.Request" => Ok(Frame::Request {
				request_id: u32::from_value(require(0)?)?,
				invokable_alias: String::from_value(require(1)?)?,
				grain_key: String::from_value(require(2)?)?,
				body: Bytes::from_value(require(3)?)?,
				deadline_ms: u64::from_value(require(4)?)?,
				cancellable: bool::from_value(require(5)?)?,
			}),
			"rpc.Response" => Ok(Frame::Response {
				request_id: u32::from_value(require(0)?)?,
				status: RequestStatus::from_value(require(1)?)?,
				body: Bytes::from_value(require(2)?)?,
			}),
			"rpc.Cancel" => Ok(Frame::Cancel { request_id: u32::from_value(require(0)?)? }),
			"rpc.Control" => Ok(Frame::Control(ControlKind::from_value(require(0)?)?)),
			other => Err(CodecError::UnknownType(other.to_owned())),
		}
	}
}

impl ToValue for RequestStatus {
	fn to_value(&self) -> Value {
		let (type_name, fields) = match self {
			RequestStatus::Ok => ("rpc.status.Ok", vec![]),
			RequestStatus::Error { code, msg } => ("rpc.status.Error", vec![(0, Value::I32(*code)), (1, Value::String(msg.clone()))]),
			RequestStatus::Cancelled => ("rpc.status.Cancelled", vec![]),
		};
		Value::Object { type_name: type_name.to_owned(), identity: None, fields }
	}
}

impl FromValue for RequestStatus {
	fn from_value(value: &Value) -> Result<Self, CodecError> {
		let Value::Object { type_name, fields, .. } = value else {
			return Err(CodecError::TypeMismatch { expected: "Object", found: "other" });
		};
		match type_name.as_str() {
			"rpc.status.Ok" => Ok(RequestStatus::Ok),
			"rpc.status.Error" => {
				let code = fields.iter().find(|(id, _)| *id == 0).map(|(_, v)| v).ok_or_else(|| CodecError::Malformed("missing code".into()))?;
				let msg = fields.iter().find(|(id, _)| *id == 1).map(|(_, v)| v).ok_or_else(|| CodecError::Malformed("missing msg".into()))?;
				Ok(RequestStatus::Error { code: i32::from_value(code)?, msg: String::from_value(msg)? })
			}
			"rpc.status.Cancelled" => Ok(RequestStatus::Cancelled),
			other => Err(CodecError::UnknownType(other.to_owned())),
		}
	}
}

impl ToValue for ControlKind {
	fn to_value(&self) -> Value {
		let (type_name, fields) = match self {
			ControlKind::Ping => ("rpc.control.Ping", vec![]),
			ControlKind::Pong => ("rpc.control.Pong", vec![]),
			ControlKind::Close(reason) => ("rpc.control.Close", vec![(0, Value::String(reason.clone()))]),
		};
		Value::Object { type_name: type_name.to_owned(), identity: None, fields }
	}
}

impl FromValue for ControlKind {
	fn from_value(value: &Value) -> Result<Self, CodecError> {
		let Value::Object { type_name, fields, .. } = value else {
			return Err(CodecError::TypeMismatch { expected: "Object", found: "other" });
		};
		match type_name.as_str() {
			"rpc.control.Ping" => Ok(ControlKind::Ping),
			"rpc.control.Pong" => Ok(ControlKind::Pong),
			"rpc.control.Close" => {
				let reason = fields.iter().find(|(id, _)| *id == 0).map(|(_, v)| v).ok_or_else(|| CodecError::Malformed("missing reason".into()))?;
				Ok(ControlKind::Close(String::from_value(reason)?))
			}
			other => Err(CodecError::UnknownType(other.to_owned())),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::codec::{Decoder, Encoder};

	fn roundtrip(frame: &Frame) -> Frame {
		let mut enc = Encoder::new();
		let bytes = enc.encode(&frame.to_value()).unwrap();
		let mut dec = Decoder::new();
		let value = dec.decode(&bytes).unwrap();
		Frame::from_value(&value).unwrap()
	}

	#[test]
	fn test_request_roundtrip() {
		let frame = Frame::Request {
			request_id: 7,
			invokable_alias: "inv/GrainReference/IGame/deadbeef".into(),
			grain_key: "game".into(),
			body: Bytes::from_static(b"args"),
			deadline_ms: 5000,
			cancellable: true,
		};
		assert_eq!(roundtrip(&frame), frame);
	}

	#[test]
	fn test_response_error_roundtrip() {
		let frame = Frame::Response {
			request_id: 7,
			status: RequestStatus::Error { code: 42, msg: "boom".into() },
			body: Bytes::new(),
		};
		assert_eq!(roundtrip(&frame), frame);
	}

	#[test]
	fn test_control_close_roundtrip() {
		let frame = Frame::Control(ControlKind::Close("bye".into()));
		assert_eq!(roundtrip(&frame), frame);
	}

	#[test]
	fn test_manifest_request_roundtrip() {
		assert_eq!(roundtrip(&Frame::ManifestRequest), Frame::ManifestRequest);
	}
}
