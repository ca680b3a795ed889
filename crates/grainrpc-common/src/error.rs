//! The per-layer error taxonomy, as `thiserror` enums.

use thiserror::Error;

/// Errors from the directory bootstrap step. Not retryable
/// by the core; surfaced to the caller.
#[derive(Error, Debug)]
pub enum BootstrapError {
	#[error("directory unreachable: {0}")]
	DirectoryUnreachable(#[source] reqwest::Error),
	#[error("registration refused: {0}")]
	RegistrationRefused(String),
	#[error("session key was malformed: {0}")]
	MalformedSessionKey(String),
	#[error("directory request failed: {0}")]
	RequestFailed(String),
}

/// Transport-level failures.
#[derive(Error, Debug)]
pub enum TransportError {
	#[error("datagram send failed: {0}")]
	SendFailed(#[source] std::io::Error),
	#[error("peer unreachable")]
	PeerUnreachable,
	#[error("network error: {0}")]
	Network(#[source] std::io::Error),
	#[error("handshake timed out before transport connect completed")]
	HandshakeTimeout,
}

/// PSK security layer failures.
#[derive(Error, Debug)]
pub enum SecurityError {
	#[error("handshake timed out")]
	HandshakeTimeout,
	#[error("HMAC verification failed")]
	HmacMismatch,
	#[error("directory rejected the session key presented in HELLO")]
	SessionRejected,
	#[error("AEAD decryption failed")]
	DecryptionFailed,
	#[error("frame sequence number rejected by replay window")]
	ReplayRejected,
	#[error("too many consecutive decryption failures ({0}), tearing down connection")]
	TooManyFailures(u32),
	#[error("malformed security frame: {0}")]
	Malformed(String),
}

/// Malformed or unexpected protocol-level conditions. Always fatal to the
/// `Connection` they occur on.
#[derive(Error, Debug)]
pub enum ProtocolError {
	#[error("codec error: {0}")]
	Codec(#[from] crate::codec::CodecError),
	#[error("unknown frame type byte: {0:#x}")]
	UnknownFrameType(u8),
	#[error("manifest is missing expected interface: {0}")]
	ManifestMissingInterface(String),
	#[error("manifest reply contained zero interfaces")]
	ManifestEmpty,
	#[error("manifest could not be obtained after exhausting retries")]
	ManifestUnavailable,
}

/// Errors surfaced only to the invoking caller of a single RPC call.
#[derive(Error, Debug)]
pub enum RpcError {
	#[error("no method registered for this invocation")]
	UnknownMethod,
	#[error("call exceeded its deadline")]
	Deadline,
	#[error("call was cancelled")]
	Cancelled,
	#[error("remote returned an error (code {code}): {msg}")]
	Remote { code: i32, msg: String },
	#[error("connection closed before a response arrived")]
	ConnectionClosed,
	#[error("codec error while encoding or decoding arguments: {0}")]
	Codec(#[from] crate::codec::CodecError),
}

/// Zone-transition failures. Never fatal globally; the client
/// stays connected to the prior server and the controller retries on the next probe.
#[derive(Error, Debug)]
pub enum TransitionError {
	#[error("failed to probe the directory for the owning server: {0}")]
	ProbeFailed(#[source] eyre::Report),
	#[error("player is not currently owned by any server")]
	PlayerNotOwned,
	#[error("connecting to the target server failed: {0}")]
	ConnectFailed(#[source] ConnectError),
	#[error("ConnectPlayer was refused by the target server: {0}")]
	ConnectPlayerRefused(String),
	#[error("post-cutover probe RPC failed: {0}")]
	ProbeRpcFailed(#[source] RpcError),
}

/// Errors from the C6 connection-lifecycle bootstrap sequence.
#[derive(Error, Debug)]
pub enum ConnectError {
	#[error(transparent)]
	Bootstrap(#[from] BootstrapError),
	#[error("directory returned invalid server info: {0}")]
	InvalidServerInfo(String),
	#[error(transparent)]
	Network(#[from] TransportError),
	#[error("security handshake failed: {0}")]
	SecurityFailed(#[from] SecurityError),
	#[error(transparent)]
	Protocol(#[from] ProtocolError),
	#[error("probe call failed during startup: {0}")]
	ProbeFailed(#[source] RpcError),
}
