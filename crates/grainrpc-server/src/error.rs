use grainrpc_common::error::{BootstrapError, SecurityError, TransportError};
use thiserror::Error;

/// Failures from the server side of the PSK handshake responder. Always fatal to the connection attempt that produced them.
#[derive(Error, Debug)]
pub enum ServerHandshakeError {
	#[error(transparent)]
	Security(#[from] SecurityError),
	#[error(transparent)]
	Transport(#[from] TransportError),
	#[error("directory rejected HELLO: {0}")]
	Directory(#[from] BootstrapError),
	#[error("HELLO frame was malformed: {0}")]
	MalformedHello(String),
}
