//! C2: datagram transport abstraction with delivery-class hints.
//!
//! The teacher wraps a QUIC/WebTransport connection as a `Stream + Sink` of bytes
//! ([`crate::security`] docs explain why QUIC itself doesn't carry over). What does
//! carry over is the shape: a background task owns the socket, forwards inbound
//! datagrams through a channel, and upper layers never touch the socket directly.
//! `recv_next` is realized as "hold the receiving half of that channel" rather than
//! a polled method, since a plain `mpsc::UnboundedReceiver` already gives a single
//! consumer an async `.recv()`.

mod udp;

pub use udp::UdpTransport;

use bytes::Bytes;

pub use crate::error::TransportError;

/// A transport-local handle identifying one peer association. Opaque outside this
/// module; never sent on the wire.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// Delivery-class hints a sender attaches to each outbound payload.
/// The concrete transport in this crate treats these as hints only: retry and
/// ordering guarantees that matter to the protocol are enforced one layer up, by the
/// handshake's own retries, the manifest fetch's bounded retry, and
/// the RPC session's deadline/cancel machinery.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeliveryClass {
	ReliableOrdered,
	ReliableUnordered,
	Unreliable,
	UnreliableSequenced,
}

/// Events a transport publishes to its single consumer.
#[derive(Debug)]
pub enum Event {
	DataReceived(ConnectionId, Bytes),
	PeerConnected(ConnectionId),
	PeerClosed(ConnectionId, String),
	NetworkError(TransportError),
}
