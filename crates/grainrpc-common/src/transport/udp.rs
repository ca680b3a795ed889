use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ConnectionId, DeliveryClass, Event, TransportError};

const MAX_DATAGRAM: usize = 64 * 1024;

enum PeerSocket {
	/// Client side: one dedicated connected socket per peer.
	Owned(Arc<UdpSocket>),
	/// Server side: one shared listening socket, demultiplexed by peer address.
	Shared { socket: Arc<UdpSocket>, addr: SocketAddr },
}

struct Inner {
	peers: DashMap<ConnectionId, PeerSocket>,
	addr_to_id: DashMap<SocketAddr, ConnectionId>,
	next_id: AtomicU64,
	event_tx: mpsc::UnboundedSender<Event>,
}

/// UDP-backed implementation of the transport abstraction. Cloning shares the
/// underlying socket table; the background recv tasks outlive the clone that
/// spawned them for as long as any handle (or the task itself) is alive.
#[derive(Clone)]
pub struct UdpTransport {
	inner: Arc<Inner>,
}

impl UdpTransport {
	/// Creates an unbound transport. The caller keeps the returned receiver and
	/// drains it as the transport's single event consumer.
	pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
		let (event_tx, event_rx) = mpsc::unbounded_channel();
		let inner = Inner { peers: DashMap::new(), addr_to_id: DashMap::new(), next_id: AtomicU64::new(1), event_tx };
		(Self { inner: Arc::new(inner) }, event_rx)
	}

	fn allocate_id(&self) -> ConnectionId {
		ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
	}

	/// Server-side: binds one socket and demultiplexes inbound datagrams by sender
	/// address, emitting `PeerConnected` the first time an address is seen.
	pub async fn bind(&self, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
		let socket = UdpSocket::bind(addr).await.map_err(TransportError::Network)?;
		let local_addr = socket.local_addr().map_err(TransportError::Network)?;
		let socket = Arc::new(socket);

		let inner = self.inner.clone();
		let recv_socket = socket.clone();
		tokio::spawn(async move {
			let mut buf = vec![0u8; MAX_DATAGRAM];
			loop {
				let (len, from) = match recv_socket.recv_from(&mut buf).await {
					Ok(v) => v,
					Err(err) => {
						warn!(error = %err, "udp listener recv failed");
						let _ = inner.event_tx.send(Event::NetworkError(TransportError::Network(err)));
						continue;
					}
				};
				let cid = *inner.addr_to_id.entry(from).or_insert_with(|| {
					let id = ConnectionId(inner.next_id.fetch_add(1, Ordering::Relaxed));
					inner.peers.insert(id, PeerSocket::Shared { socket: recv_socket.clone(), addr: from });
					let _ = inner.event_tx.send(Event::PeerConnected(id));
					id
				});
				let payload = Bytes::copy_from_slice(&buf[..len]);
				if inner.event_tx.send(Event::DataReceived(cid, payload)).is_err() {
					debug!("event consumer dropped, stopping listener loop");
					break;
				}
			}
		});

		Ok(local_addr)
	}

	/// Client side: one dedicated socket per remote peer. The deadline guards the OS
	/// connect call only; liveness of the peer is established by the security
	/// handshake one layer up.
	pub async fn connect(&self, remote: SocketAddr, timeout: Duration) -> Result<ConnectionId, TransportError> {
		let local_bind = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
		let connect_fut = async {
			let socket = UdpSocket::bind(local_bind).await.map_err(TransportError::Network)?;
			socket.connect(remote).await.map_err(TransportError::Network)?;
			Ok::<_, TransportError>(socket)
		};
		let socket = tokio::time::timeout(timeout, connect_fut)
			.await
			.map_err(|_| TransportError::HandshakeTimeout)??;
		let socket = Arc::new(socket);

		let cid = self.allocate_id();
		self.inner.peers.insert(cid, PeerSocket::Owned(socket.clone()));
		self.inner.addr_to_id.insert(remote, cid);

		let inner = self.inner.clone();
		tokio::spawn(async move {
			let mut buf = vec![0u8; MAX_DATAGRAM];
			loop {
				let len = match socket.recv(&mut buf).await {
					Ok(len) => len,
					Err(err) => {
						let _ = inner.event_tx.send(Event::PeerClosed(cid, err.to_string()));
						break;
					}
				};
				let payload = Bytes::copy_from_slice(&buf[..len]);
				if inner.event_tx.send(Event::DataReceived(cid, payload)).is_err() {
					break;
				}
			}
		});

		Ok(cid)
	}

	/// `delivery` is accepted for interface parity with `DeliveryClass` but does not
	/// change behavior in this transport; see its doc comment.
	pub async fn send(&self, cid: ConnectionId, _delivery: DeliveryClass, bytes: Bytes) -> Result<(), TransportError> {
		let entry = self.inner.peers.get(&cid).ok_or(TransportError::PeerUnreachable)?;
		match &*entry {
			PeerSocket::Owned(socket) => {
				socket.send(&bytes).await.map_err(TransportError::SendFailed)?;
			}
			PeerSocket::Shared { socket, addr } => {
				socket.send_to(&bytes, addr).await.map_err(TransportError::SendFailed)?;
			}
		}
		Ok(())
	}

	pub fn close(&self, cid: ConnectionId) {
		if let Some((_, peer)) = self.inner.peers.remove(&cid) {
			if let PeerSocket::Shared { addr, .. } = peer {
				self.inner.addr_to_id.remove(&addr);
			}
		}
	}
}

impl Default for UdpTransport {
	fn default() -> Self {
		Self::new().0
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::net::Ipv4Addr;

	#[tokio::test]
	async fn test_send_recv_roundtrip() {
		let (server, mut server_rx) = UdpTransport::new();
		let server_addr = server.bind(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)).await.unwrap();

		let (client, mut client_rx) = UdpTransport::new();
		let cid = client.connect(server_addr, Duration::from_secs(1)).await.unwrap();
		client.send(cid, DeliveryClass::ReliableOrdered, Bytes::from_static(b"hello")).await.unwrap();

		let server_cid = loop {
			match server_rx.recv().await.unwrap() {
				Event::DataReceived(cid, bytes) => {
					assert_eq!(bytes, Bytes::from_static(b"hello"));
					break cid;
				}
				Event::PeerConnected(_) => continue,
				other => panic!("unexpected event: {other:?}"),
			}
		};

		server.send(server_cid, DeliveryClass::Unreliable, Bytes::from_static(b"world")).await.unwrap();
		match client_rx.recv().await.unwrap() {
			Event::DataReceived(_, bytes) => assert_eq!(bytes, Bytes::from_static(b"world")),
			other => panic!("unexpected event: {other:?}"),
		}
	}

	#[tokio::test]
	async fn test_send_to_unknown_connection_fails() {
		let (transport, _rx) = UdpTransport::new();
		let result = transport.send(ConnectionId(9999), DeliveryClass::Unreliable, Bytes::from_static(b"x")).await;
		assert!(matches!(result, Err(TransportError::PeerUnreachable)));
	}
}
