//! C4: request correlation, manifest exchange, and cancellation over one connection.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use grainrpc_common::codec::{CodecError, Decoder, Encoder, ToValue, Value};
use grainrpc_common::error::RpcError;
use grainrpc_common::rpc::{ControlKind, Frame, Manifest, RequestStatus};
use grainrpc_common::transport::DeliveryClass;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, warn};

/// The outcome of one RPC call as delivered to its caller.
pub type RpcResult = Result<Bytes, RpcError>;

struct PendingRequest {
	completion: oneshot::Sender<RpcResult>,
}

/// Sends frames through a caller-supplied closure so `RpcSession` stays agnostic of
/// the security layer sitting directly underneath it.
pub type FrameSender = Arc<dyn Fn(Frame) -> Result<(), RpcError> + Send + Sync>;

/// Multiplexes application method calls over one protected channel.
pub struct RpcSession {
	next_request_id: AtomicU32,
	pending: DashMap<u32, PendingRequest>,
	manifest: Mutex<Manifest>,
	manifest_notify: Notify,
	encoder: Mutex<Encoder>,
	decoder: Mutex<Decoder>,
	send_frame: FrameSender,
}

impl RpcSession {
	pub fn new(send_frame: FrameSender) -> Self {
		Self {
			next_request_id: AtomicU32::new(1),
			pending: DashMap::new(),
			manifest: Mutex::new(Manifest::default()),
			manifest_notify: Notify::new(),
			encoder: Mutex::new(Encoder::new()),
			decoder: Mutex::new(Decoder::new()),
			send_frame,
		}
	}

	/// Allocates the next requestId, skipping 0 and any id still pending.
	fn allocate_request_id(&self) -> u32 {
		loop {
			let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
			if id != 0 && !self.pending.contains_key(&id) {
				return id;
			}
		}
	}

	pub async fn install_manifest(&self, manifest: Manifest) {
		*self.manifest.lock().await = manifest;
		self.manifest_notify.notify_waiters();
	}

	pub async fn manifest_alias(&self, interface_name: &str, selector: &str) -> Option<String> {
		self.manifest.lock().await.alias_for(interface_name, selector).map(str::to_owned)
	}

	pub async fn has_manifest(&self) -> bool {
		!self.manifest.lock().await.is_empty()
	}

	/// Waits until a non-empty manifest is installed, or `timeout` elapses.
	/// Used by the connection-lifecycle manifest fetch.
	pub async fn wait_for_manifest(&self, timeout: Duration) -> bool {
		if self.has_manifest().await {
			return true;
		}
		let notified = self.manifest_notify.notified();
		tokio::select! {
			_ = notified => self.has_manifest().await,
			_ = tokio::time::sleep(timeout) => false,
		}
	}

	/// Sends a CONTROL frame outside the request/response correlation path (e.g. the
	/// MANIFEST_REQUEST or a teardown CLOSE).
	pub fn send_control(&self, kind: ControlKind) -> Result<(), RpcError> {
		(self.send_frame)(Frame::Control(kind))
	}

	pub fn send_manifest_request(&self) -> Result<(), RpcError> {
		(self.send_frame)(Frame::ManifestRequest)
	}

	/// Encodes `args` as the invokable payload's fields and issues a REQUEST frame,
	/// returning a future that resolves when the matching RESPONSE arrives or the
	/// deadline elapses.
	pub async fn call(
		&self,
		invokable_alias: String,
		grain_key: String,
		invokable_type_name: String,
		args: Vec<Value>,
		deadline: Duration,
	) -> RpcResult {
		let invokable = Value::Object {
			type_name: invokable_type_name,
			identity: None,
			fields: args.into_iter().enumerate().map(|(i, v)| (i as u32, v)).collect(),
		};
		let body = {
			let mut encoder = self.encoder.lock().await;
			encoder.encode(&invokable).map_err(RpcError::Codec)?
		};

		let request_id = self.allocate_request_id();
		let (tx, rx) = oneshot::channel();
		self.pending.insert(request_id, PendingRequest { completion: tx });

		let frame = Frame::Request {
			request_id,
			invokable_alias,
			grain_key,
			body,
			deadline_ms: deadline.as_millis() as u64,
			cancellable: true,
		};
		if let Err(err) = (self.send_frame)(frame) {
			self.pending.remove(&request_id);
			return Err(err);
		}

		match tokio::time::timeout(deadline, rx).await {
			Ok(Ok(result)) => result,
			Ok(Err(_)) => Err(RpcError::ConnectionClosed),
			Err(_) => {
				self.pending.remove(&request_id);
				let _ = (self.send_frame)(Frame::Cancel { request_id });
				Err(RpcError::Deadline)
			}
		}
	}

	pub async fn cancel(&self, request_id: u32) {
		let _ = (self.send_frame)(Frame::Cancel { request_id });
	}

	/// Dispatches one inbound application frame. Called from the connection task
	/// after the security layer has decrypted it.
	pub async fn handle_inbound(&self, frame: Frame) {
		match frame {
			Frame::Response { request_id, status, body } => {
				if let Some((_, pending)) = self.pending.remove(&request_id) {
					let result = match status {
						RequestStatus::Ok => Ok(body),
						RequestStatus::Error { code, msg } => Err(RpcError::Remote { code, msg }),
						RequestStatus::Cancelled => Err(RpcError::Cancelled),
					};
					let _ = pending.completion.send(result);
				} else {
					debug!(request_id, "response for unknown or already-completed request");
				}
			}
			Frame::ManifestReply(manifest) => {
				self.install_manifest(manifest).await;
			}
			other => warn!(?other, "unexpected frame delivered to RpcSession::handle_inbound"),
		}
	}

	/// Fails every outstanding request.
	pub fn fail_all_pending(&self) {
		let ids: Vec<u32> = self.pending.iter().map(|e| *e.key()).collect();
		for id in ids {
			if let Some((_, pending)) = self.pending.remove(&id) {
				let _ = pending.completion.send(Err(RpcError::ConnectionClosed));
			}
		}
	}

	pub async fn decode_response<T: grainrpc_common::codec::FromValue>(&self, body: &Bytes) -> Result<T, CodecError> {
		let mut decoder = self.decoder.lock().await;
		let value = decoder.decode(body)?;
		T::from_value(&value)
	}

	pub async fn encode_value(&self, value: &Value) -> Result<Bytes, CodecError> {
		let mut encoder = self.encoder.lock().await;
		encoder.encode(value)
	}

	/// Encodes one application frame through the session's type cache, the wire
	/// envelope sits one layer below the invocation payloads `call()` already encodes.
	pub async fn encode_frame(&self, frame: &Frame) -> Result<Bytes, CodecError> {
		self.encode_value(&frame.to_value()).await
	}

	pub async fn decode_frame(&self, body: &Bytes) -> Result<Frame, CodecError> {
		self.decode_response(body).await
	}
}

/// Sends outbound payload bytes through the transport using the delivery class the
/// caller's RPC semantics require: application calls always use
/// reliable-ordered delivery.
pub const APPLICATION_CALL_DELIVERY: DeliveryClass = DeliveryClass::ReliableOrdered;

#[cfg(test)]
mod test {
	use super::*;
	use std::sync::Mutex as StdMutex;

	fn noop_sender(sent: Arc<StdMutex<Vec<Frame>>>) -> FrameSender {
		Arc::new(move |frame: Frame| {
			sent.lock().unwrap().push(frame);
			Ok(())
		})
	}

	#[tokio::test]
	async fn test_allocate_request_id_skips_zero() {
		let sent = Arc::new(StdMutex::new(Vec::new()));
		let session = RpcSession::new(noop_sender(sent));
		let id = session.allocate_request_id();
		assert_ne!(id, 0);
	}

	#[tokio::test]
	async fn test_call_times_out_without_response() {
		let sent = Arc::new(StdMutex::new(Vec::new()));
		let session = RpcSession::new(noop_sender(sent.clone()));
		let result = session
			.call("alias".into(), "game".into(), "inv.Type".into(), vec![], Duration::from_millis(20))
			.await;
		assert!(matches!(result, Err(RpcError::Deadline)));
		// a CANCEL frame should have been emitted best-effort
		assert!(sent.lock().unwrap().iter().any(|f| matches!(f, Frame::Cancel { .. })));
	}

	#[tokio::test]
	async fn test_call_resolves_on_matching_response() {
		let sent = Arc::new(StdMutex::new(Vec::new()));
		let session = Arc::new(RpcSession::new(noop_sender(sent.clone())));
		let session_clone = session.clone();
		let call_fut = tokio::spawn(async move {
			session_clone
				.call("alias".into(), "game".into(), "inv.Type".into(), vec![], Duration::from_secs(5))
				.await
		});

		// Wait for the REQUEST frame to land, then reply.
		let request_id = loop {
			if let Some(Frame::Request { request_id, .. }) = sent.lock().unwrap().last() {
				break *request_id;
			}
			tokio::task::yield_now().await;
		};
		session.handle_inbound(Frame::Response { request_id, status: RequestStatus::Ok, body: Bytes::from_static(b"ok") }).await;

		let result = call_fut.await.unwrap();
		assert_eq!(result.unwrap(), Bytes::from_static(b"ok"));
	}

	#[tokio::test]
	async fn test_wait_for_manifest_resolves_once_installed() {
		let sent = Arc::new(StdMutex::new(Vec::new()));
		let session = Arc::new(RpcSession::new(noop_sender(sent)));
		let session_clone = session.clone();
		let wait_fut = tokio::spawn(async move { session_clone.wait_for_manifest(Duration::from_secs(5)).await });
		tokio::task::yield_now().await;
		session.install_manifest(Manifest {
			interfaces: vec![grainrpc_common::rpc::InterfaceManifest { type_name: "IGameGrain".into(), type_id: 1, methods: vec![] }],
		}).await;
		assert!(wait_fut.await.unwrap());
	}

	#[tokio::test]
	async fn test_wait_for_manifest_times_out() {
		let sent = Arc::new(StdMutex::new(Vec::new()));
		let session = RpcSession::new(noop_sender(sent));
		assert!(!session.wait_for_manifest(Duration::from_millis(20)).await);
	}

	#[tokio::test]
	async fn test_fail_all_pending_on_teardown() {
		let sent = Arc::new(StdMutex::new(Vec::new()));
		let session = Arc::new(RpcSession::new(noop_sender(sent)));
		let session_clone = session.clone();
		let call_fut = tokio::spawn(async move {
			session_clone
				.call("alias".into(), "game".into(), "inv.Type".into(), vec![], Duration::from_secs(5))
				.await
		});
		tokio::task::yield_now().await;
		session.fail_all_pending();
		let result = call_fut.await.unwrap();
		assert!(matches!(result, Err(RpcError::ConnectionClosed)));
	}
}
