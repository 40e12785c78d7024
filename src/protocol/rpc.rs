//! Request/response correlation over a framed stream
//!
//! One reader task and one writer task per connection. Outgoing requests
//! register a oneshot under their correlation id; the reader completes it
//! when the matching response arrives, and dispatches incoming requests to
//! the connection's [`RequestHandler`]. Transient failures retry with
//! exponential backoff.

use super::framing::{read_frame, write_frame, Envelope, FrameKind};
use super::messages::SyncMessage;
use crate::error::ProtocolError;
use crate::types::PeerId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};

/// Attempts per request before giving up
pub const REQUEST_ATTEMPTS: u32 = 3;

/// First backoff step; doubles per attempt (1 s, 2 s, 4 s)
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Serves requests arriving on a connection
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
	async fn handle(&self, peer_id: &PeerId, message: SyncMessage) -> SyncMessage;
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<SyncMessage>>>>;

/// Handle for issuing requests to one connected peer
#[derive(Clone)]
pub struct PeerHandle {
	peer_id: PeerId,
	out_tx: mpsc::Sender<Envelope>,
	pending: PendingMap,
	next_id: Arc<AtomicU64>,
}

impl PeerHandle {
	pub fn peer_id(&self) -> &PeerId {
		&self.peer_id
	}

	/// Send one request and await its response
	pub async fn request(
		&self,
		message: SyncMessage,
		timeout: Duration,
	) -> Result<SyncMessage, ProtocolError> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = oneshot::channel();
		self.pending.lock().await.insert(id, tx);

		if self.out_tx.send(Envelope::request(id, message)).await.is_err() {
			self.pending.lock().await.remove(&id);
			return Err(ProtocolError::Disconnected);
		}

		match tokio::time::timeout(timeout, rx).await {
			Ok(Ok(response)) => Ok(response),
			Ok(Err(_)) => Err(ProtocolError::Disconnected),
			Err(_) => {
				self.pending.lock().await.remove(&id);
				Err(ProtocolError::Timeout)
			}
		}
	}

	/// Send a request, retrying transient failures with backoff
	pub async fn request_with_retry(
		&self,
		message: SyncMessage,
		timeout: Duration,
	) -> Result<SyncMessage, ProtocolError> {
		let mut delay = BACKOFF_BASE;
		let mut attempt = 1;
		loop {
			match self.request(message.clone(), timeout).await {
				Ok(response) => return Ok(response),
				Err(e) if e.is_transient() && attempt < REQUEST_ATTEMPTS => {
					tracing::debug!(
						peer = %self.peer_id,
						attempt,
						"request {} failed transiently: {}",
						message.kind(),
						e
					);
					tokio::time::sleep(delay).await;
					delay *= 2;
					attempt += 1;
				}
				Err(e) => return Err(e),
			}
		}
	}
}

/// Spawn the reader/writer tasks for a connected stream
///
/// The returned handle stays valid until the peer disconnects; pending
/// requests then fail with `Disconnected`.
pub fn spawn_connection<S>(
	peer_id: PeerId,
	stream: S,
	handler: Arc<dyn RequestHandler>,
) -> PeerHandle
where
	S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
	let (mut read_half, mut write_half) = tokio::io::split(stream);
	let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(64);
	let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

	// Writer: serialize everything leaving this connection
	let writer_peer = peer_id.clone();
	tokio::spawn(async move {
		while let Some(envelope) = out_rx.recv().await {
			if let Err(e) = write_frame(&mut write_half, &envelope).await {
				tracing::debug!(peer = %writer_peer, "write side closed: {}", e);
				break;
			}
		}
	});

	// Reader: complete pending requests, dispatch incoming ones
	let reader_pending = Arc::clone(&pending);
	let reader_peer = peer_id.clone();
	let reader_out = out_tx.clone();
	tokio::spawn(async move {
		loop {
			let envelope = match read_frame(&mut read_half).await {
				Ok(envelope) => envelope,
				Err(ProtocolError::Disconnected) => break,
				Err(e) => {
					tracing::warn!(peer = %reader_peer, "read failed: {}", e);
					break;
				}
			};
			match envelope.kind {
				FrameKind::Response => {
					if let Some(tx) = reader_pending.lock().await.remove(&envelope.id) {
						let _ = tx.send(envelope.body);
					} else {
						tracing::debug!(
							peer = %reader_peer,
							id = envelope.id,
							"response with no pending request"
						);
					}
				}
				FrameKind::Request => {
					let handler = Arc::clone(&handler);
					let out = reader_out.clone();
					let peer = reader_peer.clone();
					let id = envelope.id;
					tokio::spawn(async move {
						let response = handler.handle(&peer, envelope.body).await;
						let _ = out.send(Envelope::response(id, response)).await;
					});
				}
			}
		}
		// Fail everything still in flight
		reader_pending.lock().await.clear();
	});

	PeerHandle { peer_id, out_tx, pending, next_id: Arc::new(AtomicU64::new(1)) }
}

#[cfg(test)]
mod test {
	use super::*;

	struct EchoHandler;

	#[async_trait]
	impl RequestHandler for EchoHandler {
		async fn handle(&self, _peer_id: &PeerId, message: SyncMessage) -> SyncMessage {
			match message {
				SyncMessage::GetChunk { hash } => {
					SyncMessage::ChunkBytes { hash, data: "ZGF0YQ==".to_string() }
				}
				_ => SyncMessage::Ack,
			}
		}
	}

	struct NeverHandler;

	#[async_trait]
	impl RequestHandler for NeverHandler {
		async fn handle(&self, _peer_id: &PeerId, _message: SyncMessage) -> SyncMessage {
			std::future::pending::<()>().await;
			SyncMessage::Ack
		}
	}

	#[tokio::test]
	async fn test_request_response_over_duplex() {
		let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
		let client =
			spawn_connection("server".to_string(), client_stream, Arc::new(EchoHandler));
		let _server =
			spawn_connection("client".to_string(), server_stream, Arc::new(EchoHandler));

		let response = client
			.request(
				SyncMessage::GetChunk { hash: "abc".to_string() },
				Duration::from_secs(5),
			)
			.await
			.unwrap();
		assert_eq!(
			response,
			SyncMessage::ChunkBytes { hash: "abc".to_string(), data: "ZGF0YQ==".to_string() }
		);
	}

	#[tokio::test]
	async fn test_concurrent_requests_correlate() {
		let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
		let client =
			spawn_connection("server".to_string(), client_stream, Arc::new(EchoHandler));
		let _server =
			spawn_connection("client".to_string(), server_stream, Arc::new(EchoHandler));

		let mut futs = Vec::new();
		for i in 0..10 {
			let client = client.clone();
			futs.push(tokio::spawn(async move {
				client
					.request(
						SyncMessage::GetChunk { hash: format!("h{}", i) },
						Duration::from_secs(5),
					)
					.await
			}));
		}
		for (i, fut) in futs.into_iter().enumerate() {
			match fut.await.unwrap().unwrap() {
				SyncMessage::ChunkBytes { hash, .. } => assert_eq!(hash, format!("h{}", i)),
				other => panic!("unexpected response {:?}", other),
			}
		}
	}

	#[tokio::test(start_paused = true)]
	async fn test_timeout() {
		let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
		let client =
			spawn_connection("server".to_string(), client_stream, Arc::new(EchoHandler));
		let _server =
			spawn_connection("client".to_string(), server_stream, Arc::new(NeverHandler));

		let result = client.request(SyncMessage::Ack, Duration::from_secs(1)).await;
		assert!(matches!(result, Err(ProtocolError::Timeout)));
	}

	#[tokio::test]
	async fn test_disconnect_fails_pending() {
		let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
		let client =
			spawn_connection("server".to_string(), client_stream, Arc::new(EchoHandler));
		drop(server_stream);

		let result = client.request(SyncMessage::Ack, Duration::from_secs(5)).await;
		assert!(matches!(
			result,
			Err(ProtocolError::Disconnected) | Err(ProtocolError::Timeout)
		));
	}
}

// vim: ts=4
