//! Plain TCP transport adapter
//!
//! Discovery and authentication belong to outer collaborators; this adapter
//! is the minimal stand-in that lets two engines converge over a socket. The
//! identity handshake is a single Hello exchange on the raw stream before
//! the RPC tasks take over.

use crate::engine::SyncEngine;
use crate::error::{ProtocolError, SyncError};
use crate::protocol::framing::{read_frame, write_frame, Envelope, FrameKind};
use crate::protocol::messages::SyncMessage;
use crate::protocol::rpc::{spawn_connection, PeerHandle};
use crate::util::valid_peer_id;
use tokio::net::{TcpListener, TcpStream};

/// Dial a peer, handshake, and register the connection with the engine
pub async fn connect(engine: &SyncEngine, addr: &str) -> Result<PeerHandle, SyncError> {
	let mut stream = TcpStream::connect(addr).await.map_err(ProtocolError::Io)?;

	let sync_ids = engine.folder_ids().await;
	write_frame(
		&mut stream,
		&Envelope::request(
			0,
			SyncMessage::Hello { peer_id: engine.self_id().clone(), sync_ids },
		),
	)
	.await?;
	let response = read_frame(&mut stream).await?;
	let (their_id, their_sync_ids) = match response.body {
		SyncMessage::Hello { peer_id, sync_ids } if response.kind == FrameKind::Response => {
			(peer_id, sync_ids)
		}
		other => {
			return Err(SyncError::Protocol(ProtocolError::UnexpectedResponse {
				expected: "hello",
				got: other.kind().to_string(),
			}));
		}
	};
	finish(engine, stream, their_id, their_sync_ids, Some(addr)).await
}

/// Accept loop; runs until the listener fails
pub async fn listen(engine: SyncEngine, bind: String) -> Result<(), SyncError> {
	let listener = TcpListener::bind(&bind).await.map_err(ProtocolError::Io)?;
	tracing::info!(bind = %bind, "listening for peers");
	loop {
		let (stream, remote) = listener.accept().await.map_err(ProtocolError::Io)?;
		let engine = engine.clone();
		tokio::spawn(async move {
			if let Err(e) = accept_one(&engine, stream).await {
				tracing::warn!(remote = %remote, "incoming connection failed: {}", e);
			}
		});
	}
}

async fn accept_one(engine: &SyncEngine, mut stream: TcpStream) -> Result<PeerHandle, SyncError> {
	let request = read_frame(&mut stream).await?;
	let (their_id, their_sync_ids) = match request.body {
		SyncMessage::Hello { peer_id, sync_ids } if request.kind == FrameKind::Request => {
			(peer_id, sync_ids)
		}
		other => {
			return Err(SyncError::Protocol(ProtocolError::Malformed {
				message: format!("expected hello, got {}", other.kind()),
			}));
		}
	};
	write_frame(
		&mut stream,
		&Envelope::response(
			request.id,
			SyncMessage::Hello {
				peer_id: engine.self_id().clone(),
				sync_ids: engine.folder_ids().await,
			},
		),
	)
	.await?;
	finish(engine, stream, their_id, their_sync_ids, None).await
}

async fn finish(
	engine: &SyncEngine,
	stream: TcpStream,
	their_id: String,
	their_sync_ids: Vec<String>,
	addr: Option<&str>,
) -> Result<PeerHandle, SyncError> {
	if !valid_peer_id(&their_id) {
		return Err(SyncError::Protocol(ProtocolError::Malformed {
			message: format!("invalid peer-id '{}'", their_id),
		}));
	}
	if &their_id == engine.self_id() {
		return Err(SyncError::Other { message: "connected to self".to_string() });
	}
	tracing::info!(peer = %their_id, ?addr, "peer connected");
	let handle = spawn_connection(their_id, stream, engine.handler());
	engine.register_peer(handle.clone(), their_sync_ids).await;
	Ok(handle)
}

// vim: ts=4
