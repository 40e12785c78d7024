//! Frame encoding: 4-byte big-endian length prefix, JSON payload
//!
//! Each frame carries an envelope with a correlation id and a
//! request/response flag so concurrent RPCs can share one stream.

use super::messages::SyncMessage;
use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame; chunked transfer keeps payloads far below
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
	Request,
	Response,
}

/// One framed message with its correlation id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
	pub id: u64,
	pub kind: FrameKind,
	pub body: SyncMessage,
}

impl Envelope {
	pub fn request(id: u64, body: SyncMessage) -> Self {
		Envelope { id, kind: FrameKind::Request, body }
	}

	pub fn response(id: u64, body: SyncMessage) -> Self {
		Envelope { id, kind: FrameKind::Response, body }
	}
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
	writer: &mut W,
	envelope: &Envelope,
) -> Result<(), ProtocolError> {
	let payload = serde_json::to_vec(envelope).map_err(|e| ProtocolError::Malformed {
		message: format!("failed to serialize frame: {}", e),
	})?;
	if payload.len() > MAX_FRAME_BYTES {
		return Err(ProtocolError::FrameTooLarge { size: payload.len(), max: MAX_FRAME_BYTES });
	}
	writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
	writer.write_all(&payload).await?;
	writer.flush().await?;
	Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Envelope, ProtocolError> {
	let mut len_buf = [0u8; 4];
	match reader.read_exact(&mut len_buf).await {
		Ok(_) => {}
		Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
			return Err(ProtocolError::Disconnected);
		}
		Err(e) => return Err(e.into()),
	}
	let len = u32::from_be_bytes(len_buf) as usize;
	if len > MAX_FRAME_BYTES {
		return Err(ProtocolError::FrameTooLarge { size: len, max: MAX_FRAME_BYTES });
	}
	let mut payload = vec![0u8; len];
	reader.read_exact(&mut payload).await.map_err(|e| {
		if e.kind() == std::io::ErrorKind::UnexpectedEof {
			ProtocolError::Disconnected
		} else {
			ProtocolError::Io(e)
		}
	})?;
	serde_json::from_slice(&payload).map_err(|e| ProtocolError::Malformed {
		message: format!("failed to parse frame: {}", e),
	})
}


// vim: ts=4
