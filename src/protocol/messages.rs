//! Wire message types
//!
//! Every request/response body the engine exchanges with a peer. Messages are
//! JSON; binary payloads travel base64-encoded. The legacy `GetFiles`/`Files`
//! pair (metadata map plus clock-less deleted paths) is still produced and
//! accepted for older peers; `GetStates`/`States` supersedes it.

use crate::clock::VectorClock;
use crate::error::ProtocolError;
use crate::types::{ChunkRef, DeletionRecord, FileMetadata, FileState};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub fn encode_bytes(data: &[u8]) -> String {
	BASE64.encode(data)
}

pub fn decode_bytes(encoded: &str) -> Result<Vec<u8>, ProtocolError> {
	BASE64.decode(encoded).map_err(|e| ProtocolError::Malformed {
		message: format!("bad base64 payload: {}", e),
	})
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
	/// Identity exchange right after connect
	Hello { peer_id: String, sync_ids: Vec<String> },

	/// Full (or path-filtered) state map including tombstones
	GetStates {
		sync_id: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		paths: Option<Vec<String>>,
	},
	States { sync_id: String, states: BTreeMap<String, FileState> },

	/// MST root for the cheap "anything changed?" probe
	GetMst { sync_id: String },
	MstRoot { sync_id: String, root: Option<String> },

	/// Subtree refinement for large diffs
	GetSubtree { sync_id: String, prefix: String },
	SubtreeEntries { sync_id: String, entries: BTreeMap<String, String> },

	/// Fetch a file; `whole` forces whole-file transfer (chunk fallback)
	GetFile { sync_id: String, path: String, whole: bool },
	FileWhole { path: String, data: String, meta: FileMetadata },
	FileChunks { path: String, chunks: Vec<ChunkRef>, meta: FileMetadata },

	GetChunk { hash: String },
	ChunkBytes { hash: String, data: String },

	/// Push a file; either inline bytes or a chunk list
	PutFile {
		sync_id: String,
		path: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		data: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		chunks: Option<Vec<ChunkRef>>,
		meta: FileMetadata,
	},
	PutChunk { hash: String, data: String },

	/// Propagate a tombstone
	Delete { sync_id: String, path: String, record: DeletionRecord },

	/// Ask the peer to start a session towards us
	SyncRequest { sync_id: String },

	/// Legacy exchange: metadata map plus clock-less deleted paths
	GetFiles { sync_id: String },
	Files {
		sync_id: String,
		entries: BTreeMap<String, FileMetadata>,
		deleted_paths: Vec<String>,
	},

	Ack,
	Reject { reason: String },
	NotFound,
}

impl SyncMessage {
	/// Short name for logs and mismatch errors
	pub fn kind(&self) -> &'static str {
		match self {
			SyncMessage::Hello { .. } => "hello",
			SyncMessage::GetStates { .. } => "get_states",
			SyncMessage::States { .. } => "states",
			SyncMessage::GetMst { .. } => "get_mst",
			SyncMessage::MstRoot { .. } => "mst_root",
			SyncMessage::GetSubtree { .. } => "get_subtree",
			SyncMessage::SubtreeEntries { .. } => "subtree_entries",
			SyncMessage::GetFile { .. } => "get_file",
			SyncMessage::FileWhole { .. } => "file_whole",
			SyncMessage::FileChunks { .. } => "file_chunks",
			SyncMessage::GetChunk { .. } => "get_chunk",
			SyncMessage::ChunkBytes { .. } => "chunk_bytes",
			SyncMessage::PutFile { .. } => "put_file",
			SyncMessage::PutChunk { .. } => "put_chunk",
			SyncMessage::Delete { .. } => "delete",
			SyncMessage::SyncRequest { .. } => "sync_request",
			SyncMessage::GetFiles { .. } => "get_files",
			SyncMessage::Files { .. } => "files",
			SyncMessage::Ack => "ack",
			SyncMessage::Reject { .. } => "reject",
			SyncMessage::NotFound => "not_found",
		}
	}
}

/// Project a state map onto the legacy `Files` shape
pub fn states_to_files(
	states: &BTreeMap<String, FileState>,
) -> (BTreeMap<String, FileMetadata>, Vec<String>) {
	let mut entries = BTreeMap::new();
	let mut deleted_paths = Vec::new();
	for (path, state) in states {
		match state {
			FileState::Exists(meta) => {
				entries.insert(path.clone(), meta.clone());
			}
			FileState::Deleted(_) => deleted_paths.push(path.clone()),
		}
	}
	(entries, deleted_paths)
}

/// Lift a legacy `Files` answer into a state map
///
/// Legacy tombstones carry neither a clock nor a deletion time; they get an
/// empty clock and time zero, which routes them through the legacy decision
/// rows (any surviving local history wins, preserving data).
pub fn files_to_states(
	peer_id: &str,
	entries: BTreeMap<String, FileMetadata>,
	deleted_paths: Vec<String>,
) -> BTreeMap<String, FileState> {
	let mut states: BTreeMap<String, FileState> =
		entries.into_iter().map(|(p, m)| (p, FileState::Exists(m))).collect();
	for path in deleted_paths {
		states.entry(path).or_insert_with(|| {
			FileState::Deleted(DeletionRecord {
				deleted_at: 0,
				deleted_by: peer_id.to_string(),
				clock: VectorClock::new(),
			})
		});
	}
	states
}


// vim: ts=4
