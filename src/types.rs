//! Core data types for MeshSync

use crate::clock::VectorClock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Peer identifier: base58 Ed25519 fingerprint, used verbatim as a map key
pub type PeerId = String;

/// Metadata of an existing file or directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
	/// Hex SHA-256 of the whole file; empty for directories
	pub hash: String,

	/// File size in bytes
	pub size: u64,

	/// Modification time, unix seconds
	pub mtime: i64,

	/// Creation time, unix seconds
	pub ctime: i64,

	/// Causal history; absent on records imported from legacy peers
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub clock: Option<VectorClock>,

	#[serde(default)]
	pub is_dir: bool,
}

/// Tombstone payload: an active claim that a path no longer exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionRecord {
	/// Deletion time, unix seconds
	pub deleted_at: i64,

	/// Peer that performed the deletion
	pub deleted_by: PeerId,

	/// Clock at the moment of deletion, post-increment
	pub clock: VectorClock,
}

/// Per-path replication state
///
/// Absence of an entry means "never observed on this device", which is
/// distinct from `Deleted`: a tombstone carries causal information and
/// propagates, silence does not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FileState {
	Exists(FileMetadata),
	Deleted(DeletionRecord),
}

impl FileState {
	pub fn is_exists(&self) -> bool {
		matches!(self, FileState::Exists(_))
	}

	pub fn is_deleted(&self) -> bool {
		matches!(self, FileState::Deleted(_))
	}

	/// The clock carried by this state, if any
	pub fn clock(&self) -> Option<&VectorClock> {
		match self {
			FileState::Exists(meta) => meta.clock.as_ref(),
			FileState::Deleted(rec) => Some(&rec.clock),
		}
	}

	pub fn as_exists(&self) -> Option<&FileMetadata> {
		match self {
			FileState::Exists(meta) => Some(meta),
			FileState::Deleted(_) => None,
		}
	}

	pub fn as_deleted(&self) -> Option<&DeletionRecord> {
		match self {
			FileState::Exists(_) => None,
			FileState::Deleted(rec) => Some(rec),
		}
	}
}

/// Reference to a chunk within a file: hash plus placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
	/// Hex SHA-256 of the chunk bytes
	pub hash: String,

	/// Byte offset in the source file
	pub offset: u64,

	/// Chunk length in bytes
	pub size: u32,
}

/// A chunk with its bytes, as produced by the chunker
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk {
	pub hash: String,
	pub offset: u64,
	pub data: Vec<u8>,
}

impl std::fmt::Debug for Chunk {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Chunk")
			.field("hash", &self.hash)
			.field("offset", &self.offset)
			.field("len", &self.data.len())
			.finish()
	}
}

impl Chunk {
	pub fn chunk_ref(&self) -> ChunkRef {
		ChunkRef { hash: self.hash.clone(), offset: self.offset, size: self.data.len() as u32 }
	}
}

/// Replication direction for a folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
	TwoWay,
	UploadOnly,
	DownloadOnly,
}

impl Default for SyncMode {
	fn default() -> Self {
		SyncMode::TwoWay
	}
}

/// One configured sync folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFolder {
	/// Shared identifier; peers with the same sync-id converge
	pub sync_id: String,

	/// Local absolute root path
	pub path: PathBuf,

	#[serde(default)]
	pub mode: SyncMode,

	/// Gitignore-style exclude patterns
	#[serde(default)]
	pub exclude: Vec<String>,
}

/// What the decision engine wants done for one path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
	/// Nothing to do
	Skip,

	/// Fetch the remote version
	Download,

	/// Push the local version
	Upload,

	/// Apply the remote tombstone locally
	DeleteLocal,

	/// Send the local tombstone to the peer
	DeleteRemote,

	/// Concurrent edits: preserve both sides
	Conflict,

	/// Remote tombstones must be fetched before deciding
	Uncertain,
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::clock::VectorClock;

	fn meta(hash: &str) -> FileMetadata {
		FileMetadata {
			hash: hash.to_string(),
			size: 6,
			mtime: 1_700_000_000,
			ctime: 1_700_000_000,
			clock: Some(VectorClock::from([("a", 1)])),
			is_dir: false,
		}
	}

	#[test]
	fn test_file_state_accessors() {
		let exists = FileState::Exists(meta("aa"));
		assert!(exists.is_exists());
		assert!(!exists.is_deleted());
		assert!(exists.as_exists().is_some());
		assert!(exists.clock().is_some());

		let deleted = FileState::Deleted(DeletionRecord {
			deleted_at: 1,
			deleted_by: "a".to_string(),
			clock: VectorClock::from([("a", 2)]),
		});
		assert!(deleted.is_deleted());
		assert!(deleted.as_deleted().is_some());
		assert_eq!(deleted.clock().unwrap().get("a"), 2);
	}

	#[test]
	fn test_file_state_serde_tagging() {
		let exists = FileState::Exists(meta("aa"));
		let json = serde_json::to_string(&exists).unwrap();
		assert!(json.contains("\"state\":\"exists\""));
		let back: FileState = serde_json::from_str(&json).unwrap();
		assert_eq!(exists, back);
	}

	#[test]
	fn test_legacy_metadata_without_clock() {
		// Old records carry no clock field at all
		let json = r#"{"state":"exists","hash":"ab","size":1,"mtime":5,"ctime":5}"#;
		let state: FileState = serde_json::from_str(json).unwrap();
		assert!(state.clock().is_none());
	}

	#[test]
	fn test_chunk_ref_conversion() {
		let chunk = Chunk { hash: "ff".to_string(), offset: 128, data: vec![0u8; 512] };
		let r = chunk.chunk_ref();
		assert_eq!(r.offset, 128);
		assert_eq!(r.size, 512);
		assert_eq!(r.hash, "ff");
	}

	#[test]
	fn test_sync_folder_defaults() {
		let json = r#"{"sync_id":"family-photos","path":"/data/photos"}"#;
		let folder: SyncFolder = serde_json::from_str(json).unwrap();
		assert_eq!(folder.mode, SyncMode::TwoWay);
		assert!(folder.exclude.is_empty());
	}
}

// vim: ts=4
