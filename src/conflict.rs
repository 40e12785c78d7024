//! Conflict siblings and the on-disk conflict log
//!
//! A concurrent edit never merges content: the remote version is preserved
//! next to the local file as `<stem>.conflict.<peerId>.<unix_seconds>[.<ext>]`
//! and the pair is recorded for the UI collaborator to present.

use crate::util::valid_peer_id;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

/// Sibling name for a conflicting remote version of `original`
///
/// `original` is the file name (not a path). Files without an extension get
/// no trailing extension either.
pub fn conflict_sibling_name(original: &str, peer_id: &str, unix_seconds: i64) -> String {
	match original.rsplit_once('.') {
		Some((stem, ext)) if !stem.is_empty() => {
			format!("{}.conflict.{}.{}.{}", stem, peer_id, unix_seconds, ext)
		}
		_ => format!("{}.conflict.{}.{}", original, peer_id, unix_seconds),
	}
}

/// Whether a file name is a conflict sibling
///
/// Siblings are never re-synced, so this check sits on the monitor's hot
/// path. The grammar is `<stem>.conflict.<peer>.<ts>[.<ext>]` with `peer`
/// base58 and `ts` decimal.
pub fn is_conflict_sibling(name: &str) -> bool {
	let tokens: Vec<&str> = name.split('.').collect();
	for i in 1..tokens.len() {
		if tokens[i] != "conflict" {
			continue;
		}
		if i + 2 >= tokens.len() {
			continue;
		}
		let peer_ok = valid_peer_id(tokens[i + 1]);
		let ts_ok =
			!tokens[i + 2].is_empty() && tokens[i + 2].chars().all(|c| c.is_ascii_digit());
		let tail_ok = tokens.len() == i + 3 || tokens.len() == i + 4;
		if peer_ok && ts_ok && tail_ok {
			return true;
		}
	}
	false
}

/// One unresolved conflict, persisted for UI presentation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
	/// Path of the file both sides edited
	pub path: String,

	/// Sibling file holding the remote version
	pub sibling: String,

	/// Peer whose version went into the sibling
	pub peer_id: String,

	pub local_hash: String,
	pub remote_hash: String,

	/// Unix seconds at which the conflict was materialized
	pub created_at: i64,
}

/// Append-only store under `conflicts/<syncId>.json`
pub struct ConflictLog {
	path: PathBuf,
}

impl ConflictLog {
	pub fn new(conflicts_dir: &Path, sync_id: &str) -> Self {
		ConflictLog { path: conflicts_dir.join(format!("{}.json", sync_id)) }
	}

	pub async fn load(&self) -> io::Result<Vec<ConflictRecord>> {
		match tokio::fs::read_to_string(&self.path).await {
			Ok(contents) => serde_json::from_str(&contents)
				.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
			Err(e) => Err(e),
		}
	}

	pub async fn append(&self, record: ConflictRecord) -> io::Result<()> {
		if let Some(parent) = self.path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		let mut records = self.load().await?;
		records.push(record);
		let json = serde_json::to_string_pretty(&records)
			.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
		crate::util::atomic_write(&self.path, json.as_bytes()).await
	}
}


// vim: ts=4
