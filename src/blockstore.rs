//! Content-addressed block store
//!
//! Chunks live under `blocks/<aa>/<rest-of-hash>` keyed by their hex SHA-256,
//! so identical chunks across files share one on-disk copy. The store is
//! append-only: blocks are added, verified, and read, never mutated.

use crate::error::ChunkError;
use crate::util::{sha256_hex, valid_hash};
use std::path::{Path, PathBuf};

pub struct BlockStore {
	root: PathBuf,
}

impl BlockStore {
	/// Open a block store rooted at `root`, creating the directory if needed
	pub async fn open(root: &Path) -> Result<Self, ChunkError> {
		tokio::fs::create_dir_all(root)
			.await
			.map_err(|e| ChunkError::WriteFailed { source: e })?;
		Ok(BlockStore { root: root.to_path_buf() })
	}

	/// Two-level hex fan-out path for a hash
	fn block_path(&self, hash: &str) -> Result<PathBuf, ChunkError> {
		if !valid_hash(hash) {
			return Err(ChunkError::InvalidHash { hash: hash.to_string() });
		}
		Ok(self.root.join(&hash[..2]).join(&hash[2..]))
	}

	/// Store a chunk; idempotent for an already-present hash
	///
	/// The bytes are verified against the hash before anything touches disk,
	/// and a duplicate put re-verifies the stored copy before becoming a
	/// no-op.
	pub async fn put(&self, hash: &str, data: &[u8]) -> Result<(), ChunkError> {
		let actual = sha256_hex(data);
		if actual != hash {
			return Err(ChunkError::HashMismatch { expected: hash.to_string(), actual });
		}
		let path = self.block_path(hash)?;
		if let Ok(existing) = tokio::fs::read(&path).await {
			let stored = sha256_hex(&existing);
			if stored == hash {
				return Ok(());
			}
			// A corrupted block is replaced by the verified bytes below
			tracing::warn!(hash, "replacing corrupted block");
		}
		let parent = path.parent().unwrap_or(&self.root).to_path_buf();
		tokio::fs::create_dir_all(&parent)
			.await
			.map_err(|e| ChunkError::WriteFailed { source: e })?;
		crate::util::atomic_write(&path, data)
			.await
			.map_err(|e| ChunkError::WriteFailed { source: e })?;
		Ok(())
	}

	/// Fetch a chunk, verifying its bytes; `Ok(None)` when absent
	pub async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>, ChunkError> {
		let path = self.block_path(hash)?;
		let data = match tokio::fs::read(&path).await {
			Ok(data) => data,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(ChunkError::ReadFailed { source: e }),
		};
		let actual = sha256_hex(&data);
		if actual != hash {
			return Err(ChunkError::HashMismatch { expected: hash.to_string(), actual });
		}
		Ok(Some(data))
	}

	pub async fn exists(&self, hash: &str) -> bool {
		match self.block_path(hash) {
			Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
			Err(_) => false,
		}
	}

	/// Of the given hashes, the ones this store does not hold
	pub async fn missing(&self, hashes: &[String]) -> Vec<String> {
		let mut out = Vec::new();
		for hash in hashes {
			if !self.exists(hash).await {
				out.push(hash.clone());
			}
		}
		out
	}
}


// vim: ts=4
