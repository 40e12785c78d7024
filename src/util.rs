//! Utility functions for MeshSync
//!
//! Hashing helpers, time helpers and identifier validation shared by the
//! rest of the crate.

use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncReadExt;

/// Read granularity for file hashing (keeps large reads off the executor)
const HASH_READ_BUF: usize = 256 * 1024;

/// Hash a buffer with SHA-256 and return lowercase hex
pub fn sha256_hex(buf: &[u8]) -> String {
	let mut hasher = Sha256::new();
	hasher.update(buf);
	hex::encode(hasher.finalize())
}

/// Hash a file with SHA-256, reading in bounded slices
pub async fn sha256_file(path: &Path) -> io::Result<String> {
	let mut file = tokio::fs::File::open(path).await?;
	let mut hasher = Sha256::new();
	let mut buf = vec![0u8; HASH_READ_BUF];
	loop {
		let n = file.read(&mut buf).await?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
	}
	Ok(hex::encode(hasher.finalize()))
}

/// Current time as unix seconds
pub fn now_unix() -> i64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// Check a sync-id: ASCII, 8-64 chars, alphanumeric plus `-` and `_`
pub fn valid_sync_id(id: &str) -> bool {
	(8..=64).contains(&id.len())
		&& id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Check a peer-id: non-empty base58 (Bitcoin alphabet, no 0/O/I/l)
pub fn valid_peer_id(id: &str) -> bool {
	!id.is_empty()
		&& id.chars().all(|c| {
			c.is_ascii_alphanumeric() && c != '0' && c != 'O' && c != 'I' && c != 'l'
		})
}

/// Check a content hash: 64 lowercase hex characters
pub fn valid_hash(hash: &str) -> bool {
	hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// Write a file atomically: temp file in the same directory, fsync, rename
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
	let dir = path.parent().unwrap_or(Path::new("."));
	let tmp = dir.join(format!(
		".{}.msync-tmp",
		path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
	));
	let mut file = tokio::fs::File::create(&tmp).await?;
	tokio::io::AsyncWriteExt::write_all(&mut file, bytes).await?;
	file.sync_all().await?;
	drop(file);
	match tokio::fs::rename(&tmp, path).await {
		Ok(()) => Ok(()),
		Err(e) => {
			let _ = tokio::fs::remove_file(&tmp).await;
			Err(e)
		}
	}
}


// vim: ts=4
