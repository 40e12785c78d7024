//! Scan cache for incremental folder hashing
//!
//! Hashing every file on every scan would dominate large folders, so the
//! scanner remembers (size, mtime) → hash per path and only re-hashes when
//! either changed. Backed by a redb database under the app data directory.

use redb::{ReadableDatabase, TableDefinition};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::path::Path;

/// Cached digest for one path
/// Key: sync-root-relative path; value: serialized entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
	pub size: u64,
	pub mtime: i64,
	pub hash: String,
}

const FILES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("files");

pub struct ScanCache {
	db: redb::Database,
}

impl ScanCache {
	/// Open or create the cache database
	pub fn open(db_path: &Path) -> Result<Self, Box<dyn Error + Send + Sync>> {
		if let Some(parent) = db_path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let db = redb::Database::create(db_path)?;
		{
			let write_txn = db.begin_write()?;
			let _ = write_txn.open_table(FILES_TABLE)?;
			write_txn.commit()?;
		}
		Ok(ScanCache { db })
	}

	/// Cached hash for a path, only when size and mtime still match
	pub fn get_hash(
		&self,
		rel_path: &str,
		size: u64,
		mtime: i64,
	) -> Result<Option<String>, Box<dyn Error + Send + Sync>> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(FILES_TABLE)?;
		match table.get(rel_path)? {
			Some(raw) => {
				let entry: CacheEntry = serde_json::from_slice(raw.value())?;
				if entry.size == size && entry.mtime == mtime {
					Ok(Some(entry.hash))
				} else {
					Ok(None)
				}
			}
			None => Ok(None),
		}
	}

	/// Store or refresh the digest for a path
	pub fn set(
		&self,
		rel_path: &str,
		entry: CacheEntry,
	) -> Result<(), Box<dyn Error + Send + Sync>> {
		let bytes = serde_json::to_vec(&entry)?;
		let write_txn = self.db.begin_write()?;
		{
			let mut table = write_txn.open_table(FILES_TABLE)?;
			table.insert(rel_path, bytes.as_slice())?;
		}
		write_txn.commit()?;
		Ok(())
	}

	/// Forget a path (after local delete)
	pub fn forget(&self, rel_path: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
		let write_txn = self.db.begin_write()?;
		{
			let mut table = write_txn.open_table(FILES_TABLE)?;
			table.remove(rel_path)?;
		}
		write_txn.commit()?;
		Ok(())
	}
}


// vim: ts=4
