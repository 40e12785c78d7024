//! Folder scanning and hashing
//!
//! Produces the filesystem's view of a sync folder: relative path →
//! (size, mtime, hash). Used at startup to reconcile the store with whatever
//! changed while the engine was down, and for folder statistics. Hashing runs
//! with bounded concurrency and yields between batches so a large folder
//! never monopolizes the pool.

use crate::cache::{CacheEntry, ScanCache};
use crate::error::SyncError;
use crate::exclusion::ExclusionEngine;
use crate::util::sha256_file;
use futures::future;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::sync::Semaphore;

/// Concurrent file hashings during a scan
const HASH_CONCURRENCY: usize = 4;

/// Files per batch between cooperative yields
const YIELD_BATCH: usize = 50;

/// One scanned filesystem entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
	pub size: u64,
	pub mtime: i64,
	pub ctime: i64,
	pub is_dir: bool,
	/// Hex SHA-256; empty for directories
	pub hash: String,
}

/// Aggregate folder statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderStats {
	pub files: usize,
	pub dirs: usize,
	pub bytes: u64,
}

fn system_time_unix(t: std::io::Result<std::time::SystemTime>) -> i64 {
	t.ok()
		.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
		.map(|d| d.as_secs() as i64)
		.unwrap_or(0)
}

pub struct FolderScanner {
	root: PathBuf,
	exclusion: Arc<ExclusionEngine>,
	cache: Option<Arc<ScanCache>>,
}

impl FolderScanner {
	pub fn new(
		root: &Path,
		exclusion: Arc<ExclusionEngine>,
		cache: Option<Arc<ScanCache>>,
	) -> Self {
		FolderScanner { root: root.to_path_buf(), exclusion, cache }
	}

	/// Walk the folder, returning (relative path, stat) for everything that
	/// survives exclusion. Symlinks are not followed.
	async fn list(&self) -> Result<Vec<(String, std::fs::Metadata)>, SyncError> {
		let mut out = Vec::new();
		let mut stack: Vec<(PathBuf, String)> = vec![(self.root.clone(), String::new())];

		while let Some((dir, rel_prefix)) = stack.pop() {
			let mut entries = tokio::fs::read_dir(&dir).await?;
			while let Some(entry) = entries.next_entry().await? {
				let name = entry.file_name().to_string_lossy().to_string();
				let rel = if rel_prefix.is_empty() {
					name.clone()
				} else {
					format!("{}/{}", rel_prefix, name)
				};
				let meta = entry.metadata().await?;
				if meta.is_symlink() {
					continue;
				}
				if self.exclusion.is_excluded(&rel, meta.is_dir()) {
					continue;
				}
				if meta.is_dir() {
					stack.push((entry.path(), rel.clone()));
				}
				out.push((rel, meta));
			}
		}
		Ok(out)
	}

	/// Full scan with hashing
	pub async fn scan(&self) -> Result<BTreeMap<String, ScannedFile>, SyncError> {
		let listing = self.list().await?;
		let semaphore = Arc::new(Semaphore::new(HASH_CONCURRENCY));
		let mut out = BTreeMap::new();

		for batch in listing.chunks(YIELD_BATCH) {
			let futs = batch.iter().map(|(rel, meta)| {
				let semaphore = Arc::clone(&semaphore);
				let root = self.root.clone();
				let cache = self.cache.clone();
				async move {
					let size = meta.len();
					let mtime = system_time_unix(meta.modified());
					let ctime = system_time_unix(meta.created());
					if meta.is_dir() {
						return Ok::<_, SyncError>((
							rel.clone(),
							ScannedFile { size: 0, mtime, ctime, is_dir: true, hash: String::new() },
						));
					}
					if let Some(cache) = &cache {
						if let Ok(Some(hash)) = cache.get_hash(rel, size, mtime) {
							return Ok((
								rel.clone(),
								ScannedFile { size, mtime, ctime, is_dir: false, hash },
							));
						}
					}
					let _permit = semaphore.acquire().await.map_err(|_| SyncError::Other {
						message: "scan semaphore closed".to_string(),
					})?;
					let abs = root.join(rel.replace('/', std::path::MAIN_SEPARATOR_STR));
					let hash = sha256_file(&abs).await?;
					if let Some(cache) = &cache {
						if let Err(e) =
							cache.set(rel, CacheEntry { size, mtime, hash: hash.clone() })
						{
							tracing::debug!(path = %rel, "scan cache write failed: {}", e);
						}
					}
					Ok((rel.clone(), ScannedFile { size, mtime, ctime, is_dir: false, hash }))
				}
			});
			for result in future::join_all(futs).await {
				let (rel, scanned) = result?;
				out.insert(rel, scanned);
			}
			tokio::task::yield_now().await;
		}
		Ok(out)
	}

	/// Statistics without any hashing
	pub async fn stats(&self) -> Result<FolderStats, SyncError> {
		let mut stats = FolderStats::default();
		for (_, meta) in self.list().await? {
			if meta.is_dir() {
				stats.dirs += 1;
			} else {
				stats.files += 1;
				stats.bytes += meta.len();
			}
		}
		Ok(stats)
	}
}


// vim: ts=4
