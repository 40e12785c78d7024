//! Per-sync-folder file state store
//!
//! Keeps the (path → FileState) map that everything else reasons about.
//! Transitions are atomic per path: readers see the old or the new state,
//! never a torn one. The map persists as a JSON snapshot under
//! `state/<syncId>/states.json`; writes are buffered and flushed by a
//! background task, with an explicit `flush()` for orderly shutdown.

use crate::clock::VectorClock;
use crate::error::StoreError;
use crate::mst::{mst_from_states, Mst};
use crate::types::{DeletionRecord, FileMetadata, FileState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// How long a tombstone is retained before it becomes eligible for GC
pub const TOMBSTONE_RETENTION_SECS: i64 = 30 * 24 * 3600;

/// Flush interval for the background persister
const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

#[derive(Serialize, Deserialize, Default)]
struct StateSnapshot {
	#[serde(default)]
	states: BTreeMap<String, FileState>,
}

pub struct FileStateStore {
	sync_id: String,
	snapshot_path: PathBuf,
	states: RwLock<BTreeMap<String, FileState>>,
	dirty: AtomicBool,
}

impl FileStateStore {
	/// Open the store for a sync-id, loading any persisted snapshot
	pub async fn open(state_dir: &Path, sync_id: &str) -> Result<Self, StoreError> {
		let dir = state_dir.join(sync_id);
		tokio::fs::create_dir_all(&dir)
			.await
			.map_err(|e| StoreError::SaveFailed { source: e })?;
		let snapshot_path = dir.join("states.json");

		let states = match tokio::fs::read_to_string(&snapshot_path).await {
			Ok(contents) => {
				let snapshot: StateSnapshot =
					serde_json::from_str(&contents).map_err(|e| StoreError::Corrupted {
						message: format!("failed to parse {}: {}", snapshot_path.display(), e),
					})?;
				snapshot.states
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
			Err(e) => return Err(StoreError::LoadFailed { source: e }),
		};

		Ok(FileStateStore {
			sync_id: sync_id.to_string(),
			snapshot_path,
			states: RwLock::new(states),
			dirty: AtomicBool::new(false),
		})
	}

	/// In-memory store without persistence, for tests and ephemeral views
	pub fn in_memory(sync_id: &str) -> Self {
		FileStateStore {
			sync_id: sync_id.to_string(),
			snapshot_path: PathBuf::new(),
			states: RwLock::new(BTreeMap::new()),
			dirty: AtomicBool::new(false),
		}
	}

	pub fn sync_id(&self) -> &str {
		&self.sync_id
	}

	pub async fn get(&self, path: &str) -> Option<FileState> {
		self.states.read().await.get(path).cloned()
	}

	pub async fn set_exists(&self, path: &str, meta: FileMetadata) {
		self.states.write().await.insert(path.to_string(), FileState::Exists(meta));
		self.dirty.store(true, Ordering::Release);
	}

	pub async fn set_deleted(&self, path: &str, record: DeletionRecord) {
		self.states.write().await.insert(path.to_string(), FileState::Deleted(record));
		self.dirty.store(true, Ordering::Release);
	}

	/// Drop an entry entirely; used only by tombstone GC and compensation
	pub async fn remove(&self, path: &str) {
		self.states.write().await.remove(path);
		self.dirty.store(true, Ordering::Release);
	}

	pub async fn is_deleted(&self, path: &str) -> bool {
		matches!(self.states.read().await.get(path), Some(FileState::Deleted(_)))
	}

	pub async fn all_states(&self) -> BTreeMap<String, FileState> {
		self.states.read().await.clone()
	}

	pub async fn deleted_paths(&self) -> BTreeSet<String> {
		self.states
			.read()
			.await
			.iter()
			.filter(|(_, s)| s.is_deleted())
			.map(|(p, _)| p.clone())
			.collect()
	}

	/// Install a complete replacement map in one step
	pub async fn replace_all(&self, map: BTreeMap<String, FileState>) {
		*self.states.write().await = map;
		self.dirty.store(true, Ordering::Release);
	}

	/// The clock a new local edit of `path` should carry: the previous clock
	/// (if any) with this device's counter incremented
	pub async fn next_clock(&self, path: &str, self_id: &str) -> VectorClock {
		let mut clock = self
			.states
			.read()
			.await
			.get(path)
			.and_then(|s| s.clock().cloned())
			.unwrap_or_default();
		clock.increment(self_id);
		clock
	}

	/// MST over the current existing entries
	pub async fn mst(&self) -> Mst {
		mst_from_states(&*self.states.read().await)
	}

	/// Drop tombstones past retention that every sharing peer has seen
	///
	/// `acked` holds the paths for which every currently known peer has
	/// omitted the path from at least one exchange. Returns the number of
	/// entries removed.
	pub async fn collect_tombstones(&self, now: i64, acked: &BTreeSet<String>) -> usize {
		let mut states = self.states.write().await;
		let before = states.len();
		states.retain(|path, state| match state {
			FileState::Deleted(rec) => {
				let expired = now - rec.deleted_at >= TOMBSTONE_RETENTION_SECS;
				!(expired && acked.contains(path))
			}
			FileState::Exists(_) => true,
		});
		let removed = before - states.len();
		if removed > 0 {
			self.dirty.store(true, Ordering::Release);
		}
		removed
	}

	/// Persist the snapshot if anything changed since the last flush
	pub async fn flush(&self) -> Result<(), StoreError> {
		if self.snapshot_path.as_os_str().is_empty() {
			return Ok(());
		}
		if !self.dirty.swap(false, Ordering::AcqRel) {
			return Ok(());
		}
		let snapshot = StateSnapshot { states: self.states.read().await.clone() };
		let json = serde_json::to_string_pretty(&snapshot).map_err(|e| StoreError::Corrupted {
			message: format!("failed to serialize snapshot: {}", e),
		})?;
		crate::util::atomic_write(&self.snapshot_path, json.as_bytes())
			.await
			.map_err(|e| StoreError::SaveFailed { source: e })
	}

	/// Background persister; flushes dirty state every couple of seconds
	pub fn spawn_flusher(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
		tokio::spawn(async move {
			loop {
				tokio::time::sleep(FLUSH_INTERVAL).await;
				if let Err(e) = self.flush().await {
					tracing::error!(sync_id = %self.sync_id, "state flush failed: {}", e);
				}
			}
		})
	}
}


// vim: ts=4
