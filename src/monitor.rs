//! Local change detection
//!
//! Consumes raw filesystem events (from a notify watcher, or injected in
//! tests), gates newly written files on write stability, filters excluded
//! paths, debounces bursts, and hands the engine one batch per quiet period.
//!
//! The write-stability gate exists because editors and downloads write in
//! many small steps: a file is only reported once its size has been observed
//! unchanged across two successive samples three seconds apart.

use crate::error::SyncError;
use crate::exclusion::ExclusionEngine;
use crate::store::FileStateStore;
use crate::types::FileState;
use crate::util::sha256_file;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Interval between write-stability samples
const STABILITY_SAMPLE: Duration = Duration::from_secs(3);

/// Samples a file size must survive unchanged before it is reported
const STABILITY_SAMPLES: u8 = 2;

/// Quiet period before a batch is delivered
const DEBOUNCE_WINDOW: Duration = Duration::from_secs(2);

/// Raw event as delivered by the watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
	/// Something was created or written at this relative path
	Write(String),

	/// The relative path went away
	Remove(String),
}

/// Gated, filtered, debounced change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
	Created(String),
	Modified(String),
	Deleted(String),
	Renamed { from: String, to: String },
}

impl ChangeEvent {
	pub fn path(&self) -> &str {
		match self {
			ChangeEvent::Created(p) | ChangeEvent::Modified(p) | ChangeEvent::Deleted(p) => p,
			ChangeEvent::Renamed { to, .. } => to,
		}
	}
}

#[derive(Debug)]
struct PendingWrite {
	last_size: Option<u64>,
	stable: u8,
	last_sample: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchKind {
	Created,
	Modified,
	Deleted,
}

pub struct LocalMonitor {
	sync_id: String,
	root: PathBuf,
	exclusion: Arc<ExclusionEngine>,
	store: Arc<FileStateStore>,
}

impl LocalMonitor {
	pub fn new(
		sync_id: &str,
		root: &Path,
		exclusion: Arc<ExclusionEngine>,
		store: Arc<FileStateStore>,
	) -> Self {
		LocalMonitor {
			sync_id: sync_id.to_string(),
			root: root.to_path_buf(),
			exclusion,
			store,
		}
	}

	/// Run the gate/debounce loop until the raw channel closes
	pub fn spawn(
		self,
		raw_rx: mpsc::Receiver<RawEvent>,
		batch_tx: mpsc::Sender<Vec<ChangeEvent>>,
	) -> tokio::task::JoinHandle<()> {
		tokio::spawn(self.run(raw_rx, batch_tx))
	}

	async fn run(
		self,
		mut raw_rx: mpsc::Receiver<RawEvent>,
		batch_tx: mpsc::Sender<Vec<ChangeEvent>>,
	) {
		let mut pending: BTreeMap<String, PendingWrite> = BTreeMap::new();
		let mut batch: BTreeMap<String, BatchKind> = BTreeMap::new();
		let mut deadline: Option<Instant> = None;
		let mut ticker = tokio::time::interval(Duration::from_secs(1));
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			let at = deadline;
			let debounce = async move {
				match at {
					Some(at) => tokio::time::sleep_until(at).await,
					None => std::future::pending::<()>().await,
				}
			};
			tokio::select! {
				raw = raw_rx.recv() => {
					match raw {
						Some(event) => {
							self.on_raw(event, &mut pending, &mut batch, &mut deadline).await;
						}
						None => {
							// Watcher gone; deliver what we have and stop
							if !batch.is_empty() {
								let events = self.finalize(&mut batch).await;
								let _ = batch_tx.send(events).await;
							}
							break;
						}
					}
				}
				_ = ticker.tick() => {
					self.sample(&mut pending, &mut batch, &mut deadline).await;
				}
				_ = debounce => {
					// A batched delete may pair with a create still in the
					// stability gate (a rename in flight); hold the batch
					// until the gate drains.
					if batch.values().any(|k| *k == BatchKind::Deleted) && !pending.is_empty() {
						deadline = Some(Instant::now() + DEBOUNCE_WINDOW);
						continue;
					}
					deadline = None;
					let events = self.finalize(&mut batch).await;
					if !events.is_empty() && batch_tx.send(events).await.is_err() {
						break;
					}
				}
			}
		}
	}

	async fn on_raw(
		&self,
		event: RawEvent,
		pending: &mut BTreeMap<String, PendingWrite>,
		batch: &mut BTreeMap<String, BatchKind>,
		deadline: &mut Option<Instant>,
	) {
		match event {
			RawEvent::Write(path) => {
				let abs = self.abs(&path);
				let meta = match tokio::fs::metadata(&abs).await {
					Ok(meta) => meta,
					// Vanished already; a Remove will follow
					Err(_) => return,
				};
				if self.exclusion.is_excluded(&path, meta.is_dir()) {
					return;
				}
				if meta.is_dir() {
					// Directories carry no content to settle
					batch.insert(path, BatchKind::Created);
					*deadline = Some(Instant::now() + DEBOUNCE_WINDOW);
					return;
				}
				pending.insert(
					path,
					PendingWrite {
						last_size: Some(meta.len()),
						stable: 0,
						last_sample: Instant::now(),
					},
				);
			}
			RawEvent::Remove(path) => {
				if self.exclusion.is_excluded(&path, false) {
					return;
				}
				pending.remove(&path);
				// Deletions bypass the stability gate
				batch.insert(path, BatchKind::Deleted);
				*deadline = Some(Instant::now() + DEBOUNCE_WINDOW);
			}
		}
	}

	async fn sample(
		&self,
		pending: &mut BTreeMap<String, PendingWrite>,
		batch: &mut BTreeMap<String, BatchKind>,
		deadline: &mut Option<Instant>,
	) {
		let now = Instant::now();
		let mut done = Vec::new();
		let mut dropped = Vec::new();

		for (path, write) in pending.iter_mut() {
			if now.duration_since(write.last_sample) < STABILITY_SAMPLE {
				continue;
			}
			write.last_sample = now;
			let size = match tokio::fs::metadata(self.abs(path)).await {
				Ok(meta) => meta.len(),
				Err(_) => {
					dropped.push(path.clone());
					continue;
				}
			};
			if write.last_size == Some(size) {
				write.stable += 1;
				if write.stable >= STABILITY_SAMPLES {
					done.push(path.clone());
				}
			} else {
				write.last_size = Some(size);
				write.stable = 0;
			}
		}

		for path in dropped {
			pending.remove(&path);
		}
		for path in done {
			pending.remove(&path);
			let kind = match self.store.get(&path).await {
				Some(FileState::Exists(_)) => BatchKind::Modified,
				_ => BatchKind::Created,
			};
			batch.insert(path, kind);
			*deadline = Some(Instant::now() + DEBOUNCE_WINDOW);
		}
	}

	/// Turn the batch into delivered events, coalescing delete+create pairs
	/// with identical content into renames
	async fn finalize(&self, batch: &mut BTreeMap<String, BatchKind>) -> Vec<ChangeEvent> {
		let drained: Vec<(String, BatchKind)> =
			std::mem::take(batch).into_iter().collect();

		// Previous hash of each deleted path, from the store
		let mut deleted: Vec<(String, Option<String>)> = Vec::new();
		let mut created: Vec<(String, Option<String>)> = Vec::new();
		let mut rest: Vec<ChangeEvent> = Vec::new();

		for (path, kind) in drained {
			match kind {
				BatchKind::Deleted => {
					let prev_hash = match self.store.get(&path).await {
						Some(FileState::Exists(meta)) if !meta.is_dir => Some(meta.hash),
						_ => None,
					};
					deleted.push((path, prev_hash));
				}
				BatchKind::Created => {
					let hash = sha256_file(&self.abs(&path)).await.ok();
					created.push((path, hash));
				}
				BatchKind::Modified => rest.push(ChangeEvent::Modified(path)),
			}
		}

		let mut events = rest;
		let mut consumed_created = vec![false; created.len()];
		for (old_path, old_hash) in deleted {
			let matched = old_hash.as_ref().and_then(|old| {
				created.iter().enumerate().find(|(i, (_, new))| {
					!consumed_created[*i] && new.as_deref() == Some(old.as_str())
				})
			});
			match matched {
				Some((i, (new_path, _))) => {
					let new_path = new_path.clone();
					consumed_created[i] = true;
					tracing::debug!(
						sync_id = %self.sync_id,
						from = %old_path, to = %new_path,
						"coalesced delete+create into rename"
					);
					events.push(ChangeEvent::Renamed { from: old_path, to: new_path });
				}
				None => events.push(ChangeEvent::Deleted(old_path)),
			}
		}
		for (i, (path, _)) in created.into_iter().enumerate() {
			if !consumed_created[i] {
				events.push(ChangeEvent::Created(path));
			}
		}
		events
	}

	fn abs(&self, rel: &str) -> PathBuf {
		self.root.join(rel.replace('/', std::path::MAIN_SEPARATOR_STR))
	}
}

/// Attach a notify watcher to a folder, feeding the monitor's raw channel
///
/// The returned watcher must be kept alive for events to keep flowing.
pub fn watch_folder(
	root: &Path,
	tx: mpsc::Sender<RawEvent>,
) -> Result<notify::RecommendedWatcher, SyncError> {
	let root_buf = root.to_path_buf();
	let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
		let event = match res {
			Ok(event) => event,
			Err(e) => {
				tracing::warn!("watcher error: {}", e);
				return;
			}
		};
		let rel = |p: &PathBuf| -> Option<String> {
			p.strip_prefix(&root_buf).ok().map(|r| r.to_string_lossy().replace('\\', "/"))
		};
		let mut raws = Vec::new();
		match event.kind {
			EventKind::Modify(ModifyKind::Name(RenameMode::Both))
				if event.paths.len() == 2 =>
			{
				if let Some(p) = rel(&event.paths[0]) {
					raws.push(RawEvent::Remove(p));
				}
				if let Some(p) = rel(&event.paths[1]) {
					raws.push(RawEvent::Write(p));
				}
			}
			EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
				raws.extend(event.paths.iter().filter_map(&rel).map(RawEvent::Remove));
			}
			EventKind::Create(_)
			| EventKind::Modify(ModifyKind::Name(RenameMode::To))
			| EventKind::Modify(ModifyKind::Data(_))
			| EventKind::Modify(ModifyKind::Any) => {
				raws.extend(event.paths.iter().filter_map(&rel).map(RawEvent::Write));
			}
			EventKind::Remove(_) => {
				raws.extend(event.paths.iter().filter_map(&rel).map(RawEvent::Remove));
			}
			_ => {}
		}
		for raw in raws {
			if tx.blocking_send(raw).is_err() {
				return;
			}
		}
	})
	.map_err(|e| SyncError::Other { message: format!("failed to create watcher: {}", e) })?;

	watcher
		.watch(root, RecursiveMode::Recursive)
		.map_err(|e| SyncError::Other { message: format!("failed to watch folder: {}", e) })?;
	Ok(watcher)
}


// vim: ts=4
