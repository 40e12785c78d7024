//! Sync orchestrator
//!
//! Owns the per-(peer, folder) session state machine: exchange states, decide
//! per path, resolve the uncertain ones, execute transfers under bounded
//! concurrency, then cool down. Local change batches fan sessions out to
//! every registered peer sharing the folder; vector-clock causality makes the
//! order across sessions irrelevant.

use crate::cache::ScanCache;
use crate::config::AppConfig;
use crate::conflict::ConflictLog;
use crate::decision::{decide, decide_resolved};
use crate::error::SyncError;
use crate::exclusion::ExclusionEngine;
use crate::logging::{SyncLog, SyncLogEntry};
use crate::monitor::{watch_folder, ChangeEvent, LocalMonitor};
use crate::mst::mst_from_states;
use crate::protocol::messages::{files_to_states, SyncMessage};
use crate::protocol::rpc::PeerHandle;
use crate::protocol::server::{EngineHandler, FolderMap, PeerMap};
use crate::scan::FolderScanner;
use crate::store::FileStateStore;
use crate::transfer::{self, FolderCtx, META_TIMEOUT};
use crate::types::{FileMetadata, FileState, PeerId, SyncAction, SyncFolder, SyncMode};
use crate::util::{now_unix, sha256_file};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio::time::Instant;

/// Re-sync suppression per (peer, folder) after a completed session
const PEER_COOLDOWN: Duration = Duration::from_secs(30);

/// Local-event-trigger suppression per folder after a successful session
const LOCAL_QUIET: Duration = Duration::from_secs(5);

/// Delay before the first session after a peer registers
const STARTUP_DELAY: Duration = Duration::from_millis(2500);

/// Wall-clock bound on one session
const SESSION_TIMEOUT: Duration = Duration::from_secs(600);

/// Cooldown applied when a session fails
const ERROR_BACKOFF: Duration = Duration::from_secs(60);

/// Concurrent transfers per session
const SESSION_TRANSFERS: usize = 3;

/// Tombstone GC cadence
const GC_INTERVAL: Duration = Duration::from_secs(3600);

/// Counters for one completed session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
	pub downloads: usize,
	pub uploads: usize,
	pub deletes_local: usize,
	pub deletes_remote: usize,
	pub conflicts: usize,
	pub skipped: usize,
	pub errors: usize,
}

struct EngineShared {
	self_id: PeerId,
	folders: FolderMap,
	peers: PeerMap,
	sync_log: Option<Arc<SyncLog>>,
	/// (peer, sync-id) → suppressed until
	cooldowns: Mutex<HashMap<(PeerId, String), Instant>>,
	/// sync-id → local triggers suppressed until
	local_quiet: Mutex<HashMap<String, Instant>>,
	/// Sessions currently running
	active: Mutex<BTreeSet<(PeerId, String)>>,
	/// Sync-ids each peer declared at registration
	peer_shares: Mutex<HashMap<PeerId, BTreeSet<String>>>,
	/// (sync-id, path) → peers that have omitted the path in an exchange
	tombstone_acks: Mutex<BTreeMap<(String, String), BTreeSet<PeerId>>>,
	/// Remote SyncRequest triggers
	trigger_tx: mpsc::Sender<(PeerId, String)>,
	/// Watchers must stay alive for events to flow
	watchers: Mutex<Vec<notify::RecommendedWatcher>>,
}

/// The engine facade handed to `main` and to tests
#[derive(Clone)]
pub struct SyncEngine {
	shared: Arc<EngineShared>,
}

impl SyncEngine {
	pub fn new(self_id: PeerId, sync_log: Option<Arc<SyncLog>>) -> Self {
		let (trigger_tx, trigger_rx) = mpsc::channel(64);
		let shared = Arc::new(EngineShared {
			self_id,
			folders: Arc::new(RwLock::new(BTreeMap::new())),
			peers: Arc::new(RwLock::new(BTreeMap::new())),
			sync_log,
			cooldowns: Mutex::new(HashMap::new()),
			local_quiet: Mutex::new(HashMap::new()),
			active: Mutex::new(BTreeSet::new()),
			peer_shares: Mutex::new(HashMap::new()),
			tombstone_acks: Mutex::new(BTreeMap::new()),
			trigger_tx,
			watchers: Mutex::new(Vec::new()),
		});
		spawn_trigger_drain(Arc::clone(&shared), trigger_rx);
		spawn_gc_loop(Arc::clone(&shared));
		SyncEngine { shared }
	}

	pub fn self_id(&self) -> &PeerId {
		&self.shared.self_id
	}

	/// Request handler wired to this engine's folder and peer maps
	pub fn handler(&self) -> Arc<EngineHandler> {
		Arc::new(EngineHandler::new(
			self.shared.self_id.clone(),
			Arc::clone(&self.shared.folders),
			Arc::clone(&self.shared.peers),
			self.shared.trigger_tx.clone(),
		))
	}

	/// Add a prepared folder context (tests and embedders)
	pub async fn add_folder(&self, ctx: Arc<FolderCtx>) {
		self.shared.folders.write().await.insert(ctx.sync_id.clone(), ctx);
	}

	pub async fn folder(&self, sync_id: &str) -> Option<Arc<FolderCtx>> {
		self.shared.folders.read().await.get(sync_id).cloned()
	}

	pub async fn folder_ids(&self) -> Vec<String> {
		self.shared.folders.read().await.keys().cloned().collect()
	}

	/// Open stores, reconcile the filesystem against persisted state, and
	/// start watching a configured folder
	pub async fn attach_folder(
		&self,
		config: &AppConfig,
		folder: &SyncFolder,
	) -> Result<(), SyncError> {
		let store =
			Arc::new(FileStateStore::open(&config.state_dir(), &folder.sync_id).await?);
		Arc::clone(&store).spawn_flusher();
		let blocks =
			Arc::new(crate::blockstore::BlockStore::open(&config.blocks_dir()).await?);
		let conflicts =
			Arc::new(ConflictLog::new(&config.conflicts_dir(), &folder.sync_id));
		let exclusion = Arc::new(ExclusionEngine::new(&folder.path, &folder.exclude)?);
		let cache = match ScanCache::open(&config.scan_cache_path()) {
			Ok(cache) => Some(Arc::new(cache)),
			Err(e) => {
				tracing::warn!(sync_id = %folder.sync_id, "scan cache unavailable: {}", e);
				None
			}
		};

		let ctx = Arc::new(FolderCtx {
			sync_id: folder.sync_id.clone(),
			root: folder.path.clone(),
			mode: folder.mode,
			self_id: self.shared.self_id.clone(),
			store: Arc::clone(&store),
			blocks,
			conflicts,
			chunker: crate::chunker::FastCdc::default(),
			threshold: crate::config::block_threshold(),
		});
		self.add_folder(Arc::clone(&ctx)).await;

		// Catch up with whatever happened while we were down
		let events =
			startup_reconcile(&ctx, Arc::clone(&exclusion), cache.clone()).await?;
		if !events.is_empty() {
			tracing::info!(
				sync_id = %folder.sync_id,
				count = events.len(),
				"startup reconciliation found offline changes"
			);
			self.on_local_batch(&folder.sync_id, events).await;
		}

		// Watcher → monitor → engine
		let (raw_tx, raw_rx) = mpsc::channel(1024);
		let (batch_tx, mut batch_rx) = mpsc::channel(64);
		let watcher = watch_folder(&folder.path, raw_tx)?;
		self.shared.watchers.lock().await.push(watcher);
		LocalMonitor::new(&folder.sync_id, &folder.path, exclusion, store)
			.spawn(raw_rx, batch_tx);

		let engine = self.clone();
		let sync_id = folder.sync_id.clone();
		tokio::spawn(async move {
			while let Some(events) = batch_rx.recv().await {
				engine.on_local_batch(&sync_id, events).await;
			}
		});
		Ok(())
	}

	/// Drop a folder: running sessions are cancelled by removal of the
	/// context, new ones refuse to start
	pub async fn remove_folder(&self, sync_id: &str) {
		if let Some(ctx) = self.shared.folders.write().await.remove(sync_id) {
			if let Err(e) = ctx.store.flush().await {
				tracing::error!(sync_id, "flush on folder removal failed: {}", e);
			}
		}
	}

	/// Register a connected peer; sessions towards it start after the
	/// identity handshake settles
	pub async fn register_peer(&self, handle: PeerHandle, shared_sync_ids: Vec<String>) {
		let peer_id = handle.peer_id().clone();
		self.shared.peers.write().await.insert(peer_id.clone(), handle);
		self.shared
			.peer_shares
			.lock()
			.await
			.insert(peer_id.clone(), shared_sync_ids.iter().cloned().collect());

		let shared = Arc::clone(&self.shared);
		tokio::spawn(async move {
			tokio::time::sleep(STARTUP_DELAY).await;
			let folders = shared.folders.read().await;
			for sync_id in shared_sync_ids {
				if folders.contains_key(&sync_id) {
					spawn_session(Arc::clone(&shared), peer_id.clone(), sync_id, false);
				}
			}
		});
	}

	pub async fn unregister_peer(&self, peer_id: &PeerId) {
		self.shared.peers.write().await.remove(peer_id);
		self.shared.peer_shares.lock().await.remove(peer_id);
	}

	/// Apply a debounced local batch to the store, then fan out sessions
	pub async fn on_local_batch(&self, sync_id: &str, events: Vec<ChangeEvent>) {
		let ctx = match self.folder(sync_id).await {
			Some(ctx) => ctx,
			None => return,
		};
		for event in &events {
			if let Err(e) = apply_local_event(&ctx, event).await {
				tracing::warn!(sync_id, ?event, "failed to apply local event: {}", e);
			}
		}
		if let Err(e) = ctx.store.flush().await {
			tracing::error!(sync_id, "state flush failed: {}", e);
		}

		// Respect the post-session quiet window, then fan out. Local edits
		// answer to the 5-second quiet window only, not the per-peer
		// session cooldown.
		let quiet_until = self.shared.local_quiet.lock().await.get(sync_id).copied();
		let shared = Arc::clone(&self.shared);
		let sync_id = sync_id.to_string();
		tokio::spawn(async move {
			if let Some(until) = quiet_until {
				tokio::time::sleep_until(until).await;
			}
			fan_out(shared, sync_id, true).await;
		});
	}

	/// Manual trigger: sessions to every sharing peer, bypassing cooldowns
	pub async fn trigger(&self, sync_id: &str) {
		fan_out(Arc::clone(&self.shared), sync_id.to_string(), true).await;
	}

	/// Peers currently connected
	pub async fn connected_peers(&self) -> Vec<PeerId> {
		self.shared.peers.read().await.keys().cloned().collect()
	}

	/// Flush all folder stores (orderly shutdown)
	pub async fn flush_all(&self) -> Result<(), SyncError> {
		for ctx in self.shared.folders.read().await.values() {
			ctx.store.flush().await?;
		}
		Ok(())
	}
}

/// Sessions to every registered peer sharing the folder, in parallel
///
/// A peer whose share list is empty is tried anyway; it may have attached
/// the folder after registering, and an unknown sync-id costs one rejected
/// probe.
async fn fan_out(shared: Arc<EngineShared>, sync_id: String, ignore_cooldown: bool) {
	let peers: Vec<PeerId> = shared.peers.read().await.keys().cloned().collect();
	let shares = shared.peer_shares.lock().await;
	let targets: Vec<PeerId> = peers
		.into_iter()
		.filter(|peer| match shares.get(peer) {
			Some(set) => set.is_empty() || set.contains(&sync_id),
			None => true,
		})
		.collect();
	drop(shares);
	for peer_id in targets {
		spawn_session(Arc::clone(&shared), peer_id, sync_id.clone(), ignore_cooldown);
	}
}

fn spawn_trigger_drain(shared: Arc<EngineShared>, mut rx: mpsc::Receiver<(PeerId, String)>) {
	tokio::spawn(async move {
		while let Some((peer_id, sync_id)) = rx.recv().await {
			spawn_session(Arc::clone(&shared), peer_id, sync_id, false);
		}
	});
}

fn spawn_gc_loop(shared: Arc<EngineShared>) {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(GC_INTERVAL);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			ticker.tick().await;
			collect_tombstones(&shared).await;
		}
	});
}

/// Drop tombstones past retention that every known peer has acknowledged
async fn collect_tombstones(shared: &Arc<EngineShared>) {
	let folders: Vec<Arc<FolderCtx>> =
		shared.folders.read().await.values().cloned().collect();
	let known_peers: BTreeSet<PeerId> =
		shared.peers.read().await.keys().cloned().collect();
	let now = now_unix();

	for ctx in folders {
		let deleted = ctx.store.deleted_paths().await;
		let mut acked = BTreeSet::new();
		{
			let acks = shared.tombstone_acks.lock().await;
			for path in &deleted {
				let key = (ctx.sync_id.clone(), path.clone());
				let acked_by = acks.get(&key);
				let all_acked = known_peers.is_empty()
					|| acked_by.map(|peers| known_peers.is_subset(peers)).unwrap_or(false);
				if all_acked {
					acked.insert(path.clone());
				}
			}
		}
		let removed = ctx.store.collect_tombstones(now, &acked).await;
		if removed > 0 {
			tracing::info!(sync_id = %ctx.sync_id, removed, "tombstone GC");
			let mut acks = shared.tombstone_acks.lock().await;
			acks.retain(|(sync_id, path), _| {
				!(sync_id == &ctx.sync_id && acked.contains(path))
			});
		}
	}
}

/// Fold one monitor event into the store
async fn apply_local_event(ctx: &Arc<FolderCtx>, event: &ChangeEvent) -> Result<(), SyncError> {
	match event {
		ChangeEvent::Created(path) | ChangeEvent::Modified(path) => {
			record_local_file(ctx, path).await
		}
		ChangeEvent::Deleted(path) => {
			// Only a live entry gets a tombstone; a delete of something we
			// never tracked (or already tombstoned) must not advance clocks
			if matches!(ctx.store.get(path).await, Some(FileState::Exists(_))) {
				transfer::atomic_local_delete(ctx, path).await?;
			}
			Ok(())
		}
		ChangeEvent::Renamed { from, to } => {
			// Not atomic at the protocol level: a tombstone for the old path
			// and a fresh file at the new one, each with an advancing clock
			if matches!(ctx.store.get(from).await, Some(FileState::Exists(_))) {
				transfer::atomic_local_delete(ctx, from).await?;
			}
			record_local_file(ctx, to).await
		}
	}
}

async fn record_local_file(ctx: &Arc<FolderCtx>, path: &str) -> Result<(), SyncError> {
	let abs = ctx.abs(path);
	let meta = tokio::fs::metadata(&abs).await?;
	let (hash, size) = if meta.is_dir() {
		(String::new(), 0)
	} else {
		(sha256_file(&abs).await?, meta.len())
	};

	// Unchanged content must not advance the clock, or every scan would
	// generate phantom edits
	if let Some(FileState::Exists(existing)) = ctx.store.get(path).await {
		if existing.hash == hash && !meta.is_dir() {
			return Ok(());
		}
	}

	let mtime = meta
		.modified()
		.ok()
		.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
		.map(|d| d.as_secs() as i64)
		.unwrap_or_else(now_unix);
	let ctime = meta
		.created()
		.ok()
		.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
		.map(|d| d.as_secs() as i64)
		.unwrap_or(mtime);

	let clock = ctx.store.next_clock(path, &ctx.self_id).await;
	ctx.store
		.set_exists(
			path,
			FileMetadata {
				hash,
				size,
				mtime,
				ctime,
				clock: Some(clock),
				is_dir: meta.is_dir(),
			},
		)
		.await;
	Ok(())
}

/// Diff the filesystem against the persisted store after a restart
///
/// Also retries the filesystem half of an interrupted atomic delete: a
/// tombstone whose file still exists is completed unless the file's mtime
/// says the user recreated it.
pub async fn startup_reconcile(
	ctx: &Arc<FolderCtx>,
	exclusion: Arc<ExclusionEngine>,
	cache: Option<Arc<ScanCache>>,
) -> Result<Vec<ChangeEvent>, SyncError> {
	let scanner = FolderScanner::new(&ctx.root, exclusion, cache);
	let scanned = scanner.scan().await?;
	let states = ctx.store.all_states().await;
	let mut events = Vec::new();

	for (path, file) in &scanned {
		match states.get(path) {
			None => events.push(ChangeEvent::Created(path.clone())),
			Some(FileState::Exists(meta)) => {
				if meta.hash != file.hash {
					events.push(ChangeEvent::Modified(path.clone()));
				}
			}
			Some(FileState::Deleted(rec)) => {
				if file.mtime > rec.deleted_at + crate::decision::MTIME_TIE_SECS {
					// Recreated after the delete: a resurrection
					events.push(ChangeEvent::Created(path.clone()));
				} else {
					// Crash between tombstone write and removal
					tracing::info!(
						sync_id = %ctx.sync_id,
						path = %path,
						"completing interrupted delete"
					);
					let abs = ctx.abs(path);
					let result = if file.is_dir {
						tokio::fs::remove_dir_all(&abs).await
					} else {
						tokio::fs::remove_file(&abs).await
					};
					if let Err(e) = result {
						if e.kind() != std::io::ErrorKind::NotFound {
							return Err(e.into());
						}
					}
				}
			}
		}
	}
	for (path, state) in &states {
		if state.is_exists() && !scanned.contains_key(path) {
			events.push(ChangeEvent::Deleted(path.clone()));
		}
	}
	Ok(events)
}

fn spawn_session(shared: Arc<EngineShared>, peer_id: PeerId, sync_id: String, ignore_cooldown: bool) {
	tokio::spawn(async move {
		run_session(shared, peer_id, sync_id, ignore_cooldown).await;
	});
}

async fn run_session(shared: Arc<EngineShared>, peer_id: PeerId, sync_id: String, ignore_cooldown: bool) {
	let key = (peer_id.clone(), sync_id.clone());

	// One session per (peer, folder); cooldown applies unless manual
	{
		let mut active = shared.active.lock().await;
		if active.contains(&key) {
			return;
		}
		if !ignore_cooldown {
			if let Some(until) = shared.cooldowns.lock().await.get(&key) {
				if Instant::now() < *until {
					return;
				}
			}
		}
		active.insert(key.clone());
	}

	let ctx = shared.folders.read().await.get(&sync_id).cloned();
	let peer = shared.peers.read().await.get(&peer_id).cloned();
	let result = match (ctx, peer) {
		(Some(ctx), Some(peer)) => {
			match tokio::time::timeout(
				SESSION_TIMEOUT,
				session_body(&shared, &ctx, &peer),
			)
			.await
			{
				Ok(result) => result,
				Err(_) => Err(SyncError::Other {
					message: "session exceeded wall-clock timeout".to_string(),
				}),
			}
		}
		_ => {
			shared.active.lock().await.remove(&key);
			return;
		}
	};

	let cooldown = match &result {
		Ok(stats) => {
			tracing::info!(
				peer = %peer_id,
				sync_id = %sync_id,
				?stats,
				"session complete"
			);
			if let Some(log) = &shared.sync_log {
				let _ = log
					.append(SyncLogEntry::info(&sync_id, "session_complete").with_detail(
						&format!(
							"peer={} downloads={} uploads={} conflicts={}",
							peer_id, stats.downloads, stats.uploads, stats.conflicts
						),
					))
					.await;
			}
			shared
				.local_quiet
				.lock()
				.await
				.insert(sync_id.clone(), Instant::now() + LOCAL_QUIET);
			PEER_COOLDOWN
		}
		Err(e) => {
			tracing::warn!(peer = %peer_id, sync_id = %sync_id, "session failed: {}", e);
			if let Some(log) = &shared.sync_log {
				let _ = log
					.append(SyncLogEntry::warn(&sync_id, "session_failed").with_detail(
						&format!("peer={} error={}", peer_id, e),
					))
					.await;
			}
			ERROR_BACKOFF
		}
	};
	shared.cooldowns.lock().await.insert(key.clone(), Instant::now() + cooldown);
	shared.active.lock().await.remove(&key);
}

/// Exchange → decide → resolve → transfer
async fn session_body(
	shared: &Arc<EngineShared>,
	ctx: &Arc<FolderCtx>,
	peer: &PeerHandle,
) -> Result<SessionStats, SyncError> {
	let mut stats = SessionStats::default();

	// Cheap probe first: equal MST roots mean the existing sets are equal
	let local_mst = ctx.store.mst().await;
	let response = peer
		.request_with_retry(SyncMessage::GetMst { sync_id: ctx.sync_id.clone() }, META_TIMEOUT)
		.await?;
	let remote_root = match response {
		SyncMessage::MstRoot { root, .. } => root,
		SyncMessage::Reject { reason } => {
			return Err(SyncError::Protocol(crate::error::ProtocolError::Rejected { reason }));
		}
		other => {
			return Err(SyncError::Protocol(
				crate::error::ProtocolError::UnexpectedResponse {
					expected: "mst_root",
					got: other.kind().to_string(),
				},
			));
		}
	};
	let local_deleted = ctx.store.deleted_paths().await;
	if local_mst.root_hash() == remote_root && local_deleted.is_empty() {
		return Ok(stats);
	}

	// Full state exchange, tombstones included
	let response = peer
		.request_with_retry(
			SyncMessage::GetStates { sync_id: ctx.sync_id.clone(), paths: None },
			META_TIMEOUT,
		)
		.await?;
	let remote_states = match response {
		SyncMessage::States { states, .. } => states,
		SyncMessage::Files { entries, deleted_paths, .. } => {
			files_to_states(peer.peer_id(), entries, deleted_paths)
		}
		SyncMessage::Reject { reason } => {
			return Err(SyncError::Protocol(crate::error::ProtocolError::Rejected { reason }));
		}
		other => {
			return Err(SyncError::Protocol(
				crate::error::ProtocolError::UnexpectedResponse {
					expected: "states",
					got: other.kind().to_string(),
				},
			));
		}
	};
	let local_states = ctx.store.all_states().await;

	// Tombstone acknowledgements: the peer answered with its full state and
	// omitted these deleted paths, so it no longer holds them
	{
		let mut acks = shared.tombstone_acks.lock().await;
		for path in &local_deleted {
			if !remote_states.contains_key(path) {
				acks.entry((ctx.sync_id.clone(), path.clone()))
					.or_default()
					.insert(peer.peer_id().clone());
			}
		}
	}

	// Candidates: MST diff over existing entries, plus every path carrying a
	// tombstone on either side
	let remote_mst = mst_from_states(&remote_states);
	let mut candidates = local_mst.diff(&remote_mst);
	for (path, state) in local_states.iter().chain(remote_states.iter()) {
		if state.is_deleted() {
			candidates.insert(path.clone());
		}
	}

	// First decision pass
	let mut planned: Vec<(String, SyncAction)> = Vec::new();
	let mut uncertain: Vec<String> = Vec::new();
	for path in candidates {
		let action = decide(local_states.get(&path), remote_states.get(&path));
		match action {
			SyncAction::Uncertain => uncertain.push(path),
			SyncAction::Skip => stats.skipped += 1,
			action => planned.push((path, action)),
		}
	}

	// Uncertain paths: fetch the full remote state including tombstones
	if !uncertain.is_empty() {
		let response = peer
			.request_with_retry(
				SyncMessage::GetStates {
					sync_id: ctx.sync_id.clone(),
					paths: Some(uncertain.clone()),
				},
				META_TIMEOUT,
			)
			.await?;
		let fetched = match response {
			SyncMessage::States { states, .. } => states,
			other => {
				return Err(SyncError::Protocol(
					crate::error::ProtocolError::UnexpectedResponse {
						expected: "states",
						got: other.kind().to_string(),
					},
				));
			}
		};
		for path in uncertain {
			let action = decide_resolved(local_states.get(&path), fetched.get(&path));
			match action {
				SyncAction::Skip => stats.skipped += 1,
				action => planned.push((path, action)),
			}
		}
	}

	// Direction filtering per folder mode
	let planned: Vec<(String, SyncAction)> = planned
		.into_iter()
		.filter_map(|(path, action)| {
			let action = match (ctx.mode, action) {
				(SyncMode::UploadOnly, SyncAction::Download)
				| (SyncMode::UploadOnly, SyncAction::DeleteLocal) => return None,
				(SyncMode::UploadOnly, SyncAction::Conflict) => SyncAction::Upload,
				(SyncMode::DownloadOnly, SyncAction::Upload)
				| (SyncMode::DownloadOnly, SyncAction::DeleteRemote) => return None,
				(_, action) => action,
			};
			Some((path, action))
		})
		.collect();

	// Execute with bounded concurrency
	let semaphore = Arc::new(Semaphore::new(SESSION_TRANSFERS));
	let outcomes = futures::future::join_all(planned.into_iter().map(|(path, action)| {
		let semaphore = Arc::clone(&semaphore);
		let ctx = Arc::clone(ctx);
		let peer = peer.clone();
		let local = local_states.get(&path).cloned();
		let remote = remote_states.get(&path).cloned();
		async move {
			let _permit = semaphore.acquire().await.map_err(|_| SyncError::Other {
				message: "session semaphore closed".to_string(),
			})?;
			execute_action(&ctx, &peer, &path, action, local, remote).await.map(|_| action)
		}
	}))
	.await;

	for outcome in outcomes {
		match outcome {
			Ok(SyncAction::Download) => stats.downloads += 1,
			Ok(SyncAction::Upload) => stats.uploads += 1,
			Ok(SyncAction::DeleteLocal) => stats.deletes_local += 1,
			Ok(SyncAction::DeleteRemote) => stats.deletes_remote += 1,
			Ok(SyncAction::Conflict) => stats.conflicts += 1,
			Ok(_) => stats.skipped += 1,
			Err(e) => {
				// Integrity and policy failures abort only their path
				stats.errors += 1;
				tracing::warn!(sync_id = %ctx.sync_id, "path action failed: {}", e);
			}
		}
	}
	ctx.store.flush().await?;
	Ok(stats)
}

async fn execute_action(
	ctx: &Arc<FolderCtx>,
	peer: &PeerHandle,
	path: &str,
	action: SyncAction,
	local: Option<FileState>,
	remote: Option<FileState>,
) -> Result<(), SyncError> {
	match action {
		SyncAction::Skip | SyncAction::Uncertain => Ok(()),
		SyncAction::Download => transfer::download_file(ctx, peer, path).await,
		SyncAction::Upload => transfer::upload_file(ctx, peer, path).await.map(|_| ()),
		SyncAction::DeleteLocal => {
			let record = match remote {
				Some(FileState::Deleted(record)) => record,
				_ => {
					return Err(SyncError::Other {
						message: format!("delete-local for {} without remote tombstone", path),
					});
				}
			};
			match transfer::apply_remote_delete(ctx, path, record).await {
				SyncMessage::Ack => Ok(()),
				SyncMessage::Reject { reason } => Err(SyncError::Other {
					message: format!("local delete of {} refused: {}", path, reason),
				}),
				_ => Ok(()),
			}
		}
		SyncAction::DeleteRemote => {
			let record = match local {
				Some(FileState::Deleted(record)) => record,
				_ => {
					return Err(SyncError::Other {
						message: format!("delete-remote for {} without local tombstone", path),
					});
				}
			};
			transfer::push_delete(ctx, peer, path, record).await.map(|_| ())
		}
		SyncAction::Conflict => {
			// Exactly one side materializes a given conflict, or two
			// concurrent resolutions would re-conflict forever. The lower
			// peer-id resolves; the other side asks it to run a session.
			if ctx.self_id < *peer.peer_id() {
				transfer::materialize_conflict(ctx, peer, path).await
			} else {
				peer.request_with_retry(
					SyncMessage::SyncRequest { sync_id: ctx.sync_id.clone() },
					META_TIMEOUT,
				)
				.await
				.map(|_| ())
				.map_err(SyncError::from)
			}
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::blockstore::BlockStore;
	use crate::chunker::FastCdc;
	use crate::clock::VectorClock;
	use tempfile::TempDir;

	async fn test_ctx(tmp: &TempDir, sync_id: &str, self_id: &str) -> Arc<FolderCtx> {
		let root = tmp.path().join(self_id).join(sync_id);
		std::fs::create_dir_all(&root).unwrap();
		Arc::new(FolderCtx {
			sync_id: sync_id.to_string(),
			root,
			mode: SyncMode::TwoWay,
			self_id: self_id.to_string(),
			store: Arc::new(FileStateStore::in_memory(sync_id)),
			blocks: Arc::new(
				BlockStore::open(&tmp.path().join(self_id).join("blocks")).await.unwrap(),
			),
			conflicts: Arc::new(ConflictLog::new(
				&tmp.path().join(self_id).join("conflicts"),
				sync_id,
			)),
			chunker: FastCdc::default(),
			threshold: 1024 * 1024,
		})
	}

	#[tokio::test]
	async fn test_apply_local_event_create_and_modify() {
		let tmp = TempDir::new().unwrap();
		let ctx = test_ctx(&tmp, "engine-test", "QmSelf").await;
		std::fs::write(ctx.abs("f.txt"), b"one").unwrap();

		apply_local_event(&ctx, &ChangeEvent::Created("f.txt".to_string())).await.unwrap();
		let state = ctx.store.get("f.txt").await.unwrap();
		let meta = state.as_exists().unwrap();
		assert_eq!(meta.clock.as_ref().unwrap().get("QmSelf"), 1);

		std::fs::write(ctx.abs("f.txt"), b"two").unwrap();
		apply_local_event(&ctx, &ChangeEvent::Modified("f.txt".to_string())).await.unwrap();
		let state = ctx.store.get("f.txt").await.unwrap();
		assert_eq!(state.clock().unwrap().get("QmSelf"), 2);
	}

	#[tokio::test]
	async fn test_apply_local_event_unchanged_content_keeps_clock() {
		let tmp = TempDir::new().unwrap();
		let ctx = test_ctx(&tmp, "engine-test", "QmSelf").await;
		std::fs::write(ctx.abs("f.txt"), b"same").unwrap();

		apply_local_event(&ctx, &ChangeEvent::Created("f.txt".to_string())).await.unwrap();
		apply_local_event(&ctx, &ChangeEvent::Modified("f.txt".to_string())).await.unwrap();
		assert_eq!(ctx.store.get("f.txt").await.unwrap().clock().unwrap().get("QmSelf"), 1);
	}

	#[tokio::test]
	async fn test_apply_local_event_rename() {
		let tmp = TempDir::new().unwrap();
		let ctx = test_ctx(&tmp, "engine-test", "QmSelf").await;
		std::fs::write(ctx.abs("old.txt"), b"bytes").unwrap();
		apply_local_event(&ctx, &ChangeEvent::Created("old.txt".to_string())).await.unwrap();

		std::fs::rename(ctx.abs("old.txt"), ctx.abs("new.txt")).unwrap();
		apply_local_event(
			&ctx,
			&ChangeEvent::Renamed { from: "old.txt".to_string(), to: "new.txt".to_string() },
		)
		.await
		.unwrap();

		assert!(ctx.store.is_deleted("old.txt").await);
		assert!(ctx.store.get("new.txt").await.unwrap().is_exists());
	}

	#[tokio::test]
	async fn test_startup_reconcile_finds_offline_changes() {
		let tmp = TempDir::new().unwrap();
		let ctx = test_ctx(&tmp, "engine-test", "QmSelf").await;
		let exclusion =
			Arc::new(ExclusionEngine::new(&ctx.root, &[]).unwrap());

		// Store believes in two files; disk has one changed, one missing,
		// one brand new
		std::fs::write(ctx.abs("changed.txt"), b"v2").unwrap();
		std::fs::write(ctx.abs("new.txt"), b"n").unwrap();
		ctx.store
			.set_exists(
				"changed.txt",
				FileMetadata {
					hash: crate::util::sha256_hex(b"v1"),
					size: 2,
					mtime: 1,
					ctime: 1,
					clock: Some(VectorClock::from([("QmSelf", 1)])),
					is_dir: false,
				},
			)
			.await;
		ctx.store
			.set_exists(
				"missing.txt",
				FileMetadata {
					hash: crate::util::sha256_hex(b"m"),
					size: 1,
					mtime: 1,
					ctime: 1,
					clock: Some(VectorClock::from([("QmSelf", 1)])),
					is_dir: false,
				},
			)
			.await;

		let mut events = startup_reconcile(&ctx, exclusion, None).await.unwrap();
		events.sort_by_key(|e| e.path().to_string());
		assert_eq!(
			events,
			vec![
				ChangeEvent::Modified("changed.txt".to_string()),
				ChangeEvent::Deleted("missing.txt".to_string()),
				ChangeEvent::Created("new.txt".to_string()),
			]
		);
	}

	#[tokio::test]
	async fn test_startup_reconcile_completes_interrupted_delete() {
		let tmp = TempDir::new().unwrap();
		let ctx = test_ctx(&tmp, "engine-test", "QmSelf").await;
		let exclusion = Arc::new(ExclusionEngine::new(&ctx.root, &[]).unwrap());

		// Tombstone recorded but the file survived a crash; its mtime
		// predates the tombstone, so the delete is completed
		std::fs::write(ctx.abs("zombie.txt"), b"z").unwrap();
		filetime::set_file_mtime(
			ctx.abs("zombie.txt"),
			filetime::FileTime::from_unix_time(1000, 0),
		)
		.unwrap();
		ctx.store
			.set_deleted(
				"zombie.txt",
				crate::types::DeletionRecord {
					deleted_at: 5000,
					deleted_by: "QmSelf".to_string(),
					clock: VectorClock::from([("QmSelf", 2)]),
				},
			)
			.await;

		let events = startup_reconcile(&ctx, exclusion, None).await.unwrap();
		assert!(events.is_empty());
		assert!(!ctx.abs("zombie.txt").exists());
	}

	#[tokio::test]
	async fn test_startup_reconcile_detects_resurrection() {
		let tmp = TempDir::new().unwrap();
		let ctx = test_ctx(&tmp, "engine-test", "QmSelf").await;
		let exclusion = Arc::new(ExclusionEngine::new(&ctx.root, &[]).unwrap());

		// File recreated well after the tombstone: it must come back
		std::fs::write(ctx.abs("back.txt"), b"again").unwrap();
		ctx.store
			.set_deleted(
				"back.txt",
				crate::types::DeletionRecord {
					deleted_at: 1000,
					deleted_by: "QmSelf".to_string(),
					clock: VectorClock::from([("QmSelf", 2)]),
				},
			)
			.await;

		let events = startup_reconcile(&ctx, exclusion, None).await.unwrap();
		assert_eq!(events, vec![ChangeEvent::Created("back.txt".to_string())]);
		assert!(ctx.abs("back.txt").exists());
	}
}

// vim: ts=4
