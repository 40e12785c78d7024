//! End-to-end scenarios: two engines wired over an in-memory stream.

use meshsync::blockstore::BlockStore;
use meshsync::chunker::FastCdc;
use meshsync::clock::{ClockOrdering, VectorClock};
use meshsync::conflict::{is_conflict_sibling, ConflictLog};
use meshsync::engine::SyncEngine;
use meshsync::monitor::ChangeEvent;
use meshsync::protocol::rpc::spawn_connection;
use meshsync::store::FileStateStore;
use meshsync::transfer::FolderCtx;
use meshsync::types::{DeletionRecord, FileMetadata, FileState, SyncMode};
use meshsync::util::{now_unix, sha256_hex};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const SYNC_ID: &str = "scenario-folder";

struct TestPeer {
	engine: SyncEngine,
	ctx: Arc<FolderCtx>,
	_tmp: TempDir,
}

impl TestPeer {
	async fn new(peer_id: &str) -> TestPeer {
		let tmp = TempDir::new().unwrap();
		let root = tmp.path().join("folder");
		std::fs::create_dir_all(&root).unwrap();
		let ctx = Arc::new(FolderCtx {
			sync_id: SYNC_ID.to_string(),
			root,
			mode: SyncMode::TwoWay,
			self_id: peer_id.to_string(),
			store: Arc::new(FileStateStore::in_memory(SYNC_ID)),
			blocks: Arc::new(BlockStore::open(&tmp.path().join("blocks")).await.unwrap()),
			conflicts: Arc::new(ConflictLog::new(&tmp.path().join("conflicts"), SYNC_ID)),
			chunker: FastCdc::default(),
			threshold: 1024 * 1024,
		});
		let engine = SyncEngine::new(peer_id.to_string(), None);
		engine.add_folder(Arc::clone(&ctx)).await;
		TestPeer { engine, ctx, _tmp: tmp }
	}

	fn abs(&self, rel: &str) -> PathBuf {
		self.ctx.abs(rel)
	}

	/// Write a file and record it in the store without triggering sessions
	async fn edit(&self, rel: &str, bytes: &[u8]) {
		let abs = self.abs(rel);
		if let Some(parent) = abs.parent() {
			std::fs::create_dir_all(parent).unwrap();
		}
		std::fs::write(&abs, bytes).unwrap();
		self.record(rel).await;
	}

	/// Same, but with an explicit mtime (for the tie-break scenarios)
	async fn edit_with_mtime(&self, rel: &str, bytes: &[u8], mtime: i64) {
		let abs = self.abs(rel);
		if let Some(parent) = abs.parent() {
			std::fs::create_dir_all(parent).unwrap();
		}
		std::fs::write(&abs, bytes).unwrap();
		filetime::set_file_mtime(&abs, filetime::FileTime::from_unix_time(mtime, 0)).unwrap();
		self.record(rel).await;
	}

	async fn record(&self, rel: &str) {
		let abs = self.abs(rel);
		let meta = std::fs::metadata(&abs).unwrap();
		let mtime = meta
			.modified()
			.ok()
			.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
			.map(|d| d.as_secs() as i64)
			.unwrap_or_else(now_unix);
		let bytes = std::fs::read(&abs).unwrap();
		let clock = self.ctx.store.next_clock(rel, self.engine.self_id()).await;
		self.ctx
			.store
			.set_exists(
				rel,
				FileMetadata {
					hash: sha256_hex(&bytes),
					size: bytes.len() as u64,
					mtime,
					ctime: mtime,
					clock: Some(clock),
					is_dir: false,
				},
			)
			.await;
	}

	/// Delete locally through the engine's event path
	async fn delete(&self, rel: &str) {
		std::fs::remove_file(self.abs(rel)).unwrap();
		self.engine
			.on_local_batch(SYNC_ID, vec![ChangeEvent::Deleted(rel.to_string())])
			.await;
	}

	async fn state(&self, rel: &str) -> Option<FileState> {
		self.ctx.store.get(rel).await
	}

	async fn clock(&self, rel: &str) -> Option<VectorClock> {
		self.state(rel).await.and_then(|s| s.clock().cloned())
	}

	fn files_on_disk(&self) -> Vec<String> {
		let mut out = Vec::new();
		let mut stack = vec![self.ctx.root.clone()];
		while let Some(dir) = stack.pop() {
			for entry in std::fs::read_dir(&dir).unwrap() {
				let entry = entry.unwrap();
				let path = entry.path();
				if path.is_dir() {
					stack.push(path);
				} else {
					let rel = path
						.strip_prefix(&self.ctx.root)
						.unwrap()
						.to_string_lossy()
						.replace('\\', "/");
					if !rel.ends_with(".msync-tmp") {
						out.push(rel);
					}
				}
			}
		}
		out.sort();
		out
	}
}

/// Connect two peers over an in-memory duplex stream
async fn link(a: &TestPeer, b: &TestPeer) {
	let (stream_a, stream_b) = tokio::io::duplex(4 * 1024 * 1024);
	let handle_of_b = spawn_connection(b.engine.self_id().clone(), stream_a, a.engine.handler());
	let handle_of_a = spawn_connection(a.engine.self_id().clone(), stream_b, b.engine.handler());
	// Empty shared lists: sessions are driven explicitly via trigger()
	a.engine.register_peer(handle_of_b, vec![]).await;
	b.engine.register_peer(handle_of_a, vec![]).await;
}

/// Re-trigger sessions until the condition holds; a single trigger can be
/// absorbed by a still-active previous session, so poll-and-retrigger
async fn trigger_until<F, Fut>(engine: &SyncEngine, what: &str, mut condition: F)
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = bool>,
{
	let deadline = std::time::Instant::now() + Duration::from_secs(15);
	loop {
		engine.trigger(SYNC_ID).await;
		if condition().await {
			return;
		}
		if std::time::Instant::now() > deadline {
			panic!("timed out waiting for: {}", what);
		}
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s1_basic_add_converges() {
	let a = TestPeer::new("QmAaa").await;
	let b = TestPeer::new("QmBbb").await;
	a.edit("a/b/c.txt", b"hello\n").await;
	link(&a, &b).await;

	trigger_until(&a.engine, "b to receive a/b/c.txt", || async {
		b.abs("a/b/c.txt").exists() && std::fs::read(b.abs("a/b/c.txt")).unwrap() == b"hello\n"
	})
	.await;

	let clock_a = a.clock("a/b/c.txt").await.unwrap();
	let clock_b = b.clock("a/b/c.txt").await.unwrap();
	assert_eq!(clock_a.compare(&clock_b), ClockOrdering::Equal);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s2_concurrent_edit_preserves_both_versions() {
	let a = TestPeer::new("QmAaa").await;
	let b = TestPeer::new("QmBbb").await;

	// Shared base
	a.edit("a.txt", b"v0").await;
	link(&a, &b).await;
	trigger_until(&a.engine, "base to sync", || async { b.abs("a.txt").exists() }).await;

	// Concurrent edits on both sides
	a.edit("a.txt", b"vA").await;
	b.edit("a.txt", b"vB").await;

	trigger_until(&a.engine, "conflict to materialize on both peers", || async {
		let a_files = a.files_on_disk();
		let b_files = b.files_on_disk();
		a_files.len() == 2 && a_files == b_files
	})
	.await;

	for peer in [&a, &b] {
		let files = peer.files_on_disk();
		assert_eq!(files[0], "a.txt");
		assert!(is_conflict_sibling(&files[1]), "{} not a sibling", files[1]);

		let contents: Vec<Vec<u8>> =
			files.iter().map(|f| std::fs::read(peer.abs(f)).unwrap()).collect();
		// One of the versions survives under the original name, the other
		// in the sibling; nothing is lost
		assert!(contents.contains(&b"vA".to_vec()));
		assert!(contents.contains(&b"vB".to_vec()));
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s3_delete_propagates() {
	let a = TestPeer::new("QmAaa").await;
	let b = TestPeer::new("QmBbb").await;

	a.edit("x.txt", b"doomed").await;
	link(&a, &b).await;
	trigger_until(&a.engine, "base to sync", || async { b.abs("x.txt").exists() }).await;

	a.delete("x.txt").await;
	trigger_until(&a.engine, "delete to propagate", || async { !b.abs("x.txt").exists() }).await;

	for peer in [&a, &b] {
		match peer.state("x.txt").await {
			Some(FileState::Deleted(DeletionRecord { deleted_by, clock, .. })) => {
				assert_eq!(deleted_by, "QmAaa");
				assert_eq!(clock.get("QmAaa"), 2);
			}
			other => panic!("expected tombstone, got {:?}", other),
		}
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s4_resurrection_wins_without_conflict() {
	let a = TestPeer::new("QmAaa").await;
	let b = TestPeer::new("QmBbb").await;

	a.edit("y.txt", b"first life").await;
	link(&a, &b).await;
	trigger_until(&a.engine, "base to sync", || async { b.abs("y.txt").exists() }).await;

	a.delete("y.txt").await;
	trigger_until(&a.engine, "delete to propagate", || async { !b.abs("y.txt").exists() }).await;

	// Recreate on A; the new clock dominates the tombstone
	a.edit("y.txt", b"second life").await;
	assert_eq!(a.clock("y.txt").await.unwrap().get("QmAaa"), 3);

	trigger_until(&a.engine, "resurrection to propagate", || async {
		b.abs("y.txt").exists() && std::fs::read(b.abs("y.txt")).unwrap() == b"second life"
	})
	.await;

	for peer in [&a, &b] {
		assert!(
			peer.files_on_disk().iter().all(|f| !is_conflict_sibling(f)),
			"no sibling may appear on a clean resurrection"
		);
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s5_offline_catch_up_gets_final_version() {
	let a = TestPeer::new("QmAaa").await;
	let b = TestPeer::new("QmBbb").await;

	a.edit("log.txt", b"edit 0").await;
	link(&a, &b).await;
	trigger_until(&a.engine, "base to sync", || async { b.abs("log.txt").exists() }).await;

	// Ten edits while B is not syncing
	for i in 1..=10 {
		a.edit("log.txt", format!("edit {}", i).as_bytes()).await;
	}
	assert_eq!(a.clock("log.txt").await.unwrap().get("QmAaa"), 11);

	trigger_until(&b.engine, "catch-up", || async {
		std::fs::read(b.abs("log.txt")).unwrap() == b"edit 10"
	})
	.await;

	let clock_b = b.clock("log.txt").await.unwrap();
	assert_eq!(clock_b.get("QmAaa"), 11);
	assert_eq!(a.clock("log.txt").await.unwrap().compare(&clock_b), ClockOrdering::Equal);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s6_delete_vs_modify_late_edit_resurrects() {
	let a = TestPeer::new("QmAaa").await;
	let b = TestPeer::new("QmBbb").await;
	let now = now_unix();

	// Shared base m.txt with clock {A:1} on both sides
	a.edit("m.txt", b"base").await;
	link(&a, &b).await;
	trigger_until(&a.engine, "base to sync", || async { b.abs("m.txt").exists() }).await;

	// A deleted a while ago (tombstone constructed directly so the deletion
	// time is firmly in the past)
	std::fs::remove_file(a.abs("m.txt")).unwrap();
	a.ctx
		.store
		.set_deleted(
			"m.txt",
			DeletionRecord {
				deleted_at: now - 100,
				deleted_by: "QmAaa".to_string(),
				clock: VectorClock::from([("QmAaa", 2)]),
			},
		)
		.await;

	// B modified well after the delete; clocks are concurrent
	b.edit_with_mtime("m.txt", b"modified offline", now - 50).await;

	trigger_until(&b.engine, "resurrection on both peers", || async {
		a.abs("m.txt").exists()
			&& std::fs::read(a.abs("m.txt")).unwrap() == b"modified offline"
	})
	.await;
	assert!(b.abs("m.txt").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s6_delete_vs_modify_near_edit_deletes() {
	let a = TestPeer::new("QmAaa").await;
	let b = TestPeer::new("QmBbb").await;
	let now = now_unix();

	a.edit("m.txt", b"base").await;
	link(&a, &b).await;
	trigger_until(&a.engine, "base to sync", || async { b.abs("m.txt").exists() }).await;

	std::fs::remove_file(a.abs("m.txt")).unwrap();
	a.ctx
		.store
		.set_deleted(
			"m.txt",
			DeletionRecord {
				deleted_at: now - 100,
				deleted_by: "QmAaa".to_string(),
				clock: VectorClock::from([("QmAaa", 2)]),
			},
		)
		.await;

	// B's edit is within the tie-break window of the delete
	b.edit_with_mtime("m.txt", b"too late", now - 100).await;

	trigger_until(&b.engine, "delete to win on B", || async { !b.abs("m.txt").exists() }).await;
	assert!(!a.abs("m.txt").exists());
	assert!(b.state("m.txt").await.unwrap().is_deleted());
}

// vim: ts=4
