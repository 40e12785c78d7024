//! Request responder
//!
//! Serves a connected peer's requests against the local stores and
//! filesystem. Pure lookup requests answer directly; pushes run through the
//! decision flow in `transfer`, so a peer can never overwrite state it does
//! not causally dominate.

use super::messages::{encode_bytes, states_to_files, SyncMessage};
use super::rpc::{PeerHandle, RequestHandler};
use crate::transfer::{self, FolderCtx};
use crate::types::{FileState, PeerId};
use crate::util::sha256_file;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

pub type FolderMap = Arc<RwLock<BTreeMap<String, Arc<FolderCtx>>>>;
pub type PeerMap = Arc<RwLock<BTreeMap<PeerId, PeerHandle>>>;

/// Handles every request arriving from connected peers
pub struct EngineHandler {
	self_id: PeerId,
	folders: FolderMap,
	peers: PeerMap,
	/// Remote `SyncRequest` triggers, drained by the engine
	triggers: mpsc::Sender<(PeerId, String)>,
}

impl EngineHandler {
	pub fn new(
		self_id: PeerId,
		folders: FolderMap,
		peers: PeerMap,
		triggers: mpsc::Sender<(PeerId, String)>,
	) -> Self {
		EngineHandler { self_id, folders, peers, triggers }
	}

	async fn folder(&self, sync_id: &str) -> Option<Arc<FolderCtx>> {
		self.folders.read().await.get(sync_id).cloned()
	}

	async fn serve_file(&self, ctx: &FolderCtx, path: &str, whole: bool) -> SyncMessage {
		let mut meta = match ctx.store.get(path).await {
			Some(FileState::Exists(meta)) => meta,
			_ => return SyncMessage::NotFound,
		};
		if meta.is_dir {
			return SyncMessage::FileWhole {
				path: path.to_string(),
				data: encode_bytes(b""),
				meta,
			};
		}

		let abs = ctx.abs(path);
		if !whole && meta.size >= ctx.threshold {
			// Large file: hand out the chunk list and seed our block store
			let actual_hash = match sha256_file(&abs).await {
				Ok(hash) => hash,
				Err(e) => return SyncMessage::Reject { reason: e.to_string() },
			};
			let chunks = match ctx.chunker.chunk_file(&abs).await {
				Ok(chunks) => chunks,
				Err(e) => return SyncMessage::Reject { reason: e.to_string() },
			};
			let mut refs = Vec::with_capacity(chunks.len());
			for chunk in &chunks {
				if let Err(e) = ctx.blocks.put(&chunk.hash, &chunk.data).await {
					return SyncMessage::Reject { reason: e.to_string() };
				}
				refs.push(chunk.chunk_ref());
			}
			meta.hash = actual_hash;
			meta.size = chunks.iter().map(|c| c.data.len() as u64).sum();
			return SyncMessage::FileChunks { path: path.to_string(), chunks: refs, meta };
		}

		match tokio::fs::read(&abs).await {
			Ok(bytes) => {
				// The file may have moved on since the store last saw it;
				// what we send must describe the bytes we send
				meta.hash = crate::util::sha256_hex(&bytes);
				meta.size = bytes.len() as u64;
				SyncMessage::FileWhole {
					path: path.to_string(),
					data: encode_bytes(&bytes),
					meta,
				}
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => SyncMessage::NotFound,
			Err(e) => SyncMessage::Reject { reason: e.to_string() },
		}
	}
}

#[async_trait]
impl RequestHandler for EngineHandler {
	async fn handle(&self, peer_id: &PeerId, message: SyncMessage) -> SyncMessage {
		match message {
			SyncMessage::Hello { peer_id: their_id, .. } => {
				tracing::debug!(peer = %their_id, "hello received");
				let sync_ids = self.folders.read().await.keys().cloned().collect();
				SyncMessage::Hello { peer_id: self.self_id.clone(), sync_ids }
			}

			SyncMessage::GetStates { sync_id, paths } => match self.folder(&sync_id).await {
				Some(ctx) => {
					let mut states = ctx.store.all_states().await;
					if let Some(paths) = paths {
						let wanted: std::collections::BTreeSet<String> =
							paths.into_iter().collect();
						states.retain(|path, _| wanted.contains(path));
					}
					SyncMessage::States { sync_id, states }
				}
				None => SyncMessage::Reject { reason: format!("unknown sync-id {}", sync_id) },
			},

			SyncMessage::GetMst { sync_id } => match self.folder(&sync_id).await {
				Some(ctx) => {
					let root = ctx.store.mst().await.root_hash();
					SyncMessage::MstRoot { sync_id, root }
				}
				None => SyncMessage::Reject { reason: format!("unknown sync-id {}", sync_id) },
			},

			SyncMessage::GetSubtree { sync_id, prefix } => match self.folder(&sync_id).await {
				Some(ctx) => {
					let entries = ctx.store.mst().await.entries_with_prefix(&prefix);
					SyncMessage::SubtreeEntries { sync_id, entries }
				}
				None => SyncMessage::Reject { reason: format!("unknown sync-id {}", sync_id) },
			},

			SyncMessage::GetFile { sync_id, path, whole } => match self.folder(&sync_id).await {
				Some(ctx) => self.serve_file(&ctx, &path, whole).await,
				None => SyncMessage::Reject { reason: format!("unknown sync-id {}", sync_id) },
			},

			SyncMessage::GetChunk { hash } => {
				// The block store is global; any folder context serves it
				let ctx = self.folders.read().await.values().next().cloned();
				match ctx {
					Some(ctx) => match ctx.blocks.get(&hash).await {
						Ok(Some(bytes)) => {
							SyncMessage::ChunkBytes { hash, data: encode_bytes(&bytes) }
						}
						Ok(None) => SyncMessage::NotFound,
						Err(e) => SyncMessage::Reject { reason: e.to_string() },
					},
					None => SyncMessage::Reject { reason: "no folders configured".to_string() },
				}
			}

			SyncMessage::PutFile { sync_id, path, data, chunks, meta } => {
				match self.folder(&sync_id).await {
					Some(ctx) => {
						let peers = self.peers.read().await;
						let handle = peers.get(peer_id).cloned();
						drop(peers);
						transfer::apply_incoming_file(
							&ctx,
							peer_id,
							handle.as_ref(),
							&path,
							data,
							chunks,
							meta,
						)
						.await
					}
					None => {
						SyncMessage::Reject { reason: format!("unknown sync-id {}", sync_id) }
					}
				}
			}

			SyncMessage::PutChunk { hash, data } => {
				let ctx = self.folders.read().await.values().next().cloned();
				match ctx {
					Some(ctx) => {
						let bytes = match super::messages::decode_bytes(&data) {
							Ok(bytes) => bytes,
							Err(e) => return SyncMessage::Reject { reason: e.to_string() },
						};
						match ctx.blocks.put(&hash, &bytes).await {
							Ok(()) => SyncMessage::Ack,
							Err(e) => SyncMessage::Reject { reason: e.to_string() },
						}
					}
					None => SyncMessage::Reject { reason: "no folders configured".to_string() },
				}
			}

			SyncMessage::Delete { sync_id, path, record } => {
				match self.folder(&sync_id).await {
					Some(ctx) => transfer::apply_remote_delete(&ctx, &path, record).await,
					None => {
						SyncMessage::Reject { reason: format!("unknown sync-id {}", sync_id) }
					}
				}
			}

			SyncMessage::SyncRequest { sync_id } => {
				if self.folder(&sync_id).await.is_none() {
					return SyncMessage::Reject {
						reason: format!("unknown sync-id {}", sync_id),
					};
				}
				let _ = self.triggers.send((peer_id.clone(), sync_id)).await;
				SyncMessage::Ack
			}

			SyncMessage::GetFiles { sync_id } => match self.folder(&sync_id).await {
				Some(ctx) => {
					let states = ctx.store.all_states().await;
					let (entries, deleted_paths) = states_to_files(&states);
					SyncMessage::Files { sync_id, entries, deleted_paths }
				}
				None => SyncMessage::Reject { reason: format!("unknown sync-id {}", sync_id) },
			},

			other => SyncMessage::Reject {
				reason: format!("unexpected request {}", other.kind()),
			},
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::blockstore::BlockStore;
	use crate::chunker::FastCdc;
	use crate::clock::VectorClock;
	use crate::conflict::ConflictLog;
	use crate::store::FileStateStore;
	use crate::types::{FileMetadata, SyncMode};
	use crate::util::sha256_hex;
	use tempfile::TempDir;

	async fn handler_with_folder(tmp: &TempDir) -> (EngineHandler, Arc<FolderCtx>) {
		let root = tmp.path().join("folder");
		std::fs::create_dir_all(&root).unwrap();
		let ctx = Arc::new(FolderCtx {
			sync_id: "served-folder".to_string(),
			root,
			mode: SyncMode::TwoWay,
			self_id: "QmSelf".to_string(),
			store: Arc::new(FileStateStore::in_memory("served-folder")),
			blocks: Arc::new(BlockStore::open(&tmp.path().join("blocks")).await.unwrap()),
			conflicts: Arc::new(ConflictLog::new(&tmp.path().join("conflicts"), "served-folder")),
			chunker: FastCdc::default(),
			threshold: 1024 * 1024,
		});
		let folders: FolderMap = Arc::new(RwLock::new(BTreeMap::new()));
		folders.write().await.insert("served-folder".to_string(), Arc::clone(&ctx));
		let peers: PeerMap = Arc::new(RwLock::new(BTreeMap::new()));
		let (tx, _rx) = mpsc::channel(8);
		(EngineHandler::new("QmSelf".to_string(), folders, peers, tx), ctx)
	}

	#[tokio::test]
	async fn test_hello_answers_identity() {
		let tmp = TempDir::new().unwrap();
		let (handler, _ctx) = handler_with_folder(&tmp).await;
		let response = handler
			.handle(
				&"QmOther".to_string(),
				SyncMessage::Hello { peer_id: "QmOther".to_string(), sync_ids: vec![] },
			)
			.await;
		match response {
			SyncMessage::Hello { peer_id, sync_ids } => {
				assert_eq!(peer_id, "QmSelf");
				assert_eq!(sync_ids, vec!["served-folder".to_string()]);
			}
			other => panic!("unexpected {:?}", other),
		}
	}

	#[tokio::test]
	async fn test_get_states_includes_tombstones_and_filters() {
		let tmp = TempDir::new().unwrap();
		let (handler, ctx) = handler_with_folder(&tmp).await;
		ctx.store
			.set_exists(
				"a.txt",
				FileMetadata {
					hash: "ha".to_string(),
					size: 1,
					mtime: 1,
					ctime: 1,
					clock: Some(VectorClock::from([("QmSelf", 1)])),
					is_dir: false,
				},
			)
			.await;
		ctx.store
			.set_deleted(
				"b.txt",
				crate::types::DeletionRecord {
					deleted_at: 2,
					deleted_by: "QmSelf".to_string(),
					clock: VectorClock::from([("QmSelf", 2)]),
				},
			)
			.await;

		let response = handler
			.handle(
				&"QmOther".to_string(),
				SyncMessage::GetStates { sync_id: "served-folder".to_string(), paths: None },
			)
			.await;
		match response {
			SyncMessage::States { states, .. } => {
				assert_eq!(states.len(), 2);
				assert!(states["b.txt"].is_deleted());
			}
			other => panic!("unexpected {:?}", other),
		}

		let response = handler
			.handle(
				&"QmOther".to_string(),
				SyncMessage::GetStates {
					sync_id: "served-folder".to_string(),
					paths: Some(vec!["b.txt".to_string()]),
				},
			)
			.await;
		match response {
			SyncMessage::States { states, .. } => {
				assert_eq!(states.len(), 1);
				assert!(states.contains_key("b.txt"));
			}
			other => panic!("unexpected {:?}", other),
		}
	}

	#[tokio::test]
	async fn test_serve_small_file_whole() {
		let tmp = TempDir::new().unwrap();
		let (handler, ctx) = handler_with_folder(&tmp).await;
		std::fs::write(ctx.abs("f.txt"), b"small contents").unwrap();
		ctx.store
			.set_exists(
				"f.txt",
				FileMetadata {
					hash: sha256_hex(b"small contents"),
					size: 14,
					mtime: 1,
					ctime: 1,
					clock: Some(VectorClock::from([("QmSelf", 1)])),
					is_dir: false,
				},
			)
			.await;

		let response = handler
			.handle(
				&"QmOther".to_string(),
				SyncMessage::GetFile {
					sync_id: "served-folder".to_string(),
					path: "f.txt".to_string(),
					whole: false,
				},
			)
			.await;
		match response {
			SyncMessage::FileWhole { data, meta, .. } => {
				assert_eq!(super::super::messages::decode_bytes(&data).unwrap(), b"small contents");
				assert_eq!(meta.hash, sha256_hex(b"small contents"));
			}
			other => panic!("unexpected {:?}", other),
		}
	}

	#[tokio::test]
	async fn test_unknown_sync_id_rejected() {
		let tmp = TempDir::new().unwrap();
		let (handler, _ctx) = handler_with_folder(&tmp).await;
		let response = handler
			.handle(
				&"QmOther".to_string(),
				SyncMessage::GetMst { sync_id: "not-a-folder".to_string() },
			)
			.await;
		assert!(matches!(response, SyncMessage::Reject { .. }));
	}

	#[tokio::test]
	async fn test_legacy_files_projection() {
		let tmp = TempDir::new().unwrap();
		let (handler, ctx) = handler_with_folder(&tmp).await;
		ctx.store
			.set_deleted(
				"old.txt",
				crate::types::DeletionRecord {
					deleted_at: 2,
					deleted_by: "QmSelf".to_string(),
					clock: VectorClock::from([("QmSelf", 2)]),
				},
			)
			.await;

		let response = handler
			.handle(
				&"QmOther".to_string(),
				SyncMessage::GetFiles { sync_id: "served-folder".to_string() },
			)
			.await;
		match response {
			SyncMessage::Files { entries, deleted_paths, .. } => {
				assert!(entries.is_empty());
				assert_eq!(deleted_paths, vec!["old.txt".to_string()]);
			}
			other => panic!("unexpected {:?}", other),
		}
	}
}

// vim: ts=4
