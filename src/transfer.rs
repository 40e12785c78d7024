//! File transfer: whole-file and chunk-level, plus the atomic delete and
//! conflict materialization paths
//!
//! Receivers always land bytes in a temporary file next to the destination,
//! verify the SHA-256, fsync, and rename into place; a failed transfer never
//! leaves a torn file. Files above the block threshold travel as chunk-hash
//! lists so unchanged chunks are never resent.

use crate::blockstore::BlockStore;
use crate::chunker::FastCdc;
use crate::clock::VectorClock;
use crate::conflict::{conflict_sibling_name, ConflictLog, ConflictRecord};
use crate::decision::{decide, decide_resolved};
use crate::error::{SyncError, TransferError};
use crate::protocol::messages::{decode_bytes, encode_bytes, SyncMessage};
use crate::protocol::rpc::PeerHandle;
use crate::store::FileStateStore;
use crate::types::{
	ChunkRef, DeletionRecord, FileMetadata, FileState, PeerId, SyncAction, SyncMode,
};
use crate::util::{now_unix, sha256_hex};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Whole-file transfer deadline
pub const WHOLE_FILE_TIMEOUT: Duration = Duration::from_secs(180);

/// Metadata / chunk-hash-list exchange deadline
pub const META_TIMEOUT: Duration = Duration::from_secs(90);

/// Single chunk fetch deadline
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(60);

/// Parallel chunk fetches per file
const CHUNK_FETCH_CONCURRENCY: usize = 3;

/// Transfer attempts before giving up on a path
const TRANSFER_ATTEMPTS: u32 = 3;

/// Everything a transfer needs to know about one sync folder
pub struct FolderCtx {
	pub sync_id: String,
	pub root: PathBuf,
	pub mode: SyncMode,
	pub self_id: PeerId,
	pub store: Arc<FileStateStore>,
	pub blocks: Arc<BlockStore>,
	pub conflicts: Arc<ConflictLog>,
	pub chunker: FastCdc,
	/// Files at or above this size transfer chunk-wise
	pub threshold: u64,
}

impl FolderCtx {
	pub fn abs(&self, rel: &str) -> PathBuf {
		self.root.join(rel.replace('/', std::path::MAIN_SEPARATOR_STR))
	}
}

/// Retry a transfer step on transient and integrity failures (1 s / 2 s / 4 s)
async fn with_retries<T, F, Fut>(path: &str, mut op: F) -> Result<T, SyncError>
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = Result<T, SyncError>>,
{
	let mut delay = Duration::from_secs(1);
	let mut attempt = 1u32;
	loop {
		match op().await {
			Ok(value) => return Ok(value),
			Err(e) if attempt < TRANSFER_ATTEMPTS
				&& (e.is_transient()
					|| matches!(e, SyncError::Transfer(TransferError::Integrity { .. }))) =>
			{
				tracing::debug!(path, attempt, "transfer step failed, retrying: {}", e);
				tokio::time::sleep(delay).await;
				delay *= 2;
				attempt += 1;
			}
			Err(e) if attempt >= TRANSFER_ATTEMPTS => {
				tracing::warn!(path, "transfer failed after {} attempts: {}", attempt, e);
				return Err(SyncError::Transfer(TransferError::RetriesExhausted {
					path: path.to_string(),
					attempts: attempt,
				}));
			}
			Err(e) => return Err(e),
		}
	}
}

/// Write verified bytes into place: temp file, fsync, rename
async fn install_bytes(
	ctx: &FolderCtx,
	path: &str,
	bytes: &[u8],
	expected_hash: &str,
) -> Result<(), SyncError> {
	let actual = sha256_hex(bytes);
	if actual != expected_hash {
		return Err(SyncError::Transfer(TransferError::Integrity {
			path: path.to_string(),
			expected: expected_hash.to_string(),
			actual,
		}));
	}
	let abs = ctx.abs(path);
	if let Some(parent) = abs.parent() {
		tokio::fs::create_dir_all(parent).await?;
	}
	crate::util::atomic_write(&abs, bytes).await?;
	Ok(())
}

/// Fetch the missing chunks of a chunk list and assemble the file bytes
async fn assemble_from_chunks(
	ctx: &FolderCtx,
	peer: &PeerHandle,
	path: &str,
	chunks: &[ChunkRef],
	meta: &FileMetadata,
) -> Result<Vec<u8>, SyncError> {
	let hashes: Vec<String> = chunks.iter().map(|c| c.hash.clone()).collect();
	let missing = ctx.blocks.missing(&hashes).await;
	tracing::debug!(
		path,
		total = hashes.len(),
		missing = missing.len(),
		"chunk transfer: fetching missing chunks"
	);

	let semaphore = Arc::new(Semaphore::new(CHUNK_FETCH_CONCURRENCY));
	let fetches = missing.iter().map(|hash| {
		let semaphore = Arc::clone(&semaphore);
		let hash = hash.clone();
		async move {
			let _permit = semaphore
				.acquire()
				.await
				.map_err(|_| SyncError::Other { message: "chunk semaphore closed".to_string() })?;
			let response = peer
				.request_with_retry(SyncMessage::GetChunk { hash: hash.clone() }, CHUNK_TIMEOUT)
				.await?;
			match response {
				SyncMessage::ChunkBytes { data, .. } => {
					let bytes = decode_bytes(&data)?;
					// put() verifies the bytes against the hash
					ctx.blocks.put(&hash, &bytes).await?;
					Ok::<_, SyncError>(())
				}
				SyncMessage::NotFound => Err(SyncError::Transfer(TransferError::Unrecoverable {
					path: "chunk".to_string(),
					message: format!("peer lost chunk {}", hash),
				})),
				other => Err(SyncError::Protocol(
					crate::error::ProtocolError::UnexpectedResponse {
						expected: "chunk_bytes",
						got: other.kind().to_string(),
					},
				)),
			}
		}
	});
	for result in futures::future::join_all(fetches).await {
		result?;
	}

	let mut bytes = Vec::with_capacity(meta.size as usize);
	for chunk in chunks {
		match ctx.blocks.get(&chunk.hash).await? {
			Some(data) => bytes.extend_from_slice(&data),
			None => {
				return Err(SyncError::Transfer(TransferError::Unrecoverable {
					path: path.to_string(),
					message: format!("chunk {} missing after fetch", chunk.hash),
				}));
			}
		}
	}
	Ok(bytes)
}

/// Fetch a remote file's bytes and metadata, chunk-wise when offered, with
/// whole-file fallback when reassembly fails
pub async fn fetch_remote_file(
	ctx: &FolderCtx,
	peer: &PeerHandle,
	path: &str,
) -> Result<(Vec<u8>, FileMetadata), SyncError> {
	let response = peer
		.request_with_retry(
			SyncMessage::GetFile {
				sync_id: ctx.sync_id.clone(),
				path: path.to_string(),
				whole: false,
			},
			META_TIMEOUT,
		)
		.await?;

	match response {
		SyncMessage::FileWhole { data, meta, .. } => Ok((decode_bytes(&data)?, meta)),
		SyncMessage::FileChunks { chunks, meta, .. } => {
			match assemble_from_chunks(ctx, peer, path, &chunks, &meta).await {
				Ok(bytes) => {
					let actual = sha256_hex(&bytes);
					if actual == meta.hash {
						return Ok((bytes, meta));
					}
					tracing::warn!(path, "reassembly hash mismatch, falling back to whole file");
				}
				Err(e) => {
					tracing::warn!(path, "chunk transfer failed ({}), falling back", e);
				}
			}
			let response = peer
				.request_with_retry(
					SyncMessage::GetFile {
						sync_id: ctx.sync_id.clone(),
						path: path.to_string(),
						whole: true,
					},
					WHOLE_FILE_TIMEOUT,
				)
				.await?;
			match response {
				SyncMessage::FileWhole { data, meta, .. } => Ok((decode_bytes(&data)?, meta)),
				other => Err(SyncError::Protocol(
					crate::error::ProtocolError::UnexpectedResponse {
						expected: "file_whole",
						got: other.kind().to_string(),
					},
				)),
			}
		}
		SyncMessage::NotFound => Err(SyncError::Other {
			message: format!("peer no longer has {}", path),
		}),
		other => Err(SyncError::Protocol(crate::error::ProtocolError::UnexpectedResponse {
			expected: "file_whole or file_chunks",
			got: other.kind().to_string(),
		})),
	}
}

/// Download one path from the peer and install it locally
pub async fn download_file(
	ctx: &FolderCtx,
	peer: &PeerHandle,
	path: &str,
) -> Result<(), SyncError> {
	with_retries(path, || async {
		let (bytes, meta) = fetch_remote_file(ctx, peer, path).await?;
		if meta.is_dir {
			tokio::fs::create_dir_all(ctx.abs(path)).await?;
		} else {
			install_bytes(ctx, path, &bytes, &meta.hash).await?;
		}
		ctx.store.set_exists(path, meta).await;
		Ok(())
	})
	.await
}

/// Push one local path to the peer
///
/// Returns `false` when the peer rejected the push (stale or policy); the
/// next session reconciles.
pub async fn upload_file(ctx: &FolderCtx, peer: &PeerHandle, path: &str) -> Result<bool, SyncError> {
	let meta = match ctx.store.get(path).await {
		Some(FileState::Exists(meta)) => meta,
		_ => {
			return Err(SyncError::Other {
				message: format!("upload of {} without local state", path),
			});
		}
	};

	let (message, timeout) = if meta.is_dir {
		(
			SyncMessage::PutFile {
				sync_id: ctx.sync_id.clone(),
				path: path.to_string(),
				data: None,
				chunks: None,
				meta: meta.clone(),
			},
			META_TIMEOUT,
		)
	} else if meta.size >= ctx.threshold {
		// Chunk list: seed our block store so the peer can pull what it lacks
		let chunks = ctx.chunker.chunk_file(&ctx.abs(path)).await?;
		let mut refs = Vec::with_capacity(chunks.len());
		for chunk in &chunks {
			ctx.blocks.put(&chunk.hash, &chunk.data).await?;
			refs.push(chunk.chunk_ref());
		}
		(
			SyncMessage::PutFile {
				sync_id: ctx.sync_id.clone(),
				path: path.to_string(),
				data: None,
				chunks: Some(refs),
				meta: meta.clone(),
			},
			META_TIMEOUT,
		)
	} else {
		let bytes = tokio::fs::read(ctx.abs(path)).await?;
		(
			SyncMessage::PutFile {
				sync_id: ctx.sync_id.clone(),
				path: path.to_string(),
				data: Some(encode_bytes(&bytes)),
				chunks: None,
				meta: meta.clone(),
			},
			WHOLE_FILE_TIMEOUT,
		)
	};

	let response = with_retries(path, || {
		let message = message.clone();
		async move { Ok(peer.request(message, timeout).await?) }
	})
	.await?;

	match response {
		SyncMessage::Ack => Ok(true),
		SyncMessage::Reject { reason } => {
			tracing::debug!(path, peer = %peer.peer_id(), "push rejected: {}", reason);
			Ok(false)
		}
		other => Err(SyncError::Protocol(crate::error::ProtocolError::UnexpectedResponse {
			expected: "ack",
			got: other.kind().to_string(),
		})),
	}
}

/// Apply an incoming `PutFile` through the decision flow
///
/// `peer` is the back-channel to the sender, needed to pull missing chunks of
/// a chunk-list push.
pub async fn apply_incoming_file(
	ctx: &FolderCtx,
	from_peer: &PeerId,
	peer: Option<&PeerHandle>,
	path: &str,
	data: Option<String>,
	chunks: Option<Vec<ChunkRef>>,
	meta: FileMetadata,
) -> SyncMessage {
	if ctx.mode == SyncMode::UploadOnly {
		return SyncMessage::Reject { reason: "folder is upload-only".to_string() };
	}

	let local = ctx.store.get(path).await;
	let remote = FileState::Exists(meta.clone());
	let action = decide_resolved(local.as_ref(), Some(&remote));

	match action {
		SyncAction::Skip => SyncMessage::Ack,
		SyncAction::Download => {
			match receive_payload(ctx, peer, path, data, chunks, &meta).await {
				Ok(bytes) => match install_payload(ctx, path, bytes, &meta).await {
					Ok(()) => {
						ctx.store.set_exists(path, meta).await;
						SyncMessage::Ack
					}
					Err(e) => SyncMessage::Reject { reason: e.to_string() },
				},
				Err(e) => SyncMessage::Reject { reason: e.to_string() },
			}
		}
		SyncAction::Conflict => {
			match receive_payload(ctx, peer, path, data, chunks, &meta).await {
				Ok(Some(bytes)) => {
					match preserve_conflict_sibling(ctx, from_peer, path, &bytes, &meta).await {
						Ok(_) => SyncMessage::Ack,
						Err(e) => SyncMessage::Reject { reason: e.to_string() },
					}
				}
				Ok(None) => SyncMessage::Ack,
				Err(e) => SyncMessage::Reject { reason: e.to_string() },
			}
		}
		// Local state dominates; the sender reconciles on its next session
		SyncAction::Upload | SyncAction::DeleteRemote => {
			SyncMessage::Reject { reason: "stale push".to_string() }
		}
		SyncAction::DeleteLocal | SyncAction::Uncertain => {
			SyncMessage::Reject { reason: "inconsistent push".to_string() }
		}
	}
}

/// Collect the pushed bytes; `None` for directories
async fn receive_payload(
	ctx: &FolderCtx,
	peer: Option<&PeerHandle>,
	path: &str,
	data: Option<String>,
	chunks: Option<Vec<ChunkRef>>,
	meta: &FileMetadata,
) -> Result<Option<Vec<u8>>, SyncError> {
	if meta.is_dir {
		return Ok(None);
	}
	if let Some(data) = data {
		return Ok(Some(decode_bytes(&data)?));
	}
	if let Some(chunks) = chunks {
		let peer = peer.ok_or_else(|| SyncError::Other {
			message: "chunk push without a back-channel".to_string(),
		})?;
		return Ok(Some(assemble_from_chunks(ctx, peer, path, &chunks, meta).await?));
	}
	Err(SyncError::Other { message: "push carried neither bytes nor chunks".to_string() })
}

async fn install_payload(
	ctx: &FolderCtx,
	path: &str,
	bytes: Option<Vec<u8>>,
	meta: &FileMetadata,
) -> Result<(), SyncError> {
	match bytes {
		None => {
			tokio::fs::create_dir_all(ctx.abs(path)).await?;
			Ok(())
		}
		Some(bytes) => install_bytes(ctx, path, &bytes, &meta.hash).await,
	}
}

/// Keep the local version, land the pushed version as a conflict sibling
async fn preserve_conflict_sibling(
	ctx: &FolderCtx,
	from_peer: &PeerId,
	path: &str,
	remote_bytes: &[u8],
	remote_meta: &FileMetadata,
) -> Result<String, SyncError> {
	let now = now_unix();
	let (dir, name) = match path.rsplit_once('/') {
		Some((dir, name)) => (Some(dir), name),
		None => (None, path),
	};
	let sibling_name = conflict_sibling_name(name, from_peer, now);
	let sibling_rel = match dir {
		Some(dir) => format!("{}/{}", dir, sibling_name),
		None => sibling_name,
	};

	install_bytes(ctx, &sibling_rel, remote_bytes, &remote_meta.hash).await?;

	let mut sibling_clock = VectorClock::new();
	sibling_clock.increment(&ctx.self_id);
	ctx.store
		.set_exists(
			&sibling_rel,
			FileMetadata {
				hash: remote_meta.hash.clone(),
				size: remote_bytes.len() as u64,
				mtime: now,
				ctime: now,
				clock: Some(sibling_clock),
				is_dir: false,
			},
		)
		.await;

	// Advance the surviving file past both histories so it propagates
	// cleanly instead of re-conflicting
	let local_hash = match ctx.store.get(path).await {
		Some(FileState::Exists(mut meta)) => {
			let mut clock = meta.clock.take().unwrap_or_default();
			if let Some(remote_clock) = &remote_meta.clock {
				clock.merge(remote_clock);
			}
			clock.increment(&ctx.self_id);
			meta.clock = Some(clock);
			let hash = meta.hash.clone();
			ctx.store.set_exists(path, meta).await;
			hash
		}
		_ => String::new(),
	};

	ctx.conflicts
		.append(ConflictRecord {
			path: path.to_string(),
			sibling: sibling_rel.clone(),
			peer_id: from_peer.clone(),
			local_hash,
			remote_hash: remote_meta.hash.clone(),
			created_at: now,
		})
		.await?;

	tracing::info!(
		sync_id = %ctx.sync_id,
		path,
		sibling = %sibling_rel,
		peer = %from_peer,
		"conflict preserved as sibling"
	);
	Ok(sibling_rel)
}

/// Session-side conflict handling: fetch the remote version, preserve it as
/// a sibling, then push both the surviving file and the sibling so the pair
/// converges everywhere
pub async fn materialize_conflict(
	ctx: &FolderCtx,
	peer: &PeerHandle,
	path: &str,
) -> Result<(), SyncError> {
	let (bytes, remote_meta) = fetch_remote_file(ctx, peer, path).await?;
	if remote_meta.is_dir {
		// Directories cannot conflict on content
		return Ok(());
	}
	let sibling =
		preserve_conflict_sibling(ctx, peer.peer_id(), path, &bytes, &remote_meta).await?;

	upload_file(ctx, peer, path).await?;
	upload_file(ctx, peer, &sibling).await?;
	Ok(())
}

/// Apply an incoming tombstone through the decision flow
pub async fn apply_remote_delete(
	ctx: &FolderCtx,
	path: &str,
	record: DeletionRecord,
) -> SyncMessage {
	if ctx.mode == SyncMode::UploadOnly {
		return SyncMessage::Reject { reason: "folder is upload-only".to_string() };
	}

	let local = ctx.store.get(path).await;
	let remote = FileState::Deleted(record.clone());
	match decide(local.as_ref(), Some(&remote)) {
		SyncAction::DeleteLocal => {
			match remove_local_path(ctx, path).await {
				Ok(()) => {
					ctx.store.set_deleted(path, record).await;
					SyncMessage::Ack
				}
				Err(e) => SyncMessage::Reject { reason: e.to_string() },
			}
		}
		SyncAction::Skip => SyncMessage::Ack,
		// Local resurrection or a newer edit wins
		_ => SyncMessage::Reject { reason: "local state dominates tombstone".to_string() },
	}
}

async fn remove_local_path(ctx: &FolderCtx, path: &str) -> Result<(), SyncError> {
	let abs = ctx.abs(path);
	let result = match tokio::fs::metadata(&abs).await {
		Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&abs).await,
		Ok(_) => tokio::fs::remove_file(&abs).await,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
		Err(e) => return Err(e.into()),
	};
	match result {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(e.into()),
	}
}

/// Atomic local delete: clock increment, tombstone, then filesystem removal,
/// compensating the store if the removal fails
pub async fn atomic_local_delete(ctx: &FolderCtx, path: &str) -> Result<DeletionRecord, SyncError> {
	let prior = ctx.store.get(path).await;
	let clock = ctx.store.next_clock(path, &ctx.self_id).await;
	let record = DeletionRecord {
		deleted_at: now_unix(),
		deleted_by: ctx.self_id.clone(),
		clock,
	};
	ctx.store.set_deleted(path, record.clone()).await;

	if let Err(e) = remove_local_path(ctx, path).await {
		// Roll back: no session may observe tombstone + file together
		match prior {
			Some(FileState::Exists(meta)) => ctx.store.set_exists(path, meta).await,
			Some(FileState::Deleted(rec)) => ctx.store.set_deleted(path, rec).await,
			None => ctx.store.remove(path).await,
		}
		return Err(e);
	}
	Ok(record)
}

/// Send our tombstone for `path` to the peer
pub async fn push_delete(
	ctx: &FolderCtx,
	peer: &PeerHandle,
	path: &str,
	record: DeletionRecord,
) -> Result<bool, SyncError> {
	let response = peer
		.request_with_retry(
			SyncMessage::Delete {
				sync_id: ctx.sync_id.clone(),
				path: path.to_string(),
				record,
			},
			META_TIMEOUT,
		)
		.await?;
	match response {
		SyncMessage::Ack => Ok(true),
		SyncMessage::Reject { reason } => {
			tracing::debug!(path, peer = %peer.peer_id(), "delete rejected: {}", reason);
			Ok(false)
		}
		other => Err(SyncError::Protocol(crate::error::ProtocolError::UnexpectedResponse {
			expected: "ack",
			got: other.kind().to_string(),
		})),
	}
}


// vim: ts=4
