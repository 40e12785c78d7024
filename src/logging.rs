//! Logging prelude and the on-disk sync log
//!
//! Re-exports the tracing macros so call sites stay short, and provides the
//! append-only JSON sync log surfaced to the user: one line per noteworthy
//! sync event, size-bounded with single-file rotation.

pub use tracing::{debug, error, info, trace, warn};

use crate::util::now_unix;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Rotate when the log grows past this size
const MAX_LOG_BYTES: u64 = 4 * 1024 * 1024;

/// Initialize the tracing subscriber with environment filter support.
///
/// Logs at INFO and above by default; control with `RUST_LOG`:
///
/// ```bash
/// RUST_LOG=debug meshsync run
/// RUST_LOG=meshsync::engine=trace meshsync run
/// ```
pub fn init_tracing() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.with_writer(std::io::stderr)
		.init();
}

/// One sync log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
	pub ts: i64,
	pub level: String,
	pub sync_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub path: Option<String>,
	pub event: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub detail: Option<String>,
}

impl SyncLogEntry {
	pub fn info(sync_id: &str, event: &str) -> Self {
		SyncLogEntry {
			ts: now_unix(),
			level: "info".to_string(),
			sync_id: sync_id.to_string(),
			path: None,
			event: event.to_string(),
			detail: None,
		}
	}

	pub fn warn(sync_id: &str, event: &str) -> Self {
		SyncLogEntry { level: "warn".to_string(), ..SyncLogEntry::info(sync_id, event) }
	}

	pub fn with_path(mut self, path: &str) -> Self {
		self.path = Some(path.to_string());
		self
	}

	pub fn with_detail(mut self, detail: &str) -> Self {
		self.detail = Some(detail.to_string());
		self
	}
}

/// Append-only JSON-lines sync log under `logs/sync.json`
pub struct SyncLog {
	path: PathBuf,
}

impl SyncLog {
	pub fn new(logs_dir: &Path) -> Self {
		SyncLog { path: logs_dir.join("sync.json") }
	}

	pub async fn append(&self, entry: SyncLogEntry) -> io::Result<()> {
		if let Some(parent) = self.path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		self.rotate_if_needed().await?;
		let mut line = serde_json::to_string(&entry)
			.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
		line.push('\n');
		let mut file = tokio::fs::OpenOptions::new()
			.create(true)
			.append(true)
			.open(&self.path)
			.await?;
		file.write_all(line.as_bytes()).await?;
		Ok(())
	}

	async fn rotate_if_needed(&self) -> io::Result<()> {
		let size = match tokio::fs::metadata(&self.path).await {
			Ok(meta) => meta.len(),
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
			Err(e) => return Err(e),
		};
		if size >= MAX_LOG_BYTES {
			let rotated = self.path.with_extension("json.1");
			tokio::fs::rename(&self.path, &rotated).await?;
		}
		Ok(())
	}

	/// Read back all entries, skipping unparsable lines
	pub async fn read_all(&self) -> io::Result<Vec<SyncLogEntry>> {
		match tokio::fs::read_to_string(&self.path).await {
			Ok(contents) => Ok(contents
				.lines()
				.filter_map(|line| serde_json::from_str(line).ok())
				.collect()),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
			Err(e) => Err(e),
		}
	}
}


// vim: ts=4
