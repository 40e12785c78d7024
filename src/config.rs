//! Configuration: app data directory, folder list, environment overrides

use crate::error::SyncError;
use crate::types::SyncFolder;
use crate::util::valid_sync_id;
use std::env;
use std::path::{Path, PathBuf};

/// Default threshold above which files transfer chunk-wise (1 MiB)
pub const DEFAULT_BLOCK_THRESHOLD: u64 = 1024 * 1024;

/// Resolve the app data directory
///
/// `$MESHSYNC_HOME` wins, otherwise `~/.meshsync`.
pub fn data_dir() -> Result<PathBuf, SyncError> {
	if let Ok(dir) = env::var("MESHSYNC_HOME") {
		return Ok(PathBuf::from(dir));
	}
	match env::var("HOME") {
		Ok(home) => Ok(PathBuf::from(home).join(".meshsync")),
		Err(_) => Err(SyncError::InvalidConfig {
			message: "cannot determine home directory; set MESHSYNC_HOME".to_string(),
		}),
	}
}

/// Chunk-transfer threshold with environment override
///
/// `MESHSYNC_BLOCK_THRESHOLD_BYTES` wins; the legacy `SYNC_BLOCK_THRESHOLD_BYTES`
/// name is still honored.
pub fn block_threshold() -> u64 {
	for name in ["MESHSYNC_BLOCK_THRESHOLD_BYTES", "SYNC_BLOCK_THRESHOLD_BYTES"] {
		if let Ok(value) = env::var(name) {
			if let Ok(parsed) = value.trim().parse::<u64>() {
				return parsed;
			}
			tracing::warn!("ignoring unparsable {}={}", name, value);
		}
	}
	DEFAULT_BLOCK_THRESHOLD
}

/// Parse a boolean-ish environment value: 0|1|true|false|yes|no|on|off
pub fn parse_env_bool(value: &str) -> Option<bool> {
	match value.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

/// Whether LAN discovery is requested; a collaborator hint, unused by the
/// core itself
pub fn mdns_enabled() -> bool {
	for name in ["MESHSYNC_MDNS_ENABLED", "SYNC_MDNS_ENABLED"] {
		if let Ok(value) = env::var(name) {
			if let Some(parsed) = parse_env_bool(&value) {
				return parsed;
			}
		}
	}
	true
}

/// Application configuration rooted at the data directory
#[derive(Debug, Clone)]
pub struct AppConfig {
	pub data_dir: PathBuf,
	pub folders: Vec<SyncFolder>,
}

impl AppConfig {
	/// Load `folders.json`, tolerating comments and trailing commas
	pub async fn load(data_dir: &Path) -> Result<Self, SyncError> {
		let folders_path = data_dir.join("folders.json");
		let folders: Vec<SyncFolder> = match tokio::fs::read_to_string(&folders_path).await {
			Ok(contents) => json5::from_str(&contents).map_err(|e| SyncError::InvalidConfig {
				message: format!("failed to parse {}: {}", folders_path.display(), e),
			})?,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
			Err(e) => return Err(e.into()),
		};

		let config = AppConfig { data_dir: data_dir.to_path_buf(), folders };
		config.validate()?;
		Ok(config)
	}

	pub async fn save(&self) -> Result<(), SyncError> {
		tokio::fs::create_dir_all(&self.data_dir).await?;
		let json =
			serde_json::to_string_pretty(&self.folders).map_err(|e| SyncError::InvalidConfig {
				message: format!("failed to serialize folders: {}", e),
			})?;
		crate::util::atomic_write(&self.data_dir.join("folders.json"), json.as_bytes())
			.await
			.map_err(SyncError::from)
	}

	pub fn validate(&self) -> Result<(), SyncError> {
		let mut seen = std::collections::BTreeSet::new();
		for folder in &self.folders {
			if !valid_sync_id(&folder.sync_id) {
				return Err(SyncError::InvalidConfig {
					message: format!("invalid sync-id '{}'", folder.sync_id),
				});
			}
			if !folder.path.is_absolute() {
				return Err(SyncError::InvalidConfig {
					message: format!(
						"folder path must be absolute: {}",
						folder.path.display()
					),
				});
			}
			if !seen.insert(&folder.sync_id) {
				return Err(SyncError::InvalidConfig {
					message: format!("duplicate sync-id '{}'", folder.sync_id),
				});
			}
		}
		Ok(())
	}

	pub fn folder(&self, sync_id: &str) -> Option<&SyncFolder> {
		self.folders.iter().find(|f| f.sync_id == sync_id)
	}

	pub fn state_dir(&self) -> PathBuf {
		self.data_dir.join("state")
	}

	pub fn blocks_dir(&self) -> PathBuf {
		self.data_dir.join("blocks")
	}

	pub fn conflicts_dir(&self) -> PathBuf {
		self.data_dir.join("conflicts")
	}

	pub fn logs_dir(&self) -> PathBuf {
		self.data_dir.join("logs")
	}

	pub fn peers_path(&self) -> PathBuf {
		self.data_dir.join("peers.json")
	}

	pub fn scan_cache_path(&self) -> PathBuf {
		self.data_dir.join("cache").join("scan.redb")
	}
}


// vim: ts=4
