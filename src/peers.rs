//! Known-peer registry
//!
//! Persists what we know about other devices: their last-seen addresses and
//! the sync-ids they share with us. The engine's fan-out consults this to
//! decide which connected peers care about a given folder.

use crate::error::SyncError;
use crate::types::PeerId;
use crate::util::{now_unix, valid_peer_id};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
	#[serde(default)]
	pub addresses: Vec<String>,

	#[serde(default)]
	pub sync_ids: BTreeSet<String>,

	#[serde(default)]
	pub last_seen: i64,
}

/// Registry backed by `peers.json`
pub struct PeerRegistry {
	path: PathBuf,
	peers: RwLock<BTreeMap<PeerId, PeerInfo>>,
}

impl PeerRegistry {
	pub async fn open(path: &Path) -> Result<Self, SyncError> {
		let peers = match tokio::fs::read_to_string(path).await {
			Ok(contents) => json5::from_str(&contents).map_err(|e| SyncError::InvalidConfig {
				message: format!("failed to parse {}: {}", path.display(), e),
			})?,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
			Err(e) => return Err(e.into()),
		};
		Ok(PeerRegistry { path: path.to_path_buf(), peers: RwLock::new(peers) })
	}

	/// Record a sighting of a peer, merging addresses and sync-ids
	pub async fn record(
		&self,
		peer_id: &PeerId,
		address: Option<&str>,
		sync_ids: &[String],
	) -> Result<(), SyncError> {
		if !valid_peer_id(peer_id) {
			return Err(SyncError::InvalidConfig {
				message: format!("invalid peer-id '{}'", peer_id),
			});
		}
		{
			let mut peers = self.peers.write().await;
			let info = peers.entry(peer_id.clone()).or_default();
			if let Some(address) = address {
				if !info.addresses.iter().any(|a| a == address) {
					info.addresses.push(address.to_string());
				}
			}
			info.sync_ids.extend(sync_ids.iter().cloned());
			info.last_seen = now_unix();
		}
		self.save().await
	}

	pub async fn get(&self, peer_id: &PeerId) -> Option<PeerInfo> {
		self.peers.read().await.get(peer_id).cloned()
	}

	/// Peers known to share a sync-id
	pub async fn sharing(&self, sync_id: &str) -> BTreeSet<PeerId> {
		self.peers
			.read()
			.await
			.iter()
			.filter(|(_, info)| info.sync_ids.contains(sync_id))
			.map(|(id, _)| id.clone())
			.collect()
	}

	pub async fn all(&self) -> BTreeMap<PeerId, PeerInfo> {
		self.peers.read().await.clone()
	}

	async fn save(&self) -> Result<(), SyncError> {
		if let Some(parent) = self.path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		let json = serde_json::to_string_pretty(&*self.peers.read().await).map_err(|e| {
			SyncError::InvalidConfig { message: format!("failed to serialize peers: {}", e) }
		})?;
		crate::util::atomic_write(&self.path, json.as_bytes()).await.map_err(SyncError::from)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test]
	async fn test_record_and_query() {
		let tmp = tempfile::TempDir::new().unwrap();
		let registry = PeerRegistry::open(&tmp.path().join("peers.json")).await.unwrap();

		registry
			.record(
				&"QmAlice".to_string(),
				Some("192.168.1.10:44100"),
				&["family-photos".to_string()],
			)
			.await
			.unwrap();
		registry
			.record(&"QmBob".to_string(), None, &["work-notes1".to_string()])
			.await
			.unwrap();

		assert_eq!(registry.sharing("family-photos").await.len(), 1);
		assert!(registry.sharing("family-photos").await.contains("QmAlice"));
		assert!(registry.sharing("unknown-folder").await.is_empty());
	}

	#[tokio::test]
	async fn test_record_merges() {
		let tmp = tempfile::TempDir::new().unwrap();
		let registry = PeerRegistry::open(&tmp.path().join("peers.json")).await.unwrap();

		registry
			.record(&"QmAlice".to_string(), Some("10.0.0.1:1"), &["folder-a1".to_string()])
			.await
			.unwrap();
		registry
			.record(&"QmAlice".to_string(), Some("10.0.0.2:2"), &["folder-b1".to_string()])
			.await
			.unwrap();
		// Duplicate address is not repeated
		registry
			.record(&"QmAlice".to_string(), Some("10.0.0.1:1"), &[])
			.await
			.unwrap();

		let info = registry.get(&"QmAlice".to_string()).await.unwrap();
		assert_eq!(info.addresses.len(), 2);
		assert_eq!(info.sync_ids.len(), 2);
	}

	#[tokio::test]
	async fn test_persistence() {
		let tmp = tempfile::TempDir::new().unwrap();
		let path = tmp.path().join("peers.json");
		{
			let registry = PeerRegistry::open(&path).await.unwrap();
			registry
				.record(&"QmAlice".to_string(), Some("addr:1"), &["shared-docs".to_string()])
				.await
				.unwrap();
		}
		let registry = PeerRegistry::open(&path).await.unwrap();
		assert!(registry.get(&"QmAlice".to_string()).await.is_some());
	}

	#[tokio::test]
	async fn test_invalid_peer_id_rejected() {
		let tmp = tempfile::TempDir::new().unwrap();
		let registry = PeerRegistry::open(&tmp.path().join("peers.json")).await.unwrap();
		assert!(registry.record(&"not valid!".to_string(), None, &[]).await.is_err());
	}
}

// vim: ts=4
