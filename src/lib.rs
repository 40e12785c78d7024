//! # MeshSync - Serverless Peer-to-Peer Folder Replication
//!
//! MeshSync keeps a set of local directories, paired across devices by a
//! shared sync-id, eventually consistent without a central coordinator.
//! Causality travels in per-file vector clocks; folder states diff in
//! O(log n) through a Merkle Search Tree; large files move as
//! content-defined chunks through a shared content-addressed block store.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use meshsync::engine::SyncEngine;
//! use meshsync::{config, connect};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let app = config::AppConfig::load(&config::data_dir()?).await?;
//!     let engine = SyncEngine::new("QmYourPeerId".into(), None);
//!     for folder in &app.folders {
//!         engine.attach_folder(&app, folder).await?;
//!     }
//!     connect::listen(engine, "0.0.0.0:44100".into()).await?;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]

pub mod blockstore;
pub mod cache;
pub mod chunker;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod connect;
pub mod decision;
pub mod engine;
pub mod error;
pub mod exclusion;
pub mod logging;
pub mod monitor;
pub mod mst;
pub mod peers;
pub mod protocol;
pub mod scan;
pub mod store;
pub mod transfer;
pub mod types;
pub mod util;

// Re-export commonly used types and functions
pub use blockstore::BlockStore;
pub use chunker::FastCdc;
pub use clock::{ClockOrdering, VectorClock};
pub use decision::{decide, decide_resolved};
pub use engine::{SessionStats, SyncEngine};
pub use error::{ChunkError, ProtocolError, StoreError, SyncError, TransferError};
pub use exclusion::{ExclusionEngine, ExclusionError};
pub use mst::Mst;
pub use store::FileStateStore;
pub use types::{
	DeletionRecord, FileMetadata, FileState, PeerId, SyncAction, SyncFolder, SyncMode,
};

// vim: ts=4
