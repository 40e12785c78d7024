//! Error types for MeshSync operations

use std::error::Error;
use std::fmt;
use std::io;

use crate::exclusion::ExclusionError;

/// Main error type for sync operations
///
/// Unified error covering every engine subsystem. Domain errors nest so the
/// session loop can sort failures into transient / integrity / policy / fatal
/// classes without string matching.
#[derive(Debug)]
pub enum SyncError {
	/// I/O error
	Io(io::Error),

	/// Protocol error (nested)
	Protocol(ProtocolError),

	/// State store error (nested)
	Store(StoreError),

	/// Chunking or block store error (nested)
	Chunk(ChunkError),

	/// File transfer error (nested)
	Transfer(TransferError),

	/// Exclusion pattern error (nested)
	Exclusion(ExclusionError),

	/// Invalid configuration
	InvalidConfig { message: String },

	/// Path rejected by policy (excluded, too large, permission denied)
	Policy { path: String, reason: String },

	/// Sync-folder disabled by a fatal condition
	FolderDisabled { sync_id: String, reason: String },

	/// Generic error message
	Other { message: String },
}

impl SyncError {
	/// Transient errors are retried; everything else is not
	pub fn is_transient(&self) -> bool {
		match self {
			SyncError::Io(e) => !matches!(
				e.kind(),
				io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
			),
			SyncError::Protocol(e) => e.is_transient(),
			SyncError::Transfer(TransferError::Timeout { .. }) => true,
			_ => false,
		}
	}
}

impl fmt::Display for SyncError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncError::Io(e) => write!(f, "I/O error: {}", e),
			SyncError::Protocol(e) => write!(f, "Protocol error: {}", e),
			SyncError::Store(e) => write!(f, "State store error: {}", e),
			SyncError::Chunk(e) => write!(f, "Chunk error: {}", e),
			SyncError::Transfer(e) => write!(f, "Transfer error: {}", e),
			SyncError::Exclusion(e) => write!(f, "Exclusion error: {}", e),
			SyncError::InvalidConfig { message } => {
				write!(f, "Invalid configuration: {}", message)
			}
			SyncError::Policy { path, reason } => {
				write!(f, "Policy rejection for {}: {}", path, reason)
			}
			SyncError::FolderDisabled { sync_id, reason } => {
				write!(f, "Sync folder {} disabled: {}", sync_id, reason)
			}
			SyncError::Other { message } => write!(f, "{}", message),
		}
	}
}

impl Error for SyncError {}

impl From<io::Error> for SyncError {
	fn from(e: io::Error) -> Self {
		SyncError::Io(e)
	}
}

impl From<ProtocolError> for SyncError {
	fn from(e: ProtocolError) -> Self {
		SyncError::Protocol(e)
	}
}

impl From<StoreError> for SyncError {
	fn from(e: StoreError) -> Self {
		SyncError::Store(e)
	}
}

impl From<ChunkError> for SyncError {
	fn from(e: ChunkError) -> Self {
		SyncError::Chunk(e)
	}
}

impl From<TransferError> for SyncError {
	fn from(e: TransferError) -> Self {
		SyncError::Transfer(e)
	}
}

impl From<ExclusionError> for SyncError {
	fn from(e: ExclusionError) -> Self {
		SyncError::Exclusion(e)
	}
}

impl From<String> for SyncError {
	fn from(message: String) -> Self {
		SyncError::Other { message }
	}
}

/// Protocol communication errors
#[derive(Debug)]
pub enum ProtocolError {
	/// Underlying stream I/O failed
	Io(io::Error),

	/// Frame exceeds the size cap
	FrameTooLarge { size: usize, max: usize },

	/// Payload failed to parse
	Malformed { message: String },

	/// Response did not arrive in time
	Timeout,

	/// Peer closed the connection
	Disconnected,

	/// Response kind did not match the request
	UnexpectedResponse { expected: &'static str, got: String },

	/// Peer rejected the request
	Rejected { reason: String },
}

impl ProtocolError {
	pub fn is_transient(&self) -> bool {
		matches!(
			self,
			ProtocolError::Io(_) | ProtocolError::Timeout | ProtocolError::Disconnected
		)
	}
}

impl fmt::Display for ProtocolError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ProtocolError::Io(e) => write!(f, "stream I/O failed: {}", e),
			ProtocolError::FrameTooLarge { size, max } => {
				write!(f, "frame of {} bytes exceeds maximum {}", size, max)
			}
			ProtocolError::Malformed { message } => write!(f, "malformed message: {}", message),
			ProtocolError::Timeout => write!(f, "request timed out"),
			ProtocolError::Disconnected => write!(f, "peer disconnected"),
			ProtocolError::UnexpectedResponse { expected, got } => {
				write!(f, "expected {} response, got {}", expected, got)
			}
			ProtocolError::Rejected { reason } => write!(f, "rejected by peer: {}", reason),
		}
	}
}

impl Error for ProtocolError {}

impl From<io::Error> for ProtocolError {
	fn from(e: io::Error) -> Self {
		ProtocolError::Io(e)
	}
}

/// State store errors
#[derive(Debug)]
pub enum StoreError {
	/// Snapshot failed to load
	LoadFailed { source: io::Error },

	/// Snapshot failed to persist
	SaveFailed { source: io::Error },

	/// Snapshot file is corrupted
	Corrupted { message: String },
}

impl fmt::Display for StoreError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StoreError::LoadFailed { source } => write!(f, "failed to load state: {}", source),
			StoreError::SaveFailed { source } => write!(f, "failed to save state: {}", source),
			StoreError::Corrupted { message } => write!(f, "state corrupted: {}", message),
		}
	}
}

impl Error for StoreError {}

/// Chunking and block store errors
#[derive(Debug)]
pub enum ChunkError {
	/// Failed to read chunk data
	ReadFailed { source: io::Error },

	/// Failed to write chunk data
	WriteFailed { source: io::Error },

	/// Stored or received bytes do not match the claimed hash
	HashMismatch { expected: String, actual: String },

	/// Hash is not 64 lowercase hex characters
	InvalidHash { hash: String },

	/// Invalid chunker configuration
	InvalidConfig { message: String },

	/// Chunk missing from the block store
	NotFound { hash: String },
}

impl fmt::Display for ChunkError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ChunkError::ReadFailed { source } => write!(f, "failed to read chunk: {}", source),
			ChunkError::WriteFailed { source } => write!(f, "failed to write chunk: {}", source),
			ChunkError::HashMismatch { expected, actual } => {
				write!(f, "hash mismatch: expected {}, got {}", expected, actual)
			}
			ChunkError::InvalidHash { hash } => write!(f, "invalid chunk hash: {}", hash),
			ChunkError::InvalidConfig { message } => {
				write!(f, "invalid chunker configuration: {}", message)
			}
			ChunkError::NotFound { hash } => write!(f, "chunk not found: {}", hash),
		}
	}
}

impl Error for ChunkError {}

/// File transfer errors
#[derive(Debug)]
pub enum TransferError {
	/// Reassembled or received file does not match the expected hash
	Integrity { path: String, expected: String, actual: String },

	/// Transfer step exceeded its deadline
	Timeout { path: String },

	/// Retries exhausted
	RetriesExhausted { path: String, attempts: u32 },

	/// Chunked transfer could not be completed and whole-file fallback failed
	Unrecoverable { path: String, message: String },
}

impl fmt::Display for TransferError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TransferError::Integrity { path, expected, actual } => {
				write!(f, "integrity failure for {}: expected {}, got {}", path, expected, actual)
			}
			TransferError::Timeout { path } => write!(f, "transfer of {} timed out", path),
			TransferError::RetriesExhausted { path, attempts } => {
				write!(f, "transfer of {} failed after {} attempts", path, attempts)
			}
			TransferError::Unrecoverable { path, message } => {
				write!(f, "transfer of {} unrecoverable: {}", path, message)
			}
		}
	}
}

impl Error for TransferError {}


// vim: ts=4
