//! Decision engine: maps a (local, remote) state pair to a sync action
//!
//! Pure functions, no I/O. Vector clocks carry causality and always
//! dominate; modification time is consulted only to tell "a user recreated
//! this file after the delete" from "a stale copy of a deleted file", with a
//! one-second threshold absorbing filesystem mtime granularity.

use crate::clock::{ClockOrdering, VectorClock};
use crate::types::{DeletionRecord, FileMetadata, FileState, SyncAction};

/// Tolerance for mtime-vs-deletion-time comparisons, in seconds
pub const MTIME_TIE_SECS: i64 = 1;

fn clock_or_empty(clock: Option<&VectorClock>) -> VectorClock {
	clock.cloned().unwrap_or_default()
}

/// Local file against a remote tombstone
fn local_file_vs_remote_tombstone(local: &FileMetadata, remote: &DeletionRecord) -> SyncAction {
	let resurrected = local.mtime > remote.deleted_at + MTIME_TIE_SECS;
	match &local.clock {
		// Legacy record without causal history: only mtime can arbitrate
		None => {
			if resurrected {
				SyncAction::Upload
			} else {
				SyncAction::DeleteLocal
			}
		}
		Some(clock) => match clock.compare(&remote.clock) {
			ClockOrdering::Descendant => SyncAction::Upload,
			ClockOrdering::Ancestor => SyncAction::DeleteLocal,
			ClockOrdering::Equal | ClockOrdering::Concurrent => {
				if resurrected {
					SyncAction::Upload
				} else {
					SyncAction::DeleteLocal
				}
			}
		},
	}
}

/// Local tombstone against a remote file (mirror of the above)
fn local_tombstone_vs_remote_file(local: &DeletionRecord, remote: &FileMetadata) -> SyncAction {
	let resurrected = remote.mtime > local.deleted_at + MTIME_TIE_SECS;
	match &remote.clock {
		None => {
			if resurrected {
				SyncAction::Download
			} else {
				SyncAction::DeleteRemote
			}
		}
		Some(clock) => match local.clock.compare(clock) {
			ClockOrdering::Descendant => SyncAction::DeleteRemote,
			ClockOrdering::Ancestor => SyncAction::Download,
			ClockOrdering::Equal | ClockOrdering::Concurrent => {
				if resurrected {
					SyncAction::Download
				} else {
					SyncAction::DeleteRemote
				}
			}
		},
	}
}

/// Decide the action for one path
///
/// `remote: None` means the path was absent from the peer's answer, which is
/// ambiguous when the answer omits tombstones: the caller must fetch the full
/// remote state (including tombstones) on `Uncertain` and re-decide through
/// [`decide_resolved`].
pub fn decide(local: Option<&FileState>, remote: Option<&FileState>) -> SyncAction {
	match (local, remote) {
		(None, None) => SyncAction::Skip,
		(None, Some(FileState::Exists(_))) => SyncAction::Download,
		// A tombstone for a path we never observed carries nothing to do
		(None, Some(FileState::Deleted(_))) => SyncAction::Skip,
		(Some(FileState::Exists(_)), None) => SyncAction::Uncertain,
		(Some(FileState::Deleted(_)), None) => SyncAction::Skip,
		(Some(FileState::Deleted(_)), Some(FileState::Deleted(_))) => SyncAction::Skip,
		(Some(FileState::Exists(l)), Some(FileState::Exists(r))) => {
			if l.hash == r.hash {
				return SyncAction::Skip;
			}
			let lc = clock_or_empty(l.clock.as_ref());
			let rc = clock_or_empty(r.clock.as_ref());
			match lc.compare(&rc) {
				ClockOrdering::Ancestor => SyncAction::Download,
				ClockOrdering::Descendant => SyncAction::Upload,
				// Equal clocks but differing content: legacy data without
				// causal history, resolved by a tombstone refetch first
				ClockOrdering::Equal => SyncAction::Uncertain,
				ClockOrdering::Concurrent => SyncAction::Conflict,
			}
		}
		(Some(FileState::Exists(l)), Some(FileState::Deleted(r))) => {
			local_file_vs_remote_tombstone(l, r)
		}
		(Some(FileState::Deleted(l)), Some(FileState::Exists(r))) => {
			local_tombstone_vs_remote_file(l, r)
		}
	}
}

/// Second-pass decision after the tombstone follow-up query
///
/// The remote state now includes tombstones, so the remaining ambiguities
/// collapse: an absent remote means the peer truly never saw the path
/// (upload), and a persisting equal-clock/different-hash pair is treated as
/// a conflict so both sides survive.
pub fn decide_resolved(local: Option<&FileState>, remote: Option<&FileState>) -> SyncAction {
	match decide(local, remote) {
		SyncAction::Uncertain => match (local, remote) {
			(Some(FileState::Exists(_)), None) => SyncAction::Upload,
			_ => SyncAction::Conflict,
		},
		action => action,
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::clock::VectorClock;

	fn meta(hash: &str, mtime: i64, clock: Option<VectorClock>) -> FileMetadata {
		FileMetadata {
			hash: hash.to_string(),
			size: 1,
			mtime,
			ctime: mtime,
			clock,
			is_dir: false,
		}
	}

	fn exists(hash: &str, mtime: i64, clock: Option<VectorClock>) -> FileState {
		FileState::Exists(meta(hash, mtime, clock))
	}

	fn deleted(peer: &str, deleted_at: i64, clock: VectorClock) -> FileState {
		FileState::Deleted(DeletionRecord {
			deleted_at,
			deleted_by: peer.to_string(),
			clock,
		})
	}

	#[test]
	fn test_both_absent() {
		assert_eq!(decide(None, None), SyncAction::Skip);
	}

	#[test]
	fn test_remote_only() {
		let r = exists("h", 10, Some(VectorClock::from([("b", 1)])));
		assert_eq!(decide(None, Some(&r)), SyncAction::Download);
	}

	#[test]
	fn test_local_only_is_uncertain() {
		let l = exists("h", 10, Some(VectorClock::from([("a", 1)])));
		assert_eq!(decide(Some(&l), None), SyncAction::Uncertain);
		// After the tombstone refetch finds nothing, push it
		assert_eq!(decide_resolved(Some(&l), None), SyncAction::Upload);
	}

	#[test]
	fn test_same_hash_skips_regardless_of_clocks() {
		let l = exists("h", 10, Some(VectorClock::from([("a", 2)])));
		let r = exists("h", 10, Some(VectorClock::from([("a", 1), ("b", 5)])));
		assert_eq!(decide(Some(&l), Some(&r)), SyncAction::Skip);
	}

	#[test]
	fn test_clock_dominance() {
		let l = exists("h1", 10, Some(VectorClock::from([("a", 1)])));
		let r = exists("h2", 10, Some(VectorClock::from([("a", 2)])));
		assert_eq!(decide(Some(&l), Some(&r)), SyncAction::Download);
		assert_eq!(decide(Some(&r), Some(&l)), SyncAction::Upload);
	}

	#[test]
	fn test_concurrent_edit_is_conflict() {
		let l = exists("h1", 10, Some(VectorClock::from([("a", 2), ("b", 1)])));
		let r = exists("h2", 10, Some(VectorClock::from([("a", 1), ("b", 2)])));
		assert_eq!(decide(Some(&l), Some(&r)), SyncAction::Conflict);
	}

	#[test]
	fn test_equal_clock_different_hash_legacy() {
		let l = exists("h1", 10, Some(VectorClock::from([("a", 1)])));
		let r = exists("h2", 10, Some(VectorClock::from([("a", 1)])));
		assert_eq!(decide(Some(&l), Some(&r)), SyncAction::Uncertain);
		assert_eq!(decide_resolved(Some(&l), Some(&r)), SyncAction::Conflict);
	}

	#[test]
	fn test_missing_clocks_compare_as_empty() {
		// No clock anywhere: equal empty clocks, differing hash
		let l = exists("h1", 10, None);
		let r = exists("h2", 10, None);
		assert_eq!(decide(Some(&l), Some(&r)), SyncAction::Uncertain);
		// One side has history, the other none: history wins
		let r2 = exists("h2", 10, Some(VectorClock::from([("b", 1)])));
		assert_eq!(decide(Some(&l), Some(&r2)), SyncAction::Download);
	}

	#[test]
	fn test_both_deleted() {
		let l = deleted("a", 10, VectorClock::from([("a", 2)]));
		let r = deleted("b", 12, VectorClock::from([("b", 2)]));
		assert_eq!(decide(Some(&l), Some(&r)), SyncAction::Skip);
	}

	#[test]
	fn test_local_tombstone_remote_silent() {
		let l = deleted("a", 10, VectorClock::from([("a", 2)]));
		assert_eq!(decide(Some(&l), None), SyncAction::Skip);
	}

	#[test]
	fn test_remote_tombstone_never_observed() {
		let r = deleted("b", 10, VectorClock::from([("b", 2)]));
		assert_eq!(decide(None, Some(&r)), SyncAction::Skip);
	}

	#[test]
	fn test_tombstone_dominates_stale_file() {
		// Remote file is causally older than the local delete
		let l = deleted("a", 100, VectorClock::from([("a", 2)]));
		let r = exists("h", 10, Some(VectorClock::from([("a", 1)])));
		assert_eq!(decide(Some(&l), Some(&r)), SyncAction::DeleteRemote);
	}

	#[test]
	fn test_remote_resurrection_dominates_tombstone() {
		let l = deleted("a", 100, VectorClock::from([("a", 2)]));
		let r = exists("h", 200, Some(VectorClock::from([("a", 2), ("b", 1)])));
		assert_eq!(decide(Some(&l), Some(&r)), SyncAction::Download);
	}

	#[test]
	fn test_concurrent_delete_vs_edit_mtime_tiebreak() {
		// A deleted (clock {a:2}), B edited offline (clock {a:1, b:1});
		// concurrent, so mtime decides.
		let delete_at = 1000;
		let tomb = deleted("a", delete_at, VectorClock::from([("a", 2)]));

		// Edit clearly after the delete: resurrection, keep the file
		let late_edit = exists("h", delete_at + 5, Some(VectorClock::from([("a", 1), ("b", 1)])));
		assert_eq!(decide(Some(&late_edit), Some(&tomb)), SyncAction::Upload);
		assert_eq!(decide(Some(&tomb), Some(&late_edit)), SyncAction::Download);

		// Edit within the tolerance window: the delete wins
		let near_edit = exists("h", delete_at + 1, Some(VectorClock::from([("a", 1), ("b", 1)])));
		assert_eq!(decide(Some(&near_edit), Some(&tomb)), SyncAction::DeleteLocal);
		assert_eq!(decide(Some(&tomb), Some(&near_edit)), SyncAction::DeleteRemote);
	}

	#[test]
	fn test_legacy_file_without_clock_vs_tombstone() {
		let delete_at = 1000;
		let tomb = deleted("a", delete_at, VectorClock::from([("a", 2)]));

		let recreated = exists("h", delete_at + 30, None);
		assert_eq!(decide(Some(&recreated), Some(&tomb)), SyncAction::Upload);

		let stale = exists("h", delete_at - 30, None);
		assert_eq!(decide(Some(&stale), Some(&tomb)), SyncAction::DeleteLocal);
	}

	#[test]
	fn test_resolved_passthrough() {
		// decide_resolved leaves unambiguous outcomes untouched
		let l = exists("h1", 10, Some(VectorClock::from([("a", 2)])));
		let r = exists("h2", 10, Some(VectorClock::from([("a", 1)])));
		assert_eq!(decide_resolved(Some(&l), Some(&r)), SyncAction::Upload);
		assert_eq!(decide_resolved(None, None), SyncAction::Skip);
	}
}

// vim: ts=4
