//! Vector clocks: per-peer version counters with a happens-before partial order
//!
//! Every replicated file carries one of these. Counters are keyed by peer-id
//! and missing keys read as zero, so clocks from peers that have never seen
//! each other still compare meaningfully.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of comparing two vector clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
	/// Every counter equal on both sides
	Equal,

	/// Self happened before other (self <= other everywhere, < somewhere)
	Ancestor,

	/// Other happened before self
	Descendant,

	/// Neither dominates: concurrent edits
	Concurrent,
}

/// Map of peer-id to version counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
	pub fn new() -> Self {
		VectorClock(BTreeMap::new())
	}

	/// Counter for a peer, zero when absent
	pub fn get(&self, peer: &str) -> u64 {
		self.0.get(peer).copied().unwrap_or(0)
	}

	/// Bump this peer's counter by one
	pub fn increment(&mut self, peer: &str) {
		*self.0.entry(peer.to_string()).or_insert(0) += 1;
	}

	/// Element-wise maximum with another clock
	pub fn merge(&mut self, other: &VectorClock) {
		for (peer, counter) in &other.0 {
			let entry = self.0.entry(peer.clone()).or_insert(0);
			if *counter > *entry {
				*entry = *counter;
			}
		}
	}

	/// Compare against another clock under the happens-before partial order
	pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
		let mut self_ahead = false;
		let mut other_ahead = false;

		for (peer, counter) in &self.0 {
			let theirs = other.get(peer);
			if *counter > theirs {
				self_ahead = true;
			} else if *counter < theirs {
				other_ahead = true;
			}
		}
		for (peer, counter) in &other.0 {
			// Keys missing on our side read as zero
			if self.get(peer) < *counter {
				other_ahead = true;
			}
		}

		match (self_ahead, other_ahead) {
			(false, false) => ClockOrdering::Equal,
			(false, true) => ClockOrdering::Ancestor,
			(true, false) => ClockOrdering::Descendant,
			(true, true) => ClockOrdering::Concurrent,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Iterate (peer, counter) pairs in key order
	pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
		self.0.iter()
	}
}

impl<const N: usize> From<[(&str, u64); N]> for VectorClock {
	fn from(entries: [(&str, u64); N]) -> Self {
		VectorClock(entries.iter().map(|(p, c)| (p.to_string(), *c)).collect())
	}
}


// vim: ts=4
