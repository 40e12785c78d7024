//! Deterministic Merkle Search Tree
//!
//! Maps path → content hash and summarizes the whole mapping in one root
//! hash, so two peers can detect "anything to do?" with a single comparison.
//! The tree is history-independent: a key's level is derived from its SHA-256
//! (leading zeros in base 4, ties broken by the full digest), which makes the
//! shape — and therefore the root hash — a pure function of the entry set.

use crate::types::FileState;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

struct Node {
	key: String,
	value: String,
	/// Derived from the key digest; higher levels sit closer to the root
	level: u32,
	/// Full key digest, used as the deterministic tie-break between levels
	digest: [u8; 32],
	left: Option<Box<Node>>,
	right: Option<Box<Node>>,
	/// Cached subtree hash, recomputed on structural change
	hash: String,
}

fn key_digest(key: &str) -> [u8; 32] {
	let mut hasher = Sha256::new();
	hasher.update(key.as_bytes());
	hasher.finalize().into()
}

fn key_level(digest: &[u8; 32]) -> u32 {
	let mut zeros = 0u32;
	for byte in digest {
		if *byte == 0 {
			zeros += 8;
		} else {
			zeros += byte.leading_zeros();
			break;
		}
	}
	// Base-4 leading zeros: two zero bits per level
	zeros / 2
}

/// Append one field with a big-endian u32 length prefix
fn hash_field(hasher: &mut Sha256, field: &[u8]) {
	hasher.update((field.len() as u32).to_be_bytes());
	hasher.update(field);
}

impl Node {
	fn new(key: String, value: String) -> Box<Node> {
		let digest = key_digest(&key);
		let level = key_level(&digest);
		let mut node =
			Box::new(Node { key, value, level, digest, left: None, right: None, hash: String::new() });
		node.rehash();
		node
	}

	/// Priority order: level first, digest as tie-break. Distinct keys have
	/// distinct digests, so the treap shape is unique for a given key set.
	fn wins_over(&self, other: &Node) -> bool {
		self.level > other.level || (self.level == other.level && self.digest > other.digest)
	}

	fn rehash(&mut self) {
		let mut hasher = Sha256::new();
		hash_field(&mut hasher, self.left.as_ref().map(|n| n.hash.as_bytes()).unwrap_or(b""));
		hash_field(&mut hasher, self.key.as_bytes());
		hash_field(&mut hasher, self.value.as_bytes());
		hash_field(&mut hasher, self.right.as_ref().map(|n| n.hash.as_bytes()).unwrap_or(b""));
		self.hash = hex::encode(hasher.finalize());
	}
}

/// Partition a subtree into keys < `key` and keys > `key`
fn split(node: Option<Box<Node>>, key: &str) -> (Option<Box<Node>>, Option<Box<Node>>) {
	match node {
		None => (None, None),
		Some(mut n) => {
			if n.key.as_str() < key {
				let (l, r) = split(n.right.take(), key);
				n.right = l;
				n.rehash();
				(Some(n), r)
			} else {
				let (l, r) = split(n.left.take(), key);
				n.left = r;
				n.rehash();
				(l, Some(n))
			}
		}
	}
}

/// Join two subtrees where every key in `l` precedes every key in `r`
fn merge(l: Option<Box<Node>>, r: Option<Box<Node>>) -> Option<Box<Node>> {
	match (l, r) {
		(None, r) => r,
		(l, None) => l,
		(Some(mut l), Some(mut r)) => {
			if l.wins_over(&r) {
				l.right = merge(l.right.take(), Some(r));
				l.rehash();
				Some(l)
			} else {
				r.left = merge(Some(l), r.left.take());
				r.rehash();
				Some(r)
			}
		}
	}
}

fn insert_node(node: Option<Box<Node>>, mut new: Box<Node>) -> (Box<Node>, bool) {
	match node {
		None => (new, true),
		Some(mut n) => {
			if new.key == n.key {
				let added = false;
				n.value = new.value;
				n.rehash();
				(n, added)
			} else if new.wins_over(&n) {
				let (l, r) = split(Some(n), &new.key);
				new.left = l;
				new.right = r;
				new.rehash();
				(new, true)
			} else if new.key < n.key {
				let (child, added) = insert_node(n.left.take(), new);
				n.left = Some(child);
				n.rehash();
				(n, added)
			} else {
				let (child, added) = insert_node(n.right.take(), new);
				n.right = Some(child);
				n.rehash();
				(n, added)
			}
		}
	}
}

fn delete_node(node: Option<Box<Node>>, key: &str) -> (Option<Box<Node>>, bool) {
	match node {
		None => (None, false),
		Some(mut n) => {
			if n.key == key {
				(merge(n.left.take(), n.right.take()), true)
			} else if key < n.key.as_str() {
				let (child, removed) = delete_node(n.left.take(), key);
				n.left = child;
				n.rehash();
				(Some(n), removed)
			} else {
				let (child, removed) = delete_node(n.right.take(), key);
				n.right = child;
				n.rehash();
				(Some(n), removed)
			}
		}
	}
}

/// One tree entry as exchanged over the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MstEntry {
	pub key: String,
	pub value: String,
}

/// Merkle Search Tree over string keys and values
#[derive(Default)]
pub struct Mst {
	root: Option<Box<Node>>,
	len: usize,
}

impl Mst {
	pub fn new() -> Self {
		Mst { root: None, len: 0 }
	}

	/// Insert or replace a key
	pub fn insert(&mut self, key: &str, value: &str) {
		let (root, added) =
			insert_node(self.root.take(), Node::new(key.to_string(), value.to_string()));
		self.root = Some(root);
		if added {
			self.len += 1;
		}
	}

	/// Remove a key; `true` when it was present
	pub fn delete(&mut self, key: &str) -> bool {
		let (root, removed) = delete_node(self.root.take(), key);
		self.root = root;
		if removed {
			self.len -= 1;
		}
		removed
	}

	pub fn get(&self, key: &str) -> Option<&str> {
		let mut cur = self.root.as_deref();
		while let Some(n) = cur {
			cur = if key == n.key {
				return Some(&n.value);
			} else if key < n.key.as_str() {
				n.left.as_deref()
			} else {
				n.right.as_deref()
			};
		}
		None
	}

	/// Root hash; `None` for the empty tree
	pub fn root_hash(&self) -> Option<String> {
		self.root.as_ref().map(|n| n.hash.clone())
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// All entries in key order
	pub fn entries(&self) -> BTreeMap<String, String> {
		let mut out = BTreeMap::new();
		fn walk(node: Option<&Node>, out: &mut BTreeMap<String, String>) {
			if let Some(n) = node {
				walk(n.left.as_deref(), out);
				out.insert(n.key.clone(), n.value.clone());
				walk(n.right.as_deref(), out);
			}
		}
		walk(self.root.as_deref(), &mut out);
		out
	}

	/// Entries whose key starts with `prefix`, pruning non-matching subtrees
	pub fn entries_with_prefix(&self, prefix: &str) -> BTreeMap<String, String> {
		let mut out = BTreeMap::new();
		fn walk(node: Option<&Node>, prefix: &str, out: &mut BTreeMap<String, String>) {
			if let Some(n) = node {
				if n.key.as_str() >= prefix {
					walk(n.left.as_deref(), prefix, out);
				}
				if n.key.starts_with(prefix) {
					out.insert(n.key.clone(), n.value.clone());
				}
				if n.key.as_str() < prefix || n.key.starts_with(prefix) {
					walk(n.right.as_deref(), prefix, out);
				}
			}
		}
		walk(self.root.as_deref(), prefix, &mut out);
		out
	}

	/// Keys on which the two trees disagree
	///
	/// Equal root hashes short-circuit to the empty set. Otherwise this is
	/// the flattened symmetric difference plus keys with differing values;
	/// linear, but only reached when the trees genuinely differ, and the
	/// expensive cross-peer case is bounded by the subtree-entry protocol
	/// refinement.
	pub fn diff(&self, other: &Mst) -> BTreeSet<String> {
		if self.root_hash() == other.root_hash() {
			return BTreeSet::new();
		}
		let ours = self.entries();
		let theirs = other.entries();
		let mut out = BTreeSet::new();
		for (key, value) in &ours {
			if theirs.get(key) != Some(value) {
				out.insert(key.clone());
			}
		}
		for key in theirs.keys() {
			if !ours.contains_key(key) {
				out.insert(key.clone());
			}
		}
		out
	}
}

/// Build the MST view of a state map: existing paths only, tombstones are
/// deliberately absent (their detection goes through the state exchange)
pub fn mst_from_states(states: &BTreeMap<String, FileState>) -> Mst {
	let mut mst = Mst::new();
	for (path, state) in states {
		if let FileState::Exists(meta) = state {
			mst.insert(path, &meta.hash);
		}
	}
	mst
}


// vim: ts=4
