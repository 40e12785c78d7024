//! Path exclusion: user patterns plus built-in filters
//!
//! User patterns follow the gitignore subset (`*` within a segment, `**`
//! across segments, trailing `/` for directories, leading `/` anchored to
//! the sync root, `#` comments). On top of those, a built-in set always
//! excludes engine artifacts, and conflict siblings never re-sync.

mod patterns;

pub use patterns::builtin_excludes;

use crate::conflict::is_conflict_sibling;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::error::Error;
use std::fmt;
use std::path::Path;

/// Exclusion configuration errors
#[derive(Debug)]
pub enum ExclusionError {
	/// A pattern failed to compile
	InvalidPattern { pattern: String, message: String },
}

impl fmt::Display for ExclusionError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ExclusionError::InvalidPattern { pattern, message } => {
				write!(f, "invalid exclude pattern '{}': {}", pattern, message)
			}
		}
	}
}

impl Error for ExclusionError {}

/// Compiled exclusion rules for one sync folder
pub struct ExclusionEngine {
	gitignore: Gitignore,
	builtin: globset::GlobSet,
}

impl ExclusionEngine {
	/// Compile the folder's exclude patterns
	///
	/// `root` anchors leading-`/` patterns; comment lines and blanks are
	/// dropped here so callers can pass pattern files verbatim.
	pub fn new(root: &Path, patterns: &[String]) -> Result<Self, ExclusionError> {
		let mut builder = GitignoreBuilder::new(root);
		for pattern in patterns {
			let trimmed = pattern.trim();
			if trimmed.is_empty() || trimmed.starts_with('#') {
				continue;
			}
			builder.add_line(None, trimmed).map_err(|e| ExclusionError::InvalidPattern {
				pattern: trimmed.to_string(),
				message: e.to_string(),
			})?;
		}
		let gitignore = builder.build().map_err(|e| ExclusionError::InvalidPattern {
			pattern: String::new(),
			message: e.to_string(),
		})?;
		Ok(ExclusionEngine { gitignore, builtin: builtin_excludes() })
	}

	/// Check a sync-root-relative path
	pub fn is_excluded(&self, rel_path: &str, is_dir: bool) -> bool {
		if self.builtin.is_match(rel_path) {
			return true;
		}
		let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
		if is_conflict_sibling(name) {
			return true;
		}
		self.gitignore.matched_path_or_any_parents(rel_path, is_dir).is_ignore()
	}
}


// vim: ts=4
