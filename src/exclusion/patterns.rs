//! Built-in always-excluded patterns

use globset::{Glob, GlobSet, GlobSetBuilder};

/// Patterns excluded on every folder regardless of configuration
///
/// Engine artifacts must never replicate, and the usual platform cruft is
/// noise nobody wants mirrored.
pub fn builtin_excludes() -> GlobSet {
	let patterns = [
		".meshsync/**",    // engine state directory
		"**/*.msync-tmp",  // in-flight transfer temp files
		"**/.*.msync-tmp", // atomic-write temp files
		".Trash-*/**",     // Linux trash
		"lost+found/**",   // Linux filesystem recovery
		"**/.DS_Store",    // macOS cruft
		"**/Thumbs.db",    // Windows cruft
		"**/desktop.ini",  // Windows cruft
		"**/*.swp",        // Vim swap files
		"**/*.swo",        // Vim swap files
		"**/*~",           // Editor backups
		"**/.nfs*",        // NFS temp files
	];

	let mut builder = GlobSetBuilder::new();
	for pattern in patterns {
		if let Ok(glob) = Glob::new(pattern) {
			builder.add(glob);
		}
	}
	// The pattern list is static; an empty set is the worst failure mode
	builder.build().unwrap_or_else(|_| GlobSet::empty())
}


// vim: ts=4
