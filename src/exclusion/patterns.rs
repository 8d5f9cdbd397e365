//! Double-star glob ignore matching.

use super::ExclusionError;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

/// Glob-based ignore matcher. Built-in patterns for the synchronization
/// machinery's own bookkeeping files are always active, regardless of the
/// session's configured ignore list.
pub struct PatternMatcher {
	exclude_set: GlobSet,
	always_exclude: GlobSet,
}

impl PatternMatcher {
	pub fn new(patterns: &[String]) -> Result<Self, ExclusionError> {
		Ok(Self {
			always_exclude: Self::build_always_excluded()?,
			exclude_set: Self::build_glob_set(patterns)?,
		})
	}

	fn build_always_excluded() -> Result<GlobSet, ExclusionError> {
		let patterns = [
			".mutagen/**",
			"**/*.mutagen-staging",
			"**/mutagen-probe-*",
			"**/.mutagen-probe-*",
			"**/.DS_Store",
			"**/Thumbs.db",
			"**/*.swp",
			"**/*~",
		];
		Self::build_glob_set(&patterns.iter().map(|p| p.to_string()).collect::<Vec<_>>())
	}

	fn build_glob_set(patterns: &[String]) -> Result<GlobSet, ExclusionError> {
		let mut builder = GlobSetBuilder::new();
		for pattern in patterns {
			let glob = Glob::new(pattern)
				.map_err(|e| ExclusionError::InvalidPattern(format!("{}: {}", pattern, e)))?;
			builder.add(glob);
		}
		builder
			.build()
			.map_err(|e| ExclusionError::InvalidPattern(format!("failed to build pattern set: {}", e)))
	}

	pub fn is_excluded(&self, path: &Path) -> bool {
		self.always_exclude.is_match(path) || self.exclude_set.is_match(path)
	}
}
