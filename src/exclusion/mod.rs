//! Ignore-pattern matching for the scanner, using double-star globs.
#![allow(dead_code)]

mod patterns;

pub use patterns::PatternMatcher;

/// Thin wrapper kept at module scope so the scanner depends on one type
/// rather than `patterns::PatternMatcher` directly, leaving room for
/// non-glob exclusion sources to be layered in later without touching
/// callers.
pub struct ExclusionEngine {
	pattern_matcher: PatternMatcher,
}

impl ExclusionEngine {
	pub fn new(patterns: &[String]) -> Result<Self, ExclusionError> {
		Ok(Self { pattern_matcher: PatternMatcher::new(patterns)? })
	}

	pub fn is_excluded(&self, path: &std::path::Path) -> bool {
		self.pattern_matcher.is_excluded(path)
	}
}

#[derive(Debug)]
pub enum ExclusionError {
	InvalidPattern(String),
}

impl std::fmt::Display for ExclusionError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ExclusionError::InvalidPattern(msg) => write!(f, "invalid exclusion pattern: {}", msg),
		}
	}
}

impl std::error::Error for ExclusionError {}
