//! Pluggable content hashing.
//!
//! No single algorithm is baked in: callers pick SHA-1 (compat), SHA-256,
//! or BLAKE3 and the rest of the crate (scanner content digests, rsync
//! strong hash, stager content-addressing key) goes through the `Hasher`
//! trait uniformly.

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::Sha256;
use std::fmt;

use sha1::Digest as _;

/// Selects the concrete digest algorithm used throughout a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HashAlgorithm {
	Sha1,
	Sha256,
	Blake3,
}

impl Default for HashAlgorithm {
	fn default() -> Self {
		HashAlgorithm::Blake3
	}
}

impl HashAlgorithm {
	/// Construct a fresh streaming hasher for this algorithm.
	pub fn hasher(self) -> Box<dyn Hasher> {
		match self {
			HashAlgorithm::Sha1 => Box::new(Sha1::new()),
			HashAlgorithm::Sha256 => Box::new(Sha256::new()),
			HashAlgorithm::Blake3 => Box::new(blake3::Hasher::new()),
		}
	}

	/// Digest length in bytes for this algorithm.
	pub fn digest_len(self) -> usize {
		match self {
			HashAlgorithm::Sha1 => 20,
			HashAlgorithm::Sha256 => 32,
			HashAlgorithm::Blake3 => 32,
		}
	}
}

impl fmt::Display for HashAlgorithm {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			HashAlgorithm::Sha1 => write!(f, "sha1"),
			HashAlgorithm::Sha256 => write!(f, "sha256"),
			HashAlgorithm::Blake3 => write!(f, "blake3"),
		}
	}
}

/// A streaming, boxable content hasher. `Digest` bounds aren't object-safe
/// (generic `finalize` signatures), so this trait is the object-safe
/// equivalent used everywhere a caller needs to pick the algorithm at
/// runtime from `SessionConfiguration`.
pub trait Hasher: Send {
	fn update(&mut self, data: &[u8]);
	fn finalize(self: Box<Self>) -> Vec<u8>;
}

impl Hasher for Sha1 {
	fn update(&mut self, data: &[u8]) {
		sha1::Digest::update(self, data);
	}
	fn finalize(self: Box<Self>) -> Vec<u8> {
		sha1::Digest::finalize(*self).to_vec()
	}
}

impl Hasher for Sha256 {
	fn update(&mut self, data: &[u8]) {
		sha2::Digest::update(self, data);
	}
	fn finalize(self: Box<Self>) -> Vec<u8> {
		sha2::Digest::finalize(*self).to_vec()
	}
}

impl Hasher for blake3::Hasher {
	fn update(&mut self, data: &[u8]) {
		blake3::Hasher::update(self, data);
	}
	fn finalize(self: Box<Self>) -> Vec<u8> {
		blake3::Hasher::finalize(&*self).as_bytes().to_vec()
	}
}

/// Hash an entire in-memory buffer with the given algorithm.
pub fn digest(algorithm: HashAlgorithm, data: &[u8]) -> Vec<u8> {
	let mut hasher = algorithm.hasher();
	hasher.update(data);
	hasher.finalize()
}

/// Hex-encode a digest for on-disk keys and wire messages.
pub fn digest_to_hex(digest: &[u8]) -> String {
	hex::encode(digest)
}


// vim: ts=4
