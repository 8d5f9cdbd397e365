//! Block signatures: the compact description of a base file's contents that
//! `deltify` matches a target against without ever transferring the base.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::RsyncError;
use crate::hash::HashAlgorithm;

use super::hash::weak_hash;

const MIN_BLOCK_SIZE: u32 = 1024;
const MAX_BLOCK_SIZE: u32 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSignature {
	pub weak: u32,
	pub strong: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
	pub block_size: u32,
	pub last_block_size: u32,
	pub hash_algorithm: HashAlgorithm,
	pub blocks: Vec<BlockSignature>,
}

impl Signature {
	pub fn is_empty(&self) -> bool {
		self.blocks.is_empty()
	}
}

/// `blockSize == 0` auto-selects `clamp(sqrt(24 * len), 1KiB, 64KiB)`.
pub fn choose_block_size(len: u64, requested: u32) -> u32 {
	if requested != 0 {
		return requested;
	}
	let estimate = ((24.0 * len as f64).sqrt()) as u64;
	estimate.clamp(MIN_BLOCK_SIZE as u64, MAX_BLOCK_SIZE as u64) as u32
}

/// Reads `reader` sequentially and hashes it in `block_size`-byte blocks.
/// `len` is the reader's total byte length, needed only to auto-select a
/// block size when `block_size == 0`.
pub async fn signature<R: AsyncRead + Unpin>(
	mut reader: R,
	len: u64,
	block_size: u32,
	hash_algorithm: HashAlgorithm,
) -> Result<Signature, RsyncError> {
	let block_size = choose_block_size(len, block_size);
	if block_size == 0 {
		return Err(RsyncError::MalformedSignature { message: "block size resolved to zero".to_string() });
	}

	let mut blocks = Vec::new();
	let mut buffer = vec![0u8; block_size as usize];
	let mut last_block_size = block_size;

	loop {
		let mut filled = 0usize;
		while filled < buffer.len() {
			let read = reader.read(&mut buffer[filled..]).await.map_err(RsyncError::Io)?;
			if read == 0 {
				break;
			}
			filled += read;
		}
		if filled == 0 {
			break;
		}
		let block = &buffer[..filled];
		last_block_size = filled as u32;
		blocks.push(BlockSignature { weak: weak_hash(block), strong: crate::hash::digest(hash_algorithm, block) });
		if filled < buffer.len() {
			break;
		}
	}

	Ok(Signature { block_size, last_block_size, hash_algorithm, blocks })
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn hashes_exact_multiple_of_block_size() {
		let data = vec![1u8; 4096];
		let sig = signature(data.as_slice(), data.len() as u64, 1024, HashAlgorithm::Sha1).await.unwrap();
		assert_eq!(sig.blocks.len(), 4);
		assert_eq!(sig.last_block_size, 1024);
	}

	#[tokio::test]
	async fn short_final_block_keeps_true_length() {
		let data = vec![7u8; 2500];
		let sig = signature(data.as_slice(), data.len() as u64, 1024, HashAlgorithm::Sha1).await.unwrap();
		assert_eq!(sig.blocks.len(), 3);
		assert_eq!(sig.last_block_size, 452);
	}

	#[tokio::test]
	async fn empty_reader_has_no_blocks() {
		let sig = signature(tokio::io::empty(), 0, 1024, HashAlgorithm::Sha1).await.unwrap();
		assert!(sig.is_empty());
	}

	#[test]
	fn auto_block_size_is_clamped() {
		assert_eq!(choose_block_size(1, 0), MIN_BLOCK_SIZE);
		assert_eq!(choose_block_size(u64::MAX / 48, 0), MAX_BLOCK_SIZE);
		assert_eq!(choose_block_size(100, 777), 777);
	}
}

// vim: ts=4
