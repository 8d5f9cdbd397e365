//! Delta computation: matches a target stream against a base `Signature`
//! and emits a minimal sequence of `Operation`s describing how to turn the
//! base into the target.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::RsyncError;

use super::operation::Operation;
use super::signature::Signature;

/// Destination for the operations `deltify` produces. `stream.rs`
/// implements this over the wire; tests implement it over a `Vec`.
#[async_trait]
pub trait OperationSink {
	async fn send(&mut self, op: Operation) -> Result<(), RsyncError>;
}

#[async_trait]
impl OperationSink for Vec<Operation> {
	async fn send(&mut self, op: Operation) -> Result<(), RsyncError> {
		self.push(op);
		Ok(())
	}
}

/// Accumulates block matches so consecutive base-block indices collapse
/// into a single `{start, count}` operation instead of one op per block.
struct BlockRun {
	start: u64,
	count: u64,
}

impl BlockRun {
	fn extend_or_flush(run: &mut Option<BlockRun>, matched_index: u64) -> Option<Operation> {
		match run {
			Some(existing) if existing.start + existing.count == matched_index => {
				existing.count += 1;
				None
			}
			Some(existing) => {
				let op = Operation::Block { start: existing.start, count: existing.count };
				*run = Some(BlockRun { start: matched_index, count: 1 });
				Some(op)
			}
			None => {
				*run = Some(BlockRun { start: matched_index, count: 1 });
				None
			}
		}
	}

	fn take(run: &mut Option<BlockRun>) -> Option<Operation> {
		run.take().map(|r| Operation::Block { start: r.start, count: r.count })
	}
}

async fn flush_data(bytes: &[u8], max_data_op_size: usize, sink: &mut (dyn OperationSink + Send)) -> Result<(), RsyncError> {
	if bytes.is_empty() {
		return Ok(());
	}
	for chunk in bytes.chunks(max_data_op_size.max(1)) {
		sink.send(Operation::Data(chunk.to_vec())).await?;
	}
	Ok(())
}

pub async fn deltify<R: AsyncRead + Unpin>(
	mut target: R,
	base: &Signature,
	max_data_op_size: usize,
	sink: &mut (dyn OperationSink + Send),
) -> Result<(), RsyncError> {
	if base.is_empty() {
		return deltify_against_empty_base(target, max_data_op_size, sink).await;
	}

	let block_size = base.block_size as usize;
	let max_data_op_size = max_data_op_size.max(1);
	let mut weak_index: HashMap<u32, Vec<u64>> = HashMap::new();
	for (i, block) in base.blocks.iter().enumerate() {
		weak_index.entry(block.weak).or_default().push(i as u64);
	}

	// Ring buffer sized per the algorithm: one data op's worth of unmatched
	// bytes plus the rolling window.
	let capacity = max_data_op_size + block_size;
	let mut buffer: Vec<u8> = Vec::with_capacity(capacity);
	let mut read_scratch = vec![0u8; capacity.min(64 * 1024)];
	let mut eof = false;
	let mut pos = 0usize; // window start, relative to `buffer`
	let mut flushed_to = 0usize; // bytes before this index are already sent or matched
	let mut block_run: Option<BlockRun> = None;
	let mut rolling: Option<super::hash::RollingHash> = None;

	loop {
		// Reclaim the consumed prefix, then top the buffer up to capacity.
		if flushed_to > 0 {
			buffer.drain(0..flushed_to);
			pos -= flushed_to;
			flushed_to = 0;
		}
		while !eof && buffer.len() < capacity {
			let space = (capacity - buffer.len()).min(read_scratch.len());
			let read = target.read(&mut read_scratch[..space]).await.map_err(RsyncError::Io)?;
			if read == 0 {
				eof = true;
			} else {
				buffer.extend_from_slice(&read_scratch[..read]);
			}
		}

		if buffer.len() - pos < block_size {
			break;
		}

		let window = &buffer[pos..pos + block_size];
		let hash = match rolling.as_mut() {
			Some(r) => r,
			None => {
				rolling = Some(super::hash::RollingHash::new(window));
				rolling.as_mut().unwrap()
			}
		};
		let weak = hash.value();

		// Among candidates with this weak hash, prefer the block that would
		// extend the current run so repeated content coalesces.
		let matched_index = weak_index.get(&weak).and_then(|candidates| {
			let strong = crate::hash::digest(base.hash_algorithm, window);
			let preferred = block_run.as_ref().map(|run| run.start + run.count);
			preferred
				.filter(|p| candidates.contains(p) && base.blocks[*p as usize].strong == strong)
				.or_else(|| candidates.iter().copied().find(|&idx| base.blocks[idx as usize].strong == strong))
		});

		if let Some(idx) = matched_index {
			// Literal bytes between matches force any pending run out first
			// so operations reach the sink in target order.
			if pos > flushed_to {
				if let Some(op) = BlockRun::take(&mut block_run) {
					sink.send(op).await?;
				}
				flush_data(&buffer[flushed_to..pos], max_data_op_size, sink).await?;
			}
			if let Some(op) = BlockRun::extend_or_flush(&mut block_run, idx) {
				sink.send(op).await?;
			}
			pos += block_size;
			flushed_to = pos;
			rolling = None;
			continue;
		}

		if pos + block_size >= buffer.len() {
			if eof {
				break;
			}
			// Saturated: flush everything before the window as data and
			// shift, keeping the window bytes so the hash keeps rolling.
			if let Some(op) = BlockRun::take(&mut block_run) {
				sink.send(op).await?;
			}
			flush_data(&buffer[flushed_to..pos], max_data_op_size, sink).await?;
			flushed_to = pos;
			continue;
		}

		let old = buffer[pos];
		let new = buffer[pos + block_size];
		hash.roll(old, new);
		pos += 1;
	}

	if let Some(op) = BlockRun::take(&mut block_run) {
		sink.send(op).await?;
	}

	// Tail handling: everything from `flushed_to` onward is unmatched, but
	// try the short final base block against the very end of the stream
	// first, since it otherwise can never participate in rolling matches.
	let last_block_size = base.last_block_size as usize;
	let tail_len = buffer.len() - flushed_to;
	if last_block_size < block_size && tail_len >= last_block_size && last_block_size > 0 {
		let tail_start = buffer.len() - last_block_size;
		let tail = &buffer[tail_start..];
		let last_index = base.blocks.len() as u64 - 1;
		if base.blocks[last_index as usize].strong == crate::hash::digest(base.hash_algorithm, tail) {
			flush_data(&buffer[flushed_to..tail_start], max_data_op_size, sink).await?;
			sink.send(Operation::Block { start: last_index, count: 1 }).await?;
			flushed_to = buffer.len();
		}
	}

	flush_data(&buffer[flushed_to..], max_data_op_size, sink).await?;
	Ok(())
}

async fn deltify_against_empty_base<R: AsyncRead + Unpin>(
	mut target: R,
	max_data_op_size: usize,
	sink: &mut (dyn OperationSink + Send),
) -> Result<(), RsyncError> {
	let mut buffer = vec![0u8; max_data_op_size.max(1)];
	loop {
		let read = target.read(&mut buffer).await.map_err(RsyncError::Io)?;
		if read == 0 {
			break;
		}
		sink.send(Operation::Data(buffer[..read].to_vec())).await?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::hash::HashAlgorithm;
	use crate::rsync::signature::signature;

	async fn delta_ops(base_data: &[u8], target_data: &[u8], block_size: u32, max_data_op_size: usize) -> Vec<Operation> {
		let sig = signature(base_data, base_data.len() as u64, block_size, HashAlgorithm::Sha1).await.unwrap();
		let mut ops = Vec::new();
		deltify(target_data, &sig, max_data_op_size, &mut ops).await.unwrap();
		ops
	}

	#[tokio::test]
	async fn empty_base_produces_only_data_ops() {
		let ops = delta_ops(b"", b"hello world", 4, 1024).await;
		assert!(ops.iter().all(|op| matches!(op, Operation::Data(_))));
		assert!(!ops.is_empty());
	}

	#[tokio::test]
	async fn identical_content_is_a_single_block_run() {
		let data = vec![b'x'; 4096];
		let ops = delta_ops(&data, &data, 1024, 8192).await;
		assert_eq!(ops, vec![Operation::Block { start: 0, count: 4 }]);
	}

	#[tokio::test]
	async fn appended_bytes_produce_block_then_data() {
		let base = vec![b'a'; 2048];
		let mut target = base.clone();
		target.extend_from_slice(b"new tail bytes");
		let ops = delta_ops(&base, &target, 1024, 8192).await;
		assert!(matches!(ops.last().unwrap(), Operation::Data(_)));
		assert!(ops.iter().any(|op| matches!(op, Operation::Block { .. })));
	}

	#[tokio::test]
	async fn completely_different_content_is_all_data() {
		let base = vec![b'a'; 1024];
		let target = vec![b'z'; 1024];
		let ops = delta_ops(&base, &target, 1024, 8192).await;
		assert!(ops.iter().all(|op| matches!(op, Operation::Data(_))));
	}

	#[tokio::test]
	async fn every_operation_is_valid() {
		let base = vec![b'a'; 5000];
		let mut target = vec![b'b'; 500];
		target.extend_from_slice(&base[1000..3000]);
		target.extend_from_slice(b"trailer");
		let ops = delta_ops(&base, &target, 512, 4096).await;
		assert!(ops.iter().all(Operation::is_valid));
	}
}

// vim: ts=4
