//! Applies a sequence of `Operation`s against a base to reconstruct the
//! target file.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use crate::error::RsyncError;

use super::operation::Operation;
use super::signature::Signature;

pub async fn patch<D, B>(
	mut destination: D,
	mut base: B,
	signature: &Signature,
	operations: &[Operation],
) -> Result<(), RsyncError>
where
	D: AsyncWrite + Unpin,
	B: AsyncRead + AsyncSeek + Unpin,
{
	let mut scratch = vec![0u8; signature.block_size as usize];
	for op in operations {
		apply_operation(&mut destination, &mut base, signature, op, &mut scratch).await?;
	}
	destination.flush().await.map_err(RsyncError::Io)?;
	Ok(())
}

/// Applies one operation to `destination`. Shared by the batch `patch()`
/// above and `stream::receive_file`'s incremental application.
pub(super) async fn apply_operation<D, B>(
	destination: &mut D,
	base: &mut B,
	signature: &Signature,
	op: &Operation,
	scratch: &mut [u8],
) -> Result<(), RsyncError>
where
	D: AsyncWrite + Unpin,
	B: AsyncRead + AsyncSeek + Unpin,
{
	if !op.is_valid() {
		return Err(RsyncError::MalformedOperation { message: "zero-count block operation".to_string() });
	}
	let block_count = signature.blocks.len() as u64;
	match op {
		Operation::Data(bytes) => {
			destination.write_all(bytes).await.map_err(RsyncError::Io)?;
		}
		Operation::Block { start, count } => {
			for block_index in *start..*start + *count {
				if block_index >= block_count {
					return Err(RsyncError::MalformedOperation {
						message: format!("block index {} out of range ({} blocks in signature)", block_index, block_count),
					});
				}
				let block_len = if block_index == block_count - 1 {
					signature.last_block_size as usize
				} else {
					signature.block_size as usize
				};
				base.seek(std::io::SeekFrom::Start(block_index * signature.block_size as u64))
					.await
					.map_err(RsyncError::Io)?;
				base.read_exact(&mut scratch[..block_len]).await.map_err(RsyncError::Io)?;
				destination.write_all(&scratch[..block_len]).await.map_err(RsyncError::Io)?;
			}
		}
	}
	Ok(())
}


// vim: ts=4
