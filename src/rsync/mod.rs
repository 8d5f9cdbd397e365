//! Fixed-block rsync-style differencing: signatures, delta computation,
//! patch application, and per-file streaming framing.

mod delta;
mod hash;
mod operation;
mod patch;
mod signature;
mod stream;

pub use delta::{deltify, OperationSink};
pub use operation::Operation;
pub use patch::patch;
pub use signature::{choose_block_size, signature, BlockSignature, Signature};
pub use stream::{receive_file, transmit_file, FrameSink, FrameSource, StreamMessage};

// vim: ts=4
