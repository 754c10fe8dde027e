//! Mark bitmap, marking context and array chunking.

mod bitmap;
mod context;
mod task;

pub use bitmap::{MarkBitmap, BYTES_PER_BIT};
pub use context::MarkingContext;
pub(crate) use context::walk_objects;
pub use task::{split_array_chunk, split_array_start, ArrayChunk};
