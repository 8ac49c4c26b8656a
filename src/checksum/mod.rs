//! CRC32C algebra and buffer segmentation.

mod hasher;
mod segmenter;
mod value;

pub use hasher::Hasher;
pub use segmenter::{ChunkSegment, ChunkSegmenter, StreamingSegmenter};
pub use value::{Crc32cLengthKnown, Crc32cValue};
