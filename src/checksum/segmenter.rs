//! Splitting caller buffers into wire segments.
//!
//! ```text
//!     A: 3 MiB                       B: 6.6 MiB
//! |-----------------------------|-----------------------------------------------|
//!
//!   S1: 2 MiB         S2: 2 MiB         S3: 2 MiB         S4: 2 MiB      S5: 1.6 MiB
//! |-----------------|-----------------|-----------------|-----------------|-----------|
//! ```
//!
//! Segments fill up to `max_segment_size` regardless of where the input
//! buffers break. A segment taken from a single buffer is a zero-copy slice;
//! one that spans buffers is copied into a contiguous allocation.
//!
//! Each segment's CRC32C covers exactly its own bytes, so concatenating the
//! segment checksums in emission order yields the checksum of the input.

use crate::checksum::hasher::Hasher;
use crate::checksum::value::Crc32cLengthKnown;
use crate::config::{ChunkingConfig, DEFAULT_BLOCK_SIZE};
use crate::error::{StorageError, StorageResult};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSegment {
    bytes: Bytes,
    crc32c: Option<Crc32cLengthKnown>,
}

impl ChunkSegment {
    pub fn new(bytes: Bytes, crc32c: Option<Crc32cLengthKnown>) -> Self {
        ChunkSegment { bytes, crc32c }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn crc32c(&self) -> Option<Crc32cLengthKnown> {
        self.crc32c
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Accumulates pieces of one segment until it is full.
struct SegmentBuilder {
    pieces: Vec<Bytes>,
    len: usize,
    crc32c: Option<Crc32cLengthKnown>,
}

impl SegmentBuilder {
    fn new() -> Self {
        SegmentBuilder {
            pieces: Vec::new(),
            len: 0,
            crc32c: None,
        }
    }

    fn push(&mut self, hasher: Hasher, piece: Bytes) {
        let crc = hasher.hash(&piece);
        self.crc32c = if self.pieces.is_empty() {
            crc
        } else {
            hasher.null_safe_concat(self.crc32c, crc)
        };
        self.len += piece.len();
        self.pieces.push(piece);
    }

    fn finish(&mut self) -> ChunkSegment {
        let pieces = std::mem::take(&mut self.pieces);
        let crc32c = self.crc32c.take();
        let len = std::mem::replace(&mut self.len, 0);
        let bytes = if pieces.len() == 1 {
            pieces.into_iter().next().unwrap_or_default()
        } else {
            let mut buf = BytesMut::with_capacity(len);
            for p in &pieces {
                buf.extend_from_slice(p);
            }
            buf.freeze()
        };
        ChunkSegment { bytes, crc32c }
    }
}

/// Segments buffers into chunks of at most `max_segment_size` bytes.
#[derive(Debug, Clone)]
pub struct ChunkSegmenter {
    hasher: Hasher,
    max_segment_size: usize,
    block_size: usize,
}

impl ChunkSegmenter {
    pub fn new(hasher: Hasher, max_segment_size: usize, block_size: usize) -> StorageResult<Self> {
        if block_size == 0 || max_segment_size == 0 {
            return Err(StorageError::InvalidArgument(format!(
                "maxSegmentSize and blockSize must be > 0 ({}, {})",
                max_segment_size, block_size
            )));
        }
        let rem = max_segment_size % block_size;
        if rem != 0 {
            return Err(StorageError::InvalidArgument(format!(
                "maxSegmentSize % blockSize == 0 ({} % {} == {})",
                max_segment_size, block_size, rem
            )));
        }
        Ok(ChunkSegmenter {
            hasher,
            max_segment_size,
            block_size,
        })
    }

    pub fn with_default_block_size(hasher: Hasher, max_segment_size: usize) -> StorageResult<Self> {
        Self::new(hasher, max_segment_size, DEFAULT_BLOCK_SIZE)
    }

    pub fn from_config(config: &ChunkingConfig) -> StorageResult<Self> {
        Self::new(
            Hasher::new(config.checksum_enabled),
            config.max_segment_bytes,
            config.alignment_bytes,
        )
    }

    pub fn hasher(&self) -> Hasher {
        self.hasher
    }

    pub fn max_segment_size(&self) -> usize {
        self.max_segment_size
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Segment every byte of `buffers`; only the last segment may be short.
    pub fn segment_buffers(&self, buffers: &[Bytes]) -> Vec<ChunkSegment> {
        let total: usize = buffers.iter().map(Bytes::len).sum();
        self.segment_prefix(buffers, total)
    }

    /// Segment only whole blocks of `buffers`.
    ///
    /// Returns the segments and the number of bytes consumed; the unaligned
    /// tail is left for the caller.
    pub fn segment_aligned(&self, buffers: &[Bytes]) -> (Vec<ChunkSegment>, usize) {
        let total: usize = buffers.iter().map(Bytes::len).sum();
        let aligned = total - total % self.block_size;
        (self.segment_prefix(buffers, aligned), aligned)
    }

    fn segment_prefix(&self, buffers: &[Bytes], limit: usize) -> Vec<ChunkSegment> {
        let mut segments = Vec::with_capacity(limit.div_ceil(self.max_segment_size));
        let mut current = SegmentBuilder::new();
        let mut remaining = limit;

        for buffer in buffers {
            let mut buffer = buffer.clone();
            while !buffer.is_empty() && remaining > 0 {
                let room = self.max_segment_size - current.len;
                let take = room.min(buffer.len()).min(remaining);
                current.push(self.hasher, buffer.split_to(take));
                remaining -= take;
                if current.len == self.max_segment_size {
                    segments.push(current.finish());
                }
            }
            if remaining == 0 {
                break;
            }
        }
        if current.len > 0 {
            segments.push(current.finish());
        }

        debug_assert_eq!(segments.iter().map(ChunkSegment::len).sum::<usize>(), limit);
        segments
    }
}

/// Incremental segmenter for unbuffered writers.
///
/// Holds the unaligned tail between calls; emits aligned segments once at
/// least `min_flush_size` bytes are pending.
#[derive(Debug)]
pub struct StreamingSegmenter {
    segmenter: ChunkSegmenter,
    min_flush_size: usize,
    pending: VecDeque<Bytes>,
    pending_len: usize,
}

impl StreamingSegmenter {
    pub fn new(segmenter: ChunkSegmenter, min_flush_size: usize) -> Self {
        StreamingSegmenter {
            segmenter,
            min_flush_size,
            pending: VecDeque::new(),
            pending_len: 0,
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> StorageResult<Self> {
        Ok(Self::new(
            ChunkSegmenter::from_config(config)?,
            config.min_flush_bytes,
        ))
    }

    pub fn pending_len(&self) -> usize {
        self.pending_len
    }

    pub fn push(&mut self, buffer: Bytes) -> Vec<ChunkSegment> {
        if !buffer.is_empty() {
            self.pending_len += buffer.len();
            self.pending.push_back(buffer);
        }
        if self.pending_len < self.min_flush_size.max(self.segmenter.block_size) {
            return Vec::new();
        }

        let buffers: Vec<Bytes> = self.pending.iter().cloned().collect();
        let (segments, consumed) = self.segmenter.segment_aligned(&buffers);
        self.discard(consumed);
        segments
    }

    /// Emit everything still pending, aligned or not.
    pub fn finish(&mut self) -> Vec<ChunkSegment> {
        let buffers: Vec<Bytes> = self.pending.drain(..).collect();
        self.pending_len = 0;
        self.segmenter.segment_buffers(&buffers)
    }

    fn discard(&mut self, mut n: usize) {
        self.pending_len -= n;
        while n > 0 {
            let Some(front) = self.pending.front_mut() else {
                break;
            };
            if front.len() <= n {
                n -= front.len();
                self.pending.pop_front();
            } else {
                let _ = front.split_to(n);
                n = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::DeterministicRng;

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn split_randomly(rng: &mut DeterministicRng, bytes: &[u8]) -> Vec<Bytes> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let len = rng.gen_range(1, 40).min((bytes.len() - pos) as u64) as usize;
            out.push(Bytes::copy_from_slice(&bytes[pos..pos + len]));
            pos += len;
        }
        out
    }

    fn concat_crc(segments: &[ChunkSegment]) -> Crc32cLengthKnown {
        segments
            .iter()
            .fold(Crc32cLengthKnown::ZERO, |acc, s| acc.concat(s.crc32c().unwrap()))
    }

    #[test]
    fn test_rejects_misaligned_max() {
        let err = ChunkSegmenter::new(Hasher::Enabled, 100, 16).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid argument: maxSegmentSize % blockSize == 0 (100 % 16 == 4)"
        );
    }

    #[test]
    fn test_segments_cross_buffer_boundaries() {
        let segmenter = ChunkSegmenter::new(Hasher::Enabled, 32, 8).unwrap();
        let bytes = data(100);
        let buffers = vec![
            Bytes::copy_from_slice(&bytes[..30]),
            Bytes::copy_from_slice(&bytes[30..]),
        ];
        let segments = segmenter.segment_buffers(&buffers);
        let lens: Vec<usize> = segments.iter().map(ChunkSegment::len).collect();
        assert_eq!(lens, vec![32, 32, 32, 4]);
        assert_eq!(&segments[0].bytes()[..], &bytes[..32]);
        assert_eq!(concat_crc(&segments), Crc32cLengthKnown::of_bytes(&bytes));
    }

    #[test]
    fn test_content_oblivious_for_any_decomposition() {
        let segmenter = ChunkSegmenter::new(Hasher::Enabled, 64, 16).unwrap();
        let bytes = data(1000);
        let whole = Crc32cLengthKnown::of_bytes(&bytes);
        let mut rng = DeterministicRng::new(3);

        for _ in 0..20 {
            let buffers = split_randomly(&mut rng, &bytes);
            let segments = segmenter.segment_buffers(&buffers);
            assert_eq!(segments.len(), 1000usize.div_ceil(64));
            assert_eq!(segments.iter().map(ChunkSegment::len).sum::<usize>(), 1000);
            assert_eq!(concat_crc(&segments), whole);
        }
    }

    #[test]
    fn test_single_buffer_segments_are_slices() {
        let segmenter = ChunkSegmenter::new(Hasher::Noop, 16, 16).unwrap();
        let buffer = Bytes::from(data(40));
        let segments = segmenter.segment_buffers(std::slice::from_ref(&buffer));
        assert_eq!(segments.len(), 3);
        assert!(segments.iter().all(|s| s.crc32c().is_none()));
        assert_eq!(segments[0].bytes().as_ptr(), buffer.as_ptr());
    }

    #[test]
    fn test_segment_aligned_leaves_tail() {
        let segmenter = ChunkSegmenter::new(Hasher::Enabled, 32, 8).unwrap();
        let buffers = vec![Bytes::from(data(13)), Bytes::from(data(10))];
        let (segments, consumed) = segmenter.segment_aligned(&buffers);
        assert_eq!(consumed, 16);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].len(), 16);

        let (segments, consumed) = segmenter.segment_aligned(&[Bytes::from(data(7))]);
        assert_eq!(consumed, 0);
        assert!(segments.is_empty());
    }

    #[test]
    fn test_streaming_segmenter_retains_tail() {
        let segmenter = ChunkSegmenter::new(Hasher::Enabled, 32, 8).unwrap();
        let mut streaming = StreamingSegmenter::new(segmenter, 16);
        let bytes = data(75);

        assert!(streaming.push(Bytes::copy_from_slice(&bytes[..10])).is_empty());
        assert_eq!(streaming.pending_len(), 10);

        let emitted = streaming.push(Bytes::copy_from_slice(&bytes[10..45]));
        assert_eq!(emitted.iter().map(ChunkSegment::len).sum::<usize>(), 40);
        assert_eq!(streaming.pending_len(), 5);

        let mut all = emitted;
        all.extend(streaming.push(Bytes::copy_from_slice(&bytes[45..])));
        all.extend(streaming.finish());
        assert_eq!(streaming.pending_len(), 0);

        let mut joined = Vec::new();
        for s in &all {
            joined.extend_from_slice(s.bytes());
        }
        assert_eq!(joined, bytes);
        assert_eq!(concat_crc(&all), Crc32cLengthKnown::of_bytes(&bytes));
    }
}
