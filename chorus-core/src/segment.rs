//! Segment layout and the sink a transfer writes into.

use std::ops::Range;

use crate::protocol::PreparedFileSharing;
use crate::wire::MAX_BODY_SIZE;

/// Segment size used when the requester does not dictate a segment count.
pub const DEFAULT_SEGMENT_SIZE: u32 = 64 * 1024; // 64 KiB

/// Largest segment whose RETURN_SEGMENT body still fits in one frame
/// (two u32 ids and the u64 length prefix, rounded up).
pub const MAX_SEGMENT_SIZE: u32 = MAX_BODY_SIZE - 64;

/// How a file of `total_bytes` is cut into fixed-size segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    pub total_segments: u32,
    pub bytes_per_chunk: u32,
    pub total_bytes: u64,
}

impl SegmentLayout {
    /// Fixed-size split. With a dictated count `n`, each segment is `ceil(total / n)` bytes,
    /// which can yield fewer than `n` segments for tiny files. Segments never exceed
    /// [`MAX_SEGMENT_SIZE`], so huge files get more segments than dictated.
    pub fn new(total_bytes: u64, dictated_segment_count: Option<u32>) -> Self {
        let bytes_per_chunk = match dictated_segment_count {
            Some(n) if n > 0 => total_bytes.div_ceil(u64::from(n)).max(1),
            _ => u64::from(DEFAULT_SEGMENT_SIZE),
        };
        let bytes_per_chunk = bytes_per_chunk.min(u64::from(MAX_SEGMENT_SIZE)) as u32;
        let total_segments = total_bytes.div_ceil(u64::from(bytes_per_chunk));
        Self {
            total_segments: u32::try_from(total_segments).unwrap_or(u32::MAX),
            bytes_per_chunk,
            total_bytes,
        }
    }

    /// Byte range covered by `segment_id`, or `None` past the end.
    pub fn range(&self, segment_id: u32) -> Option<Range<u64>> {
        if segment_id >= self.total_segments {
            return None;
        }
        let start = u64::from(segment_id) * u64::from(self.bytes_per_chunk);
        let end = (start + u64::from(self.bytes_per_chunk)).min(self.total_bytes);
        Some(start..end)
    }
}

impl From<&PreparedFileSharing> for SegmentLayout {
    fn from(p: &PreparedFileSharing) -> Self {
        Self {
            total_segments: p.total_segments,
            bytes_per_chunk: p.bytes_per_chunk,
            total_bytes: p.total_bytes,
        }
    }
}

/// Requesting side: persists segments as they are released in order.
///
/// Errors are the sink's own business; the transfer engine never sees them.
pub trait SegmentSink {
    fn write_segment(&mut self, range: Range<u64>, bytes: &[u8], is_final: bool);

    /// The transfer is over (finished, possibly with gaps, or stalled). Nothing more
    /// will be written.
    fn finish(&mut self) {}
}
