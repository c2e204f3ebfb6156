//! Chunk planning for pay-per-chunk streaming.
//!
//! An asset is divided into fixed-duration time chunks. Each chunk maps to a
//! proportional byte range of the asset: chunk `i` of `n` covers
//! `[floor(i * size / n), floor((i + 1) * size / n))`. The split does not look
//! at frame boundaries, it is a byte-proportional approximation.
//!
//! Everything here is pure: the same inputs always give the same partition.

use serde::{Deserialize, Serialize};

/// Default chunk duration: 10 seconds of media per paid chunk.
pub const DEFAULT_CHUNK_DURATION_SECS: f64 = 10.0;

/// Largest chunk count an asset may be registered with.
pub const MAX_CHUNKS: u32 = 1_000_000;

/// A half-open byte range `[start, end)` belonging to one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Inclusive last byte, as used in `bytes a-b/size` headers.
    /// `None` for an empty range.
    pub fn last_byte(&self) -> Option<u64> {
        if self.is_empty() {
            None
        } else {
            Some(self.end - 1)
        }
    }
}

/// Number of chunks for an asset: `ceil(duration / chunk_duration)`.
///
/// Returns 0 for non-positive or non-finite inputs; callers treat that as
/// "asset unavailable".
pub fn chunk_count(duration_secs: f64, chunk_duration_secs: f64) -> u32 {
    if !(duration_secs.is_finite() && chunk_duration_secs.is_finite()) {
        return 0;
    }
    if duration_secs <= 0.0 || chunk_duration_secs <= 0.0 {
        return 0;
    }
    // `as` saturates, so absurd ratios clamp to u32::MAX instead of wrapping.
    (duration_secs / chunk_duration_secs).ceil() as u32
}

/// Byte range of chunk `index` when `size_bytes` is split into `count`
/// chunks. `None` when the index is out of range or the asset is empty.
///
/// Computed in u128 so `index * size` cannot overflow.
pub fn chunk_range(index: u32, count: u32, size_bytes: u64) -> Option<ChunkRange> {
    if count == 0 || size_bytes == 0 || index >= count {
        return None;
    }
    let boundary = |i: u32| -> u64 { ((i as u128 * size_bytes as u128) / count as u128) as u64 };
    let start = boundary(index);
    let end = boundary(index + 1).min(size_bytes);
    Some(ChunkRange { index, start, end })
}

/// Playback time span `[start, end)` in seconds covered by chunk `index`.
/// The last chunk is clipped to the asset duration.
pub fn time_span(index: u32, duration_secs: f64, chunk_duration_secs: f64) -> Option<(f64, f64)> {
    if index >= chunk_count(duration_secs, chunk_duration_secs) {
        return None;
    }
    let start = index as f64 * chunk_duration_secs;
    let end = (start + chunk_duration_secs).min(duration_secs);
    Some((start, end))
}

/// Full, ordered partition of an asset. Ranges are computed on demand, so a
/// plan costs the same whatever its chunk count.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPlan {
    pub duration_secs: f64,
    pub chunk_duration_secs: f64,
    pub size_bytes: u64,
    count: u32,
}

impl ChunkPlan {
    /// Plan an asset. Zero chunks when duration, size or chunk duration is
    /// not positive.
    pub fn new(duration_secs: f64, size_bytes: u64, chunk_duration_secs: f64) -> Self {
        let count = if size_bytes == 0 {
            0
        } else {
            chunk_count(duration_secs, chunk_duration_secs)
        };
        Self {
            duration_secs,
            chunk_duration_secs,
            size_bytes,
            count,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, index: u32) -> Option<ChunkRange> {
        chunk_range(index, self.count, self.size_bytes)
    }

    /// Playback time covered by chunk `index`.
    pub fn span(&self, index: u32) -> Option<(f64, f64)> {
        if index >= self.count {
            return None;
        }
        time_span(index, self.duration_secs, self.chunk_duration_secs)
    }

    pub fn ranges(&self) -> impl Iterator<Item = ChunkRange> + '_ {
        (0..self.count).filter_map(|i| self.get(i))
    }
}
