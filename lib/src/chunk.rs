//! Mapping of part numbers onto byte ranges of the payload.

use std::ops::Range;

/// Splits a payload of `payload_len` bytes into parts of `part_size` bytes.
///
/// Part `n` covers `[n * part_size, (n + 1) * part_size)` clipped to the
/// payload. Parts past the end are empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    payload_len: usize,
    part_size: usize,
}

impl ChunkPlan {
    /// `part_size` must be > 0.
    pub fn new(payload_len: usize, part_size: usize) -> Self {
        assert!(part_size > 0, "part_size must be positive");
        Self {
            payload_len,
            part_size,
        }
    }

    pub fn part_size(&self) -> usize {
        self.part_size
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Byte range of `part`, or `None` if the part lies past the payload.
    pub fn range(&self, part: u32) -> Option<Range<usize>> {
        let start = (part as usize).checked_mul(self.part_size)?;
        if start >= self.payload_len {
            return None;
        }
        let end = start.saturating_add(self.part_size).min(self.payload_len);
        Some(start..end)
    }

    /// Number of non-empty parts.
    pub fn part_count(&self) -> usize {
        self.payload_len.div_ceil(self.part_size)
    }
}
