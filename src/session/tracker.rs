//! Per-handle record of written byte ranges.

use tracing::trace;

use crate::session::error::{ContiguityError, ContiguityResult};

/// One recorded write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteInterval {
    pub offset: u64,
    pub len: u64,
}

impl WriteInterval {
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.len)
    }
}

/// Byte ranges written through one open-for-write handle, in the order
/// they were written.
///
/// Writes are recorded as they happen and never rejected; the whole
/// pattern is checked once, when the handle closes.
#[derive(Debug, Clone, Default)]
pub struct WriteSession {
    intervals: Vec<WriteInterval>,
    bytes_written: u64,
}

impl WriteSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a write of `len` bytes at `offset`. Empty writes are ignored.
    pub fn record_write(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        self.intervals.push(WriteInterval { offset, len });
        self.bytes_written += len;
    }

    pub fn intervals(&self) -> &[WriteInterval] {
        &self.intervals
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Total bytes passed to `record_write`, overlaps counted twice.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Highest offset any write reached.
    pub fn frontier(&self) -> u64 {
        self.intervals.iter().map(|i| i.end()).max().unwrap_or(0)
    }

    /// Check that the writes grew the file front to back from offset 0 and
    /// return its size.
    ///
    /// Every write has to start exactly where the previous one ended. A
    /// write past that point left a gap, a write before it rewrote bytes
    /// already written, even if it also extends the file. Back-filling a
    /// gap later does not make the session valid.
    pub fn validate_on_close(&self) -> ContiguityResult<u64> {
        match self.intervals.as_slice() {
            [] => return Ok(0),
            [only] if only.offset == 0 => return Ok(only.len),
            _ => {}
        }

        let mut frontier = 0u64;
        for interval in &self.intervals {
            if interval.offset > frontier {
                return Err(ContiguityError::Gap {
                    covered: frontier,
                    offset: interval.offset,
                });
            }
            if interval.offset < frontier {
                return Err(ContiguityError::BackwardWrite {
                    offset: interval.offset,
                    len: interval.len,
                    covered: frontier,
                });
            }
            frontier = interval.end();
        }

        trace!(writes = self.intervals.len(), size = frontier, "write session is contiguous");
        Ok(frontier)
    }
}
