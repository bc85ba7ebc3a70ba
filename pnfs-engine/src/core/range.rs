use std::fmt::{Debug, Formatter};

use super::IoMode;
use crate::constants::NFS4_MAX_UINT64;

/// Returns the exclusive end of a byte range, saturating at the
/// "end of file" sentinel.
pub fn end_offset(offset: u64, length: u64) -> u64 {
    if length == NFS4_MAX_UINT64 {
        return NFS4_MAX_UINT64;
    }
    offset.checked_add(length).unwrap_or(NFS4_MAX_UINT64)
}

/// A byte range of a file together with the iomode it is held or requested
/// with.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct LayoutRange {
    pub iomode: IoMode,
    pub offset: u64,
    pub length: u64,
}

impl Debug for LayoutRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.length == NFS4_MAX_UINT64 {
            write!(f, "[{}, EOF) {}", self.offset, self.iomode)
        } else {
            write!(f, "[{}, {}) {}", self.offset, self.end(), self.iomode)
        }
    }
}

impl LayoutRange {
    pub fn new(iomode: IoMode, offset: u64, length: u64) -> Self {
        Self {
            iomode,
            offset,
            length,
        }
    }

    /// The whole file in the given iomode.
    pub fn all(iomode: IoMode) -> Self {
        Self::new(iomode, 0, NFS4_MAX_UINT64)
    }

    pub fn end(&self) -> u64 {
        end_offset(self.offset, self.length)
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Overflow rules for a requested range: `offset + length` must be
    /// representable unless the length is the end of file sentinel.
    pub fn is_valid(&self) -> bool {
        self.length == NFS4_MAX_UINT64
            || self.offset <= NFS4_MAX_UINT64 - self.length
    }

    /// Byte-range overlap, iomode is not considered.
    pub fn overlaps(&self, other: &LayoutRange) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Overlapping or touching end to start.
    pub fn mergeable(&self, other: &LayoutRange) -> bool {
        self.offset <= other.end() && other.offset <= self.end()
    }

    /// True if `other` lies entirely within `self`.
    pub fn contains(&self, other: &LayoutRange) -> bool {
        self.offset <= other.offset && other.end() <= self.end()
    }

    /// Grows `self` to the union of both ranges.
    pub fn extend(&mut self, other: &LayoutRange) {
        let lo = self.offset.min(other.offset);
        let hi = self.end().max(other.end());
        self.offset = lo;
        self.length = if hi == NFS4_MAX_UINT64 {
            NFS4_MAX_UINT64
        } else {
            hi - lo
        };
    }

    /// Builds a range from an inclusive start and exclusive end.
    pub(crate) fn from_bounds(iomode: IoMode, start: u64, end: u64) -> Self {
        let length = if end == NFS4_MAX_UINT64 {
            NFS4_MAX_UINT64
        } else {
            end - start
        };
        Self::new(iomode, start, length)
    }
}
