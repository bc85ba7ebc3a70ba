use std::{
    fmt::{Debug, Display, Formatter},
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
        Weak,
    },
};

use crossbeam::atomic::AtomicCell;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use super::LayoutHeader;
use crate::{
    core::{IoMode, LayoutRange},
    driver::SegmentPayload,
};

static NEXT_SEGMENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SegmentState {
    /// Usable for new I/O.
    Valid,
    /// Recalled, returned or torn down. Never becomes valid again.
    Invalid,
}

impl Display for SegmentState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Valid => write!(f, "valid"),
            Self::Invalid => write!(f, "invalid"),
        }
    }
}

/// A granted layout segment: one byte range in one iomode.
///
/// The header's segment list holds one reference for as long as the segment
/// is linked. The segment is unlinked when it is invalidated, and the driver
/// data is released once the last reference is dropped.
pub struct LayoutSegment {
    id: u64,
    range: LayoutRange,
    header: Weak<LayoutHeader>,
    state: AtomicCell<SegmentState>,
    refcount: AtomicU32,
    roc: bool,
    payload: Mutex<Option<SegmentPayload>>,
    freed: AtomicBool,
}

impl Debug for LayoutSegment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "lseg {} {:?} {} ref {}",
            self.id,
            self.range,
            self.state.load(),
            self.refcount()
        )
    }
}

impl LayoutSegment {
    pub(crate) fn new(
        range: LayoutRange,
        header: Weak<LayoutHeader>,
        roc: bool,
        payload: SegmentPayload,
    ) -> Self {
        Self {
            id: NEXT_SEGMENT_ID.fetch_add(1, Ordering::Relaxed),
            range,
            header,
            state: AtomicCell::new(SegmentState::Valid),
            refcount: AtomicU32::new(1),
            roc,
            payload: Mutex::new(Some(payload)),
            freed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn range(&self) -> &LayoutRange {
        &self.range
    }

    pub fn iomode(&self) -> IoMode {
        self.range.iomode
    }

    pub fn header(&self) -> Option<Arc<LayoutHeader>> {
        self.header.upgrade()
    }

    pub fn state(&self) -> SegmentState {
        self.state.load()
    }

    pub fn is_valid(&self) -> bool {
        self.state() == SegmentState::Valid
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    pub fn is_roc(&self) -> bool {
        self.roc
    }

    /// Borrows the driver data as `T`, None if it has been released or is
    /// of another type.
    pub fn payload<T: 'static>(&self) -> Option<MappedMutexGuard<'_, T>> {
        MutexGuard::try_map(self.payload.lock(), |p| {
            p.as_mut().and_then(|p| p.downcast_mut::<T>())
        })
        .ok()
    }

    /// VALID to INVALID, exactly once. Returns true for the caller that
    /// performed the transition.
    pub(crate) fn invalidate(&self) -> bool {
        self.state
            .compare_exchange(SegmentState::Valid, SegmentState::Invalid)
            .is_ok()
    }

    /// Whether a recall or return of `range` selects this segment.
    pub(crate) fn matches_recall(&self, range: &LayoutRange) -> bool {
        (range.iomode == IoMode::Any || self.range.iomode == range.iomode)
            && self.range.overlaps(range)
    }

    /// Whether this segment can serve I/O starting at `range.offset` in
    /// `range.iomode`. A READWRITE request needs a READWRITE segment, a READ
    /// request takes either.
    pub(crate) fn serves(&self, range: &LayoutRange) -> bool {
        (range.iomode != IoMode::ReadWrite
            || self.range.iomode == IoMode::ReadWrite)
            && self.range.offset <= range.offset
            && range.offset < self.range.end()
    }

    pub(crate) fn get(&self) {
        let prev = self.refcount.fetch_add(1, Ordering::AcqRel);
        assert_ne!(prev, 0, "{:?}: reference taken on a freed segment", self);
    }

    /// Drops a reference. The last one releases the driver data, outside of
    /// any header lock, and wakes the header's waiters. Returns true if the
    /// segment was freed.
    pub(crate) fn put(&self, hdr: &LayoutHeader) -> bool {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        assert_ne!(prev, 0, "{:?}: reference count underflow", self);
        if prev != 1 {
            return false;
        }
        assert!(
            !self.is_valid(),
            "{:?}: last reference dropped while still linked",
            self
        );

        let payload = self.payload.lock().take();
        if let Some(payload) = payload {
            hdr.driver().free_segment(hdr, payload);
        }
        self.freed.store(true, Ordering::Release);
        debug!("{:?}: freed", self);
        hdr.wake_waiters();
        true
    }
}

/// A counted reference to a segment, used by I/O. Keeps the header alive
/// and drops its reference when it goes out of scope.
pub struct LsegRef {
    seg: Arc<LayoutSegment>,
    hdr: Arc<LayoutHeader>,
}

impl LsegRef {
    /// Wraps a reference the caller already took.
    pub(crate) fn new(seg: Arc<LayoutSegment>, hdr: Arc<LayoutHeader>) -> Self {
        Self {
            seg,
            hdr,
        }
    }

    pub fn layout(&self) -> &Arc<LayoutHeader> {
        &self.hdr
    }

    pub fn segment(&self) -> &Arc<LayoutSegment> {
        &self.seg
    }
}

impl Deref for LsegRef {
    type Target = LayoutSegment;

    fn deref(&self) -> &Self::Target {
        &self.seg
    }
}

impl Clone for LsegRef {
    fn clone(&self) -> Self {
        self.seg.get();
        Self::new(self.seg.clone(), self.hdr.clone())
    }
}

impl Debug for LsegRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.seg.fmt(f)
    }
}

impl Drop for LsegRef {
    fn drop(&mut self) {
        self.seg.put(&self.hdr);
    }
}
