//! Page list I/O through a layout segment. Anything the driver cannot or
//! will not do is reported as `NotAttempted` and goes to the MDS.
use super::{segment::LsegRef, NfsInode};
use crate::{
    core::{end_offset, IoMode, LayoutRange},
    driver::PnfsTryStatus,
};

impl NfsInode {
    fn io_segment(&self, iomode: IoMode, offset: u64, len: u64) -> Option<LsegRef> {
        if len == 0 {
            return None;
        }
        self.update_layout(&LayoutRange::new(iomode, offset, len))
    }

    /// Reads `len` bytes at `offset` through pNFS if a READ or READWRITE
    /// segment covers them.
    pub fn read_pagelist(&self, offset: u64, len: u64) -> PnfsTryStatus {
        let Some(seg) = self.io_segment(IoMode::Read, offset, len) else {
            return PnfsTryStatus::NotAttempted;
        };
        let driver = seg.layout().driver().clone();
        match driver.read_range(&seg, offset, len) {
            Ok(status) => status,
            Err(error) => {
                debug!("{:?}: pNFS read at {} failed: {}", seg, offset, error);
                PnfsTryStatus::NotAttempted
            }
        }
    }

    /// Writes `len` bytes at `offset` through pNFS. A write the driver took
    /// is remembered for the next LAYOUTCOMMIT.
    pub fn write_pagelist(&self, offset: u64, len: u64) -> PnfsTryStatus {
        let Some(seg) = self.io_segment(IoMode::ReadWrite, offset, len) else {
            return PnfsTryStatus::NotAttempted;
        };
        let hdr = seg.layout().clone();
        match hdr.driver().write_range(&seg, offset, len) {
            Ok(PnfsTryStatus::Attempted) => {
                hdr.set_layoutcommit(offset, len);
                self.grow(end_offset(offset, len));
                PnfsTryStatus::Attempted
            }
            Ok(status) => status,
            Err(error) => {
                debug!("{:?}: pNFS write at {} failed: {}", seg, offset, error);
                PnfsTryStatus::NotAttempted
            }
        }
    }

    /// Whether a request at `offset` may join the previous one at
    /// `prev_offset` in a single I/O on `seg`.
    pub fn coalesce(&self, seg: &LsegRef, prev_offset: u64, offset: u64) -> bool {
        seg.is_valid()
            && seg.range().offset <= offset
            && offset < seg.range().end()
            && seg.layout().driver().coalesce_test(seg, prev_offset, offset)
    }

    /// Stripe unit of the segment, if the layout is striped.
    pub fn stripe_unit(&self, seg: &LsegRef) -> Option<u64> {
        seg.layout().driver().get_stripe_unit(seg)
    }
}
