use std::{
    fmt::{Debug, Formatter},
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;

use super::{
    segment::{LayoutSegment, LsegRef},
    transport::{
        FileHandle,
        LayoutCommitArgs,
        LayoutGetReply,
        LayoutReturnArgs,
    },
    LayoutError,
    NfsClient,
};
use crate::{
    core::{
        end_offset,
        seqid_is_newer,
        CancelToken,
        CoreError,
        Fsid,
        IoMode,
        LayoutRange,
        LayoutType,
        Nfs4Status,
        ReturnType,
        Stateid,
        WaitQueue,
    },
    deviceid::{DeviceError, DeviceId, DeviceRef},
    driver::{DevicePayload, DriverError, HeaderPayload, LayoutDriver},
};

/// Keep the barrier within this distance behind the current seqid so it
/// still compares as "behind" across wraparound.
const BARRIER_WINDOW: u32 = 3 << 29;

/// State of a layout header, guarded by the header lock.
#[derive(Debug, Default)]
pub(crate) struct HeaderInner {
    /// Linked segments, READWRITE before READ.
    pub(crate) segs: Vec<Arc<LayoutSegment>>,
    pub(crate) stateid: Option<Stateid>,
    /// LAYOUTGET replies with a seqid not ahead of this are stale.
    pub(crate) barrier: u32,
    pub(crate) block_lgets: u32,
    pub(crate) bulk_recall: bool,
    pub(crate) roc: bool,
    pub(crate) outstanding: u32,
    /// Per iomode "LAYOUTGET failed, do not retry" bits. Never cleared.
    pub(crate) lget_failed: [bool; 2],
    /// Bytes written through pNFS since the last LAYOUTCOMMIT.
    pub(crate) write_range: Option<(u64, u64)>,
    /// Invalidated segments a LAYOUTRETURN still waits for.
    pub(crate) draining: Vec<Arc<LayoutSegment>>,
    pub(crate) on_list: bool,
}

impl HeaderInner {
    /// First valid segment serving `range`.
    pub(crate) fn lookup(&self, range: &LayoutRange) -> Option<&Arc<LayoutSegment>> {
        self.segs.iter().find(|s| s.is_valid() && s.serves(range))
    }

    /// Links a segment, READWRITE segments ahead of READ ones and in arrival
    /// order within their class.
    pub(crate) fn insert(&mut self, seg: Arc<LayoutSegment>) {
        let pos = if seg.iomode() == IoMode::ReadWrite {
            self.segs
                .iter()
                .position(|s| s.iomode() != IoMode::ReadWrite)
                .unwrap_or(self.segs.len())
        } else {
            self.segs.len()
        };
        trace!("inserting {:?} at {}", seg, pos);
        self.segs.insert(pos, seg);
    }

    /// Invalidates and unlinks every segment selected by `range`, handing
    /// the list references over to `free`. Returns the number moved.
    pub(crate) fn mark_matching_invalid(
        &mut self,
        range: &LayoutRange,
        free: &mut Vec<Arc<LayoutSegment>>,
    ) -> usize {
        let before = free.len();
        self.segs.retain(|seg| {
            if !seg.matches_recall(range) {
                return true;
            }
            if seg.invalidate() {
                debug!("{:?}: invalidated by {:?}", seg, range);
                free.push(seg.clone());
            }
            false
        });
        free.len() - before
    }

    /// Whether a LAYOUTGET may be sent, or its reply with `stateid`
    /// accepted. `lget` is the number of outstanding LAYOUTGETs the caller
    /// itself accounts for.
    pub(crate) fn layoutgets_blocked(
        &self,
        stateid: Option<&Stateid>,
        lget: u32,
    ) -> bool {
        if let Some(stateid) = stateid {
            if !seqid_is_newer(stateid.seqid, self.barrier) {
                return true;
            }
        }
        self.block_lgets > 0
            || self.bulk_recall
            || (self.segs.is_empty() && self.outstanding > lget)
    }

    /// Adopts `new` if it is ahead of the current stateid. With
    /// `update_barrier` the barrier moves up to the new seqid, otherwise it
    /// is only dragged along to stay comparable across wraparound.
    pub(crate) fn set_stateid(&mut self, new: &Stateid, update_barrier: bool) {
        let newer = match self.stateid {
            Some(current) => seqid_is_newer(new.seqid, current.seqid),
            None => true,
        };
        if !newer {
            return;
        }
        self.stateid = Some(*new);
        if update_barrier {
            if seqid_is_newer(new.seqid, self.barrier) {
                self.barrier = new.seqid;
            }
        } else if new.seqid.wrapping_sub(self.barrier) > BARRIER_WINDOW {
            self.barrier = new.seqid.wrapping_sub(BARRIER_WINDOW);
        }
    }

    /// Nothing references the header from the client's point of view: no
    /// segments, no LAYOUTGET in flight and no recall working on it.
    pub(crate) fn is_idle(&self) -> bool {
        self.segs.is_empty()
            && self.outstanding == 0
            && self.block_lgets == 0
            && !self.bulk_recall
    }
}

/// Per-inode layout state of one client.
pub struct LayoutHeader {
    client: Weak<NfsClient>,
    fh: FileHandle,
    fileid: u64,
    fsid: Fsid,
    driver: Arc<dyn LayoutDriver>,
    private: Option<HeaderPayload>,
    pub(crate) inner: Mutex<HeaderInner>,
    wq: WaitQueue,
}

impl Debug for LayoutHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "layout {} ({})", self.fileid, self.driver.layout_type())
    }
}

impl LayoutHeader {
    pub(crate) fn new(
        client: &Arc<NfsClient>,
        driver: Arc<dyn LayoutDriver>,
        fh: FileHandle,
        fileid: u64,
        fsid: Fsid,
    ) -> Arc<Self> {
        let private = driver.alloc_layout_hdr();
        let hdr = Arc::new(Self {
            client: Arc::downgrade(client),
            fh,
            fileid,
            fsid,
            driver,
            private,
            inner: Mutex::new(HeaderInner::default()),
            wq: WaitQueue::new(),
        });
        debug!("{:?}: allocated", hdr);
        hdr
    }

    pub fn fh(&self) -> &FileHandle {
        &self.fh
    }

    pub fn fileid(&self) -> u64 {
        self.fileid
    }

    pub fn fsid(&self) -> Fsid {
        self.fsid
    }

    pub fn layout_type(&self) -> LayoutType {
        self.driver.layout_type()
    }

    pub fn driver(&self) -> &Arc<dyn LayoutDriver> {
        &self.driver
    }

    /// State the driver attached to the header, see
    /// [`LayoutDriver::alloc_layout_hdr`].
    pub fn driver_private(&self) -> Option<&HeaderPayload> {
        self.private.as_ref()
    }

    pub(crate) fn client(&self) -> Result<Arc<NfsClient>, LayoutError> {
        self.client.upgrade().ok_or(LayoutError::ClientGone {})
    }

    pub fn stateid(&self) -> Option<Stateid> {
        self.inner.lock().stateid
    }

    pub fn barrier(&self) -> u32 {
        self.inner.lock().barrier
    }

    pub fn segment_count(&self) -> usize {
        self.inner.lock().segs.len()
    }

    /// Snapshot of the linked segments, in list order.
    pub fn segments(&self) -> Vec<Arc<LayoutSegment>> {
        self.inner.lock().segs.clone()
    }

    pub fn block_lgets(&self) -> u32 {
        self.inner.lock().block_lgets
    }

    pub fn is_bulk_recall(&self) -> bool {
        self.inner.lock().bulk_recall
    }

    pub fn lget_failed(&self, iomode: IoMode) -> bool {
        self.inner.lock().lget_failed[iomode.index()]
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.lock().write_range.is_some()
    }

    pub fn is_on_client_list(&self) -> bool {
        self.inner.lock().on_list
    }

    pub fn layoutgets_blocked(&self) -> bool {
        self.inner.lock().layoutgets_blocked(None, 0)
    }

    /// Resolves a device through the client's device cache.
    pub fn get_device(
        &self,
        id: &DeviceId,
    ) -> Result<DeviceRef<DevicePayload>, DriverError> {
        let client = self.client.upgrade().ok_or(DriverError::Device {
            source: DeviceError::NoCache {
                layout_type: self.layout_type(),
            },
        })?;
        client
            .get_device(&self.driver, id)
            .map_err(|source| DriverError::Device {
                source,
            })
    }

    pub fn put_device(&self, dev: DeviceRef<DevicePayload>) {
        match self.client.upgrade() {
            Some(client) => client.put_device(self.layout_type(), dev),
            None => warn!("{:?}: client gone, leaking {:?}", self, dev),
        }
    }

    /// Looks up a valid segment serving `range` and takes a reference.
    pub fn find_or_get(self: &Arc<Self>, range: &LayoutRange) -> Option<LsegRef> {
        let inner = self.inner.lock();
        inner.lookup(range).map(|seg| {
            seg.get();
            LsegRef::new(seg.clone(), self.clone())
        })
    }

    /// Invalidates the segments selected by `range` and releases the list
    /// references once the header lock is dropped.
    pub fn invalidate_matching(&self, range: &LayoutRange) -> usize {
        let mut free = Vec::new();
        let moved = {
            let mut inner = self.inner.lock();
            let moved = inner.mark_matching_invalid(range, &mut free);
            self.detach_if_idle(&mut inner);
            moved
        };
        self.free_segments(free);
        moved
    }

    /// Puts the client's active list in step with the header: linked while
    /// anything may still target it.
    pub(crate) fn attach(self: &Arc<Self>, inner: &mut HeaderInner) {
        if inner.on_list {
            return;
        }
        if let Some(client) = self.client.upgrade() {
            client.link_layout(self.clone());
            inner.on_list = true;
        }
    }

    pub(crate) fn detach_if_idle(&self, inner: &mut HeaderInner) {
        if !inner.on_list || !inner.is_idle() {
            return;
        }
        if let Some(client) = self.client.upgrade() {
            client.unlink_layout(self);
        }
        inner.on_list = false;
    }

    /// Drops the list references of invalidated segments. Must be called
    /// without the header lock held: the last put runs the driver's free.
    pub(crate) fn free_segments(&self, free: Vec<Arc<LayoutSegment>>) {
        for seg in free {
            seg.put(self);
        }
    }

    pub(crate) fn wake_waiters(&self) {
        self.wq.wake_all();
    }

    /// Waits until every segment in `segs` has been freed.
    pub(crate) fn wait_freed(
        &self,
        segs: &[Arc<LayoutSegment>],
        cancel: Option<&CancelToken>,
        timeout: Option<Duration>,
    ) -> Result<(), CoreError> {
        self.wq
            .wait_until(|| segs.iter().all(|s| s.is_freed()), cancel, timeout)
    }

    /// Waits until no LAYOUTGET is in flight on the header.
    pub(crate) fn wait_gets_done(
        &self,
        timeout: Option<Duration>,
    ) -> Result<(), CoreError> {
        self.wq
            .wait_until(|| self.inner.lock().outstanding == 0, None, timeout)
    }

    /// Records a pNFS write for the next LAYOUTCOMMIT.
    pub(crate) fn set_layoutcommit(&self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let end = end_offset(offset, len);
        let mut inner = self.inner.lock();
        inner.write_range = Some(match inner.write_range {
            Some((b, e)) => (b.min(offset), e.max(end)),
            None => (offset, end),
        });
    }

    /// Materializes a LAYOUTGET reply and links it, unless a recall or the
    /// stateid barrier says the reply is stale.
    pub(crate) fn layout_process(
        self: &Arc<Self>,
        reply: LayoutGetReply,
    ) -> Result<LsegRef, LayoutError> {
        let client = self.client()?;
        let iomode = reply.range.iomode;

        let payload = match self.driver.alloc_segment(self, &reply.range, &reply.body)
        {
            Ok(payload) => payload,
            Err(source) => {
                warn!("{:?}: cannot use layout {:?}: {}", self, reply.range, source);
                let mut inner = self.inner.lock();
                inner.outstanding -= 1;
                inner.lget_failed[iomode.index()] = true;
                self.detach_if_idle(&mut inner);
                drop(inner);
                self.wq.wake_all();
                return Err(LayoutError::Driver {
                    source,
                });
            }
        };

        let seg = Arc::new(LayoutSegment::new(
            reply.range,
            Arc::downgrade(self),
            reply.return_on_close,
            payload,
        ));

        let mut inner = self.inner.lock();
        let recalled = client.recall_pending(self, &reply.range);
        let blocked = inner.layoutgets_blocked(Some(&reply.stateid), 1);
        inner.outstanding -= 1;

        if recalled || blocked {
            // the server moved the state forward even if the segment is dropped
            inner.set_stateid(&reply.stateid, false);
            self.detach_if_idle(&mut inner);
            drop(inner);
            debug!(
                "{:?}: forgetting reply {:?} stateid {:?}, {}",
                self,
                reply.range,
                reply.stateid,
                if recalled { "recall pending" } else { "stale state" }
            );
            seg.invalidate();
            seg.put(self);
            self.wq.wake_all();
            return Err(LayoutError::Forgotten {
                range: reply.range,
            });
        }

        // one reference for the list, one for the caller
        seg.get();
        inner.insert(seg.clone());
        if reply.return_on_close {
            inner.roc = true;
        }
        inner.set_stateid(&reply.stateid, false);
        drop(inner);

        debug!("{:?}: got {:?}", self, seg);
        self.wq.wake_all();
        Ok(LsegRef::new(seg, self.clone()))
    }

    /// Sends a pending LAYOUTCOMMIT. Returns the new file size if the server
    /// reported one.
    pub fn layoutcommit(&self) -> Result<Option<u64>, LayoutError> {
        let client = self.client()?;
        let (start, end, stateid) = {
            let mut inner = self.inner.lock();
            let Some((start, end)) = inner.write_range.take() else {
                return Ok(None);
            };
            match inner.stateid {
                Some(stateid) => (start, end, stateid),
                None => {
                    inner.write_range = Some((start, end));
                    return Err(LayoutError::NoLayout {});
                }
            }
        };

        let range = LayoutRange::from_bounds(IoMode::ReadWrite, start, end);
        let args = LayoutCommitArgs {
            fh: self.fh.clone(),
            layout_type: self.layout_type(),
            stateid,
            range,
            last_write_offset: Some(end - 1),
            time_modify: Some(chrono::Utc::now()),
            update: self.driver.setup_layoutcommit(self, &range),
        };

        debug!("{:?}: LAYOUTCOMMIT {:?}", self, range);
        let res = client.transport().layoutcommit(&args);
        let status = res.as_ref().err().copied().unwrap_or(Nfs4Status::Ok);
        self.driver.cleanup_layoutcommit(self, status);

        match res {
            Ok(reply) => Ok(reply.new_size),
            Err(status) => {
                warn!("{:?}: LAYOUTCOMMIT failed: {}", self, status);
                let mut inner = self.inner.lock();
                inner.write_range = Some(match inner.write_range {
                    Some((b, e)) => (b.min(start), e.max(end)),
                    None => (start, end),
                });
                Err(LayoutError::Rpc {
                    op: "LAYOUTCOMMIT",
                    status,
                })
            }
        }
    }

    /// Sends a FILE LAYOUTRETURN for `range` and adopts the returned
    /// stateid. Nothing is sent if the server holds no layout state.
    pub(crate) fn send_layoutreturn(
        &self,
        range: &LayoutRange,
    ) -> Result<(), LayoutError> {
        let client = self.client()?;
        let Some(stateid) = self.stateid() else {
            debug!("{:?}: no layout stateid, skipping LAYOUTRETURN", self);
            return Ok(());
        };

        let args = LayoutReturnArgs {
            return_type: ReturnType::File,
            layout_type: self.layout_type(),
            range: *range,
            fh: Some(self.fh.clone()),
            fsid: None,
            stateid: Some(stateid),
        };

        debug!("{:?}: LAYOUTRETURN {:?}", self, range);
        match client.transport().layoutreturn(&args) {
            Ok(new) => {
                let mut inner = self.inner.lock();
                match new {
                    Some(new) => inner.set_stateid(&new, true),
                    None if inner.segs.is_empty() => inner.stateid = None,
                    None => {}
                }
                Ok(())
            }
            Err(status) => {
                warn!("{:?}: LAYOUTRETURN {:?} failed: {}", self, range, status);
                Err(LayoutError::Rpc {
                    op: "LAYOUTRETURN",
                    status,
                })
            }
        }
    }

    /// Tears the whole layout down locally: every segment is invalidated,
    /// the stateid forgotten and the header dropped from the active list.
    pub(crate) fn destroy(&self) -> usize {
        let mut free = Vec::new();
        let moved = {
            let mut inner = self.inner.lock();
            let moved =
                inner.mark_matching_invalid(&LayoutRange::all(IoMode::Any), &mut free);
            inner.stateid = None;
            inner.roc = false;
            inner.write_range = None;
            inner.draining.clear();
            self.detach_if_idle(&mut inner);
            moved
        };
        self.free_segments(free);
        debug!("{:?}: destroyed, {} segments dropped", self, moved);
        moved
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sid(seqid: u32) -> Stateid {
        Stateid::new(seqid, [3; 12])
    }

    #[test]
    fn barrier_blocks_stale_replies() {
        let mut inner = HeaderInner::default();
        assert!(!inner.layoutgets_blocked(Some(&sid(1)), 0));

        inner.set_stateid(&sid(5), true);
        assert_eq!(inner.barrier, 5);
        assert!(inner.layoutgets_blocked(Some(&sid(5)), 0));
        assert!(inner.layoutgets_blocked(Some(&sid(4)), 0));
        assert!(!inner.layoutgets_blocked(Some(&sid(6)), 0));
    }

    #[test]
    fn barrier_is_dragged_behind_the_stateid() {
        let mut inner = HeaderInner::default();
        inner.set_stateid(&sid(1), true);
        inner.set_stateid(&sid(BARRIER_WINDOW), false);
        assert_eq!(inner.barrier, 1);

        let far = BARRIER_WINDOW + 100;
        inner.set_stateid(&sid(far), false);
        assert_eq!(inner.barrier, 100);
        assert!(!inner.layoutgets_blocked(Some(&sid(far)), 0));
        assert!(inner.layoutgets_blocked(Some(&sid(100)), 0));
    }

    #[test]
    fn stateid_never_regresses() {
        let mut inner = HeaderInner::default();
        inner.set_stateid(&sid(u32::MAX), false);
        inner.set_stateid(&sid(7), false);
        assert_eq!(inner.stateid.unwrap().seqid, 7);
        inner.set_stateid(&sid(3), false);
        assert_eq!(inner.stateid.unwrap().seqid, 7);
        inner.set_stateid(&sid(7), false);
        assert_eq!(inner.stateid.unwrap().seqid, 7);
    }

    #[test]
    fn outstanding_get_blocks_empty_header() {
        let mut inner = HeaderInner {
            outstanding: 1,
            ..Default::default()
        };
        assert!(inner.layoutgets_blocked(None, 0));
        assert!(!inner.layoutgets_blocked(None, 1));
        inner.block_lgets = 1;
        assert!(inner.layoutgets_blocked(None, 1));
    }
}
