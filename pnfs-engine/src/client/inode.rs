use std::{
    fmt::{Debug, Formatter},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use super::{
    segment::LsegRef,
    transport::{FileHandle, LayoutGetArgs},
    LayoutError,
    LayoutHeader,
    NfsMount,
};
use crate::{
    constants::NFS4_MAX_UINT64,
    core::{CancelToken, IoMode, LayoutRange, Nfs4Status, Stateid},
};

/// LAYOUTGET failures after which the iomode is not asked for again.
fn is_sticky_failure(status: Nfs4Status) -> bool {
    matches!(
        status,
        Nfs4Status::LayoutUnavailable
            | Nfs4Status::BadIoMode
            | Nfs4Status::UnknownLayoutType
            | Nfs4Status::NotSupp
            | Nfs4Status::BadLayout
    )
}

/// An open file on a mount.
pub struct NfsInode {
    fileid: u64,
    fh: FileHandle,
    mount: Arc<NfsMount>,
    /// Seeds the first LAYOUTGET when no layout stateid is held.
    open_stateid: Mutex<Stateid>,
    layout: Mutex<Option<Arc<LayoutHeader>>>,
    size: AtomicU64,
}

impl Debug for NfsInode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "inode {} {:?}", self.fileid, self.fh)
    }
}

impl NfsInode {
    pub fn new(
        mount: &Arc<NfsMount>,
        fileid: u64,
        fh: FileHandle,
        open_stateid: Stateid,
    ) -> Arc<Self> {
        Arc::new(Self {
            fileid,
            fh,
            mount: mount.clone(),
            open_stateid: Mutex::new(open_stateid),
            layout: Mutex::new(None),
            size: AtomicU64::new(0),
        })
    }

    pub fn fileid(&self) -> u64 {
        self.fileid
    }

    pub fn fh(&self) -> &FileHandle {
        &self.fh
    }

    pub fn mount(&self) -> &Arc<NfsMount> {
        &self.mount
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub(crate) fn grow(&self, end: u64) {
        self.size.fetch_max(end, Ordering::AcqRel);
    }

    pub fn set_open_stateid(&self, stateid: Stateid) {
        *self.open_stateid.lock() = stateid;
    }

    /// The layout header, if one was allocated.
    pub fn layout(&self) -> Option<Arc<LayoutHeader>> {
        self.layout.lock().clone()
    }

    fn get_or_alloc_layout(&self) -> Result<Arc<LayoutHeader>, LayoutError> {
        let driver = self
            .mount
            .driver()
            .cloned()
            .ok_or(LayoutError::PnfsDisabled {})?;
        let mut layout = self.layout.lock();
        let hdr = layout.get_or_insert_with(|| {
            LayoutHeader::new(
                self.mount.client(),
                driver,
                self.fh.clone(),
                self.fileid,
                self.mount.fsid(),
            )
        });
        Ok(hdr.clone())
    }

    /// Returns a segment serving `range`, sending a LAYOUTGET on a cache
    /// miss. None means the I/O goes through the MDS.
    pub fn update_layout(&self, range: &LayoutRange) -> Option<LsegRef> {
        match self.layoutget(range) {
            Ok(seg) => Some(seg),
            Err(LayoutError::PnfsDisabled {}) => None,
            Err(error) => {
                debug!("{:?}: no layout for {:?}: {}", self, range, error);
                None
            }
        }
    }

    /// Like [`update_layout`](Self::update_layout), reporting why no
    /// segment could be had.
    pub fn layoutget(&self, range: &LayoutRange) -> Result<LsegRef, LayoutError> {
        if range.iomode == IoMode::Any || !range.is_valid() || range.is_empty() {
            return Err(LayoutError::BadRange {
                range: *range,
            });
        }

        let hdr = self.get_or_alloc_layout()?;
        let client = hdr.client()?;

        let stateid = {
            let mut inner = hdr.inner.lock();
            if let Some(seg) = inner.lookup(range).cloned() {
                seg.get();
                return Ok(LsegRef::new(seg, hdr.clone()));
            }
            if inner.lget_failed[range.iomode.index()] {
                return Err(LayoutError::Failed {
                    iomode: range.iomode,
                });
            }
            if inner.layoutgets_blocked(None, 0) {
                return Err(LayoutError::Blocked {
                    range: *range,
                });
            }
            inner.outstanding += 1;
            // a recall must be able to find the header before the reply is in
            hdr.attach(&mut inner);
            match inner.stateid {
                Some(stateid) if !inner.segs.is_empty() => stateid,
                _ => *self.open_stateid.lock(),
            }
        };

        let args = LayoutGetArgs {
            fh: self.fh.clone(),
            layout_type: hdr.layout_type(),
            range: *range,
            minlength: if range.length == NFS4_MAX_UINT64 {
                0
            } else {
                range.length
            },
            stateid,
        };

        debug!("{:?}: LAYOUTGET {:?}", hdr, range);
        match client.transport().layoutget(&args) {
            Ok(reply) => hdr.layout_process(reply),
            Err(status) => {
                let mut inner = hdr.inner.lock();
                inner.outstanding -= 1;
                if is_sticky_failure(status) {
                    warn!(
                        "{:?}: LAYOUTGET {} failed: {}, not retrying",
                        hdr, range.iomode, status
                    );
                    inner.lget_failed[range.iomode.index()] = true;
                }
                hdr.detach_if_idle(&mut inner);
                drop(inner);
                hdr.wake_waiters();
                Err(LayoutError::Rpc {
                    op: "LAYOUTGET",
                    status,
                })
            }
        }
    }

    /// Returns `range` to the server: the matching segments are invalidated,
    /// in-flight I/O on them is waited for, pending writes are committed and
    /// a LAYOUTRETURN is sent.
    ///
    /// A cancelled or timed out wait leaves the segments invalidated and
    /// queued, so calling again resumes where this call stopped.
    pub fn return_layout(
        &self,
        range: &LayoutRange,
        cancel: Option<&CancelToken>,
    ) -> Result<(), LayoutError> {
        let hdr = self.layout().ok_or(LayoutError::NoLayout {})?;
        let client = hdr.client()?;

        let mut free = Vec::new();
        let waiting = {
            let mut inner = hdr.inner.lock();
            inner.block_lgets += 1;
            inner.mark_matching_invalid(range, &mut free);
            inner.draining.extend(free.iter().cloned());
            inner.draining.clone()
        };
        hdr.free_segments(free);

        if let Err(source) =
            hdr.wait_freed(&waiting, cancel, Some(client.opts().drain_timeout()))
        {
            info!("{:?}: return of {:?} stopped: {}", hdr, range, source);
            let mut inner = hdr.inner.lock();
            inner.block_lgets -= 1;
            hdr.detach_if_idle(&mut inner);
            return Err(LayoutError::Wait {
                source,
            });
        }
        hdr.inner.lock().draining.retain(|s| !s.is_freed());

        if hdr.is_dirty() {
            if let Err(error) = hdr.layoutcommit() {
                warn!("{:?}: commit before return: {}", hdr, error);
            }
        }
        let res = hdr.send_layoutreturn(range);

        {
            let mut inner = hdr.inner.lock();
            inner.block_lgets -= 1;
            hdr.detach_if_idle(&mut inner);
        }
        hdr.wake_waiters();
        res
    }

    /// Sends LAYOUTCOMMIT for the bytes written through pNFS. An
    /// asynchronous commit runs on a worker thread and reports nothing.
    pub fn layoutcommit(&self, sync: bool) -> Result<Option<u64>, LayoutError> {
        let Some(hdr) = self.layout() else {
            return Ok(None);
        };

        if !sync {
            let spawned = std::thread::Builder::new()
                .name(format!("lcommit-{}", self.fileid))
                .spawn({
                    let hdr = hdr.clone();
                    move || {
                        if let Err(error) = hdr.layoutcommit() {
                            warn!("{:?}: async LAYOUTCOMMIT: {}", hdr, error);
                        }
                    }
                });
            if spawned.is_ok() {
                return Ok(None);
            }
        }

        let new_size = hdr.layoutcommit()?;
        if let Some(size) = new_size {
            self.grow(size);
        }
        Ok(new_size)
    }

    /// Close: segments granted return-on-close are dropped without a
    /// LAYOUTRETURN, the server forgets them when it processes the CLOSE.
    /// Returns the number of segments dropped.
    pub fn close_file(&self) -> usize {
        let Some(hdr) = self.layout() else {
            return 0;
        };
        if !hdr.inner.lock().roc {
            return 0;
        }

        if hdr.is_dirty() {
            if let Err(error) = hdr.layoutcommit() {
                warn!("{:?}: commit on close: {}", hdr, error);
            }
        }

        let mut free = Vec::new();
        {
            let mut inner = hdr.inner.lock();
            inner.segs.retain(|seg| {
                if seg.is_roc() && seg.invalidate() {
                    free.push(seg.clone());
                    return false;
                }
                true
            });
            inner.roc = inner.segs.iter().any(|s| s.is_roc());
            if inner.segs.is_empty() {
                // the layout state dies with the open
                inner.stateid = None;
                inner.barrier = 0;
            }
            hdr.detach_if_idle(&mut inner);
        }

        let dropped = free.len();
        hdr.free_segments(free);
        info!("{:?}: dropped {} return-on-close segments", hdr, dropped);
        dropped
    }

    /// Inode eviction: the layout is destroyed locally.
    pub fn evict(&self) {
        let hdr = self.layout.lock().take();
        if let Some(hdr) = hdr {
            hdr.destroy();
        }
    }
}
