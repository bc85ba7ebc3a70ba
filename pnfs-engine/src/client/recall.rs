//! CB_LAYOUTRECALL handling.
//!
//! A recall is answered right away: matching segments are invalidated and
//! new LAYOUTGETs blocked, then a worker thread waits for the in-flight I/O
//! on them to drain and sends the LAYOUTRETURN. FSID and ALL recalls are
//! serialized: one is only accepted while no other recall is pending.
use std::{
    fmt::{Debug, Formatter},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use super::{
    transport::{CbLayoutRecallArgs, LayoutReturnArgs},
    LayoutHeader,
    LayoutSegment,
    NfsClient,
};
use crate::core::{LayoutRange, Nfs4Status, ReturnType};

static NEXT_RECALL_ID: AtomicU64 = AtomicU64::new(1);

/// Headers a recall works on, with the segments it waits for.
type RecallWork = Vec<(Arc<LayoutHeader>, Vec<Arc<LayoutSegment>>)>;

pub(crate) struct RecallRecord {
    id: u64,
    args: CbLayoutRecallArgs,
}

impl Debug for RecallRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "recall {} {:?} {:?}",
            self.id, self.args.return_type, self.args.range
        )
    }
}

impl RecallRecord {
    /// Whether the recall names the header's file.
    fn targets(&self, hdr: &LayoutHeader) -> bool {
        if hdr.layout_type() != self.args.layout_type {
            return false;
        }
        match self.args.return_type {
            ReturnType::File => self.args.fh.as_ref() == Some(hdr.fh()),
            ReturnType::Fsid => self.args.fsid == Some(hdr.fsid()),
            ReturnType::All => true,
        }
    }

    /// Whether the recall covers `range` of the header's file.
    pub(crate) fn covers(&self, hdr: &LayoutHeader, range: &LayoutRange) -> bool {
        self.targets(hdr)
            && (self.args.return_type.is_bulk()
                || (self.args.range.overlaps(range)
                    && range.iomode.matches(self.args.range.iomode)))
    }
}

impl NfsClient {
    /// CB_LAYOUTRECALL. Returns the status sent back to the server: OK if
    /// the layout will be returned, NOMATCHING_LAYOUT if nothing matched,
    /// DELAY if the recall cannot be taken right now.
    pub fn cb_layoutrecall(
        self: &Arc<Self>,
        args: CbLayoutRecallArgs,
    ) -> Nfs4Status {
        let record = Arc::new(RecallRecord {
            id: NEXT_RECALL_ID.fetch_add(1, Ordering::Relaxed),
            args,
        });
        let bulk = record.args.return_type.is_bulk();

        {
            let mut recalls = self.recalls.lock();
            if recalls.len() >= self.opts.max_cb_lrecalls {
                warn!(
                    "{:?}: {} recalls pending, delaying {:?}",
                    self,
                    recalls.len(),
                    record
                );
                return Nfs4Status::Delay;
            }
            if recalls.iter().any(|r| r.args.return_type.is_bulk()) {
                debug!("{:?}: bulk recall pending, delaying {:?}", self, record);
                return Nfs4Status::Delay;
            }
            recalls.push(record.clone());
            if bulk && recalls.len() != 1 {
                recalls.pop();
                debug!("{:?}: {:?} must be the only recall", self, record);
                return Nfs4Status::Delay;
            }
        }

        info!("{:?}: received {:?}", self, record);
        let status = if bulk {
            self.initiate_bulk_draining(&record)
        } else {
            self.initiate_file_draining(&record)
        };

        if status != Nfs4Status::Ok {
            self.finish_recall(&record);
        }
        status
    }

    fn initiate_file_draining(
        self: &Arc<Self>,
        record: &Arc<RecallRecord>,
    ) -> Nfs4Status {
        let hdr = self.layouts.lock().iter().find(|h| record.targets(h)).cloned();
        let Some(hdr) = hdr else {
            debug!("{:?}: no layout for {:?}", self, record);
            return Nfs4Status::NoMatchingLayout;
        };

        let mut free = Vec::new();
        {
            let mut inner = hdr.inner.lock();
            if let Some(stateid) = &record.args.stateid {
                if let Some(current) = inner.stateid {
                    if !current.same_state(stateid) {
                        warn!(
                            "{:?}: {:?} with foreign stateid {:?}",
                            hdr, record, stateid
                        );
                        return Nfs4Status::BadStateid;
                    }
                }
                // replies sent before the recall are stale from now on
                inner.set_stateid(stateid, true);
            }

            inner.mark_matching_invalid(&record.args.range, &mut free);
            if free.is_empty() {
                hdr.detach_if_idle(&mut inner);
                return Nfs4Status::NoMatchingLayout;
            }
            inner.block_lgets += 1;
        }

        let waiting = free.clone();
        hdr.free_segments(free);

        self.spawn_drain(record, vec![(hdr, waiting)]);
        Nfs4Status::Ok
    }

    fn initiate_bulk_draining(
        self: &Arc<Self>,
        record: &Arc<RecallRecord>,
    ) -> Nfs4Status {
        let targets: Vec<Arc<LayoutHeader>> = self
            .layouts
            .lock()
            .iter()
            .filter(|h| record.targets(h))
            .cloned()
            .collect();

        let mut work: RecallWork = Vec::with_capacity(targets.len());
        let mut in_flight = false;
        for hdr in targets {
            let mut free = Vec::new();
            {
                let mut inner = hdr.inner.lock();
                inner.bulk_recall = true;
                inner.mark_matching_invalid(&record.args.range, &mut free);
                // a grant racing with the recall is only forgotten while the
                // header stays marked, so it is part of the return
                in_flight |= inner.outstanding > 0;
            }
            let waiting = free.clone();
            hdr.free_segments(free);
            work.push((hdr, waiting));
        }

        if !in_flight && work.iter().all(|(_, segs)| segs.is_empty()) {
            for (hdr, _) in &work {
                let mut inner = hdr.inner.lock();
                inner.bulk_recall = false;
                hdr.detach_if_idle(&mut inner);
            }
            debug!("{:?}: nothing matches {:?}", self, record);
            return Nfs4Status::NoMatchingLayout;
        }

        self.spawn_drain(record, work);
        Nfs4Status::Ok
    }

    fn spawn_drain(self: &Arc<Self>, record: &Arc<RecallRecord>, work: RecallWork) {
        let client = self.clone();
        let rec = record.clone();
        let fallback = work.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("lrecall-{}", record.id))
            .spawn(move || client.drain_recall(&rec, work));

        if let Err(error) = spawned {
            error!(
                "{:?}: cannot start drain for {:?}: {}, draining inline",
                self, record, error
            );
            self.drain_recall(record, fallback);
        }
    }

    /// Waits for the recalled segments to be released and returns them.
    fn drain_recall(&self, record: &RecallRecord, work: RecallWork) {
        let timeout = self.opts.drain_timeout();
        for (hdr, segs) in &work {
            if let Err(error) = hdr.wait_freed(segs, None, Some(timeout)) {
                warn!("{:?}: {:?} drain: {}, returning anyway", hdr, record, error);
            }
        }

        if record.args.return_type.is_bulk() {
            for (hdr, _) in &work {
                if let Err(error) = hdr.wait_gets_done(Some(timeout)) {
                    warn!(
                        "{:?}: {:?} LAYOUTGET still in flight: {}",
                        hdr, record, error
                    );
                }
            }
        }

        for (hdr, _) in &work {
            if hdr.is_dirty() {
                if let Err(error) = hdr.layoutcommit() {
                    warn!("{:?}: commit before return: {}", hdr, error);
                }
            }
        }

        match record.args.return_type {
            ReturnType::File => {
                for (hdr, _) in &work {
                    if let Err(error) = hdr.send_layoutreturn(&record.args.range)
                    {
                        warn!("{:?}: {:?} not returned: {}", hdr, record, error);
                    }
                    let mut inner = hdr.inner.lock();
                    inner.block_lgets -= 1;
                    hdr.detach_if_idle(&mut inner);
                }
            }
            return_type => {
                let args = LayoutReturnArgs {
                    return_type,
                    layout_type: record.args.layout_type,
                    range: record.args.range,
                    fh: None,
                    fsid: record.args.fsid,
                    stateid: None,
                };
                if let Err(status) = self.transport.layoutreturn(&args) {
                    warn!("{:?}: bulk LAYOUTRETURN failed: {}", self, status);
                }
                for (hdr, _) in &work {
                    let mut inner = hdr.inner.lock();
                    inner.bulk_recall = false;
                    hdr.detach_if_idle(&mut inner);
                }
            }
        }

        for (hdr, _) in &work {
            hdr.wake_waiters();
        }
        self.finish_recall(record);
    }

    fn finish_recall(&self, record: &RecallRecord) {
        self.recalls.lock().retain(|r| r.id != record.id);
        debug!("{:?}: {:?} done", self, record);
        self.recall_wq.wake_all();
    }
}
