//! Client side of pNFS: the per-inode layout segment cache, the
//! LAYOUTGET/LAYOUTRETURN/LAYOUTCOMMIT state machine and the handling of
//! server callbacks (CB_LAYOUTRECALL, CB_NOTIFY_DEVICEID).
//!
//! Lock order: a header's lock may be held while taking the client's layout
//! list or recall list locks, never the other way around. Driver callbacks
//! that may block (segment free, device free) run without any of them.
use std::{
    collections::HashMap,
    fmt::{Debug, Formatter},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use snafu::Snafu;

pub use header::LayoutHeader;
pub use inode::NfsInode;
pub use segment::{LayoutSegment, LsegRef, SegmentState};
pub use transport::{
    CbLayoutRecallArgs,
    FileHandle,
    LayoutCommitArgs,
    LayoutCommitReply,
    LayoutGetArgs,
    LayoutGetReply,
    LayoutReturnArgs,
    LayoutTransport,
};

use recall::RecallRecord;

use crate::{
    core::{
        CoreError,
        Fsid,
        IoMode,
        LayoutRange,
        LayoutType,
        Nfs4Status,
        WaitQueue,
    },
    deviceid::{DeviceError, DeviceId, DeviceIdCache, DeviceRef},
    driver::{DevicePayload, DriverError, LayoutDriver, LayoutDriverRegistry},
    subsys::config::{ClientOpts, DeviceCacheOpts},
};

mod header;
mod inode;
mod io;
mod recall;
mod segment;
mod transport;

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)))]
pub enum LayoutError {
    #[snafu(display("pNFS is not enabled on this mount"))]
    PnfsDisabled {},
    #[snafu(display("Invalid layout range {:?}", range))]
    BadRange { range: LayoutRange },
    #[snafu(display("Layoutgets are blocked for {:?}", range))]
    Blocked { range: LayoutRange },
    #[snafu(display("An earlier LAYOUTGET for iomode {} failed", iomode))]
    Failed { iomode: IoMode },
    #[snafu(display("{} failed: {}", op, status))]
    Rpc { op: &'static str, status: Nfs4Status },
    #[snafu(display("LAYOUTGET reply for {:?} was forgotten", range))]
    Forgotten { range: LayoutRange },
    #[snafu(display("Layout driver error: {}", source))]
    Driver { source: DriverError },
    #[snafu(display("Waiting for the layout to drain failed: {}", source))]
    Wait { source: CoreError },
    #[snafu(display("No layout is held"))]
    NoLayout {},
    #[snafu(display("The NFS client is gone"))]
    ClientGone {},
}

impl LayoutError {
    pub fn status(&self) -> Nfs4Status {
        match self {
            Self::PnfsDisabled {} => Nfs4Status::LayoutUnavailable,
            Self::BadRange {
                ..
            } => Nfs4Status::Inval,
            Self::Blocked {
                ..
            } => Nfs4Status::LayoutTryLater,
            Self::Failed {
                ..
            } => Nfs4Status::LayoutUnavailable,
            Self::Rpc {
                status, ..
            } => *status,
            Self::Forgotten {
                ..
            } => Nfs4Status::Delay,
            Self::Driver {
                source,
            } => source.status(),
            Self::Wait {
                source,
            } => source.status(),
            Self::NoLayout {} => Nfs4Status::NoMatchingLayout,
            Self::ClientGone {} => Nfs4Status::Expired,
        }
    }

    /// Back off and retry, rather than giving up on pNFS for this I/O.
    pub fn is_retryable(&self) -> bool {
        self.status().is_retryable()
    }
}

/// One NFSv4.1 client instance: everything that is shared by the mounts of
/// one server.
pub struct NfsClient {
    name: String,
    transport: Arc<dyn LayoutTransport>,
    drivers: Arc<LayoutDriverRegistry>,
    opts: ClientOpts,
    cache_opts: DeviceCacheOpts,
    /// Headers a recall may target.
    layouts: Mutex<Vec<Arc<LayoutHeader>>>,
    recalls: Mutex<Vec<Arc<RecallRecord>>>,
    recall_wq: WaitQueue,
    devices: Mutex<HashMap<LayoutType, Arc<DeviceIdCache<DevicePayload>>>>,
}

impl Debug for NfsClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "nfs client {}", self.name)
    }
}

impl NfsClient {
    pub fn new(
        name: &str,
        transport: Arc<dyn LayoutTransport>,
        drivers: Arc<LayoutDriverRegistry>,
        opts: ClientOpts,
        cache_opts: DeviceCacheOpts,
    ) -> Arc<Self> {
        info!("creating nfs client {} with {:?}", name, opts);
        Arc::new(Self {
            name: name.to_string(),
            transport,
            drivers,
            opts,
            cache_opts,
            layouts: Mutex::new(Vec::new()),
            recalls: Mutex::new(Vec::new()),
            recall_wq: WaitQueue::new(),
            devices: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn opts(&self) -> &ClientOpts {
        &self.opts
    }

    pub fn drivers(&self) -> &Arc<LayoutDriverRegistry> {
        &self.drivers
    }

    pub(crate) fn transport(&self) -> &Arc<dyn LayoutTransport> {
        &self.transport
    }

    /// Snapshot of the headers on the active layout list.
    pub fn layouts(&self) -> Vec<Arc<LayoutHeader>> {
        self.layouts.lock().clone()
    }

    pub fn pending_recalls(&self) -> usize {
        self.recalls.lock().len()
    }

    pub(crate) fn link_layout(&self, hdr: Arc<LayoutHeader>) {
        trace!("{:?}: linking {:?}", self, hdr);
        self.layouts.lock().push(hdr);
    }

    pub(crate) fn unlink_layout(&self, hdr: &LayoutHeader) {
        trace!("{:?}: unlinking {:?}", self, hdr);
        self.layouts
            .lock()
            .retain(|h| !std::ptr::eq(Arc::as_ptr(h), hdr));
    }

    /// Whether a pending recall covers `range` of the header's file.
    pub(crate) fn recall_pending(
        &self,
        hdr: &LayoutHeader,
        range: &LayoutRange,
    ) -> bool {
        self.recalls.lock().iter().any(|r| r.covers(hdr, range))
    }

    fn device_cache(
        &self,
        driver: &Arc<dyn LayoutDriver>,
    ) -> Arc<DeviceIdCache<DevicePayload>> {
        let layout_type = driver.layout_type();
        let mut devices = self.devices.lock();
        devices
            .entry(layout_type)
            .or_insert_with(|| {
                let driver = driver.clone();
                Arc::new(DeviceIdCache::with_hash_bits(
                    layout_type,
                    self.cache_opts.hash_bits,
                    move |id, payload| driver.free_deviceid_node(id, payload),
                ))
            })
            .clone()
    }

    /// Resolves a device id, asking the server with GETDEVICEINFO on a cache
    /// miss. Concurrent misses for the same id may both ask; the cache keeps
    /// one of the answers and the returned node is always that one.
    pub fn get_device(
        &self,
        driver: &Arc<dyn LayoutDriver>,
        id: &DeviceId,
    ) -> Result<DeviceRef<DevicePayload>, DeviceError> {
        let cache = self.device_cache(driver);
        if let Some(dev) = cache.find_get(id) {
            return Ok(dev);
        }

        debug!("{:?}: GETDEVICEINFO {} ({})", self, id, driver.layout_type());
        let addr = self
            .transport
            .getdeviceinfo(driver.layout_type(), id)
            .map_err(|status| DeviceError::GetDeviceInfo {
                id: *id,
                status,
            })?;
        let payload =
            driver
                .alloc_deviceid_node(id, &addr)
                .map_err(|e| DeviceError::DecodeFailed {
                    id: *id,
                    reason: e.to_string(),
                })?;
        Ok(cache.add(*id, payload))
    }

    pub fn put_device(
        &self,
        layout_type: LayoutType,
        dev: DeviceRef<DevicePayload>,
    ) {
        let cache = self.devices.lock().get(&layout_type).cloned();
        match cache {
            Some(cache) => cache.put(dev),
            None => error!("{:?}: no device cache for {:?}", self, dev),
        }
    }

    /// Number of cached devices of a layout type.
    pub fn cached_devices(&self, layout_type: LayoutType) -> usize {
        self.devices
            .lock()
            .get(&layout_type)
            .map_or(0, |c| c.len())
    }

    /// CB_NOTIFY_DEVICEID: the named devices changed or went away, the next
    /// use fetches them again. Returns the number of cache entries dropped.
    pub fn cb_notify_deviceid(
        &self,
        layout_type: LayoutType,
        ids: &[DeviceId],
    ) -> usize {
        let Some(cache) = self.devices.lock().get(&layout_type).cloned() else {
            return 0;
        };
        let dropped = ids.iter().filter(|id| cache.delete(id)).count();
        info!(
            "{:?}: CB_NOTIFY_DEVICEID dropped {} of {} devices",
            self,
            dropped,
            ids.len()
        );
        dropped
    }

    /// Lease expiry sweep: every layout is torn down locally without
    /// talking to the server. Returns the number of headers destroyed.
    pub fn destroy_all_layouts(&self) -> usize {
        let layouts = self.layouts();
        for hdr in &layouts {
            hdr.destroy();
        }
        info!("{:?}: destroyed {} layouts", self, layouts.len());
        layouts.len()
    }

    /// Waits until no CB_LAYOUTRECALL is being processed.
    pub fn wait_recalls_idle(
        &self,
        timeout: Option<Duration>,
    ) -> Result<(), CoreError> {
        self.recall_wq
            .wait_until(|| self.recalls.lock().is_empty(), None, timeout)
    }
}

/// A mounted filesystem. `driver` is None when pNFS is not used on it.
pub struct NfsMount {
    client: Arc<NfsClient>,
    fsid: Fsid,
    driver: Option<Arc<dyn LayoutDriver>>,
}

impl Debug for NfsMount {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.driver {
            Some(driver) => write!(f, "mount {} ({})", self.fsid, driver.name()),
            None => write!(f, "mount {} (no pnfs)", self.fsid),
        }
    }
}

impl NfsMount {
    /// Mounts `fsid`, picking the first layout type in the server's
    /// `advertised` list that has a registered driver.
    pub fn new(
        client: &Arc<NfsClient>,
        fsid: Fsid,
        advertised: &[u32],
    ) -> Result<Arc<Self>, LayoutError> {
        let driver = if client.opts.pnfs_enabled {
            client.drivers.select(advertised)
        } else {
            None
        };

        if let Some(driver) = &driver {
            driver.mount_init(fsid).map_err(|source| LayoutError::Driver {
                source,
            })?;
        }

        let mount = Arc::new(Self {
            client: client.clone(),
            fsid,
            driver,
        });
        info!("{:?}: mounted", mount);
        Ok(mount)
    }

    pub fn client(&self) -> &Arc<NfsClient> {
        &self.client
    }

    pub fn fsid(&self) -> Fsid {
        self.fsid
    }

    pub fn driver(&self) -> Option<&Arc<dyn LayoutDriver>> {
        self.driver.as_ref()
    }

    pub fn pnfs_enabled(&self) -> bool {
        self.driver.is_some()
    }
}

impl Drop for NfsMount {
    fn drop(&mut self) {
        if let Some(driver) = &self.driver {
            driver.mount_uninit(self.fsid);
        }
    }
}
