//! Device id cache: resolves opaque NFSv4.1 device ids to driver specific
//! storage target information, shared by every layout of one client.
//!
//! Lookups run under the read side of the table lock and only take a
//! reference if the node is still live ("increment if not zero"), so a node
//! whose last reference is being dropped is never resurrected. Dropping the
//! last reference unhashes the node, waits until no lookup still holds a
//! transient pointer to it and then hands the payload to the driver's free
//! callback, outside of any lock.
use std::{
    fmt::{Debug, Display, Formatter},
    ops::Deref,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use snafu::Snafu;

use crate::{
    constants::{DEVICEID_HASH_BITS, NFS4_DEVICEID4_SIZE},
    core::{LayoutType, Nfs4Status},
};

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)))]
pub enum DeviceError {
    #[snafu(display("Device {} could not be decoded: {}", id, reason))]
    DecodeFailed { id: DeviceId, reason: String },
    #[snafu(display("GETDEVICEINFO for device {} failed: {}", id, status))]
    GetDeviceInfo { id: DeviceId, status: Nfs4Status },
    #[snafu(display("No device cache for layout type {}", layout_type))]
    NoCache { layout_type: LayoutType },
}

impl DeviceError {
    pub fn status(&self) -> Nfs4Status {
        match self {
            Self::DecodeFailed {
                ..
            } => Nfs4Status::Inval,
            Self::GetDeviceInfo {
                status, ..
            } => *status,
            Self::NoCache {
                ..
            } => Nfs4Status::UnknownLayoutType,
        }
    }
}

/// Opaque NFSv4.1 device identifier.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct DeviceId(pub [u8; NFS4_DEVICEID4_SIZE]);

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceId({})", self)
    }
}

impl DeviceId {
    fn hash(&self, mask: usize) -> usize {
        self.0
            .iter()
            .fold(0u32, |x, b| x.wrapping_mul(37).wrapping_add(*b as u32))
            as usize
            & mask
    }
}

/// A cached device.
pub struct DeviceNode<D> {
    id: DeviceId,
    refcount: AtomicU32,
    payload: D,
}

impl<D> DeviceNode<D> {
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn payload(&self) -> &D {
        &self.payload
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Takes a reference unless the node is already on its way out.
    fn get_not_zero(&self) -> bool {
        self.refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                if r == 0 {
                    None
                } else {
                    Some(r + 1)
                }
            })
            .is_ok()
    }
}

/// A counted reference to a cached device, handed back with
/// [`DeviceIdCache::put`]. Not `Clone`: every reference is accounted for in
/// the node's reference count.
pub struct DeviceRef<D>(Arc<DeviceNode<D>>);

impl<D> Deref for DeviceRef<D> {
    type Target = DeviceNode<D>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<D> Debug for DeviceRef<D> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "device {} ref {}", self.0.id, self.0.refcount())
    }
}

type FreeFn<D> = Box<dyn Fn(&DeviceId, D) + Send + Sync>;

pub struct DeviceIdCache<D> {
    layout_type: LayoutType,
    mask: usize,
    buckets: RwLock<Vec<Vec<Arc<DeviceNode<D>>>>>,
    free: FreeFn<D>,
}

impl<D: Send + Sync> Debug for DeviceIdCache<D> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "deviceid cache {} ({} entries)", self.layout_type, self.len())
    }
}

impl<D: Send + Sync> DeviceIdCache<D> {
    pub fn new<F>(layout_type: LayoutType, free: F) -> Self
    where
        F: Fn(&DeviceId, D) + Send + Sync + 'static,
    {
        Self::with_hash_bits(layout_type, DEVICEID_HASH_BITS, free)
    }

    pub fn with_hash_bits<F>(
        layout_type: LayoutType,
        hash_bits: u32,
        free: F,
    ) -> Self
    where
        F: Fn(&DeviceId, D) + Send + Sync + 'static,
    {
        let size = 1usize << hash_bits;
        Self {
            layout_type,
            mask: size - 1,
            buckets: RwLock::new((0 .. size).map(|_| Vec::new()).collect()),
            free: Box::new(free),
        }
    }

    pub fn layout_type(&self) -> LayoutType {
        self.layout_type
    }

    /// Looks up a device and takes a reference to it.
    pub fn find_get(&self, id: &DeviceId) -> Option<DeviceRef<D>> {
        let buckets = self.buckets.read();
        buckets[id.hash(self.mask)]
            .iter()
            .find(|n| n.id == *id && n.get_not_zero())
            .map(|n| DeviceRef(n.clone()))
    }

    /// Inserts a freshly decoded device. If another thread inserted the same
    /// id first, the candidate is released through the free callback and the
    /// existing node is returned instead: callers must use the returned node.
    pub fn add(&self, id: DeviceId, payload: D) -> DeviceRef<D> {
        let winner = {
            let mut buckets = self.buckets.write();
            let bucket = &mut buckets[id.hash(self.mask)];

            let existing = bucket
                .iter()
                .find(|n| n.id == id && n.get_not_zero())
                .cloned();

            match existing {
                Some(existing) => existing,
                None => {
                    // a dying node with the same id is already unreachable
                    bucket.retain(|n| n.id != id);
                    let node = Arc::new(DeviceNode {
                        id,
                        refcount: AtomicU32::new(1),
                        payload,
                    });
                    bucket.push(node.clone());
                    trace!("device {}: added to {}", id, self.layout_type);
                    return DeviceRef(node);
                }
            }
        };

        debug!("device {}: lost insertion race, releasing candidate", id);
        (self.free)(&id, payload);
        DeviceRef(winner)
    }

    /// Drops a reference. The last one unhashes the node and frees it once
    /// no concurrent lookup can still see it.
    pub fn put(&self, node: DeviceRef<D>) {
        let node = node.0;
        let prev = node.refcount.fetch_sub(1, Ordering::AcqRel);
        assert_ne!(prev, 0, "device {} reference count underflow", node.id);
        if prev != 1 {
            return;
        }

        {
            let mut buckets = self.buckets.write();
            buckets[node.id.hash(self.mask)].retain(|n| !Arc::ptr_eq(n, &node));
        }

        let mut node = node;
        let node = loop {
            match Arc::try_unwrap(node) {
                Ok(n) => break n,
                Err(n) => {
                    // a reader that lost the increment race still holds it
                    node = n;
                    std::thread::yield_now();
                }
            }
        };

        trace!("device {}: freeing", node.id);
        (self.free)(&node.id, node.payload);
    }

    /// Makes a device unreachable for new lookups; it is freed when its last
    /// reference is put. Returns false if the id was not cached.
    pub fn delete(&self, id: &DeviceId) -> bool {
        let mut buckets = self.buckets.write();
        let bucket = &mut buckets[id.hash(self.mask)];
        let before = bucket.len();
        bucket.retain(|n| n.id != *id);
        before != bucket.len()
    }

    /// Unhashes every device, used when the mount goes away.
    pub fn purge(&self) -> usize {
        let mut buckets = self.buckets.write();
        buckets.iter_mut().map(|b| b.drain(..).count()).sum()
    }

    pub fn len(&self) -> usize {
        self.buckets.read().iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
