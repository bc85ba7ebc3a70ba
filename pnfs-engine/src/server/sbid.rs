//! Superblock id table: gives every exported filesystem a stable 64-bit id
//! that is embedded in the device ids handed out to clients. The low
//! `SBID_HASH_BITS` bits of an id are the hash bucket of its superblock, so
//! an id is resolved back without a second index.
use parking_lot::Mutex;

use crate::{
    constants::{SBID_HASH_BITS, SBID_HASH_MASK, SBID_HASH_SIZE},
    deviceid::DeviceId,
};

/// Key of an exported filesystem.
pub type SuperBlock = u64;

#[derive(Debug, Clone, Copy)]
struct SbidEntry {
    sb: SuperBlock,
    id: u64,
}

#[derive(Debug)]
struct SbidInner {
    buckets: Vec<Vec<SbidEntry>>,
    next: u64,
}

#[derive(Debug)]
pub struct SbidTable {
    inner: Mutex<SbidInner>,
}

impl Default for SbidTable {
    fn default() -> Self {
        Self::new()
    }
}

fn sb_hash(sb: SuperBlock) -> usize {
    let h = sb ^ (sb >> SBID_HASH_BITS) ^ (sb >> (2 * SBID_HASH_BITS));
    (h & SBID_HASH_MASK) as usize
}

impl SbidTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SbidInner {
                buckets: vec![Vec::new(); SBID_HASH_SIZE],
                next: 1,
            }),
        }
    }

    pub fn find(&self, sb: SuperBlock) -> Option<u64> {
        let inner = self.inner.lock();
        inner.buckets[sb_hash(sb)]
            .iter()
            .find(|e| e.sb == sb)
            .map(|e| e.id)
    }

    /// Returns the id of `sb`, allocating one on first use.
    pub fn find_alloc(&self, sb: SuperBlock) -> u64 {
        let bucket = sb_hash(sb);
        let mut inner = self.inner.lock();
        if let Some(e) = inner.buckets[bucket].iter().find(|e| e.sb == sb) {
            return e.id;
        }

        let id = (inner.next << SBID_HASH_BITS) | bucket as u64;
        inner.next += 1;
        inner.buckets[bucket].push(SbidEntry {
            sb,
            id,
        });
        debug!("superblock {:#x} gets sbid {:#x}", sb, id);
        id
    }

    /// Reverse lookup of an id handed out by `find_alloc`.
    pub fn lookup(&self, id: u64) -> Option<SuperBlock> {
        let bucket = (id & SBID_HASH_MASK) as usize;
        let inner = self.inner.lock();
        inner.buckets[bucket]
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.sb)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every id. Only used when the subsystem shuts down.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.buckets.iter_mut().for_each(Vec::clear);
    }
}

/// Device id of device `index` of the filesystem with id `sbid`.
pub fn make_device_id(sbid: u64, index: u64) -> DeviceId {
    let mut raw = [0u8; 16];
    raw[.. 8].copy_from_slice(&sbid.to_be_bytes());
    raw[8 ..].copy_from_slice(&index.to_be_bytes());
    DeviceId(raw)
}

/// Splits a device id into (sbid, device index).
pub fn split_device_id(id: &DeviceId) -> (u64, u64) {
    let mut sbid = [0u8; 8];
    let mut index = [0u8; 8];
    sbid.copy_from_slice(&id.0[.. 8]);
    index.copy_from_slice(&id.0[8 ..]);
    (u64::from_be_bytes(sbid), u64::from_be_bytes(index))
}
