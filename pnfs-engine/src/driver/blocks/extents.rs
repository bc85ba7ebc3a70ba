//! Extent store of a block layout.
//!
//! Extents live in one of two class lists: READWRITE and INVALID extents in
//! the read-write list, READ and NONE (hole) extents in the read-only list.
//! Within a list extents never overlap and adjacent extents with a consistent
//! mapping are merged into a single maximal one. A READ extent may overlap an
//! INVALID one in the other list: it provides the copy-on-write source for
//! the not yet initialized sectors.
//!
//! All mutation and every lookup happen under the store's single lock, which
//! is never held across I/O.
use std::{
    collections::BTreeMap,
    fmt::{Debug, Formatter},
    ops::Bound,
    sync::Arc,
};

use bit_vec::BitVec;
use parking_lot::Mutex;

use super::{ExtentError, ExtentState};
use crate::{core::Nfs4Status, deviceid::DeviceId};

/// Sectors per chunk of a written-sector map.
const WRITTEN_CHUNK: u64 = 4096;

/// Written sectors of an INVALID extent, keyed by file sector. A chunk
/// bitmap is only allocated once a sector in it is written, so the size
/// follows the amount written rather than the extent length.
#[derive(Default)]
struct WrittenMap {
    chunks: BTreeMap<u64, BitVec>,
    count: u64,
}

impl WrittenMap {
    fn get(&self, sector: u64) -> bool {
        self.chunks
            .get(&(sector / WRITTEN_CHUNK))
            .and_then(|bits| bits.get((sector % WRITTEN_CHUNK) as usize))
            .unwrap_or(false)
    }

    /// Marks `[lo, hi)` written.
    fn set_range(&mut self, lo: u64, hi: u64) {
        let mut sector = lo;
        while sector < hi {
            let chunk = sector / WRITTEN_CHUNK;
            let base = chunk * WRITTEN_CHUNK;
            let end = base.saturating_add(WRITTEN_CHUNK).min(hi);
            let bits = self.chunks.entry(chunk).or_insert_with(|| {
                BitVec::from_elem(WRITTEN_CHUNK as usize, false)
            });
            for i in (sector - base) .. (end - base) {
                if !bits.get(i as usize).unwrap_or(true) {
                    bits.set(i as usize, true);
                    self.count += 1;
                }
            }
            sector = end;
        }
    }

    fn absorb(&mut self, other: &WrittenMap) {
        for (chunk, bits) in &other.chunks {
            match self.chunks.get_mut(chunk) {
                Some(mine) => {
                    mine.or(bits);
                }
                None => {
                    self.chunks.insert(*chunk, bits.clone());
                }
            }
        }
        self.count = self
            .chunks
            .values()
            .map(|bits| bits.iter().filter(|w| *w).count() as u64)
            .sum();
    }
}

/// One contiguous region of the file's block address space, in sectors.
pub struct Extent {
    file_offset: u64,
    length: u64,
    volume_offset: u64,
    state: ExtentState,
    device: DeviceId,
    /// Sectors of an INVALID extent that have been written since the layout
    /// was granted.
    written: Mutex<WrittenMap>,
}

impl Debug for Extent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} [{}, {}) -> {} on {}",
            self.state,
            self.file_offset,
            self.end(),
            self.volume_offset,
            self.device
        )
    }
}

impl Extent {
    pub fn new(
        file_offset: u64,
        length: u64,
        volume_offset: u64,
        state: ExtentState,
        device: DeviceId,
    ) -> Self {
        Self {
            file_offset,
            length,
            volume_offset,
            state,
            device,
            written: Mutex::new(WrittenMap::default()),
        }
    }

    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn end(&self) -> u64 {
        self.file_offset + self.length
    }

    pub fn volume_offset(&self) -> u64 {
        self.volume_offset
    }

    pub fn state(&self) -> ExtentState {
        self.state
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn contains(&self, sector: u64) -> bool {
        self.file_offset <= sector && sector < self.end()
    }

    /// Volume sector backing the given file sector.
    pub fn map(&self, sector: u64) -> Option<u64> {
        if !self.contains(sector) || self.state == ExtentState::None {
            return None;
        }
        Some(self.volume_offset + (sector - self.file_offset))
    }

    /// Whether the given sector of an INVALID extent has been written.
    pub fn is_written(&self, sector: u64) -> bool {
        if !self.contains(sector) {
            return false;
        }
        match self.state {
            ExtentState::Invalid => self.written.lock().get(sector),
            ExtentState::ReadWrite => true,
            _ => false,
        }
    }

    /// Same state, same device and, unless it is a hole, the same
    /// file-to-volume displacement: the two can describe one extent.
    fn consistent(&self, other: &Extent) -> bool {
        self.state == other.state
            && self.device == other.device
            && (self.state == ExtentState::None
                || self.volume_offset.wrapping_sub(self.file_offset)
                    == other.volume_offset.wrapping_sub(other.file_offset))
    }

    fn overlaps(&self, other: &Extent) -> bool {
        self.file_offset < other.end() && other.file_offset < self.end()
    }

    fn touches(&self, other: &Extent) -> bool {
        self.file_offset <= other.end() && other.file_offset <= self.end()
    }
}

/// Result of a sector lookup.
#[derive(Debug, Clone)]
pub struct ExtentLookup {
    pub extent: Arc<Extent>,
    /// READ extent supplying the old contents of an INVALID extent.
    pub cow_read: Option<Arc<Extent>>,
}

/// A range of initialized INVALID sectors to report with LAYOUTCOMMIT.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CommitEntry {
    file_offset: u64,
    length: u64,
    volume_offset: u64,
    device: DeviceId,
}

impl CommitEntry {
    fn end(&self) -> u64 {
        self.file_offset + self.length
    }

    fn same_mapping(&self, other: &CommitEntry) -> bool {
        self.device == other.device
            && self.volume_offset.wrapping_sub(self.file_offset)
                == other.volume_offset.wrapping_sub(other.file_offset)
    }

    /// The part of the entry in `[lo, hi)`, None if empty.
    fn slice(&self, lo: u64, hi: u64) -> Option<CommitEntry> {
        let lo = lo.max(self.file_offset);
        let hi = hi.min(self.end());
        if lo >= hi {
            return None;
        }
        Some(CommitEntry {
            file_offset: lo,
            length: hi - lo,
            volume_offset: self.volume_offset + (lo - self.file_offset),
            device: self.device,
        })
    }
}

type ExtentMap = BTreeMap<u64, Arc<Extent>>;

/// Pending commit ranges keyed by first sector. Entries never overlap.
type CommitMap = BTreeMap<u64, CommitEntry>;

#[derive(Default)]
struct ExtentLists {
    rw: ExtentMap,
    ro: ExtentMap,
    commit: CommitMap,
    /// Entries sent with a LAYOUTCOMMIT that has not completed yet.
    committing: Vec<CommitEntry>,
}

impl ExtentLists {
    fn class(&mut self, state: ExtentState) -> &mut ExtentMap {
        if state.is_rw_class() {
            &mut self.rw
        } else {
            &mut self.ro
        }
    }
}

#[derive(Default)]
pub struct ExtentStore {
    lists: Mutex<ExtentLists>,
}

impl Debug for ExtentStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let lists = self.lists.lock();
        write!(
            f,
            "extent store: {} rw, {} ro, {} to commit",
            lists.rw.len(),
            lists.ro.len(),
            lists.commit.len()
        )
    }
}

fn covering(map: &ExtentMap, sector: u64) -> Option<Arc<Extent>> {
    map.range(..= sector)
        .next_back()
        .filter(|(_, e)| e.contains(sector))
        .map(|(_, e)| e.clone())
}

/// Merges `new` into `map`, or fails without touching it.
fn merge_into(map: &mut ExtentMap, new: Extent) -> Result<(), ExtentError> {
    let mut merge = Vec::new();

    // an extent starting before `new` may still reach into it
    let lower = map
        .range(.. new.file_offset)
        .next_back()
        .map(|(k, _)| *k)
        .unwrap_or(new.file_offset);
    let upper = Bound::Included(new.end());

    for (_, be) in map.range((Bound::Included(lower), upper)) {
        if !be.touches(&new) {
            continue;
        }
        if be.consistent(&new) {
            if be.file_offset <= new.file_offset && new.end() <= be.end() {
                trace!("{:?} already covered by {:?}", new, be);
                return Ok(());
            }
            merge.push(be.clone());
        } else if be.overlaps(&new) {
            error!("extent {:?} conflicts with {:?}", new, be);
            return Err(ExtentError::Conflict {
                file_offset: new.file_offset,
            });
        }
    }

    if merge.is_empty() {
        map.insert(new.file_offset, Arc::new(new));
        return Ok(());
    }

    let start = merge
        .iter()
        .map(|e| e.file_offset)
        .chain(std::iter::once(new.file_offset))
        .min()
        .unwrap_or(new.file_offset);
    let end = merge
        .iter()
        .map(|e| e.end())
        .chain(std::iter::once(new.end()))
        .max()
        .unwrap_or(new.end());
    let volume_offset = if new.state == ExtentState::None {
        0
    } else {
        start.wrapping_add(new.volume_offset.wrapping_sub(new.file_offset))
    };

    let merged = Extent::new(
        start,
        end - start,
        volume_offset,
        new.state,
        new.device,
    );

    if new.state == ExtentState::Invalid {
        let mut written = merged.written.lock();
        for be in &merge {
            written.absorb(&be.written.lock());
        }
    }

    for be in &merge {
        map.remove(&be.file_offset);
    }
    trace!("merged {} extents into {:?}", merge.len() + 1, merged);
    map.insert(start, Arc::new(merged));
    Ok(())
}

impl ExtentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the extent covering `sector`. The read-write list is searched
    /// first; if the hit is INVALID and `want_cow` is set, the READ extent
    /// holding the old contents is returned as well.
    pub fn find(&self, sector: u64, want_cow: bool) -> Option<ExtentLookup> {
        let lists = self.lists.lock();

        if let Some(extent) = covering(&lists.rw, sector) {
            let cow_read = if want_cow && extent.state == ExtentState::Invalid
            {
                covering(&lists.ro, sector)
            } else {
                None
            };
            return Some(ExtentLookup {
                extent,
                cow_read,
            });
        }

        covering(&lists.ro, sector).map(|extent| ExtentLookup {
            extent,
            cow_read: None,
        })
    }

    /// Inserts one extent into its class list, merging with consistent
    /// neighbours.
    pub fn add_and_merge(&self, extent: Extent) -> Result<(), ExtentError> {
        let mut lists = self.lists.lock();
        let state = extent.state;
        merge_into(lists.class(state), extent)
    }

    /// Inserts a whole decoded batch, all or nothing.
    pub fn add_batch(&self, extents: Vec<Extent>) -> Result<(), ExtentError> {
        let mut lists = self.lists.lock();
        let mut rw = lists.rw.clone();
        let mut ro = lists.ro.clone();

        for extent in extents {
            if extent.state.is_rw_class() {
                merge_into(&mut rw, extent)?;
            } else {
                merge_into(&mut ro, extent)?;
            }
        }

        lists.rw = rw;
        lists.ro = ro;
        Ok(())
    }

    /// Records a completed write. Written INVALID sectors are queued for
    /// LAYOUTCOMMIT and an INVALID extent whose sectors are all written
    /// becomes READWRITE. Returns the number of promoted extents.
    pub fn mark_written(&self, sector: u64, count: u64) -> usize {
        let end = sector.saturating_add(count);
        let mut lists = self.lists.lock();

        let hits: Vec<Arc<Extent>> = lists
            .rw
            .values()
            .filter(|e| {
                e.state == ExtentState::Invalid
                    && e.file_offset < end
                    && sector < e.end()
            })
            .cloned()
            .collect();

        let mut promoted = 0;
        for be in hits {
            let lo = sector.max(be.file_offset);
            let hi = end.min(be.end());
            let complete = {
                let mut written = be.written.lock();
                written.set_range(lo, hi);
                written.count >= be.length
            };

            add_commit(
                &mut lists.commit,
                CommitEntry {
                    file_offset: lo,
                    length: hi - lo,
                    volume_offset: be.volume_offset + (lo - be.file_offset),
                    device: be.device,
                },
            );

            if complete {
                lists.rw.remove(&be.file_offset);
                let rw = Extent::new(
                    be.file_offset,
                    be.length,
                    be.volume_offset,
                    ExtentState::ReadWrite,
                    be.device,
                );
                debug!("{:?} fully written, now read-write", be);
                if merge_into(&mut lists.rw, rw).is_err() {
                    // cannot happen for a slot we just vacated
                    panic!("extent {:?} lost while promoting", be);
                }
                promoted += 1;
            }
        }

        promoted
    }

    /// Encodes all pending commit entries as a layoutupdate body and marks
    /// them in flight. Returns None if nothing needs committing.
    pub fn encode_commit_list(&self) -> Option<Vec<u8>> {
        let mut lists = self.lists.lock();
        if lists.commit.is_empty() {
            return None;
        }
        let pending = std::mem::take(&mut lists.commit);

        let mut buf = Vec::with_capacity(4 + pending.len() * 44);
        buf.extend_from_slice(&(pending.len() as u32).to_be_bytes());
        for c in pending.into_values() {
            buf.extend_from_slice(&c.device.0);
            buf.extend_from_slice(&c.file_offset.to_be_bytes());
            buf.extend_from_slice(&c.length.to_be_bytes());
            buf.extend_from_slice(&c.volume_offset.to_be_bytes());
            buf.extend_from_slice(
                &(ExtentState::ReadWrite as u32).to_be_bytes(),
            );
            lists.committing.push(c);
        }
        Some(buf)
    }

    /// Completes a LAYOUTCOMMIT: committed entries are dropped, a failed
    /// commit puts them back to pending.
    pub fn clean_commit_list(&self, status: Nfs4Status) {
        let mut lists = self.lists.lock();
        let committing = std::mem::take(&mut lists.committing);
        if status == Nfs4Status::Ok {
            return;
        }
        // writes queued since the commit was sent are newer
        let newer = std::mem::take(&mut lists.commit);
        for c in committing.into_iter().chain(newer.into_values()) {
            add_commit(&mut lists.commit, c);
        }
    }

    pub fn commit_pending(&self) -> usize {
        self.lists.lock().commit.len()
    }

    /// Snapshot of one class list, in file order.
    pub fn extents(&self, rw_class: bool) -> Vec<Arc<Extent>> {
        let lists = self.lists.lock();
        let map = if rw_class {
            &lists.rw
        } else {
            &lists.ro
        };
        map.values().cloned().collect()
    }
}

/// Queues a commit range, coalescing with the touching pending ranges of
/// the same device and mapping. Where it overlaps a range with another
/// mapping, the new range wins the overlap.
fn add_commit(map: &mut CommitMap, new: CommitEntry) {
    let lower = map
        .range(.. new.file_offset)
        .next_back()
        .map(|(k, _)| *k)
        .unwrap_or(new.file_offset);
    let touching: Vec<u64> = map
        .range(lower ..= new.end())
        .filter(|(_, c)| {
            c.file_offset <= new.end() && new.file_offset <= c.end()
        })
        .map(|(k, _)| *k)
        .collect();

    let mut merged = new;
    for key in touching {
        let Some(old) = map.remove(&key) else {
            continue;
        };
        if old.same_mapping(&merged) {
            let start = old.file_offset.min(merged.file_offset);
            let end = old.end().max(merged.end());
            merged.volume_offset = merged
                .volume_offset
                .wrapping_sub(merged.file_offset - start);
            merged.file_offset = start;
            merged.length = end - start;
            continue;
        }
        for rest in [
            old.slice(old.file_offset, merged.file_offset),
            old.slice(merged.end(), old.end()),
        ]
        .into_iter()
        .flatten()
        {
            map.insert(rest.file_offset, rest);
        }
    }
    map.insert(merged.file_offset, merged);
}

#[cfg(test)]
mod test {
    use super::*;

    const DEV: DeviceId = DeviceId([7; 16]);

    fn rw(off: u64, len: u64) -> Extent {
        Extent::new(off, len, off + 1000, ExtentState::ReadWrite, DEV)
    }

    #[test]
    fn adjacent_read_write_extents_merge() {
        let store = ExtentStore::new();
        store.add_and_merge(rw(0, 100)).unwrap();
        store.add_and_merge(rw(100, 50)).unwrap();

        let rw = store.extents(true);
        assert_eq!(rw.len(), 1);
        assert_eq!(rw[0].file_offset(), 0);
        assert_eq!(rw[0].length(), 150);
        assert_eq!(rw[0].volume_offset(), 1000);
    }

    #[test]
    fn merge_bridges_two_neighbours() {
        let store = ExtentStore::new();
        store.add_and_merge(rw(0, 10)).unwrap();
        store.add_and_merge(rw(20, 10)).unwrap();
        assert_eq!(store.extents(true).len(), 2);

        store.add_and_merge(rw(5, 20)).unwrap();
        let rw = store.extents(true);
        assert_eq!(rw.len(), 1);
        assert_eq!((rw[0].file_offset(), rw[0].end()), (0, 30));
    }

    #[test]
    fn conflicting_overlap_is_rejected() {
        let store = ExtentStore::new();
        store.add_and_merge(rw(0, 100)).unwrap();

        let err = store
            .add_and_merge(Extent::new(
                50,
                100,
                50,
                ExtentState::Invalid,
                DEV,
            ))
            .unwrap_err();
        assert_eq!(
            err,
            ExtentError::Conflict {
                file_offset: 50
            }
        );
        assert_eq!(store.extents(true).len(), 1);
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let store = ExtentStore::new();
        let batch = vec![
            rw(0, 10),
            Extent::new(5, 10, 5, ExtentState::Invalid, DEV),
        ];
        assert!(store.add_batch(batch).is_err());
        assert!(store.extents(true).is_empty());
    }

    #[test]
    fn cow_lookup_and_promotion() {
        let store = ExtentStore::new();
        store
            .add_batch(vec![
                Extent::new(0, 4, 100, ExtentState::Invalid, DEV),
                Extent::new(0, 4, 500, ExtentState::Read, DEV),
            ])
            .unwrap();

        let hit = store.find(2, true).unwrap();
        assert_eq!(hit.extent.state(), ExtentState::Invalid);
        assert_eq!(hit.cow_read.unwrap().state(), ExtentState::Read);
        assert!(store.find(2, false).unwrap().cow_read.is_none());

        assert_eq!(store.mark_written(0, 2), 0);
        assert!(store.find(1, false).unwrap().extent.is_written(1));
        assert_eq!(store.mark_written(2, 2), 1);
        assert_eq!(
            store.find(3, true).unwrap().extent.state(),
            ExtentState::ReadWrite
        );

        assert_eq!(store.commit_pending(), 1);
        let body = store.encode_commit_list().unwrap();
        assert_eq!(&body[.. 4], &1u32.to_be_bytes());
        store.clean_commit_list(Nfs4Status::Ok);
        assert_eq!(store.commit_pending(), 0);
        assert!(store.encode_commit_list().is_none());
    }

    #[test]
    fn huge_invalid_extent_tracks_writes_sparsely() {
        let store = ExtentStore::new();
        let sectors = 1u64 << 43;
        store
            .add_and_merge(Extent::new(0, sectors, 0, ExtentState::Invalid, DEV))
            .unwrap();

        assert_eq!(store.mark_written(sectors - 8, 8), 0);
        assert_eq!(store.mark_written(0, WRITTEN_CHUNK + 1), 0);
        let hit = store.find(sectors - 1, false).unwrap();
        assert!(hit.extent.is_written(sectors - 1));
        assert!(hit.extent.is_written(WRITTEN_CHUNK));
        assert!(!hit.extent.is_written(WRITTEN_CHUNK + 1));
        assert_eq!(hit.extent.written.lock().chunks.len(), 3);
        assert_eq!(hit.extent.state(), ExtentState::Invalid);
    }

    #[test]
    fn written_sectors_survive_a_merge() {
        let store = ExtentStore::new();
        store
            .add_and_merge(Extent::new(0, 10, 100, ExtentState::Invalid, DEV))
            .unwrap();
        store.mark_written(0, 10);
        assert_eq!(
            store.find(0, false).unwrap().extent.state(),
            ExtentState::ReadWrite
        );

        store
            .add_and_merge(Extent::new(20, 10, 120, ExtentState::Invalid, DEV))
            .unwrap();
        store.mark_written(20, 4);
        store
            .add_and_merge(Extent::new(24, 16, 124, ExtentState::Invalid, DEV))
            .unwrap();
        let merged = store.find(21, false).unwrap().extent;
        assert_eq!((merged.file_offset(), merged.end()), (20, 40));
        assert!(merged.is_written(23));
        assert!(!merged.is_written(24));

        // the rest of the merged extent promotes it
        assert_eq!(store.mark_written(24, 16), 1);
    }

    #[test]
    fn commit_ranges_coalesce_in_any_order() {
        let store = ExtentStore::new();
        store
            .add_and_merge(Extent::new(0, 100, 0, ExtentState::Invalid, DEV))
            .unwrap();

        for start in [40, 0, 20, 10, 30] {
            store.mark_written(start, 10);
        }
        assert_eq!(store.commit_pending(), 1);
        store.mark_written(60, 10);
        assert_eq!(store.commit_pending(), 2);
        store.mark_written(50, 10);
        assert_eq!(store.commit_pending(), 1);

        let lists = store.lists.lock();
        let entry = lists.commit.values().next().unwrap();
        assert_eq!((entry.file_offset, entry.length), (0, 70));
    }

    #[test]
    fn failed_commit_is_requeued() {
        let store = ExtentStore::new();
        store
            .add_and_merge(Extent::new(0, 100, 0, ExtentState::Invalid, DEV))
            .unwrap();
        store.mark_written(0, 10);
        assert!(store.encode_commit_list().is_some());
        assert_eq!(store.commit_pending(), 0);

        // written while the commit is in flight
        store.mark_written(10, 10);
        assert_eq!(store.commit_pending(), 1);

        store.clean_commit_list(Nfs4Status::Delay);
        assert_eq!(store.commit_pending(), 1);
        let body = store.encode_commit_list().unwrap();
        assert_eq!(&body[.. 4], &1u32.to_be_bytes());
        store.clean_commit_list(Nfs4Status::Ok);
        assert_eq!(store.commit_pending(), 0);
    }

    #[test]
    fn newer_commit_wins_a_conflicting_overlap() {
        let mut map = CommitMap::new();
        let other = DeviceId([9; 16]);
        add_commit(
            &mut map,
            CommitEntry {
                file_offset: 0,
                length: 30,
                volume_offset: 500,
                device: other,
            },
        );
        add_commit(
            &mut map,
            CommitEntry {
                file_offset: 10,
                length: 10,
                volume_offset: 10,
                device: DEV,
            },
        );

        let entries: Vec<_> = map
            .values()
            .map(|c| (c.file_offset, c.length, c.volume_offset, c.device))
            .collect();
        assert_eq!(
            entries,
            vec![(0, 10, 500, other), (10, 10, 10, DEV), (20, 10, 520, other)]
        );
    }
}
