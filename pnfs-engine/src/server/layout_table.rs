//! Server side layout bookkeeping: granted records, per (client, file)
//! layout states and pending recalls. Everything lives in one table behind
//! the server's lock and refers to each other by id.
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use futures::channel::oneshot;

use super::{
    recall::{Recall, RecallId, RecallParent, RecallTarget},
    CallbackChannel,
    ClientId,
    FileKey,
    ServerError,
};
use crate::{
    constants::NFS4_STATEID_OTHER_SIZE,
    core::{seqid_is_newer, Fsid, IoMode, LayoutRange, LayoutType, Stateid},
};

pub(crate) type RecordId = u64;

/// One granted layout.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutRecord {
    pub id: RecordId,
    pub client: ClientId,
    pub file: FileKey,
    pub range: LayoutRange,
    pub layout_type: LayoutType,
    pub roc: bool,
}

/// Layout state of one client on one file, outlives its records until the
/// file is closed or the client expires.
#[derive(Debug)]
pub(crate) struct LayoutState {
    pub(crate) stateid: Stateid,
}

pub(crate) struct ClientEntry {
    pub(crate) callback: Arc<dyn CallbackChannel>,
    pub(crate) cb_up: bool,
    records: Vec<RecordId>,
}

/// A range handed back to the export, with the file it belongs to.
pub(crate) type Returned = Vec<(FileKey, LayoutRange)>;

#[derive(Default)]
pub(crate) struct LayoutTable {
    clients: HashMap<ClientId, ClientEntry>,
    files: HashMap<FileKey, Vec<RecordId>>,
    records: HashMap<RecordId, LayoutRecord>,
    states: HashMap<(ClientId, FileKey), LayoutState>,
    by_other: HashMap<[u8; NFS4_STATEID_OTHER_SIZE], (ClientId, FileKey)>,
    pub(crate) recalls: HashMap<RecallId, Recall>,
    pub(crate) parents: HashMap<RecallId, RecallParent>,
    next_id: u64,
}

impl LayoutTable {
    pub(crate) fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Records and recalls allocated, the quantity bounded by
    /// `max_layout_records`.
    pub(crate) fn arena_len(&self) -> usize {
        self.records.len() + self.recalls.len()
    }

    pub(crate) fn add_client(
        &mut self,
        client: ClientId,
        callback: Arc<dyn CallbackChannel>,
    ) {
        let entry = self.clients.entry(client).or_insert_with(|| ClientEntry {
            callback: callback.clone(),
            cb_up: true,
            records: Vec::new(),
        });
        entry.callback = callback;
        entry.cb_up = true;
    }

    pub(crate) fn client(
        &self,
        client: ClientId,
    ) -> Result<&ClientEntry, ServerError> {
        self.clients.get(&client).ok_or(ServerError::UnknownClient {
            client,
        })
    }

    pub(crate) fn client_mut(
        &mut self,
        client: ClientId,
    ) -> Result<&mut ClientEntry, ServerError> {
        self.clients
            .get_mut(&client)
            .ok_or(ServerError::UnknownClient {
                client,
            })
    }

    pub(crate) fn remove_client(&mut self, client: ClientId) -> bool {
        self.clients.remove(&client).is_some()
    }

    pub(crate) fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Records of `client` on `file`, oldest first.
    pub(crate) fn file_records(
        &self,
        client: ClientId,
        file: &FileKey,
    ) -> Vec<LayoutRecord> {
        self.files
            .get(file)
            .into_iter()
            .flatten()
            .filter_map(|id| self.records.get(id))
            .filter(|r| r.client == client)
            .cloned()
            .collect()
    }

    fn client_record_ids(&self, client: ClientId) -> Vec<RecordId> {
        self.clients
            .get(&client)
            .map(|c| c.records.clone())
            .unwrap_or_default()
    }

    fn link(&mut self, record: LayoutRecord) {
        if let Some(c) = self.clients.get_mut(&record.client) {
            c.records.push(record.id);
        }
        self.files.entry(record.file).or_default().push(record.id);
        self.records.insert(record.id, record);
    }

    fn unlink(&mut self, id: RecordId) -> Option<LayoutRecord> {
        let record = self.records.remove(&id)?;
        if let Some(c) = self.clients.get_mut(&record.client) {
            c.records.retain(|r| *r != id);
        }
        if let Some(list) = self.files.get_mut(&record.file) {
            list.retain(|r| *r != id);
            if list.is_empty() {
                self.files.remove(&record.file);
            }
        }
        Some(record)
    }

    pub(crate) fn state(
        &self,
        client: ClientId,
        file: &FileKey,
    ) -> Option<&LayoutState> {
        self.states.get(&(client, *file))
    }

    /// Checks the stateid presented with a LAYOUTGET. A layout stateid of
    /// this (client, file) must carry the current seqid; any stateid not
    /// known as a layout stateid seeds the layout state.
    pub(crate) fn check_get_stateid(
        &self,
        client: ClientId,
        file: &FileKey,
        stateid: &Stateid,
    ) -> Result<(), ServerError> {
        if let Some(state) = self.state(client, file) {
            if state.stateid.same_state(stateid) {
                return check_seqid(&state.stateid, stateid);
            }
        }
        if self.by_other.contains_key(&stateid.other) {
            return Err(ServerError::BadStateid {
                stateid: *stateid,
            });
        }
        Ok(())
    }

    /// Checks a layout stateid presented with LAYOUTRETURN or LAYOUTCOMMIT.
    /// Returns and commits may race with grants, so an older seqid is fine.
    pub(crate) fn check_layout_stateid(
        &self,
        client: ClientId,
        file: &FileKey,
        stateid: &Stateid,
    ) -> Result<(), ServerError> {
        match self.state(client, file) {
            Some(state)
                if state.stateid.same_state(stateid)
                    && !seqid_is_newer(stateid.seqid, state.stateid.seqid) =>
            {
                Ok(())
            }
            _ => Err(ServerError::BadStateid {
                stateid: *stateid,
            }),
        }
    }

    /// Advances the layout stateid of (client, file).
    pub(crate) fn bump_state(
        &mut self,
        client: ClientId,
        file: &FileKey,
    ) -> Option<Stateid> {
        let state = self.states.get_mut(&(client, *file))?;
        state.stateid.bump();
        Some(state.stateid)
    }

    pub(crate) fn remove_state(&mut self, client: ClientId, file: &FileKey) {
        if let Some(state) = self.states.remove(&(client, *file)) {
            self.by_other.remove(&state.stateid.other);
        }
    }

    /// Links a granted range, folding it into a compatible record if one is
    /// adjacent or overlapping. Returns the layout stateid to send back.
    pub(crate) fn grant(
        &mut self,
        client: ClientId,
        file: FileKey,
        range: LayoutRange,
        layout_type: LayoutType,
        roc: bool,
    ) -> Stateid {
        self.insert_or_merge(client, file, range, layout_type, roc);

        match self.states.get_mut(&(client, file)) {
            Some(state) => {
                state.stateid.bump();
                state.stateid
            }
            None => {
                let stateid = Stateid::generate();
                self.by_other.insert(stateid.other, (client, file));
                self.states.insert(
                    (client, file),
                    LayoutState {
                        stateid,
                    },
                );
                stateid
            }
        }
    }

    fn insert_or_merge(
        &mut self,
        client: ClientId,
        file: FileKey,
        range: LayoutRange,
        layout_type: LayoutType,
        roc: bool,
    ) -> RecordId {
        let compatible = |r: &LayoutRecord| {
            r.client == client
                && r.layout_type == layout_type
                && r.range.iomode == range.iomode
                && r.roc == roc
        };

        let existing: Vec<RecordId> = self
            .files
            .get(&file)
            .into_iter()
            .flatten()
            .filter(|id| {
                self.records
                    .get(id)
                    .map_or(false, |r| compatible(r) && r.range.mergeable(&range))
            })
            .copied()
            .collect();

        let Some((&keep, absorbed)) = existing.split_first() else {
            let id = self.next_id();
            let record = LayoutRecord {
                id,
                client,
                file,
                range,
                layout_type,
                roc,
            };
            debug!("inserting layout record {:?}", record);
            self.link(record);
            return id;
        };

        // the new range may bridge several records, they all collapse into
        // the first one
        let mut merged = range;
        for id in absorbed {
            if let Some(r) = self.unlink(*id) {
                merged.extend(&r.range);
            }
        }
        if let Some(r) = self.records.get_mut(&keep) {
            r.range.extend(&merged);
            debug!("merged {:?} into layout record {:?}", range, r);
        }
        keep
    }

    /// FILE return: trims the records of (client, file) selected by type and
    /// iomode. Returns the ranges released and whether any record of the
    /// (client, file) pair is left.
    pub(crate) fn trim_file(
        &mut self,
        client: ClientId,
        file: &FileKey,
        layout_type: LayoutType,
        range: &LayoutRange,
    ) -> (Returned, bool) {
        let mut returned = Vec::new();
        let start = range.offset;
        let end = range.end();

        for record in self.file_records(client, file) {
            if record.layout_type != layout_type
                || !record.range.iomode.matches(range.iomode)
                || !record.range.overlaps(range)
            {
                continue;
            }

            let rs = record.range.offset;
            let re = record.range.end();
            if start <= rs && end >= re {
                debug!("return of {:?} removes {:?}", range, record);
                self.unlink(record.id);
                returned.push((record.file, record.range));
            } else if start > rs && end < re {
                warn!(
                    "return of {:?} would split {:?}, split not supported, \
                     keeping the record",
                    range, record
                );
            } else if let Some(r) = self.records.get_mut(&record.id) {
                let iomode = r.range.iomode;
                if start <= rs {
                    r.range = LayoutRange::from_bounds(iomode, end, re);
                    returned.push((r.file, LayoutRange::from_bounds(iomode, rs, end)));
                } else {
                    r.range = LayoutRange::from_bounds(iomode, rs, start);
                    returned.push((r.file, LayoutRange::from_bounds(iomode, start, re)));
                }
                debug!("return of {:?} trims record to {:?}", range, r);
            }
        }

        let present = !self.file_records(client, file).is_empty();
        (returned, present)
    }

    /// FSID and ALL returns: every record of the client of `layout_type`,
    /// restricted to `fsid` if given, is dropped outright.
    pub(crate) fn dequeue_bulk(
        &mut self,
        client: ClientId,
        layout_type: LayoutType,
        fsid: Option<Fsid>,
    ) -> Returned {
        let ids: Vec<RecordId> = self
            .client_record_ids(client)
            .into_iter()
            .filter(|id| {
                self.records.get(id).map_or(false, |r| {
                    r.layout_type == layout_type
                        && fsid.map_or(true, |fsid| r.file.sb == fsid)
                })
            })
            .collect();
        self.unlink_all(ids)
    }

    /// Drops the return-on-close records of (client, file).
    pub(crate) fn dequeue_roc(
        &mut self,
        client: ClientId,
        file: &FileKey,
    ) -> Returned {
        self.file_records(client, file)
            .into_iter()
            .filter(|r| r.roc)
            .filter_map(|r| self.unlink(r.id))
            .map(|r| (r.file, r.range))
            .collect()
    }

    /// Drops every record selected by a recall of `client`.
    pub(crate) fn dequeue_recalled(
        &mut self,
        client: ClientId,
        target: &RecallTarget,
    ) -> Returned {
        let ids: Vec<RecordId> = self
            .client_record_ids(client)
            .into_iter()
            .filter(|id| {
                self.records.get(id).map_or(false, |r| target.selects(r))
            })
            .collect();
        self.unlink_all(ids)
    }

    fn unlink_all(&mut self, ids: Vec<RecordId>) -> Returned {
        ids.into_iter()
            .filter_map(|id| self.unlink(id))
            .map(|r| (r.file, r.range))
            .collect()
    }

    /// Drops everything the client holds: records, states and recalls.
    pub(crate) fn purge_client(&mut self, client: ClientId) -> Returned {
        let ids = self.client_record_ids(client);
        let returned = self.unlink_all(ids);

        let keys: Vec<(ClientId, FileKey)> = self
            .states
            .keys()
            .filter(|(c, _)| *c == client)
            .copied()
            .collect();
        for (c, file) in keys {
            self.remove_state(c, &file);
        }
        returned
    }

    /// Clients holding at least one record the recall selects, optionally
    /// restricted to one client.
    pub(crate) fn clients_holding(
        &self,
        target: &RecallTarget,
        only: Option<ClientId>,
    ) -> Vec<ClientId> {
        let mut seen = HashSet::new();
        let mut clients = Vec::new();
        let mut ids: Vec<&RecordId> = self.records.keys().collect();
        ids.sort_unstable();
        for id in ids {
            let r = &self.records[id];
            if only.map_or(true, |c| c == r.client)
                && target.selects(r)
                && seen.insert(r.client)
            {
                clients.push(r.client);
            }
        }
        clients
    }

    /// Whether `client` still holds anything the recall selects.
    pub(crate) fn holds_recalled(
        &self,
        client: ClientId,
        target: &RecallTarget,
    ) -> bool {
        self.clients.get(&client).map_or(false, |c| {
            c.records
                .iter()
                .filter_map(|id| self.records.get(id))
                .any(|r| target.selects(r))
        })
    }

    /// Whether a pending recall of `client` covers `range` of `file`.
    pub(crate) fn recall_conflict(
        &self,
        client: ClientId,
        file: &FileKey,
        range: &LayoutRange,
    ) -> bool {
        self.recalls
            .values()
            .any(|r| r.client == client && r.target.covers(file, range))
    }

    /// Whether an RW record of (client, file) overlaps `range`.
    pub(crate) fn has_rw_overlap(
        &self,
        client: ClientId,
        file: &FileKey,
        layout_type: LayoutType,
        range: &LayoutRange,
    ) -> bool {
        self.file_records(client, file).iter().any(|r| {
            r.layout_type == layout_type
                && r.range.iomode == IoMode::ReadWrite
                && r.range.overlaps(range)
        })
    }

    /// Removes a recall and reports the completion cookie to release, if
    /// this was the last outstanding piece of it.
    pub(crate) fn complete_recall(
        &mut self,
        id: RecallId,
    ) -> Option<oneshot::Sender<()>> {
        let recall = self.recalls.remove(&id)?;
        debug!("{:?} completed", recall);
        match recall.parent {
            Some(parent) => self.put_parent(parent),
            None => recall.done,
        }
    }

    /// Drops one reference of a fan-out parent.
    pub(crate) fn put_parent(
        &mut self,
        parent: RecallId,
    ) -> Option<oneshot::Sender<()>> {
        let p = self.parents.get_mut(&parent)?;
        p.refcount -= 1;
        if p.refcount > 0 {
            return None;
        }
        self.parents.remove(&parent).and_then(|p| p.done)
    }

    /// Completes the recalls of `client` that have nothing left to recall.
    pub(crate) fn complete_satisfied(
        &mut self,
        client: ClientId,
    ) -> Vec<oneshot::Sender<()>> {
        let done: Vec<RecallId> = self
            .recalls
            .values()
            .filter(|r| r.client == client && !self.holds_recalled(client, &r.target))
            .map(|r| r.id)
            .collect();
        done.into_iter()
            .filter_map(|id| self.complete_recall(id))
            .collect()
    }

    /// Recalls of `client`, by id.
    pub(crate) fn client_recalls(&self, client: ClientId) -> Vec<RecallId> {
        self.recalls
            .values()
            .filter(|r| r.client == client)
            .map(|r| r.id)
            .collect()
    }
}

fn check_seqid(current: &Stateid, presented: &Stateid) -> Result<(), ServerError> {
    if presented.seqid == current.seqid {
        Ok(())
    } else if seqid_is_newer(current.seqid, presented.seqid) {
        Err(ServerError::OldStateid {
            stateid: *presented,
        })
    } else {
        Err(ServerError::BadStateid {
            stateid: *presented,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::constants::NFS4_MAX_UINT64;
    use assert_matches::assert_matches;

    const CLIENT: ClientId = 1;
    const FILE: FileKey = FileKey {
        sb: 10,
        ino: 20,
    };

    fn range(iomode: IoMode, offset: u64, length: u64) -> LayoutRange {
        LayoutRange::new(iomode, offset, length)
    }

    fn grant(table: &mut LayoutTable, r: LayoutRange) -> Stateid {
        table.grant(CLIENT, FILE, r, LayoutType::Blocks, false)
    }

    fn ranges(table: &LayoutTable) -> Vec<(u64, u64)> {
        let mut v: Vec<_> = table
            .file_records(CLIENT, &FILE)
            .iter()
            .map(|r| (r.range.offset, r.range.end()))
            .collect();
        v.sort_unstable();
        v
    }

    #[test]
    fn adjacent_grants_merge() {
        let mut table = LayoutTable::default();
        grant(&mut table, range(IoMode::ReadWrite, 0, 100));
        grant(&mut table, range(IoMode::ReadWrite, 200, 100));
        assert_eq!(table.record_count(), 2);

        // bridges both
        grant(&mut table, range(IoMode::ReadWrite, 100, 100));
        assert_eq!(table.record_count(), 1);
        assert_eq!(ranges(&table), vec![(0, 300)]);

        // different iomode is kept apart
        grant(&mut table, range(IoMode::Read, 300, 100));
        assert_eq!(table.record_count(), 2);
    }

    #[test]
    fn grant_advances_stateid() {
        let mut table = LayoutTable::default();
        let first = grant(&mut table, range(IoMode::Read, 0, 10));
        let second = grant(&mut table, range(IoMode::Read, 50, 10));
        assert!(first.same_state(&second));
        assert!(seqid_is_newer(second.seqid, first.seqid));
    }

    #[test]
    fn return_trims() {
        let mut table = LayoutTable::default();
        grant(&mut table, range(IoMode::ReadWrite, 0, 100));

        // inside: split is not done
        let (returned, present) = table.trim_file(
            CLIENT,
            &FILE,
            LayoutType::Blocks,
            &range(IoMode::Any, 40, 20),
        );
        assert!(returned.is_empty());
        assert!(present);
        assert_eq!(ranges(&table), vec![(0, 100)]);

        // front edge
        let (returned, _) = table.trim_file(
            CLIENT,
            &FILE,
            LayoutType::Blocks,
            &range(IoMode::ReadWrite, 0, 30),
        );
        assert_eq!(returned.len(), 1);
        assert_eq!(ranges(&table), vec![(30, 100)]);

        // back edge
        table.trim_file(
            CLIENT,
            &FILE,
            LayoutType::Blocks,
            &range(IoMode::ReadWrite, 80, NFS4_MAX_UINT64),
        );
        assert_eq!(ranges(&table), vec![(30, 80)]);

        // full cover
        let (returned, present) = table.trim_file(
            CLIENT,
            &FILE,
            LayoutType::Blocks,
            &range(IoMode::Any, 0, NFS4_MAX_UINT64),
        );
        assert_eq!(returned, vec![(FILE, range(IoMode::ReadWrite, 30, 50))]);
        assert!(!present);
    }

    #[test]
    fn return_any_removes_only_covered_record() {
        let mut table = LayoutTable::default();
        grant(&mut table, range(IoMode::Read, 0, 100));
        grant(&mut table, range(IoMode::ReadWrite, 500, 100));

        let (returned, present) = table.trim_file(
            CLIENT,
            &FILE,
            LayoutType::Blocks,
            &range(IoMode::Any, 500, 100),
        );
        assert_eq!(returned.len(), 1);
        assert!(present);
        let left = table.file_records(CLIENT, &FILE);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].range, range(IoMode::Read, 0, 100));
    }

    #[test]
    fn stateid_checks() {
        let mut table = LayoutTable::default();
        let open = Stateid::generate();
        assert!(table.check_get_stateid(CLIENT, &FILE, &open).is_ok());

        let sid = grant(&mut table, range(IoMode::Read, 0, 10));
        assert!(table.check_get_stateid(CLIENT, &FILE, &sid).is_ok());

        let mut old = sid;
        old.seqid -= 1;
        assert_matches!(
            table.check_get_stateid(CLIENT, &FILE, &old),
            Err(ServerError::OldStateid { .. })
        );
        let mut ahead = sid;
        ahead.bump();
        assert_matches!(
            table.check_get_stateid(CLIENT, &FILE, &ahead),
            Err(ServerError::BadStateid { .. })
        );

        // the layout stateid of another file is not a seed
        let other = FileKey {
            sb: 10,
            ino: 21,
        };
        assert_matches!(
            table.check_get_stateid(CLIENT, &other, &sid),
            Err(ServerError::BadStateid { .. })
        );

        assert!(table.check_layout_stateid(CLIENT, &FILE, &old).is_ok());
        assert_matches!(
            table.check_layout_stateid(CLIENT, &FILE, &ahead),
            Err(ServerError::BadStateid { .. })
        );
    }
}
