//! Recall orchestration. A recall is fanned out into one child per client
//! holding matching layouts; with more than one child a parent aggregates
//! them so the requester is signalled once, when the last child completes.
//! A child completes when the client returns what it holds, when the client
//! answers NOMATCHING_LAYOUT, or when it is forced (callback failure,
//! client expiry).
use std::{
    fmt::{Debug, Formatter},
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::channel::oneshot;

use super::{
    layout_table::LayoutRecord,
    CallbackChannel,
    ClientId,
    FileKey,
    LayoutServer,
    ReturnReason,
    ServerError,
};
use crate::{
    client::CbLayoutRecallArgs,
    core::{Fsid, LayoutRange, LayoutType, Nfs4Status, ReturnType},
};

pub(crate) type RecallId = u64;

/// What a recall asks back.
#[derive(Debug, Clone, PartialEq)]
pub struct RecallTarget {
    pub return_type: ReturnType,
    pub layout_type: LayoutType,
    pub range: LayoutRange,
    /// FILE recalls only.
    pub file: Option<FileKey>,
    /// FSID recalls only.
    pub fsid: Option<Fsid>,
}

impl RecallTarget {
    pub fn file(layout_type: LayoutType, file: FileKey, range: LayoutRange) -> Self {
        Self {
            return_type: ReturnType::File,
            layout_type,
            range,
            file: Some(file),
            fsid: None,
        }
    }

    pub fn fsid(layout_type: LayoutType, fsid: Fsid, range: LayoutRange) -> Self {
        Self {
            return_type: ReturnType::Fsid,
            layout_type,
            range,
            file: None,
            fsid: Some(fsid),
        }
    }

    pub fn all(layout_type: LayoutType, range: LayoutRange) -> Self {
        Self {
            return_type: ReturnType::All,
            layout_type,
            range,
            file: None,
            fsid: None,
        }
    }

    fn selects_file(&self, file: &FileKey) -> bool {
        match self.return_type {
            ReturnType::File => self.file.as_ref() == Some(file),
            ReturnType::Fsid => self.fsid == Some(file.sb),
            ReturnType::All => true,
        }
    }

    /// Whether the recall asks for `record` back.
    pub(crate) fn selects(&self, record: &LayoutRecord) -> bool {
        record.layout_type == self.layout_type
            && self.selects_file(&record.file)
            && record.range.iomode.matches(self.range.iomode)
            && record.range.overlaps(&self.range)
    }

    /// Whether a LAYOUTGET for `range` of `file` conflicts with the recall.
    pub(crate) fn covers(&self, file: &FileKey, range: &LayoutRange) -> bool {
        self.selects_file(file)
            && range.iomode.matches(self.range.iomode)
            && range.overlaps(&self.range)
    }

    fn validate(&self) -> Result<(), ServerError> {
        let ok = self.range.is_valid()
            && match self.return_type {
                ReturnType::File => self.file.is_some(),
                ReturnType::Fsid => self.fsid.is_some(),
                ReturnType::All => true,
            };
        if ok {
            Ok(())
        } else {
            Err(ServerError::BadRecall {
                target: self.clone(),
            })
        }
    }
}

/// One CB_LAYOUTRECALL in flight to one client.
#[derive(Debug)]
pub(crate) struct Recall {
    pub(crate) id: RecallId,
    pub(crate) client: ClientId,
    pub(crate) target: RecallTarget,
    pub(crate) parent: Option<RecallId>,
    /// Signalled on completion when there is no parent.
    pub(crate) done: Option<oneshot::Sender<()>>,
}

/// Aggregate of a fan-out. Holds one reference per live child plus one for
/// the initiator while it is still sending.
#[derive(Debug)]
pub(crate) struct RecallParent {
    pub(crate) refcount: usize,
    pub(crate) done: Option<oneshot::Sender<()>>,
}

/// Resolves when every client asked by a recall is done with it.
pub struct RecallCookie {
    recalled: usize,
    done: oneshot::Receiver<()>,
}

impl Debug for RecallCookie {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "recall cookie ({} clients)", self.recalled)
    }
}

impl RecallCookie {
    /// Number of clients a CB_LAYOUTRECALL was sent to.
    pub fn recalled(&self) -> usize {
        self.recalled
    }
}

impl Future for RecallCookie {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // a dropped sender means the recall state went away, which is done
        // as far as the requester is concerned
        Pin::new(&mut self.done).poll(cx).map(|_| ())
    }
}

/// How a recall ended when the client did not return the layouts itself.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ForceReason {
    NoMatching,
    Failed,
}

pub(super) fn release(done: Vec<oneshot::Sender<()>>) {
    for tx in done {
        // the requester may have stopped waiting
        let _ = tx.send(());
    }
}

type CbWork = (RecallId, ClientId, Arc<dyn CallbackChannel>, CbLayoutRecallArgs);

impl LayoutServer {
    /// Recalls the layouts selected by `target` from every client holding
    /// them, or from `only` if given. The CB_LAYOUTRECALLs are sent before
    /// this returns; the cookie resolves once all of them completed.
    pub fn recall_layout(
        &self,
        target: RecallTarget,
        only: Option<ClientId>,
    ) -> Result<RecallCookie, ServerError> {
        target.validate()?;
        let (tx, rx) = oneshot::channel();

        let (work, parent) = {
            let mut table = self.table.lock();
            let clients = table.clients_holding(&target, only);
            if clients.is_empty() {
                drop(table);
                debug!("nothing to recall for {:?}", target);
                release(vec![tx]);
                return Ok(RecallCookie {
                    recalled: 0,
                    done: rx,
                });
            }

            let mut tx = Some(tx);
            let parent = if clients.len() > 1 {
                let id = table.next_id();
                table.parents.insert(
                    id,
                    RecallParent {
                        refcount: 1,
                        done: tx.take(),
                    },
                );
                Some(id)
            } else {
                None
            };

            let mut work: Vec<CbWork> = Vec::with_capacity(clients.len());
            for client in clients {
                let Ok(entry) = table.client(client) else {
                    continue;
                };
                if !entry.cb_up {
                    warn!(
                        "client {} has no callback channel, not recalling {:?}",
                        client, target
                    );
                    continue;
                }
                let callback = entry.callback.clone();
                if table.arena_len() >= self.opts.max_layout_records {
                    warn!(
                        "no room for a recall of client {}, dropping it from {:?}",
                        client, target
                    );
                    continue;
                }

                let stateid = match (target.return_type, &target.file) {
                    (ReturnType::File, Some(file)) => table.bump_state(client, file),
                    _ => None,
                };
                let id = table.next_id();
                table.recalls.insert(
                    id,
                    Recall {
                        id,
                        client,
                        target: target.clone(),
                        parent,
                        done: tx.take(),
                    },
                );
                if let Some(p) = parent.and_then(|p| table.parents.get_mut(&p)) {
                    p.refcount += 1;
                }

                let args = CbLayoutRecallArgs {
                    return_type: target.return_type,
                    layout_type: target.layout_type,
                    range: target.range,
                    changed: false,
                    fh: target.file.map(|f| f.fh()),
                    stateid,
                    fsid: target.fsid,
                };
                work.push((id, client, callback, args));
            }
            (work, parent)
        };

        let recalled = work.len();
        info!("recalling {:?} from {} clients", target, recalled);
        for (id, client, callback, args) in work {
            self.send_recall(id, client, callback.as_ref(), &args);
        }

        // the initiator's reference. Without a parent and without a child the
        // sender was dropped with the table guard, which resolves the cookie
        if let Some(parent) = parent {
            let done = self.table.lock().put_parent(parent);
            release(done.into_iter().collect());
        }

        Ok(RecallCookie {
            recalled,
            done: rx,
        })
    }

    fn send_recall(
        &self,
        id: RecallId,
        client: ClientId,
        callback: &dyn CallbackChannel,
        args: &CbLayoutRecallArgs,
    ) {
        let mut retries = 0;
        loop {
            match callback.cb_layoutrecall(args) {
                Ok(Nfs4Status::Ok) => {
                    debug!("client {} accepted recall {}", client, id);
                    return;
                }
                Ok(Nfs4Status::Delay) if retries < self.opts.cb_recall_retries => {
                    retries += 1;
                    debug!(
                        "client {} delayed recall {}, retry {}",
                        client, id, retries
                    );
                    std::thread::sleep(self.opts.cb_retry_delay());
                    if !self.table.lock().recalls.contains_key(&id) {
                        return;
                    }
                }
                Ok(Nfs4Status::NoMatchingLayout) => {
                    debug!("client {} holds nothing for recall {}", client, id);
                    self.force_recall(id, ForceReason::NoMatching);
                    return;
                }
                Ok(status) => {
                    warn!(
                        "client {} answered recall {} with {}, revoking",
                        client, id, status
                    );
                    self.force_recall(id, ForceReason::Failed);
                    return;
                }
                Err(error) => {
                    warn!(
                        "CB_LAYOUTRECALL {} to client {} failed: {}, revoking",
                        id, client, error
                    );
                    if let Ok(entry) = self.table.lock().client_mut(client) {
                        entry.cb_up = false;
                    }
                    self.force_recall(id, ForceReason::Failed);
                    return;
                }
            }
        }
    }

    /// Completes a recall without a LAYOUTRETURN: whatever it selects is
    /// dropped as if it had been returned.
    fn force_recall(&self, id: RecallId, reason: ForceReason) {
        let (returned, done) = {
            let mut table = self.table.lock();
            let Some(recall) = table.recalls.get(&id) else {
                return;
            };
            let client = recall.client;
            let target = recall.target.clone();
            let returned = table.dequeue_recalled(client, &target);
            let mut done: Vec<_> = table.complete_recall(id).into_iter().collect();
            done.extend(table.complete_satisfied(client));
            (returned, done)
        };

        debug!(
            "recall {} forced ({:?}), {} ranges released",
            id,
            reason,
            returned.len()
        );
        self.export_return(returned, ReturnReason::Recalled);
        release(done);
    }
}
