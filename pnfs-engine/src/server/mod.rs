//! Metadata server side of pNFS: tracks which client holds which layout on
//! which file, hands layouts out through the export of the file and
//! orchestrates recalls.
//!
//! All layout state sits in one table behind one lock. Calls into an export
//! or a client callback channel are always made with the lock dropped.
use std::{
    collections::HashMap,
    fmt::{Debug, Formatter},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use snafu::Snafu;

pub use layout_table::LayoutRecord;
pub use recall::{RecallCookie, RecallTarget};
pub use sbid::{make_device_id, split_device_id, SbidTable, SuperBlock};

use layout_table::{LayoutTable, Returned};

use crate::{
    client::{
        CbLayoutRecallArgs,
        FileHandle,
        LayoutCommitArgs,
        LayoutCommitReply,
        LayoutGetArgs,
        LayoutGetReply,
        LayoutReturnArgs,
    },
    constants::NFS4_MAX_UINT64,
    core::{IoMode, LayoutRange, LayoutType, Nfs4Status, ReturnType, Stateid},
    deviceid::DeviceId,
    driver::{DeviceAddr, LayoutBody},
    subsys::config::ServerOpts,
};

mod layout_table;
mod recall;
mod sbid;

/// Identifies a client (its clientid).
pub type ClientId = u64;

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)))]
pub enum ServerError {
    #[snafu(display("Invalid range {:?} (minlength {})", range, minlength))]
    BadRange { range: LayoutRange, minlength: u64 },
    #[snafu(display("Malformed filehandle {:?}", fh))]
    BadHandle { fh: FileHandle },
    #[snafu(display("Unknown client {}", client))]
    UnknownClient { client: ClientId },
    #[snafu(display("Superblock {:#x} is not exported with pNFS", sb))]
    NoExport { sb: SuperBlock },
    #[snafu(display("Export does not hand out {} layouts", layout_type))]
    WrongLayoutType { layout_type: LayoutType },
    #[snafu(display("Iomode {} cannot be granted", iomode))]
    BadIoMode { iomode: IoMode },
    #[snafu(display("A recall overlapping {:?} is pending", range))]
    RecallConflict { range: LayoutRange },
    #[snafu(display("Stateid {:?} is a replay", stateid))]
    OldStateid { stateid: Stateid },
    #[snafu(display("Stateid {:?} is not valid here", stateid))]
    BadStateid { stateid: Stateid },
    #[snafu(display("Too many layout records"))]
    NoResources {},
    #[snafu(display("Export {} failed: {}", op, status))]
    Export { op: &'static str, status: Nfs4Status },
    #[snafu(display("No read-write layout covers {:?}", range))]
    NoRwLayout { range: LayoutRange },
    #[snafu(display("Unknown device {}", id))]
    NoDevice { id: DeviceId },
    #[snafu(display("Device address needs {} bytes", needed))]
    TooSmall { needed: usize },
    #[snafu(display("Malformed recall {:?}", target))]
    BadRecall { target: RecallTarget },
    #[snafu(display("Callback to client {} failed: {}", client, reason))]
    Callback { client: ClientId, reason: String },
}

impl ServerError {
    pub fn status(&self) -> Nfs4Status {
        match self {
            Self::BadRange {
                ..
            } => Nfs4Status::Inval,
            Self::BadHandle {
                ..
            } => Nfs4Status::BadHandle,
            Self::UnknownClient {
                ..
            } => Nfs4Status::Expired,
            Self::NoExport {
                ..
            } => Nfs4Status::LayoutUnavailable,
            Self::WrongLayoutType {
                ..
            } => Nfs4Status::UnknownLayoutType,
            Self::BadIoMode {
                ..
            } => Nfs4Status::BadIoMode,
            Self::RecallConflict {
                ..
            } => Nfs4Status::RecallConflict,
            Self::OldStateid {
                ..
            } => Nfs4Status::OldStateid,
            Self::BadStateid {
                ..
            } => Nfs4Status::BadStateid,
            Self::NoResources {} => Nfs4Status::LayoutTryLater,
            Self::Export {
                status, ..
            } => *status,
            Self::NoRwLayout {
                ..
            } => Nfs4Status::BadLayout,
            Self::NoDevice {
                ..
            } => Nfs4Status::NoEnt,
            Self::TooSmall {
                ..
            } => Nfs4Status::TooSmall,
            Self::BadRecall {
                ..
            } => Nfs4Status::Inval,
            Self::Callback {
                ..
            } => Nfs4Status::ServerFault,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.status().is_retryable()
    }
}

/// A file on an exported filesystem.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FileKey {
    pub sb: SuperBlock,
    pub ino: u64,
}

impl FileKey {
    pub fn new(sb: SuperBlock, ino: u64) -> Self {
        Self {
            sb,
            ino,
        }
    }

    /// The filehandle clients know the file by.
    pub fn fh(&self) -> FileHandle {
        let mut raw = Vec::with_capacity(16);
        raw.extend_from_slice(&self.sb.to_be_bytes());
        raw.extend_from_slice(&self.ino.to_be_bytes());
        FileHandle(raw)
    }

    pub fn from_fh(fh: &FileHandle) -> Result<Self, ServerError> {
        if fh.0.len() != 16 {
            return Err(ServerError::BadHandle {
                fh: fh.clone(),
            });
        }
        let mut sb = [0u8; 8];
        let mut ino = [0u8; 8];
        sb.copy_from_slice(&fh.0[.. 8]);
        ino.copy_from_slice(&fh.0[8 ..]);
        Ok(Self::new(u64::from_be_bytes(sb), u64::from_be_bytes(ino)))
    }
}

/// What an export hands out for a LAYOUTGET.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutGrant {
    pub range: LayoutRange,
    pub return_on_close: bool,
    pub body: LayoutBody,
}

/// Why layouts went back to the export.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReturnReason {
    /// LAYOUTRETURN from the client.
    Returned,
    /// Return-on-close.
    Closed,
    /// Recall completed without a return, or revoked.
    Recalled,
    /// The client's lease expired.
    Expired,
}

/// The filesystem side of layout operations.
pub trait ExportOps: Send + Sync {
    fn layout_type(&self) -> LayoutType;

    /// Grants a layout for `range` of `file`. `sbid` is the id device ids
    /// of this filesystem have to be built with, see [`make_device_id`].
    fn layout_get(
        &self,
        file: &FileKey,
        range: &LayoutRange,
        sbid: u64,
    ) -> Result<LayoutGrant, Nfs4Status>;

    /// Returns the new file size if it changed.
    fn layout_commit(
        &self,
        file: &FileKey,
        new_size: Option<u64>,
        mtime: Option<DateTime<Utc>>,
    ) -> Result<Option<u64>, Nfs4Status>;

    fn layout_return(
        &self,
        _file: &FileKey,
        _range: &LayoutRange,
        _reason: ReturnReason,
    ) {
    }

    fn get_device_info(&self, index: u64) -> Result<DeviceAddr, Nfs4Status>;
}

/// The backchannel to one client.
pub trait CallbackChannel: Send + Sync {
    /// Sends a CB_LAYOUTRECALL. An error means the channel failed, a status
    /// is the client's answer.
    fn cb_layoutrecall(
        &self,
        args: &CbLayoutRecallArgs,
    ) -> Result<Nfs4Status, ServerError>;
}

pub struct LayoutServer {
    opts: ServerOpts,
    sbids: Arc<SbidTable>,
    exports: RwLock<HashMap<SuperBlock, Arc<dyn ExportOps>>>,
    table: Mutex<LayoutTable>,
}

impl Debug for LayoutServer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayoutServer")
            .field("opts", &self.opts)
            .field("exports", &self.exports.read().len())
            .field("records", &self.table.lock().record_count())
            .finish()
    }
}

fn check_range(range: &LayoutRange, minlength: u64) -> Result<(), ServerError> {
    let overflows =
        |len: u64| len != NFS4_MAX_UINT64 && range.offset > NFS4_MAX_UINT64 - len;
    if range.length == 0 || overflows(range.length) || overflows(minlength) {
        return Err(ServerError::BadRange {
            range: *range,
            minlength,
        });
    }
    Ok(())
}

impl LayoutServer {
    pub fn new(opts: ServerOpts, sbids: Arc<SbidTable>) -> Self {
        info!("creating layout server with {:?}", opts);
        Self {
            opts,
            sbids,
            exports: RwLock::new(HashMap::new()),
            table: Mutex::new(LayoutTable::default()),
        }
    }

    pub fn opts(&self) -> &ServerOpts {
        &self.opts
    }

    pub fn sbids(&self) -> &Arc<SbidTable> {
        &self.sbids
    }

    pub fn add_export(&self, sb: SuperBlock, ops: Arc<dyn ExportOps>) {
        info!("exporting superblock {:#x} with {} layouts", sb, ops.layout_type());
        self.exports.write().insert(sb, ops);
    }

    fn export(&self, sb: SuperBlock) -> Result<Arc<dyn ExportOps>, ServerError> {
        self.exports
            .read()
            .get(&sb)
            .cloned()
            .ok_or(ServerError::NoExport {
                sb,
            })
    }

    /// Registers a client, or replaces its callback channel.
    pub fn register_client(
        &self,
        client: ClientId,
        callback: Arc<dyn CallbackChannel>,
    ) {
        debug!("registering client {}", client);
        self.table.lock().add_client(client, callback);
    }

    pub fn set_callback_up(
        &self,
        client: ClientId,
        up: bool,
    ) -> Result<(), ServerError> {
        let mut table = self.table.lock();
        let entry = table.client_mut(client)?;
        if entry.cb_up != up {
            info!(
                "client {} callback channel {}",
                client,
                if up { "up" } else { "down" }
            );
        }
        entry.cb_up = up;
        Ok(())
    }

    /// Hands ranges released by the table back to their exports.
    fn export_return(&self, returned: Returned, reason: ReturnReason) {
        for (file, range) in returned {
            match self.export(file.sb) {
                Ok(export) => export.layout_return(&file, &range, reason),
                Err(error) => warn!("cannot return {:?} of {:?}: {}", range, file, error),
            }
        }
    }

    /// LAYOUTGET.
    pub fn layout_get(
        &self,
        client: ClientId,
        args: &LayoutGetArgs,
    ) -> Result<LayoutGetReply, ServerError> {
        let file = FileKey::from_fh(&args.fh)?;
        check_range(&args.range, args.minlength)?;
        if args.range.iomode == IoMode::Any {
            return Err(ServerError::BadIoMode {
                iomode: args.range.iomode,
            });
        }
        let export = self.export(file.sb)?;
        if export.layout_type() != args.layout_type {
            return Err(ServerError::WrongLayoutType {
                layout_type: args.layout_type,
            });
        }

        {
            let table = self.table.lock();
            table.client(client)?;
            if table.recall_conflict(client, &file, &args.range) {
                debug!(
                    "LAYOUTGET {:?} of {:?} from client {} conflicts with a recall",
                    args.range, file, client
                );
                return Err(ServerError::RecallConflict {
                    range: args.range,
                });
            }
            table.check_get_stateid(client, &file, &args.stateid)?;
            if table.arena_len() >= self.opts.max_layout_records {
                warn!("layout table full, refusing LAYOUTGET from client {}", client);
                return Err(ServerError::NoResources {});
            }
        }

        let sbid = self.sbids.find_alloc(file.sb);
        let grant = export
            .layout_get(&file, &args.range, sbid)
            .map_err(|status| ServerError::Export {
                op: "layout_get",
                status,
            })?;
        if grant.body.layout_type() != args.layout_type
            || grant.range.iomode != args.range.iomode
            || !grant.range.is_valid()
            || grant.range.is_empty()
        {
            error!("export granted a bad layout {:?} for {:?}", grant, args);
            return Err(ServerError::Export {
                op: "layout_get",
                status: Nfs4Status::ServerFault,
            });
        }

        let mut table = self.table.lock();
        // a recall may have started while the export was working
        if table.client(client).is_err()
            || table.recall_conflict(client, &file, &grant.range)
        {
            drop(table);
            debug!("dropping grant {:?} of {:?}, recall raced", grant.range, file);
            export.layout_return(&file, &grant.range, ReturnReason::Recalled);
            return Err(ServerError::RecallConflict {
                range: args.range,
            });
        }

        let stateid = table.grant(
            client,
            file,
            grant.range,
            args.layout_type,
            grant.return_on_close,
        );
        debug!(
            "client {} granted {:?} of {:?}, stateid {:?}",
            client, grant.range, file, stateid
        );
        Ok(LayoutGetReply {
            stateid,
            range: grant.range,
            return_on_close: grant.return_on_close,
            body: grant.body,
        })
    }

    /// LAYOUTRETURN. For a FILE return, returns the new layout stateid, or
    /// None if the client holds nothing more on the file.
    pub fn layout_return(
        &self,
        client: ClientId,
        args: &LayoutReturnArgs,
    ) -> Result<Option<Stateid>, ServerError> {
        check_range(&args.range, 0)?;

        let (stateid, returned, done) = {
            let mut table = self.table.lock();
            table.client(client)?;

            let (stateid, returned) = match args.return_type {
                ReturnType::File => {
                    let fh = args.fh.clone().unwrap_or_default();
                    let file = FileKey::from_fh(&fh)?;
                    let presented = args.stateid.unwrap_or_default();
                    table.check_layout_stateid(client, &file, &presented)?;

                    let (returned, present) =
                        table.trim_file(client, &file, args.layout_type, &args.range);
                    let new = table.bump_state(client, &file);
                    (new.filter(|_| present), returned)
                }
                ReturnType::Fsid | ReturnType::All => {
                    let fsid = match args.return_type {
                        ReturnType::Fsid => args.fsid,
                        _ => None,
                    };
                    (None, table.dequeue_bulk(client, args.layout_type, fsid))
                }
            };

            let done = table.complete_satisfied(client);
            (stateid, returned, done)
        };

        debug!(
            "client {} {:?} return of {:?}: {} ranges released",
            client,
            args.return_type,
            args.range,
            returned.len()
        );
        self.export_return(returned, ReturnReason::Returned);
        recall::release(done);
        Ok(stateid)
    }

    /// LAYOUTCOMMIT. Returns the new file size if the export changed it.
    pub fn layout_commit(
        &self,
        client: ClientId,
        args: &LayoutCommitArgs,
    ) -> Result<LayoutCommitReply, ServerError> {
        let file = FileKey::from_fh(&args.fh)?;
        check_range(&args.range, 0)?;

        {
            let table = self.table.lock();
            table.client(client)?;
            table.check_layout_stateid(client, &file, &args.stateid)?;
            if !table.has_rw_overlap(client, &file, args.layout_type, &args.range) {
                return Err(ServerError::NoRwLayout {
                    range: args.range,
                });
            }
        }

        let export = self.export(file.sb)?;
        let new_size = args.last_write_offset.map(|o| o.saturating_add(1));
        let new_size = export
            .layout_commit(&file, new_size, args.time_modify)
            .map_err(|status| ServerError::Export {
                op: "layout_commit",
                status,
            })?;
        debug!("client {} committed {:?}, size {:?}", client, args.range, new_size);
        Ok(LayoutCommitReply {
            new_size,
        })
    }

    /// GETDEVICEINFO. Fails with TOOSMALL if the encoded address does not
    /// fit into `maxcount` bytes.
    pub fn get_device_info(
        &self,
        layout_type: LayoutType,
        id: &DeviceId,
        maxcount: u32,
    ) -> Result<DeviceAddr, ServerError> {
        let (sbid, index) = split_device_id(id);
        let sb = self.sbids.lookup(sbid).ok_or(ServerError::NoDevice {
            id: *id,
        })?;
        let export = self.export(sb)?;
        if export.layout_type() != layout_type {
            return Err(ServerError::WrongLayoutType {
                layout_type,
            });
        }

        let addr = export
            .get_device_info(index)
            .map_err(|status| ServerError::Export {
                op: "get_device_info",
                status,
            })?;
        let needed = addr.encoded_len();
        if needed > maxcount as usize {
            return Err(ServerError::TooSmall {
                needed,
            });
        }
        Ok(addr)
    }

    /// Return-on-close: the client closed `file`, every layout it was
    /// granted with return-on-close is gone without a LAYOUTRETURN.
    pub fn roc(&self, client: ClientId, file: &FileKey) -> usize {
        let (returned, done) = {
            let mut table = self.table.lock();
            let returned = table.dequeue_roc(client, file);
            if table.file_records(client, file).is_empty() {
                table.remove_state(client, file);
            }
            let done = table.complete_satisfied(client);
            (returned, done)
        };

        let count = returned.len();
        if count > 0 {
            debug!("client {} closed {:?}, {} layouts dropped", client, file, count);
        }
        self.export_return(returned, ReturnReason::Closed);
        recall::release(done);
        count
    }

    /// Lease expiry: pending recalls of the client are completed, all of its
    /// layouts and layout states are dropped and the client is forgotten.
    pub fn expire_client(&self, client: ClientId) -> usize {
        let (returned, done) = {
            let mut table = self.table.lock();
            let done: Vec<_> = table
                .client_recalls(client)
                .into_iter()
                .filter_map(|id| table.complete_recall(id))
                .collect();
            let returned = table.purge_client(client);
            table.remove_client(client);
            (returned, done)
        };

        info!(
            "client {} expired, {} layouts and {} recall waiters released",
            client,
            returned.len(),
            done.len()
        );
        let count = returned.len();
        self.export_return(returned, ReturnReason::Expired);
        recall::release(done);
        count
    }

    /// Records `client` holds on `file`.
    pub fn layouts(&self, client: ClientId, file: &FileKey) -> Vec<LayoutRecord> {
        self.table.lock().file_records(client, file)
    }

    pub fn record_count(&self) -> usize {
        self.table.lock().record_count()
    }

    pub fn pending_recalls(&self) -> usize {
        self.table.lock().recalls.len()
    }

    /// Current layout stateid of (client, file).
    pub fn layout_stateid(&self, client: ClientId, file: &FileKey) -> Option<Stateid> {
        self.table.lock().state(client, file).map(|s| s.stateid)
    }

    /// Whether `client`'s callback channel is usable.
    pub fn callback_up(&self, client: ClientId) -> bool {
        self.table
            .lock()
            .client(client)
            .map_or(false, |c| c.cb_up)
    }
}
