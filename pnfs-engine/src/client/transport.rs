//! Forechannel operations the client core sends to the metadata server.
//! Calls are synchronous from the core's point of view; the transport may be
//! asynchronous underneath.
use std::fmt::{Debug, Formatter};

use chrono::{DateTime, Utc};

use crate::{
    core::{Fsid, LayoutRange, LayoutType, Nfs4Status, ReturnType, Stateid},
    deviceid::DeviceId,
    driver::{DeviceAddr, LayoutBody},
};

/// NFS filehandle.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct FileHandle(pub Vec<u8>);

impl Debug for FileHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "fh:{}", hex::encode(&self.0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutGetArgs {
    pub fh: FileHandle,
    pub layout_type: LayoutType,
    pub range: LayoutRange,
    pub minlength: u64,
    pub stateid: Stateid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutGetReply {
    pub stateid: Stateid,
    pub range: LayoutRange,
    pub return_on_close: bool,
    pub body: LayoutBody,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutReturnArgs {
    pub return_type: ReturnType,
    pub layout_type: LayoutType,
    pub range: LayoutRange,
    /// FILE returns only.
    pub fh: Option<FileHandle>,
    /// FSID returns only.
    pub fsid: Option<Fsid>,
    /// FILE returns only.
    pub stateid: Option<Stateid>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutCommitArgs {
    pub fh: FileHandle,
    pub layout_type: LayoutType,
    pub stateid: Stateid,
    pub range: LayoutRange,
    pub last_write_offset: Option<u64>,
    pub time_modify: Option<DateTime<Utc>>,
    /// Layout type specific layoutupdate body.
    pub update: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayoutCommitReply {
    pub new_size: Option<u64>,
}

pub trait LayoutTransport: Send + Sync {
    fn layoutget(
        &self,
        args: &LayoutGetArgs,
    ) -> Result<LayoutGetReply, Nfs4Status>;

    /// Returns the new layout stateid, or None if the server holds no more
    /// layouts for the file.
    fn layoutreturn(
        &self,
        args: &LayoutReturnArgs,
    ) -> Result<Option<Stateid>, Nfs4Status>;

    fn layoutcommit(
        &self,
        args: &LayoutCommitArgs,
    ) -> Result<LayoutCommitReply, Nfs4Status>;

    fn getdeviceinfo(
        &self,
        layout_type: LayoutType,
        id: &DeviceId,
    ) -> Result<DeviceAddr, Nfs4Status>;
}

/// Arguments of a CB_LAYOUTRECALL.
#[derive(Debug, Clone, PartialEq)]
pub struct CbLayoutRecallArgs {
    pub return_type: ReturnType,
    pub layout_type: LayoutType,
    pub range: LayoutRange,
    pub changed: bool,
    /// FILE recalls only.
    pub fh: Option<FileHandle>,
    /// FILE recalls only.
    pub stateid: Option<Stateid>,
    /// FSID recalls only.
    pub fsid: Option<Fsid>,
}
