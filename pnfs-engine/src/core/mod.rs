//!
//! core contains the primitives shared by the client, the server and the
//! layout drivers: iomodes, byte ranges, stateids, NFSv4.1 status codes and
//! the wait/cancel machinery used by the blocking paths.
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use snafu::Snafu;

pub use range::{end_offset, LayoutRange};
pub use stateid::{seqid_is_newer, Stateid};
pub use wait::{CancelToken, WaitQueue};

mod range;
mod stateid;
mod wait;

/// I/O mode of a layout or of a request for one.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[repr(u32)]
pub enum IoMode {
    Read = 1,
    ReadWrite = 2,
    Any = 3,
}

impl IoMode {
    /// Index into per-iomode tables (READ and READWRITE only).
    pub(crate) fn index(self) -> usize {
        match self {
            IoMode::Read => 0,
            IoMode::ReadWrite | IoMode::Any => 1,
        }
    }

    /// Returns true if a layout held with `self` is selected by a
    /// recall or return naming `other`.
    pub fn matches(self, other: IoMode) -> bool {
        other == IoMode::Any || self == IoMode::Any || self == other
    }
}

impl Display for IoMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::ReadWrite => write!(f, "rw"),
            Self::Any => write!(f, "any"),
        }
    }
}

/// Registered layout types.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[repr(u32)]
pub enum LayoutType {
    Files = 1,
    Objects = 2,
    Blocks = 3,
}

impl LayoutType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Files),
            2 => Some(Self::Objects),
            3 => Some(Self::Blocks),
            _ => None,
        }
    }
}

impl Display for LayoutType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Files => write!(f, "LAYOUT_NFSV4_1_FILES"),
            Self::Objects => write!(f, "LAYOUT_OSD2_OBJECTS"),
            Self::Blocks => write!(f, "LAYOUT_BLOCK_VOLUME"),
        }
    }
}

/// Scope of a CB_LAYOUTRECALL or LAYOUTRETURN.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ReturnType {
    File = 1,
    Fsid = 2,
    All = 3,
}

impl ReturnType {
    /// Decodes a wire value. An unknown return type means the caller's state
    /// machine is corrupted and is not recoverable.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::File,
            2 => Self::Fsid,
            3 => Self::All,
            other => panic!("unknown layout return type {}", other),
        }
    }

    pub fn is_bulk(self) -> bool {
        !matches!(self, Self::File)
    }
}

/// Identifies an exported filesystem (the superblock of the file).
pub type Fsid = u64;

/// NFSv4.1 status codes used by layout operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Nfs4Status {
    Ok = 0,
    NoEnt = 2,
    Io = 5,
    Inval = 22,
    BadHandle = 10001,
    NotSupp = 10004,
    TooSmall = 10005,
    ServerFault = 10006,
    Delay = 10008,
    Expired = 10011,
    OldStateid = 10024,
    BadStateid = 10025,
    BadIoMode = 10049,
    BadLayout = 10050,
    LayoutTryLater = 10058,
    LayoutUnavailable = 10059,
    NoMatchingLayout = 10060,
    RecallConflict = 10061,
    UnknownLayoutType = 10062,
}

impl Nfs4Status {
    /// Transient conditions: the caller backs off and retries, meanwhile
    /// I/O goes through the MDS.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::LayoutTryLater | Self::Delay | Self::RecallConflict
        )
    }
}

impl Display for Nfs4Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, *self as u32)
    }
}

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum CoreError {
    #[snafu(display("wait interrupted by cancellation"))]
    Interrupted {},
    #[snafu(display("wait timed out after {} ms", timeout_ms))]
    TimedOut { timeout_ms: u64 },
}

impl CoreError {
    pub fn status(&self) -> Nfs4Status {
        Nfs4Status::Delay
    }
}
