//! Layout drivers. Every layout type (files, blocks, objects) implements
//! [`LayoutDriver`] and is registered in a [`LayoutDriverRegistry`] keyed by
//! its layout type. The client core only ever talks to a driver through the
//! trait, it never depends on which concrete type backs a mount.
//!
//! Adding a new layout type requires:
//!  - a `LayoutBody` and `DeviceAddr` variant carrying its decoded layout
//!    and device information,
//!  - an implementation of `LayoutDriver`,
//!  - registering it, see `LayoutDriverRegistry::with_defaults`.

use std::{
    any::Any,
    collections::HashMap,
    fmt::Debug,
    sync::Arc,
};

use parking_lot::RwLock;
use snafu::Snafu;

pub use blocks::{BlockExtentDesc, BlocksDriver, ExtentState};
pub use files::FilesDriver;
pub use objects::{ObjectComponent, ObjectsDriver};

use crate::{
    client::{LayoutHeader, LayoutSegment},
    core::{Fsid, LayoutRange, LayoutType, Nfs4Status},
    deviceid::{DeviceError, DeviceId},
};

pub mod blocks;
mod files;
mod objects;

/// Driver private data attached to a layout segment.
pub type SegmentPayload = Box<dyn Any + Send + Sync>;

/// Driver private data attached to a layout header.
pub type HeaderPayload = Arc<dyn Any + Send + Sync>;

/// Driver private data attached to a cached device.
pub type DevicePayload = Box<dyn Any + Send + Sync>;

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)))]
pub enum DriverError {
    #[snafu(display("Layout driver for {} is already registered", layout_type))]
    AlreadyRegistered { layout_type: LayoutType },
    #[snafu(display("Layout driver has an empty name"))]
    Unnamed {},
    #[snafu(display("No layout driver for {}", layout_type))]
    NotRegistered { layout_type: LayoutType },
    #[snafu(display("Layout body is not a {} layout", layout_type))]
    WrongLayoutType { layout_type: LayoutType },
    #[snafu(display("Malformed layout: {}", reason))]
    BadLayout { reason: String },
    #[snafu(display("Block layout extents rejected: {}", source))]
    Extents { source: blocks::ExtentError },
    #[snafu(display("Device lookup failed: {}", source))]
    Device { source: DeviceError },
    #[snafu(display("Layout header is missing its driver state"))]
    NoHeaderState {},
    #[snafu(display("Range {:?} is outside of the segment", range))]
    OutOfRange { range: LayoutRange },
}

impl DriverError {
    pub fn status(&self) -> Nfs4Status {
        match self {
            Self::NotRegistered {
                ..
            } => Nfs4Status::UnknownLayoutType,
            Self::Device {
                source,
            } => source.status(),
            Self::OutOfRange {
                ..
            } => Nfs4Status::Inval,
            _ => Nfs4Status::BadLayout,
        }
    }
}

/// Decoded contents of a LAYOUTGET reply, one variant per layout type.
#[derive(Debug, Clone, PartialEq)]
pub enum LayoutBody {
    Files {
        deviceid: DeviceId,
        stripe_unit: u64,
        first_stripe_index: u32,
        pattern_offset: u64,
        /// Commit through the MDS rather than the data servers.
        commit_through_mds: bool,
        filehandles: Vec<Vec<u8>>,
    },
    Objects {
        stripe_unit: u64,
        group_width: u32,
        group_depth: u32,
        mirror_cnt: u32,
        components: Vec<ObjectComponent>,
    },
    Blocks {
        extents: Vec<BlockExtentDesc>,
    },
}

impl LayoutBody {
    pub fn layout_type(&self) -> LayoutType {
        match self {
            Self::Files {
                ..
            } => LayoutType::Files,
            Self::Objects {
                ..
            } => LayoutType::Objects,
            Self::Blocks {
                ..
            } => LayoutType::Blocks,
        }
    }
}

/// Decoded GETDEVICEINFO reply.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceAddr {
    Files {
        stripe_indices: Vec<u32>,
        data_servers: Vec<Vec<String>>,
    },
    Objects {
        osd_name: String,
        address: String,
    },
    Blocks {
        signature: Vec<u8>,
        sector_count: u64,
    },
}

fn xdr_opaque_len(len: usize) -> usize {
    4 + ((len + 3) & !3)
}

impl DeviceAddr {
    /// Size of the XDR encoding of the address, checked against the
    /// client's GETDEVICEINFO maxcount.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Files {
                stripe_indices,
                data_servers,
            } => {
                4 + 4 * stripe_indices.len()
                    + 4
                    + data_servers
                        .iter()
                        .map(|addrs| {
                            4 + addrs
                                .iter()
                                .map(|a| xdr_opaque_len(a.len()))
                                .sum::<usize>()
                        })
                        .sum::<usize>()
            }
            Self::Objects {
                osd_name,
                address,
            } => xdr_opaque_len(osd_name.len()) + xdr_opaque_len(address.len()),
            Self::Blocks {
                signature,
                ..
            } => xdr_opaque_len(signature.len()) + 8,
        }
    }
}

/// Result of handing an I/O to a driver.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PnfsTryStatus {
    /// The driver took the I/O.
    Attempted,
    /// The caller must send the I/O through the MDS.
    NotAttempted,
}

/// Operations a layout type implements. `alloc_segment`, `free_segment`,
/// `read_range`, `write_range` and `commit` have no default: a driver that
/// does not provide them cannot be registered.
pub trait LayoutDriver: Send + Sync + Debug {
    fn layout_type(&self) -> LayoutType;

    fn name(&self) -> &str;

    /// Called once per mount using this driver.
    fn mount_init(&self, _fsid: Fsid) -> Result<(), DriverError> {
        Ok(())
    }

    fn mount_uninit(&self, _fsid: Fsid) {}

    /// Per layout header state, created together with the header.
    fn alloc_layout_hdr(&self) -> Option<HeaderPayload> {
        None
    }

    /// Turns a decoded LAYOUTGET reply into driver private segment data.
    fn alloc_segment(
        &self,
        hdr: &LayoutHeader,
        range: &LayoutRange,
        body: &LayoutBody,
    ) -> Result<SegmentPayload, DriverError>;

    /// Releases segment data, never called with a lock held.
    fn free_segment(&self, hdr: &LayoutHeader, payload: SegmentPayload);

    fn read_range(
        &self,
        seg: &LayoutSegment,
        offset: u64,
        len: u64,
    ) -> Result<PnfsTryStatus, DriverError>;

    fn write_range(
        &self,
        seg: &LayoutSegment,
        offset: u64,
        len: u64,
    ) -> Result<PnfsTryStatus, DriverError>;

    fn commit(&self, seg: &LayoutSegment) -> Result<PnfsTryStatus, DriverError>;

    fn get_stripe_unit(&self, _seg: &LayoutSegment) -> Option<u64> {
        None
    }

    /// Whether a request at `offset` may be coalesced with the previous one
    /// at `prev_offset` into a single I/O.
    fn coalesce_test(
        &self,
        _seg: &LayoutSegment,
        _prev_offset: u64,
        _offset: u64,
    ) -> bool {
        true
    }

    /// Produces the opaque layoutupdate body of a LAYOUTCOMMIT.
    fn setup_layoutcommit(
        &self,
        _hdr: &LayoutHeader,
        _range: &LayoutRange,
    ) -> Option<Vec<u8>> {
        None
    }

    fn cleanup_layoutcommit(&self, _hdr: &LayoutHeader, _status: Nfs4Status) {
    }

    /// Resolves a GETDEVICEINFO reply.
    fn alloc_deviceid_node(
        &self,
        id: &DeviceId,
        addr: &DeviceAddr,
    ) -> Result<DevicePayload, DriverError>;

    fn free_deviceid_node(&self, id: &DeviceId, _payload: DevicePayload) {
        trace!("{}: device {} released", self.name(), id);
    }
}

/// Registry of layout drivers, keyed by layout type.
#[derive(Debug, Default)]
pub struct LayoutDriverRegistry {
    drivers: RwLock<HashMap<LayoutType, Arc<dyn LayoutDriver>>>,
}

impl LayoutDriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the files, blocks and objects drivers.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        let defaults: [Arc<dyn LayoutDriver>; 3] = [
            Arc::new(FilesDriver::default()),
            Arc::new(BlocksDriver::default()),
            Arc::new(ObjectsDriver::default()),
        ];
        for driver in defaults {
            if let Err(error) = registry.register(driver) {
                error!("failed to register default layout driver: {}", error);
            }
        }
        registry
    }

    pub fn register(
        &self,
        driver: Arc<dyn LayoutDriver>,
    ) -> Result<(), DriverError> {
        if driver.name().is_empty() {
            return Err(DriverError::Unnamed {});
        }

        let layout_type = driver.layout_type();
        let mut drivers = self.drivers.write();
        if drivers.contains_key(&layout_type) {
            error!("layout driver {} already registered", layout_type);
            return Err(DriverError::AlreadyRegistered {
                layout_type,
            });
        }

        info!("registering layout driver {} ({})", driver.name(), layout_type);
        drivers.insert(layout_type, driver);
        Ok(())
    }

    pub fn unregister(
        &self,
        layout_type: LayoutType,
    ) -> Option<Arc<dyn LayoutDriver>> {
        let driver = self.drivers.write().remove(&layout_type);
        if driver.is_some() {
            info!("unregistered layout driver {}", layout_type);
        }
        driver
    }

    pub fn lookup(
        &self,
        layout_type: LayoutType,
    ) -> Option<Arc<dyn LayoutDriver>> {
        self.drivers.read().get(&layout_type).cloned()
    }

    /// Picks the first layout type advertised by the server that has a
    /// registered driver, in the server's order of preference.
    pub fn select(&self, advertised: &[u32]) -> Option<Arc<dyn LayoutDriver>> {
        advertised
            .iter()
            .filter_map(|raw| LayoutType::from_raw(*raw))
            .find_map(|t| self.lookup(t))
    }

    pub fn len(&self) -> usize {
        self.drivers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
