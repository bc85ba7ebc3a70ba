//! Block volume layout driver.
use std::{collections::HashSet, sync::Arc};

use snafu::Snafu;

pub use extents::{Extent, ExtentLookup, ExtentStore};

use super::{
    DeviceAddr,
    DevicePayload,
    DriverError,
    HeaderPayload,
    LayoutBody,
    LayoutDriver,
    PnfsTryStatus,
    SegmentPayload,
};
use crate::{
    client::{LayoutHeader, LayoutSegment},
    constants::{SECTOR_SHIFT, SECTOR_SIZE},
    core::{end_offset, IoMode, LayoutRange, LayoutType, Nfs4Status},
    deviceid::{DeviceId, DeviceRef},
};

mod extents;
mod verify;

/// Data state of a block extent, wire values of `pnfs_block_extent_state4`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ExtentState {
    /// Initialized, may be read and written.
    ReadWrite = 0,
    /// Initialized, may only be read.
    Read = 1,
    /// Allocated but not initialized; must be written before it is read
    /// back from the volume.
    Invalid = 2,
    /// Hole, reads return zeroes.
    None = 3,
}

impl ExtentState {
    /// READWRITE and INVALID extents live in the read-write list.
    pub fn is_rw_class(self) -> bool {
        matches!(self, Self::ReadWrite | Self::Invalid)
    }
}

/// One extent of a LAYOUTGET reply, byte addressed as on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockExtentDesc {
    pub deviceid: DeviceId,
    pub file_offset: u64,
    pub length: u64,
    pub storage_offset: u64,
    pub state: ExtentState,
}

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum ExtentError {
    #[snafu(display("offset {} is not sector aligned", offset))]
    Unaligned { offset: u64 },
    #[snafu(display("zero length extent at {}", offset))]
    ZeroLength { offset: u64 },
    #[snafu(display("extent at {} overflows the file", offset))]
    Overflow { offset: u64 },
    #[snafu(display("{:?} extent not allowed in a {} layout", state, iomode))]
    BadState { state: ExtentState, iomode: IoMode },
    #[snafu(display("extent at sector {} expected at {}", offset, expected))]
    NotContiguous { offset: u64, expected: u64 },
    #[snafu(display("copy-on-write extent at sector {} is misplaced", offset))]
    MisplacedCow { offset: u64 },
    #[snafu(display("copy-on-write coverage up to {} is left open", cowread))]
    UncoveredCow { cowread: u64 },
    #[snafu(display("extents end at sector {}, layout at {}", end, expected))]
    LengthMismatch { end: u64, expected: u64 },
    #[snafu(display("extent at sector {} conflicts with a cached one", file_offset))]
    Conflict { file_offset: u64 },
}

/// A block volume as resolved from GETDEVICEINFO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockVolume {
    pub signature: Vec<u8>,
    pub sector_count: u64,
}

/// Segment data: the devices the segment's extents live on.
struct BlocksSegment {
    devices: Vec<DeviceRef<DevicePayload>>,
}

#[derive(Debug, Default)]
pub struct BlocksDriver {}

impl BlocksDriver {
    fn store(hdr: &LayoutHeader) -> Result<&ExtentStore, DriverError> {
        hdr.driver_private()
            .and_then(|p| p.downcast_ref::<ExtentStore>())
            .ok_or(DriverError::NoHeaderState {})
    }

    fn seg_store(seg: &LayoutSegment) -> Result<Arc<LayoutHeader>, DriverError> {
        let hdr = seg.header().ok_or(DriverError::NoHeaderState {})?;
        Self::store(&hdr)?;
        Ok(hdr)
    }

    fn check_range(
        seg: &LayoutSegment,
        offset: u64,
        len: u64,
    ) -> Result<(), DriverError> {
        let range = LayoutRange::new(seg.range().iomode, offset, len);
        if !seg.range().contains(&range) {
            return Err(DriverError::OutOfRange {
                range,
            });
        }
        Ok(())
    }
}

/// First sector and end sector, rounded up, of a byte range. Saturates at
/// the end of the sector space.
fn sector_span(offset: u64, len: u64) -> (u64, u64) {
    let end = end_offset(offset, len);
    let partial = end & (SECTOR_SIZE - 1) != 0;
    (offset >> SECTOR_SHIFT, (end >> SECTOR_SHIFT) + u64::from(partial))
}

impl LayoutDriver for BlocksDriver {
    fn layout_type(&self) -> LayoutType {
        LayoutType::Blocks
    }

    fn name(&self) -> &str {
        "blocklayout"
    }

    fn alloc_layout_hdr(&self) -> Option<HeaderPayload> {
        Some(Arc::new(ExtentStore::new()))
    }

    fn alloc_segment(
        &self,
        hdr: &LayoutHeader,
        range: &LayoutRange,
        body: &LayoutBody,
    ) -> Result<SegmentPayload, DriverError> {
        let descs = match body {
            LayoutBody::Blocks {
                extents,
            } => extents,
            _ => {
                return Err(DriverError::WrongLayoutType {
                    layout_type: LayoutType::Blocks,
                })
            }
        };

        let store = Self::store(hdr)?;
        let extents = verify::decode_extents(range, descs)
            .map_err(|source| DriverError::Extents {
                source,
            })?;

        let ids: HashSet<DeviceId> = descs.iter().map(|d| d.deviceid).collect();
        let mut devices = Vec::with_capacity(ids.len());
        for id in ids {
            match hdr.get_device(&id) {
                Ok(dev) => devices.push(dev),
                Err(error) => {
                    for dev in devices {
                        hdr.put_device(dev);
                    }
                    return Err(error);
                }
            }
        }

        if let Err(source) = store.add_batch(extents) {
            error!("{:?}: dropping block layout {:?}: {}", hdr, range, source);
            for dev in devices {
                hdr.put_device(dev);
            }
            return Err(DriverError::Extents {
                source,
            });
        }

        debug!("{:?}: {} extents for {:?}", hdr, descs.len(), range);
        Ok(Box::new(BlocksSegment {
            devices,
        }))
    }

    fn free_segment(&self, hdr: &LayoutHeader, payload: SegmentPayload) {
        if let Ok(seg) = payload.downcast::<BlocksSegment>() {
            for dev in seg.devices {
                hdr.put_device(dev);
            }
        }
    }

    fn read_range(
        &self,
        seg: &LayoutSegment,
        offset: u64,
        len: u64,
    ) -> Result<PnfsTryStatus, DriverError> {
        Self::check_range(seg, offset, len)?;
        let hdr = Self::seg_store(seg)?;
        let store = Self::store(&hdr)?;

        let (mut sector, end) = sector_span(offset, len);
        while sector < end {
            match store.find(sector, false) {
                Some(hit) => {
                    trace!("read sector {} from {:?}", sector, hit.extent);
                    sector = hit.extent.end();
                }
                None => return Ok(PnfsTryStatus::NotAttempted),
            }
        }
        Ok(PnfsTryStatus::Attempted)
    }

    fn write_range(
        &self,
        seg: &LayoutSegment,
        offset: u64,
        len: u64,
    ) -> Result<PnfsTryStatus, DriverError> {
        if seg.range().iomode != IoMode::ReadWrite {
            return Ok(PnfsTryStatus::NotAttempted);
        }
        Self::check_range(seg, offset, len)?;
        let hdr = Self::seg_store(seg)?;
        let store = Self::store(&hdr)?;

        let (first, end) = sector_span(offset, len);
        let mut sector = first;
        let mut initializes = false;
        while sector < end {
            match store.find(sector, true) {
                Some(hit) if hit.extent.state() == ExtentState::ReadWrite => {
                    sector = hit.extent.end();
                }
                Some(hit) if hit.extent.state() == ExtentState::Invalid => {
                    initializes = true;
                    sector = hit.extent.end();
                }
                _ => return Ok(PnfsTryStatus::NotAttempted),
            }
        }

        if initializes {
            store.mark_written(first, end - first);
        }
        Ok(PnfsTryStatus::Attempted)
    }

    fn commit(&self, _seg: &LayoutSegment) -> Result<PnfsTryStatus, DriverError> {
        // block writes are stable once the volume acknowledged them
        Ok(PnfsTryStatus::Attempted)
    }

    fn setup_layoutcommit(
        &self,
        hdr: &LayoutHeader,
        _range: &LayoutRange,
    ) -> Option<Vec<u8>> {
        Self::store(hdr).ok()?.encode_commit_list()
    }

    fn cleanup_layoutcommit(&self, hdr: &LayoutHeader, status: Nfs4Status) {
        if let Ok(store) = Self::store(hdr) {
            store.clean_commit_list(status);
        }
    }

    fn alloc_deviceid_node(
        &self,
        id: &DeviceId,
        addr: &DeviceAddr,
    ) -> Result<DevicePayload, DriverError> {
        match addr {
            DeviceAddr::Blocks {
                signature,
                sector_count,
            } if *sector_count > 0 => Ok(Box::new(BlockVolume {
                signature: signature.clone(),
                sector_count: *sector_count,
            })),
            _ => Err(DriverError::BadLayout {
                reason: format!("device {id} is not a usable block volume"),
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sector_span_rounds_up() {
        assert_eq!(sector_span(0, 1), (0, 1));
        assert_eq!(sector_span(SECTOR_SIZE, SECTOR_SIZE), (1, 2));
        assert_eq!(sector_span(SECTOR_SIZE - 1, 2), (0, 2));
    }

    #[test]
    fn sector_span_near_eof() {
        let last = u64::MAX >> SECTOR_SHIFT;
        assert_eq!(sector_span(u64::MAX - 10, 100), (last, last + 1));
        assert_eq!(sector_span(0, u64::MAX), (0, last + 1));
        assert_eq!(
            sector_span(last << SECTOR_SHIFT, SECTOR_SIZE - 1),
            (last, last + 1)
        );
    }
}
