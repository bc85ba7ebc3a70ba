//! NFSv4.1 files layout driver: I/O is striped over a set of data servers.
use parking_lot::MappedMutexGuard;

use super::{
    DeviceAddr,
    DevicePayload,
    DriverError,
    LayoutBody,
    LayoutDriver,
    PnfsTryStatus,
    SegmentPayload,
};
use crate::{
    client::{LayoutHeader, LayoutSegment},
    core::{IoMode, LayoutRange, LayoutType},
    deviceid::{DeviceId, DeviceRef},
};

/// Data servers of a files layout device: `stripe_indices[i]` names the
/// entry of `data_servers` serving stripe `i`, each entry a multipath list
/// of addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesDevice {
    pub stripe_indices: Vec<u32>,
    pub data_servers: Vec<Vec<String>>,
}

struct FilesSegment {
    device: DeviceRef<DevicePayload>,
    stripe_unit: u64,
    first_stripe_index: u32,
    pattern_offset: u64,
    commit_through_mds: bool,
    filehandles: Vec<Vec<u8>>,
}

impl FilesSegment {
    fn stripe_count(&self) -> u64 {
        self.device
            .payload()
            .downcast_ref::<FilesDevice>()
            .map(|d| d.stripe_indices.len() as u64)
            .unwrap_or(1)
    }

    /// Stripe number of a file offset, relative to the pattern offset.
    fn stripe_no(&self, offset: u64) -> u64 {
        offset.saturating_sub(self.pattern_offset) / self.stripe_unit
    }

    /// Index into the stripe indices serving `offset`.
    fn stripe_index(&self, offset: u64) -> u64 {
        (self.stripe_no(offset) + self.first_stripe_index as u64)
            % self.stripe_count()
    }
}

#[derive(Debug, Default)]
pub struct FilesDriver {}

impl FilesDriver {
    fn segment(
        seg: &LayoutSegment,
    ) -> Option<MappedMutexGuard<'_, FilesSegment>> {
        seg.payload::<FilesSegment>()
    }
}

impl LayoutDriver for FilesDriver {
    fn layout_type(&self) -> LayoutType {
        LayoutType::Files
    }

    fn name(&self) -> &str {
        "filelayout"
    }

    fn alloc_segment(
        &self,
        hdr: &LayoutHeader,
        range: &LayoutRange,
        body: &LayoutBody,
    ) -> Result<SegmentPayload, DriverError> {
        let (
            deviceid,
            stripe_unit,
            first_stripe_index,
            pattern_offset,
            commit_through_mds,
            filehandles,
        ) = match body {
            LayoutBody::Files {
                deviceid,
                stripe_unit,
                first_stripe_index,
                pattern_offset,
                commit_through_mds,
                filehandles,
            } => (
                deviceid,
                *stripe_unit,
                *first_stripe_index,
                *pattern_offset,
                *commit_through_mds,
                filehandles,
            ),
            _ => {
                return Err(DriverError::WrongLayoutType {
                    layout_type: LayoutType::Files,
                })
            }
        };

        if stripe_unit == 0 {
            return Err(DriverError::BadLayout {
                reason: "zero stripe unit".to_string(),
            });
        }
        if pattern_offset > range.offset {
            return Err(DriverError::BadLayout {
                reason: format!(
                    "pattern offset {} beyond layout start {}",
                    pattern_offset, range.offset
                ),
            });
        }

        let device = hdr.get_device(deviceid)?;
        let stripes = device
            .payload()
            .downcast_ref::<FilesDevice>()
            .map(|d| d.stripe_indices.len());

        let check = match stripes {
            None => Err(format!("device {} is not a files device", deviceid)),
            Some(n) if first_stripe_index as usize >= n => Err(format!(
                "first stripe index {} out of {} stripes",
                first_stripe_index, n
            )),
            Some(n) if filehandles.len() != 1 && filehandles.len() != n => {
                Err(format!(
                    "{} filehandles for {} stripes",
                    filehandles.len(),
                    n
                ))
            }
            Some(_) => Ok(()),
        };
        if let Err(reason) = check {
            hdr.put_device(device);
            return Err(DriverError::BadLayout {
                reason,
            });
        }

        debug!(
            "{:?}: files layout {:?}, stripe unit {}, {} filehandles",
            hdr,
            range,
            stripe_unit,
            filehandles.len()
        );

        Ok(Box::new(FilesSegment {
            device,
            stripe_unit,
            first_stripe_index,
            pattern_offset,
            commit_through_mds,
            filehandles: filehandles.clone(),
        }))
    }

    fn free_segment(&self, hdr: &LayoutHeader, payload: SegmentPayload) {
        if let Ok(seg) = payload.downcast::<FilesSegment>() {
            hdr.put_device(seg.device);
        }
    }

    fn read_range(
        &self,
        seg: &LayoutSegment,
        offset: u64,
        len: u64,
    ) -> Result<PnfsTryStatus, DriverError> {
        let range = LayoutRange::new(seg.range().iomode, offset, len);
        if !seg.range().contains(&range) {
            return Err(DriverError::OutOfRange {
                range,
            });
        }
        match Self::segment(seg) {
            Some(fl) => {
                trace!(
                    "read {:?} on stripe index {} ({} filehandles)",
                    range,
                    fl.stripe_index(offset),
                    fl.filehandles.len()
                );
                Ok(PnfsTryStatus::Attempted)
            }
            None => Ok(PnfsTryStatus::NotAttempted),
        }
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
        self.read_range(seg, offset, len)
    }

    fn commit(&self, seg: &LayoutSegment) -> Result<PnfsTryStatus, DriverError> {
        match Self::segment(seg) {
            Some(fl) if !fl.commit_through_mds => Ok(PnfsTryStatus::Attempted),
            _ => Ok(PnfsTryStatus::NotAttempted),
        }
    }

    fn get_stripe_unit(&self, seg: &LayoutSegment) -> Option<u64> {
        Self::segment(seg).map(|fl| fl.stripe_unit)
    }

    /// Requests on two different stripes go to different data servers.
    fn coalesce_test(
        &self,
        seg: &LayoutSegment,
        prev_offset: u64,
        offset: u64,
    ) -> bool {
        match Self::segment(seg) {
            Some(fl) => fl.stripe_no(prev_offset) == fl.stripe_no(offset),
            None => true,
        }
    }

    fn alloc_deviceid_node(
        &self,
        id: &DeviceId,
        addr: &DeviceAddr,
    ) -> Result<DevicePayload, DriverError> {
        let (stripe_indices, data_servers) = match addr {
            DeviceAddr::Files {
                stripe_indices,
                data_servers,
            } => (stripe_indices, data_servers),
            _ => {
                return Err(DriverError::BadLayout {
                    reason: format!("device {} is not a files device", id),
                })
            }
        };

        if stripe_indices.is_empty() || data_servers.is_empty() {
            return Err(DriverError::BadLayout {
                reason: format!("device {} has no stripes", id),
            });
        }
        if let Some(bad) = stripe_indices
            .iter()
            .find(|i| **i as usize >= data_servers.len())
        {
            return Err(DriverError::BadLayout {
                reason: format!(
                    "device {}: stripe index {} out of {} data servers",
                    id,
                    bad,
                    data_servers.len()
                ),
            });
        }

        Ok(Box::new(FilesDevice {
            stripe_indices: stripe_indices.clone(),
            data_servers: data_servers.clone(),
        }))
    }
}
