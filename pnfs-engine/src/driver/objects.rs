//! Object storage (OSD) layout driver: data is striped over groups of
//! object components, optionally mirrored.
use std::collections::HashSet;

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

/// One object of an objects layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectComponent {
    pub deviceid: DeviceId,
    pub partition_id: u64,
    pub object_id: u64,
}

/// An object storage device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsdDevice {
    pub osd_name: String,
    pub address: String,
}

struct ObjectsSegment {
    stripe_unit: u64,
    group_width: u32,
    group_depth: u32,
    mirror_cnt: u32,
    components: Vec<ObjectComponent>,
    devices: Vec<DeviceRef<DevicePayload>>,
}

impl ObjectsSegment {
    /// Number of data components in a stripe, mirrors excluded.
    fn stripe_width(&self) -> u64 {
        self.group_width as u64
    }
}

/// Checks the layout geometry against its component list.
fn check_geometry(
    stripe_unit: u64,
    group_width: u32,
    group_depth: u32,
    mirror_cnt: u32,
    ncomps: usize,
) -> Result<(), String> {
    if stripe_unit == 0 {
        return Err("zero stripe unit".to_string());
    }
    let mirrors = mirror_cnt as usize + 1;
    if ncomps == 0 || ncomps % mirrors != 0 {
        return Err(format!(
            "{} components do not divide into {} mirrors",
            ncomps, mirrors
        ));
    }
    // a group width of zero means one group spanning every component
    let width = if group_width == 0 {
        ncomps / mirrors
    } else {
        group_width as usize
    };
    if width * mirrors > ncomps || (ncomps / mirrors) % width != 0 {
        return Err(format!(
            "group width {} does not fit {} components",
            width, ncomps
        ));
    }
    if ncomps / mirrors > width && group_depth == 0 {
        return Err("several groups but a zero group depth".to_string());
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct ObjectsDriver {}

impl ObjectsDriver {
    fn segment(
        seg: &LayoutSegment,
    ) -> Option<MappedMutexGuard<'_, ObjectsSegment>> {
        seg.payload::<ObjectsSegment>()
    }

    fn check(
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
            Some(ol) => {
                trace!(
                    "{:?} over {} components, {} mirrors",
                    range,
                    ol.components.len(),
                    ol.mirror_cnt
                );
                Ok(PnfsTryStatus::Attempted)
            }
            None => Ok(PnfsTryStatus::NotAttempted),
        }
    }
}

impl LayoutDriver for ObjectsDriver {
    fn layout_type(&self) -> LayoutType {
        LayoutType::Objects
    }

    fn name(&self) -> &str {
        "objlayout"
    }

    fn alloc_segment(
        &self,
        hdr: &LayoutHeader,
        range: &LayoutRange,
        body: &LayoutBody,
    ) -> Result<SegmentPayload, DriverError> {
        let LayoutBody::Objects {
            stripe_unit,
            group_width,
            group_depth,
            mirror_cnt,
            components,
        } = body
        else {
            return Err(DriverError::WrongLayoutType {
                layout_type: LayoutType::Objects,
            });
        };

        check_geometry(
            *stripe_unit,
            *group_width,
            *group_depth,
            *mirror_cnt,
            components.len(),
        )
        .map_err(|reason| DriverError::BadLayout {
            reason,
        })?;

        let mut seen = HashSet::new();
        let mut devices = Vec::new();
        for comp in components {
            if !seen.insert(comp.deviceid) {
                continue;
            }
            match hdr.get_device(&comp.deviceid) {
                Ok(dev) => devices.push(dev),
                Err(error) => {
                    for dev in devices {
                        hdr.put_device(dev);
                    }
                    return Err(error);
                }
            }
        }

        debug!(
            "{:?}: objects layout {:?}, {} components on {} devices",
            hdr,
            range,
            components.len(),
            devices.len()
        );

        Ok(Box::new(ObjectsSegment {
            stripe_unit: *stripe_unit,
            group_width: *group_width,
            group_depth: *group_depth,
            mirror_cnt: *mirror_cnt,
            components: components.clone(),
            devices,
        }))
    }

    fn free_segment(&self, hdr: &LayoutHeader, payload: SegmentPayload) {
        if let Ok(seg) = payload.downcast::<ObjectsSegment>() {
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
        Self::check(seg, offset, len)
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
        Self::check(seg, offset, len)
    }

    fn commit(&self, _seg: &LayoutSegment) -> Result<PnfsTryStatus, DriverError> {
        Ok(PnfsTryStatus::Attempted)
    }

    fn get_stripe_unit(&self, seg: &LayoutSegment) -> Option<u64> {
        Self::segment(seg).map(|ol| ol.stripe_unit)
    }

    /// Requests may be coalesced while they stay within one full stripe.
    fn coalesce_test(
        &self,
        seg: &LayoutSegment,
        prev_offset: u64,
        offset: u64,
    ) -> bool {
        match Self::segment(seg) {
            Some(ol) => {
                let stripe = ol.stripe_unit * ol.stripe_width().max(1);
                let depth = ol.group_depth.max(1) as u64;
                prev_offset / (stripe * depth) == offset / (stripe * depth)
            }
            None => true,
        }
    }

    fn alloc_deviceid_node(
        &self,
        id: &DeviceId,
        addr: &DeviceAddr,
    ) -> Result<DevicePayload, DriverError> {
        match addr {
            DeviceAddr::Objects {
                osd_name,
                address,
            } if !osd_name.is_empty() => Ok(Box::new(OsdDevice {
                osd_name: osd_name.clone(),
                address: address.clone(),
            })),
            _ => Err(DriverError::BadLayout {
                reason: format!("device {} is not an object storage device", id),
            }),
        }
    }
}
