//! Decoding and verification of the extent list of a block LAYOUTGET reply.
//!
//! The list is checked as a whole before anything is inserted. Three cursors
//! are tracked, all in sectors: `start`, the next expected non copy-on-write
//! offset; `inval`, how far READ extents may start (they must not begin
//! before INVALID coverage they would back); `cowread`, the end of the copy
//! on write READ coverage seen so far.
use super::{extents::Extent, BlockExtentDesc, ExtentError, ExtentState};
use crate::{
    constants::{NFS4_MAX_UINT64, SECTOR_SHIFT, SECTOR_SIZE},
    core::{IoMode, LayoutRange},
};

#[derive(Debug)]
struct LayoutVerification {
    mode: IoMode,
    start: u64,
    inval: u64,
    cowread: u64,
}

impl LayoutVerification {
    fn new(mode: IoMode, start: u64) -> Self {
        Self {
            mode,
            start,
            inval: start,
            cowread: start,
        }
    }

    fn verify(
        &mut self,
        state: ExtentState,
        offset: u64,
        length: u64,
    ) -> Result<(), ExtentError> {
        if self.mode == IoMode::Read {
            if state.is_rw_class() {
                return Err(ExtentError::BadState {
                    state,
                    iomode: self.mode,
                });
            }
            if offset != self.start {
                return Err(ExtentError::NotContiguous {
                    offset,
                    expected: self.start,
                });
            }
            self.start += length;
            return Ok(());
        }

        match state {
            ExtentState::ReadWrite => {
                if offset != self.start {
                    return Err(ExtentError::NotContiguous {
                        offset,
                        expected: self.start,
                    });
                }
                if self.cowread > self.start {
                    return Err(ExtentError::UncoveredCow {
                        cowread: self.cowread,
                    });
                }
                self.start += length;
                self.inval = self.start;
            }
            ExtentState::Invalid => {
                if offset != self.start {
                    return Err(ExtentError::NotContiguous {
                        offset,
                        expected: self.start,
                    });
                }
                self.start += length;
            }
            ExtentState::Read => {
                // copy-on-write source: may start behind `start`, inside
                // INVALID coverage that is not written yet
                if offset > self.start {
                    return Err(ExtentError::NotContiguous {
                        offset,
                        expected: self.start,
                    });
                }
                if offset < self.inval || offset < self.cowread {
                    return Err(ExtentError::MisplacedCow {
                        offset,
                    });
                }
                self.inval = self.inval.saturating_add(length);
                self.cowread = offset + length;
            }
            ExtentState::None => {
                return Err(ExtentError::BadState {
                    state,
                    iomode: self.mode,
                });
            }
        }
        Ok(())
    }

    fn finish(&self, range: &LayoutRange) -> Result<(), ExtentError> {
        if range.length != NFS4_MAX_UINT64 {
            let expected = range.end() >> SECTOR_SHIFT;
            if self.start != expected {
                return Err(ExtentError::LengthMismatch {
                    end: self.start,
                    expected,
                });
            }
        }
        if self.start < self.cowread {
            return Err(ExtentError::UncoveredCow {
                cowread: self.cowread,
            });
        }
        Ok(())
    }
}

fn to_sectors(bytes: u64) -> Result<u64, ExtentError> {
    if bytes % SECTOR_SIZE != 0 {
        return Err(ExtentError::Unaligned {
            offset: bytes,
        });
    }
    Ok(bytes >> SECTOR_SHIFT)
}

/// Converts the byte-addressed extents of a LAYOUTGET reply for `range` into
/// sector-addressed extents, rejecting the whole list on the first
/// violation. No extent is built before the whole list has been checked.
pub(super) fn decode_extents(
    range: &LayoutRange,
    descs: &[BlockExtentDesc],
) -> Result<Vec<Extent>, ExtentError> {
    let mut lv = LayoutVerification::new(range.iomode, to_sectors(range.offset)?);
    let mut sectors = Vec::with_capacity(descs.len());

    for desc in descs {
        if desc.length == 0 {
            return Err(ExtentError::ZeroLength {
                offset: desc.file_offset,
            });
        }
        let file_offset = to_sectors(desc.file_offset)?;
        let length = to_sectors(desc.length)?;
        let volume_offset = to_sectors(desc.storage_offset)?;
        if file_offset.checked_add(length).is_none() {
            return Err(ExtentError::Overflow {
                offset: desc.file_offset,
            });
        }

        if let Err(error) = lv.verify(desc.state, file_offset, length) {
            warn!("bad block layout extent {:?}: {}", desc, error);
            return Err(error);
        }
        sectors.push((desc, file_offset, length, volume_offset));
    }

    lv.finish(range)?;
    Ok(sectors
        .into_iter()
        .map(|(desc, file_offset, length, volume_offset)| {
            Extent::new(
                file_offset,
                length,
                volume_offset,
                desc.state,
                desc.deviceid,
            )
        })
        .collect())
}
