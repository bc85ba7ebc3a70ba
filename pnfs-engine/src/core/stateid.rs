use std::fmt::{Debug, Formatter};

use crate::constants::NFS4_STATEID_OTHER_SIZE;

/// Returns true if sequence id `a` is ahead of `b`. The comparison is done
/// on the signed 32-bit difference so it keeps working across wraparound.
pub fn seqid_is_newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// An NFSv4 stateid: a sequence number plus an opaque identifier.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Stateid {
    pub seqid: u32,
    pub other: [u8; NFS4_STATEID_OTHER_SIZE],
}

impl Debug for Stateid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.seqid, hex::encode(self.other))
    }
}

impl Stateid {
    pub fn new(seqid: u32, other: [u8; NFS4_STATEID_OTHER_SIZE]) -> Self {
        Self {
            seqid,
            other,
        }
    }

    /// A fresh stateid with a random opaque part and sequence id 1.
    pub fn generate() -> Self {
        let mut other = [0u8; NFS4_STATEID_OTHER_SIZE];
        other.copy_from_slice(
            &uuid::Uuid::new_v4().as_bytes()[.. NFS4_STATEID_OTHER_SIZE],
        );
        Self::new(1, other)
    }

    /// Same opaque part, i.e. both refer to the same state.
    pub fn same_state(&self, other: &Stateid) -> bool {
        self.other == other.other
    }

    /// Advances the sequence id, skipping zero on wrap.
    pub fn bump(&mut self) {
        self.seqid = self.seqid.wrapping_add(1);
        if self.seqid == 0 {
            self.seqid = 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn seqid_ordering() {
        assert!(seqid_is_newer(2, 1));
        assert!(!seqid_is_newer(1, 1));
        assert!(!seqid_is_newer(1, 2));
        assert!(seqid_is_newer(1, 0xFFFF_FFFF));
        assert!(!seqid_is_newer(0xFFFF_FFFF, 1));
    }

    #[test]
    fn bump_skips_zero() {
        let mut s = Stateid::new(0xFFFF_FFFF, [0; 12]);
        s.bump();
        assert_eq!(s.seqid, 1);
        s.bump();
        assert_eq!(s.seqid, 2);
    }
}
