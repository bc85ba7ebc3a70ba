/// Length value meaning "up to the end of the file".
pub const NFS4_MAX_UINT64: u64 = u64::MAX;

/// Size of an opaque NFSv4.1 device identifier.
pub const NFS4_DEVICEID4_SIZE: usize = 16;

/// Size of the opaque part of a stateid.
pub const NFS4_STATEID_OTHER_SIZE: usize = 12;

/// Block layout addresses are expressed in 512-byte sectors.
pub const SECTOR_SHIFT: u32 = 9;
pub const SECTOR_SIZE: u64 = 1 << SECTOR_SHIFT;

/// Default bound on concurrently processed CB_LAYOUTRECALLs per client.
pub const PNFS_MAX_CB_LRECALLS: usize = 64;

/// Number of hash bits used by the superblock id table.
pub const SBID_HASH_BITS: u32 = 8;
pub const SBID_HASH_SIZE: usize = 1 << SBID_HASH_BITS;
pub const SBID_HASH_MASK: u64 = (SBID_HASH_SIZE as u64) - 1;

/// Default number of hash bits of a device id cache.
pub const DEVICEID_HASH_BITS: u32 = 5;
