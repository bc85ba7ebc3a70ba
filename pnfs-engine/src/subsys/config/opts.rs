//! Option groups of the pNFS engine. Every group can be given partially in
//! the YAML config, missing fields take the defaults below, which in turn
//! can be overridden from the environment.

use std::{
    fmt::{Debug, Display},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::constants::{DEVICEID_HASH_BITS, PNFS_MAX_CB_LRECALLS};

pub trait GetOpts {
    fn get(&self) -> Self;
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Client side layout options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientOpts {
    /// use pNFS on mounts whose server advertises a known layout type
    pub pnfs_enabled: bool,
    /// bound on concurrently processed CB_LAYOUTRECALLs per client
    pub max_cb_lrecalls: usize,
    /// how long a recall or return waits for in-flight I/O to drain
    pub recall_drain_timeout_ms: u64,
}

impl Default for ClientOpts {
    fn default() -> Self {
        Self {
            pnfs_enabled: try_from_env("PNFS_ENABLED", 1) == 1,
            max_cb_lrecalls: try_from_env(
                "PNFS_MAX_CB_LRECALLS",
                PNFS_MAX_CB_LRECALLS,
            ),
            recall_drain_timeout_ms: try_from_env(
                "PNFS_RECALL_DRAIN_TIMEOUT_MS",
                30_000,
            ),
        }
    }
}

impl ClientOpts {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.recall_drain_timeout_ms)
    }
}

impl GetOpts for ClientOpts {
    fn get(&self) -> Self {
        self.clone()
    }

    fn validate(&self) -> Result<(), String> {
        if self.max_cb_lrecalls == 0 {
            return Err("max_cb_lrecalls must be at least 1".to_string());
        }
        if self.recall_drain_timeout_ms == 0 {
            return Err("recall_drain_timeout_ms must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Server side layout options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerOpts {
    /// retries of a CB_LAYOUTRECALL the client answered with DELAY
    pub cb_recall_retries: u32,
    /// pause between two such retries
    pub cb_retry_delay_ms: u64,
    /// upper bound on layout records and recalls held at once
    pub max_layout_records: usize,
}

impl Default for ServerOpts {
    fn default() -> Self {
        Self {
            cb_recall_retries: try_from_env("PNFSD_CB_RECALL_RETRIES", 3),
            cb_retry_delay_ms: try_from_env("PNFSD_CB_RETRY_DELAY_MS", 10),
            max_layout_records: try_from_env(
                "PNFSD_MAX_LAYOUT_RECORDS",
                65536,
            ),
        }
    }
}

impl ServerOpts {
    pub fn cb_retry_delay(&self) -> Duration {
        Duration::from_millis(self.cb_retry_delay_ms)
    }
}

impl GetOpts for ServerOpts {
    fn get(&self) -> Self {
        self.clone()
    }
}

/// Device id cache options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceCacheOpts {
    /// log2 of the number of hash buckets
    pub hash_bits: u32,
}

impl Default for DeviceCacheOpts {
    fn default() -> Self {
        Self {
            hash_bits: try_from_env("PNFS_DEVICEID_HASH_BITS", DEVICEID_HASH_BITS),
        }
    }
}

impl GetOpts for DeviceCacheOpts {
    fn get(&self) -> Self {
        self.clone()
    }

    fn validate(&self) -> Result<(), String> {
        if self.hash_bits > 16 {
            return Err(format!("hash_bits {} is too large", self.hash_bits));
        }
        Ok(())
    }
}

/// try to read an env variable or returns the default when not found
pub(crate) fn try_from_env<T>(name: &str, default: T) -> T
where
    T: FromStr + Display + Copy,
    <T as FromStr>::Err: Debug + Display,
{
    std::env::var(name).map_or_else(
        |_| default,
        |v| match v.parse::<T>() {
            Ok(val) => {
                info!("Overriding {} value to '{}'", name, val);
                val
            }
            Err(e) => {
                error!(
                    "Invalid value: {} (error {}) specified for {}. Reverting to default value ({})",
                    v, e, name, default
                );
                default
            }
        },
    )
}
