//!
//! The pNFS subsystem owns the process wide registries: the layout driver
//! registry and the superblock id table. They exist between `start` and
//! `stop`; nothing else in the crate reaches for a global.
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use snafu::Snafu;

pub use config::Config;

use crate::{
    driver::LayoutDriverRegistry,
    server::{LayoutServer, SbidTable},
};

pub mod config;

static PNFS_SUBSYS: Lazy<RwLock<Option<Arc<PnfsSubsystem>>>> =
    Lazy::new(|| RwLock::new(None));

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SubsysError {
    #[snafu(display("pNFS subsystem is already running"))]
    AlreadyStarted {},
    #[snafu(display("pNFS subsystem is not running"))]
    NotStarted {},
    #[snafu(display("Invalid configuration: {}", source))]
    BadConfig { source: config::Error },
}

#[derive(Debug)]
pub struct PnfsSubsystem {
    config: Config,
    drivers: Arc<LayoutDriverRegistry>,
    sbids: Arc<SbidTable>,
}

impl PnfsSubsystem {
    /// Builds the registries from `config` and installs the subsystem.
    pub fn start(config: Config) -> Result<Arc<Self>, SubsysError> {
        config
            .validate()
            .map_err(|source| SubsysError::BadConfig {
                source,
            })?;

        let mut slot = PNFS_SUBSYS.write();
        if slot.is_some() {
            return Err(SubsysError::AlreadyStarted {});
        }

        debug!("pnfs subsystem init");
        let subsys = Arc::new(Self {
            config,
            drivers: Arc::new(LayoutDriverRegistry::with_defaults()),
            sbids: Arc::new(SbidTable::new()),
        });
        *slot = Some(subsys.clone());
        info!(
            "pnfs subsystem started with {} layout drivers",
            subsys.drivers.len()
        );
        Ok(subsys)
    }

    /// Tears the registries down. Components built from them keep their
    /// own references and stay usable until dropped.
    pub fn stop() -> Result<(), SubsysError> {
        let subsys = PNFS_SUBSYS
            .write()
            .take()
            .ok_or(SubsysError::NotStarted {})?;
        debug!("pnfs subsystem fini");
        subsys.sbids.clear();
        Ok(())
    }

    /// The running subsystem, None before `start` or after `stop`.
    pub fn get() -> Option<Arc<Self>> {
        PNFS_SUBSYS.read().clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn drivers(&self) -> &Arc<LayoutDriverRegistry> {
        &self.drivers
    }

    pub fn sbids(&self) -> &Arc<SbidTable> {
        &self.sbids
    }

    /// A layout server using the subsystem's superblock id table.
    pub fn layout_server(&self) -> LayoutServer {
        LayoutServer::new(self.config.server_opts.clone(), self.sbids.clone())
    }

    /// Writes the configuration back to the file it was read from.
    pub fn export_config(&self) -> Result<(), config::Error> {
        match self.config.source.as_ref() {
            Some(target) => self.config.refresh().write(target),
            None => {
                warn!("request to save config file but no source file was given");
                Ok(())
            }
        }
    }
}
