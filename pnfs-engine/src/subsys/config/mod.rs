//! Configuration of the pNFS engine.
//!
//! Partial config options are supported i.e you do not have to fully
//! spell out the whole YAML for a given sub component. Serde will fill
//! in the default when missing, which are defined within the individual
//! options.
use std::{fmt::Display, fs, io::Write, path::Path};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub use opts::{ClientOpts, DeviceCacheOpts, GetOpts, ServerOpts};

pub(crate) mod opts;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to parse config file {}: {}", file, source))]
    Parse {
        source: serde_yaml::Error,
        file: String,
    },
    #[snafu(display("Failed to serialize config: {}", source))]
    Serialize { source: serde_yaml::Error },
    #[snafu(display("Failed to write config file {}: {}", file, source))]
    WriteFile {
        source: std::io::Error,
        file: String,
    },
    #[snafu(display("Invalid {} options: {}", group, reason))]
    Invalid { group: String, reason: String },
}

pub static CONFIG: OnceCell<Config> = OnceCell::new();

/// Main config structure of the engine. This structure can be persisted to
/// disk.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// location of the config file that we loaded
    pub source: Option<String>,
    /// client side layout handling
    pub client_opts: ClientOpts,
    /// server side layout table and recalls
    pub server_opts: ServerOpts,
    /// device id caches
    pub device_cache_opts: DeviceCacheOpts,
}

impl Config {
    /// initialize the config by executing F and return a reference to the
    /// initialized data
    pub fn get_or_init<F>(f: F) -> &'static Self
    where
        F: FnOnce() -> Config,
    {
        CONFIG.get_or_init(f)
    }

    /// the installed config, or the defaults if none was installed
    pub fn get() -> &'static Self {
        CONFIG.get_or_init(Config::default)
    }

    /// read the config file from disk. If the config file is empty, return the
    /// default config, but store the empty config file with in the struct to be
    /// used during saving to disk.
    pub fn read<P>(file: P) -> Result<Config, Error>
    where
        P: AsRef<Path> + Display + ToString,
    {
        debug!("loading configuration file from {}", file);
        let cfg = fs::read(&file).unwrap_or_default();
        let mut config: Config;
        // only parse the file when its not empty, otherwise
        // just store the filepath to write it out later
        if !cfg.is_empty() {
            config = serde_yaml::from_slice(&cfg).context(ParseSnafu {
                file: file.to_string(),
            })?;
        } else {
            info!("Config file {} is empty, reverting to default config", file);
            config = Config::default();
        }

        config.source = Some(file.to_string());
        config.validate()?;

        Ok(config)
    }

    /// collect current configuration snapshot into a new Config object that
    /// can be exported to a file
    pub fn refresh(&self) -> Self {
        Config {
            source: self.source.clone(),
            client_opts: self.client_opts.get(),
            server_opts: self.server_opts.get(),
            device_cache_opts: self.device_cache_opts.get(),
        }
    }

    /// write the current configuration to disk
    pub fn write<P>(&self, file: P) -> Result<(), Error>
    where
        P: AsRef<Path> + Display,
    {
        let s = serde_yaml::to_string(&self).context(SerializeSnafu)?;
        let mut f = fs::File::create(&file).context(WriteFileSnafu {
            file: file.to_string(),
        })?;
        f.write_all(s.as_bytes()).context(WriteFileSnafu {
            file: file.to_string(),
        })
    }

    /// check every option group
    pub fn validate(&self) -> Result<(), Error> {
        let groups = [
            ("client", self.client_opts.validate()),
            ("server", self.server_opts.validate()),
            ("device cache", self.device_cache_opts.validate()),
        ];
        for (group, res) in groups {
            if let Err(reason) = res {
                error!("invalid {} options: {}", group, reason);
                return Err(Error::Invalid {
                    group: group.to_string(),
                    reason,
                });
            }
        }
        debug!("{:#?}", self);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_yaml_takes_defaults() {
        let cfg: Config = serde_yaml::from_str(
            "client_opts:\n  max_cb_lrecalls: 8\nserver_opts:\n  cb_recall_retries: 1\n",
        )
        .unwrap();
        assert_eq!(cfg.client_opts.max_cb_lrecalls, 8);
        assert_eq!(
            cfg.client_opts.recall_drain_timeout_ms,
            ClientOpts::default().recall_drain_timeout_ms
        );
        assert_eq!(cfg.server_opts.cb_recall_retries, 1);
        assert_eq!(cfg.device_cache_opts, DeviceCacheOpts::default());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_yaml::from_str::<Config>("client_opts:\n  bogus: 1\n")
            .is_err());
    }

    #[test]
    fn zero_recall_bound_is_invalid() {
        let mut cfg = Config::default();
        cfg.client_opts.max_cb_lrecalls = 0;
        assert!(matches!(cfg.validate(), Err(Error::Invalid { .. })));
    }
}
