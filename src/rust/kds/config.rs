// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    limits,
};
use ::std::{
    fs::File,
    io::Read,
    ops::Index,
    str::FromStr,
    time::Duration,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Scheduler options.
mod kds_config {
    pub const SECTION_NAME: &str = "kds";
    // Spawn a dedicated scheduler thread on first attach.
    pub const WORKER_THREAD: &str = "worker_thread";
    // Scheduler loops between cooperative yields.
    pub const YIELD_INTERVAL: &str = "yield_interval";
    // Device stop.
    pub const STOP_RETRIES: &str = "stop_retries";
    pub const STOP_INTERVAL_MS: &str = "stop_interval_ms";
    pub const FLUSH_WAIT_MS: &str = "flush_wait_ms";
    // Client teardown.
    pub const CLIENT_POLL_MS: &str = "client_poll_ms";
    pub const CLIENT_TIMEOUT_LOOPS: &str = "client_timeout_loops";
    // Upper bound on the command queue a device may use, in bytes.
    pub const CQ_SIZE: &str = "cq_size";
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Scheduler configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

/// Validated scheduler settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tunables {
    pub worker_thread: bool,
    pub yield_interval: usize,
    pub stop_retries: usize,
    pub stop_interval: Duration,
    pub flush_wait: Duration,
    pub client_poll: Duration,
    pub client_timeout_loops: usize,
    pub cq_size: usize,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let mut config_s: String = String::new();
        File::open(config_path)?.read_to_string(&mut config_s)?;
        Self::from_str(&config_s)
    }

    /// Parses a configuration held in memory.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let cause: String = format!("malformed configuration: {:?}", e);
                error!("from_str(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let config_obj: &Yaml = match &config[..] {
            [c] => c,
            _ => return Err(Fail::new(libc::EINVAL, "Wrong number of config objects")),
        };

        Ok(Self(config_obj.clone()))
    }

    /// Reads every option, falling back to defaults for the ones that are not set.
    pub fn tunables(&self) -> Result<Tunables, Fail> {
        let defaults: Tunables = Tunables::default();
        let tunables: Tunables = Tunables {
            worker_thread: self.flag(kds_config::WORKER_THREAD, defaults.worker_thread)?,
            yield_interval: self.count(kds_config::YIELD_INTERVAL, defaults.yield_interval)?,
            stop_retries: self.count(kds_config::STOP_RETRIES, defaults.stop_retries)?,
            stop_interval: self.millis(kds_config::STOP_INTERVAL_MS, defaults.stop_interval)?,
            flush_wait: self.millis(kds_config::FLUSH_WAIT_MS, defaults.flush_wait)?,
            client_poll: self.millis(kds_config::CLIENT_POLL_MS, defaults.client_poll)?,
            client_timeout_loops: self.count(kds_config::CLIENT_TIMEOUT_LOOPS, defaults.client_timeout_loops)?,
            cq_size: self.count(kds_config::CQ_SIZE, defaults.cq_size)?,
        };

        if tunables.yield_interval == 0 {
            let cause: String = format!("parameter \"{}\" must be positive", kds_config::YIELD_INTERVAL);
            error!("tunables(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        // Room for one word per slot at the least.
        if tunables.cq_size < limits::MAX_SLOTS * 4 || tunables.cq_size % 4 != 0 {
            let cause: String = format!("invalid command queue size ({:#x})", tunables.cq_size);
            error!("tunables(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        debug!("tunables(): {:?}", tunables);
        Ok(tunables)
    }

    /// The `kds` section, if the document has one.
    fn kds_section(&self) -> Result<Option<&Yaml>, Fail> {
        let section: &Yaml = self.0.index(kds_config::SECTION_NAME);
        match section {
            Yaml::BadValue => Ok(None),
            Yaml::Hash(_) => Ok(Some(section)),
            _ => {
                let cause: String = format!("section \"{}\" is not a mapping", kds_config::SECTION_NAME);
                error!("kds_section(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }

    /// Value of option `key`. The upper-case environment variable wins over the `kds` section.
    fn lookup<T: FromStr>(&self, key: &str, read: fn(&Yaml) -> Option<T>) -> Result<Option<T>, Fail> {
        let var: String = key.to_uppercase();
        if let Ok(value) = ::std::env::var(&var) {
            return match value.parse::<T>() {
                Ok(value) => Ok(Some(value)),
                Err(_) => {
                    let cause: String = format!("environment variable {} has unexpected type", var);
                    error!("lookup(): {}", cause);
                    Err(Fail::new(libc::EINVAL, &cause))
                },
            };
        }
        let section: &Yaml = match self.kds_section()? {
            Some(section) => section,
            None => return Ok(None),
        };
        match section.index(key) {
            Yaml::BadValue => Ok(None),
            value => match read(value) {
                Some(value) => Ok(Some(value)),
                None => {
                    let cause: String = format!("parameter \"{}\" has unexpected type", key);
                    error!("lookup(): {}", cause);
                    Err(Fail::new(libc::EINVAL, &cause))
                },
            },
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, Fail> {
        Ok(self.lookup(key, Yaml::as_bool)?.unwrap_or(default))
    }

    /// Integer option `key`, checked against the range of `T`.
    fn count<T: TryFrom<i64>>(&self, key: &str, default: T) -> Result<T, Fail> {
        let value: i64 = match self.lookup(key, Yaml::as_i64)? {
            Some(value) => value,
            None => return Ok(default),
        };
        match T::try_from(value) {
            Ok(value) => Ok(value),
            Err(_) => {
                let cause: String = format!("parameter \"{}\" is out of range ({:?})", key, value);
                error!("count(): {}", cause);
                Err(Fail::new(libc::ERANGE, &cause))
            },
        }
    }

    /// Duration option expressed in milliseconds.
    fn millis(&self, key: &str, default: Duration) -> Result<Duration, Fail> {
        let millis: u64 = self.count(key, default.as_millis() as u64)?;
        Ok(Duration::from_millis(millis))
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Tunables {
    fn default() -> Self {
        Self {
            worker_thread: true,
            yield_interval: 8,
            stop_retries: 20,
            stop_interval: Duration::from_millis(100),
            flush_wait: Duration::from_millis(1000),
            client_poll: Duration::from_millis(500),
            client_timeout_loops: 20,
            cq_size: limits::ERT_CQ_SIZE,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ::anyhow::Result;

    #[test]
    fn missing_section_yields_defaults() -> Result<()> {
        let config: Config = Config::from_str("other:\n  key: 1\n")?;
        crate::ensure_eq!(config.tunables()?, Tunables::default());
        Ok(())
    }

    #[test]
    fn section_overrides_defaults() -> Result<()> {
        let config: Config = Config::from_str(
            "kds:\n  worker_thread: false\n  yield_interval: 4\n  stop_interval_ms: 5\n  cq_size: 0x8000\n",
        )?;
        let tunables: Tunables = config.tunables()?;
        crate::ensure_eq!(tunables.worker_thread, false);
        crate::ensure_eq!(tunables.yield_interval, 4);
        crate::ensure_eq!(tunables.stop_interval, Duration::from_millis(5));
        crate::ensure_eq!(tunables.cq_size, 0x8000);
        crate::ensure_eq!(tunables.stop_retries, 20);
        Ok(())
    }

    #[test]
    fn bad_values_are_rejected() -> Result<()> {
        let wrong_type: Config = Config::from_str("kds:\n  stop_retries: many\n")?;
        match wrong_type.tunables() {
            Err(e) if e.errno == libc::EINVAL => (),
            other => anyhow::bail!("expected EINVAL, got {:?}", other),
        }

        let negative: Config = Config::from_str("kds:\n  client_timeout_loops: -1\n")?;
        match negative.tunables() {
            Err(e) if e.errno == libc::ERANGE => (),
            other => anyhow::bail!("expected ERANGE, got {:?}", other),
        }

        let zero_yield: Config = Config::from_str("kds:\n  yield_interval: 0\n")?;
        crate::ensure_eq!(zero_yield.tunables().is_err(), true);

        let section: Config = Config::from_str("kds: 3\n")?;
        crate::ensure_eq!(section.tunables().is_err(), true);
        Ok(())
    }

    #[test]
    fn environment_wins_over_section() -> Result<()> {
        // Keys no other test reads, the environment is shared by the whole test binary.
        ::std::env::set_var("KDS_TEST_LOOPS", "12");
        ::std::env::set_var("KDS_TEST_BROKEN", "twelve");
        let config: Config = Config::from_str("kds:\n  kds_test_loops: 3\n  kds_test_unset: 4\n")?;
        crate::ensure_eq!(config.count::<usize>("kds_test_loops", 0)?, 12);
        crate::ensure_eq!(config.count::<usize>("kds_test_unset", 0)?, 4);
        crate::ensure_eq!(config.count::<usize>("kds_test_absent", 9)?, 9);
        match config.count::<usize>("kds_test_broken", 0) {
            Err(e) if e.errno == libc::EINVAL => (),
            other => anyhow::bail!("expected EINVAL, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn single_document_required() -> Result<()> {
        crate::ensure_eq!(Config::from_str("a: 1\n---\nb: 2\n").is_err(), true);
        crate::ensure_eq!(Config::from_str("").is_err(), true);
        Ok(())
    }
}
