//! Runtime configuration, read from a TOML file.
//!
//! ```toml
//! [global]
//! engine = "smtpd"
//! queue_dir = "/var/spool/spmfilter"
//! modules = ["clamav", "spamassassin"]
//! module_fail = 3
//! nexthop = "localhost:10026"
//!
//! [smtpd]
//! bind_port = 10025
//! nexthop_fail_code = 451
//! 552 = "Message rejected"
//!
//! [lookup.users."user@example.com"]
//! quota = "1G"
//! ```

use std::{
    collections::BTreeMap,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{internal, status::Status};

/// Where the configuration is read from when nothing else is given.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/spmfilter.conf";

/// Codes that may carry a custom reply text.
const OVERRIDABLE_CODES: core::ops::RangeInclusive<u32> = 401..=599;

#[derive(Debug, Error)]
pub enum Error {
    /// The configuration file could not be read.
    #[error("Failed to read config from {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid.
    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// The front-end that feeds messages into the pipeline.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Smtpd,
    Pipe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Global {
    #[serde(default)]
    pub engine: Engine,

    #[serde(default)]
    pub debug: bool,

    /// Directory holding spool files while they are processed.
    #[serde(default = "defaults::queue_dir")]
    pub queue_dir: PathBuf,

    /// Filter modules, run in this order.
    #[serde(default)]
    pub modules: Vec<String>,

    /// Directory native modules are loaded from; the dynamic loader's search
    /// path is used when unset.
    #[serde(default)]
    pub module_dir: Option<PathBuf>,

    /// What to do when a module fails: 1 carries on, 2 rejects permanently,
    /// 3 rejects temporarily.
    #[serde(default = "defaults::module_fail")]
    pub module_fail: u8,

    /// A file path, or `host[:port]` of an SMTP relay.
    #[serde(default)]
    pub nexthop: Option<String>,

    /// Seconds to wait on each relay round trip.
    #[serde(default = "defaults::nexthop_timeout_secs")]
    pub nexthop_timeout: u64,

    /// Add an `X-Spmfilter` trace header listing the modules that ran.
    #[serde(default)]
    pub add_header: bool,

    /// Largest message accepted, in bytes. 0 means unlimited.
    #[serde(default)]
    pub max_size: u64,
}

impl Default for Global {
    fn default() -> Self {
        Self {
            engine: Engine::default(),
            debug: false,
            queue_dir: defaults::queue_dir(),
            modules: Vec::default(),
            module_dir: None,
            module_fail: defaults::module_fail(),
            nexthop: None,
            nexthop_timeout: defaults::nexthop_timeout_secs(),
            add_header: false,
            max_size: 0,
        }
    }
}

impl Global {
    pub const fn nexthop_timeout(&self) -> Duration {
        Duration::from_secs(self.nexthop_timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Smtpd {
    #[serde(default = "defaults::bind_ip")]
    pub bind_ip: IpAddr,

    #[serde(default = "defaults::bind_port")]
    pub bind_port: u16,

    /// Number of connections handled at the same time.
    #[serde(default = "defaults::workers")]
    pub workers: usize,

    /// Seconds a client may stay idle before it is disconnected.
    #[serde(default = "defaults::timeout_secs")]
    pub timeout: u64,

    #[serde(default = "defaults::nexthop_fail_code")]
    pub nexthop_fail_code: u32,

    #[serde(default = "defaults::nexthop_fail_msg")]
    pub nexthop_fail_msg: String,

    /// Custom reply texts, keyed by reply code.
    #[serde(flatten)]
    pub codes: BTreeMap<String, String>,
}

impl Default for Smtpd {
    fn default() -> Self {
        Self {
            bind_ip: defaults::bind_ip(),
            bind_port: defaults::bind_port(),
            workers: defaults::workers(),
            timeout: defaults::timeout_secs(),
            nexthop_fail_code: defaults::nexthop_fail_code(),
            nexthop_fail_msg: defaults::nexthop_fail_msg(),
            codes: BTreeMap::default(),
        }
    }
}

impl Smtpd {
    pub const fn socket(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.bind_port)
    }

    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Settings for the built-in lookup backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Lookup {
    /// Known users, keyed by address.
    #[serde(default)]
    pub users: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub global: Global,

    #[serde(default)]
    pub smtpd: Smtpd,

    #[serde(default)]
    pub lookup: Lookup,
}

impl Settings {
    /// Read and parse the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid
    /// configuration.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let settings = Self::parse(&content)?;
        internal!(
            level = DEBUG,
            "Loaded configuration from {}: {settings:?}",
            path.display()
        );

        Ok(settings)
    }

    /// Parse a configuration from its TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid configuration.
    pub fn parse(content: &str) -> Result<Self, Error> {
        let mut settings: Self = toml::from_str(content)?;

        settings.smtpd.codes.retain(|key, _| {
            let keep = key
                .parse::<u32>()
                .is_ok_and(|code| OVERRIDABLE_CODES.contains(&code));
            if !keep {
                internal!(level = WARN, "Ignoring unknown smtpd setting {key}");
            }
            keep
        });

        Ok(settings)
    }

    /// The reply text configured for `status`, if any.
    pub fn reply_text(&self, status: Status) -> Option<&str> {
        self.smtpd
            .codes
            .get(&u32::from(status).to_string())
            .map(String::as_str)
    }
}

mod defaults {
    use std::{
        net::{IpAddr, Ipv4Addr},
        path::PathBuf,
    };

    pub fn queue_dir() -> PathBuf {
        PathBuf::from("/var/spool/spmfilter")
    }

    pub const fn module_fail() -> u8 {
        3
    }

    pub const fn nexthop_timeout_secs() -> u64 {
        30
    }

    pub const fn bind_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    pub const fn bind_port() -> u16 {
        10025
    }

    pub const fn workers() -> usize {
        4
    }

    pub const fn timeout_secs() -> u64 {
        300 // 5 minutes
    }

    pub const fn nexthop_fail_code() -> u32 {
        451
    }

    pub fn nexthop_fail_msg() -> String {
        String::from("Requested action aborted: local error in processing")
    }
}

#[cfg(test)]
mod test {
    use std::net::{IpAddr, Ipv4Addr};

    use pretty_assertions::assert_eq;

    use crate::status::Status;

    use super::{Engine, Settings};

    #[test]
    fn defaults() {
        let settings = Settings::parse("").expect("empty config");

        assert_eq!(settings.global.engine, Engine::Smtpd);
        assert_eq!(settings.global.module_fail, 3);
        assert_eq!(
            settings.global.queue_dir.to_str(),
            Some("/var/spool/spmfilter")
        );
        assert_eq!(settings.global.max_size, 0);
        assert!(settings.global.nexthop.is_none());
        assert!(!settings.global.add_header);
        assert_eq!(settings.smtpd.bind_ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(settings.smtpd.nexthop_fail_code, 451);
        assert_eq!(
            settings.smtpd.nexthop_fail_msg,
            "Requested action aborted: local error in processing"
        );
    }

    #[test]
    fn full() {
        let settings = Settings::parse(
            r#"
            [global]
            engine = "pipe"
            queue_dir = "/tmp/queue"
            modules = ["first", "second"]
            module_fail = 1
            nexthop = "relay.example.com:2525"
            add_header = true
            max_size = 1024

            [smtpd]
            bind_port = 2525
            workers = 8
            552 = "Too big"
            250 = "Never used"
            hostname = "unknown"

            [lookup.users."user@example.com"]
            quota = "1G"
            "#,
        )
        .expect("valid config");

        assert_eq!(settings.global.engine, Engine::Pipe);
        assert_eq!(settings.global.modules, vec!["first", "second"]);
        assert_eq!(settings.global.module_fail, 1);
        assert_eq!(
            settings.global.nexthop.as_deref(),
            Some("relay.example.com:2525")
        );
        assert!(settings.global.add_header);
        assert_eq!(settings.global.max_size, 1024);
        assert_eq!(settings.smtpd.socket().port(), 2525);
        assert_eq!(settings.smtpd.workers, 8);
        assert_eq!(settings.smtpd.codes.len(), 1);
        assert_eq!(settings.reply_text(Status::ExceededStorage), Some("Too big"));
        assert_eq!(settings.reply_text(Status::Ok), None);
        assert_eq!(
            settings.lookup.users["user@example.com"]["quota"],
            String::from("1G")
        );
    }

    #[test]
    fn invalid() {
        assert!(Settings::parse("[global]\nmodule_fail = \"often\"").is_err());
    }
}
