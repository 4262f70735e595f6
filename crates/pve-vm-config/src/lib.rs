// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for talking to a Proxmox VE cluster.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub endpoint: Endpoint,

    #[serde(default)]
    pub shell: Shell,

    #[serde(default)]
    pub timeouts: Timeouts,
}

/// The management API endpoint.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Endpoint {
    /// Base URL of the API, e.g. `https://pve.example.com:8006/api2/json`.
    pub url: String,

    /// Node VMs are created on and addressed through.
    pub node: String,

    /// API token, in the `USER@REALM!TOKENID=SECRET` form.
    pub token: Option<String>,

    /// Accept self-signed certificates.
    pub insecure: bool,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            url: "https://localhost:8006/api2/json".to_string(),
            node: "pve".to_string(),
            token: None,
            insecure: false,
        }
    }
}

/// How shell commands are run on a node (used for disk imports).
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Shell {
    pub user: String,

    /// Host to connect to. Defaults to the node name.
    pub host: Option<String>,

    pub port: u16,

    pub identity_file: Option<PathBuf>,
}

impl Default for Shell {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            host: None,
            port: 22,
            identity_file: None,
        }
    }
}

/// A bounded, fixed-interval wait.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    /// Wall-clock budget, in seconds.
    pub timeout: u64,

    /// Delay between polls, in seconds.
    pub interval: u64,
}

impl PollPolicy {
    pub const fn new(timeout: u64, interval: u64) -> Self {
        Self { timeout, interval }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

/// Timeouts for the lifecycle operations.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Timeouts {
    /// Timeout passed along with a shutdown request, in seconds.
    pub shutdown: u32,

    /// Timeout passed along with a reboot request, in seconds.
    pub reboot: u32,

    /// Wait for a started VM to report `running`.
    pub start: PollPolicy,

    /// Wait for a shut down VM to report `stopped`.
    pub stop: PollPolicy,

    /// Wait for the guest agent to publish network interfaces.
    pub agent: PollPolicy,

    /// Wait for the guest agent to withdraw its interfaces after a reboot.
    pub agent_gone: PollPolicy,

    /// Wait for a deleted VM to disappear.
    pub delete: PollPolicy,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            shutdown: 300,
            reboot: 300,
            start: PollPolicy::new(120, 5),
            stop: PollPolicy::new(30, 5),
            agent: PollPolicy::new(1800, 5),
            agent_gone: PollPolicy::new(300, 5),
            delete: PollPolicy::new(60, 2),
        }
    }
}

/// Errors which may be returned when parsing the configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_can_be_serialized_as_toml() {
        let dummy_config = Config::default();
        let serialized = toml::ser::to_string(&dummy_config).unwrap();
        let deserialized: Config = toml::de::from_str(&serialized).unwrap();
        assert_eq!(dummy_config, deserialized);
    }

    #[test]
    fn parse_partial_config() {
        let raw = r#"
[endpoint]
url = "https://pve1.lab:8006/api2/json"
node = "pve1"
token = "automation@pve!ci=0000"
insecure = true

[shell]
host = "10.0.0.10"

[timeouts]
shutdown = 60
start = { timeout = 30, interval = 1 }
"#;
        let cfg: Config = toml::de::from_str(raw).unwrap();

        assert_eq!(cfg.endpoint.node, "pve1");
        assert!(cfg.endpoint.insecure);
        assert_eq!(cfg.shell.user, "root");
        assert_eq!(cfg.shell.host.as_deref(), Some("10.0.0.10"));
        assert_eq!(cfg.shell.port, 22);
        assert_eq!(cfg.timeouts.shutdown, 60);
        assert_eq!(cfg.timeouts.start.timeout(), Duration::from_secs(30));
        assert_eq!(cfg.timeouts.start.interval(), Duration::from_secs(1));
        // untouched entries keep their defaults
        assert_eq!(cfg.timeouts.delete, PollPolicy::new(60, 2));
        assert_eq!(cfg.timeouts.reboot, 300);
    }

    #[test]
    fn parse_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[endpoint]\nnode = \"edge\"").unwrap();
        let cfg = parse(file.path()).unwrap();
        assert_eq!(cfg.endpoint.node, "edge");
        assert_eq!(cfg.timeouts, Timeouts::default());

        assert!(matches!(
            parse(file.path().with_extension("missing")),
            Err(ParseError::Io(_))
        ));
    }

    #[test]
    fn bad_toml_is_reported() {
        let err = toml::de::from_str::<Config>("[timeouts]\nstart = 5\n");
        assert!(err.is_err());
    }
}
