//! Startup configuration: the hand-parsed CLI surface and the transport
//! tunables taken from the environment.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable holding a TOML document with transport tunables.
pub const CONFIG_ENV: &str = "LOSSIM_CONFIG";

/// Startup errors. Each one is fatal: the binary prints it with the usage
/// string and exits non-zero.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Usage(String),
    #[error("invalid LOSSIM_CONFIG: {0}")]
    Config(#[from] toml::de::Error),
    #[error("invalid LOSSIM_CONFIG: {0}")]
    BadValue(&'static str),
}

fn usage<T>(msg: impl Into<String>) -> Result<T, Error> {
    Err(Error::Usage(msg.into()))
}

/// Identity and neighborhood of one node, straight from the command line:
/// `<port> (<neighbor-port> <loss-rate>)+ [last]`.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    /// UDP port this node binds on loopback; also its network-wide name.
    pub port: u16,
    /// Loss rate of the link from each neighbor, keyed by neighbor port.
    pub neighbors: BTreeMap<u16, f64>,
    /// Whether this node opens the distance-vector exchange at startup.
    pub last: bool,
}

impl NodeConfig {
    /// Parses the command-line arguments after the binary name.
    pub fn parse(args: impl IntoIterator<Item = String>) -> Result<Self, Error> {
        let args: Vec<String> = args.into_iter().collect();
        let (args, last) = match args.last().map(String::as_str) {
            Some("last") => (&args[..args.len() - 1], true),
            _ => (&args[..], false),
        };
        let Some(port) = args.first() else {
            return usage("missing node port");
        };
        let port = parse_port(port)?;

        let pairs = &args[1..];
        if pairs.is_empty() {
            return usage("at least one <neighbor-port> <loss-rate> pair is required");
        }
        if pairs.len() % 2 != 0 {
            return usage("neighbors come in <neighbor-port> <loss-rate> pairs");
        }
        let mut neighbors = BTreeMap::new();
        for pair in pairs.chunks(2) {
            let neighbor = parse_port(&pair[0])?;
            if neighbor == port {
                return usage(format!("node {port} cannot neighbor itself"));
            }
            let rate: f64 = match pair[1].parse() {
                Ok(rate) if (0.0..1.0).contains(&rate) => rate,
                _ => return usage(format!("loss rate {:?} is not in [0, 1)", pair[1])),
            };
            if neighbors.insert(neighbor, rate).is_some() {
                return usage(format!("duplicate neighbor port {neighbor}"));
            }
        }
        Ok(NodeConfig {
            port,
            neighbors,
            last,
        })
    }
}

fn parse_port(s: &str) -> Result<u16, Error> {
    match s.parse() {
        Ok(0) | Err(_) => usage(format!("invalid port {s:?}")),
        Ok(port) => Ok(port),
    }
}

/// Transport tunables, deserialized from the `LOSSIM_CONFIG` TOML document.
/// Fields left out of the document keep their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Sender and receiver window size, in packets.
    #[serde(default = "default_window")]
    pub window: u64,
    /// Per-packet retransmit interval.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

const fn default_window() -> u64 {
    10
}

const fn default_timeout_ms() -> u64 {
    300
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            window: default_window(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl TransportConfig {
    /// Reads the tunables from the environment, falling back to defaults
    /// when `LOSSIM_CONFIG` is unset.
    pub fn from_env() -> Result<Self, Error> {
        let Ok(doc) = std::env::var(CONFIG_ENV) else {
            return Ok(Self::default());
        };
        let config: Self = doc.parse()?;
        if config.window == 0 {
            return Err(Error::BadValue("window must be at least 1 packet"));
        }
        if config.timeout_ms == 0 {
            return Err(Error::BadValue("timeout_ms must be at least 1"));
        }
        Ok(config)
    }

    /// The retransmit interval as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl FromStr for TransportConfig {
    type Err = toml::de::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &str) -> impl Iterator<Item = String> + '_ {
        s.split_whitespace().map(str::to_owned)
    }

    #[test]
    fn parses_a_full_command_line() {
        let config = NodeConfig::parse(args("8002 8001 0.5 8003 0.2 last")).unwrap();
        assert_eq!(config.port, 8002);
        assert_eq!(
            config.neighbors,
            BTreeMap::from([(8001, 0.5), (8003, 0.2)])
        );
        assert!(config.last);

        let config = NodeConfig::parse(args("8001 8002 0.5")).unwrap();
        assert!(!config.last);
        assert_eq!(config.neighbors.len(), 1);
    }

    #[test]
    fn rejects_bad_command_lines() {
        for line in [
            "",
            "8001",
            "8001 last",
            "8001 8002",
            "8001 8002 0.5 8003",
            "0 8002 0.5",
            "port 8002 0.5",
            "8001 0 0.5",
            "8001 8002 1.0",
            "8001 8002 -0.5",
            "8001 8002 half",
            "8001 8001 0.5",
            "8001 8002 0.5 8002 0.2",
        ] {
            assert!(
                matches!(NodeConfig::parse(args(line)), Err(Error::Usage(_))),
                "line {line:?} should fail validation"
            );
        }
    }

    #[test]
    fn transport_config_from_toml() {
        let config: TransportConfig = "window = 4\ntimeout_ms = 50".parse().unwrap();
        assert_eq!(
            config,
            TransportConfig {
                window: 4,
                timeout_ms: 50
            }
        );
        assert_eq!(config.timeout(), Duration::from_millis(50));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: TransportConfig = "window = 4".parse().unwrap();
        assert_eq!(config.timeout_ms, 300);
        let config: TransportConfig = "".parse().unwrap();
        assert_eq!(config, TransportConfig::default());
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!("window = ".parse::<TransportConfig>().is_err());
        assert!("window = \"ten\"".parse::<TransportConfig>().is_err());
    }
}
