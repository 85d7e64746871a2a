use std::fs::read_to_string;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

/// This node's fabric membership and operational identity.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Node {
    pub fabric_index: u8,
    pub node_id: u64,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

/// Write-ahead-log storage settings (`wal::WalConfig`, `spec.md` §4.10).
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Storage {
    #[serde(default = "Storage::default_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub max_segment_size: Option<u64>,
    #[serde(default)]
    pub fsync_on_commit: bool,
    #[serde(default)]
    pub cleanup_interval_secs: Option<u64>,
}

impl Storage {
    fn default_root() -> PathBuf {
        PathBuf::from("./data")
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            root: Self::default_root(),
            max_segment_size: None,
            fsync_on_commit: false,
            cleanup_interval_secs: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub node: Node,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
struct Cli {
    /// Specify the configuration file path
    ///
    /// Example: peer-core-host --config /etc/peer-core-host/config.toml
    #[arg(long, short)]
    config: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        Ok(toml::from_str::<Self>(&read_to_string(&Cli::parse().config)?)?)
    }
}
