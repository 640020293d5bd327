//! CLI and file configuration for the demo host process, layered the way a
//! deployable server's config usually is: a `clap` flag names the file,
//! `serde` deserializes it, and every field that's missing falls back to an
//! associated default function rather than failing to parse.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(
    about = "Host process for the netcode session/replication core",
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS")
)]
pub struct Cli {
    /// Path to a JSON5 configuration file.
    #[arg(long, short, default_value = "demo.json5")]
    pub config: PathBuf,
}

impl Cli {
    pub fn load() -> anyhow::Result<Config> {
        let cli = Self::parse();
        match std::fs::read_to_string(&cli.config) {
            Ok(contents) => Ok(serde_json5::from_str(&contents)?),
            Err(_) => Ok(Config::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            other => Err(anyhow::anyhow!("unknown log level: {other}")),
        }
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for LogLevel {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let raw = match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        };
        serializer.serialize_str(raw)
    }
}

fn default_bind_address() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 7777)
}

fn default_max_clients() -> u32 {
    64
}

fn default_max_channels() -> u8 {
    4
}

fn default_update_frequency_hz() -> u32 {
    60
}

fn default_idle_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddrV4,
    #[serde(default = "default_max_clients")]
    pub max_clients: u32,
    #[serde(default = "default_max_channels")]
    pub max_channels: u8,
    #[serde(default = "default_update_frequency_hz")]
    pub update_frequency_hz: u32,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Host {
    pub fn update_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.update_frequency_hz.max(1) as f64)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for Host {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_clients: default_max_clients(),
            max_channels: default_max_channels(),
            update_frequency_hz: default_update_frequency_hz(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub host: Host,
    #[serde(default)]
    pub log: Log,
}
