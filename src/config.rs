//! Server configuration
//!
//! Defaults suit a local server; each field can be overridden through a
//! `CHAT_*` environment variable.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::message::WireFormat;

/// Default listen port
pub const DEFAULT_PORT: u16 = 2000;

/// Runtime settings for the listener and every connection handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: IpAddr,
    /// Port to bind; 0 picks an ephemeral port
    pub port: u16,
    /// Close connections that send nothing for this long (None = never)
    pub idle_timeout: Option<Duration>,
    /// Upper bound for a single outbound write
    pub write_timeout: Duration,
    /// Per-connection outbound mailbox capacity, in lines
    pub outbound_capacity: usize,
    /// Longest accepted inbound frame, in bytes
    pub max_frame_length: usize,
    /// Wire encoding used by every connection
    pub wire_format: WireFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            idle_timeout: Some(Duration::from_secs(300)),
            write_timeout: Duration::from_secs(10),
            outbound_capacity: 64,
            max_frame_length: 4096,
            wire_format: WireFormat::Text,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `CHAT_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = parse_var(&lookup, "CHAT_HOST")? {
            config.host = host;
        }
        if let Some(port) = parse_var(&lookup, "CHAT_PORT")? {
            config.port = port;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "CHAT_IDLE_TIMEOUT_SECS")? {
            config.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "CHAT_WRITE_TIMEOUT_SECS")? {
            config.write_timeout = Duration::from_secs(positive(secs, "CHAT_WRITE_TIMEOUT_SECS")?);
        }
        if let Some(n) = parse_var::<u64, _>(&lookup, "CHAT_OUTBOUND_CAPACITY")? {
            config.outbound_capacity = positive(n, "CHAT_OUTBOUND_CAPACITY")? as usize;
        }
        if let Some(n) = parse_var::<u64, _>(&lookup, "CHAT_MAX_FRAME_LENGTH")? {
            config.max_frame_length = positive(n, "CHAT_MAX_FRAME_LENGTH")? as usize;
        }
        if let Some(value) = lookup("CHAT_WIRE_FORMAT") {
            config.wire_format = value.parse()?;
        }

        Ok(config)
    }

    /// Replace the port with the first command-line argument, if any
    pub fn with_port_arg(mut self, arg: Option<String>) -> Result<Self, ConfigError> {
        if let Some(arg) = arg {
            self.port = arg.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "port argument",
                value: arg,
            })?;
        }
        Ok(self)
    }

    /// Address the listener binds to
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&'static str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(None),
    }
}

fn positive(n: u64, key: &'static str) -> Result<u64, ConfigError> {
    if n == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: n.to_string(),
        });
    }
    Ok(n)
}
