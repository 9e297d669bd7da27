//! Server configuration.

use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Listen address used when `SLOTGRID_ADDR` is not set.
pub const DEFAULT_ADDR: &str = "127.0.0.1:8765";
/// Grid rows used when `SLOTGRID_ROWS` is not set.
pub const DEFAULT_ROWS: usize = 5;
/// Grid columns used when `SLOTGRID_COLS` is not set.
pub const DEFAULT_COLS: usize = 5;
/// Per-observer reply queue depth used when `SLOTGRID_OUTBOUND_BUFFER` is not set.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

/// What a session does with an inbound message that is not a valid request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedPolicy {
    /// Log it and drop it.
    #[default]
    Ignore,
    /// Answer with an error reply, keep the session.
    Reply,
    /// Close the session.
    Disconnect,
}

impl FromStr for MalformedPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "reply" => Ok(Self::Reply),
            "disconnect" => Ok(Self::Disconnect),
            other => Err(Error::Config(format!(
                "unknown malformed-message policy {:?} (expected ignore, reply or disconnect)",
                other
            ))),
        }
    }
}

/// Configuration for a coordination server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket/HTTP listen address
    pub addr: SocketAddr,

    /// Grid rows
    pub rows: usize,

    /// Grid columns
    pub cols: usize,

    /// Reply queue depth per observer; a full queue makes that observer's
    /// next request wait
    pub outbound_buffer: usize,

    /// Handling of malformed inbound messages
    pub malformed: MalformedPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8765)),
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            malformed: MalformedPolicy::default(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables with the fixed defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from any key lookup (environment, test map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let addr = parse_var(&lookup, "SLOTGRID_ADDR", DEFAULT_ADDR.parse().ok())?;
        let rows = parse_var(&lookup, "SLOTGRID_ROWS", Some(DEFAULT_ROWS))?;
        let cols = parse_var(&lookup, "SLOTGRID_COLS", Some(DEFAULT_COLS))?;
        let outbound_buffer = parse_var(
            &lookup,
            "SLOTGRID_OUTBOUND_BUFFER",
            Some(DEFAULT_OUTBOUND_BUFFER),
        )?;
        let malformed = match lookup("SLOTGRID_ON_MALFORMED") {
            Some(value) => value.parse()?,
            None => MalformedPolicy::default(),
        };

        let config = Self {
            addr,
            rows,
            cols,
            outbound_buffer,
            malformed,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject shapes the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.rows == 0 || self.cols == 0 {
            return Err(Error::Config(format!(
                "grid must have at least one row and column (got {}x{})",
                self.rows, self.cols
            )));
        }
        if self.outbound_buffer == 0 {
            return Err(Error::Config("outbound buffer must be at least 1".into()));
        }
        Ok(())
    }

    /// Number of slots the grid will hold.
    pub fn slot_count(&self) -> usize {
        self.rows * self.cols
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: Option<T>) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid {}={:?}: {}", key, raw, e))),
        None => default.ok_or_else(|| Error::Config(format!("{} has no default", key))),
    }
}
