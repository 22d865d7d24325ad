//! Router configuration
//!
//! Loaded from a JSON file. Every field has a default, so `{}` is a valid
//! (if interface-less) configuration.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::control::output::WAKE_TIMEOUT;
use crate::dataplane::graph::BURST_SIZE;
use crate::dataplane::iface::{ALL_DOMAINS, DomainId};
use crate::dataplane::packet::{BUFFER_SIZE, HEADROOM, POOL_SIZE};
use crate::nexthop::MAX_NEXTHOPS;

/// Configuration errors. These abort start-up.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Duplicate handler for ICMP type {0}")]
    DuplicateIcmpHandler(u8),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,
    #[serde(default)]
    pub domain: DomainId,
    /// Interface address with its connected prefix, e.g. `10.0.0.1/24`
    #[serde(default)]
    pub address: Option<Ipv4Net>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub workers: usize,
    pub burst_size: usize,
    pub nexthop_capacity: usize,
    pub wake_timeout_ms: u64,
    pub pool_size: usize,
    pub buffer_size: usize,
    pub headroom: usize,
    pub interfaces: Vec<InterfaceConfig>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            burst_size: BURST_SIZE,
            nexthop_capacity: MAX_NEXTHOPS,
            wake_timeout_ms: WAKE_TIMEOUT.as_millis() as u64,
            pool_size: POOL_SIZE,
            buffer_size: BUFFER_SIZE,
            headroom: HEADROOM,
            interfaces: Vec::new(),
        }
    }
}

impl RouterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("workers", self.workers),
            ("burst_size", self.burst_size),
            ("nexthop_capacity", self.nexthop_capacity),
            ("pool_size", self.pool_size),
            ("buffer_size", self.buffer_size),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        if self.wake_timeout_ms == 0 || self.wake_timeout() > WAKE_TIMEOUT {
            return Err(ConfigError::Invalid(format!(
                "wake_timeout_ms must be between 1 and {}",
                WAKE_TIMEOUT.as_millis()
            )));
        }
        if self.headroom >= self.buffer_size {
            return Err(ConfigError::Invalid(format!(
                "headroom {} must be smaller than buffer_size {}",
                self.headroom, self.buffer_size
            )));
        }
        if self.interfaces.len() >= usize::from(u16::MAX) {
            return Err(ConfigError::Invalid("too many interfaces".to_string()));
        }

        let mut names = HashSet::new();
        let mut addresses: HashSet<(DomainId, Ipv4Addr)> = HashSet::new();
        for iface in &self.interfaces {
            if iface.name.is_empty() {
                return Err(ConfigError::Invalid("interface name is empty".to_string()));
            }
            if !names.insert(iface.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate interface name: {}",
                    iface.name
                )));
            }
            if iface.domain == ALL_DOMAINS {
                return Err(ConfigError::Invalid(format!(
                    "interface {}: domain {ALL_DOMAINS} is reserved",
                    iface.name
                )));
            }
            if let Some(addr) = iface.address
                && !addresses.insert((iface.domain, addr.addr()))
            {
                return Err(ConfigError::Invalid(format!(
                    "interface {}: address {} already in use",
                    iface.name,
                    addr.addr()
                )));
            }
        }
        Ok(())
    }

    pub fn wake_timeout(&self) -> Duration {
        Duration::from_millis(self.wake_timeout_ms)
    }
}
