//! Flat configuration surface for the core. Loaded from TOML by the daemon;
//! every field has a default so tests can construct one directly.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::id::RouterId;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,

    pub min_connected_routers: usize,
    pub max_connected_routers: usize,

    /// Deadline for one path build, milliseconds.
    pub path_alignment_timeout_ms: u64,
    /// Link session idle timeout, milliseconds.
    pub session_timeout_ms: u64,
    /// Link keepalive cadence, milliseconds.
    pub keep_alive_interval_ms: u64,

    pub hops_per_path: usize,
    /// Owned-path lifetime, milliseconds.
    pub path_lifetime_ms: u64,

    /// Introset publish cadence, milliseconds.
    pub publish_interval_ms: u64,
    /// Per-service lookup cooldown, milliseconds.
    pub lookup_cooldown_ms: u64,

    /// Only build paths through these routers, when non-empty.
    pub strict_connect_list: Vec<RouterId>,
    /// Never build paths through these routers.
    pub blacklist: Vec<RouterId>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1090".parse().expect("literal addr"),
            data_dir: PathBuf::from("."),
            min_connected_routers: 2,
            max_connected_routers: 32,
            path_alignment_timeout_ms: 10_000,
            session_timeout_ms: 10_000,
            keep_alive_interval_ms: 2_500,
            hops_per_path: 3,
            path_lifetime_ms: 600_000,
            publish_interval_ms: 150_000,
            lookup_cooldown_ms: 250,
            strict_connect_list: Vec::new(),
            blacklist: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }

    /// A router is eligible as a path hop under the operator constraints.
    pub fn allows_hop(&self, router: &RouterId) -> bool {
        if self.blacklist.contains(router) {
            return false;
        }
        self.strict_connect_list.is_empty() || self.strict_connect_list.contains(router)
    }
}
