// src/config.rs

//! Manages daemon configuration: loading, validation, and the node
//! identity derived from it.

use crate::core::cluster::node::Node;
use crate::core::cluster::payload::STORE_LEN;
use crate::core::cluster::state::CLUSTER_FLAG_NOHALT;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::time::Duration;

/// Holds all configuration settings related to the cluster driver and
/// peer I/O.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClusterConfig {
    /// The group-communication driver. `local` sequences membership
    /// in-process and is the right choice for single-host clusters.
    #[serde(default = "default_driver")]
    pub driver: String,
    /// Per-peer TCP connect timeout for the majority reachability probe.
    #[serde(with = "humantime_serde", default = "default_probe_connect_timeout")]
    pub probe_connect_timeout: Duration,
    /// Per-peer read timeout for the VDI bitmap fetch during a join.
    #[serde(with = "humantime_serde", default = "default_bitmap_read_timeout")]
    pub bitmap_read_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            probe_connect_timeout: default_probe_connect_timeout(),
            bitmap_read_timeout: default_bitmap_read_timeout(),
        }
    }
}

fn default_driver() -> String {
    "local".to_string()
}
fn default_probe_connect_timeout() -> Duration {
    Duration::from_secs(2)
}
fn default_bitmap_read_timeout() -> Duration {
    Duration::from_secs(3)
}

/// The daemon configuration, loaded from a TOML file at startup.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// The failure domain this node belongs to. Replicas of one object
    /// always span distinct zones.
    #[serde(default)]
    pub zone: u32,
    /// How many placement tokens this node contributes to the ring.
    /// `0` makes it a pure gateway that stores no data.
    #[serde(default = "default_nr_vnodes")]
    pub nr_vnodes: u16,
    /// Replica count proposed when this node formats a new cluster.
    #[serde(default = "default_nr_copies")]
    pub nr_copies: u8,
    /// Keep accepting writes even when the surviving zones cannot hold a
    /// full replica set.
    #[serde(default)]
    pub no_halt: bool,
    /// Base directory for the epoch log, cluster identity, and objects.
    #[serde(default = "default_directory")]
    pub directory: String,
    /// Backing store kind proposed at format time.
    #[serde(default = "default_store")]
    pub store: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            zone: 0,
            nr_vnodes: default_nr_vnodes(),
            nr_copies: default_nr_copies(),
            no_halt: false,
            directory: default_directory(),
            store: default_store(),
            log_level: default_log_level(),
            cluster: ClusterConfig::default(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7000
}
fn default_nr_vnodes() -> u16 {
    64
}
fn default_nr_copies() -> u8 {
    3
}
fn default_directory() -> String {
    "/var/lib/flockd".to_string()
}
fn default_store() -> String {
    "plain".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port must be non-zero"));
        }
        if self.nr_copies == 0 {
            return Err(anyhow!("nr_copies must be at least 1"));
        }
        if self.store.len() > STORE_LEN {
            return Err(anyhow!(
                "store name '{}' exceeds {} bytes",
                self.store,
                STORE_LEN
            ));
        }
        self.host
            .parse::<IpAddr>()
            .map_err(|_| anyhow!("host '{}' is not an IP address", self.host))?;
        Ok(())
    }

    /// The node identity this daemon announces to the cluster.
    pub fn advertised_node(&self) -> Result<Node> {
        let addr: IpAddr = self
            .host
            .parse()
            .map_err(|_| anyhow!("host '{}' is not an IP address", self.host))?;
        Ok(Node::new(addr, self.port, self.zone, self.nr_vnodes))
    }

    /// Cluster flags proposed when this node formats a new cluster.
    pub fn cluster_flags(&self) -> u16 {
        if self.no_halt { CLUSTER_FLAG_NOHALT } else { 0 }
    }
}
