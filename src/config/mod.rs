/*
 * Copyright 2024 ArpNetworking
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Daemon configuration
//!
//! A JSON document with camelCase keys; durations use the ISO-8601 `PT<n>S`
//! form. Every field except `address` has a default.

use crate::aggregation::MAX_DELTA;
use crate::batcher::{BatcherConfig, DEFAULT_MAX_BLOCK_SIZE};
use crate::ring::peer::split_name;
use crate::ring::MembershipConfig;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    /// IP address this peer binds and advertises
    #[serde(default = "default_address")]
    pub address: String,

    /// Shared UDP and HTTP port; 0 picks a free one
    #[serde(default = "default_port")]
    pub port: u16,

    /// Peers to join at startup, as `address:port`
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Peers never admitted to the ring
    #[serde(default)]
    pub ignore: Vec<String>,

    /// Virtual nodes per peer
    #[serde(default = "default_replica_points")]
    pub replica_points: usize,

    #[serde(default = "default_heartbeat_interval", with = "duration_serde")]
    pub heartbeat_interval: Duration,

    #[serde(default = "default_heartbeat_timeout", with = "duration_serde")]
    pub heartbeat_timeout: Duration,

    #[serde(default = "default_reconfigure_interval", with = "duration_serde")]
    pub reconfigure_interval: Duration,

    /// Width of the buckets saved to storage
    #[serde(default = "default_save_interval", with = "duration_serde")]
    pub save_interval: Duration,

    /// Largest forwarded block in bytes
    #[serde(default = "default_max_block_size")]
    pub max_block_size: usize,

    #[serde(default = "default_batch_flush_interval", with = "duration_serde")]
    pub batch_flush_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            seeds: Vec::new(),
            ignore: Vec::new(),
            replica_points: default_replica_points(),
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            reconfigure_interval: default_reconfigure_interval(),
            save_interval: default_save_interval(),
            max_block_size: default_max_block_size(),
            batch_flush_interval: default_batch_flush_interval(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json(&contents)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse and validate configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.ip()?;
        if self.replica_points == 0 {
            bail!("replicaPoints must be > 0");
        }
        if self.max_block_size == 0 {
            bail!("maxBlockSize must be > 0");
        }
        for (name, interval) in [
            ("heartbeatInterval", self.heartbeat_interval),
            ("heartbeatTimeout", self.heartbeat_timeout),
            ("reconfigureInterval", self.reconfigure_interval),
            ("batchFlushInterval", self.batch_flush_interval),
        ] {
            if interval.is_zero() {
                bail!("{name} must be > 0");
            }
        }
        if self.save_interval.as_millis() == 0
            || self.save_interval.as_millis() > u128::from(MAX_DELTA)
            || self.save_interval.subsec_nanos() % 1_000_000 != 0
        {
            bail!(
                "saveInterval must be a whole, representable number of milliseconds, got {:?}",
                self.save_interval
            );
        }
        for peer in self.seeds.iter().chain(&self.ignore) {
            split_name(peer)?;
        }
        Ok(())
    }

    /// Bind address as an IPv4 literal.
    ///
    /// Peer names are `address:port`, which has no unambiguous form for IPv6.
    pub fn ip(&self) -> Result<IpAddr> {
        let ip: IpAddr = self
            .address
            .parse()
            .with_context(|| format!("address {:?} is not an IP address", self.address))?;
        if ip.is_ipv6() {
            bail!("address {:?} is IPv6; only IPv4 peers are supported", self.address);
        }
        Ok(ip)
    }

    /// Save interval in milliseconds; the default delta
    pub fn save_interval_ms(&self) -> u64 {
        self.save_interval.as_millis() as u64
    }

    pub fn membership_config(&self) -> MembershipConfig {
        MembershipConfig {
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
            reconfigure_interval: self.reconfigure_interval,
            seeds: self.seeds.clone(),
            ignore: self.ignore.clone(),
        }
    }

    pub fn batcher_config(&self) -> BatcherConfig {
        BatcherConfig {
            max_block_size: self.max_block_size,
            flush_interval: self.batch_flush_interval,
            tag: None,
        }
    }
}

// Default value functions
fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7090
}

fn default_replica_points() -> usize {
    64
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(40)
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_reconfigure_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_save_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_block_size() -> usize {
    DEFAULT_MAX_BLOCK_SIZE
}

fn default_batch_flush_interval() -> Duration {
    Duration::from_secs(1)
}

// Duration serialization helpers
mod duration_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // ISO-8601 duration format (PT1.5S)
        let iso_duration = format!("PT{}S", duration.as_secs_f64());
        serializer.serialize_str(&iso_duration)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        let seconds = s
            .strip_prefix("PT")
            .and_then(|rest| rest.strip_suffix('S'))
            .ok_or_else(|| serde::de::Error::custom(format!("Invalid duration format: {}", s)))?;
        let seconds: f64 = seconds.parse().map_err(serde::de::Error::custom)?;
        Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom)
    }
}
