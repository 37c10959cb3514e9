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

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Liveness of a peer as seen from this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerHealth {
    /// This node; never heartbeated
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "waiting for heartbeat")]
    WaitingForHeartbeat,
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "heartbeat failed")]
    HeartbeatFailed,
}

impl fmt::Display for PeerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerHealth::Local => "local",
            PeerHealth::WaitingForHeartbeat => "waiting for heartbeat",
            PeerHealth::Ok => "OK",
            PeerHealth::HeartbeatFailed => "heartbeat failed",
        };
        f.write_str(s)
    }
}

/// Result of one heartbeat round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// HTTP 200 with `status == "OK"`
    Success,
    /// Transport error, timeout, bad status or an overlapping cycle
    Failure,
}

/// Ring side effect of a health transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingChange {
    Up,
    Down,
    Unchanged,
}

/// Health state machine.
///
/// # Panics
///
/// Panics when called for the local peer: its health is not driven by
/// heartbeats, and reaching this point means the peer table is corrupt.
pub fn transition(health: PeerHealth, outcome: HeartbeatOutcome) -> (PeerHealth, RingChange) {
    use HeartbeatOutcome::*;
    use PeerHealth::*;

    match (health, outcome) {
        (WaitingForHeartbeat, Success) => (Ok, RingChange::Up),
        (WaitingForHeartbeat, Failure) => (WaitingForHeartbeat, RingChange::Unchanged),
        (Ok, Success) => (Ok, RingChange::Unchanged),
        (Ok, Failure) => (HeartbeatFailed, RingChange::Down),
        (HeartbeatFailed, Success) => (Ok, RingChange::Up),
        (HeartbeatFailed, Failure) => (HeartbeatFailed, RingChange::Unchanged),
        (Local, _) => panic!("heartbeat outcome {outcome:?} applied to peer in state {health}"),
    }
}

/// A member of the ring, named `address:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub is_self: bool,
    pub health: PeerHealth,
    /// Generation of the most recent heartbeat sent
    pub generation: u64,
    /// Generation of the heartbeat currently awaiting a response
    pub in_flight: Option<u64>,
}

impl Peer {
    /// Parse a peer from its `address:port` name.
    pub fn parse(name: &str) -> Result<Self> {
        let (address, port) = split_name(name)?;
        Ok(Self {
            name: name.to_string(),
            address: address.to_string(),
            port,
            is_self: false,
            health: PeerHealth::WaitingForHeartbeat,
            generation: 0,
            in_flight: None,
        })
    }

    pub fn local(name: &str) -> Result<Self> {
        let mut peer = Self::parse(name)?;
        peer.is_self = true;
        peer.health = PeerHealth::Local;
        Ok(peer)
    }

    /// Base URL of the peer's HTTP endpoints
    pub fn url(&self) -> String {
        format!("http://{}", self.name)
    }
}

/// Split `address:port`.
pub fn split_name(name: &str) -> Result<(&str, u16)> {
    let (address, port) = name
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("peer name {:?} is not address:port", name))?;
    if address.is_empty() {
        return Err(anyhow!("peer name {:?} has an empty address", name));
    }
    let port = port
        .parse::<u16>()
        .with_context(|| format!("peer name {:?} has an invalid port", name))?;
    Ok((address, port))
}

/// Serializable view of a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub name: String,
    #[serde(rename = "self")]
    pub is_self: bool,
    pub health: PeerHealth,
    pub in_ring: bool,
}
