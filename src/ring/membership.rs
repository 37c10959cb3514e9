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

//! Gossip join and heartbeat protocol
//!
//! Peers exchange their known-peer lists on join and probe each other with
//! periodic heartbeats. Heartbeat outcomes drive the per-peer health state
//! machine in [`super::peer`], which in turn adds or removes the peer's
//! virtual nodes. The sorted ring is rebuilt on a separate, slower timer.

use super::peer::{split_name, HeartbeatOutcome, PeerStatus};
use super::SharedRing;
use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timers and limits of the membership protocol
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reconfigure_interval: Duration,
    /// Addresses joined at startup and retried until known
    pub seeds: Vec<String>,
    pub ignore: Vec<String>,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(40),
            heartbeat_timeout: Duration::from_secs(5),
            reconfigure_interval: Duration::from_secs(10),
            seeds: Vec::new(),
            ignore: Vec::new(),
        }
    }
}

/// Body of a heartbeat response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReply {
    pub status: String,
}

impl HeartbeatReply {
    pub fn ok() -> Self {
        Self {
            status: "OK".to_string(),
        }
    }
}

/// Drives the ring from gossip and heartbeats
pub struct Membership {
    ring: SharedRing,
    config: MembershipConfig,
    http: reqwest::Client,
    /// Outstanding heartbeat request per peer, with its generation
    in_flight: Mutex<HashMap<String, (u64, AbortHandle)>>,
    cancel: CancellationToken,
}

impl Membership {
    pub fn new(ring: SharedRing, config: MembershipConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.heartbeat_timeout)
            .build()
            .context("building HTTP client")?;

        {
            let mut state = ring.write();
            state.ignore(&config.ignore);
            for seed in &config.seeds {
                if !state.is_local(seed) {
                    state.add_join_target(seed);
                }
            }
        }

        Ok(Self {
            ring,
            config,
            http,
            in_flight: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn ring(&self) -> &SharedRing {
        &self.ring
    }

    /// Bootstrap the ring, join the seeds and start both timers.
    pub fn start(self: &Arc<Self>) {
        self.ring.write().reconfigure(true);
        self.join_outstanding("bootstrap");

        let this = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => this.heartbeat_all(),
                }
            }
            debug!("heartbeat timer stopped");
        });

        let this = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.reconfigure_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => this.reconfigure_tick(),
                }
            }
            debug!("reconfigure timer stopped");
        });

        info!(
            local = %self.ring.read().local_name(),
            heartbeat = ?self.config.heartbeat_interval,
            reconfigure = ?self.config.reconfigure_interval,
            "membership started"
        );
    }

    /// Cancel both timers and every outstanding heartbeat
    pub fn close(&self) {
        self.cancel.cancel();
        for (_, (_, handle)) in self.in_flight.lock().drain() {
            handle.abort();
        }
    }

    fn reconfigure_tick(self: &Arc<Self>) {
        self.ring.write().reconfigure(false);
        self.join_outstanding("retry");
    }

    fn join_outstanding(self: &Arc<Self>, reason: &'static str) {
        let targets = self.ring.read().outstanding_joins();
        for target in targets {
            self.spawn_join(target, reason);
        }
    }

    fn spawn_join(self: &Arc<Self>, target: String, reason: &'static str) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let (address, port) = match split_name(&target) {
                Ok(parts) => parts,
                Err(err) => {
                    warn!(peer = %target, error = %err, "cannot join");
                    return;
                }
            };
            if let Err(err) = this.join(address, port, reason).await {
                warn!(peer = %target, reason, error = %format!("{err:#}"), "join failed");
            }
        });
    }

    /// Send our peer list to `address:port` and merge the one it returns.
    ///
    /// Returns the number of peers learned.
    pub async fn join(&self, address: &str, port: u16, reason: &str) -> Result<usize> {
        let known = self.ring.read().known_peers();
        let url = format!("http://{address}:{port}/join");
        debug!(%url, reason, peers = known.len(), "joining");

        let response = self
            .http
            .post(&url)
            .json(&known)
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?;

        if !response.status().is_success() {
            bail!("unexpected status {} from {}", response.status(), url);
        }

        let peers: Vec<String> = response
            .json()
            .await
            .with_context(|| format!("decoding peer list from {url}"))?;

        let added = self.ring.write().merge(&peers);
        info!(peer = %format!("{address}:{port}"), reason, added, "joined");
        Ok(added)
    }

    /// Start one heartbeat cycle across every remote peer.
    pub fn heartbeat_all(self: &Arc<Self>) {
        let peers = self.ring.read().remote_peers();
        for name in peers {
            self.heartbeat(&name);
        }
    }

    /// Probe one peer, superseding any request still in flight.
    pub fn heartbeat(self: &Arc<Self>, name: &str) {
        let mut in_flight = self.in_flight.lock();
        let (generation, url) = {
            let mut ring = self.ring.write();
            let local = ring.local_name().to_string();
            let Some((generation, superseded)) = ring.begin_heartbeat(name) else {
                return;
            };
            if superseded {
                warn!(peer = name, "previous heartbeat still in flight, counted as failure");
            }
            let url = match ring.peer(name) {
                Some(peer) => format!("{}/heartbeat?from={}", peer.url(), local),
                None => return,
            };
            (generation, url)
        };

        if let Some((_, previous)) = in_flight.remove(name) {
            previous.abort();
        }

        let this = Arc::clone(self);
        let peer = name.to_string();
        let task = tokio::spawn(async move {
            let outcome = this.send_heartbeat(&url).await;
            if outcome == HeartbeatOutcome::Failure {
                debug!(peer = %peer, generation, "heartbeat failed");
            }
            this.ring.write().apply_heartbeat(&peer, generation, outcome);
            let mut in_flight = this.in_flight.lock();
            if in_flight.get(&peer).is_some_and(|(current, _)| *current == generation) {
                in_flight.remove(&peer);
            }
        });
        in_flight.insert(name.to_string(), (generation, task.abort_handle()));
    }

    async fn send_heartbeat(&self, url: &str) -> HeartbeatOutcome {
        let response = match self.http.get(url).send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(%url, error = %err, "heartbeat request failed");
                return HeartbeatOutcome::Failure;
            }
        };
        if response.status() != reqwest::StatusCode::OK {
            return HeartbeatOutcome::Failure;
        }
        match response.json::<HeartbeatReply>().await {
            Ok(reply) if reply.status == "OK" => HeartbeatOutcome::Success,
            _ => HeartbeatOutcome::Failure,
        }
    }

    /// Merge a peer list pushed by a joining node; reply with ours.
    pub fn handle_incoming_join(&self, peers: &[String]) -> Vec<String> {
        let mut ring = self.ring.write();
        let added = ring.merge(peers);
        if added > 0 {
            info!(added, "peers learned from incoming join");
        }
        ring.known_peers()
    }

    /// Answer a heartbeat, learning the sender if it is new to us.
    pub fn handle_heartbeat(&self, from: Option<&str>) -> HeartbeatReply {
        if let Some(from) = from {
            let mut ring = self.ring.write();
            if !ring.is_local(from) {
                ring.add_peer(from);
            }
        }
        HeartbeatReply::ok()
    }

    pub fn handle_ignore(&self, peers: &[String]) {
        self.ring.write().ignore(peers);
        let mut in_flight = self.in_flight.lock();
        for name in peers {
            if let Some((_, handle)) = in_flight.remove(name) {
                handle.abort();
            }
        }
    }

    /// Force-introduce addresses: add them as peers and join them once.
    pub fn handle_add(self: &Arc<Self>, peers: &[String]) {
        let added: Vec<String> = {
            let mut ring = self.ring.write();
            peers
                .iter()
                .filter(|name| !ring.is_local(name) && ring.add_peer(name))
                .cloned()
                .collect()
        };
        info!(requested = peers.len(), added = added.len(), "peers added by operator");
        for name in added {
            self.spawn_join(name, "add");
        }
    }

    pub fn checksum(&self) -> String {
        self.ring.read().checksum()
    }

    pub fn status(&self) -> Vec<PeerStatus> {
        self.ring.read().status()
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{PeerHealth, RingState};

    const LOCAL: &str = "127.0.0.1:7090";

    fn membership(config: MembershipConfig) -> Arc<Membership> {
        let ring = RingState::new(LOCAL, 8).unwrap().shared();
        Arc::new(Membership::new(ring, config).unwrap())
    }

    #[test]
    fn test_seeds_become_join_targets() {
        let m = membership(MembershipConfig {
            seeds: vec![LOCAL.to_string(), "127.0.0.1:7091".to_string()],
            ignore: vec!["127.0.0.1:7092".to_string()],
            ..MembershipConfig::default()
        });
        assert_eq!(m.ring().read().outstanding_joins(), vec!["127.0.0.1:7091".to_string()]);
        assert!(!m.ring().write().add_peer("127.0.0.1:7092"));
    }

    #[test]
    fn test_incoming_join_replies_with_known_peers() {
        let m = membership(MembershipConfig::default());
        let reply = m.handle_incoming_join(&["127.0.0.1:7091".to_string()]);
        assert_eq!(reply, vec![LOCAL.to_string(), "127.0.0.1:7091".to_string()]);
    }

    #[test]
    fn test_heartbeat_introduces_sender() {
        let m = membership(MembershipConfig::default());
        assert_eq!(m.handle_heartbeat(Some("127.0.0.1:7091")), HeartbeatReply::ok());
        assert_eq!(m.handle_heartbeat(Some(LOCAL)), HeartbeatReply::ok());
        assert_eq!(m.handle_heartbeat(None), HeartbeatReply::ok());

        let status = m.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[1].health, PeerHealth::WaitingForHeartbeat);
    }

    #[tokio::test]
    async fn test_unreachable_peer_stays_waiting() {
        let m = membership(MembershipConfig {
            heartbeat_timeout: Duration::from_millis(200),
            ..MembershipConfig::default()
        });
        // nothing listens on port 1
        m.handle_add(&["127.0.0.1:1".to_string()]);
        m.heartbeat("127.0.0.1:1");

        let mut settled = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if m.ring().read().peer("127.0.0.1:1").unwrap().in_flight.is_none() {
                settled = true;
                break;
            }
        }
        assert!(settled);
        assert_eq!(
            m.ring().read().peer("127.0.0.1:1").unwrap().health,
            PeerHealth::WaitingForHeartbeat
        );
    }

    #[tokio::test]
    async fn test_overlapping_heartbeat_is_aborted_and_fails() {
        // accepts connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent = listener.local_addr().unwrap().to_string();
        let accepter = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let m = membership(MembershipConfig {
            heartbeat_timeout: Duration::from_secs(30),
            ..MembershipConfig::default()
        });
        {
            let mut ring = m.ring().write();
            assert!(ring.add_peer(&silent));
            let (generation, _) = ring.begin_heartbeat(&silent).unwrap();
            ring.apply_heartbeat(&silent, generation, HeartbeatOutcome::Success);
        }
        assert_eq!(m.ring().read().peer(&silent).unwrap().health, PeerHealth::Ok);

        m.heartbeat(&silent);
        let (first_generation, first) = m.in_flight.lock().get(&silent).cloned().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        m.heartbeat(&silent);

        let (second_generation, _) = m.in_flight.lock().get(&silent).cloned().unwrap();
        assert_eq!(second_generation, first_generation + 1);
        {
            let ring = m.ring().read();
            let peer = ring.peer(&silent).unwrap();
            assert_eq!(peer.health, PeerHealth::HeartbeatFailed);
            assert_eq!(peer.in_flight, Some(second_generation));
            assert!(!ring.ring().contains_peer(&silent));
        }

        for _ in 0..100 {
            if first.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(first.is_finished());

        m.close();
        assert!(m.in_flight.lock().is_empty());
        accepter.abort();
    }

    #[tokio::test]
    async fn test_join_failure_is_an_error_not_a_panic() {
        let m = membership(MembershipConfig {
            heartbeat_timeout: Duration::from_millis(200),
            ..MembershipConfig::default()
        });
        assert!(m.join("127.0.0.1", 1, "test").await.is_err());
    }
}
