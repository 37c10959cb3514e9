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

//! Cluster membership and key ownership
//!
//! [`RingState`] holds the peer table and the hash ring built from the peers
//! that are currently healthy. It is owned by one [`Membership`] per daemon
//! and shared read-mostly with the metric router.

use anyhow::Result;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod hash_ring;
pub mod membership;
pub mod peer;

pub use hash_ring::{digest, HashRing};
pub use membership::{Membership, MembershipConfig};
pub use peer::{HeartbeatOutcome, Peer, PeerHealth, PeerStatus, RingChange};

/// Ring state shared between membership (writer) and router (reader)
pub type SharedRing = Arc<RwLock<RingState>>;

/// Peer table plus the hash ring derived from it
#[derive(Debug)]
pub struct RingState {
    local: String,
    replica_points: usize,
    peers: BTreeMap<String, Peer>,
    ignored: HashSet<String>,
    /// Addresses to keep joining until they become known peers
    join_set: BTreeSet<String>,
    ring: HashRing,
    /// Ring changes since the last rebuild
    changes: u64,
    /// Bumped on every peer added to or removed from the ring
    epoch: u64,
}

impl RingState {
    /// Bootstrap with the local peer already on the ring.
    pub fn new(local: &str, replica_points: usize) -> Result<Self> {
        let peer = Peer::local(local)?;
        let mut state = Self {
            local: local.to_string(),
            replica_points,
            peers: BTreeMap::new(),
            ignored: HashSet::new(),
            join_set: BTreeSet::new(),
            ring: HashRing::new(),
            changes: 0,
            epoch: 0,
        };
        state.peers.insert(peer.name.clone(), peer);
        state.router_up(local);
        state.reconfigure(true);
        Ok(state)
    }

    pub fn shared(self) -> SharedRing {
        Arc::new(RwLock::new(self))
    }

    pub fn local_name(&self) -> &str {
        &self.local
    }

    pub fn is_local(&self, name: &str) -> bool {
        self.local == name
    }

    /// Peer owning `key`, or `None` on an empty ring.
    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.ring.lookup(key)
    }

    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    pub fn peer(&self, name: &str) -> Option<&Peer> {
        self.peers.get(name)
    }

    /// Every known peer name, the local peer included
    pub fn known_peers(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    /// Remote peers, the ones that get heartbeats
    pub fn remote_peers(&self) -> Vec<String> {
        self.peers
            .values()
            .filter(|peer| !peer.is_self)
            .map(|peer| peer.name.clone())
            .collect()
    }

    pub fn status(&self) -> Vec<PeerStatus> {
        self.peers
            .values()
            .map(|peer| PeerStatus {
                name: peer.name.clone(),
                is_self: peer.is_self,
                health: peer.health,
                in_ring: self.ring.contains_peer(&peer.name),
            })
            .collect()
    }

    pub fn pending_changes(&self) -> u64 {
        self.changes
    }

    /// Membership epoch; differs whenever the set of ring peers may have changed
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Introduce a peer in `waiting for heartbeat`.
    ///
    /// Known, ignored and malformed names are skipped. Returns true if added.
    pub fn add_peer(&mut self, name: &str) -> bool {
        if self.peers.contains_key(name) || self.ignored.contains(name) {
            return false;
        }
        match Peer::parse(name) {
            Ok(peer) => {
                info!(peer = name, "discovered peer");
                self.join_set.remove(name);
                self.peers.insert(name.to_string(), peer);
                true
            }
            Err(err) => {
                warn!(peer = name, error = %err, "ignoring malformed peer name");
                false
            }
        }
    }

    /// Merge a gossiped peer list. Returns the number of new peers.
    pub fn merge(&mut self, names: &[String]) -> usize {
        names.iter().filter(|name| self.add_peer(name)).count()
    }

    /// Blacklist peers; known ones are evicted from the table and the ring.
    pub fn ignore(&mut self, names: &[String]) {
        for name in names {
            if self.is_local(name) {
                warn!(peer = %name, "refusing to ignore the local peer");
                continue;
            }
            self.ignored.insert(name.clone());
            self.join_set.remove(name);
            if let Some(peer) = self.peers.remove(name) {
                if peer.health == PeerHealth::Ok {
                    self.router_down(name);
                }
                info!(peer = %name, "peer ignored");
            }
        }
    }

    /// Remember an address to join on every reconfigure cycle.
    pub fn add_join_target(&mut self, name: &str) {
        if !self.peers.contains_key(name) && !self.ignored.contains(name) {
            self.join_set.insert(name.to_string());
        }
    }

    /// Join targets that have not become known peers yet
    pub fn outstanding_joins(&self) -> Vec<String> {
        self.join_set
            .iter()
            .filter(|name| !self.peers.contains_key(*name))
            .cloned()
            .collect()
    }

    /// Start a heartbeat for `name`.
    ///
    /// If the previous heartbeat is still unanswered it is resolved as a
    /// failure first. Returns the new generation and whether a stale
    /// request was superseded, or `None` for an unknown peer.
    pub fn begin_heartbeat(&mut self, name: &str) -> Option<(u64, bool)> {
        let stale = self.peers.get(name)?.in_flight;
        if let Some(previous) = stale {
            debug!(peer = name, generation = previous, "heartbeat still in flight");
            self.apply_heartbeat(name, previous, HeartbeatOutcome::Failure);
        }

        let peer = self.peers.get_mut(name)?;
        peer.generation += 1;
        peer.in_flight = Some(peer.generation);
        Some((peer.generation, stale.is_some()))
    }

    /// Apply the response to heartbeat `generation`.
    ///
    /// Responses for any generation other than the one in flight are
    /// discarded. Returns true if the outcome was applied.
    pub fn apply_heartbeat(&mut self, name: &str, generation: u64, outcome: HeartbeatOutcome) -> bool {
        let Some(peer) = self.peers.get_mut(name) else {
            return false;
        };
        if peer.in_flight != Some(generation) {
            debug!(peer = name, generation, "discarding stale heartbeat response");
            return false;
        }
        peer.in_flight = None;

        let previous = peer.health;
        let (next, change) = peer::transition(previous, outcome);
        peer.health = next;
        if previous != next {
            info!(peer = name, from = %previous, to = %next, "peer health changed");
        }

        match change {
            RingChange::Up => self.router_up(name),
            RingChange::Down => self.router_down(name),
            RingChange::Unchanged => {}
        }
        true
    }

    fn router_up(&mut self, name: &str) {
        let collisions = self.ring.add_peer(name, self.replica_points);
        if collisions > 0 {
            warn!(peer = name, collisions, "resolved virtual node collisions");
        }
        self.changes += 1;
        self.epoch += 1;
        debug!(peer = name, "router up");
    }

    fn router_down(&mut self, name: &str) {
        self.ring.remove_peer(name);
        self.changes += 1;
        self.epoch += 1;
        debug!(peer = name, "router down");
    }

    /// Rebuild the sorted ring if anything changed, or unconditionally when
    /// `force` is set. Returns true if a rebuild ran.
    pub fn reconfigure(&mut self, force: bool) -> bool {
        if !force && self.changes == 0 {
            return false;
        }
        self.ring.rebuild();
        info!(
            peers = self.ring.peers().len(),
            vnodes = self.ring.len(),
            changes = self.changes,
            "ring rebuilt"
        );
        self.changes = 0;
        true
    }

    /// Digest of the sorted peer names currently on the ring
    pub fn checksum(&self) -> String {
        format!("{:032x}", digest(&self.ring.peers().join(",")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: &str = "10.0.0.1:7090";
    const REMOTE: &str = "10.0.0.2:7090";

    fn keys_owned_by(state: &RingState, owner: &str) -> Vec<String> {
        (0..500)
            .map(|i| format!("key{i}"))
            .filter(|key| state.lookup(key) == Some(owner))
            .collect()
    }

    fn heartbeat(state: &mut RingState, name: &str, outcome: HeartbeatOutcome) {
        let (generation, _) = state.begin_heartbeat(name).unwrap();
        assert!(state.apply_heartbeat(name, generation, outcome));
    }

    #[test]
    fn test_bootstrap_owns_everything() {
        let state = RingState::new(LOCAL, 16).unwrap();
        assert_eq!(state.lookup("anything"), Some(LOCAL));
        assert_eq!(state.ring().replica_count(LOCAL), 16);
        assert_eq!(state.pending_changes(), 0);
    }

    #[test]
    fn test_membership_sequence() {
        let mut state = RingState::new(LOCAL, 16).unwrap();
        assert!(state.add_peer(REMOTE));
        assert_eq!(state.peer(REMOTE).unwrap().health, PeerHealth::WaitingForHeartbeat);
        assert!(!state.ring().contains_peer(REMOTE));

        heartbeat(&mut state, REMOTE, HeartbeatOutcome::Success);
        assert_eq!(state.peer(REMOTE).unwrap().health, PeerHealth::Ok);
        assert_eq!(state.ring().replica_count(REMOTE), 16);
        assert_eq!(state.pending_changes(), 1);
        assert!(state.reconfigure(false));

        let owned = keys_owned_by(&state, REMOTE);
        assert!(!owned.is_empty());

        heartbeat(&mut state, REMOTE, HeartbeatOutcome::Failure);
        assert_eq!(state.peer(REMOTE).unwrap().health, PeerHealth::HeartbeatFailed);
        assert!(!state.ring().contains_peer(REMOTE));
        for key in &owned {
            assert_eq!(state.lookup(key), Some(LOCAL));
        }

        heartbeat(&mut state, REMOTE, HeartbeatOutcome::Success);
        assert_eq!(state.peer(REMOTE).unwrap().health, PeerHealth::Ok);
    }

    #[test]
    fn test_overlapping_heartbeat_counts_as_failure() {
        let mut state = RingState::new(LOCAL, 16).unwrap();
        state.add_peer(REMOTE);
        heartbeat(&mut state, REMOTE, HeartbeatOutcome::Success);

        let (first, superseded) = state.begin_heartbeat(REMOTE).unwrap();
        assert!(!superseded);
        let (second, superseded) = state.begin_heartbeat(REMOTE).unwrap();
        assert!(superseded);
        assert_eq!(state.peer(REMOTE).unwrap().health, PeerHealth::HeartbeatFailed);

        // the late answer to the aborted request must not revive the peer
        assert!(!state.apply_heartbeat(REMOTE, first, HeartbeatOutcome::Success));
        assert_eq!(state.peer(REMOTE).unwrap().health, PeerHealth::HeartbeatFailed);

        assert!(state.apply_heartbeat(REMOTE, second, HeartbeatOutcome::Success));
        assert_eq!(state.peer(REMOTE).unwrap().health, PeerHealth::Ok);
    }

    #[test]
    fn test_merge_skips_known_ignored_and_malformed() {
        let mut state = RingState::new(LOCAL, 4).unwrap();
        state.ignore(&["10.0.0.9:7090".to_string()]);
        let added = state.merge(&[
            LOCAL.to_string(),
            REMOTE.to_string(),
            REMOTE.to_string(),
            "10.0.0.9:7090".to_string(),
            "garbage".to_string(),
        ]);
        assert_eq!(added, 1);
        assert_eq!(state.known_peers(), vec![LOCAL.to_string(), REMOTE.to_string()]);
    }

    #[test]
    fn test_ignore_evicts_healthy_peer() {
        let mut state = RingState::new(LOCAL, 4).unwrap();
        state.add_peer(REMOTE);
        heartbeat(&mut state, REMOTE, HeartbeatOutcome::Success);
        state.reconfigure(false);

        state.ignore(&[REMOTE.to_string(), LOCAL.to_string()]);
        assert!(state.peer(REMOTE).is_none());
        assert!(!state.ring().contains_peer(REMOTE));
        assert!(state.peer(LOCAL).is_some());
        assert!(!state.add_peer(REMOTE));
    }

    #[test]
    fn test_join_set() {
        let mut state = RingState::new(LOCAL, 4).unwrap();
        state.add_join_target(REMOTE);
        state.add_join_target(LOCAL);
        assert_eq!(state.outstanding_joins(), vec![REMOTE.to_string()]);

        state.add_peer(REMOTE);
        assert!(state.outstanding_joins().is_empty());
    }

    #[test]
    fn test_reconfigure_is_lazy() {
        let mut state = RingState::new(LOCAL, 4).unwrap();
        assert!(!state.reconfigure(false));
        assert!(state.reconfigure(true));
    }

    #[test]
    fn test_checksum_tracks_ring_members() {
        let mut a = RingState::new(LOCAL, 4).unwrap();
        let mut b = RingState::new(REMOTE, 4).unwrap();
        assert_ne!(a.checksum(), b.checksum());

        a.add_peer(REMOTE);
        heartbeat(&mut a, REMOTE, HeartbeatOutcome::Success);
        b.add_peer(LOCAL);
        heartbeat(&mut b, LOCAL, HeartbeatOutcome::Success);
        assert_eq!(a.checksum(), b.checksum());
    }
}
