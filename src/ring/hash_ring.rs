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

//! Consistent-hash ring with virtual nodes

use ahash::{HashMap, HashMapExt};
use sha2::{Digest as _, Sha256};
use tracing::warn;

/// Position on the ring
pub type Digest = u128;

/// First 128 bits of the SHA-256 of `input`.
///
/// Every peer must compute identical digests for identical strings.
pub fn digest(input: &str) -> Digest {
    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);
    Digest::from_be_bytes(bytes)
}

/// Maps keys to peers.
///
/// Virtual nodes are inserted into the table immediately; the sorted
/// sequence used by [`HashRing::lookup`] is regenerated by
/// [`HashRing::rebuild`]. Lookups skip positions whose peer has since been
/// removed, so a removal takes effect before the next rebuild.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    table: HashMap<Digest, String>,
    /// Virtual node positions per peer, in insertion order
    owned: HashMap<String, Vec<Digest>>,
    sorted: Vec<Digest>,
    dirty: bool,
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `replicas` virtual nodes for `name`.
    ///
    /// A position already taken by another virtual node is re-probed rather
    /// than overwritten. Returns the number of collisions resolved.
    pub fn add_peer(&mut self, name: &str, replicas: usize) -> usize {
        if self.owned.contains_key(name) {
            return 0;
        }

        let mut collisions = 0;
        let mut positions = Vec::with_capacity(replicas);
        for index in 0..replicas {
            let mut position = digest(&format!("{name}:{index}"));
            let mut probe = 0u32;
            while self.table.contains_key(&position) {
                probe += 1;
                collisions += 1;
                warn!(
                    peer = name,
                    index,
                    probe,
                    owner = self.table.get(&position).map(String::as_str).unwrap_or_default(),
                    "virtual node collision, probing"
                );
                position = digest(&format!("{name}:{index}:{probe}"));
            }
            self.table.insert(position, name.to_string());
            positions.push(position);
        }

        self.owned.insert(name.to_string(), positions);
        self.dirty = true;
        collisions
    }

    /// Remove every virtual node of `name`. Returns false if it was absent.
    pub fn remove_peer(&mut self, name: &str) -> bool {
        let Some(positions) = self.owned.remove(name) else {
            return false;
        };
        for position in positions {
            self.table.remove(&position);
        }
        self.dirty = true;
        true
    }

    /// Regenerate the sorted position sequence.
    pub fn rebuild(&mut self) {
        let mut sorted: Vec<Digest> = self.table.keys().copied().collect();
        sorted.sort_unstable();
        self.sorted = sorted;
        self.dirty = false;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Owner of the first live position at or after `digest(key)`, wrapping.
    pub fn lookup(&self, key: &str) -> Option<&str> {
        if self.sorted.is_empty() {
            return None;
        }

        let target = digest(key);
        let start = self.sorted.partition_point(|position| *position < target);
        let len = self.sorted.len();
        (0..len)
            .map(|offset| self.sorted[(start + offset) % len])
            .find_map(|position| self.table.get(&position).map(String::as_str))
    }

    pub fn contains_peer(&self, name: &str) -> bool {
        self.owned.contains_key(name)
    }

    /// Number of virtual nodes held by `name`
    pub fn replica_count(&self, name: &str) -> usize {
        self.owned.get(name).map_or(0, Vec::len)
    }

    /// Names of the peers on the ring, sorted
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.owned.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Number of virtual nodes in the table
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_of(peers: &[&str], replicas: usize) -> HashRing {
        let mut ring = HashRing::new();
        for peer in peers {
            ring.add_peer(peer, replicas);
        }
        ring.rebuild();
        ring
    }

    #[test]
    fn test_digest_is_stable() {
        assert_eq!(digest("foo"), digest("foo"));
        assert_ne!(digest("foo"), digest("bar"));
        assert_eq!(digest("abc"), 0xba7816bf8f01cfea414140de5dae2223);
    }

    #[test]
    fn test_replica_count() {
        let ring = ring_of(&["10.0.0.1:7090", "10.0.0.2:7090"], 40);
        assert_eq!(ring.replica_count("10.0.0.1:7090"), 40);
        assert_eq!(ring.replica_count("10.0.0.2:7090"), 40);
        assert_eq!(ring.len(), 80);
    }

    #[test]
    fn test_lookup_is_deterministic_and_member() {
        let peers = ["10.0.0.1:7090", "10.0.0.2:7090", "10.0.0.3:7090"];
        let ring = ring_of(&peers, 32);
        for i in 0..200 {
            let key = format!("key{i}");
            let owner = ring.lookup(&key).unwrap();
            assert!(peers.contains(&owner));
            assert_eq!(ring.lookup(&key), Some(owner));
        }
    }

    #[test]
    fn test_empty_ring() {
        assert_eq!(HashRing::new().lookup("foo"), None);
    }

    #[test]
    fn test_removal_only_moves_removed_keys() {
        let peers = ["10.0.0.1:7090", "10.0.0.2:7090", "10.0.0.3:7090"];
        let mut ring = ring_of(&peers, 32);
        let before: Vec<(String, String)> = (0..300)
            .map(|i| {
                let key = format!("key{i}");
                let owner = ring.lookup(&key).unwrap().to_string();
                (key, owner)
            })
            .collect();

        assert!(ring.remove_peer("10.0.0.2:7090"));
        for (key, owner) in &before {
            let now = ring.lookup(key).unwrap();
            if owner != "10.0.0.2:7090" {
                assert_eq!(now, owner, "key {key} moved");
            } else {
                assert_ne!(now, "10.0.0.2:7090");
            }
        }

        // same answers once the sorted sequence is regenerated
        ring.rebuild();
        for (key, owner) in &before {
            if owner != "10.0.0.2:7090" {
                assert_eq!(ring.lookup(key).unwrap(), owner);
            }
        }
    }

    #[test]
    fn test_lazy_rebuild() {
        let mut ring = ring_of(&["10.0.0.1:7090"], 8);
        assert!(!ring.is_dirty());

        ring.add_peer("10.0.0.2:7090", 8);
        assert!(ring.is_dirty());
        assert!(ring.contains_peer("10.0.0.2:7090"));

        ring.rebuild();
        assert!(!ring.is_dirty());
        assert_eq!(ring.peers(), vec!["10.0.0.1:7090", "10.0.0.2:7090"]);
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut ring = ring_of(&["10.0.0.1:7090"], 8);
        ring.add_peer("10.0.0.1:7090", 8);
        assert_eq!(ring.len(), 8);
        assert!(!ring.remove_peer("10.0.0.9:7090"));
    }
}
