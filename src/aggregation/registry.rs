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

use ahash::{HashMap, HashMapExt};
use std::collections::BTreeSet;

/// Tracks which custom deltas each key is currently aggregated at.
///
/// The default delta applies to every key and is never stored.
#[derive(Debug, Clone)]
pub struct DeltaRegistry {
    default_delta: u64,
    custom: HashMap<String, BTreeSet<u64>>,
    /// Number of keys registered per custom delta
    per_delta: HashMap<u64, usize>,
}

impl DeltaRegistry {
    pub fn new(default_delta: u64) -> Self {
        Self {
            default_delta,
            custom: HashMap::new(),
            per_delta: HashMap::new(),
        }
    }

    pub fn default_delta(&self) -> u64 {
        self.default_delta
    }

    /// Register `delta` for `key`. Returns true if the pair was newly added.
    pub fn add(&mut self, key: &str, delta: u64) -> bool {
        if delta == self.default_delta {
            return false;
        }
        let added = self.custom.entry(key.to_string()).or_default().insert(delta);
        if added {
            *self.per_delta.entry(delta).or_insert(0) += 1;
        }
        added
    }

    /// Drop `delta` for `key`. Returns true if the pair was present.
    pub fn remove(&mut self, key: &str, delta: u64) -> bool {
        let Some(deltas) = self.custom.get_mut(key) else {
            return false;
        };
        if !deltas.remove(&delta) {
            return false;
        }
        if deltas.is_empty() {
            self.custom.remove(key);
        }
        if let Some(count) = self.per_delta.get_mut(&delta) {
            *count -= 1;
            if *count == 0 {
                self.per_delta.remove(&delta);
            }
        }
        true
    }

    /// All deltas `key` is aggregated at, default first.
    pub fn deltas(&self, key: &str) -> Vec<u64> {
        let mut deltas = vec![self.default_delta];
        if let Some(custom) = self.custom.get(key) {
            deltas.extend(custom.iter().copied());
        }
        deltas
    }

    /// Number of keys relying on a custom delta
    pub fn key_count(&self, delta: u64) -> usize {
        self.per_delta.get(&delta).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delta_is_implicit() {
        let mut registry = DeltaRegistry::new(60_000);
        assert_eq!(registry.deltas("foo"), vec![60_000]);
        assert!(!registry.add("foo", 60_000));
        assert_eq!(registry.deltas("foo"), vec![60_000]);
        assert_eq!(registry.key_count(60_000), 0);
    }

    #[test]
    fn test_add_and_remove_custom_delta() {
        let mut registry = DeltaRegistry::new(60_000);
        assert!(registry.add("foo", 1_000));
        assert!(!registry.add("foo", 1_000));
        assert!(registry.add("bar", 1_000));
        assert_eq!(registry.deltas("foo"), vec![60_000, 1_000]);
        assert_eq!(registry.key_count(1_000), 2);

        assert!(registry.remove("foo", 1_000));
        assert!(!registry.remove("foo", 1_000));
        assert_eq!(registry.deltas("foo"), vec![60_000]);
        assert_eq!(registry.key_count(1_000), 1);

        assert!(registry.remove("bar", 1_000));
        assert_eq!(registry.key_count(1_000), 0);
    }
}
