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

//! Sample routing
//!
//! Each sample is expanded into its rollup prefixes; every prefix is owned by
//! exactly one ring peer. Owned prefixes are aggregated here, the others are
//! batched to their owner. Samples that arrive from a peer are already
//! expanded and are aggregated under the exact key they carry.

use crate::aggregation::AggregationEngine;
use crate::batcher::{BatcherConfig, PacketBatcher, Transport, UdpTransport};
use crate::model::{format_line, is_valid_key, rollup_prefixes, Batch, MetricType, Sample, RING_BATCH_TAG};
use crate::ring::{RingState, SharedRing};
use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

/// Builds the outbound transport for a peer
pub type TransportFactory = Box<dyn Fn(&str) -> Option<Box<dyn Transport>> + Send + Sync>;

/// Router counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouterStats {
    pub local: u64,
    pub forwarded: u64,
    pub dropped: u64,
}

/// Decides where every rollup prefix of a sample is aggregated
pub struct MetricRouter {
    ring: SharedRing,
    engine: Arc<AggregationEngine>,
    batchers: DashMap<String, PacketBatcher>,
    batcher_config: BatcherConfig,
    transports: TransportFactory,
    /// Ring epoch the batcher set was last checked against
    ring_epoch: AtomicU64,
    local: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl MetricRouter {
    /// Router forwarding over UDP from `socket`.
    pub fn new(
        ring: SharedRing,
        engine: Arc<AggregationEngine>,
        socket: Arc<UdpSocket>,
        batcher_config: BatcherConfig,
    ) -> Self {
        let factory: TransportFactory = Box::new(move |peer: &str| {
            match peer.parse::<SocketAddr>() {
                Ok(target) => Some(Box::new(UdpTransport::new(Arc::clone(&socket), target)) as Box<dyn Transport>),
                Err(err) => {
                    warn!(peer, error = %err, "peer name is not a socket address");
                    None
                }
            }
        });
        Self::with_transports(ring, engine, batcher_config, factory)
    }

    /// Router with a caller-supplied transport per peer.
    pub fn with_transports(
        ring: SharedRing,
        engine: Arc<AggregationEngine>,
        batcher_config: BatcherConfig,
        transports: TransportFactory,
    ) -> Self {
        let batcher_config = BatcherConfig {
            tag: Some(RING_BATCH_TAG.to_string()),
            ..batcher_config
        };
        Self {
            ring,
            engine,
            batchers: DashMap::new(),
            batcher_config,
            transports,
            ring_epoch: AtomicU64::new(0),
            local: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn engine(&self) -> &Arc<AggregationEngine> {
        &self.engine
    }

    /// Route one sample.
    ///
    /// `forwarded` samples came from a peer and are aggregated locally under
    /// their exact key. Returns false if the sample was dropped.
    pub fn route(&self, sample: &Sample, forwarded: bool) -> bool {
        if !is_valid_key(&sample.key) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        if forwarded {
            return self.apply_local(sample.metric_type, &sample.key, sample.value);
        }

        let mut remote: Vec<(String, &str)> = Vec::new();
        {
            let ring = self.ring.read();
            self.retain_peers(&ring);
            for prefix in rollup_prefixes(&sample.key) {
                match ring.lookup(prefix) {
                    Some(owner) if !ring.is_local(owner) => remote.push((owner.to_string(), prefix)),
                    _ => {
                        self.apply_local(sample.metric_type, prefix, sample.value);
                    }
                }
            }
        }

        for (owner, prefix) in remote {
            self.forward(&owner, sample.metric_type, prefix, sample.value);
        }
        true
    }

    /// Route every sample of a decoded block.
    pub fn route_batch(&self, batch: &Batch) -> usize {
        if batch.rejected > 0 {
            self.dropped.fetch_add(batch.rejected as u64, Ordering::Relaxed);
        }
        batch
            .samples
            .iter()
            .filter(|sample| self.route(sample, batch.forwarded))
            .count()
    }

    fn apply_local(&self, metric_type: MetricType, key: &str, value: f64) -> bool {
        if self.engine.update(metric_type, key, value) {
            self.local.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    fn forward(&self, owner: &str, metric_type: MetricType, key: &str, value: f64) {
        let line = format_line(metric_type, key, value);

        if let Some(batcher) = self.batchers.get(owner) {
            batcher.write(line);
            self.forwarded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let Some(transport) = (self.transports)(owner) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        debug!(peer = owner, "opening forwarding batcher");
        let batcher = self
            .batchers
            .entry(owner.to_string())
            .or_insert_with(|| PacketBatcher::boxed(self.batcher_config.clone(), transport));
        batcher.write(line);
        trace!(peer = owner, key, "forwarded");
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Close the batchers of peers that are no longer on the ring.
    ///
    /// Only scans when the ring epoch moved since the last call.
    pub fn retain_peers(&self, ring: &RingState) {
        let epoch = ring.epoch();
        if self.ring_epoch.swap(epoch, Ordering::AcqRel) == epoch {
            return;
        }
        self.batchers.retain(|peer, batcher| {
            if ring.ring().contains_peer(peer) {
                return true;
            }
            batcher.flush();
            batcher.destroy();
            debug!(peer = %peer, "closed forwarding batcher of departed peer");
            false
        });
    }

    /// Push out every pending forwarded line
    pub fn flush(&self) {
        for batcher in self.batchers.iter() {
            batcher.flush();
        }
    }

    /// Flush and stop every forwarding batcher
    pub fn close(&self) {
        for batcher in self.batchers.iter() {
            batcher.flush();
            batcher.destroy();
        }
        self.batchers.clear();
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            local: self.local.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PointValue;
    use crate::ring::{HeartbeatOutcome, RingState};
    use crate::sinks::MemorySink;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    const LOCAL: &str = "10.0.0.1:7090";
    const REMOTE: &str = "10.0.0.2:7090";

    type Sent = Arc<Mutex<HashMap<String, Vec<String>>>>;

    fn router(ring: SharedRing) -> (MetricRouter, Arc<MemorySink>, Sent) {
        let sink = Arc::new(MemorySink::new());
        let engine = Arc::new(AggregationEngine::new(60_000, sink.clone()));
        let sent: Sent = Arc::new(Mutex::new(HashMap::new()));
        let recorder = Arc::clone(&sent);
        let factory: TransportFactory = Box::new(move |peer: &str| {
            let recorder = Arc::clone(&recorder);
            let peer = peer.to_string();
            Some(Box::new(move |block: Bytes| {
                recorder
                    .lock()
                    .entry(peer.clone())
                    .or_default()
                    .push(String::from_utf8_lossy(&block).into_owned());
            }) as Box<dyn Transport>)
        });
        (
            MetricRouter::with_transports(ring, engine, BatcherConfig::default(), factory),
            sink,
            sent,
        )
    }

    fn two_peer_ring() -> SharedRing {
        let mut state = RingState::new(LOCAL, 32).unwrap();
        state.add_peer(REMOTE);
        let (generation, _) = state.begin_heartbeat(REMOTE).unwrap();
        state.apply_heartbeat(REMOTE, generation, HeartbeatOutcome::Success);
        state.reconfigure(false);
        state.shared()
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_node_rollup_fan_out() {
        let ring = RingState::new(LOCAL, 32).unwrap().shared();
        let (router, sink, sent) = router(ring);

        assert!(router.route(&Sample::new(MetricType::Counter, "A|B|C", 2.0), false));
        router.engine().flush(60_000, 0).await;

        let points = &sink.batches()[0].points;
        assert_eq!(points.len(), 3);
        for key in ["A", "A|B", "A|B|C"] {
            assert_eq!(points[key].value, PointValue::Sum { count: 2.0 });
        }
        assert!(sent.lock().is_empty());
        assert_eq!(router.stats().local, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_prefixes_are_forwarded() {
        let ring = two_peer_ring();
        let (router, _sink, sent) = router(ring.clone());

        let key = "svc|host|disk|sda|read|bytes";
        router.route(&Sample::new(MetricType::Counter, key, 1.0), false);
        router.flush();

        let expected_remote: Vec<String> = rollup_prefixes(key)
            .filter(|prefix| ring.read().lookup(prefix) == Some(REMOTE))
            .map(|prefix| format!("counter:{prefix}=1"))
            .collect();

        let stats = router.stats();
        assert_eq!(stats.local + stats.forwarded, 6);
        assert_eq!(stats.forwarded as usize, expected_remote.len());

        if !expected_remote.is_empty() {
            let blocks = sent.lock()[REMOTE].clone();
            assert_eq!(blocks.len(), 1);
            assert_eq!(blocks[0], format!("RB\n{}", expected_remote.join("\n")));
        }
        router.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_departed_peer_batcher_is_closed() {
        let ring = two_peer_ring();
        let (router, _sink, sent) = router(ring.clone());

        for i in 0..50 {
            router.route(&Sample::new(MetricType::Counter, format!("key{i}"), 1.0), false);
        }
        assert!(router.batchers.contains_key(REMOTE));

        {
            let mut state = ring.write();
            let (generation, _) = state.begin_heartbeat(REMOTE).unwrap();
            state.apply_heartbeat(REMOTE, generation, HeartbeatOutcome::Failure);
            state.reconfigure(false);
        }
        router.route(&Sample::new(MetricType::Counter, "key0", 1.0), false);

        assert!(router.batchers.is_empty());
        // pending lines went out before the batcher was closed
        assert_eq!(sent.lock()[REMOTE].len(), 1);

        let before = router.stats().forwarded;
        for i in 0..50 {
            router.route(&Sample::new(MetricType::Counter, format!("key{i}"), 1.0), false);
        }
        assert_eq!(router.stats().forwarded, before);
        assert!(router.batchers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwarded_samples_are_not_expanded() {
        let ring = two_peer_ring();
        let (router, sink, sent) = router(ring);

        let batch = crate::model::parse_batch("RB\ncounter:A|B|C=4");
        assert_eq!(router.route_batch(&batch), 1);
        router.flush();
        router.engine().flush(60_000, 0).await;

        let points = &sink.batches()[0].points;
        assert_eq!(points.len(), 1);
        assert_eq!(points["A|B|C"].value, PointValue::Sum { count: 4.0 });
        assert!(sent.lock().is_empty());
        router.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_samples_are_dropped() {
        let ring = RingState::new(LOCAL, 8).unwrap().shared();
        let (router, _sink, _sent) = router(ring);

        assert!(!router.route(&Sample::new(MetricType::Counter, "a||b", 1.0), false));
        let batch = crate::model::parse_batch("counter:ok=1\nnot a line");
        assert_eq!(router.route_batch(&batch), 1);
        assert_eq!(router.stats().dropped, 2);
    }
}
