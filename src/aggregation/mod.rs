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

//! Time-based metrics aggregation engine
//!
//! Keeps one accumulator per key and bucket width ("delta"). Every key is
//! aggregated at the default delta, whose buckets are handed to the storage
//! sink; live subscribers may additionally request any custom delta for a
//! key, which is aggregated only while someone is listening.

use crate::clock;
use crate::model::{is_llq_key, is_valid_key, MetricType, Point, LLQ_SUFFIX};
use crate::sinks::{AggregatedData, StorageSink};
use ahash::{HashMap, HashMapExt};
use anyhow::{bail, Result};
use chrono::DateTime;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

pub mod accumulator;
pub mod registry;

/// Narrowest bucket a live subscriber may ask for, in milliseconds.
pub const MIN_LIVE_DELTA: u64 = 100;

/// Widest bucket the millisecond timestamps can express.
pub const MAX_DELTA: u64 = i64::MAX as u64;

pub use accumulator::Accumulator;
pub use registry::DeltaRegistry;

/// Identifies one live listener
pub type ListenerId = u64;

/// Receiving side of a live subscription
#[derive(Debug)]
pub struct LiveSubscription {
    pub key: String,
    pub delta: u64,
    pub id: ListenerId,
    pub receiver: mpsc::UnboundedReceiver<Point>,
}

/// A bucket that could not be persisted
#[derive(Debug, Clone, PartialEq)]
pub struct FlushFailure {
    pub ts: i64,
    pub delta: u64,
    pub points: usize,
    pub error: String,
}

/// Engine counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    pub updates: u64,
    pub rejected: u64,
    pub flushes: u64,
    pub flush_failures: u64,
}

struct Listener {
    id: ListenerId,
    sender: mpsc::UnboundedSender<Point>,
}

/// Aggregation engine that processes samples and closes buckets on schedule
pub struct AggregationEngine {
    default_delta: u64,

    /// Open buckets by delta, then key
    buckets: DashMap<u64, HashMap<String, Accumulator>>,

    registry: RwLock<DeltaRegistry>,

    listeners: Mutex<HashMap<(String, u64), Vec<Listener>>>,

    /// One timer per delta, cancelled when no key depends on it anymore
    timers: Mutex<HashMap<u64, CancellationToken>>,

    sink: Arc<dyn StorageSink>,
    failures: Option<mpsc::UnboundedSender<FlushFailure>>,

    next_listener: AtomicU64,
    updates: AtomicU64,
    rejected: AtomicU64,
    flushes: AtomicU64,
    flush_failures: AtomicU64,

    shutdown: CancellationToken,
}

impl AggregationEngine {
    /// Create a new aggregation engine
    pub fn new(default_delta: u64, sink: Arc<dyn StorageSink>) -> Self {
        Self {
            default_delta,
            buckets: DashMap::new(),
            registry: RwLock::new(DeltaRegistry::new(default_delta)),
            listeners: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            sink,
            failures: None,
            next_listener: AtomicU64::new(1),
            updates: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Report storage failures on `sender` in addition to logging them.
    pub fn with_failure_channel(mut self, sender: mpsc::UnboundedSender<FlushFailure>) -> Self {
        self.failures = Some(sender);
        self
    }

    pub fn default_delta(&self) -> u64 {
        self.default_delta
    }

    pub fn sink(&self) -> &Arc<dyn StorageSink> {
        &self.sink
    }

    /// Start the default-delta flush timer
    pub fn start(self: &Arc<Self>) {
        info!(delta_ms = self.default_delta, "starting aggregation");
        self.retain_timer(self.default_delta);
    }

    /// Stop every timer; open buckets are left untouched
    pub fn close(&self) {
        self.shutdown.cancel();
        self.timers.lock().clear();
    }

    /// Apply one sample to every delta `key` is tracked at.
    ///
    /// Returns false when the key fails validation; the sample is dropped.
    pub fn update(&self, metric_type: MetricType, key: &str, value: f64) -> bool {
        if !is_valid_key(key) || !value.is_finite() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            trace!(key, value, "rejecting sample");
            return false;
        }

        self.updates.fetch_add(1, Ordering::Relaxed);
        self.push(metric_type, key, value);

        if metric_type == MetricType::Histogram && !is_llq_key(key) {
            let llq_key = format!("{key}{LLQ_SUFFIX}");
            self.push(metric_type, &llq_key, value);
        }

        true
    }

    fn push(&self, metric_type: MetricType, key: &str, value: f64) {
        let deltas = self.registry.read().deltas(key);
        for delta in deltas {
            let mut bucket = self.buckets.entry(delta).or_default();
            match bucket.get_mut(key) {
                Some(acc) => acc.push(value),
                None => {
                    let mut acc = Accumulator::for_key(metric_type, key);
                    acc.push(value);
                    bucket.insert(key.to_string(), acc);
                }
            }
        }
    }

    /// Register a live listener for `key` at `delta` milliseconds.
    pub fn subscribe(self: &Arc<Self>, key: &str, delta: u64) -> Result<LiveSubscription> {
        if !is_valid_key(key) {
            bail!("invalid metrics key {:?}", key);
        }
        if !(MIN_LIVE_DELTA..=MAX_DELTA).contains(&delta) {
            bail!("delta must be between {MIN_LIVE_DELTA} and {MAX_DELTA} ms, got {delta}");
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);

        let mut listeners = self.listeners.lock();
        let entry = listeners.entry((key.to_string(), delta)).or_default();
        let first = entry.is_empty();
        entry.push(Listener { id, sender });

        if first && delta != self.default_delta {
            self.registry.write().add(key, delta);
            self.retain_timer(delta);
        }

        debug!(key, delta, id, "live subscription added");
        Ok(LiveSubscription {
            key: key.to_string(),
            delta,
            id,
            receiver,
        })
    }

    /// Remove a live listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, key: &str, delta: u64, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let map_key = (key.to_string(), delta);
        let Some(entry) = listeners.get_mut(&map_key) else {
            return false;
        };

        let before = entry.len();
        entry.retain(|listener| listener.id != id);
        if entry.len() == before {
            return false;
        }

        if entry.is_empty() {
            listeners.remove(&map_key);
            if delta != self.default_delta {
                let remaining = {
                    let mut registry = self.registry.write();
                    registry.remove(key, delta);
                    registry.key_count(delta)
                };
                if remaining == 0 {
                    self.release_timer(delta);
                } else if let Some(mut bucket) = self.buckets.get_mut(&delta) {
                    bucket.remove(key);
                }
            }
        }

        debug!(key, delta, id, "live subscription removed");
        true
    }

    /// Whether a flush timer is running for `delta`
    pub fn has_timer(&self, delta: u64) -> bool {
        self.timers.lock().contains_key(&delta)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            updates: self.updates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
        }
    }

    fn retain_timer(self: &Arc<Self>, delta: u64) {
        let mut timers = self.timers.lock();
        if timers.contains_key(&delta) {
            return;
        }

        let cancel = self.shutdown.child_token();
        let engine: Weak<Self> = Arc::downgrade(self);
        clock::spawn_aligned(delta, cancel.clone(), move |boundary| {
            let engine = engine.clone();
            async move {
                match engine.upgrade() {
                    Some(engine) => {
                        engine.flush(delta, boundary - delta as i64).await;
                        true
                    }
                    None => false,
                }
            }
        });
        timers.insert(delta, cancel);
        debug!(delta_ms = delta, "flush timer started");
    }

    fn release_timer(&self, delta: u64) {
        if let Some(cancel) = self.timers.lock().remove(&delta) {
            cancel.cancel();
            debug!(delta_ms = delta, "flush timer stopped");
        }
        self.buckets.remove(&delta);
    }

    /// Close the bucket starting at `ts` for `delta`.
    ///
    /// Live listeners at `delta` get one point each, an empty placeholder if
    /// their key saw no samples. Default-delta buckets are also saved to the
    /// sink; a storage failure is reported and the bucket is lost.
    pub async fn flush(&self, delta: u64, ts: i64) {
        let closed = self
            .buckets
            .get_mut(&delta)
            .map(|mut bucket| std::mem::take(&mut *bucket))
            .unwrap_or_default();

        let points: std::collections::HashMap<String, Point> = closed
            .iter()
            .map(|(key, acc)| (key.clone(), acc.finalize(ts)))
            .collect();

        self.emit_live(delta, ts, &points);
        self.flushes.fetch_add(1, Ordering::Relaxed);

        if delta != self.default_delta {
            return;
        }
        if points.is_empty() {
            trace!(ts, "nothing to save");
            return;
        }

        let count = points.len();
        let data = AggregatedData {
            start_time: DateTime::from_timestamp_millis(ts).unwrap_or_default(),
            delta_ms: delta,
            points,
        };

        match self.sink.save_points(&data).await {
            Ok(()) => debug!(ts, points = count, sink = self.sink.name(), "bucket saved"),
            Err(err) => {
                self.flush_failures.fetch_add(1, Ordering::Relaxed);
                error!(ts, points = count, sink = self.sink.name(), error = %err, "failed to save bucket");
                if let Some(failures) = &self.failures {
                    let _ = failures.send(FlushFailure {
                        ts,
                        delta,
                        points: count,
                        error: format!("{err:#}"),
                    });
                }
            }
        }
    }

    fn emit_live(&self, delta: u64, ts: i64, points: &std::collections::HashMap<String, Point>) {
        let listeners = self.listeners.lock();
        for ((key, listener_delta), entries) in listeners.iter() {
            if *listener_delta != delta {
                continue;
            }
            let point = points.get(key).cloned().unwrap_or_else(|| Point::empty(ts));
            for listener in entries {
                if listener.sender.send(point.clone()).is_err() {
                    trace!(key, delta, id = listener.id, "live listener gone");
                }
            }
        }
    }
}

impl Drop for AggregationEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
