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

//! Wall-clock aligned timers
//!
//! Every daemon in a cluster closes its buckets on multiples of the bucket
//! width measured from the Unix epoch, so partial rollups computed on
//! different peers line up without any coordination.

use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// The next multiple of `delta_ms` strictly after `now_ms`.
pub fn next_boundary(now_ms: i64, delta_ms: u64) -> i64 {
    let delta = delta_ms.max(1) as i64;
    (now_ms.div_euclid(delta) + 1) * delta
}

/// The multiple of `delta_ms` nearest to `now_ms`.
///
/// Used at tick time to absorb scheduler jitter around a boundary.
pub fn nearest_boundary(now_ms: i64, delta_ms: u64) -> i64 {
    let delta = delta_ms.max(1) as i64;
    (now_ms + delta / 2).div_euclid(delta) * delta
}

/// Start of the bucket containing `ts_ms`.
pub fn bucket_start(ts_ms: i64, delta_ms: u64) -> i64 {
    let delta = delta_ms.max(1) as i64;
    ts_ms.div_euclid(delta) * delta
}

/// Spawn a periodic task whose ticks land on multiples of `delta_ms`.
///
/// The task first sleeps until the next boundary, then ticks every
/// `delta_ms`. `on_tick` receives the boundary that was just crossed.
pub fn spawn_aligned<F, Fut>(delta_ms: u64, cancel: CancellationToken, mut on_tick: F) -> JoinHandle<()>
where
    F: FnMut(i64) -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send,
{
    let period = Duration::from_millis(delta_ms.max(1));

    tokio::spawn(async move {
        let now = now_ms();
        let wait = (next_boundary(now, delta_ms) - now).max(0) as u64;

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(wait)) => {}
        }

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(delta_ms, "aligned timer stopped");
                    break;
                }
                _ = interval.tick() => {
                    if !on_tick(nearest_boundary(now_ms(), delta_ms)).await {
                        break;
                    }
                }
            }
        }
    })
}
