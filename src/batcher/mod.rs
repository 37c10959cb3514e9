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

//! Packet coalescing for line-oriented metric messages
//!
//! Lines are collected into blocks no larger than one datagram and handed to
//! a transport either when the next line would overflow the block or when
//! the flush timer fires, whichever comes first.

use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Largest block that fits a typical UDP MTU.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 1440;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(1000);

/// Receives finished blocks
pub trait Transport: Send + Sync + 'static {
    fn send(&self, block: Bytes);
}

impl<F> Transport for F
where
    F: Fn(Bytes) + Send + Sync + 'static,
{
    fn send(&self, block: Bytes) {
        self(block)
    }
}

/// Sends each block as one datagram
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>, target: SocketAddr) -> Self {
        Self { socket, target }
    }
}

impl Transport for UdpTransport {
    fn send(&self, block: Bytes) {
        if let Err(err) = self.socket.try_send_to(&block, self.target) {
            warn!(target_addr = %self.target, bytes = block.len(), error = %err, "dropping block");
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub max_block_size: usize,
    pub flush_interval: Duration,
    /// Tag line written before the body of every block
    pub tag: Option<String>,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            tag: None,
        }
    }
}

#[derive(Default)]
struct Pending {
    lines: Vec<String>,
    /// Size of the block the pending lines would produce
    size: usize,
}

struct Inner {
    pending: Mutex<Pending>,
    transport: Box<dyn Transport>,
    tag: Option<String>,
    max_block_size: usize,
}

impl Inner {
    /// Bytes taken by the tag line, if any
    fn overhead(&self) -> usize {
        self.tag.as_ref().map_or(0, |tag| tag.len() + 1)
    }

    fn take(&self) -> Vec<String> {
        let mut pending = self.pending.lock();
        pending.size = 0;
        std::mem::take(&mut pending.lines)
    }

    fn send(&self, lines: Vec<String>) {
        if lines.is_empty() {
            return;
        }
        let mut block = String::with_capacity(self.max_block_size);
        if let Some(tag) = &self.tag {
            block.push_str(tag);
            block.push('\n');
        }
        block.push_str(&lines.join("\n"));
        trace!(lines = lines.len(), bytes = block.len(), "flushing block");
        self.transport.send(Bytes::from(block));
    }
}

/// Size- and time-bounded line batcher
pub struct PacketBatcher {
    inner: Arc<Inner>,
    cancel: CancellationToken,
}

impl PacketBatcher {
    /// Create a batcher and start its flush timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: BatcherConfig, transport: impl Transport) -> Self {
        Self::boxed(config, Box::new(transport))
    }

    /// Like [`PacketBatcher::new`] for an already boxed transport.
    pub fn boxed(config: BatcherConfig, transport: Box<dyn Transport>) -> Self {
        let inner = Arc::new(Inner {
            pending: Mutex::new(Pending::default()),
            transport,
            tag: config.tag,
            max_block_size: config.max_block_size,
        });
        let cancel = CancellationToken::new();

        let timer_inner = Arc::clone(&inner);
        let timer_cancel = cancel.clone();
        let period = config.flush_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = timer_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let lines = timer_inner.take();
                        timer_inner.send(lines);
                    }
                }
            }
        });

        Self { inner, cancel }
    }

    /// Queue a line, flushing first if it would overflow the block.
    pub fn write(&self, line: impl Into<String>) {
        let line = line.into();
        let overflow = {
            let mut pending = self.inner.pending.lock();
            let projected = if pending.lines.is_empty() {
                self.inner.overhead() + line.len()
            } else {
                pending.size + 1 + line.len()
            };

            let overflow = if !pending.lines.is_empty() && projected > self.inner.max_block_size {
                let lines = std::mem::take(&mut pending.lines);
                pending.size = self.inner.overhead() + line.len();
                Some(lines)
            } else {
                pending.size = projected;
                None
            };
            pending.lines.push(line);
            overflow
        };

        if let Some(lines) = overflow {
            self.inner.send(lines);
        }
    }

    /// Send whatever is pending now
    pub fn flush(&self) {
        let lines = self.inner.take();
        self.inner.send(lines);
    }

    /// Lines waiting for the next flush
    pub fn pending(&self) -> Vec<String> {
        self.inner.pending.lock().lines.clone()
    }

    /// Stop the flush timer; pending lines are discarded.
    pub fn destroy(&self) {
        self.cancel.cancel();
        self.inner.take();
    }
}

impl Drop for PacketBatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording(config: BatcherConfig) -> (PacketBatcher, Arc<Mutex<Vec<String>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sent);
        let batcher = PacketBatcher::new(config, move |block: Bytes| {
            sink.lock()
                .push(String::from_utf8(block.to_vec()).unwrap());
        });
        (batcher, sent)
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_before_overflow() {
        let (batcher, sent) = recording(BatcherConfig {
            max_block_size: 9,
            ..BatcherConfig::default()
        });

        batcher.write("123");
        batcher.write("456");
        assert!(sent.lock().is_empty());

        batcher.write("789");
        assert_eq!(*sent.lock(), vec!["123\n456".to_string()]);
        assert_eq!(batcher.pending(), vec!["789".to_string()]);
        batcher.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tag_counts_toward_block_size() {
        let (batcher, sent) = recording(BatcherConfig {
            max_block_size: 10,
            tag: Some("RB".to_string()),
            ..BatcherConfig::default()
        });

        batcher.write("1234");
        batcher.write("5678");
        assert_eq!(*sent.lock(), vec!["RB\n1234".to_string()]);

        batcher.flush();
        assert_eq!(sent.lock()[1], "RB\n5678");
        assert!(batcher.pending().is_empty());
        batcher.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_small_batches() {
        let (batcher, sent) = recording(BatcherConfig {
            flush_interval: Duration::from_millis(1000),
            ..BatcherConfig::default()
        });

        batcher.write("counter:foo=1");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(sent.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(*sent.lock(), vec!["counter:foo=1".to_string()]);
        batcher.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_stops_timer() {
        let (batcher, sent) = recording(BatcherConfig::default());
        batcher.write("counter:foo=1");
        batcher.destroy();

        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert!(sent.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_empty_sends_nothing() {
        let (batcher, sent) = recording(BatcherConfig::default());
        batcher.flush();
        assert!(sent.lock().is_empty());
        batcher.destroy();
    }
}
