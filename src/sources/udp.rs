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

use super::IngestSource;
use crate::model::parse_batch;
use crate::router::MetricRouter;
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Largest possible UDP payload
const MAX_DATAGRAM: usize = 65_536;

/// Receives one block of metric lines per datagram
pub struct UdpSource {
    socket: Arc<UdpSocket>,
    router: Arc<MetricRouter>,
    shutdown: Mutex<Option<CancellationToken>>,
    datagrams: Arc<AtomicU64>,
}

impl UdpSource {
    pub fn new(socket: Arc<UdpSocket>, router: Arc<MetricRouter>) -> Self {
        Self {
            socket,
            router,
            shutdown: Mutex::new(None),
            datagrams: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Datagrams received so far
    pub fn datagrams(&self) -> u64 {
        self.datagrams.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl IngestSource for UdpSource {
    async fn start(&self) -> Result<()> {
        let cancel = {
            let mut shutdown = self.shutdown.lock();
            if shutdown.is_some() {
                bail!("udp source already started");
            }
            let cancel = CancellationToken::new();
            *shutdown = Some(cancel.clone());
            cancel
        };

        let socket = Arc::clone(&self.socket);
        let router = Arc::clone(&self.router);
        let datagrams = Arc::clone(&self.datagrams);
        if let Ok(addr) = socket.local_addr() {
            info!(%addr, "udp ingest started");
        }

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = socket.recv_from(&mut buf) => received,
                };
                match received {
                    Ok((len, from)) => {
                        let body = String::from_utf8_lossy(&buf[..len]);
                        let batch = parse_batch(&body);
                        if batch.rejected > 0 {
                            debug!(%from, rejected = batch.rejected, "malformed lines in datagram");
                        }
                        let routed = router.route_batch(&batch);
                        datagrams.fetch_add(1, Ordering::Relaxed);
                        trace!(%from, bytes = len, routed, forwarded = batch.forwarded, "datagram");
                    }
                    Err(err) => warn!(error = %err, "udp receive failed"),
                }
            }
            debug!("udp ingest stopped");
        });

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "udp"
    }
}
