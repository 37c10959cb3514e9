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

//! # ringmad - clustered metrics aggregation daemon
//!
//! Daemons form a peer ring and shard the metrics key space between them by
//! consistent hashing. Each daemon aggregates the rollup prefixes it owns
//! into wall-clock aligned buckets, forwards the rest to their owners and
//! streams single keys live at any interval.
//!
//! ## Features
//!
//! - **Membership ring**: gossip join, heartbeat health, virtual nodes
//! - **Rollups**: `a|b|c` is aggregated as `a`, `a|b` and `a|b|c`
//! - **Accumulators**: sums, bounded streaming histograms, log-linear histograms
//! - **Ingest**: the same line format over UDP and HTTP on one port
//!
//! ## Example
//!
//! ```rust,no_run
//! use ringmad::{Daemon, config::DaemonConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = DaemonConfig::from_file("ringmad.json")?;
//!     let daemon = Daemon::new(config).await?;
//!     daemon.start().await?;
//!     daemon.wait_for_shutdown().await?;
//!     Ok(())
//! }
//! ```

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::signal;
use tokio::sync::Notify;
use tracing::{info, warn};

pub mod aggregation;
pub mod batcher;
pub mod clock;
pub mod config;
pub mod model;
pub mod ring;
pub mod router;
pub mod sinks;
pub mod sources;

use aggregation::AggregationEngine;
use config::DaemonConfig;
use ring::{Membership, RingState, SharedRing};
use router::MetricRouter;
use sinks::{MemorySink, StorageSink};
use sources::{AppState, HttpSource, IngestSource, UdpSource};

/// One ring peer: ingest servers, membership, routing and aggregation
pub struct Daemon {
    config: DaemonConfig,
    local_name: String,
    ring: SharedRing,
    engine: Arc<AggregationEngine>,
    router: Arc<MetricRouter>,
    membership: Arc<Membership>,
    sources: Vec<Box<dyn IngestSource>>,
    shutdown_notify: Arc<Notify>,
}

impl Daemon {
    /// Create a daemon that keeps its rollups in memory
    pub async fn new(config: DaemonConfig) -> Result<Self> {
        Self::with_sink(config, Arc::new(MemorySink::new())).await
    }

    /// Create a daemon saving to `sink`.
    ///
    /// Binds the HTTP and UDP sockets; with port 0 both share the port the
    /// OS assigns to the HTTP listener.
    pub async fn with_sink(config: DaemonConfig, sink: Arc<dyn StorageSink>) -> Result<Self> {
        config.validate()?;
        let ip = config.ip()?;

        let listener = TcpListener::bind((ip, config.port))
            .await
            .with_context(|| format!("binding http on {}:{}", ip, config.port))?;
        let port = listener.local_addr().context("getting local address")?.port();
        let socket = UdpSocket::bind((ip, port))
            .await
            .with_context(|| format!("binding udp on {ip}:{port}"))?;
        let socket = Arc::new(socket);

        let local_name = format!("{}:{}", config.address, port);
        let ring = RingState::new(&local_name, config.replica_points)?.shared();
        let engine = Arc::new(AggregationEngine::new(config.save_interval_ms(), sink));
        let router = Arc::new(MetricRouter::new(
            ring.clone(),
            Arc::clone(&engine),
            Arc::clone(&socket),
            config.batcher_config(),
        ));
        let membership = Arc::new(Membership::new(ring.clone(), config.membership_config())?);

        let sources: Vec<Box<dyn IngestSource>> = vec![
            Box::new(UdpSource::new(socket, Arc::clone(&router))),
            Box::new(HttpSource::new(
                listener,
                AppState {
                    router: Arc::clone(&router),
                    membership: Arc::clone(&membership),
                    engine: Arc::clone(&engine),
                },
            )),
        ];

        Ok(Self {
            config,
            local_name,
            ring,
            engine,
            router,
            membership,
            sources,
            shutdown_notify: Arc::new(Notify::new()),
        })
    }

    /// Start all services (aggregation, ingest, membership)
    pub async fn start(&self) -> Result<()> {
        info!(peer = %self.local_name, "Starting daemon services");

        self.engine.start();
        for source in &self.sources {
            source
                .start()
                .await
                .with_context(|| format!("starting {} source", source.name()))?;
        }
        self.membership.start();

        self.setup_signal_handlers();

        info!(
            peer = %self.local_name,
            seeds = self.config.seeds.len(),
            "All services started successfully"
        );
        Ok(())
    }

    /// Wait for a shutdown signal, then stop everything
    pub async fn wait_for_shutdown(&self) -> Result<()> {
        self.shutdown_notify.notified().await;
        info!("Shutdown signal received, stopping services...");
        self.shutdown().await
    }

    /// Request the same shutdown a signal would
    pub fn trigger_shutdown(&self) {
        self.shutdown_notify.notify_one();
    }

    /// Stop ingest, membership and forwarding, save the open bucket and
    /// close the sink.
    pub async fn shutdown(&self) -> Result<()> {
        for source in &self.sources {
            if let Err(err) = source.stop().await {
                warn!(source = source.name(), error = %format!("{err:#}"), "failed to stop source");
            }
        }
        self.membership.close();
        self.router.close();

        let delta = self.engine.default_delta();
        let ts = clock::bucket_start(clock::now_ms(), delta);
        self.engine.flush(delta, ts).await;
        self.engine.close();

        self.engine.sink().close().await.context("closing sink")?;
        info!(peer = %self.local_name, "daemon stopped");
        Ok(())
    }

    /// This peer's `address:port`
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn ring(&self) -> &SharedRing {
        &self.ring
    }

    pub fn engine(&self) -> &Arc<AggregationEngine> {
        &self.engine
    }

    pub fn router(&self) -> &Arc<MetricRouter> {
        &self.router
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    fn setup_signal_handlers(&self) {
        let shutdown_notify = Arc::clone(&self.shutdown_notify);

        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received SIGINT, initiating shutdown");
                    shutdown_notify.notify_one();
                }
                Err(err) => {
                    warn!("Failed to listen for SIGINT: {}", err);
                }
            }
        });

        #[cfg(unix)]
        {
            let shutdown_notify = Arc::clone(&self.shutdown_notify);
            tokio::spawn(async move {
                let mut sigterm =
                    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                        Ok(sigterm) => sigterm,
                        Err(err) => {
                            warn!("Failed to register SIGTERM handler: {}", err);
                            return;
                        }
                    };

                sigterm.recv().await;
                info!("Received SIGTERM, initiating shutdown");
                shutdown_notify.notify_one();
            });
        }
    }
}
