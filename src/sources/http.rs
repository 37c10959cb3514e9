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

//! HTTP ingest, membership and query endpoints

use super::IngestSource;
use crate::aggregation::{AggregationEngine, EngineStats, ListenerId};
use crate::model::{parse_batch, Point};
use crate::ring::membership::HeartbeatReply;
use crate::ring::{Membership, PeerStatus};
use crate::router::{MetricRouter, RouterStats};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared state for axum handlers.
pub struct AppState {
    pub router: Arc<MetricRouter>,
    pub membership: Arc<Membership>,
    pub engine: Arc<AggregationEngine>,
}

/// Serves every HTTP endpoint of a daemon
pub struct HttpSource {
    listener: Mutex<Option<TcpListener>>,
    state: Arc<AppState>,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl HttpSource {
    pub fn new(listener: TcpListener, state: AppState) -> Self {
        Self {
            listener: Mutex::new(Some(listener)),
            state: Arc::new(state),
            shutdown: Mutex::new(None),
        }
    }
}

#[async_trait]
impl IngestSource for HttpSource {
    async fn start(&self) -> Result<()> {
        let Some(listener) = self.listener.lock().take() else {
            bail!("http source already started");
        };
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        let app = routes(Arc::clone(&self.state));
        tokio::spawn(async move {
            info!(addr = %local_addr, "http server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "http server error");
            }
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
        "http"
    }
}

/// Build the axum router over `state`.
pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", post(metrics_handler))
        .route("/join", post(join_handler))
        .route("/heartbeat", get(heartbeat_handler))
        .route("/checksum", get(checksum_handler))
        .route("/ignore", post(ignore_handler))
        .route("/add", post(add_handler))
        .route("/peers", get(peers_handler))
        .route("/live", get(live_handler))
        .route("/points", get(points_handler))
        .route("/stats", get(stats_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

/// Handler failure rendered as a status code and plain-text message
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestReply {
    pub accepted: usize,
    pub rejected: usize,
}

/// POST /metrics - one block of metric lines.
async fn metrics_handler(State(state): State<Arc<AppState>>, body: String) -> Json<IngestReply> {
    let batch = parse_batch(&body);
    let accepted = state.router.route_batch(&batch);
    let rejected = batch.samples.len() - accepted + batch.rejected;
    if rejected > 0 {
        debug!(accepted, rejected, "malformed metrics in request");
    }
    Json(IngestReply { accepted, rejected })
}

/// POST /join - merge the caller's peers, reply with ours.
async fn join_handler(
    State(state): State<Arc<AppState>>,
    Json(peers): Json<Vec<String>>,
) -> Json<Vec<String>> {
    Json(state.membership.handle_incoming_join(&peers))
}

#[derive(Debug, Deserialize)]
struct HeartbeatQuery {
    from: Option<String>,
}

/// GET /heartbeat?from=address:port
async fn heartbeat_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HeartbeatQuery>,
) -> Json<HeartbeatReply> {
    Json(state.membership.handle_heartbeat(query.from.as_deref()))
}

async fn checksum_handler(State(state): State<Arc<AppState>>) -> String {
    state.membership.checksum()
}

async fn ignore_handler(
    State(state): State<Arc<AppState>>,
    Json(peers): Json<Vec<String>>,
) -> StatusCode {
    state.membership.handle_ignore(&peers);
    StatusCode::NO_CONTENT
}

async fn add_handler(
    State(state): State<Arc<AppState>>,
    Json(peers): Json<Vec<String>>,
) -> StatusCode {
    state.membership.handle_add(&peers);
    StatusCode::NO_CONTENT
}

async fn peers_handler(State(state): State<Arc<AppState>>) -> Json<Vec<PeerStatus>> {
    Json(state.membership.status())
}

#[derive(Debug, Deserialize)]
struct LiveQuery {
    key: String,
    delta: Option<u64>,
}

/// Unsubscribes its listener when the response body is dropped
struct LiveStream {
    engine: Arc<AggregationEngine>,
    key: String,
    delta: u64,
    id: ListenerId,
    receiver: mpsc::UnboundedReceiver<Point>,
}

impl Drop for LiveStream {
    fn drop(&mut self) {
        self.engine.unsubscribe(&self.key, self.delta, self.id);
        debug!(key = %self.key, delta = self.delta, "live stream closed");
    }
}

/// GET /live?key=K&delta=D - one JSON point per line until disconnect.
async fn live_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LiveQuery>,
) -> Result<Response, ApiError> {
    let delta = query.delta.unwrap_or_else(|| state.engine.default_delta());
    let subscription = state
        .engine
        .subscribe(&query.key, delta)
        .map_err(|err| ApiError(StatusCode::BAD_REQUEST, format!("{err:#}")))?;

    let stream = LiveStream {
        engine: Arc::clone(&state.engine),
        key: subscription.key,
        delta: subscription.delta,
        id: subscription.id,
        receiver: subscription.receiver,
    };

    let body = futures::stream::unfold(stream, |mut stream| async move {
        let point = stream.receiver.recv().await?;
        match serde_json::to_vec(&point) {
            Ok(mut line) => {
                line.push(b'\n');
                Some((Ok::<Bytes, Infallible>(Bytes::from(line)), stream))
            }
            Err(err) => {
                warn!(key = %stream.key, error = %err, "cannot encode live point");
                None
            }
        }
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(body),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct PointsQuery {
    key: String,
    start: i64,
    end: i64,
}

/// GET /points?key=K&start=S&end=E - stored points with `S <= ts < E`.
async fn points_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PointsQuery>,
) -> Result<Json<Vec<Point>>, ApiError> {
    state
        .engine
        .sink()
        .get_points(&query.key, query.start, query.end)
        .await
        .map(Json)
        .map_err(|err| ApiError(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")))
}

#[derive(Debug, Serialize)]
struct StatsReply {
    engine: EngineStats,
    router: RouterStats,
    checksum: String,
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<StatsReply> {
    Json(StatsReply {
        engine: state.engine.stats(),
        router: state.router.stats(),
        checksum: state.membership.checksum(),
    })
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
