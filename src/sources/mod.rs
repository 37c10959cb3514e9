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

//! Ingest servers
//!
//! Both servers listen on the peer's own `address:port`: UDP datagrams carry
//! one block of metric lines each, HTTP carries the same blocks plus the
//! membership and live-query endpoints.

use anyhow::Result;
use async_trait::async_trait;

pub mod http;
pub mod udp;

pub use http::{AppState, HttpSource};
pub use udp::UdpSource;

/// Trait for all ingest servers
#[async_trait]
pub trait IngestSource: Send + Sync {
    /// Start serving on the already bound socket
    async fn start(&self) -> Result<()>;

    /// Stop the source gracefully
    async fn stop(&self) -> Result<()>;

    /// Get the name of this source
    fn name(&self) -> &str;
}
