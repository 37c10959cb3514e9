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

//! Storage sinks for finalized rollups
//!
//! The aggregation engine hands every closed default-interval bucket to a
//! sink in one batch. Sinks also hold the small JSON documents (rules, tag
//! types, dashboards) the daemon serves to its collaborators.

use crate::model::Point;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub mod memory;

pub use memory::MemorySink;

/// Trait for all storage backends
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Persist every point of one closed bucket
    async fn save_points(&self, data: &AggregatedData) -> Result<()>;

    /// Read back the points of `key` with `start_ms <= ts < end_ms`
    async fn get_points(&self, key: &str, start_ms: i64, end_ms: i64) -> Result<Vec<Point>>;

    async fn get_rule(&self, key: &str) -> Result<Option<Value>>;

    async fn set_rule(&self, key: &str, rule: Value) -> Result<()>;

    async fn get_tag_types(&self) -> Result<Vec<Value>>;

    async fn create_tag_type(&self, tag_type: Value) -> Result<()>;

    async fn get_dashboard(&self, id: &str) -> Result<Option<Value>>;

    async fn set_dashboard(&self, id: &str, dashboard: Value) -> Result<()>;

    /// Close the sink gracefully
    async fn close(&self) -> Result<()>;

    /// Get the name of this sink
    fn name(&self) -> &str;
}

/// All points closed at one bucket boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedData {
    /// Start time of the bucket
    pub start_time: DateTime<Utc>,

    /// Bucket width in milliseconds
    pub delta_ms: u64,

    /// Finalized point per key
    pub points: HashMap<String, Point>,
}
