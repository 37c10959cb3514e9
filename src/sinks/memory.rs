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

use super::{AggregatedData, StorageSink};
use crate::model::Point;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Process-local sink keeping everything in memory
#[derive(Default)]
pub struct MemorySink {
    points: Mutex<HashMap<String, BTreeMap<i64, Point>>>,
    batches: Mutex<Vec<AggregatedData>>,
    rules: Mutex<HashMap<String, Value>>,
    tag_types: Mutex<Vec<Value>>,
    dashboards: Mutex<HashMap<String, Value>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every batch handed to [`StorageSink::save_points`], oldest first
    pub fn batches(&self) -> Vec<AggregatedData> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl StorageSink for MemorySink {
    async fn save_points(&self, data: &AggregatedData) -> Result<()> {
        debug!(
            points = data.points.len(),
            delta_ms = data.delta_ms,
            start = %data.start_time,
            "saving points"
        );

        {
            let mut points = self.points.lock();
            for (key, point) in &data.points {
                points
                    .entry(key.clone())
                    .or_default()
                    .insert(point.ts, point.clone());
            }
        }
        self.batches.lock().push(data.clone());
        Ok(())
    }

    async fn get_points(&self, key: &str, start_ms: i64, end_ms: i64) -> Result<Vec<Point>> {
        if start_ms >= end_ms {
            return Ok(Vec::new());
        }
        let points = self.points.lock();
        Ok(points
            .get(key)
            .map(|series| series.range(start_ms..end_ms).map(|(_, p)| p.clone()).collect())
            .unwrap_or_default())
    }

    async fn get_rule(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.rules.lock().get(key).cloned())
    }

    async fn set_rule(&self, key: &str, rule: Value) -> Result<()> {
        self.rules.lock().insert(key.to_string(), rule);
        Ok(())
    }

    async fn get_tag_types(&self) -> Result<Vec<Value>> {
        Ok(self.tag_types.lock().clone())
    }

    async fn create_tag_type(&self, tag_type: Value) -> Result<()> {
        self.tag_types.lock().push(tag_type);
        Ok(())
    }

    async fn get_dashboard(&self, id: &str) -> Result<Option<Value>> {
        Ok(self.dashboards.lock().get(id).cloned())
    }

    async fn set_dashboard(&self, id: &str, dashboard: Value) -> Result<()> {
        self.dashboards.lock().insert(id.to_string(), dashboard);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
