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

//! Per-bucket accumulators
//!
//! Each accumulator absorbs raw values for one key during one bucket and is
//! finalized into a [`Point`] when the bucket closes.

use crate::model::{is_llq_key, HistogramStats, MetricType, OrderedFloat, Point, PointValue};
use std::collections::BTreeMap;

/// Maximum number of centroid bins kept by a streaming histogram.
pub const MAX_HISTOGRAM_BINS: usize = 64;

/// Running state for one key within one bucket
#[derive(Debug, Clone)]
pub enum Accumulator {
    Sum(f64),
    Histogram(StreamingHistogram),
    LogLinear(LogLinearHistogram),
}

impl Accumulator {
    /// Pick the accumulator variant for a sample type and key.
    pub fn for_key(metric_type: MetricType, key: &str) -> Self {
        if is_llq_key(key) {
            return Accumulator::LogLinear(LogLinearHistogram::default());
        }
        match metric_type {
            MetricType::Counter => Accumulator::Sum(0.0),
            MetricType::Histogram => Accumulator::Histogram(StreamingHistogram::default()),
        }
    }

    pub fn push(&mut self, value: f64) {
        match self {
            Accumulator::Sum(total) => *total += value,
            Accumulator::Histogram(histogram) => histogram.push(value),
            Accumulator::LogLinear(histogram) => histogram.push(value),
        }
    }

    /// Close the bucket starting at `ts`.
    pub fn finalize(&self, ts: i64) -> Point {
        let value = match self {
            Accumulator::Sum(total) => PointValue::Sum {
                count: round4(*total),
            },
            Accumulator::Histogram(histogram) => match histogram.stats() {
                Some(stats) => PointValue::Histogram(stats),
                None => return Point::empty(ts),
            },
            Accumulator::LogLinear(histogram) => PointValue::LogLinear {
                data: histogram.data(),
            },
        };
        Point { ts, value }
    }
}

/// Above this magnitude an f64 has no fractional digits left to round.
const ROUNDING_LIMIT: f64 = 1e15;

/// Round to 4 decimal places.
pub fn round4(value: f64) -> f64 {
    if !value.is_finite() || value.abs() >= ROUNDING_LIMIT {
        return value;
    }
    (value * 10_000.0).round() / 10_000.0
}

/// Bounded streaming histogram.
///
/// Keeps at most [`MAX_HISTOGRAM_BINS`] centroids, merging the closest pair
/// when the bound is exceeded. Exact while the number of distinct values
/// stays below the bound.
#[derive(Debug, Clone, Default)]
pub struct StreamingHistogram {
    /// Sorted by centroid value
    bins: Vec<(f64, u64)>,
    count: u64,
    max: f64,
    mean: f64,
    m2: f64,
}

impl StreamingHistogram {
    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }

        if self.count == 0 || value > self.max {
            self.max = value;
        }
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);

        match self
            .bins
            .binary_search_by(|(centroid, _)| centroid.total_cmp(&value))
        {
            Ok(idx) => self.bins[idx].1 += 1,
            Err(idx) => {
                self.bins.insert(idx, (value, 1));
                if self.bins.len() > MAX_HISTOGRAM_BINS {
                    self.merge_closest();
                }
            }
        }
    }

    fn merge_closest(&mut self) {
        let Some(idx) = (0..self.bins.len() - 1).min_by(|&a, &b| {
            let gap_a = self.bins[a + 1].0 - self.bins[a].0;
            let gap_b = self.bins[b + 1].0 - self.bins[b].0;
            gap_a.total_cmp(&gap_b)
        }) else {
            return;
        };

        let (left, left_count) = self.bins[idx];
        let (right, right_count) = self.bins.remove(idx + 1);
        let merged = left_count + right_count;
        let centroid = (left * left_count as f64 + right * right_count as f64) / merged as f64;
        self.bins[idx] = (centroid, merged);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Nearest-rank quantile over the centroid bins, `q` in `0.0..=1.0`.
    pub fn quantile(&self, q: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }

        let target = ((q * self.count as f64).ceil() as u64).max(1);
        let mut running = 0;
        for (centroid, count) in &self.bins {
            running += count;
            if running >= target {
                return *centroid;
            }
        }

        self.max
    }

    /// Population standard deviation
    pub fn std_dev(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.m2 / self.count as f64).sqrt()
        }
    }

    pub fn stats(&self) -> Option<HistogramStats> {
        if self.count == 0 {
            return None;
        }

        Some(HistogramStats {
            count: self.count,
            max: round4(self.max),
            mean: round4(self.mean),
            std_dev: round4(self.std_dev()),
            p10: round4(self.quantile(0.10)),
            median: round4(self.quantile(0.50)),
            p75: round4(self.quantile(0.75)),
            p95: round4(self.quantile(0.95)),
            p99: round4(self.quantile(0.99)),
        })
    }
}

/// Frequency map keyed by log-linear bucket boundary
#[derive(Debug, Clone, Default)]
pub struct LogLinearHistogram {
    buckets: BTreeMap<OrderedFloat, u64>,
}

impl LogLinearHistogram {
    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        *self.buckets.entry(OrderedFloat(quantize(value))).or_insert(0) += 1;
    }

    /// Frequencies keyed by the boundary's decimal rendering
    pub fn data(&self) -> BTreeMap<String, u64> {
        self.buckets
            .iter()
            .map(|(boundary, count)| (format_boundary(boundary.0), *count))
            .collect()
    }
}

/// Decimal exponent of `magnitude`, corrected for `log10` rounding.
fn decade(magnitude: f64) -> i32 {
    let mut exponent = magnitude.log10().floor() as i32;
    if magnitude >= 10f64.powi(exponent + 1) {
        exponent += 1;
    } else if magnitude < 10f64.powi(exponent) {
        exponent -= 1;
    }
    exponent
}

/// Log-linear bucket boundary for a value: `sign * d * 10^e` with `d` in 1..=9.
pub fn quantize(value: f64) -> f64 {
    if value == 0.0 {
        return 0.0;
    }

    let magnitude = value.abs();
    let exponent = decade(magnitude);
    let scale = 10f64.powi(exponent);
    let digit = (magnitude / scale).floor().clamp(1.0, 9.0);
    let boundary = digit * scale;
    let boundary = if exponent < 0 {
        let places = (-exponent) as usize;
        format!("{:.*}", places, boundary)
            .parse::<f64>()
            .unwrap_or(boundary)
    } else {
        boundary
    };

    boundary.copysign(value)
}

fn format_boundary(boundary: f64) -> String {
    if boundary == 0.0 {
        return "0".to_string();
    }
    let exponent = decade(boundary.abs());
    if exponent < 0 {
        format!("{:.*}", (-exponent) as usize, boundary)
    } else {
        format!("{}", boundary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_accumulator() {
        let mut acc = Accumulator::for_key(MetricType::Counter, "foo");
        acc.push(5.0);
        acc.push(15.0);
        assert_eq!(
            acc.finalize(120),
            Point {
                ts: 120,
                value: PointValue::Sum { count: 20.0 }
            }
        );
    }

    #[test]
    fn test_large_values_survive_rounding() {
        let mut acc = Accumulator::for_key(MetricType::Counter, "big");
        acc.push(1e305);
        assert_eq!(acc.finalize(0).value, PointValue::Sum { count: 1e305 });

        let mut histogram = StreamingHistogram::default();
        histogram.push(-1e306);
        let stats = histogram.stats().unwrap();
        assert_eq!(stats.max, -1e306);
        assert_eq!(stats.p99, -1e306);

        assert_eq!(round4(1.23456789), 1.2346);
        assert_eq!(round4(4_503_599_627_370_497.0), 4_503_599_627_370_497.0);
    }

    #[test]
    fn test_histogram_stats() {
        let mut histogram = StreamingHistogram::default();
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            histogram.push(v);
        }

        let stats = histogram.stats().unwrap();
        assert_eq!(stats.count, 5);
        assert_eq!(stats.max, 5.0);
        assert_eq!(stats.mean, 3.0);
        assert_eq!(stats.std_dev, 1.4142);
        assert_eq!(stats.p10, 1.0);
        assert_eq!(stats.median, 3.0);
        assert_eq!(stats.p75, 4.0);
        assert_eq!(stats.p95, 5.0);
        assert_eq!(stats.p99, 5.0);
    }

    #[test]
    fn test_histogram_negative_max() {
        let mut histogram = StreamingHistogram::default();
        histogram.push(-3.0);
        histogram.push(-7.0);
        assert_eq!(histogram.stats().unwrap().max, -3.0);
    }

    #[test]
    fn test_histogram_bins_are_bounded() {
        let mut histogram = StreamingHistogram::default();
        for v in 0..1_000 {
            histogram.push(v as f64);
        }
        assert!(histogram.bins.len() <= MAX_HISTOGRAM_BINS);
        assert_eq!(histogram.count(), 1_000);

        let median = histogram.quantile(0.5);
        assert!((400.0..=600.0).contains(&median), "median={median}");
    }

    #[test]
    fn test_empty_histogram_finalizes_empty() {
        let acc = Accumulator::for_key(MetricType::Histogram, "foo");
        assert!(acc.finalize(0).is_empty());
    }

    #[test]
    fn test_quantize() {
        assert_eq!(quantize(0.0), 0.0);
        assert_eq!(quantize(1.0), 1.0);
        assert_eq!(quantize(9.99), 9.0);
        assert_eq!(quantize(347.0), 300.0);
        assert_eq!(quantize(1000.0), 1000.0);
        assert_eq!(quantize(0.0347), 0.03);
        assert_eq!(quantize(-42.0), -40.0);
    }

    #[test]
    fn test_log_linear_data() {
        let mut acc = Accumulator::for_key(MetricType::Histogram, "latency@llq");
        for v in [3.0, 3.5, 42.0, 0.25] {
            acc.push(v);
        }

        let Point { value, .. } = acc.finalize(0);
        let PointValue::LogLinear { data } = value else {
            panic!("expected log-linear point");
        };
        assert_eq!(data.get("3"), Some(&2));
        assert_eq!(data.get("40"), Some(&1));
        assert_eq!(data.get("0.2"), Some(&1));
    }
}
