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

//! Core data model for metrics aggregation
//!
//! Defines the wire-level sample format, the metrics key grammar and the
//! rollup points produced when a bucket is closed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Tag line prefixed to blocks forwarded between ring peers.
pub const RING_BATCH_TAG: &str = "RB";

/// Suffix marking a log-linear quantized histogram series.
pub const LLQ_SUFFIX: &str = "@llq";

/// Separator between rollup hierarchy levels.
pub const HIERARCHY_SEPARATOR: char = '|';

/// Separator used for scoping inside a key.
pub const SCOPE_SEPARATOR: char = '>';

/// Type of metric carried by a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Summed over each bucket
    Counter,
    /// Distribution of values within each bucket
    Histogram,
}

impl MetricType {
    /// Wire name of this type
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Histogram => "histogram",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(MetricType::Counter),
            "histogram" => Ok(MetricType::Histogram),
            other => Err(ParseError::UnknownType(other.to_string())),
        }
    }
}

/// Reasons a wire line is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("line is missing the type separator")]
    MissingType,
    #[error("line is missing the value separator")]
    MissingValue,
    #[error("unknown metric type {0:?}")]
    UnknownType(String),
    #[error("invalid metrics key {0:?}")]
    InvalidKey(String),
    #[error("invalid sample value {0:?}")]
    InvalidValue(String),
}

/// A single measurement addressed to a metrics key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub key: String,
    pub value: f64,
}

impl Sample {
    pub fn new(metric_type: MetricType, key: impl Into<String>, value: f64) -> Self {
        Self {
            metric_type,
            key: key.into(),
            value,
        }
    }

    /// Encode as a `type:key=value` wire line
    pub fn to_line(&self) -> String {
        format_line(self.metric_type, &self.key, self.value)
    }
}

/// Format a wire line without building a [`Sample`].
pub fn format_line(metric_type: MetricType, key: &str, value: f64) -> String {
    format!("{}:{}={}", metric_type, key, value)
}

/// Parse one `type:key=value` line.
pub fn parse_line(line: &str) -> Result<Sample, ParseError> {
    let (type_str, rest) = line.split_once(':').ok_or(ParseError::MissingType)?;
    let metric_type: MetricType = type_str.parse()?;
    let (key, value_str) = rest.rsplit_once('=').ok_or(ParseError::MissingValue)?;

    if !is_valid_key(key) {
        return Err(ParseError::InvalidKey(key.to_string()));
    }

    let value = parse_value(value_str)?;
    Ok(Sample::new(metric_type, key, value))
}

fn parse_value(s: &str) -> Result<f64, ParseError> {
    let looks_numeric = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'));
    if !looks_numeric {
        return Err(ParseError::InvalidValue(s.to_string()));
    }
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ParseError::InvalidValue(s.to_string())),
    }
}

/// A decoded ingest block
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    /// Whether the block carried the ring batch tag
    pub forwarded: bool,
    pub samples: Vec<Sample>,
    /// Number of lines dropped as malformed
    pub rejected: usize,
}

/// Decode a UDP datagram or HTTP body into samples.
///
/// Blank lines are ignored; malformed lines are counted and dropped.
pub fn parse_batch(body: &str) -> Batch {
    let (forwarded, body) = match body.strip_prefix(RING_BATCH_TAG) {
        Some(rest) if rest.starts_with('\n') => (true, &rest[1..]),
        _ => (false, body),
    };

    let mut batch = Batch {
        forwarded,
        ..Batch::default()
    };

    for line in body.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            Ok(sample) => batch.samples.push(sample),
            Err(err) => {
                tracing::trace!(%err, line, "dropping malformed line");
                batch.rejected += 1;
            }
        }
    }

    batch
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '/' | '.' | '(' | ')' | '+' | ':' | '-')
}

fn is_separator(c: char) -> bool {
    c == HIERARCHY_SEPARATOR || c == SCOPE_SEPARATOR
}

/// Check a metrics key against the key grammar.
pub fn is_valid_key(key: &str) -> bool {
    let body = key.strip_suffix(LLQ_SUFFIX).unwrap_or(key);
    if body.is_empty() {
        return false;
    }

    let mut previous_was_separator = true;
    for c in body.chars() {
        if is_separator(c) {
            if previous_was_separator {
                return false;
            }
            previous_was_separator = true;
        } else if is_key_char(c) {
            previous_was_separator = false;
        } else {
            return false;
        }
    }

    !previous_was_separator
}

/// Whether the key names a log-linear quantized series
pub fn is_llq_key(key: &str) -> bool {
    key.ends_with(LLQ_SUFFIX)
}

/// The rollup prefixes of a key, coarsest first: `a|b|c` yields `a`, `a|b`, `a|b|c`.
pub fn rollup_prefixes(key: &str) -> impl Iterator<Item = &str> {
    key.match_indices(HIERARCHY_SEPARATOR)
        .map(move |(idx, _)| &key[..idx])
        .chain(std::iter::once(key))
}

/// Wrapper for f64 that implements Ord for use in BTreeMap
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct OrderedFloat(pub f64);

impl Eq for OrderedFloat {}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
    }
}

/// A finalized bucket for one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Start of the bucket, milliseconds since the epoch
    pub ts: i64,
    #[serde(flatten)]
    pub value: PointValue,
}

/// Accumulator-specific fields of a [`Point`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointValue {
    /// No samples arrived in the bucket
    Empty { empty: bool },
    Histogram(HistogramStats),
    LogLinear { data: BTreeMap<String, u64> },
    Sum { count: f64 },
}

/// Summary statistics of a histogram bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramStats {
    pub count: u64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub p10: f64,
    pub median: f64,
    pub p75: f64,
    pub p95: f64,
    pub p99: f64,
}

impl Point {
    pub fn empty(ts: i64) -> Self {
        Self {
            ts,
            value: PointValue::Empty { empty: true },
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.value, PointValue::Empty { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_grammar_accepts() {
        for key in ["abc", "a|b", "a>b", "a/b.c", "abc@llq", "a b(c)+d:e-f_g", "a|b>c@llq"] {
            assert!(is_valid_key(key), "expected {key:?} to be valid");
        }
    }

    #[test]
    fn test_key_grammar_rejects() {
        for key in [
            "", "|a", "a|", "a||b", "a>>b", "a|>b", "a!", "a\tb", "a\nb", "@llq", "a|@llq",
            "a=b",
        ] {
            assert!(!is_valid_key(key), "expected {key:?} to be invalid");
        }
    }

    #[test]
    fn test_parse_line() {
        let sample = parse_line("counter:foo|bar=5").unwrap();
        assert_eq!(sample, Sample::new(MetricType::Counter, "foo|bar", 5.0));

        let sample = parse_line("histogram:a:b=-1.25").unwrap();
        assert_eq!(sample, Sample::new(MetricType::Histogram, "a:b", -1.25));
    }

    #[test]
    fn test_parse_line_errors() {
        assert_eq!(parse_line("counter"), Err(ParseError::MissingType));
        assert_eq!(parse_line("counter:foo"), Err(ParseError::MissingValue));
        assert_eq!(
            parse_line("gauge:foo=1"),
            Err(ParseError::UnknownType("gauge".to_string()))
        );
        assert_eq!(
            parse_line("counter:a||b=1"),
            Err(ParseError::InvalidKey("a||b".to_string()))
        );
        assert_eq!(
            parse_line("counter:foo=inf"),
            Err(ParseError::InvalidValue("inf".to_string()))
        );
        assert_eq!(
            parse_line("counter:foo="),
            Err(ParseError::InvalidValue(String::new()))
        );
    }

    #[test]
    fn test_parse_batch_with_ring_tag() {
        let batch = parse_batch("RB\ncounter:foo=1\nbogus\n\nhistogram:bar=2\n");
        assert!(batch.forwarded);
        assert_eq!(batch.samples.len(), 2);
        assert_eq!(batch.rejected, 1);

        let batch = parse_batch("counter:foo=1");
        assert!(!batch.forwarded);
        assert_eq!(batch.samples.len(), 1);
    }

    #[test]
    fn test_rollup_prefixes() {
        let prefixes: Vec<_> = rollup_prefixes("A|B|C").collect();
        assert_eq!(prefixes, vec!["A", "A|B", "A|B|C"]);

        let prefixes: Vec<_> = rollup_prefixes("a>b").collect();
        assert_eq!(prefixes, vec!["a>b"]);
    }

    #[test]
    fn test_point_serialization() {
        let point = Point {
            ts: 60_000,
            value: PointValue::Sum { count: 20.0 },
        };
        let json = serde_json::to_value(&point).unwrap();
        assert_eq!(json, serde_json::json!({"ts": 60000, "count": 20.0}));

        let empty = serde_json::to_value(Point::empty(0)).unwrap();
        assert_eq!(empty, serde_json::json!({"ts": 0, "empty": true}));

        let back: Point = serde_json::from_value(json).unwrap();
        assert_eq!(back, point);
    }
}
