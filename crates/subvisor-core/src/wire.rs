// ABOUTME: Line-oriented wire records emitted on a worker's stdout
// ABOUTME: Parses "metrics" records; every other line becomes an Opaque diagnostic

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::WireError;

/// Discriminant value for metric records.
pub const METRICS_KIND: &str = "metrics";

/// One parsed stdout line.
#[derive(Debug)]
pub enum WireRecord {
    Metrics(MetricsRecord),
    /// Anything that is not a recognized record. Never fatal.
    Opaque { text: String, reason: WireError },
}

/// Payload of a `{"kind":"metrics", ...}` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub subprocess_id: String,
    pub metrics: BTreeMap<String, f64>,
    /// Unix seconds as reported by the producer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl WireRecord {
    /// Interpret a line. Lines that do not conform map to [`WireRecord::Opaque`].
    pub fn parse(line: &str) -> Self {
        match parse_metrics(line) {
            Ok(record) => WireRecord::Metrics(record),
            Err(reason) => WireRecord::Opaque {
                text: line.to_string(),
                reason,
            },
        }
    }
}

impl MetricsRecord {
    pub fn new(subprocess_id: impl Into<String>) -> Self {
        Self {
            subprocess_id: subprocess_id.into(),
            metrics: BTreeMap::new(),
            timestamp: None,
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Producer timestamp, if present and representable.
    pub fn produced_at(&self) -> Option<DateTime<Utc>> {
        let ts = self.timestamp?;
        if !ts.is_finite() {
            return None;
        }
        let secs = ts.floor();
        let nanos = ((ts - secs) * 1e9) as u32;
        DateTime::from_timestamp(secs as i64, nanos)
    }

    /// Serialize as a single wire line (no trailing newline).
    pub fn to_line(&self) -> String {
        let mut value = serde_json::json!({ "kind": METRICS_KIND });
        if let (Value::Object(map), Ok(Value::Object(body))) =
            (&mut value, serde_json::to_value(self))
        {
            map.extend(body);
        }
        value.to_string()
    }
}

fn parse_metrics(line: &str) -> Result<MetricsRecord, WireError> {
    let value: Value = match serde_json::from_str(line.trim()) {
        Ok(value @ Value::Object(_)) => value,
        _ => return Err(WireError::NotJson(truncate(line, 200))),
    };

    let kind = value
        .get("kind")
        .and_then(|k| k.as_str())
        .ok_or(WireError::MissingKind)?;

    match kind {
        METRICS_KIND => serde_json::from_value(value).map_err(|e| WireError::Malformed {
            kind: METRICS_KIND,
            reason: e.to_string(),
        }),
        other => Err(WireError::UnknownKind(other.to_string())),
    }
}

fn truncate(line: &str, max_chars: usize) -> String {
    if line.chars().count() > max_chars {
        let truncated: String = line.chars().take(max_chars).collect();
        format!("{}...[truncated]", truncated)
    } else {
        line.to_string()
    }
}
