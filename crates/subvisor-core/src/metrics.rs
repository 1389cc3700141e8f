// ABOUTME: Current metric values per (subprocess id, metric name)
// ABOUTME: Last-write-wins; out-of-threshold values are flagged, never clamped

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use crate::registry::{Registry, Threshold};

/// A metric as seen by consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReading {
    /// Last reported value; `None` until the worker reports it
    pub value: Option<f64>,
    pub unit: String,
    pub threshold: Option<Threshold>,
    /// True when a value exists and lies outside the threshold
    pub out_of_range: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    unit: String,
    threshold: Option<Threshold>,
    value: Option<f64>,
    updated_at: Option<DateTime<Utc>>,
}

impl Slot {
    fn reading(&self) -> MetricReading {
        let out_of_range = match (self.value, self.threshold) {
            (Some(value), Some(threshold)) => !threshold.contains(value),
            _ => false,
        };
        MetricReading {
            value: self.value,
            unit: self.unit.clone(),
            threshold: self.threshold,
            out_of_range,
            updated_at: self.updated_at,
        }
    }
}

/// Shared metric table. Many readers; each id is written only through its [`MetricWriter`].
#[derive(Debug, Default)]
pub struct MetricStore {
    inner: RwLock<HashMap<String, BTreeMap<String, Slot>>>,
}

impl MetricStore {
    /// Seed declared metrics (unit and threshold, no value) for every descriptor.
    pub fn new(registry: &Registry) -> Self {
        let mut table = HashMap::new();
        for descriptor in registry.iter() {
            let slots: BTreeMap<String, Slot> = descriptor
                .metrics
                .iter()
                .map(|spec| {
                    (
                        spec.name.clone(),
                        Slot {
                            unit: spec.unit.clone(),
                            threshold: spec.threshold,
                            ..Slot::default()
                        },
                    )
                })
                .collect();
            table.insert(descriptor.id.clone(), slots);
        }
        Self {
            inner: RwLock::new(table),
        }
    }

    /// Record a value. Undeclared names are accepted with no unit and no threshold.
    /// Outside this crate, writes go through a [`MetricWriter`].
    pub(crate) fn update(&self, id: &str, name: &str, value: f64) {
        let now = Utc::now();
        let mut table = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let slot = table
            .entry(id.to_string())
            .or_default()
            .entry(name.to_string())
            .or_default();
        slot.value = Some(value);
        slot.updated_at = Some(now);
    }

    /// Current readings for one id, keyed by metric name. Empty for unknown ids.
    pub fn snapshot(&self, id: &str) -> BTreeMap<String, MetricReading> {
        let table = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        table
            .get(id)
            .map(|slots| {
                slots
                    .iter()
                    .map(|(name, slot)| (name.clone(), slot.reading()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get(&self, id: &str, name: &str) -> Option<MetricReading> {
        let table = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        table.get(id)?.get(name).map(Slot::reading)
    }

    /// A handle that can only write metrics for `id`.
    pub(crate) fn writer(self: &Arc<Self>, id: impl Into<String>) -> MetricWriter {
        MetricWriter {
            store: Arc::clone(self),
            id: id.into(),
        }
    }
}

/// Write access to a single subprocess's metrics.
///
/// The store itself cannot be written from outside this crate:
///
/// ```compile_fail
/// use std::sync::Arc;
/// use subvisor_core::{MetricStore, Registry};
///
/// let store = Arc::new(MetricStore::new(&Registry::new(Vec::new()).unwrap()));
/// store.update("neural_sync", "sync_rate", 97.2);
/// ```
#[derive(Debug, Clone)]
pub struct MetricWriter {
    store: Arc<MetricStore>,
    id: String,
}

impl MetricWriter {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn update(&self, name: &str, value: f64) {
        self.store.update(&self.id, name, value);
    }

    pub fn snapshot(&self) -> BTreeMap<String, MetricReading> {
        self.store.snapshot(&self.id)
    }
}
