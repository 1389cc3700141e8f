// ABOUTME: Static catalog of manageable subprocess descriptors.
// ABOUTME: Descriptors are validated once at load and never change afterwards.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// Domain tag for a subprocess. Opaque to the supervisor; carried through to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Neural,
    Quantum,
    System,
    Memory,
    Io,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Category::Neural => "neural",
            Category::Quantum => "quantum",
            Category::System => "system",
            Category::Memory => "memory",
            Category::Io => "io",
        };
        f.write_str(tag)
    }
}

/// Inclusive valid range for a metric value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub min: f64,
    pub max: f64,
}

impl Threshold {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// A metric a subprocess declares it will report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub name: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<Threshold>,
}

impl MetricSpec {
    pub fn new(name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            threshold: None,
        }
    }

    pub fn with_threshold(mut self, min: f64, max: f64) -> Self {
        self.threshold = Some(Threshold::new(min, max));
        self
    }
}

/// Static description of one managed subprocess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Unique, stable identifier
    pub id: String,
    /// Human readable name (defaults to the id)
    #[serde(default)]
    pub name: String,
    /// Executable or script to launch
    pub path: PathBuf,
    pub category: Category,
    /// Extra arguments passed after the executable
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Extra environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Working directory (defaults to the executable's parent directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Start when the daemon boots
    #[serde(default)]
    pub autostart: bool,
    /// Declared metrics with units and thresholds
    #[serde(default, rename = "metric", skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricSpec>,
}

impl Descriptor {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>, category: Category) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            path: path.into(),
            category,
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            autostart: false,
            metrics: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_metric(mut self, metric: MetricSpec) -> Self {
        self.metrics.push(metric);
        self
    }

    pub fn metric(&self, name: &str) -> Option<&MetricSpec> {
        self.metrics.iter().find(|m| m.name == name)
    }
}

/// The fixed set of subprocesses a supervisor manages.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    descriptors: Vec<Descriptor>,
}

impl Registry {
    /// Build a registry, rejecting duplicate ids, duplicate metric names and inverted thresholds.
    pub fn new(descriptors: Vec<Descriptor>) -> Result<Self> {
        let mut ids = HashSet::new();
        let mut descriptors = descriptors;

        for descriptor in &mut descriptors {
            if descriptor.id.trim().is_empty() {
                bail!("subprocess id must not be empty");
            }
            if !ids.insert(descriptor.id.clone()) {
                bail!("duplicate subprocess id '{}'", descriptor.id);
            }
            if descriptor.name.is_empty() {
                descriptor.name = descriptor.id.clone();
            }

            let mut names = HashSet::new();
            for metric in &descriptor.metrics {
                if !names.insert(metric.name.as_str()) {
                    bail!(
                        "duplicate metric '{}' on subprocess '{}'",
                        metric.name,
                        descriptor.id
                    );
                }
                if let Some(threshold) = metric.threshold {
                    if threshold.min.is_nan()
                        || threshold.max.is_nan()
                        || threshold.min > threshold.max
                    {
                        bail!(
                            "threshold for '{}.{}' needs min <= max, got {}..{}",
                            descriptor.id,
                            metric.name,
                            threshold.min,
                            threshold.max
                        );
                    }
                }
            }
        }

        Ok(Self { descriptors })
    }

    pub fn get(&self, id: &str) -> Option<&Descriptor> {
        self.descriptors.iter().find(|d| d.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Descriptors in load order.
    pub fn iter(&self) -> impl Iterator<Item = &Descriptor> {
        self.descriptors.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.descriptors.iter().map(|d| d.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neural_sync() -> Descriptor {
        Descriptor::new("neural_sync", "/opt/workers/neural_sync.sh", Category::Neural)
            .with_metric(MetricSpec::new("sync_rate", "%").with_threshold(60.0, 95.0))
    }

    #[test]
    fn test_threshold_contains_is_inclusive() {
        let t = Threshold::new(60.0, 95.0);
        assert!(t.contains(60.0));
        assert!(t.contains(95.0));
        assert!(t.contains(77.5));
        assert!(!t.contains(97.2));
        assert!(!t.contains(59.9));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = Registry::new(vec![neural_sync()]).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("neural_sync"));
        assert!(registry.get("quantum_flux").is_none());

        let d = registry.get("neural_sync").unwrap();
        assert_eq!(d.category, Category::Neural);
        assert_eq!(d.metric("sync_rate").unwrap().unit, "%");
    }

    #[test]
    fn test_registry_rejects_duplicate_ids() {
        let err = Registry::new(vec![neural_sync(), neural_sync()]).unwrap_err();
        assert!(err.to_string().contains("duplicate subprocess id"));
    }

    #[test]
    fn test_registry_rejects_empty_id() {
        let d = Descriptor::new("  ", "/bin/true", Category::System);
        let err = Registry::new(vec![d]).unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn test_registry_rejects_duplicate_metric() {
        let d = neural_sync().with_metric(MetricSpec::new("sync_rate", "%"));
        let err = Registry::new(vec![d]).unwrap_err();
        assert!(err.to_string().contains("duplicate metric"));
    }

    #[test]
    fn test_registry_rejects_inverted_threshold() {
        let d = Descriptor::new("heat", "/bin/true", Category::System)
            .with_metric(MetricSpec::new("temp", "C").with_threshold(90.0, 10.0));
        let err = Registry::new(vec![d]).unwrap_err();
        assert!(err.to_string().contains("needs min <= max, got 90..10"));
    }

    #[test]
    fn test_registry_rejects_nan_threshold() {
        let d = Descriptor::new("heat", "/bin/true", Category::System)
            .with_metric(MetricSpec::new("temp", "C").with_threshold(f64::NAN, 10.0));
        let err = Registry::new(vec![d]).unwrap_err();
        assert!(err.to_string().contains("needs min <= max, got NaN..10"));

        let d = Descriptor::new("heat", "/bin/true", Category::System)
            .with_metric(MetricSpec::new("temp", "C").with_threshold(0.0, f64::NAN));
        assert!(Registry::new(vec![d]).is_err());
    }

    #[test]
    fn test_registry_defaults_name_to_id() {
        let mut d = Descriptor::new("io_bridge", "/bin/true", Category::Io);
        d.name = String::new();
        let registry = Registry::new(vec![d]).unwrap();
        assert_eq!(registry.get("io_bridge").unwrap().name, "io_bridge");
    }

    #[test]
    fn test_registry_preserves_load_order() {
        let registry = Registry::new(vec![
            Descriptor::new("b", "/bin/true", Category::Io),
            Descriptor::new("a", "/bin/true", Category::Memory),
        ])
        .unwrap();
        let ids: Vec<&str> = registry.ids().collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_category_serde_lowercase() {
        let json = serde_json::to_string(&Category::Quantum).unwrap();
        assert_eq!(json, "\"quantum\"");
        let parsed: Category = serde_json::from_str("\"io\"").unwrap();
        assert_eq!(parsed, Category::Io);
        assert_eq!(Category::Memory.to_string(), "memory");
    }
}
