// ABOUTME: Registry configuration for the subvisor daemon.
// ABOUTME: Loaded from a TOML file with sensible defaults; relative paths resolve against the file.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::registry::{Category, Descriptor, MetricSpec, Registry};
use crate::scaffold::Scaffolder;
use crate::supervisor::SupervisorOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSettings {
    /// Wait after SIGTERM before a forced kill
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// How often a silent worker is checked for exit
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,

    /// Events buffered per subscriber before the oldest is dropped
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            liveness_interval_ms: default_liveness_interval_ms(),
            subscriber_queue: default_subscriber_queue(),
        }
    }
}

fn default_grace_period_ms() -> u64 {
    5000
}

fn default_liveness_interval_ms() -> u64 {
    500
}

fn default_subscriber_queue() -> usize {
    256
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaffoldSettings {
    /// Generate placeholder workers for missing executables
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Delay between records emitted by a placeholder
    #[serde(default = "default_cadence_ms")]
    pub cadence_ms: u64,
}

impl Default for ScaffoldSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cadence_ms: default_cadence_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cadence_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub supervisor: SupervisorSettings,

    #[serde(default)]
    pub scaffold: ScaffoldSettings,

    /// Managed subprocesses, in display order
    #[serde(default, rename = "subprocess")]
    pub subprocesses: Vec<Descriptor>,
}

impl Config {
    /// Load config from a TOML file, resolving paths and validating.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        // Worker paths are relative to the config file, wherever the daemon runs from.
        let absolute = std::path::absolute(path)
            .with_context(|| format!("Failed to resolve config path {}", path.display()))?;
        let base = absolute.parent().unwrap_or_else(|| Path::new("/"));
        config.resolve_paths(base);
        config
            .validate()
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        Ok(config)
    }

    /// Save config to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }

    /// Get the default config file path (~/.config/subvisor/registry.toml)
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".config"))
                    .context("Could not determine home directory")
            })?;
        Ok(config_dir.join("subvisor").join("registry.toml"))
    }

    /// Expand `~` and anchor relative paths at `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        for descriptor in &mut self.subprocesses {
            descriptor.path = resolve(base, &descriptor.path);
            if let Some(ref dir) = descriptor.working_dir {
                descriptor.working_dir = Some(resolve(base, dir));
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.supervisor.grace_period_ms == 0 {
            bail!("supervisor.grace_period_ms must be greater than zero");
        }
        if self.supervisor.liveness_interval_ms == 0 {
            bail!("supervisor.liveness_interval_ms must be greater than zero");
        }
        if self.supervisor.subscriber_queue == 0 {
            bail!("supervisor.subscriber_queue must be greater than zero");
        }
        if self.scaffold.cadence_ms == 0 {
            bail!("scaffold.cadence_ms must be greater than zero");
        }
        self.registry().map(|_| ())
    }

    /// Build the validated registry.
    pub fn registry(&self) -> Result<Registry> {
        Registry::new(self.subprocesses.clone())
    }

    pub fn options(&self) -> SupervisorOptions {
        SupervisorOptions {
            grace_period: Duration::from_millis(self.supervisor.grace_period_ms),
            liveness_interval: Duration::from_millis(self.supervisor.liveness_interval_ms),
            subscriber_queue: self.supervisor.subscriber_queue,
            scaffolder: Scaffolder::new(
                self.scaffold.enabled,
                Duration::from_millis(self.scaffold.cadence_ms),
            ),
        }
    }

    /// Starter catalog written by `subvisor init`. Worker paths are relative to the config file.
    pub fn sample() -> Self {
        let subprocesses = vec![
            Descriptor::new("neural_sync", "workers/neural_sync.sh", Category::Neural)
                .with_name("Neural Sync")
                .with_metric(MetricSpec::new("sync_rate", "%").with_threshold(60.0, 95.0))
                .with_metric(MetricSpec::new("latency", "ms").with_threshold(0.0, 250.0)),
            Descriptor::new("quantum_flux", "workers/quantum_flux.sh", Category::Quantum)
                .with_name("Quantum Flux")
                .with_metric(MetricSpec::new("coherence", "").with_threshold(0.0, 1.0))
                .with_metric(MetricSpec::new("entropy", "bits")),
            Descriptor::new("system_vitals", "workers/system_vitals.sh", Category::System)
                .with_name("System Vitals")
                .with_metric(MetricSpec::new("cpu", "%").with_threshold(0.0, 90.0))
                .with_metric(MetricSpec::new("load", "")),
            Descriptor::new("memory_lattice", "workers/memory_lattice.sh", Category::Memory)
                .with_name("Memory Lattice")
                .with_metric(MetricSpec::new("resident", "MB").with_threshold(0.0, 2048.0)),
            Descriptor::new("io_bridge", "workers/io_bridge.sh", Category::Io)
                .with_name("IO Bridge")
                .with_metric(MetricSpec::new("throughput", "KB/s"))
                .with_metric(MetricSpec::new("queue_depth", "").with_threshold(0.0, 64.0)),
        ];

        Self {
            supervisor: SupervisorSettings::default(),
            scaffold: ScaffoldSettings::default(),
            subprocesses,
        }
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    let expanded: PathBuf = shellexpand::tilde(&path.to_string_lossy())
        .into_owned()
        .into();
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}
