// ABOUTME: Generates placeholder workers for descriptors whose executable is missing
// ABOUTME: Output is a deterministic sh script cycling synthetic metric records

use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use crate::error::ScaffoldError;
use crate::registry::Descriptor;
use crate::wire::MetricsRecord;

/// Second line of every generated script; used to recognize placeholders.
pub const PLACEHOLDER_MARKER: &str = "# subvisor placeholder worker";

/// Records per cycle of the synthetic waveform.
const STEPS: usize = 8;

/// Writes placeholder workers.
#[derive(Debug, Clone)]
pub struct Scaffolder {
    enabled: bool,
    cadence: Duration,
}

impl Default for Scaffolder {
    fn default() -> Self {
        Self::new(true, Duration::from_secs(1))
    }
}

impl Scaffolder {
    pub fn new(enabled: bool, cadence: Duration) -> Self {
        Self { enabled, cadence }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Make sure the descriptor's executable exists, generating a placeholder if needed.
    /// Returns true when a placeholder was written.
    pub fn ensure(&self, descriptor: &Descriptor) -> Result<bool, ScaffoldError> {
        let path = descriptor.path.as_path();
        if path.exists() {
            return Ok(false);
        }
        if !self.enabled {
            return Err(ScaffoldError::Disabled(path.to_path_buf()));
        }

        let script = self.render(descriptor);
        write_executable(path, &script).map_err(|source| ScaffoldError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::info!(
            id = %descriptor.id,
            path = %path.display(),
            metrics = descriptor.metrics.len(),
            "Scaffolded placeholder worker"
        );
        Ok(true)
    }

    /// The placeholder script for a descriptor. Same descriptor, same bytes.
    pub fn render(&self, descriptor: &Descriptor) -> String {
        let mut script = String::new();
        script.push_str("#!/bin/sh\n");
        script.push_str(PLACEHOLDER_MARKER);
        script.push('\n');
        let _ = writeln!(script, "# id: {}", descriptor.id);
        script.push_str("# Replace this file with the real worker.\n");
        let _ = writeln!(
            script,
            "echo {}",
            shell_quote(&format!("placeholder worker for {} started", descriptor.id))
        );
        script.push_str("while :; do\n");
        for step in 0..STEPS {
            let line = synthetic_record(descriptor, step).to_line();
            let _ = writeln!(script, "  echo {}", shell_quote(&line));
            let _ = writeln!(script, "  sleep {}", format_seconds(self.cadence));
        }
        script.push_str("done\n");
        script
    }

    /// Whether the file at `path` is a generated placeholder.
    pub fn is_placeholder(path: &Path) -> bool {
        std::fs::read_to_string(path)
            .map(|content| content.lines().nth(1) == Some(PLACEHOLDER_MARKER))
            .unwrap_or(false)
    }
}

/// Value oscillating inside the threshold band (or 0..100 without one).
fn synthetic_record(descriptor: &Descriptor, step: usize) -> MetricsRecord {
    let phase = std::f64::consts::TAU * step as f64 / STEPS as f64;
    let mut record = MetricsRecord::new(descriptor.id.clone());
    for spec in &descriptor.metrics {
        let (min, max) = spec
            .threshold
            .map(|t| (t.min, t.max))
            .unwrap_or((0.0, 100.0));
        let mid = (min + max) / 2.0;
        let amplitude = (max - min) * 0.4;
        let value = ((mid + amplitude * phase.sin()) * 1000.0).round() / 1000.0;
        record = record.with_metric(spec.name.clone(), value);
    }
    record
}

fn format_seconds(cadence: Duration) -> String {
    let millis = cadence.as_millis().max(1);
    if millis % 1000 == 0 {
        format!("{}", millis / 1000)
    } else {
        format!("{}.{:03}", millis / 1000, millis % 1000)
    }
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

fn write_executable(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }

    Ok(())
}
