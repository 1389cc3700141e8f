// ABOUTME: Plain-text rendering of subprocess snapshots and events for the CLI.
// ABOUTME: Out-of-range metrics are marked with a trailing "!".

use std::fmt::Write as _;
use subvisor_core::{Event, MetricReading, SubprocessInfo};

/// Multi-line table of every subprocess with its metrics.
pub fn table(subprocesses: &[SubprocessInfo]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<18} {:<9} {:>8}  {:<8} NAME",
        "ID", "STATUS", "PID", "CATEGORY"
    );
    for info in subprocesses {
        let pid = info
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "{:<18} {:<9} {:>8}  {:<8} {}",
            info.id,
            info.status.to_string(),
            pid,
            info.category.to_string(),
            info.name
        );
        if let Some(ref error) = info.error {
            let _ = writeln!(out, "    error: {}", error);
        }
        for (name, reading) in &info.metrics {
            let _ = writeln!(out, "    {}", metric(name, reading));
        }
    }
    out
}

/// One-line result of a control action.
pub fn summary(info: &SubprocessInfo) -> String {
    let mut line = format!("{}: {}", info.id, info.status);
    if let Some(pid) = info.pid {
        let _ = write!(line, " (pid {})", pid);
    }
    if let Some(ref error) = info.error {
        let _ = write!(line, ": {}", error);
    }
    line
}

pub fn event(event: &Event) -> String {
    match event {
        Event::Status {
            subprocess_id,
            status,
            error,
            pid,
            timestamp,
        } => {
            let mut line = format!(
                "{} {} status {}",
                timestamp.format("%H:%M:%S%.3f"),
                subprocess_id,
                status
            );
            if let Some(pid) = pid {
                let _ = write!(line, " pid={}", pid);
            }
            if let Some(error) = error {
                let _ = write!(line, " error={}", error);
            }
            line
        }
        Event::Update {
            subprocess_id,
            metrics,
            timestamp,
            ..
        } => {
            let values: Vec<String> = metrics
                .iter()
                .filter(|(_, reading)| reading.value.is_some())
                .map(|(name, reading)| metric(name, reading))
                .collect();
            format!(
                "{} {} update {}",
                timestamp.format("%H:%M:%S%.3f"),
                subprocess_id,
                values.join(", ")
            )
        }
    }
}

fn metric(name: &str, reading: &MetricReading) -> String {
    let mut text = match reading.value {
        Some(value) => format!("{}={}", name, value),
        None => format!("{}=-", name),
    };
    if !reading.unit.is_empty() {
        let _ = write!(text, " {}", reading.unit);
    }
    if let Some(threshold) = reading.threshold {
        let _ = write!(text, " [{}..{}]", threshold.min, threshold.max);
    }
    if reading.out_of_range {
        text.push_str(" !");
    }
    text
}
