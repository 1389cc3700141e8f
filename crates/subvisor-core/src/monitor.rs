// ABOUTME: Per-subprocess task that reads worker output and feeds the metric store
// ABOUTME: Detects self-exit and reports it; never signals or kills the process itself

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::WireError;
use crate::metrics::MetricWriter;
use crate::process::{BoxedReader, ProcessOutput};
use crate::supervisor::{Liveness, ProcessTable};
use crate::wire::WireRecord;

type LineReader = Lines<BufReader<BoxedReader>>;

/// Default interval between liveness checks when the worker is silent.
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_millis(500);

/// How long to keep reading stdout after the worker exits. A background child that
/// inherited the pipe can hold it open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

enum Step {
    Cancelled,
    Stdout(Option<String>),
    Stderr(Option<String>),
    Tick,
}

/// Reads one worker's output. Bound to a single id through its [`MetricWriter`].
pub struct OutputMonitor {
    writer: MetricWriter,
    table: Arc<ProcessTable>,
    liveness_interval: Duration,
    cancel: CancellationToken,
}

impl OutputMonitor {
    pub(crate) fn new(
        writer: MetricWriter,
        table: Arc<ProcessTable>,
        liveness_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            writer,
            table,
            liveness_interval,
            cancel,
        }
    }

    /// Run until cancelled or the worker exits on its own.
    pub async fn run(self, output: ProcessOutput) {
        let id = self.writer.id().to_string();
        let mut stdout: Option<LineReader> = output.stdout.map(|s| BufReader::new(s).lines());
        let mut stderr: Option<LineReader> = output.stderr.map(|s| BufReader::new(s).lines());

        let mut tick = tokio::time::interval(self.liveness_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(id = %id, "Output monitor started");

        loop {
            let step = tokio::select! {
                _ = self.cancel.cancelled() => Step::Cancelled,
                line = next_line(&mut stdout) => Step::Stdout(line),
                line = next_line(&mut stderr) => Step::Stderr(line),
                _ = tick.tick() => Step::Tick,
            };

            match step {
                Step::Cancelled => {
                    tracing::debug!(id = %id, "Output monitor cancelled");
                    break;
                }
                Step::Stdout(Some(line)) => self.handle_line(&line),
                Step::Stdout(None) => {
                    tracing::debug!(id = %id, "Worker stdout closed");
                    stdout = None;
                    if self.exited() {
                        break;
                    }
                }
                Step::Stderr(Some(line)) => {
                    tracing::debug!(id = %id, stderr = %line, "Worker stderr");
                }
                Step::Stderr(None) => stderr = None,
                Step::Tick => {
                    // Records already written must land before the exit is reported.
                    if stdout.is_some() && self.table.has_exited(&id) {
                        self.drain(&mut stdout).await;
                    }
                    if stdout.is_none() && self.exited() {
                        break;
                    }
                }
            }
        }
    }

    fn handle_line(&self, line: &str) {
        let id = self.writer.id();
        if line.trim().is_empty() {
            return;
        }

        match WireRecord::parse(line) {
            WireRecord::Metrics(record) => {
                if record.subprocess_id != id {
                    tracing::warn!(
                        id = %id,
                        claimed = %record.subprocess_id,
                        "Discarding metrics tagged for another subprocess"
                    );
                    return;
                }
                for (name, value) in &record.metrics {
                    self.writer.update(name, *value);
                }
                let at = record.produced_at().unwrap_or_else(Utc::now);
                self.table.publish_update(id, at);
            }
            WireRecord::Opaque {
                text,
                reason: WireError::NotJson(_),
            } => {
                tracing::debug!(id = %id, line = %text, "Worker output");
            }
            WireRecord::Opaque { reason, .. } => {
                tracing::warn!(id = %id, reason = %reason, "Ignoring unrecognized worker record");
            }
        }
    }

    /// Apply whatever is left in stdout, up to EOF or [`DRAIN_TIMEOUT`].
    async fn drain(&self, stdout: &mut Option<LineReader>) {
        let Some(lines) = stdout.as_mut() else {
            return;
        };
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => self.handle_line(&line),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(id = %self.writer.id(), error = %e, "Worker output stream failed");
                        break;
                    }
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(id = %self.writer.id(), "Worker stdout still open after exit");
        }
        *stdout = None;
    }

    fn exited(&self) -> bool {
        match self.table.reap_if_exited(self.writer.id()) {
            Liveness::Alive => false,
            Liveness::Exited(code) => {
                tracing::debug!(id = %self.writer.id(), code = ?code, "Output monitor finished");
                true
            }
        }
    }
}

/// Next line from an optional reader. A closed or failed stream never resolves again.
async fn next_line(reader: &mut Option<LineReader>) -> Option<String> {
    let Some(lines) = reader.as_mut() else {
        return std::future::pending().await;
    };
    match lines.next_line().await {
        Ok(line) => line,
        Err(e) => {
            tracing::debug!(error = %e, "Worker output stream failed");
            None
        }
    }
}
