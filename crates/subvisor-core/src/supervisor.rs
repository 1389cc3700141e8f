// ABOUTME: ProcessSupervisor owns worker processes and drives their lifecycle state machine
// ABOUTME: start/stop/restart are serialized per id; every transition is broadcast as it happens

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as OpLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broadcast::{Broadcaster, Subscription, DEFAULT_QUEUE_CAPACITY};
use crate::error::SupervisorError;
use crate::event::{Event, Status};
use crate::metrics::{MetricReading, MetricStore};
use crate::monitor::{OutputMonitor, DEFAULT_LIVENESS_INTERVAL};
use crate::process::{ChildProcess, LaunchSpec, ManagedProcess};
use crate::registry::{Category, Descriptor, Registry};
use crate::scaffold::Scaffolder;

/// Default wait between the graceful signal and a forced kill.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long `stop` waits for a cancelled monitor to wind down.
const MONITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Control actions accepted by [`ProcessSupervisor::control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Start,
    Stop,
    Restart,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Start => f.write_str("start"),
            Action::Stop => f.write_str("stop"),
            Action::Restart => f.write_str("restart"),
        }
    }
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Action::Start),
            "stop" => Ok(Action::Stop),
            "restart" => Ok(Action::Restart),
            other => Err(format!("unknown action: {}", other)),
        }
    }
}

/// Point-in-time view of one subprocess, as returned by `list` and `control`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubprocessInfo {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub category: Category,
    pub status: Status,
    pub pid: Option<u32>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub metrics: BTreeMap<String, MetricReading>,
    pub last_update: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub autostart: bool,
}

/// Tunables for a supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub grace_period: Duration,
    pub liveness_interval: Duration,
    pub subscriber_queue: usize,
    pub scaffolder: Scaffolder,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
            subscriber_queue: DEFAULT_QUEUE_CAPACITY,
            scaffolder: Scaffolder::default(),
        }
    }
}

pub(crate) struct MonitorHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl MonitorHandle {
    async fn shutdown(self, id: &str) {
        self.cancel.cancel();
        let mut handle = self.handle;
        if tokio::time::timeout(MONITOR_JOIN_TIMEOUT, &mut handle)
            .await
            .is_err()
        {
            tracing::warn!(id = %id, "Output monitor did not stop in time, aborting");
            handle.abort();
        }
    }
}

/// Runtime half of a subprocess.
#[derive(Default)]
struct ProcessRecord {
    status: Status,
    pid: Option<u32>,
    error: Option<String>,
    exit_code: Option<i32>,
    last_update: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    process: Option<Box<dyn ManagedProcess>>,
    monitor: Option<MonitorHandle>,
}

pub(crate) enum Liveness {
    Alive,
    Exited(Option<i32>),
}

/// Process table shared by the supervisor and its monitors.
///
/// The lock is never held across an `.await`. Status events are published
/// while it is held, so each id's transitions reach subscribers in order.
pub(crate) struct ProcessTable {
    records: Mutex<HashMap<String, ProcessRecord>>,
    store: Arc<MetricStore>,
    broadcaster: Arc<Broadcaster>,
}

impl ProcessTable {
    pub(crate) fn new(
        registry: &Registry,
        store: Arc<MetricStore>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        let records = registry
            .ids()
            .map(|id| (id.to_string(), ProcessRecord::default()))
            .collect();
        Self {
            records: Mutex::new(records),
            store,
            broadcaster,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProcessRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn attach(&self, id: &str, process: Box<dyn ManagedProcess>) {
        self.transition(id, Status::Starting, |_| {});
        self.transition(id, Status::Running, |r| {
            r.pid = process.pid();
            r.process = Some(process);
        });
    }

    pub(crate) fn status(&self, id: &str) -> Status {
        self.lock().get(id).map(|r| r.status).unwrap_or_default()
    }

    /// Move `id` to `status`, apply `update` to the record, and broadcast.
    fn transition(&self, id: &str, status: Status, update: impl FnOnce(&mut ProcessRecord)) {
        let mut records = self.lock();
        let Some(record) = records.get_mut(id) else {
            return;
        };
        if !record.status.can_transition_to(status) {
            tracing::warn!(id = %id, from = %record.status, to = %status, "Unexpected status transition");
        }
        record.status = status;
        update(record);
        self.publish_status(id, record);
    }

    /// RUNNING → STOPPING, handing the process and monitor to the caller.
    fn begin_stop(
        &self,
        id: &str,
    ) -> Option<(Option<Box<dyn ManagedProcess>>, Option<MonitorHandle>)> {
        let mut records = self.lock();
        let record = records.get_mut(id)?;
        if record.status != Status::Running {
            return None;
        }
        record.status = Status::Stopping;
        let taken = (record.process.take(), record.monitor.take());
        self.publish_status(id, record);
        Some(taken)
    }

    /// Whether a RUNNING worker's process has exited, without changing its status.
    pub(crate) fn has_exited(&self, id: &str) -> bool {
        let mut records = self.lock();
        let Some(record) = records.get_mut(id) else {
            return false;
        };
        if record.status != Status::Running {
            return false;
        }
        record
            .process
            .as_mut()
            .is_some_and(|process| matches!(process.try_wait(), Ok(Some(_))))
    }

    /// Observe a worker that exited without a stop request. Only acts while RUNNING.
    pub(crate) fn reap_if_exited(&self, id: &str) -> Liveness {
        let mut records = self.lock();
        let Some(record) = records.get_mut(id) else {
            return Liveness::Alive;
        };
        if record.status != Status::Running {
            return Liveness::Alive;
        }
        let Some(process) = record.process.as_mut() else {
            return Liveness::Alive;
        };

        match process.try_wait() {
            Ok(None) => Liveness::Alive,
            Ok(Some(exit)) => {
                let code = exit.code();
                if exit.success() {
                    tracing::info!(id = %id, pid = ?record.pid, "Subprocess exited");
                } else {
                    tracing::warn!(id = %id, pid = ?record.pid, code = ?code, "Subprocess exited unexpectedly");
                }
                if let Err(e) = process.kill_group() {
                    tracing::warn!(id = %id, error = %e, "Failed to kill leftover worker children");
                }
                record.status = Status::Stopped;
                record.pid = None;
                record.exit_code = code;
                record.process = None;
                // Detaches this monitor's own task handle.
                record.monitor = None;
                self.publish_status(id, record);
                Liveness::Exited(code)
            }
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Liveness check failed");
                Liveness::Alive
            }
        }
    }

    /// Stamp `last_update` and broadcast the current metric snapshot.
    pub(crate) fn publish_update(&self, id: &str, at: DateTime<Utc>) {
        let mut records = self.lock();
        let Some(record) = records.get_mut(id) else {
            return;
        };
        record.last_update = Some(Utc::now());
        self.broadcaster.publish(Event::Update {
            subprocess_id: id.to_string(),
            metrics: self.store.snapshot(id),
            status: record.status,
            timestamp: at,
        });
    }

    fn publish_status(&self, id: &str, record: &ProcessRecord) {
        tracing::debug!(id = %id, status = %record.status, pid = ?record.pid, "Status changed");
        self.broadcaster.publish(Event::Status {
            subprocess_id: id.to_string(),
            status: record.status,
            error: record.error.clone(),
            pid: record.pid,
            timestamp: Utc::now(),
        });
    }

    pub(crate) fn info(&self, descriptor: &Descriptor) -> SubprocessInfo {
        let records = self.lock();
        let record = records.get(&descriptor.id);
        SubprocessInfo {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            path: descriptor.path.clone(),
            category: descriptor.category,
            status: record.map(|r| r.status).unwrap_or_default(),
            pid: record.and_then(|r| r.pid),
            error: record.and_then(|r| r.error.clone()),
            exit_code: record.and_then(|r| r.exit_code),
            metrics: self.store.snapshot(&descriptor.id),
            last_update: record.and_then(|r| r.last_update),
            started_at: record.and_then(|r| r.started_at),
            autostart: descriptor.autostart,
        }
    }

    /// Cancel monitors and kill every worker's process group.
    fn release_all(&self) {
        for (id, record) in self.lock().iter_mut() {
            if let Some(monitor) = record.monitor.take() {
                monitor.cancel.cancel();
            }
            if let Some(mut process) = record.process.take() {
                if let Err(e) = process.kill_group() {
                    tracing::warn!(id = %id, error = %e, "Failed to kill worker on release");
                }
            }
        }
    }
}

/// Owns every worker listed in the registry.
pub struct ProcessSupervisor {
    registry: Arc<Registry>,
    table: Arc<ProcessTable>,
    store: Arc<MetricStore>,
    broadcaster: Arc<Broadcaster>,
    op_locks: HashMap<String, Arc<OpLock<()>>>,
    options: SupervisorOptions,
}

impl ProcessSupervisor {
    pub fn new(registry: Registry, options: SupervisorOptions) -> Self {
        let store = Arc::new(MetricStore::new(&registry));
        let broadcaster = Arc::new(Broadcaster::new(options.subscriber_queue));
        let table = Arc::new(ProcessTable::new(
            &registry,
            Arc::clone(&store),
            Arc::clone(&broadcaster),
        ));
        let op_locks = registry
            .ids()
            .map(|id| (id.to_string(), Arc::new(OpLock::new(()))))
            .collect();

        tracing::info!(
            subprocesses = registry.len(),
            grace_ms = options.grace_period.as_millis() as u64,
            "Supervisor ready"
        );

        Self {
            registry: Arc::new(registry),
            table,
            store,
            broadcaster,
            op_locks,
            options,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricStore> {
        &self.store
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Open a subscription to status and metric events.
    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    /// Snapshot of every subprocess in registry order.
    pub fn list(&self) -> Vec<SubprocessInfo> {
        self.registry.iter().map(|d| self.table.info(d)).collect()
    }

    pub fn get(&self, id: &str) -> Result<SubprocessInfo, SupervisorError> {
        let descriptor = self.descriptor(id)?;
        Ok(self.table.info(descriptor))
    }

    pub async fn control(&self, id: &str, action: Action) -> Result<SubprocessInfo, SupervisorError> {
        match action {
            Action::Start => self.start(id).await,
            Action::Stop => self.stop(id).await,
            Action::Restart => self.restart(id).await,
        }
    }

    /// Spawn the worker. A no-op success when it is already running.
    pub async fn start(&self, id: &str) -> Result<SubprocessInfo, SupervisorError> {
        let descriptor = self.descriptor(id)?;
        let lock = self.op_lock(id)?;
        let _guard = lock.lock().await;
        self.start_locked(descriptor)?;
        Ok(self.table.info(descriptor))
    }

    /// Terminate the worker gracefully, force-killing it after the grace period.
    /// Idempotent on subprocesses that are not running.
    pub async fn stop(&self, id: &str) -> Result<SubprocessInfo, SupervisorError> {
        let descriptor = self.descriptor(id)?;
        let lock = self.op_lock(id)?;
        let _guard = lock.lock().await;
        self.stop_locked(id).await;
        Ok(self.table.info(descriptor))
    }

    /// Stop then start, under one lock so nothing interleaves.
    pub async fn restart(&self, id: &str) -> Result<SubprocessInfo, SupervisorError> {
        let descriptor = self.descriptor(id)?;
        let lock = self.op_lock(id)?;
        let _guard = lock.lock().await;
        tracing::info!(id = %id, "Restarting subprocess");
        self.stop_locked(id).await;
        self.start_locked(descriptor)?;
        Ok(self.table.info(descriptor))
    }

    /// Start every descriptor flagged `autostart`. Failures are logged and left in ERROR.
    pub async fn start_autostart(&self) -> usize {
        let mut started = 0;
        for descriptor in self.registry.iter().filter(|d| d.autostart) {
            match self.start(&descriptor.id).await {
                Ok(_) => started += 1,
                Err(e) => tracing::error!(id = %descriptor.id, error = %e, "Autostart failed"),
            }
        }
        started
    }

    /// Stop every running worker concurrently.
    pub async fn shutdown(&self) {
        let running: Vec<String> = self
            .list()
            .into_iter()
            .filter(|info| info.status == Status::Running)
            .map(|info| info.id)
            .collect();

        tracing::info!(running = running.len(), "Shutting down subprocesses");
        let stops = running.iter().map(|id| self.stop(id));
        for result in futures::future::join_all(stops).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Stop during shutdown failed");
            }
        }
    }

    fn descriptor(&self, id: &str) -> Result<&Descriptor, SupervisorError> {
        self.registry
            .get(id)
            .ok_or_else(|| SupervisorError::UnknownSubprocess(id.to_string()))
    }

    fn op_lock(&self, id: &str) -> Result<Arc<OpLock<()>>, SupervisorError> {
        self.op_locks
            .get(id)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownSubprocess(id.to_string()))
    }

    fn start_locked(&self, descriptor: &Descriptor) -> Result<(), SupervisorError> {
        let id = descriptor.id.as_str();
        if self.table.status(id) == Status::Running {
            tracing::debug!(id = %id, "Already running");
            return Ok(());
        }

        tracing::info!(id = %id, path = %descriptor.path.display(), "Starting subprocess");
        self.table.transition(id, Status::Starting, |r| {
            r.error = None;
            r.exit_code = None;
        });

        if let Err(e) = self.options.scaffolder.ensure(descriptor) {
            return Err(self.fail_start(id, e.to_string()));
        }

        let spec = LaunchSpec::for_descriptor(descriptor);
        let (process, output) = match ChildProcess::spawn(&spec) {
            Ok(spawned) => spawned,
            Err(e) => return Err(self.fail_start(id, e.to_string())),
        };
        let pid = process.pid();

        let cancel = CancellationToken::new();
        let monitor = OutputMonitor::new(
            self.store.writer(id),
            Arc::clone(&self.table),
            self.options.liveness_interval,
            cancel.clone(),
        );

        self.table.transition(id, Status::Running, |r| {
            r.pid = pid;
            r.started_at = Some(Utc::now());
            r.process = Some(Box::new(process));
            r.monitor = Some(MonitorHandle {
                cancel,
                handle: tokio::spawn(monitor.run(output)),
            });
        });

        tracing::info!(id = %id, pid = ?pid, "Subprocess running");
        Ok(())
    }

    fn fail_start(&self, id: &str, message: String) -> SupervisorError {
        tracing::error!(id = %id, error = %message, "Failed to start subprocess");
        let recorded = message.clone();
        self.table.transition(id, Status::Error, |r| {
            r.error = Some(recorded);
            r.pid = None;
        });
        SupervisorError::SpawnFailed {
            id: id.to_string(),
            message,
        }
    }

    async fn stop_locked(&self, id: &str) {
        let Some((process, monitor)) = self.table.begin_stop(id) else {
            tracing::debug!(id = %id, "Not running, nothing to stop");
            return;
        };

        let mut exit_code = None;
        if let Some(mut process) = process {
            let pid = process.pid();
            tracing::info!(id = %id, pid = ?pid, "Stopping subprocess");
            if let Err(e) = process.terminate() {
                tracing::warn!(id = %id, error = %e, "Failed to send termination signal");
            }

            match tokio::time::timeout(self.options.grace_period, process.wait()).await {
                Ok(Ok(status)) => exit_code = status.code(),
                Ok(Err(e)) => tracing::warn!(id = %id, error = %e, "Failed waiting for exit"),
                Err(_) => {
                    tracing::warn!(
                        id = %id,
                        pid = ?pid,
                        grace_ms = self.options.grace_period.as_millis() as u64,
                        "Grace period elapsed, killing"
                    );
                    if let Err(e) = process.kill().await {
                        tracing::warn!(id = %id, error = %e, "Failed to kill subprocess");
                    }
                    exit_code = process.try_wait().ok().flatten().and_then(|s| s.code());
                }
            }
        }

        if let Some(monitor) = monitor {
            monitor.shutdown(id).await;
        }

        self.table.transition(id, Status::Stopped, |r| {
            r.pid = None;
            r.exit_code = exit_code;
        });
        tracing::info!(id = %id, "Subprocess stopped");
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.table.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> ProcessSupervisor {
        let registry = Registry::new(vec![Descriptor::new(
            "neural_sync",
            "/nonexistent/neural_sync.sh",
            Category::Neural,
        )])
        .unwrap();
        ProcessSupervisor::new(
            registry,
            SupervisorOptions {
                scaffolder: Scaffolder::new(false, Duration::from_secs(1)),
                ..SupervisorOptions::default()
            },
        )
    }

    #[test]
    fn test_action_parse_and_display() {
        assert_eq!("start".parse::<Action>().unwrap(), Action::Start);
        assert_eq!("stop".parse::<Action>().unwrap(), Action::Stop);
        assert_eq!("restart".parse::<Action>().unwrap(), Action::Restart);
        assert!("reload".parse::<Action>().is_err());
        assert_eq!(Action::Restart.to_string(), "restart");
        assert_eq!(serde_json::to_value(Action::Stop).unwrap(), "stop");
    }

    #[test]
    fn test_initial_snapshot_is_idle() {
        let supervisor = supervisor();
        let list = supervisor.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "neural_sync");
        assert_eq!(list[0].status, Status::Idle);
        assert!(list[0].pid.is_none());
        assert!(list[0].error.is_none());
    }

    #[tokio::test]
    async fn test_unknown_id_is_rejected() {
        let supervisor = supervisor();
        let mut sub = supervisor.subscribe();

        for action in [Action::Start, Action::Stop, Action::Restart] {
            let err = supervisor.control("ghost", action).await.unwrap_err();
            assert!(matches!(err, SupervisorError::UnknownSubprocess(ref id) if id == "ghost"));
        }
        assert!(supervisor.get("ghost").is_err());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_stop_on_idle_is_noop() {
        let supervisor = supervisor();
        let mut sub = supervisor.subscribe();
        let info = supervisor.stop("neural_sync").await.unwrap();
        assert_eq!(info.status, Status::Idle);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_missing_executable_without_scaffolding_is_error() {
        let supervisor = supervisor();
        let mut sub = supervisor.subscribe();

        let err = supervisor.start("neural_sync").await.unwrap_err();
        assert!(matches!(err, SupervisorError::SpawnFailed { .. }));

        let info = supervisor.get("neural_sync").unwrap();
        assert_eq!(info.status, Status::Error);
        assert!(info.error.unwrap().contains("executable not found"));
        assert!(info.pid.is_none());

        assert_eq!(sub.try_recv().unwrap().status(), Status::Starting);
        assert_eq!(sub.try_recv().unwrap().status(), Status::Error);
        assert!(sub.try_recv().is_none());
    }
}
