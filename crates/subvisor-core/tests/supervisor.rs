// ABOUTME: Integration tests for the process supervisor.
// ABOUTME: Drives real /bin/sh workers through start, stop, restart, self-exit and scaffolding.

#![cfg(unix)]

use std::path::Path;
use std::time::{Duration, Instant};
use subvisor_core::{
    Category, Descriptor, Event, MetricSpec, ProcessSupervisor, Registry, Scaffolder, Status,
    Subscription, SupervisorError, SupervisorOptions,
};

const WAIT: Duration = Duration::from_secs(5);

/// Worker launched as `/bin/sh <script>` so the script never needs an exec bit.
fn sh_worker(dir: &Path, id: &str, category: Category, body: &str) -> Descriptor {
    let script = dir.join(format!("{}.sh", id));
    std::fs::write(&script, body).unwrap();
    let mut descriptor = Descriptor::new(id, "/bin/sh", category);
    descriptor.args = vec![script.to_string_lossy().into_owned()];
    descriptor
}

fn options(grace: Duration) -> SupervisorOptions {
    SupervisorOptions {
        grace_period: grace,
        liveness_interval: Duration::from_millis(50),
        subscriber_queue: 256,
        scaffolder: Scaffolder::new(true, Duration::from_millis(50)),
    }
}

/// Collect status events for `id` until `want` arrives.
async fn wait_for_status(sub: &mut Subscription, id: &str, want: Status) -> Vec<Status> {
    let mut seen = Vec::new();
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = tokio::time::timeout(remaining, sub.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {} on {}; saw {:?}", want, id, seen))
            .expect("broadcaster closed");
        if let Event::Status {
            subprocess_id,
            status,
            ..
        } = event.as_ref()
        {
            if subprocess_id == id {
                seen.push(*status);
                if *status == want {
                    return seen;
                }
            }
        }
    }
}

/// Wait for the first metric update for `id`.
async fn wait_for_update(sub: &mut Subscription, id: &str) -> Event {
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = tokio::time::timeout(remaining, sub.recv())
            .await
            .expect("timed out waiting for update")
            .expect("broadcaster closed");
        if matches!(event.as_ref(), Event::Update { subprocess_id, .. } if subprocess_id == id) {
            return event.as_ref().clone();
        }
    }
}

#[tokio::test]
async fn test_neural_sync_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = sh_worker(
        dir.path(),
        "neural_sync",
        Category::Neural,
        r#"echo "neural sync warming up"
echo '{"kind":"metrics","subprocess_id":"neural_sync","metrics":{"sync_rate":97.2}}'
while :; do sleep 0.1; done
"#,
    )
    .with_metric(MetricSpec::new("sync_rate", "%").with_threshold(60.0, 95.0));
    let grace = Duration::from_secs(2);
    let supervisor = ProcessSupervisor::new(Registry::new(vec![descriptor]).unwrap(), options(grace));
    let mut sub = supervisor.subscribe();

    let info = supervisor.start("neural_sync").await.unwrap();
    assert_eq!(info.status, Status::Running);
    assert!(info.pid.unwrap() > 0);

    match wait_for_update(&mut sub, "neural_sync").await {
        Event::Update { metrics, status, .. } => {
            assert_eq!(status, Status::Running);
            assert_eq!(metrics["sync_rate"].value, Some(97.2));
            assert!(metrics["sync_rate"].out_of_range);
        }
        other => panic!("expected update, got {:?}", other),
    }
    let reading = supervisor.metrics().get("neural_sync", "sync_rate").unwrap();
    assert_eq!(reading.value, Some(97.2));
    assert!(reading.out_of_range);

    let began = Instant::now();
    let info = supervisor.stop("neural_sync").await.unwrap();
    assert!(began.elapsed() < grace + Duration::from_secs(1));
    assert_eq!(info.status, Status::Stopped);
    assert!(info.pid.is_none());

    // Metric values outlive the process.
    assert_eq!(
        supervisor.metrics().get("neural_sync", "sync_rate").unwrap().value,
        Some(97.2)
    );
}

#[tokio::test]
async fn test_status_follows_lifecycle_order() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = sh_worker(dir.path(), "io_bridge", Category::Io, "while :; do sleep 0.1; done\n");
    let supervisor = ProcessSupervisor::new(
        Registry::new(vec![descriptor]).unwrap(),
        options(Duration::from_secs(2)),
    );
    let mut sub = supervisor.subscribe();

    supervisor.start("io_bridge").await.unwrap();
    supervisor.stop("io_bridge").await.unwrap();

    let seen = wait_for_status(&mut sub, "io_bridge", Status::Stopped).await;
    assert_eq!(
        seen,
        vec![
            Status::Starting,
            Status::Running,
            Status::Stopping,
            Status::Stopped
        ]
    );
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = sh_worker(dir.path(), "system_vitals", Category::System, "while :; do sleep 0.1; done\n");
    let supervisor = ProcessSupervisor::new(
        Registry::new(vec![descriptor]).unwrap(),
        options(Duration::from_secs(2)),
    );
    let mut sub = supervisor.subscribe();

    let first = supervisor.start("system_vitals").await.unwrap();
    let second = supervisor.start("system_vitals").await.unwrap();
    assert_eq!(first.pid, second.pid);
    assert_eq!(second.status, Status::Running);

    // Only one STARTING/RUNNING pair was broadcast.
    let mut statuses = Vec::new();
    while let Some(event) = sub.try_recv() {
        statuses.push(event.status());
    }
    assert_eq!(statuses, vec![Status::Starting, Status::Running]);

    supervisor.stop("system_vitals").await.unwrap();
}

#[tokio::test]
async fn test_concurrent_starts_spawn_once() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = sh_worker(dir.path(), "memory_lattice", Category::Memory, "while :; do sleep 0.1; done\n");
    let supervisor = ProcessSupervisor::new(
        Registry::new(vec![descriptor]).unwrap(),
        options(Duration::from_secs(2)),
    );

    let (a, b) = tokio::join!(
        supervisor.start("memory_lattice"),
        supervisor.start("memory_lattice")
    );
    assert_eq!(a.unwrap().pid, b.unwrap().pid);

    supervisor.stop("memory_lattice").await.unwrap();
}

#[tokio::test]
async fn test_stop_force_kills_after_grace_period() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = sh_worker(
        dir.path(),
        "stubborn",
        Category::System,
        "trap '' TERM\nwhile :; do sleep 0.1; done\n",
    );
    let grace = Duration::from_millis(300);
    let supervisor = ProcessSupervisor::new(Registry::new(vec![descriptor]).unwrap(), options(grace));

    supervisor.start("stubborn").await.unwrap();
    // Give the shell time to install its trap.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let began = Instant::now();
    let info = supervisor.stop("stubborn").await.unwrap();
    let elapsed = began.elapsed();

    assert_eq!(info.status, Status::Stopped);
    assert!(info.pid.is_none());
    assert!(elapsed >= grace, "stopped too early: {:?}", elapsed);
    assert!(elapsed < grace + Duration::from_secs(2), "stop took {:?}", elapsed);
}

#[tokio::test]
async fn test_metrics_for_other_id_are_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let spoofer = sh_worker(
        dir.path(),
        "quantum_flux",
        Category::Quantum,
        r#"echo '{"kind":"metrics","subprocess_id":"neural_sync","metrics":{"sync_rate":1.0}}'
echo 'not json at all'
echo '{"kind":"metrics","subprocess_id":"quantum_flux","metrics":{"entropy":0.5}}'
while :; do sleep 0.1; done
"#,
    )
    .with_metric(MetricSpec::new("entropy", "bits"));
    let victim = Descriptor::new("neural_sync", "/bin/true", Category::Neural)
        .with_metric(MetricSpec::new("sync_rate", "%").with_threshold(60.0, 95.0));

    let supervisor = ProcessSupervisor::new(
        Registry::new(vec![spoofer, victim]).unwrap(),
        options(Duration::from_secs(2)),
    );
    let mut sub = supervisor.subscribe();

    supervisor.start("quantum_flux").await.unwrap();
    wait_for_update(&mut sub, "quantum_flux").await;

    assert_eq!(
        supervisor.metrics().get("quantum_flux", "entropy").unwrap().value,
        Some(0.5)
    );
    assert!(supervisor.metrics().get("quantum_flux", "sync_rate").is_none());
    assert_eq!(
        supervisor.metrics().get("neural_sync", "sync_rate").unwrap().value,
        None
    );
    assert_eq!(supervisor.get("neural_sync").unwrap().status, Status::Idle);

    supervisor.stop("quantum_flux").await.unwrap();
}

#[tokio::test]
async fn test_self_exit_maps_to_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = sh_worker(dir.path(), "flaky", Category::Io, "echo 'bye'\nexit 3\n");
    let supervisor = ProcessSupervisor::new(
        Registry::new(vec![descriptor]).unwrap(),
        options(Duration::from_secs(2)),
    );
    let mut sub = supervisor.subscribe();

    supervisor.start("flaky").await.unwrap();
    let seen = wait_for_status(&mut sub, "flaky", Status::Stopped).await;
    assert!(!seen.contains(&Status::Error));
    assert!(!seen.contains(&Status::Stopping));

    let info = supervisor.get("flaky").unwrap();
    assert_eq!(info.status, Status::Stopped);
    assert_eq!(info.exit_code, Some(3));
    assert!(info.pid.is_none());
    assert!(info.error.is_none());

    // Manual restart is allowed after a self-exit.
    supervisor.start("flaky").await.unwrap();
    wait_for_status(&mut sub, "flaky", Status::Stopped).await;
}

#[tokio::test]
async fn test_records_before_exit_are_all_applied() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = sh_worker(
        dir.path(),
        "burst",
        Category::Io,
        r#"i=0
while [ $i -lt 200 ]; do
  echo "{\"kind\":\"metrics\",\"subprocess_id\":\"burst\",\"metrics\":{\"n\":$i}}"
  i=$((i + 1))
done
exit 0
"#,
    );
    let supervisor = ProcessSupervisor::new(
        Registry::new(vec![descriptor]).unwrap(),
        options(Duration::from_secs(2)),
    );
    let mut sub = supervisor.subscribe();

    supervisor.start("burst").await.unwrap();
    wait_for_status(&mut sub, "burst", Status::Stopped).await;

    assert_eq!(
        supervisor.metrics().get("burst", "n").unwrap().value,
        Some(199.0)
    );
    let info = supervisor.get("burst").unwrap();
    assert_eq!(info.exit_code, Some(0));
    assert!(info.last_update.is_some());
}

/// Alive and not a zombie.
fn is_running(pid: &str) -> bool {
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        return !stat.contains(") Z ");
    }
    std::process::Command::new("/bin/sh")
        .args(["-c", &format!("kill -0 {} 2>/dev/null", pid)])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn test_self_exit_kills_leftover_children() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("child.pid");
    let descriptor = sh_worker(
        dir.path(),
        "spawner",
        Category::System,
        &format!("sleep 30 &\necho $! > '{}'\nexit 0\n", pid_file.display()),
    );
    let supervisor = ProcessSupervisor::new(
        Registry::new(vec![descriptor]).unwrap(),
        options(Duration::from_secs(2)),
    );
    let mut sub = supervisor.subscribe();

    supervisor.start("spawner").await.unwrap();
    wait_for_status(&mut sub, "spawner", Status::Stopped).await;

    let child = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
    let deadline = Instant::now() + WAIT;
    while is_running(&child) {
        assert!(Instant::now() < deadline, "background child {} survived", child);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_relative_placeholder_path_runs() {
    let dir = tempfile::Builder::new()
        .prefix("subvisor-rel")
        .tempdir_in(".")
        .unwrap();
    let path = dir.path().join("workers").join("vitals.sh");
    assert!(path.is_relative());
    let descriptor = Descriptor::new("vitals", &path, Category::System)
        .with_metric(MetricSpec::new("cpu", "%").with_threshold(0.0, 90.0));
    let supervisor = ProcessSupervisor::new(
        Registry::new(vec![descriptor]).unwrap(),
        options(Duration::from_secs(2)),
    );
    let mut sub = supervisor.subscribe();

    supervisor.start("vitals").await.unwrap();
    match wait_for_update(&mut sub, "vitals").await {
        Event::Update { metrics, status, .. } => {
            assert_eq!(status, Status::Running);
            assert!(metrics["cpu"].value.is_some());
        }
        other => panic!("expected update, got {:?}", other),
    }
    assert_eq!(supervisor.get("vitals").unwrap().status, Status::Running);

    supervisor.stop("vitals").await.unwrap();
}

#[tokio::test]
async fn test_missing_executable_is_scaffolded_and_regenerated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("workers").join("neural_sync.sh");
    let descriptor = Descriptor::new("neural_sync", &path, Category::Neural)
        .with_metric(MetricSpec::new("sync_rate", "%").with_threshold(60.0, 95.0));
    let supervisor = ProcessSupervisor::new(
        Registry::new(vec![descriptor]).unwrap(),
        options(Duration::from_secs(2)),
    );
    let mut sub = supervisor.subscribe();

    let info = supervisor.start("neural_sync").await.unwrap();
    assert_eq!(info.status, Status::Running);
    assert!(Scaffolder::is_placeholder(&path));
    let original = std::fs::read(&path).unwrap();

    match wait_for_update(&mut sub, "neural_sync").await {
        Event::Update { metrics, .. } => {
            let value = metrics["sync_rate"].value.unwrap();
            assert!((60.0..=95.0).contains(&value), "got {}", value);
            assert!(!metrics["sync_rate"].out_of_range);
        }
        other => panic!("expected update, got {:?}", other),
    }

    std::fs::remove_file(&path).unwrap();
    let info = supervisor.restart("neural_sync").await.unwrap();
    assert_eq!(info.status, Status::Running);
    assert_eq!(std::fs::read(&path).unwrap(), original);

    supervisor.stop("neural_sync").await.unwrap();
}

#[tokio::test]
async fn test_spawn_failure_is_error_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    // A directory exists, so it is not scaffolded, but it cannot be executed.
    let descriptor = Descriptor::new("broken", dir.path(), Category::System);
    let supervisor = ProcessSupervisor::new(
        Registry::new(vec![descriptor]).unwrap(),
        options(Duration::from_secs(2)),
    );
    let mut sub = supervisor.subscribe();

    let err = supervisor.start("broken").await.unwrap_err();
    assert!(matches!(err, SupervisorError::SpawnFailed { ref id, .. } if id == "broken"));

    let info = supervisor.get("broken").unwrap();
    assert_eq!(info.status, Status::Error);
    assert!(info.error.is_some());
    assert!(info.pid.is_none());

    let seen = wait_for_status(&mut sub, "broken", Status::Error).await;
    assert_eq!(seen, vec![Status::Starting, Status::Error]);

    // Nothing retries on its own.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(sub.try_recv().is_none());
    assert_eq!(supervisor.get("broken").unwrap().status, Status::Error);
}

#[tokio::test]
async fn test_operations_on_different_ids_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    let stubborn = sh_worker(
        dir.path(),
        "stubborn",
        Category::System,
        "trap '' TERM\nwhile :; do sleep 0.1; done\n",
    );
    let quick = sh_worker(dir.path(), "quick", Category::Io, "while :; do sleep 0.1; done\n");
    let grace = Duration::from_millis(800);
    let supervisor = ProcessSupervisor::new(
        Registry::new(vec![stubborn, quick]).unwrap(),
        options(grace),
    );

    supervisor.start("stubborn").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (slow, fast) = tokio::join!(supervisor.stop("stubborn"), async {
        let began = Instant::now();
        supervisor.start("quick").await.unwrap();
        began.elapsed()
    });
    slow.unwrap();
    assert!(fast < grace, "start of another id waited on stop: {:?}", fast);

    supervisor.stop("quick").await.unwrap();
}

#[tokio::test]
async fn test_autostart_and_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let mut a = sh_worker(dir.path(), "alpha", Category::Neural, "while :; do sleep 0.1; done\n");
    a.autostart = true;
    let mut b = sh_worker(dir.path(), "beta", Category::Quantum, "while :; do sleep 0.1; done\n");
    b.autostart = true;
    let c = sh_worker(dir.path(), "gamma", Category::Memory, "while :; do sleep 0.1; done\n");

    let supervisor = ProcessSupervisor::new(
        Registry::new(vec![a, b, c]).unwrap(),
        options(Duration::from_secs(2)),
    );

    assert_eq!(supervisor.start_autostart().await, 2);
    let statuses: Vec<(String, Status)> = supervisor
        .list()
        .into_iter()
        .map(|info| (info.id, info.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("alpha".to_string(), Status::Running),
            ("beta".to_string(), Status::Running),
            ("gamma".to_string(), Status::Idle),
        ]
    );

    supervisor.shutdown().await;
    for info in supervisor.list() {
        assert!(info.pid.is_none());
        assert_ne!(info.status, Status::Running);
    }
}
