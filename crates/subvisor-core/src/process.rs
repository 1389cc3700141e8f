// ABOUTME: ManagedProcess capability (pid, terminate, try_wait, wait, kill) and its OS implementation
// ABOUTME: Unix workers run in their own process group so signals reach their children too

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};

use crate::registry::Descriptor;
use crate::scaffold::Scaffolder;

/// Interpreter used for generated placeholders.
const PLACEHOLDER_SHELL: &str = "/bin/sh";

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// A running OS process owned by the supervisor.
#[async_trait]
pub trait ManagedProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Ask the process to exit (SIGTERM on unix).
    fn terminate(&mut self) -> io::Result<()>;

    /// Non-blocking exit check.
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>>;

    /// Wait for exit.
    async fn wait(&mut self) -> io::Result<ExitStatus>;

    /// Force-kill and reap.
    async fn kill(&mut self) -> io::Result<()>;

    /// SIGKILL whatever is left of the process group without waiting. Safe after
    /// the leader has been reaped.
    fn kill_group(&mut self) -> io::Result<()>;
}

/// Output streams captured at spawn time.
pub struct ProcessOutput {
    pub stdout: Option<BoxedReader>,
    pub stderr: Option<BoxedReader>,
}

/// How to launch a descriptor's executable.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    /// Placeholders run under `/bin/sh` so they work regardless of the exec bit.
    ///
    /// Relative paths are anchored at the current directory before the worker's
    /// working directory applies, so the executable is never resolved twice.
    pub fn for_descriptor(descriptor: &Descriptor) -> Self {
        let path = absolute(&descriptor.path);
        let working_dir = match descriptor.working_dir {
            Some(ref dir) => Some(absolute(dir)),
            None => path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf),
        };

        let (program, args) = if Scaffolder::is_placeholder(&path) {
            let mut args = vec![path.to_string_lossy().into_owned()];
            args.extend(descriptor.args.iter().cloned());
            (PathBuf::from(PLACEHOLDER_SHELL), args)
        } else {
            (path, descriptor.args.clone())
        };

        Self {
            program,
            args,
            env: descriptor.env.clone(),
            working_dir,
        }
    }
}

/// Bare program names (no separator) are left for a `PATH` lookup.
fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() || path.components().count() < 2 {
        return path.to_path_buf();
    }
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// [`ManagedProcess`] backed by a tokio child process.
pub struct ChildProcess {
    child: Child,
    pid: Option<u32>,
}

impl ChildProcess {
    pub fn spawn(spec: &LaunchSpec) -> io::Result<(Self, ProcessOutput)> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = spec.working_dir {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        cmd.process_group(0);

        tracing::debug!(
            program = %spec.program.display(),
            args = ?spec.args,
            "Spawning worker"
        );

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let output = ProcessOutput {
            stdout: child.stdout.take().map(|s| Box::new(s) as BoxedReader),
            stderr: child.stderr.take().map(|s| Box::new(s) as BoxedReader),
        };

        Ok((Self { child, pid }, output))
    }
}

#[async_trait]
impl ManagedProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            match self.pid {
                Some(pid) => signal_group(pid, libc::SIGTERM),
                None => Ok(()),
            }
        }
        #[cfg(not(unix))]
        {
            self.child.start_kill()
        }
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    async fn kill(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            signal_group(pid, libc::SIGKILL)?;
        }
        self.child.kill().await
    }

    fn kill_group(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            match self.pid {
                Some(pid) => signal_group(pid, libc::SIGKILL),
                None => Ok(()),
            }
        }
        #[cfg(not(unix))]
        {
            self.child.start_kill()
        }
    }
}

/// Signal every process in the worker's group. A group that is already gone is not an error.
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) with a negative pid targets the process group; no memory is shared.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::registry::Category;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    #[tokio::test]
    async fn test_spawn_captures_stdout_and_pid() {
        let (mut process, output) = ChildProcess::spawn(&sh("echo hello")).unwrap();
        assert!(process.pid().unwrap() > 0);

        let mut lines = BufReader::new(output.stdout.unwrap()).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("hello"));

        let status = process.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let mut spec = sh("echo $SUBVISOR_TEST_VALUE");
        spec.env
            .insert("SUBVISOR_TEST_VALUE".to_string(), "42".to_string());
        let (mut process, output) = ChildProcess::spawn(&spec).unwrap();
        let mut lines = BufReader::new(output.stdout.unwrap()).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("42"));
        process.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_stops_process_group() {
        let (mut process, _output) = ChildProcess::spawn(&sh("sleep 30")).unwrap();
        assert!(process.try_wait().unwrap().is_none());

        process.terminate().unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .expect("terminated process should exit")
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_kill_ignores_term_trap() {
        let (mut process, _output) =
            ChildProcess::spawn(&sh("trap '' TERM; while :; do sleep 0.1; done")).unwrap();
        // Let the shell install its trap first.
        tokio::time::sleep(Duration::from_millis(200)).await;
        process.terminate().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(process.try_wait().unwrap().is_none());

        process.kill().await.unwrap();
        assert!(process.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let spec = LaunchSpec {
            program: PathBuf::from("/definitely/not/here"),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        };
        assert!(ChildProcess::spawn(&spec).is_err());
    }

    #[test]
    fn test_launch_spec_for_plain_executable() {
        let mut d = Descriptor::new("x", "/opt/workers/x.py", Category::System);
        d.args = vec!["--fast".to_string()];
        let spec = LaunchSpec::for_descriptor(&d);
        assert_eq!(spec.program, PathBuf::from("/opt/workers/x.py"));
        assert_eq!(spec.args, vec!["--fast".to_string()]);
        assert_eq!(spec.working_dir, Some(PathBuf::from("/opt/workers")));
    }

    #[test]
    fn test_launch_spec_anchors_relative_path() {
        let d = Descriptor::new("x", "workers/x.py", Category::System);
        let spec = LaunchSpec::for_descriptor(&d);
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(spec.program, cwd.join("workers/x.py"));
        assert_eq!(spec.working_dir, Some(cwd.join("workers")));
    }

    #[test]
    fn test_launch_spec_leaves_bare_program_for_path_lookup() {
        let d = Descriptor::new("x", "python3", Category::System);
        let spec = LaunchSpec::for_descriptor(&d);
        assert_eq!(spec.program, PathBuf::from("python3"));
        assert_eq!(spec.working_dir, None);
    }

    #[test]
    fn test_launch_spec_for_placeholder_uses_shell() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.sh");
        let d = Descriptor::new("x", &path, Category::System);
        Scaffolder::default().ensure(&d).unwrap();

        let spec = LaunchSpec::for_descriptor(&d);
        assert_eq!(spec.program, PathBuf::from("/bin/sh"));
        assert_eq!(spec.args, vec![path.to_string_lossy().into_owned()]);
    }
}
