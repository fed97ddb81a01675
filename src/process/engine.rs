//! Async process launch and completion monitoring
//!
//! Launches a guest program and drives a non-blocking completion monitor.
//! Nothing here ever blocks waiting on a child: liveness is checked on a
//! periodic poll that re-arms itself until the process is observed dead.
//!
//! Two launch flavors exist. A fire-and-report launch pushes its outcome to
//! the registered completion sink (unless the request asked to fire and
//! forget); a tracked launch records a running placeholder in the
//! exited-process registry and promotes it with the final exit code so the
//! outcome stays queryable after the fact.

use super::environment::EnvironmentTable;
use super::registry::{ExitedProcessEntry, ExitedProcessRegistry};
use guestops_shared::{now_secs, OpError, OpResult, OP_OK};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

/// Outcome notification for a fire-and-report launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramCompletion {
    /// Correlation name from the original request
    pub request_name: String,
    pub status: u64,
    pub exit_code: i32,
    pub pid: u64,
}

/// Registered sink receiving exactly one notification per reporting launch
pub type CompletionSink = mpsc::UnboundedSender<ProgramCompletion>;

/// A fire-and-report launch request
#[derive(Debug)]
pub struct ReportLaunch {
    pub request_name: String,
    pub program_path: String,
    pub arguments: Option<String>,
    /// Suppress the completion notification entirely
    pub fire_and_forget: bool,
    /// Temp script backing this launch; deleted once the program finishes
    pub temp_script: Option<PathBuf>,
}

/// A tracked launch request
#[derive(Debug)]
pub struct TrackedLaunch {
    pub program_path: String,
    pub arguments: Option<String>,
    pub working_dir: Option<String>,
    pub env_vars: Vec<(String, String)>,
    /// Guest account the launch runs as, recorded in the registry
    pub owner: String,
}

/// Launches guest programs and monitors them to completion
pub struct ProcessEngine {
    registry: Arc<ExitedProcessRegistry>,
    env: Arc<EnvironmentTable>,
    completion: CompletionSink,
    poll_interval: Duration,
}

impl ProcessEngine {
    pub fn new(
        registry: Arc<ExitedProcessRegistry>,
        env: Arc<EnvironmentTable>,
        completion: CompletionSink,
    ) -> Self {
        Self {
            registry,
            env,
            completion,
            poll_interval: Duration::from_secs(guestops_shared::limits::SECONDS_BETWEEN_POLL),
        }
    }

    /// Shorten the liveness poll; tests use this to avoid second-long waits
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Extract the program file name from a command-line-style field.
    ///
    /// The host may quote the program path because the field doubles as the
    /// start of a command line; existence checks need the bare name.
    fn bare_program_name(command_line: &str) -> &str {
        let trimmed = command_line.trim_start_matches(' ');
        if let Some(rest) = trimmed.strip_prefix('"') {
            match rest.find('"') {
                Some(end) => &rest[..end],
                None => rest,
            }
        } else {
            trimmed
        }
    }

    /// The program must exist and be executable before we bother spawning.
    /// Running through the shell would not report either condition clearly,
    /// and both are common, user-correctable mistakes.
    fn check_program(path: &str) -> OpResult<()> {
        let meta = std::fs::metadata(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => OpError::NotFound,
            _ => OpError::from_io(&e),
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if meta.permissions().mode() & 0o111 == 0 {
                return Err(OpError::PermissionDenied);
            }
        }
        let _ = meta;
        Ok(())
    }

    fn check_working_dir(dir: &str) -> OpResult<()> {
        if std::path::Path::new(dir).is_dir() {
            Ok(())
        } else {
            Err(OpError::NotADirectory)
        }
    }

    /// Quote the program path and append the argument string verbatim.
    /// Callers are responsible for argument escaping; nothing here parses or
    /// re-escapes.
    fn full_command_line(program: &str, arguments: Option<&str>) -> String {
        match arguments {
            Some(args) => format!("\"{program}\" {args}"),
            None => format!("\"{program}\""),
        }
    }

    async fn spawn(
        &self,
        full_command_line: &str,
        working_dir: Option<&str>,
        extra_env: &[(String, String)],
    ) -> OpResult<Child> {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(full_command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }
        self.env.apply(&mut cmd).await;
        for (k, v) in extra_env {
            cmd.env(k, v);
        }
        cmd.spawn().map_err(|e| {
            warn!(error = %e, "process creation failed");
            OpError::ProgramNotStarted
        })
    }

    /// Fire-and-report launch. Returns the pid; the outcome arrives later on
    /// the completion sink.
    pub async fn run_program(&self, launch: ReportLaunch) -> OpResult<u64> {
        let program = Self::bare_program_name(&launch.program_path).to_string();
        if let Err(err) = Self::check_program(&program) {
            remove_temp_script(launch.temp_script.as_deref()).await;
            return Err(err);
        }

        let full = Self::full_command_line(&launch.program_path, launch.arguments.as_deref());
        let child = match self.spawn(&full, None, &[]).await {
            Ok(child) => child,
            Err(err) => {
                remove_temp_script(launch.temp_script.as_deref()).await;
                return Err(err);
            }
        };
        let pid = child.id().ok_or(OpError::ProgramNotStarted)? as u64;
        info!(pid, program = %program, request = %launch.request_name, "program started");

        let sink = self.completion.clone();
        let poll = self.poll_interval;
        tokio::spawn(monitor_report(
            child,
            poll,
            pid,
            launch.request_name,
            launch.fire_and_forget,
            launch.temp_script,
            sink,
        ));
        Ok(pid)
    }

    /// Tracked launch. The exited-process registry holds the durable record
    /// once the completion monitor observes termination.
    pub async fn start_program(&self, launch: TrackedLaunch) -> OpResult<u64> {
        let program = Self::bare_program_name(&launch.program_path).to_string();
        Self::check_program(&program)?;
        if let Some(dir) = &launch.working_dir {
            Self::check_working_dir(dir)?;
        }

        let full = Self::full_command_line(&launch.program_path, launch.arguments.as_deref());
        let child = self
            .spawn(&full, launch.working_dir.as_deref(), &launch.env_vars)
            .await?;
        let pid = child.id().ok_or(OpError::ProgramNotStarted)? as u64;
        info!(pid, program = %program, "tracked program started");

        // Record the running placeholder now, not when the monitor first
        // polls, so a ListProcesses issued immediately after launch sees it.
        self.registry
            .record_running(ExitedProcessEntry::running(
                pid,
                launch.owner,
                launch.program_path.clone(),
                now_secs(),
            ))
            .await;

        tokio::spawn(monitor_tracked(
            child,
            self.poll_interval,
            pid,
            Arc::clone(&self.registry),
        ));
        Ok(pid)
    }
}

/// Poll the child until it is observed dead, then hand back the exit code.
///
/// `try_wait` returning `Some` is the single exit-status retrieval for this
/// process; on Unix that is also what releases the zombie.
async fn await_exit(child: &mut Child, poll: Duration, pid: u64) -> i32 {
    let mut ticker = interval(poll);
    loop {
        ticker.tick().await;
        match child.try_wait() {
            Ok(Some(status)) => {
                let exit_code = status.code().unwrap_or(-1);
                debug!(pid, exit_code, "program exited");
                return exit_code;
            }
            Ok(None) => continue,
            Err(e) => {
                warn!(pid, error = %e, "exit status retrieval failed");
                return -1;
            }
        }
    }
}

async fn remove_temp_script(path: Option<&std::path::Path>) {
    if let Some(path) = path {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "failed to delete temp script");
        }
    }
}

async fn monitor_report(
    mut child: Child,
    poll: Duration,
    pid: u64,
    request_name: String,
    fire_and_forget: bool,
    temp_script: Option<PathBuf>,
    sink: CompletionSink,
) {
    let exit_code = await_exit(&mut child, poll, pid).await;
    remove_temp_script(temp_script.as_deref()).await;
    if !fire_and_forget {
        let _ = sink.send(ProgramCompletion {
            request_name,
            status: OP_OK,
            exit_code,
            pid,
        });
    }
}

async fn monitor_tracked(
    mut child: Child,
    poll: Duration,
    pid: u64,
    registry: Arc<ExitedProcessRegistry>,
) {
    let exit_code = await_exit(&mut child, poll, pid).await;
    registry.record_exit(pid, exit_code, now_secs()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::{sleep, timeout};

    fn engine() -> (
        ProcessEngine,
        Arc<ExitedProcessRegistry>,
        mpsc::UnboundedReceiver<ProgramCompletion>,
    ) {
        let registry = Arc::new(ExitedProcessRegistry::new());
        let env = Arc::new(EnvironmentTable::new(None));
        let (tx, rx) = unbounded_channel();
        let engine = ProcessEngine::new(Arc::clone(&registry), env, tx)
            .with_poll_interval(Duration::from_millis(10));
        (engine, registry, rx)
    }

    async fn wait_for_exit(registry: &ExitedProcessRegistry, pid: u64) -> ExitedProcessEntry {
        timeout(Duration::from_secs(5), async {
            loop {
                if let Some(entry) = registry.find(pid).await {
                    if !entry.is_running {
                        return entry;
                    }
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("tracked program never completed")
    }

    #[test]
    fn bare_program_name_handles_quoting() {
        assert_eq!(ProcessEngine::bare_program_name("/bin/ls"), "/bin/ls");
        assert_eq!(
            ProcessEngine::bare_program_name("  \"/opt/my tool/run\" --flag"),
            "/opt/my tool/run"
        );
        assert_eq!(ProcessEngine::bare_program_name("\"/bin/unclosed"), "/bin/unclosed");
    }

    #[test]
    fn command_line_appends_arguments_verbatim() {
        assert_eq!(
            ProcessEngine::full_command_line("/bin/echo", Some("a \"b c\"")),
            "\"/bin/echo\" a \"b c\""
        );
        assert_eq!(ProcessEngine::full_command_line("/bin/true", None), "\"/bin/true\"");
    }

    #[tokio::test]
    async fn tracked_launch_records_completion() {
        let (engine, registry, _rx) = engine();
        let pid = engine
            .start_program(TrackedLaunch {
                program_path: "/bin/true".into(),
                arguments: None,
                working_dir: None,
                env_vars: vec![],
                owner: "tester".into(),
            })
            .await
            .expect("launch failed");

        let entry = wait_for_exit(&registry, pid).await;
        assert_eq!(entry.exit_code, 0);
        assert!(!entry.is_running);
        assert_eq!(entry.owner, "tester");
        assert_eq!(entry.program, "/bin/true");
    }

    #[tokio::test]
    async fn tracked_launch_preserves_nonzero_exit_code() {
        let (engine, registry, _rx) = engine();
        let pid = engine
            .start_program(TrackedLaunch {
                program_path: "/bin/sh".into(),
                arguments: Some("-c \"exit 7\"".into()),
                working_dir: None,
                env_vars: vec![],
                owner: "tester".into(),
            })
            .await
            .expect("launch failed");

        let entry = wait_for_exit(&registry, pid).await;
        assert_eq!(entry.exit_code, 7);
    }

    #[tokio::test]
    async fn nonexistent_program_fails_before_spawn() {
        let (engine, registry, _rx) = engine();
        let err = engine
            .start_program(TrackedLaunch {
                program_path: "/no/such/program".into(),
                arguments: None,
                working_dir: None,
                env_vars: vec![],
                owner: "tester".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err, OpError::NotFound);
        assert_eq!(registry.len().await, 0, "no record for a failed launch");
    }

    #[tokio::test]
    async fn non_executable_program_is_permission_denied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("not-runnable");
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();

        let (engine, _registry, _rx) = engine();
        let err = engine
            .start_program(TrackedLaunch {
                program_path: path.to_string_lossy().into_owned(),
                arguments: None,
                working_dir: None,
                env_vars: vec![],
                owner: "tester".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err, OpError::PermissionDenied);
    }

    #[tokio::test]
    async fn bad_working_dir_is_rejected() {
        let (engine, _registry, _rx) = engine();
        let err = engine
            .start_program(TrackedLaunch {
                program_path: "/bin/true".into(),
                arguments: None,
                working_dir: Some("/no/such/dir".into()),
                env_vars: vec![],
                owner: "tester".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err, OpError::NotADirectory);
    }

    #[tokio::test]
    async fn reporting_launch_notifies_sink_once() {
        let (engine, _registry, mut rx) = engine();
        let pid = engine
            .run_program(ReportLaunch {
                request_name: "req-1".into(),
                program_path: "/bin/true".into(),
                arguments: None,
                fire_and_forget: false,
                temp_script: None,
            })
            .await
            .expect("launch failed");

        let done = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no completion")
            .expect("sink closed");
        assert_eq!(done.request_name, "req-1");
        assert_eq!(done.exit_code, 0);
        assert_eq!(done.pid, pid);
    }

    #[tokio::test]
    async fn fire_and_forget_suppresses_notification() {
        let (engine, _registry, mut rx) = engine();
        engine
            .run_program(ReportLaunch {
                request_name: "req-2".into(),
                program_path: "/bin/true".into(),
                arguments: None,
                fire_and_forget: true,
                temp_script: None,
            })
            .await
            .expect("launch failed");

        sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err(), "no notification expected");
    }

    #[tokio::test]
    async fn temp_script_is_deleted_after_completion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("script.sh");
        std::fs::write(&script, b"exit 0\n").unwrap();

        let (engine, _registry, mut rx) = engine();
        engine
            .run_program(ReportLaunch {
                request_name: "req-3".into(),
                program_path: "/bin/true".into(),
                arguments: None,
                fire_and_forget: false,
                temp_script: Some(script.clone()),
            })
            .await
            .expect("launch failed");

        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no completion")
            .expect("sink closed");
        assert!(!script.exists(), "temp script must be deleted");
    }

    #[tokio::test]
    async fn temp_script_is_deleted_when_launch_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("script.sh");
        std::fs::write(&script, b"exit 0\n").unwrap();

        let (engine, _registry, _rx) = engine();
        let err = engine
            .run_program(ReportLaunch {
                request_name: "req-4".into(),
                program_path: "/no/such/interpreter".into(),
                arguments: None,
                fire_and_forget: false,
                temp_script: Some(script.clone()),
            })
            .await
            .unwrap_err();
        assert_eq!(err, OpError::NotFound);
        assert!(!script.exists(), "temp script must not leak on failure");
    }
}
