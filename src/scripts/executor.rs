//! Script Executor
//!
//! Runs a validated script as a child process with a cleared environment,
//! bounded wall-clock time and bounded output capture. Each script starts
//! in its own session, detached from any controlling terminal. On timeout or
//! cancellation the whole process group receives SIGTERM, then SIGKILL after
//! a grace period.

use super::args::split_args;
use super::context::{ExecutionContext, INHERITED_ENV};
use super::sandbox::{ResolvedScript, ScriptSandbox};
use super::{Result, ScriptError};
use crate::autoreply::tokens;
use crate::logging::preview;
use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long to wait for output pipes after the child exits. A grandchild
/// holding the pipe open must not stall the invocation.
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Resource limits applied to every run
#[derive(Debug, Clone)]
pub struct ExecutorLimits {
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub max_stdout_bytes: usize,
    pub max_stderr_bytes: usize,
    pub max_concurrent: usize,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(2),
            max_stdout_bytes: 64 * 1024,
            max_stderr_bytes: 16 * 1024,
            max_concurrent: 4,
        }
    }
}

/// Outcome of a script that ran to completion
#[derive(Debug, Clone)]
pub struct ScriptResult {
    /// Exit code, `None` when the child died from a signal
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
    /// Stdout hit the capture ceiling
    pub truncated: bool,
}

/// A request to run one script
#[derive(Debug, Clone)]
pub struct ScriptInvocation {
    /// Script path, relative to the scripts directory or absolute
    pub target: String,
    /// Argument template; tokens are expanded before splitting
    pub arguments: Option<String>,
    pub context: ExecutionContext,
}

impl ScriptInvocation {
    pub fn new(target: impl Into<String>, context: ExecutionContext) -> Self {
        Self {
            target: target.into(),
            arguments: None,
            context,
        }
    }

    pub fn with_arguments(mut self, arguments: Option<String>) -> Self {
        self.arguments = arguments;
        self
    }

    /// Expanded argv entries
    pub fn argv(&self) -> Vec<String> {
        match &self.arguments {
            Some(template) => {
                let values = self.context.token_values();
                split_args(&tokens::expand(template, &values))
            }
            None => Vec::new(),
        }
    }
}

/// Something that can run reply scripts
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Run a script to completion, honouring `cancel`
    async fn run(&self, invocation: &ScriptInvocation, cancel: CancellationToken) -> Result<ScriptResult>;
}

/// Child-process script runner
pub struct ScriptExecutor {
    sandbox: ScriptSandbox,
    limits: ExecutorLimits,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for ScriptExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptExecutor")
            .field("root", &self.sandbox.root())
            .field("limits", &self.limits)
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl ScriptExecutor {
    pub fn new(sandbox: ScriptSandbox, limits: ExecutorLimits) -> Self {
        let permits = Arc::new(Semaphore::new(limits.max_concurrent.max(1)));
        Self {
            sandbox,
            limits,
            permits,
        }
    }

    pub fn sandbox(&self) -> &ScriptSandbox {
        &self.sandbox
    }

    pub fn limits(&self) -> &ExecutorLimits {
        &self.limits
    }

    fn command(&self, script: &ResolvedScript, invocation: &ScriptInvocation) -> Command {
        let mut cmd = match script.interpreter() {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(script.path());
                cmd
            }
            None => Command::new(script.path()),
        };

        cmd.args(invocation.argv())
            .current_dir(self.sandbox.root())
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for key in INHERITED_ENV {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.envs(invocation.context.env());

        // New session: no controlling terminal, and the child leads a fresh
        // process group so timeouts reach grandchildren too
        #[cfg(unix)]
        // SAFETY: the hook runs in the forked child before exec and only
        // calls setsid(2), which is async-signal-safe and allocates nothing.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        cmd
    }

    /// SIGTERM the group, wait out the grace period, then SIGKILL and reap.
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        signal_group(pid, Signal::Term);
        match tokio::time::timeout(self.limits.kill_grace, child.wait()).await {
            Ok(_) => {
                // Leader is gone; stragglers in the group still get killed
                signal_group(pid, Signal::Kill);
            }
            Err(_) => {
                debug!(?pid, "script ignored SIGTERM, killing");
                signal_group(pid, Signal::Kill);
                let _ = child.kill().await;
            }
        }
    }
}

#[async_trait]
impl ScriptRunner for ScriptExecutor {
    async fn run(&self, invocation: &ScriptInvocation, cancel: CancellationToken) -> Result<ScriptResult> {
        // Validate before taking a slot; nothing is spawned for a bad path
        let script = self.sandbox.resolve(&invocation.target)?;

        let _permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| ScriptError::Cancelled)?
            }
            _ = cancel.cancelled() => return Err(ScriptError::Cancelled),
        };

        let started = Instant::now();
        let mut child = self.command(&script, invocation).spawn()?;
        let pid = child.id();
        debug!(script = %script.path().display(), ?pid, "script started");

        let stdout = child
            .stdout
            .take()
            .map(|pipe| spawn_capture(pipe, self.limits.max_stdout_bytes));
        let stderr = child
            .stderr
            .take()
            .map(|pipe| spawn_capture(pipe, self.limits.max_stderr_bytes));

        let status: ExitStatus = tokio::select! {
            status = child.wait() => status?,
            _ = tokio::time::sleep(self.limits.timeout) => {
                self.terminate(&mut child, pid).await;
                abort_capture(stdout);
                abort_capture(stderr);
                warn!(
                    script = %script.path().display(),
                    timeout_ms = self.limits.timeout.as_millis() as u64,
                    "script timed out"
                );
                return Err(ScriptError::Timeout(self.limits.timeout));
            }
            _ = cancel.cancelled() => {
                self.terminate(&mut child, pid).await;
                abort_capture(stdout);
                abort_capture(stderr);
                info!(script = %script.path().display(), "script cancelled");
                return Err(ScriptError::Cancelled);
            }
        };

        // Background children do not outlive the script; this also closes
        // any pipe they inherited
        signal_group(pid, Signal::Kill);
        let (stdout, truncated) = finish_capture(stdout).await;
        let (stderr, _) = finish_capture(stderr).await;

        let duration = started.elapsed();
        if !stderr.is_empty() {
            debug!(
                script = %script.path().display(),
                stderr = %preview(&String::from_utf8_lossy(&stderr), 200),
                "script stderr"
            );
        }
        info!(
            script = %script.path().display(),
            exit_code = ?status.code(),
            duration_ms = duration.as_millis() as u64,
            stdout_bytes = stdout.len(),
            truncated,
            "script finished"
        );

        Ok(ScriptResult {
            exit_code: status.code(),
            success: status.success(),
            stdout,
            stderr,
            duration,
            truncated,
        })
    }
}

type Capture = JoinHandle<std::io::Result<(Vec<u8>, bool)>>;

/// Read up to `limit` bytes, then keep draining so the child never blocks
/// on a full pipe.
fn spawn_capture<R>(mut pipe: R, limit: usize) -> Capture
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut captured = Vec::new();
        let mut truncated = false;
        let mut buf = [0u8; 8192];
        loop {
            let n = pipe.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            let room = limit.saturating_sub(captured.len());
            if n > room {
                truncated = true;
            }
            captured.extend_from_slice(&buf[..n.min(room)]);
        }
        Ok((captured, truncated))
    })
}

async fn finish_capture(handle: Option<Capture>) -> (Vec<u8>, bool) {
    let Some(mut handle) = handle else {
        return (Vec::new(), false);
    };
    match tokio::time::timeout(PIPE_DRAIN_GRACE, &mut handle).await {
        Ok(Ok(Ok(captured))) => captured,
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "failed reading script output");
            (Vec::new(), false)
        }
        Ok(Err(_)) => (Vec::new(), false),
        Err(_) => {
            handle.abort();
            (Vec::new(), true)
        }
    }
}

fn abort_capture(handle: Option<Capture>) {
    if let Some(handle) = handle {
        handle.abort();
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) with a negative pid signals the process group the
    // child leads after setsid; it touches no memory.
    unsafe {
        libc::kill(-pid, sig);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::messages::NodeNum;
    use crate::scripts::sandbox::DEFAULT_EXTENSIONS;
    use std::fs;

    fn executor(dir: &std::path::Path, limits: ExecutorLimits) -> ScriptExecutor {
        let extensions: Vec<String> = DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect();
        ScriptExecutor::new(ScriptSandbox::new(dir, &extensions).unwrap(), limits)
    }

    fn write(dir: &std::path::Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    fn invocation(target: &str) -> ScriptInvocation {
        ScriptInvocation::new(
            target,
            ExecutionContext::for_message("ping", NodeNum(0x1234)),
        )
    }

    #[tokio::test]
    async fn test_runs_script_with_context_env() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "echo.sh",
            "printf '{\"response\":\"%s from %s\"}' \"$MESSAGE\" \"$FROM_NODE\"\n",
        );
        let exec = executor(dir.path(), ExecutorLimits::default());

        let result = exec
            .run(&invocation("echo.sh"), CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(
            String::from_utf8_lossy(&result.stdout),
            r#"{"response":"ping from 4660"}"#
        );
    }

    #[tokio::test]
    async fn test_environment_is_not_inherited() {
        std::env::set_var("MESHRESPONDER_TEST_SECRET", "hunter2");
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "env.sh",
            "printf '%s' \"${MESHRESPONDER_TEST_SECRET:-unset}\"\n",
        );
        let exec = executor(dir.path(), ExecutorLimits::default());

        let result = exec
            .run(&invocation("env.sh"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&result.stdout), "unset");
    }

    #[tokio::test]
    async fn test_arguments_are_expanded_and_split() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "args.sh", "printf '%s|' \"$@\"\n");
        let exec = executor(dir.path(), ExecutorLimits::default());

        let inv = invocation("args.sh").with_arguments(Some(r#"--dest {NODE_ID} "two words""#.to_string()));
        let result = exec.run(&inv, CancellationToken::new()).await.unwrap();
        assert_eq!(
            String::from_utf8_lossy(&result.stdout),
            "--dest|!00001234|two words|"
        );
    }

    #[tokio::test]
    async fn test_timeout_kills_script() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "slow.sh", "sleep 30\n");
        let exec = executor(
            dir.path(),
            ExecutorLimits {
                timeout: Duration::from_millis(200),
                kill_grace: Duration::from_millis(200),
                ..ExecutorLimits::default()
            },
        );

        let started = Instant::now();
        let err = exec
            .run(&invocation("slow.sh"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_timeout_escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "stubborn.sh", "trap '' TERM\nsleep 30\n");
        let exec = executor(
            dir.path(),
            ExecutorLimits {
                timeout: Duration::from_millis(200),
                kill_grace: Duration::from_millis(200),
                ..ExecutorLimits::default()
            },
        );

        let started = Instant::now();
        let err = exec
            .run(&invocation("stubborn.sh"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancellation_stops_script() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "slow.sh", "sleep 30\n");
        let exec = executor(dir.path(), ExecutorLimits::default());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = exec.run(&invocation("slow.sh"), cancel).await.unwrap_err();
        assert!(matches!(err, ScriptError::Cancelled));
    }

    #[tokio::test]
    async fn test_stdout_capture_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "flood.sh",
            "i=0\nwhile [ $i -lt 2000 ]; do printf 'xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx\\n'; i=$((i+1)); done\n",
        );
        let exec = executor(
            dir.path(),
            ExecutorLimits {
                max_stdout_bytes: 1024,
                ..ExecutorLimits::default()
            },
        );

        let result = exec
            .run(&invocation("flood.sh"), CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.truncated);
        assert_eq!(result.stdout.len(), 1024);
    }

    #[tokio::test]
    async fn test_nonzero_exit_reported_in_result() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "fail.sh", "echo oops >&2\nexit 3\n");
        let exec = executor(dir.path(), ExecutorLimits::default());

        let result = exec
            .run(&invocation("fail.sh"), CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(String::from_utf8_lossy(&result.stderr).trim(), "oops");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_script_runs_in_its_own_session() {
        let dir = tempfile::tempdir().unwrap();
        // Field 6 of /proc/<pid>/stat is the session id
        write(
            dir.path(),
            "sid.sh",
            "read -r _ _ _ _ _ sid _ < /proc/$$/stat\nprintf '%s %s' \"$$\" \"$sid\"\n",
        );
        let exec = executor(dir.path(), ExecutorLimits::default());

        let result = exec
            .run(&invocation("sid.sh"), CancellationToken::new())
            .await
            .unwrap();
        let out = String::from_utf8_lossy(&result.stdout).to_string();
        let ids: Vec<i32> = out.split_whitespace().map(|v| v.parse().unwrap()).collect();
        assert_eq!(ids.len(), 2, "unexpected output: {}", out);

        // SAFETY: getsid(0) only queries the calling process
        let own_sid = unsafe { libc::getsid(0) };
        assert_ne!(ids[1], own_sid);
        // Session leader: sid equals the script's pid
        assert_eq!(ids[1], ids[0]);
    }

    #[tokio::test]
    async fn test_concurrency_ceiling_serialises_runs() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "nap.sh", "sleep 0.4\n");
        let exec = executor(
            dir.path(),
            ExecutorLimits {
                max_concurrent: 1,
                ..ExecutorLimits::default()
            },
        );

        let started = Instant::now();
        let first = invocation("nap.sh");
        let second = invocation("nap.sh");
        let (a, b) = tokio::join!(
            exec.run(&first, CancellationToken::new()),
            exec.run(&second, CancellationToken::new()),
        );
        assert!(a.unwrap().success);
        assert!(b.unwrap().success);
        assert!(started.elapsed() >= Duration::from_millis(800));
    }

    #[cfg(target_os = "linux")]
    fn is_running(pid: i32) -> bool {
        match fs::read_to_string(format!("/proc/{}/stat", pid)) {
            // State follows the parenthesised command name
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next())
                .is_some_and(|state| state != "Z" && state != "X"),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_spawned_children() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("child.pid");
        write(
            dir.path(),
            "spawner.sh",
            &format!("sleep 30 &\necho $! > {}\nwait\n", pid_file.display()),
        );
        let exec = executor(
            dir.path(),
            ExecutorLimits {
                timeout: Duration::from_millis(300),
                kill_grace: Duration::from_millis(200),
                ..ExecutorLimits::default()
            },
        );

        let err = exec
            .run(&invocation("spawner.sh"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Timeout(_)));

        let child: i32 = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while is_running(child) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!is_running(child), "child {} outlived the script", child);
    }

    #[tokio::test]
    async fn test_rejected_path_is_never_spawned() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), ExecutorLimits::default());
        let err = exec
            .run(&invocation("../../etc/passwd"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Security(_)));
    }
}
