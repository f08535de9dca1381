/// Step command executor
///
/// Spawns `<shell> -c <command>` inside the working root, captures output,
/// and watches for timeout and cancellation while the process runs.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::cancel::CancellationToken;
use super::descriptor::ResolvedStep;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed,
    /// Stopped by a cancellation request while running
    Interrupted,
}

/// Result of running (or restoring) one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub step_id: String,
    pub cache_key: String,
    pub outcome: StepOutcome,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// True when the result came from the cache instead of running the command
    #[serde(default)]
    pub cache_hit: bool,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == StepOutcome::Succeeded
    }

    /// Turn a successful result into a failure, keeping the captured output
    pub fn fail_with(&mut self, reason: &str) {
        self.outcome = StepOutcome::Failed;
        if !self.stderr.is_empty() && !self.stderr.ends_with('\n') {
            self.stderr.push('\n');
        }
        self.stderr.push_str(reason);
        self.stderr.push('\n');
    }
}

/// Per-invocation context handed to the executor
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub root: &'a Path,
    pub stage: &'a str,
}

/// Runs resolved steps through a shell
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: PathBuf,
    timeout: Option<Duration>,
}

impl ShellExecutor {
    /// Resolve the shell through PATH, falling back to the name as given
    pub fn new(shell: &str, timeout: Option<Duration>) -> Self {
        let shell = which::which(shell).unwrap_or_else(|e| {
            warn!(shell, error = %e, "could not find shell in PATH, trying as-is");
            PathBuf::from(shell)
        });

        Self { shell, timeout }
    }

    pub fn shell(&self) -> &Path {
        &self.shell
    }

    /// Execute a step, blocking until it exits, times out, or is cancelled
    pub fn execute(
        &self,
        step: &ResolvedStep,
        ctx: StepContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let start = Instant::now();
        let command = step.command();

        debug!(
            operation = "step.execute",
            step_id = step.id(),
            stage = ctx.stage,
            command = %command,
            "spawning step"
        );

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&command)
            .current_dir(ctx.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("STRATA_ROOT", ctx.root)
            .env("STRATA_STEP_ID", step.id())
            .env("STRATA_STAGE", ctx.stage);

        for (name, value) in step.params() {
            cmd.env(param_env_name(name), value);
        }
        cmd.envs(step.env());

        // Own process group, so termination reaches everything the step started
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn shell: {}", self.shell.display()))?;

        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());

        let (status, stop) = self.wait(&mut child, start, cancel)?;

        // Background processes left by the step would hold the pipes open
        kill_leftovers(&child);

        let stdout = join_reader(stdout_reader);
        let stderr = join_reader(stderr_reader);
        let duration = start.elapsed();
        let exit_code = exit_code(&status);

        let mut result = ExecutionResult {
            step_id: step.id().to_string(),
            cache_key: step.cache_key(),
            outcome: StepOutcome::Succeeded,
            exit_code,
            stdout,
            stderr,
            duration,
            cache_hit: false,
        };

        match stop {
            Stop::Exited if status.success() => {}
            Stop::Exited => result.outcome = StepOutcome::Failed,
            Stop::TimedOut => {
                let secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
                result.fail_with(&format!("step timed out after {}s", secs));
            }
            Stop::Cancelled => result.outcome = StepOutcome::Interrupted,
        }

        debug!(
            operation = "step.execute",
            step_id = step.id(),
            exit_code,
            duration_ms = duration.as_millis() as u64,
            "step finished"
        );

        Ok(result)
    }

    /// Poll the child until it exits, terminating it on timeout or cancellation
    fn wait(
        &self,
        child: &mut Child,
        start: Instant,
        cancel: &CancellationToken,
    ) -> Result<(ExitStatus, Stop)> {
        loop {
            if let Some(status) = child.try_wait().context("Failed to wait for step process")? {
                return Ok((status, Stop::Exited));
            }

            if cancel.is_cancelled() {
                let status = terminate(child)?;
                return Ok((status, Stop::Cancelled));
            }

            if let Some(timeout) = self.timeout {
                if start.elapsed() >= timeout {
                    let status = terminate(child)?;
                    return Ok((status, Stop::TimedOut));
                }
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Exited,
    TimedOut,
    Cancelled,
}

/// `version` -> `STRATA_PARAM_VERSION`, `node-version` -> `STRATA_PARAM_NODE_VERSION`
pub fn param_env_name(name: &str) -> String {
    let normalized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("STRATA_PARAM_{}", normalized)
}

fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Ask the process group to stop, then kill it if it ignores the request
#[cfg(unix)]
fn terminate(child: &mut Child) -> Result<ExitStatus> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let group = Pid::from_raw(child.id() as i32);
    let _ = killpg(group, Signal::SIGTERM);

    let deadline = Instant::now() + KILL_GRACE;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        thread::sleep(POLL_INTERVAL);
    }

    let _ = killpg(group, Signal::SIGKILL);
    let _ = child.kill();
    Ok(child.wait()?)
}

/// Kill whatever is still running in the step's process group after the shell exited
#[cfg(unix)]
fn kill_leftovers(child: &Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL).is_ok() {
        debug!(pgid = child.id(), "killed processes left behind by step");
    }
}

#[cfg(not(unix))]
fn kill_leftovers(_child: &Child) {}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> Result<ExitStatus> {
    let _ = child.kill();
    Ok(child.wait()?)
}
