//! Process supervisor
//!
//! Runs the task as a child in its own process group and escalates from a
//! graceful terminate to a kill when it outlives its hard timeout:
//!
//! `Idle -> Running -> {Completed | TermSent -> {Completed | KillSent -> Completed}}`
//!
//! A termination request to the agent while `Running` is handled exactly
//! like the deadline. Requests during the grace window are ignored.

use crate::signal::TerminationSignal;
use isorun_core::{EnvironmentVariables, Error, Result, TaskResult};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};

/// Exit code reported when the child could not be started
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 1;

/// Supervisor state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Running,
    TermSent,
    KillSent,
    Completed,
}

/// What to run
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub env: EnvironmentVariables,
}

/// Timeout discipline
#[derive(Debug, Clone, Copy)]
pub struct Deadlines {
    /// `None` waits until the child exits or a termination request arrives
    pub hard_timeout: Option<Duration>,
    pub grace_period: Duration,
}

/// Outcome of a supervised run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessReport {
    pub exit_code: i32,
    /// The hard timeout fired
    pub had_hard_timeout: bool,
    /// The agent received a termination request while the child ran
    pub had_signal: bool,
    /// The child was still alive after the grace period
    pub killed: bool,
    /// Whether the child was spawned at all
    pub started: bool,
}

impl ProcessReport {
    pub fn task_result(&self) -> TaskResult {
        TaskResult {
            exit_code: Some(self.exit_code),
            had_hard_timeout: self.had_hard_timeout,
        }
    }
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    Deadline,
    Signal,
}

/// Run the child to completion under the timeout discipline.
///
/// A child that cannot be spawned is a task failure with exit code 1. An
/// `Err` only means waiting on a spawned child failed.
pub async fn supervise(
    spec: &ProcessSpec,
    deadlines: Deadlines,
    signal: &TerminationSignal,
) -> Result<ProcessReport> {
    let mut state = SupervisorState::Idle;
    let mut report = ProcessReport {
        exit_code: SPAWN_FAILURE_EXIT_CODE,
        had_hard_timeout: false,
        had_signal: false,
        killed: false,
        started: false,
    };

    let Some((program, args)) = spec.command.split_first() else {
        return Err(Error::validation("empty command"));
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(&spec.cwd)
        .env_clear()
        .envs(spec.env.iter())
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    configure_platform_specific(&mut command);

    // Armed first so a request that arrives while spawning is not lost
    let token = signal.arm();
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            signal.disarm();
            // The child's own diagnostics would have gone to stderr; so does ours
            eprintln!("isorun: failed to start {program}: {e}");
            tracing::error!(command = ?spec.command, error = %e, "failed to start task");
            return Ok(report);
        }
    };
    report.started = true;
    transition(&mut state, SupervisorState::Running, child.id());

    let wake = tokio::select! {
        status = child.wait() => Wake::Exited(status),
        _ = deadline(deadlines.hard_timeout) => Wake::Deadline,
        _ = token.cancelled() => Wake::Signal,
    };
    signal.disarm();

    let status = match wake {
        Wake::Exited(status) => status,
        Wake::Deadline | Wake::Signal => {
            if matches!(wake, Wake::Deadline) {
                report.had_hard_timeout = true;
                tracing::warn!(timeout = ?deadlines.hard_timeout, "hard timeout reached");
            } else {
                report.had_signal = true;
            }
            transition(&mut state, SupervisorState::TermSent, child.id());
            terminate(&mut child);

            let graceful = tokio::select! {
                status = child.wait() => Some(status),
                _ = tokio::time::sleep(deadlines.grace_period) => None,
            };
            match graceful {
                Some(status) => status,
                None => {
                    transition(&mut state, SupervisorState::KillSent, child.id());
                    kill(&mut child);
                    report.killed = true;
                    // No deadline: never hand back an unreaped child
                    child.wait().await
                }
            }
        }
    };

    let status = status.map_err(|e| {
        Error::command_execution(program, args.to_vec(), format!("failed to wait for task: {e}"), None)
    })?;
    report.exit_code = exit_code(&status);
    transition(&mut state, SupervisorState::Completed, None);
    tracing::info!(
        exit_code = report.exit_code,
        had_hard_timeout = report.had_hard_timeout,
        killed = report.killed,
        "task completed"
    );
    Ok(report)
}

fn transition(state: &mut SupervisorState, next: SupervisorState, pid: Option<u32>) {
    tracing::debug!(from = ?*state, to = ?next, pid = ?pid, "supervisor transition");
    *state = next;
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

fn configure_platform_specific(command: &mut Command) {
    // Own process group: the agent's signals do not reach the child directly,
    // and the whole group can be signalled at once
    #[cfg(unix)]
    command.process_group(0);
    #[cfg(not(unix))]
    let _ = command;
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) {
    if let Some(pid) = child.id() {
        // SAFETY: kill has no memory safety preconditions
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
        if rc != 0 {
            tracing::debug!(pid, signal, error = %std::io::Error::last_os_error(), "failed to signal process group");
        }
    }
}

fn terminate(child: &mut Child) {
    #[cfg(unix)]
    signal_group(child, libc::SIGTERM);
    #[cfg(not(unix))]
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "failed to terminate task");
    }
}

fn kill(child: &mut Child) {
    #[cfg(unix)]
    signal_group(child, libc::SIGKILL);
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "failed to kill task");
    }
}

/// Exit code, or the negated signal number for a child killed by a signal
fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    SPAWN_FAILURE_EXIT_CODE
}
