//! Running the synchronization command
//!
//! The dispatcher only talks to a `CommandRunner`. `ProcessRunner` spawns the
//! real program; tests substitute an in-memory runner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use mailwatch_core::{CommandLine, SyncKey};

/// Captured output kept per stream
const OUTPUT_LIMIT: usize = 8 * 1024;

/// One run of the command for one key
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Correlates start and completion log lines
    pub id: Uuid,
    pub key: SyncKey,
    pub command: CommandLine,
    pub started_at: DateTime<Utc>,
}

impl Invocation {
    pub fn new(key: SyncKey, command: CommandLine) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            command,
            started_at: Utc::now(),
        }
    }
}

/// How an invocation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// Nonzero exit, or killed by a signal
    Failed {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// Could not be started at all
    LaunchFailed(String),
    /// Killed after exceeding the configured timeout
    TimedOut(Duration),
    /// Terminated because the daemon is shutting down
    Cancelled,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("exit 0"),
            Self::Failed { code: Some(code), .. } => write!(f, "exit {}", code),
            Self::Failed { signal: Some(signal), .. } => write!(f, "signal {}", signal),
            Self::Failed { .. } => f.write_str("failed"),
            Self::LaunchFailed(err) => write!(f, "launch failed: {}", err),
            Self::TimedOut(after) => write!(f, "timed out after {:?}", after),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub outcome: Outcome,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl Completion {
    pub fn new(outcome: Outcome, duration: Duration) -> Self {
        Self {
            outcome,
            stdout: String::new(),
            stderr: String::new(),
            duration,
        }
    }
}

/// Executes invocations
///
/// `cancel` fires on daemon shutdown; implementations should ask the
/// command to stop and still return once it has.
#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    async fn run(&self, invocation: &Invocation, cancel: CancellationToken) -> Completion;
}

/// Runs commands as child processes, without a shell
///
/// Each command gets its own process group; termination signals go to the
/// whole group so helpers spawned by the command stop with it.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

enum Ending {
    Exited,
    Cancelled,
    TimedOut(Duration),
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation, cancel: CancellationToken) -> Completion {
        let start = Instant::now();
        let line = &invocation.command;

        let mut command = Command::new(&line.program);
        command
            .args(&line.args)
            .envs(line.env.iter().map(|(name, value)| (name, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return Completion::new(Outcome::LaunchFailed(err.to_string()), start.elapsed())
            }
        };
        let pid = child.id();
        debug!(invocation = %invocation.id, pid, "Spawned command");

        let output = child.wait_with_output();
        tokio::pin!(output);

        let timeout_at = self.timeout.and_then(|timeout| start.checked_add(timeout));
        let far = start + Duration::from_secs(86_400 * 365);

        let (ending, result) = tokio::select! {
            result = &mut output => (Ending::Exited, result),
            _ = cancel.cancelled() => {
                signal(pid, Signal::Term);
                (Ending::Cancelled, output.await)
            }
            _ = sleep_until(timeout_at.unwrap_or(far)), if timeout_at.is_some() => {
                let after = start.elapsed();
                signal(pid, Signal::Kill);
                (Ending::TimedOut(after), output.await)
            }
        };

        let duration = start.elapsed();
        let output = match result {
            Ok(output) => output,
            Err(err) => return Completion::new(Outcome::LaunchFailed(err.to_string()), duration),
        };

        let outcome = match ending {
            Ending::Cancelled => Outcome::Cancelled,
            Ending::TimedOut(after) => Outcome::TimedOut(after),
            Ending::Exited => exit_outcome(output.status),
        };

        Completion {
            outcome,
            stdout: tail(&output.stdout),
            stderr: tail(&output.stderr),
            duration,
        }
    }
}

enum Signal {
    Term,
    Kill,
}

fn signal(pid: Option<u32>, signal: Signal) {
    use nix::sys::signal::{kill, Signal as NixSignal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return;
    };
    let sig = match signal {
        Signal::Term => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };
    if let Err(err) = kill(Pid::from_raw(-(pid as i32)), sig) {
        debug!(pid, "Failed to signal command: {}", err);
    }
}

fn exit_outcome(status: ExitStatus) -> Outcome {
    use std::os::unix::process::ExitStatusExt;

    if status.success() {
        Outcome::Succeeded
    } else {
        Outcome::Failed {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// Last `OUTPUT_LIMIT` bytes of a stream, lossily decoded
fn tail(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(OUTPUT_LIMIT);
    String::from_utf8_lossy(&bytes[start..]).trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Invocation {
        Invocation::new(
            SyncKey::folder("work", "INBOX"),
            CommandLine {
                program: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                env: vec![("MAILWATCH_FOLDER".to_string(), "INBOX".to_string())],
            },
        )
    }

    #[tokio::test]
    async fn test_success_captures_output_and_env() {
        let runner = ProcessRunner::default();
        let done = runner
            .run(&sh("echo synced $MAILWATCH_FOLDER"), CancellationToken::new())
            .await;

        assert_eq!(done.outcome, Outcome::Succeeded);
        assert_eq!(done.stdout, "synced INBOX");
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let runner = ProcessRunner::default();
        let done = runner
            .run(&sh("echo 'no such mailbox' >&2; exit 3"), CancellationToken::new())
            .await;

        assert_eq!(done.outcome, Outcome::Failed { code: Some(3), signal: None });
        assert_eq!(done.stderr, "no such mailbox");
        assert_eq!(done.outcome.to_string(), "exit 3");
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let runner = ProcessRunner::default();
        let mut invocation = sh("true");
        invocation.command.program = "/nonexistent/mbsync".to_string();

        let done = runner.run(&invocation, CancellationToken::new()).await;
        assert!(matches!(done.outcome, Outcome::LaunchFailed(_)));
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let runner = ProcessRunner::new(Some(Duration::from_millis(200)));
        let done = runner.run(&sh("sleep 30"), CancellationToken::new()).await;

        assert!(matches!(done.outcome, Outcome::TimedOut(_)));
        assert!(done.duration < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_huge_timeout_is_no_timeout() {
        let runner = ProcessRunner::new(Some(Duration::MAX));
        let done = runner.run(&sh("echo ok"), CancellationToken::new()).await;

        assert_eq!(done.outcome, Outcome::Succeeded);
        assert_eq!(done.stdout, "ok");
    }

    #[tokio::test]
    async fn test_cancel_terminates_command() {
        let runner = ProcessRunner::default();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let done = runner.run(&sh("sleep 30"), cancel).await;

        assert_eq!(done.outcome, Outcome::Cancelled);
        assert!(done.duration < Duration::from_secs(10));
    }

    #[test]
    fn test_tail_truncates() {
        let long = vec![b'x'; OUTPUT_LIMIT + 100];
        assert_eq!(tail(&long).len(), OUTPUT_LIMIT);
        assert_eq!(tail(b"done\n"), "done");
    }
}
