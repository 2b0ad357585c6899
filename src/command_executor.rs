//! command_executor.rs - Runs external commands to completion and captures their output.
//!
//! Every stage of the pipeline reaches the OS through the [`Executor`] trait.
//! Commands are argument vectors ([`CommandSpec`]), never shell strings, so
//! user-supplied values cannot be reinterpreted by a shell. The production
//! [`SystemExecutor`] spawns each command in its own process group, tracks it
//! in the global child registry and enforces a time budget.

use crate::error::{CommandError, CommandFailure};
use crate::process_guard::{self, CommandProcessGroup};
use log::{debug, error, info, warn};
use std::io::Read;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Default time budget for a single command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// How long a timed-out process group gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(3);

/// Minimum wait for the output pipes to close once the child has exited.
const PIPE_DRAIN: Duration = Duration::from_millis(500);

/// An external command as an argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Needs root; prefixed with `sudo -n` when the installer is not root
    pub elevated: bool,
    /// Pure host probe that is safe to run during a dry run
    pub read_only: bool,
    /// Overrides the executor's default time budget
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            elevated: false,
            read_only: false,
            timeout: None,
        }
    }

    /// A privileged command, the common case for provisioning steps.
    pub fn privileged(program: impl Into<String>) -> Self {
        Self::new(program).elevated()
    }

    /// A command run inside the target root through `arch-chroot`.
    pub fn in_root(root: &Path, program: &str) -> Self {
        Self::privileged("arch-chroot")
            .arg(root.display().to_string())
            .arg(program)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn elevated(mut self) -> Self {
        self.elevated = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// The command line as a user would type it, for logs and error messages.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Quote an argument for display only; nothing is ever passed to a shell.
fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Captured result of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs commands to completion. Implementations must be shareable across
/// the scoped probe threads of the Analyze stage.
pub trait Executor: Send + Sync {
    /// Run `spec` and wait for it. A non-zero exit, a signal, a timeout or a
    /// spawn failure is a [`CommandError`].
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult, CommandError>;
}

impl<E: Executor + ?Sized> Executor for &E {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult, CommandError> {
        (**self).execute(spec)
    }
}

impl<E: Executor + ?Sized> Executor for Box<E> {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult, CommandError> {
        (**self).execute(spec)
    }
}

impl<E: Executor + ?Sized> Executor for std::sync::Arc<E> {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult, CommandError> {
        (**self).execute(spec)
    }
}

/// Executes commands on the host.
#[derive(Debug, Clone)]
pub struct SystemExecutor {
    default_timeout: Duration,
}

impl Default for SystemExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl SystemExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    fn argv(&self, spec: &CommandSpec) -> (String, Vec<String>) {
        if spec.elevated && !nix::unistd::geteuid().is_root() {
            let mut args = vec!["-n".to_string(), spec.program.clone()];
            args.extend(spec.args.iter().cloned());
            ("sudo".to_string(), args)
        } else {
            (spec.program.clone(), spec.args.clone())
        }
    }
}

impl Executor for SystemExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult, CommandError> {
        let (program, args) = self.argv(spec);
        let command_line = spec.command_line();
        let limit = spec.timeout.unwrap_or(self.default_timeout);

        if process_guard::is_shutting_down() {
            return Err(CommandError::spawn(&command_line, "installer is shutting down"));
        }
        info!("exec: {}", command_line);

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group()
            .spawn()
            .map_err(|e| {
                error!("Failed to launch `{}`: {}", command_line, e);
                CommandError::spawn(&command_line, e)
            })?;
        let pid = child.id();
        process_guard::track(pid, &command_line);

        // Drain both pipes concurrently so a chatty child never blocks on a full pipe
        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let started = Instant::now();
        let deadline = started + limit;
        let waited = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Ok(Some(status)),
                Ok(None) if started.elapsed() >= limit => {
                    error!("`{}` exceeded {}s, killing it", command_line, limit.as_secs());
                    process_guard::terminate_group(pid, KILL_GRACE);
                    let _ = child.wait();
                    break Ok(None);
                }
                Ok(None) => thread::sleep(Duration::from_millis(50)),
                Err(e) => break Err(e),
            }
        };

        // Background processes of the child can hold the pipes open
        let pipe_deadline = deadline.max(Instant::now() + PIPE_DRAIN);
        let mut stdout = recv_until(stdout_reader.as_ref(), pipe_deadline);
        let mut stderr = recv_until(stderr_reader.as_ref(), pipe_deadline);
        if stdout.is_none() || stderr.is_none() {
            warn!(
                "`{}` left processes holding its output open, stopping its process group",
                command_line
            );
            process_guard::terminate_group(pid, KILL_GRACE);
            let drained = Instant::now() + PIPE_DRAIN;
            stdout = stdout.or_else(|| recv_until(stdout_reader.as_ref(), drained));
            stderr = stderr.or_else(|| recv_until(stderr_reader.as_ref(), drained));
        }
        process_guard::untrack(pid);
        let stdout = stdout.unwrap_or_default();
        let stderr = stderr.unwrap_or_default();

        let status = match waited {
            Ok(status) => status,
            Err(e) => return Err(CommandError::spawn(&command_line, e)),
        };

        debug!("`{}` stdout:\n{}", command_line, stdout);
        debug!("`{}` stderr:\n{}", command_line, stderr);

        match status {
            Some(status) if status.success() => {
                info!("`{}` succeeded", command_line);
                Ok(ExecutionResult {
                    exit_code: 0,
                    stdout,
                    stderr,
                })
            }
            Some(status) => {
                let err = failed(command_line, status, stdout, stderr);
                error!("{}", err);
                Err(err)
            }
            None => {
                let err = CommandError {
                    command: command_line,
                    failure: CommandFailure::TimedOut(limit),
                    exit_code: None,
                    signal: Some(nix::libc::SIGTERM),
                    stdout,
                    stderr,
                };
                error!("{}", err);
                Err(err)
            }
        }
    }
}

fn failed(command: String, status: ExitStatus, stdout: String, stderr: String) -> CommandError {
    let failure = if status.signal().is_some() {
        CommandFailure::Signaled
    } else {
        CommandFailure::NonZeroExit
    };
    CommandError {
        command,
        failure,
        exit_code: status.code(),
        signal: status.signal(),
        stdout,
        stderr,
    }
}

/// Read a pipe to EOF on its own thread; the text arrives on the channel.
fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
    });
    rx
}

/// Pipe contents, or `None` if the pipe is still open at `deadline`.
fn recv_until(reader: Option<&Receiver<String>>, deadline: Instant) -> Option<String> {
    match reader {
        None => Some(String::new()),
        Some(rx) => rx
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .ok(),
    }
}

/// Runs read-only host probes for real and records everything else without
/// executing it.
///
/// Used by `--dry-run`: disk listings, firmware and GPU probes stay
/// realistic while nothing touches the disk.
#[derive(Debug, Default)]
pub struct DryRunExecutor<E> {
    inner: E,
    skipped: Mutex<Vec<String>>,
}

impl<E: Executor> DryRunExecutor<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            skipped: Mutex::new(Vec::new()),
        }
    }

    /// Command lines that were skipped, in order.
    pub fn skipped(&self) -> Vec<String> {
        self.skipped.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl<E: Executor> Executor for DryRunExecutor<E> {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult, CommandError> {
        if spec.read_only {
            return self.inner.execute(spec);
        }
        let line = spec.command_line();
        info!("[DRY RUN] would run: {}", line);
        if let Ok(mut skipped) = self.skipped.lock() {
            skipped.push(line);
        }
        Ok(ExecutionResult::default())
    }
}
