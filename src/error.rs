//! Error handling module for the provisioning pipeline
//!
//! Internal code works with the typed errors below. Only [`PipelineError`]
//! crosses the boundary to the presentation layer; the orchestrator
//! normalizes everything into it before a run resolves.

use crate::install_state::{InstallStage, InstallTransitionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Why an external command did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandFailure {
    /// The process could not be launched at all
    Spawn(String),
    /// The process ran and exited with a non-zero status
    NonZeroExit,
    /// The process was terminated by a signal
    Signaled,
    /// The process exceeded its time budget and was killed
    TimedOut(Duration),
}

/// Failure of a single external command, with everything it printed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    /// Full command line as it was executed
    pub command: String,
    pub failure: CommandFailure,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandError {
    /// Error for a process that could not be spawned.
    pub fn spawn(command: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self {
            command: command.into(),
            failure: CommandFailure::Spawn(reason.to_string()),
            exit_code: None,
            signal: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failure {
            CommandFailure::Spawn(reason) => {
                return write!(f, "failed to launch `{}`: {}", self.command, reason);
            }
            CommandFailure::NonZeroExit => write!(
                f,
                "command `{}` failed with exit code {}",
                self.command,
                self.exit_code.unwrap_or(-1)
            )?,
            CommandFailure::Signaled => write!(
                f,
                "command `{}` was killed by signal {}",
                self.command,
                self.signal.unwrap_or(0)
            )?,
            CommandFailure::TimedOut(limit) => write!(
                f,
                "command `{}` timed out after {}s",
                self.command,
                limit.as_secs()
            )?,
        }
        write!(
            f,
            "\nstdout={}\nstderr={}",
            self.stdout.trim_end(),
            self.stderr.trim_end()
        )
    }
}

impl std::error::Error for CommandError {}

/// The inspector or planner could not settle on a safe layout.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanningError {
    #[error("invalid device path '{0}' (must be an absolute /dev path)")]
    InvalidDevicePath(String),

    #[error("device {0} was not found among installable disks")]
    DeviceNotFound(String),

    #[error("device {device} is too small ({size_bytes} bytes, need at least {minimum_bytes})")]
    DiskTooSmall {
        device: String,
        size_bytes: u64,
        minimum_bytes: u64,
    },

    #[error("could not parse {what}: {reason}")]
    Unparseable { what: String, reason: String },

    #[error("no EFI System Partition on {0} to install a bootloader alongside the existing system")]
    MissingEfiPartition(String),

    #[error("no free region of at least {required_mib} MiB on {device} (largest is {largest_mib} MiB)")]
    InsufficientFreeSpace {
        device: String,
        largest_mib: u64,
        required_mib: u64,
    },

    #[error("no partition number left on {0} for a new primary partition")]
    NoPartitionNumber(String),
}

/// A command failure attributed to the stage it happened in.
#[derive(Error, Debug, Clone)]
#[error("{stage} failed: {source}")]
pub struct StageError {
    pub stage: InstallStage,
    #[source]
    pub source: CommandError,
}

/// Internal error type of the pipeline
#[derive(Error, Debug)]
pub enum InstallError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Stage(#[from] StageError),

    /// File written or read inside the target root
    #[error("{context} ({path}): {source}")]
    Io {
        context: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another run already owns the mount root
    #[error("an installation is already running on {0}")]
    Busy(PathBuf),

    #[error("installation cancelled before any destructive step")]
    Cancelled,

    /// A termination signal arrived; the run stopped at a stage boundary
    #[error("installation interrupted by a termination signal")]
    Interrupted,

    #[error(transparent)]
    Transition(#[from] InstallTransitionError),
}

impl InstallError {
    /// Wrap an I/O error with the path it concerns.
    pub fn io(context: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            path: path.into(),
            source,
        }
    }

    /// Attach the stage to a bare command failure; other variants pass through.
    pub fn in_stage(self, stage: InstallStage) -> Self {
        match self {
            Self::Command(source) => Self::Stage(StageError { stage, source }),
            other => other,
        }
    }

    /// The command failure underneath, if any.
    pub fn command_error(&self) -> Option<&CommandError> {
        match self {
            Self::Command(e) => Some(e),
            Self::Stage(e) => Some(&e.source),
            _ => None,
        }
    }
}

/// The only error shape handed to the presentation layer.
///
/// `message` always embeds the failing command line and its captured output
/// so the operator can diagnose without access to the installer log.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
#[serde(rename_all = "camelCase")]
pub struct PipelineError {
    pub message: String,
    /// Stage the run was in when it failed
    pub stage_context: Option<String>,
    pub command: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

impl PipelineError {
    /// Error that did not come from an [`InstallError`].
    pub fn new(message: impl Into<String>, stage: Option<InstallStage>) -> Self {
        Self {
            message: message.into(),
            stage_context: stage.map(|s| s.to_string()),
            command: None,
            stdout: None,
            stderr: None,
            exit_code: None,
            signal: None,
            timestamp: Utc::now(),
        }
    }

    /// Normalize an internal error raised while `stage` was active.
    pub fn from_install_error(err: &InstallError, stage: Option<InstallStage>) -> Self {
        let stage = match err {
            InstallError::Stage(e) => Some(e.stage),
            _ => stage,
        };
        let stage_context = stage.map(|s| s.to_string());
        let message = match (err, &stage_context) {
            (InstallError::Stage(_), _) | (_, None) => err.to_string(),
            (_, Some(s)) => format!("{} failed: {}", s, err),
        };
        let mut shaped = Self {
            stage_context,
            ..Self::new(message, None)
        };
        if let Some(cmd) = err.command_error() {
            shaped.command = Some(cmd.command.clone());
            shaped.stdout = Some(cmd.stdout.clone());
            shaped.stderr = Some(cmd.stderr.clone());
            shaped.exit_code = cmd.exit_code;
            shaped.signal = cmd.signal;
        }
        shaped
    }
}

impl From<InstallError> for PipelineError {
    fn from(err: InstallError) -> Self {
        Self::from_install_error(&err, None)
    }
}
