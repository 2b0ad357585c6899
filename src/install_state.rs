//! Install State Machine
//!
//! Authoritative record of where a pipeline run is. Stages only move forward
//! one step at a time; any non-terminal stage may fail.
//!
//! ```text
//! NotStarted
//!     ↓
//! Analyze (10%) → Partition (20%) → Format (30%) → Mount (40%)
//!     ↓
//! InstallBase (50%) → Configure (70%) → Bootloader (85%)
//!     ↓
//! Finalize (95%) → Cleanup (100%)
//!     ↓
//! Completed
//!
//! (Any stage can transition to Failed)
//! ```

use crate::types::BootMode;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum InstallStage {
    NotStarted = 0,
    /// Probe firmware, disk and GPU
    Analyze = 1,
    /// DESTRUCTIVE: writes the partition table
    Partition = 2,
    /// DESTRUCTIVE: creates filesystems
    Format = 3,
    Mount = 4,
    InstallBase = 5,
    Configure = 6,
    Bootloader = 7,
    Finalize = 8,
    Cleanup = 9,
    Completed = 10,
    Failed = 255,
}

impl InstallStage {
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stages whose commands cannot be interrupted once issued
    #[inline]
    pub const fn is_destructive(self) -> bool {
        matches!(self, Self::Partition | Self::Format)
    }

    pub const fn next(self) -> Option<Self> {
        match self {
            Self::NotStarted => Some(Self::Analyze),
            Self::Analyze => Some(Self::Partition),
            Self::Partition => Some(Self::Format),
            Self::Format => Some(Self::Mount),
            Self::Mount => Some(Self::InstallBase),
            Self::InstallBase => Some(Self::Configure),
            Self::Configure => Some(Self::Bootloader),
            Self::Bootloader => Some(Self::Finalize),
            Self::Finalize => Some(Self::Cleanup),
            Self::Cleanup => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::NotStarted => "Not started",
            Self::Analyze => "Analyzing hardware",
            Self::Partition => "Partitioning disk",
            Self::Format => "Formatting partitions",
            Self::Mount => "Mounting filesystems",
            Self::InstallBase => "Installing base system",
            Self::Configure => "Configuring system",
            Self::Bootloader => "Installing bootloader",
            Self::Finalize => "Finalizing installation",
            Self::Cleanup => "Cleaning up",
            Self::Completed => "Installation complete",
            Self::Failed => "Installation failed",
        }
    }

    /// Progress checkpoint reported when the stage begins.
    pub const fn progress_percent(self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Analyze => 10,
            Self::Partition => 20,
            Self::Format => 30,
            Self::Mount => 40,
            Self::InstallBase => 50,
            Self::Configure => 70,
            Self::Bootloader => 85,
            Self::Finalize => 95,
            Self::Cleanup | Self::Completed => 100,
            Self::Failed => 0,
        }
    }

    /// All stages in order (excluding Failed)
    pub const fn all_stages() -> &'static [Self] {
        &[
            Self::NotStarted,
            Self::Analyze,
            Self::Partition,
            Self::Format,
            Self::Mount,
            Self::InstallBase,
            Self::Configure,
            Self::Bootloader,
            Self::Finalize,
            Self::Cleanup,
            Self::Completed,
        ]
    }
}

impl fmt::Display for InstallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstallTransitionError {
    #[error("Cannot skip from {from} to {to} (must transition through intermediate stages)")]
    SkippedStage { from: InstallStage, to: InstallStage },

    #[error("Cannot go backwards from {from} to {to} (installation is forward-only)")]
    BackwardTransition { from: InstallStage, to: InstallStage },

    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: InstallStage },

    #[error("Already at stage {stage}")]
    AlreadyAtStage { stage: InstallStage },
}

/// Per-run state: current stage, history and the firmware mode fixed at
/// Analyze.
#[derive(Debug, Clone)]
pub struct RunContext {
    current: InstallStage,
    failed_at: Option<InstallStage>,
    /// (stage, unix timestamp) for every stage entered
    stage_history: Vec<(InstallStage, u64)>,
    boot_mode: Option<BootMode>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            current: InstallStage::NotStarted,
            failed_at: None,
            stage_history: Vec::with_capacity(InstallStage::all_stages().len()),
            boot_mode: None,
        }
    }

    #[inline]
    pub fn current_stage(&self) -> InstallStage {
        self.current
    }

    #[inline]
    pub fn failed_at(&self) -> Option<InstallStage> {
        self.failed_at
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.current == InstallStage::Completed
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        self.current == InstallStage::Failed
    }

    pub fn stage_history(&self) -> &[(InstallStage, u64)] {
        &self.stage_history
    }

    /// Firmware mode recorded for this run, if Analyze has completed.
    pub fn boot_mode(&self) -> Option<BootMode> {
        self.boot_mode
    }

    /// Record the firmware mode. The first value wins; later calls are ignored.
    pub fn set_boot_mode(&mut self, mode: BootMode) -> BootMode {
        *self.boot_mode.get_or_insert(mode)
    }

    /// Advance to the next stage in sequence.
    pub fn advance(&mut self) -> Result<InstallStage, InstallTransitionError> {
        match self.current.next() {
            Some(next) => {
                self.record(next);
                Ok(next)
            }
            None => Err(InstallTransitionError::FromTerminalState { from: self.current }),
        }
    }

    /// Transition to `target`, which must be the immediate next stage.
    pub fn transition_to(
        &mut self,
        target: InstallStage,
    ) -> Result<InstallStage, InstallTransitionError> {
        if self.current.is_terminal() {
            return Err(InstallTransitionError::FromTerminalState { from: self.current });
        }
        if target == self.current {
            return Err(InstallTransitionError::AlreadyAtStage { stage: target });
        }
        if target.order() < self.current.order() {
            return Err(InstallTransitionError::BackwardTransition {
                from: self.current,
                to: target,
            });
        }
        if self.current.next() != Some(target) {
            return Err(InstallTransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }
        self.record(target);
        Ok(target)
    }

    /// Mark the run as failed, remembering the stage it failed in.
    pub fn fail(&mut self) -> Result<(), InstallTransitionError> {
        if self.current.is_terminal() {
            return Err(InstallTransitionError::FromTerminalState { from: self.current });
        }
        self.failed_at = Some(self.current);
        self.record(InstallStage::Failed);
        Ok(())
    }

    fn record(&mut self, stage: InstallStage) {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.stage_history.push((stage, timestamp));
        self.current = stage;
    }
}
