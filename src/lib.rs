//! archprovision library
//!
//! A staged provisioning pipeline that turns a disk into a bootable Arch
//! Linux installation: inspect, partition, format, mount, bootstrap,
//! configure, install a bootloader, finalize and unmount.

pub mod api;
pub mod cli;
pub mod command_executor;
pub mod config_file;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod install_state;
pub mod installer;
pub mod logic;
pub mod network;
pub mod process_guard;
pub mod settings;
pub mod types;

// Re-export main types for convenience
pub use api::InstallerService;
pub use command_executor::{CommandSpec, DryRunExecutor, ExecutionResult, Executor, SystemExecutor};
pub use config_file::InstallerConfig;
pub use engine::partition::{plan_partitions, DiskOp, PartitionPlan};
pub use error::{CommandError, InstallError, PipelineError, PlanningError};
pub use hardware::{DeviceHandle, DiskProbe, GpuReport};
pub use install_state::{InstallStage, RunContext};
pub use installer::{CancelToken, InstallEvent, InstallHandle, InstallReport, Installer, StageProgress};
pub use process_guard::{ChildRegistry, CommandProcessGroup};
pub use settings::{InstallerSettings, SettingsStore};
pub use types::{BootMode, DiskKind, Filesystem, InstallStrategy};
