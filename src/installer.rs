//! Pipeline Orchestrator
//!
//! Sequences the stages of a run, reports progress at fixed checkpoints and
//! turns any failure into exactly one [`PipelineError`].
//!
//! ```text
//! Analyze → Partition → Format → Mount → InstallBase → Configure
//!         → Bootloader → Finalize → Cleanup → Completed
//! ```
//!
//! A run owns its mount root from the moment it starts until it returns. The
//! root is recorded in a process-wide registry so a second run on the same
//! root is refused before it executes anything. Whatever happens, the run
//! ends by unmounting everything below the root.

use crate::command_executor::{CommandSpec, Executor};
use crate::config_file::InstallerConfig;
use crate::engine::partition::{self, PartitionPlan};
use crate::engine::staging;
use crate::error::{InstallError, PipelineError, PlanningError};
use crate::hardware::{self, DeviceHandle, DiskProbe, GpuReport};
use crate::install_state::{InstallStage, RunContext};
use crate::logic::{base_system, bootloader, branding, timezone};
use crate::process_guard::InterruptHook;
use crate::settings::InstallerSettings;
use crate::types::{BootMode, InstallStrategy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};

// ============================================================================
// Events
// ============================================================================

/// Progress checkpoint, emitted when a stage begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageProgress {
    pub stage: InstallStage,
    pub percent: u8,
}

impl StageProgress {
    pub fn at(stage: InstallStage) -> Self {
        Self {
            stage,
            percent: stage.progress_percent(),
        }
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallReport {
    pub disk: String,
    pub boot_mode: BootMode,
    pub strategy: InstallStrategy,
    pub plan: PartitionPlan,
    pub gpu: GpuReport,
    pub timezone: String,
    /// Recovered failures: GPU driver, Windows boot entry, branding files
    pub warnings: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

/// What a run reports to its controller. Every run emits zero or more
/// `Progress` events followed by exactly one `Completed` or `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum InstallEvent {
    Progress(StageProgress),
    Completed(InstallReport),
    Failed(PipelineError),
}

impl InstallEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }
}

// ============================================================================
// Run control
// ============================================================================

/// Stop requests shared between the controller and a run.
///
/// A cancel is honored only before the first destructive stage. An
/// interrupt, raised by a termination signal, stops the run at the next
/// stage boundary; the command in flight always finishes first.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    interrupted: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

fn active_roots() -> &'static Mutex<HashSet<PathBuf>> {
    static ROOTS: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    ROOTS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive claim on a mount root for the lifetime of a run.
#[derive(Debug)]
pub struct RunGuard {
    root: PathBuf,
}

impl RunGuard {
    /// Claim `root`, or fail with [`InstallError::Busy`] if a run holds it.
    pub fn acquire(root: &Path) -> Result<Self, InstallError> {
        let mut roots = active_roots()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !roots.insert(root.to_path_buf()) {
            return Err(InstallError::Busy(root.to_path_buf()));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn is_active(root: &Path) -> bool {
        active_roots()
            .lock()
            .map(|roots| roots.contains(root))
            .unwrap_or(false)
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut roots = active_roots()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        roots.remove(&self.root);
    }
}

/// A run executing on a worker thread.
pub struct InstallHandle {
    events: Receiver<InstallEvent>,
    cancel: CancelToken,
    worker: JoinHandle<Result<InstallReport, PipelineError>>,
}

impl InstallHandle {
    pub fn events(&self) -> &Receiver<InstallEvent> {
        &self.events
    }

    /// Request cancellation; too late once partitioning has begun.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to finish.
    pub fn wait(self) -> Result<InstallReport, PipelineError> {
        match self.worker.join() {
            Ok(result) => result,
            Err(_) => Err(PipelineError::new("installer thread panicked", None)),
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Drives one installation per call to [`Installer::run`].
#[derive(Clone)]
pub struct Installer {
    exec: Arc<dyn Executor>,
    config: InstallerConfig,
    firmware_path: PathBuf,
}

/// What Analyze found out.
struct Analysis {
    boot_mode: BootMode,
    disk: DeviceHandle,
    probe: DiskProbe,
    gpu: GpuReport,
}

impl Installer {
    pub fn new(exec: Arc<dyn Executor>, config: InstallerConfig) -> Self {
        Self {
            exec,
            config,
            firmware_path: PathBuf::from(hardware::EFI_FIRMWARE_PATH),
        }
    }

    /// Probe a different path for the UEFI firmware interface.
    pub fn with_firmware_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.firmware_path = path.into();
        self
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    /// Run the pipeline on a worker thread.
    pub fn start(&self, device: &str, settings: InstallerSettings) -> InstallHandle {
        let (tx, rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let installer = self.clone();
        let device = device.to_string();
        let token = cancel.clone();
        let worker = thread::spawn(move || installer.run(&device, settings, &token, &tx));
        InstallHandle {
            events: rx,
            cancel,
            worker,
        }
    }

    /// Run the pipeline on the calling thread.
    ///
    /// Emits progress on `events` and then exactly one terminal event, which
    /// carries the same value this function returns.
    pub fn run(
        &self,
        device: &str,
        settings: InstallerSettings,
        cancel: &CancelToken,
        events: &Sender<InstallEvent>,
    ) -> Result<InstallReport, PipelineError> {
        let result = self.run_guarded(device, &settings, cancel, events);
        let terminal = match &result {
            Ok(report) => InstallEvent::Completed(report.clone()),
            Err(err) => InstallEvent::Failed(err.clone()),
        };
        // The controller may have stopped listening
        let _ = events.send(terminal);
        result
    }

    fn run_guarded(
        &self,
        device: &str,
        settings: &InstallerSettings,
        cancel: &CancelToken,
        events: &Sender<InstallEvent>,
    ) -> Result<InstallReport, PipelineError> {
        let root = self.config.mount_root.as_path();
        let _guard = RunGuard::acquire(root).map_err(|e| {
            log::error!("{}", e);
            PipelineError::from(e)
        })?;
        let _hook = InterruptHook::register(cancel.interrupted.clone());

        log::info!("Starting installation to {} (root {})", device, root.display());
        let mut ctx = RunContext::new();
        match self.run_stages(&mut ctx, device, settings, cancel, events) {
            Ok(report) => {
                log::info!("Installation to {} completed", device);
                Ok(report)
            }
            Err(err) => {
                let stage = ctx.current_stage();
                let err = err.in_stage(stage);
                let shaped = PipelineError::from_install_error(&err, Some(stage));
                log::error!("Installation failed during {}: {}", stage, err);
                if let Err(e) = ctx.fail() {
                    log::warn!("{}", e);
                }
                self.cleanup_best_effort();
                Err(shaped)
            }
        }
    }

    fn enter(
        &self,
        ctx: &mut RunContext,
        stage: InstallStage,
        cancel: &CancelToken,
        events: &Sender<InstallEvent>,
    ) -> Result<(), InstallError> {
        if cancel.is_interrupted() {
            log::warn!("Interrupted, not starting {}", stage);
            return Err(InstallError::Interrupted);
        }
        ctx.transition_to(stage)?;
        log::info!("[{}%] {}", stage.progress_percent(), stage);
        let _ = events.send(InstallEvent::Progress(StageProgress::at(stage)));
        Ok(())
    }

    fn run_stages(
        &self,
        ctx: &mut RunContext,
        device: &str,
        settings: &InstallerSettings,
        cancel: &CancelToken,
        events: &Sender<InstallEvent>,
    ) -> Result<InstallReport, InstallError> {
        let exec: &dyn Executor = self.exec.as_ref();
        let config = &self.config;
        let root = config.mount_root.as_path();
        let mut warnings = Vec::new();

        self.enter(ctx, InstallStage::Analyze, cancel, events)?;
        let analysis = self.analyze(device)?;
        let boot_mode = ctx.set_boot_mode(analysis.boot_mode);
        let mut plan = partition::plan_partitions(&analysis.disk, boot_mode, &analysis.probe, config)?;

        if cancel.is_cancelled() {
            log::warn!("Installation cancelled before partitioning");
            return Err(InstallError::Cancelled);
        }

        self.enter(ctx, InstallStage::Partition, cancel, events)?;
        partition::apply_partition_plan(exec, &mut plan)?;

        self.enter(ctx, InstallStage::Format, cancel, events)?;
        staging::format_partitions(exec, &plan, config.root_filesystem)?;

        self.enter(ctx, InstallStage::Mount, cancel, events)?;
        staging::mount_target(exec, &plan, config.root_filesystem, root)?;

        self.enter(ctx, InstallStage::InstallBase, cancel, events)?;
        base_system::bootstrap(exec, config, root)?;

        self.enter(ctx, InstallStage::Configure, cancel, events)?;
        let timezone = timezone::resolve_timezone(exec, config);
        base_system::configure(exec, config, settings, &timezone, root)?;
        warnings.extend(base_system::install_gpu_drivers(exec, config, &analysis.gpu, root));

        self.enter(ctx, InstallStage::Bootloader, cancel, events)?;
        warnings.extend(bootloader::install_bootloader(exec, &plan, config, root)?);

        self.enter(ctx, InstallStage::Finalize, cancel, events)?;
        warnings.extend(branding::install_branding(config, root)?.warnings);

        self.enter(ctx, InstallStage::Cleanup, cancel, events)?;
        release_root(exec, root)?;
        ctx.transition_to(InstallStage::Completed)?;

        Ok(InstallReport {
            disk: analysis.disk.path,
            boot_mode,
            strategy: plan.strategy,
            plan,
            gpu: analysis.gpu,
            timezone,
            warnings,
            finished_at: Utc::now(),
        })
    }

    /// Firmware, target disk, strategy probes and GPU. The disk probes and
    /// the GPU scan are independent and run concurrently.
    fn analyze(&self, device: &str) -> Result<Analysis, InstallError> {
        if !device.starts_with("/dev/") {
            return Err(PlanningError::InvalidDevicePath(device.to_string()).into());
        }
        let exec: &dyn Executor = self.exec.as_ref();
        let boot_mode = hardware::detect_boot_mode_at(&self.firmware_path);

        let disk = hardware::list_disks(exec)?
            .into_iter()
            .find(|d| d.path == device)
            .ok_or_else(|| PlanningError::DeviceNotFound(device.to_string()))?;

        let min_free = self.config.min_free_space_mib;
        let (probe, gpu) = thread::scope(|s| {
            let gpu = s.spawn(|| hardware::detect_gpu(exec));
            let probe = hardware::probe_disk(exec, device, min_free);
            (probe, gpu.join().unwrap_or_default())
        });

        log::info!(
            "Target {} ({}, {} bytes), firmware {}, NVIDIA GPU: {}",
            disk.path,
            disk.kind,
            disk.size_bytes,
            boot_mode,
            gpu.present
        );
        Ok(Analysis {
            boot_mode,
            disk,
            probe,
            gpu,
        })
    }

    /// Failure-path unmount. Every step is attempted; errors are logged and
    /// dropped.
    fn cleanup_best_effort(&self) {
        log::info!("Cleaning up {}", self.config.mount_root.display());
        for spec in release_commands(&self.config.mount_root) {
            if let Err(e) = self.exec.execute(&spec) {
                log::warn!("Cleanup step failed: {}", e);
            }
        }
    }
}

fn release_commands(root: &Path) -> [CommandSpec; 2] {
    [
        CommandSpec::privileged("sync"),
        CommandSpec::privileged("umount").args(["-R".to_string(), root.display().to_string()]),
    ]
}

/// Flush and recursively unmount the working root.
fn release_root(exec: &dyn Executor, root: &Path) -> Result<(), InstallError> {
    for spec in release_commands(root) {
        exec.execute(&spec)?;
    }
    Ok(())
}
