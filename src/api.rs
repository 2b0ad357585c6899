//! Boundary service for the presentation layer.
//!
//! Every call here returns plain serializable data or a [`PipelineError`];
//! internal error types never leak past this module.

use crate::command_executor::Executor;
use crate::config_file::InstallerConfig;
use crate::error::{PipelineError};
use crate::hardware::{self, DeviceHandle, GpuReport};
use crate::installer::{InstallHandle, Installer};
use crate::network::{self, WifiNetwork};
use crate::settings::{InstallerSettings, SettingsStore};
use crate::types::BootMode;
use std::path::PathBuf;
use std::sync::Arc;

/// Process-lifetime installer service.
pub struct InstallerService {
    exec: Arc<dyn Executor>,
    config: InstallerConfig,
    settings: SettingsStore,
    firmware_path: PathBuf,
}

impl InstallerService {
    pub fn new(exec: Arc<dyn Executor>, config: InstallerConfig) -> Self {
        Self {
            exec,
            config,
            settings: SettingsStore::default(),
            firmware_path: PathBuf::from(hardware::EFI_FIRMWARE_PATH),
        }
    }

    pub fn with_firmware_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.firmware_path = path.into();
        self
    }

    /// Start installing to `device` with a snapshot of the current settings.
    ///
    /// Settings changed after this call do not affect the running install.
    pub fn start_install(&self, device: &str) -> InstallHandle {
        let settings = self.settings.snapshot();
        log::info!(
            "Install requested for {} (language {}, keyboard {})",
            device,
            settings.language,
            settings.keyboard_layout
        );
        Installer::new(Arc::clone(&self.exec), self.config.clone())
            .with_firmware_path(self.firmware_path.clone())
            .start(device, settings)
    }

    pub fn installer_settings(&self) -> InstallerSettings {
        self.settings.snapshot()
    }

    pub fn set_language(&self, language: &str) -> Result<InstallerSettings, PipelineError> {
        self.settings
            .set_language(language)
            .map_err(|msg| PipelineError::new(msg, None))
    }

    pub fn set_keyboard(&self, layout: &str) -> Result<InstallerSettings, PipelineError> {
        self.settings
            .set_keyboard(layout)
            .map_err(|msg| PipelineError::new(msg, None))
    }

    pub fn scan_disks(&self) -> Result<Vec<DeviceHandle>, PipelineError> {
        hardware::list_disks(self.exec.as_ref()).map_err(PipelineError::from)
    }

    pub fn check_boot_mode(&self) -> BootMode {
        hardware::detect_boot_mode_at(&self.firmware_path)
    }

    pub fn detect_nvidia(&self) -> GpuReport {
        hardware::detect_gpu(self.exec.as_ref())
    }

    pub fn scan_wifi(&self) -> Result<Vec<WifiNetwork>, PipelineError> {
        network::scan_wifi(self.exec.as_ref()).map_err(PipelineError::from)
    }
}
