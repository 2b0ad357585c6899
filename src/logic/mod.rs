//! Logic modules: what happens inside the mounted target root.
//!
//! # Modules
//!
//! - `base_system` - pacstrap, fstab, locale, keyboard, hostname, services
//! - `timezone` - geolocated timezone with a fixed fallback
//! - `bootloader` - systemd-boot (UEFI) or GRUB (BIOS)
//! - `branding` - branding backups and the pacman restore hook

pub mod base_system;
pub mod bootloader;
pub mod branding;
pub mod timezone;

use crate::error::InstallError;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Write a file inside the target root, creating parent directories.
pub(crate) fn write_target_file(path: &Path, contents: &str) -> Result<(), InstallError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| InstallError::io("Failed to create directory", parent, e))?;
    }
    fs::write(path, contents).map_err(|e| InstallError::io("Failed to write file", path, e))
}

/// Read a file inside the target root; `None` if it does not exist.
pub(crate) fn read_target_file(path: &Path) -> Result<Option<String>, InstallError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(InstallError::io("Failed to read file", path, e)),
    }
}
