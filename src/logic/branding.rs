//! Distribution branding that survives package upgrades.
//!
//! Upgrading `filesystem` or `lsb-release` overwrites the identity files in
//! `/etc`. Finalize stores copies under `/usr/share/<distro>/branding/` and
//! installs a pacman hook that restores them after every such transaction.

use crate::config_file::InstallerConfig;
use crate::error::InstallError;
use crate::logic::write_target_file;
use std::fs;
use std::path::{Path, PathBuf};

/// Files restored by the hook, relative to `/etc`.
pub const BRANDING_FILES: &[&str] = &["os-release", "lsb-release", "issue"];

/// Packages whose upgrade overwrites the branding files.
const HOOK_TARGETS: &[&str] = &["filesystem", "lsb-release"];

/// Backup directory on the installed system.
pub fn backup_dir(distribution: &str) -> String {
    format!("/usr/share/{}/branding", distribution)
}

/// Hook path on the installed system.
pub fn hook_path(distribution: &str) -> String {
    format!("/etc/pacman.d/hooks/zz-{}-branding.hook", distribution)
}

/// Contents of the restore hook.
pub fn hook_contents(distribution: &str) -> String {
    let mut hook = String::from("[Trigger]\nType = Package\nOperation = Install\nOperation = Upgrade\n");
    for target in HOOK_TARGETS {
        hook.push_str(&format!("Target = {}\n", target));
    }
    hook.push_str(&format!(
        "\n[Action]\nDescription = Restoring {0} branding...\nWhen = PostTransaction\nExec = /bin/sh -c 'cp -f {1}/* /etc/'\n",
        distribution,
        backup_dir(distribution)
    ));
    hook
}

/// What Finalize did with the branding files.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BrandingOutcome {
    pub backed_up: Vec<String>,
    pub warnings: Vec<String>,
}

fn source_for(config: &InstallerConfig, root: &Path, name: &str) -> PathBuf {
    match &config.branding_dir {
        Some(dir) => dir.join(name),
        None => root.join("etc").join(name),
    }
}

fn copy_file(from: &Path, to: &Path) -> Result<(), InstallError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| InstallError::io("Failed to create directory", parent, e))?;
    }
    fs::copy(from, to).map_err(|e| InstallError::io("Failed to copy branding file", from, e))?;
    Ok(())
}

/// Back up the branding files and install the restore hook.
///
/// A missing source file is skipped with a warning; I/O failures on files
/// that do exist are fatal.
pub fn install_branding(config: &InstallerConfig, root: &Path) -> Result<BrandingOutcome, InstallError> {
    let distro = config.distribution.as_str();
    let backups = root.join(backup_dir(distro).trim_start_matches('/'));
    let mut outcome = BrandingOutcome::default();

    for name in BRANDING_FILES {
        let source = source_for(config, root, name);
        if !source.is_file() {
            log::warn!("Branding file {} not found, skipping", source.display());
            outcome
                .warnings
                .push(format!("branding file {} not found", source.display()));
            continue;
        }
        copy_file(&source, &backups.join(name))?;
        if config.branding_dir.is_some() {
            copy_file(&source, &root.join("etc").join(name))?;
        }
        outcome.backed_up.push((*name).to_string());
    }

    let hook = root.join(hook_path(distro).trim_start_matches('/'));
    write_target_file(&hook, &hook_contents(distro))?;
    log::info!(
        "Branding hook installed at {} ({} file(s) backed up)",
        hook.display(),
        outcome.backed_up.len()
    );
    Ok(outcome)
}
