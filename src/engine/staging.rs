//! Filesystem Stager
//!
//! Formats the planned partitions and mounts them under the working root.
//! Like the planner, the command sequences are generated by pure functions
//! and executed in order by [`run_steps`]; the first failing command stops
//! the sequence.
//!
//! Btrfs layout:
//!
//! | Subvolume | Mountpoint      |
//! |-----------|-----------------|
//! | `@`       | `<root>`        |
//! | `@home`   | `<root>/home`   |
//! | `@var`    | `<root>/var`    |
//!
//! The ESP (created or reused) goes to `<root>/boot`.

use crate::command_executor::{CommandSpec, Executor};
use crate::engine::partition::PartitionPlan;
use crate::error::InstallError;
use crate::types::Filesystem;
use std::path::Path;

/// Subvolumes created on a btrfs root and where they are mounted.
pub const SUBVOLUMES: &[(&str, &str)] = &[("@", ""), ("@home", "home"), ("@var", "var")];

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

fn mkdir(path: &Path) -> CommandSpec {
    CommandSpec::privileged("mkdir").args(["-p".to_string(), path_arg(path)])
}

fn mount(device: &str, target: &Path, options: Option<&str>) -> CommandSpec {
    let spec = CommandSpec::privileged("mount");
    let spec = match options {
        Some(opts) => spec.args(["-o", opts]),
        None => spec,
    };
    spec.arg(device).arg(path_arg(target))
}

/// Commands of the Format stage.
///
/// Only an ESP created by this run is formatted; a reused one is left alone.
pub fn format_commands(plan: &PartitionPlan, fs: Filesystem) -> Vec<CommandSpec> {
    let mut cmds = Vec::new();
    if let Some(esp) = &plan.efi_partition {
        cmds.push(CommandSpec::privileged("mkfs.fat").args(["-F", "32", esp.as_str()]));
    }
    cmds.push(
        CommandSpec::privileged(fs.mkfs_program())
            .arg(fs.force_flag())
            .arg(plan.root_partition.as_str()),
    );
    cmds
}

/// Commands of the Mount stage.
pub fn mount_commands(plan: &PartitionPlan, fs: Filesystem, root: &Path) -> Vec<CommandSpec> {
    let device = plan.root_partition.as_str();
    let mut cmds = vec![mkdir(root)];

    if fs.supports_subvolumes() {
        cmds.push(mount(device, root, None));
        for (name, _) in SUBVOLUMES {
            cmds.push(
                CommandSpec::privileged("btrfs")
                    .args(["subvolume", "create"])
                    .arg(path_arg(&root.join(name))),
            );
        }
        cmds.push(CommandSpec::privileged("umount").arg(path_arg(root)));

        for (name, mountpoint) in SUBVOLUMES {
            let target = root.join(mountpoint);
            if !mountpoint.is_empty() {
                cmds.push(mkdir(&target));
            }
            cmds.push(mount(device, &target, Some(&format!("subvol={}", name))));
        }
    } else {
        cmds.push(mount(device, root, None));
    }

    if let Some(esp) = plan.boot_partition() {
        let boot = root.join("boot");
        cmds.push(mkdir(&boot));
        cmds.push(mount(esp, &boot, None));
    }
    cmds
}

/// Execute `steps` in order, stopping at the first failure.
pub fn run_steps(exec: &dyn Executor, steps: &[CommandSpec]) -> Result<(), InstallError> {
    for spec in steps {
        exec.execute(spec)?;
    }
    Ok(())
}

pub fn format_partitions(
    exec: &dyn Executor,
    plan: &PartitionPlan,
    fs: Filesystem,
) -> Result<(), InstallError> {
    log::info!("Formatting {} as {}", plan.root_partition, fs);
    run_steps(exec, &format_commands(plan, fs))
}

pub fn mount_target(
    exec: &dyn Executor,
    plan: &PartitionPlan,
    fs: Filesystem,
    root: &Path,
) -> Result<(), InstallError> {
    log::info!("Mounting {} at {}", plan.root_partition, root.display());
    run_steps(exec, &mount_commands(plan, fs, root))
}
