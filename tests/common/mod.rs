//! Shared fixtures for integration tests: a scripted executor and captured
//! probe output.

#![allow(dead_code)]

use archprovision::error::{CommandError, CommandFailure};
use archprovision::{
    CommandSpec, ExecutionResult, Executor, InstallEvent, InstallerConfig, StageProgress,
};
use std::path::Path;
use std::sync::Mutex;

/// Answers commands from a rule table and records every command line.
///
/// The first rule whose pattern occurs in the command line decides the
/// outcome; unmatched commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Vec<(String, Outcome)>,
    calls: Mutex<Vec<String>>,
}

#[derive(Clone)]
enum Outcome {
    Output(String),
    Fail,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to commands containing `pattern` with `stdout`.
    pub fn on(mut self, pattern: &str, stdout: &str) -> Self {
        self.rules
            .push((pattern.to_string(), Outcome::Output(stdout.to_string())));
        self
    }

    /// Fail commands containing `pattern` with exit code 1.
    pub fn fail_on(mut self, pattern: &str) -> Self {
        self.rules.push((pattern.to_string(), Outcome::Fail));
        self
    }

    /// Like [`fail_on`](Self::fail_on), but takes precedence over every rule
    /// added so far.
    pub fn fail_first(mut self, pattern: &str) -> Self {
        self.rules.insert(0, (pattern.to_string(), Outcome::Fail));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, pattern: &str) -> bool {
        self.calls().iter().any(|c| c.contains(pattern))
    }

    /// Index of the first call containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.contains(pattern))
    }
}

impl Executor for ScriptedExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult, CommandError> {
        let line = spec.command_line();
        self.calls.lock().unwrap().push(line.clone());

        let outcome = self
            .rules
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, outcome)| outcome.clone());

        match outcome {
            Some(Outcome::Fail) => Err(CommandError {
                command: line,
                failure: CommandFailure::NonZeroExit,
                exit_code: Some(1),
                signal: None,
                stdout: String::new(),
                stderr: "injected failure".to_string(),
            }),
            Some(Outcome::Output(stdout)) => Ok(ExecutionResult {
                exit_code: 0,
                stdout,
                stderr: String::new(),
            }),
            None => Ok(ExecutionResult::default()),
        }
    }
}

/// Blank 500 GB SATA SSD.
pub const LSBLK_BLANK_SDA: &str = r#"{
   "blockdevices": [
      {"name":"/dev/sda", "size":500107862016, "model":"Samsung SSD 870", "tran":"sata", "rota":false, "type":"disk", "fstype":null, "mountpoint":null, "parttype":null}
   ]
}"#;

/// NVMe disk with Windows, plus a rotational disk and the USB install medium.
pub const LSBLK_DUAL_BOOT_NVME: &str = r#"{
   "blockdevices": [
      {"name":"/dev/nvme0n1", "size":512110190592, "model":"Samsung SSD 980 PRO 512GB", "tran":"nvme", "rota":false, "type":"disk", "fstype":null, "mountpoint":null, "parttype":null,
         "children": [
            {"name":"/dev/nvme0n1p1", "size":104857600, "model":null, "tran":"nvme", "rota":false, "type":"part", "fstype":"vfat", "mountpoint":null, "parttype":"c12a7328-f81f-11d2-ba4b-00a0c93ec93b"},
            {"name":"/dev/nvme0n1p2", "size":16777216, "model":null, "tran":"nvme", "rota":false, "type":"part", "fstype":null, "mountpoint":null, "parttype":"e3c9e316-0b5c-4db8-817d-f92df00215ae"},
            {"name":"/dev/nvme0n1p3", "size":256000000000, "model":null, "tran":"nvme", "rota":false, "type":"part", "fstype":"ntfs", "mountpoint":null, "parttype":"ebd0a0a2-b9e5-4433-87c0-68b6b72699c7"}
         ]
      },
      {"name":"/dev/sda", "size":1000204886016, "model":"WDC WD10EZEX-08W", "tran":"sata", "rota":true, "type":"disk", "fstype":null, "mountpoint":null, "parttype":null},
      {"name":"/dev/sdb", "size":32015679488, "model":"SanDisk Ultra", "tran":"usb", "rota":true, "type":"disk", "fstype":"iso9660", "mountpoint":"/run/archiso/bootmnt", "parttype":null}
   ]
}"#;

/// `parted -m /dev/nvme0n1 unit MiB print free` for the dual-boot disk.
pub const PARTED_DUAL_BOOT_NVME: &str = "BYT;
/dev/nvme0n1:488386MiB:nvme:512:512:gpt:Samsung SSD 980 PRO 512GB:;
1:0.02MiB:1.00MiB:0.98MiB:free;
1:1.00MiB:101MiB:100MiB:fat32:EFI system partition:boot, esp;
2:101MiB:117MiB:16.0MiB::Microsoft reserved partition:msftres;
3:117MiB:244258MiB:244141MiB:ntfs:Basic data partition:msftdata;
1:244258MiB:488386MiB:244128MiB:free;
";

/// Same disk after Windows shrank C:. The free space sits in front of the
/// recovery partition, and only a sliver is left at the end.
pub const PARTED_SHRUNK_NVME: &str = "BYT;
/dev/nvme0n1:488386MiB:nvme:512:512:gpt:Samsung SSD 980 PRO 512GB:;
1:0.02MiB:1.00MiB:0.98MiB:free;
1:1.00MiB:101MiB:100MiB:fat32:EFI system partition:boot, esp;
2:101MiB:117MiB:16.0MiB::Microsoft reserved partition:msftres;
3:117MiB:190865MiB:190748MiB:ntfs:Basic data partition:msftdata;
1:190865MiB:487730MiB:296865MiB:free;
4:487730MiB:488385MiB:655MiB:ntfs::hidden, diag;
1:488385MiB:488386MiB:1.00MiB:free;
";

pub const LSPCI_NVIDIA: &str = r#"00:02.0 "VGA compatible controller" "Intel Corporation" "UHD Graphics 630" -p00 "Dell" "Device 0869"
01:00.0 "VGA compatible controller" "NVIDIA Corporation" "TU117M [GeForce GTX 1650 Mobile / Max-Q]" -ra1 "Dell" "Device 0869"
"#;

/// Executor scripted for a blank-disk install.
pub fn blank_disk_executor() -> ScriptedExecutor {
    ScriptedExecutor::new()
        .on("lsblk", LSBLK_BLANK_SDA)
        .on("blkid", "8c2f3a4e-02\n")
        .on("curl", "Europe/Berlin\n")
        .on("genfstab", "UUID=1234 / btrfs rw,subvol=/@ 0 0\n")
}

/// Executor scripted for an install next to Windows on the NVMe disk.
pub fn dual_boot_executor() -> ScriptedExecutor {
    ScriptedExecutor::new()
        .on("lsblk", LSBLK_DUAL_BOOT_NVME)
        .on("parted -s -m", PARTED_DUAL_BOOT_NVME)
        .on("blkid", "5b1e0c77-04\n")
        .on("curl", "America/Chicago\n")
}

/// Config with its mount root inside a test directory.
pub fn config_in(root: &Path) -> InstallerConfig {
    InstallerConfig {
        mount_root: root.join("target"),
        ..Default::default()
    }
}

/// Firmware directory that makes the run detect UEFI.
pub fn uefi_firmware(dir: &Path) -> std::path::PathBuf {
    let efi = dir.join("efi");
    std::fs::create_dir_all(&efi).unwrap();
    efi
}

/// Firmware path that makes the run detect BIOS.
pub fn bios_firmware(dir: &Path) -> std::path::PathBuf {
    dir.join("no-efi")
}

pub fn progress_of(events: &[InstallEvent]) -> Vec<StageProgress> {
    events
        .iter()
        .filter_map(|e| match e {
            InstallEvent::Progress(p) => Some(*p),
            _ => None,
        })
        .collect()
}

pub fn terminal_count(events: &[InstallEvent]) -> usize {
    events.iter().filter(|e| e.is_terminal()).count()
}
