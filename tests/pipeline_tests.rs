//! End-to-end pipeline runs against a scripted executor and a temporary
//! target root.

mod common;

use archprovision::error::CommandError;
use archprovision::installer::RunGuard;
use archprovision::{
    CancelToken, CommandSpec, ExecutionResult, Executor, InstallEvent, InstallStage,
    InstallStrategy, Installer, InstallerService, InstallerSettings,
};
use common::*;
use std::fs;
use std::sync::mpsc;
use std::sync::Arc;
use tempfile::tempdir;

struct Run {
    exec: Arc<ScriptedExecutor>,
    events: Vec<InstallEvent>,
    result: Result<archprovision::InstallReport, archprovision::PipelineError>,
}

fn run_with(
    exec: ScriptedExecutor,
    config: archprovision::InstallerConfig,
    firmware: std::path::PathBuf,
    device: &str,
    cancel: &CancelToken,
) -> Run {
    let exec = Arc::new(exec);
    let installer = Installer::new(exec.clone(), config).with_firmware_path(firmware);
    let (tx, rx) = mpsc::channel();
    let result = installer.run(device, InstallerSettings::default(), cancel, &tx);
    drop(tx);
    Run {
        exec,
        events: rx.iter().collect(),
        result,
    }
}

#[test]
fn test_uefi_wipe_install_completes() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());
    let root = config.mount_root.clone();
    let run = run_with(
        blank_disk_executor(),
        config,
        uefi_firmware(dir.path()),
        "/dev/sda",
        &CancelToken::new(),
    );

    let report = run.result.expect("install should succeed");
    assert_eq!(report.strategy, InstallStrategy::WipeDisk);
    assert_eq!(report.plan.efi_partition.as_deref(), Some("/dev/sda1"));
    assert_eq!(report.plan.root_partition, "/dev/sda2");
    assert_eq!(report.timezone, "Europe/Berlin");

    let percents: Vec<u8> = progress_of(&run.events).iter().map(|p| p.percent).collect();
    assert_eq!(percents, vec![10, 20, 30, 40, 50, 70, 85, 95, 100]);
    assert_eq!(terminal_count(&run.events), 1);
    assert!(matches!(run.events.last(), Some(InstallEvent::Completed(_))));

    let exec = &run.exec;
    let order = [
        "wipefs --all --force /dev/sda",
        "parted -s /dev/sda mklabel gpt",
        "mkfs.fat -F 32 /dev/sda1",
        "mkfs.btrfs -f /dev/sda2",
        "mount -o subvol=@ /dev/sda2",
        "pacstrap -K",
        "pacman-key --init",
        "locale-gen",
        "bootctl --esp-path=/boot install",
        "umount -R",
    ];
    let positions: Vec<usize> = order
        .iter()
        .map(|p| exec.position(p).unwrap_or_else(|| panic!("missing command: {}", p)))
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", exec.calls());
    assert!(!exec.called("grub-install"));

    let entry = fs::read_to_string(root.join("boot/loader/entries/arch.conf")).unwrap();
    assert!(entry.contains("options root=PARTUUID=8c2f3a4e-02 rw rootflags=subvol=@"));
    assert!(root.join("boot/loader/loader.conf").is_file());
    assert_eq!(fs::read_to_string(root.join("etc/hostname")).unwrap(), "archlinux\n");
    assert!(fs::read_to_string(root.join("etc/fstab"))
        .unwrap()
        .contains("subvol=/@"));
    assert!(root.join("etc/pacman.d/hooks/zz-arch-branding.hook").is_file());
    assert!(exec.called("ln -sf /usr/share/zoneinfo/Europe/Berlin /etc/localtime"));
}

#[test]
fn test_bios_install_uses_grub_and_no_esp() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());
    let root = config.mount_root.clone();
    let run = run_with(
        blank_disk_executor(),
        config,
        bios_firmware(dir.path()),
        "/dev/sda",
        &CancelToken::new(),
    );

    let report = run.result.expect("install should succeed");
    assert_eq!(report.plan.efi_partition, None);
    assert_eq!(report.plan.existing_efi_partition, None);
    assert_eq!(report.plan.root_partition, "/dev/sda1");

    let exec = &run.exec;
    assert!(exec.called("parted -s /dev/sda mklabel msdos"));
    assert!(exec.called("parted -s /dev/sda set 1 boot on"));
    assert!(!exec.called("mkfs.fat"));
    assert!(!exec.called("bootctl"));
    assert!(exec.called("grub-install --target=i386-pc /dev/sda"));
    assert!(exec.called("grub-mkconfig -o /boot/grub/grub.cfg"));

    let grub = fs::read_to_string(root.join("etc/default/grub")).unwrap();
    assert!(grub.contains("GRUB_DISABLE_OS_PROBER=false"));
}

#[test]
fn test_alongside_windows_preserves_disk() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());
    let root = config.mount_root.clone();

    // Windows boot manager on the reused ESP
    let manager = root.join("boot/EFI/Microsoft/Boot/bootmgfw.efi");
    fs::create_dir_all(manager.parent().unwrap()).unwrap();
    fs::write(&manager, b"MZ").unwrap();

    let run = run_with(
        dual_boot_executor(),
        config,
        uefi_firmware(dir.path()),
        "/dev/nvme0n1",
        &CancelToken::new(),
    );

    let report = run.result.expect("install should succeed");
    assert_eq!(report.strategy, InstallStrategy::AlongsideExisting);
    assert_eq!(report.plan.efi_partition, None);
    assert_eq!(report.plan.existing_efi_partition.as_deref(), Some("/dev/nvme0n1p1"));
    assert_eq!(report.plan.root_partition, "/dev/nvme0n1p4");

    let exec = &run.exec;
    assert!(!exec.called("wipefs"));
    assert!(!exec.called("mklabel"));
    assert!(!exec.called("mkfs.fat"));
    assert!(exec.called("mkpart root btrfs 244258MiB 100%"));
    assert!(exec.called("mkfs.btrfs -f /dev/nvme0n1p4"));
    assert!(exec.called("mount /dev/nvme0n1p1"));

    assert!(root.join("boot/loader/entries/windows.conf").is_file());
}

#[test]
fn test_alongside_uses_gap_in_front_of_recovery() {
    let dir = tempdir().unwrap();
    let exec = ScriptedExecutor::new()
        .on("lsblk", LSBLK_DUAL_BOOT_NVME)
        .on("parted -s -m", PARTED_SHRUNK_NVME)
        .on("blkid", "5b1e0c77-05\n");
    let run = run_with(
        exec,
        config_in(dir.path()),
        uefi_firmware(dir.path()),
        "/dev/nvme0n1",
        &CancelToken::new(),
    );

    let report = run.result.expect("alongside install should succeed");
    assert_eq!(report.strategy, InstallStrategy::AlongsideExisting);
    assert_eq!(report.plan.root_partition, "/dev/nvme0n1p5");
    assert!(run.exec.called("mkpart root btrfs 190865MiB 487730MiB"), "{:?}", run.exec.calls());
    assert!(!run.exec.called("488385MiB"));
    assert!(run.exec.called("mkfs.btrfs -f /dev/nvme0n1p5"));
}

#[test]
fn test_failure_at_each_stage_yields_one_error_and_cleanup() {
    let cases = [
        ("lsblk", InstallStage::Analyze),
        ("wipefs", InstallStage::Partition),
        ("mkfs.btrfs", InstallStage::Format),
        ("btrfs subvolume create", InstallStage::Mount),
        ("pacstrap", InstallStage::InstallBase),
        ("locale-gen", InstallStage::Configure),
        ("bootctl", InstallStage::Bootloader),
        ("sync", InstallStage::Cleanup),
    ];

    for (pattern, stage) in cases {
        let dir = tempdir().unwrap();
        let run = run_with(
            blank_disk_executor().fail_first(pattern),
            config_in(dir.path()),
            uefi_firmware(dir.path()),
            "/dev/sda",
            &CancelToken::new(),
        );

        let err = run.result.expect_err(pattern);
        assert_eq!(terminal_count(&run.events), 1, "{}", pattern);
        match run.events.last() {
            Some(InstallEvent::Failed(e)) => assert_eq!(e, &err),
            other => panic!("{}: expected Failed last, got {:?}", pattern, other),
        }
        assert_eq!(err.stage_context.as_deref(), Some(stage.description()), "{}", pattern);
        assert!(err.command.as_deref().unwrap_or("").contains(pattern), "{}", pattern);
        assert!(err.message.contains("injected failure"), "{}", pattern);
        assert_eq!(err.exit_code, Some(1));
        assert!(run.exec.called("umount -R"), "{}: no cleanup attempt", pattern);

        let percents: Vec<u8> = progress_of(&run.events).iter().map(|p| p.percent).collect();
        assert_eq!(percents.last().copied(), Some(stage.progress_percent()), "{}", pattern);
    }
}

#[test]
fn test_gpu_driver_failure_is_only_a_warning() {
    let dir = tempdir().unwrap();
    let exec = blank_disk_executor()
        .on("lspci", LSPCI_NVIDIA)
        .fail_on("nvidia-smi")
        .fail_on("nvidia-utils");
    let run = run_with(
        exec,
        config_in(dir.path()),
        uefi_firmware(dir.path()),
        "/dev/sda",
        &CancelToken::new(),
    );

    let report = run.result.expect("driver failure must not abort");
    assert!(report.gpu.present);
    assert_eq!(report.gpu.models, vec!["TU117M [GeForce GTX 1650 Mobile / Max-Q]"]);
    assert!(report.warnings.iter().any(|w| w.contains("NVIDIA")));
}

#[test]
fn test_geolocation_failure_falls_back_to_utc() {
    let dir = tempdir().unwrap();
    let run = run_with(
        blank_disk_executor().fail_first("curl"),
        config_in(dir.path()),
        uefi_firmware(dir.path()),
        "/dev/sda",
        &CancelToken::new(),
    );
    let report = run.result.expect("geolocation is best effort");
    assert_eq!(report.timezone, "UTC");
    assert!(run.exec.called("ln -sf /usr/share/zoneinfo/UTC /etc/localtime"));
}

#[test]
fn test_cancel_before_partition_touches_nothing() {
    let dir = tempdir().unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    let run = run_with(
        blank_disk_executor(),
        config_in(dir.path()),
        uefi_firmware(dir.path()),
        "/dev/sda",
        &cancel,
    );

    let err = run.result.expect_err("cancelled run must fail");
    assert!(err.message.contains("cancelled"));
    assert!(!run.exec.called("wipefs"));
    assert!(!run.exec.called("parted -s /dev/sda"));
    assert_eq!(terminal_count(&run.events), 1);
}

#[test]
fn test_second_run_on_same_root_is_refused() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());
    let _held = RunGuard::acquire(&config.mount_root).unwrap();

    let run = run_with(
        blank_disk_executor(),
        config,
        uefi_firmware(dir.path()),
        "/dev/sda",
        &CancelToken::new(),
    );

    let err = run.result.expect_err("busy root must be refused");
    assert!(err.message.contains("already running"));
    assert!(run.exec.calls().is_empty(), "{:?}", run.exec.calls());
    assert!(progress_of(&run.events).is_empty());
    assert_eq!(terminal_count(&run.events), 1);
}

#[test]
fn test_unknown_device_is_a_planning_error() {
    let dir = tempdir().unwrap();
    let run = run_with(
        blank_disk_executor(),
        config_in(dir.path()),
        uefi_firmware(dir.path()),
        "/dev/sdz",
        &CancelToken::new(),
    );
    let err = run.result.expect_err("missing device");
    assert!(err.message.contains("/dev/sdz"));
    assert_eq!(err.command, None);
    assert!(!run.exec.called("wipefs"));
}

#[test]
fn test_service_passes_settings_snapshot() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());
    let root = config.mount_root.clone();
    let service = InstallerService::new(Arc::new(blank_disk_executor()), config)
        .with_firmware_path(uefi_firmware(dir.path()));

    service.set_language("de").unwrap();
    service.set_keyboard("de-latin1").unwrap();
    let handle = service.start_install("/dev/sda");
    let events: Vec<InstallEvent> = handle.events().iter().collect();
    handle.wait().expect("install should succeed");

    assert_eq!(terminal_count(&events), 1);
    assert_eq!(
        fs::read_to_string(root.join("etc/locale.conf")).unwrap(),
        "LANG=de_DE.UTF-8\n"
    );
    let locale_gen = fs::read_to_string(root.join("etc/locale.gen")).unwrap();
    assert!(locale_gen.contains("de_DE.UTF-8 UTF-8"));
    assert!(locale_gen.contains("en_US.UTF-8 UTF-8"));
    assert_eq!(
        fs::read_to_string(root.join("etc/vconsole.conf")).unwrap(),
        "KEYMAP=de-latin1\n"
    );
    let xorg = fs::read_to_string(root.join("etc/X11/xorg.conf.d/00-keyboard.conf")).unwrap();
    assert!(xorg.contains("Option \"XkbLayout\" \"de\""), "{}", xorg);
    assert!(!xorg.contains("latin1"));
}

/// Lets a matching command run, then raises the interrupt flag the way the
/// signal handler does.
struct InterruptAfter {
    inner: Arc<ScriptedExecutor>,
    pattern: &'static str,
    token: CancelToken,
}

impl Executor for InterruptAfter {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult, CommandError> {
        let result = self.inner.execute(spec);
        if spec.command_line().contains(self.pattern) {
            self.token.interrupt();
        }
        result
    }
}

#[test]
fn test_interrupt_finishes_running_command_then_unmounts() {
    let dir = tempdir().unwrap();
    let cancel = CancelToken::new();
    let scripted = Arc::new(blank_disk_executor());
    let exec = InterruptAfter {
        inner: scripted.clone(),
        pattern: "mkfs.btrfs",
        token: cancel.clone(),
    };
    let installer = Installer::new(Arc::new(exec), config_in(dir.path()))
        .with_firmware_path(uefi_firmware(dir.path()));
    let (tx, rx) = mpsc::channel();
    let result = installer.run("/dev/sda", InstallerSettings::default(), &cancel, &tx);
    drop(tx);
    let events: Vec<InstallEvent> = rx.iter().collect();

    let err = result.expect_err("interrupted run must fail");
    assert!(err.message.contains("interrupted"), "{}", err.message);
    assert_eq!(err.stage_context.as_deref(), Some(InstallStage::Format.description()));
    assert!(scripted.called("mkfs.btrfs -f /dev/sda2"));
    assert!(!scripted.called("btrfs subvolume create"));
    assert!(!scripted.called("pacstrap"));
    assert!(scripted.called("umount -R"));
    assert_eq!(terminal_count(&events), 1);
    assert_eq!(progress_of(&events).last().map(|p| p.percent), Some(30));
}

#[test]
fn test_branding_write_failure_fails_finalize() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());
    // A plain file where the hook directory has to go
    fs::create_dir_all(config.mount_root.join("etc")).unwrap();
    fs::write(config.mount_root.join("etc/pacman.d"), "").unwrap();

    let run = run_with(
        blank_disk_executor(),
        config,
        uefi_firmware(dir.path()),
        "/dev/sda",
        &CancelToken::new(),
    );

    let err = run.result.expect_err("hook write must fail");
    assert_eq!(err.stage_context.as_deref(), Some(InstallStage::Finalize.description()));
    assert_eq!(err.command, None);
    assert_eq!(terminal_count(&run.events), 1);
    assert!(run.exec.called("umount -R"));
    assert_eq!(progress_of(&run.events).last().map(|p| p.percent), Some(95));
}

#[test]
fn test_windows_detection_error_is_only_a_warning() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());
    let root = config.mount_root.clone();
    // The boot manager path runs through a regular file, so probing it errors
    fs::create_dir_all(root.join("boot")).unwrap();
    fs::write(root.join("boot/EFI"), "").unwrap();

    let run = run_with(
        blank_disk_executor(),
        config,
        uefi_firmware(dir.path()),
        "/dev/sda",
        &CancelToken::new(),
    );

    let report = run.result.expect("Windows entry detection is best effort");
    assert!(
        report.warnings.iter().any(|w| w.contains("Windows boot entry")),
        "{:?}",
        report.warnings
    );
    assert!(!root.join("boot/loader/entries/windows.conf").exists());
    assert!(root.join("boot/loader/loader.conf").is_file());
}
