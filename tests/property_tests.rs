//! Property tests for the strategy decision and progress reporting.

mod common;

use archprovision::engine::partition::choose_strategy;
use archprovision::{
    plan_partitions, BootMode, CancelToken, DiskProbe, InstallStrategy, Installer,
    InstallerConfig, InstallerSettings,
};
use common::*;
use proptest::prelude::*;
use std::sync::{mpsc, Arc};

fn probe_strategy() -> impl Strategy<Value = Option<bool>> {
    prop_oneof![Just(None), Just(Some(false)), Just(Some(true))]
}

fn boot_mode_strategy() -> impl Strategy<Value = BootMode> {
    prop_oneof![Just(BootMode::Uefi), Just(BootMode::Bios)]
}

/// Commands that can be made to fail, one per stage.
const FAILURE_POINTS: &[&str] = &[
    "lsblk",
    "wipefs",
    "mkfs.btrfs",
    "btrfs subvolume create",
    "pacstrap",
    "systemctl enable NetworkManager",
    "bootctl",
    "umount -R",
];

proptest! {
    #[test]
    fn prop_alongside_only_when_both_probes_positive(
        foreign_fs in probe_strategy(),
        free_space in probe_strategy(),
    ) {
        let probe = DiskProbe { foreign_fs, free_space, table: None };
        let expected = if foreign_fs == Some(true) && free_space == Some(true) {
            InstallStrategy::AlongsideExisting
        } else {
            InstallStrategy::WipeDisk
        };
        prop_assert_eq!(choose_strategy(&probe), expected);
    }

    #[test]
    fn prop_esp_only_on_uefi(
        boot_mode in boot_mode_strategy(),
        foreign_fs in probe_strategy(),
        free_space in probe_strategy(),
    ) {
        let disks = archprovision::hardware::parse_lsblk(LSBLK_DUAL_BOOT_NVME).unwrap();
        let probe = DiskProbe {
            foreign_fs,
            free_space,
            table: Some(PARTED_DUAL_BOOT_NVME.to_string()),
        };
        let plan = plan_partitions(&disks[0], boot_mode, &probe, &InstallerConfig::default()).unwrap();

        match (boot_mode, plan.strategy) {
            (BootMode::Bios, _) => {
                prop_assert!(plan.efi_partition.is_none());
                prop_assert!(plan.existing_efi_partition.is_none());
            }
            (BootMode::Uefi, InstallStrategy::WipeDisk) => {
                prop_assert!(plan.efi_partition.is_some());
                prop_assert!(plan.existing_efi_partition.is_none());
            }
            (BootMode::Uefi, InstallStrategy::AlongsideExisting) => {
                prop_assert!(plan.efi_partition.is_none());
                prop_assert!(plan.existing_efi_partition.is_some());
            }
        }
        prop_assert_ne!(Some(plan.root_partition.as_str()), plan.boot_partition());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_progress_is_monotonic_and_terminal_is_unique(
        failure in proptest::option::of(0..FAILURE_POINTS.len()),
        uefi in any::<bool>(),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let firmware = if uefi { uefi_firmware(dir.path()) } else { bios_firmware(dir.path()) };
        let exec = match failure {
            Some(i) => blank_disk_executor().fail_first(FAILURE_POINTS[i]),
            None => blank_disk_executor(),
        };

        let installer = Installer::new(Arc::new(exec), config_in(dir.path()))
            .with_firmware_path(firmware);
        let (tx, rx) = mpsc::channel();
        let result = installer.run("/dev/sda", InstallerSettings::default(), &CancelToken::new(), &tx);
        drop(tx);
        let events: Vec<_> = rx.iter().collect();

        let percents: Vec<u8> = progress_of(&events).iter().map(|p| p.percent).collect();
        prop_assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);
        prop_assert_eq!(terminal_count(&events), 1);
        prop_assert!(events.last().is_some_and(|e| e.is_terminal()));

        // bootctl only runs on UEFI, so that failure point is inert on BIOS
        let bootctl_on_bios = failure.map(|i| FAILURE_POINTS[i]) == Some("bootctl") && !uefi;
        if failure.is_none() || bootctl_on_bios {
            prop_assert!(result.is_ok());
            prop_assert_eq!(percents.last().copied(), Some(100));
        } else {
            prop_assert!(result.is_err());
        }
    }
}
