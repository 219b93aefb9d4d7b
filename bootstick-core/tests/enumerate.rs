mod common;

use std::path::{Path, PathBuf};

use bootstick_core::{Error, platform};
use common::FakeSystem;

const STICK_SECTORS: u64 = 60_062_500;

#[test]
fn usb_stick_is_listed_with_its_identity() {
    let sys = FakeSystem::new();
    sys.add_usb_disk("sdb", 1, STICK_SECTORS);

    let devices = platform::enumerate(&sys.config).unwrap();
    assert_eq!(devices.len(), 1);
    let stick = &devices[0];
    assert_eq!(stick.name, "sdb");
    assert_eq!(stick.path, PathBuf::from("/dev/sdb"));
    assert_eq!(stick.vendor.as_deref(), Some("SanDisk"));
    assert_eq!(stick.model.as_deref(), Some("Ultra Fit"));
    assert_eq!(stick.vendor_id.as_deref(), Some("0781"));
    assert_eq!(stick.product_id.as_deref(), Some("5583"));
    assert_eq!(stick.serial.as_deref(), Some("4C530001"));
    assert_eq!(stick.bus, "usb");
    assert_eq!(stick.size, STICK_SECTORS * 512);
    assert!(stick.removable);
    assert!(!stick.is_mounted());
}

#[test]
fn internal_and_virtual_disks_are_skipped() {
    let sys = FakeSystem::new();
    sys.add_disk("nvme0n1", "devices/pci0000:00/0000:00:1d.0/nvme/nvme0", 1_000_215_216);
    sys.add_disk("sda", "devices/pci0000:00/0000:00:17.0/ata1/host0/target0:0:0/0:0:0:0", 500_118_192);
    sys.add_disk("loop0", "devices/virtual/block", 131_072);
    sys.add_disk("dm-0", "devices/virtual/block", 131_072);
    sys.add_usb_disk("sdc", 2, STICK_SECTORS);

    let names: Vec<_> = platform::enumerate(&sys.config)
        .unwrap()
        .into_iter()
        .map(|d| d.name)
        .collect();
    assert_eq!(names, ["sdc"]);
}

#[test]
fn empty_card_reader_is_skipped() {
    let sys = FakeSystem::new();
    sys.add_usb_disk("sdb", 1, 0);
    assert!(platform::enumerate(&sys.config).unwrap().is_empty());
}

#[test]
fn protected_mounts_exclude_a_device() {
    let sys = FakeSystem::new();
    sys.add_usb_disk("sdb", 1, STICK_SECTORS);
    sys.add_usb_disk("sdc", 2, STICK_SECTORS);
    sys.add_usb_disk("sdd", 3, STICK_SECTORS);
    sys.add_usb_disk("sde", 4, STICK_SECTORS);
    sys.mount("/dev/sdb1", "/");
    sys.mount("/dev/sdc1", "/media/user/STICK");
    sys.mount("/dev/sdd2", "/home/user/backup");
    sys.mount("/dev/sde1", "/boot/efi");

    let devices = platform::enumerate(&sys.config).unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].name, "sdc");
    assert_eq!(
        devices[0].mountpoints,
        [PathBuf::from("/media/user/STICK")]
    );
}

#[test]
fn devices_come_back_sorted() {
    let sys = FakeSystem::new();
    sys.add_usb_disk("sdd", 1, STICK_SECTORS);
    sys.add_usb_disk("sdb", 2, STICK_SECTORS);
    let names: Vec<_> = platform::enumerate(&sys.config)
        .unwrap()
        .into_iter()
        .map(|d| d.name)
        .collect();
    assert_eq!(names, ["sdb", "sdd"]);
}

#[test]
fn find_device_only_returns_safe_targets() {
    let sys = FakeSystem::new();
    sys.add_usb_disk("sdb", 1, STICK_SECTORS);
    sys.add_disk("sda", "devices/pci0000:00/0000:00:17.0/ata1/host0/target0:0:0/0:0:0:0", 1);

    let found = platform::find_device(&sys.config, Path::new("/dev/sdb")).unwrap();
    assert_eq!(found.map(|d| d.name).as_deref(), Some("sdb"));
    assert!(
        platform::find_device(&sys.config, Path::new("/dev/sda"))
            .unwrap()
            .is_none()
    );
    assert!(
        platform::find_device(&sys.config, Path::new("/dev/sdx"))
            .unwrap()
            .is_none()
    );
}

#[test]
fn unreadable_mount_table_is_an_error() {
    let mut sys = FakeSystem::new();
    sys.add_usb_disk("sdb", 1, STICK_SECTORS);
    sys.config.mounts_table = sys.dir.path().join("no-such-mounts");
    let err = platform::enumerate(&sys.config).unwrap_err();
    assert!(matches!(err, Error::Enumeration(_)), "{err:?}");
}
