mod common;

use std::fs::File;
use std::path::PathBuf;

use bootstick_core::partition::{self, GPT_BASIC_DATA, GPT_ESP, MIB, PartitionType};
use bootstick_core::types::{FsType, PartitionStyle, TargetFirmware};
use common::FakeSystem;

/// A sparse 64 MiB image standing in for a stick.
fn blank_stick(sys: &FakeSystem) -> PathBuf {
    let path = sys.dir.path().join("stick.img");
    File::create(&path).unwrap().set_len(64 * MIB).unwrap();
    path
}

fn quick(mut sys: FakeSystem) -> FakeSystem {
    sys.config.settle_delay_ms = 0;
    sys.config.esp_size_mib = 16;
    sys
}

#[test]
fn gpt_data_stick_reads_back_as_one_basic_data_partition() {
    let sys = quick(FakeSystem::new());
    let stick = blank_stick(&sys);

    partition::create_single(&stick, PartitionStyle::Gpt, FsType::Fat32, "DATA", &sys.config)
        .unwrap();

    let layout = partition::get_layout(&stick, &sys.config).unwrap();
    assert_eq!(layout.style, PartitionStyle::Gpt);
    assert_eq!(layout.entries.len(), 1);
    let data = &layout.entries[0];
    assert_eq!(data.part_type, Some(PartitionType::Gpt(GPT_BASIC_DATA.into())));
    assert_eq!(data.label, "DATA");
    assert_eq!(data.start, MIB);
    assert!(data.size > 60 * MIB);
}

#[test]
fn bios_stick_gets_one_active_fat32_partition() {
    let sys = quick(FakeSystem::new());
    let stick = blank_stick(&sys);

    partition::create_bootable(
        &stick,
        PartitionStyle::Mbr,
        TargetFirmware::Bios,
        FsType::Fat32,
        "BOOT",
        &sys.config,
    )
    .unwrap();

    let layout = partition::get_layout(&stick, &sys.config).unwrap();
    assert_eq!(layout.style, PartitionStyle::Mbr);
    assert_eq!(layout.entries.len(), 1);
    assert_eq!(layout.entries[0].part_type, Some(PartitionType::Mbr(0x0c)));
    assert_eq!(layout.entries[0].fs_type, Some(FsType::Fat32));
    assert!(layout.entries[0].bootable);
    assert_eq!(layout.entries[0].start + layout.entries[0].size, 64 * MIB);
}

#[test]
fn uefi_gpt_stick_gets_esp_then_data() {
    let sys = quick(FakeSystem::new());
    let stick = blank_stick(&sys);

    partition::create_bootable(
        &stick,
        PartitionStyle::Gpt,
        TargetFirmware::BiosUefi,
        FsType::ExFat,
        "STICK",
        &sys.config,
    )
    .unwrap();

    let layout = partition::get_layout(&stick, &sys.config).unwrap();
    assert_eq!(layout.entries.len(), 2);
    let (esp, data) = (&layout.entries[0], &layout.entries[1]);
    assert_eq!(esp.part_type, Some(PartitionType::Gpt(GPT_ESP.into())));
    assert_eq!(esp.size, 16 * MIB);
    assert_eq!(esp.label, "EFI");
    assert_eq!(data.start, esp.start + esp.size);
    assert_eq!(data.label, "STICK");
}

#[test]
fn delete_all_keeps_the_table_style() {
    let sys = quick(FakeSystem::new());
    let stick = blank_stick(&sys);
    partition::create_single(&stick, PartitionStyle::Gpt, FsType::Ext4, "", &sys.config).unwrap();

    partition::delete_all(&stick, &sys.config).unwrap();

    let layout = partition::get_layout(&stick, &sys.config).unwrap();
    assert_eq!(layout.style, PartitionStyle::Gpt);
    assert!(layout.entries.is_empty());
}

#[test]
fn blank_device_falls_back_to_mbr_on_delete() {
    let sys = quick(FakeSystem::new());
    let stick = blank_stick(&sys);
    assert!(partition::get_layout(&stick, &sys.config).is_err());

    partition::delete_all(&stick, &sys.config).unwrap();
    let layout = partition::get_layout(&stick, &sys.config).unwrap();
    assert_eq!(layout.style, PartitionStyle::Mbr);
    assert!(layout.entries.is_empty());
}

#[test]
fn gpt_on_an_odd_sector_count_stays_inside_the_device() {
    let sys = quick(FakeSystem::new());
    let stick = sys.dir.path().join("odd.img");
    let len = 64 * MIB + 512;
    File::create(&stick).unwrap().set_len(len).unwrap();

    partition::create_single(&stick, PartitionStyle::Gpt, FsType::Fat32, "ODD", &sys.config)
        .unwrap();

    assert_eq!(std::fs::metadata(&stick).unwrap().len(), len);
    let layout = partition::get_layout(&stick, &sys.config).unwrap();
    assert_eq!(layout.style, PartitionStyle::Gpt);
    assert_eq!(layout.entries.len(), 1);
    assert_eq!(layout.entries[0].label, "ODD");
}
