#![allow(dead_code)]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};

use bootstick_core::Config;
use bootstick_core::config::ElevationPolicy;
use tempfile::TempDir;

const USB_HOST: &str = "devices/pci0000:00/0000:00:14.0/usb2";

/// A throwaway `/sys` and `/proc/mounts` for enumeration tests.
pub struct FakeSystem {
    pub dir: TempDir,
    pub config: Config,
}

impl FakeSystem {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let sys = dir.path().join("sys");
        fs::create_dir_all(sys.join("block")).unwrap();
        let mounts = dir.path().join("mounts");
        fs::write(&mounts, "proc /proc proc rw 0 0\n/dev/nvme0n1p2 / ext4 rw 0 0\n").unwrap();

        let config = Config {
            sysfs_root: sys,
            mounts_table: mounts,
            elevation: ElevationPolicy::Never,
            inspect_tools: Vec::new(),
            extract_tools: Vec::new(),
            file_classifier: false,
            write_poll_interval_ms: 20,
            ..Config::default()
        };
        FakeSystem { dir, config }
    }

    fn sys(&self) -> &Path {
        &self.config.sysfs_root
    }

    /// Creates `<devpath>/block/<name>` and links it from `/sys/block`.
    pub fn add_disk(&self, name: &str, devpath: &str, sectors: u64) -> PathBuf {
        let node = self.sys().join(devpath).join("block").join(name);
        fs::create_dir_all(&node).unwrap();
        fs::write(node.join("size"), format!("{sectors}\n")).unwrap();
        fs::write(node.join("removable"), "1\n").unwrap();
        symlink(&node, self.sys().join("block").join(name)).unwrap();
        node
    }

    /// A SanDisk stick on USB port `port`, with the SCSI layers in between.
    pub fn add_usb_disk(&self, name: &str, port: u32, sectors: u64) -> PathBuf {
        let usb = format!("{USB_HOST}/2-{port}");
        let usb_dir = self.sys().join(&usb);
        fs::create_dir_all(&usb_dir).unwrap();
        for (attr, value) in [
            ("idVendor", "0781"),
            ("idProduct", "5583"),
            ("manufacturer", "SanDisk"),
            ("product", "Ultra Fit"),
            ("serial", "4C530001"),
        ] {
            fs::write(usb_dir.join(attr), format!("{value}\n")).unwrap();
        }

        let scsi = format!("{usb}/2-{port}:1.0/host{port}/target{port}:0:0/{port}:0:0:0");
        fs::create_dir_all(self.sys().join(&scsi)).unwrap();
        fs::write(self.sys().join(&scsi).join("vendor"), "SanDisk \n").unwrap();
        fs::write(self.sys().join(&scsi).join("model"), "Ultra Fit       \n").unwrap();

        let node = self.add_disk(name, &scsi, sectors);
        symlink(self.sys().join(&scsi), node.join("device")).unwrap();
        node
    }

    pub fn mount(&self, source: &str, target: &str) {
        let mut table = OpenOptions::new()
            .append(true)
            .open(&self.config.mounts_table)
            .unwrap();
        writeln!(table, "{source} {target} vfat rw,nosuid 0 0").unwrap();
    }

    /// An executable shell script in the fixture directory.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub fn file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }
}
