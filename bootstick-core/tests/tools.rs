//! Pipeline stages driven against stub tools placed first on `PATH`.

mod common;

use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use bootstick_core::cancel::{self, CancelSignal};
use bootstick_core::config::{ExtractTool, InspectTool};
use bootstick_core::format::{self, FormatOptions};
use bootstick_core::iso::{self, BootType, Extractor};
use bootstick_core::types::FsType;
use bootstick_core::{Error, Phase};
use common::FakeSystem;
use serial_test::serial;

/// Prepends a directory to `PATH` until dropped.
struct PathGuard {
    saved: Option<OsString>,
}

impl PathGuard {
    fn prepend(dir: &Path) -> Self {
        let saved = env::var_os("PATH");
        let mut dirs = vec![dir.to_path_buf()];
        if let Some(path) = &saved {
            dirs.extend(env::split_paths(path));
        }
        let joined = env::join_paths(dirs).unwrap();
        // SAFETY: every test that touches PATH is #[serial].
        unsafe { env::set_var("PATH", joined) };
        PathGuard { saved }
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        // SAFETY: as above.
        unsafe {
            match &self.saved {
                Some(path) => env::set_var("PATH", path),
                None => env::remove_var("PATH"),
            }
        }
    }
}

/// A `bin/` directory of stubs that append their arguments to `calls.log`.
fn stub_bin(sys: &FakeSystem, tools: &[(&str, &str)]) -> (PathBuf, PathBuf) {
    let bin = sys.dir.path().join("bin");
    fs::create_dir_all(&bin).unwrap();
    let log = sys.dir.path().join("calls.log");
    for (name, extra) in tools {
        sys.script(
            &format!("bin/{name}"),
            &format!("echo \"{name} $*\" >> '{}'\n{extra}", log.display()),
        );
    }
    (bin, log)
}

fn calls(log: &Path) -> Vec<String> {
    fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
#[serial]
fn fat32_format_runs_mkfs_with_label_and_cluster() {
    let sys = FakeSystem::new();
    let (bin, log) = stub_bin(&sys, &[("mkfs.fat", "sleep 0.3")]);
    let _path = PathGuard::prepend(&bin);
    let partition = sys.file("sdq1", b"");

    let opts = FormatOptions {
        label: "BOOT".into(),
        cluster_size: 4096,
        ..FormatOptions::new(FsType::Fat32)
    };
    let mut events = Vec::new();
    format::format(&partition, &opts, &sys.config, &CancelSignal::never(), |e| {
        events.push(e)
    })
    .unwrap();

    assert_eq!(
        calls(&log),
        [format!("mkfs.fat -F 32 -n BOOT -s 8 {}", partition.display())]
    );
    assert!(events.iter().all(|e| e.phase == Phase::Formatting));
    assert_eq!(events.first().unwrap().fraction, 0.0);
    assert_eq!(events.last().unwrap().fraction, 1.0);
    assert!(events.len() > 2);
    assert!(events[..events.len() - 1].iter().all(|e| e.fraction <= 0.99));
}

#[test]
#[serial]
fn failed_format_reports_the_tool_error() {
    let sys = FakeSystem::new();
    let (bin, _log) = stub_bin(
        &sys,
        &[("mkfs.exfat", "echo 'mkfs.exfat: device is busy' >&2\nexit 1")],
    );
    let _path = PathGuard::prepend(&bin);
    let partition = sys.file("sdq1", b"");

    let err = format::format_sync(&partition, FsType::ExFat, "", 0, &sys.config).unwrap_err();
    match err {
        Error::Format(message) => assert_eq!(message, "mkfs.exfat: device is busy"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
#[serial]
fn listing_tool_feeds_the_analysis() {
    let mut sys = FakeSystem::new();
    let listing = "/EFI\n/EFI/BOOT\n/EFI/BOOT/BOOTX64.EFI\n/casper/vmlinuz\n/isolinux/isolinux.bin\n";
    let (bin, _log) = stub_bin(&sys, &[("xorriso", &format!("printf '{listing}'"))]);
    let _path = PathGuard::prepend(&bin);
    sys.config.inspect_tools = vec![InspectTool::Xorriso];
    let image = sys.file("ubuntu.iso", &[0u8; 64 * 1024]);

    assert_eq!(iso::list_files(&image, &sys.config).len(), 5);
    let info = iso::analyze(&image, &sys.config).unwrap();
    assert!(info.has_efi);
    assert!(info.is_linux);
    assert!(!info.is_windows);
    assert_eq!(info.boot_type, BootType::Uefi);
}

#[test]
#[serial]
fn extraction_mounts_unpacks_and_unmounts() {
    let mut sys = FakeSystem::new();
    let (bin, log) = stub_bin(&sys, &[("mount", ""), ("umount", ""), ("bsdtar", "")]);
    let _path = PathGuard::prepend(&bin);
    sys.config.extract_tools = vec![ExtractTool::Bsdtar];
    let image = sys.file("win.iso", &[0u8; 4096]);
    let partition = Path::new("/dev/sdq1");

    let extractor = Extractor::new(&sys.config);
    assert_eq!(extractor.tool(), Some(ExtractTool::Bsdtar));
    let mut fractions = Vec::new();
    extractor
        .extract(&image, partition, &CancelSignal::never(), |e| {
            fractions.push(e.fraction)
        })
        .unwrap();
    assert_eq!(fractions, [0.0, 1.0]);

    let calls = calls(&log);
    assert_eq!(calls.len(), 3, "{calls:?}");
    let mount_dir = calls[0]
        .strip_prefix("mount /dev/sdq1 ")
        .unwrap()
        .to_string();
    assert_eq!(
        calls[1],
        format!("bsdtar -C {mount_dir} -xf {}", image.display())
    );
    assert_eq!(calls[2], format!("umount {mount_dir}"));
    assert!(!Path::new(&mount_dir).exists());
}

#[test]
#[serial]
fn failed_mount_stops_extraction() {
    let mut sys = FakeSystem::new();
    let (bin, log) = stub_bin(
        &sys,
        &[
            ("mount", "echo 'mount: wrong fs type' >&2\nexit 32"),
            ("umount", ""),
            ("7z", ""),
        ],
    );
    let _path = PathGuard::prepend(&bin);
    sys.config.extract_tools = vec![ExtractTool::SevenZip];
    let image = sys.file("win.iso", &[0u8; 4096]);

    let err = Extractor::new(&sys.config)
        .extract(&image, Path::new("/dev/sdq1"), &CancelSignal::never(), |_| {})
        .unwrap_err();
    assert!(matches!(err, Error::Extract(ref m) if m.contains("wrong fs type")), "{err:?}");
    assert_eq!(calls(&log).len(), 1);
}

#[test]
#[serial]
fn cancel_stops_a_running_extraction_and_unmounts() {
    let mut sys = FakeSystem::new();
    let (bin, log) = stub_bin(&sys, &[("mount", ""), ("umount", ""), ("bsdtar", "sleep 10")]);
    let _path = PathGuard::prepend(&bin);
    sys.config.extract_tools = vec![ExtractTool::Bsdtar];
    let image = sys.file("win.iso", &[0u8; 4096]);

    let (handle, signal) = cancel::pair();
    let watched = log.clone();
    let canceller = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline
            && !calls(&watched).iter().any(|c| c.starts_with("bsdtar"))
        {
            thread::sleep(Duration::from_millis(20));
        }
        handle.cancel();
    });

    let start = Instant::now();
    let err = Extractor::new(&sys.config)
        .extract(&image, Path::new("/dev/sdq1"), &signal, |_| {})
        .unwrap_err();
    canceller.join().unwrap();

    assert!(err.is_cancelled(), "{err:?}");
    assert!(start.elapsed() < Duration::from_secs(8));
    let calls = calls(&log);
    assert!(calls[1].starts_with("bsdtar"), "{calls:?}");
    assert!(calls.last().unwrap().starts_with("umount"), "{calls:?}");
}
