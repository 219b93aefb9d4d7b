use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use super::mounts::{self, MountEntry};
use crate::config::Config;
use crate::device::DeviceInfo;
use crate::error::{Error, Result};

/// Name prefixes of kernel block devices that are never removable media.
const VIRTUAL_PREFIXES: [&str; 3] = ["loop", "ram", "zram"];

/// Reads a sysfs attribute, trimmed; empty values count as absent.
fn read_attr(dir: &Path, attr: &str) -> Option<String> {
    let value = fs::read_to_string(dir.join(attr)).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn read_u64(dir: &Path, attr: &str) -> Option<u64> {
    read_attr(dir, attr)?.parse().ok()
}

/// Whether a sysfs device path runs through a USB host controller
/// (`devices/pci0000:00/.../usb2/2-1/...`).
fn is_usb_path(path: &Path) -> bool {
    path
        .components()
        .any(|c| c.as_os_str().to_string_lossy().starts_with("usb"))
}

/// The nearest ancestor of `canonical` that describes a USB device.
fn usb_ancestor(canonical: &Path, sysfs_root: &Path) -> Option<PathBuf> {
    canonical
        .ancestors()
        .take_while(|dir| dir.starts_with(sysfs_root) && *dir != sysfs_root)
        .find(|dir| dir.join("idVendor").is_file())
        .map(Path::to_path_buf)
}

/// Scans `<sysfs>/block` for USB-attached disks that are safe to overwrite.
///
/// A device is dropped when:
/// 1.  Its name marks it as a loop, ram or zram device, or its sysfs node
///     lives under `/virtual/`.
/// 2.  Its sysfs path does not pass through a USB host.
/// 3.  Any of its mountpoints (or those of its partitions) is protected; see
///     [`Config::is_protected_mount`].
/// 4.  It reports a size of zero, which is what an empty card reader does.
///
/// Survivors are enriched with vendor, model, serial and VID/PID and returned
/// sorted by name.
pub fn enumerate(config: &Config) -> Result<Vec<DeviceInfo>> {
    let block_dir = config.sysfs_root.join("block");
    let entries = fs::read_dir(&block_dir)
        .map_err(|e| Error::Enumeration(format!("{}: {e}", block_dir.display())))?;
    let mounts = mounts::read_mounts(&config.mounts_table).map_err(|e| {
        Error::Enumeration(format!("{}: {e}", config.mounts_table.display()))
    })?;
    let sysfs_root =
        fs::canonicalize(&config.sysfs_root).unwrap_or_else(|_| config.sysfs_root.clone());

    let mut devices = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(device) = probe(&name, &entry.path(), &sysfs_root, &mounts, config) {
            devices.push(device);
        }
    }

    devices.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(devices)
}

fn probe(
    name: &str,
    node: &Path,
    sysfs_root: &Path,
    mounts: &[MountEntry],
    config: &Config,
) -> Option<DeviceInfo> {
    if VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return None;
    }
    let canonical = fs::canonicalize(node).ok()?;
    let relative = canonical.strip_prefix(sysfs_root).unwrap_or(&canonical);
    if relative.components().any(|c| c.as_os_str() == "virtual") {
        return None;
    }
    if !is_usb_path(relative) {
        debug!("{name}: not on a USB bus, skipping");
        return None;
    }

    let mountpoints = mounts::mountpoints_of(name, mounts);
    if let Some(mp) = mountpoints.iter().find(|mp| config.is_protected_mount(mp)) {
        info!("{name}: mounted on protected path {}, excluded", mp.display());
        return None;
    }

    let sectors = read_u64(&canonical, "size").unwrap_or(0);
    if sectors == 0 {
        debug!("{name}: zero size, skipping");
        return None;
    }

    let usb = usb_ancestor(&canonical, sysfs_root);
    let usb_attr = |attr: &str| usb.as_deref().and_then(|dir| read_attr(dir, attr));
    let scsi = canonical.join("device");

    Some(DeviceInfo {
        name: name.to_string(),
        path: PathBuf::from("/dev").join(name),
        vendor_id: usb_attr("idVendor").map(|v| v.to_ascii_lowercase()),
        product_id: usb_attr("idProduct").map(|v| v.to_ascii_lowercase()),
        vendor: read_attr(&scsi, "vendor").or_else(|| usb_attr("manufacturer")),
        model: read_attr(&scsi, "model").or_else(|| usb_attr("product")),
        serial: usb_attr("serial"),
        bus: "usb".to_string(),
        size: sectors.saturating_mul(512),
        removable: read_u64(&canonical, "removable") == Some(1),
        mountpoints,
    })
}

/// Re-enumerates and returns the device behind `path`, if it is still a safe
/// target.
pub fn find_device(config: &Config, path: &Path) -> Result<Option<DeviceInfo>> {
    let wanted = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    Ok(enumerate(config)?
        .into_iter()
        .find(|d| d.path == wanted || d.path == path))
}
