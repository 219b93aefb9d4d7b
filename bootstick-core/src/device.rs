use std::fmt;
use std::path::PathBuf;

/// A removable block device that passed the safety filter.
///
/// Populated fresh by every call to [`crate::platform::enumerate`]; nothing
/// holds on to one between operations.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceInfo {
    /// The kernel name of the device (e.g., "sdb").
    pub name: String,
    /// The device node (e.g., `/dev/sdb`).
    pub path: PathBuf,
    /// USB vendor ID, lower-case hex.
    pub vendor_id: Option<String>,
    /// USB product ID, lower-case hex.
    pub product_id: Option<String>,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
    /// The bus the device hangs off (always "usb" after filtering).
    pub bus: String,
    /// Size in bytes.
    pub size: u64,
    pub removable: bool,
    /// Every mountpoint of the device or one of its partitions.
    pub mountpoints: Vec<PathBuf>,
}

pub(crate) fn size_gb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}

impl DeviceInfo {
    /// "vendor model (size)", falling back to the model, the vendor, or the
    /// device node.
    pub fn display_name(&self) -> String {
        let size = format!("{:.1} GB", size_gb(self.size));
        match (&self.vendor, &self.model) {
            (Some(vendor), Some(model)) => format!("{vendor} {model} ({size})"),
            (None, Some(model)) => format!("{model} ({size})"),
            (Some(vendor), None) => format!("{vendor} ({size})"),
            (None, None) => format!("{} ({size})", self.path.display()),
        }
    }

    pub fn is_mounted(&self) -> bool {
        !self.mountpoints.is_empty()
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = match self.mountpoints.first() {
            Some(mp) if self.mountpoints.len() > 1 => {
                format!("[Mounted at {} +{}]", mp.display(), self.mountpoints.len() - 1)
            }
            Some(mp) => format!("[Mounted at {}]", mp.display()),
            None => "[Not mounted]".to_string(),
        };

        let ids = match (&self.vendor_id, &self.product_id) {
            (Some(vid), Some(pid)) => format!(" {vid}:{pid}"),
            _ => String::new(),
        };

        write!(
            f,
            "{:<15} {:>7.1} GB  {}{} {}",
            self.path.display(),
            size_gb(self.size),
            self.display_name(),
            ids,
            mount_info
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stick() -> DeviceInfo {
        DeviceInfo {
            name: "sdb".into(),
            path: PathBuf::from("/dev/sdb"),
            vendor_id: Some("0781".into()),
            product_id: Some("5583".into()),
            vendor: Some("SanDisk".into()),
            model: Some("Ultra Fit".into()),
            serial: None,
            bus: "usb".into(),
            size: 32 * 1024 * 1024 * 1024,
            removable: true,
            mountpoints: Vec::new(),
        }
    }

    #[test]
    fn display_name_falls_back() {
        let mut dev = stick();
        assert_eq!(dev.display_name(), "SanDisk Ultra Fit (32.0 GB)");
        dev.vendor = None;
        assert_eq!(dev.display_name(), "Ultra Fit (32.0 GB)");
        dev.model = None;
        assert_eq!(dev.display_name(), "/dev/sdb (32.0 GB)");
    }

    #[test]
    fn display_shows_ids_and_mounts() {
        let mut dev = stick();
        dev.mountpoints = vec![PathBuf::from("/media/stick")];
        let line = dev.to_string();
        assert!(line.starts_with("/dev/sdb"));
        assert!(line.contains("0781:5583"));
        assert!(line.ends_with("[Mounted at /media/stick]"));
    }
}
