//! Runtime configuration.
//!
//! Every field has a default, so an empty TOML file (or no file at all) gives
//! the stock behaviour. Front-ends load a file with [`Config::load`] and pass
//! the result by reference into each pipeline call.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Whether privileged steps go through the polkit helper.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElevationPolicy {
    /// Run directly as root, otherwise prefix the elevation helper.
    #[default]
    Auto,
    /// Always run tools directly, for users already granted device access.
    Never,
}

/// Tools that can list the contents of an ISO image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InspectTool {
    Isoinfo,
    Xorriso,
    Bsdtar,
    #[serde(rename = "7z")]
    SevenZip,
}

/// Tools that can unpack an ISO image onto a mounted filesystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractTool {
    Xorriso,
    Bsdtar,
    #[serde(rename = "7z")]
    SevenZip,
}

impl InspectTool {
    pub fn program(self) -> &'static str {
        match self {
            InspectTool::Isoinfo => "isoinfo",
            InspectTool::Xorriso => "xorriso",
            InspectTool::Bsdtar => "bsdtar",
            InspectTool::SevenZip => "7z",
        }
    }
}

impl ExtractTool {
    pub fn program(self) -> &'static str {
        match self {
            ExtractTool::Xorriso => "xorriso",
            ExtractTool::Bsdtar => "bsdtar",
            ExtractTool::SevenZip => "7z",
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Mountpoints that disqualify a device outright.
    pub protected_mounts: Vec<PathBuf>,
    /// Mountpoints nested under any of these also disqualify a device.
    pub protected_trees: Vec<PathBuf>,
    pub sysfs_root: PathBuf,
    pub mounts_table: PathBuf,

    pub elevation_helpers: Vec<PathBuf>,
    pub elevation: ElevationPolicy,

    /// Program used for raw copies. Resolved on `PATH` when not absolute.
    pub raw_copy_tool: PathBuf,
    pub dd_block_size: String,
    pub write_poll_interval_ms: u64,
    pub format_poll_interval_ms: u64,

    /// Pause after writing a fresh table, before adding partitions.
    pub settle_delay_ms: u64,
    pub esp_size_mib: u64,
    pub partition_wait_ms: u64,

    pub inspect_tools: Vec<InspectTool>,
    pub extract_tools: Vec<ExtractTool>,
    /// Ask `file(1)` whether an image is a hybrid.
    pub file_classifier: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protected_mounts: ["/", "/boot", "/boot/efi", "/home"]
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            protected_trees: ["/boot", "/home"].into_iter().map(PathBuf::from).collect(),
            sysfs_root: PathBuf::from("/sys"),
            mounts_table: PathBuf::from("/proc/mounts"),
            elevation_helpers: vec![
                PathBuf::from("/usr/bin/pkexec"),
                PathBuf::from("/bin/pkexec"),
            ],
            elevation: ElevationPolicy::Auto,
            raw_copy_tool: PathBuf::from("dd"),
            dd_block_size: "4M".to_string(),
            write_poll_interval_ms: 250,
            format_poll_interval_ms: 100,
            settle_delay_ms: 500,
            esp_size_mib: 256,
            partition_wait_ms: 5000,
            inspect_tools: vec![
                InspectTool::Isoinfo,
                InspectTool::Xorriso,
                InspectTool::Bsdtar,
                InspectTool::SevenZip,
            ],
            extract_tools: vec![ExtractTool::Xorriso, ExtractTool::Bsdtar, ExtractTool::SevenZip],
            file_classifier: true,
        }
    }
}

impl Config {
    /// Reads and validates a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading config {}", path.display()), e))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.write_poll_interval_ms == 0 || self.format_poll_interval_ms == 0 {
            return Err(Error::Config("poll intervals must be non-zero".into()));
        }
        if self.esp_size_mib == 0 {
            return Err(Error::Config("esp_size_mib must be non-zero".into()));
        }
        if self.dd_block_size.is_empty() {
            return Err(Error::Config("dd_block_size must not be empty".into()));
        }
        Ok(())
    }

    /// Whether `mountpoint` disqualifies the device it belongs to.
    pub fn is_protected_mount(&self, mountpoint: &Path) -> bool {
        self.protected_mounts.iter().any(|p| p == mountpoint)
            || self
                .protected_trees
                .iter()
                .any(|tree| mountpoint != tree && mountpoint.starts_with(tree))
    }

    pub fn write_poll_interval(&self) -> Duration {
        Duration::from_millis(self.write_poll_interval_ms)
    }

    pub fn format_poll_interval(&self) -> Duration {
        Duration::from_millis(self.format_poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn partition_wait(&self) -> Duration {
        Duration::from_millis(self.partition_wait_ms)
    }
}
