//! Partition table construction and inspection.
//!
//! Two back-ends implement the same operations. When the process may write
//! the device itself (root, or [`ElevationPolicy::Never`]) the tables are
//! built natively: a hand-written MBR in [`mbr`] and GPT through `gpt_disk_io`
//! in [`gpt`]. Otherwise every mutating operation is rendered as a single
//! `sfdisk` script ([`sfdisk`]) and run through the elevation helper.
//!
//! [`ElevationPolicy::Never`]: crate::config::ElevationPolicy::Never

pub mod gpt;
pub mod mbr;
pub mod sfdisk;

use std::fmt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::Config;
use crate::disk::Disk;
use crate::error::{Error, IoContext, Result};
use crate::privilege;
use crate::types::{FsType, PartitionStyle, TargetFirmware};

pub const MIB: u64 = 1024 * 1024;
/// Bytes wiped at each end of the device before a new table goes down.
const WIPE_LEN: u64 = MIB;

pub const GPT_ESP: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
pub const GPT_LINUX: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";
pub const GPT_BASIC_DATA: &str = "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7";

pub const MBR_FAT16: u8 = 0x06;
pub const MBR_FAT32_LBA: u8 = 0x0c;
pub const MBR_NTFS: u8 = 0x07;
pub const MBR_LINUX: u8 = 0x83;
pub const MBR_EFI: u8 = 0xef;

/// A partition type code in the table's own vocabulary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartitionType {
    Mbr(u8),
    /// Upper-case GUID string.
    Gpt(String),
}

impl PartitionType {
    pub fn esp(style: PartitionStyle) -> Self {
        match style {
            PartitionStyle::Mbr => PartitionType::Mbr(MBR_EFI),
            PartitionStyle::Gpt => PartitionType::Gpt(GPT_ESP.to_string()),
        }
    }

    /// The type a fresh partition holding `fs` gets.
    pub fn for_fs(fs: FsType, style: PartitionStyle) -> Self {
        match style {
            PartitionStyle::Mbr => PartitionType::Mbr(match fs {
                FsType::Fat16 => MBR_FAT16,
                FsType::Fat32 => MBR_FAT32_LBA,
                FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => MBR_LINUX,
                FsType::Ntfs | FsType::ExFat | FsType::ReFs | FsType::Udf => MBR_NTFS,
            }),
            PartitionStyle::Gpt => PartitionType::Gpt(
                if fs.is_ext() { GPT_LINUX } else { GPT_BASIC_DATA }.to_string(),
            ),
        }
    }

    pub fn gpt(guid: impl fmt::Display) -> Self {
        PartitionType::Gpt(guid.to_string().to_ascii_uppercase())
    }

    /// Best-effort filesystem guess for an observed type.
    fn implied_fs(&self) -> Option<FsType> {
        match self {
            PartitionType::Mbr(MBR_FAT16) => Some(FsType::Fat16),
            PartitionType::Mbr(0x0b | MBR_FAT32_LBA | MBR_EFI) => Some(FsType::Fat32),
            PartitionType::Gpt(guid) if guid == GPT_ESP => Some(FsType::Fat32),
            _ => None,
        }
    }

    fn style(&self) -> PartitionStyle {
        match self {
            PartitionType::Mbr(_) => PartitionStyle::Mbr,
            PartitionType::Gpt(_) => PartitionStyle::Gpt,
        }
    }
}

/// The `sfdisk` spelling of the type.
impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionType::Mbr(code) => write!(f, "{code:x}"),
            PartitionType::Gpt(guid) => f.write_str(guid),
        }
    }
}

/// One partition, either requested or read back from a table.
///
/// When requesting, `start == 0` lets the table pick the next 1 MiB-aligned
/// offset and `size == 0` takes the rest of the device.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PartitionEntry {
    /// Offset in bytes.
    pub start: u64,
    /// Length in bytes.
    pub size: u64,
    pub fs_type: Option<FsType>,
    /// MBR active flag. Ignored on GPT.
    pub bootable: bool,
    /// GPT partition name. Ignored on MBR.
    pub label: String,
    pub part_type: Option<PartitionType>,
}

impl PartitionEntry {
    pub fn new(fs: FsType) -> Self {
        PartitionEntry {
            fs_type: Some(fs),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_type(mut self, part_type: PartitionType) -> Self {
        self.part_type = Some(part_type);
        self
    }

    pub fn bootable(mut self, bootable: bool) -> Self {
        self.bootable = bootable;
        self
    }

    /// The type code this entry is written with under `style`.
    pub fn resolved_type(&self, style: PartitionStyle) -> PartitionType {
        match &self.part_type {
            Some(t) if t.style() == style => t.clone(),
            _ => match self.fs_type {
                Some(fs) => PartitionType::for_fs(fs, style),
                None => match style {
                    PartitionStyle::Mbr => PartitionType::Mbr(MBR_LINUX),
                    PartitionStyle::Gpt => PartitionType::Gpt(GPT_LINUX.to_string()),
                },
            },
        }
    }

    /// Builds an observed entry, inferring the filesystem from the type.
    pub(crate) fn observed(start: u64, size: u64, part_type: PartitionType) -> Self {
        PartitionEntry {
            start,
            size,
            fs_type: part_type.implied_fs(),
            part_type: Some(part_type),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PartitionLayout {
    pub style: PartitionStyle,
    pub entries: Vec<PartitionEntry>,
}

/// Rounds `value` up to the next multiple of `align`.
pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

pub(crate) fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    for chunk in out.chunks_mut(16) {
        let bytes = uuid::Uuid::new_v4().into_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }
    out
}

fn partition_err(device: &Path) -> impl Fn(std::io::Error) -> Error + '_ {
    move |e| Error::Partition(format!("{}: {e}", device.display()))
}

/// Native back-end: whether this process writes tables itself.
fn writes_natively(config: &Config) -> bool {
    !privilege::needs_elevation(config)
}

/// Zeroes the first and last MiB of the device so no stale signature
/// survives under the new table.
pub(crate) fn wipe_label_areas(disk: &Disk) -> std::io::Result<()> {
    let size = disk.size()?;
    let head = WIPE_LEN.min(size);
    let zeros = vec![0u8; head as usize];
    disk.write_at(&zeros, 0)?;
    let tail = WIPE_LEN.min(size - head);
    if tail > 0 {
        disk.write_at(&zeros[..tail as usize], size - tail)?;
    }
    Ok(())
}

/// Opens `device` for table writes and holds the advisory lock while `f`
/// runs; on success the kernel is asked to re-read the table.
fn with_locked_disk<T>(device: &Path, f: impl FnOnce(&Disk) -> Result<T>) -> Result<T> {
    let disk = Disk::open(device, true).map_err(partition_err(device))?;
    disk.lock()
        .map_err(|e| Error::Busy(format!("{} ({e})", device.display())))?;
    let result = f(&disk).and_then(|value| {
        disk.sync().context(|| format!("syncing {}", device.display()))?;
        Ok(value)
    });
    if let Err(e) = disk.unlock() {
        warn!("{}: unlock failed: {e}", device.display());
    }
    if result.is_ok()
        && let Err(e) = disk.reread_partitions()
    {
        warn!("{}: partition table re-read failed: {e}", device.display());
    }
    result
}

fn write_table(disk: &Disk, style: PartitionStyle) -> Result<()> {
    wipe_label_areas(disk).map_err(partition_err(disk.path()))?;
    match style {
        PartitionStyle::Mbr => mbr::create_table(disk),
        PartitionStyle::Gpt => gpt::create_table(disk),
    }
}

fn add_native(disk: &Disk, entry: &PartitionEntry, slot: u32) -> Result<()> {
    match detect_style(disk)? {
        PartitionStyle::Mbr => mbr::add(disk, entry, slot),
        PartitionStyle::Gpt => gpt::add(disk, entry, slot),
    }
}

/// Writes a fresh table and then each entry, in order, as partitions 1..n.
fn apply_layout(
    device: &Path,
    style: PartitionStyle,
    entries: &[PartitionEntry],
    config: &Config,
) -> Result<()> {
    info!(
        "partitioning {} as {style} with {} partition(s)",
        device.display(),
        entries.len()
    );
    if !writes_natively(config) {
        return sfdisk::apply_layout(device, style, entries, config);
    }

    with_locked_disk(device, |disk| write_table(disk, style))?;
    if !entries.is_empty() {
        thread::sleep(config.settle_delay());
    }
    with_locked_disk(device, |disk| {
        for (i, entry) in entries.iter().enumerate() {
            add_native(disk, entry, i as u32 + 1)?;
        }
        Ok(())
    })
}

/// Replaces whatever is on `device` with an empty MBR or GPT.
pub fn create_table(device: &Path, style: PartitionStyle, config: &Config) -> Result<()> {
    apply_layout(device, style, &[], config)
}

/// Appends partition number `slot` (1-based) to the existing table.
pub fn add(device: &Path, entry: &PartitionEntry, slot: u32, config: &Config) -> Result<()> {
    if slot == 0 {
        return Err(Error::InvalidInput("partition numbers start at 1".into()));
    }
    if writes_natively(config) {
        with_locked_disk(device, |disk| add_native(disk, entry, slot))
    } else {
        let style = get_layout(device, config)?.style;
        sfdisk::append(device, style, entry, config)
    }
}

/// One bootable partition spanning the device.
pub fn create_single(
    device: &Path,
    style: PartitionStyle,
    fs: FsType,
    label: &str,
    config: &Config,
) -> Result<()> {
    let entry = PartitionEntry::new(fs).with_label(label).bootable(true);
    apply_layout(device, style, &[entry], config)
}

/// One FAT32 partition spanning the device, typed as an EFI System Partition.
pub fn create_single_efi(
    device: &Path,
    style: PartitionStyle,
    label: &str,
    config: &Config,
) -> Result<()> {
    let entry = PartitionEntry::new(FsType::Fat32)
        .with_label(label)
        .with_type(PartitionType::esp(style))
        .bootable(true);
    apply_layout(device, style, &[entry], config)
}

/// The layout a bootable stick gets: on GPT targeting UEFI, an ESP followed by
/// a data partition over the rest; otherwise a single partition.
pub fn create_bootable(
    device: &Path,
    style: PartitionStyle,
    target: TargetFirmware,
    fs: FsType,
    label: &str,
    config: &Config,
) -> Result<()> {
    if style != PartitionStyle::Gpt || !target.wants_uefi() {
        return create_single(device, style, fs, label, config);
    }
    let esp = PartitionEntry::new(FsType::Fat32)
        .with_size(config.esp_size_mib * MIB)
        .with_label("EFI")
        .with_type(PartitionType::esp(style));
    let data = PartitionEntry::new(fs).with_label(label);
    apply_layout(device, style, &[esp, data], config)
}

/// Drops every partition by writing an empty table of the same style (MBR
/// when the current one cannot be read).
pub fn delete_all(device: &Path, config: &Config) -> Result<()> {
    let style = get_layout(device, config)
        .map(|layout| layout.style)
        .unwrap_or(PartitionStyle::Mbr);
    create_table(device, style, config)
}

fn detect_style(disk: &Disk) -> Result<PartitionStyle> {
    let sector0 = mbr::read_sector0(disk)?;
    match mbr::parse(&sector0) {
        Some(table) if table.is_protective() => Ok(PartitionStyle::Gpt),
        Some(_) => Ok(PartitionStyle::Mbr),
        None => Err(Error::Partition(format!(
            "{}: no partition table",
            disk.path().display()
        ))),
    }
}

/// Reads the partition table natively from an open disk.
pub fn read_layout(disk: &Disk) -> Result<PartitionLayout> {
    match detect_style(disk)? {
        PartitionStyle::Gpt => gpt::read(disk),
        PartitionStyle::Mbr => mbr::read(disk),
    }
}

/// Reads the current table. Falls back to an elevated `sfdisk --dump` when the
/// device cannot be opened for reading.
pub fn get_layout(device: &Path, config: &Config) -> Result<PartitionLayout> {
    match Disk::open(device, false) {
        Ok(disk) => read_layout(&disk),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            sfdisk::dump(device, config)
        }
        Err(e) => Err(partition_err(device)(e)),
    }
}

/// Device node of partition `n` on `device`: `sdb` -> `sdb1`, but
/// `nvme0n1` -> `nvme0n1p1` and `mmcblk0` -> `mmcblk0p1`.
pub fn partition_path(device: &Path, n: u32) -> PathBuf {
    let name = device
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let needs_p = name.ends_with(|c: char| c.is_ascii_digit())
        || ["nvme", "mmcblk", "loop"]
            .iter()
            .any(|prefix| name.starts_with(prefix));
    let part = if needs_p {
        format!("{name}p{n}")
    } else {
        format!("{name}{n}")
    };
    device.with_file_name(part)
}

/// Polls until `node` exists, for up to `timeout`.
pub fn wait_for_node(node: &Path, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !node.exists() {
        if Instant::now() >= deadline {
            return Err(Error::Partition(format!(
                "{} did not appear within {} ms",
                node.display(),
                timeout.as_millis()
            )));
        }
        thread::sleep(Duration::from_millis(100));
    }
    Ok(())
}
