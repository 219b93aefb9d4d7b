use std::fs::{self, File};
use std::os::unix::fs::FileExt;
use std::path::Path;

use log::{debug, info};

use super::{BootType, IsoInfo};
use crate::config::{Config, InspectTool};
use crate::partition::mbr;
use crate::privilege::{Invocation, tool_available};

const ISO_SECTOR: u64 = 2048;
/// The volume descriptor set starts at sector 16.
const DESCRIPTOR_START: u64 = 16;
const MAX_DESCRIPTORS: u64 = 100;
const STANDARD_ID: &[u8; 5] = b"CD001";
const EL_TORITO_ID: &[u8] = b"EL TORITO SPECIFICATION";

const BOOT_RECORD: u8 = 0;
const PRIMARY: u8 = 1;
const TERMINATOR: u8 = 255;

const WINDOWS_MARKERS: &[&str] = &["bootmgr", "sources/install.wim", "sources/install.esd"];
const LINUX_MARKERS: &[&str] = &["casper", "isolinux", "syslinux", "vmlinuz", "initrd", "/live/"];

#[derive(Debug, Default, PartialEq, Eq)]
struct Descriptors {
    label: Option<String>,
    el_torito: bool,
}

fn volume_id(sector: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(&sector[40..72]);
    let text = text.trim_matches(|c: char| c == ' ' || c == '\0');
    (!text.is_empty()).then(|| text.to_string())
}

fn read_descriptors(file: &File) -> Descriptors {
    let mut found = Descriptors::default();
    let mut sector = [0u8; ISO_SECTOR as usize];
    for index in 0..MAX_DESCRIPTORS {
        if file
            .read_exact_at(&mut sector, (DESCRIPTOR_START + index) * ISO_SECTOR)
            .is_err()
            || &sector[1..6] != STANDARD_ID
        {
            break;
        }
        match sector[0] {
            BOOT_RECORD if sector[7..].starts_with(EL_TORITO_ID) => found.el_torito = true,
            PRIMARY if found.label.is_none() => found.label = volume_id(&sector),
            TERMINATOR => break,
            _ => {}
        }
    }
    found
}

/// An MBR with a used entry, or a GPT header at LBA 1.
fn has_partition_table(file: &File) -> bool {
    let mut head = [0u8; 1024];
    if file.read_exact_at(&mut head, 0).is_err() {
        return false;
    }
    let mut sector0 = [0u8; mbr::SECTOR_LEN];
    sector0.copy_from_slice(&head[..mbr::SECTOR_LEN]);
    let mbr_used = mbr::parse(&sector0).is_some_and(|t| t.partitions.iter().any(|p| p.is_used()));
    mbr_used || &head[512..520] == b"EFI PART"
}

fn stdout_of(invocation: Invocation) -> Option<String> {
    let output = invocation.output_unprivileged().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).into_owned();
    (!text.trim().is_empty()).then_some(text)
}

/// `isoinfo -d`: the volume id and whether an El Torito catalog is reported.
fn isoinfo_report(path: &Path, config: &Config) -> Option<(Option<String>, bool)> {
    if !config.inspect_tools.contains(&InspectTool::Isoinfo) || !tool_available("isoinfo") {
        return None;
    }
    let report = stdout_of(Invocation::new("isoinfo").args(["-d", "-i"]).arg(path))?;
    let label = report
        .lines()
        .find_map(|l| l.strip_prefix("Volume id:"))
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string);
    let el_torito = report.contains("El Torito") || report.contains("Eltorito");
    Some((label, el_torito))
}

fn file_says_hybrid(path: &Path) -> bool {
    tool_available("file")
        && stdout_of(Invocation::new("file").arg("-b").arg(path))
            .is_some_and(|t| t.to_ascii_lowercase().contains("hybrid"))
}

/// Brings a listing line to the form `/DIR/NAME`.
fn normalize(line: &str) -> Option<String> {
    let mut entry = line.trim().trim_matches(|c| c == '\'' || c == '"');
    entry = entry.strip_prefix("./").unwrap_or(entry);
    if let Some((name, version)) = entry.rsplit_once(';')
        && !version.is_empty()
        && version.bytes().all(|b| b.is_ascii_digit())
    {
        // Plain ISO 9660 names end in "." when they have no extension.
        entry = name.strip_suffix('.').unwrap_or(name);
    }
    let entry = entry.trim_end_matches('/');
    if entry.is_empty() || entry == "." {
        return None;
    }
    Some(if entry.starts_with('/') {
        entry.to_string()
    } else {
        format!("/{entry}")
    })
}

fn listing(tool: InspectTool, path: &Path) -> Option<Vec<String>> {
    let text = match tool {
        InspectTool::Isoinfo => stdout_of(Invocation::new("isoinfo").args(["-J", "-f", "-i"]).arg(path))
            .or_else(|| stdout_of(Invocation::new("isoinfo").args(["-f", "-i"]).arg(path)))?,
        InspectTool::Xorriso => stdout_of(
            Invocation::new("xorriso")
                .arg("-indev")
                .arg(path)
                .args(["-find", "/"]),
        )?,
        InspectTool::Bsdtar => stdout_of(Invocation::new("bsdtar").arg("-tf").arg(path))?,
        InspectTool::SevenZip => {
            let text = stdout_of(Invocation::new("7z").args(["l", "-ba", "-slt"]).arg(path))?;
            text.lines()
                .filter_map(|l| l.strip_prefix("Path = "))
                .collect::<Vec<_>>()
                .join("\n")
        }
    };
    let entries: Vec<String> = text.lines().filter_map(normalize).collect();
    (!entries.is_empty()).then_some(entries)
}

/// The image's file list from the first inspection tool that produces one.
/// Empty when none is installed.
pub fn list_files(path: &Path, config: &Config) -> Vec<String> {
    for &tool in &config.inspect_tools {
        if !tool_available(tool.program()) {
            continue;
        }
        if let Some(entries) = listing(tool, path) {
            debug!("{} listed {} entries", tool.program(), entries.len());
            return entries;
        }
        debug!("{} could not list {}", tool.program(), path.display());
    }
    debug!("no inspection tool listed {}", path.display());
    Vec::new()
}

fn is_efi_boot(entry: &str) -> bool {
    let entry = entry.to_ascii_lowercase();
    entry == "/efi/boot" || entry.starts_with("/efi/boot/")
}

fn mentions(entries: &[String], markers: &[&str]) -> bool {
    entries.iter().any(|e| {
        let e = e.to_ascii_lowercase();
        markers.iter().any(|m| e.contains(m))
    })
}

fn classify(el_torito: bool, efi: bool, hybrid: bool) -> BootType {
    match (el_torito, efi) {
        (true, true) => BootType::Hybrid,
        (false, true) => BootType::Uefi,
        (true, false) => BootType::Bios,
        (false, false) if hybrid => BootType::Hybrid,
        (false, false) => BootType::Unknown,
    }
}

/// Inspects an image without mounting it. `None` when `path` is not a
/// readable regular file; missing inspection tools only leave flags unset.
pub fn analyze(path: &Path, config: &Config) -> Option<IsoInfo> {
    let meta = fs::metadata(path).ok().filter(|m| m.is_file())?;
    let file = File::open(path).ok()?;

    let Descriptors {
        mut label,
        el_torito: mut has_eltorito,
    } = read_descriptors(&file);
    if (label.is_none() || !has_eltorito)
        && let Some((report_label, report_el_torito)) = isoinfo_report(path, config)
    {
        label = label.or(report_label);
        has_eltorito |= report_el_torito;
    }

    let entries = list_files(path, config);
    let has_efi = entries.iter().any(|e| is_efi_boot(e));
    let is_hybrid =
        has_partition_table(&file) || (config.file_classifier && file_says_hybrid(path));

    let info = IsoInfo {
        path: path.to_path_buf(),
        size: meta.len(),
        label,
        boot_type: classify(has_eltorito, has_efi, is_hybrid),
        has_efi,
        has_eltorito,
        is_hybrid,
        is_windows: mentions(&entries, WINDOWS_MARKERS),
        is_linux: mentions(&entries, LINUX_MARKERS),
    };
    info!(
        "{}: {} ({} bytes, label {:?})",
        path.display(),
        info.boot_type,
        info.size,
        info.label
    );
    Some(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn descriptor(kind: u8, body: &[(usize, &[u8])]) -> Vec<u8> {
        let mut sector = vec![0u8; ISO_SECTOR as usize];
        sector[0] = kind;
        sector[1..6].copy_from_slice(STANDARD_ID);
        sector[6] = 1;
        for (at, bytes) in body {
            sector[*at..*at + bytes.len()].copy_from_slice(bytes);
        }
        sector
    }

    fn image(descriptors: &[Vec<u8>]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; (DESCRIPTOR_START * ISO_SECTOR) as usize])
            .unwrap();
        for d in descriptors {
            file.write_all(d).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn reads_label_and_boot_record() {
        let mut label = [b' '; 32];
        label[..11].copy_from_slice(b"UBUNTU 24_4");
        let img = image(&[
            descriptor(PRIMARY, &[(40, &label[..])]),
            descriptor(BOOT_RECORD, &[(7, EL_TORITO_ID)]),
            descriptor(TERMINATOR, &[]),
        ]);
        let found = read_descriptors(img.as_file());
        assert_eq!(found.label.as_deref(), Some("UBUNTU 24_4"));
        assert!(found.el_torito);
    }

    #[test]
    fn stops_at_terminator_and_bad_ids() {
        let img = image(&[
            descriptor(TERMINATOR, &[]),
            descriptor(BOOT_RECORD, &[(7, EL_TORITO_ID)]),
        ]);
        assert_eq!(read_descriptors(img.as_file()), Descriptors::default());

        let not_iso = tempfile::NamedTempFile::new().unwrap();
        not_iso.as_file().set_len(64 * 1024).unwrap();
        assert_eq!(read_descriptors(not_iso.as_file()), Descriptors::default());
    }

    #[test]
    fn detects_embedded_partition_tables() {
        let mut head = vec![0u8; 4096];
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().write_all_at(&head, 0).unwrap();
        assert!(!has_partition_table(file.as_file()));

        head[512..520].copy_from_slice(b"EFI PART");
        file.as_file().write_all_at(&head, 0).unwrap();
        assert!(has_partition_table(file.as_file()));

        head[512..520].fill(0);
        head[446 + 4] = 0x17;
        head[446 + 12] = 1;
        head[510] = 0x55;
        head[511] = 0xaa;
        file.as_file().write_all_at(&head, 0).unwrap();
        assert!(has_partition_table(file.as_file()));
    }

    #[test]
    fn normalizes_listing_lines() {
        assert_eq!(normalize("/EFI/BOOT/BOOTX64.EFI;1").as_deref(), Some("/EFI/BOOT/BOOTX64.EFI"));
        assert_eq!(normalize("/BOOTMGR.;1").as_deref(), Some("/BOOTMGR"));
        assert_eq!(normalize("'/EFI/BOOT'").as_deref(), Some("/EFI/BOOT"));
        assert_eq!(normalize("./casper/vmlinuz").as_deref(), Some("/casper/vmlinuz"));
        assert_eq!(normalize("EFI/BOOT/").as_deref(), Some("/EFI/BOOT"));
        assert_eq!(normalize("  "), None);
        assert_eq!(normalize("."), None);
    }

    #[test]
    fn efi_boot_matches_directory_and_children_only() {
        assert!(is_efi_boot("/EFI/BOOT"));
        assert!(is_efi_boot("/efi/boot/grubx64.efi"));
        assert!(!is_efi_boot("/EFI/BOOTLOADER"));
        assert!(!is_efi_boot("/EFI/ubuntu/shimx64.efi"));
    }

    #[test]
    fn os_family_markers() {
        let windows = vec!["/bootmgr".to_string(), "/sources/install.WIM".to_string()];
        let linux = vec!["/casper/vmlinuz".to_string(), "/boot/grub/grub.cfg".to_string()];
        assert!(mentions(&windows, WINDOWS_MARKERS));
        assert!(!mentions(&windows, LINUX_MARKERS));
        assert!(mentions(&linux, LINUX_MARKERS));
        assert!(!mentions(&linux, WINDOWS_MARKERS));
    }

    #[test]
    fn classification_table() {
        assert_eq!(classify(true, true, false), BootType::Hybrid);
        assert_eq!(classify(false, true, false), BootType::Uefi);
        assert_eq!(classify(true, false, true), BootType::Bios);
        assert_eq!(classify(false, false, true), BootType::Hybrid);
        assert_eq!(classify(false, false, false), BootType::Unknown);
    }

    #[test]
    fn directories_are_not_images() {
        let dir = tempfile::tempdir().unwrap();
        assert!(analyze(dir.path(), &Config::default()).is_none());
        assert!(analyze(&dir.path().join("missing.iso"), &Config::default()).is_none());
    }
}
