//! Parsing the kernel mount table.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
}

impl MountEntry {
    /// Base name of the mount source (`sdb1` for `/dev/sdb1`).
    pub fn source_name(&self) -> &str {
        self.source.rsplit('/').next().unwrap_or(&self.source)
    }

    /// Whether this mount belongs to the device called `device_name` or one of
    /// its partitions.
    pub fn belongs_to(&self, device_name: &str) -> bool {
        !device_name.is_empty() && self.source_name().starts_with(device_name)
    }
}

pub fn read_mounts(path: &Path) -> io::Result<Vec<MountEntry>> {
    Ok(parse_mounts(&fs::read_to_string(path)?))
}

/// Parses `/proc/mounts`-style text. Malformed lines are skipped.
pub fn parse_mounts(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = unescape(fields.next()?);
            let target = PathBuf::from(unescape(fields.next()?));
            let fstype = fields.next()?.to_string();
            Some(MountEntry {
                source,
                target,
                fstype,
            })
        })
        .collect()
}

/// Every mountpoint attributed to `device_name`.
pub fn mountpoints_of(device_name: &str, mounts: &[MountEntry]) -> Vec<PathBuf> {
    mounts
        .iter()
        .filter(|m| m.belongs_to(device_name))
        .map(|m| m.target.clone())
        .collect()
}

/// Decodes the `\ooo` octal escapes the kernel uses for whitespace and
/// backslashes in mount fields.
fn unescape(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let code = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
            if let Ok(byte) = u8::try_from(code) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3 && digits.iter().all(|d| (b'0'..=b'7').contains(d))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
/dev/nvme0n1p2 / ext4 rw,relatime 0 0
/dev/nvme0n1p1 /boot/efi vfat rw 0 0
/dev/sdb1 /media/alice/MY\\040STICK vfat rw,nosuid 0 0
tmpfs /run tmpfs rw 0 0
broken-line
";

    #[test]
    fn parses_and_unescapes() {
        let mounts = parse_mounts(TABLE);
        assert_eq!(mounts.len(), 4);
        assert_eq!(mounts[2].target, PathBuf::from("/media/alice/MY STICK"));
        assert_eq!(mounts[2].fstype, "vfat");
        assert_eq!(mounts[2].source_name(), "sdb1");
    }

    #[test]
    fn attributes_partitions_to_their_disk() {
        let mounts = parse_mounts(TABLE);
        assert_eq!(
            mountpoints_of("nvme0n1", &mounts),
            vec![PathBuf::from("/"), PathBuf::from("/boot/efi")]
        );
        assert_eq!(
            mountpoints_of("sdb", &mounts),
            vec![PathBuf::from("/media/alice/MY STICK")]
        );
        assert!(mountpoints_of("sdc", &mounts).is_empty());
    }

    #[test]
    fn unescape_leaves_non_escapes_alone() {
        assert_eq!(unescape(r"a\134b"), r"a\b");
        assert_eq!(unescape(r"tab\011x"), "tab\tx");
        assert_eq!(unescape(r"odd\9"), r"odd\9");
        assert_eq!(unescape(r"end\04"), r"end\04");
    }
}
