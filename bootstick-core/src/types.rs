//! Small value types shared across the pipeline.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A filesystem the format stage knows how to name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FsType {
    Fat16,
    Fat32,
    Ntfs,
    Udf,
    ExFat,
    ReFs,
    Ext2,
    Ext3,
    Ext4,
}

impl FsType {
    pub const ALL: [FsType; 9] = [
        FsType::Fat16,
        FsType::Fat32,
        FsType::Ntfs,
        FsType::Udf,
        FsType::ExFat,
        FsType::ReFs,
        FsType::Ext2,
        FsType::Ext3,
        FsType::Ext4,
    ];

    pub fn is_fat(self) -> bool {
        matches!(self, FsType::Fat16 | FsType::Fat32)
    }

    pub fn is_ext(self) -> bool {
        matches!(self, FsType::Ext2 | FsType::Ext3 | FsType::Ext4)
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FsType::Fat16 => "FAT16",
            FsType::Fat32 => "FAT32",
            FsType::Ntfs => "NTFS",
            FsType::Udf => "UDF",
            FsType::ExFat => "exFAT",
            FsType::ReFs => "ReFS",
            FsType::Ext2 => "ext2",
            FsType::Ext3 => "ext3",
            FsType::Ext4 => "ext4",
        };
        f.write_str(name)
    }
}

impl FromStr for FsType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FsType::ALL
            .into_iter()
            .find(|fs| fs.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::InvalidInput(format!("unknown filesystem '{s}'")))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PartitionStyle {
    Mbr,
    Gpt,
}

impl fmt::Display for PartitionStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionStyle::Mbr => f.write_str("MBR"),
            PartitionStyle::Gpt => f.write_str("GPT"),
        }
    }
}

impl FromStr for PartitionStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mbr" | "dos" | "msdos" => Ok(PartitionStyle::Mbr),
            "gpt" => Ok(PartitionStyle::Gpt),
            _ => Err(Error::InvalidInput(format!("unknown partition style '{s}'"))),
        }
    }
}

/// The firmware the provisioned device has to boot on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetFirmware {
    Bios,
    Uefi,
    BiosUefi,
}

impl TargetFirmware {
    pub fn wants_uefi(self) -> bool {
        matches!(self, TargetFirmware::Uefi | TargetFirmware::BiosUefi)
    }
}

impl fmt::Display for TargetFirmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetFirmware::Bios => f.write_str("BIOS"),
            TargetFirmware::Uefi => f.write_str("UEFI"),
            TargetFirmware::BiosUefi => f.write_str("BIOS+UEFI"),
        }
    }
}

impl FromStr for TargetFirmware {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bios" => Ok(TargetFirmware::Bios),
            "uefi" => Ok(TargetFirmware::Uefi),
            "bios+uefi" | "both" | "hybrid" => Ok(TargetFirmware::BiosUefi),
            _ => Err(Error::InvalidInput(format!("unknown target firmware '{s}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_type_parses_case_insensitively() {
        assert_eq!("fat32".parse::<FsType>().unwrap(), FsType::Fat32);
        assert_eq!("EXFAT".parse::<FsType>().unwrap(), FsType::ExFat);
        assert_eq!(" Ext4 ".parse::<FsType>().unwrap(), FsType::Ext4);
        assert!("zfs".parse::<FsType>().is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        for fs in FsType::ALL {
            assert_eq!(fs.to_string().parse::<FsType>().unwrap(), fs);
        }
        assert_eq!("dos".parse::<PartitionStyle>().unwrap(), PartitionStyle::Mbr);
        assert_eq!(
            "BIOS+UEFI".parse::<TargetFirmware>().unwrap(),
            TargetFirmware::BiosUefi
        );
    }
}
