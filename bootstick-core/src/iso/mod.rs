//! ISO images: inspection and the two ways of putting one on a stick.
//!
//! [`analyze`] classifies an image without mounting it. Delivery is either a
//! raw block copy ([`IsoWriter`], [`write_sync`]) or a file-level copy onto an
//! already formatted partition ([`Extractor`]).

use std::fmt;
use std::path::PathBuf;

mod analyzer;
mod extract;
mod writer;

pub use analyzer::{analyze, list_files};
pub use extract::Extractor;
pub use writer::{IsoWriter, WriteEvent, WriteProgress, WriteState, write_sync};
pub(crate) use writer::transfer;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BootType {
    #[default]
    Unknown,
    Bios,
    Uefi,
    /// Boots either way.
    Hybrid,
}

impl fmt::Display for BootType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BootType::Unknown => "not bootable",
            BootType::Bios => "BIOS",
            BootType::Uefi => "UEFI",
            BootType::Hybrid => "BIOS+UEFI",
        })
    }
}

/// What [`analyze`] learned about an image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IsoInfo {
    pub path: PathBuf,
    pub size: u64,
    pub label: Option<String>,
    pub boot_type: BootType,
    /// An `/EFI/BOOT` directory is present.
    pub has_efi: bool,
    /// An El Torito boot catalog is present.
    pub has_eltorito: bool,
    /// The image also carries an MBR or GPT, so it boots when copied raw.
    pub is_hybrid: bool,
    pub is_windows: bool,
    pub is_linux: bool,
}

impl IsoInfo {
    pub fn is_bootable(&self) -> bool {
        self.boot_type != BootType::Unknown
    }
}
