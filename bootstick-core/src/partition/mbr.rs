//! The classic DOS partition table in sector 0.

use super::{MIB, MBR_LINUX, PartitionEntry, PartitionLayout, PartitionType, align_up, random_bytes};
use crate::disk::Disk;
use crate::error::{Error, Result};
use crate::types::PartitionStyle;

pub const SECTOR_LEN: usize = 512;
const DISK_SIGNATURE_OFFSET: usize = 440;
const TABLE_OFFSET: usize = 446;
const ENTRY_LEN: usize = 16;
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xaa];
const ACTIVE: u8 = 0x80;
const PROTECTIVE: u8 = 0xee;
/// CHS address meaning "use the LBA fields".
const CHS_LBA_ONLY: [u8; 3] = [0xfe, 0xff, 0xff];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MbrPartition {
    pub status: u8,
    pub kind: u8,
    pub first_lba: u32,
    pub sectors: u32,
}

impl MbrPartition {
    pub fn is_used(&self) -> bool {
        self.kind != 0 && self.sectors != 0
    }

    /// One past the last sector.
    fn end(&self) -> u64 {
        u64::from(self.first_lba) + u64::from(self.sectors)
    }

    fn decode(raw: &[u8]) -> Self {
        MbrPartition {
            status: raw[0],
            kind: raw[4],
            first_lba: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            sectors: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
        }
    }

    fn encode(&self, raw: &mut [u8]) {
        raw.fill(0);
        if !self.is_used() {
            return;
        }
        raw[0] = self.status;
        raw[1..4].copy_from_slice(&CHS_LBA_ONLY);
        raw[4] = self.kind;
        raw[5..8].copy_from_slice(&CHS_LBA_ONLY);
        raw[8..12].copy_from_slice(&self.first_lba.to_le_bytes());
        raw[12..16].copy_from_slice(&self.sectors.to_le_bytes());
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MbrTable {
    pub disk_signature: u32,
    pub partitions: [MbrPartition; 4],
}

impl MbrTable {
    /// A GPT protective MBR rather than a real DOS table.
    pub fn is_protective(&self) -> bool {
        self.partitions.iter().any(|p| p.kind == PROTECTIVE)
    }

    /// Writes the table into `sector`, leaving the boot code area alone.
    pub fn encode(&self, sector: &mut [u8; SECTOR_LEN]) {
        sector[DISK_SIGNATURE_OFFSET..DISK_SIGNATURE_OFFSET + 4]
            .copy_from_slice(&self.disk_signature.to_le_bytes());
        sector[444..446].fill(0);
        for (i, part) in self.partitions.iter().enumerate() {
            let at = TABLE_OFFSET + i * ENTRY_LEN;
            part.encode(&mut sector[at..at + ENTRY_LEN]);
        }
        sector[510..512].copy_from_slice(&BOOT_SIGNATURE);
    }
}

/// Decodes sector 0; `None` without the `55 AA` boot signature.
pub fn parse(sector: &[u8; SECTOR_LEN]) -> Option<MbrTable> {
    if sector[510..512] != BOOT_SIGNATURE {
        return None;
    }
    let mut partitions = [MbrPartition::default(); 4];
    for (i, part) in partitions.iter_mut().enumerate() {
        let at = TABLE_OFFSET + i * ENTRY_LEN;
        *part = MbrPartition::decode(&sector[at..at + ENTRY_LEN]);
    }
    let sig = &sector[DISK_SIGNATURE_OFFSET..DISK_SIGNATURE_OFFSET + 4];
    Some(MbrTable {
        disk_signature: u32::from_le_bytes([sig[0], sig[1], sig[2], sig[3]]),
        partitions,
    })
}

pub(crate) fn read_sector0(disk: &Disk) -> Result<[u8; SECTOR_LEN]> {
    let mut sector = [0u8; SECTOR_LEN];
    disk.read_at(&mut sector, 0)
        .map_err(|e| Error::Partition(format!("{}: reading sector 0: {e}", disk.path().display())))?;
    Ok(sector)
}

fn write_sector0(disk: &Disk, sector: &[u8; SECTOR_LEN]) -> Result<()> {
    disk.write_at(sector, 0)
        .map_err(|e| Error::Partition(format!("{}: writing sector 0: {e}", disk.path().display())))
}

/// Writes an empty table with a random disk signature.
pub fn create_table(disk: &Disk) -> Result<()> {
    let mut signature = 0;
    while signature == 0 {
        signature = u32::from_le_bytes(random_bytes::<4>());
    }
    let table = MbrTable {
        disk_signature: signature,
        partitions: [MbrPartition::default(); 4],
    };
    let mut sector = [0u8; SECTOR_LEN];
    table.encode(&mut sector);
    write_sector0(disk, &sector)
}

fn type_code(entry: &PartitionEntry) -> u8 {
    match entry.resolved_type(PartitionStyle::Mbr) {
        PartitionType::Mbr(code) => code,
        PartitionType::Gpt(_) => MBR_LINUX,
    }
}

/// Fills primary slot `slot` (1..=4).
pub fn add(disk: &Disk, entry: &PartitionEntry, slot: u32) -> Result<()> {
    let path = disk.path().display();
    if !(1..=4).contains(&slot) {
        return Err(Error::InvalidInput(format!(
            "MBR has four primary slots, not {slot}"
        )));
    }
    let mut sector = read_sector0(disk)?;
    let mut table = parse(&sector)
        .filter(|t| !t.is_protective())
        .ok_or_else(|| Error::Partition(format!("{path}: no MBR partition table")))?;
    let idx = slot as usize - 1;
    if table.partitions[idx].is_used() {
        return Err(Error::Partition(format!("{path}: partition {slot} already exists")));
    }

    let bs = disk.sector_size();
    let size = disk.size().map_err(|e| Error::Partition(format!("{path}: {e}")))?;
    // The table cannot address past 2^32 sectors.
    let limit = (size / bs).min(u64::from(u32::MAX) + 1);
    let align = (MIB / bs).max(1);

    let used: Vec<MbrPartition> = table.partitions.iter().copied().filter(|p| p.is_used()).collect();
    let start = if entry.start == 0 {
        let next_free = used.iter().map(MbrPartition::end).max().unwrap_or(0);
        align_up(next_free.max(align), align)
    } else {
        entry.start / bs
    };
    let count = if entry.size == 0 {
        limit.saturating_sub(start)
    } else {
        entry.size.div_ceil(bs)
    };
    if start == 0 || count == 0 || start + count > limit {
        return Err(Error::Partition(format!(
            "{path}: partition {slot} does not fit on the device"
        )));
    }
    if used.iter().any(|p| start < p.end() && u64::from(p.first_lba) < start + count) {
        return Err(Error::Partition(format!(
            "{path}: partition {slot} overlaps an existing partition"
        )));
    }

    table.partitions[idx] = MbrPartition {
        status: if entry.bootable { ACTIVE } else { 0 },
        kind: type_code(entry),
        first_lba: start as u32,
        sectors: count as u32,
    };
    table.encode(&mut sector);
    write_sector0(disk, &sector)
}

pub fn read(disk: &Disk) -> Result<PartitionLayout> {
    let sector = read_sector0(disk)?;
    let table = parse(&sector).ok_or_else(|| {
        Error::Partition(format!("{}: no MBR partition table", disk.path().display()))
    })?;
    let bs = disk.sector_size();
    let entries = table
        .partitions
        .iter()
        .filter(|p| p.is_used())
        .map(|p| {
            let mut entry = PartitionEntry::observed(
                u64::from(p.first_lba) * bs,
                u64::from(p.sectors) * bs,
                PartitionType::Mbr(p.kind),
            );
            entry.bootable = p.status == ACTIVE;
            entry
        })
        .collect();
    Ok(PartitionLayout {
        style: PartitionStyle::Mbr,
        entries,
    })
}
