//! GPT tables, built and parsed through `gpt_disk_io`.

use std::io;
use std::str::FromStr;

use gpt_disk_io::{BlockIo, Disk as GptDisk};
use gpt_disk_types::{
    BlockSize, GptHeader, GptPartitionEntryArray, GptPartitionName, GptPartitionType, Lba, LbaLe,
    U32Le,
};
use uguid::Guid;

use super::{MIB, PartitionEntry, PartitionLayout, PartitionType, align_up, random_bytes};
use crate::disk::Disk;
use crate::error::{Error, Result};
use crate::types::PartitionStyle;

const NUM_ENTRIES: u32 = 128;
const ENTRY_LEN: u64 = 128;

/// Adapts a [`Disk`] to the block interface `gpt_disk_io` drives.
struct DiskBlocks<'a> {
    disk: &'a Disk,
    block_size: u64,
    num_blocks: u64,
}

impl<'a> DiskBlocks<'a> {
    fn new(disk: &'a Disk) -> Result<Self> {
        let block_size = disk.sector_size();
        let size = disk.size().map_err(|e| gpt_err(disk, e))?;
        Ok(DiskBlocks {
            disk,
            block_size,
            num_blocks: size / block_size,
        })
    }
}

impl BlockIo for DiskBlocks<'_> {
    type Error = io::Error;

    fn block_size(&self) -> BlockSize {
        BlockSize::new(self.block_size as u32).unwrap_or(BlockSize::BS_512)
    }

    fn num_blocks(&mut self) -> std::result::Result<u64, Self::Error> {
        Ok(self.num_blocks)
    }

    fn read_blocks(&mut self, start_lba: Lba, dst: &mut [u8]) -> std::result::Result<(), Self::Error> {
        self.disk.read_at(dst, start_lba.0 * self.block_size)
    }

    fn write_blocks(&mut self, start_lba: Lba, src: &[u8]) -> std::result::Result<(), Self::Error> {
        self.disk.write_at(src, start_lba.0 * self.block_size)
    }

    fn flush(&mut self) -> std::result::Result<(), Self::Error> {
        self.disk.sync()
    }
}

fn gpt_err(disk: &Disk, e: impl std::fmt::Debug) -> Error {
    Error::Partition(format!("{}: {e:?}", disk.path().display()))
}

fn random_guid() -> Guid {
    Guid::from_random_bytes(random_bytes::<16>())
}

/// Blocks occupied by one copy of the entry array.
fn entry_array_blocks(block_size: u64) -> u64 {
    (u64::from(NUM_ENTRIES) * ENTRY_LEN).div_ceil(block_size)
}

fn entry_storage(block_size: u64) -> Vec<u8> {
    vec![0u8; (entry_array_blocks(block_size) * block_size) as usize]
}

/// Writes the primary header and array, then the backup pair at the end of
/// the device. `header` must describe the primary copy.
fn write_both(
    gpt: &mut GptDisk<DiskBlocks<'_>>,
    disk: &Disk,
    header: &mut GptHeader,
    entries: &GptPartitionEntryArray,
    block_size: u64,
) -> Result<()> {
    let mut block = vec![0u8; block_size as usize];
    let bs = BlockSize::new(block_size as u32).unwrap_or(BlockSize::BS_512);

    header.partition_entry_array_crc32 = entries.calculate_crc32();
    header.update_header_crc32();
    gpt.write_primary_gpt_header(header, &mut block)
        .map_err(|e| gpt_err(disk, e))?;
    gpt.write_gpt_partition_entry_array(entries)
        .map_err(|e| gpt_err(disk, e))?;

    let mut backup = header.clone();
    backup.my_lba = header.alternate_lba;
    backup.alternate_lba = header.my_lba;
    backup.partition_entry_lba =
        LbaLe::from_u64(header.alternate_lba.to_u64() - entry_array_blocks(block_size));
    backup.update_header_crc32();

    let layout = backup
        .get_partition_entry_array_layout()
        .map_err(|e| gpt_err(disk, e))?;
    let primary = entries.storage();
    let mut storage = entry_storage(block_size);
    storage[..primary.len()].copy_from_slice(primary);
    let backup_entries =
        GptPartitionEntryArray::new(layout, bs, &mut storage).map_err(|e| gpt_err(disk, e))?;

    gpt.write_secondary_gpt_header(&backup, &mut block)
        .map_err(|e| gpt_err(disk, e))?;
    gpt.write_gpt_partition_entry_array(&backup_entries)
        .map_err(|e| gpt_err(disk, e))?;
    gpt.flush().map_err(|e| gpt_err(disk, e))
}

/// Writes a protective MBR and an empty GPT (both copies) with a random disk
/// GUID.
pub fn create_table(disk: &Disk) -> Result<()> {
    let blocks = DiskBlocks::new(disk)?;
    let bs = blocks.block_size;
    let n = blocks.num_blocks;
    let array_blocks = entry_array_blocks(bs);
    // MBR, two headers and two arrays, plus at least one usable block.
    if n < 4 + 2 * array_blocks {
        return Err(Error::Partition(format!(
            "{}: device too small for GPT",
            disk.path().display()
        )));
    }

    let mut gpt = GptDisk::new(blocks).map_err(|e| gpt_err(disk, e))?;
    let mut block = vec![0u8; bs as usize];
    gpt.write_protective_mbr(&mut block)
        .map_err(|e| gpt_err(disk, e))?;

    let mut header = GptHeader {
        my_lba: LbaLe::from_u64(1),
        alternate_lba: LbaLe::from_u64(n - 1),
        first_usable_lba: LbaLe::from_u64(2 + array_blocks),
        last_usable_lba: LbaLe::from_u64(n - 2 - array_blocks),
        disk_guid: random_guid(),
        partition_entry_lba: LbaLe::from_u64(2),
        number_of_partition_entries: U32Le::from_u32(NUM_ENTRIES),
        ..Default::default()
    };

    let layout = header
        .get_partition_entry_array_layout()
        .map_err(|e| gpt_err(disk, e))?;
    let mut storage = entry_storage(bs);
    let block_size = BlockSize::new(bs as u32).unwrap_or(BlockSize::BS_512);
    let entries = GptPartitionEntryArray::new(layout, block_size, &mut storage)
        .map_err(|e| gpt_err(disk, e))?;

    write_both(&mut gpt, disk, &mut header, &entries, bs)
}

/// Reads and sanity-checks the primary header.
fn read_header(gpt: &mut GptDisk<DiskBlocks<'_>>, disk: &Disk, bs: u64) -> Result<GptHeader> {
    let mut block = vec![0u8; bs as usize];
    let header = gpt
        .read_primary_gpt_header(&mut block)
        .map_err(|e| gpt_err(disk, e))?;
    if !header.is_signature_valid() || header.calculate_header_crc32() != header.header_crc32 {
        return Err(Error::Partition(format!(
            "{}: invalid GPT header",
            disk.path().display()
        )));
    }
    Ok(header)
}

fn guid_of(part_type: &PartitionType) -> Result<Guid> {
    match part_type {
        PartitionType::Gpt(s) => Guid::from_str(s)
            .map_err(|e| Error::InvalidInput(format!("bad partition type GUID {s}: {e:?}"))),
        PartitionType::Mbr(code) => Err(Error::InvalidInput(format!(
            "MBR type {code:#04x} on a GPT disk"
        ))),
    }
}

/// Fills entry `slot` (1-based) of the existing GPT.
pub fn add(disk: &Disk, entry: &PartitionEntry, slot: u32) -> Result<()> {
    let path = disk.path().display();
    let blocks = DiskBlocks::new(disk)?;
    let bs = blocks.block_size;
    let mut gpt = GptDisk::new(blocks).map_err(|e| gpt_err(disk, e))?;
    let mut header = read_header(&mut gpt, disk, bs)?;
    if slot == 0 || slot > header.number_of_partition_entries.to_u32() {
        return Err(Error::InvalidInput(format!("no GPT entry slot {slot}")));
    }

    let layout = header
        .get_partition_entry_array_layout()
        .map_err(|e| gpt_err(disk, e))?;
    let mut storage = entry_storage(bs);
    let mut entries = gpt
        .read_gpt_partition_entry_array(layout, &mut storage)
        .map_err(|e| gpt_err(disk, e))?;

    let mut used = Vec::new();
    for i in 0..layout.num_entries {
        if let Some(e) = entries.get_partition_entry(i)
            && e.is_used()
        {
            used.push((i, e.starting_lba.to_u64(), e.ending_lba.to_u64()));
        }
    }
    if used.iter().any(|(i, _, _)| *i == slot - 1) {
        return Err(Error::Partition(format!("{path}: partition {slot} already exists")));
    }

    let first_usable = header.first_usable_lba.to_u64();
    let last_usable = header.last_usable_lba.to_u64();
    let align = (MIB / bs).max(1);
    let start = if entry.start == 0 {
        let next_free = used.iter().map(|(_, _, end)| end + 1).max().unwrap_or(0);
        align_up(next_free.max(first_usable), align)
    } else {
        entry.start / bs
    };
    let end = if entry.size == 0 {
        last_usable
    } else {
        start + entry.size.div_ceil(bs) - 1
    };
    if start < first_usable || end > last_usable || end < start {
        return Err(Error::Partition(format!(
            "{path}: partition {slot} does not fit on the device"
        )));
    }
    if used.iter().any(|(_, s, e)| start <= *e && *s <= end) {
        return Err(Error::Partition(format!(
            "{path}: partition {slot} overlaps an existing partition"
        )));
    }

    let type_guid = guid_of(&entry.resolved_type(PartitionStyle::Gpt))?;
    let name = GptPartitionName::from_str(&entry.label)
        .map_err(|e| Error::InvalidInput(format!("partition name {:?}: {e:?}", entry.label)))?;

    let slot_entry = entries
        .get_partition_entry_mut(slot - 1)
        .ok_or_else(|| Error::InvalidInput(format!("no GPT entry slot {slot}")))?;
    slot_entry.partition_type_guid = GptPartitionType(type_guid);
    slot_entry.unique_partition_guid = random_guid();
    slot_entry.starting_lba = LbaLe::from_u64(start);
    slot_entry.ending_lba = LbaLe::from_u64(end);
    slot_entry.name = name;

    write_both(&mut gpt, disk, &mut header, &entries, bs)
}

pub fn read(disk: &Disk) -> Result<PartitionLayout> {
    let blocks = DiskBlocks::new(disk)?;
    let bs = blocks.block_size;
    let mut gpt = GptDisk::new(blocks).map_err(|e| gpt_err(disk, e))?;
    let header = read_header(&mut gpt, disk, bs)?;
    let layout = header
        .get_partition_entry_array_layout()
        .map_err(|e| gpt_err(disk, e))?;
    let mut storage = entry_storage(bs);
    let entries = gpt
        .read_gpt_partition_entry_array(layout, &mut storage)
        .map_err(|e| gpt_err(disk, e))?;

    let mut out = Vec::new();
    for i in 0..layout.num_entries {
        let Some(e) = entries.get_partition_entry(i) else {
            break;
        };
        if !e.is_used() {
            continue;
        }
        let start = e.starting_lba.to_u64();
        let end = e.ending_lba.to_u64();
        let type_guid = e.partition_type_guid.0;
        let mut entry =
            PartitionEntry::observed(start * bs, (end - start + 1) * bs, PartitionType::gpt(type_guid));
        entry.label = e.name.to_string();
        out.push(entry);
    }
    Ok(PartitionLayout {
        style: PartitionStyle::Gpt,
        entries: out,
    })
}
