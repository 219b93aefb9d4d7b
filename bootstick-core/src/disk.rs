//! Raw access to a block device (or an image file standing in for one).

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use nix::{ioctl_none, ioctl_read, ioctl_read_bad};

ioctl_read!(blkgetsize64, 0x12, 114, u64);
ioctl_read_bad!(blksszget, 0x1268, libc::c_int);
ioctl_none!(blkrrpart, 0x12, 95);

pub const DEFAULT_SECTOR_SIZE: u64 = 512;

/// Memory alignment of direct-mode bounce buffers. Covers every logical block
/// size the kernel will ask for.
const DIRECT_ALIGN: usize = 4096;

/// A heap buffer whose usable region starts on an `align` boundary.
struct AlignedBuf {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedBuf {
    fn new(len: usize, align: usize) -> Self {
        let storage = vec![0u8; len + align];
        let offset = storage.as_ptr().align_offset(align);
        AlignedBuf {
            storage,
            offset,
            len,
        }
    }

    fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.len]
    }
}

/// An open device. Descriptors are never shared: each component that needs
/// the device opens its own `Disk`.
#[derive(Debug)]
pub struct Disk {
    file: File,
    path: PathBuf,
    direct: bool,
    /// Offset and length granularity of direct transfers: the logical sector
    /// size, so a span never reaches past the last sector.
    block: u64,
}

impl Disk {
    /// Opens `path` read-only, or read-write with `O_SYNC`. `O_DIRECT` is tried
    /// first and dropped silently when the target refuses it.
    pub fn open(path: &Path, write: bool) -> io::Result<Disk> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(write);
        let flags = if write { libc::O_SYNC } else { 0 };

        let direct = opts.clone().custom_flags(flags | libc::O_DIRECT).open(path);
        let (file, direct) = match direct {
            Ok(file) => (file, true),
            Err(e) => {
                debug!("{}: O_DIRECT unavailable ({e}), using buffered I/O", path.display());
                (opts.custom_flags(flags).open(path)?, false)
            }
        };

        let mut disk = Disk {
            file,
            path: path.to_path_buf(),
            direct,
            block: DEFAULT_SECTOR_SIZE,
        };
        disk.block = disk.sector_size();
        Ok(disk)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_direct(&self) -> bool {
        self.direct
    }

    pub fn is_block_device(&self) -> bool {
        self.file
            .metadata()
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }

    /// Reads exactly `buf.len()` bytes at `offset`. Hitting the end of the
    /// device early is `UnexpectedEof`.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if !self.direct {
            let n = read_full(&self.file, buf, offset)?;
            return check_eof(n, buf.len());
        }

        let (start, len) = aligned_span(offset, buf.len(), self.block);
        let mut bounce = AlignedBuf::new(len, DIRECT_ALIGN);
        let n = read_full(&self.file, bounce.as_mut_slice(), start)?;
        let skip = (offset - start) as usize;
        check_eof(n.saturating_sub(skip), buf.len())?;
        buf.copy_from_slice(&bounce.as_slice()[skip..skip + buf.len()]);
        Ok(())
    }

    /// Writes all of `buf` at `offset`.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if !self.direct {
            return self.file.write_all_at(buf, offset);
        }

        let (start, len) = aligned_span(offset, buf.len(), self.block);
        let skip = (offset - start) as usize;
        let mut bounce = AlignedBuf::new(len, DIRECT_ALIGN);
        if skip != 0 || len != buf.len() {
            // Partial blocks at either edge keep their current contents.
            read_full(&self.file, bounce.as_mut_slice(), start)?;
        }
        bounce.as_mut_slice()[skip..skip + buf.len()].copy_from_slice(buf);
        self.file.write_all_at(bounce.as_slice(), start)
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Takes an exclusive, non-blocking advisory lock.
    pub fn lock(&self) -> io::Result<()> {
        flock(&self.file, libc::LOCK_EX | libc::LOCK_NB)
    }

    pub fn unlock(&self) -> io::Result<()> {
        flock(&self.file, libc::LOCK_UN)
    }

    /// Size in bytes, from `BLKGETSIZE64` or, for image files, the file length.
    pub fn size(&self) -> io::Result<u64> {
        let mut size: u64 = 0;
        match unsafe { blkgetsize64(self.file.as_raw_fd(), &mut size) } {
            Ok(_) => Ok(size),
            Err(_) => Ok(self.file.metadata()?.len()),
        }
    }

    /// Logical sector size, 512 when the device does not say.
    pub fn sector_size(&self) -> u64 {
        let mut size: libc::c_int = 0;
        match unsafe { blksszget(self.file.as_raw_fd(), &mut size) } {
            Ok(_) if size > 0 => size as u64,
            _ => DEFAULT_SECTOR_SIZE,
        }
    }

    /// Asks the kernel to re-read the partition table. A busy device is not an
    /// error: the kernel picks the table up once the holders let go.
    pub fn reread_partitions(&self) -> io::Result<()> {
        if !self.is_block_device() {
            return Ok(());
        }
        match unsafe { blkrrpart(self.file.as_raw_fd()) } {
            Ok(_) => Ok(()),
            Err(nix::errno::Errno::EBUSY) => {
                warn!(
                    "{}: partition table re-read deferred, device busy",
                    self.path.display()
                );
                Ok(())
            }
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

fn flock(file: &File, op: libc::c_int) -> io::Result<()> {
    if unsafe { libc::flock(file.as_raw_fd(), op) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// The `align`-aligned range covering `len` bytes at `offset`.
fn aligned_span(offset: u64, len: usize, align: u64) -> (u64, usize) {
    let start = offset / align * align;
    let end = (offset + len as u64).div_ceil(align) * align;
    (start, (end - start) as usize)
}

/// Positioned read that retries `EINTR` and stops only at end of file.
fn read_full(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

fn check_eof(got: usize, wanted: usize) -> io::Result<()> {
    if got < wanted {
        Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short read: {got} of {wanted} bytes"),
        ))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(len: u64) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(len).unwrap();
        file
    }

    #[test]
    fn unaligned_write_then_read_back() {
        let img = image(64 * 1024);
        let disk = Disk::open(img.path(), true).unwrap();
        disk.write_at(b"hello, disk", 510).unwrap();

        let mut back = [0u8; 11];
        disk.read_at(&mut back, 510).unwrap();
        assert_eq!(&back, b"hello, disk");

        let mut around = [0xffu8; 2];
        disk.read_at(&mut around, 508).unwrap();
        assert_eq!(around, [0, 0]);
    }

    #[test]
    fn read_past_end_is_unexpected_eof() {
        let img = image(4096);
        let disk = Disk::open(img.path(), false).unwrap();
        let mut buf = [0u8; 16];
        let err = disk.read_at(&mut buf, 4090).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn image_file_geometry_falls_back() {
        let img = image(1 << 20);
        let disk = Disk::open(img.path(), false).unwrap();
        assert_eq!(disk.size().unwrap(), 1 << 20);
        assert_eq!(disk.sector_size(), DEFAULT_SECTOR_SIZE);
        assert!(!disk.is_block_device());
        disk.reread_partitions().unwrap();
    }

    #[test]
    fn lock_is_exclusive_across_descriptors() {
        let img = image(4096);
        let a = Disk::open(img.path(), true).unwrap();
        let b = Disk::open(img.path(), true).unwrap();
        a.lock().unwrap();
        assert!(b.lock().is_err());
        a.unlock().unwrap();
        b.lock().unwrap();
    }

    #[test]
    fn span_rounds_outward() {
        assert_eq!(aligned_span(0, 4096, 4096), (0, 4096));
        assert_eq!(aligned_span(510, 11, 4096), (0, 4096));
        assert_eq!(aligned_span(4095, 2, 4096), (0, 8192));
        assert_eq!(aligned_span(510, 11, 512), (0, 1024));
        assert_eq!(aligned_span(1024, 512, 512), (1024, 512));
    }

    #[test]
    fn last_sector_write_stays_inside_the_device() {
        // 2049 sectors: a multiple of 512 but not of 4096.
        let len = (1 << 20) + 512;
        let img = image(len);
        let disk = Disk::open(img.path(), true).unwrap();
        disk.write_at(&[0xaa; 512], len - 512).unwrap();
        disk.write_at(b"tail", len - 4).unwrap();

        assert_eq!(img.as_file().metadata().unwrap().len(), len);
        let mut back = [0u8; 512];
        disk.read_at(&mut back, len - 512).unwrap();
        assert!(back[..508].iter().all(|&b| b == 0xaa));
        assert_eq!(&back[508..], b"tail");
    }
}
