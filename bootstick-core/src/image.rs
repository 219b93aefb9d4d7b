//! Compressed raw images.
//!
//! `dd` needs a plain image, so `.gz`, `.xz` and `.zst` files are unpacked to
//! a temporary file first. The temporary file lives as long as the returned
//! [`PreparedImage`].

use std::cell::Cell;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use flate2::read::GzDecoder;
use log::{debug, info};
use tempfile::TempPath;
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

use crate::cancel::CancelSignal;
use crate::error::{Error, IoContext, Result};
use crate::progress::{Phase, ProgressEvent};

const BUFFER_SIZE: usize = 1024 * 1024;
/// Progress is reported at most once per this many input bytes.
const REPORT_STEP: u64 = 4 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    /// Guessed from the file extension.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "gz" | "gzip" => Compression::Gzip,
            "xz" => Compression::Xz,
            "zst" | "zstd" => Compression::Zstd,
            _ => Compression::None,
        }
    }
}

/// An image ready for a raw copy, deleting its temporary file on drop.
#[derive(Debug)]
pub struct PreparedImage {
    path: PathBuf,
    temp: Option<TempPath>,
}

impl PreparedImage {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }
}

impl AsRef<Path> for PreparedImage {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Counts bytes pulled through a reader the decoder owns.
struct Counted<R> {
    inner: R,
    count: Rc<Cell<u64>>,
}

impl<R: Read> Read for Counted<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.set(self.count.get() + n as u64);
        Ok(n)
    }
}

/// Returns `image` itself when it is not compressed, otherwise a temporary
/// decompressed copy.
pub fn prepare(
    image: &Path,
    cancel: &CancelSignal,
    mut on_progress: impl FnMut(ProgressEvent),
) -> Result<PreparedImage> {
    let compression = Compression::from_path(image);
    if compression == Compression::None {
        return Ok(PreparedImage {
            path: image.to_path_buf(),
            temp: None,
        });
    }

    let input = File::open(image).context(|| format!("opening {}", image.display()))?;
    let input_len = input
        .metadata()
        .context(|| format!("reading {}", image.display()))?
        .len();
    let consumed = Rc::new(Cell::new(0));
    let counted = Counted {
        inner: BufReader::new(input),
        count: Rc::clone(&consumed),
    };
    let mut reader: Box<dyn Read> = match compression {
        Compression::Gzip => Box::new(GzDecoder::new(counted)),
        Compression::Xz => Box::new(XzDecoder::new(counted)),
        Compression::Zstd => Box::new(
            ZstdDecoder::new(counted).context(|| "starting the zstd decoder".to_string())?,
        ),
        Compression::None => Box::new(counted),
    };

    info!("decompressing {} ({compression:?})", image.display());
    let mut temp = tempfile::Builder::new()
        .prefix("bootstick-")
        .suffix(".img")
        .tempfile()
        .context(|| "creating a temporary image".to_string())?;
    let mut produced: u64 = 0;
    {
        let mut writer = BufWriter::new(temp.as_file_mut());
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut reported = 0;
        on_progress(ProgressEvent::measured(Phase::Decompressing, 0, input_len, None));
        loop {
            cancel.check()?;
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(Error::io(format!("decompressing {}", image.display()), e));
                }
            };
            writer
                .write_all(&buffer[..n])
                .context(|| "writing the temporary image".to_string())?;
            produced += n as u64;
            if consumed.get() - reported >= REPORT_STEP {
                reported = consumed.get();
                on_progress(ProgressEvent::measured(
                    Phase::Decompressing,
                    reported,
                    input_len,
                    None,
                ));
            }
        }
        writer
            .flush()
            .context(|| "writing the temporary image".to_string())?;
    }
    on_progress(ProgressEvent::measured(
        Phase::Decompressing,
        input_len,
        input_len,
        None,
    ));
    debug!("decompressed {input_len} bytes into {produced}");

    let temp_path = temp.into_temp_path();
    Ok(PreparedImage {
        path: temp_path.to_path_buf(),
        temp: Some(temp_path),
    })
}
