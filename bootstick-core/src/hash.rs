//! Image digests, for checking a download before writing it.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};

use log::{error, info};
use sha2::{Digest, Sha256, Sha512};

use crate::cancel::{self, CancelHandle, CancelSignal};
use crate::error::{Error, IoContext, Result};
use crate::progress::{Phase, ProgressEvent};

const BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HashAlgorithm::Sha256 => "SHA-256",
            HashAlgorithm::Sha512 => "SHA-512",
        })
    }
}

fn stream<D: Digest>(
    mut reader: impl Read,
    len: u64,
    cancel: &CancelSignal,
    on_progress: &mut dyn FnMut(ProgressEvent),
) -> io::Result<Option<String>> {
    let mut hasher = D::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut done: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
        done += n as u64;
        on_progress(ProgressEvent::measured(Phase::Hashing, done, len, None));
    }
    let hex = hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    Ok(Some(hex))
}

/// Streams `path` through `algorithm` and returns the lower-case hex digest.
pub fn digest_file(
    path: &Path,
    algorithm: HashAlgorithm,
    cancel: &CancelSignal,
    mut on_progress: impl FnMut(ProgressEvent),
) -> Result<String> {
    let file = File::open(path).context(|| format!("opening {}", path.display()))?;
    let len = file
        .metadata()
        .context(|| format!("reading {}", path.display()))?
        .len();
    on_progress(ProgressEvent::measured(Phase::Hashing, 0, len, None));
    let digest = match algorithm {
        HashAlgorithm::Sha256 => stream::<Sha256>(file, len, cancel, &mut on_progress),
        HashAlgorithm::Sha512 => stream::<Sha512>(file, len, cancel, &mut on_progress),
    }
    .context(|| format!("reading {}", path.display()))?
    .ok_or(Error::Cancelled)?;
    info!("{algorithm} of {}: {digest}", path.display());
    Ok(digest)
}

#[derive(Debug)]
pub enum HashEvent {
    Progress(ProgressEvent),
    /// Always the last event.
    Finished(Result<String>),
}

/// A digest running on a worker thread.
pub struct HashJob {
    pub events: Receiver<HashEvent>,
    pub cancel: CancelHandle,
    worker: JoinHandle<()>,
}

impl HashJob {
    pub fn join(self) {
        if self.worker.join().is_err() {
            error!("the hash worker panicked");
        }
    }
}

/// Runs [`digest_file`] on a worker thread.
pub fn spawn(path: PathBuf, algorithm: HashAlgorithm) -> Result<HashJob> {
    let (cancel, signal) = cancel::pair();
    let (tx, events) = mpsc::channel();
    let worker = thread::Builder::new()
        .name("bootstick-hash".into())
        .spawn(move || {
            let result = digest_file(&path, algorithm, &signal, |p| {
                let _ = tx.send(HashEvent::Progress(p));
            });
            let _ = tx.send(HashEvent::Finished(result));
        })
        .context(|| "spawning the hash worker".to_string())?;
    Ok(HashJob {
        events,
        cancel,
        worker,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digests() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"abc").unwrap();
        let never = CancelSignal::never();
        assert_eq!(
            digest_file(file.path(), HashAlgorithm::Sha256, &never, |_| {}).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            digest_file(file.path(), HashAlgorithm::Sha512, &never, |_| {}).unwrap(),
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
             2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        );
    }

    #[test]
    fn spawned_job_finishes_last() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![7u8; 3 * BUFFER_SIZE + 10]).unwrap();
        let job = spawn(file.path().to_path_buf(), HashAlgorithm::Sha256).unwrap();
        let events: Vec<_> = job.events.iter().collect();
        job.join();
        let (last, rest) = events.split_last().unwrap();
        assert!(matches!(last, HashEvent::Finished(Ok(d)) if d.len() == 64));
        assert!(rest.iter().all(|e| matches!(e, HashEvent::Progress(_))));
    }

    #[test]
    fn cancelled_digest() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"data").unwrap();
        let (handle, signal) = cancel::pair();
        handle.cancel();
        let err = digest_file(file.path(), HashAlgorithm::Sha256, &signal, |_| {}).unwrap_err();
        assert!(err.is_cancelled());
    }
}
