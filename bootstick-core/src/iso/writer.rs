//! Raw delivery: copying the whole image onto the device with `dd`.
//!
//! `dd` reports nothing useful while it runs, so progress is read from the
//! kernel's per-device write counter (`/sys/block/<dev>/stat`). When the
//! target is a plain file, its length is used instead.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::cancel::{self, CancelHandle, CancelSignal};
use crate::config::Config;
use crate::error::{Error, IoContext, Result};
use crate::privilege::{Invocation, check_refusal, failure_text};
use crate::process::{ChildGuard, drain, set_nonblocking, spawn_group, terminate};

/// Minimum time between two speed samples.
const SPEED_WINDOW: Duration = Duration::from_millis(250);
/// The stat file counts 512-byte sectors whatever the device's sector size.
const STAT_SECTOR: u64 = 512;
/// Zero-based index of "sectors written" in the stat file.
const WRITE_SECTORS_FIELD: usize = 6;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WriteState {
    #[default]
    Idle,
    Writing,
    Syncing,
    Complete,
    Cancelled,
    Error,
}

impl WriteState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WriteState::Complete | WriteState::Cancelled | WriteState::Error
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WriteProgress {
    pub bytes_written: u64,
    pub total_bytes: u64,
    /// Bytes per second.
    pub speed: f64,
}

impl WriteProgress {
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            1.0
        } else {
            self.bytes_written as f64 / self.total_bytes as f64
        }
    }
}

/// Sent by the worker behind [`IsoWriter::start`]. `Finished` is always the
/// last event.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteEvent {
    Progress(WriteProgress),
    Finished {
        state: WriteState,
        message: Option<String>,
    },
}

enum Counter {
    Sysfs(PathBuf),
    FileLength(PathBuf),
    Unavailable,
}

impl Counter {
    fn for_target(device: &Path, config: &Config) -> Self {
        if let Some(name) = device.file_name() {
            for dir in ["block", "class/block"] {
                let stat = config.sysfs_root.join(dir).join(name).join("stat");
                if stat.is_file() {
                    return Counter::Sysfs(stat);
                }
            }
        }
        if fs::metadata(device).is_ok_and(|m| m.is_file()) {
            return Counter::FileLength(device.to_path_buf());
        }
        warn!("no write counter for {}; progress will jump at the end", device.display());
        Counter::Unavailable
    }

    fn sample(&self) -> u64 {
        match self {
            Counter::Sysfs(stat) => fs::read_to_string(stat)
                .ok()
                .and_then(|text| written_sectors(&text))
                .map_or(0, |sectors| sectors * STAT_SECTOR),
            Counter::FileLength(path) => fs::metadata(path).map_or(0, |m| m.len()),
            Counter::Unavailable => 0,
        }
    }

    /// `dd` truncates a file target, so its length starts from zero.
    fn baseline(&self) -> u64 {
        match self {
            Counter::FileLength(_) => 0,
            _ => self.sample(),
        }
    }
}

fn written_sectors(stat: &str) -> Option<u64> {
    stat.split_whitespace().nth(WRITE_SECTORS_FIELD)?.parse().ok()
}

/// Turns raw counter deltas into capped, non-decreasing progress.
struct Meter {
    total: u64,
    reported: u64,
    mark: (u64, Instant),
    speed: f64,
}

impl Meter {
    fn new(total: u64) -> Self {
        Meter {
            total,
            reported: 0,
            mark: (0, Instant::now()),
            speed: 0.0,
        }
    }

    fn update(&mut self, measured: u64) -> WriteProgress {
        self.reported = measured.min(self.total).max(self.reported);
        let (mark_bytes, mark_at) = self.mark;
        let elapsed = mark_at.elapsed();
        if elapsed >= SPEED_WINDOW {
            self.speed = (self.reported - mark_bytes) as f64 / elapsed.as_secs_f64();
            self.mark = (self.reported, Instant::now());
        }
        WriteProgress {
            bytes_written: self.reported,
            total_bytes: self.total,
            speed: self.speed,
        }
    }

    fn finish(&mut self) -> WriteProgress {
        self.update(self.total)
    }
}

fn image_len(iso: &Path) -> Result<u64> {
    let meta = fs::metadata(iso).context(|| format!("reading {}", iso.display()))?;
    if !meta.is_file() {
        return Err(Error::InvalidInput(format!(
            "{} is not a regular file",
            iso.display()
        )));
    }
    Ok(meta.len())
}

fn dd_invocation(iso: &Path, device: &Path, config: &Config) -> Invocation {
    let mut input = OsString::from("if=");
    input.push(iso);
    let mut output = OsString::from("of=");
    output.push(device);
    Invocation::new(&config.raw_copy_tool)
        .arg(format!("bs={}", config.dd_block_size))
        .arg(input)
        .arg(output)
        .arg("conv=fsync")
}

/// The copy itself, on the calling thread.
pub(crate) fn transfer(
    iso: &Path,
    device: &Path,
    total: u64,
    config: &Config,
    cancel: &CancelSignal,
    on_progress: &mut dyn FnMut(WriteProgress),
    on_state: &mut dyn FnMut(WriteState),
) -> Result<()> {
    let counter = Counter::for_target(device, config);
    let baseline = counter.baseline();
    let invocation = dd_invocation(iso, device, config);

    on_state(WriteState::Writing);
    let mut command = invocation.command(config)?;
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut guard = ChildGuard::new(
        spawn_group(&mut command, config)
            .context(|| format!("spawning {}", config.raw_copy_tool.display()))?,
    );
    let child = guard.child();

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    if let Some(pipe) = &stdout {
        set_nonblocking(pipe).context(|| "configuring the dd output pipe".to_string())?;
    }
    if let Some(pipe) = &stderr {
        set_nonblocking(pipe).context(|| "configuring the dd error pipe".to_string())?;
    }

    let mut discarded = Vec::new();
    let mut errors = Vec::new();
    let mut meter = Meter::new(total);
    let status = loop {
        if let Some(pipe) = stdout.as_mut() {
            drain(pipe, &mut discarded);
            discarded.clear();
        }
        if let Some(pipe) = stderr.as_mut() {
            drain(pipe, &mut errors);
        }
        let exited = child
            .try_wait()
            .context(|| "waiting for dd".to_string())?;
        on_progress(meter.update(counter.sample().saturating_sub(baseline)));
        if let Some(status) = exited {
            break status;
        }
        if cancel.wait(config.write_poll_interval()) {
            warn!("write to {} cancelled", device.display());
            terminate(child);
            return Err(Error::Cancelled);
        }
    };
    if let Some(pipe) = stderr.as_mut() {
        drain(pipe, &mut errors);
    }

    check_refusal(status, config)?;
    if !status.success() {
        return Err(Error::Write(failure_text(status, &errors)));
    }

    on_state(WriteState::Syncing);
    debug!("flushing filesystem buffers");
    nix::unistd::sync();
    on_progress(meter.finish());
    info!("wrote {total} bytes to {}", device.display());
    Ok(())
}

/// Writes `iso` onto `device` on the calling thread.
pub fn write_sync(
    iso: &Path,
    device: &Path,
    config: &Config,
    cancel: &CancelSignal,
    mut on_progress: impl FnMut(WriteProgress),
) -> Result<()> {
    let total = image_len(iso)?;
    transfer(
        iso,
        device,
        total,
        config,
        cancel,
        &mut on_progress,
        &mut |state: WriteState| debug!("write state: {state:?}"),
    )
}

fn set_state(shared: &Mutex<WriteState>, state: WriteState) {
    *shared.lock().unwrap_or_else(PoisonError::into_inner) = state;
}

/// Runs raw writes on a worker thread, one at a time.
pub struct IsoWriter {
    config: Config,
    state: Arc<Mutex<WriteState>>,
    cancel: Option<CancelHandle>,
    worker: Option<JoinHandle<()>>,
}

impl IsoWriter {
    pub fn new(config: Config) -> Self {
        IsoWriter {
            config,
            state: Arc::new(Mutex::new(WriteState::Idle)),
            cancel: None,
            worker: None,
        }
    }

    /// Starts copying `iso` onto `device`. Fails with [`Error::Busy`] while
    /// a previous write is still running.
    pub fn start(&mut self, iso: &Path, device: &Path) -> Result<Receiver<WriteEvent>> {
        if self.is_running() {
            return Err(Error::Busy("the image writer".into()));
        }
        self.wait();
        let total = image_len(iso)?;

        set_state(&self.state, WriteState::Writing);
        let (handle, signal) = cancel::pair();
        let (tx, rx) = mpsc::channel();
        let state = Arc::clone(&self.state);
        let config = self.config.clone();
        let (iso, device) = (iso.to_path_buf(), device.to_path_buf());

        let spawned = thread::Builder::new()
            .name("bootstick-write".into())
            .spawn(move || {
                let result = transfer(
                    &iso,
                    &device,
                    total,
                    &config,
                    &signal,
                    &mut |progress: WriteProgress| {
                        let _ = tx.send(WriteEvent::Progress(progress));
                    },
                    &mut |s: WriteState| set_state(&state, s),
                );
                let (last, message) = match result {
                    Ok(()) => (WriteState::Complete, None),
                    Err(Error::Cancelled) => (WriteState::Cancelled, None),
                    Err(e) => {
                        error!("writing {} to {} failed: {e}", iso.display(), device.display());
                        (WriteState::Error, Some(e.to_string()))
                    }
                };
                set_state(&state, last);
                let _ = tx.send(WriteEvent::Finished {
                    state: last,
                    message,
                });
            });
        match spawned {
            Ok(worker) => {
                self.cancel = Some(handle);
                self.worker = Some(worker);
                Ok(rx)
            }
            Err(e) => {
                set_state(&self.state, WriteState::Error);
                Err(Error::io("spawning the write worker", e))
            }
        }
    }

    pub fn cancel(&self) {
        if let Some(handle) = &self.cancel {
            handle.cancel();
        }
    }

    pub fn state(&self) -> WriteState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), WriteState::Writing | WriteState::Syncing)
    }

    /// Blocks until the current worker, if any, has finished.
    pub fn wait(&mut self) {
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            error!("the write worker panicked");
            set_state(&self.state, WriteState::Error);
        }
        self.cancel = None;
    }
}

impl Drop for IsoWriter {
    fn drop(&mut self) {
        self.cancel();
        self.wait();
    }
}
