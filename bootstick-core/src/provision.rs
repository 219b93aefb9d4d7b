//! The provisioning pipeline: one [`OperationDescriptor`] in, one [`Outcome`]
//! out.
//!
//! A run re-validates the device against a fresh enumeration, claims it,
//! unmounts it, and then takes one of three paths:
//!
//! - no image: lay out partitions and format them,
//! - [`Delivery::Raw`]: copy the (decompressed) image onto the whole device,
//! - [`Delivery::Extract`]: create one ESP-typed FAT32 partition and unpack
//!   the image onto it.
//!
//! Nothing is rolled back on failure.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use log::{error, info, warn};

use crate::cancel::{self, CancelHandle, CancelSignal};
use crate::config::Config;
use crate::device::DeviceInfo;
use crate::error::{Error, IoContext, Result};
use crate::format::{self, FormatOptions};
use crate::image::{self, Compression};
use crate::iso::{self, Extractor, WriteProgress, WriteState};
use crate::partition;
use crate::platform;
use crate::privilege::{Invocation, failure_text};
use crate::progress::{Phase, ProgressEvent, Reporter};
use crate::types::{FsType, PartitionStyle, TargetFirmware};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Delivery {
    /// Block-copy the image onto the device.
    #[default]
    Raw,
    /// Unpack the image's files onto a fresh FAT32 partition.
    Extract,
}

/// Everything one run needs to know. `image: None` means format only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationDescriptor {
    pub device: PathBuf,
    pub image: Option<PathBuf>,
    pub style: PartitionStyle,
    pub target: TargetFirmware,
    pub fs_type: FsType,
    /// Bytes; 0 for the tool's default.
    pub cluster_size: u64,
    pub label: String,
    pub delivery: Delivery,
}

impl OperationDescriptor {
    /// A format-only run: MBR, BIOS, one FAT32 partition.
    pub fn new(device: impl Into<PathBuf>) -> Self {
        OperationDescriptor {
            device: device.into(),
            image: None,
            style: PartitionStyle::Mbr,
            target: TargetFirmware::Bios,
            fs_type: FsType::Fat32,
            cluster_size: 0,
            label: String::new(),
            delivery: Delivery::Raw,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    Cancelled,
    Failed(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Progress(ProgressEvent),
    /// Always the last event of a run.
    Finished(Outcome),
}

type Registry = Arc<Mutex<HashSet<PathBuf>>>;

/// Holds a device in the registry until dropped.
struct DeviceGuard {
    registry: Registry,
    device: PathBuf,
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.device);
    }
}

fn claim(registry: &Registry, device: &Path) -> Result<DeviceGuard> {
    let mut active = registry.lock().unwrap_or_else(PoisonError::into_inner);
    if !active.insert(device.to_path_buf()) {
        return Err(Error::Busy(device.display().to_string()));
    }
    Ok(DeviceGuard {
        registry: Arc::clone(registry),
        device: device.to_path_buf(),
    })
}

/// A run started with [`Provisioner::start`].
pub struct OperationHandle {
    pub events: Receiver<Event>,
    cancel: CancelHandle,
    worker: JoinHandle<()>,
}

impl OperationHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A handle that can cancel this run from elsewhere, e.g. a signal handler.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn join(self) {
        if self.worker.join().is_err() {
            error!("the provisioning worker panicked");
        }
    }
}

/// Runs operations, at most one per device at a time.
#[derive(Clone)]
pub struct Provisioner {
    config: Arc<Config>,
    active: Registry,
}

impl Provisioner {
    pub fn new(config: Config) -> Self {
        Provisioner {
            config: Arc::new(config),
            active: Arc::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_busy(&self, device: &Path) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(device)
    }

    fn admit(&self, op: &OperationDescriptor) -> Result<(DeviceInfo, DeviceGuard)> {
        let device = validate(op, &self.config)?;
        let guard = claim(&self.active, &device.path)?;
        Ok((device, guard))
    }

    /// Validates and claims the device, then runs the operation on a worker
    /// thread. Validation and [`Error::Busy`] failures are returned here;
    /// everything later arrives as [`Event::Finished`].
    pub fn start(&self, op: OperationDescriptor) -> Result<OperationHandle> {
        let (device, guard) = self.admit(&op)?;
        let (cancel, signal) = cancel::pair();
        let (tx, events) = mpsc::channel();
        let config = Arc::clone(&self.config);

        let worker = thread::Builder::new()
            .name("bootstick-provision".into())
            .spawn(move || {
                let result = execute(&op, &device, &config, &signal, &mut |event: ProgressEvent| {
                    let _ = tx.send(Event::Progress(event));
                });
                let outcome = outcome_of(&op, result);
                drop(guard);
                let _ = tx.send(Event::Finished(outcome));
            })
            .context(|| "spawning the provisioning worker".to_string())?;
        Ok(OperationHandle {
            events,
            cancel,
            worker,
        })
    }

    /// Runs the operation on the calling thread.
    pub fn run(
        &self,
        op: &OperationDescriptor,
        cancel: &CancelSignal,
        mut on_progress: impl FnMut(ProgressEvent),
    ) -> Outcome {
        let result = self
            .admit(op)
            .and_then(|(device, _guard)| execute(op, &device, &self.config, cancel, &mut on_progress));
        outcome_of(op, result)
    }
}

fn outcome_of(op: &OperationDescriptor, result: Result<()>) -> Outcome {
    match result {
        Ok(()) => {
            info!("{} is ready", op.device.display());
            Outcome::Complete
        }
        Err(Error::Cancelled) => {
            warn!("operation on {} cancelled", op.device.display());
            Outcome::Cancelled
        }
        Err(e) => {
            error!("operation on {} failed: {e}", op.device.display());
            Outcome::Failed(e.to_string())
        }
    }
}

fn validate(op: &OperationDescriptor, config: &Config) -> Result<DeviceInfo> {
    if let Some(image) = &op.image
        && !image.is_file()
    {
        return Err(Error::InvalidInput(format!(
            "{} is not a readable image file",
            image.display()
        )));
    }
    if op.cluster_size != 0 && !op.cluster_size.is_power_of_two() {
        return Err(Error::InvalidInput(format!(
            "cluster size {} is not a power of two",
            op.cluster_size
        )));
    }
    platform::find_device(config, &op.device)?.ok_or_else(|| Error::Safety {
        path: op.device.clone(),
        reason: "not an attached USB device free of protected mounts".into(),
    })
}

fn execute(
    op: &OperationDescriptor,
    device: &DeviceInfo,
    config: &Config,
    cancel: &CancelSignal,
    sink: &mut dyn FnMut(ProgressEvent),
) -> Result<()> {
    let mut reporter = Reporter::new(sink);
    reporter.stage(0.0, 0.02);
    reporter.emit(
        ProgressEvent::estimated(Phase::Validating, 1.0)
            .with_message(device.display_name()),
    );

    reporter.stage(0.02, 0.05);
    unmount(device, config, cancel)?;
    reporter.emit(ProgressEvent::estimated(Phase::Unmounting, 1.0));

    match (&op.image, op.delivery) {
        (None, _) => format_only(op, device, config, cancel, &mut reporter),
        (Some(image), Delivery::Raw) => deliver_raw(image, device, config, cancel, &mut reporter),
        (Some(image), Delivery::Extract) => {
            deliver_extract(image, op, device, config, cancel, &mut reporter)
        }
    }
}

fn unmount(device: &DeviceInfo, config: &Config, cancel: &CancelSignal) -> Result<()> {
    for mountpoint in &device.mountpoints {
        cancel.check()?;
        info!("unmounting {}", mountpoint.display());
        let output = Invocation::new("umount")
            .arg("-l")
            .arg(mountpoint)
            .output(config)?;
        if !output.status.success() {
            return Err(Error::Safety {
                path: mountpoint.clone(),
                reason: format!(
                    "could not unmount: {}",
                    failure_text(output.status, &output.stderr)
                ),
            });
        }
    }
    Ok(())
}

fn partition_step(
    reporter: &mut Reporter<'_>,
    cancel: &CancelSignal,
    layout: impl FnOnce() -> Result<()>,
) -> Result<()> {
    cancel.check()?;
    reporter.emit(ProgressEvent::estimated(Phase::Partitioning, 0.0));
    layout()?;
    reporter.emit(ProgressEvent::estimated(Phase::Partitioning, 1.0));
    Ok(())
}

fn node(device: &DeviceInfo, n: u32, config: &Config) -> Result<PathBuf> {
    let node = partition::partition_path(&device.path, n);
    partition::wait_for_node(&node, config.partition_wait())?;
    Ok(node)
}

fn format_step(
    node: &Path,
    opts: &FormatOptions,
    config: &Config,
    cancel: &CancelSignal,
    reporter: &mut Reporter<'_>,
) -> Result<()> {
    cancel.check()?;
    format::format(node, opts, config, cancel, |event| reporter.emit(event))
}

fn format_only(
    op: &OperationDescriptor,
    device: &DeviceInfo,
    config: &Config,
    cancel: &CancelSignal,
    reporter: &mut Reporter<'_>,
) -> Result<()> {
    let with_esp = op.style == PartitionStyle::Gpt && op.target.wants_uefi();
    reporter.stage(0.05, 0.30);
    partition_step(reporter, cancel, || {
        partition::create_bootable(
            &device.path,
            op.style,
            op.target,
            op.fs_type,
            &op.label,
            config,
        )
    })?;

    let data_slot = if with_esp {
        let esp = node(device, 1, config)?;
        reporter.stage(0.30, 0.45);
        let esp_opts = FormatOptions {
            label: "EFI".into(),
            ..FormatOptions::new(FsType::Fat32)
        };
        format_step(&esp, &esp_opts, config, cancel, reporter)?;
        2
    } else {
        1
    };

    let data = node(device, data_slot, config)?;
    reporter.stage(if with_esp { 0.45 } else { 0.30 }, 1.0);
    let opts = FormatOptions {
        label: op.label.clone(),
        cluster_size: op.cluster_size,
        ..FormatOptions::new(op.fs_type)
    };
    format_step(&data, &opts, config, cancel, reporter)
}

fn deliver_raw(
    image: &Path,
    device: &DeviceInfo,
    config: &Config,
    cancel: &CancelSignal,
    reporter: &mut Reporter<'_>,
) -> Result<()> {
    let compressed = Compression::from_path(image) != Compression::None;
    if compressed {
        reporter.stage(0.05, 0.30);
    }
    let prepared = image::prepare(image, cancel, |event| reporter.emit(event))?;
    let total = fs::metadata(prepared.path())
        .context(|| format!("reading {}", prepared.path().display()))?
        .len();
    if total > device.size {
        return Err(Error::InvalidInput(format!(
            "the image ({total} bytes) does not fit on {} ({} bytes)",
            device.path.display(),
            device.size
        )));
    }

    reporter.stage(if compressed { 0.30 } else { 0.05 }, 1.0);
    let reporter = RefCell::new(reporter);
    let written = Cell::new(0.0);
    iso::transfer(
        prepared.path(),
        &device.path,
        total,
        config,
        cancel,
        &mut |progress: WriteProgress| {
            written.set(progress.fraction());
            reporter.borrow_mut().emit(ProgressEvent::measured(
                Phase::Writing,
                progress.bytes_written,
                progress.total_bytes,
                Some(progress.speed),
            ));
        },
        &mut |state: WriteState| {
            if state == WriteState::Syncing {
                reporter.borrow_mut().emit(
                    ProgressEvent::estimated(Phase::Syncing, written.get())
                        .with_message("flushing buffers"),
                );
            }
        },
    )
}

fn deliver_extract(
    image: &Path,
    op: &OperationDescriptor,
    device: &DeviceInfo,
    config: &Config,
    cancel: &CancelSignal,
    reporter: &mut Reporter<'_>,
) -> Result<()> {
    let extractor = Extractor::new(config);
    if !extractor.is_supported() {
        return Err(Error::Unavailable(
            "an ISO extraction tool (xorriso, bsdtar or 7z)".into(),
        ));
    }
    if op.fs_type != FsType::Fat32 {
        warn!("file-copy delivery always uses FAT32, not {}", op.fs_type);
    }

    reporter.stage(0.05, 0.15);
    partition_step(reporter, cancel, || {
        partition::create_single_efi(&device.path, op.style, &op.label, config)
    })?;
    let target = node(device, 1, config)?;

    reporter.stage(0.15, 0.30);
    let opts = FormatOptions {
        label: op.label.clone(),
        cluster_size: op.cluster_size,
        ..FormatOptions::new(FsType::Fat32)
    };
    format_step(&target, &opts, config, cancel, reporter)?;

    reporter.stage(0.30, 1.0);
    cancel.check()?;
    extractor.extract(image, &target, cancel, |event| reporter.emit(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_on_a_device_is_busy() {
        let registry = Registry::default();
        let device = Path::new("/dev/sdz");
        let guard = claim(&registry, device).unwrap();
        assert!(matches!(claim(&registry, device), Err(Error::Busy(_))));
        assert!(claim(&registry, Path::new("/dev/sdy")).is_ok());
        drop(guard);
        assert!(claim(&registry, device).is_ok());
    }

    #[test]
    fn busy_devices_are_reported() {
        let provisioner = Provisioner::new(Config::default());
        let device = Path::new("/dev/sdz");
        let guard = claim(&provisioner.active, device).unwrap();
        assert!(provisioner.is_busy(device));
        drop(guard);
        assert!(!provisioner.is_busy(device));
    }

    #[test]
    fn invalid_descriptors_are_rejected_before_enumeration() {
        let config = Config {
            sysfs_root: PathBuf::from("/nonexistent/sys"),
            ..Config::default()
        };
        let mut op = OperationDescriptor::new("/dev/sdz");
        op.image = Some(PathBuf::from("/nonexistent/image.iso"));
        assert!(matches!(validate(&op, &config), Err(Error::InvalidInput(_))));

        let mut op = OperationDescriptor::new("/dev/sdz");
        op.cluster_size = 3000;
        assert!(matches!(validate(&op, &config), Err(Error::InvalidInput(_))));

        let op = OperationDescriptor::new("/dev/sdz");
        assert!(matches!(validate(&op, &config), Err(Error::Enumeration(_))));
    }

    #[test]
    fn outcomes() {
        let op = OperationDescriptor::new("/dev/sdz");
        assert_eq!(outcome_of(&op, Ok(())), Outcome::Complete);
        assert_eq!(outcome_of(&op, Err(Error::Cancelled)), Outcome::Cancelled);
        assert!(matches!(
            outcome_of(&op, Err(Error::Format("boom".into()))),
            Outcome::Failed(m) if m.contains("boom")
        ));
    }
}
