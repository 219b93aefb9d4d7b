//! Creating filesystems with the system `mkfs` tools.

use std::path::Path;
use std::process::Stdio;

use log::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::privilege::{Invocation, check_refusal, failure_text};
use crate::process::{ChildGuard, ToolLog, spawn_group, supervise};
use crate::progress::{Phase, ProgressEvent};
use crate::types::FsType;

/// Synthetic progress added per poll tick while the tool runs.
const TICK_FRACTION: f64 = 0.02;
const TICK_CAP: f64 = 0.99;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatOptions {
    pub fs_type: FsType,
    /// Volume label; empty for none.
    pub label: String,
    /// Cluster (allocation unit) size in bytes; 0 for the tool's default.
    pub cluster_size: u64,
    pub quick: bool,
}

impl FormatOptions {
    pub fn new(fs_type: FsType) -> Self {
        FormatOptions {
            fs_type,
            label: String::new(),
            cluster_size: 0,
            quick: true,
        }
    }
}

#[derive(Clone, Copy)]
enum ClusterUnit {
    /// Sectors of 512 bytes.
    Sectors,
    Bytes,
}

struct ToolSpec {
    program: &'static str,
    width: &'static [&'static str],
    quick: Option<&'static str>,
    label: &'static str,
    cluster: Option<(&'static str, ClusterUnit)>,
}

fn tool_for(fs: FsType) -> Option<ToolSpec> {
    let ext = |program| ToolSpec {
        program,
        width: &[],
        quick: None,
        label: "-L",
        cluster: Some(("-b", ClusterUnit::Bytes)),
    };
    Some(match fs {
        FsType::Fat16 | FsType::Fat32 => ToolSpec {
            program: "mkfs.fat",
            width: if fs == FsType::Fat16 { &["-F", "16"] } else { &["-F", "32"] },
            quick: None,
            label: "-n",
            cluster: Some(("-s", ClusterUnit::Sectors)),
        },
        FsType::Ntfs => ToolSpec {
            program: "mkfs.ntfs",
            width: &[],
            quick: Some("-Q"),
            label: "-L",
            cluster: Some(("-c", ClusterUnit::Bytes)),
        },
        FsType::ExFat => ToolSpec {
            program: "mkfs.exfat",
            width: &[],
            quick: None,
            label: "-L",
            cluster: Some(("-c", ClusterUnit::Bytes)),
        },
        FsType::Ext2 => ext("mkfs.ext2"),
        FsType::Ext3 => ext("mkfs.ext3"),
        FsType::Ext4 => ext("mkfs.ext4"),
        FsType::Udf => ToolSpec {
            program: "mkudffs",
            width: &[],
            quick: None,
            label: "-l",
            cluster: None,
        },
        FsType::ReFs => return None,
    })
}

/// The exact command line used to create `opts.fs_type` on `partition`.
pub fn build_invocation(partition: &Path, opts: &FormatOptions) -> Result<Invocation> {
    let spec = tool_for(opts.fs_type).ok_or_else(|| {
        Error::Unavailable(format!("no tool creates {} on Linux", opts.fs_type))
    })?;

    let mut inv = Invocation::new(spec.program).args(spec.width);
    if opts.quick
        && let Some(flag) = spec.quick
    {
        inv = inv.arg(flag);
    }
    if !opts.label.is_empty() {
        inv = inv.arg(spec.label).arg(&opts.label);
    }
    if opts.cluster_size > 0
        && let Some((flag, unit)) = spec.cluster
    {
        let value = match unit {
            ClusterUnit::Sectors => (opts.cluster_size / 512).max(1),
            ClusterUnit::Bytes => opts.cluster_size,
        };
        inv = inv.arg(flag).arg(value.to_string());
    }
    Ok(inv.arg(partition))
}

/// Formats `partition`, reporting estimated progress until the tool exits.
///
/// Cancelling kills the tool; the partition is left in whatever state it
/// reached.
pub fn format(
    partition: &Path,
    opts: &FormatOptions,
    config: &Config,
    cancel: &CancelSignal,
    mut on_progress: impl FnMut(ProgressEvent),
) -> Result<()> {
    let invocation = build_invocation(partition, opts)?;
    info!("formatting {} as {}", partition.display(), opts.fs_type);

    let (mut log, stderr) = ToolLog::new()?;
    let mut command = invocation.command(config)?;
    command.stdout(Stdio::null()).stderr(stderr);
    let mut child = ChildGuard::new(spawn_group(&mut command, config).map_err(|e| {
        Error::io(format!("spawning {}", invocation.program().to_string_lossy()), e)
    })?);

    on_progress(ProgressEvent::estimated(Phase::Formatting, 0.0));
    let mut ticks = 0u32;
    let status = supervise(child.child(), cancel, config.format_poll_interval(), || {
        ticks += 1;
        let fraction = (f64::from(ticks) * TICK_FRACTION).min(TICK_CAP);
        on_progress(ProgressEvent::estimated(Phase::Formatting, fraction));
    })
    .inspect_err(|e| {
        if e.is_cancelled() {
            warn!("formatting {} cancelled", partition.display());
        }
    })?;

    check_refusal(status, config)?;
    if !status.success() {
        return Err(Error::Format(failure_text(status, &log.contents())));
    }

    debug!("{} formatted after {ticks} polls", partition.display());
    on_progress(ProgressEvent::estimated(Phase::Formatting, 1.0));
    Ok(())
}

/// Blocking quick format without progress.
pub fn format_sync(
    partition: &Path,
    fs: FsType,
    label: &str,
    cluster_size: u64,
    config: &Config,
) -> Result<()> {
    let opts = FormatOptions {
        fs_type: fs,
        label: label.to_string(),
        cluster_size,
        quick: true,
    };
    format(partition, &opts, config, &CancelSignal::never(), |_| {})
}
