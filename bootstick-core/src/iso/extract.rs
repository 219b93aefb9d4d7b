//! File-copy delivery: unpacking the image onto a formatted partition.

use std::path::Path;
use std::process::Stdio;

use log::{info, warn};

use crate::cancel::CancelSignal;
use crate::config::{Config, ExtractTool};
use crate::error::{Error, IoContext, Result};
use crate::privilege::{Invocation, check_refusal, failure_text, tool_available};
use crate::process::{ChildGuard, ToolLog, spawn_group, supervise};
use crate::progress::{Phase, ProgressEvent};

/// `$0` of the extraction script.
const SCRIPT_NAME: &str = "bootstick-extract";

/// Mounts `$1` on `$2`, unpacks `$3` into it and unmounts on any exit.
macro_rules! extract_script {
    ($command:literal) => {
        concat!(
            "trap 'exit 130' INT TERM HUP\n",
            "mount \"$1\" \"$2\" || exit 1\n",
            "trap 'umount \"$2\"' EXIT\n",
            $command,
            " || exit 1\n",
            "sync\n",
        )
    };
}

fn script_for(tool: ExtractTool) -> &'static str {
    match tool {
        ExtractTool::Xorriso => {
            extract_script!("xorriso -osirrox on -indev \"$3\" -extract / \"$2\"")
        }
        ExtractTool::Bsdtar => extract_script!("bsdtar -C \"$2\" -xf \"$3\""),
        ExtractTool::SevenZip => extract_script!("7z x -y -o\"$2\" \"$3\""),
    }
}

pub struct Extractor<'a> {
    config: &'a Config,
}

impl<'a> Extractor<'a> {
    pub fn new(config: &'a Config) -> Self {
        Extractor { config }
    }

    /// The first installed tool in the configured order.
    pub fn tool(&self) -> Option<ExtractTool> {
        self.config
            .extract_tools
            .iter()
            .copied()
            .find(|t| tool_available(t.program()))
    }

    pub fn is_supported(&self) -> bool {
        self.tool().is_some()
    }

    /// Copies the contents of `iso` onto the filesystem on `partition`.
    pub fn extract(
        &self,
        iso: &Path,
        partition: &Path,
        cancel: &CancelSignal,
        mut on_progress: impl FnMut(ProgressEvent),
    ) -> Result<()> {
        let tool = self.tool().ok_or_else(|| {
            Error::Unavailable("an ISO extraction tool (xorriso, bsdtar or 7z)".into())
        })?;
        cancel.check()?;

        let mount_dir = tempfile::Builder::new()
            .prefix("bootstick-mount-")
            .tempdir()
            .context(|| "creating a temporary mount point".to_string())?;
        info!(
            "extracting {} onto {} with {}",
            iso.display(),
            partition.display(),
            tool.program()
        );
        on_progress(
            ProgressEvent::estimated(Phase::Extracting, 0.0)
                .with_message(format!("extracting with {}", tool.program())),
        );

        let invocation = Invocation::new("sh")
            .arg("-c")
            .arg(script_for(tool))
            .arg(SCRIPT_NAME)
            .arg(partition)
            .arg(mount_dir.path())
            .arg(iso);
        let result = run(&invocation, self.config, cancel);

        let dir = mount_dir.path().to_path_buf();
        if let Err(e) = mount_dir.close() {
            warn!("could not remove {}: {e}", dir.display());
        }
        result?;

        on_progress(ProgressEvent::estimated(Phase::Extracting, 1.0));
        Ok(())
    }
}

fn run(invocation: &Invocation, config: &Config, cancel: &CancelSignal) -> Result<()> {
    let (mut log, stderr) = ToolLog::new()?;
    let mut command = invocation.command(config)?;
    command.stdout(Stdio::null()).stderr(stderr);
    let mut child = ChildGuard::new(
        spawn_group(&mut command, config)
            .context(|| "spawning the extraction script".to_string())?,
    );
    let status = supervise(child.child(), cancel, config.format_poll_interval(), || {})?;
    check_refusal(status, config)?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::Extract(failure_text(status, &log.contents())))
    }
}
