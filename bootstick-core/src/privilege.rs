//! Running external tools, elevated when needed.
//!
//! Every tool call is an argument vector ([`Invocation`]); nothing is passed
//! through a shell. When the process is not root and the policy allows it, the
//! invocation is prefixed with the polkit helper (`pkexec`).

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Output, Stdio};

use log::{debug, info};

use crate::config::{Config, ElevationPolicy};
use crate::error::{Error, Result};

/// Exit codes `pkexec` uses when authorization is refused or dismissed.
const HELPER_REFUSED: [i32; 2] = [126, 127];

pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Whether tool invocations under `config` go through the elevation helper.
pub fn needs_elevation(config: &Config) -> bool {
    config.elevation == ElevationPolicy::Auto && !is_root()
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// The first installed elevation helper.
pub fn elevation_helper(config: &Config) -> Result<PathBuf> {
    config
        .elevation_helpers
        .iter()
        .find(|p| is_executable(p))
        .cloned()
        .ok_or_else(|| Error::Unavailable("pkexec (elevation helper)".into()))
}

/// Resolves `name` on `PATH` (or checks it directly when it is a path).
pub fn require_tool(name: impl AsRef<OsStr>) -> Result<PathBuf> {
    let name = name.as_ref();
    which::which(name).map_err(|_| Error::Unavailable(name.to_string_lossy().into_owned()))
}

pub fn tool_available(name: impl AsRef<OsStr>) -> bool {
    which::which(name.as_ref()).is_ok()
}

/// A program and its arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    program: OsString,
    args: Vec<OsString>,
}

impl Invocation {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Invocation {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Builds the `Command` to spawn: the tool resolved on `PATH`, prefixed
    /// with the elevation helper when `config` requires it. Standard input is
    /// always null.
    pub fn command(&self, config: &Config) -> Result<Command> {
        let tool = require_tool(&self.program)?;
        let mut cmd = if needs_elevation(config) {
            let mut cmd = Command::new(elevation_helper(config)?);
            cmd.arg(tool);
            cmd
        } else {
            Command::new(tool)
        };
        cmd.args(&self.args).stdin(Stdio::null());
        info!("running: {self}");
        Ok(cmd)
    }

    /// Runs to completion, capturing both output streams.
    pub fn output(&self, config: &Config) -> Result<Output> {
        let output = self
            .command(config)?
            .output()
            .map_err(|e| Error::io(format!("spawning {}", self.program.to_string_lossy()), e))?;
        check_refusal(output.status, config)?;
        debug!("{} exited with {}", self.program.to_string_lossy(), output.status);
        Ok(output)
    }

    /// Runs as the current user, whatever the elevation policy. Used for
    /// read-only inspection tools.
    pub fn output_unprivileged(&self) -> Result<Output> {
        let tool = require_tool(&self.program)?;
        debug!("running: {self}");
        let output = Command::new(tool)
            .args(&self.args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::io(format!("spawning {}", self.program.to_string_lossy()), e))?;
        debug!("{} exited with {}", self.program.to_string_lossy(), output.status);
        Ok(output)
    }

    /// Like [`Invocation::output`], feeding `input` to the tool's stdin.
    pub fn output_with_input(&self, config: &Config, input: &[u8]) -> Result<Output> {
        let spawn_err = |e| Error::io(format!("spawning {}", self.program.to_string_lossy()), e);
        let mut child = self
            .command(config)?
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;

        if let Some(mut stdin) = child.stdin.take() {
            // Dropping stdin at the end of this block closes the pipe.
            stdin.write_all(input).map_err(|e| {
                Error::io(format!("feeding {}", self.program.to_string_lossy()), e)
            })?;
        }
        let output = child.wait_with_output().map_err(spawn_err)?;
        check_refusal(output.status, config)?;
        debug!("{} exited with {}", self.program.to_string_lossy(), output.status);
        Ok(output)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Maps the helper's refusal exit codes to [`Error::Privilege`].
pub fn check_refusal(status: ExitStatus, config: &Config) -> Result<()> {
    if !needs_elevation(config) {
        return Ok(());
    }
    match status.code() {
        Some(code) if HELPER_REFUSED.contains(&code) => Err(Error::Privilege(format!(
            "authorization was not granted (exit status {code})"
        ))),
        _ => Ok(()),
    }
}

/// Text of a failed tool's stderr, or its exit status when it printed nothing.
pub(crate) fn failure_text(status: ExitStatus, stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr).trim().to_string();
    if text.is_empty() {
        format!("exited with {status}")
    } else {
        text
    }
}
