//! Supervising spawned tools: polling, cancellation and output capture.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::fd::AsFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use log::{debug, warn};
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;

use crate::cancel::CancelSignal;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::privilege::needs_elevation;

/// Stderr kept from a tool for error messages.
const LOG_TAIL: usize = 64 * 1024;

/// An anonymous file a child writes its stderr to.
pub(crate) struct ToolLog {
    file: File,
}

impl ToolLog {
    pub(crate) fn new() -> Result<(Self, Stdio)> {
        let file = tempfile::tempfile().map_err(|e| Error::io("creating a tool log", e))?;
        let child_end = file
            .try_clone()
            .map_err(|e| Error::io("creating a tool log", e))?;
        Ok((ToolLog { file }, Stdio::from(child_end)))
    }

    /// Whatever the tool wrote, up to the last 64 KiB.
    pub(crate) fn contents(&mut self) -> Vec<u8> {
        let mut text = Vec::new();
        let read = self
            .file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_to_end(&mut text));
        if let Err(e) = read {
            warn!("could not read a tool log: {e}");
        }
        if text.len() > LOG_TAIL {
            text.drain(..text.len() - LOG_TAIL);
        }
        text
    }
}

/// Spawns `cmd` as the leader of its own process group, so a cancel reaches
/// every process a tool script starts. Elevated commands stay in the caller's
/// group: a text polkit agent needs the foreground terminal.
pub(crate) fn spawn_group(cmd: &mut Command, config: &Config) -> io::Result<Child> {
    if !needs_elevation(config) {
        cmd.process_group(0);
    }
    cmd.spawn()
}

/// Sends SIGTERM to the child's process group (or to the child alone when it
/// leads none) and reaps it.
pub(crate) fn terminate(child: &mut Child) {
    let pid = Pid::from_raw(child.id() as i32);
    let sent = match killpg(pid, Signal::SIGTERM) {
        Err(Errno::ESRCH) => kill(pid, Signal::SIGTERM),
        other => other,
    };
    if let Err(e) = sent {
        warn!("could not signal pid {pid}: {e}");
    }
    match child.wait() {
        Ok(status) => debug!("pid {pid} reaped: {status}"),
        Err(e) => warn!("could not reap pid {pid}: {e}"),
    }
}

/// Polls `child` every `interval` until it exits, calling `on_tick` between
/// polls. A cancel terminates and reaps the child and returns
/// [`Error::Cancelled`].
pub(crate) fn supervise(
    child: &mut Child,
    cancel: &CancelSignal,
    interval: Duration,
    mut on_tick: impl FnMut(),
) -> Result<ExitStatus> {
    loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| Error::io("waiting for a child process", e))?
        {
            return Ok(status);
        }
        on_tick();
        if cancel.wait(interval) {
            terminate(child);
            return Err(Error::Cancelled);
        }
    }
}

pub(crate) fn set_nonblocking(fd: &impl AsFd) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Owns a spawned child and terminates it on drop unless it has already been
/// reaped, so an early `?` never leaves a tool running.
pub(crate) struct ChildGuard(Child);

impl ChildGuard {
    pub(crate) fn new(child: Child) -> Self {
        ChildGuard(child)
    }

    pub(crate) fn child(&mut self) -> &mut Child {
        &mut self.0
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !matches!(self.0.try_wait(), Ok(Some(_))) {
            terminate(&mut self.0);
        }
    }
}

/// Reads everything currently available from a non-blocking pipe into `sink`,
/// keeping at most the last 64 KiB.
pub(crate) fn drain(pipe: &mut impl Read, sink: &mut Vec<u8>) {
    let mut buf = [0u8; 4096];
    loop {
        match pipe.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => sink.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    if sink.len() > LOG_TAIL {
        sink.drain(..sink.len() - LOG_TAIL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel;
    use std::process::Command;
    use std::time::Instant;

    #[test]
    fn supervise_returns_exit_status() {
        let mut child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let mut ticks = 0;
        let status = supervise(
            &mut child,
            &CancelSignal::never(),
            Duration::from_millis(10),
            || ticks += 1,
        )
        .unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[test]
    fn cancel_terminates_and_reaps() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let (handle, signal) = cancel::pair();
        handle.cancel();
        let start = Instant::now();
        let err = supervise(&mut child, &signal, Duration::from_secs(5), || {}).unwrap_err();
        assert!(err.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn cancel_reaches_the_whole_process_group() {
        let config = Config {
            elevation: crate::config::ElevationPolicy::Never,
            ..Config::default()
        };
        // The shell defers its trap until the foreground `sleep` exits.
        let mut command = Command::new("sh");
        command.args(["-c", "trap 'exit 130' TERM; sleep 10; true"]);
        let mut child = ChildGuard::new(spawn_group(&mut command, &config).unwrap());
        let (handle, signal) = cancel::pair();

        let start = Instant::now();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            handle.cancel();
        });
        let err = supervise(child.child(), &signal, Duration::from_millis(20), || {}).unwrap_err();
        canceller.join().unwrap();

        assert!(err.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(child.child().try_wait().unwrap().is_some());
    }

    #[test]
    fn dropped_guard_reaps_a_running_child() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        let start = Instant::now();
        drop(ChildGuard::new(child));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(kill(pid, None::<Signal>), Err(Errno::ESRCH));
    }

    #[test]
    fn pipes_switch_to_non_blocking() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let mut stdout = child.stdout.take().unwrap();
        set_nonblocking(&stdout).unwrap();
        let mut sink = Vec::new();
        drain(&mut stdout, &mut sink);
        assert!(sink.is_empty());
        terminate(&mut child);
    }

    #[test]
    fn tool_log_captures_stderr() {
        let (mut log, stderr) = ToolLog::new().unwrap();
        let status = Command::new("sh")
            .args(["-c", "echo boom >&2; exit 1"])
            .stderr(stderr)
            .status()
            .unwrap();
        assert!(!status.success());
        assert_eq!(String::from_utf8_lossy(&log.contents()).trim(), "boom");
    }
}
