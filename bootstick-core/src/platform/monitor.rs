//! Hotplug notifications from the kernel uevent netlink socket.
//!
//! A [`HotplugMonitor`] is owned by whoever wants the notifications; there is
//! no process-wide state, so several monitors can run side by side.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::socket::{
    AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType, bind, recv,
    setsockopt, socket, sockopt,
};
use nix::sys::time::TimeVal;

use crate::error::{Error, Result};

/// Minimum spacing between two callback invocations.
const DEBOUNCE: Duration = Duration::from_secs(1);
/// How long a blocking receive waits before the thread re-checks for stop.
const RECV_TIMEOUT: Duration = Duration::from_millis(200);
const UEVENT_BUFFER: usize = 8192;

/// The fields of a kernel uevent the monitor cares about.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Uevent {
    pub action: String,
    pub subsystem: String,
    pub devtype: String,
    pub devname: String,
}

impl Uevent {
    /// A whole disk appearing or disappearing.
    pub fn is_disk_hotplug(&self) -> bool {
        matches!(self.action.as_str(), "add" | "remove")
            && self.subsystem == "block"
            && self.devtype == "disk"
    }
}

/// Parses a raw kernel uevent datagram (`action@devpath\0KEY=value\0...`).
/// Messages re-broadcast by udev carry a binary header and are ignored.
pub fn parse_uevent(msg: &[u8]) -> Option<Uevent> {
    if msg.starts_with(b"libudev") {
        return None;
    }
    let mut fields = msg.split(|b| *b == 0).filter(|f| !f.is_empty());
    let header = fields.next()?;
    if !header.contains(&b'@') {
        return None;
    }

    let mut event = Uevent::default();
    for field in fields {
        let field = String::from_utf8_lossy(field);
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        match key {
            "ACTION" => event.action = value.to_string(),
            "SUBSYSTEM" => event.subsystem = value.to_string(),
            "DEVTYPE" => event.devtype = value.to_string(),
            "DEVNAME" => event.devname = value.to_string(),
            _ => {}
        }
    }
    Some(event)
}

/// Coalesces bursts of events into at most one firing per window, with a
/// trailing firing for events that arrived inside the window.
#[derive(Debug)]
pub(crate) struct Debouncer {
    window: Duration,
    last: Option<Instant>,
    pending: bool,
}

impl Debouncer {
    pub(crate) fn new(window: Duration) -> Self {
        Debouncer {
            window,
            last: None,
            pending: false,
        }
    }

    pub(crate) fn note(&mut self) {
        self.pending = true;
    }

    /// Whether the callback should run now.
    pub(crate) fn poll(&mut self, now: Instant) -> bool {
        if !self.pending {
            return false;
        }
        let ready = self
            .last
            .is_none_or(|last| now.duration_since(last) >= self.window);
        if ready {
            self.pending = false;
            self.last = Some(now);
        }
        ready
    }
}

struct UeventSocket {
    fd: OwnedFd,
}

impl UeventSocket {
    fn open() -> io::Result<Self> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkKObjectUEvent,
        )?;
        // Group 1 carries the kernel's own broadcasts.
        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, 1))?;
        let timeout = TimeVal::new(0, RECV_TIMEOUT.as_micros() as libc::suseconds_t);
        setsockopt(&fd, sockopt::ReceiveTimeout, &timeout)?;
        Ok(UeventSocket { fd })
    }

    /// Receives one datagram; `Ok(None)` when the timeout expired.
    fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match recv(self.fd.as_raw_fd(), buf, MsgFlags::empty()) {
            Ok(n) => Ok(Some(n)),
            Err(Errno::EAGAIN | Errno::EINTR) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Watches for USB disks being plugged in or pulled out.
#[derive(Debug, Default)]
pub struct HotplugMonitor {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HotplugMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts listening and calls `callback` (on the monitor's thread) after
    /// disk add/remove events. Calling `start` on a running monitor does
    /// nothing; a monitor whose thread has exited is restarted.
    pub fn start<F>(&mut self, mut callback: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        if self.is_running() {
            return Ok(());
        }
        self.stop();
        let socket = UeventSocket::open()
            .map_err(|e| Error::io("opening the kernel uevent socket", e))?;
        self.stop.store(false, Ordering::SeqCst);
        let stop = self.stop.clone();

        let thread = thread::Builder::new()
            .name("hotplug-monitor".into())
            .spawn(move || {
                let mut buf = vec![0u8; UEVENT_BUFFER];
                let mut debouncer = Debouncer::new(DEBOUNCE);
                while !stop.load(Ordering::SeqCst) {
                    match socket.recv(&mut buf) {
                        Ok(Some(n)) => {
                            if let Some(event) = parse_uevent(&buf[..n])
                                && event.is_disk_hotplug()
                            {
                                debug!("hotplug: {} {}", event.action, event.devname);
                                debouncer.note();
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!("hotplug monitor stopped: {e}");
                            break;
                        }
                    }
                    if debouncer.poll(Instant::now()) {
                        callback();
                    }
                }
            })
            .map_err(|e| Error::io("spawning the hotplug monitor thread", e))?;

        self.thread = Some(thread);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signals the monitor thread and waits for it to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("hotplug monitor thread panicked");
        }
    }
}

impl Drop for HotplugMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kernel_disk_add() {
        let msg = b"add@/devices/pci0000:00/usb2/2-1/block/sdb\0ACTION=add\0\
DEVPATH=/devices/pci0000:00/usb2/2-1/block/sdb\0SUBSYSTEM=block\0MAJOR=8\0MINOR=16\0\
DEVNAME=sdb\0DEVTYPE=disk\0SEQNUM=4242\0";
        let event = parse_uevent(msg).unwrap();
        assert_eq!(event.action, "add");
        assert_eq!(event.devname, "sdb");
        assert!(event.is_disk_hotplug());
    }

    #[test]
    fn partitions_and_udev_messages_are_not_disk_hotplug() {
        let part = b"add@/block/sdb/sdb1\0ACTION=add\0SUBSYSTEM=block\0DEVTYPE=partition\0";
        assert!(!parse_uevent(part).unwrap().is_disk_hotplug());
        assert!(parse_uevent(b"libudev\0\xfe\xed").is_none());
        assert!(parse_uevent(b"garbage").is_none());
    }

    #[test]
    fn debouncer_coalesces_bursts() {
        let start = Instant::now();
        let mut d = Debouncer::new(Duration::from_secs(1));
        assert!(!d.poll(start));

        d.note();
        assert!(d.poll(start));
        d.note();
        d.note();
        assert!(!d.poll(start + Duration::from_millis(300)));
        assert!(d.poll(start + Duration::from_millis(1000)));
        assert!(!d.poll(start + Duration::from_millis(2500)));
    }

    #[test]
    fn exited_thread_does_not_block_a_restart() {
        let mut monitor = HotplugMonitor::new();
        let exited = thread::spawn(|| {});
        while !exited.is_finished() {
            thread::sleep(Duration::from_millis(5));
        }
        monitor.thread = Some(exited);
        assert!(!monitor.is_running());

        match monitor.start(|| {}) {
            Ok(()) => {
                assert!(monitor.is_running());
                monitor.stop();
                assert!(!monitor.is_running());
                monitor.start(|| {}).unwrap();
                assert!(monitor.is_running());
            }
            // No uevent netlink in this sandbox; the stale handle is still gone.
            Err(_) => assert!(monitor.thread.is_none()),
        }
    }

    #[test]
    fn stop_without_start_is_harmless() {
        let mut monitor = HotplugMonitor::new();
        assert!(!monitor.is_running());
        monitor.stop();
    }
}
