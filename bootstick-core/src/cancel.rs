//! Channel-based cancellation.
//!
//! [`pair`] returns a cloneable [`CancelHandle`] for whoever may want to stop
//! an operation and a [`CancelSignal`] owned by the worker doing it. Dropping
//! every handle counts as a cancel, so an abandoned operation winds down.

use std::cell::Cell;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Sender<()>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // A closed receiver means the worker is already gone.
        let _ = self.tx.send(());
    }
}

#[derive(Debug)]
pub struct CancelSignal {
    rx: Receiver<()>,
    fired: Cell<bool>,
    _keepalive: Option<Sender<()>>,
}

pub fn pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = mpsc::channel();
    (
        CancelHandle { tx },
        CancelSignal {
            rx,
            fired: Cell::new(false),
            _keepalive: None,
        },
    )
}

impl CancelSignal {
    /// A signal that never fires, for the blocking convenience wrappers.
    pub fn never() -> Self {
        let (tx, rx) = mpsc::channel();
        CancelSignal {
            rx,
            fired: Cell::new(false),
            _keepalive: Some(tx),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        if self.fired.get() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => {
                self.fired.set(true);
                true
            }
            Err(TryRecvError::Empty) => false,
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps for up to `timeout`, waking early on cancel. Returns whether the
    /// signal fired.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.fired.get() {
            return true;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                self.fired.set(true);
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}
