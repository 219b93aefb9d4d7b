//! Progress events reported by long-running stages.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Validating,
    Unmounting,
    Decompressing,
    Partitioning,
    Formatting,
    Writing,
    Syncing,
    Extracting,
    Hashing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Validating => "Validating",
            Phase::Unmounting => "Unmounting",
            Phase::Decompressing => "Decompressing",
            Phase::Partitioning => "Partitioning",
            Phase::Formatting => "Formatting",
            Phase::Writing => "Writing",
            Phase::Syncing => "Syncing",
            Phase::Extracting => "Extracting",
            Phase::Hashing => "Hashing",
        };
        f.write_str(name)
    }
}

/// Where a figure came from. Anything not read back from the kernel or a
/// byte counter is `Estimated`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Measured,
    Estimated,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEvent {
    pub phase: Phase,
    /// Overall completion in `[0, 1]`.
    pub fraction: f64,
    pub bytes_done: Option<u64>,
    pub bytes_total: Option<u64>,
    /// Bytes per second.
    pub speed: Option<f64>,
    pub message: Option<String>,
    pub source: Source,
}

impl ProgressEvent {
    pub fn estimated(phase: Phase, fraction: f64) -> Self {
        ProgressEvent {
            phase,
            fraction: fraction.clamp(0.0, 1.0),
            bytes_done: None,
            bytes_total: None,
            speed: None,
            message: None,
            source: Source::Estimated,
        }
    }

    /// A byte-counted event. `done` is capped at `total`.
    pub fn measured(phase: Phase, done: u64, total: u64, speed: Option<f64>) -> Self {
        let done = done.min(total);
        let fraction = if total == 0 {
            1.0
        } else {
            done as f64 / total as f64
        };
        ProgressEvent {
            phase,
            fraction,
            bytes_done: Some(done),
            bytes_total: Some(total),
            speed,
            message: None,
            source: Source::Measured,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Maps each stage's own `[0, 1]` progress onto a slice of the operation's
/// overall progress and keeps the result non-decreasing.
pub(crate) struct Reporter<'a> {
    sink: &'a mut dyn FnMut(ProgressEvent),
    base: f64,
    span: f64,
    last: f64,
}

impl<'a> Reporter<'a> {
    pub(crate) fn new(sink: &'a mut dyn FnMut(ProgressEvent)) -> Self {
        Reporter {
            sink,
            base: 0.0,
            span: 1.0,
            last: 0.0,
        }
    }

    /// Starts a stage occupying `[start, end]` of the overall range.
    pub(crate) fn stage(&mut self, start: f64, end: f64) {
        self.base = start.max(self.last);
        self.span = (end - self.base).max(0.0);
    }

    pub(crate) fn emit(&mut self, mut event: ProgressEvent) {
        let scaled = (self.base + event.fraction.clamp(0.0, 1.0) * self.span).min(1.0);
        self.last = self.last.max(scaled);
        event.fraction = self.last;
        (self.sink)(event);
    }
}
