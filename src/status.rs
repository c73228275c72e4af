//! The status-event protocol shared by every Data-Action.
//!
//! An action is iterated for its events; each event is a partial record
//! and consumers merge successive events of one action field by field.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PrepError;

/// Values of the `status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "skipped")]
    Skipped,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "setting mtime")]
    SettingMtime,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Skipped => "skipped",
            Status::Error => "error",
            Status::Done => "done",
            Status::SettingMtime => "setting mtime",
        }
    }

    /// Whether an action stops after emitting this status.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::SettingMtime)
    }
}

/// Values of the `checksum` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumState {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "differs")]
    Differs,
    /// No digest was declared, nothing was verified.
    #[serde(rename = "-")]
    Unverified,
}

impl ChecksumState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumState::Ok => "ok",
            ChecksumState::Differs => "differs",
            ChecksumState::Unverified => "-",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done: Option<u64>,
    #[serde(rename = "done%", skip_serializing_if = "Option::is_none")]
    pub done_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dspeed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wspeed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<ChecksumState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
}

impl StatusEvent {
    /// The probe event: expected total size, possibly unknown.
    pub fn probed(size: Option<u64>) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    /// Progress of an active transfer.
    pub fn transfer(done: u64, size: Option<u64>) -> Self {
        let done_percent = size
            .filter(|size| *size > 0)
            .map(|size| 100.0 * done as f64 / size as f64);
        Self {
            done: Some(done),
            done_percent,
            ..Self::default()
        }
    }

    pub fn with_speeds(mut self, dspeed: Option<f64>, wspeed: Option<f64>) -> Self {
        self.dspeed = dspeed;
        self.wspeed = wspeed;
        self
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            status: Some(Status::Skipped),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// `status: error` always travels with a message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Some(Status::Error),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn checksum(state: ChecksumState) -> Self {
        Self {
            checksum: Some(state),
            ..Self::default()
        }
    }

    pub fn checksum_differs(message: impl Into<String>) -> Self {
        Self {
            checksum: Some(ChecksumState::Differs),
            ..Self::error(message)
        }
    }

    pub fn setting_mtime() -> Self {
        Self {
            status: Some(Status::SettingMtime),
            ..Self::default()
        }
    }

    pub fn done() -> Self {
        Self {
            status: Some(Status::Done),
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, progress: impl Into<String>) -> Self {
        self.progress = Some(progress.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.map(Status::is_terminal).unwrap_or(false)
    }

    /// Overlay the fields present in `other` onto `self`.
    pub fn merge(&mut self, other: &StatusEvent) {
        fn overlay<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if let Some(value) = value {
                *slot = Some(value.clone());
            }
        }
        overlay(&mut self.path, &other.path);
        overlay(&mut self.size, &other.size);
        overlay(&mut self.done, &other.done);
        overlay(&mut self.done_percent, &other.done_percent);
        overlay(&mut self.dspeed, &other.dspeed);
        overlay(&mut self.wspeed, &other.wspeed);
        overlay(&mut self.checksum, &other.checksum);
        overlay(&mut self.status, &other.status);
        overlay(&mut self.message, &other.message);
        overlay(&mut self.progress, &other.progress);
    }
}

/// Throughput of one side of a transfer, in bytes per second.
///
/// The mean is cumulative bytes over an estimate of cumulative time, the
/// time estimate being rebuilt from the previous mean on every chunk, so
/// recent chunks dominate while single outliers are damped.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Throughput {
    last: Option<f64>,
    mean: Option<f64>,
}

impl Throughput {
    /// Record `nbytes` moved in `elapsed`, `previous_total` bytes having
    /// been moved before this chunk.
    pub fn record(&mut self, previous_total: u64, nbytes: usize, elapsed: Duration) {
        let seconds = elapsed.as_secs_f64();
        if seconds <= 0.0 {
            return;
        }
        let last = nbytes as f64 / seconds;
        self.last = Some(last);
        self.mean = match self.mean {
            Some(mean) if mean > 0.0 => {
                let spent = previous_total as f64 / mean + seconds;
                Some((previous_total as f64 + nbytes as f64) / spent)
            }
            _ => Some(last),
        };
    }

    pub fn last(&self) -> Option<f64> {
        self.last
    }

    pub fn mean(&self) -> Option<f64> {
        self.mean
    }
}

/// A stream of events as produced by a Data-Action.
pub type EventResult = Result<StatusEvent, PrepError>;

/// Forwards an inner event stream unchanged, so a component can expose the
/// events of the components it drives as its own.
#[derive(Debug)]
pub struct Splice<I> {
    inner: I,
    finished: bool,
}

impl<I> Splice<I>
where
    I: Iterator<Item = EventResult>,
{
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            finished: false,
        }
    }
}

impl<I> Iterator for Splice<I>
where
    I: Iterator<Item = EventResult>,
{
    type Item = EventResult;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let item = self.inner.next();
        if matches!(item, None | Some(Err(_))) {
            self.finished = true;
        }
        item
    }
}

/// Splice an inner event stream into the caller's stream.
pub fn splice<I>(inner: I) -> Splice<I::IntoIter>
where
    I: IntoIterator<Item = EventResult>,
{
    Splice::new(inner.into_iter())
}
