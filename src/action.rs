//! Generic file-producing Data-Action.
//!
//! An [`Action`] writes one destination through a [`Producer`], inheriting
//! the newest modification time of its declared sources. It shares the
//! lock, policy and atomic-promotion machinery with the downloader.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use tracing::{debug, error, info};

use crate::digest::{ExpectedDigests, file_digest};
use crate::domain::{ExistencePolicy, InputKind, TransferTarget};
use crate::error::PrepError;
use crate::partial::{PartialOptions, PartialTransfer};
use crate::policy::{PolicyContext, Verdict, evaluate};
use crate::producers::{OutputTarget, Producer, Step};
use crate::status::{ChecksumState, EventResult, Status, StatusEvent};
use crate::store::{newest_mtime, set_mtime};

/// A unit of work that yields status events while producing one file.
///
/// Nothing happens until the action is iterated.
pub trait DataAction: Iterator<Item = EventResult> {
    fn destination(&self) -> &Utf8Path;

    /// Settle the effective existence policy from the enclosing scope.
    fn apply_policy(&mut self, context: &PolicyContext);

    /// Drain the action for its side effect, discarding events.
    fn run(&mut self) -> Result<(), PrepError> {
        while let Some(event) = self.next() {
            event?;
        }
        Ok(())
    }
}

impl<A: DataAction + ?Sized> DataAction for Box<A> {
    fn destination(&self) -> &Utf8Path {
        (**self).destination()
    }

    fn apply_policy(&mut self, context: &PolicyContext) {
        (**self).apply_policy(context)
    }
}

pub struct Action {
    target: TransferTarget,
    sources: Vec<Utf8PathBuf>,
    producer: Box<dyn Producer>,
    policy: Option<ExistencePolicy>,
    state: State,
}

enum State {
    Probe,
    Policy,
    Open,
    Produce(PartialTransfer),
    Verify,
    Finalize,
    Done,
    Finished,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("target", &self.target)
            .field("sources", &self.sources)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Action {
    pub fn new(destination: impl Into<Utf8PathBuf>, producer: impl Producer + 'static) -> Self {
        Self {
            target: TransferTarget::new(destination),
            sources: Vec::new(),
            producer: Box::new(producer),
            policy: None,
            state: State::Probe,
        }
    }

    /// Files the output is derived from; the output inherits their newest
    /// modification time.
    pub fn with_sources<I, P>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_policy(mut self, policy: ExistencePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.target.size = Some(size);
        self
    }

    pub fn with_digests(mut self, digests: ExpectedDigests) -> Self {
        self.target.digests = digests;
        self
    }

    pub fn target(&self) -> &TransferTarget {
        &self.target
    }

    fn step(&mut self) -> Result<Option<StatusEvent>, PrepError> {
        match std::mem::replace(&mut self.state, State::Finished) {
            State::Probe => {
                if self.target.mtime.is_none() {
                    self.target.mtime = newest_mtime(&self.sources)?;
                }
                self.state = State::Policy;
                Ok(None)
            }
            State::Policy => match evaluate(&self.target, self.policy.unwrap_or_default())? {
                Verdict::Skip(event) => Ok(Some(event)),
                Verdict::Proceed => {
                    self.state = State::Open;
                    Ok(None)
                }
            },
            State::Open => {
                let partial =
                    PartialTransfer::acquire(self.target.destination(), &PartialOptions::fresh())?;
                self.state = State::Produce(partial);
                Ok(None)
            }
            State::Produce(partial) => self.produce(partial),
            State::Verify => self.verify().map(Some),
            State::Finalize => {
                let dst = self.target.destination();
                set_mtime(dst, self.target.mtime.unwrap_or_else(Utc::now))?;
                self.state = State::Done;
                Ok(Some(StatusEvent::setting_mtime()))
            }
            State::Done => {
                info!(path = %self.target.destination(), "written");
                Ok(Some(StatusEvent::done()))
            }
            State::Finished => Ok(None),
        }
    }

    fn produce(&mut self, mut partial: PartialTransfer) -> Result<Option<StatusEvent>, PrepError> {
        let stepped = match self.producer.input() {
            InputKind::File => self.producer.step(OutputTarget::File(&mut partial), &self.sources),
            InputKind::Path => {
                let path = partial.partial_path().to_path_buf();
                self.producer.step(OutputTarget::Path(&path), &self.sources)
            }
        };
        match stepped {
            Ok(Step::Event(mut event)) => {
                if event.status == Some(Status::Error) {
                    error!(path = %self.target.destination(), message = ?event.message, "producer reported an error");
                    return Ok(Some(event));
                }
                // The action owns the terminal status of its row.
                event.status = None;
                self.state = State::Produce(partial);
                Ok(Some(event))
            }
            Ok(Step::Finished) => {
                partial.commit()?;
                self.state = State::Verify;
                Ok(None)
            }
            Err(err) => {
                error!(path = %self.target.destination(), %err, "producer failed");
                Ok(Some(StatusEvent::error(err.to_string())))
            }
        }
    }

    fn verify(&mut self) -> Result<StatusEvent, PrepError> {
        let dst = self.target.destination();
        let Some((algorithm, expected)) = self.target.digests.authoritative() else {
            self.state = State::Finalize;
            return Ok(StatusEvent::checksum(ChecksumState::Unverified));
        };
        let actual = file_digest(dst, algorithm)?;
        if actual == expected {
            debug!(path = %dst, %algorithm, "checksum ok");
            self.state = State::Finalize;
            return Ok(StatusEvent::checksum(ChecksumState::Ok));
        }
        error!(path = %dst, %algorithm, %expected, %actual, "checksum differs");
        Ok(StatusEvent::checksum_differs(format!(
            "{algorithm} checksum differs: expected {expected}, got {actual}"
        )))
    }
}

impl Iterator for Action {
    type Item = EventResult;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if matches!(self.state, State::Finished) {
                return None;
            }
            match self.step() {
                Ok(Some(event)) => {
                    if event.is_terminal() {
                        self.state = State::Finished;
                    }
                    return Some(Ok(event));
                }
                Ok(None) => continue,
                Err(err) => {
                    self.state = State::Finished;
                    return Some(Err(err));
                }
            }
        }
    }
}

impl DataAction for Action {
    fn destination(&self) -> &Utf8Path {
        self.target.destination()
    }

    fn apply_policy(&mut self, context: &PolicyContext) {
        self.policy = Some(context.resolve(self.policy));
    }
}
