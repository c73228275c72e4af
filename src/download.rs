//! The Downloader Data-Action.
//!
//! A [`Downloader`] is pulled for its [`StatusEvent`]s and does nothing until
//! iterated. One run goes through probe, policy check, transfer, verify and
//! finalize; the transfer is retried on transient faults, each attempt
//! re-acquiring the partial-transfer state so resume is decided afresh.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use reqwest::Url;
use tracing::{debug, error, info, warn};

use crate::action::DataAction;
use crate::auth::Authenticator;
use crate::digest::ExpectedDigests;
use crate::domain::{ExistencePolicy, IfNoDigest, TransferTarget};
use crate::error::PrepError;
use crate::partial::{PartialOptions, PartialTransfer};
use crate::policy::{PolicyContext, Verdict, evaluate};
use crate::remote::{HttpTransport, RemoteSource, RemoteStream, Transport};
use crate::status::{ChecksumState, EventResult, StatusEvent};
use crate::store::set_mtime;

pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(2);

pub struct Downloader {
    url: Url,
    target: TransferTarget,
    transport: Option<Arc<dyn Transport>>,
    auth: Option<Arc<dyn Authenticator>>,
    source: Option<RemoteSource>,
    policy: Option<ExistencePolicy>,
    if_no_digest: IfNoDigest,
    chunk_size: usize,
    max_attempts: u32,
    max_backoff: Duration,
    attempt: u32,
    state: State,
}

enum State {
    Probe,
    Policy,
    Attempt,
    Streaming(Box<Transfer>),
    Verify(Option<String>),
    Finalize,
    Done,
    Finished,
}

struct Transfer {
    partial: PartialTransfer,
    stream: RemoteStream,
    overrun_warned: bool,
}

impl fmt::Debug for Downloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Downloader")
            .field("url", &self.url.as_str())
            .field("target", &self.target)
            .field("policy", &self.policy)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

impl Downloader {
    /// Download `url` to `destination`. A directory destination, or none at
    /// all, receives the file under the last segment of the URL path.
    pub fn new(url: &str, destination: Option<&Utf8Path>) -> Result<Self, PrepError> {
        let url = Url::parse(url).map_err(|err| PrepError::InvalidUrl {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        let destination = infer_destination(&url, destination)?;
        Ok(Self {
            url,
            target: TransferTarget::new(destination),
            transport: None,
            auth: None,
            source: None,
            policy: None,
            if_no_digest: IfNoDigest::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_backoff: DEFAULT_MAX_BACKOFF,
            attempt: 0,
            state: State::Probe,
        })
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_auth(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.target.size = Some(size);
        self
    }

    pub fn with_mtime(mut self, mtime: DateTime<Utc>) -> Self {
        self.target.mtime = Some(mtime);
        self
    }

    pub fn with_digests(mut self, digests: ExpectedDigests) -> Self {
        self.target.digests = digests;
        self
    }

    pub fn with_policy(mut self, policy: ExistencePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_if_no_digest(mut self, if_no_digest: IfNoDigest) -> Self {
        self.if_no_digest = if_no_digest;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Upper bound of the random pause between attempts.
    pub fn with_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn target(&self) -> &TransferTarget {
        &self.target
    }

    fn source(&mut self) -> Result<&mut RemoteSource, PrepError> {
        if self.source.is_none() {
            let transport: Arc<dyn Transport> = match &self.transport {
                Some(transport) => Arc::clone(transport),
                None => Arc::new(HttpTransport::new()?),
            };
            let mut source = RemoteSource::new(self.url.clone(), transport);
            if let Some(auth) = &self.auth {
                source = source.with_auth(Arc::clone(auth));
            }
            self.source = Some(source);
        }
        self.source
            .as_mut()
            .ok_or_else(|| PrepError::Network(format!("no source for {}", self.url)))
    }

    /// Advance the state machine; `Ok(None)` is a transition without an event.
    fn step(&mut self) -> Result<Option<StatusEvent>, PrepError> {
        match std::mem::replace(&mut self.state, State::Finished) {
            State::Probe => {
                let known_size = self.target.size;
                let known_mtime = self.target.mtime;
                let source = self.source()?;
                let size = known_size.or_else(|| source.size());
                let mtime = known_mtime.or_else(|| source.mtime());
                self.target.size = size;
                self.target.mtime = mtime;
                self.state = State::Policy;
                Ok(Some(StatusEvent::probed(size)))
            }
            State::Policy => {
                let policy = self.policy.unwrap_or_default();
                match evaluate(&self.target, policy)? {
                    Verdict::Skip(event) => Ok(Some(event)),
                    Verdict::Proceed => {
                        self.state = State::Attempt;
                        Ok(None)
                    }
                }
            }
            State::Attempt => self.attempt(),
            State::Streaming(transfer) => self.stream(transfer),
            State::Verify(actual) => Ok(Some(self.verify(actual))),
            State::Finalize => {
                let dst = self.target.destination();
                let mtime = self.target.mtime.unwrap_or_else(Utc::now);
                set_mtime(dst, mtime)?;
                debug!(path = %dst, %mtime, "modification time set");
                self.state = State::Done;
                Ok(Some(StatusEvent::setting_mtime()))
            }
            State::Done => {
                info!(path = %self.target.destination(), "download complete");
                Ok(Some(StatusEvent::done()))
            }
            State::Finished => Ok(None),
        }
    }

    fn attempt(&mut self) -> Result<Option<StatusEvent>, PrepError> {
        self.attempt += 1;
        let expected = self
            .target
            .digests
            .authoritative()
            .map(|(algorithm, value)| (algorithm, value.to_string()));
        let options = PartialOptions::resumable(expected, self.if_no_digest);
        let mut partial = PartialTransfer::acquire(self.target.destination(), &options)?;

        if let Some(size) = self.target.size {
            if partial.offset() == size {
                debug!(path = %self.target.destination(), size, "partial file already complete");
                let actual = partial.commit()?;
                self.state = State::Verify(actual);
                return Ok(None);
            }
            if partial.offset() > size {
                warn!(
                    path = %self.target.destination(),
                    offset = partial.offset(),
                    size,
                    "partial file is larger than the remote file: restarting"
                );
                partial.restart()?;
            }
        }

        let offset = partial.offset();
        let chunk_size = self.chunk_size;
        let opened = self.source()?.open(offset, chunk_size);
        match opened {
            Ok(stream) => {
                debug!(path = %self.target.destination(), offset, attempt = self.attempt, "streaming");
                self.state = State::Streaming(Box::new(Transfer {
                    partial,
                    stream,
                    overrun_warned: false,
                }));
                Ok(None)
            }
            Err(err) => {
                drop(partial);
                self.fault(err)
            }
        }
    }

    fn stream(&mut self, mut transfer: Box<Transfer>) -> Result<Option<StatusEvent>, PrepError> {
        let size = self.target.size;
        match transfer.stream.next() {
            Some(Ok(chunk)) => {
                transfer.partial.append(&chunk)?;
                let done = transfer.partial.position();
                if let Some(size) = size {
                    if done > size && !transfer.overrun_warned {
                        warn!(
                            path = %self.target.destination(),
                            done,
                            size,
                            "received more bytes than the expected size"
                        );
                        transfer.overrun_warned = true;
                    }
                }
                let event = StatusEvent::transfer(done, size).with_speeds(
                    transfer.stream.read_speed().mean(),
                    transfer.partial.write_speed().mean(),
                );
                self.state = State::Streaming(transfer);
                Ok(Some(event))
            }
            Some(Err(err)) => {
                drop(transfer);
                self.fault(err)
            }
            None => {
                let done = transfer.partial.position();
                if let Some(size) = size.filter(|size| done < *size) {
                    drop(transfer);
                    return self.fault(PrepError::Network(format!(
                        "connection closed after {done} of {size} bytes"
                    )));
                }
                let actual = transfer.partial.commit()?;
                self.state = State::Verify(actual);
                Ok(None)
            }
        }
    }

    /// Route a transfer fault: retry while attempts remain, report it as a
    /// `status: error` event once they are exhausted, raise anything else.
    fn fault(&mut self, err: PrepError) -> Result<Option<StatusEvent>, PrepError> {
        let dst = self.target.destination();
        if err.is_transient() && self.attempt < self.max_attempts {
            let pause = self.backoff();
            warn!(
                path = %dst,
                attempt = self.attempt,
                max_attempts = self.max_attempts,
                %err,
                "transfer failed: retrying in {:.1}s",
                pause.as_secs_f64()
            );
            if !pause.is_zero() {
                thread::sleep(pause);
            }
            self.state = State::Attempt;
            return Ok(None);
        }
        if err.is_transfer_fault() {
            error!(path = %dst, attempt = self.attempt, %err, "transfer failed");
            return Ok(Some(StatusEvent::error(err.to_string())));
        }
        Err(err)
    }

    fn backoff(&self) -> Duration {
        if self.max_backoff.is_zero() {
            return Duration::ZERO;
        }
        self.max_backoff.mul_f64(rand::random::<f64>())
    }

    fn verify(&mut self, actual: Option<String>) -> StatusEvent {
        let dst = self.target.destination();
        let Some((algorithm, expected)) = self.target.digests.authoritative() else {
            debug!(path = %dst, "no digest declared: not verified");
            self.state = State::Finalize;
            return StatusEvent::checksum(ChecksumState::Unverified);
        };
        match actual {
            Some(actual) if actual == expected => {
                debug!(path = %dst, %algorithm, "checksum ok");
                self.state = State::Finalize;
                StatusEvent::checksum(ChecksumState::Ok)
            }
            actual => {
                let actual = actual.unwrap_or_else(|| "<none>".to_string());
                error!(path = %dst, %algorithm, %expected, %actual, "checksum differs");
                StatusEvent::checksum_differs(format!(
                    "{algorithm} checksum differs: expected {expected}, got {actual}"
                ))
            }
        }
    }
}

impl Iterator for Downloader {
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

impl DataAction for Downloader {
    fn destination(&self) -> &Utf8Path {
        self.target.destination()
    }

    fn apply_policy(&mut self, context: &PolicyContext) {
        self.policy = Some(context.resolve(self.policy));
    }
}

fn infer_destination(url: &Url, destination: Option<&Utf8Path>) -> Result<Utf8PathBuf, PrepError> {
    let into_directory = match destination {
        None => true,
        Some(path) => path.as_str().ends_with('/') || path.is_dir(),
    };
    if !into_directory {
        return Ok(destination.map(Utf8Path::to_path_buf).unwrap_or_default());
    }
    let name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| PrepError::InvalidUrl {
            url: url.to_string(),
            message: "no file name to infer the destination from".to_string(),
        })?;
    Ok(match destination {
        Some(directory) => directory.join(name),
        None => Utf8PathBuf::from(name),
    })
}
