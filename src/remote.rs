//! Remote reader: probes a URL and streams its body from an offset.

use std::fmt;
use std::io::{self, Read};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::header::{
    CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, HeaderName, HeaderValue, LAST_MODIFIED, LOCATION,
    RANGE, USER_AGENT,
};
use tracing::{debug, warn};

use crate::auth::{Authenticator, Authorization};
use crate::error::PrepError;
use crate::status::Throughput;

/// Statuses answered with a `Location` to follow.
pub const REDIRECTION: [u16; 6] = [300, 301, 302, 303, 307, 308];

static CONTENT_RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^bytes\s+(?:(\d+)-\d+|\*)/(\d+|\*)$").expect("content-range pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Head,
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub basic_auth: Option<(String, String)>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            basic_auth: None,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_headers(mut self, headers: &HeaderMap) -> Self {
        for (name, value) in headers {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn with_basic_auth(mut self, user: &str, password: &str) -> Self {
        self.basic_auth = Some((user.to_string(), password.to_string()));
        self
    }
}

pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Box<dyn Read + Send>,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn into_text(mut self) -> Result<String, PrepError> {
        let mut text = String::new();
        self.body
            .read_to_string(&mut text)
            .map_err(|err| PrepError::Network(format!("read body: {err}")))?;
        Ok(text)
    }

    /// Total size of the resource, from `Content-Range` on a partial reply
    /// or `Content-Length` otherwise.
    pub fn total_size(&self) -> Option<u64> {
        if self.status == 206 {
            return self.header(CONTENT_RANGE).and_then(parse_content_range_total);
        }
        self.header(CONTENT_LENGTH)
            .and_then(|value| value.trim().parse().ok())
    }

    /// First byte of a partial reply, from its `Content-Range`.
    pub fn range_start(&self) -> Option<u64> {
        if self.status != 206 {
            return None;
        }
        self.header(CONTENT_RANGE).and_then(parse_content_range_start)
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.header(LAST_MODIFIED)
            .and_then(|value| DateTime::parse_from_rfc2822(value.trim()).ok())
            .map(|value| value.with_timezone(&Utc))
    }
}

/// One HTTP exchange. Implementations must not follow redirects.
pub trait Transport: Send + Sync {
    fn send(&self, request: Request) -> Result<Response, PrepError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, PrepError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("brainprep/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PrepError::Network(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(None::<Duration>)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| PrepError::Network(err.to_string()))?;

        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: Request) -> Result<Response, PrepError> {
        let method = match request.method {
            Method::Head => reqwest::Method::HEAD,
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        };
        let mut builder = self
            .client
            .request(method, request.url)
            .headers(request.headers);
        if let Some((user, password)) = request.basic_auth {
            builder = builder.basic_auth(user, Some(password));
        }
        let response = builder.send()?;
        Ok(Response {
            status: response.status().as_u16(),
            headers: response.headers().clone(),
            body: Box::new(response),
        })
    }
}

/// A remote file. Probed properties are fetched once and cached.
pub struct RemoteSource {
    url: Url,
    transport: Arc<dyn Transport>,
    auth: Option<Arc<dyn Authenticator>>,
    authorization: Option<Authorization>,
    probed: bool,
    has_range: bool,
    size: Option<u64>,
    mtime: Option<DateTime<Utc>>,
}

impl fmt::Debug for RemoteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSource")
            .field("url", &self.url.as_str())
            .field("has_range", &self.has_range)
            .field("size", &self.size)
            .field("mtime", &self.mtime)
            .finish_non_exhaustive()
    }
}

impl RemoteSource {
    pub fn new(url: Url, transport: Arc<dyn Transport>) -> Self {
        Self {
            url,
            transport,
            auth: None,
            authorization: None,
            probed: false,
            has_range: false,
            size: None,
            mtime: None,
        }
    }

    pub fn with_auth(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Whether the server honours byte ranges.
    pub fn has_range(&mut self) -> bool {
        self.probe();
        self.has_range
    }

    pub fn size(&mut self) -> Option<u64> {
        self.probe();
        self.size
    }

    pub fn mtime(&mut self) -> Option<DateTime<Utc>> {
        self.probe();
        self.mtime
    }

    /// One `HEAD` asking for the first byte answers all three probes.
    fn probe(&mut self) {
        if self.probed {
            return;
        }
        self.probed = true;
        let mut headers = HeaderMap::new();
        headers.insert(RANGE, HeaderValue::from_static("bytes=0-0"));
        match self.send(Method::Head, headers) {
            Ok(response) if response.is_success() => {
                self.has_range = response.status == 206;
                self.record(&response);
                debug!(url = %self.url, has_range = self.has_range, size = ?self.size, "probed remote");
            }
            Ok(response) => {
                debug!(url = %self.url, status = response.status, "probe was refused");
            }
            Err(err) => {
                debug!(url = %self.url, %err, "probe failed");
            }
        }
    }

    fn record(&mut self, response: &Response) {
        if self.size.is_none() {
            self.size = response.total_size();
        }
        if self.mtime.is_none() {
            self.mtime = response.last_modified();
        }
    }

    /// Stream the body starting at byte `offset`, in chunks of `chunk_size`.
    ///
    /// A server that cannot honour the range is read from the start and the
    /// first `offset` bytes are discarded.
    pub fn open(&mut self, offset: u64, chunk_size: usize) -> Result<RemoteStream, PrepError> {
        let mut headers = HeaderMap::new();
        let ask_range = offset > 0 && self.has_range();
        if ask_range {
            let value = HeaderValue::from_str(&format!("bytes={offset}-"))
                .map_err(|err| PrepError::Network(err.to_string()))?;
            headers.insert(RANGE, value);
        }
        let response = self.send(Method::Get, headers)?;
        if !response.is_success() {
            return Err(PrepError::HttpStatus {
                status: response.status,
                url: self.url.to_string(),
            });
        }
        if response.status != 206 {
            self.size = response.total_size().or(self.size);
        }
        self.record(&response);
        let ranged = response.status == 206;
        if ranged {
            match response.range_start() {
                Some(start) if start == offset => {}
                start => {
                    return Err(PrepError::Network(format!(
                        "{} answered range bytes={offset}- starting at {}",
                        self.url,
                        start.map_or_else(|| "an unknown offset".to_string(), |start| start.to_string())
                    )));
                }
            }
        }
        let mut stream = RemoteStream::new(response.body, chunk_size);
        if offset > 0 && !ranged {
            if ask_range {
                warn!(url = %self.url, "server ignored the range request: skipping {offset} bytes");
            } else {
                debug!(url = %self.url, "no range support: skipping {offset} bytes");
            }
            stream.discard(offset)?;
        }
        Ok(stream)
    }

    /// Send one request, following a single redirect. Authentication runs
    /// before the first request and once more if the server refuses it.
    fn send(&mut self, method: Method, headers: HeaderMap) -> Result<Response, PrepError> {
        if self.auth.is_some() && self.authorization.is_none() {
            self.login()?;
        }
        let mut url = self.url.clone();
        let mut redirected = false;
        let mut reauthenticated = false;
        loop {
            let mut request = Request::new(method, url.clone()).with_headers(&headers);
            if url.host_str() == self.url.host_str() {
                if let Some(authorization) = &self.authorization {
                    request = authorization.apply(request);
                }
            }
            let response = self.transport.send(request)?;
            match response.status {
                status if REDIRECTION.contains(&status) && !redirected => {
                    let location = response.header(LOCATION).ok_or_else(|| {
                        PrepError::Network(format!("redirect from {url} without a location"))
                    })?;
                    url = url.join(location).map_err(|err| PrepError::InvalidUrl {
                        url: location.to_string(),
                        message: err.to_string(),
                    })?;
                    debug!(from = %self.url, to = %url, "following redirect");
                    redirected = true;
                }
                401 | 403 if !reauthenticated && self.auth.is_some() => {
                    debug!(url = %url, status = response.status, "credentials refused: logging in again");
                    self.login()?;
                    reauthenticated = true;
                }
                _ => return Ok(response),
            }
        }
    }

    fn login(&mut self) -> Result<(), PrepError> {
        if let Some(auth) = &self.auth {
            self.authorization = Some(auth.authenticate(self.transport.as_ref(), &self.url)?);
        }
        Ok(())
    }
}

/// Body of a remote file as fixed-size chunks; only the last one may be
/// shorter than the chunk size.
pub struct RemoteStream {
    body: Box<dyn Read + Send>,
    chunk_size: usize,
    received: u64,
    speed: Throughput,
    fault: Option<io::Error>,
    finished: bool,
}

impl RemoteStream {
    fn new(body: Box<dyn Read + Send>, chunk_size: usize) -> Self {
        Self {
            body,
            chunk_size: chunk_size.max(1),
            received: 0,
            speed: Throughput::default(),
            fault: None,
            finished: false,
        }
    }

    pub fn read_speed(&self) -> &Throughput {
        &self.speed
    }

    /// Bytes yielded so far, discarded prefix excluded.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Read and drop the first `count` bytes. Skipped bytes still count
    /// towards the read speed, not towards `received`.
    fn discard(&mut self, count: u64) -> Result<(), PrepError> {
        let mut buffer = vec![0; self.chunk_size];
        let mut skipped = 0;
        while skipped < count {
            let want = (count - skipped).min(self.chunk_size as u64) as usize;
            let started = Instant::now();
            let read = match self.body.read(&mut buffer[..want]) {
                Ok(0) => {
                    return Err(PrepError::Network(format!(
                        "body ended after {skipped} of {count} skipped bytes"
                    )));
                }
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(PrepError::Network(format!("skip body prefix: {err}"))),
            };
            self.speed.record(skipped, read, started.elapsed());
            skipped += read as u64;
        }
        Ok(())
    }

    /// Read until the chunk is full or the body ends. A fault after some
    /// bytes arrived is held back so those bytes are still delivered.
    fn fill(&mut self) -> Vec<u8> {
        let mut buffer = vec![0; self.chunk_size];
        let mut filled = 0;
        while filled < buffer.len() {
            match self.body.read(&mut buffer[filled..]) {
                Ok(0) => {
                    self.finished = true;
                    break;
                }
                Ok(read) => filled += read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.fault = Some(err);
                    break;
                }
            }
        }
        buffer.truncate(filled);
        buffer
    }
}

impl Iterator for RemoteStream {
    type Item = Result<Vec<u8>, PrepError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.fault.take() {
            self.finished = true;
            return Some(Err(PrepError::Network(format!("read body: {err}"))));
        }
        if self.finished {
            return None;
        }
        let started = Instant::now();
        let chunk = self.fill();
        if chunk.is_empty() {
            return self.next();
        }
        self.speed.record(self.received, chunk.len(), started.elapsed());
        self.received += chunk.len() as u64;
        Some(Ok(chunk))
    }
}

fn parse_content_range_total(value: &str) -> Option<u64> {
    let captures = CONTENT_RANGE_RE.captures(value.trim())?;
    captures.get(2)?.as_str().parse().ok()
}

fn parse_content_range_start(value: &str) -> Option<u64> {
    let captures = CONTENT_RANGE_RE.captures(value.trim())?;
    captures.get(1)?.as_str().parse().ok()
}
