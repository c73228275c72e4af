#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, Cursor, Read};
use std::sync::Mutex;

use brainprep::error::PrepError;
use brainprep::remote::{Method, Request, Response, Transport};
use brainprep::status::{Status, StatusEvent};
use camino::Utf8PathBuf;
use reqwest::header::{
    CONTENT_LENGTH, CONTENT_RANGE, COOKIE, HeaderMap, HeaderName, HeaderValue, LAST_MODIFIED,
    LOCATION, RANGE,
};

pub const SESSION_ID: &str = "0123456789ABCDEF";

pub fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, root)
}

/// Deterministic, non-repeating-looking file content.
pub fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

pub fn statuses(events: &[StatusEvent]) -> Vec<Status> {
    events.iter().filter_map(|event| event.status).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seen {
    pub method: Method,
    pub path: String,
    pub range: Option<String>,
    pub cookie: Option<String>,
}

#[derive(Default)]
struct State {
    served: u64,
    failures: u32,
    drop_after: Option<usize>,
    seen: Vec<Seen>,
}

/// In-memory HTTP server keyed by URL path.
pub struct MockTransport {
    files: HashMap<String, Vec<u8>>,
    redirects: HashMap<String, String>,
    ranges: bool,
    last_modified: Option<String>,
    failure_status: u16,
    login: Option<(String, String)>,
    state: Mutex<State>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            files: HashMap::new(),
            redirects: HashMap::new(),
            ranges: true,
            last_modified: None,
            failure_status: 503,
            login: None,
            state: Mutex::new(State::default()),
        }
    }

    pub fn file(mut self, path: &str, body: Vec<u8>) -> Self {
        self.files.insert(path.to_string(), body);
        self
    }

    pub fn redirect(mut self, from: &str, to: &str) -> Self {
        self.redirects.insert(from.to_string(), to.to_string());
        self
    }

    pub fn without_ranges(mut self) -> Self {
        self.ranges = false;
        self
    }

    pub fn last_modified(mut self, value: &str) -> Self {
        self.last_modified = Some(value.to_string());
        self
    }

    /// Answer the next `count` GET requests with `status`.
    pub fn failing(mut self, count: u32, status: u16) -> Self {
        self.failure_status = status;
        self.state.get_mut().unwrap().failures = count;
        self
    }

    /// Reset the connection of the next GET after `count` body bytes.
    pub fn dropping_after(mut self, count: usize) -> Self {
        self.state.get_mut().unwrap().drop_after = Some(count);
        self
    }

    /// Require an XNAT session opened with these credentials.
    pub fn xnat_login(mut self, user: &str, password: &str) -> Self {
        self.login = Some((user.to_string(), password.to_string()));
        self
    }

    /// Body bytes handed out by GET requests so far.
    pub fn served(&self) -> u64 {
        self.state.lock().unwrap().served
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.state.lock().unwrap().seen.clone()
    }

    pub fn count(&self, method: Method) -> usize {
        self.seen()
            .iter()
            .filter(|seen| seen.method == method)
            .count()
    }
}

fn reply(status: u16, headers: HeaderMap, body: Vec<u8>) -> Response {
    Response {
        status,
        headers,
        body: Box::new(Cursor::new(body)),
    }
}

fn header(value: impl ToString) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap()
}

/// A body whose connection is reset once the buffered bytes run out.
struct Reset(Cursor<Vec<u8>>);

impl Read for Reset {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.read(buf)? {
            0 => Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset")),
            read => Ok(read),
        }
    }
}

impl Transport for MockTransport {
    fn send(&self, request: Request) -> Result<Response, PrepError> {
        let path = request.url.path().to_string();
        let header_value = |name: HeaderName| {
            request
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let range = header_value(RANGE);
        let cookie = header_value(COOKIE);
        let mut state = self.state.lock().unwrap();
        state.seen.push(Seen {
            method: request.method,
            path: path.clone(),
            range: range.clone(),
            cookie: cookie.clone(),
        });

        if let Some((user, password)) = &self.login {
            if request.method == Method::Post && path.ends_with("/data/JSESSION") {
                let accepted = request.basic_auth.as_ref() == Some(&(user.clone(), password.clone()));
                if accepted {
                    return Ok(reply(200, HeaderMap::new(), SESSION_ID.as_bytes().to_vec()));
                }
                return Ok(reply(401, HeaderMap::new(), Vec::new()));
            }
            let session = format!("JSESSIONID={SESSION_ID}");
            if cookie.as_deref() != Some(session.as_str()) {
                return Ok(reply(401, HeaderMap::new(), Vec::new()));
            }
        }

        if let Some(location) = self.redirects.get(&path) {
            let mut headers = HeaderMap::new();
            headers.insert(LOCATION, header(location));
            return Ok(reply(302, headers, Vec::new()));
        }

        if request.method == Method::Get && state.failures > 0 {
            state.failures -= 1;
            return Ok(reply(self.failure_status, HeaderMap::new(), Vec::new()));
        }

        let Some(body) = self.files.get(&path) else {
            return Ok(reply(404, HeaderMap::new(), Vec::new()));
        };
        let total = body.len();
        let mut headers = HeaderMap::new();
        if let Some(value) = &self.last_modified {
            headers.insert(LAST_MODIFIED, header(value));
        }
        let start = range
            .as_deref()
            .filter(|_| self.ranges)
            .and_then(|value| value.strip_prefix("bytes="))
            .and_then(|value| value.split('-').next())
            .and_then(|value| value.parse::<usize>().ok());

        if request.method == Method::Head {
            return Ok(match start {
                Some(_) => {
                    headers.insert(CONTENT_RANGE, header(format!("bytes 0-0/{total}")));
                    headers.insert(CONTENT_LENGTH, header(1));
                    reply(206, headers, Vec::new())
                }
                None => {
                    headers.insert(CONTENT_LENGTH, header(total));
                    reply(200, headers, Vec::new())
                }
            });
        }

        let (status, content) = match start {
            Some(start) if start < total => {
                headers.insert(
                    CONTENT_RANGE,
                    header(format!("bytes {start}-{}/{total}", total - 1)),
                );
                (206, body[start..].to_vec())
            }
            _ => (200, body.clone()),
        };
        headers.insert(CONTENT_LENGTH, header(content.len()));

        if let Some(count) = state.drop_after.take() {
            let truncated = content[..count.min(content.len())].to_vec();
            state.served += truncated.len() as u64;
            return Ok(Response {
                status,
                headers,
                body: Box::new(Reset(Cursor::new(truncated))),
            });
        }
        state.served += content.len() as u64;
        Ok(reply(status, headers, content))
    }
}
