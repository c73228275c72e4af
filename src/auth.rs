//! Credentials for protected remote sources.

use std::fmt;

use reqwest::Url;
use reqwest::header::{COOKIE, HeaderMap, HeaderValue};
use tracing::{debug, info};

use crate::error::PrepError;
use crate::remote::{Method, Request, Transport};

pub const XNAT_USER: &str = "XNAT_USER";
pub const XNAT_PASS: &str = "XNAT_PASS";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Look both values up by name; a blank value counts as missing.
    pub fn from_lookup<F>(user_key: &str, password_key: &str, lookup: F) -> Result<Self, PrepError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        match (value(user_key), value(password_key)) {
            (Some(user), Some(password)) => Ok(Self { user, password }),
            _ => Err(PrepError::MissingCredentials(format!(
                "{user_key} and {password_key}"
            ))),
        }
    }

    pub fn from_env(user_key: &str, password_key: &str) -> Result<Self, PrepError> {
        Self::from_lookup(user_key, password_key, |key| std::env::var(key).ok())
    }
}

/// What a request must carry once authentication succeeded.
#[derive(Debug, Clone)]
pub enum Authorization {
    Basic(Credentials),
    Headers(HeaderMap),
}

impl Authorization {
    pub fn apply(&self, request: Request) -> Request {
        match self {
            Authorization::Basic(credentials) => {
                request.with_basic_auth(&credentials.user, &credentials.password)
            }
            Authorization::Headers(headers) => request.with_headers(headers),
        }
    }
}

/// Obtains an [`Authorization`] for requests to `url`.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, transport: &dyn Transport, url: &Url) -> Result<Authorization, PrepError>;
}

#[derive(Debug, Clone)]
pub struct BasicAuth {
    credentials: Credentials,
}

impl BasicAuth {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl Authenticator for BasicAuth {
    fn authenticate(&self, _transport: &dyn Transport, _url: &Url) -> Result<Authorization, PrepError> {
        Ok(Authorization::Basic(self.credentials.clone()))
    }
}

/// Session login against an XNAT server: the credentials are exchanged
/// once for a `JSESSIONID` cookie sent with every later request.
#[derive(Debug, Clone)]
pub struct XnatAuth {
    server: Option<Url>,
    credentials: Credentials,
}

impl XnatAuth {
    pub fn new(server: Option<Url>, credentials: Credentials) -> Self {
        Self {
            server,
            credentials,
        }
    }

    pub fn from_env(server: Option<Url>) -> Result<Self, PrepError> {
        Ok(Self::new(server, Credentials::from_env(XNAT_USER, XNAT_PASS)?))
    }

    fn session_url(&self, url: &Url) -> Result<Url, PrepError> {
        let server = match &self.server {
            Some(server) => server.clone(),
            None => Url::parse(&url.origin().ascii_serialization()).map_err(|err| {
                PrepError::InvalidUrl {
                    url: url.to_string(),
                    message: err.to_string(),
                }
            })?,
        };
        let base = server.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}/data/JSESSION")).map_err(|err| PrepError::InvalidUrl {
            url: server.to_string(),
            message: err.to_string(),
        })
    }
}

impl Authenticator for XnatAuth {
    fn authenticate(&self, transport: &dyn Transport, url: &Url) -> Result<Authorization, PrepError> {
        let login = self.session_url(url)?;
        debug!(url = %login, user = %self.credentials.user, "opening XNAT session");
        let request = Request::new(Method::Post, login.clone())
            .with_basic_auth(&self.credentials.user, &self.credentials.password);
        let response = transport.send(request)?;
        if !response.is_success() {
            return Err(PrepError::Auth(format!(
                "{login} answered status {}",
                response.status
            )));
        }
        let session = response.into_text()?;
        let session = session.trim();
        if session.is_empty() {
            return Err(PrepError::Auth(format!("{login} returned an empty session id")));
        }
        let cookie = HeaderValue::from_str(&format!("JSESSIONID={session}"))
            .map_err(|err| PrepError::Auth(format!("invalid session id: {err}")))?;
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, cookie);
        info!(server = %login, "XNAT session opened");
        Ok(Authorization::Headers(headers))
    }
}
