use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

/// HTTP statuses handled by the same retry path as connection faults.
///
/// 400 is part of the set: some storage backends answer a throttled or
/// momentarily malformed signed URL with Bad Request.
pub const RETRY_STATUSES: [u16; 5] = [400, 500, 502, 503, 504];

#[derive(Debug, Error, Diagnostic)]
pub enum PrepError {
    #[error("file {0} already exists")]
    #[diagnostic(help("rerun with another --ifexists policy to replace or skip it"))]
    AlreadyExists(Utf8PathBuf),

    #[error("could not acquire download lock for {0}")]
    #[diagnostic(help(
        "another process is writing this file; if none is, remove the .lock file next to it"
    ))]
    LockHeld(Utf8PathBuf),

    #[error("invalid URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("unknown digest algorithm: {0}")]
    UnknownDigest(String),

    #[error("invalid {algorithm} digest: {value}")]
    InvalidDigest { algorithm: String, value: String },

    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("server returned status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("missing credentials: set {0}")]
    MissingCredentials(String),

    #[error("missing manifest file brainprep.json in current directory")]
    MissingConfig,

    #[error("failed to read manifest at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON manifest: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("producer failed: {0}")]
    Producer(String),
}

impl PrepError {
    /// Whether the download retry loop may try again after this fault.
    pub fn is_transient(&self) -> bool {
        match self {
            PrepError::Network(_) => true,
            PrepError::HttpStatus { status, .. } => RETRY_STATUSES.contains(status),
            _ => false,
        }
    }

    /// Faults raised by the remote side of a transfer. Once retries are
    /// exhausted these become `status: error` events instead of errors.
    pub fn is_transfer_fault(&self) -> bool {
        matches!(self, PrepError::Network(_) | PrepError::HttpStatus { .. })
    }

    /// Caller mistakes that must never be retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PrepError::InvalidUrl { .. }
                | PrepError::UnknownDigest(_)
                | PrepError::InvalidDigest { .. }
                | PrepError::InvalidSetting(_)
                | PrepError::MissingCredentials(_)
        )
    }
}

impl From<reqwest::Error> for PrepError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            let url = err
                .url()
                .map(|url| url.to_string())
                .unwrap_or_else(|| "<unknown>".to_string());
            return PrepError::InvalidUrl {
                url,
                message: err.to_string(),
            };
        }
        PrepError::Network(err.to_string())
    }
}
