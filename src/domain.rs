use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::digest::ExpectedDigests;
use crate::error::PrepError;

/// What to do when the destination of a Data-Action already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
pub enum ExistencePolicy {
    #[serde(rename = "skip")]
    #[value(name = "skip")]
    Skip,
    #[serde(rename = "overwrite")]
    #[value(name = "overwrite")]
    Overwrite,
    #[default]
    #[serde(rename = "different")]
    #[value(name = "different")]
    DifferByMetadata,
    #[serde(rename = "refresh")]
    #[value(name = "refresh")]
    RefreshIfStale,
    #[serde(rename = "error")]
    #[value(name = "error")]
    ErrorIfPresent,
}

impl fmt::Display for ExistencePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExistencePolicy::Skip => write!(f, "skip"),
            ExistencePolicy::Overwrite => write!(f, "overwrite"),
            ExistencePolicy::DifferByMetadata => write!(f, "different"),
            ExistencePolicy::RefreshIfStale => write!(f, "refresh"),
            ExistencePolicy::ErrorIfPresent => write!(f, "error"),
        }
    }
}

impl FromStr for ExistencePolicy {
    type Err = PrepError;

    /// Accepts the full names as well as their first letter.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().chars().next() {
            Some('s') => Ok(ExistencePolicy::Skip),
            Some('o') => Ok(ExistencePolicy::Overwrite),
            Some('d') => Ok(ExistencePolicy::DifferByMetadata),
            Some('r') => Ok(ExistencePolicy::RefreshIfStale),
            Some('e') => Ok(ExistencePolicy::ErrorIfPresent),
            _ => Err(PrepError::InvalidSetting(format!("ifexists: {value}"))),
        }
    }
}

/// Behaviour when a partial file exists but no digest was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IfNoDigest {
    #[default]
    Restart,
    Continue,
}

impl FromStr for IfNoDigest {
    type Err = PrepError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().chars().next() {
            Some('r') => Ok(IfNoDigest::Restart),
            Some('c') => Ok(IfNoDigest::Continue),
            _ => Err(PrepError::InvalidSetting(format!("if_no_digest: {value}"))),
        }
    }
}

/// How a batch row names its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PathDisplay {
    #[default]
    Name,
    Full,
    #[serde(rename = "abs")]
    #[value(name = "abs")]
    Absolute,
    Short,
}

impl FromStr for PathDisplay {
    type Err = PrepError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().chars().next() {
            Some('n') => Ok(PathDisplay::Name),
            Some('f') => Ok(PathDisplay::Full),
            Some('a') => Ok(PathDisplay::Absolute),
            Some('s') => Ok(PathDisplay::Short),
            _ => Err(PrepError::InvalidSetting(format!("path: {value}"))),
        }
    }
}

/// Whether a batch turns action errors into `status: error` rows or stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Yield,
    Raise,
}

/// What a producer is handed to write its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputKind {
    /// An open, writable handle on the in-progress file.
    #[default]
    File,
    /// The path of the in-progress file; the producer opens it itself.
    Path,
}

/// One output file and everything known about it in advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTarget {
    pub destination: Utf8PathBuf,
    pub size: Option<u64>,
    pub mtime: Option<DateTime<Utc>>,
    pub digests: ExpectedDigests,
}

impl TransferTarget {
    pub fn new(destination: impl Into<Utf8PathBuf>) -> Self {
        Self {
            destination: destination.into(),
            size: None,
            mtime: None,
            digests: ExpectedDigests::new(),
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_mtime(mut self, mtime: DateTime<Utc>) -> Self {
        self.mtime = Some(mtime);
        self
    }

    pub fn with_digests(mut self, digests: ExpectedDigests) -> Self {
        self.digests = digests;
        self
    }

    pub fn destination(&self) -> &Utf8Path {
        &self.destination
    }
}
