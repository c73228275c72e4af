use std::collections::BTreeMap;
use std::fs;
use std::str::FromStr;
use std::sync::Arc;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::auth::{Authenticator, BasicAuth, Credentials, XNAT_PASS, XNAT_USER, XnatAuth};
use crate::batch::BatchOptions;
use crate::digest::ExpectedDigests;
use crate::domain::{ExistencePolicy, IfNoDigest, OnError, PathDisplay};
use crate::download::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_ATTEMPTS, Downloader};
use crate::error::PrepError;

pub const DEFAULT_MANIFEST: &str = "brainprep.json";
pub const BASIC_USER: &str = "BRAINPREP_USER";
pub const BASIC_PASS: &str = "BRAINPREP_PASS";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub downloads: Vec<DownloadEntry>,
}

/// Batch-wide settings. Enumerations are plain strings so the short
/// spellings (`"s"`, `"o"`, ...) are accepted as well.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub ifexists: Option<String>,
    #[serde(default)]
    pub if_no_digest: Option<String>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub on_error: Option<String>,
    #[serde(default)]
    pub dst: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    Basic,
    Xnat,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AuthConfig {
    pub kind: AuthKind,
    #[serde(default)]
    pub server: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DownloadEntry {
    Shorthand(String),
    Detailed(DownloadEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DownloadEntryObject {
    pub url: String,
    #[serde(default)]
    pub dst: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub mtime: Option<String>,
    #[serde(default)]
    pub digests: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub dst: Option<Utf8PathBuf>,
    pub size: Option<u64>,
    pub mtime: Option<DateTime<Utc>>,
    pub digests: ExpectedDigests,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub batch: BatchOptions,
    pub if_no_digest: IfNoDigest,
    pub chunk_size: usize,
    pub max_attempts: u32,
    pub dst: Option<Utf8PathBuf>,
    pub auth: Option<AuthKind>,
    pub auth_server: Option<Url>,
    pub downloads: Vec<DownloadRequest>,
}

impl ResolvedConfig {
    /// Build the authenticator named in the manifest, reading credentials
    /// through `lookup` (the process environment in the binary).
    pub fn authenticator<F>(&self, lookup: F) -> Result<Option<Arc<dyn Authenticator>>, PrepError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(kind) = self.auth else {
            return Ok(None);
        };
        let auth: Arc<dyn Authenticator> = match kind {
            AuthKind::Basic => Arc::new(BasicAuth::new(Credentials::from_lookup(
                BASIC_USER, BASIC_PASS, lookup,
            )?)),
            AuthKind::Xnat => Arc::new(XnatAuth::new(
                self.auth_server.clone(),
                Credentials::from_lookup(XNAT_USER, XNAT_PASS, lookup)?,
            )),
        };
        Ok(Some(auth))
    }

    /// One downloader per manifest entry, settings applied.
    pub fn downloaders(
        &self,
        auth: Option<Arc<dyn Authenticator>>,
    ) -> Result<Vec<Downloader>, PrepError> {
        self.downloads
            .iter()
            .map(|request| {
                let dst = request.dst.as_deref().or(self.dst.as_deref());
                let mut downloader = Downloader::new(&request.url, dst)?
                    .with_digests(request.digests.clone())
                    .with_if_no_digest(self.if_no_digest)
                    .with_chunk_size(self.chunk_size)
                    .with_max_attempts(self.max_attempts);
                if let Some(size) = request.size {
                    downloader = downloader.with_size(size);
                }
                if let Some(mtime) = request.mtime {
                    downloader = downloader.with_mtime(mtime);
                }
                if let Some(auth) = &auth {
                    downloader = downloader.with_auth(Arc::clone(auth));
                }
                Ok(downloader)
            })
            .collect()
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, PrepError> {
        let config_path = Utf8PathBuf::from(path.unwrap_or(DEFAULT_MANIFEST));

        if path.is_none() && !config_path.exists() {
            return Err(PrepError::MissingConfig);
        }

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| PrepError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| PrepError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, PrepError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let settings = config.settings;

        let batch = BatchOptions {
            policy: parse_setting::<ExistencePolicy>(settings.ifexists.as_deref())?,
            on_error: parse_on_error(settings.on_error.as_deref())?,
            path: parse_setting::<PathDisplay>(settings.path.as_deref())?.unwrap_or_default(),
        };
        let if_no_digest =
            parse_setting::<IfNoDigest>(settings.if_no_digest.as_deref())?.unwrap_or_default();

        let chunk_size = match settings.chunk_size {
            Some(0) => return Err(PrepError::InvalidSetting("chunk_size: 0".to_string())),
            Some(size) => size,
            None => DEFAULT_CHUNK_SIZE,
        };
        let max_attempts = match settings.max_attempts {
            Some(0) => return Err(PrepError::InvalidSetting("max_attempts: 0".to_string())),
            Some(attempts) => attempts,
            None => DEFAULT_MAX_ATTEMPTS,
        };

        let (auth, auth_server) = match config.auth {
            Some(auth) => {
                let server = auth
                    .server
                    .map(|server| {
                        Url::parse(&server).map_err(|err| PrepError::InvalidUrl {
                            url: server.clone(),
                            message: err.to_string(),
                        })
                    })
                    .transpose()?;
                (Some(auth.kind), server)
            }
            None => (None, None),
        };

        let downloads = config
            .downloads
            .into_iter()
            .map(|entry| match entry {
                DownloadEntry::Shorthand(url) => Ok(DownloadRequest {
                    url,
                    dst: None,
                    size: None,
                    mtime: None,
                    digests: ExpectedDigests::new(),
                }),
                DownloadEntry::Detailed(obj) => Ok(DownloadRequest {
                    mtime: obj.mtime.as_deref().map(parse_mtime).transpose()?,
                    digests: ExpectedDigests::from_pairs(&obj.digests)?,
                    url: obj.url,
                    dst: obj.dst.map(Utf8PathBuf::from),
                    size: obj.size,
                }),
            })
            .collect::<Result<Vec<_>, PrepError>>()?;

        Ok(ResolvedConfig {
            schema_version,
            batch,
            if_no_digest,
            chunk_size,
            max_attempts,
            dst: settings.dst.map(Utf8PathBuf::from),
            auth,
            auth_server,
            downloads,
        })
    }
}

fn parse_setting<T>(value: Option<&str>) -> Result<Option<T>, PrepError>
where
    T: FromStr<Err = PrepError>,
{
    value.map(str::parse::<T>).transpose()
}

fn parse_on_error(value: Option<&str>) -> Result<OnError, PrepError> {
    match value.map(|value| value.trim().to_ascii_lowercase()) {
        None => Ok(OnError::default()),
        Some(value) if value.starts_with('y') => Ok(OnError::Yield),
        Some(value) if value.starts_with('r') => Ok(OnError::Raise),
        Some(value) => Err(PrepError::InvalidSetting(format!("on_error: {value}"))),
    }
}

fn parse_mtime(value: &str) -> Result<DateTime<Utc>, PrepError> {
    DateTime::parse_from_rfc3339(value)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| PrepError::InvalidSetting(format!("mtime {value}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_shorthand() {
        let config = Config {
            downloads: vec![DownloadEntry::Shorthand(
                "https://example.org/IXI-T1.tar".to_string(),
            )],
            ..Config::default()
        };

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.downloads.len(), 1);
        assert_eq!(resolved.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(resolved.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(resolved.batch.policy, None);
        assert!(resolved.downloads[0].digests.is_empty());
    }

    #[test]
    fn short_spellings() {
        let config = Config {
            settings: Settings {
                ifexists: Some("o".to_string()),
                if_no_digest: Some("c".to_string()),
                path: Some("short".to_string()),
                on_error: Some("raise".to_string()),
                ..Settings::default()
            },
            ..Config::default()
        };
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.batch.policy, Some(ExistencePolicy::Overwrite));
        assert_eq!(resolved.if_no_digest, IfNoDigest::Continue);
        assert_eq!(resolved.batch.path, PathDisplay::Short);
        assert_eq!(resolved.batch.on_error, OnError::Raise);
    }
}
