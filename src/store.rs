use std::fs;
use std::io;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, SubsecRound, Utc};
use filetime::FileTime;

use crate::error::PrepError;

pub const PARTIAL_SUFFIX: &str = "download";
pub const LOCK_SUFFIX: &str = "lock";
pub const CHECKSUM_SUFFIX: &str = "checksum";

/// On-disk layout of one destination `F` while it is being written:
/// `F.download` holds the bytes, `F.lock` is the advisory lock sentinel and
/// `F.checksum` records the digest the partial bytes are expected to match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarPaths {
    pub destination: Utf8PathBuf,
    pub partial: Utf8PathBuf,
    pub lock: Utf8PathBuf,
    pub checksum: Utf8PathBuf,
}

impl SidecarPaths {
    pub fn for_destination(destination: &Utf8Path) -> Self {
        Self {
            destination: destination.to_path_buf(),
            partial: sidecar(destination, PARTIAL_SUFFIX),
            lock: sidecar(destination, LOCK_SUFFIX),
            checksum: sidecar(destination, CHECKSUM_SUFFIX),
        }
    }

    pub fn ensure_parent(&self) -> Result<(), PrepError> {
        if let Some(parent) = self.destination.parent() {
            if !parent.as_str().is_empty() {
                fs::create_dir_all(parent.as_std_path())
                    .map_err(|err| PrepError::Filesystem(format!("create {parent}: {err}")))?;
            }
        }
        Ok(())
    }

    /// Read the recorded digest, if a previous attempt left one.
    pub fn read_checksum(&self) -> Option<String> {
        fs::read_to_string(self.checksum.as_std_path())
            .ok()
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
    }

    pub fn write_checksum(&self, value: &str) -> Result<(), PrepError> {
        fs::write(self.checksum.as_std_path(), value)
            .map_err(|err| PrepError::Filesystem(format!("write {}: {err}", self.checksum)))
    }

    /// Remove the sidecars left once the destination is complete.
    pub fn cleanup(&self) -> Result<(), PrepError> {
        for path in [&self.partial, &self.lock, &self.checksum] {
            remove_if_exists(path)?;
        }
        Ok(())
    }
}

fn sidecar(destination: &Utf8Path, suffix: &str) -> Utf8PathBuf {
    let name = destination.file_name().unwrap_or("");
    destination.with_file_name(format!("{name}.{suffix}"))
}

/// Whether anything, including a dangling symlink, sits at `path`.
pub fn lexists(path: &Utf8Path) -> bool {
    fs::symlink_metadata(path.as_std_path()).is_ok()
}

pub fn remove_if_exists(path: &Utf8Path) -> Result<(), PrepError> {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(PrepError::Filesystem(format!("remove {path}: {err}"))),
    }
}

/// Move a finished partial file onto its final name in one rename. A stale
/// directory occupying the final name is removed first.
pub fn promote(from: &Utf8Path, to: &Utf8Path) -> Result<(), PrepError> {
    if to.as_std_path().is_dir() {
        fs::remove_dir_all(to.as_std_path())
            .map_err(|err| PrepError::Filesystem(format!("remove directory {to}: {err}")))?;
    }
    fs::rename(from.as_std_path(), to.as_std_path())
        .map_err(|err| PrepError::Filesystem(format!("rename {from} -> {to}: {err}")))
}

pub fn file_size(path: &Utf8Path) -> Result<u64, PrepError> {
    fs::metadata(path.as_std_path())
        .map(|meta| meta.len())
        .map_err(|err| PrepError::Filesystem(format!("stat {path}: {err}")))
}

pub fn file_mtime(path: &Utf8Path) -> Result<DateTime<Utc>, PrepError> {
    let modified = fs::metadata(path.as_std_path())
        .and_then(|meta| meta.modified())
        .map_err(|err| PrepError::Filesystem(format!("stat {path}: {err}")))?;
    Ok(DateTime::<Utc>::from(modified))
}

/// Most recent modification time across `sources`; `None` when empty.
pub fn newest_mtime<'a, I>(sources: I) -> Result<Option<DateTime<Utc>>, PrepError>
where
    I: IntoIterator<Item = &'a Utf8PathBuf>,
{
    let mut newest: Option<DateTime<Utc>> = None;
    for source in sources {
        let mtime = file_mtime(source)?;
        newest = Some(newest.map_or(mtime, |current| current.max(mtime)));
    }
    Ok(newest)
}

/// Set the modification time of `path`, access time becoming now.
pub fn set_mtime(path: &Utf8Path, mtime: DateTime<Utc>) -> Result<(), PrepError> {
    let modified = FileTime::from_system_time(SystemTime::from(mtime));
    let accessed = FileTime::now();
    filetime::set_file_times(path.as_std_path(), accessed, modified)
        .map_err(|err| PrepError::Filesystem(format!("set mtime of {path}: {err}")))
}

/// Timestamps compared at microsecond resolution.
pub fn same_instant(left: DateTime<Utc>, right: DateTime<Utc>) -> bool {
    left.trunc_subsecs(6) == right.trunc_subsecs(6)
}
