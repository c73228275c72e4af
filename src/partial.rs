//! A destination file while it is being written.
//!
//! [`PartialTransfer::acquire`] takes an exclusive inter-process lock on
//! `F.lock`, decides whether bytes already in `F.download` can be kept,
//! and records the expected digest in `F.checksum`. [`PartialTransfer::commit`]
//! renames the partial file onto `F` and removes the sidecars. Dropping a
//! transfer without committing only closes the file and releases the lock:
//! the partial bytes and the checksum record stay for the next run.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::time::Instant;

use camino::Utf8Path;
use fs2::FileExt;
use tracing::debug;

use crate::digest::{DigestAlgorithm, RunningDigest};
use crate::domain::IfNoDigest;
use crate::error::PrepError;
use crate::status::Throughput;
use crate::store::{SidecarPaths, promote, remove_if_exists};

#[derive(Debug, Clone, Default)]
pub struct PartialOptions {
    /// Authoritative expected digest of the complete file.
    pub expected: Option<(DigestAlgorithm, String)>,
    /// What to do with leftover bytes when `expected` is `None`.
    pub if_no_digest: IfNoDigest,
    /// Producers that regenerate their output from scratch set this to
    /// `false`; leftover bytes are then always discarded.
    pub resumable: bool,
}

impl PartialOptions {
    pub fn resumable(expected: Option<(DigestAlgorithm, String)>, if_no_digest: IfNoDigest) -> Self {
        Self {
            expected,
            if_no_digest,
            resumable: true,
        }
    }

    pub fn fresh() -> Self {
        Self::default()
    }
}

#[derive(Debug)]
pub struct PartialTransfer {
    paths: SidecarPaths,
    lock: Option<File>,
    file: Option<File>,
    offset: u64,
    position: u64,
    digest: Option<RunningDigest>,
    speed: Throughput,
}

impl PartialTransfer {
    pub fn acquire(destination: &Utf8Path, options: &PartialOptions) -> Result<Self, PrepError> {
        let paths = SidecarPaths::for_destination(destination);
        paths.ensure_parent()?;
        let lock = lock_exclusive(&paths)?;

        let recorded = paths.read_checksum();
        let leftover = paths.partial.as_std_path().exists();
        let keep = options.resumable
            && leftover
            && match &options.expected {
                Some((_, expected)) => recorded.as_deref() == Some(expected.as_str()),
                None => options.if_no_digest == IfNoDigest::Continue,
            };

        let digest = match &options.expected {
            Some((algorithm, _)) if keep => Some(RunningDigest::primed(&paths.partial, *algorithm)?),
            Some((algorithm, _)) => Some(RunningDigest::new(*algorithm)),
            None => None,
        };

        let file = if keep {
            debug!(path = %destination, "partial file can be continued: resuming");
            OpenOptions::new()
                .append(true)
                .open(paths.partial.as_std_path())
        } else {
            if leftover {
                debug!(path = %destination, "partial file cannot be continued: restarting");
            } else {
                debug!(path = %destination, "starting new transfer");
            }
            remove_if_exists(&paths.partial)?;
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(paths.partial.as_std_path())
        }
        .map_err(|err| PrepError::Filesystem(format!("open {}: {err}", paths.partial)))?;

        let offset = file
            .metadata()
            .map_err(|err| PrepError::Filesystem(format!("stat {}: {err}", paths.partial)))?
            .len();

        match &options.expected {
            Some((_, expected)) => paths.write_checksum(expected)?,
            None => remove_if_exists(&paths.checksum)?,
        }

        Ok(Self {
            paths,
            lock: Some(lock),
            file: Some(file),
            offset,
            position: offset,
            digest,
            speed: Throughput::default(),
        })
    }

    /// Bytes already present when the transfer was acquired.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes currently in the partial file.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn partial_path(&self) -> &Utf8Path {
        &self.paths.partial
    }

    pub fn destination(&self) -> &Utf8Path {
        &self.paths.destination
    }

    pub fn write_speed(&self) -> &Throughput {
        &self.speed
    }

    pub fn append(&mut self, chunk: &[u8]) -> Result<(), PrepError> {
        let file = self.file.as_mut().ok_or_else(|| {
            PrepError::Filesystem(format!("{} is already closed", self.paths.partial))
        })?;
        let started = Instant::now();
        file.write_all(chunk)
            .map_err(|err| PrepError::Filesystem(format!("write {}: {err}", self.paths.partial)))?;
        self.speed.record(self.position, chunk.len(), started.elapsed());
        if let Some(digest) = self.digest.as_mut() {
            digest.update(chunk);
        }
        self.position += chunk.len() as u64;
        Ok(())
    }

    /// Discard everything written so far, keeping the lock.
    pub fn restart(&mut self) -> Result<(), PrepError> {
        let file = self.file.as_mut().ok_or_else(|| {
            PrepError::Filesystem(format!("{} is already closed", self.paths.partial))
        })?;
        file.set_len(0)
            .and_then(|()| file.seek(SeekFrom::Start(0)).map(|_| ()))
            .map_err(|err| PrepError::Filesystem(format!("truncate {}: {err}", self.paths.partial)))?;
        if let Some(digest) = self.digest.as_mut() {
            *digest = RunningDigest::new(digest.algorithm());
        }
        self.offset = 0;
        self.position = 0;
        self.speed = Throughput::default();
        Ok(())
    }

    /// Promote the partial file to its final name, remove the sidecars and
    /// return the digest of everything written, when one was expected.
    pub fn commit(mut self) -> Result<Option<String>, PrepError> {
        if let Some(file) = self.file.take() {
            file.sync_all()
                .map_err(|err| PrepError::Filesystem(format!("sync {}: {err}", self.paths.partial)))?;
        }
        promote(&self.paths.partial, &self.paths.destination)?;
        let digest = self.digest.take().map(RunningDigest::finalize_hex);
        self.release_lock();
        self.paths.cleanup()?;
        debug!(path = %self.paths.destination, bytes = self.position, "transfer committed");
        Ok(digest)
    }

    fn release_lock(&mut self) {
        if let Some(lock) = self.lock.take() {
            if let Err(err) = FileExt::unlock(&lock) {
                debug!(path = %self.paths.lock, %err, "failed to release lock explicitly");
            }
        }
    }
}

impl Write for PartialTransfer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for PartialTransfer {
    fn drop(&mut self) {
        if self.lock.is_none() {
            return;
        }
        self.file.take();
        self.release_lock();
        debug!(
            path = %self.paths.destination,
            bytes = self.position,
            "transfer interrupted; partial file kept for resume"
        );
    }
}

fn lock_exclusive(paths: &SidecarPaths) -> Result<File, PrepError> {
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(paths.lock.as_std_path())
        .map_err(|err| PrepError::Filesystem(format!("open {}: {err}", paths.lock)))?;
    match lock.try_lock_exclusive() {
        Ok(()) => Ok(lock),
        Err(err)
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
        {
            Err(PrepError::LockHeld(paths.destination.clone()))
        }
        Err(err) => Err(PrepError::Filesystem(format!("lock {}: {err}", paths.lock))),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::digest::bytes_digest;

    fn root() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, root)
    }

    #[test]
    fn commit_promotes_and_cleans_up() {
        let (_temp, root) = root();
        let dest = root.join("sub/anat.nii.gz");
        let expected = bytes_digest(b"header+voxels", DigestAlgorithm::Md5);
        let options = PartialOptions::resumable(
            Some((DigestAlgorithm::Md5, expected.clone())),
            IfNoDigest::Restart,
        );

        let mut partial = PartialTransfer::acquire(&dest, &options).unwrap();
        assert_eq!(partial.offset(), 0);
        partial.append(b"header+").unwrap();
        partial.append(b"voxels").unwrap();
        let digest = partial.commit().unwrap();

        assert_eq!(digest.as_deref(), Some(expected.as_str()));
        assert_eq!(std::fs::read(dest.as_std_path()).unwrap(), b"header+voxels");
        let paths = SidecarPaths::for_destination(&dest);
        assert!(!paths.partial.exists());
        assert!(!paths.lock.exists());
        assert!(!paths.checksum.exists());
    }

    #[test]
    fn interrupted_transfer_keeps_state() {
        let (_temp, root) = root();
        let dest = root.join("scan.tar");
        let expected = bytes_digest(b"0123456789", DigestAlgorithm::Sha256);
        let options = PartialOptions::resumable(
            Some((DigestAlgorithm::Sha256, expected.clone())),
            IfNoDigest::Restart,
        );

        {
            let mut partial = PartialTransfer::acquire(&dest, &options).unwrap();
            partial.append(b"01234").unwrap();
        }
        let paths = SidecarPaths::for_destination(&dest);
        assert!(!dest.exists());
        assert_eq!(std::fs::read(paths.partial.as_std_path()).unwrap(), b"01234");
        assert_eq!(paths.read_checksum().as_deref(), Some(expected.as_str()));

        let mut partial = PartialTransfer::acquire(&dest, &options).unwrap();
        assert_eq!(partial.offset(), 5);
        partial.append(b"56789").unwrap();
        assert_eq!(partial.commit().unwrap().as_deref(), Some(expected.as_str()));
    }

    #[test]
    fn mismatched_record_restarts() {
        let (_temp, root) = root();
        let dest = root.join("scan.tar");
        let paths = SidecarPaths::for_destination(&dest);
        std::fs::write(paths.partial.as_std_path(), b"stale bytes").unwrap();
        paths
            .write_checksum(&bytes_digest(b"other", DigestAlgorithm::Sha256))
            .unwrap();

        let expected = bytes_digest(b"fresh", DigestAlgorithm::Sha256);
        let options =
            PartialOptions::resumable(Some((DigestAlgorithm::Sha256, expected)), IfNoDigest::Continue);
        let partial = PartialTransfer::acquire(&dest, &options).unwrap();
        assert_eq!(partial.offset(), 0);
    }

    #[test]
    fn blind_continue_without_digest() {
        let (_temp, root) = root();
        let dest = root.join("scan.tar");
        let paths = SidecarPaths::for_destination(&dest);
        std::fs::write(paths.partial.as_std_path(), b"abc").unwrap();

        let restart = PartialTransfer::acquire(
            &dest,
            &PartialOptions::resumable(None, IfNoDigest::Restart),
        )
        .unwrap();
        assert_eq!(restart.offset(), 0);
        drop(restart);

        std::fs::write(paths.partial.as_std_path(), b"abc").unwrap();
        let resumed = PartialTransfer::acquire(
            &dest,
            &PartialOptions::resumable(None, IfNoDigest::Continue),
        )
        .unwrap();
        assert_eq!(resumed.offset(), 3);
    }

    #[test]
    fn second_acquire_fails_fast() {
        let (_temp, root) = root();
        let dest = root.join("scan.tar");
        let first = PartialTransfer::acquire(&dest, &PartialOptions::fresh()).unwrap();
        let second = PartialTransfer::acquire(&dest, &PartialOptions::fresh());
        assert_matches!(second, Err(PrepError::LockHeld(path)) if path == dest);
        drop(first);
        PartialTransfer::acquire(&dest, &PartialOptions::fresh()).unwrap();
    }

    #[test]
    fn leftover_lock_file_does_not_block() {
        let (_temp, root) = root();
        let dest = root.join("scan.tar");
        let paths = SidecarPaths::for_destination(&dest);
        std::fs::write(paths.lock.as_std_path(), b"").unwrap();
        PartialTransfer::acquire(&dest, &PartialOptions::fresh()).unwrap();
    }
}
