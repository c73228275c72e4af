//! Content digests used to decide resumability and to verify finished files.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::str::FromStr;

use camino::Utf8Path;
use digest::DynDigest;
use md5::Md5;
use sha1::Sha1;
use sha2::{Sha256, Sha512};

use crate::error::PrepError;

const READ_BUFFER: usize = 64 * 1024;

/// Supported algorithms, declared in canonical preference order: when a
/// target carries several digests, the first one in this order is the one
/// used for verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DigestAlgorithm {
    Sha512,
    Sha256,
    Sha1,
    Md5,
}

impl DigestAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha512 => "sha512",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Md5 => "md5",
        }
    }

    /// Length in bytes of a digest produced by this algorithm.
    pub fn output_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha512 => 64,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Md5 => 16,
        }
    }

    fn hasher(self) -> Box<dyn DynDigest> {
        match self {
            DigestAlgorithm::Sha512 => Box::new(Sha512::default()),
            DigestAlgorithm::Sha256 => Box::new(Sha256::default()),
            DigestAlgorithm::Sha1 => Box::new(Sha1::default()),
            DigestAlgorithm::Md5 => Box::new(Md5::default()),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = PrepError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace(['-', '_'], "");
        match normalized.as_str() {
            "sha512" => Ok(DigestAlgorithm::Sha512),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha1" => Ok(DigestAlgorithm::Sha1),
            "md5" => Ok(DigestAlgorithm::Md5),
            _ => Err(PrepError::UnknownDigest(value.to_string())),
        }
    }
}

/// Expected digests of one target, kept sorted by [`DigestAlgorithm`]
/// preference. Values are normalized to lowercase hex.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedDigests(Vec<(DigestAlgorithm, String)>);

impl ExpectedDigests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(algorithm name, hex value)` pairs. Any unknown
    /// algorithm name or malformed value is rejected here, before a
    /// transfer starts.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, PrepError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut digests = Self::new();
        for (name, value) in pairs {
            let algorithm: DigestAlgorithm = name.as_ref().parse()?;
            digests.insert(algorithm, value.as_ref())?;
        }
        Ok(digests)
    }

    pub fn insert(&mut self, algorithm: DigestAlgorithm, value: &str) -> Result<(), PrepError> {
        let value = value.trim().to_ascii_lowercase();
        let decoded = hex::decode(&value).map_err(|_| PrepError::InvalidDigest {
            algorithm: algorithm.to_string(),
            value: value.clone(),
        })?;
        if decoded.len() != algorithm.output_len() {
            return Err(PrepError::InvalidDigest {
                algorithm: algorithm.to_string(),
                value,
            });
        }
        self.0.retain(|(existing, _)| *existing != algorithm);
        self.0.push((algorithm, value));
        self.0.sort_by_key(|(algorithm, _)| *algorithm);
        Ok(())
    }

    /// The digest verification must use.
    pub fn authoritative(&self) -> Option<(DigestAlgorithm, &str)> {
        self.0
            .first()
            .map(|(algorithm, value)| (*algorithm, value.as_str()))
    }

    pub fn get(&self, algorithm: DigestAlgorithm) -> Option<&str> {
        self.0
            .iter()
            .find(|(existing, _)| *existing == algorithm)
            .map(|(_, value)| value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DigestAlgorithm, &str)> {
        self.0
            .iter()
            .map(|(algorithm, value)| (*algorithm, value.as_str()))
    }
}

/// A digest fed incrementally as bytes are written.
pub struct RunningDigest {
    algorithm: DigestAlgorithm,
    inner: Box<dyn DynDigest>,
}

impl RunningDigest {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self {
            algorithm,
            inner: algorithm.hasher(),
        }
    }

    /// A digest already fed with the current content of `path`, used when
    /// appending to a partial file.
    pub fn primed(path: &Utf8Path, algorithm: DigestAlgorithm) -> Result<Self, PrepError> {
        let mut running = Self::new(algorithm);
        feed_file(path, |chunk| running.update(chunk))?;
        Ok(running)
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    pub fn finalize_hex(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

impl fmt::Debug for RunningDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningDigest")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Hex digest of a file on disk.
pub fn file_digest(path: &Utf8Path, algorithm: DigestAlgorithm) -> Result<String, PrepError> {
    Ok(RunningDigest::primed(path, algorithm)?.finalize_hex())
}

/// Hex digest of an in-memory buffer.
pub fn bytes_digest(bytes: &[u8], algorithm: DigestAlgorithm) -> String {
    let mut running = RunningDigest::new(algorithm);
    running.update(bytes);
    running.finalize_hex()
}

fn feed_file(path: &Utf8Path, mut sink: impl FnMut(&[u8])) -> Result<(), PrepError> {
    let mut file = File::open(path.as_std_path())
        .map_err(|err| PrepError::Filesystem(format!("open {path}: {err}")))?;
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|err| PrepError::Filesystem(format!("read {path}: {err}")))?;
        if read == 0 {
            break;
        }
        sink(&buffer[..read]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
    const ABC_MD5: &str = "900150983cd24fb0d6963f7d28e17f72";

    #[test]
    fn known_vectors() {
        assert_eq!(bytes_digest(b"abc", DigestAlgorithm::Sha256), ABC_SHA256);
        assert_eq!(bytes_digest(b"abc", DigestAlgorithm::Md5), ABC_MD5);
        assert_eq!(
            bytes_digest(b"abc", DigestAlgorithm::Sha1),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn preference_order_picks_strongest() {
        let digests =
            ExpectedDigests::from_pairs([("md5", ABC_MD5), ("SHA-256", ABC_SHA256)]).unwrap();
        assert_eq!(
            digests.authoritative(),
            Some((DigestAlgorithm::Sha256, ABC_SHA256))
        );
        assert_eq!(digests.get(DigestAlgorithm::Md5), Some(ABC_MD5));
    }

    #[test]
    fn unknown_algorithm_fails_fast() {
        let err = ExpectedDigests::from_pairs([("crc32", "deadbeef")]).unwrap_err();
        assert_matches!(err, PrepError::UnknownDigest(name) if name == "crc32");
    }

    #[test]
    fn wrong_length_is_rejected() {
        let err = ExpectedDigests::from_pairs([("sha256", ABC_MD5)]).unwrap_err();
        assert_matches!(err, PrepError::InvalidDigest { .. });
    }

    #[test]
    fn uppercase_values_are_normalized() {
        let digests = ExpectedDigests::from_pairs([("md5", ABC_MD5.to_uppercase())]).unwrap();
        assert_eq!(digests.authoritative(), Some((DigestAlgorithm::Md5, ABC_MD5)));
    }

    #[test]
    fn file_digest_matches_buffer_digest() {
        let temp = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(temp.path().join("blob.bin")).unwrap();
        let payload = vec![7u8; READ_BUFFER * 2 + 13];
        std::fs::write(path.as_std_path(), &payload).unwrap();
        assert_eq!(
            file_digest(&path, DigestAlgorithm::Sha512).unwrap(),
            bytes_digest(&payload, DigestAlgorithm::Sha512)
        );
    }
}
