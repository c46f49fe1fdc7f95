//! Content-addressed cache for downloaded build assets.
//!
//! Assets are keyed by the SHA-1 digest of their content. A cached file is
//! trusted only after its digest has been recomputed from disk — presence
//! alone never counts as a hit, so a corrupted or tampered local copy is
//! detected and refetched.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use tracing::{debug, warn};

/// Result type for asset cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from asset fetching and verification.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Downloaded content did not match its expected digest, even after a
    /// retry.
    #[error("digest mismatch for {url}: expected {expected}, got {actual}")]
    HashMismatch {
        /// Source URL of the asset.
        url: String,
        /// Expected SHA-1 hex digest.
        expected: String,
        /// Digest actually computed from the downloaded bytes.
        actual: String,
    },

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// No platform cache directory could be determined.
    #[error("cannot determine platform cache directory")]
    NoCacheDir,

    /// Filesystem I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Outcome of probing the cache for a digest.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Probe {
    /// A file is present and its recomputed digest matches.
    Hit,
    /// The entry must be (re)fetched.
    Miss(MissReason),
}

/// Why a cache probe did not produce a hit.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MissReason {
    /// No file exists at the digest's cache path.
    Absent,
    /// A file exists but its content hashes to a different digest.
    Corrupt {
        /// Digest recomputed from the on-disk bytes.
        actual: String,
    },
}

/// Chunk size for streaming digest computation.
const CHUNK: usize = 64 * 1024;

/// Content-addressed asset cache rooted at a single directory.
///
/// Safe to share across sequential builds: every read is re-verified, and
/// downloads land in a `.part` file renamed into place.
#[derive(Debug)]
pub struct AssetCache {
    dir: PathBuf,
}

impl AssetCache {
    /// Opens (or creates) a cache at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Opens the default cache under the platform cache directory.
    pub fn open_default() -> Result<Self> {
        let dir = dirs::cache_dir().ok_or(Error::NoCacheDir)?.join("cage");
        Self::open(dir)
    }

    /// Returns the cache path for a SHA-1 hex digest (may or may not exist).
    pub fn entry_path(&self, sha1_hex: &str) -> PathBuf {
        self.dir.join(sha1_hex)
    }

    /// Probes the cache for `sha1_hex`, recomputing the on-disk digest.
    pub fn probe(&self, sha1_hex: &str) -> Result<Probe> {
        let path = self.entry_path(sha1_hex);
        if !path.exists() {
            return Ok(Probe::Miss(MissReason::Absent));
        }
        let actual = file_sha1(&path)?;
        if actual == sha1_hex {
            Ok(Probe::Hit)
        } else {
            Ok(Probe::Miss(MissReason::Corrupt { actual }))
        }
    }

    /// Fetches `url` into the cache, verified against `sha1_hex`.
    ///
    /// A verified cached copy is returned without touching the network. A
    /// missing or corrupt entry is downloaded fresh; one retry is made on a
    /// digest mismatch before giving up with [`Error::HashMismatch`].
    pub fn fetch(&self, url: &str, sha1_hex: &str) -> Result<PathBuf> {
        self.fetch_with(url, sha1_hex, download)
    }

    /// Like [`AssetCache::fetch`], with an injectable downloader.
    pub fn fetch_with(
        &self,
        url: &str,
        sha1_hex: &str,
        mut downloader: impl FnMut(&str, &mut dyn Write) -> Result<()>,
    ) -> Result<PathBuf> {
        let path = self.entry_path(sha1_hex);
        match self.probe(sha1_hex)? {
            Probe::Hit => return Ok(path),
            Probe::Miss(reason) => debug!(url, ?reason, "asset cache miss"),
        }

        let mut actual = String::new();
        for _ in 0..2 {
            self.download_to(&path, url, &mut downloader)?;
            actual = file_sha1(&path)?;
            if actual == sha1_hex {
                return Ok(path);
            }
            warn!(url, expected = sha1_hex, actual, "digest mismatch, refetching");
        }

        fs::remove_file(&path).ok();
        Err(Error::HashMismatch {
            url: url.to_owned(),
            expected: sha1_hex.to_owned(),
            actual,
        })
    }

    /// Downloads `url` into a `.part` sibling, then renames over `path`.
    fn download_to(
        &self,
        path: &Path,
        url: &str,
        downloader: &mut impl FnMut(&str, &mut dyn Write) -> Result<()>,
    ) -> Result<()> {
        let tmp = path.with_extension("part");
        let mut out = File::create(&tmp)?;
        if let Err(e) = downloader(url, &mut out) {
            drop(out);
            fs::remove_file(&tmp).ok();
            return Err(e);
        }
        out.flush()?;
        drop(out);
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Streams `url`'s response body into `out`.
fn download(url: &str, out: &mut dyn Write) -> Result<()> {
    let resp = ureq::get(url).call().map_err(|e| Error::Http(e.to_string()))?;
    let mut reader = resp.into_body().into_reader();
    io::copy(&mut reader, out)?;
    Ok(())
}

/// Computes the SHA-1 hex digest of a file, streaming in fixed-size chunks.
fn file_sha1(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_string(&hasher.finalize()))
}

/// Lowercase hex rendering of a digest.
fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}
