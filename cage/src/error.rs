//! Error types for jail assembly.

use std::io;
use std::path::PathBuf;

/// Alias for `Result<T, cage::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by jail assembly operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A path escaped its jail's mountpoint. This is a logic bug that
    /// could otherwise write outside the sandbox; it is never downgraded.
    #[error("containment violation: {} is not under mountpoint {}", path.display(), mountpoint.display())]
    Containment {
        /// The offending path, as given by the caller.
        path: PathBuf,
        /// The mountpoint it was checked against.
        mountpoint: PathBuf,
    },

    /// A mountpoint must be an absolute path.
    #[error("mountpoint is not absolute: {}", .0.display())]
    InvalidMountpoint(PathBuf),

    /// A required package is unknown to the metadata backend.
    #[error("unknown package: {0}")]
    MissingPackage(String),

    /// The package metadata backend could not be queried.
    #[error("package backend error: {0}")]
    Backend(String),

    /// Linking or copying a host file into a jail failed.
    #[error("install failed: {} -> {}: {source}", src.display(), dest.display())]
    Install {
        /// Resolved source path on the host.
        src: PathBuf,
        /// Destination path inside the jail root.
        dest: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Materializing a jail path (directory, file, symlink, device node)
    /// failed.
    #[error("write failed: {}: {source}", dest.display())]
    Materialize {
        /// Destination path inside the jail root.
        dest: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Remote asset fetch or verification error.
    #[error(transparent)]
    Asset(#[from] cage_assets::Error),

    /// Filesystem I/O error outside any jail write.
    #[error(transparent)]
    Io(#[from] io::Error),
}
