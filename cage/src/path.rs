//! Containment-checked translation between a jail's runtime view and its
//! on-disk root directory.
//!
//! Every write into a jail goes through [`Mountpoint::relativize`], so the
//! containment guarantee is enforced by the type boundary rather than by
//! convention at each call site: a [`MountRelative`] can only be obtained
//! from a path proven to stay under its mountpoint.

use std::path::{Component, Path, PathBuf};

use crate::{Error, Result};

/// The absolute path a jail tree represents inside its runtime view.
///
/// Usually `/`; runtime-specific jails use a sub-path such as
/// `/usr/lib/jvm/`, in which case only paths under that prefix may ever be
/// written through the owning jail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mountpoint(PathBuf);

impl Mountpoint {
    /// Creates a mountpoint from an absolute path.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(Error::InvalidMountpoint(path));
        }
        Ok(Self(path))
    }

    /// Returns the mountpoint as a path.
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Returns `true` if `path` lies under this mountpoint.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.0)
    }

    /// Strips the mountpoint off `path`, proving containment.
    ///
    /// Fails with [`Error::Containment`] if `path` does not start with the
    /// mountpoint, or if the remaining suffix carries components (`..`, a
    /// root, a prefix) that could climb back out of it.
    pub fn relativize(&self, path: &Path) -> Result<MountRelative> {
        let violation = || Error::Containment {
            path: path.to_path_buf(),
            mountpoint: self.0.clone(),
        };

        let suffix = path.strip_prefix(&self.0).map_err(|_| violation())?;
        for component in suffix.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(violation());
                }
            }
        }
        Ok(MountRelative {
            suffix: suffix.to_path_buf(),
        })
    }
}

/// A path suffix proven to stay inside its mountpoint.
///
/// Obtainable only through [`Mountpoint::relativize`]; re-rooting it under
/// a jail root directory therefore cannot land outside that root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRelative {
    suffix: PathBuf,
}

impl MountRelative {
    /// Re-roots the suffix under a jail root directory on the host.
    pub fn join_under(&self, root: &Path) -> PathBuf {
        root.join(&self.suffix)
    }
}
