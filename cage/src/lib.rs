//! Minimal jail filesystem assembler.
//!
//! `cage` builds small, isolated root filesystem trees ("jails") for
//! running untrusted code. Each jail variant is assembled from the
//! transitive file closure of a package list, fixed baseline files, host
//! directory trees, and hash-verified remote archives — and every write
//! is containment-checked against the jail's mountpoint, so nothing can
//! land outside the declared root.
//!
//! # Quick start
//!
//! ```no_run
//! use cage::{BuildConfig, DpkgBackend, JailBuilder, PROFILES};
//!
//! let backend = DpkgBackend;
//! let assets = cage_assets::AssetCache::open_default().expect("cache dir");
//! let mut builder = JailBuilder::new(&backend, assets, BuildConfig::new("/var/lib/cage"));
//! builder.build_all(PROFILES).expect("build failed");
//! ```

mod archive;
mod builder;
mod dpkg;
mod error;
mod path;
mod profile;
mod resolver;
mod tree;

pub use archive::{UnpackOptions, unpack_into};
pub use builder::{BuildConfig, JailBuilder};
pub use dpkg::DpkgBackend;
pub use error::{Error, Result};
pub use path::{MountRelative, Mountpoint};
pub use profile::{PROFILES, Profile, RemoteAsset};
pub use resolver::{FileSelection, PackageBackend, PackageInfo, Resolver};
pub use tree::{JailTree, LinkMode};
