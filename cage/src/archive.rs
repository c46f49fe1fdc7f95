//! Archive extraction into a jail with prefix stripping and filtering.
//!
//! Entries are never unpacked with their archive paths directly: each path
//! is stripped of a leading prefix, re-rooted on the jail's mountpoint,
//! and then goes through the jail's containment-checked primitives, so a
//! malformed entry (absolute path, `..`) fails the build instead of
//! escaping the root.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;

use flate2::read::GzDecoder;
use tar::EntryType;
use tracing::debug;

use crate::Result;
use crate::tree::JailTree;

/// Filters applied while unpacking an archive.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct UnpackOptions {
    /// Leading path stripped from every entry; entries without it are
    /// skipped.
    pub strip_prefix: String,
    /// Post-strip prefixes to skip entirely.
    pub exclude_prefixes: Vec<PathBuf>,
    /// If set, only post-strip paths literally present here are unpacked.
    /// Used to cherry-pick a handful of files out of a large archive.
    pub include: Option<HashSet<PathBuf>>,
}

/// Gzip stream magic.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Unpacks a tar (optionally gzip-compressed) stream into `jail`.
///
/// Symlink entries keep their literal link text, regular files are
/// streamed with the archive's permission bits, directory entries become
/// structure only, and every other entry kind (devices, hard links,
/// fifos) is ignored.
pub fn unpack_into(jail: &JailTree, reader: impl Read, options: &UnpackOptions) -> Result<()> {
    // Sniff the magic so both .tar and .tar.gz assets work.
    let mut reader = BufReader::new(reader);
    let gzipped = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    if gzipped {
        apply(jail, tar::Archive::new(GzDecoder::new(reader)), options)
    } else {
        apply(jail, tar::Archive::new(reader), options)
    }
}

/// Walks archive entries and materializes the selected ones.
fn apply<R: Read>(
    jail: &JailTree,
    mut archive: tar::Archive<R>,
    options: &UnpackOptions,
) -> Result<()> {
    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?.into_owned();
        let normalized = raw.strip_prefix("./").unwrap_or(&raw);

        let Ok(suffix) = normalized.strip_prefix(&options.strip_prefix) else {
            continue;
        };
        let suffix = suffix.to_path_buf();
        if suffix.as_os_str().is_empty() {
            continue;
        }
        if options.exclude_prefixes.iter().any(|p| suffix.starts_with(p)) {
            continue;
        }
        if let Some(include) = &options.include
            && !include.contains(&suffix)
        {
            continue;
        }

        let dest = jail.mountpoint().as_path().join(&suffix);
        match entry.header().entry_type() {
            EntryType::Directory => jail.make_dir(&dest)?,
            EntryType::Symlink => {
                if let Some(target) = entry.link_name()? {
                    jail.symlink(&dest, &target)?;
                }
            }
            EntryType::Regular => {
                let mode = entry.header().mode().unwrap_or(0o644);
                jail.write_stream(&dest, &mut entry, mode)?;
            }
            other => {
                debug!(entry = %suffix.display(), kind = ?other, "ignoring archive entry");
            }
        }
    }
    Ok(())
}
