//! Jail tree primitives: containment-checked filesystem materialization.
//!
//! A [`JailTree`] owns one jail root directory. Every operation takes a
//! path expressed in the jail's runtime view (an absolute path under the
//! mountpoint) and translates it onto the root; translation failure is
//! fatal ([`Error::Containment`]) and checked on every write, not only at
//! the top-level call.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use nix::sys::stat::{Mode, SFlag, makedev, mknod};
use tracing::debug;

use crate::path::Mountpoint;
use crate::{Error, Result};

/// How regular files are materialized into a jail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum LinkMode {
    /// Hard-link from the host where possible, copying only when linking
    /// fails (different filesystem, permission).
    #[default]
    Hardlink,
    /// Always copy bytes.
    Copy,
}

/// One jail root directory with containment-checked write primitives.
#[derive(Debug)]
pub struct JailTree {
    root: PathBuf,
    mountpoint: Mountpoint,
    mode: LinkMode,
}

impl JailTree {
    /// Destroys any previous tree at `root` and creates it empty.
    ///
    /// Rebuilding from scratch is the staleness story: a jail is never
    /// patched in place across runs.
    pub fn create(root: impl Into<PathBuf>, mountpoint: Mountpoint, mode: LinkMode) -> Result<Self> {
        let root = root.into();
        if root.exists() {
            fs::remove_dir_all(&root).map_err(|e| materialize(&root, e))?;
        }
        fs::create_dir_all(&root).map_err(|e| materialize(&root, e))?;
        Ok(Self {
            root,
            mountpoint,
            mode,
        })
    }

    /// Returns the jail root directory on the host.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the mountpoint this tree represents.
    pub fn mountpoint(&self) -> &Mountpoint {
        &self.mountpoint
    }

    /// Translates a runtime-view path onto the jail root.
    ///
    /// Translation also re-checks the tree already on disk: the textual
    /// proof from [`Mountpoint::relativize`] holds only if no ancestor of
    /// the destination is a symlink, since the kernel would resolve one
    /// and redirect the operation to wherever it points (an archive can
    /// plant such a link and then address a path through it).
    fn translate(&self, path: &Path) -> Result<PathBuf> {
        let dest = self.mountpoint.relativize(path)?.join_under(&self.root);
        if let Some(parent) = dest.parent() {
            self.deny_symlink_ancestors(path, parent)?;
        }
        Ok(dest)
    }

    /// Fails if any path between the jail root and `upto` (inclusive) is
    /// currently a symlink.
    fn deny_symlink_ancestors(&self, view: &Path, upto: &Path) -> Result<()> {
        let Ok(rel) = upto.strip_prefix(&self.root) else {
            return Ok(());
        };
        let mut cursor = self.root.clone();
        for component in rel.components() {
            cursor.push(component);
            match fs::symlink_metadata(&cursor) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(self.containment(view));
                }
                Ok(_) => {}
                // Nothing deeper exists yet, so nothing can redirect.
                Err(_) => return Ok(()),
            }
        }
        Ok(())
    }

    /// Fails if `dest` itself is currently a symlink.
    ///
    /// `File::create` and `fs::copy` follow an existing (even dangling)
    /// symlink, so writing "onto" one would land at its target instead of
    /// the translated path.
    fn deny_symlink_at(&self, view: &Path, dest: &Path) -> Result<()> {
        match fs::symlink_metadata(dest) {
            Ok(meta) if meta.file_type().is_symlink() => Err(self.containment(view)),
            _ => Ok(()),
        }
    }

    /// Containment error for a runtime-view path.
    fn containment(&self, view: &Path) -> Error {
        Error::Containment {
            path: view.to_path_buf(),
            mountpoint: self.mountpoint.as_path().to_path_buf(),
        }
    }

    /// Creates a directory (and all missing parents). Idempotent.
    pub fn make_dir(&self, path: &Path) -> Result<()> {
        let dest = self.translate(path)?;
        fs::create_dir_all(&dest).map_err(|e| materialize(&dest, e))
    }

    /// Creates an empty regular file if absent. Idempotent.
    pub fn touch(&self, path: &Path) -> Result<()> {
        let dest = self.translate(path)?;
        self.ensure_parent(&dest)?;
        match OpenOptions::new().write(true).create_new(true).open(&dest) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(materialize(&dest, e)),
        }
    }

    /// Materializes `source` (a host path) at `path` inside the jail.
    ///
    /// `source` is resolved through any chain of host symlinks first; the
    /// jail never receives a symlink from this operation, so nothing it
    /// installs can point back out of the sandbox. Directories contribute
    /// structure only — callers walk them and install files one by one.
    /// An existing destination is left untouched (package file lists
    /// overlap routinely).
    pub fn install(&self, path: &Path, source: &Path) -> Result<()> {
        let dest = self.translate(path)?;
        self.deny_symlink_at(path, &dest)?;
        let resolved = fs::canonicalize(source).map_err(|e| Error::Install {
            src: source.to_path_buf(),
            dest: dest.clone(),
            source: e,
        })?;
        let meta = fs::metadata(&resolved).map_err(|e| Error::Install {
            src: resolved.clone(),
            dest: dest.clone(),
            source: e,
        })?;

        if meta.is_dir() {
            return fs::create_dir_all(&dest).map_err(|e| materialize(&dest, e));
        }
        if dest.exists() {
            return Ok(());
        }
        self.ensure_parent(&dest)?;

        let outcome = match self.mode {
            LinkMode::Hardlink => fs::hard_link(&resolved, &dest).or_else(|e| {
                debug!(
                    src = %resolved.display(),
                    error = %e,
                    "hard link failed, copying"
                );
                fs::copy(&resolved, &dest).map(|_| ())
            }),
            LinkMode::Copy => fs::copy(&resolved, &dest).map(|_| ()),
        };
        outcome.map_err(|e| Error::Install {
            src: resolved,
            dest,
            source: e,
        })
    }

    /// Creates a symlink at `path` pointing at `target` verbatim.
    ///
    /// The target is not resolved; callers use this only when the target
    /// is reachable from inside the jail (another in-jail path, or a path
    /// bind-mounted at runtime). Idempotent.
    pub fn symlink(&self, path: &Path, target: &Path) -> Result<()> {
        let dest = self.translate(path)?;
        self.ensure_parent(&dest)?;
        if dest.symlink_metadata().is_ok() {
            return Ok(());
        }
        symlink(target, &dest).map_err(|e| materialize(&dest, e))
    }

    /// Writes literal bytes at `path`, resetting the mtime to the epoch.
    ///
    /// Used for synthesized files (`/etc/passwd` and friends); the fixed
    /// timestamp keeps rebuilt jails byte-identical.
    pub fn write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let dest = self.translate(path)?;
        self.deny_symlink_at(path, &dest)?;
        self.ensure_parent(&dest)?;
        fs::write(&dest, bytes).map_err(|e| materialize(&dest, e))?;
        filetime::set_file_mtime(&dest, FileTime::zero()).map_err(|e| materialize(&dest, e))
    }

    /// Streams `reader` to `path`, applying `mode` permission bits.
    pub fn write_stream(&self, path: &Path, reader: &mut dyn Read, mode: u32) -> Result<()> {
        let dest = self.translate(path)?;
        self.deny_symlink_at(path, &dest)?;
        self.ensure_parent(&dest)?;
        let mut file = File::create(&dest).map_err(|e| materialize(&dest, e))?;
        io::copy(reader, &mut file).map_err(|e| materialize(&dest, e))?;
        file.set_permissions(fs::Permissions::from_mode(mode))
            .map_err(|e| materialize(&dest, e))
    }

    /// Creates a character special file with the given permission bits and
    /// device numbers. Idempotent.
    pub fn device_node(&self, path: &Path, mode: u32, major: u64, minor: u64) -> Result<()> {
        let dest = self.translate(path)?;
        self.ensure_parent(&dest)?;
        if dest.exists() {
            return Ok(());
        }
        mknod(
            &dest,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(mode),
            makedev(major, minor),
        )
        .map_err(|e| materialize(&dest, e.into()))
    }

    /// Mirrors the host directory tree at `path` into the jail.
    ///
    /// `path` doubles as the in-jail location, so it must lie under the
    /// mountpoint. Symlinks whose resolved target stays inside the
    /// mountpoint are recreated with their literal target; symlinks
    /// escaping the mountpoint are replaced by the resolved content (a
    /// plain file, or a nested directory walked in turn). Broken symlinks
    /// are skipped. Entries under any of `exclude` are skipped entirely.
    pub fn copy_tree_from_host(&self, path: &Path, exclude: &[PathBuf]) -> Result<()> {
        self.copy_tree_inner(path, path, exclude)
    }

    /// Recursive worker: `host` is read, `view` is where it lands.
    ///
    /// The two diverge only below an escaping symlink.
    fn copy_tree_inner(&self, host: &Path, view: &Path, exclude: &[PathBuf]) -> Result<()> {
        if exclude.iter().any(|p| view.starts_with(p)) {
            return Ok(());
        }
        let meta = fs::symlink_metadata(host).map_err(|e| Error::Install {
            src: host.to_path_buf(),
            dest: view.to_path_buf(),
            source: e,
        })?;
        let kind = meta.file_type();

        if kind.is_symlink() {
            let Ok(resolved) = fs::canonicalize(host) else {
                debug!(path = %host.display(), "skipping broken symlink");
                return Ok(());
            };
            if self.mountpoint.contains(&resolved) {
                let target = fs::read_link(host).map_err(|e| Error::Install {
                    src: host.to_path_buf(),
                    dest: view.to_path_buf(),
                    source: e,
                })?;
                return self.symlink(view, &target);
            }
            // The target lives outside the mountpoint; a symlink would
            // dangle (or escape) at runtime, so take the content instead.
            return self.copy_tree_inner(&resolved, view, exclude);
        }
        if kind.is_dir() {
            self.make_dir(view)?;
            for entry in fs::read_dir(host).map_err(|e| Error::Install {
                src: host.to_path_buf(),
                dest: view.to_path_buf(),
                source: e,
            })? {
                let entry = entry.map_err(Error::Io)?;
                self.copy_tree_inner(&entry.path(), &view.join(entry.file_name()), exclude)?;
            }
            return Ok(());
        }
        if kind.is_file() {
            return self.install(view, host);
        }
        // Sockets, fifos, devices: never mirrored from the host.
        Ok(())
    }

    /// Ensures the parent directory of a translated destination exists.
    fn ensure_parent(&self, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| materialize(parent, e))?;
        }
        Ok(())
    }
}

/// Wraps an I/O failure with the in-jail destination it hit.
fn materialize(dest: &Path, source: io::Error) -> Error {
    Error::Materialize {
        dest: dest.to_path_buf(),
        source,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::os::unix::fs::MetadataExt;
    use std::time::SystemTime;

    use super::*;

    fn root_jail(dir: &Path, mode: LinkMode) -> JailTree {
        JailTree::create(dir.join("jail"), Mountpoint::new("/").unwrap(), mode).unwrap()
    }

    #[test]
    fn create_destroys_previous_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let jail = root_jail(tmp.path(), LinkMode::Copy);
        jail.write(Path::new("/stale"), b"old").unwrap();

        let jail = root_jail(tmp.path(), LinkMode::Copy);
        assert!(!jail.root().join("stale").exists());
    }

    #[test]
    fn touch_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let jail = root_jail(tmp.path(), LinkMode::Copy);
        jail.touch(Path::new("/var/run/marker")).unwrap();
        jail.touch(Path::new("/var/run/marker")).unwrap();
        assert!(jail.root().join("var/run/marker").is_file());
    }

    #[test]
    fn write_resets_mtime_to_epoch() {
        let tmp = tempfile::tempdir().unwrap();
        let jail = root_jail(tmp.path(), LinkMode::Copy);
        jail.write(Path::new("/etc/passwd"), b"root:x:0:0::/:/bin/false\n")
            .unwrap();

        let meta = fs::metadata(jail.root().join("etc/passwd")).unwrap();
        assert_eq!(meta.modified().unwrap(), SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn install_resolves_symlink_chains() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        fs::write(base.join("data"), b"content").unwrap();
        symlink(base.join("data"), base.join("hop1")).unwrap();
        symlink(base.join("hop1"), base.join("hop2")).unwrap();

        let jail = root_jail(&base, LinkMode::Copy);
        jail.install(Path::new("/usr/share/data"), &base.join("hop2"))
            .unwrap();

        let dest = jail.root().join("usr/share/data");
        assert!(!fs::symlink_metadata(&dest).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(&dest).unwrap(), b"content");
    }

    #[test]
    fn install_directory_creates_structure_only() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        fs::create_dir(base.join("pkgdir")).unwrap();
        fs::write(base.join("pkgdir/ignored"), b"x").unwrap();

        let jail = root_jail(&base, LinkMode::Copy);
        jail.install(Path::new("/opt/pkgdir"), &base.join("pkgdir"))
            .unwrap();

        assert!(jail.root().join("opt/pkgdir").is_dir());
        assert!(!jail.root().join("opt/pkgdir/ignored").exists());
    }

    #[test]
    fn hardlink_mode_shares_inodes() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        fs::write(base.join("lib.so"), b"elf").unwrap();

        let jail = root_jail(&base, LinkMode::Hardlink);
        jail.install(Path::new("/lib/lib.so"), &base.join("lib.so"))
            .unwrap();

        let src_ino = fs::metadata(base.join("lib.so")).unwrap().ino();
        let dest_ino = fs::metadata(jail.root().join("lib/lib.so")).unwrap().ino();
        assert_eq!(src_ino, dest_ino);
    }

    #[test]
    fn install_outside_mountpoint_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        fs::write(base.join("f"), b"x").unwrap();
        let jail = JailTree::create(
            base.join("jail"),
            Mountpoint::new("/usr/lib/jvm").unwrap(),
            LinkMode::Copy,
        )
        .unwrap();

        let err = jail.install(Path::new("/etc/passwd"), &base.join("f")).unwrap_err();
        assert!(matches!(err, Error::Containment { .. }));
    }

    #[test]
    fn copy_tree_rewrites_escaping_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().canonicalize().unwrap();

        // `area` plays the mountpoint; `outside.txt` lives beyond it.
        let area = base.join("area");
        fs::create_dir_all(area.join("sub")).unwrap();
        fs::write(area.join("sub/file.txt"), b"inside").unwrap();
        fs::write(base.join("outside.txt"), b"outside").unwrap();
        symlink("sub/file.txt", area.join("inlink")).unwrap();
        symlink(base.join("outside.txt"), area.join("outlink")).unwrap();

        let jail = JailTree::create(
            base.join("jail"),
            Mountpoint::new(&area).unwrap(),
            LinkMode::Copy,
        )
        .unwrap();
        jail.copy_tree_from_host(&area, &[]).unwrap();

        // In-mount symlink survives with its literal relative target.
        let inlink = jail.root().join("inlink");
        assert!(fs::symlink_metadata(&inlink).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&inlink).unwrap(), Path::new("sub/file.txt"));

        // Escaping symlink becomes a plain file with the target's content.
        let outlink = jail.root().join("outlink");
        assert!(!fs::symlink_metadata(&outlink).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(&outlink).unwrap(), b"outside");

        assert_eq!(fs::read(jail.root().join("sub/file.txt")).unwrap(), b"inside");
    }

    #[test]
    fn write_through_symlinked_directory_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        fs::create_dir(base.join("outside")).unwrap();
        let jail = root_jail(&base, LinkMode::Copy);
        jail.symlink(Path::new("/esc"), &base.join("outside")).unwrap();

        let err = jail.write(Path::new("/esc/pwn"), b"x").unwrap_err();
        assert!(matches!(err, Error::Containment { .. }));
        assert!(!base.join("outside/pwn").exists());
    }

    #[test]
    fn write_onto_dangling_symlink_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        let jail = root_jail(&base, LinkMode::Copy);
        jail.symlink(Path::new("/leak"), &base.join("outside.txt"))
            .unwrap();

        let err = jail.write(Path::new("/leak"), b"x").unwrap_err();
        assert!(matches!(err, Error::Containment { .. }));
        assert!(!base.join("outside.txt").exists());
    }

    #[test]
    fn install_through_symlinked_directory_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        fs::create_dir(base.join("outside")).unwrap();
        fs::write(base.join("src"), b"payload").unwrap();
        let jail = root_jail(&base, LinkMode::Copy);
        jail.symlink(Path::new("/esc"), &base.join("outside")).unwrap();

        let err = jail
            .install(Path::new("/esc/pwn"), &base.join("src"))
            .unwrap_err();
        assert!(matches!(err, Error::Containment { .. }));
        assert!(!base.join("outside/pwn").exists());
    }

    #[test]
    fn copy_tree_skips_excluded_prefixes() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        let area = base.join("area");
        fs::create_dir_all(area.join("docs")).unwrap();
        fs::create_dir_all(area.join("bin")).unwrap();
        fs::write(area.join("docs/manual.txt"), b"m").unwrap();
        fs::write(area.join("bin/tool"), b"t").unwrap();

        let jail = JailTree::create(
            base.join("jail"),
            Mountpoint::new(&area).unwrap(),
            LinkMode::Copy,
        )
        .unwrap();
        jail.copy_tree_from_host(&area, &[area.join("docs")]).unwrap();

        assert!(jail.root().join("bin/tool").is_file());
        assert!(!jail.root().join("docs").exists());
    }
}
