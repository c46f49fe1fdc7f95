//! Build orchestration: assembles jail variants in sequence.
//!
//! One build run is a one-shot batch: every variant's jail root is
//! destroyed and recreated, then populated from baseline files, package
//! closures, host trees, and remote assets. Variants are independent — a
//! failure aborts the failing variant and propagates without rolling back
//! the ones already completed.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use cage_assets::AssetCache;
use tracing::{debug, info, warn};

use crate::archive::{self, UnpackOptions};
use crate::path::Mountpoint;
use crate::profile::{CPU_ONLINE, DEVICE_NODES, GROUP, LOCALE_TREE, MOUNT_DIRS, PASSWD, Profile};
use crate::resolver::{FileSelection, PackageBackend, Resolver};
use crate::tree::{JailTree, LinkMode};
use crate::{Error, Result};

/// Size of the deterministic fallback entropy blob.
const ENTROPY_LEN: usize = 1024;

/// Parameters for one build invocation.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct BuildConfig {
    /// Directory receiving one jail root per variant.
    pub target: PathBuf,
    /// How regular files are materialized.
    pub mode: LinkMode,
    /// Directory of per-variant syscall policy files (`<variant>.policy`),
    /// copied next to each jail root for the launch-time enforcement
    /// layer. Content is opaque here.
    pub policy_dir: Option<PathBuf>,
}

impl BuildConfig {
    /// Creates a config with hard-linking and no policy directory.
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            mode: LinkMode::Hardlink,
            policy_dir: None,
        }
    }
}

/// Assembles jail variants from package closures, host trees, and remote
/// assets.
#[derive(Debug)]
pub struct JailBuilder<'b> {
    resolver: Resolver<'b>,
    assets: AssetCache,
    config: BuildConfig,
}

impl<'b> JailBuilder<'b> {
    /// Creates a builder over a package metadata backend and asset cache.
    pub fn new(backend: &'b dyn PackageBackend, assets: AssetCache, config: BuildConfig) -> Self {
        Self {
            resolver: Resolver::new(backend),
            assets,
            config,
        }
    }

    /// Builds every profile in `profiles`, in order.
    pub fn build_all(&mut self, profiles: &[Profile]) -> Result<()> {
        fs::create_dir_all(&self.config.target)?;
        for prof in profiles {
            info!(variant = prof.name, "building jail variant");
            self.build_variant(prof)?;
        }
        Ok(())
    }

    /// Destroys and rebuilds one variant's jail tree.
    pub fn build_variant(&mut self, prof: &Profile) -> Result<()> {
        // Required packages are probed before the old tree is destroyed,
        // so a bad manifest fails without wiping a previous good build.
        for name in prof.packages {
            if !self.resolver.exists(name)? {
                return Err(Error::MissingPackage((*name).to_owned()));
            }
        }

        let mountpoint = Mountpoint::new(prof.mountpoint)?;
        let rooted_at_slash = mountpoint.as_path() == Path::new("/");
        let jail = JailTree::create(
            self.config.target.join(prof.name),
            mountpoint,
            self.config.mode,
        )?;

        if rooted_at_slash {
            install_baseline(&jail)?;
        }
        self.install_packages(&jail, prof)?;

        // Host trees are mirrored in full; doc pruning applies to package
        // closures (whose files live under /usr/share), not to runtime
        // trees rooted at their own mountpoint.
        for tree in prof.host_trees {
            let host = Path::new(tree);
            if host.exists() {
                jail.copy_tree_from_host(host, &[])?;
            } else {
                warn!(path = tree, "host tree absent, skipping");
            }
        }

        for asset in prof.remote_assets {
            let cached = self.assets.fetch(asset.url, asset.sha1)?;
            let reader = BufReader::new(File::open(&cached)?);
            let options = UnpackOptions {
                strip_prefix: asset.strip_prefix.to_owned(),
                exclude_prefixes: asset.exclude.iter().map(PathBuf::from).collect(),
                include: (!asset.include.is_empty())
                    .then(|| asset.include.iter().map(PathBuf::from).collect()),
            };
            archive::unpack_into(&jail, reader, &options)?;
        }

        if let Some(path) = prof.seeded_entropy {
            jail.write(Path::new(path), &entropy_blob(ENTROPY_LEN))?;
        }

        self.install_policy(prof)?;
        info!(variant = prof.name, root = %jail.root().display(), "jail variant complete");
        Ok(())
    }

    /// Resolves and installs the variant's package file closure.
    ///
    /// Optional packages are probed first so resolution fails before any
    /// destructive work only for genuinely required names. Files outside
    /// the jail's mountpoint are filtered out up front (runtime-specific
    /// jails only carry their own subtree).
    fn install_packages(&mut self, jail: &JailTree, prof: &Profile) -> Result<()> {
        let mut names: Vec<String> = prof.packages.iter().map(|s| (*s).to_owned()).collect();
        for optional in prof.optional_packages {
            if self.resolver.exists(optional)? {
                names.push((*optional).to_owned());
            } else {
                debug!(package = optional, "optional package absent, skipping");
            }
        }
        if names.is_empty() {
            return Ok(());
        }

        let selection = FileSelection {
            packages: names,
            exclude_packages: prof.exclude_packages.iter().map(|s| (*s).to_owned()).collect(),
            recursive: true,
            include_prefixes: vec![jail.mountpoint().as_path().to_path_buf()],
            exclude_file_prefixes: prof
                .exclude_file_prefixes
                .iter()
                .map(PathBuf::from)
                .collect(),
        };
        let files = self.resolver.files_for(&selection)?;
        info!(variant = prof.name, files = files.len(), "installing package files");
        for file in &files {
            jail.install(file, file)?;
        }
        Ok(())
    }

    /// Copies the variant's syscall policy file next to its jail root.
    fn install_policy(&self, prof: &Profile) -> Result<()> {
        let Some(dir) = &self.config.policy_dir else {
            return Ok(());
        };
        let source = dir.join(format!("{}.policy", prof.name));
        if !source.exists() {
            debug!(variant = prof.name, "no policy file for variant");
            return Ok(());
        }
        let dest = self.config.target.join(format!("{}.policy", prof.name));
        fs::copy(&source, &dest).map_err(|e| Error::Install {
            src: source,
            dest,
            source: e,
        })?;
        Ok(())
    }
}

/// Installs the fixed baseline every `/`-rooted jail shares: identity
/// tables, mount placeholders, device nodes, CPU marker, locale data.
fn install_baseline(jail: &JailTree) -> Result<()> {
    for dir in MOUNT_DIRS {
        jail.make_dir(Path::new(dir))?;
    }
    jail.write(Path::new("/etc/passwd"), PASSWD.as_bytes())?;
    jail.write(Path::new("/etc/group"), GROUP.as_bytes())?;
    jail.write(Path::new("/sys/devices/system/cpu/online"), CPU_ONLINE.as_bytes())?;

    for &(path, mode, major, minor) in DEVICE_NODES {
        let node = Path::new(path);
        // mknod needs privileges; unprivileged builds get a placeholder
        // the launcher can bind-mount over.
        if let Err(e) = jail.device_node(node, mode, major, minor) {
            warn!(path, error = %e, "device node creation failed, touching placeholder");
            jail.touch(node)?;
        }
    }

    let locale = Path::new(LOCALE_TREE);
    if locale.exists() {
        jail.copy_tree_from_host(locale, &[])?;
    } else {
        debug!(path = LOCALE_TREE, "locale tree absent, skipping");
    }
    Ok(())
}

/// Fixed-seed xorshift64* byte stream; identical on every build.
fn entropy_blob(len: usize) -> Vec<u8> {
    let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
    let mut out = Vec::with_capacity(len + 8);
    while out.len() < len {
        state ^= state >> 12;
        state ^= state << 25;
        state ^= state >> 27;
        let word = state.wrapping_mul(0x2545_f491_4f6c_dd1d);
        out.extend_from_slice(&word.to_le_bytes());
    }
    out.truncate(len);
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::{BTreeSet, HashMap};
    use std::os::unix::fs::symlink;

    use super::*;
    use crate::resolver::PackageInfo;

    struct FakeBackend {
        packages: HashMap<String, PackageInfo>,
    }

    impl PackageBackend for FakeBackend {
        fn query(&self, name: &str) -> Result<Option<PackageInfo>> {
            Ok(self.packages.get(name).cloned())
        }
    }

    /// A backend with one `base` package owning `<host>/lib/base.so`.
    fn backend_with_base(host: &Path) -> FakeBackend {
        fs::create_dir_all(host.join("lib")).unwrap();
        fs::write(host.join("lib/base.so"), b"elf").unwrap();
        let mut packages = HashMap::new();
        packages.insert("base".to_owned(), PackageInfo {
            depends: Vec::new(),
            files: vec![host.join("lib/base.so")],
        });
        FakeBackend { packages }
    }

    fn test_profile() -> Profile {
        Profile {
            name: "test",
            mountpoint: "/",
            packages: &["base"],
            optional_packages: &["ghost"],
            exclude_packages: &[],
            exclude_file_prefixes: &[],
            host_trees: &[],
            remote_assets: &[],
            seeded_entropy: Some("/var/cache/seed"),
        }
    }

    fn builder<'a>(
        backend: &'a FakeBackend,
        target: &Path,
        cache: &Path,
    ) -> JailBuilder<'a> {
        let assets = AssetCache::open(cache).unwrap();
        let mut config = BuildConfig::new(target);
        config.mode = LinkMode::Copy;
        JailBuilder::new(backend, assets, config)
    }

    /// Sorted relative listing of everything under a jail root.
    fn listing(root: &Path) -> BTreeSet<PathBuf> {
        fn walk(dir: &Path, base: &Path, out: &mut BTreeSet<PathBuf>) {
            for entry in fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                out.insert(path.strip_prefix(base).unwrap().to_path_buf());
                if path.is_dir() && !path.is_symlink() {
                    walk(&path, base, out);
                }
            }
        }
        let mut out = BTreeSet::new();
        walk(root, root, &mut out);
        out
    }

    #[test]
    fn builds_baseline_and_package_files() {
        let tmp = tempfile::tempdir().unwrap();
        let host = tmp.path().canonicalize().unwrap();
        let backend = backend_with_base(&host);
        let mut b = builder(&backend, &host.join("jails"), &host.join("cache"));

        b.build_variant(&test_profile()).unwrap();

        let root = host.join("jails/test");
        assert_eq!(fs::read_to_string(root.join("etc/passwd")).unwrap(), PASSWD);
        assert_eq!(fs::read_to_string(root.join("etc/group")).unwrap(), GROUP);
        assert_eq!(
            fs::read_to_string(root.join("sys/devices/system/cpu/online")).unwrap(),
            CPU_ONLINE
        );
        // Package file mirrored at its host-absolute path.
        let installed = root.join(host.join("lib/base.so").strip_prefix("/").unwrap());
        assert_eq!(fs::read(installed).unwrap(), b"elf");
        // Device nodes (or unprivileged placeholders) exist.
        assert!(root.join("dev/null").exists());
        assert!(root.join("dev/zero").exists());
        // Mount placeholders for the isolation layer.
        assert!(root.join("proc").is_dir());
        assert!(root.join("tmp").is_dir());
    }

    #[test]
    fn rebuild_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let host = tmp.path().canonicalize().unwrap();
        let backend = backend_with_base(&host);
        let mut b = builder(&backend, &host.join("jails"), &host.join("cache"));
        let prof = test_profile();

        b.build_variant(&prof).unwrap();
        let root = host.join("jails/test");
        let first = listing(&root);
        let first_seed = fs::read(root.join("var/cache/seed")).unwrap();

        b.build_variant(&prof).unwrap();
        assert_eq!(listing(&root), first);
        assert_eq!(fs::read(root.join("var/cache/seed")).unwrap(), first_seed);
        assert_eq!(first_seed.len(), ENTROPY_LEN);
    }

    #[test]
    fn stale_content_is_destroyed_before_rebuild() {
        let tmp = tempfile::tempdir().unwrap();
        let host = tmp.path().canonicalize().unwrap();
        let backend = backend_with_base(&host);
        let mut b = builder(&backend, &host.join("jails"), &host.join("cache"));
        let prof = test_profile();

        b.build_variant(&prof).unwrap();
        let stale = host.join("jails/test/leftover");
        fs::write(&stale, b"stale").unwrap();

        b.build_variant(&prof).unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn missing_required_package_aborts_variant() {
        let tmp = tempfile::tempdir().unwrap();
        let host = tmp.path().canonicalize().unwrap();
        let backend = FakeBackend {
            packages: HashMap::new(),
        };
        let mut b = builder(&backend, &host.join("jails"), &host.join("cache"));

        let mut prof = test_profile();
        prof.optional_packages = &[];
        let err = b.build_variant(&prof).unwrap_err();
        assert!(matches!(err, Error::MissingPackage(name) if name == "base"));
        // Resolution failed before any destructive work.
        assert!(!host.join("jails/test").exists());
    }

    #[test]
    fn completed_variants_survive_later_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let host = tmp.path().canonicalize().unwrap();
        let backend = backend_with_base(&host);
        let mut b = builder(&backend, &host.join("jails"), &host.join("cache"));

        let good = test_profile();
        let mut bad = test_profile();
        bad.name = "broken";
        bad.packages = &["no-such-package"];

        let err = b.build_all(&[good, bad]).unwrap_err();
        assert!(matches!(err, Error::MissingPackage(_)));
        // The first variant is fully assembled and untouched.
        assert!(host.join("jails/test/etc/passwd").exists());
    }

    #[test]
    fn runtime_jail_only_carries_its_mountpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let host = tmp.path().canonicalize().unwrap();

        // A fake JVM tree with an in-mount and an escaping symlink.
        let jvm = host.join("jvm");
        fs::create_dir_all(jvm.join("bin")).unwrap();
        fs::create_dir_all(jvm.join("man/man1")).unwrap();
        fs::write(jvm.join("bin/java"), b"java").unwrap();
        fs::write(jvm.join("man/man1/java.1"), b"man").unwrap();
        fs::write(host.join("cacerts"), b"certs").unwrap();
        symlink("bin/java", jvm.join("java")).unwrap();
        symlink(host.join("cacerts"), jvm.join("cacerts")).unwrap();

        let mut packages = HashMap::new();
        packages.insert("jdk".to_owned(), PackageInfo {
            depends: Vec::new(),
            files: vec![jvm.join("bin/java"), host.join("cacerts")],
        });
        let backend = FakeBackend { packages };
        let mut b = builder(&backend, &host.join("jails"), &host.join("cache"));

        // Leak the host-derived strings: Profile carries &'static str by
        // design (it is a static table in production).
        let mountpoint: &'static str =
            Box::leak(format!("{}/", jvm.display()).into_boxed_str());
        let tree: &'static str = Box::leak(jvm.display().to_string().into_boxed_str());
        let prof = Profile {
            name: "jvm",
            mountpoint,
            packages: &["jdk"],
            optional_packages: &[],
            exclude_packages: &[],
            exclude_file_prefixes: &[],
            host_trees: vec![tree].leak(),
            remote_assets: &[],
            seeded_entropy: None,
        };

        b.build_variant(&prof).unwrap();
        let root = host.join("jails/jvm");

        // In-mount symlink survives; escaping symlink became content.
        assert_eq!(fs::read(root.join("bin/java")).unwrap(), b"java");
        assert!(
            fs::symlink_metadata(root.join("java"))
                .unwrap()
                .file_type()
                .is_symlink()
        );
        let cacerts = root.join("cacerts");
        assert!(!fs::symlink_metadata(&cacerts).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(&cacerts).unwrap(), b"certs");

        // The host tree is mirrored in full, man pages included.
        assert_eq!(fs::read(root.join("man/man1/java.1")).unwrap(), b"man");
    }

    #[test]
    fn policy_files_are_copied_verbatim() {
        let tmp = tempfile::tempdir().unwrap();
        let host = tmp.path().canonicalize().unwrap();
        let backend = backend_with_base(&host);

        let policies = host.join("policies");
        fs::create_dir_all(&policies).unwrap();
        fs::write(policies.join("test.policy"), "read: 1\nwrite: fd <= 2\n").unwrap();

        let assets = AssetCache::open(host.join("cache")).unwrap();
        let mut config = BuildConfig::new(host.join("jails"));
        config.mode = LinkMode::Copy;
        config.policy_dir = Some(policies);
        let mut b = JailBuilder::new(&backend, assets, config);

        b.build_variant(&test_profile()).unwrap();
        assert_eq!(
            fs::read_to_string(host.join("jails/test.policy")).unwrap(),
            "read: 1\nwrite: fd <= 2\n"
        );
    }

    #[test]
    fn entropy_blob_is_deterministic() {
        assert_eq!(entropy_blob(16), entropy_blob(16));
        assert_eq!(entropy_blob(1024).len(), 1024);
        // Not all zeros.
        assert!(entropy_blob(16).iter().any(|b| *b != 0));
    }
}
