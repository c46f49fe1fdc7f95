//! Built-in jail variant profiles and baseline content.
//!
//! Profiles are data: the builder walks them without knowing what a
//! "compile" or "java" jail means. Adding a variant is a table edit.

/// A remote asset addressed by `(URL, SHA-1)`.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct RemoteAsset {
    /// Download URL.
    pub url: &'static str,
    /// Expected SHA-1 hex digest of the archive bytes.
    pub sha1: &'static str,
    /// Leading archive path stripped during extraction.
    pub strip_prefix: &'static str,
    /// Post-strip paths to cherry-pick; empty extracts everything.
    pub include: &'static [&'static str],
    /// Post-strip prefixes skipped during extraction.
    pub exclude: &'static [&'static str],
}

/// One jail variant: its mountpoint and the content that goes into it.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct Profile {
    /// Variant name; the jail root is `<target>/<name>`.
    pub name: &'static str,
    /// Absolute path this jail represents at runtime.
    pub mountpoint: &'static str,
    /// Required packages; unknown names are fatal.
    pub packages: &'static [&'static str],
    /// Packages probed for existence and skipped when absent.
    pub optional_packages: &'static [&'static str],
    /// Packages pruned from the dependency traversal.
    pub exclude_packages: &'static [&'static str],
    /// File prefixes dropped from resolved package file sets.
    pub exclude_file_prefixes: &'static [&'static str],
    /// Host directory trees mirrored into the jail.
    pub host_trees: &'static [&'static str],
    /// Remote archives unpacked into the jail.
    pub remote_assets: &'static [RemoteAsset],
    /// In-jail path receiving the deterministic fallback entropy blob.
    pub seeded_entropy: Option<&'static str>,
}

/// Documentation trees that are dead weight inside a jail.
pub const DOC_PREFIXES: &[&str] = &[
    "/usr/share/doc",
    "/usr/share/info",
    "/usr/share/lintian",
    "/usr/share/man",
];

/// Shared library baseline for every `/`-rooted variant.
const BASE_PACKAGES: &[&str] = &["libc6", "libgmp10", "libstdc++6", "zlib1g"];

/// Node.js runtime tarball; only the interpreter and its license are taken.
const NODE_ASSET: RemoteAsset = RemoteAsset {
    url: "https://nodejs.org/dist/v20.11.1/node-v20.11.1-linux-x64.tar.gz",
    sha1: "5a4ff1af97e7ba854c06a093e169d08a6d1f0e2b",
    strip_prefix: "node-v20.11.1-linux-x64/",
    include: &["bin/node", "LICENSE"],
    exclude: &[],
};

/// The jail variants one build run assembles, in build order.
pub const PROFILES: &[Profile] = &[
    Profile {
        name: "run",
        mountpoint: "/",
        packages: BASE_PACKAGES,
        optional_packages: &["libgomp1"],
        exclude_packages: &["debconf", "dpkg", "install-info"],
        exclude_file_prefixes: DOC_PREFIXES,
        host_trees: &[],
        remote_assets: &[],
        seeded_entropy: None,
    },
    Profile {
        name: "compile",
        mountpoint: "/",
        packages: &[
            "binutils",
            "g++",
            "gcc",
            "libc6",
            "libc6-dev",
            "libgmp10",
            "libstdc++6",
            "make",
            "zlib1g",
        ],
        optional_packages: &["clang"],
        exclude_packages: &["debconf", "dpkg", "install-info"],
        exclude_file_prefixes: DOC_PREFIXES,
        host_trees: &[],
        remote_assets: &[],
        seeded_entropy: None,
    },
    Profile {
        name: "java",
        mountpoint: "/usr/lib/jvm/",
        packages: &[],
        optional_packages: &["openjdk-17-jre-headless"],
        exclude_packages: &[],
        exclude_file_prefixes: DOC_PREFIXES,
        host_trees: &["/usr/lib/jvm"],
        remote_assets: &[],
        // JVMs block on entropy at startup; a fixed blob keeps builds
        // reproducible while giving the runtime something to read.
        seeded_entropy: Some("/usr/lib/jvm/.urandom"),
    },
    Profile {
        name: "node",
        mountpoint: "/usr/lib/node/",
        packages: &[],
        optional_packages: &[],
        exclude_packages: &[],
        exclude_file_prefixes: &[],
        host_trees: &[],
        remote_assets: &[NODE_ASSET],
        seeded_entropy: None,
    },
];

/// `/etc/passwd` for every `/`-rooted jail: exactly root, user, nobody.
pub const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/false
user:x:1000:1000:user:/home/user:/bin/false
nobody:x:65534:65534:nobody:/nonexistent:/bin/false
";

/// `/etc/group` matching [`PASSWD`].
pub const GROUP: &str = "\
root:x:0:
user:x:1000:
nobody:x:65534:
";

/// Single-CPU marker consumed by runtimes probing the CPU topology.
pub const CPU_ONLINE: &str = "0\n";

/// Character device nodes every `/`-rooted jail carries:
/// (in-jail path, permission bits, major, minor).
pub const DEVICE_NODES: &[(&str, u32, u64, u64)] = &[
    ("/dev/null", 0o666, 1, 3),
    ("/dev/zero", 0o666, 1, 5),
    ("/dev/random", 0o666, 1, 8),
    ("/dev/urandom", 0o666, 1, 9),
];

/// Mount placeholder directories for the runtime isolation layer.
pub const MOUNT_DIRS: &[&str] = &[
    "/dev",
    "/etc",
    "/home/user",
    "/proc",
    "/tmp",
    "/usr/lib/jvm",
    "/usr/lib/node",
];

/// Host locale tree mirrored into `/`-rooted jails when present.
pub const LOCALE_TREE: &str = "/usr/lib/locale/C.utf8";
