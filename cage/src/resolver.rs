//! Transitive closure of package-owned files.
//!
//! The resolver walks the package dependency graph depth-first, memoizing
//! per-package results so a diamond dependency is queried once, and
//! guarding the traversal so a dependency cycle terminates.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

use tracing::debug;

use crate::{Error, Result};

/// Package metadata as reported by a backend.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct PackageInfo {
    /// Dependency slots; each inner list is an OR group of alternative
    /// package names, any one of which satisfies the slot.
    pub depends: Vec<Vec<String>>,
    /// Host paths the package owns (files and directories alike; the
    /// resolver keeps only existing regular files).
    pub files: Vec<PathBuf>,
}

/// Source of package metadata.
///
/// Injected at resolver construction so tests can substitute an in-memory
/// fake for the real `dpkg-query` backend.
pub trait PackageBackend {
    /// Looks up a package by name; `None` means the package is unknown.
    ///
    /// Whether an unknown package is fatal is the caller's decision
    /// (required vs. optional package lists).
    fn query(&self, name: &str) -> Result<Option<PackageInfo>>;
}

/// Parameters for one closure computation.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct FileSelection {
    /// Packages whose files are wanted. Unknown names here are fatal.
    pub packages: Vec<String>,
    /// Packages contributing nothing, with their whole subtree pruned.
    pub exclude_packages: Vec<String>,
    /// Whether to descend into dependencies.
    pub recursive: bool,
    /// If non-empty, keep only files under one of these prefixes.
    pub include_prefixes: Vec<PathBuf>,
    /// Drop files under any of these prefixes.
    pub exclude_file_prefixes: Vec<PathBuf>,
}

/// A package's memoized metadata, filtered to usable files.
#[derive(Debug, Clone)]
struct CachedPackage {
    depends: Vec<Vec<String>>,
    files: Vec<PathBuf>,
}

/// Memoizing dependency resolver over a [`PackageBackend`].
///
/// The memo lives for one resolver (one build run); there is no cross-run
/// persistence.
pub struct Resolver<'b> {
    backend: &'b dyn PackageBackend,
    /// `None` records a confirmed-unknown package so existence probes are
    /// also queried at most once.
    memo: HashMap<String, Option<CachedPackage>>,
}

impl std::fmt::Debug for Resolver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("memoized", &self.memo.len())
            .finish()
    }
}

impl<'b> Resolver<'b> {
    /// Creates a resolver over `backend` with an empty memo.
    pub fn new(backend: &'b dyn PackageBackend) -> Self {
        Self {
            backend,
            memo: HashMap::new(),
        }
    }

    /// Returns `true` if the backend knows `name`.
    pub fn exists(&mut self, name: &str) -> Result<bool> {
        Ok(self.lookup(name)?.is_some())
    }

    /// Computes the file set for `selection`.
    ///
    /// Files the backend lists but the host does not have, and paths that
    /// are directories, are silently dropped — directory structure is
    /// created separately and package metadata routinely names files that
    /// only exist on other architectures.
    pub fn files_for(&mut self, selection: &FileSelection) -> Result<BTreeSet<PathBuf>> {
        let excluded: HashSet<&str> = selection
            .exclude_packages
            .iter()
            .map(String::as_str)
            .collect();
        let mut visited = HashSet::new();
        let mut out = BTreeSet::new();

        for name in &selection.packages {
            if self.lookup(name)?.is_none() {
                return Err(Error::MissingPackage(name.clone()));
            }
            self.visit(name, selection.recursive, &excluded, &mut visited, &mut out)?;
        }

        out.retain(|path| {
            (selection.include_prefixes.is_empty()
                || selection.include_prefixes.iter().any(|p| path.starts_with(p)))
                && !selection
                    .exclude_file_prefixes
                    .iter()
                    .any(|p| path.starts_with(p))
        });
        Ok(out)
    }

    /// Depth-first visit of one known package.
    fn visit(
        &mut self,
        name: &str,
        recursive: bool,
        excluded: &HashSet<&str>,
        visited: &mut HashSet<String>,
        out: &mut BTreeSet<PathBuf>,
    ) -> Result<()> {
        if excluded.contains(name) || !visited.insert(name.to_owned()) {
            return Ok(());
        }
        let Some(cached) = self.lookup(name)? else {
            return Err(Error::MissingPackage(name.to_owned()));
        };
        out.extend(cached.files.iter().cloned());
        if !recursive {
            return Ok(());
        }

        let depends = cached.depends.clone();
        for group in &depends {
            // The first installed alternative of an OR group wins; a group
            // with no installed alternative contributes nothing.
            for alt in group {
                if self.lookup(alt)?.is_some() {
                    self.visit(alt, recursive, excluded, visited, out)?;
                    break;
                }
                debug!(package = alt, "dependency alternative not installed");
            }
        }
        Ok(())
    }

    /// Memoized backend lookup, filtering files to existing regular files.
    fn lookup(&mut self, name: &str) -> Result<Option<&CachedPackage>> {
        if !self.memo.contains_key(name) {
            let cached = self.backend.query(name)?.map(|info| {
                let total = info.files.len();
                let files: Vec<PathBuf> =
                    info.files.into_iter().filter(|p| p.is_file()).collect();
                if files.len() < total {
                    debug!(
                        package = name,
                        dropped = total - files.len(),
                        "skipping absent or directory entries"
                    );
                }
                CachedPackage {
                    depends: info.depends,
                    files,
                }
            });
            self.memo.insert(name.to_owned(), cached);
        }
        Ok(self.memo[name].as_ref())
    }
}
