//! Package metadata backend over `dpkg-query`.

use std::path::PathBuf;
use std::process::Command;

use crate::resolver::{PackageBackend, PackageInfo};
use crate::{Error, Result};

/// Backend that shells out to `dpkg-query` on the build host.
///
/// A package is "known" when it is installed locally; dependency fields
/// come from `${Depends}` and file lists from `--listfiles`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DpkgBackend;

impl PackageBackend for DpkgBackend {
    fn query(&self, name: &str) -> Result<Option<PackageInfo>> {
        let Some(depends_field) = run_dpkg(&["--show", "--showformat=${Depends}", name])? else {
            return Ok(None);
        };
        let Some(listing) = run_dpkg(&["--listfiles", name])? else {
            return Ok(None);
        };

        let files = listing
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && *line != "/.")
            .map(PathBuf::from)
            .collect();
        Ok(Some(PackageInfo {
            depends: parse_depends(&depends_field),
            files,
        }))
    }
}

/// Runs `dpkg-query` with `args`; `None` when the package is unknown.
fn run_dpkg(args: &[&str]) -> Result<Option<String>> {
    let output = Command::new("dpkg-query")
        .args(args)
        .output()
        .map_err(|e| Error::Backend(format!("dpkg-query: {e}")))?;
    if !output.status.success() {
        return Ok(None);
    }
    String::from_utf8(output.stdout)
        .map(Some)
        .map_err(|e| Error::Backend(format!("dpkg-query produced invalid UTF-8: {e}")))
}

/// Parses a dpkg `Depends` field into OR alternative groups.
///
/// `"libc6 (>= 2.34), debconf | debconf-2.0"` becomes
/// `[["libc6"], ["debconf", "debconf-2.0"]]`. Version constraints and
/// architecture qualifiers are discarded.
fn parse_depends(raw: &str) -> Vec<Vec<String>> {
    raw.split(',')
        .filter_map(|group| {
            let alternatives: Vec<String> = group
                .split('|')
                .filter_map(|alternative| {
                    let name = alternative.trim().split([' ', '(', ':']).next()?;
                    (!name.is_empty()).then(|| name.to_owned())
                })
                .collect();
            (!alternatives.is_empty()).then_some(alternatives)
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_names() {
        assert_eq!(parse_depends("libc6, zlib1g"), vec![
            vec!["libc6".to_owned()],
            vec!["zlib1g".to_owned()]
        ]);
    }

    #[test]
    fn strips_version_constraints() {
        assert_eq!(parse_depends("libc6 (>= 2.34)"), vec![vec![
            "libc6".to_owned()
        ]]);
    }

    #[test]
    fn splits_or_groups() {
        assert_eq!(parse_depends("debconf (>= 0.5) | debconf-2.0"), vec![vec![
            "debconf".to_owned(),
            "debconf-2.0".to_owned()
        ]]);
    }

    #[test]
    fn strips_arch_qualifiers() {
        assert_eq!(parse_depends("python3:any"), vec![vec!["python3".to_owned()]]);
    }

    #[test]
    fn empty_field_has_no_groups() {
        assert!(parse_depends("").is_empty());
        assert!(parse_depends("  ").is_empty());
    }
}
