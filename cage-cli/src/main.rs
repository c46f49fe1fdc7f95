//! CLI for the cage jail assembler.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

use std::path::PathBuf;

use anyhow::Result;
use cage::{BuildConfig, DpkgBackend, JailBuilder, LinkMode, PROFILES};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Parser)]
#[command(name = "cage", version, about = "Minimal jail filesystem assembler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Assemble every jail variant (or a subset).
    Build(BuildArgs),

    /// List the built-in jail variants.
    Variants {
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

#[derive(clap::Args)]
struct BuildArgs {
    /// Directory receiving one jail root per variant.
    #[arg(long, default_value = "/var/lib/cage")]
    target: PathBuf,

    /// Copy files instead of hard-linking them.
    #[arg(long)]
    copy: bool,

    /// Build only the named variants.
    #[arg(long = "only", value_name = "VARIANT")]
    only: Vec<String>,

    /// Directory of per-variant syscall policy files (<variant>.policy).
    #[arg(long)]
    policy_dir: Option<PathBuf>,

    /// Cache directory for downloaded assets.
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

/// Output format for list commands.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = Cli::parse().dispatch() {
        eprintln!("cage: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Build(args) => build(args),
            Command::Variants { format } => variants(format),
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "cage", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}

fn build(args: BuildArgs) -> Result<()> {
    for name in &args.only {
        if !PROFILES.iter().any(|p| p.name == *name) {
            anyhow::bail!("unknown variant: {name}");
        }
    }
    let selected: Vec<_> = PROFILES
        .iter()
        .filter(|p| args.only.is_empty() || args.only.iter().any(|n| n == p.name))
        .copied()
        .collect();

    let assets = match &args.cache_dir {
        Some(dir) => cage_assets::AssetCache::open(dir)?,
        None => cage_assets::AssetCache::open_default()?,
    };
    let backend = DpkgBackend;
    let mut config = BuildConfig::new(args.target);
    config.mode = if args.copy {
        LinkMode::Copy
    } else {
        LinkMode::Hardlink
    };
    config.policy_dir = args.policy_dir;

    let mut builder = JailBuilder::new(&backend, assets, config);
    builder.build_all(&selected)?;
    Ok(())
}

fn variants(format: OutputFormat) -> Result<()> {
    if matches!(format, OutputFormat::Json) {
        let list: Vec<_> = PROFILES
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "mountpoint": p.mountpoint,
                    "packages": p.packages,
                    "optional_packages": p.optional_packages,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    println!("{:<10} {:<16} PACKAGES", "NAME", "MOUNTPOINT");
    for p in PROFILES {
        println!("{:<10} {:<16} {}", p.name, p.mountpoint, p.packages.join(", "));
    }
    Ok(())
}
