#![deny(warnings)]

//! Build step for firmware: stamps provenance into a header and publishes
//! the built image.

mod config;

use anyhow::{Context, Result};
use buildinfo_core::{BuildMetadata, GitCli, Resolver};
use clap::{Parser, Subcommand};
use config::ToolConfig;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("BUILDINFO_COMMIT"),
    " ",
    env!("BUILDINFO_TIMESTAMP"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "buildinfo", version = VERSION)]
struct Cli {
    /// YAML config; defaults to `buildinfo.yaml` when present.
    #[arg(long, short = 'c', value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write build info into the target header. Runs when no command is given.
    Stamp {
        /// Header to rewrite instead of the configured one.
        #[arg(long, value_name = "PATH")]
        target: Option<PathBuf>,
    },
    /// Print compiler define flags, one per line.
    Flags,
    /// Print the resolved build info.
    Show {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Copy a built image to the debug directory and try to upload it.
    Publish { artifact: PathBuf },
}

fn main() -> Result<()> {
    // Logging setup; stdout is reserved for `flags` and `show`.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = ToolConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Stamp { target: None }) {
        Command::Stamp { target } => stamp(&cfg, target),
        Command::Flags => {
            for flag in resolve(&cfg).build_flags() {
                println!("{flag}");
            }
            Ok(())
        }
        Command::Show { json } => show(&resolve(&cfg), json),
        Command::Publish { artifact } => {
            publish(&cfg, artifact);
            Ok(())
        }
    }
}

fn resolve(cfg: &ToolConfig) -> BuildMetadata {
    let git = GitCli::new(&cfg.repo_dir)
        .with_program(&cfg.git_program)
        .with_timeout(cfg.git_timeout());
    let meta = Resolver::new(git).resolve();
    info!(
        commit = %meta.revision.commit_hash,
        branch = %meta.revision.branch,
        timestamp = %meta.timestamp,
        "resolved build info"
    );
    meta
}

fn stamp(cfg: &ToolConfig, target: Option<PathBuf>) -> Result<()> {
    let target = target.unwrap_or_else(|| cfg.target.clone());
    let meta = resolve(cfg);
    buildinfo_inject::inject(&target, &meta)
        .with_context(|| format!("failed to stamp build info into {}", target.display()))?;
    Ok(())
}

fn show(meta: &BuildMetadata, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(meta)?);
    } else {
        println!("commit:    {}", meta.revision.commit_hash);
        println!("branch:    {}", meta.revision.branch);
        println!("timestamp: {}", meta.timestamp);
    }
    Ok(())
}

/// Best effort: a failed copy is logged and does not fail the build.
fn publish(cfg: &ToolConfig, artifact: PathBuf) {
    match buildinfo_publish::publish(&artifact, &cfg.publish_config()) {
        Ok(report) if report.skipped => {}
        Ok(report) => info!(
            copied = report.copied.len(),
            upload = ?report.upload,
            "publish finished"
        ),
        Err(err) => error!(error = %err, "artifact copy failed"),
    }
}
