//! kapply: apply Kubernetes manifest templates to a cluster.

mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{ClusterArgs, ManifestArgs};
use output::{OutputFormat, print_error};

/// kapply - apply Kubernetes manifest templates in order
#[derive(Parser)]
#[command(name = "kapply")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Path to a TOML reconciler config
  #[arg(long, global = true, env = "KAPPLY_CONFIG")]
  config: Option<PathBuf>,

  /// Output format
  #[arg(long, global = true, value_enum, default_value_t)]
  format: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Render a manifest template and print the result
  Render {
    #[command(flatten)]
    source: ManifestArgs,

    /// Manifest to render, relative to the manifest directory
    manifest: String,

    /// Also decode the rendered manifest to validate it
    #[arg(long)]
    check: bool,
  },

  /// Apply manifests to the cluster in the order given
  Apply {
    #[command(flatten)]
    source: ManifestArgs,

    #[command(flatten)]
    cluster: ClusterArgs,

    /// Address every manifest through discovery, skipping compiled-in kinds
    #[arg(long)]
    generic: bool,

    /// Manifests to apply, relative to the manifest directory
    #[arg(required = true)]
    manifests: Vec<String>,
  },

  /// Create CustomResourceDefinitions and wait until each is established
  Crds {
    #[command(flatten)]
    source: ManifestArgs,

    #[command(flatten)]
    cluster: ClusterArgs,

    /// How long to wait for each definition (e.g. "2m")
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// CustomResourceDefinition manifests, relative to the manifest directory
    #[arg(required = true)]
    manifests: Vec<String>,
  },
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let default_filter = if cli.verbose { "kapply=debug,kapply_lib=debug" } else { "warn" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let config = cli.config.as_deref();
  let result = match cli.command {
    Commands::Render {
      source,
      manifest,
      check,
    } => cmd::cmd_render(&source, &manifest, check, cli.format),
    Commands::Apply {
      source,
      cluster,
      generic,
      manifests,
    } => cmd::cmd_apply(&source, &cluster, config, generic, &manifests, cli.format),
    Commands::Crds {
      source,
      cluster,
      timeout,
      manifests,
    } => cmd::cmd_crds(&source, &cluster, config, timeout, &manifests, cli.format),
  };

  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      print_error(&format!("{err:#}"));
      ExitCode::FAILURE
    }
  }
}
