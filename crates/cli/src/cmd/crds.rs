//! Implementation of the `kapply crds` command.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use kapply_lib::Batch;
use kapply_lib::render::TemplateRenderer;

use super::{ClusterArgs, ManifestArgs, cancel_on_interrupt, load_config, manifest_refs, reconciler};
use crate::output::{OutputFormat, print_report};

/// Create each CustomResourceDefinition that is missing and wait until the
/// API server reports it established. `timeout` overrides the per-definition
/// wait from the config.
pub fn cmd_crds(
  source: &ManifestArgs,
  cluster: &ClusterArgs,
  config: Option<&Path>,
  timeout: Option<Duration>,
  manifests: &[String],
  format: OutputFormat,
) -> Result<()> {
  let mut config = load_config(config)?;
  if let Some(timeout) = timeout {
    config.establish.timeout = timeout;
    config.validate().context("invalid --timeout")?;
  }
  let params = source.render_params()?;
  let credential = cluster.credential()?;
  let refs = manifest_refs(manifests);
  let reconciler = reconciler(source, config);

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let started = Instant::now();
  let report = rt.block_on(async {
    let batch = Batch::new(&credential, &refs)
      .with_render(&TemplateRenderer)
      .with_params(params)
      .with_cancel(cancel_on_interrupt());
    reconciler.apply_crds_and_wait(&batch).await
  })?;

  print_report(&report, started.elapsed(), format)
}
