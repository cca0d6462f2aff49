//! Implementation of the `kapply apply` command.
//!
//! Renders each manifest with the given parameters and applies them to the
//! cluster in order, stopping at the first failure.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use kapply_lib::Batch;
use kapply_lib::render::TemplateRenderer;
use tracing::info;

use super::{ClusterArgs, ManifestArgs, cancel_on_interrupt, load_config, manifest_refs, reconciler};
use crate::output::{OutputFormat, print_report};

/// Execute the apply command.
///
/// Compiled-in kinds are applied through their typed clients and everything
/// else through discovery. `generic` sends every manifest through discovery.
pub fn cmd_apply(
  source: &ManifestArgs,
  cluster: &ClusterArgs,
  config: Option<&Path>,
  generic: bool,
  manifests: &[String],
  format: OutputFormat,
) -> Result<()> {
  let config = load_config(config)?;
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
    if generic {
      reconciler.apply_generic(&batch, None).await
    } else {
      reconciler.apply_any(&batch, None).await
    }
  })?;

  info!(manifests = report.len(), "apply finished");
  print_report(&report, started.elapsed(), format)
}
