//! Implementation of the `kapply render` command.
//!
//! Works without a cluster: renders one manifest and prints it.

use anyhow::{Context, Result};
use kapply_lib::decode::DecoderRegistry;
use kapply_lib::manifest::{ManifestRef, ManifestSource};
use kapply_lib::render::{TemplateRenderer, render_manifest};
use serde_json::json;

use super::ManifestArgs;
use crate::output::{self, OutputFormat, print_info};

pub fn cmd_render(source: &ManifestArgs, manifest: &str, check: bool, format: OutputFormat) -> Result<()> {
  let params = source.render_params()?;
  let raw = source
    .source()
    .get(&ManifestRef::from(manifest))
    .with_context(|| format!("failed to fetch {manifest}"))?;
  let rendered = render_manifest(&raw, Some(&TemplateRenderer), &params)
    .with_context(|| format!("failed to render {manifest}"))?;
  let text = String::from_utf8_lossy(&rendered);

  let decoded = if check {
    let decoded = DecoderRegistry::global()
      .decode(&rendered)
      .with_context(|| format!("failed to decode {manifest}"))?;
    Some((decoded.kind().to_string(), decoded.name().to_string()))
  } else {
    None
  };

  if format.is_json() {
    let (kind, name) = decoded.unzip();
    return output::print_json(&json!({
      "manifest": manifest,
      "kind": kind,
      "name": name,
      "rendered": text,
    }));
  }

  print!("{text}");
  if let Some((kind, name)) = decoded {
    print_info(&format!("{manifest} is a valid {kind} named {name}"));
  }
  Ok(())
}
