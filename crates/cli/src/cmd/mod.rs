mod apply;
mod crds;
mod render;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Args;
use kapply_lib::config::ReconcileConfig;
use kapply_lib::manifest::{DirSource, ManifestRef};
use kapply_lib::render::RenderParams;
use kapply_lib::Reconciler;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::output::print_warning;

pub use apply::cmd_apply;
pub use crds::cmd_crds;
pub use render::cmd_render;

/// Where manifests come from and how they are rendered.
#[derive(Debug, Args)]
pub struct ManifestArgs {
  /// Directory manifests are read from
  #[arg(short = 'C', long = "dir", default_value = ".")]
  pub dir: PathBuf,

  /// Template parameter; dotted keys nest (e.g. `Images.Router=quay.io/router`)
  #[arg(long = "set", value_name = "KEY=VALUE")]
  pub set: Vec<String>,

  /// YAML or JSON file with template parameters
  #[arg(long)]
  pub params: Option<PathBuf>,
}

impl ManifestArgs {
  pub fn source(&self) -> DirSource {
    DirSource::new(&self.dir)
  }

  /// Parameters from `--params`, then each `--set` on top.
  pub fn render_params(&self) -> Result<RenderParams> {
    let mut root = match &self.params {
      Some(path) => read_params_file(path)?,
      None => Map::new(),
    };
    for assignment in &self.set {
      let (key, value) = assignment
        .split_once('=')
        .with_context(|| format!("invalid --set {assignment:?}: expected KEY=VALUE"))?;
      set_path(&mut root, key, Value::String(value.to_string()))?;
    }
    serde_json::from_value(Value::Object(root)).context("invalid template parameters")
  }
}

/// Which cluster to talk to.
#[derive(Debug, Args)]
pub struct ClusterArgs {
  /// Kubeconfig to use. Falls back to $KUBECONFIG, then ~/.kube/config
  #[arg(long, env = "KAPPLY_KUBECONFIG")]
  pub kubeconfig: Option<PathBuf>,
}

impl ClusterArgs {
  pub fn credential(&self) -> Result<String> {
    let path = match &self.kubeconfig {
      Some(path) => path.clone(),
      None => default_kubeconfig()?,
    };
    path
      .to_str()
      .map(str::to_string)
      .with_context(|| format!("kubeconfig path is not UTF-8: {}", path.display()))
  }
}

fn default_kubeconfig() -> Result<PathBuf> {
  if let Some(first) = std::env::var_os("KUBECONFIG")
    .as_deref()
    .and_then(|v| std::env::split_paths(v).find(|p| !p.as_os_str().is_empty()))
  {
    return Ok(first);
  }
  match std::env::var_os("HOME") {
    Some(home) => Ok(Path::new(&home).join(".kube").join("config")),
    None => bail!("no kubeconfig: pass --kubeconfig or set KUBECONFIG"),
  }
}

fn read_params_file(path: &Path) -> Result<Map<String, Value>> {
  let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
  match serde_yaml::from_str::<Value>(&text).with_context(|| format!("failed to parse {}", path.display()))? {
    Value::Object(map) => Ok(map),
    Value::Null => Ok(Map::new()),
    _ => bail!("{} must contain a mapping", path.display()),
  }
}

fn set_path(root: &mut Map<String, Value>, key: &str, value: Value) -> Result<()> {
  let mut parts = key.split('.').peekable();
  let mut current = root;
  while let Some(part) = parts.next() {
    if part.is_empty() {
      bail!("invalid parameter key {key:?}");
    }
    if parts.peek().is_none() {
      current.insert(part.to_string(), value);
      return Ok(());
    }
    let next = current
      .entry(part.to_string())
      .or_insert_with(|| Value::Object(Map::new()));
    if !next.is_object() {
      *next = Value::Object(Map::new());
    }
    current = next
      .as_object_mut()
      .with_context(|| format!("invalid parameter key {key:?}"))?;
  }
  Ok(())
}

pub(crate) fn load_config(path: Option<&Path>) -> Result<ReconcileConfig> {
  match path {
    Some(path) => ReconcileConfig::load(path).with_context(|| format!("failed to load {}", path.display())),
    None => Ok(ReconcileConfig::default()),
  }
}

pub(crate) fn reconciler(source: &ManifestArgs, config: ReconcileConfig) -> Reconciler<kapply_lib::client::KubeconfigFactory> {
  Reconciler::with_kubeconfig(Arc::new(source.source()), config)
}

pub(crate) fn manifest_refs(manifests: &[String]) -> Vec<ManifestRef> {
  manifests.iter().map(|m| ManifestRef::from(m.as_str())).collect()
}

/// Token cancelled on the first Ctrl-C.
pub(crate) fn cancel_on_interrupt() -> CancellationToken {
  let cancel = CancellationToken::new();
  let token = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      print_warning("interrupted, stopping after the current request");
      token.cancel();
    }
  });
  cancel
}
