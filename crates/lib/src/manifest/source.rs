//! Byte stores addressed by [`ManifestRef`].

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use super::ManifestRef;

/// Errors returned when resolving a manifest to bytes.
#[derive(Debug, Error)]
pub enum SourceError {
  #[error("manifest not found: {0}")]
  NotFound(ManifestRef),

  #[error("failed to read manifest {manifest}: {source}")]
  Io {
    manifest: ManifestRef,
    #[source]
    source: io::Error,
  },
}

/// Read-only store of manifest bytes.
pub trait ManifestSource: Send + Sync {
  fn get(&self, manifest: &ManifestRef) -> Result<Vec<u8>, SourceError>;
}

/// Manifests stored as files below a root directory.
#[derive(Debug, Clone)]
pub struct DirSource {
  root: PathBuf,
}

impl DirSource {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Map a ref onto a path below the root, refusing anything that would
  /// escape it.
  fn resolve(&self, manifest: &ManifestRef) -> Option<PathBuf> {
    let relative = Path::new(manifest.as_str());
    let escapes = relative
      .components()
      .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if escapes || manifest.as_str().is_empty() {
      return None;
    }
    Some(self.root.join(relative))
  }
}

impl ManifestSource for DirSource {
  fn get(&self, manifest: &ManifestRef) -> Result<Vec<u8>, SourceError> {
    let path = self
      .resolve(manifest)
      .ok_or_else(|| SourceError::NotFound(manifest.clone()))?;
    debug!(manifest = %manifest, path = %path.display(), "reading manifest");

    std::fs::read(&path).map_err(|source| {
      if source.kind() == io::ErrorKind::NotFound {
        SourceError::NotFound(manifest.clone())
      } else {
        SourceError::Io {
          manifest: manifest.clone(),
          source,
        }
      }
    })
  }
}

/// Manifests held in memory, e.g. assets embedded with `include_bytes!`.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
  assets: BTreeMap<ManifestRef, Vec<u8>>,
}

impl MemorySource {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, manifest: impl Into<ManifestRef>, bytes: impl Into<Vec<u8>>) -> Self {
    self.insert(manifest, bytes);
    self
  }

  pub fn insert(&mut self, manifest: impl Into<ManifestRef>, bytes: impl Into<Vec<u8>>) {
    self.assets.insert(manifest.into(), bytes.into());
  }
}

impl ManifestSource for MemorySource {
  fn get(&self, manifest: &ManifestRef) -> Result<Vec<u8>, SourceError> {
    self
      .assets
      .get(manifest)
      .cloned()
      .ok_or_else(|| SourceError::NotFound(manifest.clone()))
  }
}
