//! Kind to resource-path resolution.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use kube::Client;
use kube::core::GroupVersionKind;
use kube::discovery::{ApiResource, Scope, oneshot::pinned_kind};
use tracing::debug;

use super::ClientError;

/// How to address a collection of one kind.
#[derive(Debug, Clone)]
pub struct RestMapping {
  pub resource: ApiResource,
  pub namespaced: bool,
}

/// Resolves a group/version/kind to its [`RestMapping`].
#[async_trait]
pub trait RestMapper: Send + Sync {
  async fn mapping(&self, gvk: &GroupVersionKind) -> Result<RestMapping, ClientError>;
}

/// Discovery-backed mapper that only asks the server about kinds it has not
/// seen yet.
///
/// Hits are cached for the lifetime of the mapper. Call [`reset`] when the
/// set of served kinds is known to have changed, e.g. after new CRDs were
/// established.
///
/// [`reset`]: DeferredDiscoveryMapper::reset
pub struct DeferredDiscoveryMapper {
  client: Client,
  mappings: RwLock<HashMap<GroupVersionKind, RestMapping>>,
}

impl DeferredDiscoveryMapper {
  pub fn new(client: Client) -> Self {
    Self {
      client,
      mappings: RwLock::new(HashMap::new()),
    }
  }

  /// Forget every cached mapping.
  pub fn reset(&self) {
    self.mappings.write().unwrap_or_else(|e| e.into_inner()).clear();
  }

  fn cached(&self, gvk: &GroupVersionKind) -> Option<RestMapping> {
    self.mappings.read().unwrap_or_else(|e| e.into_inner()).get(gvk).cloned()
  }
}

#[async_trait]
impl RestMapper for DeferredDiscoveryMapper {
  async fn mapping(&self, gvk: &GroupVersionKind) -> Result<RestMapping, ClientError> {
    if let Some(mapping) = self.cached(gvk) {
      debug!(kind = %gvk.kind, "rest mapping cache hit");
      return Ok(mapping);
    }

    debug!(group = %gvk.group, version = %gvk.version, kind = %gvk.kind, "discovering rest mapping");
    let (resource, capabilities) = pinned_kind(&self.client, gvk)
      .await
      .map_err(|e| ClientError::Discovery {
        kind: describe(gvk),
        message: e.to_string(),
      })?;

    let mapping = RestMapping {
      resource,
      namespaced: matches!(capabilities.scope, Scope::Namespaced),
    };
    self
      .mappings
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .insert(gvk.clone(), mapping.clone());
    Ok(mapping)
  }
}

/// `group/version/Kind`, or `version/Kind` for the core group.
pub(crate) fn describe(gvk: &GroupVersionKind) -> String {
  if gvk.group.is_empty() {
    format!("{}/{}", gvk.version, gvk.kind)
  } else {
    format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
  }
}
