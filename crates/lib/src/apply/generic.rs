use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::core::TypeMeta;
use tracing::debug;

use super::{ApplyError, ApplyOutcome, ResourceHandler, create_or_merge, scope_namespace};
use crate::client::{ClientCacheEntry, ClientProvider, RestMapping};
use crate::decode::{decode_unstructured, group_version_kind};
use crate::error::Operation;
use crate::render::{Render, RenderParams, render_manifest};

/// Merge step for existing untyped objects. Returns whether it changed
/// `existing`.
pub type ModifyOnExists = Arc<dyn Fn(&mut DynamicObject, &DynamicObject) -> bool + Send + Sync>;

/// An untyped object paired with the REST mapping used to address it.
#[derive(Debug, Clone)]
pub struct ResolvedObject {
  pub object: DynamicObject,
  pub mapping: RestMapping,
}

/// Applier for kinds without a compiled-in schema.
pub struct GenericApplier<P> {
  entry: Arc<ClientCacheEntry<P>>,
  default_namespace: String,
  modify: Option<ModifyOnExists>,
}

impl<P: ClientProvider> GenericApplier<P> {
  pub fn new(entry: Arc<ClientCacheEntry<P>>, default_namespace: impl Into<String>) -> Self {
    Self {
      entry,
      default_namespace: default_namespace.into(),
      modify: None,
    }
  }

  pub fn with_modify(mut self, modify: Option<ModifyOnExists>) -> Self {
    self.modify = modify;
    self
  }
}

#[async_trait]
impl<P: ClientProvider> ResourceHandler for GenericApplier<P> {
  type Prepared = ResolvedObject;

  async fn read(
    &self,
    raw: &[u8],
    render: Option<&dyn Render>,
    params: &RenderParams,
  ) -> Result<ResolvedObject, ApplyError> {
    let rendered = render_manifest(raw, render, params)?;
    let object = decode_unstructured(&rendered)?;
    resolve(&self.entry, object).await
  }

  async fn handle(&self, resolved: ResolvedObject) -> Result<ApplyOutcome, ApplyError> {
    apply_resolved(&self.entry, &self.default_namespace, resolved, self.modify.as_ref()).await
  }
}

/// Look up how to address `object` and stamp the resolved group, version
/// and kind onto it.
pub(crate) async fn resolve<P: ClientProvider>(
  entry: &ClientCacheEntry<P>,
  mut object: DynamicObject,
) -> Result<ResolvedObject, ApplyError> {
  let gvk = group_version_kind(&object)?;
  let mapping = entry
    .mapper()
    .mapping(&gvk)
    .await
    .map_err(ApplyError::client(Operation::Resolve))?;
  debug!(
    kind = %mapping.resource.kind,
    plural = %mapping.resource.plural,
    namespaced = mapping.namespaced,
    "resolved rest mapping"
  );

  object.types = Some(TypeMeta {
    api_version: mapping.resource.api_version.clone(),
    kind: mapping.resource.kind.clone(),
  });
  Ok(ResolvedObject { object, mapping })
}

pub(crate) async fn apply_resolved<P: ClientProvider>(
  entry: &ClientCacheEntry<P>,
  default_namespace: &str,
  resolved: ResolvedObject,
  modify: Option<&ModifyOnExists>,
) -> Result<ApplyOutcome, ApplyError> {
  let ResolvedObject { mut object, mapping } = resolved;
  let namespace = scope_namespace(&mut object.metadata, mapping.namespaced, default_namespace);
  let client = entry.provider().dynamic(&mapping.resource, namespace.as_deref());

  create_or_merge(client.as_ref(), &mapping.resource.kind, &object, |existing, required| {
    modify.is_some_and(|modify| modify(existing, required))
  })
  .await
}
