use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::Metadata;

use super::{ApplyError, ApplyOutcome, ResourceHandler, create_or_merge, scope_namespace};
use crate::client::{ClientCacheEntry, ClientProvider};
use crate::decode::decode_typed;
use crate::kinds::TypedKind;
use crate::render::{Render, RenderParams, render_manifest};

/// Extra merge step for existing typed objects, run after
/// [`TypedKind::merge_spec`].
pub type ModifyTyped<K> = Arc<dyn Fn(&mut K, &K) -> bool + Send + Sync>;

/// Adjusts a freshly decoded object before it is applied.
pub(crate) type Override<K> = Arc<dyn Fn(&mut K) + Send + Sync>;

/// Applier for one compiled-in kind.
pub struct TypedApplier<K: TypedKind, P> {
  entry: Arc<ClientCacheEntry<P>>,
  default_namespace: String,
  modify: Option<ModifyTyped<K>>,
  overrides: Option<Override<K>>,
  _kind: PhantomData<fn() -> K>,
}

impl<K: TypedKind, P: ClientProvider> TypedApplier<K, P> {
  pub fn new(entry: Arc<ClientCacheEntry<P>>, default_namespace: impl Into<String>) -> Self {
    Self {
      entry,
      default_namespace: default_namespace.into(),
      modify: None,
      overrides: None,
      _kind: PhantomData,
    }
  }

  pub fn with_modify(mut self, modify: ModifyTyped<K>) -> Self {
    self.modify = Some(modify);
    self
  }

  pub(crate) fn with_override(mut self, overrides: Override<K>) -> Self {
    self.overrides = Some(overrides);
    self
  }
}

#[async_trait]
impl<K: TypedKind, P: ClientProvider> ResourceHandler for TypedApplier<K, P> {
  type Prepared = K;

  async fn read(&self, raw: &[u8], render: Option<&dyn Render>, params: &RenderParams) -> Result<K, ApplyError> {
    let rendered = render_manifest(raw, render, params)?;
    let mut object = decode_typed::<K>(&rendered)?;
    if let Some(overrides) = &self.overrides {
      overrides(&mut object);
    }
    Ok(object)
  }

  async fn handle(&self, object: K) -> Result<ApplyOutcome, ApplyError> {
    apply_typed_object(&self.entry, &self.default_namespace, object, self.modify.as_ref()).await
  }
}

/// Shared by [`TypedApplier`] and the any-kind dispatch.
pub(crate) async fn apply_typed_object<K: TypedKind, P: ClientProvider>(
  entry: &ClientCacheEntry<P>,
  default_namespace: &str,
  mut object: K,
  modify: Option<&ModifyTyped<K>>,
) -> Result<ApplyOutcome, ApplyError> {
  let namespace = scope_namespace(object.metadata_mut(), K::NAMESPACED, default_namespace);
  let client = entry.provider().typed::<K>(namespace.as_deref().unwrap_or_default());

  create_or_merge(
    client.as_ref(),
    <K as k8s_openapi::Resource>::KIND,
    &object,
    |existing, required| {
      let mut modified = K::merge_spec(existing, required);
      if let Some(modify) = modify {
        modified |= modify(existing, required);
      }
      modified
    },
  )
  .await
}
