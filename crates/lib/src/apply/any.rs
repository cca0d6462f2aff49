//! Dispatch on the decoded kind: compiled-in kinds go to their typed
//! applier, everything else to the generic one.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use super::generic::{apply_resolved, resolve};
use super::typed::apply_typed_object;
use super::{ApplyError, ApplyOutcome, ModifyOnExists, ResolvedObject, ResourceHandler};
use crate::client::{ClientCacheEntry, ClientProvider};
use crate::decode::{DecodedResource, DecoderRegistry};
use crate::kinds::{KindVisitor, KnownResource, TypedKind};
use crate::render::{Render, RenderParams, render_manifest};

/// A manifest decoded by [`AnyApplier`].
#[derive(Debug, Clone)]
pub enum Prepared {
  Typed(KnownResource),
  Generic(ResolvedObject),
}

/// Applier for manifests of any kind.
pub struct AnyApplier<P> {
  entry: Arc<ClientCacheEntry<P>>,
  registry: &'static DecoderRegistry,
  default_namespace: String,
  modify: Option<ModifyOnExists>,
}

impl<P: ClientProvider> AnyApplier<P> {
  pub fn new(entry: Arc<ClientCacheEntry<P>>, default_namespace: impl Into<String>) -> Self {
    Self {
      entry,
      registry: DecoderRegistry::global(),
      default_namespace: default_namespace.into(),
      modify: None,
    }
  }

  /// Use `registry` instead of the process-wide one.
  pub fn with_registry(mut self, registry: &'static DecoderRegistry) -> Self {
    self.registry = registry;
    self
  }

  /// Modify policy for objects that take the generic path.
  pub fn with_modify(mut self, modify: Option<ModifyOnExists>) -> Self {
    self.modify = modify;
    self
  }
}

#[async_trait]
impl<P: ClientProvider> ResourceHandler for AnyApplier<P> {
  type Prepared = Prepared;

  async fn read(&self, raw: &[u8], render: Option<&dyn Render>, params: &RenderParams) -> Result<Prepared, ApplyError> {
    let rendered = render_manifest(raw, render, params)?;
    match self.registry.decode(&rendered)? {
      DecodedResource::Known(known) => Ok(Prepared::Typed(known)),
      DecodedResource::Unstructured(object) => Ok(Prepared::Generic(resolve(&self.entry, object).await?)),
    }
  }

  async fn handle(&self, prepared: Prepared) -> Result<ApplyOutcome, ApplyError> {
    match prepared {
      Prepared::Typed(known) => {
        known
          .visit(ApplyKnown {
            entry: &self.entry,
            default_namespace: &self.default_namespace,
          })
          .await
      }
      Prepared::Generic(resolved) => {
        apply_resolved(&self.entry, &self.default_namespace, resolved, self.modify.as_ref()).await
      }
    }
  }
}

type ApplyFuture<'a> = Pin<Box<dyn Future<Output = Result<ApplyOutcome, ApplyError>> + Send + 'a>>;

struct ApplyKnown<'a, P> {
  entry: &'a ClientCacheEntry<P>,
  default_namespace: &'a str,
}

impl<'a, P: ClientProvider> KindVisitor for ApplyKnown<'a, P> {
  type Output = ApplyFuture<'a>;

  fn visit<K: TypedKind>(self, object: K) -> ApplyFuture<'a> {
    Box::pin(apply_typed_object(self.entry, self.default_namespace, object, None))
  }
}
