//! The reconciliation driver.
//!
//! A [`Reconciler`] applies batches of manifests in the order given. It
//! holds its [`BatchLock`] for the whole batch, so two batches never
//! interleave, and stops at the first failing manifest. Manifests applied
//! before the failure stay applied. Apply is idempotent per manifest, so
//! re-running a partially applied batch converges.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::apply::{AnyApplier, ApplyError, ApplyOutcome, GenericApplier, ModifyOnExists, ResourceHandler, TypedApplier};
use crate::client::{ClientCache, ClientCacheEntry, ClientFactory, KubeconfigFactory};
use crate::config::ReconcileConfig;
use crate::error::{Error, Operation};
use crate::establish::CrdApplier;
use crate::kinds::TypedKind;
use crate::manifest::{ManifestRef, ManifestSource};
use crate::render::{Render, RenderParams};

/// Non-reentrant critical section spanning one batch.
///
/// Clones share the same lock.
#[derive(Debug, Clone, Default)]
pub struct BatchLock {
  inner: Arc<Mutex<()>>,
}

/// Proof that the batch lock is held. Released on drop.
#[derive(Debug)]
pub struct BatchGuard {
  _guard: OwnedMutexGuard<()>,
}

impl BatchLock {
  pub fn new() -> Self {
    Self::default()
  }

  /// Wait until no other batch is running.
  pub async fn acquire(&self) -> BatchGuard {
    BatchGuard {
      _guard: Arc::clone(&self.inner).lock_owned().await,
    }
  }

  pub fn try_acquire(&self) -> Option<BatchGuard> {
    Arc::clone(&self.inner)
      .try_lock_owned()
      .ok()
      .map(|guard| BatchGuard { _guard: guard })
  }
}

/// Outcome per manifest, in batch order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
  pub applied: Vec<(ManifestRef, ApplyOutcome)>,
}

impl BatchReport {
  pub fn len(&self) -> usize {
    self.applied.len()
  }

  pub fn is_empty(&self) -> bool {
    self.applied.is_empty()
  }

  /// Number of manifests that ended with `outcome`.
  pub fn count(&self, outcome: ApplyOutcome) -> usize {
    self.applied.iter().filter(|(_, o)| *o == outcome).count()
  }
}

/// One batch invocation: what to apply and how.
pub struct Batch<'a> {
  credential: &'a str,
  manifests: &'a [ManifestRef],
  render: Option<&'a dyn Render>,
  params: RenderParams,
  cancel: CancellationToken,
}

impl<'a> Batch<'a> {
  pub fn new(credential: &'a str, manifests: &'a [ManifestRef]) -> Self {
    Self {
      credential,
      manifests,
      render: None,
      params: RenderParams::new(),
      cancel: CancellationToken::new(),
    }
  }

  pub fn with_render(mut self, render: &'a dyn Render) -> Self {
    self.render = Some(render);
    self
  }

  pub fn with_params(mut self, params: RenderParams) -> Self {
    self.params = params;
    self
  }

  pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
    self.cancel = cancel;
    self
  }

  pub fn manifests(&self) -> &[ManifestRef] {
    self.manifests
  }
}

/// Composition root for applying manifests to a cluster.
pub struct Reconciler<F: ClientFactory> {
  source: Arc<dyn ManifestSource>,
  cache: Arc<ClientCache<F>>,
  lock: BatchLock,
  config: ReconcileConfig,
}

impl<F: ClientFactory> Clone for Reconciler<F> {
  fn clone(&self) -> Self {
    Self {
      source: Arc::clone(&self.source),
      cache: Arc::clone(&self.cache),
      lock: self.lock.clone(),
      config: self.config.clone(),
    }
  }
}

impl Reconciler<KubeconfigFactory> {
  /// A reconciler that treats credentials as kubeconfig paths.
  pub fn with_kubeconfig(source: Arc<dyn ManifestSource>, config: ReconcileConfig) -> Self {
    let factory = KubeconfigFactory::new().with_read_timeout(Some(config.request_timeout));
    Self::new(source, Arc::new(ClientCache::new(factory)), config)
  }
}

impl<F: ClientFactory> Reconciler<F> {
  pub fn new(source: Arc<dyn ManifestSource>, cache: Arc<ClientCache<F>>, config: ReconcileConfig) -> Self {
    Self {
      source,
      cache,
      lock: BatchLock::new(),
      config,
    }
  }

  pub fn lock(&self) -> &BatchLock {
    &self.lock
  }

  pub fn config(&self) -> &ReconcileConfig {
    &self.config
  }

  pub fn cache(&self) -> &ClientCache<F> {
    &self.cache
  }

  /// Apply manifests of the compiled-in kind `K`.
  pub async fn apply_typed<K: TypedKind>(&self, batch: &Batch<'_>) -> Result<BatchReport, Error> {
    let guard = self.acquire(batch).await?;
    let entry = self.resolve(batch).await?;
    let handler = TypedApplier::<K, _>::new(entry, &self.config.default_namespace);
    self.run(&guard, batch, &handler).await
  }

  /// Apply manifests of any kind through discovery. `modify` runs on
  /// objects that already exist.
  pub async fn apply_generic(&self, batch: &Batch<'_>, modify: Option<ModifyOnExists>) -> Result<BatchReport, Error> {
    let guard = self.acquire(batch).await?;
    let entry = self.resolve(batch).await?;
    let handler = GenericApplier::new(entry, &self.config.default_namespace).with_modify(modify);
    self.run(&guard, batch, &handler).await
  }

  /// Apply manifests of any kind, using the typed applier for compiled-in
  /// kinds and the generic one for the rest.
  pub async fn apply_any(&self, batch: &Batch<'_>, modify: Option<ModifyOnExists>) -> Result<BatchReport, Error> {
    let guard = self.acquire(batch).await?;
    let entry = self.resolve(batch).await?;
    let handler = AnyApplier::new(entry, &self.config.default_namespace).with_modify(modify);
    self.run(&guard, batch, &handler).await
  }

  /// Apply ConfigMap manifests with `data` replacing whatever the manifest
  /// carries. Existing ConfigMaps get their data reconciled too.
  pub async fn apply_config_map_with_data(
    &self,
    batch: &Batch<'_>,
    data: BTreeMap<String, String>,
  ) -> Result<BatchReport, Error> {
    let guard = self.acquire(batch).await?;
    let entry = self.resolve(batch).await?;
    let handler = TypedApplier::<ConfigMap, _>::new(entry, &self.config.default_namespace)
      .with_override(Arc::new(move |cm: &mut ConfigMap| cm.data = Some(data.clone())))
      .with_modify(Arc::new(|existing: &mut ConfigMap, required: &ConfigMap| {
        if existing.data == required.data {
          return false;
        }
        existing.data = required.data.clone();
        true
      }));
    self.run(&guard, batch, &handler).await
  }

  /// Apply Secret manifests with `data` replacing whatever the manifest
  /// carries. Existing Secrets get their data reconciled too.
  pub async fn apply_secret_with_data(
    &self,
    batch: &Batch<'_>,
    data: BTreeMap<String, Vec<u8>>,
  ) -> Result<BatchReport, Error> {
    let data: BTreeMap<String, ByteString> = data.into_iter().map(|(k, v)| (k, ByteString(v))).collect();

    let guard = self.acquire(batch).await?;
    let entry = self.resolve(batch).await?;
    let handler = TypedApplier::<Secret, _>::new(entry, &self.config.default_namespace)
      .with_override(Arc::new(move |secret: &mut Secret| {
        secret.data = Some(data.clone());
        secret.string_data = None;
      }))
      .with_modify(Arc::new(|existing: &mut Secret, required: &Secret| {
        if existing.data == required.data {
          return false;
        }
        existing.data = required.data.clone();
        true
      }));
    self.run(&guard, batch, &handler).await
  }

  /// Create CustomResourceDefinitions and wait for each to be established
  /// before moving to the next.
  pub async fn apply_crds_and_wait(&self, batch: &Batch<'_>) -> Result<BatchReport, Error> {
    let guard = self.acquire(batch).await?;
    let entry = self.resolve(batch).await?;
    let handler = CrdApplier::new(entry, self.config.establish.clone(), batch.cancel.clone());
    self.run(&guard, batch, &handler).await
  }

  /// Apply `batch` with a caller-supplied handler.
  pub async fn apply_batch<H: ResourceHandler>(&self, batch: &Batch<'_>, handler: &H) -> Result<BatchReport, Error> {
    let guard = self.acquire(batch).await?;
    self.run(&guard, batch, handler).await
  }

  async fn acquire(&self, batch: &Batch<'_>) -> Result<BatchGuard, Error> {
    tokio::select! {
      biased;
      _ = batch.cancel.cancelled() => Err(Error::Cancelled),
      guard = self.lock.acquire() => Ok(guard),
    }
  }

  async fn resolve(&self, batch: &Batch<'_>) -> Result<Arc<ClientCacheEntry<F::Provider>>, Error> {
    self.cache.resolve(batch.credential).await.map_err(|err| {
      warn!(error = %err, "failed to build client");
      Error::Client(err)
    })
  }

  async fn run<H: ResourceHandler>(
    &self,
    _guard: &BatchGuard,
    batch: &Batch<'_>,
    handler: &H,
  ) -> Result<BatchReport, Error> {
    let mut report = BatchReport::default();

    for manifest in batch.manifests {
      match self.apply_one(manifest, batch, handler).await {
        Ok(outcome) => {
          debug!(manifest = %manifest, %outcome, "applied manifest");
          report.applied.push((manifest.clone(), outcome));
        }
        Err(err) => {
          warn!(manifest = %manifest, error = %err, "failed to apply manifest");
          return Err(err);
        }
      }
    }

    info!(
      manifests = report.len(),
      created = report.count(ApplyOutcome::Created),
      updated = report.count(ApplyOutcome::Updated),
      "batch applied"
    );
    Ok(report)
  }

  /// Fetch, read and handle one manifest. Cancellation is checked before
  /// the manifest starts and raced against each async step.
  async fn apply_one<H: ResourceHandler>(
    &self,
    manifest: &ManifestRef,
    batch: &Batch<'_>,
    handler: &H,
  ) -> Result<ApplyOutcome, Error> {
    let cancelled = |op| Error::manifest(manifest, ApplyError::Cancelled { op });
    if batch.cancel.is_cancelled() {
      return Err(cancelled(Operation::Fetch));
    }

    let raw = self
      .source
      .get(manifest)
      .map_err(|err| Error::manifest(manifest, err))?;
    let prepared = tokio::select! {
      biased;
      _ = batch.cancel.cancelled() => return Err(cancelled(Operation::Render)),
      prepared = handler.read(&raw, batch.render, &batch.params) => {
        prepared.map_err(|err| Error::manifest(manifest, err))?
      }
    };
    tokio::select! {
      biased;
      _ = batch.cancel.cancelled() => Err(cancelled(handler.handle_operation())),
      outcome = handler.handle(prepared) => outcome.map_err(|err| Error::manifest(manifest, err)),
    }
  }
}
