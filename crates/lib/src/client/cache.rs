//! Per-credential client cache.
//!
//! Building a client and its discovery-backed mapper is the most expensive
//! step of an apply pass, so it happens once per credential. Entries live as
//! long as the cache and are never evicted. Each credential has its own
//! slot, so a slow build only holds up callers of the same credential.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

use super::{ClientError, ClientProvider, DeferredDiscoveryMapper, KubeClients, RestMapper};

/// A provider and the mapper paired with it, shared by every apply that
/// uses the same credential.
pub struct ClientCacheEntry<P> {
  provider: P,
  mapper: Arc<dyn RestMapper>,
}

impl<P: ClientProvider> ClientCacheEntry<P> {
  pub fn new(provider: P, mapper: Arc<dyn RestMapper>) -> Self {
    Self { provider, mapper }
  }

  pub fn provider(&self) -> &P {
    &self.provider
  }

  pub fn mapper(&self) -> &dyn RestMapper {
    self.mapper.as_ref()
  }
}

/// Builds cache entries from an opaque credential.
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
  type Provider: ClientProvider;

  async fn build(&self, credential: &str) -> Result<ClientCacheEntry<Self::Provider>, ClientError>;
}

/// Treats the credential as a kubeconfig path and uses its current context.
#[derive(Debug, Clone, Default)]
pub struct KubeconfigFactory {
  read_timeout: Option<Duration>,
}

impl KubeconfigFactory {
  pub fn new() -> Self {
    Self::default()
  }

  /// Bound each API response read by `timeout`.
  pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.read_timeout = timeout;
    self
  }
}

#[async_trait]
impl ClientFactory for KubeconfigFactory {
  type Provider = KubeClients;

  async fn build(&self, credential: &str) -> Result<ClientCacheEntry<KubeClients>, ClientError> {
    let path = PathBuf::from(credential);
    let kubeconfig = Kubeconfig::read_from(&path).map_err(|source| ClientError::Kubeconfig {
      path: path.clone(),
      source,
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
      .await
      .map_err(|source| ClientError::Kubeconfig { path, source })?;
    if self.read_timeout.is_some() {
      config.read_timeout = self.read_timeout;
    }
    info!(cluster = %config.cluster_url, "connecting to cluster");

    let client = Client::try_from(config)?;
    let mapper = Arc::new(DeferredDiscoveryMapper::new(client.clone()));
    Ok(ClientCacheEntry::new(KubeClients::new(client), mapper))
  }
}

type Slot<P> = Arc<OnceCell<Arc<ClientCacheEntry<P>>>>;

/// Credential-keyed cache of [`ClientCacheEntry`] values.
///
/// The map lock is only held to find or insert a credential's slot. The
/// build itself runs inside the slot's `OnceCell`, so each credential is
/// built at most once and cached entries never wait on another build.
pub struct ClientCache<F: ClientFactory> {
  factory: F,
  slots: RwLock<HashMap<String, Slot<F::Provider>>>,
}

impl<F: ClientFactory> ClientCache<F> {
  pub fn new(factory: F) -> Self {
    Self {
      factory,
      slots: RwLock::new(HashMap::new()),
    }
  }

  pub fn factory(&self) -> &F {
    &self.factory
  }

  /// Return the entry for `credential`, building it on first use.
  ///
  /// Concurrent callers for the same credential share one build. A failed
  /// build leaves the slot empty so the next caller tries again.
  pub async fn resolve(&self, credential: &str) -> Result<Arc<ClientCacheEntry<F::Provider>>, ClientError> {
    let slot = self.slot(credential).await;
    if let Some(entry) = slot.get() {
      debug!(credential, "client cache hit");
      return Ok(Arc::clone(entry));
    }

    let entry = slot
      .get_or_try_init(|| async {
        debug!(credential, "building client");
        self.factory.build(credential).await.map(Arc::new)
      })
      .await?;
    Ok(Arc::clone(entry))
  }

  async fn slot(&self, credential: &str) -> Slot<F::Provider> {
    if let Some(slot) = self.slots.read().await.get(credential) {
      return Arc::clone(slot);
    }
    let mut slots = self.slots.write().await;
    Arc::clone(slots.entry(credential.to_string()).or_default())
  }

  /// Number of credentials with a built entry.
  pub async fn len(&self) -> usize {
    self.slots.read().await.values().filter(|slot| slot.initialized()).count()
  }

  pub async fn is_empty(&self) -> bool {
    self.len().await == 0
  }
}
