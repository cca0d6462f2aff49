//! Access to the remote API.
//!
//! Appliers never talk to `kube` directly. They go through the
//! [`ObjectClient`] and [`ClientProvider`] seams, so the whole apply
//! pipeline runs against an in-memory cluster in tests. Production wiring
//! is [`KubeClients`] plus a [`DeferredDiscoveryMapper`], built once per
//! credential by the [`ClientCache`].

mod cache;
mod mapper;

use std::fmt::Debug;
use std::path::PathBuf;

use async_trait::async_trait;
use kube::api::{DynamicObject, PostParams};
use kube::config::KubeconfigError;
use kube::discovery::ApiResource;
use kube::{Api, Client};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::kinds::TypedKind;

pub use cache::{ClientCache, ClientCacheEntry, ClientFactory, KubeconfigFactory};
pub use mapper::{DeferredDiscoveryMapper, RestMapper, RestMapping};

/// Errors returned by the remote API or while building a client for it.
#[derive(Debug, Error)]
pub enum ClientError {
  /// The API server answered with an error status.
  #[error("{message} ({reason}, HTTP {code})")]
  Api { code: u16, reason: String, message: String },

  /// The kubeconfig could not be read or turned into a client config.
  #[error("invalid kubeconfig {path}: {source}")]
  Kubeconfig {
    path: PathBuf,
    #[source]
    source: KubeconfigError,
  },

  /// Any other failure inside `kube` (TLS, connection, body decoding).
  #[error("kube client error: {0}")]
  Kube(#[source] kube::Error),

  /// Discovery does not know how to address `kind`.
  #[error("no REST mapping for {kind}: {message}")]
  Discovery { kind: String, message: String },

  #[error("failed to convert object: {0}")]
  Serde(#[from] serde_json::Error),

  /// The object has no `metadata.name` to address it by.
  #[error("object has no name")]
  MissingName,

  #[error("transport error: {0}")]
  Transport(String),
}

impl ClientError {
  pub fn is_not_found(&self) -> bool {
    matches!(self, ClientError::Api { code: 404, .. })
  }

  /// Optimistic concurrency failure: the object changed since it was read.
  pub fn is_conflict(&self) -> bool {
    matches!(self, ClientError::Api { code: 409, .. })
  }
}

impl From<kube::Error> for ClientError {
  fn from(err: kube::Error) -> Self {
    match err {
      kube::Error::Api(response) => ClientError::Api {
        code: response.code,
        reason: response.reason,
        message: response.message,
      },
      other => ClientError::Kube(other),
    }
  }
}

/// Get, create and update for objects of one kind in one scope.
#[async_trait]
pub trait ObjectClient<K>: Send + Sync {
  /// Fetch `name`. A missing object is `Ok(None)`, not an error.
  async fn get(&self, name: &str) -> Result<Option<K>, ClientError>;

  async fn create(&self, object: &K) -> Result<K, ClientError>;

  /// Replace the stored object with `object`, which must carry the
  /// `resourceVersion` it was read at.
  async fn update(&self, object: &K) -> Result<K, ClientError>;
}

#[async_trait]
impl<K> ObjectClient<K> for Api<K>
where
  K: kube::Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
  async fn get(&self, name: &str) -> Result<Option<K>, ClientError> {
    Ok(self.get_opt(name).await?)
  }

  async fn create(&self, object: &K) -> Result<K, ClientError> {
    Ok(Api::create(self, &PostParams::default(), object).await?)
  }

  async fn update(&self, object: &K) -> Result<K, ClientError> {
    let name = object.meta().name.as_deref().ok_or(ClientError::MissingName)?;
    Ok(self.replace(name, &PostParams::default(), object).await?)
  }
}

/// Hands out sub-clients for typed kinds and for discovered resources.
pub trait ClientProvider: Send + Sync + 'static {
  /// Typed sub-client for `K`. `namespace` is ignored for cluster-scoped kinds.
  fn typed<K: TypedKind>(&self, namespace: &str) -> Box<dyn ObjectClient<K>>;

  /// Dynamic sub-client for `resource`. `None` addresses the cluster scope.
  fn dynamic(&self, resource: &ApiResource, namespace: Option<&str>) -> Box<dyn ObjectClient<DynamicObject>>;
}

/// [`ClientProvider`] backed by a live `kube::Client`.
#[derive(Clone)]
pub struct KubeClients {
  client: Client,
}

impl KubeClients {
  pub fn new(client: Client) -> Self {
    Self { client }
  }

  pub fn client(&self) -> &Client {
    &self.client
  }
}

impl ClientProvider for KubeClients {
  fn typed<K: TypedKind>(&self, namespace: &str) -> Box<dyn ObjectClient<K>> {
    Box::new(K::api(self.client.clone(), namespace))
  }

  fn dynamic(&self, resource: &ApiResource, namespace: Option<&str>) -> Box<dyn ObjectClient<DynamicObject>> {
    let api: Api<DynamicObject> = match namespace {
      Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
      None => Api::all_with(self.client.clone(), resource),
    };
    Box::new(api)
  }
}
