//! Test utilities for kapply-lib.
//!
//! An in-memory cluster that speaks the [`ObjectClient`] and
//! [`ClientProvider`] seams, a static [`RestMapper`] and a counting
//! [`ClientFactory`], so the apply pipeline runs without an API server.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::client::{ClientCacheEntry, ClientError, ClientFactory, ClientProvider, ObjectClient, RestMapper, RestMapping};
use crate::kinds::TypedKind;

type Key = (String, Option<String>, String);
type GetHook = Box<dyn FnMut(&mut Value) + Send>;

#[derive(Default)]
struct ClusterState {
  objects: HashMap<Key, Value>,
  created: Vec<String>,
  creates: usize,
  create_attempts: usize,
  updates: usize,
  gets: usize,
  create_failures: HashMap<(String, String), u16>,
  get_hooks: HashMap<(String, String), GetHook>,
}

/// Shared in-memory object store. Clones see the same objects.
#[derive(Clone, Default)]
pub struct FakeCluster {
  state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> MutexGuard<'_, ClusterState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// The stored object, as the API server would return it.
  pub fn object(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<Value> {
    let key = (kind.to_string(), namespace.map(str::to_string), name.to_string());
    self.state().objects.get(&key).cloned()
  }

  /// Successful creates.
  pub fn creates(&self) -> usize {
    self.state().creates
  }

  /// Names of created objects, in creation order.
  pub fn created_names(&self) -> Vec<String> {
    self.state().created.clone()
  }

  /// Every create call, including failed ones.
  pub fn create_attempts(&self) -> usize {
    self.state().create_attempts
  }

  pub fn updates(&self) -> usize {
    self.state().updates
  }

  pub fn gets(&self) -> usize {
    self.state().gets
  }

  /// Make every create of `kind`/`name` fail with HTTP `code`.
  pub fn fail_create(&self, kind: &str, name: &str, code: u16) {
    self
      .state()
      .create_failures
      .insert((kind.to_string(), name.to_string()), code);
  }

  /// Run `hook` on the stored `kind`/`name` object before each get returns
  /// it. Gets of missing objects do not run the hook.
  pub fn on_get(&self, kind: &str, name: &str, hook: impl FnMut(&mut Value) + Send + 'static) {
    self
      .state()
      .get_hooks
      .insert((kind.to_string(), name.to_string()), Box::new(hook));
  }

  fn objects<K>(&self, kind: &str, namespace: Option<&str>) -> FakeObjects<K> {
    FakeObjects {
      cluster: self.clone(),
      kind: kind.to_string(),
      namespace: namespace.map(str::to_string),
      _kind: PhantomData,
    }
  }
}

impl ClientProvider for FakeCluster {
  fn typed<K: TypedKind>(&self, namespace: &str) -> Box<dyn ObjectClient<K>> {
    let namespace = K::NAMESPACED.then_some(namespace);
    Box::new(self.objects::<K>(<K as k8s_openapi::Resource>::KIND, namespace))
  }

  fn dynamic(&self, resource: &ApiResource, namespace: Option<&str>) -> Box<dyn ObjectClient<DynamicObject>> {
    Box::new(self.objects::<DynamicObject>(&resource.kind, namespace))
  }
}

fn api_error(code: u16, reason: &str, message: String) -> ClientError {
  ClientError::Api {
    code,
    reason: reason.to_string(),
    message,
  }
}

fn object_name(value: &Value) -> Result<String, ClientError> {
  value["metadata"]["name"]
    .as_str()
    .map(str::to_string)
    .ok_or(ClientError::MissingName)
}

fn resource_version(value: &Value) -> Option<u64> {
  value["metadata"]["resourceVersion"].as_str()?.parse().ok()
}

/// One kind in one scope of a [`FakeCluster`].
struct FakeObjects<K> {
  cluster: FakeCluster,
  kind: String,
  namespace: Option<String>,
  _kind: PhantomData<fn() -> K>,
}

impl<K> FakeObjects<K> {
  fn key(&self, name: &str) -> Key {
    (self.kind.clone(), self.namespace.clone(), name.to_string())
  }
}

#[async_trait]
impl<K> ObjectClient<K> for FakeObjects<K>
where
  K: Serialize + DeserializeOwned + Send + Sync,
{
  async fn get(&self, name: &str) -> Result<Option<K>, ClientError> {
    let mut state = self.cluster.state();
    state.gets += 1;

    let key = self.key(name);
    let hook_key = (self.kind.clone(), name.to_string());
    let ClusterState { objects, get_hooks, .. } = &mut *state;
    let Some(stored) = objects.get_mut(&key) else {
      return Ok(None);
    };
    if let Some(hook) = get_hooks.get_mut(&hook_key) {
      hook(stored);
    }
    Ok(Some(serde_json::from_value(stored.clone())?))
  }

  async fn create(&self, object: &K) -> Result<K, ClientError> {
    let mut value = serde_json::to_value(object)?;
    let name = object_name(&value)?;

    let mut state = self.cluster.state();
    state.create_attempts += 1;

    if let Some(code) = state.create_failures.get(&(self.kind.clone(), name.clone())) {
      return Err(api_error(*code, "InternalError", format!("injected failure creating {name}")));
    }
    let key = self.key(&name);
    if state.objects.contains_key(&key) {
      return Err(api_error(409, "AlreadyExists", format!("{} \"{name}\" already exists", self.kind)));
    }

    if let Some(namespace) = &self.namespace {
      value["metadata"]["namespace"] = json!(namespace);
    }
    value["metadata"]["resourceVersion"] = json!("1");
    state.objects.insert(key, value.clone());
    state.creates += 1;
    state.created.push(name);
    Ok(serde_json::from_value(value)?)
  }

  async fn update(&self, object: &K) -> Result<K, ClientError> {
    let mut value = serde_json::to_value(object)?;
    let name = object_name(&value)?;

    let mut state = self.cluster.state();
    let key = self.key(&name);
    let Some(stored) = state.objects.get(&key) else {
      return Err(api_error(404, "NotFound", format!("{} \"{name}\" not found", self.kind)));
    };
    let current = resource_version(stored).unwrap_or(0);
    if resource_version(&value) != Some(current) {
      return Err(api_error(409, "Conflict", format!("{} \"{name}\" has been modified", self.kind)));
    }

    value["metadata"]["resourceVersion"] = json!((current + 1).to_string());
    state.objects.insert(key, value.clone());
    state.updates += 1;
    Ok(serde_json::from_value(value)?)
  }
}

/// Mark a stored CustomResourceDefinition's `Established` condition.
pub fn set_established(object: &mut Value, status: &str) {
  let kind = object["spec"]["names"]["kind"].clone();
  let plural = object["spec"]["names"]["plural"].clone();
  object["status"] = json!({
    "conditions": [{ "type": "Established", "status": status }],
    "acceptedNames": { "kind": kind, "plural": plural },
    "storedVersions": ["v1"],
  });
}

/// Cache entry over `cluster` with a mapper that knows no kinds.
pub fn fake_entry(cluster: &FakeCluster) -> Arc<ClientCacheEntry<FakeCluster>> {
  fake_entry_with(cluster, StaticMapper::new())
}

pub fn fake_entry_with(cluster: &FakeCluster, mapper: StaticMapper) -> Arc<ClientCacheEntry<FakeCluster>> {
  Arc::new(ClientCacheEntry::new(cluster.clone(), Arc::new(mapper)))
}

/// A [`RestMapper`] over a fixed table. Clones share the table and counter.
#[derive(Clone, Default)]
pub struct StaticMapper {
  mappings: Arc<HashMap<GroupVersionKind, RestMapping>>,
  lookups: Arc<AtomicUsize>,
}

impl StaticMapper {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
    let gvk = GroupVersionKind::gvk(group, version, kind);
    let mapping = RestMapping {
      resource: ApiResource::from_gvk_with_plural(&gvk, plural),
      namespaced,
    };
    Arc::make_mut(&mut self.mappings).insert(gvk, mapping);
    self
  }

  pub fn lookups(&self) -> usize {
    self.lookups.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl RestMapper for StaticMapper {
  async fn mapping(&self, gvk: &GroupVersionKind) -> Result<RestMapping, ClientError> {
    self.lookups.fetch_add(1, Ordering::SeqCst);
    self.mappings.get(gvk).cloned().ok_or_else(|| ClientError::Discovery {
      kind: format!("{}/{} {}", gvk.group, gvk.version, gvk.kind),
      message: "not served".to_string(),
    })
  }
}

/// [`ClientFactory`] handing out entries over one shared [`FakeCluster`].
#[derive(Clone, Default)]
pub struct FakeFactory {
  cluster: FakeCluster,
  mapper: StaticMapper,
  builds: Arc<AtomicUsize>,
  failing: bool,
}

impl FakeFactory {
  pub fn new() -> Self {
    Self::default()
  }

  /// Every build fails with a transport error.
  pub fn failing(mut self) -> Self {
    self.failing = true;
    self
  }

  pub fn with_mapper(mut self, mapper: StaticMapper) -> Self {
    self.mapper = mapper;
    self
  }

  pub fn cluster(&self) -> &FakeCluster {
    &self.cluster
  }

  pub fn builds(&self) -> usize {
    self.builds.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl ClientFactory for FakeFactory {
  type Provider = FakeCluster;

  async fn build(&self, credential: &str) -> Result<ClientCacheEntry<FakeCluster>, ClientError> {
    self.builds.fetch_add(1, Ordering::SeqCst);
    // Widen the window for concurrent resolves.
    for _ in 0..4 {
      tokio::task::yield_now().await;
    }
    if self.failing {
      return Err(ClientError::Transport(format!("cannot reach cluster for {credential}")));
    }
    Ok(ClientCacheEntry::new(self.cluster.clone(), Arc::new(self.mapper.clone())))
  }
}
