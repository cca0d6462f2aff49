//! Appliers: the create-or-merge protocol and its handlers.
//!
//! Every applier follows the same two steps. [`ResourceHandler::read`]
//! renders and decodes a manifest into a prepared object, and
//! [`ResourceHandler::handle`] makes the cluster match it through
//! [`create_or_merge`]. Existing objects only ever have their metadata
//! merged (see [`merge`]) unless a modify hook asks for more.

mod any;
mod generic;
pub mod merge;
mod typed;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::client::{ClientError, ObjectClient};
use crate::decode::DecodeError;
use crate::error::Operation;
use crate::establish::EstablishError;
use crate::render::{Render, RenderError, RenderParams};

pub use any::{AnyApplier, Prepared};
pub use generic::{GenericApplier, ModifyOnExists, ResolvedObject};
pub use typed::{ModifyTyped, TypedApplier};

/// What applying one manifest did to the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyOutcome {
  Created,
  Updated,
  Unchanged,
}

impl fmt::Display for ApplyOutcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      ApplyOutcome::Created => "created",
      ApplyOutcome::Updated => "updated",
      ApplyOutcome::Unchanged => "unchanged",
    })
  }
}

/// Errors produced while applying a single manifest.
#[derive(Debug, Error)]
pub enum ApplyError {
  #[error(transparent)]
  Render(#[from] RenderError),

  #[error(transparent)]
  Decode(#[from] DecodeError),

  #[error("{op} failed: {source}")]
  Client {
    op: Operation,
    #[source]
    source: ClientError,
  },

  #[error(transparent)]
  Establish(#[from] EstablishError),

  #[error("cancelled during {op}")]
  Cancelled { op: Operation },
}

impl ApplyError {
  pub(crate) fn client(op: Operation) -> impl FnOnce(ClientError) -> ApplyError {
    move |source| ApplyError::Client { op, source }
  }

  pub fn operation(&self) -> Operation {
    match self {
      ApplyError::Render(_) => Operation::Render,
      ApplyError::Decode(_) => Operation::Decode,
      ApplyError::Client { op, .. } => *op,
      ApplyError::Establish(_) => Operation::Establish,
      ApplyError::Cancelled { op } => *op,
    }
  }
}

/// One applier: turns manifest bytes into an object and the object into
/// cluster state.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
  /// The decoded object, plus whatever was resolved for it.
  type Prepared: Send;

  async fn read(
    &self,
    raw: &[u8],
    render: Option<&dyn Render>,
    params: &RenderParams,
  ) -> Result<Self::Prepared, ApplyError>;

  async fn handle(&self, prepared: Self::Prepared) -> Result<ApplyOutcome, ApplyError>;

  /// Step reported when [`handle`](Self::handle) is interrupted.
  fn handle_operation(&self) -> Operation {
    Operation::Apply
  }
}

/// Make the cluster hold `required`.
///
/// A missing object is created. An existing object is passed through
/// `modify` and the metadata merge policy, and is written back only when
/// either reported a change. The write sends the mutated existing object so
/// server-populated fields survive. Errors are returned as-is.
pub async fn create_or_merge<K, F>(
  client: &dyn ObjectClient<K>,
  kind: &str,
  required: &K,
  modify: F,
) -> Result<ApplyOutcome, ApplyError>
where
  K: kube::Resource + Send + Sync,
  F: FnOnce(&mut K, &K) -> bool,
{
  let meta = required.meta();
  let name = meta.name.as_deref().ok_or(ApplyError::Client {
    op: Operation::Get,
    source: ClientError::MissingName,
  })?;
  let namespace = meta.namespace.as_deref().unwrap_or_default();

  let Some(mut existing) = client.get(name).await.map_err(ApplyError::client(Operation::Get))? else {
    client
      .create(required)
      .await
      .map_err(ApplyError::client(Operation::Create))?;
    info!(kind, name, namespace, "created resource");
    return Ok(ApplyOutcome::Created);
  };

  let mut modified = modify(&mut existing, required);
  modified |= merge::ensure_object_meta(existing.meta_mut(), required.meta());
  if !modified {
    debug!(kind, name, namespace, "resource unchanged");
    return Ok(ApplyOutcome::Unchanged);
  }

  client
    .update(&existing)
    .await
    .map_err(ApplyError::client(Operation::Update))?;
  info!(kind, name, namespace, "updated resource");
  Ok(ApplyOutcome::Updated)
}

/// Namespace to address an object in: its own, the default for namespaced
/// kinds without one, or none for cluster-scoped kinds.
pub(crate) fn scope_namespace(
  meta: &mut k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
  namespaced: bool,
  default_namespace: &str,
) -> Option<String> {
  if !namespaced {
    meta.namespace = None;
    return None;
  }
  match meta.namespace.as_deref() {
    Some(ns) if !ns.is_empty() => Some(ns.to_string()),
    _ => {
      meta.namespace = Some(default_namespace.to_string());
      Some(default_namespace.to_string())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::client::ClientProvider;
  use crate::util::testutil::FakeCluster;
  use k8s_openapi::api::core::v1::ConfigMap;
  use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
  use std::collections::BTreeMap;

  fn config_map(labels: &[(&str, &str)]) -> ConfigMap {
    ConfigMap {
      metadata: ObjectMeta {
        name: Some("dns-default".into()),
        namespace: Some("openshift-dns".into()),
        labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
        ..Default::default()
      },
      data: Some(BTreeMap::from([("Corefile".to_string(), ".:5353 {}".to_string())])),
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn second_apply_is_a_no_op() {
    let cluster = FakeCluster::new();
    let client = cluster.typed::<ConfigMap>("openshift-dns");
    let required = config_map(&[("app", "dns")]);

    let first = create_or_merge(client.as_ref(), "ConfigMap", &required, |_, _| false).await.unwrap();
    let second = create_or_merge(client.as_ref(), "ConfigMap", &required, |_, _| false).await.unwrap();

    assert_eq!(first, ApplyOutcome::Created);
    assert_eq!(second, ApplyOutcome::Unchanged);
    assert_eq!(cluster.creates(), 1);
    assert_eq!(cluster.updates(), 0);
  }

  #[tokio::test]
  async fn label_drift_updates_the_existing_object() {
    let cluster = FakeCluster::new();
    let client = cluster.typed::<ConfigMap>("openshift-dns");
    create_or_merge(client.as_ref(), "ConfigMap", &config_map(&[("a", "1")]), |_, _| false)
      .await
      .unwrap();

    let outcome = create_or_merge(client.as_ref(), "ConfigMap", &config_map(&[("b", "2")]), |_, _| false)
      .await
      .unwrap();
    assert_eq!(outcome, ApplyOutcome::Updated);

    let stored = client.get("dns-default").await.unwrap().unwrap();
    let labels = stored.metadata.labels.unwrap();
    assert_eq!(labels["a"], "1");
    assert_eq!(labels["b"], "2");
    assert_eq!(stored.metadata.resource_version.as_deref(), Some("2"));
  }

  #[tokio::test]
  async fn spec_drift_is_left_alone_without_a_hook() {
    let cluster = FakeCluster::new();
    let client = cluster.typed::<ConfigMap>("openshift-dns");
    let required = config_map(&[]);
    create_or_merge(client.as_ref(), "ConfigMap", &required, |_, _| false).await.unwrap();

    let mut changed = required.clone();
    changed.data = Some(BTreeMap::from([("Corefile".to_string(), "changed".to_string())]));
    let outcome = create_or_merge(client.as_ref(), "ConfigMap", &changed, |_, _| false).await.unwrap();

    assert_eq!(outcome, ApplyOutcome::Unchanged);
    let stored = client.get("dns-default").await.unwrap().unwrap();
    assert_eq!(stored.data.unwrap()["Corefile"], ".:5353 {}");
  }

  #[tokio::test]
  async fn modify_hook_forces_an_update() {
    let cluster = FakeCluster::new();
    let client = cluster.typed::<ConfigMap>("openshift-dns");
    let required = config_map(&[]);
    create_or_merge(client.as_ref(), "ConfigMap", &required, |_, _| false).await.unwrap();

    let outcome = create_or_merge(client.as_ref(), "ConfigMap", &required, |existing: &mut ConfigMap, _| {
      existing.data = None;
      true
    })
    .await
    .unwrap();
    assert_eq!(outcome, ApplyOutcome::Updated);
    assert_eq!(cluster.updates(), 1);
  }

  #[tokio::test]
  async fn create_errors_carry_the_operation() {
    let cluster = FakeCluster::new();
    cluster.fail_create("ConfigMap", "dns-default", 403);
    let client = cluster.typed::<ConfigMap>("openshift-dns");

    let err = create_or_merge(client.as_ref(), "ConfigMap", &config_map(&[]), |_, _| false)
      .await
      .unwrap_err();
    assert_eq!(err.operation(), Operation::Create);
    assert!(matches!(err, ApplyError::Client { source: ClientError::Api { code: 403, .. }, .. }));
  }

  #[test]
  fn scope_namespace_defaults_and_clears() {
    let mut meta = ObjectMeta::default();
    assert_eq!(scope_namespace(&mut meta, true, "default").as_deref(), Some("default"));
    assert_eq!(meta.namespace.as_deref(), Some("default"));

    let mut meta = ObjectMeta {
      namespace: Some("stray".into()),
      ..Default::default()
    };
    assert_eq!(scope_namespace(&mut meta, false, "default"), None);
    assert_eq!(meta.namespace, None);
  }
}
