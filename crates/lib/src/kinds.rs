//! Typed kind descriptors.
//!
//! Every resource kind with a compiled-in schema gets one [`TypedKind`]
//! implementation. The descriptor names the sub-client used to reach the
//! kind on the API server and an optional spec-merge hook; the shared
//! create-or-merge algorithm in [`crate::apply`] does the rest.

use std::fmt::Debug;

use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::api::scheduling::v1::PriorityClass;
use k8s_openapi::api::storage::v1::{CSIDriver, StorageClass};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Api, Client};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A resource kind with a compiled-in schema.
pub trait TypedKind:
  k8s_openapi::Resource
  + k8s_openapi::Metadata<Ty = ObjectMeta>
  + kube::Resource<DynamicType = ()>
  + Clone
  + Debug
  + Serialize
  + DeserializeOwned
  + Send
  + Sync
  + 'static
{
  /// Whether objects of this kind live inside a namespace.
  const NAMESPACED: bool;

  /// Typed sub-client for this kind. `namespace` is ignored for
  /// cluster-scoped kinds.
  fn api(client: Client, namespace: &str) -> Api<Self>;

  /// Merge spec-level fields of `required` into `existing`, returning
  /// whether anything changed.
  ///
  /// Most typed kinds only reconcile metadata after creation; spec drift is
  /// left to whoever administers the cluster.
  fn merge_spec(_existing: &mut Self, _required: &Self) -> bool {
    false
  }

  fn into_known(self) -> KnownResource;
}

/// Receives a [`KnownResource`] as its concrete type.
pub trait KindVisitor {
  type Output;

  fn visit<K: TypedKind>(self, object: K) -> Self::Output;
}

macro_rules! typed_kinds {
  (@namespaced namespaced) => { true };
  (@namespaced cluster) => { false };
  (@api namespaced, $client:ident, $namespace:ident) => { Api::namespaced($client, $namespace) };
  (@api cluster, $client:ident, $namespace:ident) => {{
    let _ = $namespace;
    Api::all($client)
  }};
  ($($variant:ident($ty:ty) => $scope:ident $({ merge: $merge:ident })?),* $(,)?) => {
    /// A decoded object of one of the registered typed kinds.
    #[derive(Debug, Clone)]
    pub enum KnownResource {
      $($variant(Box<$ty>),)*
    }

    impl KnownResource {
      pub fn kind(&self) -> &'static str {
        match self {
          $(KnownResource::$variant(_) => <$ty as k8s_openapi::Resource>::KIND,)*
        }
      }

      pub fn api_version(&self) -> &'static str {
        match self {
          $(KnownResource::$variant(_) => <$ty as k8s_openapi::Resource>::API_VERSION,)*
        }
      }

      pub fn meta(&self) -> &ObjectMeta {
        match self {
          $(KnownResource::$variant(obj) => k8s_openapi::Metadata::metadata(obj.as_ref()),)*
        }
      }

      /// Hand the object to `visitor` as its concrete type.
      pub fn visit<V: KindVisitor>(self, visitor: V) -> V::Output {
        match self {
          $(KnownResource::$variant(obj) => visitor.visit(*obj),)*
        }
      }
    }

    $(
      impl TypedKind for $ty {
        const NAMESPACED: bool = typed_kinds!(@namespaced $scope);

        fn api(client: Client, namespace: &str) -> Api<Self> {
          typed_kinds!(@api $scope, client, namespace)
        }

        $(
          fn merge_spec(existing: &mut Self, required: &Self) -> bool {
            $merge(existing, required)
          }
        )?

        fn into_known(self) -> KnownResource {
          KnownResource::$variant(Box::new(self))
        }
      }
    )*

    /// Register every built-in typed kind with `registry`.
    pub(crate) fn register_builtin(registry: &crate::decode::DecoderRegistry) {
      $(registry.register::<$ty>();)*
    }
  };
}

typed_kinds! {
  Namespace(Namespace) => cluster,
  Secret(Secret) => namespaced,
  ConfigMap(ConfigMap) => namespaced,
  Service(Service) => namespaced,
  ServiceAccount(ServiceAccount) => namespaced,
  Deployment(Deployment) => namespaced,
  DaemonSet(DaemonSet) => namespaced,
  StorageClass(StorageClass) => cluster,
  CSIDriver(CSIDriver) => cluster,
  ClusterRole(ClusterRole) => cluster,
  ClusterRoleBinding(ClusterRoleBinding) => cluster,
  Role(Role) => namespaced,
  RoleBinding(RoleBinding) => namespaced,
  PriorityClass(PriorityClass) => cluster,
  ValidatingWebhookConfiguration(ValidatingWebhookConfiguration) => cluster { merge: merge_webhooks },
  CustomResourceDefinition(CustomResourceDefinition) => cluster,
}

/// Make `existing.webhooks` match `required`.
///
/// A required webhook with an empty `clientConfig.caBundle` keeps the bundle
/// the cluster injected into the webhook of the same name.
fn merge_webhooks(existing: &mut ValidatingWebhookConfiguration, required: &ValidatingWebhookConfiguration) -> bool {
  let mut webhooks = required.webhooks.clone();
  if let (Some(wanted), Some(current)) = (webhooks.as_mut(), existing.webhooks.as_ref()) {
    for webhook in wanted {
      if webhook.client_config.ca_bundle.as_ref().is_some_and(|b| !b.0.is_empty()) {
        continue;
      }
      let injected = current
        .iter()
        .find(|w| w.name == webhook.name)
        .and_then(|w| w.client_config.ca_bundle.clone());
      if injected.is_some() {
        webhook.client_config.ca_bundle = injected;
      }
    }
  }

  if existing.webhooks == webhooks {
    return false;
  }
  existing.webhooks = webhooks;
  true
}
