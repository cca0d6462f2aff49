//! Decoding rendered manifests into in-memory resources.
//!
//! Kinds registered with the [`DecoderRegistry`] decode into their
//! `k8s-openapi` structs. Every other kind decodes into an untyped
//! [`DynamicObject`] and is handled by the generic applier.
//!
//! Decode failures point at a defect in the manifest itself, so callers
//! never retry them.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::kinds::{KnownResource, TypedKind, register_builtin};

/// Errors that can occur while decoding a rendered manifest.
#[derive(Debug, Error)]
pub enum DecodeError {
  #[error("invalid YAML or JSON: {0}")]
  Syntax(#[from] serde_yaml::Error),

  #[error("manifest contains no document")]
  Empty,

  #[error("manifest contains {0} documents, expected exactly one")]
  MultipleDocuments(usize),

  #[error("manifest is not a mapping")]
  NotAnObject,

  #[error("manifest has no kind")]
  MissingKind,

  #[error("manifest has no apiVersion")]
  MissingApiVersion,

  #[error("invalid apiVersion '{0}'")]
  InvalidApiVersion(String),

  #[error("manifest has no metadata.name")]
  MissingName,

  #[error("expected {expected}, found {found}")]
  KindMismatch { expected: String, found: String },

  #[error("invalid {kind}: {source}")]
  Schema {
    kind: String,
    #[source]
    source: serde_json::Error,
  },
}

/// A rendered manifest decoded into memory.
#[derive(Debug, Clone)]
pub enum DecodedResource {
  Known(KnownResource),
  Unstructured(DynamicObject),
}

impl DecodedResource {
  pub fn kind(&self) -> &str {
    match self {
      DecodedResource::Known(k) => k.kind(),
      DecodedResource::Unstructured(obj) => obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or_default(),
    }
  }

  pub fn name(&self) -> &str {
    match self {
      DecodedResource::Known(k) => k.meta().name.as_deref().unwrap_or_default(),
      DecodedResource::Unstructured(obj) => obj.metadata.name.as_deref().unwrap_or_default(),
    }
  }
}

type DecodeFn = fn(Value) -> Result<KnownResource, serde_json::Error>;

fn decode_known<K: TypedKind>(value: Value) -> Result<KnownResource, serde_json::Error> {
  serde_json::from_value::<K>(value).map(TypedKind::into_known)
}

/// Maps `(apiVersion, kind)` to the typed decoder for that kind.
pub struct DecoderRegistry {
  kinds: RwLock<HashMap<(String, String), DecodeFn>>,
}

impl DecoderRegistry {
  /// An empty registry: everything decodes as unstructured.
  pub fn new() -> Self {
    Self {
      kinds: RwLock::new(HashMap::new()),
    }
  }

  /// A registry with all built-in typed kinds.
  pub fn with_builtin() -> Self {
    let registry = Self::new();
    register_builtin(&registry);
    registry
  }

  /// The process-wide registry, initialised on first use.
  pub fn global() -> &'static DecoderRegistry {
    static REGISTRY: OnceLock<DecoderRegistry> = OnceLock::new();
    REGISTRY.get_or_init(Self::with_builtin)
  }

  /// Register `K`. Registering the same kind again is a no-op.
  pub fn register<K: TypedKind>(&self) {
    let key = (
      <K as k8s_openapi::Resource>::API_VERSION.to_string(),
      <K as k8s_openapi::Resource>::KIND.to_string(),
    );
    let mut kinds = self.kinds.write().unwrap_or_else(|e| e.into_inner());
    kinds.entry(key).or_insert(decode_known::<K> as DecodeFn);
  }

  pub fn is_registered(&self, api_version: &str, kind: &str) -> bool {
    let kinds = self.kinds.read().unwrap_or_else(|e| e.into_inner());
    kinds.contains_key(&(api_version.to_string(), kind.to_string()))
  }

  /// Decode `rendered` as a typed object when its kind is registered, and as
  /// an unstructured object otherwise.
  pub fn decode(&self, rendered: &[u8]) -> Result<DecodedResource, DecodeError> {
    let value = parse_document(rendered)?;
    let header = Header::read(&value)?;

    let decoder = {
      let kinds = self.kinds.read().unwrap_or_else(|e| e.into_inner());
      kinds.get(&(header.api_version.clone(), header.kind.clone())).copied()
    };

    match decoder {
      Some(decode) => decode(value)
        .map(DecodedResource::Known)
        .map_err(|source| DecodeError::Schema {
          kind: header.kind,
          source,
        }),
      None => into_dynamic(value, &header).map(DecodedResource::Unstructured),
    }
  }
}

impl Default for DecoderRegistry {
  fn default() -> Self {
    Self::new()
  }
}

/// Decode `rendered` as `K`, rejecting manifests of any other kind.
pub fn decode_typed<K: TypedKind>(rendered: &[u8]) -> Result<K, DecodeError> {
  let value = parse_document(rendered)?;
  let header = Header::read(&value)?;

  let expected_kind = <K as k8s_openapi::Resource>::KIND;
  let expected_version = <K as k8s_openapi::Resource>::API_VERSION;
  if header.kind != expected_kind || header.api_version != expected_version {
    return Err(DecodeError::KindMismatch {
      expected: format!("{expected_version}/{expected_kind}"),
      found: format!("{}/{}", header.api_version, header.kind),
    });
  }

  serde_json::from_value(value).map_err(|source| DecodeError::Schema {
    kind: header.kind,
    source,
  })
}

/// Decode `rendered` as an untyped attribute tree.
pub fn decode_unstructured(rendered: &[u8]) -> Result<DynamicObject, DecodeError> {
  let value = parse_document(rendered)?;
  let header = Header::read(&value)?;
  into_dynamic(value, &header)
}

/// Group, version and kind of a decoded object.
pub fn group_version_kind(obj: &DynamicObject) -> Result<GroupVersionKind, DecodeError> {
  let types = obj.types.as_ref().ok_or(DecodeError::MissingKind)?;
  let (group, version) = split_api_version(&types.api_version)?;
  Ok(GroupVersionKind::gvk(group, version, &types.kind))
}

/// Split `group/version` (or a bare core `version`) into its parts.
pub fn split_api_version(api_version: &str) -> Result<(&str, &str), DecodeError> {
  let invalid = || DecodeError::InvalidApiVersion(api_version.to_string());
  match api_version.split_once('/') {
    Some((group, version)) if !group.is_empty() && !version.is_empty() && !version.contains('/') => {
      Ok((group, version))
    }
    Some(_) => Err(invalid()),
    None if !api_version.is_empty() => Ok(("", api_version)),
    None => Err(invalid()),
  }
}

fn into_dynamic(value: Value, header: &Header) -> Result<DynamicObject, DecodeError> {
  serde_json::from_value(value).map_err(|source| DecodeError::Schema {
    kind: header.kind.clone(),
    source,
  })
}

/// Parse exactly one YAML or JSON document, ignoring empty ones.
fn parse_document(rendered: &[u8]) -> Result<Value, DecodeError> {
  let mut documents = Vec::new();
  for document in serde_yaml::Deserializer::from_slice(rendered) {
    let value = Value::deserialize(document)?;
    if !value.is_null() {
      documents.push(value);
    }
  }

  match documents.len() {
    0 => Err(DecodeError::Empty),
    1 => Ok(documents.remove(0)),
    n => Err(DecodeError::MultipleDocuments(n)),
  }
}

struct Header {
  api_version: String,
  kind: String,
}

impl Header {
  fn read(value: &Value) -> Result<Self, DecodeError> {
    let object = value.as_object().ok_or(DecodeError::NotAnObject)?;

    let kind = object
      .get("kind")
      .and_then(Value::as_str)
      .filter(|k| !k.is_empty())
      .ok_or(DecodeError::MissingKind)?;
    let api_version = object
      .get("apiVersion")
      .and_then(Value::as_str)
      .filter(|v| !v.is_empty())
      .ok_or(DecodeError::MissingApiVersion)?;
    split_api_version(api_version)?;

    let has_name = object
      .get("metadata")
      .and_then(|m| m.get("name"))
      .and_then(Value::as_str)
      .is_some_and(|n| !n.is_empty());
    if !has_name {
      return Err(DecodeError::MissingName);
    }

    Ok(Self {
      api_version: api_version.to_string(),
      kind: kind.to_string(),
    })
  }
}
