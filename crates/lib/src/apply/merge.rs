//! Metadata merge policy for objects that already exist.
//!
//! Every function merges `required` into `existing` in place and returns
//! whether `existing` changed. Fields absent from `required` are left alone,
//! so values set by other actors survive.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

/// Suffix on a required label, annotation key or owner UID asking for
/// removal instead of insertion.
const REMOVE_SUFFIX: char = '-';

/// Overwrite `existing` with `required` when `required` is non-empty.
pub fn set_string_if_set(existing: &mut Option<String>, required: Option<&str>) -> bool {
  match required {
    Some(value) if !value.is_empty() && existing.as_deref() != Some(value) => {
      *existing = Some(value.to_string());
      true
    }
    _ => false,
  }
}

/// Union of both maps where `required` wins on conflicting keys.
///
/// A required key ending in `-` removes the key without the dash.
pub fn merge_map(existing: &mut Option<BTreeMap<String, String>>, required: Option<&BTreeMap<String, String>>) -> bool {
  let Some(required) = required else {
    return false;
  };

  let mut modified = false;
  for (key, value) in required {
    if let Some(actual) = key.strip_suffix(REMOVE_SUFFIX) {
      let removed = existing
        .as_mut()
        .is_some_and(|map| map.remove(actual.trim_end_matches(REMOVE_SUFFIX)).is_some());
      modified |= removed;
      continue;
    }

    let map = existing.get_or_insert_with(BTreeMap::new);
    if map.get(key) != Some(value) {
      map.insert(key.clone(), value.clone());
      modified = true;
    }
  }
  modified
}

/// Union of owner references keyed by API group, kind and name.
///
/// A required reference whose UID ends in `-` removes the matching
/// reference. A matching reference that differs in any field is replaced.
pub fn merge_owner_refs(existing: &mut Option<Vec<OwnerReference>>, required: Option<&[OwnerReference]>) -> bool {
  let Some(required) = required else {
    return false;
  };

  let was_none = existing.is_none();
  let mut modified = false;
  for owner in required {
    let remove = owner.uid.ends_with(REMOVE_SUFFIX);
    let refs = existing.get_or_insert_with(Vec::new);
    match refs.iter().position(|r| same_owner(r, owner)) {
      None if remove => {}
      None => {
        refs.push(owner.clone());
        modified = true;
      }
      Some(index) if remove => {
        refs.remove(index);
        modified = true;
      }
      Some(index) if refs[index] != *owner => {
        refs[index] = owner.clone();
        modified = true;
      }
      Some(_) => {}
    }
  }

  if was_none && existing.as_ref().is_some_and(Vec::is_empty) {
    *existing = None;
  }
  modified
}

/// Merge the policy-relevant metadata of `required` into `existing`.
///
/// Covers namespace, name, labels, annotations and owner references.
/// Everything else, including server-populated fields such as
/// `resourceVersion`, is kept from `existing`.
pub fn ensure_object_meta(existing: &mut ObjectMeta, required: &ObjectMeta) -> bool {
  let mut modified = false;
  modified |= set_string_if_set(&mut existing.namespace, required.namespace.as_deref());
  modified |= set_string_if_set(&mut existing.name, required.name.as_deref());
  modified |= merge_map(&mut existing.labels, required.labels.as_ref());
  modified |= merge_map(&mut existing.annotations, required.annotations.as_ref());
  modified |= merge_owner_refs(&mut existing.owner_references, required.owner_references.as_deref());
  modified
}

fn same_owner(existing: &OwnerReference, required: &OwnerReference) -> bool {
  existing.name == required.name && existing.kind == required.kind && group(&existing.api_version) == group(&required.api_version)
}

fn group(api_version: &str) -> &str {
  api_version.split_once('/').map(|(group, _)| group).unwrap_or("")
}
