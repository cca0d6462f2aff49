use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque path-like key naming one manifest in a [`super::ManifestSource`].
///
/// # Example
///
/// ```
/// use kapply_lib::manifest::ManifestRef;
///
/// let r = ManifestRef::from("components/openshift-dns/dns/namespace.yaml");
/// assert_eq!(r.as_str(), "components/openshift-dns/dns/namespace.yaml");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestRef(String);

impl ManifestRef {
  pub fn new(key: impl Into<String>) -> Self {
    Self(key.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ManifestRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for ManifestRef {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

impl From<String> for ManifestRef {
  fn from(s: String) -> Self {
    Self(s)
  }
}
