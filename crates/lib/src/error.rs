//! Batch-level errors.
//!
//! Anything that stops a batch carries the manifest that failed and the
//! step that was running, so callers can tell which manifest broke and why
//! without reading logs.

use std::fmt;

use thiserror::Error;

use crate::apply::ApplyError;
use crate::client::ClientError;
use crate::establish::EstablishError;
use crate::manifest::{ManifestRef, SourceError};

/// The step of the apply pipeline that was running when an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
  Fetch,
  Render,
  Decode,
  Resolve,
  Get,
  Create,
  Update,
  /// Somewhere in the handler's cluster round-trips.
  Apply,
  Establish,
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Operation::Fetch => "fetch",
      Operation::Render => "render",
      Operation::Decode => "decode",
      Operation::Resolve => "resolve",
      Operation::Get => "get",
      Operation::Create => "create",
      Operation::Update => "update",
      Operation::Apply => "apply",
      Operation::Establish => "establish",
    })
  }
}

/// Failure of a single pipeline step.
#[derive(Debug, Error)]
pub enum StepError {
  #[error(transparent)]
  Source(#[from] SourceError),

  #[error(transparent)]
  Apply(#[from] ApplyError),
}

#[derive(Debug, Error)]
pub enum Error {
  /// A manifest failed. Manifests earlier in the batch stay applied.
  #[error("{op} {manifest}: {source}")]
  Manifest {
    manifest: ManifestRef,
    op: Operation,
    #[source]
    source: StepError,
  },

  /// No client could be built for the credential.
  #[error("failed to resolve client: {0}")]
  Client(#[source] ClientError),

  /// Cancelled while waiting for the batch lock, before any manifest ran.
  #[error("batch cancelled")]
  Cancelled,
}

impl Error {
  pub(crate) fn manifest(manifest: &ManifestRef, source: impl Into<StepError>) -> Self {
    let source = source.into();
    let op = match &source {
      StepError::Source(_) => Operation::Fetch,
      StepError::Apply(err) => err.operation(),
    };
    Error::Manifest {
      manifest: manifest.clone(),
      op,
      source,
    }
  }

  /// The manifest that failed, if the failure belongs to one.
  pub fn failed_manifest(&self) -> Option<&ManifestRef> {
    match self {
      Error::Manifest { manifest, .. } => Some(manifest),
      _ => None,
    }
  }

  pub fn operation(&self) -> Option<Operation> {
    match self {
      Error::Manifest { op, .. } => Some(*op),
      _ => None,
    }
  }

  /// Establishment did not finish in time.
  pub fn is_timeout(&self) -> bool {
    matches!(
      self,
      Error::Manifest {
        source: StepError::Apply(ApplyError::Establish(EstablishError::Timeout { .. })),
        ..
      }
    )
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(
      self,
      Error::Cancelled
        | Error::Manifest {
          source: StepError::Apply(ApplyError::Cancelled { .. } | ApplyError::Establish(EstablishError::Cancelled)),
          ..
        }
    )
  }

  /// A defect in the manifest or its parameters. Retrying cannot help.
  pub fn is_authoring(&self) -> bool {
    matches!(
      self,
      Error::Manifest {
        source: StepError::Apply(ApplyError::Render(_) | ApplyError::Decode(_)),
        ..
      }
    )
  }
}
