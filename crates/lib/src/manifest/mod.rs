//! Manifest identifiers and the stores that resolve them to bytes.
//!
//! A manifest is the template of a single desired resource. The core only
//! ever reads manifests; where they come from (a directory on disk, assets
//! compiled into the binary) is up to the caller.

mod source;
mod types;

pub use source::{DirSource, ManifestSource, MemorySource, SourceError};
pub use types::ManifestRef;
