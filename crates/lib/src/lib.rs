//! kapply-lib: apply Kubernetes manifests to a cluster and keep them there.
//!
//! The crate is organized around one pipeline per manifest:
//! - `render`: fill a manifest template with parameters
//! - `decode`: turn rendered bytes into a typed or unstructured object
//! - `apply`: create the object or merge it into the one already stored
//! - `establish`: create CustomResourceDefinitions and wait until served
//!
//! `reconcile` drives batches of manifests through that pipeline against
//! the clients held in `client`, failing fast and serialized by one lock.

pub mod apply;
pub mod client;
pub mod config;
pub mod decode;
pub mod error;
pub mod establish;
pub mod kinds;
pub mod manifest;
pub mod reconcile;
pub mod render;
pub mod util;

pub use error::Error;
pub use reconcile::{Batch, BatchReport, Reconciler};
