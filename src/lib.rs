//! flowmesh - Kubernetes operator for a network-flow collection pipeline
//!
//! One cluster-scoped `FlowCollector` describes the whole pipeline: the
//! capture agents, the flow processor, the console plugin, monitoring
//! resources and network isolation. Each of these components has its own
//! reconcile loop; the loops share one status per FlowCollector.
//!
//! # Modules
//!
//! - [`crd`] - the FlowCollector custom resource
//! - [`builder`] - desired resources per component
//! - [`fingerprint`] - config digests that roll workloads on config change
//! - [`reconciler`] - fetch-merge-write convergence of one resource
//! - [`status`] - per-component conditions and the Ready rollup
//! - [`controller`] - the reconcile loops
//! - [`client`] - cluster access behind traits
//! - [`error`] - error types for the operator

#![deny(missing_docs)]

pub mod builder;
pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod reconciler;
pub mod resource;
pub mod retry;
pub mod status;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
