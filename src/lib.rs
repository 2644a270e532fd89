//! # KMS Operator
//!
//! A Kubernetes operator that synchronizes secret material between an
//! external KMS and the cluster. It owns three custom resource kinds:
//!
//! 1. **KMSSecret** (pull) materializes KMS secrets into managed cluster
//!    Secrets or ConfigMaps, tracking staleness with a content digest.
//! 2. **KMSPushSecret** (push) converges KMS contents toward a source
//!    cluster Secret plus generator-produced keys, with stable ownership
//!    tracking across remote renames.
//! 3. **KMSDynamicSecret** (dynamic) obtains short-lived credential leases
//!    and keeps them renewed against per-lease and max-TTL budgets.
//!
//! Authentication is resolved per resource from a set of machine-identity
//! strategies and cached in a process-wide registry keyed by resource UID.

pub mod auth;
pub mod config;
pub mod constants;
pub mod crd;
pub mod generator;
pub mod kms;
pub mod observability;
pub mod reconciler;
pub mod registry;
pub mod rollout;
pub mod server;
pub mod template;
pub mod util;
