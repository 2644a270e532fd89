//! The three reconcilers and their shared context.

pub mod dynamic;
pub mod pull;
pub mod push;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

use crate::registry::ResourceRegistry;
use crate::util::ErrorBackoff;

/// Shared state handed to every reconcile invocation.
pub struct Context {
    pub client: kube::Client,
    pub registry: Arc<ResourceRegistry>,
    /// Per-resource backoff for reconcile errors that propagate to the
    /// manager. Keyed by `namespace/name`.
    backoffs: Mutex<HashMap<String, ErrorBackoff>>,
}

impl Context {
    pub fn new(client: kube::Client, registry: Arc<ResourceRegistry>) -> Self {
        Self {
            client,
            registry,
            backoffs: Mutex::new(HashMap::new()),
        }
    }

    /// Next error backoff for a resource.
    pub fn error_backoff(&self, resource_key: &str) -> Duration {
        let mut backoffs = self.backoffs.lock().expect("backoff lock poisoned");
        backoffs
            .entry(resource_key.to_string())
            .or_default()
            .next()
    }

    /// Reset the backoff after a successful reconcile.
    pub fn reset_backoff(&self, resource_key: &str) {
        let mut backoffs = self.backoffs.lock().expect("backoff lock poisoned");
        if let Some(backoff) = backoffs.get_mut(resource_key) {
            backoff.reset();
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("reconciliation failed: {0}")]
    Failed(#[from] anyhow::Error),
}
