//! Process-wide registry of per-resource state: the KMS client handle, the
//! cancellation token for its in-flight requests and the cached
//! authentication result.
//!
//! Entries are created on first reconcile and invalidated on spec-generation
//! change or deletion. Invalidation runs on the watch task, concurrently with
//! the worker servicing the resource, so the map sits behind a lock and the
//! cancellation hook always fires before the entry is dropped.

use futures::TryStreamExt;
use kube::runtime::watcher::{self, watcher, Event};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::AuthenticationDetails;
use crate::kms::{ClientConfig, HttpKmsClient, KmsClient, KmsError};

/// State held for one resource UID.
#[derive(Clone)]
pub struct ResourceSession {
    pub client: Arc<dyn KmsClient>,
    pub cancel: CancellationToken,
    pub auth: Option<AuthenticationDetails>,
}

#[derive(Default)]
pub struct ResourceRegistry {
    sessions: Mutex<HashMap<String, ResourceSession>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session for `uid`, building a fresh client from `config`
    /// when none exists yet.
    pub fn obtain(&self, uid: &str, config: ClientConfig) -> Result<ResourceSession, KmsError> {
        let mut sessions = self.sessions.lock().expect("registry lock poisoned");

        if let Some(session) = sessions.get(uid) {
            return Ok(session.clone());
        }

        let cancel = CancellationToken::new();
        let client = HttpKmsClient::new(config, cancel.clone())?;
        let session = ResourceSession {
            client: Arc::new(client),
            cancel,
            auth: None,
        };
        sessions.insert(uid.to_string(), session.clone());
        Ok(session)
    }

    /// Cache a successful authentication for `uid`.
    pub fn store_auth(&self, uid: &str, auth: AuthenticationDetails) {
        let mut sessions = self.sessions.lock().expect("registry lock poisoned");
        if let Some(session) = sessions.get_mut(uid) {
            session.auth = Some(auth);
        }
    }

    /// Drop the cached authentication so the next reconcile logs in again.
    pub fn clear_auth(&self, uid: &str) {
        let mut sessions = self.sessions.lock().expect("registry lock poisoned");
        if let Some(session) = sessions.get_mut(uid) {
            session.auth = None;
        }
    }

    /// Cancel in-flight requests for `uid` and forget its session. The next
    /// reconcile rebuilds a fresh client with current host and CA settings.
    pub fn invalidate(&self, uid: &str) {
        let removed = {
            let mut sessions = self.sessions.lock().expect("registry lock poisoned");
            sessions.remove(uid)
        };
        if let Some(session) = removed {
            session.cancel.cancel();
            debug!(uid, "invalidated resource session");
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.sessions.lock().expect("registry lock poisoned").len()
    }
}

/// Watch one resource kind and invalidate registry entries when a resource's
/// generation changes or the resource is deleted.
///
/// Cancellation on spec change is mandatory (the old session may point at a
/// stale host or CA); cancellation on deletion is best effort.
pub async fn watch_for_invalidation<K>(api: Api<K>, registry: Arc<ResourceRegistry>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    K::DynamicType: Default,
{
    let mut generations: HashMap<String, i64> = HashMap::new();
    let mut events = std::pin::pin!(watcher(api, watcher::Config::default()));

    loop {
        match events.try_next().await {
            Ok(Some(Event::Apply(resource))) => {
                let meta = resource.meta();
                let Some(uid) = meta.uid.clone() else { continue };
                let generation = meta.generation.unwrap_or_default();

                match generations.insert(uid.clone(), generation) {
                    Some(previous) if previous != generation => registry.invalidate(&uid),
                    _ => {}
                }
            }
            Ok(Some(Event::InitApply(resource))) => {
                let meta = resource.meta();
                if let Some(uid) = meta.uid.clone() {
                    generations.insert(uid, meta.generation.unwrap_or_default());
                }
            }
            Ok(Some(Event::Delete(resource))) => {
                if let Some(uid) = resource.meta().uid.clone() {
                    generations.remove(&uid);
                    registry.invalidate(&uid);
                }
            }
            Ok(Some(Event::Init | Event::InitDone)) => {}
            Ok(None) => break,
            Err(e) => {
                warn!("invalidation watch error: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig {
            base_url: "https://kms.example.com/api".into(),
            ca_certificate: None,
        }
    }

    #[test]
    fn obtain_reuses_existing_session() {
        let registry = ResourceRegistry::new();
        let first = registry.obtain("uid-1", config()).unwrap();
        first.client.set_access_token("token".into());

        let second = registry.obtain("uid-1", config()).unwrap();
        assert_eq!(second.client.access_token().as_deref(), Some("token"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn invalidate_cancels_before_removal() {
        let registry = ResourceRegistry::new();
        let session = registry.obtain("uid-1", config()).unwrap();
        assert!(!session.cancel.is_cancelled());

        registry.invalidate("uid-1");
        assert!(session.cancel.is_cancelled());
        assert_eq!(registry.len(), 0);

        // A later obtain builds a fresh session with a live token.
        let rebuilt = registry.obtain("uid-1", config()).unwrap();
        assert!(!rebuilt.cancel.is_cancelled());
    }

    #[test]
    fn auth_cache_round_trip() {
        use crate::auth::{AuthStrategy, ResourceKind};
        use crate::crd::MachineIdentityScope;

        let registry = ResourceRegistry::new();
        registry.obtain("uid-1", config()).unwrap();

        registry.store_auth(
            "uid-1",
            AuthenticationDetails {
                strategy: AuthStrategy::Universal,
                machine_identity_scope: MachineIdentityScope::default(),
                is_machine_identity: true,
                resource_kind: ResourceKind::Push,
            },
        );
        assert!(registry.obtain("uid-1", config()).unwrap().auth.is_some());

        registry.clear_auth("uid-1");
        assert!(registry.obtain("uid-1", config()).unwrap().auth.is_none());
    }
}
