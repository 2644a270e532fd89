//! Push reconciler: converges KMS contents toward a source cluster Secret
//! plus generator-produced keys.
//!
//! Ownership is tracked in `status.managedSecrets`, a map from remote secret
//! id to the local key it was pushed under. The local key is the identity
//! that survives remote renames. Mutations run sequentially because the map
//! is updated between calls, and per-key failures are collected rather than
//! aborting the loop.

use anyhow::{anyhow, Context as _, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::auth::{self, KubeClusterSecrets};
use crate::config;
use crate::constants::{
    DELETION_POLICY_DELETE, FIELD_MANAGER, PUSH_SECRET_FINALIZER, UPDATE_POLICY_REPLACE,
};
use crate::crd::status::{
    CONDITION_AUTHENTICATED, CONDITION_FAILED_TO_CREATE_SECRETS,
    CONDITION_FAILED_TO_DELETE_SECRETS, CONDITION_FAILED_TO_REPLACE_SECRETS,
    CONDITION_FAILED_TO_UPDATE_SECRETS, CONDITION_RECONCILE,
};
use crate::crd::{
    set_condition, ClusterGenerator, Condition, GeneratorKind, KMSPushSecret,
    KMSPushSecretDestination,
};
use crate::generator;
use crate::kms::{
    CreateSecretRequest, DeleteSecretRequest, KmsClient, KmsSecret as RemoteSecret,
    ListSecretsRequest, UpdateSecretRequest,
};
use crate::observability::metrics;
use crate::reconciler::{Context, ReconcilerError};
use crate::template::{render_payload, TemplateSource};
use crate::util::parse_duration;

const KIND: &str = "push";

/// Result of one convergence pass: the updated ownership map and the keys
/// that failed, bucketed by operation.
#[derive(Debug, Default, Clone)]
pub struct PushSyncOutcome {
    pub managed: BTreeMap<String, String>,
    pub failed_to_create: Vec<String>,
    pub failed_to_update: Vec<String>,
    pub failed_to_delete: Vec<String>,
    pub failed_to_replace: Vec<String>,
}

impl PushSyncOutcome {
    pub fn has_failures(&self) -> bool {
        !self.failed_to_create.is_empty()
            || !self.failed_to_update.is_empty()
            || !self.failed_to_delete.is_empty()
            || !self.failed_to_replace.is_empty()
    }
}

fn list_request(destination: &KMSPushSecretDestination) -> ListSecretsRequest {
    ListSecretsRequest {
        project_id: destination.project_id.clone(),
        environment: destination.environment_slug.clone(),
        path: destination.secrets_path.clone(),
        recursive: false,
        include_imports: false,
    }
}

fn create_request(
    destination: &KMSPushSecretDestination,
    key: &str,
    value: &str,
) -> CreateSecretRequest {
    CreateSecretRequest {
        key: key.to_string(),
        value: value.to_string(),
        project_id: destination.project_id.clone(),
        environment: destination.environment_slug.clone(),
        path: destination.secrets_path.clone(),
    }
}

fn update_request(
    destination: &KMSPushSecretDestination,
    key: &str,
    value: &str,
) -> UpdateSecretRequest {
    UpdateSecretRequest {
        key: key.to_string(),
        new_value: value.to_string(),
        project_id: destination.project_id.clone(),
        environment: destination.environment_slug.clone(),
        path: destination.secrets_path.clone(),
    }
}

fn delete_request(destination: &KMSPushSecretDestination, key: &str) -> DeleteSecretRequest {
    DeleteSecretRequest {
        key: key.to_string(),
        project_id: destination.project_id.clone(),
        environment: destination.environment_slug.clone(),
        path: destination.secrets_path.clone(),
    }
}

/// One convergence pass over the destination.
///
/// `existing` is the remote snapshot taken before any mutation and is only
/// patched locally where a later step must observe an earlier update. A
/// remote secret is owned iff its id appears in `managed`; unowned matches by
/// key are only touched under the `Replace` policy.
pub async fn sync_push_secrets(
    kms: &dyn KmsClient,
    destination: &KMSPushSecretDestination,
    processed: &BTreeMap<String, String>,
    mut existing: Vec<RemoteSecret>,
    managed: Option<BTreeMap<String, String>>,
    replace: bool,
) -> PushSyncOutcome {
    let mut outcome = PushSyncOutcome::default();

    // First reconcile: adopt what we create or overwrite.
    let Some(mut managed) = managed else {
        let mut adopted = BTreeMap::new();
        for (key, value) in processed {
            if existing.iter().any(|secret| &secret.key == key) {
                if replace {
                    match kms.update_secret(update_request(destination, key, value)).await {
                        Ok(updated) => {
                            metrics::increment_push_operation("update");
                            adopted.insert(updated.id, key.clone());
                        }
                        Err(e) => {
                            warn!(key = %key, "unable to update secret: {e}");
                            outcome.failed_to_update.push(key.clone());
                        }
                    }
                }
            } else {
                match kms.create_secret(create_request(destination, key, value)).await {
                    Ok(created) => {
                        metrics::increment_push_operation("create");
                        adopted.insert(created.id, key.clone());
                    }
                    Err(e) => {
                        warn!(key = %key, "unable to create secret: {e}");
                        outcome.failed_to_create.push(key.clone());
                    }
                }
            }
        }
        outcome.managed = adopted;
        return outcome;
    };

    let find_by_key =
        |existing: &[RemoteSecret], key: &str| existing.iter().find(|s| s.key == key).cloned();

    // Rename detection: the recorded local key is authoritative. A remote
    // whose key drifted is deleted under its current key and re-created under
    // the local key, preserving the remote value.
    let entries: Vec<(String, String)> = managed
        .iter()
        .map(|(id, key)| (id.clone(), key.clone()))
        .collect();
    for (id, local_key) in &entries {
        let Some(remote) = existing.iter().find(|s| &s.id == id).cloned() else {
            continue;
        };
        if remote.key == *local_key {
            continue;
        }

        info!(
            id = %id,
            from = %remote.key,
            to = %local_key,
            "remote key drifted, deleting and re-creating secret"
        );

        let deleted = match kms.delete_secret(delete_request(destination, &remote.key)).await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(key = %local_key, "unable to delete renamed secret: {e}");
                outcome.failed_to_replace.push(local_key.clone());
                continue;
            }
        };
        match kms
            .create_secret(create_request(destination, local_key, &remote.value))
            .await
        {
            Ok(created) => {
                metrics::increment_push_operation("replace");
                managed.remove(&deleted.id);
                managed.insert(created.id, local_key.clone());
            }
            Err(e) => {
                warn!(key = %local_key, "unable to re-create renamed secret: {e}");
                outcome.failed_to_replace.push(local_key.clone());
            }
        }
    }

    // Removal: owned keys that disappeared from the intended contents are
    // deleted remotely, if still present.
    let entries: Vec<(String, String)> = managed
        .iter()
        .map(|(id, key)| (id.clone(), key.clone()))
        .collect();
    for (_, local_key) in &entries {
        if processed.contains_key(local_key) {
            continue;
        }
        if find_by_key(&existing, local_key).is_none() {
            continue;
        }

        info!(key = %local_key, "key removed from source, deleting secret from KMS");
        match kms.delete_secret(delete_request(destination, local_key)).await {
            Ok(deleted) => {
                metrics::increment_push_operation("delete");
                managed.remove(&deleted.id);
            }
            Err(e) => {
                warn!(key = %local_key, "unable to delete secret: {e}");
                outcome.failed_to_delete.push(local_key.clone());
            }
        }
    }

    // Addition, and replacement of unowned matches under the Replace policy.
    for (key, value) in processed {
        match find_by_key(&existing, key) {
            None => {
                if managed.values().any(|local_key| local_key == key) {
                    continue;
                }
                info!(key = %key, "key added to source, creating secret in KMS");
                match kms.create_secret(create_request(destination, key, value)).await {
                    Ok(created) => {
                        metrics::increment_push_operation("create");
                        managed.insert(created.id, key.clone());
                    }
                    Err(e) => {
                        warn!(key = %key, "unable to create secret: {e}");
                        outcome.failed_to_create.push(key.clone());
                    }
                }
            }
            Some(remote) => {
                if replace && remote.value != *value {
                    info!(key = %key, "value changed, updating secret in KMS");
                    match kms.update_secret(update_request(destination, key, value)).await {
                        Ok(updated) => {
                            metrics::increment_push_operation("update");
                            for secret in existing.iter_mut().filter(|s| &s.key == key) {
                                secret.value = value.clone();
                            }
                            managed.insert(updated.id, key.clone());
                        }
                        Err(e) => {
                            warn!(key = %key, "unable to update secret: {e}");
                            outcome.failed_to_update.push(key.clone());
                        }
                    }
                }
            }
        }
    }

    // Value drift on owned secrets (the Replace case was handled above and
    // reflected into the local snapshot).
    for (key, value) in processed {
        let Some(remote) = find_by_key(&existing, key) else {
            continue;
        };
        if remote.value == *value {
            continue;
        }
        if !managed.contains_key(&remote.id) && !replace {
            continue;
        }

        info!(key = %key, "value changed, updating secret in KMS");
        match kms.update_secret(update_request(destination, key, value)).await {
            Ok(updated) => {
                metrics::increment_push_operation("update");
                managed.insert(updated.id, key.clone());
            }
            Err(e) => {
                warn!(key = %key, "unable to update secret: {e}");
                outcome.failed_to_update.push(key.clone());
            }
        }
    }

    outcome.managed = managed;
    outcome
}

/// Best-effort deletion sweep on resource removal: every owned id still
/// present remotely is deleted under its recorded key. Per-item errors are
/// logged and skipped.
pub async fn delete_managed_secrets(
    kms: &dyn KmsClient,
    destination: &KMSPushSecretDestination,
    managed: &BTreeMap<String, String>,
) -> Result<()> {
    let existing = kms
        .list_secrets(list_request(destination))
        .await
        .context("unable to list secrets")?;

    for (id, local_key) in managed {
        if !existing.iter().any(|secret| &secret.id == id) {
            continue;
        }
        info!(key = %local_key, "deleting managed secret from KMS");
        if let Err(e) = kms.delete_secret(delete_request(destination, local_key)).await {
            warn!(key = %local_key, "unable to delete secret: {e}");
            continue;
        }
        metrics::increment_push_operation("delete");
    }

    Ok(())
}

/// Flattened per-category failure message: `Failed to create secrets: [a, b]`.
fn failure_message(operation: &str, keys: &[String]) -> String {
    format!("Failed to {operation} secrets: [{}]", keys.join(", "))
}

pub async fn reconcile(
    resource: Arc<KMSPushSecret>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcilerError> {
    let start = Instant::now();
    metrics::increment_reconciliations(KIND);

    let name = resource.name_any();
    let namespace = resource.namespace().unwrap_or_default();
    let uid = resource
        .uid()
        .ok_or_else(|| anyhow!("resource {name} has no UID"))?;
    let api: Api<KMSPushSecret> = Api::namespaced(ctx.client.clone(), &namespace);

    if resource.meta().deletion_timestamp.is_some() {
        handle_deletion(&resource, &ctx, &api, &name, &uid).await?;
        return Ok(Action::await_change());
    }

    if !resource
        .finalizers()
        .iter()
        .any(|f| f == PUSH_SECRET_FINALIZER)
    {
        let mut finalizers = resource.finalizers().to_vec();
        finalizers.push(PUSH_SECRET_FINALIZER.to_string());
        let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
        api.patch(&name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| anyhow!("unable to add finalizer to {name}: {e}"))?;
    }

    if resource.spec.push.secret.is_none() && resource.spec.push.generators.is_empty() {
        info!(resource = %name, "no source secret or generators declared, skipping reconciliation");
        return Ok(Action::await_change());
    }

    let requeue = match &resource.spec.resync_interval {
        Some(interval) => Some(
            parse_duration(interval)
                .map_err(|e| anyhow!("unable to parse resync interval: {e}"))?,
        ),
        None => None,
    };

    let mut conditions = current_conditions(&resource);
    let result = reconcile_push(&resource, &ctx, &uid, &mut conditions).await;

    match &result {
        Ok(()) => {
            ctx.reset_backoff(&format!("{namespace}/{name}"));
            set_condition(
                &mut conditions,
                CONDITION_RECONCILE,
                true,
                "OK",
                "Reconcile succeeded, secrets were pushed to KMS",
            );
        }
        Err(e) => set_condition(
            &mut conditions,
            CONDITION_RECONCILE,
            false,
            "Error",
            format!("Reconcile failed, secrets were not pushed to KMS. Error: {e}"),
        ),
    }
    patch_conditions(&ctx, &namespace, &name, &conditions).await;
    metrics::observe_reconcile_duration(KIND, start.elapsed().as_secs_f64());

    match result {
        Ok(()) => match requeue {
            Some(interval) => {
                info!(resource = %name, "operator will requeue after {interval:?}");
                Ok(Action::requeue(interval))
            }
            None => {
                info!(resource = %name, "operator will reconcile on next spec change");
                Ok(Action::await_change())
            }
        },
        Err(e) => {
            metrics::increment_reconciliation_errors(KIND);
            error!(resource = %name, "unable to reconcile: {e:#}");
            match requeue {
                Some(interval) => Ok(Action::requeue(interval)),
                None => Err(e.into()),
            }
        }
    }
}

pub fn error_policy(
    resource: Arc<KMSPushSecret>,
    error: &ReconcilerError,
    ctx: Arc<Context>,
) -> Action {
    let name = resource.name_any();
    let namespace = resource.namespace().unwrap_or_default();
    error!(resource = %name, "reconciliation error: {error}");
    Action::requeue(ctx.error_backoff(&format!("{namespace}/{name}")))
}

/// Deletion reconcile. Finalizers are cleared before any KMS call so a
/// failing KMS can never wedge resource deletion; the remote sweep is best
/// effort afterwards.
async fn handle_deletion(
    resource: &KMSPushSecret,
    ctx: &Context,
    api: &Api<KMSPushSecret>,
    name: &str,
    uid: &str,
) -> Result<()> {
    if !resource.finalizers().is_empty() {
        let patch = serde_json::json!({"metadata": {"finalizers": []}});
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| anyhow!("error removing finalizers from {name}: {e}"))?;
    }

    if resource.spec.deletion_policy == DELETION_POLICY_DELETE {
        let managed = resource
            .status
            .as_ref()
            .and_then(|status| status.managed_secrets.clone())
            .unwrap_or_default();

        if !managed.is_empty() {
            if let Err(e) = delete_remote_secrets(resource, ctx, uid, &managed).await {
                warn!(resource = %name, "unable to delete managed secrets: {e:#}");
            }
        }
    }

    ctx.registry.invalidate(uid);
    Ok(())
}

async fn delete_remote_secrets(
    resource: &KMSPushSecret,
    ctx: &Context,
    uid: &str,
    managed: &BTreeMap<String, String>,
) -> Result<()> {
    let session = obtain_authenticated_session(resource, ctx, uid, &mut Vec::new()).await?;
    delete_managed_secrets(
        session.as_ref(),
        &resource.spec.destination,
        managed,
    )
    .await
}

async fn obtain_authenticated_session(
    resource: &KMSPushSecret,
    ctx: &Context,
    uid: &str,
    conditions: &mut Vec<Condition>,
) -> Result<Arc<dyn KmsClient>> {
    let client_config = config::resolve_client_config(
        &ctx.client,
        &resource.spec.host_api,
        &resource.spec.tls,
    )
    .await?;
    let session = ctx.registry.obtain(uid, client_config)?;

    if session.auth.is_none() {
        let cluster = KubeClusterSecrets::new(ctx.client.clone());
        match auth::resolve(&cluster, resource, session.client.as_ref()).await {
            Ok(details) => {
                set_condition(
                    conditions,
                    CONDITION_AUTHENTICATED,
                    true,
                    "OK",
                    "Successfully authenticated with the KMS API",
                );
                ctx.registry.store_auth(uid, details);
            }
            Err(e) => {
                set_condition(
                    conditions,
                    CONDITION_AUTHENTICATED,
                    false,
                    "Error",
                    "Failed to authenticate with the KMS API. This can be caused by invalid credentials or an invalid API host. Check operator logs for more info",
                );
                ctx.registry.clear_auth(uid);
                return Err(anyhow!("unable to authenticate: {e}"));
            }
        }
    }

    Ok(session.client)
}

async fn reconcile_push(
    resource: &KMSPushSecret,
    ctx: &Context,
    uid: &str,
    conditions: &mut Vec<Condition>,
) -> Result<()> {
    let kms = obtain_authenticated_session(resource, ctx, uid, conditions).await?;

    let mut processed = BTreeMap::new();
    if let Some(source) = &resource.spec.push.secret {
        processed.extend(process_source_secret(resource, ctx, source).await?);
    }
    processed.extend(process_generators(resource, ctx).await?);

    let destination = &resource.spec.destination;
    let existing = kms
        .list_secrets(list_request(destination))
        .await
        .context("unable to list secrets")?;

    let managed = resource
        .status
        .as_ref()
        .and_then(|status| status.managed_secrets.clone());
    let replace = resource.spec.update_policy == UPDATE_POLICY_REPLACE;

    let outcome =
        sync_push_secrets(kms.as_ref(), destination, &processed, existing, managed, replace).await;

    apply_failure_conditions(conditions, &outcome);
    patch_managed_secrets(resource, ctx, &outcome.managed).await?;

    Ok(())
}

fn apply_failure_conditions(conditions: &mut Vec<Condition>, outcome: &PushSyncOutcome) {
    let buckets = [
        (
            CONDITION_FAILED_TO_CREATE_SECRETS,
            "create",
            &outcome.failed_to_create,
            "No errors encountered, no secrets failed to be created in KMS",
        ),
        (
            CONDITION_FAILED_TO_UPDATE_SECRETS,
            "update",
            &outcome.failed_to_update,
            "No errors encountered, no secrets failed to be updated in KMS",
        ),
        (
            CONDITION_FAILED_TO_DELETE_SECRETS,
            "delete",
            &outcome.failed_to_delete,
            "No errors encountered, no secrets failed to be deleted",
        ),
        (
            CONDITION_FAILED_TO_REPLACE_SECRETS,
            "replace",
            &outcome.failed_to_replace,
            "No errors encountered, no secrets failed to be replaced in KMS",
        ),
    ];

    for (condition, operation, keys, ok_message) in buckets {
        if keys.is_empty() {
            set_condition(conditions, condition, false, "OK", ok_message);
        } else {
            set_condition(
                conditions,
                condition,
                true,
                "Error",
                failure_message(operation, keys),
            );
        }
    }
}

/// Fetch the source Secret and build the intended contents through the
/// optional template, with the destination path exposed to templates.
async fn process_source_secret(
    resource: &KMSPushSecret,
    ctx: &Context,
    source: &crate::crd::PushSecretSource,
) -> Result<BTreeMap<String, String>> {
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &source.secret_namespace);
    let secret = api
        .get(&source.secret_name)
        .await
        .with_context(|| format!("unable to fetch kube secret {}", source.secret_name))?;

    let sources: BTreeMap<String, TemplateSource> = secret
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| {
            (
                key,
                TemplateSource {
                    value: String::from_utf8_lossy(&value.0).into_owned(),
                    secret_path: resource.spec.destination.secrets_path.clone(),
                },
            )
        })
        .collect();

    render_payload(source.template.as_ref(), &sources)
        .context("unable to process templated secrets")
}

async fn process_generators(
    resource: &KMSPushSecret,
    ctx: &Context,
) -> Result<BTreeMap<String, String>> {
    let mut generated = BTreeMap::new();
    if resource.spec.push.generators.is_empty() {
        return Ok(generated);
    }

    let api: Api<ClusterGenerator> = Api::all(ctx.client.clone());
    for entry in &resource.spec.push.generators {
        let cluster_generator = api
            .get(&entry.generator_ref.name)
            .await
            .with_context(|| {
                format!(
                    "unable to get ClusterGenerator resource {}",
                    entry.generator_ref.name
                )
            })?;

        let value = match entry.generator_ref.kind {
            GeneratorKind::Password => {
                let password_spec = cluster_generator
                    .spec
                    .generator
                    .password_spec
                    .as_ref()
                    .ok_or_else(|| {
                        anyhow!("password spec is not defined in the ClusterGenerator resource")
                    })?;
                generator::generate_password(password_spec).context("unable to generate password")?
            }
            GeneratorKind::Uuid => generator::generate_uuid(),
        };

        generated.insert(entry.destination_secret_name.clone(), value);
    }

    Ok(generated)
}

fn current_conditions(resource: &KMSPushSecret) -> Vec<Condition> {
    resource
        .status
        .as_ref()
        .map(|status| status.conditions.clone())
        .unwrap_or_default()
}

async fn patch_managed_secrets(
    resource: &KMSPushSecret,
    ctx: &Context,
    managed: &BTreeMap<String, String>,
) -> Result<()> {
    let namespace = resource.namespace().unwrap_or_default();
    let api: Api<KMSPushSecret> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = serde_json::json!({"status": {"managedSecrets": managed}});
    api.patch_status(
        &resource.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(patch),
    )
    .await
    .context("unable to update status of the push resource")?;
    Ok(())
}

/// Condition updates are best effort: failures are logged, never surfaced.
async fn patch_conditions(ctx: &Context, namespace: &str, name: &str, conditions: &[Condition]) {
    let api: Api<KMSPushSecret> = Api::namespaced(ctx.client.clone(), namespace);
    let patch = serde_json::json!({"status": {"conditions": conditions}});
    if let Err(e) = api
        .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
        .await
    {
        warn!(resource = %name, "unable to update status conditions: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_message_is_flat() {
        let message = failure_message("create", &["A".to_string(), "B".to_string()]);
        assert_eq!(message, "Failed to create secrets: [A, B]");
    }

    #[test]
    fn failure_conditions_polarity() {
        let outcome = PushSyncOutcome {
            failed_to_create: vec!["A".to_string()],
            ..Default::default()
        };

        let mut conditions = Vec::new();
        apply_failure_conditions(&mut conditions, &outcome);

        let create = conditions
            .iter()
            .find(|c| c.r#type == CONDITION_FAILED_TO_CREATE_SECRETS)
            .unwrap();
        assert_eq!(create.status, "True");
        assert_eq!(
            create.message.as_deref(),
            Some("Failed to create secrets: [A]")
        );

        let update = conditions
            .iter()
            .find(|c| c.r#type == CONDITION_FAILED_TO_UPDATE_SECRETS)
            .unwrap();
        assert_eq!(update.status, "False");
    }
}
