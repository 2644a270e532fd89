//! Pull reconciler: materializes KMS secrets into managed cluster Secrets
//! and ConfigMaps.
//!
//! Staleness is tracked with a content digest over the fetched secret set,
//! stored in the version annotation of every managed object. Managed objects
//! are created with an owner reference under the `Owner` creation policy and
//! updated wholesale otherwise; the digest is the cache key, there is no
//! per-object diff.

use anyhow::{anyhow, Context as _, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::auth::{self, AuthStrategy, KubeClusterSecrets};
use crate::config;
use crate::constants::{FIELD_MANAGER, SECRET_VERSION_ANNOTATION};
use crate::crd::status::{
    CONDITION_AUTO_REDEPLOY_READY, CONDITION_LOADED_KMS_TOKEN, CONDITION_READY_TO_SYNC_SECRETS,
};
use crate::crd::{
    set_condition, Condition, KMSSecret, ManagedKubeConfigMapConfig, ManagedKubeSecretConfig,
};
use crate::kms::{KmsClient, KmsSecret as RemoteSecret, ListSecretsRequest};
use crate::observability::metrics;
use crate::reconciler::{Context, ReconcilerError};
use crate::rollout;
use crate::template::{render_payload, TemplateSource};
use crate::util::filter_system_annotations;

const KIND: &str = "pull";
const DEFAULT_RESYNC: Duration = Duration::from_secs(60);

/// Content digest over a fetched secret set. Stable across fetch order so a
/// KMS returning the same set twice yields the same version annotation.
pub fn compute_etag(secrets: &[RemoteSecret]) -> String {
    let mut sorted: Vec<&RemoteSecret> = secrets.iter().collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.path.cmp(&b.path)));

    let mut canonical = String::from("[");
    for secret in sorted {
        canonical.push_str(&format!(
            "{{key:{} value:{} path:{}}}",
            secret.key, secret.value, secret.path
        ));
    }
    canonical.push(']');

    format!("{:x}", md5::compute(canonical))
}

pub async fn reconcile(
    resource: Arc<KMSSecret>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcilerError> {
    let start = Instant::now();
    metrics::increment_reconciliations(KIND);

    let name = resource.name_any();
    let namespace = resource.namespace().unwrap_or_default();
    let uid = resource
        .uid()
        .ok_or_else(|| anyhow!("resource {name} has no UID"))?;

    let requeue = if resource.spec.resync_interval > 0 {
        Duration::from_secs(resource.spec.resync_interval as u64)
    } else {
        DEFAULT_RESYNC
    };

    // No finalizer: owner references garbage-collect the managed objects.
    // Resources from older operator versions may still carry one.
    if resource.meta().deletion_timestamp.is_some() {
        if !resource.finalizers().is_empty() {
            let api: Api<KMSSecret> = Api::namespaced(ctx.client.clone(), &namespace);
            let patch = serde_json::json!({"metadata": {"finalizers": []}});
            api.patch(&name, &PatchParams::default(), &Patch::Merge(patch))
                .await
                .map_err(|e| anyhow!("error removing finalizers from {name}: {e}"))?;
        }
        ctx.registry.invalidate(&uid);
        return Ok(Action::await_change());
    }

    let managed_secret_refs = collect_managed_secret_refs(&resource)?;
    let managed_config_map_refs = resource.spec.managed_kube_config_map_references.clone();
    if managed_secret_refs.is_empty() && managed_config_map_refs.is_empty() {
        return Err(anyhow!(
            "at least one managed reference must be set in managedKubeSecretReferences or managedKubeConfigMapReferences"
        )
        .into());
    }

    let mut conditions = current_conditions(&resource);

    match reconcile_managed_objects(
        &resource,
        &ctx,
        &uid,
        &managed_secret_refs,
        &managed_config_map_refs,
        &mut conditions,
    )
    .await
    {
        Ok(synced) => {
            metrics::set_secrets_synced(synced as i64);
            info!(
                resource = %name,
                synced,
                "successfully synced secrets, next reconciliation in {requeue:?}"
            );
        }
        Err(e) => {
            metrics::increment_reconciliation_errors(KIND);
            error!(resource = %name, "unable to reconcile: {e:#}");
            patch_conditions(&ctx, &namespace, &name, &conditions).await;
            return Ok(Action::requeue(requeue));
        }
    }

    match reconcile_auto_redeploy(&ctx, &managed_secret_refs).await {
        Ok(count) => set_condition(
            &mut conditions,
            CONDITION_AUTO_REDEPLOY_READY,
            true,
            "OK",
            format!("{count} deployments are subscribed to managed secret changes"),
        ),
        Err(e) => {
            warn!(resource = %name, "unable to reconcile auto redeployment: {e:#}");
            set_condition(
                &mut conditions,
                CONDITION_AUTO_REDEPLOY_READY,
                false,
                "Error",
                format!("Failed to propagate managed secret changes to deployments: {e}"),
            );
        }
    }

    patch_conditions(&ctx, &namespace, &name, &conditions).await;
    metrics::observe_reconcile_duration(KIND, start.elapsed().as_secs_f64());
    Ok(Action::requeue(requeue))
}

pub fn error_policy(resource: Arc<KMSSecret>, error: &ReconcilerError, _ctx: Arc<Context>) -> Action {
    metrics::increment_reconciliation_errors(KIND);
    error!(resource = %resource.name_any(), "reconciliation error: {error}");
    Action::requeue(DEFAULT_RESYNC)
}

/// Fold the deprecated single reference into the list, rejecting specs that
/// set both.
fn collect_managed_secret_refs(resource: &KMSSecret) -> Result<Vec<ManagedKubeSecretConfig>> {
    let mut references = resource.spec.managed_kube_secret_references.clone();

    if let Some(single) = &resource.spec.managed_secret_reference {
        if !references.is_empty() {
            return Err(anyhow!(
                "cannot have both managedSecretReference and managedKubeSecretReferences"
            ));
        }
        warn!(
            "the managedSecretReference field is deprecated, use managedKubeSecretReferences instead"
        );
        references.push(single.clone());
    }

    Ok(references)
}

async fn reconcile_managed_objects(
    resource: &KMSSecret,
    ctx: &Context,
    uid: &str,
    managed_secret_refs: &[ManagedKubeSecretConfig],
    managed_config_map_refs: &[ManagedKubeConfigMapConfig],
    conditions: &mut Vec<Condition>,
) -> Result<usize> {
    let client_config = config::resolve_client_config(
        &ctx.client,
        &resource.spec.host_api,
        &resource.spec.tls,
    )
    .await?;
    let session = ctx.registry.obtain(uid, client_config)?;

    let auth = match session.auth.clone() {
        Some(auth) => auth,
        None => {
            let cluster = KubeClusterSecrets::new(ctx.client.clone());
            match auth::resolve(&cluster, resource, session.client.as_ref()).await {
                Ok(details) => {
                    set_condition(
                        conditions,
                        CONDITION_LOADED_KMS_TOKEN,
                        true,
                        "OK",
                        format!("Authenticated with strategy {}", details.strategy),
                    );
                    ctx.registry.store_auth(uid, details.clone());
                    details
                }
                Err(e) => {
                    set_condition(
                        conditions,
                        CONDITION_LOADED_KMS_TOKEN,
                        false,
                        "Error",
                        "Failed to authenticate with the KMS API. Check the authentication block and operator logs",
                    );
                    ctx.registry.clear_auth(uid);
                    return Err(anyhow!("unable to authenticate: {e}"));
                }
            }
        }
    };

    let secrets = fetch_secrets(resource, session.client.as_ref(), &auth)
        .await
        .map_err(|e| {
            set_condition(
                conditions,
                CONDITION_READY_TO_SYNC_SECRETS,
                false,
                "Error",
                format!("Failed to fetch secrets: {e}"),
            );
            e
        })?;

    let etag = compute_etag(&secrets);
    let sources: BTreeMap<String, TemplateSource> = secrets
        .iter()
        .map(|secret| {
            (
                secret.key.clone(),
                TemplateSource {
                    value: secret.value.clone(),
                    secret_path: secret.path.clone(),
                },
            )
        })
        .collect();

    let mut failures = Vec::new();
    for reference in managed_secret_refs {
        if let Err(e) = sync_managed_secret(resource, ctx, reference, &sources, &etag).await {
            warn!(
                secret = %reference.secret_name,
                "failed to sync managed secret: {e:#}"
            );
            failures.push(format!("{}: {e}", reference.secret_name));
        }
    }
    for reference in managed_config_map_refs {
        if let Err(e) = sync_managed_config_map(resource, ctx, reference, &sources, &etag).await {
            warn!(
                config_map = %reference.config_map_name,
                "failed to sync managed config map: {e:#}"
            );
            failures.push(format!("{}: {e}", reference.config_map_name));
        }
    }

    if !failures.is_empty() {
        set_condition(
            conditions,
            CONDITION_READY_TO_SYNC_SECRETS,
            false,
            "Error",
            format!("Failed to sync managed objects: [{}]", failures.join(", ")),
        );
        return Err(anyhow!(
            "failed to sync managed objects: [{}]",
            failures.join(", ")
        ));
    }

    set_condition(
        conditions,
        CONDITION_READY_TO_SYNC_SECRETS,
        true,
        "OK",
        format!("Successfully synced {} secrets", secrets.len()),
    );

    Ok(secrets.len())
}

/// Fetch the secret set the way the resolved strategy dictates: legacy
/// strategies read under their own scope declarations, machine identities
/// under the resolved identity scope.
async fn fetch_secrets(
    resource: &KMSSecret,
    kms: &dyn KmsClient,
    auth: &crate::auth::AuthenticationDetails,
) -> Result<Vec<RemoteSecret>> {
    let request = match auth.strategy {
        AuthStrategy::ServiceToken => {
            let scope = resource
                .spec
                .authentication
                .service_token
                .as_ref()
                .map(|details| details.secrets_scope.clone())
                .unwrap_or_default();
            ListSecretsRequest {
                project_id: String::new(),
                environment: scope.env_slug,
                path: scope.secrets_path,
                recursive: scope.recursive,
                include_imports: false,
            }
        }
        AuthStrategy::ServiceAccount => {
            let details = resource
                .spec
                .authentication
                .service_account
                .clone()
                .unwrap_or_default();
            ListSecretsRequest {
                project_id: details.project_id,
                environment: details.environment_name,
                path: "/".to_string(),
                recursive: false,
                include_imports: false,
            }
        }
        _ => {
            let scope = &auth.machine_identity_scope;
            ListSecretsRequest {
                project_id: scope.project_slug.clone(),
                environment: scope.env_slug.clone(),
                path: scope.secrets_path.clone(),
                recursive: scope.recursive,
                include_imports: false,
            }
        }
    };

    kms.list_secrets(request)
        .await
        .context("unable to list secrets from the KMS")
}

/// Labels plus filtered annotations, with the version annotation applied.
fn managed_metadata(resource: &KMSSecret, etag: &str) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let labels = resource.labels().clone();
    let mut annotations = filter_system_annotations(resource.annotations());
    annotations.insert(SECRET_VERSION_ANNOTATION.to_string(), etag.to_string());
    (labels, annotations)
}

async fn sync_managed_secret(
    resource: &KMSSecret,
    ctx: &Context,
    reference: &ManagedKubeSecretConfig,
    sources: &BTreeMap<String, TemplateSource>,
    etag: &str,
) -> Result<()> {
    let payload = render_payload(reference.template.as_ref(), sources)?;
    let data: BTreeMap<String, ByteString> = payload
        .into_iter()
        .map(|(key, value)| (key, ByteString(value.into_bytes())))
        .collect();

    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &reference.secret_namespace);

    match api.get(&reference.secret_name).await {
        Ok(mut existing) => {
            existing.data = Some(data);
            existing
                .metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(SECRET_VERSION_ANNOTATION.to_string(), etag.to_string());
            existing.metadata.managed_fields = None;
            api.replace(&reference.secret_name, &PostParams::default(), &existing)
                .await
                .context("unable to update the managed Kubernetes secret")?;
            info!(secret = %reference.secret_name, "updated managed Kubernetes secret");
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            let (labels, annotations) = managed_metadata(resource, etag);
            let mut secret = Secret {
                metadata: kube::api::ObjectMeta {
                    name: Some(reference.secret_name.clone()),
                    namespace: Some(reference.secret_namespace.clone()),
                    labels: Some(labels),
                    annotations: Some(annotations),
                    ..Default::default()
                },
                data: Some(data),
                ..Default::default()
            };
            if !reference.secret_type.is_empty() {
                secret.type_ = Some(reference.secret_type.clone());
            }
            if reference.creation_policy == crate::constants::CREATION_POLICY_OWNER {
                let owner = resource
                    .controller_owner_ref(&())
                    .ok_or_else(|| anyhow!("resource has no metadata for an owner reference"))?;
                secret.metadata.owner_references = Some(vec![owner]);
            }
            api.create(&PostParams::default(), &secret)
                .await
                .context("unable to create the managed Kubernetes secret")?;
            info!(secret = %reference.secret_name, "created managed Kubernetes secret");
        }
        Err(e) => {
            return Err(anyhow!(
                "something went wrong when fetching the managed Kubernetes secret: {e}"
            ))
        }
    }

    Ok(())
}

async fn sync_managed_config_map(
    resource: &KMSSecret,
    ctx: &Context,
    reference: &ManagedKubeConfigMapConfig,
    sources: &BTreeMap<String, TemplateSource>,
    etag: &str,
) -> Result<()> {
    let payload = render_payload(reference.template.as_ref(), sources)?;

    let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &reference.config_map_namespace);

    match api.get(&reference.config_map_name).await {
        Ok(mut existing) => {
            existing.data = Some(payload);
            existing
                .metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(SECRET_VERSION_ANNOTATION.to_string(), etag.to_string());
            existing.metadata.managed_fields = None;
            api.replace(&reference.config_map_name, &PostParams::default(), &existing)
                .await
                .context("unable to update the managed Kubernetes config map")?;
            info!(config_map = %reference.config_map_name, "updated managed Kubernetes config map");
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            let (labels, annotations) = managed_metadata(resource, etag);
            let mut config_map = ConfigMap {
                metadata: kube::api::ObjectMeta {
                    name: Some(reference.config_map_name.clone()),
                    namespace: Some(reference.config_map_namespace.clone()),
                    labels: Some(labels),
                    annotations: Some(annotations),
                    ..Default::default()
                },
                data: Some(payload),
                ..Default::default()
            };
            if reference.creation_policy == crate::constants::CREATION_POLICY_OWNER {
                let owner = resource
                    .controller_owner_ref(&())
                    .ok_or_else(|| anyhow!("resource has no metadata for an owner reference"))?;
                config_map.metadata.owner_references = Some(vec![owner]);
            }
            api.create(&PostParams::default(), &config_map)
                .await
                .context("unable to create the managed Kubernetes config map")?;
            info!(config_map = %reference.config_map_name, "created managed Kubernetes config map");
        }
        Err(e) => {
            return Err(anyhow!(
                "something went wrong when fetching the managed Kubernetes config map: {e}"
            ))
        }
    }

    Ok(())
}

async fn reconcile_auto_redeploy(
    ctx: &Context,
    managed_secret_refs: &[ManagedKubeSecretConfig],
) -> Result<usize> {
    let mut count = 0;
    for reference in managed_secret_refs {
        count += rollout::reconcile_deployments(&ctx.client, reference).await?;
    }
    Ok(count)
}

fn current_conditions(resource: &KMSSecret) -> Vec<Condition> {
    resource
        .status
        .as_ref()
        .map(|status| status.conditions.clone())
        .unwrap_or_default()
}

/// Condition updates are best effort: failures are logged, never surfaced.
async fn patch_conditions(ctx: &Context, namespace: &str, name: &str, conditions: &[Condition]) {
    let api: Api<KMSSecret> = Api::namespaced(ctx.client.clone(), namespace);
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

    fn remote(key: &str, value: &str, path: &str) -> RemoteSecret {
        RemoteSecret {
            id: format!("id-{key}"),
            key: key.to_string(),
            value: value.to_string(),
            path: path.to_string(),
        }
    }

    #[test]
    fn etag_is_stable_across_order() {
        let a = vec![remote("FOO", "bar", "/"), remote("BAZ", "qux", "/")];
        let b = vec![remote("BAZ", "qux", "/"), remote("FOO", "bar", "/")];
        assert_eq!(compute_etag(&a), compute_etag(&b));
    }

    #[test]
    fn etag_changes_with_content() {
        let a = vec![remote("FOO", "bar", "/")];
        let b = vec![remote("FOO", "baz", "/")];
        let c = vec![remote("FOO", "bar", "/nested")];
        assert_ne!(compute_etag(&a), compute_etag(&b));
        assert_ne!(compute_etag(&a), compute_etag(&c));
    }

    #[test]
    fn etag_of_empty_set_is_stable() {
        assert_eq!(compute_etag(&[]), compute_etag(&[]));
    }
}
