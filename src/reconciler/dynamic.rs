//! Dynamic reconciler: keeps one short-lived credential lease alive per
//! resource and mirrors its payload into a managed Secret.
//!
//! Renewal fires inside a jittered window of 20–30% of the original lease
//! duration (with a 30-second floor); approaching the dynamic secret's max
//! TTL rotates to a fresh lease instead, since renewing past it is
//! impossible. An expired lease is always replaced outright.

use anyhow::{anyhow, Context as _, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::auth::{self, KubeClusterSecrets};
use crate::config;
use crate::constants::{
    CREATION_POLICY_OWNER, DYNAMIC_SECRET_FINALIZER, FIELD_MANAGER, REVOCATION_POLICY_REVOKE,
    SECRET_VERSION_ANNOTATION,
};
use crate::crd::status::{
    CONDITION_AUTHENTICATED, CONDITION_AUTO_REDEPLOY_READY, CONDITION_LEASE_CREATED,
    CONDITION_LEASE_RENEWAL, CONDITION_RECONCILE,
};
use crate::crd::{
    set_condition, Condition, KMSDynamicSecret, KMSDynamicSecretLease,
};
use crate::kms::{
    CreateLeaseRequest, DeleteLeaseRequest, KmsClient, KmsError, RenewLeaseRequest,
};
use crate::observability::metrics;
use crate::reconciler::{Context, ReconcilerError};
use crate::rollout;
use crate::util::parse_duration;

const KIND: &str = "dynamic";
const DEFAULT_REQUEUE: Duration = Duration::from_secs(5);
const MIN_REQUEUE: Duration = Duration::from_secs(5);
const MAX_REQUEUE: Duration = Duration::from_secs(300);
/// Renewal always fires inside this window before expiry, whatever the
/// jittered threshold says.
const RENEWAL_FLOOR: i64 = 30;

/// What the lifecycle requires for the current tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAction {
    /// Create a fresh lease (first lease, rotation at max TTL, or expiry).
    Create,
    /// Renew the live lease.
    Renew,
    /// Nothing to do; check again after the given interval.
    Sleep(Duration),
}

/// Decide what to do with a live lease at `now`.
///
/// `jitter_percent` must be in `[20, 30]`; callers draw it uniformly so
/// renewals of many resources spread out instead of thundering together.
pub fn plan_lease_action(
    lease: &KMSDynamicSecretLease,
    max_ttl: Option<Duration>,
    now: DateTime<Utc>,
    jitter_percent: i64,
) -> LeaseAction {
    let original_duration = lease.expires_at - lease.creation_timestamp;
    let renewal_threshold = original_duration * jitter_percent as i32 / 100;
    let time_until_expiration = lease.expires_at - now;

    // Renewing past the max TTL is impossible; rotate early once less than
    // 40% of the hard lifetime remains.
    if let Some(max_ttl) = max_ttl {
        let max_ttl = ChronoDuration::from_std(max_ttl).unwrap_or_else(|_| ChronoDuration::zero());
        let max_ttl_expiration = lease.creation_timestamp + max_ttl;
        let time_until_max_ttl = max_ttl_expiration - now;
        let max_ttl_threshold = max_ttl * 40 / 100;

        if time_until_max_ttl <= max_ttl_threshold || now > max_ttl_expiration {
            return LeaseAction::Create;
        }
    }

    if now > lease.expires_at {
        return LeaseAction::Create;
    }

    if time_until_expiration < renewal_threshold
        || time_until_expiration < ChronoDuration::seconds(RENEWAL_FLOOR)
    {
        return LeaseAction::Renew;
    }

    // Wake up around halfway to expiry, with a buffer so the renewal window
    // is not cut close, clamped to [5s, 5min].
    let next = (time_until_expiration / 2) * 8 / 10;
    let next = next
        .to_std()
        .unwrap_or(MIN_REQUEUE)
        .clamp(MIN_REQUEUE, MAX_REQUEUE);
    LeaseAction::Sleep(next)
}

pub async fn reconcile(
    resource: Arc<KMSDynamicSecret>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcilerError> {
    metrics::increment_reconciliations(KIND);

    let name = resource.name_any();
    let namespace = resource.namespace().unwrap_or_default();
    let uid = resource
        .uid()
        .ok_or_else(|| anyhow!("resource {name} has no UID"))?;
    let api: Api<KMSDynamicSecret> = Api::namespaced(ctx.client.clone(), &namespace);

    if resource.meta().deletion_timestamp.is_some() {
        handle_deletion(&resource, &ctx, &api, &name, &uid).await?;
        return Ok(Action::await_change());
    }

    if !resource
        .finalizers()
        .iter()
        .any(|f| f == DYNAMIC_SECRET_FINALIZER)
    {
        let mut finalizers = resource.finalizers().to_vec();
        finalizers.push(DYNAMIC_SECRET_FINALIZER.to_string());
        let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
        api.patch(&name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| anyhow!("unable to add finalizer to {name}: {e}"))?;
    }

    let mut conditions = current_conditions(&resource);
    let result = reconcile_lease(&resource, &ctx, &uid, &mut conditions).await;

    let requeue = match &result {
        Ok(requeue) => {
            set_condition(
                &mut conditions,
                CONDITION_RECONCILE,
                true,
                "OK",
                "Reconcile succeeded",
            );
            *requeue
        }
        Err(e) => {
            metrics::increment_reconciliation_errors(KIND);
            error!(resource = %name, "unable to reconcile: {e:#}");
            set_condition(
                &mut conditions,
                CONDITION_RECONCILE,
                false,
                "Error",
                format!("Reconcile failed. Error: {e}"),
            );
            DEFAULT_REQUEUE
        }
    };

    if result.is_ok() {
        match rollout::reconcile_deployments(&ctx.client, &resource.spec.managed_secret_reference)
            .await
        {
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
    }

    patch_conditions(&ctx, &namespace, &name, &conditions).await;
    info!(resource = %name, "next reconciliation in {requeue:?}");
    Ok(Action::requeue(requeue))
}

pub fn error_policy(
    resource: Arc<KMSDynamicSecret>,
    error: &ReconcilerError,
    _ctx: Arc<Context>,
) -> Action {
    metrics::increment_reconciliation_errors(KIND);
    error!(resource = %resource.name_any(), "reconciliation error: {error}");
    Action::requeue(DEFAULT_REQUEUE)
}

async fn reconcile_lease(
    resource: &KMSDynamicSecret,
    ctx: &Context,
    uid: &str,
    conditions: &mut Vec<Condition>,
) -> Result<Duration> {
    let kms = obtain_authenticated_session(resource, ctx, uid, conditions).await?;
    ensure_managed_secret(resource, ctx).await?;

    let Some(lease) = resource.status.as_ref().and_then(|s| s.lease.clone()) else {
        let result = create_lease(resource, ctx, kms.as_ref()).await;
        apply_lease_created_condition(conditions, &result);
        result?;
        return Ok(DEFAULT_REQUEUE);
    };

    let max_ttl = resource
        .status
        .as_ref()
        .filter(|status| !status.max_ttl.is_empty())
        .map(|status| parse_duration(&status.max_ttl))
        .transpose()
        .context("unable to parse max TTL duration")?;

    let jitter_percent = rand::thread_rng().gen_range(20..=30);
    match plan_lease_action(&lease, max_ttl, Utc::now(), jitter_percent) {
        LeaseAction::Create => {
            info!(
                lease_id = %lease.id,
                "lease expired or approaching max TTL, creating new lease"
            );
            let result = create_lease(resource, ctx, kms.as_ref()).await;
            apply_lease_created_condition(conditions, &result);
            result?;
            Ok(DEFAULT_REQUEUE)
        }
        LeaseAction::Renew => {
            info!(lease_id = %lease.id, "lease renewal needed");
            let result = renew_lease(resource, ctx, kms.as_ref(), &lease).await;
            apply_lease_renewal_condition(conditions, &result);
            match result {
                Ok(()) => Ok(DEFAULT_REQUEUE),
                Err(e) if is_invalid_lease(&e) => {
                    info!(lease_id = %lease.id, "lease is no longer valid, creating new lease");
                    let result = create_lease(resource, ctx, kms.as_ref()).await;
                    apply_lease_created_condition(conditions, &result);
                    result?;
                    Ok(DEFAULT_REQUEUE)
                }
                Err(e) => Err(e),
            }
        }
        LeaseAction::Sleep(next) => {
            info!(lease_id = %lease.id, "lease renewal not needed yet");
            Ok(next)
        }
    }
}

fn is_invalid_lease(error: &anyhow::Error) -> bool {
    matches!(error.downcast_ref::<KmsError>(), Some(KmsError::InvalidLease))
}

fn apply_lease_created_condition(conditions: &mut Vec<Condition>, result: &Result<()>) {
    match result {
        Ok(()) => set_condition(
            conditions,
            CONDITION_LEASE_CREATED,
            true,
            "OK",
            "Successfully created dynamic secret lease",
        ),
        Err(e) => set_condition(
            conditions,
            CONDITION_LEASE_CREATED,
            false,
            "Error",
            format!("Failed to create dynamic secret lease. Error: {e}"),
        ),
    }
}

fn apply_lease_renewal_condition(conditions: &mut Vec<Condition>, result: &Result<()>) {
    match result {
        Ok(()) => set_condition(
            conditions,
            CONDITION_LEASE_RENEWAL,
            true,
            "OK",
            "Successfully renewed dynamic secret lease",
        ),
        Err(e) => set_condition(
            conditions,
            CONDITION_LEASE_RENEWAL,
            false,
            "Error",
            format!("Failed to renew dynamic secret lease. Error: {e}"),
        ),
    }
}

async fn obtain_authenticated_session(
    resource: &KMSDynamicSecret,
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

/// Create the managed Secret when missing; an empty payload is fine until
/// lease data arrives.
async fn ensure_managed_secret(resource: &KMSDynamicSecret, ctx: &Context) -> Result<()> {
    let reference = &resource.spec.managed_secret_reference;
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &reference.secret_namespace);

    match api.get(&reference.secret_name).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => {
            let mut annotations =
                crate::util::filter_system_annotations(resource.annotations());
            let version = resource
                .status
                .as_ref()
                .and_then(|status| status.lease.as_ref())
                .map(|lease| format!("{}-{}", lease.id, lease.version))
                .unwrap_or_default();
            annotations.insert(SECRET_VERSION_ANNOTATION.to_string(), version);

            let mut secret = Secret {
                metadata: kube::api::ObjectMeta {
                    name: Some(reference.secret_name.clone()),
                    namespace: Some(reference.secret_namespace.clone()),
                    labels: Some(resource.labels().clone()),
                    annotations: Some(annotations),
                    ..Default::default()
                },
                ..Default::default()
            };
            if !reference.secret_type.is_empty() {
                secret.type_ = Some(reference.secret_type.clone());
            }
            if reference.creation_policy == CREATION_POLICY_OWNER {
                let owner = resource
                    .controller_owner_ref(&())
                    .ok_or_else(|| anyhow!("resource has no metadata for an owner reference"))?;
                secret.metadata.owner_references = Some(vec![owner]);
            }

            api.create(&PostParams::default(), &secret)
                .await
                .context("unable to create the managed Kubernetes secret")?;
            info!(secret = %reference.secret_name, "created managed Kubernetes secret");
            Ok(())
        }
        Err(e) => Err(anyhow!("unable to fetch destination secret: {e}")),
    }
}

async fn create_lease(
    resource: &KMSDynamicSecret,
    ctx: &Context,
    kms: &dyn KmsClient,
) -> Result<()> {
    let details = &resource.spec.dynamic_secret;
    let project_slug = kms
        .get_project_slug(&details.project_id)
        .await
        .context("unable to resolve project slug")?;

    let request = CreateLeaseRequest {
        dynamic_secret_name: details.secret_name.clone(),
        project_slug,
        environment_slug: details.environment_slug.clone(),
        secret_path: details.secrets_path.clone(),
        ttl: (!resource.spec.lease_ttl.is_empty()).then(|| resource.spec.lease_ttl.clone()),
    };

    let created = kms
        .create_lease(request)
        .await
        .context("unable to create lease")?;
    metrics::increment_lease_operation("create");

    let mut credentials = BTreeMap::new();
    for (key, value) in &created.data {
        let serde_json::Value::String(value) = value else {
            return Err(anyhow!("unable to convert value to string for key {key}"));
        };
        credentials.insert(key.clone(), value.clone());
    }

    let version_annotation = format!("{}-{}", created.lease.id, created.lease.version);
    write_managed_secret(resource, ctx, &credentials, &version_annotation).await?;

    let lease_status = KMSDynamicSecretLease {
        id: created.lease.id.clone(),
        version: created.lease.version,
        creation_timestamp: Utc::now(),
        expires_at: created.lease.expires_at,
    };
    patch_lease_status(
        resource,
        ctx,
        &lease_status,
        Some(&created.dynamic_secret.id),
        Some(&created.dynamic_secret.max_ttl),
    )
    .await?;

    info!(lease_id = %created.lease.id, "new lease successfully created");
    Ok(())
}

async fn renew_lease(
    resource: &KMSDynamicSecret,
    ctx: &Context,
    kms: &dyn KmsClient,
    lease: &KMSDynamicSecretLease,
) -> Result<()> {
    let details = &resource.spec.dynamic_secret;
    let project_slug = kms
        .get_project_slug(&details.project_id)
        .await
        .context("unable to resolve project slug")?;

    let request = RenewLeaseRequest {
        lease_id: lease.id.clone(),
        project_slug,
        environment_slug: details.environment_slug.clone(),
        secret_path: details.secrets_path.clone(),
        ttl: (!resource.spec.lease_ttl.is_empty()).then(|| resource.spec.lease_ttl.clone()),
    };

    let renewed = match kms.renew_lease(request).await {
        Ok(renewed) => renewed,
        Err(KmsError::InvalidLease) => return Err(KmsError::InvalidLease.into()),
        Err(e) => return Err(anyhow!("unable to renew lease: {e}")),
    };
    metrics::increment_lease_operation("renew");

    let mut updated = lease.clone();
    updated.expires_at = renewed.expires_at;
    patch_lease_status(resource, ctx, &updated, None, None).await?;

    info!(lease_id = %renewed.id, "lease successfully renewed");
    Ok(())
}

/// Revocation on deletion. The caller has already cleared the finalizer, so
/// a failing KMS cannot wedge the deletion; everything here is best effort.
async fn handle_deletion(
    resource: &KMSDynamicSecret,
    ctx: &Context,
    api: &Api<KMSDynamicSecret>,
    name: &str,
    uid: &str,
) -> Result<()> {
    if !resource.finalizers().is_empty() {
        let patch = serde_json::json!({"metadata": {"finalizers": []}});
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| anyhow!("error removing finalizers from {name}: {e}"))?;
    }

    if resource.spec.lease_revocation_policy == REVOCATION_POLICY_REVOKE {
        if let Err(e) = revoke_lease(resource, ctx, uid).await {
            warn!(resource = %name, "unable to revoke lease: {e:#}");
        }
    }

    ctx.registry.invalidate(uid);
    Ok(())
}

async fn revoke_lease(resource: &KMSDynamicSecret, ctx: &Context, uid: &str) -> Result<()> {
    let Some(lease) = resource.status.as_ref().and_then(|s| s.lease.clone()) else {
        return Ok(());
    };

    let kms = obtain_authenticated_session(resource, ctx, uid, &mut Vec::new()).await?;

    let details = &resource.spec.dynamic_secret;
    let project_slug = kms
        .get_project_slug(&details.project_id)
        .await
        .context("unable to resolve project slug")?;

    if let Err(e) = kms
        .delete_lease(DeleteLeaseRequest {
            lease_id: lease.id.clone(),
            project_slug,
            environment_slug: details.environment_slug.clone(),
            secret_path: details.secrets_path.clone(),
        })
        .await
    {
        warn!(lease_id = %lease.id, "unable to delete lease at the KMS: {e}");
    } else {
        metrics::increment_lease_operation("revoke");
    }

    // Blank out the mirrored credentials regardless of the KMS outcome.
    let reference = &resource.spec.managed_secret_reference;
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &reference.secret_namespace);
    match secrets.get(&reference.secret_name).await {
        Ok(mut destination) => {
            destination.data = Some(BTreeMap::new());
            destination.string_data = None;
            destination.metadata.managed_fields = None;
            secrets
                .replace(&reference.secret_name, &PostParams::default(), &destination)
                .await
                .context("unable to update destination secret")?;
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {}
        Err(e) => return Err(anyhow!("unable to fetch destination secret: {e}")),
    }

    info!(lease_id = %lease.id, "lease successfully revoked");
    Ok(())
}

async fn write_managed_secret(
    resource: &KMSDynamicSecret,
    ctx: &Context,
    credentials: &BTreeMap<String, String>,
    version_annotation: &str,
) -> Result<()> {
    let reference = &resource.spec.managed_secret_reference;
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &reference.secret_namespace);

    let patch = serde_json::json!({
        "metadata": {
            "annotations": { SECRET_VERSION_ANNOTATION: version_annotation }
        },
        "stringData": credentials,
    });
    api.patch(
        &reference.secret_name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(patch),
    )
    .await
    .context("unable to update destination secret")?;
    Ok(())
}

async fn patch_lease_status(
    resource: &KMSDynamicSecret,
    ctx: &Context,
    lease: &KMSDynamicSecretLease,
    dynamic_secret_id: Option<&str>,
    max_ttl: Option<&str>,
) -> Result<()> {
    let namespace = resource.namespace().unwrap_or_default();
    let api: Api<KMSDynamicSecret> = Api::namespaced(ctx.client.clone(), &namespace);

    let mut status = serde_json::json!({"lease": lease});
    if let Some(id) = dynamic_secret_id {
        status["dynamicSecretId"] = serde_json::json!(id);
    }
    if let Some(max_ttl) = max_ttl {
        status["maxTTL"] = serde_json::json!(max_ttl);
    }

    api.patch_status(
        &resource.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(serde_json::json!({"status": status})),
    )
    .await
    .context("unable to update lease status")?;
    Ok(())
}

fn current_conditions(resource: &KMSDynamicSecret) -> Vec<Condition> {
    resource
        .status
        .as_ref()
        .map(|status| status.conditions.clone())
        .unwrap_or_default()
}

/// Condition updates are best effort: failures are logged, never surfaced.
async fn patch_conditions(ctx: &Context, namespace: &str, name: &str, conditions: &[Condition]) {
    let api: Api<KMSDynamicSecret> = Api::namespaced(ctx.client.clone(), namespace);
    let patch = serde_json::json!({"status": {"conditions": conditions}});
    if let Err(e) = api
        .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
        .await
    {
        warn!(resource = %name, "unable to update status conditions: {e}");
    }
}
