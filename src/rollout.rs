//! Rollout propagation: after a managed Secret changes, restart the
//! Deployments that subscribed to it.
//!
//! A Deployment subscribes with the auto-reload annotation and must actually
//! reference the managed Secret (env, envFrom or volume). The restart is
//! triggered by bumping a pod-template annotation to the secret's current
//! version; Deployments already carrying that version are left alone.

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client};
use tracing::info;

use crate::constants::{
    AUTO_RELOAD_ANNOTATION, DEPLOYMENT_SECRET_VERSION_ANNOTATION_PREFIX, FIELD_MANAGER,
    SECRET_VERSION_ANNOTATION,
};
use crate::crd::ManagedKubeSecretConfig;

/// Restart subscribed Deployments for one managed Secret. Returns the number
/// of subscribed Deployments found.
pub async fn reconcile_deployments(
    client: &Client,
    managed: &ManagedKubeSecretConfig,
) -> Result<usize> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &managed.secret_namespace);
    let secret = secrets
        .get(&managed.secret_name)
        .await
        .with_context(|| format!("managed secret {} not found", managed.secret_name))?;

    let version = secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(SECRET_VERSION_ANNOTATION))
        .cloned()
        .unwrap_or_default();

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &managed.secret_namespace);
    let listed = deployments
        .list(&ListParams::default())
        .await
        .context("unable to list deployments for auto redeploy")?;

    let version_annotation = format!(
        "{DEPLOYMENT_SECRET_VERSION_ANNOTATION_PREFIX}{}",
        managed.secret_name
    );

    let mut subscribed = 0usize;
    for deployment in listed {
        if !is_subscribed(&deployment) || !references_secret(&deployment, &managed.secret_name) {
            continue;
        }
        subscribed += 1;

        let current = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.template.metadata.as_ref())
            .and_then(|meta| meta.annotations.as_ref())
            .and_then(|annotations| annotations.get(&version_annotation));

        if current == Some(&version) {
            continue;
        }

        let name = deployment.metadata.name.clone().unwrap_or_default();
        let patch = serde_json::json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": { &version_annotation: version.as_str() }
                    }
                }
            }
        });

        deployments
            .patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await
            .with_context(|| format!("unable to trigger redeploy of deployment {name}"))?;

        info!(
            deployment = %name,
            secret = %managed.secret_name,
            "triggered rollout for managed secret change"
        );
    }

    Ok(subscribed)
}

fn is_subscribed(deployment: &Deployment) -> bool {
    deployment
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(AUTO_RELOAD_ANNOTATION))
        .map(|value| value == "true")
        .unwrap_or(false)
}

/// True when any container env, envFrom or pod volume references the Secret.
pub fn references_secret(deployment: &Deployment, secret_name: &str) -> bool {
    let Some(pod_spec) = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
    else {
        return false;
    };

    let container_references = pod_spec.containers.iter().any(|container| {
        let env_hit = container
            .env
            .as_ref()
            .map(|envs| {
                envs.iter().any(|env| {
                    env.value_from
                        .as_ref()
                        .and_then(|source| source.secret_key_ref.as_ref())
                        .map(|reference| reference.name == secret_name)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false);

        let env_from_hit = container
            .env_from
            .as_ref()
            .map(|sources| {
                sources.iter().any(|source| {
                    source
                        .secret_ref
                        .as_ref()
                        .map(|reference| reference.name == secret_name)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false);

        env_hit || env_from_hit
    });

    let volume_references = pod_spec
        .volumes
        .as_ref()
        .map(|volumes| {
            volumes.iter().any(|volume| {
                volume
                    .secret
                    .as_ref()
                    .and_then(|source| source.secret_name.as_ref())
                    .map(|name| name == secret_name)
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false);

    container_references || volume_references
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{
        Container, EnvFromSource, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec,
        SecretEnvSource, SecretKeySelector, SecretVolumeSource, Volume,
    };

    fn deployment_with_pod_spec(pod_spec: PodSpec) -> Deployment {
        Deployment {
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(pod_spec),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn detects_env_value_from_reference() {
        let deployment = deployment_with_pod_spec(PodSpec {
            containers: vec![Container {
                env: Some(vec![EnvVar {
                    name: "TOKEN".into(),
                    value_from: Some(EnvVarSource {
                        secret_key_ref: Some(SecretKeySelector {
                            name: "managed".into(),
                            key: "token".into(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        });

        assert!(references_secret(&deployment, "managed"));
        assert!(!references_secret(&deployment, "other"));
    }

    #[test]
    fn detects_env_from_reference() {
        let deployment = deployment_with_pod_spec(PodSpec {
            containers: vec![Container {
                env_from: Some(vec![EnvFromSource {
                    secret_ref: Some(SecretEnvSource {
                        name: "managed".into(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        });

        assert!(references_secret(&deployment, "managed"));
    }

    #[test]
    fn detects_volume_reference() {
        let deployment = deployment_with_pod_spec(PodSpec {
            containers: vec![Container::default()],
            volumes: Some(vec![Volume {
                secret: Some(SecretVolumeSource {
                    secret_name: Some("managed".into()),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });

        assert!(references_secret(&deployment, "managed"));
    }

    #[test]
    fn unrelated_deployment_does_not_match() {
        let deployment = deployment_with_pod_spec(PodSpec {
            containers: vec![Container::default()],
            ..Default::default()
        });
        assert!(!references_secret(&deployment, "managed"));
    }
}
