//! The pull resource: materializes KMS secrets into managed cluster
//! Secrets and ConfigMaps.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::authentication::{
    Authentication, KubeSecretReference, ManagedKubeConfigMapConfig, ManagedKubeSecretConfig,
    TlsConfig,
};
use super::status::Condition;

/// KMSSecret pulls secrets from the KMS into one or more managed cluster
/// objects.
///
/// ```yaml
/// apiVersion: secrets.lux.network/v1alpha1
/// kind: KMSSecret
/// metadata:
///   name: backend-secrets
///   namespace: default
/// spec:
///   authentication:
///     universalAuth:
///       credentialsRef:
///         secretName: machine-identity-creds
///         secretNamespace: default
///       secretsScope:
///         projectSlug: backend
///         envSlug: prod
///         secretsPath: /
///   managedKubeSecretReferences:
///     - secretName: backend-managed
///       secretNamespace: default
///       creationPolicy: Owner
/// ```
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "secrets.lux.network",
    version = "v1alpha1",
    kind = "KMSSecret",
    namespaced,
    status = "KMSSecretStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct KMSSecretSpec {
    #[serde(default)]
    pub authentication: Authentication,

    /// Deprecated single managed secret; folded into
    /// `managedKubeSecretReferences` during reconciliation.
    #[serde(default)]
    pub managed_secret_reference: Option<ManagedKubeSecretConfig>,

    #[serde(default)]
    pub managed_kube_secret_references: Vec<ManagedKubeSecretConfig>,

    #[serde(default)]
    pub managed_kube_config_map_references: Vec<ManagedKubeConfigMapConfig>,

    /// Deprecated service-token reference kept for resources created before
    /// the authentication block existed.
    #[serde(default)]
    pub token_secret_reference: Option<KubeSecretReference>,

    /// Resync interval in seconds; defaults to one minute.
    #[serde(default)]
    pub resync_interval: i64,

    /// KMS host override for this resource.
    #[serde(default)]
    pub host_api: String,

    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KMSSecretStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
