//! The dynamic-lease resource: obtains short-lived credentials from the KMS
//! and keeps them renewed in a managed Secret.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::authentication::{Authentication, ManagedKubeSecretConfig, TlsConfig};
use super::status::Condition;

/// Identifies the dynamic secret a lease is created for. Immutable.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DynamicSecretDetails {
    pub secret_name: String,
    pub secrets_path: String,
    pub environment_slug: String,
    pub project_id: String,
}

/// The live lease tracked in status. `expiresAt` only advances for a given
/// lease id; a new id restarts the clock.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KMSDynamicSecretLease {
    pub id: String,
    pub version: i64,
    pub creation_timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// KMSDynamicSecret keeps one lease alive and mirrors its credentials into a
/// managed Secret.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "secrets.lux.network",
    version = "v1alpha1",
    kind = "KMSDynamicSecret",
    namespaced,
    status = "KMSDynamicSecretStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct KMSDynamicSecretSpec {
    /// Destination Secret the lease credentials are written to.
    pub managed_secret_reference: ManagedKubeSecretConfig,

    #[serde(default)]
    pub authentication: Authentication,

    pub dynamic_secret: DynamicSecretDetails,

    /// `Revoke` deletes the live lease at the KMS when the resource is
    /// deleted.
    #[serde(default)]
    pub lease_revocation_policy: String,

    /// Requested lease TTL as a duration string; the dynamic secret's default
    /// applies when unset.
    #[serde(default)]
    pub lease_ttl: String,

    #[serde(default)]
    pub host_api: String,

    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KMSDynamicSecretStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub lease: Option<KMSDynamicSecretLease>,

    #[serde(default)]
    pub dynamic_secret_id: String,

    /// Hard lifetime across renewals, as reported by the KMS. Empty means the
    /// lease can be renewed indefinitely.
    #[serde(default)]
    pub max_ttl: String,
}
