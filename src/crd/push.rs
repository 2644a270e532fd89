//! The push resource: converges KMS contents toward a source cluster Secret
//! and generator-produced keys.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::authentication::{Authentication, SecretTemplate, TlsConfig};
use super::generator::GeneratorKind;
use super::status::Condition;

/// Where pushed secrets live in the KMS. Immutable for the lifetime of the
/// resource.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KMSPushSecretDestination {
    pub project_id: String,
    pub environment_slug: String,
    pub secrets_path: String,
}

/// The source cluster Secret whose keys are pushed.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PushSecretSource {
    pub secret_name: String,
    pub secret_namespace: String,
    #[serde(default)]
    pub template: Option<SecretTemplate>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorRef {
    pub kind: GeneratorKind,
    /// Name of the ClusterGenerator resource.
    pub name: String,
}

/// One generated key pushed alongside the source Secret.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PushSecretGenerator {
    pub destination_secret_name: String,
    pub generator_ref: GeneratorRef,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretPush {
    #[serde(default)]
    pub secret: Option<PushSecretSource>,
    #[serde(default)]
    pub generators: Vec<PushSecretGenerator>,
}

/// KMSPushSecret writes cluster-held values into the KMS and tracks which
/// remote secrets it owns.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "secrets.lux.network",
    version = "v1alpha1",
    kind = "KMSPushSecret",
    namespaced,
    status = "KMSPushSecretStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct KMSPushSecretSpec {
    /// `Replace` also overwrites remote values the operator does not own.
    #[serde(default)]
    pub update_policy: String,

    /// `Delete` removes owned remote secrets when the resource is deleted.
    #[serde(default)]
    pub deletion_policy: String,

    pub destination: KMSPushSecretDestination,

    #[serde(default)]
    pub authentication: Authentication,

    pub push: SecretPush,

    /// Duration string, e.g. "5m". When unset the resource only reconciles
    /// on spec changes.
    #[serde(default)]
    pub resync_interval: Option<String>,

    #[serde(default)]
    pub host_api: String,

    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KMSPushSecretStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Ownership map: remote secret id to the local key it was pushed under.
    /// The local key is the authoritative identity across remote renames.
    #[serde(default)]
    pub managed_secrets: Option<BTreeMap<String, String>>,
}
