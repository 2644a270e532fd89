//! Authentication blocks and managed-object references shared by the three
//! custom resource kinds.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reference to a Kubernetes Secret by name and namespace.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeSecretReference {
    #[serde(default)]
    pub secret_name: String,
    #[serde(default)]
    pub secret_namespace: String,
}

/// Reference to a single key of a Kubernetes Secret.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeSecretKeyReference {
    #[serde(default)]
    pub secret_name: String,
    #[serde(default)]
    pub secret_namespace: String,
    #[serde(default)]
    pub secret_key: String,
}

/// TLS settings for talking to the KMS endpoint.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// Secret key holding a PEM CA bundle for a self-hosted KMS.
    #[serde(default)]
    pub ca_ref: KubeSecretKeyReference,
}

/// Scope selecting which secrets a machine identity reads.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineIdentityScope {
    #[serde(default)]
    pub project_slug: String,
    #[serde(default)]
    pub env_slug: String,
    #[serde(default)]
    pub secrets_path: String,
    #[serde(default)]
    pub recursive: bool,
}

/// Legacy service-token authentication.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTokenDetails {
    #[serde(default)]
    pub service_token_secret_reference: KubeSecretReference,
    #[serde(default)]
    pub secrets_scope: MachineIdentityScope,
}

/// Legacy service-account authentication.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountDetails {
    #[serde(default)]
    pub service_account_secret_reference: KubeSecretReference,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub environment_name: String,
}

/// Universal machine identity: client id/secret held in a cluster Secret.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UniversalAuthDetails {
    #[serde(default)]
    pub credentials_ref: KubeSecretReference,
    #[serde(default)]
    pub secrets_scope: MachineIdentityScope,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesServiceAccountRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

/// Kubernetes-native machine identity: a service account token is exchanged
/// for a KMS access token.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesAuthDetails {
    #[serde(default)]
    pub identity_id: String,
    #[serde(default)]
    pub service_account_ref: KubernetesServiceAccountRef,
    /// Mint a short-lived token through the TokenRequest API instead of
    /// reading the service account's linked Secret.
    #[serde(default)]
    pub auto_create_service_account_token: bool,
    /// Audiences for the minted token. When empty the TokenRequest default
    /// audience applies.
    #[serde(default)]
    pub service_account_token_audiences: Vec<String>,
    #[serde(default)]
    pub secrets_scope: MachineIdentityScope,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AwsIamAuthDetails {
    #[serde(default)]
    pub identity_id: String,
    #[serde(default)]
    pub secrets_scope: MachineIdentityScope,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AzureAuthDetails {
    #[serde(default)]
    pub identity_id: String,
    /// Azure resource URL; the KMS defaults it when empty.
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub secrets_scope: MachineIdentityScope,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcpIdTokenAuthDetails {
    #[serde(default)]
    pub identity_id: String,
    #[serde(default)]
    pub secrets_scope: MachineIdentityScope,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcpIamAuthDetails {
    #[serde(default)]
    pub identity_id: String,
    #[serde(default)]
    pub service_account_key_file_path: String,
    #[serde(default)]
    pub secrets_scope: MachineIdentityScope,
}

/// Union of the supported authentication methods. At most one is expected to
/// carry input data; the resolver probes them in a fixed order.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Authentication {
    #[serde(default)]
    pub service_token: Option<ServiceTokenDetails>,
    #[serde(default)]
    pub service_account: Option<ServiceAccountDetails>,
    #[serde(default)]
    pub universal_auth: Option<UniversalAuthDetails>,
    #[serde(default)]
    pub kubernetes_auth: Option<KubernetesAuthDetails>,
    #[serde(default)]
    pub aws_iam_auth: Option<AwsIamAuthDetails>,
    #[serde(default)]
    pub azure_auth: Option<AzureAuthDetails>,
    #[serde(default)]
    pub gcp_id_token_auth: Option<GcpIdTokenAuthDetails>,
    #[serde(default)]
    pub gcp_iam_auth: Option<GcpIamAuthDetails>,
}

/// Template applied when building a managed object's payload.
///
/// Declared keys are rendered against the fetched secret map; when
/// `includeAllSecrets` is set the verbatim key/value set is included as well.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretTemplate {
    #[serde(default)]
    pub include_all_secrets: bool,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// A managed Kubernetes Secret written by the pull or dynamic reconciler.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedKubeSecretConfig {
    pub secret_name: String,
    pub secret_namespace: String,
    /// Kubernetes Secret type, e.g. `Opaque`.
    #[serde(default)]
    pub secret_type: String,
    /// `Owner` installs an owner reference so the managed object is garbage
    /// collected with the resource; `Orphan` leaves it behind.
    #[serde(default)]
    pub creation_policy: String,
    #[serde(default)]
    pub template: Option<SecretTemplate>,
}

/// A managed Kubernetes ConfigMap written by the pull reconciler.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedKubeConfigMapConfig {
    pub config_map_name: String,
    pub config_map_namespace: String,
    #[serde(default)]
    pub creation_policy: String,
    #[serde(default)]
    pub template: Option<SecretTemplate>,
}
