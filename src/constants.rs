//! Shared constants: annotation keys, finalizer names, well-known secret data
//! keys and operator configuration defaults.

/// Data keys recognized in referenced Kubernetes Secrets.
pub const SERVICE_ACCOUNT_ACCESS_KEY: &str = "serviceAccountAccessKey";
pub const SERVICE_ACCOUNT_PUBLIC_KEY: &str = "serviceAccountPublicKey";
pub const SERVICE_ACCOUNT_PRIVATE_KEY: &str = "serviceAccountPrivateKey";
pub const MACHINE_IDENTITY_CLIENT_ID: &str = "clientId";
pub const MACHINE_IDENTITY_CLIENT_SECRET: &str = "clientSecret";
pub const KMS_TOKEN_SECRET_KEY: &str = "kmsToken";

/// Annotation carrying the content version of a managed object. Holds the
/// content digest for pulled secrets and `{leaseId}-{version}` for leases.
pub const SECRET_VERSION_ANNOTATION: &str = "secrets.lux.network/version";

/// Deployments opt into restarts on managed-secret changes with this
/// annotation set to `"true"`.
pub const AUTO_RELOAD_ANNOTATION: &str = "secrets.lux.network/auto-reload";

/// Pod-template annotation prefix used to force a rollout; the managed secret
/// name is appended.
pub const DEPLOYMENT_SECRET_VERSION_ANNOTATION_PREFIX: &str =
    "secrets.lux.network/managed-secret-version-";

/// Annotations with these prefixes are never copied onto managed objects.
pub const SYSTEM_ANNOTATION_PREFIXES: [&str; 4] = [
    "kubectl.kubernetes.io/",
    "kubernetes.io/",
    "k8s.io/",
    "helm.sh/",
];

pub const PUSH_SECRET_FINALIZER: &str = "pushsecret.secrets.lux.network/finalizer";
pub const DYNAMIC_SECRET_FINALIZER: &str = "dynamicsecret.secrets.lux.network/finalizer";

/// Operator-level configuration ConfigMap.
pub const OPERATOR_CONFIGMAP_NAME: &str = "kms-config";
pub const OPERATOR_CONFIGMAP_NAMESPACE: &str = "kms-operator-system";
pub const OPERATOR_CONFIGMAP_HOST_KEY: &str = "hostAPI";

/// Endpoint used when neither the resource nor the operator ConfigMap sets one.
pub const DEFAULT_KMS_HOST: &str = "https://kms.lux.network/api";

pub const USER_AGENT: &str = concat!("kms-operator/", env!("CARGO_PKG_VERSION"));
pub const FIELD_MANAGER: &str = "kms-operator";

/// Spec policy values.
pub const UPDATE_POLICY_REPLACE: &str = "Replace";
pub const DELETION_POLICY_DELETE: &str = "Delete";
pub const REVOCATION_POLICY_REVOKE: &str = "Revoke";
pub const CREATION_POLICY_OWNER: &str = "Owner";
