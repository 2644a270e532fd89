//! Authentication resolution.
//!
//! Given a resource and an unauthenticated KMS client, pick the one strategy
//! whose inputs are present, log in, and report which strategy succeeded. Two
//! legacy strategies (service token, service account) are probed first for
//! the pull kind only; machine-identity strategies follow in a fixed order so
//! resolution is deterministic.

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::api::PostParams;
use kube::Api;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::constants;
use crate::crd::{
    Authentication, KMSDynamicSecret, KMSPushSecret, KMSSecret, KubeSecretReference,
    MachineIdentityScope,
};
use crate::kms::KmsClient;

/// Lifetime of tokens minted through the TokenRequest API. They only need to
/// survive the initial login exchange.
const SERVICE_ACCOUNT_TOKEN_LIFETIME_SECONDS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Pull,
    Push,
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStrategy {
    ServiceToken,
    ServiceAccount,
    Universal,
    Kubernetes,
    AwsIam,
    Azure,
    GcpIdToken,
    GcpIam,
}

impl fmt::Display for AuthStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthStrategy::ServiceToken => "SERVICE_TOKEN",
            AuthStrategy::ServiceAccount => "SERVICE_ACCOUNT",
            AuthStrategy::Universal => "UNIVERSAL_MACHINE_IDENTITY",
            AuthStrategy::Kubernetes => "KUBERNETES_MACHINE_IDENTITY",
            AuthStrategy::AwsIam => "AWS_IAM_MACHINE_IDENTITY",
            AuthStrategy::Azure => "AZURE_MACHINE_IDENTITY",
            AuthStrategy::GcpIdToken => "GCP_ID_TOKEN_MACHINE_IDENTITY",
            AuthStrategy::GcpIam => "GCP_IAM_MACHINE_IDENTITY",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful resolution, cached per resource UID until the spec
/// generation changes.
#[derive(Debug, Clone)]
pub struct AuthenticationDetails {
    pub strategy: AuthStrategy,
    pub machine_identity_scope: MachineIdentityScope,
    pub is_machine_identity: bool,
    pub resource_kind: ResourceKind,
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// Sentinel: the strategy's inputs are absent; try the next one.
    #[error("authentication not applicable")]
    NotApplicable,

    /// No strategy had input data.
    #[error("no authentication method provided")]
    NoAuthMethod,

    /// A strategy had inputs but logging in (or gathering credentials)
    /// failed.
    #[error("authentication failed for strategy [{strategy}]: {source}")]
    Strategy {
        strategy: AuthStrategy,
        #[source]
        source: anyhow::Error,
    },
}

/// Capability interface over the three resource kinds: everything the
/// resolver needs without knowing the concrete CRD type.
pub trait AuthenticatableResource: Send + Sync {
    fn kind(&self) -> ResourceKind;
    fn authentication(&self) -> &Authentication;

    /// Pre-authentication-block service token reference, pull only.
    fn legacy_token_secret_ref(&self) -> Option<&KubeSecretReference> {
        None
    }
}

impl AuthenticatableResource for KMSSecret {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Pull
    }

    fn authentication(&self) -> &Authentication {
        &self.spec.authentication
    }

    fn legacy_token_secret_ref(&self) -> Option<&KubeSecretReference> {
        self.spec.token_secret_reference.as_ref()
    }
}

impl AuthenticatableResource for KMSPushSecret {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Push
    }

    fn authentication(&self) -> &Authentication {
        &self.spec.authentication
    }
}

impl AuthenticatableResource for KMSDynamicSecret {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Dynamic
    }

    fn authentication(&self) -> &Authentication {
        &self.spec.authentication
    }
}

/// Cluster reads the resolver performs, behind a trait so the resolution
/// logic is testable without a live apiserver.
#[async_trait]
pub trait ClusterSecrets: Send + Sync {
    /// Fetch a Secret's data; `Ok(None)` when it does not exist.
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<Option<BTreeMap<String, Vec<u8>>>>;

    /// Mint a short-lived service account token through the TokenRequest API.
    async fn create_service_account_token(
        &self,
        namespace: &str,
        name: &str,
        audiences: &[String],
    ) -> anyhow::Result<String>;

    /// Read the token of the first Secret linked to a service account
    /// (legacy token Secrets).
    async fn service_account_linked_token(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<String>;
}

/// [`ClusterSecrets`] backed by the cluster API.
pub struct KubeClusterSecrets {
    client: kube::Client,
}

impl KubeClusterSecrets {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterSecrets for KubeClusterSecrets {
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<Option<BTreeMap<String, Vec<u8>>>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match secrets.get(name).await {
            Ok(secret) => Ok(Some(
                secret
                    .data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| (k, v.0))
                    .collect(),
            )),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_service_account_token(
        &self,
        namespace: &str,
        name: &str,
        audiences: &[String],
    ) -> anyhow::Result<String> {
        let service_accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let token_request = TokenRequest {
            spec: TokenRequestSpec {
                audiences: audiences.to_vec(),
                expiration_seconds: Some(SERVICE_ACCOUNT_TOKEN_LIFETIME_SECONDS),
                ..Default::default()
            },
            ..Default::default()
        };

        let response = service_accounts
            .create_token_request(name, &PostParams::default(), &token_request)
            .await?;

        response
            .status
            .map(|status| status.token)
            .ok_or_else(|| anyhow::anyhow!("token request for {namespace}/{name} returned no status"))
    }

    async fn service_account_linked_token(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<String> {
        let service_accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let service_account = service_accounts.get(name).await?;

        let secret_name = service_account
            .secrets
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|reference| reference.name)
            .ok_or_else(|| anyhow::anyhow!("no secrets found for service account {name}"))?;

        let data = self
            .get_secret(namespace, &secret_name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("linked secret {secret_name} not found"))?;

        let token = data
            .get("token")
            .ok_or_else(|| anyhow::anyhow!("linked secret {secret_name} has no token key"))?;

        Ok(String::from_utf8_lossy(token).into_owned())
    }
}

/// Authenticate `kms` for `resource` and report the strategy that succeeded.
///
/// The resource is never mutated. Strategies signal "not my inputs" with
/// [`AuthError::NotApplicable`]; any other failure aborts resolution.
pub async fn resolve(
    cluster: &dyn ClusterSecrets,
    resource: &dyn AuthenticatableResource,
    kms: &dyn KmsClient,
) -> Result<AuthenticationDetails, AuthError> {
    if resource.kind() == ResourceKind::Pull {
        if let Some(details) = try_legacy_service_token(cluster, resource, kms).await? {
            return Ok(details);
        }
        if let Some(details) = try_legacy_service_account(cluster, resource, kms).await? {
            return Ok(details);
        }
    }

    const ORDERED_STRATEGIES: [AuthStrategy; 6] = [
        AuthStrategy::Universal,
        AuthStrategy::Kubernetes,
        AuthStrategy::AwsIam,
        AuthStrategy::Azure,
        AuthStrategy::GcpIdToken,
        AuthStrategy::GcpIam,
    ];

    for strategy in ORDERED_STRATEGIES {
        match try_machine_identity(strategy, cluster, resource, kms).await {
            Ok(details) => return Ok(details),
            Err(AuthError::NotApplicable) => continue,
            Err(other) => return Err(other),
        }
    }

    Err(AuthError::NoAuthMethod)
}

fn strategy_failure(strategy: AuthStrategy, source: anyhow::Error) -> AuthError {
    AuthError::Strategy { strategy, source }
}

/// Legacy service token: a referenced Secret holds a raw bearer token. A
/// missing Secret skips the strategy silently.
async fn try_legacy_service_token(
    cluster: &dyn ClusterSecrets,
    resource: &dyn AuthenticatableResource,
    kms: &dyn KmsClient,
) -> Result<Option<AuthenticationDetails>, AuthError> {
    let auth = resource.authentication();
    let service_token = auth.service_token.clone().unwrap_or_default();

    let mut reference = service_token.service_token_secret_reference.clone();
    if let Some(legacy) = resource.legacy_token_secret_ref() {
        if reference.secret_name.is_empty() {
            reference.secret_name = legacy.secret_name.clone();
        }
        if reference.secret_namespace.is_empty() {
            reference.secret_namespace = legacy.secret_namespace.clone();
        }
    }

    if reference.secret_name.is_empty() {
        return Ok(None);
    }

    let data = cluster
        .get_secret(&reference.secret_namespace, &reference.secret_name)
        .await
        .map_err(|e| strategy_failure(AuthStrategy::ServiceToken, e))?;

    let Some(data) = data else {
        return Ok(None);
    };

    let Some(token) = data.get(constants::KMS_TOKEN_SECRET_KEY) else {
        return Ok(None);
    };

    let token = String::from_utf8_lossy(token).replace(' ', "");
    if token.is_empty() {
        return Ok(None);
    }

    kms.set_access_token(token);

    Ok(Some(AuthenticationDetails {
        strategy: AuthStrategy::ServiceToken,
        machine_identity_scope: service_token.secrets_scope,
        is_machine_identity: false,
        resource_kind: resource.kind(),
    }))
}

/// Legacy service account: a referenced Secret holds an access/public/private
/// key triple. A missing Secret or an incomplete triple skips the strategy.
async fn try_legacy_service_account(
    cluster: &dyn ClusterSecrets,
    resource: &dyn AuthenticatableResource,
    kms: &dyn KmsClient,
) -> Result<Option<AuthenticationDetails>, AuthError> {
    let Some(service_account) = resource.authentication().service_account.clone() else {
        return Ok(None);
    };

    let reference = &service_account.service_account_secret_reference;
    if reference.secret_name.is_empty() {
        return Ok(None);
    }

    let data = cluster
        .get_secret(&reference.secret_namespace, &reference.secret_name)
        .await
        .map_err(|e| strategy_failure(AuthStrategy::ServiceAccount, e))?;

    let Some(data) = data else {
        return Ok(None);
    };

    let access_key = data.get(constants::SERVICE_ACCOUNT_ACCESS_KEY);
    let public_key = data.get(constants::SERVICE_ACCOUNT_PUBLIC_KEY);
    let private_key = data.get(constants::SERVICE_ACCOUNT_PRIVATE_KEY);

    let (Some(access_key), Some(public_key), Some(private_key)) =
        (access_key, public_key, private_key)
    else {
        return Ok(None);
    };
    if access_key.is_empty() && public_key.is_empty() && private_key.is_empty() {
        return Ok(None);
    }

    kms.set_access_token(String::from_utf8_lossy(access_key).into_owned());

    Ok(Some(AuthenticationDetails {
        strategy: AuthStrategy::ServiceAccount,
        machine_identity_scope: MachineIdentityScope::default(),
        is_machine_identity: false,
        resource_kind: resource.kind(),
    }))
}

async fn try_machine_identity(
    strategy: AuthStrategy,
    cluster: &dyn ClusterSecrets,
    resource: &dyn AuthenticatableResource,
    kms: &dyn KmsClient,
) -> Result<AuthenticationDetails, AuthError> {
    let auth = resource.authentication();

    let scope = match strategy {
        AuthStrategy::Universal => {
            let Some(universal) = auth.universal_auth.clone() else {
                return Err(AuthError::NotApplicable);
            };
            let reference = &universal.credentials_ref;
            if reference.secret_name.is_empty() {
                return Err(AuthError::NotApplicable);
            }

            let data = cluster
                .get_secret(&reference.secret_namespace, &reference.secret_name)
                .await
                .map_err(|e| strategy_failure(strategy, e))?
                .ok_or_else(|| {
                    strategy_failure(
                        strategy,
                        anyhow::anyhow!(
                            "machine identity credentials secret {}/{} not found",
                            reference.secret_namespace,
                            reference.secret_name
                        ),
                    )
                })?;

            let client_id = data
                .get(constants::MACHINE_IDENTITY_CLIENT_ID)
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            let client_secret = data
                .get(constants::MACHINE_IDENTITY_CLIENT_SECRET)
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();

            if client_id.is_empty() && client_secret.is_empty() {
                return Err(AuthError::NotApplicable);
            }

            kms.universal_login(&client_id, &client_secret)
                .await
                .map_err(|e| strategy_failure(strategy, e.into()))?;

            universal.secrets_scope
        }
        AuthStrategy::Kubernetes => {
            let Some(kubernetes) = auth.kubernetes_auth.clone() else {
                return Err(AuthError::NotApplicable);
            };
            if kubernetes.identity_id.is_empty() {
                return Err(AuthError::NotApplicable);
            }

            let reference = &kubernetes.service_account_ref;
            let jwt = if kubernetes.auto_create_service_account_token {
                cluster
                    .create_service_account_token(
                        &reference.namespace,
                        &reference.name,
                        &kubernetes.service_account_token_audiences,
                    )
                    .await
            } else {
                cluster
                    .service_account_linked_token(&reference.namespace, &reference.name)
                    .await
            }
            .map_err(|e| strategy_failure(strategy, e))?;

            kms.kubernetes_login(&kubernetes.identity_id, &jwt)
                .await
                .map_err(|e| strategy_failure(strategy, e.into()))?;

            kubernetes.secrets_scope
        }
        AuthStrategy::AwsIam => {
            let Some(aws) = auth.aws_iam_auth.clone() else {
                return Err(AuthError::NotApplicable);
            };
            if aws.identity_id.is_empty() {
                return Err(AuthError::NotApplicable);
            }

            kms.aws_iam_login(&aws.identity_id)
                .await
                .map_err(|e| strategy_failure(strategy, e.into()))?;

            aws.secrets_scope
        }
        AuthStrategy::Azure => {
            let Some(azure) = auth.azure_auth.clone() else {
                return Err(AuthError::NotApplicable);
            };
            if azure.identity_id.is_empty() {
                return Err(AuthError::NotApplicable);
            }

            kms.azure_login(&azure.identity_id, &azure.resource)
                .await
                .map_err(|e| strategy_failure(strategy, e.into()))?;

            azure.secrets_scope
        }
        AuthStrategy::GcpIdToken => {
            let Some(gcp) = auth.gcp_id_token_auth.clone() else {
                return Err(AuthError::NotApplicable);
            };
            if gcp.identity_id.is_empty() {
                return Err(AuthError::NotApplicable);
            }

            kms.gcp_id_token_login(&gcp.identity_id)
                .await
                .map_err(|e| strategy_failure(strategy, e.into()))?;

            gcp.secrets_scope
        }
        AuthStrategy::GcpIam => {
            let Some(gcp) = auth.gcp_iam_auth.clone() else {
                return Err(AuthError::NotApplicable);
            };
            if gcp.identity_id.is_empty() && gcp.service_account_key_file_path.is_empty() {
                return Err(AuthError::NotApplicable);
            }

            kms.gcp_iam_login(&gcp.identity_id, &gcp.service_account_key_file_path)
                .await
                .map_err(|e| strategy_failure(strategy, e.into()))?;

            gcp.secrets_scope
        }
        AuthStrategy::ServiceToken | AuthStrategy::ServiceAccount => {
            return Err(AuthError::NotApplicable)
        }
    };

    Ok(AuthenticationDetails {
        strategy,
        machine_identity_scope: scope,
        is_machine_identity: true,
        resource_kind: resource.kind(),
    })
}
