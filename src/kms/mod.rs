//! KMS client interface.
//!
//! The reconcilers only ever see [`KmsClient`]; the HTTP implementation in
//! [`http`] is one provider of it and the test suites supply in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

pub mod http;

pub use http::{ClientConfig, HttpKmsClient};

/// A secret as returned by the KMS list endpoint.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KmsSecret {
    pub id: String,
    #[serde(rename = "secretKey")]
    pub key: String,
    #[serde(rename = "secretValue")]
    pub value: String,
    #[serde(rename = "secretPath", default)]
    pub path: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListSecretsRequest {
    pub project_id: String,
    pub environment: String,
    pub path: String,
    pub recursive: bool,
    pub include_imports: bool,
}

#[derive(Debug, Clone)]
pub struct CreateSecretRequest {
    pub key: String,
    pub value: String,
    pub project_id: String,
    pub environment: String,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct UpdateSecretRequest {
    pub key: String,
    pub new_value: String,
    pub project_id: String,
    pub environment: String,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct DeleteSecretRequest {
    pub key: String,
    pub project_id: String,
    pub environment: String,
    pub path: String,
}

/// A dynamic-secret lease. `expires_at` comes from the KMS; renewals return a
/// fresh value.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub id: String,
    pub version: i64,
    #[serde(rename = "expireAt")]
    pub expires_at: DateTime<Utc>,
}

/// Metadata of the dynamic secret backing a lease.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DynamicSecretMeta {
    pub id: String,
    #[serde(rename = "maxTTL", default)]
    pub max_ttl: String,
}

#[derive(Debug, Clone, Default)]
pub struct CreateLeaseRequest {
    pub dynamic_secret_name: String,
    pub project_slug: String,
    pub environment_slug: String,
    pub secret_path: String,
    pub ttl: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RenewLeaseRequest {
    pub lease_id: String,
    pub project_slug: String,
    pub environment_slug: String,
    pub secret_path: String,
    pub ttl: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteLeaseRequest {
    pub lease_id: String,
    pub project_slug: String,
    pub environment_slug: String,
    pub secret_path: String,
}

/// Response of a lease creation: the credential payload plus lease and
/// dynamic-secret metadata.
#[derive(Debug, Clone)]
pub struct CreatedLease {
    pub data: BTreeMap<String, Value>,
    pub dynamic_secret: DynamicSecretMeta,
    pub lease: Lease,
}

#[derive(Debug, Error)]
pub enum KmsError {
    /// The lease can no longer be renewed (TTL past max, or the lease record
    /// is gone). The dynamic reconciler converts this into a fresh lease.
    #[error("invalid dynamic secret lease")]
    InvalidLease,

    #[error("KMS API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("KMS request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("KMS request cancelled")]
    Cancelled,

    #[error("invalid KMS client configuration: {0}")]
    Config(String),
}

/// Authenticated access to the KMS.
///
/// Login calls install a bearer token on the client; all other calls require
/// one. Implementations must scope endpoint and CA per client instance, never
/// per process.
#[async_trait]
pub trait KmsClient: Send + Sync {
    fn set_access_token(&self, token: String);
    fn access_token(&self) -> Option<String>;

    async fn universal_login(&self, client_id: &str, client_secret: &str) -> Result<(), KmsError>;
    async fn kubernetes_login(
        &self,
        identity_id: &str,
        service_account_jwt: &str,
    ) -> Result<(), KmsError>;
    async fn aws_iam_login(&self, identity_id: &str) -> Result<(), KmsError>;
    async fn azure_login(&self, identity_id: &str, resource: &str) -> Result<(), KmsError>;
    async fn gcp_id_token_login(&self, identity_id: &str) -> Result<(), KmsError>;
    async fn gcp_iam_login(
        &self,
        identity_id: &str,
        service_account_key_file_path: &str,
    ) -> Result<(), KmsError>;

    /// Resolve a project id to the slug the lease endpoints address projects
    /// by.
    async fn get_project_slug(&self, project_id: &str) -> Result<String, KmsError>;

    async fn list_secrets(&self, request: ListSecretsRequest) -> Result<Vec<KmsSecret>, KmsError>;
    async fn create_secret(&self, request: CreateSecretRequest) -> Result<KmsSecret, KmsError>;
    async fn update_secret(&self, request: UpdateSecretRequest) -> Result<KmsSecret, KmsError>;
    async fn delete_secret(&self, request: DeleteSecretRequest) -> Result<KmsSecret, KmsError>;

    async fn create_lease(&self, request: CreateLeaseRequest) -> Result<CreatedLease, KmsError>;
    async fn renew_lease(&self, request: RenewLeaseRequest) -> Result<Lease, KmsError>;
    async fn delete_lease(&self, request: DeleteLeaseRequest) -> Result<Lease, KmsError>;
}
