//! HTTP implementation of [`KmsClient`] over the KMS REST API.
//!
//! Endpoint and CA bundle are fixed per client instance so resources pointing
//! at different KMS hosts never interfere. In-flight requests abort when the
//! owning resource's cancellation token fires.

use async_trait::async_trait;
use reqwest::{Certificate, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::constants::USER_AGENT;

use super::{
    CreateLeaseRequest, CreateSecretRequest, CreatedLease, DeleteLeaseRequest,
    DeleteSecretRequest, DynamicSecretMeta, KmsClient, KmsError, KmsSecret, Lease,
    ListSecretsRequest, RenewLeaseRequest, UpdateSecretRequest,
};

/// Per-resource client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    /// PEM CA bundle for self-hosted deployments with a private CA.
    pub ca_certificate: Option<String>,
}

pub struct HttpKmsClient {
    http: reqwest::Client,
    base_url: String,
    access_token: RwLock<Option<String>>,
    cancel: CancellationToken,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct ListSecretsResponse {
    secrets: Vec<KmsSecret>,
}

#[derive(Deserialize)]
struct SecretResponse {
    secret: KmsSecret,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateLeaseResponse {
    lease: Lease,
    dynamic_secret: DynamicSecretMeta,
    #[serde(default)]
    data: BTreeMap<String, Value>,
}

#[derive(Deserialize)]
struct LeaseResponse {
    lease: Lease,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SecretMutationBody<'a> {
    #[serde(rename = "workspaceId")]
    project_id: &'a str,
    environment: &'a str,
    secret_path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_value: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LeaseMutationBody<'a> {
    project_slug: &'a str,
    environment_slug: &'a str,
    secret_path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dynamic_secret_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl: Option<&'a str>,
}

impl HttpKmsClient {
    pub fn new(config: ClientConfig, cancel: CancellationToken) -> Result<Self, KmsError> {
        if config.base_url.is_empty() {
            return Err(KmsError::Config("base URL must not be empty".into()));
        }

        let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
        if let Some(ca) = &config.ca_certificate {
            let certificate = Certificate::from_pem(ca.as_bytes())
                .map_err(|e| KmsError::Config(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(certificate);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: RwLock::new(None),
            cancel,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.request(method, url);
        if let Some(token) = self.access_token() {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Run a request racing the per-resource cancellation token, decoding the
    /// body on success and surfacing the error payload otherwise.
    async fn execute<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, KmsError> {
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(KmsError::Cancelled),
            response = builder.send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(KmsError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }

    async fn login(&self, path: &str, body: Value) -> Result<(), KmsError> {
        let response: LoginResponse = self
            .execute(self.request(Method::POST, path).json(&body))
            .await?;
        self.set_access_token(response.access_token);
        Ok(())
    }
}

#[async_trait]
impl KmsClient for HttpKmsClient {
    fn set_access_token(&self, token: String) {
        *self.access_token.write().expect("access token lock poisoned") = Some(token);
    }

    fn access_token(&self) -> Option<String> {
        self.access_token
            .read()
            .expect("access token lock poisoned")
            .clone()
    }

    async fn universal_login(&self, client_id: &str, client_secret: &str) -> Result<(), KmsError> {
        self.login(
            "/v1/auth/universal-auth/login",
            serde_json::json!({ "clientId": client_id, "clientSecret": client_secret }),
        )
        .await
    }

    async fn kubernetes_login(
        &self,
        identity_id: &str,
        service_account_jwt: &str,
    ) -> Result<(), KmsError> {
        self.login(
            "/v1/auth/kubernetes-auth/login",
            serde_json::json!({ "identityId": identity_id, "jwt": service_account_jwt }),
        )
        .await
    }

    async fn aws_iam_login(&self, identity_id: &str) -> Result<(), KmsError> {
        self.login(
            "/v1/auth/aws-auth/login",
            serde_json::json!({ "identityId": identity_id }),
        )
        .await
    }

    async fn azure_login(&self, identity_id: &str, resource: &str) -> Result<(), KmsError> {
        self.login(
            "/v1/auth/azure-auth/login",
            serde_json::json!({ "identityId": identity_id, "resource": resource }),
        )
        .await
    }

    async fn gcp_id_token_login(&self, identity_id: &str) -> Result<(), KmsError> {
        self.login(
            "/v1/auth/gcp-auth/login",
            serde_json::json!({ "identityId": identity_id }),
        )
        .await
    }

    async fn gcp_iam_login(
        &self,
        identity_id: &str,
        service_account_key_file_path: &str,
    ) -> Result<(), KmsError> {
        self.login(
            "/v1/auth/gcp-auth/iam-login",
            serde_json::json!({
                "identityId": identity_id,
                "serviceAccountKeyFilePath": service_account_key_file_path,
            }),
        )
        .await
    }

    async fn get_project_slug(&self, project_id: &str) -> Result<String, KmsError> {
        #[derive(Deserialize)]
        struct Workspace {
            slug: String,
        }
        #[derive(Deserialize)]
        struct WorkspaceResponse {
            workspace: Workspace,
        }

        let response: WorkspaceResponse = self
            .execute(self.request(Method::GET, &format!("/v1/workspace/{project_id}")))
            .await?;
        Ok(response.workspace.slug)
    }

    async fn list_secrets(&self, request: ListSecretsRequest) -> Result<Vec<KmsSecret>, KmsError> {
        let builder = self.request(Method::GET, "/v3/secrets/raw").query(&[
            ("workspaceId", request.project_id.as_str()),
            ("environment", request.environment.as_str()),
            ("secretPath", request.path.as_str()),
            ("recursive", if request.recursive { "true" } else { "false" }),
            (
                "includeImports",
                if request.include_imports { "true" } else { "false" },
            ),
        ]);

        let response: ListSecretsResponse = self.execute(builder).await?;
        Ok(response.secrets)
    }

    async fn create_secret(&self, request: CreateSecretRequest) -> Result<KmsSecret, KmsError> {
        let body = SecretMutationBody {
            project_id: &request.project_id,
            environment: &request.environment,
            secret_path: &request.path,
            secret_value: Some(&request.value),
        };
        let response: SecretResponse = self
            .execute(
                self.request(Method::POST, &format!("/v3/secrets/raw/{}", request.key))
                    .json(&body),
            )
            .await?;
        Ok(response.secret)
    }

    async fn update_secret(&self, request: UpdateSecretRequest) -> Result<KmsSecret, KmsError> {
        let body = SecretMutationBody {
            project_id: &request.project_id,
            environment: &request.environment,
            secret_path: &request.path,
            secret_value: Some(&request.new_value),
        };
        let response: SecretResponse = self
            .execute(
                self.request(Method::PATCH, &format!("/v3/secrets/raw/{}", request.key))
                    .json(&body),
            )
            .await?;
        Ok(response.secret)
    }

    async fn delete_secret(&self, request: DeleteSecretRequest) -> Result<KmsSecret, KmsError> {
        let body = SecretMutationBody {
            project_id: &request.project_id,
            environment: &request.environment,
            secret_path: &request.path,
            secret_value: None,
        };
        let response: SecretResponse = self
            .execute(
                self.request(Method::DELETE, &format!("/v3/secrets/raw/{}", request.key))
                    .json(&body),
            )
            .await?;
        Ok(response.secret)
    }

    async fn create_lease(&self, request: CreateLeaseRequest) -> Result<CreatedLease, KmsError> {
        let body = LeaseMutationBody {
            project_slug: &request.project_slug,
            environment_slug: &request.environment_slug,
            secret_path: &request.secret_path,
            dynamic_secret_name: Some(&request.dynamic_secret_name),
            ttl: request.ttl.as_deref(),
        };
        let response: CreateLeaseResponse = self
            .execute(
                self.request(Method::POST, "/v1/dynamic-secrets/leases")
                    .json(&body),
            )
            .await?;
        Ok(CreatedLease {
            data: response.data,
            dynamic_secret: response.dynamic_secret,
            lease: response.lease,
        })
    }

    async fn renew_lease(&self, request: RenewLeaseRequest) -> Result<Lease, KmsError> {
        let body = LeaseMutationBody {
            project_slug: &request.project_slug,
            environment_slug: &request.environment_slug,
            secret_path: &request.secret_path,
            dynamic_secret_name: None,
            ttl: request.ttl.as_deref(),
        };
        let result: Result<LeaseResponse, KmsError> = self
            .execute(
                self.request(
                    Method::POST,
                    &format!("/v1/dynamic-secrets/leases/{}/renew", request.lease_id),
                )
                .json(&body),
            )
            .await;

        match result {
            Ok(response) => Ok(response.lease),
            Err(err) => Err(map_renewal_error(err)),
        }
    }

    async fn delete_lease(&self, request: DeleteLeaseRequest) -> Result<Lease, KmsError> {
        let body = LeaseMutationBody {
            project_slug: &request.project_slug,
            environment_slug: &request.environment_slug,
            secret_path: &request.secret_path,
            dynamic_secret_name: None,
            ttl: None,
        };
        let response: LeaseResponse = self
            .execute(
                self.request(
                    Method::DELETE,
                    &format!("/v1/dynamic-secrets/leases/{}", request.lease_id),
                )
                .json(&body),
            )
            .await?;
        Ok(response.lease)
    }
}

/// Renewal failures that mean the lease is gone for good: the requested TTL
/// exceeds the max TTL, or the lease record no longer exists.
fn map_renewal_error(err: KmsError) -> KmsError {
    match &err {
        KmsError::Api { message, .. }
            if message.contains("TTL cannot be larger than max ttl")
                || message.contains("Dynamic secret lease with ID") =>
        {
            KmsError::InvalidLease
        }
        _ => err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renewal_error_mapping() {
        let max_ttl = KmsError::Api {
            status: 400,
            message: "TTL cannot be larger than max ttl".into(),
        };
        assert!(matches!(map_renewal_error(max_ttl), KmsError::InvalidLease));

        let missing = KmsError::Api {
            status: 404,
            message: "Dynamic secret lease with ID abc123 not found".into(),
        };
        assert!(matches!(map_renewal_error(missing), KmsError::InvalidLease));

        let other = KmsError::Api {
            status: 500,
            message: "internal error".into(),
        };
        assert!(matches!(map_renewal_error(other), KmsError::Api { .. }));
    }

    #[test]
    fn rejects_empty_base_url() {
        let result = HttpKmsClient::new(
            ClientConfig {
                base_url: String::new(),
                ca_certificate: None,
            },
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(KmsError::Config(_))));
    }

    #[test]
    fn trims_trailing_slash_from_base_url() {
        let client = HttpKmsClient::new(
            ClientConfig {
                base_url: "https://kms.example.com/api/".into(),
                ca_certificate: None,
            },
            CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(client.base_url, "https://kms.example.com/api");
    }
}
