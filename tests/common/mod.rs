//! Shared test doubles: an in-memory KMS and a fake cluster reader.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use kms_operator::auth::ClusterSecrets;
use kms_operator::kms::{
    CreateLeaseRequest, CreateSecretRequest, CreatedLease, DeleteLeaseRequest,
    DeleteSecretRequest, DynamicSecretMeta, KmsClient, KmsError, KmsSecret, Lease,
    ListSecretsRequest, RenewLeaseRequest, UpdateSecretRequest,
};

/// In-memory KMS. Records every mutating call so tests can assert exactly
/// which operations a reconcile pass issued, and can be told to fail
/// specific operations (e.g. `create:B`, `login:universal`, `renew`).
#[derive(Default)]
pub struct FakeKms {
    secrets: Mutex<Vec<KmsSecret>>,
    calls: Mutex<Vec<String>>,
    fail_operations: Mutex<HashSet<String>>,
    next_id: AtomicU64,
    token: Mutex<Option<String>>,
}

impl FakeKms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, id: &str, key: &str, value: &str) {
        self.secrets.lock().unwrap().push(KmsSecret {
            id: id.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            path: "/".to_string(),
        });
    }

    pub fn fail_on(&self, operation: &str) {
        self.fail_operations
            .lock()
            .unwrap()
            .insert(operation.to_string());
    }

    /// Mutating and login calls, in issue order. Lists are not recorded.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn snapshot(&self) -> Vec<KmsSecret> {
        self.secrets.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn check_fail(&self, operation: &str) -> Result<(), KmsError> {
        if self.fail_operations.lock().unwrap().contains(operation) {
            return Err(KmsError::Api {
                status: 500,
                message: format!("injected failure for {operation}"),
            });
        }
        Ok(())
    }

    fn fresh_id(&self) -> String {
        format!("id-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 100)
    }
}

#[async_trait]
impl KmsClient for FakeKms {
    fn set_access_token(&self, token: String) {
        *self.token.lock().unwrap() = Some(token);
    }

    fn access_token(&self) -> Option<String> {
        self.token.lock().unwrap().clone()
    }

    async fn universal_login(&self, _client_id: &str, _client_secret: &str) -> Result<(), KmsError> {
        self.record("login:universal");
        self.check_fail("login:universal")?;
        self.set_access_token("token-universal".into());
        Ok(())
    }

    async fn kubernetes_login(
        &self,
        _identity_id: &str,
        service_account_jwt: &str,
    ) -> Result<(), KmsError> {
        self.record(format!("login:kubernetes:{service_account_jwt}"));
        self.check_fail("login:kubernetes")?;
        self.set_access_token("token-kubernetes".into());
        Ok(())
    }

    async fn aws_iam_login(&self, _identity_id: &str) -> Result<(), KmsError> {
        self.record("login:aws-iam");
        self.check_fail("login:aws-iam")?;
        self.set_access_token("token-aws".into());
        Ok(())
    }

    async fn azure_login(&self, _identity_id: &str, _resource: &str) -> Result<(), KmsError> {
        self.record("login:azure");
        self.check_fail("login:azure")?;
        self.set_access_token("token-azure".into());
        Ok(())
    }

    async fn gcp_id_token_login(&self, _identity_id: &str) -> Result<(), KmsError> {
        self.record("login:gcp-id-token");
        self.check_fail("login:gcp-id-token")?;
        self.set_access_token("token-gcp".into());
        Ok(())
    }

    async fn gcp_iam_login(
        &self,
        _identity_id: &str,
        _service_account_key_file_path: &str,
    ) -> Result<(), KmsError> {
        self.record("login:gcp-iam");
        self.check_fail("login:gcp-iam")?;
        self.set_access_token("token-gcp-iam".into());
        Ok(())
    }

    async fn get_project_slug(&self, project_id: &str) -> Result<String, KmsError> {
        Ok(format!("{project_id}-slug"))
    }

    async fn list_secrets(&self, _request: ListSecretsRequest) -> Result<Vec<KmsSecret>, KmsError> {
        Ok(self.snapshot())
    }

    async fn create_secret(&self, request: CreateSecretRequest) -> Result<KmsSecret, KmsError> {
        self.record(format!("create:{}", request.key));
        self.check_fail(&format!("create:{}", request.key))?;

        let secret = KmsSecret {
            id: self.fresh_id(),
            key: request.key,
            value: request.value,
            path: request.path,
        };
        self.secrets.lock().unwrap().push(secret.clone());
        Ok(secret)
    }

    async fn update_secret(&self, request: UpdateSecretRequest) -> Result<KmsSecret, KmsError> {
        self.record(format!("update:{}", request.key));
        self.check_fail(&format!("update:{}", request.key))?;

        let mut secrets = self.secrets.lock().unwrap();
        let secret = secrets
            .iter_mut()
            .find(|secret| secret.key == request.key)
            .ok_or(KmsError::Api {
                status: 404,
                message: format!("secret {} not found", request.key),
            })?;
        secret.value = request.new_value;
        Ok(secret.clone())
    }

    async fn delete_secret(&self, request: DeleteSecretRequest) -> Result<KmsSecret, KmsError> {
        self.record(format!("delete:{}", request.key));
        self.check_fail(&format!("delete:{}", request.key))?;

        let mut secrets = self.secrets.lock().unwrap();
        let position = secrets
            .iter()
            .position(|secret| secret.key == request.key)
            .ok_or(KmsError::Api {
                status: 404,
                message: format!("secret {} not found", request.key),
            })?;
        Ok(secrets.remove(position))
    }

    async fn create_lease(&self, _request: CreateLeaseRequest) -> Result<CreatedLease, KmsError> {
        self.record("lease:create");
        self.check_fail("lease:create")?;

        let mut data = BTreeMap::new();
        data.insert("username".to_string(), Value::String("generated-user".into()));
        data.insert("password".to_string(), Value::String("generated-pass".into()));

        Ok(CreatedLease {
            data,
            dynamic_secret: DynamicSecretMeta {
                id: "dynamic-secret-1".to_string(),
                max_ttl: "1h".to_string(),
            },
            lease: Lease {
                id: format!("lease-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
                version: 1,
                expires_at: Utc::now() + ChronoDuration::seconds(60),
            },
        })
    }

    async fn renew_lease(&self, request: RenewLeaseRequest) -> Result<Lease, KmsError> {
        self.record("lease:renew");
        if self.fail_operations.lock().unwrap().contains("renew:invalid") {
            return Err(KmsError::InvalidLease);
        }
        self.check_fail("lease:renew")?;

        Ok(Lease {
            id: request.lease_id,
            version: 1,
            expires_at: Utc::now() + ChronoDuration::seconds(60),
        })
    }

    async fn delete_lease(&self, request: DeleteLeaseRequest) -> Result<Lease, KmsError> {
        self.record("lease:delete");
        self.check_fail("lease:delete")?;

        Ok(Lease {
            id: request.lease_id,
            version: 1,
            expires_at: Utc::now(),
        })
    }
}

/// Fake cluster reader for the auth resolver.
#[derive(Default)]
pub struct FakeCluster {
    secrets: Mutex<HashMap<(String, String), BTreeMap<String, Vec<u8>>>>,
    minted_tokens: Mutex<Vec<(String, String, Vec<String>)>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_secret(&self, namespace: &str, name: &str, entries: &[(&str, &str)]) {
        let data = entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.as_bytes().to_vec()))
            .collect();
        self.secrets
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), data);
    }

    pub fn minted_tokens(&self) -> Vec<(String, String, Vec<String>)> {
        self.minted_tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterSecrets for FakeCluster {
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<Option<BTreeMap<String, Vec<u8>>>> {
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_service_account_token(
        &self,
        namespace: &str,
        name: &str,
        audiences: &[String],
    ) -> anyhow::Result<String> {
        self.minted_tokens.lock().unwrap().push((
            namespace.to_string(),
            name.to_string(),
            audiences.to_vec(),
        ));
        Ok("minted-jwt".to_string())
    }

    async fn service_account_linked_token(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> anyhow::Result<String> {
        Ok("linked-token".to_string())
    }
}
