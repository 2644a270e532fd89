//! Operator-level configuration: the default KMS endpoint and the
//! per-resource host/CA resolution that feeds the registry.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};

use crate::constants::{
    DEFAULT_KMS_HOST, OPERATOR_CONFIGMAP_HOST_KEY, OPERATOR_CONFIGMAP_NAME,
    OPERATOR_CONFIGMAP_NAMESPACE,
};
use crate::crd::TlsConfig;
use crate::kms::ClientConfig;

/// Normalize a user-supplied host into an API endpoint by appending the
/// `/api` path segment when missing.
pub fn append_api_endpoint(host: &str) -> String {
    let trimmed = host.trim_end_matches('/');
    if trimmed.ends_with("/api") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/api")
    }
}

/// Default endpoint from the operator ConfigMap, falling back to the hosted
/// KMS when the ConfigMap or its key is absent.
pub async fn default_host(client: &Client) -> Result<String> {
    let config_maps: Api<ConfigMap> =
        Api::namespaced(client.clone(), OPERATOR_CONFIGMAP_NAMESPACE);

    match config_maps.get(OPERATOR_CONFIGMAP_NAME).await {
        Ok(config_map) => Ok(config_map
            .data
            .unwrap_or_default()
            .get(OPERATOR_CONFIGMAP_HOST_KEY)
            .filter(|host| !host.is_empty())
            .map(|host| host.to_string())
            .unwrap_or_else(|| DEFAULT_KMS_HOST.to_string())),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(DEFAULT_KMS_HOST.to_string()),
        Err(e) => Err(e).context("unable to fetch operator config map"),
    }
}

/// Build the per-resource client configuration from the resource's host
/// override and TLS settings.
pub async fn resolve_client_config(
    client: &Client,
    host_api: &str,
    tls: &TlsConfig,
) -> Result<ClientConfig> {
    let base_url = if host_api.is_empty() {
        default_host(client).await?
    } else {
        append_api_endpoint(host_api)
    };

    let ca_certificate = if tls.ca_ref.secret_name.is_empty() {
        None
    } else {
        Some(fetch_ca_certificate(client, tls).await?)
    };

    Ok(ClientConfig {
        base_url,
        ca_certificate,
    })
}

async fn fetch_ca_certificate(client: &Client, tls: &TlsConfig) -> Result<String> {
    use k8s_openapi::api::core::v1::Secret;

    let secrets: Api<Secret> = Api::namespaced(client.clone(), &tls.ca_ref.secret_namespace);
    let secret = secrets.get(&tls.ca_ref.secret_name).await.with_context(|| {
        format!(
            "secret containing the custom CA certificate cannot be found ({}/{})",
            tls.ca_ref.secret_namespace, tls.ca_ref.secret_name
        )
    })?;

    let data = secret.data.unwrap_or_default();
    let value = data.get(&tls.ca_ref.secret_key).with_context(|| {
        format!(
            "CA secret {} has no key {}",
            tls.ca_ref.secret_name, tls.ca_ref.secret_key
        )
    })?;

    Ok(String::from_utf8_lossy(&value.0).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_api_segment() {
        assert_eq!(
            append_api_endpoint("https://kms.example.com"),
            "https://kms.example.com/api"
        );
        assert_eq!(
            append_api_endpoint("https://kms.example.com/"),
            "https://kms.example.com/api"
        );
    }

    #[test]
    fn keeps_existing_api_segment() {
        assert_eq!(
            append_api_endpoint("https://kms.example.com/api"),
            "https://kms.example.com/api"
        );
        assert_eq!(
            append_api_endpoint("https://kms.example.com/api/"),
            "https://kms.example.com/api"
        );
    }
}
