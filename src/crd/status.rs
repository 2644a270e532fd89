//! Status conditions shared by all resource kinds.

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Externally visible condition types.
pub const CONDITION_RECONCILE: &str = "secrets.lux.network/Reconcile";
pub const CONDITION_AUTHENTICATED: &str = "secrets.lux.network/Authenticated";
pub const CONDITION_LEASE_CREATED: &str = "secrets.lux.network/LeaseCreated";
pub const CONDITION_LEASE_RENEWAL: &str = "secrets.lux.network/LeaseRenewal";
pub const CONDITION_AUTO_REDEPLOY_READY: &str = "secrets.lux.network/AutoRedeployReady";
pub const CONDITION_READY_TO_SYNC_SECRETS: &str = "secrets.lux.network/ReadyToSyncSecrets";
pub const CONDITION_LOADED_KMS_TOKEN: &str = "secrets.lux.network/LoadedKMSToken";
pub const CONDITION_FAILED_TO_CREATE_SECRETS: &str = "secrets.lux.network/FailedToCreateSecrets";
pub const CONDITION_FAILED_TO_UPDATE_SECRETS: &str = "secrets.lux.network/FailedToUpdateSecrets";
pub const CONDITION_FAILED_TO_DELETE_SECRETS: &str = "secrets.lux.network/FailedToDeleteSecrets";
pub const CONDITION_FAILED_TO_REPLACE_SECRETS: &str = "secrets.lux.network/FailedToReplaceSecrets";

/// A status condition on a custom resource.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last transition time
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Message describing the condition
    #[serde(default)]
    pub message: Option<String>,
}

/// Upsert a condition by type. The transition time only moves when the
/// status flips, so unchanged conditions do not churn the object.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    r#type: &str,
    status: bool,
    reason: &str,
    message: impl Into<String>,
) {
    let status = if status { "True" } else { "False" };
    let message = message.into();

    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == r#type) {
        if existing.status != status {
            existing.last_transition_time = Some(Utc::now().to_rfc3339());
        }
        existing.status = status.to_string();
        existing.reason = Some(reason.to_string());
        existing.message = Some(message);
        return;
    }

    conditions.push(Condition {
        r#type: r#type.to_string(),
        status: status.to_string(),
        last_transition_time: Some(Utc::now().to_rfc3339()),
        reason: Some(reason.to_string()),
        message: Some(message),
    });
}
