//! ClusterGenerator: cluster-scoped value generators referenced by push
//! resources.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum GeneratorKind {
    Password,
    #[serde(rename = "UUID")]
    Uuid,
}

/// Password shape for the `Password` generator kind.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PasswordSpec {
    /// Total length of the generated password.
    #[serde(default = "default_password_length")]
    pub length: usize,
    /// Minimum number of digits.
    #[serde(default)]
    pub digits: usize,
    /// Minimum number of symbol characters.
    #[serde(default)]
    pub symbols: usize,
    /// Symbol alphabet; a conservative default applies when unset.
    #[serde(default)]
    pub symbol_characters: Option<String>,
    /// Exclude uppercase letters.
    #[serde(default)]
    pub no_upper: bool,
    /// Allow repeated characters. When false, generation fails if the
    /// requested length exceeds the distinct alphabet.
    #[serde(default)]
    pub allow_repeat: bool,
}

fn default_password_length() -> usize {
    24
}

impl Default for PasswordSpec {
    fn default() -> Self {
        Self {
            length: default_password_length(),
            digits: 0,
            symbols: 0,
            symbol_characters: None,
            no_upper: false,
            allow_repeat: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorSpec {
    #[serde(default)]
    pub password_spec: Option<PasswordSpec>,
}

/// ClusterGenerator describes how generated keys are produced.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "secrets.lux.network",
    version = "v1alpha1",
    kind = "ClusterGenerator"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGeneratorSpec {
    #[serde(default)]
    pub generator: GeneratorSpec,
}
