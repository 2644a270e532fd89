//! Custom resource definitions for the `secrets.lux.network/v1alpha1` group.

pub mod authentication;
pub mod dynamic;
pub mod generator;
pub mod pull;
pub mod push;
pub mod status;

pub use authentication::{
    Authentication, AwsIamAuthDetails, AzureAuthDetails, GcpIamAuthDetails,
    GcpIdTokenAuthDetails, KubeSecretKeyReference, KubeSecretReference, KubernetesAuthDetails,
    KubernetesServiceAccountRef, MachineIdentityScope, ManagedKubeConfigMapConfig,
    ManagedKubeSecretConfig, SecretTemplate, ServiceAccountDetails, ServiceTokenDetails,
    TlsConfig, UniversalAuthDetails,
};
pub use dynamic::{
    DynamicSecretDetails, KMSDynamicSecret, KMSDynamicSecretLease, KMSDynamicSecretSpec,
    KMSDynamicSecretStatus,
};
pub use generator::{ClusterGenerator, ClusterGeneratorSpec, GeneratorKind, PasswordSpec};
pub use pull::{KMSSecret, KMSSecretSpec, KMSSecretStatus};
pub use push::{
    GeneratorRef, KMSPushSecret, KMSPushSecretDestination, KMSPushSecretSpec,
    KMSPushSecretStatus, PushSecretGenerator, PushSecretSource, SecretPush,
};
pub use status::{set_condition, Condition};
