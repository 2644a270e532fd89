//! Scenario tests for authentication resolution: strategy ordering, legacy
//! short-circuits and failure propagation.

mod common;

use common::{FakeCluster, FakeKms};
use kms_operator::auth::{self, AuthError, AuthStrategy, ResourceKind};
use kms_operator::crd::{
    Authentication, AwsIamAuthDetails, AzureAuthDetails, KMSPushSecret, KMSPushSecretSpec,
    KMSSecret, KMSSecretSpec, KubeSecretReference, KubernetesAuthDetails,
    KubernetesServiceAccountRef, MachineIdentityScope, ServiceTokenDetails, UniversalAuthDetails,
};
use kms_operator::kms::KmsClient;

fn pull_resource(authentication: Authentication) -> KMSSecret {
    KMSSecret::new(
        "pull",
        KMSSecretSpec {
            authentication,
            ..Default::default()
        },
    )
}

fn push_resource(authentication: Authentication) -> KMSPushSecret {
    KMSPushSecret::new(
        "push",
        KMSPushSecretSpec {
            authentication,
            ..Default::default()
        },
    )
}

fn universal_auth(secret_name: &str) -> UniversalAuthDetails {
    UniversalAuthDetails {
        credentials_ref: KubeSecretReference {
            secret_name: secret_name.to_string(),
            secret_namespace: "default".to_string(),
        },
        secrets_scope: MachineIdentityScope {
            project_slug: "project".into(),
            env_slug: "prod".into(),
            secrets_path: "/".into(),
            recursive: false,
        },
    }
}

#[tokio::test]
async fn universal_wins_over_later_strategies() {
    let cluster = FakeCluster::new();
    cluster.put_secret(
        "default",
        "creds",
        &[("clientId", "client"), ("clientSecret", "secret")],
    );

    let resource = push_resource(Authentication {
        universal_auth: Some(universal_auth("creds")),
        aws_iam_auth: Some(AwsIamAuthDetails {
            identity_id: "aws-identity".into(),
            ..Default::default()
        }),
        ..Default::default()
    });

    let kms = FakeKms::new();
    let details = auth::resolve(&cluster, &resource, &kms).await.unwrap();

    assert_eq!(details.strategy, AuthStrategy::Universal);
    assert!(details.is_machine_identity);
    assert_eq!(details.resource_kind, ResourceKind::Push);
    assert_eq!(kms.calls(), vec!["login:universal"]);
}

#[tokio::test]
async fn inapplicable_strategies_fall_through_in_order() {
    let resource = push_resource(Authentication {
        azure_auth: Some(AzureAuthDetails {
            identity_id: "azure-identity".into(),
            ..Default::default()
        }),
        ..Default::default()
    });

    let kms = FakeKms::new();
    let details = auth::resolve(&FakeCluster::new(), &resource, &kms)
        .await
        .unwrap();

    assert_eq!(details.strategy, AuthStrategy::Azure);
    assert_eq!(kms.calls(), vec!["login:azure"]);
}

#[tokio::test]
async fn no_configured_strategy_yields_no_auth_method() {
    let resource = push_resource(Authentication::default());
    let result = auth::resolve(&FakeCluster::new(), &resource, &FakeKms::new()).await;
    assert!(matches!(result, Err(AuthError::NoAuthMethod)));
}

#[tokio::test]
async fn login_failure_aborts_resolution() {
    let cluster = FakeCluster::new();
    cluster.put_secret(
        "default",
        "creds",
        &[("clientId", "client"), ("clientSecret", "secret")],
    );

    // AWS IAM is also configured, but the universal failure must abort
    // resolution rather than fall through.
    let resource = push_resource(Authentication {
        universal_auth: Some(universal_auth("creds")),
        aws_iam_auth: Some(AwsIamAuthDetails {
            identity_id: "aws-identity".into(),
            ..Default::default()
        }),
        ..Default::default()
    });

    let kms = FakeKms::new();
    kms.fail_on("login:universal");

    let result = auth::resolve(&cluster, &resource, &kms).await;
    assert!(matches!(
        result,
        Err(AuthError::Strategy {
            strategy: AuthStrategy::Universal,
            ..
        })
    ));
    assert_eq!(kms.calls(), vec!["login:universal"]);
}

#[tokio::test]
async fn missing_universal_credentials_secret_is_a_hard_failure() {
    let resource = push_resource(Authentication {
        universal_auth: Some(universal_auth("missing")),
        ..Default::default()
    });

    let result = auth::resolve(&FakeCluster::new(), &resource, &FakeKms::new()).await;
    assert!(matches!(
        result,
        Err(AuthError::Strategy {
            strategy: AuthStrategy::Universal,
            ..
        })
    ));
}

#[tokio::test]
async fn empty_universal_credentials_fall_through() {
    let cluster = FakeCluster::new();
    cluster.put_secret("default", "creds", &[]);

    let resource = push_resource(Authentication {
        universal_auth: Some(universal_auth("creds")),
        azure_auth: Some(AzureAuthDetails {
            identity_id: "azure-identity".into(),
            ..Default::default()
        }),
        ..Default::default()
    });

    let kms = FakeKms::new();
    let details = auth::resolve(&cluster, &resource, &kms).await.unwrap();
    assert_eq!(details.strategy, AuthStrategy::Azure);
}

#[tokio::test]
async fn legacy_service_token_short_circuits_for_pull() {
    let cluster = FakeCluster::new();
    cluster.put_secret("default", "token-secret", &[("kmsToken", "st.token value")]);

    let resource = pull_resource(Authentication {
        service_token: Some(ServiceTokenDetails {
            service_token_secret_reference: KubeSecretReference {
                secret_name: "token-secret".into(),
                secret_namespace: "default".into(),
            },
            secrets_scope: MachineIdentityScope {
                env_slug: "prod".into(),
                secrets_path: "/".into(),
                ..Default::default()
            },
        }),
        // A machine identity is also configured but must not be reached.
        universal_auth: Some(universal_auth("creds")),
        ..Default::default()
    });

    let kms = FakeKms::new();
    let details = auth::resolve(&cluster, &resource, &kms).await.unwrap();

    assert_eq!(details.strategy, AuthStrategy::ServiceToken);
    assert!(!details.is_machine_identity);
    assert!(kms.calls().is_empty());
    // Whitespace is stripped from the stored token.
    assert_eq!(kms.access_token().as_deref(), Some("st.tokenvalue"));
}

#[tokio::test]
async fn absent_legacy_secret_is_skipped_silently() {
    let cluster = FakeCluster::new();
    cluster.put_secret(
        "default",
        "creds",
        &[("clientId", "client"), ("clientSecret", "secret")],
    );

    let resource = pull_resource(Authentication {
        service_token: Some(ServiceTokenDetails {
            service_token_secret_reference: KubeSecretReference {
                secret_name: "does-not-exist".into(),
                secret_namespace: "default".into(),
            },
            ..Default::default()
        }),
        universal_auth: Some(universal_auth("creds")),
        ..Default::default()
    });

    let kms = FakeKms::new();
    let details = auth::resolve(&cluster, &resource, &kms).await.unwrap();
    assert_eq!(details.strategy, AuthStrategy::Universal);
}

#[tokio::test]
async fn legacy_service_account_triple_short_circuits_for_pull() {
    let cluster = FakeCluster::new();
    cluster.put_secret(
        "default",
        "sa-creds",
        &[
            ("serviceAccountAccessKey", "access"),
            ("serviceAccountPublicKey", "public"),
            ("serviceAccountPrivateKey", "private"),
        ],
    );

    let resource = pull_resource(Authentication {
        service_account: Some(kms_operator::crd::ServiceAccountDetails {
            service_account_secret_reference: KubeSecretReference {
                secret_name: "sa-creds".into(),
                secret_namespace: "default".into(),
            },
            project_id: "project".into(),
            environment_name: "prod".into(),
        }),
        ..Default::default()
    });

    let kms = FakeKms::new();
    let details = auth::resolve(&cluster, &resource, &kms).await.unwrap();

    assert_eq!(details.strategy, AuthStrategy::ServiceAccount);
    assert_eq!(kms.access_token().as_deref(), Some("access"));
}

#[tokio::test]
async fn push_resources_skip_legacy_strategies() {
    let cluster = FakeCluster::new();
    cluster.put_secret("default", "token-secret", &[("kmsToken", "token")]);

    // Even with a service token block present, non-pull kinds go straight to
    // machine identities.
    let resource = push_resource(Authentication {
        service_token: Some(ServiceTokenDetails {
            service_token_secret_reference: KubeSecretReference {
                secret_name: "token-secret".into(),
                secret_namespace: "default".into(),
            },
            ..Default::default()
        }),
        ..Default::default()
    });

    let result = auth::resolve(&cluster, &resource, &FakeKms::new()).await;
    assert!(matches!(result, Err(AuthError::NoAuthMethod)));
}

#[tokio::test]
async fn kubernetes_auth_mints_token_when_auto_create_is_set() {
    let cluster = FakeCluster::new();
    let resource = push_resource(Authentication {
        kubernetes_auth: Some(KubernetesAuthDetails {
            identity_id: "k8s-identity".into(),
            service_account_ref: KubernetesServiceAccountRef {
                name: "operator-sa".into(),
                namespace: "kms-operator-system".into(),
            },
            auto_create_service_account_token: true,
            service_account_token_audiences: vec!["kms".into()],
            secrets_scope: MachineIdentityScope::default(),
        }),
        ..Default::default()
    });

    let kms = FakeKms::new();
    let details = auth::resolve(&cluster, &resource, &kms).await.unwrap();

    assert_eq!(details.strategy, AuthStrategy::Kubernetes);
    assert_eq!(kms.calls(), vec!["login:kubernetes:minted-jwt"]);
    assert_eq!(
        cluster.minted_tokens(),
        vec![(
            "kms-operator-system".to_string(),
            "operator-sa".to_string(),
            vec!["kms".to_string()]
        )]
    );
}

#[tokio::test]
async fn kubernetes_auth_reads_linked_secret_by_default() {
    let cluster = FakeCluster::new();
    let resource = push_resource(Authentication {
        kubernetes_auth: Some(KubernetesAuthDetails {
            identity_id: "k8s-identity".into(),
            service_account_ref: KubernetesServiceAccountRef {
                name: "operator-sa".into(),
                namespace: "kms-operator-system".into(),
            },
            auto_create_service_account_token: false,
            service_account_token_audiences: Vec::new(),
            secrets_scope: MachineIdentityScope::default(),
        }),
        ..Default::default()
    });

    let kms = FakeKms::new();
    auth::resolve(&cluster, &resource, &kms).await.unwrap();

    assert_eq!(kms.calls(), vec!["login:kubernetes:linked-token"]);
    assert!(cluster.minted_tokens().is_empty());
}
