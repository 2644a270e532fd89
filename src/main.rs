//! Operator entrypoint: wires the three controllers, the session
//! invalidation watches and the metrics server.

use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Controller;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, Client};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

use kms_operator::crd::{ClusterGenerator, KMSDynamicSecret, KMSPushSecret, KMSSecret};
use kms_operator::observability::metrics;
use kms_operator::reconciler::{self, Context};
use kms_operator::registry::{watch_for_invalidation, ResourceRegistry};
use kms_operator::server::{start_server, ServerState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kms_operator=info".into()),
        )
        .init();

    info!("starting KMS operator");
    metrics::register_metrics()?;

    let server_state = ServerState {
        is_ready: Arc::new(AtomicBool::new(false)),
    };
    let server_port = std::env::var("METRICS_PORT")
        .ok()
        .and_then(|port| port.parse::<u16>().ok())
        .unwrap_or(8080);
    tokio::spawn({
        let state = server_state.clone();
        async move {
            if let Err(e) = start_server(server_port, state).await {
                error!("HTTP server error: {e}");
            }
        }
    });

    let client = Client::try_default().await?;
    let registry = Arc::new(ResourceRegistry::new());
    let ctx = Arc::new(Context::new(client.clone(), registry.clone()));

    // Session invalidation runs on dedicated watch tasks: a spec-generation
    // change or a deletion cancels the resource's in-flight requests and
    // drops its cached client and auth.
    tokio::spawn(watch_for_invalidation(
        Api::<KMSSecret>::all(client.clone()),
        registry.clone(),
    ));
    tokio::spawn(watch_for_invalidation(
        Api::<KMSPushSecret>::all(client.clone()),
        registry.clone(),
    ));
    tokio::spawn(watch_for_invalidation(
        Api::<KMSDynamicSecret>::all(client.clone()),
        registry.clone(),
    ));

    let pull_controller = Controller::new(
        Api::<KMSSecret>::all(client.clone()),
        watcher::Config::default(),
    )
    .shutdown_on_signal()
    .run(
        reconciler::pull::reconcile,
        reconciler::pull::error_policy,
        ctx.clone(),
    )
    .for_each(|_| std::future::ready(()));

    // The push controller also wakes up when a referenced source Secret or
    // ClusterGenerator changes.
    let push_controller = Controller::new(
        Api::<KMSPushSecret>::all(client.clone()),
        watcher::Config::default(),
    );
    let source_secret_store = push_controller.store();
    let generator_store = push_controller.store();
    let push_controller = push_controller
        .watches(
            Api::<Secret>::all(client.clone()),
            watcher::Config::default(),
            move |secret| {
                let name = secret.metadata.name.unwrap_or_default();
                let namespace = secret.metadata.namespace.unwrap_or_default();
                source_secret_store
                    .state()
                    .into_iter()
                    .filter(|push_secret| {
                        push_secret
                            .spec
                            .push
                            .secret
                            .as_ref()
                            .map(|source| {
                                source.secret_name == name && source.secret_namespace == namespace
                            })
                            .unwrap_or(false)
                    })
                    .map(|push_secret| ObjectRef::from_obj(&*push_secret))
                    .collect::<Vec<_>>()
            },
        )
        .watches(
            Api::<ClusterGenerator>::all(client.clone()),
            watcher::Config::default(),
            move |generator| {
                let name = generator.metadata.name.unwrap_or_default();
                generator_store
                    .state()
                    .into_iter()
                    .filter(|push_secret| {
                        push_secret
                            .spec
                            .push
                            .generators
                            .iter()
                            .any(|entry| entry.generator_ref.name == name)
                    })
                    .map(|push_secret| ObjectRef::from_obj(&*push_secret))
                    .collect::<Vec<_>>()
            },
        )
        .shutdown_on_signal()
        .run(
            reconciler::push::reconcile,
            reconciler::push::error_policy,
            ctx.clone(),
        )
        .for_each(|_| std::future::ready(()));

    let dynamic_controller = Controller::new(
        Api::<KMSDynamicSecret>::all(client.clone()),
        watcher::Config::default(),
    )
    .shutdown_on_signal()
    .run(
        reconciler::dynamic::reconcile,
        reconciler::dynamic::error_policy,
        ctx.clone(),
    )
    .for_each(|_| std::future::ready(()));

    server_state.is_ready.store(true, Ordering::Relaxed);

    futures::join!(pull_controller, push_controller, dynamic_controller);

    info!("operator stopped");
    Ok(())
}
