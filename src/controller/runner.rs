//! Wiring of the reconcile loops into kube-runtime controllers

use std::sync::Arc;

use futures::future::join_all;
use futures::StreamExt;
use kube::api::DynamicObject;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::reconcile_loop::{error_policy, reconcile, Context, ReconcileLoop};
use crate::builder::{builder_for, MANAGED_BY, MANAGED_BY_LABEL};
use crate::client::{KubeCollectorClient, KubeResourceStore, FIELD_MANAGER};
use crate::config::OperatorConfig;
use crate::crd::FlowCollector;
use crate::events::KubeEventPublisher;

/// Build the shared context against a live cluster
pub fn kube_context(client: Client, config: &OperatorConfig, shutdown: CancellationToken) -> Context {
    Context::builder(
        Arc::new(KubeCollectorClient::new(client.clone())),
        Arc::new(KubeResourceStore::new(client.clone())),
    )
    .components(&config.enabled_components())
    .retry(config.retry())
    .events(Arc::new(KubeEventPublisher::new(client, FIELD_MANAGER)))
    .resync(config.resync())
    .pass_timeout(config.pass_timeout())
    .shutdown(shutdown)
    .build()
}

/// Run one controller per enabled component until `shutdown` fires.
///
/// Each controller watches the FlowCollectors and the kinds its component
/// owns, so a change to an owned object triggers a pass of that component
/// only.
pub async fn run(client: Client, config: &OperatorConfig, shutdown: CancellationToken) {
    let ctx = Arc::new(kube_context(client.clone(), config, shutdown.clone()));
    let owned_selector = format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY);

    let controllers = config.enabled_components().into_iter().map(|component| {
        let lp = Arc::new(ReconcileLoop::new(builder_for(component), ctx.clone()));
        let mut controller = Controller::new(
            Api::<FlowCollector>::all(client.clone()),
            WatcherConfig::default(),
        );
        for kind in lp.builder().owned_kinds() {
            let ar = kind.api_resource();
            controller = controller.owns_with(
                Api::<DynamicObject>::all_with(client.clone(), &ar),
                ar,
                WatcherConfig::default().labels(&owned_selector),
            );
        }
        info!(%component, "starting reconcile loop");

        controller
            .graceful_shutdown_on(shutdown.clone().cancelled_owned())
            .run(reconcile, error_policy, lp)
            .for_each(move |result| async move {
                match result {
                    Ok((obj, action)) => {
                        debug!(%component, collector = %obj.name, ?action, "pass completed");
                    }
                    Err(e) => {
                        error!(%component, error = ?e, "reconciliation error");
                    }
                }
            })
    });

    join_all(controllers).await;
    info!("all reconcile loops stopped");
}
