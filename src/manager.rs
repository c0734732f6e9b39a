use crate::{config::EngineConfig, crd::VMCluster, engine, errors::*, store::KubeStore};
use futures::{future::BoxFuture, FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{api::Api, client::Client, ResourceExt};
use kube_runtime::controller::{Action, Controller};
use kube_runtime::watcher;
use log::{debug, info, warn};
use std::sync::Arc;

pub const CRD_NAME: &str = "vmclusters.operator.victoriametrics.com";

// Context for our reconciler
struct Data {
    store: KubeStore,
    config: EngineConfig,
}

async fn reconcile(cluster: Arc<VMCluster>, ctx: Arc<Data>) -> Result<Action> {
    let outcome = engine::reconcile(&ctx.store, &cluster, &ctx.config).await?;
    debug!(
        "{}/{} settled on {:?}, next pass in {:?}",
        cluster.namespace().unwrap_or_default(),
        cluster.name_any(),
        outcome.status.phase,
        outcome.requeue_after
    );
    Ok(Action::requeue(outcome.requeue_after))
}

fn error_policy(cluster: Arc<VMCluster>, error: &Error, ctx: Arc<Data>) -> Action {
    warn!("reconcile of {} failed: {}", cluster.name_any(), error);
    Action::requeue(ctx.config.error_backoff)
}

pub struct Manager {}

/// Manager that owns a Controller for VMCluster
impl Manager {
    /// Lifecycle initialization interface for app
    ///
    /// This returns a `Manager` that drives a `Controller` + a future to be awaited
    /// It is up to `main` to wait for the controller stream.
    pub async fn new(client: Client, config: EngineConfig) -> Result<(Self, BoxFuture<'static, ()>)> {
        let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
        if crds.get_opt(CRD_NAME).await?.is_none() {
            bail!(ErrorKind::MissingCrd(CRD_NAME.to_string()));
        }

        let context = Arc::new(Data {
            store: KubeStore::new(client.clone()),
            config,
        });
        let clusters = Api::<VMCluster>::all(client.clone());

        let drainer = Controller::new(clusters, watcher::Config::default())
            .owns(Api::<StatefulSet>::all(client.clone()), watcher::Config::default())
            .owns(Api::<Deployment>::all(client.clone()), watcher::Config::default())
            .owns(Api::<Service>::all(client), watcher::Config::default())
            .run(reconcile, error_policy, context)
            .for_each(|res| {
                match res {
                    Ok((obj, action)) => info!("reconciled {}: {:?}", obj, action),
                    Err(e) => warn!("controller: {}", e),
                }
                futures::future::ready(())
            })
            .boxed();
        // the controller stream has to be consumed for anything to happen

        Ok((Self {}, drainer))
    }
}
