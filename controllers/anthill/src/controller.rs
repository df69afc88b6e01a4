//! Main controller implementation.
//!
//! Wires the watcher, the work queue and the coordinator together and runs
//! them until cancelled.

use crate::config::RunArgs;
use crate::coordinator::Coordinator;
use crate::error::ControllerError;
use crate::events::KubeEventPublisher;
use crate::exec::{DeviceWiper, KubePodExec};
use crate::orchestrator::Orchestrator;
use crate::queue::WorkQueue;
use crate::store::{KubeObjectStore, ObjectStore};
use crate::topology::HeketiClientFactory;
use crate::watcher::watch_clusters;
use crds::GlusterCluster;
use kube_runtime::reflector;
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Main controller for GlusterCluster resources.
pub struct Controller {
    args: RunArgs,
    client: Client,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller").field("args", &self.args).finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(args: RunArgs) -> Result<Self, ControllerError> {
        info!("Initializing Anthill controller");
        args.validate()?;
        let client = Client::try_default().await?;
        Ok(Self { args, client })
    }

    /// Run until `cancel` fires or the watch fails.
    ///
    /// Workers finish the item they hold; queued items are abandoned.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ControllerError> {
        let Self { args, client } = self;

        let api: Api<GlusterCluster> = match &args.namespace {
            Some(namespace) => Api::namespaced(client.clone(), namespace),
            None => Api::all(client.clone()),
        };
        info!("Namespace: {}", args.namespace.as_deref().unwrap_or("all namespaces"));

        let (cache, writer) = reflector::store::<GlusterCluster>();
        let queue = Arc::new(WorkQueue::new());

        let store: Arc<dyn ObjectStore> = Arc::new(KubeObjectStore::new(client.clone()));
        let wiper = DeviceWiper::new(
            Arc::clone(&store),
            Arc::new(KubePodExec::new(client.clone())),
            cancel.child_token(),
        );
        let orchestrator = Orchestrator::new(
            Arc::clone(&store),
            wiper,
            args.rollout_poll_interval(),
            args.cluster_role.clone(),
        );
        let coordinator = Arc::new(Coordinator::new(
            Arc::new(cache.clone()),
            store,
            orchestrator,
            Arc::new(HeketiClientFactory),
            Arc::new(KubeEventPublisher::new(client)),
            args.status_retries,
        ));

        let mut watcher = tokio::spawn(watch_clusters(api, writer, Arc::clone(&queue), cancel.clone()));

        info!("Waiting for informer caches to sync");
        tokio::select! {
            ready = cache.wait_until_ready() => {
                ready.map_err(|e| ControllerError::Watch(e.to_string()))?;
            }
            () = cancel.cancelled() => {
                queue.shut_down();
                return Ok(());
            }
        }

        info!(threadiness = args.threadiness, "Starting workers");
        let mut workers = JoinSet::new();
        for worker in 0..args.threadiness {
            let coordinator = Arc::clone(&coordinator);
            let queue = Arc::clone(&queue);
            workers.spawn(async move {
                while coordinator.process_next_item(&queue).await {}
                debug!(worker, "Worker stopped");
            });
        }
        info!("Started workers");

        let result = tokio::select! {
            () = cancel.cancelled() => Ok(()),
            joined = &mut watcher => joined
                .map_err(|e| ControllerError::Watch(e.to_string()))
                .and_then(|result| result),
        };

        info!("Shutting down workers");
        cancel.cancel();
        queue.shut_down();
        while workers.join_next().await.is_some() {}
        if !watcher.is_finished() {
            watcher.abort();
        }

        result
    }
}
