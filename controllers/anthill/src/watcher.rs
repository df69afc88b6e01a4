//! GlusterCluster watch.
//!
//! A `kube::runtime` watcher feeds a reflector store, which is the cache the
//! coordinator consults for stale events, and an [`EventAdapter`] that turns
//! raw watch events into [`WorkItem`]s for the queue.

use crate::error::ControllerError;
use crate::queue::{WorkItem, WorkQueue};
use crds::GlusterCluster;
use futures::StreamExt;
use kube::Api;
use kube::ResourceExt;
use kube_runtime::reflector::{ObjectRef, Store, store::Writer};
use kube_runtime::{WatchStreamExt, watcher};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Read access to the locally cached clusters.
pub trait ClusterCache: Send + Sync {
    /// Cached copy of a cluster, if any.
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<GlusterCluster>>;
}

impl ClusterCache for Store<GlusterCluster> {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<GlusterCluster>> {
        Store::get(self, &ObjectRef::new(name).within(namespace))
    }
}

fn key(cluster: &GlusterCluster) -> String {
    format!("{}/{}", cluster.namespace().unwrap_or_default(), cluster.name_any())
}

/// Maps watch events onto work items.
///
/// Remembers the last object delivered per key so an `Apply` of a known
/// object becomes `Updated { old, new }`. Relisted objects are held back
/// until `InitDone`, when the reflector commits them to the store; objects
/// missing from the relist are then reported as deleted.
#[derive(Debug, Default)]
pub struct EventAdapter {
    last: HashMap<String, Arc<GlusterCluster>>,
    relisted: Option<Vec<GlusterCluster>>,
}

impl EventAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn applied(&mut self, cluster: GlusterCluster) -> WorkItem {
        let key = key(&cluster);
        let new = Arc::new(cluster);
        match self.last.insert(key, Arc::clone(&new)) {
            Some(old) => WorkItem::Updated { old, new },
            None => WorkItem::Created { new },
        }
    }

    /// Work items for one watch event.
    pub fn translate(&mut self, event: watcher::Event<GlusterCluster>) -> Vec<WorkItem> {
        match event {
            watcher::Event::Apply(cluster) => vec![self.applied(cluster)],
            watcher::Event::InitApply(cluster) => match self.relisted.as_mut() {
                Some(pending) => {
                    pending.push(cluster);
                    Vec::new()
                }
                None => vec![self.applied(cluster)],
            },
            watcher::Event::Delete(cluster) => {
                self.last.remove(&key(&cluster));
                vec![WorkItem::Deleted {
                    old: Arc::new(cluster),
                }]
            }
            watcher::Event::Init => {
                // An interrupted relist restarts from scratch
                self.relisted = Some(Vec::new());
                Vec::new()
            }
            watcher::Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return Vec::new();
                };
                let seen: HashSet<String> = relisted.iter().map(key).collect();
                let mut items: Vec<WorkItem> = relisted.into_iter().map(|cluster| self.applied(cluster)).collect();

                let gone: Vec<String> = self
                    .last
                    .keys()
                    .filter(|key| !seen.contains(*key))
                    .cloned()
                    .collect();
                items.extend(
                    gone.into_iter()
                        .filter_map(|key| self.last.remove(&key))
                        .map(|old| WorkItem::Deleted { old }),
                );
                items
            }
        }
    }
}

/// Watch clusters until cancelled, updating the cache and feeding the queue.
pub async fn watch_clusters(
    api: Api<GlusterCluster>,
    writer: Writer<GlusterCluster>,
    queue: Arc<WorkQueue>,
    cancel: CancellationToken,
) -> Result<(), ControllerError> {
    info!("Starting GlusterCluster watcher");
    let mut adapter = EventAdapter::new();
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .boxed();

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                for item in adapter.translate(event) {
                    debug!(cluster = %item.key(), "Queueing work item");
                    queue.add(item);
                }
            }
            Some(Err(e)) => warn!(error = %e, "GlusterCluster watch error"),
            None => return Err(ControllerError::Watch("watch stream ended".to_string())),
        }
    }

    info!("GlusterCluster watcher stopped");
    Ok(())
}
