//! Kubernetes Event recording.
//!
//! Events are fire-and-forget: failures are logged and never propagate,
//! so a failed event cannot break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

/// Reporting controller shown on every event.
pub const REPORTING_CONTROLLER: &str = "anthill-controller";

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event on the given resource.
    ///
    /// * `reason` - Machine-readable reason (see [`reasons`])
    /// * `action` - What the controller was doing
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl std::fmt::Debug for KubeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventPublisher").finish_non_exhaustive()
    }
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as [`REPORTING_CONTROLLER`].
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: REPORTING_CONTROLLER.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Event reasons, shown under REASON in `kubectl get events`.
pub mod reasons {
    /// Every dependent object exists and the topology is registered
    pub const SYNCED: &str = "Synced";
    /// Reconciliation failed and will be retried
    pub const SYNC_FAILED: &str = "SyncFailed";
    /// Cascade teardown finished
    pub const DELETED: &str = "Deleted";
}

/// Event actions.
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const TEARDOWN: &str = "Teardown";
}

/// Note attached to the Synced event.
pub const SYNCED_MESSAGE: &str = "GlusterCluster synchronized";
