//! Kubernetes events recorded against a GitRepo.

use crate::crd::GitRepo;
use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// Sink for user-visible events
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, repo: &GitRepo, kind: EventKind, reason: &str, message: &str);
}

/// Publishes events through the events.k8s.io API
#[derive(Clone)]
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl std::fmt::Debug for KubeEventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventRecorder").finish_non_exhaustive()
    }
}

impl KubeEventRecorder {
    #[must_use]
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, repo: &GitRepo, kind: EventKind, reason: &str, message: &str) {
        let event = Event {
            type_: match kind {
                EventKind::Normal => EventType::Normal,
                EventKind::Warning => EventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: reason.to_string(),
            secondary: None,
        };
        // Events are best effort; a failed publish never fails the caller
        if let Err(e) = self.recorder.publish(&event, &repo.object_ref(&())).await {
            warn!(
                resource.name = repo.name(),
                reason = reason,
                "Failed to publish event: {}",
                e
            );
        }
    }
}
