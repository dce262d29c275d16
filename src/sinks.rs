// Copyright 2025 Cowboy AI, LLC.

//! Outbound ports: client notifications and recompute requests
//!
//! Both run after a history move is committed. Their failures are logged by
//! the engine and never undo or fail the move.

use crate::identifiers::{DeltaId, WorkflowId};
use crate::notify::DeltaNotification;
use async_nats::jetstream;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Errors raised while delivering to an outbound port
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    /// The message could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The transport rejected or lost the message
    #[error("Publish error: {0}")]
    Publish(String),
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        SinkError::Serialization(err.to_string())
    }
}

/// Delivers notifications to the workflow's connected clients
#[async_trait]
pub trait NotificationSink: Send + Sync + fmt::Debug {
    /// Send one notification; best effort
    async fn notify(
        &self,
        workflow_id: WorkflowId,
        notification: &DeltaNotification,
    ) -> Result<(), SinkError>;
}

/// Queues renders of a workflow
///
/// Consumers deduplicate requests; the engine sends one per history move
/// that invalidated a live step.
#[async_trait]
pub trait RecomputeScheduler: Send + Sync + fmt::Debug {
    /// Request a render that reaches `delta_id`
    async fn schedule_recompute(
        &self,
        workflow_id: WorkflowId,
        delta_id: DeltaId,
    ) -> Result<(), SinkError>;
}

/// Body of a recompute request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecomputeRequest {
    /// Workflow to render
    pub workflow_id: WorkflowId,
    /// Delta the render must reach
    pub delta_id: DeltaId,
}

/// Notification sink keeping everything it receives
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<RwLock<Vec<DeltaNotification>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingNotifier {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `notify` fail without recording
    pub fn fail_deliveries(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Notifications received so far
    pub async fn notifications(&self) -> Vec<DeltaNotification> {
        self.sent.read().await.clone()
    }

    /// Most recent notification
    pub async fn last(&self) -> Option<DeltaNotification> {
        self.sent.read().await.last().cloned()
    }

    /// Forget everything received
    pub async fn clear(&self) {
        self.sent.write().await.clear();
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(
        &self,
        _workflow_id: WorkflowId,
        notification: &DeltaNotification,
    ) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Publish("delivery disabled".to_string()));
        }
        self.sent.write().await.push(notification.clone());
        Ok(())
    }
}

/// Recompute scheduler keeping every request
#[derive(Debug, Clone, Default)]
pub struct RecordingScheduler {
    requests: Arc<RwLock<Vec<RecomputeRequest>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingScheduler {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later request fail without recording
    pub fn fail_deliveries(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Requests received so far
    pub async fn requests(&self) -> Vec<RecomputeRequest> {
        self.requests.read().await.clone()
    }

    /// Forget everything received
    pub async fn clear(&self) {
        self.requests.write().await.clear();
    }
}

#[async_trait]
impl RecomputeScheduler for RecordingScheduler {
    async fn schedule_recompute(
        &self,
        workflow_id: WorkflowId,
        delta_id: DeltaId,
    ) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Publish("scheduling disabled".to_string()));
        }
        self.requests.write().await.push(RecomputeRequest {
            workflow_id,
            delta_id,
        });
        Ok(())
    }
}

/// Publishes notifications on core NATS, one subject per workflow
#[derive(Clone)]
pub struct NatsNotifier {
    client: async_nats::Client,
    prefix: String,
}

impl NatsNotifier {
    /// Publish under `{prefix}.{workflow_id}`
    pub fn new(client: async_nats::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    /// Subject receiving a workflow's notifications
    pub fn subject(&self, workflow_id: WorkflowId) -> String {
        format!("{}.{}", self.prefix, workflow_id)
    }
}

impl fmt::Debug for NatsNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsNotifier")
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[async_trait]
impl NotificationSink for NatsNotifier {
    async fn notify(
        &self,
        workflow_id: WorkflowId,
        notification: &DeltaNotification,
    ) -> Result<(), SinkError> {
        let subject = self.subject(workflow_id);
        let payload = Bytes::from(notification.to_json()?);
        self.client
            .publish(subject.clone(), payload)
            .await
            .map_err(|e| SinkError::Publish(format!("Failed to publish to {}: {}", subject, e)))?;
        debug!(workflow_id = %workflow_id, subject = %subject, "Published delta notification");
        Ok(())
    }
}

/// Publishes recompute requests to a JetStream subject and waits for the ack
#[derive(Clone)]
pub struct NatsRecomputeScheduler {
    jetstream: jetstream::Context,
    subject: String,
}

impl NatsRecomputeScheduler {
    /// Publish requests to `subject`, which a stream must capture
    pub fn new(client: async_nats::Client, subject: impl Into<String>) -> Self {
        Self {
            jetstream: jetstream::new(client),
            subject: subject.into(),
        }
    }
}

impl fmt::Debug for NatsRecomputeScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsRecomputeScheduler")
            .field("subject", &self.subject)
            .finish()
    }
}

#[async_trait]
impl RecomputeScheduler for NatsRecomputeScheduler {
    async fn schedule_recompute(
        &self,
        workflow_id: WorkflowId,
        delta_id: DeltaId,
    ) -> Result<(), SinkError> {
        let payload = serde_json::to_vec(&RecomputeRequest {
            workflow_id,
            delta_id,
        })?;
        let ack = self
            .jetstream
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| SinkError::Publish(format!("Failed to publish: {}", e)))?
            .await
            .map_err(|e| SinkError::Publish(format!("Recompute request not acknowledged: {}", e)))?;
        debug!(
            workflow_id = %workflow_id,
            delta_id = %delta_id,
            stream_seq = ack.sequence,
            "Scheduled recompute"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ApplyOutcome;
    use crate::document::WorkflowDocument;
    use serde_json::json;

    fn notification() -> DeltaNotification {
        let doc = WorkflowDocument::new("w", false);
        DeltaNotification::build(&doc, None, &ApplyOutcome::none())
    }

    #[tokio::test]
    async fn test_recording_notifier() {
        let sink = RecordingNotifier::new();
        let n = notification();
        sink.notify(n.workflow_id, &n).await.unwrap();
        assert_eq!(sink.notifications().await.len(), 1);
        assert_eq!(sink.last().await, Some(n.clone()));

        sink.fail_deliveries(true);
        assert!(sink.notify(n.workflow_id, &n).await.is_err());
        assert_eq!(sink.notifications().await.len(), 1);
    }

    #[tokio::test]
    async fn test_recording_scheduler() {
        let scheduler = RecordingScheduler::new();
        let workflow_id = WorkflowId::new();
        scheduler
            .schedule_recompute(workflow_id, DeltaId::new(3))
            .await
            .unwrap();
        assert_eq!(
            scheduler.requests().await,
            vec![RecomputeRequest {
                workflow_id,
                delta_id: DeltaId::new(3)
            }]
        );
        scheduler.clear().await;
        assert!(scheduler.requests().await.is_empty());
    }

    #[test]
    fn test_recompute_request_wire_format() {
        let workflow_id = WorkflowId::new();
        let request = RecomputeRequest {
            workflow_id,
            delta_id: DeltaId::new(12),
        };
        assert_eq!(
            serde_json::to_value(request).unwrap(),
            json!({"workflow_id": workflow_id.to_string(), "delta_id": 12})
        );
    }
}
