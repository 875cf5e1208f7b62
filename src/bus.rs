//! Process-local event bus for pipeline stage transitions
//!
//! Fan-out of pipeline events to subscribers (WebSocket connections, the log
//! subscriber). Delivery is best-effort and lossy under subscriber slowness:
//! each subscriber owns a bounded queue and is dropped when it overflows.
//! The durable record lives on-ledger; freshness beats completeness here.
//!
//! Per-request ordering is preserved: events for one request are enqueued to
//! each surviving subscriber in emission order.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pipeline::Stage;

/// Default per-subscriber queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Stage transition status carried by every bus event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    Completed,
    Failed,
    Pending,
    Shutdown,
}

/// A pipeline progress event
#[derive(Debug, Clone, Serialize)]
pub struct PipelineEvent {
    pub request_id: u64,
    pub stage: Stage,
    pub status: EventStatus,
    pub message: String,
    /// RFC3339 emission timestamp
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl PipelineEvent {
    pub fn new(request_id: u64, stage: Stage, status: EventStatus, message: impl Into<String>) -> Self {
        Self {
            request_id,
            stage,
            status,
            message: message.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

struct BusSubscriber {
    id: Uuid,
    /// Only events for this request id are delivered; `None` receives all
    filter: Option<u64>,
    tx: mpsc::Sender<PipelineEvent>,
}

/// Publish-subscribe hub for pipeline events
///
/// Publication takes the read side of the subscriber set; subscribe and
/// unsubscribe take the write side. Overflowing or disconnected subscribers
/// are pruned after the publish pass, never blocking the publisher.
pub struct EventBus {
    subscribers: RwLock<Vec<BusSubscriber>>,
    queue_capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(queue_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            queue_capacity,
        }
    }

    /// Register a subscriber with an optional request-id filter.
    ///
    /// Returns the subscriber id (for `unsubscribe`) and the event receiver.
    pub async fn subscribe(&self, filter: Option<u64>) -> (Uuid, mpsc::Receiver<PipelineEvent>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = Uuid::new_v4();
        let mut subs = self.subscribers.write().await;
        subs.push(BusSubscriber { id, filter, tx });
        debug!(subscriber = %id, filter = ?filter, "Bus subscriber registered");
        (id, rx)
    }

    /// Remove a subscriber
    pub async fn unsubscribe(&self, id: Uuid) {
        let mut subs = self.subscribers.write().await;
        subs.retain(|s| s.id != id);
    }

    /// Publish an event to all matching subscribers.
    ///
    /// A subscriber whose queue is full (or whose receiver is gone) is
    /// dropped from the set.
    pub async fn publish(&self, event: PipelineEvent) {
        let mut dead: Vec<Uuid> = Vec::new();

        {
            let subs = self.subscribers.read().await;
            for sub in subs.iter() {
                if let Some(filter_id) = sub.filter {
                    if filter_id != event.request_id {
                        continue;
                    }
                }
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            subscriber = %sub.id,
                            request_id = event.request_id,
                            "Bus subscriber queue overflow, dropping subscriber"
                        );
                        dead.push(sub.id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(sub.id);
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut subs = self.subscribers.write().await;
            subs.retain(|s| !dead.contains(&s.id));
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the log subscriber: every bus event becomes a structured log line
pub fn spawn_log_subscriber(bus: Arc<EventBus>) {
    tokio::spawn(async move {
        let (_id, mut rx) = bus.subscribe(None).await;
        while let Some(event) = rx.recv().await {
            match event.status {
                EventStatus::Failed => warn!(
                    request_id = event.request_id,
                    stage = ?event.stage,
                    message = %event.message,
                    "Pipeline stage failed"
                ),
                _ => debug!(
                    request_id = event.request_id,
                    stage = ?event.stage,
                    status = ?event.status,
                    message = %event.message,
                    "Pipeline event"
                ),
            }
        }
    });
}
