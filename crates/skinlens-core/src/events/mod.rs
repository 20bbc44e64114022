//! Audit-event pipeline.
//!
//! Request handlers publish [`AuditEvent`]s onto a bounded queue; one
//! [`EventConsumer`] drains it into an [`EventSink`].  A full queue suspends
//! the publisher.  Persistence failures are logged and counted but never stop
//! the consumer.
//!
//! ```text
//!   Running ──cancel──▶ Draining ──queue empty──▶ Stopped
//!      │                    ▲
//!      └──all publishers────┘
//!         dropped
//! ```

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Queue capacity used when none is configured.
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EventStatus {
    Success,
    Fail,
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    body: String,
    status: EventStatus,
    created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(status: EventStatus, body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            status,
            created_at: Utc::now(),
        }
    }

    /// Event whose body is the serialized JSON `payload`.
    pub fn json(status: EventStatus, payload: &serde_json::Value) -> Self {
        Self::new(status, payload.to_string())
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn status(&self) -> EventStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Where consumed events are persisted.
pub trait EventSink: Send + Sync {
    fn append(&self, event: AuditEvent) -> impl Future<Output = anyhow::Result<()>> + Send;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("event pipeline is shutting down")]
    ShuttingDown,

    #[error("event pipeline is closed")]
    Closed,
}

/// Create a connected publisher/consumer pair.
///
/// A `capacity` of zero is raised to one.
pub fn bounded(capacity: usize, shutdown: CancellationToken) -> (EventPublisher, EventConsumer) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    debug!(capacity, "event pipeline created");
    (
        EventPublisher {
            tx,
            shutdown: shutdown.clone(),
        },
        EventConsumer {
            rx,
            shutdown,
            state: ConsumerState::Running,
        },
    )
}

/// Cloneable producing half.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<AuditEvent>,
    shutdown: CancellationToken,
}

impl EventPublisher {
    /// Enqueue one event, waiting while the queue is full.
    pub async fn publish(&self, event: AuditEvent) -> Result<(), PipelineError> {
        if self.shutdown.is_cancelled() {
            return Err(PipelineError::ShuttingDown);
        }
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(PipelineError::ShuttingDown),
            sent = self.tx.send(event) => sent.map_err(|_| PipelineError::Closed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConsumerState {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub persisted: u64,
    pub failed: u64,
}

/// The single consuming half.
#[derive(Debug)]
pub struct EventConsumer {
    rx: mpsc::Receiver<AuditEvent>,
    shutdown: CancellationToken,
    state: ConsumerState,
}

impl EventConsumer {
    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Consume until cancelled or every publisher is dropped, then drain what
    /// is still queued.
    pub async fn run<S: EventSink>(mut self, sink: S) -> ConsumerStats {
        let mut stats = ConsumerStats::default();
        info!("event consumer started");

        loop {
            match self.state {
                ConsumerState::Running => {
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => {
                            self.rx.close();
                            self.transition(ConsumerState::Draining);
                        }
                        received = self.rx.recv() => match received {
                            Some(event) => persist(&sink, event, &mut stats).await,
                            None => self.transition(ConsumerState::Draining),
                        },
                    }
                }
                ConsumerState::Draining => {
                    while let Some(event) = self.rx.recv().await {
                        persist(&sink, event, &mut stats).await;
                    }
                    self.transition(ConsumerState::Stopped);
                }
                ConsumerState::Stopped => break,
            }
        }

        info!(
            persisted = stats.persisted,
            failed = stats.failed,
            "event consumer stopped"
        );
        stats
    }

    fn transition(&mut self, next: ConsumerState) {
        debug!(from = %self.state, to = %next, "event consumer state change");
        self.state = next;
    }
}

async fn persist<S: EventSink>(sink: &S, event: AuditEvent, stats: &mut ConsumerStats) {
    let status = event.status();
    match sink.append(event).await {
        Ok(()) => stats.persisted += 1,
        Err(e) => {
            stats.failed += 1;
            warn!(error = %e, %status, "failed to persist audit event");
        }
    }
}
