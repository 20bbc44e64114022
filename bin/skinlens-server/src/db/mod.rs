//! Audit persistence.
//!
//! The event consumer writes through [`skinlens_core::EventSink`]; the only
//! implementation is [`sqlite::SqliteAuditStore`].

pub mod sqlite;

use chrono::{DateTime, Utc};
use skinlens_core::{AuditEvent, EventStatus};
use uuid::Uuid;

/// A single row in the `audit_events` table.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub id: Uuid,
    /// Serialized JSON describing the request and its outcome.
    pub body: String,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
}

impl From<AuditEvent> for AuditRecord {
    fn from(event: AuditEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: event.status(),
            created_at: event.created_at(),
            body: event.body().to_owned(),
        }
    }
}
