//! SQLite audit store.
//!
//! Uses [`sqlx`] with the `sqlite` feature.  Migrations are embedded with
//! `sqlx::migrate!("./migrations")` (resolved relative to the crate root at
//! compile time) and run by [`SqliteAuditStore::connect`].  Queries use the
//! runtime-checked `sqlx::query` form so no `DATABASE_URL` is needed to build.

use std::str::FromStr;

use anyhow::Context;
use skinlens_core::{AuditEvent, EventSink};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use super::AuditRecord;

/// SQLite-backed audit-event store.
#[derive(Clone, Debug)]
pub struct SqliteAuditStore {
    pool: SqlitePool,
}

impl SqliteAuditStore {
    /// Open (or create) the database at `url` and run pending migrations.
    ///
    /// `url` is a sqlx SQLite URL such as `"sqlite://skinlens.db"`.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self, sqlx::Error> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn insert(&self, record: &AuditRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO audit_events (id, body, status, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(record.id.to_string())
        .bind(&record.body)
        .bind(record.status.as_ref())
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of stored audit rows.
    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM audit_events")
            .fetch_one(&self.pool)
            .await
    }

    /// Close every pooled connection; later queries fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl EventSink for SqliteAuditStore {
    async fn append(&self, event: AuditEvent) -> anyhow::Result<()> {
        let record = AuditRecord::from(event);
        self.insert(&record)
            .await
            .with_context(|| format!("insert audit event {}", record.id))?;
        debug!(id = %record.id, status = %record.status, "audit event stored");
        Ok(())
    }
}
