//! libSQL backend — async `IntakeStore` implementation.
//!
//! Supports local file and in-memory databases. All outcome mutation goes
//! through `finalize`, a single guarded UPDATE per row.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::connector::RawMessage;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    EmailStatus, EnqueueOutcome, FinalizeUpdate, IncomingEmail, IntakeStore, ProcessingStats,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Intake database opened");

        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn status_to_str(status: &EmailStatus) -> &'static str {
    match status {
        EmailStatus::Pending => "pending",
        EmailStatus::Processed => "processed",
        EmailStatus::Failed => "failed",
        EmailStatus::NeedsReview => "needs_review",
    }
}

fn str_to_status(s: &str) -> EmailStatus {
    match s {
        "processed" => EmailStatus::Processed,
        "failed" => EmailStatus::Failed,
        "needs_review" => EmailStatus::NeedsReview,
        _ => EmailStatus::Pending,
    }
}

fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_int(n: Option<u8>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n as i64),
        None => libsql::Value::Null,
    }
}

const EMAIL_COLUMNS: &str = "id, message_id, from_address, subject, body, received_at, status, \
                             processed_at, booking_id, confidence, extracted_data, created_at";

/// Map a libsql row to an IncomingEmail. Column order matches EMAIL_COLUMNS.
fn row_to_email(row: &libsql::Row) -> Result<IncomingEmail, libsql::Error> {
    let received_str: String = row.get(5)?;
    let status_str: String = row.get(6)?;
    let processed_str: Option<String> = row.get(7).ok();
    let confidence: Option<i64> = row.get(9).ok();
    let extracted_str: Option<String> = row.get(10).ok();
    let created_str: String = row.get(11)?;

    Ok(IncomingEmail {
        id: row.get(0)?,
        message_id: row.get(1)?,
        from_address: row.get(2)?,
        subject: row.get(3)?,
        body: row.get(4)?,
        received_at: parse_datetime(&received_str),
        status: str_to_status(&status_str),
        processed_at: processed_str.as_deref().map(parse_datetime),
        booking_id: row.get(8).ok(),
        confidence: confidence.map(|c| c.clamp(0, 100) as u8),
        extracted_data: extracted_str.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_datetime(&created_str),
    })
}

// ── IntakeStore implementation ──────────────────────────────────────

#[async_trait]
impl IntakeStore for LibSqlBackend {
    async fn enqueue(&self, raw: &RawMessage) -> Result<EnqueueOutcome, DatabaseError> {
        // Fast path: the message is already staged.
        if self.get_email_by_message_id(&raw.message_id).await?.is_some() {
            debug!(message_id = %raw.message_id, "Duplicate message skipped");
            return Ok(EnqueueOutcome::Duplicate);
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let conn = self.conn();

        let result = conn
            .execute(
                "INSERT INTO incoming_emails (id, message_id, from_address, subject, body,
                    received_at, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
                params![
                    id.clone(),
                    raw.message_id.clone(),
                    raw.from.clone(),
                    raw.subject.clone(),
                    raw.body.clone(),
                    raw.received_at.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )
            .await;

        if let Err(e) = result {
            // Concurrent fetch of the same message: the UNIQUE constraint
            // fired between our existence check and the insert.
            if e.to_string().contains("UNIQUE") {
                debug!(message_id = %raw.message_id, "Duplicate message skipped (insert race)");
                return Ok(EnqueueOutcome::Duplicate);
            }
            return Err(DatabaseError::Query(format!("enqueue: {e}")));
        }

        debug!(id = %id, message_id = %raw.message_id, "Email queued");

        Ok(EnqueueOutcome::Queued(IncomingEmail {
            id,
            message_id: raw.message_id.clone(),
            from_address: raw.from.clone(),
            subject: raw.subject.clone(),
            body: raw.body.clone(),
            received_at: raw.received_at,
            status: EmailStatus::Pending,
            processed_at: None,
            booking_id: None,
            confidence: None,
            extracted_data: None,
            created_at: now,
        }))
    }

    async fn get_email(&self, id: &str) -> Result<Option<IncomingEmail>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {EMAIL_COLUMNS} FROM incoming_emails WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_email: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let email = row_to_email(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(email))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_email: {e}"))),
        }
    }

    async fn get_email_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<IncomingEmail>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {EMAIL_COLUMNS} FROM incoming_emails WHERE message_id = ?1"),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_email_by_message_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let email = row_to_email(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(email))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_email_by_message_id: {e}"))),
        }
    }

    async fn list_pending(&self) -> Result<Vec<IncomingEmail>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {EMAIL_COLUMNS} FROM incoming_emails \
                     WHERE status = 'pending' ORDER BY received_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_pending: {e}")))?;

        let mut emails = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_email(&row) {
                Ok(email) => emails.push(email),
                Err(e) => {
                    tracing::warn!("Skipping email row: {e}");
                }
            }
        }
        Ok(emails)
    }

    async fn finalize(&self, id: &str, update: &FinalizeUpdate) -> Result<(), DatabaseError> {
        if update.status == EmailStatus::Pending {
            return Err(DatabaseError::Constraint(
                "finalize cannot set status back to pending".to_string(),
            ));
        }
        if update.booking_id.is_some() && update.status != EmailStatus::Processed {
            return Err(DatabaseError::Constraint(format!(
                "booking_id requires status processed, got {}",
                status_to_str(&update.status)
            )));
        }

        let extracted = serde_json::to_string(&update.extracted_data)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let conn = self.conn();
        let affected = conn
            .execute(
                "UPDATE incoming_emails
                 SET status = ?1, processed_at = ?2, booking_id = ?3,
                     confidence = ?4, extracted_data = ?5
                 WHERE id = ?6 AND status = 'pending'",
                params![
                    status_to_str(&update.status),
                    Utc::now().to_rfc3339(),
                    opt_text_owned(update.booking_id.clone()),
                    opt_int(update.confidence),
                    extracted,
                    id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finalize: {e}")))?;

        if affected == 0 {
            // Distinguish "no such row" from "already finalized".
            return match self.get_email(id).await? {
                Some(existing) => Err(DatabaseError::Constraint(format!(
                    "email {id} already finalized as {}",
                    status_to_str(&existing.status)
                ))),
                None => Err(DatabaseError::NotFound {
                    entity: "incoming_email".to_string(),
                    id: id.to_string(),
                }),
            };
        }

        debug!(id = id, status = ?update.status, "Email finalized");
        Ok(())
    }

    async fn processing_stats(&self) -> Result<ProcessingStats, DatabaseError> {
        let conn = self.conn();

        let mut stats = ProcessingStats::default();

        let mut rows = conn
            .query(
                "SELECT status, COUNT(*) FROM incoming_emails GROUP BY status",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("processing_stats: {e}")))?;

        while let Ok(Some(row)) = rows.next().await {
            let status: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            let count: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            let count = count.max(0) as u64;
            stats.total += count;
            match str_to_status(&status) {
                EmailStatus::Pending => stats.pending = count,
                EmailStatus::Processed => stats.processed = count,
                EmailStatus::Failed => stats.failed = count,
                EmailStatus::NeedsReview => stats.needs_review = count,
            }
        }

        let mut rows = conn
            .query(
                "SELECT COUNT(booking_id), AVG(confidence) FROM incoming_emails
                 WHERE status != 'pending'",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("processing_stats: {e}")))?;

        if let Ok(Some(row)) = rows.next().await {
            let bookings: i64 = row.get(0).unwrap_or(0);
            stats.bookings_created = bookings.max(0) as u64;
            stats.average_confidence = row.get::<f64>(1).ok();
        }

        Ok(stats)
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT value FROM connector_config WHERE key = ?1",
                params![key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_config: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_config: {e}"))),
        }
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO connector_config (key, value, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
            params![key, value],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("set_config: {e}")))?;
        Ok(())
    }
}
