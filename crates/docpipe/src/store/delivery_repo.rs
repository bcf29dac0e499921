//! Delivery-attempt repository.
//!
//! Each webhook attempt is persisted with its scheduled time, so a process
//! restart can see which jobs still owe the caller a callback.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use super::{Database, StoreError};
use crate::deliver::DeliveryStatus;

/// One persisted webhook attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryAttemptRow {
    pub job_id: String,
    /// 1-based.
    pub attempt_number: u32,
    pub scheduled_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub last_error: Option<String>,
}

fn conversion_error(column: &str, reason: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("{column}: {reason}").into(),
    )
}

fn from_row(row: &Row<'_>) -> Result<DeliveryAttemptRow, rusqlite::Error> {
    let scheduled_raw: String = row.get("scheduled_at")?;
    let status_raw: String = row.get("status")?;
    Ok(DeliveryAttemptRow {
        job_id: row.get("job_id")?,
        attempt_number: row.get("attempt_number")?,
        scheduled_at: DateTime::parse_from_rfc3339(&scheduled_raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion_error("scheduled_at", e))?,
        status: DeliveryStatus::parse(&status_raw)
            .ok_or_else(|| conversion_error("status", format!("unknown status '{status_raw}'")))?,
        last_error: row.get("last_error")?,
    })
}

/// Inserts or replaces one attempt row. Replacing is how a Pending attempt
/// becomes Delivered or Exhausted.
pub fn record(db: &Database, attempt: &DeliveryAttemptRow) -> Result<(), StoreError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT OR REPLACE INTO delivery_attempts
             (job_id, attempt_number, scheduled_at, status, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                attempt.job_id,
                attempt.attempt_number,
                attempt.scheduled_at.to_rfc3339(),
                attempt.status.as_str(),
                attempt.last_error,
            ],
        )?;
        Ok(())
    })
}

/// All attempts for one job, in attempt order.
pub fn list_for_job(db: &Database, job_id: &str) -> Result<Vec<DeliveryAttemptRow>, StoreError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM delivery_attempts WHERE job_id = ?1 ORDER BY attempt_number ASC",
        )?;
        let rows = stmt.query_map(params![job_id], from_row)?;
        let mut attempts = Vec::new();
        for row in rows {
            attempts.push(row?);
        }
        Ok(attempts)
    })
}

/// Job ids whose most recent attempt is still Pending — deliveries owed
/// after a restart.
pub fn jobs_with_pending_delivery(db: &Database) -> Result<Vec<String>, StoreError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT job_id FROM delivery_attempts a
             WHERE attempt_number = (SELECT MAX(attempt_number) FROM delivery_attempts
                                     WHERE job_id = a.job_id)
               AND status = 'Pending'
             ORDER BY job_id",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut job_ids = Vec::new();
        for row in rows {
            job_ids.push(row?);
        }
        Ok(job_ids)
    })
}
