//! Job repository — CRUD for the `jobs` table.
//!
//! Costs are stored as decimal strings and timestamps as RFC3339 text;
//! parsing back is strict, a corrupted row surfaces as a conversion error
//! instead of silently defaulting.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use rust_decimal::Decimal;

use super::{Database, StoreError};
use crate::job::{Job, JobStatus};

/// Query filter for job listings. All fields are conjunctive.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub tenant_id: Option<String>,
    pub category_id: Option<u32>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

fn conversion_error(column: &str, reason: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("{column}: {reason}").into(),
    )
}

fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, e))
}

fn parse_decimal(column: &str, raw: &str) -> Result<Decimal, rusqlite::Error> {
    raw.parse().map_err(|e| conversion_error(column, e))
}

fn from_row(row: &Row<'_>) -> Result<Job, rusqlite::Error> {
    let status_raw: String = row.get("status")?;
    let started_raw: String = row.get("started_at")?;
    let finished_raw: Option<String> = row.get("finished_at")?;
    let ocr_raw: String = row.get("ocr_cost")?;
    let llm_raw: String = row.get("llm_cost")?;
    let total_raw: String = row.get("total_cost")?;
    let refs_raw: String = row.get("output_file_references")?;

    Ok(Job {
        job_id: row.get("job_id")?,
        tenant_id: row.get("tenant_id")?,
        category_id: row.get("category_id")?,
        status: JobStatus::parse(&status_raw)
            .ok_or_else(|| conversion_error("status", format!("unknown status '{status_raw}'")))?,
        source_file_reference: row.get("source_file_reference")?,
        original_filename: row.get("original_filename")?,
        model_hint: row.get("model_hint")?,
        profile_id: row.get("profile_id")?,
        page_count: row.get("page_count")?,
        unit_count: row.get("unit_count")?,
        started_at: parse_timestamp("started_at", &started_raw)?,
        finished_at: finished_raw
            .map(|raw| parse_timestamp("finished_at", &raw))
            .transpose()?,
        ocr_cost: parse_decimal("ocr_cost", &ocr_raw)?,
        llm_cost: parse_decimal("llm_cost", &llm_raw)?,
        total_cost: parse_decimal("total_cost", &total_raw)?,
        record_count: row.get("record_count")?,
        error_summary: row.get("error_summary")?,
        output_file_references: serde_json::from_str(&refs_raw)
            .map_err(|e| conversion_error("output_file_references", e))?,
    })
}

fn refs_json(job: &Job) -> String {
    serde_json::to_string(&job.output_file_references).unwrap_or_else(|_| "[]".to_string())
}

pub fn insert(db: &Database, job: &Job) -> Result<(), StoreError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (job_id, tenant_id, category_id, status, source_file_reference,
             original_filename, model_hint, profile_id, page_count, unit_count, started_at,
             finished_at, ocr_cost, llm_cost, total_cost, record_count, error_summary,
             output_file_references)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                job.job_id,
                job.tenant_id,
                job.category_id,
                job.status.as_str(),
                job.source_file_reference,
                job.original_filename,
                job.model_hint,
                job.profile_id,
                job.page_count,
                job.unit_count,
                job.started_at.to_rfc3339(),
                job.finished_at.map(|t| t.to_rfc3339()),
                job.ocr_cost.to_string(),
                job.llm_cost.to_string(),
                job.total_cost.to_string(),
                job.record_count,
                job.error_summary,
                refs_json(job),
            ],
        )?;
        Ok(())
    })
}

/// Overwrites every mutable column of an existing row.
pub fn update(db: &Database, job: &Job) -> Result<(), StoreError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET status=?2, page_count=?3, unit_count=?4, finished_at=?5,
             ocr_cost=?6, llm_cost=?7, total_cost=?8, record_count=?9, error_summary=?10,
             output_file_references=?11
             WHERE job_id=?1",
            params![
                job.job_id,
                job.status.as_str(),
                job.page_count,
                job.unit_count,
                job.finished_at.map(|t| t.to_rfc3339()),
                job.ocr_cost.to_string(),
                job.llm_cost.to_string(),
                job.total_cost.to_string(),
                job.record_count,
                job.error_summary,
                refs_json(job),
            ],
        )?;
        Ok(())
    })
}

pub fn get(db: &Database, job_id: &str) -> Result<Option<Job>, StoreError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE job_id = ?1")?;
        let mut rows = stmt.query_map(params![job_id], from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    })
}

/// Filtered listing, newest first.
pub fn query(db: &Database, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.as_str().to_string()));
        }
        if let Some(ref tenant_id) = filter.tenant_id {
            conditions.push(format!("tenant_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(tenant_id.clone()));
        }
        if let Some(category_id) = filter.category_id {
            conditions.push(format!("category_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(category_id));
        }
        if let Some(ref after) = filter.started_after {
            conditions.push(format!("started_at >= ?{}", param_values.len() + 1));
            param_values.push(Box::new(after.to_rfc3339()));
        }
        if let Some(ref before) = filter.started_before {
            conditions.push(format!("started_at <= ?{}", param_values.len() + 1));
            param_values.push(Box::new(before.to_rfc3339()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let mut sql = format!("SELECT * FROM jobs {} ORDER BY started_at DESC", where_clause);
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
            if let Some(offset) = filter.offset {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        }

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_ref.as_slice(), from_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    })
}
