//! JSON output: a `data` array of records keyed by display label, in field
//! order, plus a `metadata` object describing the job.
//!
//! Records serialize through a manual impl so key order follows the
//! profile's field order rather than any map ordering.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::error::RenderError;
use crate::profile::OutputProfile;
use crate::record::Record;

use super::{field_text, RenderContext};

pub(super) fn render(ctx: &RenderContext<'_>) -> Result<Vec<u8>, RenderError> {
    let document = JsonDocument {
        data: ctx
            .consolidation
            .records
            .iter()
            .map(|record| JsonRecord {
                record,
                profile: ctx.profile,
            })
            .collect(),
        metadata: Metadata {
            original_filename: &ctx.job.original_filename,
            job_id: &ctx.job.job_id,
            processed_at: ctx.processed_at,
            page_count: ctx.job.page_count,
            record_count: ctx.consolidation.record_count(),
            processing_time_seconds: ctx.elapsed_seconds(),
            model_used: ctx.consolidation.model_used.as_deref(),
            confidence_score: ctx.consolidation.confidence_score,
            costs: Costs {
                ocr: ctx.consolidation.ocr_cost,
                llm: ctx.consolidation.llm_cost,
                total: ctx.consolidation.total_cost(),
            },
            tokens: Tokens {
                input: ctx.consolidation.tokens_in,
                output: ctx.consolidation.tokens_out,
            },
            error_summary: ctx.consolidation.error_summary.as_deref(),
        },
    };

    let mut bytes = serde_json::to_vec_pretty(&document)?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[derive(Serialize)]
struct JsonDocument<'a> {
    data: Vec<JsonRecord<'a>>,
    metadata: Metadata<'a>,
}

struct JsonRecord<'a> {
    record: &'a Record,
    profile: &'a OutputProfile,
}

impl Serialize for JsonRecord<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.profile.field_order.len()))?;
        for spec in &self.profile.field_order {
            map.serialize_entry(
                &spec.display_label,
                &field_text(self.record, spec, self.profile),
            )?;
        }
        map.end()
    }
}

#[derive(Serialize)]
struct Metadata<'a> {
    original_filename: &'a str,
    job_id: &'a str,
    processed_at: DateTime<Utc>,
    page_count: u32,
    record_count: u64,
    processing_time_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_used: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    confidence_score: Option<f64>,
    costs: Costs,
    tokens: Tokens,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_summary: Option<&'a str>,
}

#[derive(Serialize)]
struct Costs {
    ocr: Decimal,
    llm: Decimal,
    total: Decimal,
}

#[derive(Serialize)]
struct Tokens {
    input: u64,
    output: u64,
}
