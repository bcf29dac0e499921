//! Output rendering.
//!
//! Every format renders from the same resolved strings: a field's typed
//! value becomes its base string form, the field's transform is applied,
//! and the result is written per format. A missing required field renders
//! the profile's configured default and a missing optional field the null
//! placeholder, both put through the same transform. Output bytes are a
//! pure function of job, profile, and consolidated records plus the
//! declared `processed_at` timestamp.

mod csv;
mod json;
mod xlsx;
mod xml;

use chrono::{DateTime, Utc};
use regex::Regex;
use rust_decimal::Decimal;

use crate::consolidate::Consolidation;
use crate::error::RenderError;
use crate::job::Job;
use crate::profile::{FieldSpec, FieldTransform, OutputFormat, OutputProfile};
use crate::record::{format_date, FieldValue, Record};

/// Inputs shared by all format renderers for one job.
pub struct RenderContext<'a> {
    pub job: &'a Job,
    pub profile: &'a OutputProfile,
    pub consolidation: &'a Consolidation,
    /// The one declared timestamp that may differ between otherwise
    /// identical renders.
    pub processed_at: DateTime<Utc>,
}

impl RenderContext<'_> {
    /// Seconds from intake to this render.
    pub(crate) fn elapsed_seconds(&self) -> f64 {
        let millis = (self.processed_at - self.job.started_at).num_milliseconds();
        (millis.max(0) as f64) / 1000.0
    }
}

/// One rendered artifact, ready for upload.
#[derive(Debug, Clone)]
pub struct RenderedOutput {
    pub format: OutputFormat,
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Renders every format the profile requests, in profile order, skipping
/// duplicates.
pub fn render_all(ctx: &RenderContext<'_>) -> Result<Vec<RenderedOutput>, RenderError> {
    let mut seen: Vec<OutputFormat> = Vec::new();
    let mut outputs = Vec::new();

    for &format in &ctx.profile.formats {
        if seen.contains(&format) {
            continue;
        }
        seen.push(format);

        let bytes = match format {
            OutputFormat::Csv => csv::render(ctx)?,
            OutputFormat::Json => json::render(ctx)?,
            OutputFormat::Xml => xml::render(ctx)?,
            OutputFormat::Xlsx => xlsx::render(ctx)?,
        };
        let filename = output_filename(ctx.job, format);
        log::debug!(
            "Job '{}': rendered {} ({} bytes)",
            ctx.job.job_id,
            filename,
            bytes.len()
        );
        outputs.push(RenderedOutput {
            format,
            filename,
            content_type: content_type_for(format),
            bytes,
        });
    }

    Ok(outputs)
}

fn output_filename(job: &Job, format: OutputFormat) -> String {
    format!(
        "{}_{}.{}",
        job.filename_stem(),
        job.job_id,
        format.extension()
    )
}

fn content_type_for(format: OutputFormat) -> String {
    mime_guess::from_ext(format.extension())
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Final string for one field of one record: look up, substitute the
/// default or placeholder when absent, then apply the field transform.
pub(crate) fn field_text(record: &Record, spec: &FieldSpec, profile: &OutputProfile) -> String {
    match record.field_map.get(&spec.name) {
        Some(value) => apply_transform(value, spec, profile),
        None if spec.is_required => {
            transform_text(spec.default_value.clone().unwrap_or_default(), spec)
        }
        None => transform_text(profile.null_placeholder.clone(), spec),
    }
}

/// The typed transforms (date, currency) reach through to the typed value
/// and pass mismatched values through untouched; everything else operates
/// on the base string form.
fn apply_transform(value: &FieldValue, spec: &FieldSpec, profile: &OutputProfile) -> String {
    match (&spec.transform, value) {
        (FieldTransform::Date { format }, FieldValue::Date(date)) => format_date(*date, format),
        (FieldTransform::Currency { symbol, decimals }, FieldValue::Number(number)) => {
            format_currency(number, symbol, *decimals)
        }
        _ => transform_text(value.render_base(&profile.date_format), spec),
    }
}

/// String-form transforms. Substituted defaults and placeholders come
/// through here directly; they carry no typed value, so the typed
/// transforms leave them as-is.
fn transform_text(base: String, spec: &FieldSpec) -> String {
    match &spec.transform {
        FieldTransform::None
        | FieldTransform::Date { .. }
        | FieldTransform::Currency { .. } => base,
        FieldTransform::Uppercase => base.to_uppercase(),
        FieldTransform::Lowercase => base.to_lowercase(),
        FieldTransform::Titlecase => titlecase(&base),
        FieldTransform::Prefix { literal } => format!("{literal}{base}"),
        FieldTransform::Suffix { literal } => format!("{base}{literal}"),
        FieldTransform::RegexReplace {
            pattern,
            replacement,
        } => match Regex::new(pattern) {
            Ok(re) => re.replace_all(&base, replacement.as_str()).into_owned(),
            Err(e) => {
                // Profiles are validated at resolve time, so this only
                // fires for profiles that bypassed resolution.
                log::warn!("Skipping unparsable regex for field '{}': {}", spec.name, e);
                base
            }
        },
    }
}

fn titlecase(input: &str) -> String {
    input
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// `1234.5` with symbol `$` and 2 decimals renders as `$1,234.50`; the sign
/// goes before the symbol.
fn format_currency(value: &Decimal, symbol: &str, decimals: u32) -> String {
    let mut rounded = value.round_dp(decimals);
    rounded.rescale(decimals);

    let text = rounded.abs().to_string();
    let (int_part, frac_part) = match text.split_once('.') {
        Some((int_part, frac_part)) => (int_part, Some(frac_part)),
        None => (text.as_str(), None),
    };

    let mut out = String::new();
    if rounded.is_sign_negative() && !rounded.is_zero() {
        out.push('-');
    }
    out.push_str(symbol);
    out.push_str(&group_thousands(int_part));
    if let Some(frac) = frac_part {
        out.push('.');
        out.push_str(frac);
    }
    out
}

fn group_thousands(digits: &str) -> String {
    let len = digits.len();
    let mut out = String::with_capacity(len + len / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
