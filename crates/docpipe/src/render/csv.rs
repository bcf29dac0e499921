//! CSV output: RFC 4180 quoting via the `csv` crate, with the profile's
//! delimiter and optional header row.

use csv::WriterBuilder;

use crate::error::RenderError;

use super::{field_text, RenderContext};

pub(super) fn render(ctx: &RenderContext<'_>) -> Result<Vec<u8>, RenderError> {
    let delimiter = delimiter_byte(ctx);
    let mut writer = WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(Vec::new());

    if ctx.profile.include_header {
        writer.write_record(ctx.profile.field_order.iter().map(|f| &f.display_label))?;
    }
    for record in &ctx.consolidation.records {
        writer.write_record(
            ctx.profile
                .field_order
                .iter()
                .map(|spec| field_text(record, spec, ctx.profile)),
        )?;
    }

    writer.flush()?;
    Ok(writer.into_inner().map_err(|e| e.into_error())?)
}

/// The profile's delimiter, constrained to a single byte.
fn delimiter_byte(ctx: &RenderContext<'_>) -> u8 {
    u8::try_from(ctx.profile.csv_delimiter as u32).unwrap_or_else(|_| {
        log::warn!(
            "Profile '{}' has a non-ASCII CSV delimiter; using ','",
            ctx.profile.profile_id
        );
        b','
    })
}
