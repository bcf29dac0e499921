//! XML output: `<records>` root with one `<record page="N">` element per
//! record and `<field name="...">` children in field order. Field names go
//! into a `name` attribute so display labels never have to be valid XML
//! element names.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::error::RenderError;

use super::{field_text, RenderContext};

pub(super) fn render(ctx: &RenderContext<'_>) -> Result<Vec<u8>, RenderError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut root = BytesStart::new("records");
    root.push_attribute(("job_id", ctx.job.job_id.as_str()));
    writer.write_event(Event::Start(root))?;

    for record in &ctx.consolidation.records {
        let page = record.original_page_no.to_string();
        let mut record_el = BytesStart::new("record");
        record_el.push_attribute(("page", page.as_str()));
        writer.write_event(Event::Start(record_el))?;

        for spec in &ctx.profile.field_order {
            let mut field_el = BytesStart::new("field");
            field_el.push_attribute(("name", spec.display_label.as_str()));
            writer.write_event(Event::Start(field_el))?;
            let text = field_text(record, spec, ctx.profile);
            writer.write_event(Event::Text(BytesText::new(&text)))?;
            writer.write_event(Event::End(BytesEnd::new("field")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("record")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("records")))?;

    let mut bytes = writer.into_inner();
    bytes.push(b'\n');
    Ok(bytes)
}
