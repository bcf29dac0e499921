//! XLSX output as a minimal Open Packaging Conventions archive: one
//! worksheet named `Records`, all cells inline strings. Zip entries get a
//! fixed modification timestamp so rendering the same job twice yields the
//! same bytes.

use std::io::{Cursor, Write};

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer as XmlWriter;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::error::RenderError;

use super::{field_text, RenderContext};

const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/></Types>
"#;

const PACKAGE_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>
"#;

const WORKBOOK: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Records" sheetId="1" r:id="rId1"/></sheets></workbook>
"#;

const WORKBOOK_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>
"#;

pub(super) fn render(ctx: &RenderContext<'_>) -> Result<Vec<u8>, RenderError> {
    let sheet = sheet_xml(ctx)?;

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());

    for (name, content) in [
        ("[Content_Types].xml", CONTENT_TYPES),
        ("_rels/.rels", PACKAGE_RELS),
        ("xl/workbook.xml", WORKBOOK),
        ("xl/_rels/workbook.xml.rels", WORKBOOK_RELS),
    ] {
        zip.start_file(name, options)?;
        zip.write_all(content.as_bytes())?;
    }
    zip.start_file("xl/worksheets/sheet1.xml", options)?;
    zip.write_all(&sheet)?;

    let cursor = zip.finish()?;
    Ok(cursor.into_inner())
}

fn sheet_xml(ctx: &RenderContext<'_>) -> Result<Vec<u8>, RenderError> {
    let mut writer = XmlWriter::new(Vec::new());
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("yes"))))?;

    let mut worksheet = BytesStart::new("worksheet");
    worksheet.push_attribute((
        "xmlns",
        "http://schemas.openxmlformats.org/spreadsheetml/2006/main",
    ));
    writer.write_event(Event::Start(worksheet))?;
    writer.write_event(Event::Start(BytesStart::new("sheetData")))?;

    let mut row_no = 0usize;
    if ctx.profile.include_header {
        row_no += 1;
        let labels = ctx
            .profile
            .field_order
            .iter()
            .map(|spec| spec.display_label.clone());
        write_row(&mut writer, row_no, labels)?;
    }
    for record in &ctx.consolidation.records {
        row_no += 1;
        let cells = ctx
            .profile
            .field_order
            .iter()
            .map(|spec| field_text(record, spec, ctx.profile));
        write_row(&mut writer, row_no, cells)?;
    }

    writer.write_event(Event::End(BytesEnd::new("sheetData")))?;
    writer.write_event(Event::End(BytesEnd::new("worksheet")))?;
    Ok(writer.into_inner())
}

fn write_row<W: Write>(
    writer: &mut XmlWriter<W>,
    row_no: usize,
    cells: impl Iterator<Item = String>,
) -> Result<(), RenderError> {
    let mut row = BytesStart::new("row");
    let r = row_no.to_string();
    row.push_attribute(("r", r.as_str()));
    writer.write_event(Event::Start(row))?;

    for (col, value) in cells.enumerate() {
        let reference = cell_ref(col, row_no);
        let mut cell = BytesStart::new("c");
        cell.push_attribute(("r", reference.as_str()));
        cell.push_attribute(("t", "inlineStr"));
        writer.write_event(Event::Start(cell))?;
        writer.write_event(Event::Start(BytesStart::new("is")))?;
        writer.write_event(Event::Start(BytesStart::new("t")))?;
        writer.write_event(Event::Text(BytesText::new(&value)))?;
        writer.write_event(Event::End(BytesEnd::new("t")))?;
        writer.write_event(Event::End(BytesEnd::new("is")))?;
        writer.write_event(Event::End(BytesEnd::new("c")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("row")))?;
    Ok(())
}

/// `A1`-style reference for a zero-based column and one-based row.
fn cell_ref(col: usize, row: usize) -> String {
    let mut letters = String::new();
    let mut n = col;
    loop {
        letters.insert(0, (b'A' + (n % 26) as u8) as char);
        n /= 26;
        if n == 0 {
            break;
        }
        n -= 1;
    }
    format!("{letters}{row}")
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read};

    use super::super::test_support::*;
    use super::super::RenderContext;
    use super::{cell_ref, render};

    fn part(archive_bytes: &[u8], name: &str) -> String {
        let mut archive = zip::ZipArchive::new(Cursor::new(archive_bytes.to_vec())).unwrap();
        let mut file = archive.by_name(name).unwrap();
        let mut content = String::new();
        file.read_to_string(&mut content).unwrap();
        content
    }

    #[test]
    fn cell_refs_follow_spreadsheet_convention() {
        assert_eq!(cell_ref(0, 1), "A1");
        assert_eq!(cell_ref(25, 2), "Z2");
        assert_eq!(cell_ref(26, 3), "AA3");
        assert_eq!(cell_ref(51, 10), "AZ10");
    }

    #[test]
    fn archive_holds_workbook_and_inline_string_sheet() {
        let job = sample_job();
        let profile = invoice_profile();
        let consolidation = sample_consolidation();
        let ctx = RenderContext {
            job: &job,
            profile: &profile,
            consolidation: &consolidation,
            processed_at: processed_at(),
        };

        let bytes = render(&ctx).unwrap();
        let workbook = part(&bytes, "xl/workbook.xml");
        assert!(workbook.contains("name=\"Records\""));

        let sheet = part(&bytes, "xl/worksheets/sheet1.xml");
        assert!(sheet.contains("<row r=\"1\">"));
        assert!(sheet.contains("<c r=\"A1\" t=\"inlineStr\"><is><t>Vendor</t></is></c>"));
        assert!(sheet.contains("<c r=\"A2\" t=\"inlineStr\"><is><t>Acme Supplies</t></is></c>"));
        assert!(sheet.contains("<t>$1,234.50</t>"));
        assert!(sheet.contains("<t>Unknown Vendor</t>"));
        assert!(sheet.contains("<t>N/A</t>"));
    }

    #[test]
    fn repeated_renders_are_byte_identical() {
        let job = sample_job();
        let profile = invoice_profile();
        let consolidation = sample_consolidation();
        let ctx = RenderContext {
            job: &job,
            profile: &profile,
            consolidation: &consolidation,
            processed_at: processed_at(),
        };

        assert_eq!(render(&ctx).unwrap(), render(&ctx).unwrap());
    }
}
