//! Spreadsheet export of a filtered mirror table.

use chrono::{DateTime, Utc};
use licmirror_adapters::ExportLayout;
use licmirror_core::SourceKind;
use rust_xlsxwriter::{Format, Workbook, XlsxError};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

const MAX_COLUMN_WIDTH: usize = 50;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("building spreadsheet: {0}")]
    Xlsx(#[from] XlsxError),
}

/// Rows already flattened to text in layout column order.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportTable {
    pub sheet_name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl ExportTable {
    pub fn flatten(layout: &ExportLayout, documents: &[JsonValue]) -> Self {
        Self {
            sheet_name: layout.sheet_name.to_string(),
            headers: layout
                .columns
                .iter()
                .map(|column| column.header.to_string())
                .collect(),
            rows: documents
                .iter()
                .map(|doc| layout.columns.iter().map(|column| column.cell(doc)).collect())
                .collect(),
        }
    }

    /// Longest cell (header included) plus padding, capped.
    pub fn column_widths(&self) -> Vec<usize> {
        self.headers
            .iter()
            .enumerate()
            .map(|(col, header)| {
                let longest = self
                    .rows
                    .iter()
                    .filter_map(|row| row.get(col))
                    .map(|cell| cell.chars().count())
                    .chain(std::iter::once(header.chars().count()))
                    .max()
                    .unwrap_or(0);
                (longest + 2).min(MAX_COLUMN_WIDTH)
            })
            .collect()
    }

    pub fn render_xlsx(&self) -> Result<Vec<u8>, ExportError> {
        let mut workbook = Workbook::new();
        let bold = Format::new().set_bold();
        {
            let sheet = workbook.add_worksheet();
            sheet.set_name(&self.sheet_name)?;
            for (col, header) in self.headers.iter().enumerate() {
                sheet.write_string_with_format(0, col as u16, header, &bold)?;
            }
            for (index, row) in self.rows.iter().enumerate() {
                for (col, cell) in row.iter().enumerate() {
                    sheet.write_string(index as u32 + 1, col as u16, cell)?;
                }
            }
            for (col, width) in self.column_widths().into_iter().enumerate() {
                sheet.set_column_width(col as u16, width as f64)?;
            }
        }
        Ok(workbook.save_to_buffer()?)
    }
}

#[derive(Debug, Clone)]
pub struct ExportFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub rows: usize,
}

/// `<source>_<noun>_<YYYYmmdd_HHMMSS>.xlsx`
pub fn export_file_name(kind: SourceKind, noun: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}_{}.xlsx", kind.slug(), noun, at.format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use licmirror_adapters::SourceProfile;
    use serde_json::json;

    #[test]
    fn empty_export_still_has_a_header_row() {
        let layout = SourceProfile::for_source(SourceKind::Tsd).export;
        let table = ExportTable::flatten(&layout, &[]);
        assert!(table.rows.is_empty());
        assert_eq!(table.headers.len(), layout.columns.len());
        assert_eq!(table.headers[0], "Username");

        let bytes = table.render_xlsx().unwrap();
        assert!(bytes.starts_with(b"PK"));
    }

    #[test]
    fn rows_follow_column_order() {
        let layout = SourceProfile::for_source(SourceKind::Kaspi).export;
        let docs = vec![json!({
            "login": "+7701",
            "is_verified": true,
            "role": 1,
            "created_at": "2024-05-01T08:30:00Z",
            "mongo_id": "m1"
        })];
        let table = ExportTable::flatten(&layout, &docs);
        assert_eq!(
            table.rows,
            vec![vec![
                "+7701".to_string(),
                "Yes".to_string(),
                "1".to_string(),
                "2024-05-01 08:30".to_string(),
                "m1".to_string(),
            ]]
        );
    }

    #[test]
    fn widths_track_content_and_cap() {
        let table = ExportTable {
            sheet_name: "S".into(),
            headers: vec!["ID".into(), "Notes".into()],
            rows: vec![vec!["12345".into(), "x".repeat(80)]],
        };
        assert_eq!(table.column_widths(), vec![7, 50]);
    }

    #[test]
    fn file_name_carries_source_noun_and_timestamp() {
        let at = Utc.with_ymd_and_hms(2025, 3, 9, 14, 5, 7).single().unwrap();
        assert_eq!(
            export_file_name(SourceKind::Arca, "licenses", at),
            "arca_licenses_20250309_140507.xlsx"
        );
    }
}
