//! Source tables: the rows-of-string-cells value passed between pipeline steps.
//!
//! A [`SourceTable`] is produced by a source, transformed by computes and
//! finally read by monitor mappings. It is never mutated in place by a
//! pipeline step; each step builds a new value.

use serde::{Deserialize, Serialize};

/// Cell separator used when a table is rendered to, or parsed from, text.
pub const TABLE_SEP: &str = ";";

/// Ordered rows of string cells plus an optional raw-text form.
///
/// Every row of a table has the same width. Constructors pad short rows with
/// empty cells to keep that true.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTable {
    rows: Vec<Vec<String>>,
    raw: Option<String>,
}

impl SourceTable {
    /// A table with no rows and no raw text.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a table from rows, padding every row to the widest one.
    pub fn from_rows(rows: Vec<Vec<String>>) -> Self {
        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, String::new());
                row
            })
            .collect();
        Self { rows, raw: None }
    }

    /// Build a table holding only raw text (e.g. an HTTP body before `Json2Csv`).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self {
            rows: Vec::new(),
            raw: Some(raw.into()),
        }
    }

    /// Parse `;`-separated lines into a table.
    pub fn from_csv(text: &str) -> Self {
        Self::from_rows(csv_to_rows(text, TABLE_SEP))
    }

    /// Attach a raw-text form to this table.
    #[must_use]
    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = Some(raw.into());
        self
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<String>> {
        self.rows
    }

    pub fn raw(&self) -> Option<&str> {
        self.raw.as_deref()
    }

    /// Number of columns (0 for a table without rows).
    pub fn width(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// True when the table has neither rows nor raw text.
    pub fn is_blank(&self) -> bool {
        self.rows.is_empty() && self.raw.as_deref().is_none_or(str::is_empty)
    }

    /// Text form of the table: the raw text when present, otherwise the rows
    /// rendered with `;` and a trailing separator per line.
    pub fn text(&self) -> String {
        match &self.raw {
            Some(raw) => raw.clone(),
            None => self.to_csv(TABLE_SEP, true),
        }
    }

    /// Render rows as separator-joined lines.
    pub fn to_csv(&self, sep: &str, trailing_separator: bool) -> String {
        self.rows
            .iter()
            .map(|row| {
                let mut line = row.join(sep);
                if trailing_separator {
                    line.push_str(sep);
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Derive rows from the raw text when the table has none yet.
    #[must_use]
    pub fn materialize(self) -> Self {
        match (&self.raw, self.rows.is_empty()) {
            (Some(raw), true) if !raw.is_empty() => {
                let raw = raw.clone();
                Self::from_csv(&raw).with_raw(raw)
            }
            _ => self,
        }
    }
}

impl From<Vec<Vec<String>>> for SourceTable {
    fn from(rows: Vec<Vec<String>>) -> Self {
        Self::from_rows(rows)
    }
}

/// Split text into rows: one row per non-empty line, cells split on `sep`,
/// one trailing separator per line ignored.
pub fn csv_to_rows(text: &str, sep: &str) -> Vec<Vec<String>> {
    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .map(|line| {
            let line = line.strip_suffix(sep).unwrap_or(line);
            line.split(sep).map(str::to_string).collect()
        })
        .collect()
}

#[cfg(test)]
pub(crate) fn rows(data: &[&[&str]]) -> Vec<Vec<String>> {
    data.iter()
        .map(|row| row.iter().map(|cell| cell.to_string()).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rows_pads_to_widest_row() {
        let table = SourceTable::from_rows(rows(&[&["a", "b", "c"], &["d"]]));
        assert_eq!(table.width(), 3);
        assert_eq!(table.rows()[1], vec!["d", "", ""]);
    }

    #[test]
    fn test_csv_to_rows_strips_trailing_separator() {
        let parsed = csv_to_rows("a;b;\nc;d;\n\n", ";");
        assert_eq!(parsed, rows(&[&["a", "b"], &["c", "d"]]));
    }

    #[test]
    fn test_csv_to_rows_keeps_inner_empty_cells() {
        let parsed = csv_to_rows("a;;c", ";");
        assert_eq!(parsed, rows(&[&["a", "", "c"]]));
    }

    #[test]
    fn test_text_prefers_raw() {
        let table = SourceTable::from_rows(rows(&[&["1", "2"]])).with_raw("raw");
        assert_eq!(table.text(), "raw");

        let table = SourceTable::from_rows(rows(&[&["1", "2"], &["3", "4"]]));
        assert_eq!(table.text(), "1;2;\n3;4;");
    }

    #[test]
    fn test_materialize_parses_raw_only_once() {
        let table = SourceTable::from_raw("x;y\nz;w").materialize();
        assert_eq!(table.len(), 2);
        assert_eq!(table.raw(), Some("x;y\nz;w"));

        let kept = SourceTable::from_rows(rows(&[&["k"]])).with_raw("a;b");
        assert_eq!(kept.clone().materialize(), kept);
    }

    #[test]
    fn test_blank_table() {
        assert!(SourceTable::empty().is_blank());
        assert!(SourceTable::from_raw("").is_blank());
        assert!(!SourceTable::from_raw("{}").is_blank());
    }
}
