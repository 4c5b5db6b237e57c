//! Per-entry execution of a source over the rows of another table.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::connector::{EntryConcatMethod, ExecuteForEachEntryOf, Source, source_ref};
use crate::table::SourceTable;
use crate::telemetry::ConnectorNamespace;

use super::{SourceError, SourceProcessor};

fn entry_column_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\$entry\.column\((\d+)\)\$").expect("valid entry column regex")
    })
}

/// Replace `$entry.column(N)$` with the N-th cell of `row` (empty when out
/// of range).
pub(crate) fn replace_entry_columns(text: &str, row: &[String]) -> String {
    entry_column_regex()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|index| row.get(index))
                .cloned()
                .unwrap_or_default()
        })
        .into_owned()
}

/// Run `source` once per row of the entry table and concatenate the
/// results. Rows whose execution fails are skipped.
pub(super) async fn execute(
    processor: &SourceProcessor<'_>,
    source: &Source,
    for_each: &ExecuteForEachEntryOf,
    tables: &ConnectorNamespace,
) -> Result<SourceTable, SourceError> {
    let key = source_ref(&for_each.source);
    let entries = tables
        .get_source_table(key)
        .ok_or_else(|| SourceError::MissingTable(key.to_string()))?;

    let mut results = Vec::with_capacity(entries.len());
    for row in entries.rows() {
        let kind = source
            .kind
            .substituted(&|text| replace_entry_columns(text, row));
        match processor
            .execute_kind(&kind, source.force_serialization, tables)
            .await
        {
            Ok(table) => results.push((row.as_slice(), table)),
            Err(error) => {
                tracing::debug!(
                    host = %processor.host.id,
                    source = %source.key,
                    entry = %row.join(";"),
                    error = %error,
                    "Skipping entry"
                );
            }
        }
    }

    Ok(concatenate(for_each, &results))
}

fn concatenate(for_each: &ExecuteForEachEntryOf, results: &[(&[String], SourceTable)]) -> SourceTable {
    match for_each.concat_method {
        EntryConcatMethod::List => {
            let raw = results
                .iter()
                .map(|(_, table)| table.text())
                .collect::<Vec<_>>()
                .join(&for_each.separator);
            let rows = results
                .iter()
                .flat_map(|(_, table)| table.rows().iter().cloned())
                .collect();
            SourceTable::from_rows(rows).with_raw(raw)
        }
        EntryConcatMethod::JsonArray => {
            let items: Vec<String> = results
                .iter()
                .map(|(_, table)| table.text().trim().to_string())
                .collect();
            SourceTable::from_raw(format!("[{}]", items.join(",")))
        }
        EntryConcatMethod::JsonArrayExtended => {
            let items: Vec<String> = results
                .iter()
                .map(|(row, table)| {
                    format!(
                        "{{\"row\":{},\"result\":{}}}",
                        Value::from(row.to_vec()),
                        table.text().trim()
                    )
                })
                .collect();
            SourceTable::from_raw(format!("[{}]", items.join(",")))
        }
        EntryConcatMethod::Custom => {
            let raw: String = results
                .iter()
                .map(|(_, table)| {
                    format!("{}{}{}", for_each.concat_start, table.text(), for_each.concat_end)
                })
                .collect();
            SourceTable::from_raw(raw).materialize()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::rows;

    fn results() -> Vec<(Vec<String>, SourceTable)> {
        vec![
            (vec!["sda".into(), "0".into()], SourceTable::from_raw("R1")),
            (vec!["sdb".into(), "1".into()], SourceTable::from_raw(r#"{"ok":true}"#)),
        ]
    }

    fn borrowed(results: &[(Vec<String>, SourceTable)]) -> Vec<(&[String], SourceTable)> {
        results
            .iter()
            .map(|(row, table)| (row.as_slice(), table.clone()))
            .collect()
    }

    #[test]
    fn test_replace_entry_columns() {
        let row = vec!["sda".to_string(), "disk".to_string()];
        assert_eq!(
            replace_entry_columns("/api/$entry.column(1)$/$ENTRY.COLUMN(2)$/$entry.column(9)$", &row),
            "/api/sda/disk/"
        );
    }

    #[test]
    fn test_list_concatenation() {
        let results = results();
        let for_each = ExecuteForEachEntryOf::new("disks", EntryConcatMethod::List).with_separator(";");
        let table = concatenate(&for_each, &borrowed(&results));
        assert_eq!(table.raw(), Some(r#"R1;{"ok":true}"#));
    }

    #[test]
    fn test_json_array_concatenation() {
        let results = results();
        let for_each = ExecuteForEachEntryOf::new("disks", EntryConcatMethod::JsonArray);
        let table = concatenate(&for_each, &borrowed(&results));
        assert_eq!(table.raw(), Some(r#"[R1,{"ok":true}]"#));
    }

    #[test]
    fn test_json_array_extended_concatenation() {
        let results = results();
        let for_each = ExecuteForEachEntryOf::new("disks", EntryConcatMethod::JsonArrayExtended);
        let table = concatenate(&for_each, &borrowed(&results));
        assert_eq!(
            table.raw(),
            Some(r#"[{"row":["sda","0"],"result":R1},{"row":["sdb","1"],"result":{"ok":true}}]"#)
        );
    }

    #[test]
    fn test_custom_concatenation() {
        let results = vec![
            (vec!["a".to_string()], SourceTable::from_raw("1")),
            (vec!["b".to_string()], SourceTable::from_raw("2")),
        ];
        let for_each = ExecuteForEachEntryOf::new("x", EntryConcatMethod::Custom)
            .with_custom_bounds("<", ">;\n");
        let table = concatenate(&for_each, &borrowed(&results));
        assert_eq!(table.raw(), Some("<1>;\n<2>;\n"));
        assert_eq!(table.rows(), rows(&[&["<1>"], &["<2>"]]).as_slice());
    }

    #[test]
    fn test_empty_entry_table() {
        let for_each = ExecuteForEachEntryOf::new("x", EntryConcatMethod::JsonArray);
        assert_eq!(concatenate(&for_each, &[]).raw(), Some("[]"));
    }
}
