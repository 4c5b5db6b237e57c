//! JSON to table conversion.

use serde_json::Value;

use crate::table::SourceTable;

use super::ComputeError;

/// Walk `/`-separated `segments` from `value`, expanding arrays into
/// `path[i]` entries.
fn collect_entries<'v>(
    value: &'v Value,
    segments: &[&str],
    path: String,
    out: &mut Vec<(String, &'v Value)>,
) {
    match (segments.split_first(), value) {
        (None, Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                out.push((format!("{}[{}]", path, i), item));
            }
        }
        (None, _) => out.push((path, value)),
        (Some(_), Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                collect_entries(item, segments, format!("{}[{}]", path, i), out);
            }
        }
        (Some((segment, rest)), Value::Object(map)) => {
            if let Some(child) = map.get(*segment) {
                collect_entries(child, rest, format!("{}/{}", path, segment), out);
            }
        }
        (Some(_), _) => {}
    }
}

/// Resolve a `/`-separated property path relative to an entry.
fn property<'v>(entry: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .try_fold(entry, |value, segment| match value {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Turn a JSON document into one row per entry found at `entry_key`: the
/// entry's path first, then each requested property.
pub(super) fn json2csv(
    table: &SourceTable,
    entry_key: &str,
    properties: &[String],
    separator: &str,
) -> Result<SourceTable, ComputeError> {
    let document: Value = serde_json::from_str(&table.text())?;
    let segments: Vec<&str> = entry_key
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();

    let mut entries = Vec::new();
    collect_entries(&document, &segments, String::new(), &mut entries);

    let rows: Vec<Vec<String>> = entries
        .into_iter()
        .map(|(path, entry)| {
            let path = if path.is_empty() { "/".to_string() } else { path };
            std::iter::once(path)
                .chain(properties.iter().map(|p| cell(property(entry, p))))
                .collect()
        })
        .collect();

    let table = SourceTable::from_rows(rows);
    let raw = table.to_csv(separator, true);
    Ok(table.with_raw(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::rows;

    const SYSTEMS: &str = r#"{
        "Members": [
            {"Id": "cpu0", "Status": {"Health": "OK"}, "Speed": 2400},
            {"Id": "cpu1", "Status": {"Health": "Warning"}, "Speed": null}
        ]
    }"#;

    #[test]
    fn test_json2csv_expands_array_entries() {
        let table = SourceTable::from_raw(SYSTEMS);
        let result = json2csv(
            &table,
            "/Members",
            &["Id".into(), "Status/Health".into(), "Speed".into()],
            ";",
        )
        .unwrap();

        assert_eq!(
            result.rows(),
            rows(&[
                &["/Members[0]", "cpu0", "OK", "2400"],
                &["/Members[1]", "cpu1", "Warning", ""],
            ])
            .as_slice()
        );
        assert_eq!(
            result.raw(),
            Some("/Members[0];cpu0;OK;2400;\n/Members[1];cpu1;Warning;;")
        );
    }

    #[test]
    fn test_json2csv_nested_arrays_and_root() {
        let doc = r#"[{"fans": [{"rpm": 1}, {"rpm": 2}]}, {"fans": [{"rpm": 3}]}]"#;
        let result = json2csv(&SourceTable::from_raw(doc), "/fans", &["rpm".into()], ";").unwrap();
        let paths: Vec<_> = result.rows().iter().map(|r| r[0].as_str()).collect();
        assert_eq!(paths, vec!["[0]/fans[0]", "[0]/fans[1]", "[1]/fans[0]"]);

        let result = json2csv(&SourceTable::from_raw(r#"{"a": 1}"#), "/", &["a".into()], ",").unwrap();
        assert_eq!(result.rows(), rows(&[&["/", "1"]]).as_slice());
        assert_eq!(result.raw(), Some("/,1,"));
    }

    #[test]
    fn test_json2csv_invalid_json() {
        let result = json2csv(&SourceTable::from_raw("not json"), "/", &[], ";");
        assert!(matches!(result, Err(ComputeError::Json(_))));
    }
}
