//! Row filters and column layout computes.

use crate::lines::psl_regex;
use crate::table::SourceTable;

use super::{ComputeError, check_column};

/// Keep (`keep = true`) or drop the rows whose column matches.
///
/// Keeping requires both the regexp and the value list to match when both
/// are given; exclusion drops a row matching either. Value lists compare
/// case-insensitively. Without regexp and values the table is unchanged.
pub(super) fn matching_lines(
    table: &SourceTable,
    column: usize,
    regexp: Option<&str>,
    values: &[String],
    keep: bool,
) -> Result<SourceTable, ComputeError> {
    let index = check_column(table, column)?;
    let regex = regexp.filter(|r| !r.is_empty()).map(psl_regex).transpose()?;
    if regex.is_none() && values.is_empty() {
        return Ok(table.clone());
    }

    let listed = |cell: &str| values.iter().any(|v| v.eq_ignore_ascii_case(cell));

    let rows = table
        .rows()
        .iter()
        .filter(|row| {
            let cell = row[index].as_str();
            let regex_match = regex.as_ref().map(|re| re.is_match(cell));
            let value_match = (!values.is_empty()).then(|| listed(cell));
            if keep {
                regex_match.unwrap_or(true) && value_match.unwrap_or(true)
            } else {
                !(regex_match.unwrap_or(false) || value_match.unwrap_or(false))
            }
        })
        .cloned()
        .collect();

    Ok(SourceTable::from_rows(rows))
}

/// Insert a copy of a column right after it.
pub(super) fn duplicate_column(table: &SourceTable, column: usize) -> Result<SourceTable, ComputeError> {
    let index = check_column(table, column)?;
    let rows = table
        .rows()
        .iter()
        .map(|row| {
            let mut row = row.clone();
            row.insert(index, row[index].clone());
            row
        })
        .collect();
    Ok(SourceTable::from_rows(rows))
}

/// Keep the listed columns, in ascending order, each once.
pub(super) fn keep_columns(
    table: &SourceTable,
    column_numbers: &[usize],
) -> Result<SourceTable, ComputeError> {
    let mut indices = column_numbers
        .iter()
        .map(|&column| check_column(table, column))
        .collect::<Result<Vec<_>, _>>()?;
    indices.sort_unstable();
    indices.dedup();

    let rows = table
        .rows()
        .iter()
        .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
        .collect();
    Ok(SourceTable::from_rows(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::rows;

    fn disks() -> SourceTable {
        SourceTable::from_rows(rows(&[
            &["sda", "OK", "100"],
            &["sdb", "Degraded", "200"],
            &["loop0", "ok", "1"],
        ]))
    }

    fn names(table: &SourceTable) -> Vec<&str> {
        table.rows().iter().map(|r| r[0].as_str()).collect()
    }

    #[test]
    fn test_keep_only_regexp_case_insensitive() {
        let result = matching_lines(&disks(), 2, Some("^ok$"), &[], true).unwrap();
        assert_eq!(names(&result), vec!["sda", "loop0"]);
    }

    #[test]
    fn test_keep_requires_regexp_and_values() {
        let values = vec!["SDA".to_string(), "sdb".to_string()];
        let result = matching_lines(&disks(), 1, Some("^sd"), &values, true).unwrap();
        assert_eq!(names(&result), vec!["sda", "sdb"]);

        let result = matching_lines(&disks(), 1, Some("b$"), &values, true).unwrap();
        assert_eq!(names(&result), vec!["sdb"]);
    }

    #[test]
    fn test_exclude_on_either_match() {
        let values = vec!["loop0".to_string()];
        let result = matching_lines(&disks(), 1, Some("sdb"), &values, false).unwrap();
        assert_eq!(names(&result), vec!["sda"]);
    }

    #[test]
    fn test_filter_without_criteria_is_identity() {
        let result = matching_lines(&disks(), 1, None, &[], false).unwrap();
        assert_eq!(result, disks());
    }

    #[test]
    fn test_duplicate_column() {
        let result = duplicate_column(&disks(), 2).unwrap();
        assert_eq!(result.width(), 4);
        assert_eq!(result.rows()[0], vec!["sda", "OK", "OK", "100"]);
    }

    #[test]
    fn test_keep_columns_sorted_and_deduped() {
        let result = keep_columns(&disks(), &[3, 1, 3]).unwrap();
        assert_eq!(result.rows()[1], vec!["sdb", "200"]);
        assert!(keep_columns(&disks(), &[1, 4]).is_err());
    }
}
