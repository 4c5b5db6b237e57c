//! String computes: replace, substring, concatenation and extraction.

use regex::{NoExpand, Regex, RegexBuilder};

use crate::lines::psl_regex;
use crate::table::SourceTable;

use super::{ComputeError, Operand, check_column, map_column, rebuild};

/// Replace occurrences of `existing` with `new` in a column. Either side may
/// be a column reference.
pub(super) fn replace(
    table: &SourceTable,
    column: usize,
    existing: &str,
    new: &str,
    regex: bool,
) -> Result<SourceTable, ComputeError> {
    let index = check_column(table, column)?;
    let existing = Operand::parse(existing, table)?;
    let new = Operand::parse(new, table)?;

    let compiled = match existing {
        Operand::Literal(pattern) if regex => Some(psl_regex(pattern)?),
        _ => None,
    };

    let mut error = None;
    let result = map_column(table, index, |row, cell| {
        let needle = existing.resolve(row);
        if needle.is_empty() {
            return None;
        }
        let replacement = new.resolve(row);
        if !regex {
            return Some(cell.replace(needle, replacement));
        }
        match &compiled {
            Some(re) => Some(re.replace_all(cell, NoExpand(replacement)).into_owned()),
            None => match psl_regex(needle) {
                Ok(re) => Some(re.replace_all(cell, NoExpand(replacement)).into_owned()),
                Err(e) => {
                    error.get_or_insert(e);
                    None
                }
            },
        }
    });

    match error {
        Some(e) => Err(e.into()),
        None => Ok(result),
    }
}

fn positive_integer(operand: &Operand<'_>, row: &[String]) -> Option<usize> {
    operand.resolve(row).trim().parse().ok()
}

/// Keep `length` characters starting at the 1-based `start`. Rows where the
/// range does not fit are left unchanged.
pub(super) fn substring(
    table: &SourceTable,
    column: usize,
    start: &str,
    length: &str,
) -> Result<SourceTable, ComputeError> {
    let index = check_column(table, column)?;
    let start = Operand::parse(start, table)?;
    let length = Operand::parse(length, table)?;
    for operand in [&start, &length] {
        if let Operand::Literal(literal) = operand {
            if literal.trim().parse::<usize>().is_err() {
                return Err(ComputeError::InvalidOperand(literal.to_string()));
            }
        }
    }

    Ok(map_column(table, index, |row, cell| {
        let start = positive_integer(&start, row)?.checked_sub(1)?;
        let length = positive_integer(&length, row)?;
        let chars: Vec<char> = cell.chars().collect();
        let end = start.checked_add(length)?;
        if end > chars.len() {
            return None;
        }
        Some(chars[start..end].iter().collect())
    }))
}

/// Prefix (`left = true`) or suffix a column with a literal or another
/// column. Column `width + 1` appends a new column holding the value.
pub(super) fn concat(
    table: &SourceTable,
    column: usize,
    value: &str,
    left: bool,
) -> Result<SourceTable, ComputeError> {
    let operand = Operand::parse(value, table)?;

    if column == table.width() + 1 {
        let rows = table
            .rows()
            .iter()
            .map(|row| {
                let mut row = row.clone();
                let value = operand.resolve(&row).to_string();
                row.push(value);
                row
            })
            .collect();
        return Ok(rebuild(rows));
    }

    let index = check_column(table, column)?;
    Ok(map_column(table, index, |row, cell| {
        let value = operand.resolve(row);
        Some(if left {
            format!("{}{}", value, cell)
        } else {
            format!("{}{}", cell, value)
        })
    }))
}

/// Split a column on any of `separators` and keep the `sub_column`-th part.
pub(super) fn extract(
    table: &SourceTable,
    column: usize,
    sub_column: usize,
    separators: &str,
) -> Result<SourceTable, ComputeError> {
    let index = check_column(table, column)?;
    if sub_column == 0 {
        return Err(ComputeError::InvalidColumn);
    }
    if separators.is_empty() {
        return Err(ComputeError::InvalidOperand(separators.to_string()));
    }

    Ok(map_column(table, index, |_, cell| {
        Some(
            cell.split(|c| separators.contains(c))
                .nth(sub_column - 1)
                .unwrap_or("")
                .to_string(),
        )
    }))
}

fn wbem_property_regex(property: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(&format!(
        r#"[.,]\s*{}\s*=\s*"?([^",]*)"?"#,
        regex::escape(property)
    ))
    .case_insensitive(true)
    .build()
}

/// Extract a key property value from a WBEM object path such as
/// `CIM_Fan.CreationClassName="CIM_Fan",DeviceID="fan1"`.
pub(super) fn extract_wbem_property(
    table: &SourceTable,
    column: usize,
    property: &str,
) -> Result<SourceTable, ComputeError> {
    let index = check_column(table, column)?;
    let regex = wbem_property_regex(property)?;

    Ok(map_column(table, index, |_, cell| {
        regex
            .captures(cell)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }))
}
