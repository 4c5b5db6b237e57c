//! Translation table and conversion computes.

use crate::connector::{Connector, Conversion, DEFAULT_TRANSLATION_KEY, TranslationTable};
use crate::table::SourceTable;

use super::{ComputeError, check_column, map_column};

fn table<'c>(connector: &'c Connector, name: &str) -> Result<&'c TranslationTable, ComputeError> {
    connector
        .translation(name)
        .ok_or_else(|| ComputeError::UnknownTranslationTable(name.to_string()))
}

/// Look a value up (case-insensitive), falling back to the `default` entry.
pub(crate) fn lookup<'t>(table: &'t TranslationTable, value: &str) -> Option<&'t str> {
    table
        .get(&value.trim().to_lowercase())
        .or_else(|| table.get(DEFAULT_TRANSLATION_KEY))
        .map(String::as_str)
}

/// Replace a column's values through a translation table. Values without a
/// translation, and without a default, are left as they are.
pub(super) fn translate(
    connector: &Connector,
    source: &SourceTable,
    column: usize,
    name: &str,
) -> Result<SourceTable, ComputeError> {
    let index = check_column(source, column)?;
    let translations = table(connector, name)?;
    Ok(map_column(source, index, |_, cell| {
        lookup(translations, cell).map(str::to_string)
    }))
}

/// Translate each element of a separated list. Elements without a
/// translation are dropped.
pub(super) fn array_translate(
    connector: &Connector,
    source: &SourceTable,
    column: usize,
    name: &str,
    array_separator: &str,
    result_separator: &str,
) -> Result<SourceTable, ComputeError> {
    let index = check_column(source, column)?;
    let translations = table(connector, name)?;
    if array_separator.is_empty() {
        return Err(ComputeError::InvalidOperand(array_separator.to_string()));
    }

    Ok(map_column(source, index, |_, cell| {
        let translated: Vec<&str> = cell
            .split(array_separator)
            .filter(|value| !value.trim().is_empty())
            .filter_map(|value| lookup(translations, value))
            .filter(|value| !value.is_empty())
            .collect();
        Some(translated.join(result_separator))
    }))
}

/// Describe a bit field: each listed bit is looked up as `"<bit>,<0|1>"` and
/// the translations are joined with `" - "`.
pub(super) fn per_bit_translation(
    connector: &Connector,
    source: &SourceTable,
    column: usize,
    bits: &[u32],
    name: &str,
) -> Result<SourceTable, ComputeError> {
    let index = check_column(source, column)?;
    let translations = table(connector, name)?;

    Ok(map_column(source, index, |_, cell| {
        let value = cell.trim().parse::<f64>().ok()? as i64;
        let parts: Vec<&str> = bits
            .iter()
            .filter(|&&bit| bit < 64)
            .filter_map(|&bit| {
                let state = (value >> bit) & 1;
                translations.get(&format!("{},{}", bit, state))
            })
            .map(String::as_str)
            .filter(|text| !text.is_empty())
            .collect();
        Some(parts.join(" - "))
    }))
}

fn hex_to_decimal(value: &str) -> Option<String> {
    let cleaned: String = value
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X")
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    u128::from_str_radix(&cleaned, 16).ok().map(|n| n.to_string())
}

/// Reduce a `|`-separated status list to the worst status.
fn simple_status(value: &str) -> String {
    let statuses: Vec<String> = value.split('|').map(|s| s.trim().to_uppercase()).collect();
    let worst = ["ALARM", "WARN", "OK"]
        .into_iter()
        .find(|level| statuses.iter().any(|s| s == level))
        .unwrap_or("UNKNOWN");
    worst.to_string()
}

pub(super) fn convert(
    source: &SourceTable,
    column: usize,
    conversion: Conversion,
) -> Result<SourceTable, ComputeError> {
    let index = check_column(source, column)?;
    Ok(map_column(source, index, |_, cell| match conversion {
        Conversion::Hex2Dec => hex_to_decimal(cell),
        Conversion::Array2SimpleStatus => Some(simple_status(cell)),
    }))
}
