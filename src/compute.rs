//! Compute pipeline.
//!
//! Applies a source's computes in order. Each step reads the previous
//! table and builds a new one. A failing step is skipped: the next step sees
//! the table from before the failure, and the failure is reported to the
//! caller.
//!
//! All computes are no-ops on a table without rows.

mod awk;
mod filter;
mod math;
mod structured;
mod text;
mod translate;

pub use awk::{AwkError, AwkExecutor, SystemAwk};

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use tokio::time::Instant;

use crate::connector::{Compute, Connector};
use crate::table::{SourceTable, TABLE_SEP};

/// Errors raised by a single compute.
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("column numbers start at 1")]
    InvalidColumn,

    #[error("column {column} is out of range for a table of width {width}")]
    ColumnOutOfRange { column: usize, width: usize },

    #[error("invalid operand '{0}'")]
    InvalidOperand(String),

    #[error("unknown translation table '{0}'")]
    UnknownTranslationTable(String),

    #[error("invalid regular expression: {0}")]
    Regex(#[from] regex::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Awk(#[from] AwkError),
}

/// What a compute may read besides its input table.
#[derive(Clone, Copy)]
pub struct ComputeContext<'a> {
    pub connector: &'a Connector,
    pub awk: &'a dyn AwkExecutor,
    /// Key of the source being computed, for diagnostics.
    pub source_key: &'a str,
    /// Scripted computes are stopped at this instant.
    pub deadline: Option<Instant>,
}

/// A skipped compute step.
#[derive(Debug)]
pub struct ComputeFailure {
    /// Position of the compute in the source's list.
    pub index: usize,
    /// Compute type name.
    pub compute: String,
    pub error: ComputeError,
}

/// Result of running a compute list.
#[derive(Debug)]
pub struct PipelineOutput {
    pub table: SourceTable,
    pub failures: Vec<ComputeFailure>,
}

/// Run `computes` over `table`, skipping failing steps.
pub async fn apply(
    ctx: &ComputeContext<'_>,
    table: SourceTable,
    computes: &[Compute],
) -> PipelineOutput {
    let mut current = table;
    let mut failures = Vec::new();

    for (index, compute) in computes.iter().enumerate() {
        match apply_one(ctx, &current, compute).await {
            Ok(next) => current = next,
            Err(error) => {
                tracing::warn!(
                    connector = %ctx.connector.id,
                    source = %ctx.source_key,
                    compute = compute.as_ref(),
                    index,
                    error = %error,
                    "Compute failed, keeping previous table"
                );
                failures.push(ComputeFailure {
                    index,
                    compute: compute.as_ref().to_string(),
                    error,
                });
            }
        }
    }

    PipelineOutput {
        table: current,
        failures,
    }
}

/// Run one compute.
pub async fn apply_one(
    ctx: &ComputeContext<'_>,
    table: &SourceTable,
    compute: &Compute,
) -> Result<SourceTable, ComputeError> {
    if table.is_blank() {
        return Ok(table.clone());
    }

    match compute {
        Compute::Awk {
            script,
            exclude_regexp,
            keep_only_regexp,
            separators,
            select_columns,
        } => awk::awk(
            ctx.awk,
            table,
            script,
            crate::lines::LineSelection {
                exclude_regexp: exclude_regexp.as_deref(),
                keep_only_regexp: keep_only_regexp.as_deref(),
                separators: separators.as_deref(),
                select_columns: select_columns.as_deref(),
                ..Default::default()
            },
            ctx.deadline,
        )
        .await,
        Compute::Json2Csv {
            entry_key,
            properties,
            separator,
        } => structured::json2csv(table, entry_key, properties, separator),
        _ if table.is_empty() => Ok(table.clone()),

        Compute::Add { column, value } => math::arithmetic(table, *column, value, math::Op::Add),
        Compute::Subtract { column, value } => {
            math::arithmetic(table, *column, value, math::Op::Subtract)
        }
        Compute::Multiply { column, value } => {
            math::arithmetic(table, *column, value, math::Op::Multiply)
        }
        Compute::Divide { column, value } => {
            math::arithmetic(table, *column, value, math::Op::Divide)
        }
        Compute::And { column, value } => math::arithmetic(table, *column, value, math::Op::And),

        Compute::DuplicateColumn { column } => filter::duplicate_column(table, *column),
        Compute::KeepColumns { column_numbers } => filter::keep_columns(table, column_numbers),
        Compute::KeepOnlyMatchingLines {
            column,
            regexp,
            value_list,
        } => filter::matching_lines(table, *column, regexp.as_deref(), value_list, true),
        Compute::ExcludeMatchingLines {
            column,
            regexp,
            value_list,
        } => filter::matching_lines(table, *column, regexp.as_deref(), value_list, false),

        Compute::Replace {
            column,
            existing_value,
            new_value,
            regex,
        } => text::replace(table, *column, existing_value, new_value, *regex),
        Compute::Substring {
            column,
            start,
            length,
        } => text::substring(table, *column, start, length),
        Compute::LeftConcat { column, value } => text::concat(table, *column, value, true),
        Compute::RightConcat { column, value } => text::concat(table, *column, value, false),
        Compute::Extract {
            column,
            sub_column,
            sub_separators,
        } => text::extract(table, *column, *sub_column, sub_separators),
        Compute::ExtractPropertyFromWbemPath { column, property } => {
            text::extract_wbem_property(table, *column, property)
        }

        Compute::Convert { column, conversion } => translate::convert(table, *column, *conversion),
        Compute::Translate {
            column,
            translation_table,
        } => translate::translate(ctx.connector, table, *column, translation_table),
        Compute::ArrayTranslate {
            column,
            translation_table,
            array_separator,
            result_separator,
        } => translate::array_translate(
            ctx.connector,
            table,
            *column,
            translation_table,
            array_separator,
            result_separator,
        ),
        Compute::PerBitTranslation {
            column,
            bit_list,
            translation_table,
        } => translate::per_bit_translation(ctx.connector, table, *column, bit_list, translation_table),
    }
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Validate a 1-based column number, returning the 0-based index.
pub(crate) fn check_column(table: &SourceTable, column: usize) -> Result<usize, ComputeError> {
    if column == 0 {
        return Err(ComputeError::InvalidColumn);
    }
    let width = table.width();
    if column > width {
        return Err(ComputeError::ColumnOutOfRange { column, width });
    }
    Ok(column - 1)
}

/// Parse `$N` or `Column(N)` (case-insensitive) into a 1-based column number.
pub(crate) fn column_ref(operand: &str) -> Option<usize> {
    static COLUMN_REF_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = COLUMN_REF_REGEX.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:\$(\d+)|column\(\s*(\d+)\s*\))\s*$")
            .expect("failed to compile column ref regex")
    });
    let caps = regex.captures(operand)?;
    caps.get(1).or_else(|| caps.get(2))?.as_str().parse().ok()
}

/// An operand that is either another column of the same row or a literal.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Operand<'a> {
    Column(usize),
    Literal(&'a str),
}

impl<'a> Operand<'a> {
    /// Parse an operand, checking column references against the table.
    pub(crate) fn parse(operand: &'a str, table: &SourceTable) -> Result<Self, ComputeError> {
        match column_ref(operand) {
            Some(column) => Ok(Self::Column(check_column(table, column)?)),
            None => Ok(Self::Literal(operand)),
        }
    }

    pub(crate) fn resolve<'r>(&self, row: &'r [String]) -> &'r str
    where
        'a: 'r,
    {
        match self {
            Self::Column(index) => row.get(*index).map_or("", String::as_str),
            Self::Literal(text) => text,
        }
    }
}

/// Build a table from rows, splitting cells that now contain `;` into
/// separate columns.
pub(crate) fn rebuild(rows: Vec<Vec<String>>) -> SourceTable {
    let needs_split = rows.iter().flatten().any(|cell| cell.contains(TABLE_SEP));
    if !needs_split {
        return SourceTable::from_rows(rows);
    }
    SourceTable::from_rows(
        rows.into_iter()
            .map(|row| {
                row.join(TABLE_SEP)
                    .split(TABLE_SEP)
                    .map(str::to_string)
                    .collect()
            })
            .collect(),
    )
}

/// Rewrite one column of every row.
pub(crate) fn map_column(
    table: &SourceTable,
    index: usize,
    mut f: impl FnMut(&[String], &str) -> Option<String>,
) -> SourceTable {
    let rows = table
        .rows()
        .iter()
        .map(|row| {
            let mut row = row.clone();
            if let Some(value) = f(&row, &row[index]) {
                row[index] = value;
            }
            row
        })
        .collect();
    rebuild(rows)
}


#[cfg(test)]
mod tests {
    use super::test_support::{ReverseAwk, connector, ctx};
    use super::*;
    use crate::connector::Conversion;
    use crate::table::rows;

    fn every_compute() -> Vec<Compute> {
        vec![
            Compute::Add { column: 1, value: "1".into() },
            Compute::Subtract { column: 1, value: "$2".into() },
            Compute::Multiply { column: 1, value: "2".into() },
            Compute::Divide { column: 1, value: "2".into() },
            Compute::And { column: 1, value: "3".into() },
            Compute::DuplicateColumn { column: 1 },
            Compute::KeepColumns { column_numbers: vec![1] },
            Compute::KeepOnlyMatchingLines {
                column: 1,
                regexp: Some("ok".into()),
                value_list: vec![],
            },
            Compute::ExcludeMatchingLines {
                column: 1,
                regexp: Some("ok".into()),
                value_list: vec![],
            },
            Compute::Replace {
                column: 1,
                existing_value: "a".into(),
                new_value: "b".into(),
                regex: false,
            },
            Compute::Substring { column: 1, start: "1".into(), length: "2".into() },
            Compute::LeftConcat { column: 1, value: "x".into() },
            Compute::RightConcat { column: 1, value: "x".into() },
            Compute::Convert { column: 1, conversion: Conversion::Hex2Dec },
            Compute::Translate { column: 1, translation_table: "status".into() },
            Compute::ArrayTranslate {
                column: 1,
                translation_table: "status".into(),
                array_separator: "|".into(),
                result_separator: "|".into(),
            },
            Compute::PerBitTranslation {
                column: 1,
                bit_list: vec![0],
                translation_table: "bits".into(),
            },
            Compute::Extract { column: 1, sub_column: 1, sub_separators: ",".into() },
            Compute::ExtractPropertyFromWbemPath { column: 1, property: "Name".into() },
            Compute::Json2Csv {
                entry_key: "/".into(),
                properties: vec![],
                separator: ";".into(),
            },
            Compute::Awk {
                script: "{ print }".into(),
                exclude_regexp: None,
                keep_only_regexp: None,
                separators: None,
                select_columns: None,
            },
        ]
    }

    // =========================================================================
    // Pipeline properties
    // =========================================================================

    #[tokio::test]
    async fn test_every_compute_is_noop_on_empty_table() {
        let connector = connector();
        let ctx = ctx(&connector, &ReverseAwk);
        for compute in every_compute() {
            let result = apply_one(&ctx, &SourceTable::empty(), &compute).await.unwrap();
            assert!(result.is_empty(), "{} produced rows", compute.as_ref());
        }
    }

    #[tokio::test]
    async fn test_out_of_range_column_is_absorbed() {
        let connector = connector();
        let ctx = ctx(&connector, &ReverseAwk);
        let table = SourceTable::from_rows(rows(&[&["1", "2", "3"], &["4", "5", "6"]]));

        let output = apply(&ctx, table.clone(), &[Compute::Add { column: 5, value: "1".into() }]).await;
        assert_eq!(output.table, table);
        assert_eq!(output.failures.len(), 1);
        assert!(matches!(
            output.failures[0].error,
            ComputeError::ColumnOutOfRange { column: 5, width: 3 }
        ));
    }

    #[tokio::test]
    async fn test_failure_keeps_pipeline_going() {
        let connector = connector();
        let ctx = ctx(&connector, &ReverseAwk);
        let table = SourceTable::from_rows(rows(&[&["10", "ok"], &["20", "failed"]]));

        let output = apply(
            &ctx,
            table,
            &[
                Compute::Multiply { column: 1, value: "2".into() },
                Compute::Translate { column: 2, translation_table: "missing".into() },
                Compute::Add { column: 1, value: "1".into() },
            ],
        )
        .await;
        assert_eq!(output.table.rows(), rows(&[&["21", "ok"], &["41", "failed"]]).as_slice());
        assert_eq!(output.failures.len(), 1);
        assert_eq!(output.failures[0].index, 1);
        assert_eq!(output.failures[0].compute, "Translate");
    }

    #[tokio::test]
    async fn test_keep_only_is_idempotent() {
        let connector = connector();
        let ctx = ctx(&connector, &ReverseAwk);
        let table = SourceTable::from_rows(rows(&[&["disk1", "OK"], &["disk2", "FAILED"], &["disk3", "ok"]]));
        let keep = Compute::KeepOnlyMatchingLines {
            column: 2,
            regexp: Some("OK".into()),
            value_list: vec![],
        };

        let once = apply(&ctx, table.clone(), std::slice::from_ref(&keep)).await.table;
        let twice = apply(&ctx, table, &[keep.clone(), keep]).await.table;
        assert_eq!(once, twice);
        assert_eq!(once.len(), 2);
    }

    #[tokio::test]
    async fn test_awk_timeout_is_absorbed() {
        struct Stuck;

        #[async_trait::async_trait]
        impl AwkExecutor for Stuck {
            async fn execute(&self, _script: &str, _input: &str) -> Result<String, AwkError> {
                std::future::pending().await
            }
        }

        let connector = connector();
        let ctx = ComputeContext {
            deadline: Some(Instant::now() + std::time::Duration::from_millis(30)),
            ..ctx(&connector, &Stuck)
        };
        let table = SourceTable::from_rows(rows(&[&["5"]]));

        let output = apply(
            &ctx,
            table,
            &[
                Compute::Awk {
                    script: "{ print }".into(),
                    exclude_regexp: None,
                    keep_only_regexp: None,
                    separators: None,
                    select_columns: None,
                },
                Compute::Add { column: 1, value: "1".into() },
            ],
        )
        .await;
        assert_eq!(output.table.rows(), rows(&[&["6"]]).as_slice());
        assert_eq!(output.failures.len(), 1);
        assert!(matches!(
            output.failures[0].error,
            ComputeError::Awk(AwkError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_input_table_is_not_mutated() {
        let connector = connector();
        let ctx = ctx(&connector, &ReverseAwk);
        let table = SourceTable::from_rows(rows(&[&["5"]]));
        let result = apply_one(&ctx, &table, &Compute::Add { column: 1, value: "1".into() })
            .await
            .unwrap();
        assert_eq!(table.rows()[0][0], "5");
        assert_eq!(result.rows()[0][0], "6");
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    #[tokio::test]
    async fn test_column_ref() {
        assert_eq!(column_ref("$3"), Some(3));
        assert_eq!(column_ref(" COLUMN(12) "), Some(12));
        assert_eq!(column_ref("column( 2 )"), Some(2));
        assert_eq!(column_ref("$3x"), None);
        assert_eq!(column_ref("3"), None);
    }

    #[tokio::test]
    async fn test_rebuild_splits_cells_with_separator() {
        let table = rebuild(rows(&[&["a;b", "c"], &["d", "e"]]));
        assert_eq!(table.rows(), rows(&[&["a", "b", "c"], &["d", "e", ""]]).as_slice());
    }
}
