//! Arithmetic computes.

use crate::table::SourceTable;

use super::{ComputeError, Operand, check_column, map_column};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Op {
    Add,
    Subtract,
    Multiply,
    Divide,
    /// Bitwise and on the integer parts.
    And,
}

fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    text.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Render a result the way connectors expect: integers without a fraction.
pub(crate) fn format_number(value: f64) -> String {
    value.to_string()
}

fn eval(op: Op, lhs: f64, rhs: f64) -> Option<f64> {
    match op {
        Op::Add => Some(lhs + rhs),
        Op::Subtract => Some(lhs - rhs),
        Op::Multiply => Some(lhs * rhs),
        Op::Divide if rhs == 0.0 => None,
        Op::Divide => Some(lhs / rhs),
        Op::And => Some(((lhs as i64) & (rhs as i64)) as f64),
    }
}

/// Apply `op` to a column with a literal number or another column.
///
/// Cells (or operand cells) that are blank or not numeric are left as they
/// are, and so are divisions by zero.
pub(super) fn arithmetic(
    table: &SourceTable,
    column: usize,
    value: &str,
    op: Op,
) -> Result<SourceTable, ComputeError> {
    let index = check_column(table, column)?;
    let operand = Operand::parse(value, table)?;
    if let Operand::Literal(literal) = operand {
        if parse_number(literal).is_none() {
            return Err(ComputeError::InvalidOperand(literal.to_string()));
        }
    }

    Ok(map_column(table, index, |row, cell| {
        let lhs = parse_number(cell)?;
        let rhs = parse_number(operand.resolve(row))?;
        eval(op, lhs, rhs).map(format_number)
    }))
}
