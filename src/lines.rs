//! Line-oriented text helpers shared by OS command sources, Awk and criteria.
//!
//! Connector regular expressions use the PSL dialect: `( ) | { }` are
//! literal unless escaped, `\<` and `\>` are word boundaries. They are
//! translated to `regex` syntax and always matched case-insensitively.

use regex::{Regex, RegexBuilder};

use crate::table::{SourceTable, TABLE_SEP};

/// Translate a PSL regular expression to `regex` syntax.
pub fn psl_to_regex(psl: &str) -> String {
    let mut out = String::with_capacity(psl.len() + 8);
    let mut chars = psl.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('<' | '>') => out.push_str(r"\b"),
                Some(meta @ ('(' | ')' | '|' | '{' | '}')) => out.push(meta),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push_str(r"\\"),
            },
            '(' | ')' | '|' | '{' | '}' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Compile a PSL regex, case-insensitive.
pub fn psl_regex(psl: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(&psl_to_regex(psl))
        .case_insensitive(true)
        .build()
}

/// Compile a PSL regex, case-insensitive, `^`/`$` matching at line boundaries.
pub fn psl_regex_multiline(psl: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(&psl_to_regex(psl))
        .case_insensitive(true)
        .multi_line(true)
        .build()
}

/// Filtering and column selection applied to command or script output.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineSelection<'a> {
    /// Lines dropped from the top.
    pub remove_header: usize,
    /// Lines dropped from the bottom.
    pub remove_footer: usize,
    pub exclude_regexp: Option<&'a str>,
    pub keep_only_regexp: Option<&'a str>,
    /// Field separator characters; consecutive separators collapse.
    pub separators: Option<&'a str>,
    /// Column list such as `1,3-5,7-`.
    pub select_columns: Option<&'a str>,
}

impl LineSelection<'_> {
    fn is_identity(&self) -> bool {
        self.remove_header == 0
            && self.remove_footer == 0
            && self.exclude_regexp.is_none()
            && self.keep_only_regexp.is_none()
            && self.separators.is_none()
            && self.select_columns.is_none()
    }

    /// Apply the selection, returning the resulting rows.
    pub fn rows(&self, text: &str) -> Result<Vec<Vec<String>>, regex::Error> {
        let exclude = self.exclude_regexp.map(psl_regex).transpose()?;
        let keep_only = self.keep_only_regexp.map(psl_regex).transpose()?;
        let ranges = self.select_columns.map(parse_column_ranges);

        let lines: Vec<&str> = text.lines().map(|l| l.trim_end_matches('\r')).collect();
        let end = lines.len().saturating_sub(self.remove_footer);
        let start = self.remove_header.min(end);

        Ok(lines[start..end]
            .iter()
            .filter(|line| !line.is_empty())
            .filter(|line| exclude.as_ref().is_none_or(|re| !re.is_match(line)))
            .filter(|line| keep_only.as_ref().is_none_or(|re| re.is_match(line)))
            .map(|line| {
                let fields = split_fields(line, self.separators);
                match &ranges {
                    Some(ranges) => select(&fields, ranges),
                    None => fields,
                }
            })
            .collect())
    }

    /// Apply the selection and build a table. Unprocessed output keeps its
    /// original text as the raw form.
    pub fn table(&self, text: &str) -> Result<SourceTable, regex::Error> {
        if self.is_identity() {
            return Ok(SourceTable::from_csv(text).with_raw(text));
        }
        let table = SourceTable::from_rows(self.rows(text)?);
        let raw = table.to_csv(TABLE_SEP, true);
        Ok(table.with_raw(raw))
    }
}

fn split_fields(line: &str, separators: Option<&str>) -> Vec<String> {
    match separators {
        Some(seps) if !seps.is_empty() => line
            .split(|c| seps.contains(c))
            .filter(|field| !field.is_empty())
            .map(str::to_string)
            .collect(),
        _ => {
            let line = line.strip_suffix(TABLE_SEP).unwrap_or(line);
            line.split(TABLE_SEP).map(str::to_string).collect()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ColumnRange {
    start: usize,
    end: Option<usize>,
}

/// Parse `1,3-5,7-` style column lists (1-based, open-ended ranges allowed).
fn parse_column_ranges(ranges: &str) -> Vec<ColumnRange> {
    ranges
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter_map(|token| {
            let range = match token.split_once('-') {
                None => token.parse().ok().map(|n| ColumnRange {
                    start: n,
                    end: Some(n),
                }),
                Some((from, to)) => {
                    let start = if from.trim().is_empty() {
                        Some(1)
                    } else {
                        from.trim().parse().ok()
                    };
                    let end = if to.trim().is_empty() {
                        Some(None)
                    } else {
                        to.trim().parse().ok().map(Some)
                    };
                    start.zip(end).map(|(start, end)| ColumnRange { start, end })
                }
            };
            if range.is_none() {
                tracing::warn!(token, "Ignoring invalid column selection");
            }
            range
        })
        .collect()
}

fn select(fields: &[String], ranges: &[ColumnRange]) -> Vec<String> {
    let mut selected = Vec::new();
    for range in ranges {
        let end = range.end.unwrap_or(fields.len()).min(fields.len());
        for column in range.start.max(1)..=end {
            selected.push(fields[column - 1].clone());
        }
    }
    selected
}
