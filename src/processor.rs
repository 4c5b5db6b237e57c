//! Source execution.
//!
//! [`SourceProcessor`] turns one [`Source`] into a [`SourceTable`]: it
//! resolves `${source::KEY}` references against the tables already computed
//! in the connector namespace, answers internal sources directly, sends the
//! protocol ones through [`ProtocolClients`] and finally runs the source's
//! computes.

mod for_each;

use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::compute::{self, AwkExecutor, ComputeContext, ComputeFailure};
use crate::config::HostConfig;
use crate::connector::{Connector, Source, SourceKind, replace_source_refs, source_ref};
use crate::lines::LineSelection;
use crate::protocol::{
    HttpRequest, ProtocolClients, ProtocolError, ProtocolRequest, ProtocolResponse,
};
use crate::table::{SourceTable, TABLE_SEP};
use crate::telemetry::ConnectorNamespace;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("table of source '{0}' is not available")]
    MissingTable(String),

    #[error("invalid source: {0}")]
    Invalid(String),
}

impl SourceError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Protocol(ProtocolError::Timeout(_)))
    }
}

/// Outcome of one source. A failed source still yields an empty table so
/// that dependents can proceed.
#[derive(Debug)]
pub struct SourceRun {
    pub key: String,
    pub table: SourceTable,
    pub error: Option<SourceError>,
    pub compute_failures: Vec<ComputeFailure>,
    pub duration: Duration,
}

/// Protocol request for a source, `None` for internal sources.
pub(crate) fn protocol_request(kind: &SourceKind) -> Option<ProtocolRequest> {
    let request = match kind {
        SourceKind::SnmpGet { oid } => ProtocolRequest::SnmpGet { oid: oid.clone() },
        SourceKind::SnmpTable {
            oid,
            select_columns,
        } => ProtocolRequest::SnmpTable {
            oid: oid.clone(),
            columns: select_columns.clone(),
        },
        SourceKind::Wbem { query, namespace } => ProtocolRequest::Wbem {
            namespace: namespace.clone(),
            query: query.clone(),
        },
        SourceKind::Wmi { query, namespace } => ProtocolRequest::Wmi {
            namespace: namespace.clone(),
            query: query.clone(),
        },
        SourceKind::Http {
            method,
            url,
            header,
            body,
            authentication_token,
            result_content,
        } => ProtocolRequest::Http(HttpRequest {
            method: *method,
            url: url.clone(),
            headers: header.clone(),
            body: body.clone(),
            authentication_token: authentication_token.clone(),
            result_content: *result_content,
        }),
        SourceKind::OsCommand {
            command_line,
            execute_locally,
            timeout,
            ..
        } => ProtocolRequest::OsCommand {
            command_line: command_line.clone(),
            execute_locally: *execute_locally,
            timeout: *timeout,
        },
        SourceKind::Ipmi => ProtocolRequest::Ipmi,
        SourceKind::Static { .. }
        | SourceKind::TableJoin { .. }
        | SourceKind::TableUnion { .. }
        | SourceKind::Copy { .. } => return None,
    };
    Some(request)
}

/// Executes sources of one connector against one host.
#[derive(Clone, Copy)]
pub struct SourceProcessor<'a> {
    pub host: &'a HostConfig,
    pub connector: &'a Connector,
    pub clients: &'a ProtocolClients,
    pub awk: &'a dyn AwkExecutor,
    /// Held around calls that must not overlap with other calls to the host.
    pub serialization: &'a Mutex<()>,
    pub deadline: Option<Instant>,
}

impl<'a> SourceProcessor<'a> {
    /// Execute `source` and its computes. Never fails: errors are reported
    /// in the returned run alongside an empty table.
    pub async fn run(&self, source: &Source, tables: &ConnectorNamespace) -> SourceRun {
        let started = std::time::Instant::now();
        let resolved = Self::resolve_references(source, tables);

        let (table, error, compute_failures) = match self.fetch(&resolved, tables).await {
            Ok(table) => {
                let ctx = ComputeContext {
                    connector: self.connector,
                    awk: self.awk,
                    source_key: &source.key,
                    deadline: self.deadline,
                };
                let output = compute::apply(&ctx, table, &resolved.computes).await;
                (output.table, None, output.failures)
            }
            Err(error) => {
                tracing::warn!(
                    host = %self.host.id,
                    connector = %self.connector.id,
                    source = %source.key,
                    error = %error,
                    "Source failed"
                );
                (SourceTable::empty(), Some(error), Vec::new())
            }
        };

        let duration = started.elapsed();
        tracing::debug!(
            host = %self.host.id,
            connector = %self.connector.id,
            source = %source.key,
            rows = table.len(),
            duration_ms = duration.as_millis() as u64,
            "Source processed"
        );

        SourceRun {
            key: source.key.clone(),
            table,
            error,
            compute_failures,
            duration,
        }
    }

    /// Replace `${source::KEY}` references with the text of computed tables.
    fn resolve_references(source: &Source, tables: &ConnectorNamespace) -> Source {
        source.substituted(&|text| {
            replace_source_refs(text, |key| {
                tables.get_source_table(key).map(SourceTable::text)
            })
        })
    }

    async fn fetch(
        &self,
        source: &Source,
        tables: &ConnectorNamespace,
    ) -> Result<SourceTable, SourceError> {
        match &source.execute_for_each_entry_of {
            Some(for_each) => for_each::execute(self, source, for_each, tables).await,
            None => {
                self.execute_kind(&source.kind, source.force_serialization, tables)
                    .await
            }
        }
    }

    async fn execute_kind(
        &self,
        kind: &SourceKind,
        force_serialization: bool,
        tables: &ConnectorNamespace,
    ) -> Result<SourceTable, SourceError> {
        match kind {
            SourceKind::Static { value } => Ok(SourceTable::from_csv(value)),
            SourceKind::TableJoin {
                left_table,
                right_table,
                left_key_column,
                right_key_column,
                default_right_line,
                case_sensitive,
            } => {
                let left = table(tables, left_table)?;
                let right = table(tables, right_table)?;
                join(
                    left,
                    right,
                    *left_key_column,
                    *right_key_column,
                    default_right_line.as_deref(),
                    *case_sensitive,
                )
            }
            SourceKind::TableUnion { tables: keys } => {
                let mut rows = Vec::new();
                for key in keys {
                    rows.extend(table(tables, key)?.rows().iter().cloned());
                }
                Ok(SourceTable::from_rows(rows))
            }
            SourceKind::Copy { from } => Ok(table(tables, from)?.clone()),
            SourceKind::OsCommand {
                exclude_regexp,
                keep_only_regexp,
                remove_header,
                remove_footer,
                separators,
                select_columns,
                ..
            } => {
                let response = self.call(kind, force_serialization).await?;
                let selection = LineSelection {
                    remove_header: *remove_header,
                    remove_footer: *remove_footer,
                    exclude_regexp: exclude_regexp.as_deref(),
                    keep_only_regexp: keep_only_regexp.as_deref(),
                    separators: separators.as_deref(),
                    select_columns: select_columns.as_deref(),
                };
                selection
                    .table(&response.text())
                    .map_err(|e| SourceError::Invalid(e.to_string()))
            }
            _ => Ok(self.call(kind, force_serialization).await?.into_table()),
        }
    }

    async fn call(
        &self,
        kind: &SourceKind,
        force_serialization: bool,
    ) -> Result<ProtocolResponse, SourceError> {
        let request = protocol_request(kind)
            .ok_or_else(|| SourceError::Invalid(format!("{} is not a protocol source", kind.as_ref())))?;

        let _guard = if force_serialization {
            Some(self.serialization.lock().await)
        } else {
            None
        };
        Ok(self
            .clients
            .execute(&request, self.host, self.deadline)
            .await?)
    }
}

fn table<'t>(tables: &'t ConnectorNamespace, reference: &str) -> Result<&'t SourceTable, SourceError> {
    let key = source_ref(reference);
    tables
        .get_source_table(key)
        .ok_or_else(|| SourceError::MissingTable(key.to_string()))
}

fn key_cell<'r>(row: &'r [String], column: usize) -> Result<&'r str, SourceError> {
    column
        .checked_sub(1)
        .and_then(|index| row.get(index))
        .map(String::as_str)
        .ok_or_else(|| SourceError::Invalid(format!("key column {} is out of range", column)))
}

/// Join two tables on one key column each. Left rows without a match take
/// `default_right_line` when given, and are dropped otherwise.
fn join(
    left: &SourceTable,
    right: &SourceTable,
    left_column: usize,
    right_column: usize,
    default_right_line: Option<&str>,
    case_sensitive: bool,
) -> Result<SourceTable, SourceError> {
    if left_column == 0 || right_column == 0 {
        return Err(SourceError::Invalid("key columns start at 1".to_string()));
    }
    let normalize = |value: &str| {
        if case_sensitive {
            value.to_string()
        } else {
            value.to_lowercase()
        }
    };
    let default_cells: Option<Vec<String>> = default_right_line.map(|line| {
        line.strip_suffix(TABLE_SEP)
            .unwrap_or(line)
            .split(TABLE_SEP)
            .map(str::to_string)
            .collect()
    });

    let mut right_keys = Vec::with_capacity(right.len());
    for row in right.rows() {
        right_keys.push(normalize(key_cell(row, right_column)?));
    }

    let mut rows = Vec::new();
    for left_row in left.rows() {
        let key = normalize(key_cell(left_row, left_column)?);
        let mut matched = false;
        for (right_row, right_key) in right.rows().iter().zip(&right_keys) {
            if *right_key == key {
                matched = true;
                rows.push(left_row.iter().chain(right_row).cloned().collect());
            }
        }
        if let (false, Some(default)) = (matched, &default_cells) {
            rows.push(left_row.iter().chain(default).cloned().collect());
        }
    }
    Ok(SourceTable::from_rows(rows))
}
