//! Awk compute and its script executor.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;

use crate::lines::LineSelection;
use crate::table::SourceTable;

use super::ComputeError;

#[derive(Debug, Error)]
pub enum AwkError {
    #[error("failed to run awk: {0}")]
    Io(#[from] std::io::Error),

    #[error("awk exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("awk script timed out after {0:?}")]
    Timeout(Duration),
}

/// Runs an awk script over text.
///
/// Dropping the returned future must stop the script.
#[async_trait::async_trait]
pub trait AwkExecutor: Send + Sync {
    async fn execute(&self, script: &str, input: &str) -> Result<String, AwkError>;
}

/// Executes scripts with an `awk` program, feeding the input on stdin.
#[derive(Debug, Clone)]
pub struct SystemAwk {
    program: PathBuf,
}

impl Default for SystemAwk {
    fn default() -> Self {
        Self {
            program: PathBuf::from("awk"),
        }
    }
}

impl SystemAwk {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait::async_trait]
impl AwkExecutor for SystemAwk {
    async fn execute(&self, script: &str, input: &str) -> Result<String, AwkError> {
        let mut child = Command::new(&self.program)
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Fed while the output is drained so a large input cannot deadlock
        // against a full stdout pipe.
        let stdin = child.stdin.take();
        let write = async move {
            match stdin {
                Some(mut stdin) => stdin.write_all(input.as_bytes()).await,
                None => Ok(()),
            }
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());
        let output = output?;
        match written {
            Ok(()) => {}
            // The script may exit without reading its input.
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Err(e) => return Err(e.into()),
        }

        if !output.status.success() {
            return Err(AwkError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Run `script` over the table text and rebuild a table from its output.
///
/// The script is stopped once `deadline` passes.
pub(super) async fn awk(
    executor: &dyn AwkExecutor,
    table: &SourceTable,
    script: &str,
    selection: LineSelection<'_>,
    deadline: Option<Instant>,
) -> Result<SourceTable, ComputeError> {
    let input = table.text();
    let output = match deadline {
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::timeout(remaining, executor.execute(script, &input))
                .await
                .map_err(|_| AwkError::Timeout(remaining))??
        }
        None => executor.execute(script, &input).await?,
    };
    if output.trim().is_empty() {
        return Ok(SourceTable::empty());
    }
    Ok(selection.table(&output)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::test_support::ReverseAwk;
    use crate::table::rows;

    struct Silent;

    #[async_trait::async_trait]
    impl AwkExecutor for Silent {
        async fn execute(&self, _script: &str, _input: &str) -> Result<String, AwkError> {
            Ok("\n".to_string())
        }
    }

    struct Hanging;

    #[async_trait::async_trait]
    impl AwkExecutor for Hanging {
        async fn execute(&self, _script: &str, _input: &str) -> Result<String, AwkError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_awk_output_becomes_table() {
        let table = SourceTable::from_rows(rows(&[&["a", "b"], &["c", "d"]]));
        let result = awk(&ReverseAwk, &table, "{ print }", LineSelection::default(), None)
            .await
            .unwrap();
        assert_eq!(result.rows(), rows(&[&["b", "a"], &["d", "c"]]).as_slice());
        assert_eq!(result.raw(), Some("b;a\nd;c"));
    }

    #[tokio::test]
    async fn test_awk_output_selection() {
        let table = SourceTable::from_rows(rows(&[&["1", "fan"], &["2", "psu"]]));
        let selection = LineSelection {
            keep_only_regexp: Some("^fan"),
            separators: Some(";"),
            select_columns: Some("2"),
            ..LineSelection::default()
        };
        let result = awk(&ReverseAwk, &table, "", selection, None).await.unwrap();
        assert_eq!(result.rows(), rows(&[&["1"]]).as_slice());
    }

    #[tokio::test]
    async fn test_empty_awk_output_is_empty_table() {
        let table = SourceTable::from_rows(rows(&[&["a"]]));
        let result = awk(&Silent, &table, "", LineSelection::default(), None)
            .await
            .unwrap();
        assert!(result.is_blank());
    }

    #[tokio::test]
    async fn test_missing_awk_program() {
        let awk = SystemAwk::with_program("/nonexistent/bin/awk");
        assert!(matches!(awk.execute("{ print }", "x").await, Err(AwkError::Io(_))));
    }

    // ==================== Deadline ====================

    #[tokio::test]
    async fn test_awk_stopped_at_deadline() {
        let table = SourceTable::from_rows(rows(&[&["a"]]));
        let deadline = Instant::now() + Duration::from_millis(50);

        let result = awk(&Hanging, &table, "", LineSelection::default(), Some(deadline)).await;
        assert!(matches!(result, Err(ComputeError::Awk(AwkError::Timeout(_)))));
    }

    #[tokio::test]
    async fn test_system_awk_does_not_block_runtime() {
        let table = SourceTable::from_rows(rows(&[&["a"]]));
        let started = std::time::Instant::now();
        let deadline = Instant::now() + Duration::from_millis(100);

        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            started.elapsed()
        });
        let result = awk(
            &SystemAwk::default(),
            &table,
            "BEGIN { system(\"sleep 3\") }",
            LineSelection::default(),
            Some(deadline),
        )
        .await;

        assert!(matches!(result, Err(ComputeError::Awk(AwkError::Timeout(_)))));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(timer.await.unwrap() < Duration::from_secs(1));
    }
}
