//! Local OS command client.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::config::HostConfig;

use super::{
    ProtocolClient, ProtocolError, ProtocolKind, ProtocolRequest, ProtocolResponse, replace_macros,
};

const PROCESS_LIST_COMMAND: &str = "ps -A -o pid= -o comm= -o args=";

/// Runs commands through a shell on the engine's machine.
///
/// The child is killed when the call is cancelled (timeout or cycle deadline).
#[derive(Debug, Clone)]
pub struct LocalCommandClient {
    shell: String,
}

impl Default for LocalCommandClient {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl LocalCommandClient {
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    async fn run(&self, command_line: &str) -> Result<String, ProtocolError> {
        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command_line)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() && stdout.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProtocolError::Failed(format!(
                "command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(stdout)
    }
}

/// `ps` output to `pid;name;command line` rows.
fn process_rows(output: &str) -> Vec<Vec<String>> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let pid = parts.next()?;
            let name = parts.next()?;
            let args = parts.collect::<Vec<_>>().join(" ");
            Some(vec![pid.to_string(), name.to_string(), args])
        })
        .collect()
}

#[async_trait::async_trait]
impl ProtocolClient for LocalCommandClient {
    async fn execute(
        &self,
        request: &ProtocolRequest,
        host: &HostConfig,
        _timeout: Duration,
    ) -> Result<ProtocolResponse, ProtocolError> {
        match request {
            ProtocolRequest::OsCommand { command_line, .. } => {
                let config = host
                    .protocol(ProtocolKind::Local)
                    .or_else(|| host.protocol(ProtocolKind::Ssh));
                let command_line = replace_macros(command_line, host, config, None);
                tracing::debug!(host = %host.id, command = %command_line, "Running local command");
                Ok(ProtocolResponse::Text(self.run(&command_line).await?))
            }
            ProtocolRequest::ProcessList => {
                let output = self.run(PROCESS_LIST_COMMAND).await?;
                Ok(ProtocolResponse::Rows(process_rows(&output)))
            }
            other => Err(ProtocolError::InvalidRequest(format!(
                "local command client cannot execute '{}'",
                other
            ))),
        }
    }
}
