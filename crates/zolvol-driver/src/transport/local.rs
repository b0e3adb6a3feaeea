use crate::command::CommandOutput;
use crate::transport::{Transport, TransportFailure};
use async_trait::async_trait;
use std::io::ErrorKind;

/// Runs commands as child processes of this host
///
/// The argv is handed to the process directly; no shell is involved.
pub struct LocalTransport;

impl LocalTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn execute(&self, argv: &[String]) -> Result<CommandOutput, TransportFailure> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| TransportFailure::fatal("empty command line"))?;

        let output = tokio::process::Command::new(program)
            .args(args)
            .env("LC_ALL", "C")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                let message = format!("failed to spawn {}: {}", program, e);
                match e.kind() {
                    ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                        TransportFailure::fatal(message)
                    }
                    _ => TransportFailure::retryable(message),
                }
            })?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    fn describe(&self) -> String {
        "local".to_string()
    }
}
