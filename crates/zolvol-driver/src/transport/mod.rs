mod local;
mod ssh;

pub use local::LocalTransport;
pub use ssh::SshTransport;

use crate::command::CommandOutput;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use zolvol_core::TransportConfig;

/// Failure of the command channel itself, as opposed to a failing program
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportFailure {
    pub message: String,
    /// Whether another attempt may succeed
    pub retryable: bool,
}

impl TransportFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Trait for command channels to the appliance
///
/// `LocalTransport` spawns processes on this host and `SshTransport` runs
/// them over a multiplexed ssh connection. `MockAppliance` interprets the
/// commands in memory for tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute an argv once. `Ok` carries whatever exit code the program
    /// produced; `Err` means the channel failed.
    async fn execute(&self, argv: &[String]) -> std::result::Result<CommandOutput, TransportFailure>;

    /// Open the reusable connection handle, if the transport has one
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    /// Close the reusable connection handle, if the transport has one
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Human-readable target for logs and errors
    fn describe(&self) -> String;
}

/// Build the transport selected by configuration
pub fn from_config(config: &TransportConfig) -> Arc<dyn Transport> {
    match config {
        TransportConfig::Local => Arc::new(LocalTransport::new()),
        TransportConfig::Ssh(ssh) => Arc::new(SshTransport::new(ssh.clone())),
    }
}
