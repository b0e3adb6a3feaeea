use miette::Diagnostic;
use thiserror::Error;

/// Longest stderr excerpt carried in an error
const STDERR_EXCERPT_LEN: usize = 512;

/// Driver error type for volume, export and capacity operations
#[derive(Error, Debug, Diagnostic)]
pub enum DriverError {
    /// Command channel failed after all retries
    #[error("Transport to {target} failed after {attempts} attempt(s) running '{command}': {message}")]
    #[diagnostic(
        code(zolvol::driver::transport_error),
        help("Check that the appliance is reachable and that the ssh key is authorised. The command may still have completed remotely; re-query state before retrying")
    )]
    TransportError {
        #[allow(unused)]
        target: String,
        #[allow(unused)]
        command: String,
        #[allow(unused)]
        attempts: u32,
        #[allow(unused)]
        message: String,
    },

    /// Command output did not have the expected shape
    #[error("Failed to parse {context}: {message}")]
    #[diagnostic(
        code(zolvol::driver::parse_error),
        help("The appliance's zfs/tgtadm output format is not the one this driver understands. Check the tool versions on the appliance")
    )]
    ParseError {
        #[allow(unused)]
        context: String,
        #[allow(unused)]
        message: String,
    },

    /// Existing resource differs from the request
    #[error("Conflict on dataset '{dataset}': {message}")]
    #[diagnostic(
        code(zolvol::driver::conflict),
        help("The dataset already exists with different attributes. Delete it or choose another identifier; it is never modified automatically")
    )]
    ConflictError {
        #[allow(unused)]
        dataset: String,
        #[allow(unused)]
        message: String,
    },

    /// Operation is not supported for this request
    #[error("Unsupported operation '{operation}': {message}")]
    #[diagnostic(code(zolvol::driver::unsupported_operation))]
    UnsupportedOperation {
        #[allow(unused)]
        operation: String,
        #[allow(unused)]
        message: String,
    },

    /// Share property set but no target showed up
    #[error("iSCSI target for '{dataset}' not discoverable after {attempts} attempt(s)")]
    #[diagnostic(
        code(zolvol::driver::export_timeout),
        help("The share property may be set without a target. Check `tgtadm --lld iscsi --mode target --op show` on the appliance and unexport before retrying")
    )]
    ExportTimeoutError {
        #[allow(unused)]
        dataset: String,
        #[allow(unused)]
        attempts: u32,
    },

    /// Target still present after unsharing
    #[error("iSCSI target '{target_iqn}' for '{dataset}' still present after {attempts} teardown attempt(s)")]
    #[diagnostic(
        code(zolvol::driver::export_teardown),
        help("A lingering export still grants access to the volume. Remove the target manually with tgtadm before deleting or reusing the volume")
    )]
    ExportTeardownError {
        #[allow(unused)]
        dataset: String,
        #[allow(unused)]
        target_iqn: String,
        #[allow(unused)]
        attempts: u32,
    },

    /// Command exited non-zero and the failure was not an idempotent no-op
    #[error("Command '{command}' on '{dataset}' failed with exit code {exit_code}")]
    #[diagnostic(code(zolvol::driver::command_failed), help("stderr: {stderr}"))]
    CommandFailed {
        #[allow(unused)]
        dataset: String,
        #[allow(unused)]
        command: String,
        #[allow(unused)]
        exit_code: i32,
        #[allow(unused)]
        stderr: String,
    },

    /// Program outside the allow-list
    #[error("Program '{program}' is not allowed")]
    #[diagnostic(
        code(zolvol::driver::command_not_allowed),
        help("Only zfs, zpool and tgtadm may be executed on the appliance")
    )]
    CommandNotAllowed {
        #[allow(unused)]
        program: String,
    },

    /// Dataset or snapshot does not exist
    #[error("Dataset not found: {dataset}")]
    #[diagnostic(
        code(zolvol::driver::not_found),
        help("Verify the identifier. Use `zfs list -r` under the base dataset to see existing volumes")
    )]
    NotFound {
        #[allow(unused)]
        dataset: String,
    },

    /// Command succeeded but the expected state was not observed
    #[error("Post-condition failed for '{dataset}': {message}")]
    #[diagnostic(
        code(zolvol::driver::verification_failed),
        help("Another actor may be modifying this dataset concurrently. Re-query its state before retrying")
    )]
    VerificationFailed {
        #[allow(unused)]
        dataset: String,
        #[allow(unused)]
        message: String,
    },

    /// Validation error from the core crate
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] zolvol_core::CoreError),

    /// Internal error
    #[error("Internal driver error: {message}")]
    #[diagnostic(
        code(zolvol::driver::internal_error),
        help("This is likely a bug in zolvol-driver. Please report it with the full error details")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

impl DriverError {
    pub fn transport_error(
        target: impl Into<String>,
        command: impl Into<String>,
        attempts: u32,
        message: impl Into<String>,
    ) -> Self {
        Self::TransportError {
            target: target.into(),
            command: command.into(),
            attempts,
            message: message.into(),
        }
    }

    pub fn parse_error(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ParseError {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn conflict(dataset: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConflictError {
            dataset: dataset.into(),
            message: message.into(),
        }
    }

    pub fn unsupported(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn export_timeout(dataset: impl Into<String>, attempts: u32) -> Self {
        Self::ExportTimeoutError {
            dataset: dataset.into(),
            attempts,
        }
    }

    pub fn export_teardown(
        dataset: impl Into<String>,
        target_iqn: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self::ExportTeardownError {
            dataset: dataset.into(),
            target_iqn: target_iqn.into(),
            attempts,
        }
    }

    pub fn command_failed(
        dataset: impl Into<String>,
        command: impl Into<String>,
        exit_code: i32,
        stderr: &str,
    ) -> Self {
        Self::CommandFailed {
            dataset: dataset.into(),
            command: command.into(),
            exit_code,
            stderr: truncate_stderr(stderr),
        }
    }

    pub fn not_found(dataset: impl Into<String>) -> Self {
        Self::NotFound {
            dataset: dataset.into(),
        }
    }

    pub fn verification_failed(dataset: impl Into<String>, message: impl Into<String>) -> Self {
        Self::VerificationFailed {
            dataset: dataset.into(),
            message: message.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}

fn truncate_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_EXCERPT_LEN {
        return trimmed.to_string();
    }
    let mut end = STDERR_EXCERPT_LEN;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_truncates_stderr() {
        let long = "é".repeat(400);
        let err = DriverError::command_failed("pool/cinder/v1", "zfs destroy", 1, &long);
        let DriverError::CommandFailed { stderr, .. } = err else {
            panic!("expected CommandFailed");
        };
        assert!(stderr.ends_with("..."));
        assert!(stderr.len() <= STDERR_EXCERPT_LEN + 3);
    }

    #[test]
    fn test_short_stderr_kept() {
        let err = DriverError::command_failed("d", "zfs list", 1, "  boom\n");
        assert!(matches!(err, DriverError::CommandFailed { ref stderr, .. } if stderr == "boom"));
    }
}
