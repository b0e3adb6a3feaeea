// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Validation error type for identifiers, sizes and configuration
#[derive(Error, Debug, Diagnostic)]
pub enum CoreError {
    /// Identifier cannot be mapped onto a dataset path
    #[error("Invalid identifier '{identifier}': {reason}")]
    #[diagnostic(
        code(zolvol::invalid_identifier),
        help("Identifiers may only contain ASCII letters, digits, '_', '.', ':' and '-', and may not start with '-' or '.'")
    )]
    InvalidIdentifier {
        #[allow(unused)]
        identifier: String,
        #[allow(unused)]
        reason: String,
    },

    /// Volume size rejected
    #[error("Invalid volume size {size}: {message}")]
    #[diagnostic(
        code(zolvol::invalid_size),
        help("Volume sizes must be positive multiples of the configured volblocksize ({block_size} bytes)")
    )]
    InvalidSize {
        #[allow(unused)]
        size: u64,
        #[allow(unused)]
        block_size: u64,
        #[allow(unused)]
        message: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(zolvol::invalid_config), help("{suggestion}"))]
    InvalidConfig {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// Configuration file could not be read or decoded
    #[error("Failed to load configuration from {path}: {message}")]
    #[diagnostic(
        code(zolvol::config_load_failed),
        help("Check that the file exists, is readable, and is valid YAML")
    )]
    ConfigLoad {
        #[allow(unused)]
        path: String,
        #[allow(unused)]
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn invalid_identifier(identifier: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            identifier: identifier.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_size(size: u64, block_size: u64, message: impl Into<String>) -> Self {
        Self::InvalidSize {
            size,
            block_size,
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn config_load(
        path: impl Into<String>,
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::ConfigLoad {
            path: path.into(),
            message: message.into(),
            source,
        }
    }
}
