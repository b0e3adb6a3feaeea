//! Zolvol Core - Types, naming and configuration for the ZFS volume driver
//!
//! This crate provides:
//! - Volume, snapshot, export and capacity types
//! - Enumerated ZFS dataset properties
//! - Pure mapping between volume identifiers and dataset paths
//! - Validated driver configuration
//! - Error types with miette diagnostics

pub mod config;
pub mod error;
pub mod naming;
pub mod quantities;
pub mod types;

// Re-export commonly used types
pub use config::{
    CommandPaths, Delimiter, DriverConfig, ErrorPatterns, ExportConfig, ListFormat, RetryConfig,
    SshConfig, TransportConfig,
};
pub use error::{CoreError, Result};
pub use quantities::{format_size, parse_size};
pub use types::{
    Checksum, CloneOutcome, Compression, DatasetProperties, Dedup, Encryption, ExportInfo,
    ExportState, PoolStats, Provisioning, Snapshot, SyncMode, Volume, VolumeInfo,
};
