use crate::error::{CoreError, Result};
use crate::naming::validate_base_dataset;
use crate::types::{DatasetProperties, Provisioning};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Driver configuration
///
/// Loaded from YAML and validated before any command is issued. Every
/// property value is an enumerated type, so unknown values are rejected by
/// deserialization; `validate()` covers ranges and combinations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriverConfig {
    /// Parent dataset for all volumes (e.g., "pool/cinder")
    pub base_dataset: String,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default = "default_provisioning")]
    pub default_provisioning: Provisioning,
    #[serde(default)]
    pub default_properties: DatasetProperties,
    #[serde(default = "default_over_subscription_ratio")]
    pub over_subscription_ratio: f64,
    #[serde(default)]
    pub commands: CommandPaths,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub list_format: ListFormat,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub error_patterns: ErrorPatterns,
}

fn default_provisioning() -> Provisioning {
    Provisioning::Thin
}

fn default_over_subscription_ratio() -> f64 {
    1.0
}

fn default_command_timeout_secs() -> u64 {
    30
}

/// How commands reach the appliance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Run commands on this host
    #[default]
    Local,
    /// Run commands over key-based SSH
    Ssh(SshConfig),
}

/// SSH connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    /// Private key; the ssh client default is used when unset
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Directory holding the multiplexed connection socket
    #[serde(default = "default_control_dir")]
    pub control_dir: PathBuf,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Extra `-o` options passed to ssh (e.g., "StrictHostKeyChecking=yes")
    #[serde(default)]
    pub options: Vec<String>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_control_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Paths of the three allowed programs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandPaths {
    pub zfs: String,
    pub zpool: String,
    pub tgtadm: String,
}

impl Default for CommandPaths {
    fn default() -> Self {
        Self {
            zfs: "zfs".to_string(),
            zpool: "zpool".to_string(),
            tgtadm: "tgtadm".to_string(),
        }
    }
}

/// Retry policy for transport failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval_ms: 200,
            max_interval_ms: 5000,
            multiplier: 2.0,
        }
    }
}

/// Column delimiter of list output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delimiter {
    /// Scripted (`-H`) output: one tab between columns
    #[default]
    Tab,
    /// Aligned output: runs of spaces or tabs
    Whitespace,
}

/// Shape of `zfs list` / `zpool list` output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListFormat {
    pub delimiter: Delimiter,
    /// Whether the first row is a header
    pub header: bool,
}

/// iSCSI export settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Dataset property that shares a zvol over iSCSI
    pub share_property: String,
    pub target_prefix: String,
    pub portal_address: String,
    pub portal_port: u16,
    pub poll_attempts: u32,
    pub poll_interval_ms: u64,
    pub teardown_attempts: u32,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            share_property: "shareiscsi".to_string(),
            target_prefix: "iqn.2010-10.org.openstack:".to_string(),
            portal_address: "127.0.0.1".to_string(),
            portal_port: 3260,
            poll_attempts: 10,
            poll_interval_ms: 500,
            teardown_attempts: 3,
        }
    }
}

impl ExportConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// stderr fragments that identify idempotent no-ops
///
/// Messages differ between ZFS builds, so they are matched as
/// case-insensitive substrings and can be extended per appliance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorPatterns {
    pub already_exists: Vec<String>,
    pub does_not_exist: Vec<String>,
}

impl Default for ErrorPatterns {
    fn default() -> Self {
        Self {
            already_exists: vec!["already exists".to_string()],
            does_not_exist: vec![
                "does not exist".to_string(),
                "dataset does not exist".to_string(),
                "no such pool or dataset".to_string(),
                "could not find any snapshots".to_string(),
            ],
        }
    }
}

impl ErrorPatterns {
    pub fn is_already_exists(&self, stderr: &str) -> bool {
        matches_any(&self.already_exists, stderr)
    }

    pub fn is_does_not_exist(&self, stderr: &str) -> bool {
        matches_any(&self.does_not_exist, stderr)
    }
}

fn matches_any(patterns: &[String], stderr: &str) -> bool {
    let haystack = stderr.to_lowercase();
    patterns
        .iter()
        .any(|p| haystack.contains(&p.to_lowercase()))
}

impl DriverConfig {
    /// Minimal configuration for a base dataset, everything else defaulted
    pub fn new(base_dataset: impl Into<String>) -> Self {
        Self {
            base_dataset: base_dataset.into(),
            transport: TransportConfig::default(),
            default_provisioning: default_provisioning(),
            default_properties: DatasetProperties::default(),
            over_subscription_ratio: default_over_subscription_ratio(),
            commands: CommandPaths::default(),
            retry: RetryConfig::default(),
            command_timeout_secs: default_command_timeout_secs(),
            list_format: ListFormat::default(),
            export: ExportConfig::default(),
            error_patterns: ErrorPatterns::default(),
        }
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: DriverConfig = serde_yaml::from_str(yaml).map_err(|e| {
            CoreError::config_load("<inline>", e.to_string(), Some(Box::new(e)))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let source = path.display().to_string();
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::config_load(&source, e.to_string(), Some(Box::new(e))))?;
        let config: DriverConfig = serde_yaml::from_str(&content)
            .map_err(|e| CoreError::config_load(&source, e.to_string(), Some(Box::new(e))))?;
        config.validate()?;
        debug!("Loaded configuration for {} from {}", config.base_dataset, source);
        Ok(config)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Reject out-of-range values and invalid combinations
    pub fn validate(&self) -> Result<()> {
        validate_base_dataset(&self.base_dataset)?;

        self.default_properties.validate()?;

        if !self.over_subscription_ratio.is_finite() || self.over_subscription_ratio < 1.0 {
            return Err(CoreError::invalid_config(
                format!(
                    "over_subscription_ratio={} is invalid",
                    self.over_subscription_ratio
                ),
                "Use a ratio of 1.0 (no over-subscription) or greater",
            ));
        }
        if self.over_subscription_ratio > 1.0 && self.default_provisioning == Provisioning::Thick {
            return Err(CoreError::invalid_config(
                "over-subscription requires thin provisioning",
                "Set default_provisioning to 'thin' or over_subscription_ratio to 1.0",
            ));
        }

        for (name, path) in [
            ("zfs", &self.commands.zfs),
            ("zpool", &self.commands.zpool),
            ("tgtadm", &self.commands.tgtadm),
        ] {
            if path.trim().is_empty() {
                return Err(CoreError::invalid_config(
                    format!("command path for {} is empty", name),
                    format!("Set commands.{} to the program name or an absolute path", name),
                ));
            }
        }

        if self.retry.multiplier < 1.0 || !self.retry.multiplier.is_finite() {
            return Err(CoreError::invalid_config(
                format!("retry.multiplier={} is invalid", self.retry.multiplier),
                "The backoff multiplier must be at least 1.0",
            ));
        }
        if self.retry.initial_interval_ms > self.retry.max_interval_ms {
            return Err(CoreError::invalid_config(
                "retry.initial_interval_ms exceeds retry.max_interval_ms",
                "Lower initial_interval_ms or raise max_interval_ms",
            ));
        }

        // Without -H the tools align columns with spaces
        if self.list_format.header && self.list_format.delimiter == Delimiter::Tab {
            return Err(CoreError::invalid_config(
                "list_format.header requires the whitespace delimiter",
                "Use header: false for tab-separated scripted output, or delimiter: whitespace",
            ));
        }

        if self.command_timeout_secs == 0 {
            return Err(CoreError::invalid_config(
                "command_timeout_secs is 0",
                "Commands need a bounded, non-zero timeout (the default is 30 seconds)",
            ));
        }

        if let TransportConfig::Ssh(ssh) = &self.transport {
            if ssh.host.trim().is_empty() || ssh.user.trim().is_empty() {
                return Err(CoreError::invalid_config(
                    "ssh transport requires host and user",
                    "Set transport.host and transport.user, or use mode: local",
                ));
            }
            if ssh.connect_timeout_secs == 0 {
                return Err(CoreError::invalid_config(
                    "transport.connect_timeout_secs is 0",
                    "Use a non-zero connect timeout",
                ));
            }
        }

        if self.export.share_property.trim().is_empty() {
            return Err(CoreError::invalid_config(
                "export.share_property is empty",
                "Set it to the iSCSI share property of the appliance's ZFS build (usually 'shareiscsi')",
            ));
        }
        if self.export.poll_attempts == 0 || self.export.teardown_attempts == 0 {
            return Err(CoreError::invalid_config(
                "export.poll_attempts and export.teardown_attempts must be at least 1",
                "Use the defaults (10 and 3) unless the target daemon is unusually slow",
            ));
        }

        if self.error_patterns.already_exists.is_empty()
            || self.error_patterns.does_not_exist.is_empty()
        {
            return Err(CoreError::invalid_config(
                "error_patterns lists may not be empty",
                "Without patterns, idempotent create/delete cannot be recognised",
            ));
        }

        Ok(())
    }
}
