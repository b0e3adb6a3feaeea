use crate::command::CommandOutput;
use crate::error::{DriverError, Result};
use crate::transport::{Transport, TransportFailure};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use zolvol_core::SshConfig;

/// Exit status the OpenSSH client reserves for its own errors
const SSH_CLIENT_ERROR: i32 = 255;

/// Runs commands over key-based SSH
///
/// One multiplexed master connection (OpenSSH `ControlMaster`) is opened by
/// `open()` and reused by every command until `close()`. The remote side only
/// ever receives a command line whose arguments are individually quoted, so
/// no argument can be interpreted by the remote shell.
pub struct SshTransport {
    config: SshConfig,
    control_path: PathBuf,
}

impl SshTransport {
    pub fn new(config: SshConfig) -> Self {
        let control_path = config.control_dir.join(format!(
            "zolvol-{}@{}:{}.sock",
            config.user, config.host, config.port
        ));
        Self {
            config,
            control_path,
        }
    }

    /// Options shared by the master, the commands and the control requests
    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-p".to_string(),
            self.config.port.to_string(),
        ];
        if let Some(ref identity) = self.config.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        for opt in &self.config.options {
            args.push("-o".to_string());
            args.push(opt.clone());
        }
        args
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.config.user, self.config.host)
    }

    /// Full ssh argv for running `argv` remotely
    fn command_args(&self, argv: &[String]) -> Vec<String> {
        let mut args = self.base_args();
        args.push("-o".to_string());
        args.push("ControlMaster=auto".to_string());
        args.push(self.destination());
        args.push(shell_words::join(argv));
        args
    }

    async fn ssh(&self, args: &[String]) -> std::io::Result<std::process::Output> {
        tokio::process::Command::new("ssh")
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn execute(
        &self,
        argv: &[String],
    ) -> std::result::Result<CommandOutput, TransportFailure> {
        if argv.is_empty() {
            return Err(TransportFailure::fatal("empty command line"));
        }

        let output = self
            .ssh(&self.command_args(argv))
            .await
            .map_err(|e| TransportFailure::retryable(format!("failed to spawn ssh: {}", e)))?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        // zfs, zpool and tgtadm never exit with 255 themselves
        if exit_code == SSH_CLIENT_ERROR {
            return Err(TransportFailure::retryable(format!(
                "ssh to {} failed: {}",
                self.config.host,
                stderr.trim()
            )));
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            exit_code,
        })
    }

    async fn open(&self) -> Result<()> {
        info!(
            "Opening ssh master connection to {} (control path {})",
            self.describe(),
            self.control_path.display()
        );
        let mut args = self.base_args();
        // Background master without a remote command
        args.extend(
            ["-o", "ControlMaster=yes", "-o", "ControlPersist=yes", "-N", "-f"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(self.destination());

        let output = self.ssh(&args).await.map_err(|e| {
            DriverError::transport_error(self.describe(), "ssh -N -f", 1, e.to_string())
        })?;
        if !output.status.success() {
            return Err(DriverError::transport_error(
                self.describe(),
                "ssh -N -f",
                1,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut args = self.base_args();
        args.push("-O".to_string());
        args.push("exit".to_string());
        args.push(self.destination());

        match self.ssh(&args).await {
            Ok(output) if output.status.success() => {
                info!("Closed ssh master connection to {}", self.describe());
            }
            Ok(output) => {
                // No master running is not an error at shutdown
                debug!(
                    "ssh -O exit for {}: {}",
                    self.describe(),
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Err(e) => warn!("Failed to run ssh -O exit for {}: {}", self.describe(), e),
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "ssh://{}@{}:{}",
            self.config.user, self.config.host, self.config.port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> SshTransport {
        SshTransport::new(SshConfig {
            host: "storage01".to_string(),
            port: 2222,
            user: "cinder".to_string(),
            identity_file: Some(PathBuf::from("/etc/cinder/id_rsa")),
            control_dir: PathBuf::from("/run/zolvol"),
            connect_timeout_secs: 10,
            options: vec!["StrictHostKeyChecking=yes".to_string()],
        })
    }

    #[test]
    fn test_command_args_quote_each_argument() {
        let t = transport();
        let argv = vec![
            "zfs".to_string(),
            "set".to_string(),
            "comment=a b; rm -rf /".to_string(),
            "pool/cinder/v1".to_string(),
        ];
        let args = t.command_args(&argv);
        let remote = args.last().unwrap();
        assert!(remote.starts_with("zfs set "));
        assert_ne!(remote, &argv.join(" "));
        assert_eq!(shell_words::split(remote).unwrap(), argv);
        assert_eq!(args[args.len() - 2], "cinder@storage01");
        assert!(args.contains(&"ControlMaster=auto".to_string()));
        assert!(args.contains(&"/etc/cinder/id_rsa".to_string()));
        assert!(args.contains(&"StrictHostKeyChecking=yes".to_string()));
        assert!(args.contains(&"ControlPath=/run/zolvol/zolvol-cinder@storage01:2222.sock".to_string()));
    }

    #[test]
    fn test_describe() {
        assert_eq!(transport().describe(), "ssh://cinder@storage01:2222");
    }
}
