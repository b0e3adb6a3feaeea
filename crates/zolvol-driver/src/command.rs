use crate::error::{DriverError, Result};
use crate::transport::{Transport, TransportFailure};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use zolvol_core::{CommandPaths, DriverConfig, RetryConfig};

/// Programs the driver may run on the appliance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Program {
    Zfs,
    Zpool,
    Tgtadm,
}

impl Program {
    /// Look up an allow-listed program by its bare name
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "zfs" => Ok(Program::Zfs),
            "zpool" => Ok(Program::Zpool),
            "tgtadm" => Ok(Program::Tgtadm),
            other => Err(DriverError::CommandNotAllowed {
                program: other.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Program::Zfs => "zfs",
            Program::Zpool => "zpool",
            Program::Tgtadm => "tgtadm",
        }
    }
}

impl std::fmt::Display for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Output from a command execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs allow-listed programs over a transport
///
/// Transport failures (unreachable host, dropped connection, per-attempt
/// timeout) are retried with exponential backoff. A non-zero exit code from
/// the program itself is returned as-is; callers decide whether it is an
/// idempotent no-op.
pub struct CommandRunner {
    transport: Arc<dyn Transport>,
    paths: CommandPaths,
    retry: RetryConfig,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(transport: Arc<dyn Transport>, config: &DriverConfig) -> Self {
        Self {
            transport,
            paths: config.commands.clone(),
            retry: config.retry.clone(),
            timeout: config.command_timeout(),
        }
    }

    /// Description of where commands run (e.g., "local", "ssh://cinder@storage01:22")
    pub fn target(&self) -> String {
        self.transport.describe()
    }

    fn program_path(&self, program: Program) -> &str {
        match program {
            Program::Zfs => &self.paths.zfs,
            Program::Zpool => &self.paths.zpool,
            Program::Tgtadm => &self.paths.tgtadm,
        }
    }

    /// Render a command line for logs and error messages
    pub fn render(&self, program: Program, args: &[&str]) -> String {
        format!("{} {}", program, args.join(" "))
    }

    /// Run a program and return its output regardless of exit code
    pub async fn run(&self, program: Program, args: &[&str]) -> Result<CommandOutput> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(self.program_path(program).to_string());
        argv.extend(args.iter().map(|a| a.to_string()));
        let rendered = self.render(program, args);

        let mut policy = self.backoff_policy();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            debug!("Executing on {}: {}", self.transport.describe(), rendered);

            let failure =
                match tokio::time::timeout(self.timeout, self.transport.execute(&argv)).await {
                    Ok(Ok(output)) => {
                        debug!(
                            "Command exited with code {}: {}",
                            output.exit_code, rendered
                        );
                        return Ok(output);
                    }
                    Ok(Err(failure)) => failure,
                    Err(_) => TransportFailure::retryable(format!(
                        "no reply within {}s",
                        self.timeout.as_secs()
                    )),
                };

            if !failure.retryable || attempts > self.retry.max_retries {
                return Err(DriverError::transport_error(
                    self.transport.describe(),
                    rendered,
                    attempts,
                    failure.message,
                ));
            }

            let delay = policy
                .next_backoff()
                .unwrap_or(Duration::from_millis(self.retry.max_interval_ms));
            warn!(
                "Transport failure on attempt {} of '{}' ({}), retrying in {:?}",
                attempts, rendered, failure.message, delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Run an argv whose first element must be an allow-listed program name
    pub async fn run_argv(&self, argv: &[&str]) -> Result<CommandOutput> {
        let (name, args) = argv
            .split_first()
            .ok_or_else(|| DriverError::CommandNotAllowed {
                program: String::new(),
            })?;
        let program = Program::from_name(name)?;
        self.run(program, args).await
    }

    /// Run a program and fail on non-zero exit code
    pub async fn run_checked(
        &self,
        program: Program,
        args: &[&str],
        dataset: &str,
    ) -> Result<CommandOutput> {
        let output = self.run(program, args).await?;
        if !output.success() {
            return Err(DriverError::command_failed(
                dataset,
                self.render(program, args),
                output.exit_code,
                &output.stderr,
            ));
        }
        Ok(output)
    }

    /// Release the transport's connection handle
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }

    fn backoff_policy(&self) -> ExponentialBackoff {
        let initial = Duration::from_millis(self.retry.initial_interval_ms);
        ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            multiplier: self.retry.multiplier,
            max_interval: Duration::from_millis(self.retry.max_interval_ms),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Fails the first `failures` calls, then echoes its argv
    struct FlakyTransport {
        failures: u32,
        retryable: bool,
        calls: AtomicU32,
        seen: Mutex<Vec<Vec<String>>>,
    }

    impl FlakyTransport {
        fn new(failures: u32, retryable: bool) -> Self {
            Self {
                failures,
                retryable,
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn execute(
            &self,
            argv: &[String],
        ) -> std::result::Result<CommandOutput, TransportFailure> {
            self.seen.lock().unwrap().push(argv.to_vec());
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(TransportFailure {
                    message: "connection reset by peer".to_string(),
                    retryable: self.retryable,
                });
            }
            Ok(CommandOutput {
                stdout: argv.join(" "),
                stderr: String::new(),
                exit_code: if argv.iter().any(|a| a == "fail") { 1 } else { 0 },
            })
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    /// Never answers
    struct HangingTransport;

    #[async_trait]
    impl Transport for HangingTransport {
        async fn execute(
            &self,
            _argv: &[String],
        ) -> std::result::Result<CommandOutput, TransportFailure> {
            std::future::pending().await
        }

        fn describe(&self) -> String {
            "hanging".to_string()
        }
    }

    fn runner(transport: Arc<dyn Transport>) -> CommandRunner {
        let mut config = DriverConfig::new("pool/cinder");
        config.commands.zfs = "/sbin/zfs".to_string();
        config.retry.max_retries = 3;
        CommandRunner::new(transport, &config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures() {
        let transport = Arc::new(FlakyTransport::new(2, true));
        let runner = runner(transport.clone());

        let output = runner.run(Program::Zfs, &["list", "-H"]).await.unwrap();
        assert_eq!(output.stdout, "/sbin/zfs list -H");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_is_transport_error() {
        let transport = Arc::new(FlakyTransport::new(10, true));
        let runner = runner(transport.clone());

        let err = runner.run(Program::Zfs, &["list"]).await.unwrap_err();
        match err {
            DriverError::TransportError { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_fails_fast() {
        let transport = Arc::new(FlakyTransport::new(10, false));
        let runner = runner(transport.clone());

        assert!(runner.run(Program::Zpool, &["list"]).await.is_err());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_zero_exit_is_not_retried() {
        let transport = Arc::new(FlakyTransport::new(0, true));
        let runner = runner(transport.clone());

        let output = runner.run(Program::Zfs, &["fail"]).await.unwrap();
        assert_eq!(output.exit_code, 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        let err = runner
            .run_checked(Program::Zfs, &["fail"], "pool/cinder/v1")
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::CommandFailed { exit_code: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_transport_failure() {
        let runner = runner(Arc::new(HangingTransport));
        let err = runner.run(Program::Zfs, &["list"]).await.unwrap_err();
        assert!(matches!(err, DriverError::TransportError { attempts: 4, .. }));
    }

    #[tokio::test]
    async fn test_allow_list() {
        let transport = Arc::new(FlakyTransport::new(0, true));
        let runner = runner(transport.clone());

        let err = runner.run_argv(&["rm", "-rf", "/"]).await.unwrap_err();
        assert!(matches!(err, DriverError::CommandNotAllowed { ref program } if program == "rm"));
        assert!(runner.run_argv(&[]).await.is_err());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

        runner.run_argv(&["tgtadm", "--op", "show"]).await.unwrap();
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0], vec!["tgtadm", "--op", "show"]);
    }

    #[test]
    fn test_program_names() {
        assert_eq!(Program::from_name("zpool").unwrap(), Program::Zpool);
        assert!(Program::from_name("/sbin/zfs").is_err());
        assert!(Program::from_name("sh").is_err());
    }
}
