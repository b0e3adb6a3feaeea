use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use zolvol_core::{parse_size, DriverConfig, Provisioning, Snapshot, Volume};
use zolvol_driver::{VolumeDriver, ZfsVolumeDriver};

#[derive(Parser)]
#[command(name = "zolvol", about = "ZFS-on-Linux iSCSI volume driver")]
struct Cli {
    /// Path to the YAML driver configuration
    #[arg(long, env = "ZOLVOL_CONFIG", default_value = "/etc/zolvol/zolvol.yaml")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a volume
    Create {
        id: String,
        /// Size, e.g. 10G or 10737418240
        #[arg(value_parser = parse_bytes)]
        size: u64,
        /// Provisioning mode (defaults to the configured mode)
        #[arg(long, value_parser = parse_provisioning)]
        provisioning: Option<Provisioning>,
    },
    /// Delete a volume, unexporting it first
    Delete { id: String },
    /// Grow a volume
    Extend {
        id: String,
        #[arg(value_parser = parse_bytes)]
        size: u64,
    },
    /// Snapshot a volume
    Snapshot { volume: String, snapshot: String },
    /// Delete a snapshot
    DeleteSnapshot { volume: String, snapshot: String },
    /// Clone a volume, or one of its snapshots, into a new volume
    Clone {
        source: String,
        new_id: String,
        /// Clone this snapshot of the source instead of its current contents
        #[arg(long)]
        snapshot: Option<String>,
        /// Grow the clone to this size
        #[arg(long, value_parser = parse_bytes)]
        size: Option<u64>,
    },
    /// Export a volume over iSCSI and print its provider location
    Export { id: String },
    /// Remove a volume's iSCSI export
    Unexport { id: String },
    /// Show a volume and its export state
    Status { id: String },
    /// List all volumes
    List,
    /// Show pool capacity
    Stats {
        /// Keep reporting every SECS seconds until interrupted
        #[arg(long, value_name = "SECS")]
        watch: Option<u64>,
    },
}

fn parse_bytes(s: &str) -> Result<u64, String> {
    parse_size(s)
}

fn parse_provisioning(s: &str) -> Result<Provisioning, String> {
    Provisioning::parse(s).ok_or_else(|| format!("expected 'thin' or 'thick', got '{}'", s))
}

fn print_json<T: Serialize>(value: &T) -> miette::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| miette::miette!("Failed to render output: {}", e))?;
    println!("{}", json);
    Ok(())
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = DriverConfig::from_file(&cli.config)?;
    let driver = ZfsVolumeDriver::open(config).await?;

    let result = run(&driver, cli.command).await;
    if let Err(e) = driver.close().await {
        error!("Failed to close driver: {}", e);
    }
    result
}

async fn run(driver: &ZfsVolumeDriver, command: Commands) -> miette::Result<()> {
    match command {
        Commands::Create {
            id,
            size,
            provisioning,
        } => {
            let config = driver.config();
            let volume = Volume::new(
                id,
                size,
                provisioning.unwrap_or(config.default_provisioning),
                config.default_properties.clone(),
            );
            print_json(&driver.create_volume(&volume).await?)
        }
        Commands::Delete { id } => {
            driver.delete_volume(&id).await?;
            Ok(())
        }
        Commands::Extend { id, size } => print_json(&driver.extend_volume(&id, size).await?),
        Commands::Snapshot { volume, snapshot } => {
            driver
                .create_snapshot(&Snapshot::new(snapshot, volume))
                .await?;
            Ok(())
        }
        Commands::DeleteSnapshot { volume, snapshot } => {
            driver
                .delete_snapshot(&Snapshot::new(snapshot, volume))
                .await?;
            Ok(())
        }
        Commands::Clone {
            source,
            new_id,
            snapshot,
            size,
        } => {
            let outcome = match snapshot {
                Some(snapshot) => {
                    driver
                        .clone_from_snapshot(&Snapshot::new(snapshot, source), &new_id, size)
                        .await?
                }
                None => driver.clone_volume(&source, &new_id, size).await?,
            };
            print_json(&outcome)
        }
        Commands::Export { id } => {
            let export = driver.export_volume(&id).await?;
            println!("{}", driver.provider_location(&export));
            Ok(())
        }
        Commands::Unexport { id } => {
            driver.unexport_volume(&id).await?;
            Ok(())
        }
        Commands::Status { id } => {
            let volume = driver
                .get_volume(&id)
                .await?
                .ok_or_else(|| miette::miette!("Volume '{}' does not exist", id))?;
            let export = driver.export_state(&id).await?;
            print_json(&serde_json::json!({
                "volume": volume,
                "export": export,
                "local_path": driver.local_path(&id)?,
            }))
        }
        Commands::List => print_json(&driver.list_volumes().await?),
        Commands::Stats { watch: None } => print_json(&driver.pool_stats().await?),
        Commands::Stats {
            watch: Some(secs),
        } => watch_stats(driver, Duration::from_secs(secs.max(1))).await,
    }
}

/// Print pool stats on every reading until ctrl-c
async fn watch_stats(driver: &ZfsVolumeDriver, interval: Duration) -> miette::Result<()> {
    let reporter = driver.capacity();
    let token = CancellationToken::new();
    let (tx, mut rx) = watch::channel(None);

    let reporter_token = token.clone();
    let handle = tokio::spawn(async move { reporter.run(reporter_token, interval, tx).await });

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let reading = rx.borrow_and_update().clone();
                match reading {
                    Some(stats) => print_json(&stats)?,
                    None => error!("No capacity reading available"),
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;
                info!("Stopping capacity watch");
                break;
            }
        }
    }

    token.cancel();
    let _ = handle.await;
    Ok(())
}
