use crate::command::{CommandRunner, Program};
use crate::error::{DriverError, Result};
use crate::parser::OutputParser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use zolvol_core::naming::pool_name;
use zolvol_core::{format_size, DriverConfig, PoolStats, Provisioning};

const POOL_COLUMNS: [&str; 4] = ["name", "size", "allocated", "free"];
const DATASET_COLUMNS: [&str; 2] = ["used", "available"];

/// Reports pool capacity, inflated by the over-subscription ratio when
/// volumes are thin-provisioned
pub struct CapacityReporter {
    runner: Arc<CommandRunner>,
    parser: Arc<dyn OutputParser>,
    config: Arc<DriverConfig>,
}

impl CapacityReporter {
    pub fn new(
        runner: Arc<CommandRunner>,
        parser: Arc<dyn OutputParser>,
        config: Arc<DriverConfig>,
    ) -> Self {
        Self {
            runner,
            parser,
            config,
        }
    }

    fn ratio(&self) -> f64 {
        match self.config.default_provisioning {
            Provisioning::Thin => self.config.over_subscription_ratio,
            Provisioning::Thick => 1.0,
        }
    }

    fn list_flags(&self) -> Vec<&'static str> {
        let mut flags = vec!["list"];
        if !self.config.list_format.header {
            flags.push("-H");
        }
        flags.push("-p");
        flags
    }

    /// Query the pool holding the base dataset
    ///
    /// `zpool list` only counts written blocks as allocated, so used and free
    /// space come from the pool's root dataset, which charges reservations.
    pub async fn pool_stats(&self) -> Result<PoolStats> {
        let pool = pool_name(&self.config.base_dataset);

        let columns = POOL_COLUMNS.join(",");
        let mut args: Vec<&str> = self.list_flags();
        args.extend(["-o", columns.as_str(), pool]);
        let output = self.runner.run_checked(Program::Zpool, &args, pool).await?;
        let records = self.parser.parse_list(&output.stdout, &POOL_COLUMNS)?;
        let [record] = records.as_slice() else {
            return Err(DriverError::parse_error(
                format!("zpool list of '{}'", pool),
                format!("expected one row, got {}", records.len()),
            ));
        };

        let mut args: Vec<&str> = self.list_flags();
        args.extend(["-o", "used,available", pool]);
        let output = self.runner.run_checked(Program::Zfs, &args, pool).await?;
        let datasets = self.parser.parse_list(&output.stdout, &DATASET_COLUMNS)?;
        let [root] = datasets.as_slice() else {
            return Err(DriverError::parse_error(
                format!("zfs list of '{}'", pool),
                format!("expected one row, got {}", datasets.len()),
            ));
        };

        let total_bytes = record.bytes("size")?.unwrap_or(0);
        let free_bytes = root.bytes("available")?.unwrap_or(0);
        let ratio = self.ratio();

        let stats = PoolStats {
            pool: record.value("name")?.to_string(),
            total_bytes,
            allocated_bytes: record.bytes("allocated")?.unwrap_or(0),
            used_bytes: root.bytes("used")?.unwrap_or(0),
            free_bytes,
            advertised_total_bytes: (total_bytes as f64 * ratio) as u64,
            advertised_free_bytes: (free_bytes as f64 * ratio) as u64,
            over_subscription_ratio: ratio,
        };
        debug!(
            "Pool {}: {} total, {} allocated, {} used, {} free (ratio {})",
            stats.pool,
            format_size(stats.total_bytes),
            format_size(stats.allocated_bytes),
            format_size(stats.used_bytes),
            format_size(stats.free_bytes),
            ratio
        );
        Ok(stats)
    }

    /// Publish fresh pool stats every `interval` until cancelled
    ///
    /// A failed query publishes `None` so readers never act on a stale
    /// value.
    pub async fn run(
        &self,
        token: CancellationToken,
        interval: Duration,
        sink: watch::Sender<Option<PoolStats>>,
    ) {
        info!("Starting capacity reporter (interval: {:?})", interval);
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Capacity reporter shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let reading = match self.pool_stats().await {
                        Ok(stats) => Some(stats),
                        Err(e) => {
                            error!("Capacity query failed: {}", e);
                            None
                        }
                    };
                    if sink.send(reading).is_err() {
                        info!("No capacity subscribers left, stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::driver::testing::*;
    use crate::traits::VolumeDriver;
    use std::time::Duration;
    use tokio::sync::watch;
    use tokio_util::sync::CancellationToken;
    use zolvol_core::Provisioning;

    #[tokio::test]
    async fn test_pool_stats_physical() {
        let (driver, _) = driver().await;
        driver
            .create_volume(&volume("v1", 10 * GIB, Provisioning::Thick))
            .await
            .unwrap();

        let stats = driver.pool_stats().await.unwrap();
        assert_eq!(stats.pool, "pool");
        assert_eq!(stats.total_bytes, 100 * GIB);
        assert_eq!(stats.allocated_bytes, 0);
        assert_eq!(stats.used_bytes, 10 * GIB);
        assert_eq!(stats.free_bytes, 90 * GIB);
        assert_eq!(stats.advertised_total_bytes, 100 * GIB);
        assert_eq!(stats.advertised_free_bytes, 90 * GIB);
    }

    #[tokio::test]
    async fn test_reservations_count_against_free_space() {
        let (driver, appliance) = driver().await;
        driver
            .create_volume(&volume("thick", 10 * GIB, Provisioning::Thick))
            .await
            .unwrap();
        driver
            .create_volume(&volume("thin", 20 * GIB, Provisioning::Thin))
            .await
            .unwrap();
        appliance.write("pool/cinder/thin", 3 * GIB).await;
        appliance.write("pool/cinder/thick", 2 * GIB).await;

        // zpool itself only sees the written blocks
        let history_len = appliance.history().await.len();
        let stats = driver.pool_stats().await.unwrap();
        let history = appliance.history().await;
        let zpool = &history[history_len];
        assert_eq!(zpool[0], "zpool");
        assert!(zpool.contains(&"name,size,allocated,free".to_string()));

        assert_eq!(stats.allocated_bytes, 5 * GIB);
        assert_eq!(stats.used_bytes, 13 * GIB);
        assert_eq!(stats.free_bytes, 87 * GIB);
        assert_eq!(stats.advertised_free_bytes, 87 * GIB);
    }

    #[tokio::test]
    async fn test_over_subscription_applies_to_thin() {
        let mut config = config();
        config.over_subscription_ratio = 2.0;
        let (driver, _) = driver_with(config).await;
        driver
            .create_volume(&volume("v1", 10 * GIB, Provisioning::Thick))
            .await
            .unwrap();

        let stats = driver.pool_stats().await.unwrap();
        assert_eq!(stats.free_bytes, 90 * GIB);
        assert_eq!(stats.advertised_total_bytes, 200 * GIB);
        assert_eq!(stats.advertised_free_bytes, 180 * GIB);
        assert_eq!(stats.over_subscription_ratio, 2.0);
    }

    #[tokio::test]
    async fn test_stats_are_not_cached() {
        let (driver, _) = driver().await;
        let before = driver.pool_stats().await.unwrap();
        driver
            .create_volume(&volume("v1", 4 * GIB, Provisioning::Thick))
            .await
            .unwrap();
        let after = driver.pool_stats().await.unwrap();
        assert_eq!(before.free_bytes - after.free_bytes, 4 * GIB);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_publishes_until_cancelled() {
        let (driver, _) = driver().await;
        let reporter = driver.capacity();
        let (tx, mut rx) = watch::channel(None);
        let token = CancellationToken::new();

        let handle = tokio::spawn({
            let token = token.clone();
            async move { reporter.run(token, Duration::from_secs(60), tx).await }
        });

        rx.changed().await.unwrap();
        let stats = rx.borrow_and_update().clone().unwrap();
        assert_eq!(stats.total_bytes, 100 * GIB);

        token.cancel();
        handle.await.unwrap();
    }
}
