use crate::capacity::CapacityReporter;
use crate::command::CommandRunner;
use crate::error::Result;
use crate::export::ExportManager;
use crate::lifecycle::VolumeManager;
use crate::parser::{OutputParser, ZfsOutputParserV1};
use crate::tgt::TargetAdmin;
use crate::traits::VolumeDriver;
use crate::transport::{self, Transport};
use crate::zfs::ZfsClient;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use zolvol_core::{
    CloneOutcome, DriverConfig, ExportInfo, ExportState, PoolStats, Snapshot, Volume, VolumeInfo,
};

/// ZFS-on-Linux volume driver exporting zvols over iSCSI
///
/// Owns the connection to the appliance for its whole lifetime: `open`
/// establishes it and `close` releases it. Every component shares the same
/// `CommandRunner`.
pub struct ZfsVolumeDriver {
    config: Arc<DriverConfig>,
    runner: Arc<CommandRunner>,
    volumes: VolumeManager,
    exports: Arc<ExportManager>,
    capacity: Arc<CapacityReporter>,
}

impl ZfsVolumeDriver {
    /// Validate the configuration and connect with the configured transport
    pub async fn open(config: DriverConfig) -> Result<Self> {
        let transport = transport::from_config(&config.transport);
        Self::with_transport(config, transport).await
    }

    /// Validate the configuration and connect over the given transport
    pub async fn with_transport(
        config: DriverConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        transport.open().await?;

        let config = Arc::new(config);
        let runner = Arc::new(CommandRunner::new(transport, &config));
        let parser: Arc<dyn OutputParser> =
            Arc::new(ZfsOutputParserV1::new(config.list_format));

        let zfs = Arc::new(ZfsClient::new(
            runner.clone(),
            parser.clone(),
            config.clone(),
        ));
        let exports = Arc::new(ExportManager::new(
            zfs.clone(),
            TargetAdmin::new(runner.clone(), parser.clone()),
            config.clone(),
        ));
        let volumes = VolumeManager::new(zfs, exports.clone(), config.clone());
        let capacity = Arc::new(CapacityReporter::new(
            runner.clone(),
            parser.clone(),
            config.clone(),
        ));

        info!(
            "Opened volume driver for {} on {} (parser {})",
            config.base_dataset,
            runner.target(),
            parser.version()
        );

        Ok(Self {
            config,
            runner,
            volumes,
            exports,
            capacity,
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Capacity reporter, shareable with a background task
    pub fn capacity(&self) -> Arc<CapacityReporter> {
        self.capacity.clone()
    }

    /// Device node of a volume on the appliance
    pub fn local_path(&self, volume_id: &str) -> Result<String> {
        self.volumes.local_path(volume_id)
    }

    /// Provider location string for an export
    pub fn provider_location(&self, export: &ExportInfo) -> String {
        export.provider_location(
            &self.config.export.portal_address,
            self.config.export.portal_port,
        )
    }
}

#[async_trait]
impl VolumeDriver for ZfsVolumeDriver {
    async fn create_volume(&self, volume: &Volume) -> Result<VolumeInfo> {
        self.volumes.create(volume).await
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        self.volumes.delete(volume_id).await
    }

    async fn extend_volume(&self, volume_id: &str, new_size: u64) -> Result<VolumeInfo> {
        self.volumes.extend(volume_id, new_size).await
    }

    async fn create_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.volumes.create_snapshot(snapshot).await
    }

    async fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.volumes.delete_snapshot(snapshot).await
    }

    async fn clone_from_snapshot(
        &self,
        snapshot: &Snapshot,
        new_volume_id: &str,
        requested_size: Option<u64>,
    ) -> Result<CloneOutcome> {
        self.volumes
            .clone_from_snapshot(snapshot, new_volume_id, requested_size)
            .await
    }

    async fn clone_volume(
        &self,
        source_id: &str,
        new_volume_id: &str,
        requested_size: Option<u64>,
    ) -> Result<CloneOutcome> {
        self.volumes
            .clone_volume(source_id, new_volume_id, requested_size)
            .await
    }

    async fn export_volume(&self, volume_id: &str) -> Result<ExportInfo> {
        self.exports.export_volume(volume_id).await
    }

    async fn unexport_volume(&self, volume_id: &str) -> Result<()> {
        self.exports.unexport_volume(volume_id).await
    }

    async fn is_exported(&self, volume_id: &str) -> Result<bool> {
        self.exports.is_exported(volume_id).await
    }

    async fn export_state(&self, volume_id: &str) -> Result<ExportState> {
        self.exports.export_state(volume_id).await
    }

    async fn get_volume(&self, volume_id: &str) -> Result<Option<VolumeInfo>> {
        self.volumes.get_volume(volume_id).await
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        self.volumes.list_volumes().await
    }

    async fn pool_stats(&self) -> Result<PoolStats> {
        self.capacity.pool_stats().await
    }

    async fn close(&self) -> Result<()> {
        info!("Closing volume driver for {}", self.config.base_dataset);
        self.runner.close().await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::mock::MockAppliance;
    use zolvol_core::{DatasetProperties, Provisioning};

    pub const GIB: u64 = 1 << 30;

    pub fn config() -> DriverConfig {
        let mut config = DriverConfig::new("pool/cinder");
        config.export.poll_interval_ms = 10;
        config
    }

    pub async fn driver_with(config: DriverConfig) -> (ZfsVolumeDriver, Arc<MockAppliance>) {
        let appliance = Arc::new(MockAppliance::new(&config.base_dataset, 100 * GIB));
        let driver = ZfsVolumeDriver::with_transport(config, appliance.clone())
            .await
            .unwrap();
        (driver, appliance)
    }

    pub async fn driver() -> (ZfsVolumeDriver, Arc<MockAppliance>) {
        driver_with(config()).await
    }

    pub fn volume(id: &str, size_bytes: u64, provisioning: Provisioning) -> Volume {
        Volume::new(id, size_bytes, provisioning, DatasetProperties::default())
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::error::DriverError;
    use crate::mock::{MockAppliance, MockFaults};
    use zolvol_core::{CoreError, Provisioning};

    #[tokio::test]
    async fn test_invalid_config_rejected_before_any_command() {
        let mut config = config();
        config.over_subscription_ratio = 0.5;
        let appliance = Arc::new(MockAppliance::new("pool/cinder", 100 * GIB));

        let result = ZfsVolumeDriver::with_transport(config, appliance.clone()).await;
        assert!(matches!(
            result,
            Err(DriverError::Core(CoreError::InvalidConfig { .. }))
        ));
        assert!(appliance.history().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_transport_failures_are_retried() {
        let (driver, appliance) = driver().await;
        appliance
            .set_faults(MockFaults {
                transport_failures: 2,
                ..Default::default()
            })
            .await;

        driver
            .create_volume(&volume("v1", GIB, Provisioning::Thin))
            .await
            .unwrap();
        assert!(appliance.exists("pool/cinder/v1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_surfaces_transport_error() {
        let (driver, appliance) = driver().await;
        appliance
            .set_faults(MockFaults {
                transport_failures: 100,
                ..Default::default()
            })
            .await;

        let err = driver.get_volume("v1").await.unwrap_err();
        assert!(matches!(err, DriverError::TransportError { attempts: 4, .. }));
    }

    #[tokio::test]
    async fn test_commands_use_configured_paths() {
        let mut config = config();
        config.commands.zfs = "/usr/sbin/zfs".to_string();
        let (driver, appliance) = driver_with(config).await;

        driver.get_volume("v1").await.unwrap();
        let history = appliance.history().await;
        assert_eq!(history[0][0], "/usr/sbin/zfs");
        assert!(history[0].contains(&"pool/cinder/v1".to_string()));
    }

    #[tokio::test]
    async fn test_local_path_and_provider_location() {
        let (driver, _) = driver().await;
        assert_eq!(driver.local_path("v1").unwrap(), "/dev/zvol/pool/cinder/v1");
        assert!(driver.local_path("../etc").is_err());

        let export = ExportInfo {
            target_iqn: "iqn.2010-10.org.openstack:v1".to_string(),
            tid: 3,
            lun: 1,
            backing_store: "/dev/zvol/pool/cinder/v1".to_string(),
        };
        assert_eq!(
            driver.provider_location(&export),
            "127.0.0.1:3260,3 iqn.2010-10.org.openstack:v1 1"
        );
    }

    #[tokio::test]
    async fn test_close() {
        let (driver, _) = driver().await;
        driver.close().await.unwrap();
    }
}
