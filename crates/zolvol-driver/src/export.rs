use crate::error::{DriverError, Result};
use crate::tgt::TargetAdmin;
use crate::zfs::ZfsClient;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zolvol_core::naming::{device_path, target_name, to_dataset_path};
use zolvol_core::{DriverConfig, ExportConfig, ExportInfo, ExportState};

/// Manages iSCSI exports of volumes
///
/// Export state is never cached. It is recomputed on every call from two
/// sources: the dataset's share property and the target daemon's view of
/// the zvol's device node.
pub struct ExportManager {
    zfs: Arc<ZfsClient>,
    targets: TargetAdmin,
    config: Arc<DriverConfig>,
}

impl ExportManager {
    pub fn new(zfs: Arc<ZfsClient>, targets: TargetAdmin, config: Arc<DriverConfig>) -> Self {
        Self {
            zfs,
            targets,
            config,
        }
    }

    fn settings(&self) -> &ExportConfig {
        &self.config.export
    }

    async fn share_enabled(&self, dataset: &str) -> Result<bool> {
        let value = self
            .zfs
            .get_value(dataset, &self.settings().share_property)
            .await?;
        Ok(matches!(value.as_deref(), Some(v) if v != "off"))
    }

    /// Current export state of a volume
    ///
    /// Fails with `NotFound` if the volume does not exist.
    pub async fn export_state(&self, volume_id: &str) -> Result<ExportState> {
        let dataset = to_dataset_path(&self.config.base_dataset, volume_id)?;
        let shared = self.share_enabled(&dataset).await?;
        let target = self.targets.find_export(&device_path(&dataset)).await?;

        Ok(match (shared, target) {
            (false, None) => ExportState::NotExported,
            (true, None) => ExportState::PropertyOnly,
            (false, Some(info)) => ExportState::TargetOnly(info),
            (true, Some(info)) => ExportState::Exported(info),
        })
    }

    /// Whether the share property is on and a target is discoverable
    pub async fn is_exported(&self, volume_id: &str) -> Result<bool> {
        Ok(matches!(
            self.export_state(volume_id).await?,
            ExportState::Exported(_)
        ))
    }

    /// Share a volume over iSCSI and wait for its target to appear
    pub async fn export_volume(&self, volume_id: &str) -> Result<ExportInfo> {
        let dataset = to_dataset_path(&self.config.base_dataset, volume_id)?;
        let state = self.export_state(volume_id).await?;
        if let ExportState::Exported(ref info) = state {
            debug!("{} is already exported as {}", dataset, info.target_iqn);
            return Ok(info.clone());
        }
        if state.is_partial_or_active() {
            warn!("{} is partially exported ({}), re-sharing", dataset, state);
        }

        let settings = self.settings();
        self.zfs
            .set_property(&dataset, &settings.share_property, "on")
            .await?;

        let backing_store = device_path(&dataset);
        for attempt in 1..=settings.poll_attempts {
            if let Some(info) = self.targets.find_export(&backing_store).await? {
                let expected = target_name(&settings.target_prefix, volume_id);
                if info.target_iqn != expected {
                    warn!(
                        "Target for {} is named {} (expected {})",
                        dataset, info.target_iqn, expected
                    );
                }
                info!(
                    "Exported {} as {} (tid {}, lun {})",
                    dataset, info.target_iqn, info.tid, info.lun
                );
                return Ok(info);
            }
            debug!(
                "No target for {} yet (attempt {}/{})",
                backing_store, attempt, settings.poll_attempts
            );
            if attempt < settings.poll_attempts {
                tokio::time::sleep(settings.poll_interval()).await;
            }
        }

        Err(DriverError::export_timeout(dataset, settings.poll_attempts))
    }

    /// Unshare a volume and verify its target is gone
    pub async fn unexport_volume(&self, volume_id: &str) -> Result<()> {
        let dataset = to_dataset_path(&self.config.base_dataset, volume_id)?;
        let backing_store = device_path(&dataset);

        let state = match self.export_state(volume_id).await {
            Ok(state) => state,
            Err(DriverError::NotFound { .. }) => {
                // Without the dataset there is no property left to unset
                return match self.targets.find_export(&backing_store).await? {
                    None => Ok(()),
                    Some(info) => Err(DriverError::export_teardown(dataset, info.target_iqn, 0)),
                };
            }
            Err(e) => return Err(e),
        };
        if !state.is_partial_or_active() {
            debug!("{} is not exported", dataset);
            return Ok(());
        }

        let settings = self.settings();
        let mut lingering = None;
        for round in 1..=settings.teardown_attempts {
            self.zfs
                .set_property(&dataset, &settings.share_property, "off")
                .await?;

            lingering = self.wait_for_removal(&backing_store).await?;
            match lingering {
                None => {
                    info!("Unexported {}", dataset);
                    return Ok(());
                }
                Some(ref info) => warn!(
                    "Target {} for {} still present after teardown round {}/{}",
                    info.target_iqn, dataset, round, settings.teardown_attempts
                ),
            }
        }

        let target_iqn = lingering.map(|info| info.target_iqn).unwrap_or_default();
        Err(DriverError::export_teardown(
            dataset,
            target_iqn,
            settings.teardown_attempts,
        ))
    }

    /// Poll until no target exports the device; returns the last one seen
    async fn wait_for_removal(&self, backing_store: &str) -> Result<Option<ExportInfo>> {
        let settings = self.settings();
        let mut last = None;
        for attempt in 1..=settings.poll_attempts {
            last = self.targets.find_export(backing_store).await?;
            if last.is_none() {
                return Ok(None);
            }
            if attempt < settings.poll_attempts {
                tokio::time::sleep(settings.poll_interval()).await;
            }
        }
        Ok(last)
    }
}
