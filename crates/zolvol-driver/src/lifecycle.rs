use crate::error::{DriverError, Result};
use crate::export::ExportManager;
use crate::zfs::{Mutation, ZfsClient};
use std::sync::Arc;
use tracing::{info, warn};
use zolvol_core::naming::{device_path, to_dataset_path, to_snapshot_path};
use zolvol_core::{
    format_size, CloneOutcome, CoreError, DriverConfig, Provisioning, Snapshot, Volume,
    VolumeInfo,
};

/// Creates, resizes, snapshots, clones and destroys volumes
///
/// Nothing is remembered between calls. Each operation re-queries the
/// appliance, treats "already exists" on create and "does not exist" on
/// delete as success, and verifies its post-condition before returning.
pub struct VolumeManager {
    zfs: Arc<ZfsClient>,
    exports: Arc<ExportManager>,
    config: Arc<DriverConfig>,
}

fn check_size(size: u64, block_size: u64) -> Result<()> {
    if size == 0 {
        return Err(CoreError::invalid_size(size, block_size, "size must be positive").into());
    }
    if size % block_size != 0 {
        return Err(CoreError::invalid_size(
            size,
            block_size,
            format!("not a multiple of the {} byte block size", block_size),
        )
        .into());
    }
    Ok(())
}

impl VolumeManager {
    pub fn new(
        zfs: Arc<ZfsClient>,
        exports: Arc<ExportManager>,
        config: Arc<DriverConfig>,
    ) -> Self {
        Self {
            zfs,
            exports,
            config,
        }
    }

    fn dataset(&self, volume_id: &str) -> Result<String> {
        Ok(to_dataset_path(&self.config.base_dataset, volume_id)?)
    }

    /// Describe a volume after a mutation, failing if it vanished
    async fn verified_info(&self, dataset: &str) -> Result<VolumeInfo> {
        self.zfs
            .volume_info(dataset)
            .await?
            .ok_or_else(|| DriverError::verification_failed(dataset, "volume is not present"))
    }

    async fn verify_size(&self, dataset: &str, expected: u64) -> Result<VolumeInfo> {
        let info = self.verified_info(dataset).await?;
        if info.size_bytes != expected {
            return Err(DriverError::verification_failed(
                dataset,
                format!(
                    "volsize is {} bytes, expected {}",
                    info.size_bytes, expected
                ),
            ));
        }
        Ok(info)
    }

    async fn verify_absent(&self, dataset: &str) -> Result<()> {
        if self.zfs.exists(dataset).await? {
            return Err(DriverError::verification_failed(
                dataset,
                "dataset still present after destroy",
            ));
        }
        Ok(())
    }

    /// Create a zvol for the volume
    pub async fn create(&self, volume: &Volume) -> Result<VolumeInfo> {
        volume.properties.validate()?;
        check_size(volume.size_bytes, volume.properties.volblocksize)?;
        let dataset = self.dataset(&volume.id)?;

        let mut options = volume.properties.to_create_options();
        let sparse = volume.provisioning == Provisioning::Thin;
        if !sparse {
            options.push(format!("refreservation={}", volume.size_bytes));
        }

        match self
            .zfs
            .create_volume(
                &dataset,
                volume.size_bytes,
                sparse,
                volume.properties.volblocksize,
                &options,
            )
            .await?
        {
            Mutation::Applied => {}
            Mutation::AlreadyExists => {
                let existing = self.zfs.get_bytes(&dataset, "volsize").await?;
                if existing != Some(volume.size_bytes) {
                    return Err(DriverError::conflict(
                        &dataset,
                        format!(
                            "exists with volsize {}, requested {}",
                            existing.map_or("none".to_string(), |s| s.to_string()),
                            volume.size_bytes
                        ),
                    ));
                }
                warn!("{} already exists with the requested size", dataset);
            }
            Mutation::Missing => {
                return Err(DriverError::not_found(&self.config.base_dataset));
            }
        }

        let info = self.verify_size(&dataset, volume.size_bytes).await?;
        info!(
            "Created {} volume {} ({})",
            volume.provisioning,
            dataset,
            format_size(volume.size_bytes)
        );
        Ok(info)
    }

    /// Destroy a volume and its snapshots, tearing down any export first
    pub async fn delete(&self, volume_id: &str) -> Result<()> {
        let dataset = self.dataset(volume_id)?;
        if !self.zfs.exists(&dataset).await? {
            info!("{} is already absent", dataset);
            return Ok(());
        }

        // zfs refuses to destroy snapshots that still have clones; find out
        // before touching the export
        let clones = self.zfs.dependent_clones(&dataset).await?;
        if !clones.is_empty() {
            return Err(DriverError::conflict(
                &dataset,
                format!("snapshots have dependent clones: {}", clones.join(", ")),
            ));
        }

        let state = self.exports.export_state(volume_id).await?;
        if state.is_partial_or_active() {
            info!("Unexporting {} ({}) before delete", dataset, state);
            self.exports.unexport_volume(volume_id).await?;
        }

        if self.zfs.destroy(&dataset, true).await? == Mutation::Missing {
            warn!("{} disappeared before destroy", dataset);
        }
        self.verify_absent(&dataset).await?;
        info!("Deleted volume {}", dataset);
        Ok(())
    }

    /// Grow a volume; thick volumes grow their reservation too
    pub async fn extend(&self, volume_id: &str, new_size: u64) -> Result<VolumeInfo> {
        let dataset = self.dataset(volume_id)?;
        let props = self
            .zfs
            .get_properties(&dataset, &["volsize", "volblocksize", "refreservation"])
            .await?;
        let current = props["volsize"]
            .to_bytes("volsize")?
            .ok_or_else(|| DriverError::parse_error("volsize", "volume has no volsize"))?;
        let block_size = props["volblocksize"]
            .to_bytes("volblocksize")?
            .unwrap_or(self.config.default_properties.volblocksize);
        let thick = props["refreservation"]
            .to_bytes("refreservation")?
            .is_some_and(|r| r > 0);

        if new_size < current {
            return Err(DriverError::unsupported(
                "extend",
                format!(
                    "cannot shrink {} from {} to {} bytes",
                    dataset, current, new_size
                ),
            ));
        }
        if new_size == current {
            info!("{} is already {} bytes", dataset, current);
            return self.verified_info(&dataset).await;
        }
        check_size(new_size, block_size)?;

        let size = new_size.to_string();
        self.zfs.set_property(&dataset, "volsize", &size).await?;
        if thick {
            self.zfs
                .set_property(&dataset, "refreservation", &size)
                .await?;
        }

        let info = self.verify_size(&dataset, new_size).await?;
        info!(
            "Extended {} from {} to {}",
            dataset,
            format_size(current),
            format_size(new_size)
        );
        Ok(info)
    }

    /// Snapshot a volume
    pub async fn create_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let dataset = self.dataset(&snapshot.volume_id)?;
        let path = to_snapshot_path(&dataset, &snapshot.id)?;

        match self.zfs.snapshot(&path).await? {
            Mutation::Applied => {}
            Mutation::AlreadyExists => warn!("Snapshot {} already exists", path),
            Mutation::Missing => return Err(DriverError::not_found(dataset)),
        }

        if !self.zfs.exists(&path).await? {
            return Err(DriverError::verification_failed(
                &path,
                "snapshot not present after create",
            ));
        }
        info!("Created snapshot {}", path);
        Ok(())
    }

    /// Destroy a snapshot; an absent snapshot is success
    pub async fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let dataset = self.dataset(&snapshot.volume_id)?;
        let path = to_snapshot_path(&dataset, &snapshot.id)?;

        if self.zfs.destroy(&path, false).await? == Mutation::Missing {
            warn!("Snapshot {} is already absent", path);
        }
        self.verify_absent(&path).await?;
        info!("Deleted snapshot {}", path);
        Ok(())
    }

    /// Create a volume from a snapshot and promote it
    ///
    /// Promotion moves the snapshot to the clone, leaving the source volume
    /// free to be deleted. A failed promote leaves a usable clone and is
    /// reported as a warning in the outcome.
    pub async fn clone_from_snapshot(
        &self,
        snapshot: &Snapshot,
        new_volume_id: &str,
        requested_size: Option<u64>,
    ) -> Result<CloneOutcome> {
        let source = self.dataset(&snapshot.volume_id)?;
        let snapshot_path = to_snapshot_path(&source, &snapshot.id)?;
        let dataset = self.dataset(new_volume_id)?;

        if !self.zfs.exists(&snapshot_path).await? {
            let Some(mut volume) = self
                .promoted_clone(&source, &snapshot.id, &dataset)
                .await?
            else {
                return Err(DriverError::not_found(snapshot_path));
            };
            warn!(
                "{} was already cloned from {} and promoted",
                dataset, snapshot_path
            );
            if let Some(size) = requested_size.filter(|s| *s > volume.size_bytes) {
                volume = self.extend(new_volume_id, size).await?;
            }
            return Ok(CloneOutcome {
                volume,
                promoted: true,
                warning: None,
            });
        }
        let source_size = self
            .zfs
            .get_bytes(&snapshot_path, "volsize")
            .await?
            .unwrap_or(0);
        if let Some(size) = requested_size {
            if size < source_size {
                return Err(DriverError::unsupported(
                    "clone",
                    format!(
                        "requested {} bytes but {} is {} bytes",
                        size, snapshot_path, source_size
                    ),
                ));
            }
        }

        match self.zfs.clone_snapshot(&snapshot_path, &dataset).await? {
            Mutation::Applied => {}
            Mutation::AlreadyExists => {
                let origin = self.zfs.get_value(&dataset, "origin").await?;
                if origin.as_deref() != Some(snapshot_path.as_str()) {
                    return Err(DriverError::conflict(
                        &dataset,
                        format!(
                            "exists with origin {}, expected {}",
                            origin.unwrap_or_else(|| "none".to_string()),
                            snapshot_path
                        ),
                    ));
                }
                warn!("{} already cloned from {}", dataset, snapshot_path);
            }
            Mutation::Missing => return Err(DriverError::not_found(snapshot_path)),
        }

        let warning = match self.zfs.promote(&dataset).await {
            Ok(Mutation::Applied) => None,
            Ok(other) => Some(format!("promote of {} reported: {}", dataset, other)),
            Err(e) => Some(format!("promote of {} failed: {}", dataset, e)),
        };
        if let Some(ref message) = warning {
            warn!("{}; clone remains dependent on {}", message, snapshot_path);
        }

        let mut volume = self.verified_info(&dataset).await?;
        if let Some(size) = requested_size.filter(|s| *s > volume.size_bytes) {
            volume = self.extend(new_volume_id, size).await?;
        }

        info!("Cloned {} into {}", snapshot_path, dataset);
        Ok(CloneOutcome {
            volume,
            promoted: warning.is_none(),
            warning,
        })
    }

    /// The clone left by an earlier promoted clone of `source@snapshot_id`
    ///
    /// Promotion moves the snapshot onto the clone and makes it the source's
    /// origin, so the original snapshot path no longer exists.
    async fn promoted_clone(
        &self,
        source: &str,
        snapshot_id: &str,
        dataset: &str,
    ) -> Result<Option<VolumeInfo>> {
        let moved = to_snapshot_path(dataset, snapshot_id)?;
        if !self.zfs.exists(&moved).await? {
            return Ok(None);
        }
        match self.zfs.get_value(source, "origin").await {
            Ok(origin) if origin.as_deref() == Some(moved.as_str()) => {
                self.zfs.volume_info(dataset).await
            }
            Ok(_) | Err(DriverError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Clone a volume through a snapshot named after the new volume
    pub async fn clone_volume(
        &self,
        source_id: &str,
        new_volume_id: &str,
        requested_size: Option<u64>,
    ) -> Result<CloneOutcome> {
        let snapshot = Snapshot::new(format!("clone-{}", new_volume_id), source_id);
        self.create_snapshot(&snapshot).await?;
        self.clone_from_snapshot(&snapshot, new_volume_id, requested_size)
            .await
    }

    pub async fn get_volume(&self, volume_id: &str) -> Result<Option<VolumeInfo>> {
        let dataset = self.dataset(volume_id)?;
        self.zfs.volume_info(&dataset).await
    }

    pub async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        self.zfs.list_volumes().await
    }

    /// Device node of the volume on the appliance
    pub fn local_path(&self, volume_id: &str) -> Result<String> {
        Ok(device_path(&self.dataset(volume_id)?))
    }
}

#[cfg(test)]
mod tests {
    use crate::driver::testing::*;
    use crate::error::DriverError;
    use crate::mock::MockFaults;
    use crate::traits::VolumeDriver;
    use zolvol_core::{CoreError, Provisioning, Snapshot};

    #[tokio::test]
    async fn test_create_then_delete_leaves_no_dataset() {
        let (driver, appliance) = driver().await;

        let info = driver
            .create_volume(&volume("v1", 2 * GIB, Provisioning::Thin))
            .await
            .unwrap();
        assert_eq!(info.dataset, "pool/cinder/v1");
        assert_eq!(info.size_bytes, 2 * GIB);
        assert!(appliance.exists("pool/cinder/v1").await);

        driver.delete_volume("v1").await.unwrap();
        assert!(!appliance.exists("pool/cinder/v1").await);
        assert!(driver.get_volume("v1").await.unwrap().is_none());

        // Deleting again is a no-op
        driver.delete_volume("v1").await.unwrap();
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (driver, _) = driver().await;
        let v1 = volume("v1", GIB, Provisioning::Thin);

        driver.create_volume(&v1).await.unwrap();
        driver.create_volume(&v1).await.unwrap();

        let volumes = driver.list_volumes().await.unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].id, "v1");
    }

    #[tokio::test]
    async fn test_create_with_mismatched_size_conflicts() {
        let (driver, appliance) = driver().await;
        driver
            .create_volume(&volume("v1", 5 * GIB, Provisioning::Thin))
            .await
            .unwrap();

        let err = driver
            .create_volume(&volume("v1", 6 * GIB, Provisioning::Thin))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::ConflictError { .. }));
        assert_eq!(
            appliance.property("pool/cinder/v1", "volsize").await,
            Some((5 * GIB).to_string())
        );
    }

    #[tokio::test]
    async fn test_thin_and_thick_reservations() {
        let (driver, appliance) = driver().await;

        let thin = driver
            .create_volume(&volume("thin", GIB, Provisioning::Thin))
            .await
            .unwrap();
        assert_eq!(thin.refreservation, None);
        assert_eq!(thin.provisioning(), Provisioning::Thin);

        let thick = driver
            .create_volume(&volume("thick", GIB, Provisioning::Thick))
            .await
            .unwrap();
        assert_eq!(thick.refreservation, Some(GIB));
        assert_eq!(thick.provisioning(), Provisioning::Thick);

        let history = appliance.history().await;
        let creates: Vec<_> = history
            .iter()
            .filter(|argv| argv.get(1).map(String::as_str) == Some("create"))
            .collect();
        assert!(creates[0].contains(&"-s".to_string()));
        assert!(!creates[1].contains(&"-s".to_string()));
        assert!(creates[1].contains(&format!("refreservation={}", GIB)));
    }

    #[tokio::test]
    async fn test_invalid_requests_issue_no_commands() {
        let (driver, appliance) = driver().await;

        let err = driver
            .create_volume(&volume("v1", GIB + 1, Provisioning::Thin))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::Core(CoreError::InvalidSize { .. })
        ));

        let err = driver
            .create_volume(&volume("v1", 0, Provisioning::Thin))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::Core(CoreError::InvalidSize { .. })
        ));

        let err = driver
            .create_volume(&volume("a/b", GIB, Provisioning::Thin))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::Core(CoreError::InvalidIdentifier { .. })
        ));

        assert!(appliance.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_extend() {
        let (driver, appliance) = driver().await;
        driver
            .create_volume(&volume("v1", 2 * GIB, Provisioning::Thick))
            .await
            .unwrap();

        let err = driver.extend_volume("v1", GIB).await.unwrap_err();
        assert!(matches!(err, DriverError::UnsupportedOperation { .. }));
        assert_eq!(
            appliance.property("pool/cinder/v1", "volsize").await,
            Some((2 * GIB).to_string())
        );

        let same = driver.extend_volume("v1", 2 * GIB).await.unwrap();
        assert_eq!(same.size_bytes, 2 * GIB);

        let grown = driver.extend_volume("v1", 3 * GIB).await.unwrap();
        assert_eq!(grown.size_bytes, 3 * GIB);
        assert_eq!(grown.refreservation, Some(3 * GIB));

        let err = driver.extend_volume("v1", 3 * GIB + 7).await.unwrap_err();
        assert!(matches!(
            err,
            DriverError::Core(CoreError::InvalidSize { .. })
        ));
    }

    #[tokio::test]
    async fn test_extend_missing_volume() {
        let (driver, _) = driver().await;
        let err = driver.extend_volume("ghost", GIB).await.unwrap_err();
        assert!(matches!(err, DriverError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_snapshots_are_idempotent() {
        let (driver, appliance) = driver().await;
        driver
            .create_volume(&volume("v1", GIB, Provisioning::Thin))
            .await
            .unwrap();
        let snap = Snapshot::new("snap1", "v1");

        driver.create_snapshot(&snap).await.unwrap();
        driver.create_snapshot(&snap).await.unwrap();
        assert!(appliance.exists("pool/cinder/v1@snap1").await);

        driver.delete_snapshot(&snap).await.unwrap();
        driver.delete_snapshot(&snap).await.unwrap();
        assert!(!appliance.exists("pool/cinder/v1@snap1").await);

        let err = driver
            .create_snapshot(&Snapshot::new("snap1", "ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_snapshot_clone_promote_delete_scenario() {
        let (driver, appliance) = driver().await;

        driver
            .create_volume(&volume("v1", 5 * GIB, Provisioning::Thick))
            .await
            .unwrap();
        assert_eq!(
            appliance.property("pool/cinder/v1", "refreservation").await,
            Some((5 * GIB).to_string())
        );

        let snap1 = Snapshot::new("snap1", "v1");
        driver.create_snapshot(&snap1).await.unwrap();
        assert!(appliance.exists("pool/cinder/v1@snap1").await);

        let outcome = driver
            .clone_from_snapshot(&snap1, "v2", None)
            .await
            .unwrap();
        assert!(outcome.promoted);
        assert!(outcome.warning.is_none());
        assert_eq!(outcome.volume.dataset, "pool/cinder/v2");
        assert_eq!(outcome.volume.origin, None);
        assert_eq!(outcome.volume.size_bytes, 5 * GIB);

        driver.delete_volume("v1").await.unwrap();
        assert!(!appliance.exists("pool/cinder/v1").await);
        assert!(!appliance.exists("pool/cinder/v1@snap1").await);

        let v2 = driver.get_volume("v2").await.unwrap().unwrap();
        assert_eq!(v2.size_bytes, 5 * GIB);
        assert_eq!(driver.list_volumes().await.unwrap(), vec![v2]);
    }

    #[tokio::test]
    async fn test_delete_of_absent_snapshot_on_present_volume() {
        let (driver, appliance) = driver().await;
        driver
            .create_volume(&volume("v1", GIB, Provisioning::Thin))
            .await
            .unwrap();

        driver
            .delete_snapshot(&Snapshot::new("never-taken", "v1"))
            .await
            .unwrap();

        let history = appliance.history().await;
        let destroy = history
            .iter()
            .find(|argv| argv.get(1).map(String::as_str) == Some("destroy"))
            .unwrap();
        assert_eq!(destroy.last().unwrap(), "pool/cinder/v1@never-taken");
    }

    #[tokio::test]
    async fn test_repeated_clone_returns_promoted_clone() {
        let (driver, appliance) = driver().await;
        driver
            .create_volume(&volume("v1", GIB, Provisioning::Thin))
            .await
            .unwrap();
        let snap1 = Snapshot::new("snap1", "v1");
        driver.create_snapshot(&snap1).await.unwrap();

        let first = driver
            .clone_from_snapshot(&snap1, "v2", None)
            .await
            .unwrap();
        assert!(!appliance.exists("pool/cinder/v1@snap1").await);

        let second = driver
            .clone_from_snapshot(&snap1, "v2", None)
            .await
            .unwrap();
        assert!(second.promoted);
        assert_eq!(second.volume, first.volume);

        // A different clone name does not match the moved snapshot
        let err = driver
            .clone_from_snapshot(&snap1, "v3", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_with_dependent_clone_keeps_export() {
        let (driver, appliance) = driver().await;
        driver
            .create_volume(&volume("v1", GIB, Provisioning::Thin))
            .await
            .unwrap();
        let snap1 = Snapshot::new("snap1", "v1");
        driver.create_snapshot(&snap1).await.unwrap();
        appliance
            .set_faults(MockFaults {
                promote_fails: true,
                ..Default::default()
            })
            .await;
        driver
            .clone_from_snapshot(&snap1, "v2", None)
            .await
            .unwrap();
        driver.export_volume("v1").await.unwrap();

        let err = driver.delete_volume("v1").await.unwrap_err();
        match err {
            DriverError::ConflictError { message, .. } => {
                assert!(message.contains("pool/cinder/v2"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(driver.is_exported("v1").await.unwrap());
        assert!(!appliance
            .history()
            .await
            .iter()
            .any(|argv| argv.contains(&"shareiscsi=off".to_string())));
    }

    #[tokio::test]
    async fn test_clone_of_missing_snapshot() {
        let (driver, appliance) = driver().await;
        driver
            .create_volume(&volume("v1", GIB, Provisioning::Thin))
            .await
            .unwrap();

        let err = driver
            .clone_from_snapshot(&Snapshot::new("nope", "v1"), "v2", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::NotFound { .. }));
        assert!(!appliance.exists("pool/cinder/v2").await);
    }

    #[tokio::test]
    async fn test_failed_promote_is_a_warning() {
        let (driver, appliance) = driver().await;
        driver
            .create_volume(&volume("v1", GIB, Provisioning::Thin))
            .await
            .unwrap();
        let snap1 = Snapshot::new("snap1", "v1");
        driver.create_snapshot(&snap1).await.unwrap();
        appliance
            .set_faults(MockFaults {
                promote_fails: true,
                ..Default::default()
            })
            .await;

        let outcome = driver
            .clone_from_snapshot(&snap1, "v2", None)
            .await
            .unwrap();
        assert!(!outcome.promoted);
        assert!(outcome.warning.unwrap().contains("promote"));
        assert_eq!(
            outcome.volume.origin.as_deref(),
            Some("pool/cinder/v1@snap1")
        );

        // The unpromoted clone still pins its origin
        let err = driver.delete_volume("v1").await.unwrap_err();
        assert!(matches!(err, DriverError::ConflictError { .. }));
        assert!(appliance.exists("pool/cinder/v1").await);
    }

    #[tokio::test]
    async fn test_clone_onto_unrelated_volume_conflicts() {
        let (driver, _) = driver().await;
        driver
            .create_volume(&volume("v1", GIB, Provisioning::Thin))
            .await
            .unwrap();
        driver
            .create_volume(&volume("v2", GIB, Provisioning::Thin))
            .await
            .unwrap();
        let snap1 = Snapshot::new("snap1", "v1");
        driver.create_snapshot(&snap1).await.unwrap();

        let err = driver
            .clone_from_snapshot(&snap1, "v2", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::ConflictError { .. }));
    }

    #[tokio::test]
    async fn test_clone_with_larger_size() {
        let (driver, _) = driver().await;
        driver
            .create_volume(&volume("v1", GIB, Provisioning::Thin))
            .await
            .unwrap();
        let snap1 = Snapshot::new("snap1", "v1");
        driver.create_snapshot(&snap1).await.unwrap();

        let err = driver
            .clone_from_snapshot(&snap1, "small", Some(GIB / 2))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::UnsupportedOperation { .. }));

        let outcome = driver
            .clone_from_snapshot(&snap1, "big", Some(4 * GIB))
            .await
            .unwrap();
        assert_eq!(outcome.volume.size_bytes, 4 * GIB);
    }

    #[tokio::test]
    async fn test_clone_volume() {
        let (driver, appliance) = driver().await;
        driver
            .create_volume(&volume("v1", GIB, Provisioning::Thin))
            .await
            .unwrap();

        let outcome = driver.clone_volume("v1", "v3", None).await.unwrap();
        assert!(outcome.promoted);
        assert_eq!(outcome.volume.id, "v3");
        // Promotion moved the temporary snapshot to the clone
        assert!(appliance.exists("pool/cinder/v3@clone-v3").await);
        assert!(!appliance.exists("pool/cinder/v1@clone-v3").await);
    }

    #[tokio::test]
    async fn test_delete_unexports_first() {
        let (driver, appliance) = driver().await;
        driver
            .create_volume(&volume("v1", GIB, Provisioning::Thin))
            .await
            .unwrap();
        driver.export_volume("v1").await.unwrap();
        assert!(appliance.target_for("pool/cinder/v1").await.is_some());

        driver.delete_volume("v1").await.unwrap();
        assert!(!appliance.exists("pool/cinder/v1").await);
        assert!(appliance.target_for("pool/cinder/v1").await.is_none());

        let history = appliance.history().await;
        let unshare = history
            .iter()
            .position(|argv| argv.contains(&"shareiscsi=off".to_string()))
            .unwrap();
        let destroy = history
            .iter()
            .position(|argv| argv.get(1).map(String::as_str) == Some("destroy"))
            .unwrap();
        assert!(unshare < destroy);
    }
}
