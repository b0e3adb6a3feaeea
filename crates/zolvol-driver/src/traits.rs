use crate::error::Result;
use async_trait::async_trait;
use zolvol_core::{
    CloneOutcome, ExportInfo, ExportState, PoolStats, Snapshot, Volume, VolumeInfo,
};

/// Trait for block-volume backends driven by a storage orchestrator
///
/// Every call derives its state from the backend; nothing is cached between
/// calls. Operations on the same volume must be serialized by the caller.
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    // --- Volume lifecycle ---

    /// Create a volume (idempotent for an identical size)
    async fn create_volume(&self, volume: &Volume) -> Result<VolumeInfo>;

    /// Delete a volume, unexporting it first (idempotent)
    async fn delete_volume(&self, volume_id: &str) -> Result<()>;

    /// Grow a volume to `new_size` bytes
    async fn extend_volume(&self, volume_id: &str, new_size: u64) -> Result<VolumeInfo>;

    // --- Snapshots and clones ---

    async fn create_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    async fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    /// Create a volume from a snapshot
    async fn clone_from_snapshot(
        &self,
        snapshot: &Snapshot,
        new_volume_id: &str,
        requested_size: Option<u64>,
    ) -> Result<CloneOutcome>;

    /// Create a volume from another volume's current contents
    async fn clone_volume(
        &self,
        source_id: &str,
        new_volume_id: &str,
        requested_size: Option<u64>,
    ) -> Result<CloneOutcome>;

    // --- Export ---

    async fn export_volume(&self, volume_id: &str) -> Result<ExportInfo>;

    async fn unexport_volume(&self, volume_id: &str) -> Result<()>;

    async fn is_exported(&self, volume_id: &str) -> Result<bool>;

    async fn export_state(&self, volume_id: &str) -> Result<ExportState>;

    // --- Query ---

    async fn get_volume(&self, volume_id: &str) -> Result<Option<VolumeInfo>>;

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>>;

    /// Current pool capacity, never cached
    async fn pool_stats(&self) -> Result<PoolStats>;

    /// Release the connection to the backend
    async fn close(&self) -> Result<()>;
}
