//! Mapping between orchestrator identifiers and ZFS dataset paths.
//!
//! Everything here is a pure function of its inputs, so the identity of a
//! volume can always be recomputed from the base dataset and its identifier.

use crate::error::{CoreError, Result};

const MAX_IDENTIFIER_LEN: usize = 200;

/// Check that an identifier is safe to embed in a dataset path
pub fn validate_identifier(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(CoreError::invalid_identifier(id, "identifier is empty"));
    }
    if id.len() > MAX_IDENTIFIER_LEN {
        return Err(CoreError::invalid_identifier(
            id,
            format!("identifier is longer than {} characters", MAX_IDENTIFIER_LEN),
        ));
    }
    // A leading '-' would be read as an option by zfs
    if id.starts_with('-') || id.starts_with('.') {
        return Err(CoreError::invalid_identifier(
            id,
            "identifier may not start with '-' or '.'",
        ));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-')))
    {
        return Err(CoreError::invalid_identifier(
            id,
            format!("character {:?} is not allowed", bad),
        ));
    }
    Ok(())
}

/// Check that a configured base dataset is a plausible dataset path
pub fn validate_base_dataset(base: &str) -> Result<()> {
    let trimmed = base.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(CoreError::invalid_config(
            "base_dataset is empty",
            "Set base_dataset to a pool or dataset, e.g. 'pool/cinder'",
        ));
    }
    if trimmed.starts_with('/') {
        return Err(CoreError::invalid_config(
            format!("base_dataset '{}' looks like a filesystem path", base),
            "Dataset paths start with the pool name, e.g. 'pool/cinder', not '/pool/cinder'",
        ));
    }
    for component in trimmed.split('/') {
        validate_identifier(component).map_err(|e| {
            CoreError::invalid_config(
                format!("base_dataset '{}' has an invalid component: {}", base, e),
                "Each component of base_dataset must be a valid dataset name",
            )
        })?;
    }
    Ok(())
}

fn normalized_base(base: &str) -> &str {
    base.trim_end_matches('/')
}

/// Derive the dataset path for a volume: `<base>/<volume_id>`
pub fn to_dataset_path(base: &str, volume_id: &str) -> Result<String> {
    validate_identifier(volume_id)?;
    Ok(format!("{}/{}", normalized_base(base), volume_id))
}

/// Derive the snapshot path: `<dataset>@<snapshot_id>`
pub fn to_snapshot_path(dataset: &str, snapshot_id: &str) -> Result<String> {
    validate_identifier(snapshot_id)?;
    Ok(format!("{}@{}", dataset, snapshot_id))
}

/// Recover the volume identifier from a dataset path under `base`
///
/// Returns `None` for the base itself, nested children, snapshots, and
/// datasets outside `base`.
pub fn to_volume_id(base: &str, dataset: &str) -> Option<String> {
    let prefix = format!("{}/", normalized_base(base));
    let id = dataset.strip_prefix(&prefix)?;
    validate_identifier(id).ok()?;
    Some(id.to_string())
}

/// Split `<dataset>@<snapshot>` into its parts
pub fn split_snapshot_path(path: &str) -> Option<(&str, &str)> {
    let (dataset, snapshot) = path.split_once('@')?;
    if dataset.is_empty() || snapshot.is_empty() {
        return None;
    }
    Some((dataset, snapshot))
}

/// Block device node for a zvol
pub fn device_path(dataset: &str) -> String {
    format!("/dev/zvol/{}", dataset)
}

/// Pool name (first path component) of a dataset
pub fn pool_name(dataset: &str) -> &str {
    dataset.split('/').next().unwrap_or(dataset)
}

/// iSCSI target name for a volume: `<prefix><volume_id>`
pub fn target_name(prefix: &str, volume_id: &str) -> String {
    format!("{}{}", prefix, volume_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_dataset_path() {
        assert_eq!(
            to_dataset_path("pool/cinder", "v1").unwrap(),
            "pool/cinder/v1"
        );
        assert_eq!(
            to_dataset_path("pool/cinder/", "v1").unwrap(),
            "pool/cinder/v1"
        );
    }

    #[test]
    fn test_dataset_path_is_deterministic_and_injective() {
        let ids = [
            "v1",
            "v2",
            "volume-0b6c3a1e-8f1c-4a44-9d3f-3c1e2f6a7b80",
            "V1",
            "v1.snapbase",
            "a:b",
            "a_b",
        ];
        let mut seen = HashSet::new();
        for id in ids {
            let first = to_dataset_path("pool/cinder", id).unwrap();
            let second = to_dataset_path("pool/cinder", id).unwrap();
            assert_eq!(first, second);
            assert!(seen.insert(first.clone()), "collision for {}", id);
            assert_eq!(to_volume_id("pool/cinder", &first).as_deref(), Some(id));
        }
    }

    #[test]
    fn test_rejects_unsafe_identifiers() {
        for bad in [
            "", "a/b", "a@b", "a#b", "a b", "-rf", ".hidden", "v1;rm", "v1\n", "ü",
        ] {
            assert!(
                to_dataset_path("pool/cinder", bad).is_err(),
                "accepted {:?}",
                bad
            );
        }
        let long = "a".repeat(201);
        assert!(to_dataset_path("pool/cinder", &long).is_err());
    }

    #[test]
    fn test_snapshot_path() {
        assert_eq!(
            to_snapshot_path("pool/cinder/v1", "snap1").unwrap(),
            "pool/cinder/v1@snap1"
        );
        assert!(to_snapshot_path("pool/cinder/v1", "snap@1").is_err());
        assert_eq!(
            split_snapshot_path("pool/cinder/v1@snap1"),
            Some(("pool/cinder/v1", "snap1"))
        );
        assert_eq!(split_snapshot_path("pool/cinder/v1"), None);
        assert_eq!(split_snapshot_path("pool/cinder/v1@"), None);
    }

    #[test]
    fn test_to_volume_id_ignores_foreign_datasets() {
        assert_eq!(to_volume_id("pool/cinder", "pool/cinder"), None);
        assert_eq!(to_volume_id("pool/cinder", "pool/other/v1"), None);
        assert_eq!(to_volume_id("pool/cinder", "pool/cinder/a/b"), None);
        assert_eq!(to_volume_id("pool/cinder", "pool/cinder/v1@s"), None);
    }

    #[test]
    fn test_base_dataset_validation() {
        assert!(validate_base_dataset("pool").is_ok());
        assert!(validate_base_dataset("pool/cinder/").is_ok());
        assert!(validate_base_dataset("").is_err());
        assert!(validate_base_dataset("/pool/cinder").is_err());
        assert!(validate_base_dataset("pool//cinder").is_err());
        assert!(validate_base_dataset("pool/ci nder").is_err());
    }

    #[test]
    fn test_device_and_target_names() {
        assert_eq!(device_path("pool/cinder/v1"), "/dev/zvol/pool/cinder/v1");
        assert_eq!(pool_name("pool/cinder/v1"), "pool");
        assert_eq!(
            target_name("iqn.2010-10.org.openstack:", "v1"),
            "iqn.2010-10.org.openstack:v1"
        );
    }
}
