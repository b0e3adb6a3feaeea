use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// Declares a ZFS property whose value must come from a fixed set of strings
macro_rules! property_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $value)]
                $variant,
            )+
        }

        impl $name {
            /// Get the value as passed to `zfs create -o`
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $value,)+
                }
            }

            /// Parse from the string form used by `zfs get`
            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($value => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }
    };
}

property_enum!(
    /// Thin volumes allocate on demand, thick volumes reserve their full size
    Provisioning {
        Thin => "thin",
        Thick => "thick",
    }
);

property_enum!(
    /// `compression` property
    Compression {
        On => "on",
        Off => "off",
        Lzjb => "lzjb",
        Gzip => "gzip",
        Gzip1 => "gzip-1",
        Gzip2 => "gzip-2",
        Gzip3 => "gzip-3",
        Gzip4 => "gzip-4",
        Gzip5 => "gzip-5",
        Gzip6 => "gzip-6",
        Gzip7 => "gzip-7",
        Gzip8 => "gzip-8",
        Gzip9 => "gzip-9",
        Zle => "zle",
        Lz4 => "lz4",
    }
);

property_enum!(
    /// `dedup` property
    Dedup {
        On => "on",
        Off => "off",
        Verify => "verify",
        Sha256 => "sha256",
        Sha256Verify => "sha256,verify",
    }
);

property_enum!(
    /// `checksum` property
    Checksum {
        On => "on",
        Off => "off",
        Fletcher2 => "fletcher2",
        Fletcher4 => "fletcher4",
        Sha256 => "sha256",
    }
);

property_enum!(
    /// `sync` property
    SyncMode {
        Standard => "standard",
        Always => "always",
        Disabled => "disabled",
    }
);

property_enum!(
    /// `encryption` property
    Encryption {
        Off => "off",
        On => "on",
        Aes128Ccm => "aes-128-ccm",
        Aes192Ccm => "aes-192-ccm",
        Aes256Ccm => "aes-256-ccm",
        Aes128Gcm => "aes-128-gcm",
        Aes192Gcm => "aes-192-gcm",
        Aes256Gcm => "aes-256-gcm",
    }
);

/// Smallest and largest `volblocksize` accepted by ZFS
pub const MIN_VOLBLOCKSIZE: u64 = 512;
pub const MAX_VOLBLOCKSIZE: u64 = 128 * 1024;

/// Dataset properties applied when a zvol is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetProperties {
    pub compression: Compression,
    pub dedup: Dedup,
    pub checksum: Checksum,
    /// Number of data copies (1-3)
    pub copies: u8,
    pub sync: SyncMode,
    /// Block size in bytes; a power of two between 512 and 128K
    pub volblocksize: u64,
    /// Encryption suite; `None` inherits from the parent dataset
    pub encryption: Option<Encryption>,
}

impl Default for DatasetProperties {
    fn default() -> Self {
        Self {
            compression: Compression::On,
            dedup: Dedup::Off,
            checksum: Checksum::On,
            copies: 1,
            sync: SyncMode::Standard,
            volblocksize: 8192,
            encryption: None,
        }
    }
}

impl DatasetProperties {
    /// Render as `property=value` pairs for `zfs create -o`.
    ///
    /// `volblocksize` is excluded; it is passed with `-b`.
    pub fn to_create_options(&self) -> Vec<String> {
        let mut opts = vec![
            format!("compression={}", self.compression),
            format!("dedup={}", self.dedup),
            format!("checksum={}", self.checksum),
            format!("copies={}", self.copies),
            format!("sync={}", self.sync),
        ];
        if let Some(encryption) = self.encryption {
            opts.push(format!("encryption={}", encryption));
        }
        opts
    }

    /// Check the values that are not enumerated
    pub fn validate(&self) -> Result<()> {
        if !(1..=3).contains(&self.copies) {
            return Err(CoreError::invalid_config(
                format!("copies={} is out of range", self.copies),
                "copies must be 1, 2 or 3",
            ));
        }
        if !self.volblocksize.is_power_of_two()
            || !(MIN_VOLBLOCKSIZE..=MAX_VOLBLOCKSIZE).contains(&self.volblocksize)
        {
            return Err(CoreError::invalid_config(
                format!("volblocksize={} is not supported", self.volblocksize),
                "volblocksize must be a power of two between 512 and 131072 bytes",
            ));
        }
        Ok(())
    }
}

/// A block volume as requested by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Orchestrator-assigned identifier
    pub id: String,
    /// Size in bytes
    pub size_bytes: u64,
    pub provisioning: Provisioning,
    pub properties: DatasetProperties,
}

impl Volume {
    pub fn new(
        id: impl Into<String>,
        size_bytes: u64,
        provisioning: Provisioning,
        properties: DatasetProperties,
    ) -> Self {
        Self {
            id: id.into(),
            size_bytes,
            provisioning,
            properties,
        }
    }
}

/// A point-in-time snapshot of a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    /// Identifier of the volume the snapshot was taken from
    pub volume_id: String,
}

impl Snapshot {
    pub fn new(id: impl Into<String>, volume_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            volume_id: volume_id.into(),
        }
    }
}

/// Information about an existing volume, as reported by the appliance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub id: String,
    pub dataset: String,
    pub size_bytes: u64,
    pub used_bytes: u64,
    /// Reserved space; `None` for sparse volumes
    pub refreservation: Option<u64>,
    /// Origin snapshot for clones that have not been promoted
    pub origin: Option<String>,
}

impl VolumeInfo {
    /// Provisioning mode inferred from the reservation
    pub fn provisioning(&self) -> Provisioning {
        match self.refreservation {
            Some(r) if r > 0 => Provisioning::Thick,
            _ => Provisioning::Thin,
        }
    }
}

/// Result of cloning a snapshot into a new volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneOutcome {
    pub volume: VolumeInfo,
    /// Whether `zfs promote` succeeded
    pub promoted: bool,
    /// Set when the clone is usable but promotion failed
    pub warning: Option<String>,
}

/// An active iSCSI export of a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportInfo {
    pub target_iqn: String,
    /// Target id assigned by the target daemon
    pub tid: u32,
    pub lun: u32,
    /// Block device backing the LUN (e.g., /dev/zvol/pool/cinder/v1)
    pub backing_store: String,
}

impl ExportInfo {
    /// Render the orchestrator's provider location: `ip:port,tid iqn lun`
    pub fn provider_location(&self, portal_address: &str, portal_port: u16) -> String {
        format!(
            "{}:{},{} {} {}",
            portal_address, portal_port, self.tid, self.target_iqn, self.lun
        )
    }
}

/// Export state derived from the share property and the target daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportState {
    /// Share property off and no target
    NotExported,
    /// Share property on but no discoverable target
    PropertyOnly,
    /// Target present but share property off
    TargetOnly(ExportInfo),
    /// Share property on and target discoverable
    Exported(ExportInfo),
}

impl ExportState {
    /// Whether anything needs tearing down
    pub fn is_partial_or_active(&self) -> bool {
        !matches!(self, ExportState::NotExported)
    }
}

impl std::fmt::Display for ExportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExportState::NotExported => "not-exported",
            ExportState::PropertyOnly => "property-only",
            ExportState::TargetOnly(_) => "target-only",
            ExportState::Exported(_) => "exported",
        };
        write!(f, "{}", s)
    }
}

/// Pool capacity as advertised to the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool: String,
    /// Pool size from `zpool list`
    pub total_bytes: u64,
    /// Written data only, from `zpool list`
    pub allocated_bytes: u64,
    /// Space charged to datasets, reservations included
    pub used_bytes: u64,
    /// Space still available to new datasets and reservations
    pub free_bytes: u64,
    /// Total capacity after applying the over-subscription ratio
    pub advertised_total_bytes: u64,
    /// Free capacity after applying the over-subscription ratio
    pub advertised_free_bytes: u64,
    pub over_subscription_ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_enum_round_trip_strings() {
        assert_eq!(Compression::parse("gzip-7"), Some(Compression::Gzip7));
        assert_eq!(Compression::Lz4.as_str(), "lz4");
        assert_eq!(Dedup::parse("sha256,verify"), Some(Dedup::Sha256Verify));
        assert_eq!(SyncMode::parse("bogus"), None);
        assert_eq!(Encryption::Aes256Gcm.to_string(), "aes-256-gcm");
    }

    #[test]
    fn test_default_create_options() {
        let opts = DatasetProperties::default().to_create_options();
        assert_eq!(
            opts,
            vec![
                "compression=on",
                "dedup=off",
                "checksum=on",
                "copies=1",
                "sync=standard",
            ]
        );
    }

    #[test]
    fn test_create_options_include_encryption() {
        let props = DatasetProperties {
            encryption: Some(Encryption::Aes256Gcm),
            ..Default::default()
        };
        assert!(props
            .to_create_options()
            .contains(&"encryption=aes-256-gcm".to_string()));
    }

    #[test]
    fn test_provider_location() {
        let export = ExportInfo {
            target_iqn: "iqn.2010-10.org.openstack:v1".to_string(),
            tid: 3,
            lun: 1,
            backing_store: "/dev/zvol/pool/cinder/v1".to_string(),
        };
        assert_eq!(
            export.provider_location("10.0.0.5", 3260),
            "10.0.0.5:3260,3 iqn.2010-10.org.openstack:v1 1"
        );
    }

    #[test]
    fn test_volume_info_provisioning() {
        let mut info = VolumeInfo {
            id: "v1".to_string(),
            dataset: "pool/cinder/v1".to_string(),
            size_bytes: 1 << 30,
            used_bytes: 0,
            refreservation: None,
            origin: None,
        };
        assert_eq!(info.provisioning(), Provisioning::Thin);
        info.refreservation = Some(1 << 30);
        assert_eq!(info.provisioning(), Provisioning::Thick);
    }

    #[test]
    fn test_export_state_partial() {
        assert!(!ExportState::NotExported.is_partial_or_active());
        assert!(ExportState::PropertyOnly.is_partial_or_active());
    }
}
