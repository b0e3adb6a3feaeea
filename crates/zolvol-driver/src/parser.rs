//! Adapters from appliance tool output to typed records.
//!
//! The text printed by `zfs`, `zpool` and `tgtadm` is the only protocol the
//! appliance speaks, so everything that depends on its exact shape lives
//! behind the `OutputParser` trait.

use crate::error::{DriverError, Result};
use std::collections::BTreeMap;
use zolvol_core::{parse_size, Delimiter, ListFormat};

/// A single cell of tool output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    /// `-` or `none`: the property has no value
    Absent,
    Value(String),
}

impl Field {
    fn from_raw(raw: &str) -> Self {
        match raw {
            "-" | "none" => Field::Absent,
            other => Field::Value(other.to_string()),
        }
    }

    pub fn as_value(&self) -> Option<&str> {
        match self {
            Field::Absent => None,
            Field::Value(v) => Some(v),
        }
    }

    /// Interpret as a byte count; `Absent` maps to `None`
    pub fn to_bytes(&self, context: &str) -> Result<Option<u64>> {
        match self {
            Field::Absent => Ok(None),
            Field::Value(v) => parse_size(v)
                .map(Some)
                .map_err(|e| DriverError::parse_error(context, e)),
        }
    }
}

/// Property name to value, from `zfs get -o property,value`
pub type PropertyMap = BTreeMap<String, Field>;

/// One row of list output, addressable by column name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    fields: Vec<(String, Field)>,
}

impl Record {
    pub fn get(&self, column: &str) -> Option<&Field> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, field)| field)
    }

    /// Value of a column that must be present
    pub fn value(&self, column: &str) -> Result<&str> {
        self.get(column)
            .and_then(Field::as_value)
            .ok_or_else(|| {
                DriverError::parse_error("list output", format!("column '{}' has no value", column))
            })
    }

    /// Byte count of a column; `None` when the value is absent
    pub fn bytes(&self, column: &str) -> Result<Option<u64>> {
        match self.get(column) {
            Some(field) => field.to_bytes(&format!("column '{}'", column)),
            None => Err(DriverError::parse_error(
                "list output",
                format!("no column named '{}'", column),
            )),
        }
    }
}

/// A LUN of an iSCSI target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LunRecord {
    pub lun: u32,
    pub backing_store: Option<String>,
}

/// A target as reported by `tgtadm --op show`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRecord {
    pub tid: u32,
    pub iqn: String,
    pub luns: Vec<LunRecord>,
}

impl TargetRecord {
    /// LUN backed by the given device, if any
    pub fn lun_for(&self, backing_store: &str) -> Option<u32> {
        self.luns
            .iter()
            .find(|l| l.backing_store.as_deref() == Some(backing_store))
            .map(|l| l.lun)
    }
}

/// Trait for versioned tool-output adapters
pub trait OutputParser: Send + Sync {
    /// Identifier of the output format this parser understands
    fn version(&self) -> &'static str;

    /// Parse two-column `property value` output
    fn parse_properties(&self, raw: &str) -> Result<PropertyMap>;

    /// Parse list output with the given columns, in order
    fn parse_list(&self, raw: &str, columns: &[&str]) -> Result<Vec<Record>>;

    /// Parse `tgtadm --lld iscsi --mode target --op show` output
    fn parse_targets(&self, raw: &str) -> Result<Vec<TargetRecord>>;
}

/// Parser for ZFS-on-Linux 0.6+ and tgt 1.0 output
pub struct ZfsOutputParserV1 {
    format: ListFormat,
}

impl ZfsOutputParserV1 {
    pub fn new(format: ListFormat) -> Self {
        Self { format }
    }

    /// Non-empty data lines, header skipped, trailing whitespace removed
    fn data_lines<'a>(&self, raw: &'a str) -> impl Iterator<Item = &'a str> {
        raw.lines()
            .map(str::trim_end)
            .filter(|l| !l.trim().is_empty())
            .skip(usize::from(self.format.header))
    }

    fn split<'a>(&self, line: &'a str) -> Vec<&'a str> {
        match self.format.delimiter {
            Delimiter::Tab => line.split('\t').map(str::trim).collect(),
            Delimiter::Whitespace => line.split_whitespace().collect(),
        }
    }
}

impl OutputParser for ZfsOutputParserV1 {
    fn version(&self) -> &'static str {
        "zfs-v1"
    }

    fn parse_properties(&self, raw: &str) -> Result<PropertyMap> {
        let mut props = PropertyMap::new();
        for line in self.data_lines(raw) {
            let (name, value) = match self.format.delimiter {
                Delimiter::Tab => {
                    let parts: Vec<&str> = line.split('\t').collect();
                    if parts.len() != 2 {
                        return Err(DriverError::parse_error(
                            "property output",
                            format!(
                                "expected 2 tab-delimited fields, got {}. Line: '{}'",
                                parts.len(),
                                line
                            ),
                        ));
                    }
                    (parts[0].trim(), parts[1].trim())
                }
                Delimiter::Whitespace => {
                    let line = line.trim_start();
                    let (name, value) = line.split_once(char::is_whitespace).ok_or_else(|| {
                        DriverError::parse_error(
                            "property output",
                            format!("expected property and value. Line: '{}'", line),
                        )
                    })?;
                    (name, value.trim())
                }
            };
            if name.is_empty() || value.is_empty() {
                return Err(DriverError::parse_error(
                    "property output",
                    format!("empty property name or value. Line: '{}'", line),
                ));
            }
            if props
                .insert(name.to_string(), Field::from_raw(value))
                .is_some()
            {
                return Err(DriverError::parse_error(
                    "property output",
                    format!("property '{}' reported twice", name),
                ));
            }
        }
        Ok(props)
    }

    fn parse_list(&self, raw: &str, columns: &[&str]) -> Result<Vec<Record>> {
        self.data_lines(raw)
            .map(|line| {
                let parts = self.split(line);
                if parts.len() != columns.len() {
                    return Err(DriverError::parse_error(
                        "list output",
                        format!(
                            "expected {} columns ({}), got {}. Line: '{}'",
                            columns.len(),
                            columns.join(","),
                            parts.len(),
                            line
                        ),
                    ));
                }
                Ok(Record {
                    fields: columns
                        .iter()
                        .zip(parts)
                        .map(|(name, raw)| (name.to_string(), Field::from_raw(raw)))
                        .collect(),
                })
            })
            .collect()
    }

    fn parse_targets(&self, raw: &str) -> Result<Vec<TargetRecord>> {
        let mut targets: Vec<TargetRecord> = Vec::new();

        for line in raw.lines() {
            if let Some(header) = line.strip_prefix("Target ") {
                // Target 1: iqn.2010-10.org.openstack:volume-1
                let (tid, iqn) = header.split_once(':').ok_or_else(|| {
                    DriverError::parse_error(
                        "tgtadm output",
                        format!("malformed target header: '{}'", line),
                    )
                })?;
                let tid = tid.trim().parse::<u32>().map_err(|e| {
                    DriverError::parse_error(
                        "tgtadm output",
                        format!("invalid target id in '{}': {}", line, e),
                    )
                })?;
                let iqn = iqn.trim();
                if iqn.is_empty() {
                    return Err(DriverError::parse_error(
                        "tgtadm output",
                        format!("target {} has no name", tid),
                    ));
                }
                targets.push(TargetRecord {
                    tid,
                    iqn: iqn.to_string(),
                    luns: Vec::new(),
                });
                continue;
            }

            let trimmed = line.trim();
            if let Some(lun) = trimmed.strip_prefix("LUN:") {
                let lun = lun.trim().parse::<u32>().map_err(|e| {
                    DriverError::parse_error(
                        "tgtadm output",
                        format!("invalid LUN in '{}': {}", trimmed, e),
                    )
                })?;
                let target = targets.last_mut().ok_or_else(|| {
                    DriverError::parse_error("tgtadm output", "LUN listed before any target")
                })?;
                target.luns.push(LunRecord {
                    lun,
                    backing_store: None,
                });
            } else if let Some(path) = trimmed.strip_prefix("Backing store path:") {
                let path = path.trim();
                if let Some(lun) = targets.last_mut().and_then(|t| t.luns.last_mut()) {
                    if !path.is_empty() && path != "None" {
                        lun.backing_store = Some(path.to_string());
                    }
                }
            }
        }

        Ok(targets)
    }
}
