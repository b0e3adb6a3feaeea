use crate::command::{CommandRunner, Program};
use crate::error::Result;
use crate::parser::{OutputParser, TargetRecord};
use std::sync::Arc;
use zolvol_core::ExportInfo;

const SHOW_TARGETS: [&str; 6] = ["--lld", "iscsi", "--mode", "target", "--op", "show"];

/// Read-only view of the iSCSI target daemon
///
/// Targets are created and removed by the appliance when the share property
/// changes; the driver only ever asks `tgtadm` what exists.
pub struct TargetAdmin {
    runner: Arc<CommandRunner>,
    parser: Arc<dyn OutputParser>,
}

impl TargetAdmin {
    pub fn new(runner: Arc<CommandRunner>, parser: Arc<dyn OutputParser>) -> Self {
        Self { runner, parser }
    }

    /// All targets currently known to tgtd
    pub async fn show_targets(&self) -> Result<Vec<TargetRecord>> {
        let output = self
            .runner
            .run_checked(Program::Tgtadm, &SHOW_TARGETS, "tgtd")
            .await?;
        self.parser.parse_targets(&output.stdout)
    }

    /// The target and LUN exporting a block device, if any
    pub async fn find_export(&self, backing_store: &str) -> Result<Option<ExportInfo>> {
        let targets = self.show_targets().await?;
        Ok(targets.iter().find_map(|target| {
            target.lun_for(backing_store).map(|lun| ExportInfo {
                target_iqn: target.iqn.clone(),
                tid: target.tid,
                lun,
                backing_store: backing_store.to_string(),
            })
        }))
    }
}
