// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

//! Zolvol Driver - ZFS-on-Linux volume lifecycle and iSCSI export
//!
//! Turns volume operations into `zfs`, `zpool` and `tgtadm` commands run
//! locally or over ssh, interprets their text output, and verifies every
//! change against a fresh query of the appliance.

pub mod capacity;
pub mod command;
pub mod driver;
pub mod error;
pub mod export;
pub mod lifecycle;
pub mod mock;
pub mod parser;
pub mod tgt;
pub mod traits;
pub mod transport;
pub mod zfs;

// Re-export primary types
pub use capacity::CapacityReporter;
pub use command::{CommandOutput, CommandRunner, Program};
pub use driver::ZfsVolumeDriver;
pub use error::{DriverError, Result};
pub use export::ExportManager;
pub use lifecycle::VolumeManager;
pub use mock::{MockAppliance, MockFaults};
pub use parser::{OutputParser, ZfsOutputParserV1};
pub use traits::VolumeDriver;
pub use transport::{LocalTransport, SshTransport, Transport, TransportFailure};
