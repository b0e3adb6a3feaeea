use crate::command::{CommandOutput, CommandRunner, Program};
use crate::error::{DriverError, Result};
use crate::parser::{OutputParser, PropertyMap, Record};
use std::sync::Arc;
use tracing::{info, warn};
use zolvol_core::naming::to_volume_id;
use zolvol_core::{DriverConfig, ErrorPatterns, VolumeInfo};

/// How the appliance answered a mutating command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Applied,
    /// The target already exists
    AlreadyExists,
    /// The dataset operated on does not exist
    Missing,
}

impl std::fmt::Display for Mutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mutation::Applied => "applied",
            Mutation::AlreadyExists => "already exists",
            Mutation::Missing => "does not exist",
        };
        write!(f, "{}", s)
    }
}

const VOLUME_COLUMNS: [&str; 5] = ["name", "volsize", "used", "refreservation", "origin"];

/// Typed wrapper around the `zfs` command
///
/// Query methods interpret output; mutating methods report a `Mutation` so
/// callers can decide which failures are idempotent no-ops.
pub struct ZfsClient {
    runner: Arc<CommandRunner>,
    parser: Arc<dyn OutputParser>,
    config: Arc<DriverConfig>,
}

impl ZfsClient {
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

    pub fn patterns(&self) -> &ErrorPatterns {
        &self.config.error_patterns
    }

    pub fn runner(&self) -> &CommandRunner {
        &self.runner
    }

    /// Flags selecting the configured output shape, plus exact byte values
    fn scripted_flags(&self) -> Vec<&'static str> {
        let mut flags = Vec::new();
        if !self.config.list_format.header {
            flags.push("-H");
        }
        flags.push("-p");
        flags
    }

    async fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        self.runner.run(Program::Zfs, args).await
    }

    fn failed(&self, dataset: &str, args: &[&str], output: &CommandOutput) -> DriverError {
        DriverError::command_failed(
            dataset,
            self.runner.render(Program::Zfs, args),
            output.exit_code,
            &output.stderr,
        )
    }

    /// Whether a dataset or snapshot exists, asked fresh from the appliance
    pub async fn exists(&self, dataset: &str) -> Result<bool> {
        let mut args = vec!["list"];
        args.extend(self.scripted_flags());
        args.extend(["-t", "all", "-o", "name", dataset]);

        let output = self.run(&args).await?;
        if !output.success() {
            if self.patterns().is_does_not_exist(&output.stderr) {
                return Ok(false);
            }
            return Err(self.failed(dataset, &args, &output));
        }

        let records = self.parser.parse_list(&output.stdout, &["name"])?;
        match records.as_slice() {
            [record] if record.value("name")? == dataset => Ok(true),
            _ => Err(DriverError::parse_error(
                format!("zfs list of '{}'", dataset),
                format!("unexpected output: '{}'", output.stdout.trim()),
            )),
        }
    }

    /// Read properties of an existing dataset
    ///
    /// Fails with `NotFound` if the dataset is missing and with `ParseError`
    /// if any requested property is not reported.
    pub async fn get_properties(&self, dataset: &str, properties: &[&str]) -> Result<PropertyMap> {
        let joined = properties.join(",");
        let mut args = vec!["get"];
        args.extend(self.scripted_flags());
        args.extend(["-o", "property,value", joined.as_str(), dataset]);

        let output = self.run(&args).await?;
        if !output.success() {
            if self.patterns().is_does_not_exist(&output.stderr) {
                return Err(DriverError::not_found(dataset));
            }
            return Err(self.failed(dataset, &args, &output));
        }

        let props = self.parser.parse_properties(&output.stdout)?;
        for name in properties {
            if !props.contains_key(*name) {
                return Err(DriverError::parse_error(
                    format!("zfs get of '{}'", dataset),
                    format!("property '{}' missing from output", name),
                ));
            }
        }
        Ok(props)
    }

    /// Read a single property as a byte count (`None` for `none`/`-`)
    pub async fn get_bytes(&self, dataset: &str, property: &str) -> Result<Option<u64>> {
        let props = self.get_properties(dataset, &[property]).await?;
        props[property].to_bytes(&format!("{} of '{}'", property, dataset))
    }

    /// Read a single property as text (`None` for `none`/`-`)
    pub async fn get_value(&self, dataset: &str, property: &str) -> Result<Option<String>> {
        let props = self.get_properties(dataset, &[property]).await?;
        Ok(props[property].as_value().map(str::to_string))
    }

    fn volume_from_record(&self, record: &Record) -> Result<VolumeInfo> {
        let dataset = record.value("name")?.to_string();
        let id = to_volume_id(&self.config.base_dataset, &dataset).ok_or_else(|| {
            DriverError::parse_error(
                "zfs list",
                format!(
                    "dataset '{}' is not a volume under '{}'",
                    dataset, self.config.base_dataset
                ),
            )
        })?;
        Ok(VolumeInfo {
            id,
            size_bytes: record.bytes("volsize")?.unwrap_or(0),
            used_bytes: record.bytes("used")?.unwrap_or(0),
            refreservation: record.bytes("refreservation")?.filter(|r| *r > 0),
            origin: record
                .get("origin")
                .and_then(|f| f.as_value())
                .map(str::to_string),
            dataset,
        })
    }

    /// Describe one volume, or `None` if it does not exist
    pub async fn volume_info(&self, dataset: &str) -> Result<Option<VolumeInfo>> {
        let columns = VOLUME_COLUMNS.join(",");
        let mut args = vec!["list"];
        args.extend(self.scripted_flags());
        args.extend(["-t", "volume", "-o", columns.as_str(), dataset]);

        let output = self.run(&args).await?;
        if !output.success() {
            if self.patterns().is_does_not_exist(&output.stderr) {
                return Ok(None);
            }
            return Err(self.failed(dataset, &args, &output));
        }

        let records = self.parser.parse_list(&output.stdout, &VOLUME_COLUMNS)?;
        match records.as_slice() {
            [record] => self.volume_from_record(record).map(Some),
            _ => Err(DriverError::parse_error(
                format!("zfs list of '{}'", dataset),
                format!("expected one row, got {}", records.len()),
            )),
        }
    }

    /// Every volume directly under the base dataset
    pub async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        let base = self.config.base_dataset.trim_end_matches('/');
        let columns = VOLUME_COLUMNS.join(",");
        let mut args = vec!["list"];
        args.extend(self.scripted_flags());
        args.extend(["-r", "-d", "1", "-t", "volume", "-o", columns.as_str(), base]);

        let output = self.run(&args).await?;
        if !output.success() {
            return Err(self.failed(base, &args, &output));
        }

        self.parser
            .parse_list(&output.stdout, &VOLUME_COLUMNS)?
            .iter()
            .filter(|r| {
                r.value("name")
                    .map(|name| to_volume_id(base, name).is_some())
                    .unwrap_or(false)
            })
            .map(|r| self.volume_from_record(r))
            .collect()
    }

    /// Clones that depend on any snapshot of a dataset
    pub async fn dependent_clones(&self, dataset: &str) -> Result<Vec<String>> {
        let mut args = vec!["list"];
        args.extend(self.scripted_flags());
        args.extend(["-r", "-d", "1", "-t", "snapshot", "-o", "name,clones", dataset]);

        let output = self.run(&args).await?;
        if !output.success() {
            if self.patterns().is_does_not_exist(&output.stderr) {
                return Ok(Vec::new());
            }
            return Err(self.failed(dataset, &args, &output));
        }

        let records = self.parser.parse_list(&output.stdout, &["name", "clones"])?;
        Ok(records
            .iter()
            .filter_map(|r| r.get("clones").and_then(|f| f.as_value()))
            .flat_map(|clones| clones.split(','))
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Run a mutating command and classify its result
    ///
    /// Failures matching the configured "already exists" or "does not
    /// exist" patterns are reported as `Mutation` values; any other non-zero
    /// exit is a `CommandFailed` error.
    async fn mutate(&self, dataset: &str, args: &[&str]) -> Result<Mutation> {
        let command = self.runner.render(Program::Zfs, args);
        let output = self.run(args).await?;
        let outcome = if output.success() {
            Mutation::Applied
        } else if self.patterns().is_already_exists(&output.stderr) {
            Mutation::AlreadyExists
        } else if self.patterns().is_does_not_exist(&output.stderr) {
            Mutation::Missing
        } else {
            warn!(
                "'{}' failed with exit code {}: {}",
                command,
                output.exit_code,
                output.stderr.trim()
            );
            return Err(self.failed(dataset, args, &output));
        };
        info!("'{}' on {}: {}", command, self.runner.target(), outcome);
        Ok(outcome)
    }

    /// `zfs create [-s] -V <size> -b <blocksize> -o ... <dataset>`
    pub async fn create_volume(
        &self,
        dataset: &str,
        size_bytes: u64,
        sparse: bool,
        volblocksize: u64,
        options: &[String],
    ) -> Result<Mutation> {
        let size = size_bytes.to_string();
        let blocksize = volblocksize.to_string();
        let mut args = vec!["create"];
        if sparse {
            args.push("-s");
        }
        args.extend(["-V", size.as_str(), "-b", blocksize.as_str()]);
        for opt in options {
            args.push("-o");
            args.push(opt);
        }
        args.push(dataset);
        self.mutate(dataset, &args).await
    }

    /// `zfs destroy [-r] <dataset>`
    pub async fn destroy(&self, dataset: &str, recursive: bool) -> Result<Mutation> {
        let mut args = vec!["destroy"];
        if recursive {
            args.push("-r");
        }
        args.push(dataset);
        self.mutate(dataset, &args).await
    }

    /// `zfs snapshot <dataset@snap>`
    pub async fn snapshot(&self, snapshot_path: &str) -> Result<Mutation> {
        self.mutate(snapshot_path, &["snapshot", snapshot_path]).await
    }

    /// `zfs clone <snapshot> <dataset>`
    pub async fn clone_snapshot(&self, snapshot_path: &str, dataset: &str) -> Result<Mutation> {
        self.mutate(dataset, &["clone", snapshot_path, dataset]).await
    }

    /// `zfs promote <dataset>`
    pub async fn promote(&self, dataset: &str) -> Result<Mutation> {
        self.mutate(dataset, &["promote", dataset]).await
    }

    /// `zfs set <property>=<value> <dataset>`
    pub async fn set_property(&self, dataset: &str, property: &str, value: &str) -> Result<()> {
        let assignment = format!("{}={}", property, value);
        match self.mutate(dataset, &["set", assignment.as_str(), dataset]).await? {
            Mutation::Applied => Ok(()),
            Mutation::Missing => Err(DriverError::not_found(dataset)),
            Mutation::AlreadyExists => Err(DriverError::internal_error(format!(
                "zfs set {} on '{}' reported an already-exists error",
                assignment, dataset
            ))),
        }
    }
}
