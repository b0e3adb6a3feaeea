use crate::command::CommandOutput;
use crate::transport::{Transport, TransportFailure};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use zolvol_core::naming::{device_path, pool_name, split_snapshot_path, target_name};
use zolvol_core::parse_size;

/// Options that take a value in the zfs/zpool command lines the driver issues
const VALUE_FLAGS: [&str; 5] = ["-d", "-t", "-o", "-V", "-b"];

/// Failures the mock appliance can be told to produce
#[derive(Debug, Clone, Default)]
pub struct MockFaults {
    /// Setting the share property never yields a target
    pub targets_never_appear: bool,
    /// Unsetting the share property leaves the target in place
    pub targets_linger: bool,
    /// `zfs promote` fails
    pub promote_fails: bool,
    /// Number of upcoming calls that fail at the transport level
    pub transport_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Filesystem,
    Volume,
    Snapshot,
}

impl Kind {
    fn as_str(&self) -> &'static str {
        match self {
            Kind::Filesystem => "filesystem",
            Kind::Volume => "volume",
            Kind::Snapshot => "snapshot",
        }
    }
}

#[derive(Debug, Clone)]
struct MockDataset {
    kind: Kind,
    volsize: u64,
    volblocksize: u64,
    refreservation: Option<u64>,
    origin: Option<String>,
    /// Bytes actually written to the volume
    written: u64,
    properties: BTreeMap<String, String>,
    /// Creation order, used to decide which snapshots a promote moves
    txg: u64,
}

impl MockDataset {
    fn filesystem(txg: u64) -> Self {
        Self {
            kind: Kind::Filesystem,
            volsize: 0,
            volblocksize: 0,
            refreservation: None,
            origin: None,
            written: 0,
            properties: BTreeMap::new(),
            txg,
        }
    }

    /// Space charged to this dataset alone: its reservation or its data,
    /// whichever is larger
    fn charged(&self) -> u64 {
        self.refreservation.unwrap_or(0).max(self.written)
    }
}

#[derive(Debug, Clone)]
struct MockTarget {
    iqn: String,
    backing_store: String,
}

struct MockState {
    pool: String,
    pool_size: u64,
    share_property: String,
    target_prefix: String,
    datasets: BTreeMap<String, MockDataset>,
    targets: BTreeMap<u32, MockTarget>,
    next_tid: u32,
    txg: u64,
    faults: MockFaults,
    history: Vec<Vec<String>>,
}

/// Parsed command line: boolean flags, valued options and positionals
struct Args {
    flags: HashSet<String>,
    options: Vec<(String, String)>,
    positional: Vec<String>,
}

impl Args {
    fn parse(args: &[String]) -> Self {
        let mut parsed = Args {
            flags: HashSet::new(),
            options: Vec::new(),
            positional: Vec::new(),
        };
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if VALUE_FLAGS.contains(&arg.as_str()) {
                let value = iter.next().cloned().unwrap_or_default();
                parsed.options.push((arg.clone(), value));
            } else if arg.starts_with('-') && arg.len() > 1 {
                parsed.flags.insert(arg.clone());
            } else {
                parsed.positional.push(arg.clone());
            }
        }
        parsed
    }

    fn flag(&self, name: &str) -> bool {
        self.flags.contains(name)
    }

    fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn all(&self, name: &str) -> Vec<&str> {
        self.options
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

fn ok(stdout: String) -> CommandOutput {
    CommandOutput {
        stdout,
        stderr: String::new(),
        exit_code: 0,
    }
}

fn fail(exit_code: i32, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: stderr.into(),
        exit_code,
    }
}

fn missing(name: &str) -> CommandOutput {
    fail(1, format!("cannot open '{}': dataset does not exist\n", name))
}

fn within(name: &str, root: &str) -> bool {
    name == root
        || name
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('@'))
}

/// Render rows tab-delimited, with an upper-case header unless `-H` was given
fn table(scripted: bool, columns: &[&str], rows: Vec<Vec<String>>) -> String {
    let mut out = String::new();
    if !scripted {
        let header: Vec<String> = columns.iter().map(|c| c.to_uppercase()).collect();
        out.push_str(&header.join("\t"));
        out.push('\n');
    }
    for row in rows {
        out.push_str(&row.join("\t"));
        out.push('\n');
    }
    out
}

impl MockState {
    fn dispatch(&mut self, argv: &[String]) -> CommandOutput {
        let Some((program, args)) = argv.split_first() else {
            return fail(127, "empty command line");
        };
        let program = program.rsplit('/').next().unwrap_or(program.as_str());
        let args = Args::parse(args);
        let subcommand = args.positional.first().cloned().unwrap_or_default();

        match (program, subcommand.as_str()) {
            ("zfs", "list") => self.zfs_list(&args),
            ("zfs", "get") => self.zfs_get(&args),
            ("zfs", "create") => self.zfs_create(&args),
            ("zfs", "destroy") => self.zfs_destroy(&args),
            ("zfs", "snapshot") => self.zfs_snapshot(&args),
            ("zfs", "clone") => self.zfs_clone(&args),
            ("zfs", "promote") => self.zfs_promote(&args),
            ("zfs", "set") => self.zfs_set(&args),
            ("zpool", "list") => self.zpool_list(&args),
            ("tgtadm", _) if args.positional.last().map(String::as_str) == Some("show") => {
                self.tgtadm_show()
            }
            (program, sub) => fail(2, format!("{}: unsupported command '{}'\n", program, sub)),
        }
    }

    fn next_txg(&mut self) -> u64 {
        self.txg += 1;
        self.txg
    }

    fn column(&self, name: &str, ds: &MockDataset, column: &str) -> String {
        let bytes_or_none = |v: Option<u64>| v.map_or("none".to_string(), |b| b.to_string());
        match column {
            "name" => name.to_string(),
            "type" => ds.kind.as_str().to_string(),
            "volsize" if ds.kind != Kind::Filesystem => ds.volsize.to_string(),
            "volblocksize" if ds.kind != Kind::Filesystem => ds.volblocksize.to_string(),
            "used" => self.used(name).to_string(),
            "refreservation" => bytes_or_none(ds.refreservation),
            "origin" => ds.origin.clone().unwrap_or_else(|| "-".to_string()),
            "clones" => {
                let clones: Vec<&str> = self
                    .datasets
                    .iter()
                    .filter(|(_, other)| other.origin.as_deref() == Some(name))
                    .map(|(clone, _)| clone.as_str())
                    .collect();
                if clones.is_empty() {
                    "-".to_string()
                } else {
                    clones.join(",")
                }
            }
            "available" | "avail" => self.available().to_string(),
            other if other == self.share_property => ds
                .properties
                .get(other)
                .cloned()
                .unwrap_or_else(|| "off".to_string()),
            other => ds
                .properties
                .get(other)
                .cloned()
                .unwrap_or_else(|| "-".to_string()),
        }
    }

    /// `zfs` used: everything charged to a dataset and its descendants
    fn used(&self, root: &str) -> u64 {
        self.datasets
            .iter()
            .filter(|(name, _)| within(name, root))
            .map(|(_, ds)| ds.charged())
            .sum()
    }

    /// `zfs` available: pool size less every reservation and written byte
    fn available(&self) -> u64 {
        let charged: u64 = self.datasets.values().map(MockDataset::charged).sum();
        self.pool_size.saturating_sub(charged)
    }

    /// `zpool` alloc: written data only, reservations are not allocations
    fn allocated(&self) -> u64 {
        self.datasets.values().map(|ds| ds.written).sum()
    }

    fn free(&self) -> u64 {
        self.pool_size.saturating_sub(self.allocated())
    }

    fn zfs_list(&self, args: &Args) -> CommandOutput {
        let Some(root) = args.positional.get(1) else {
            return fail(2, "missing dataset argument\n");
        };
        if !self.datasets.contains_key(root) {
            return missing(root);
        }
        let columns: Vec<&str> = args.option("-o").unwrap_or("name").split(',').collect();
        let kind = args.option("-t").unwrap_or("filesystem,volume");
        let depth = if args.flag("-r") {
            args.option("-d")
                .and_then(|d| d.parse::<usize>().ok())
                .unwrap_or(usize::MAX)
        } else {
            0
        };

        let rows: Vec<Vec<String>> = self
            .datasets
            .iter()
            .filter(|(name, ds)| {
                let in_scope = if *name == root {
                    true
                } else if let Some(rest) = name.strip_prefix(root.as_str()) {
                    match rest.strip_prefix('@') {
                        Some(_) => depth >= 1,
                        None => rest
                            .strip_prefix('/')
                            .map(|r| r.split('/').count() <= depth && !r.contains('@'))
                            .unwrap_or(false),
                    }
                } else {
                    false
                };
                in_scope && (kind == "all" || kind.split(',').any(|k| k == ds.kind.as_str()))
            })
            .map(|(name, ds)| {
                columns
                    .iter()
                    .map(|c| self.column(name, ds, c))
                    .collect::<Vec<String>>()
            })
            .collect();

        ok(table(args.flag("-H"), &columns, rows))
    }

    fn zfs_get(&self, args: &Args) -> CommandOutput {
        let (Some(properties), Some(name)) = (args.positional.get(1), args.positional.get(2)) else {
            return fail(2, "missing property list or dataset\n");
        };
        let Some(ds) = self.datasets.get(name) else {
            return missing(name);
        };
        let rows: Vec<Vec<String>> = properties
            .split(',')
            .map(|p| vec![p.to_string(), self.column(name, ds, p)])
            .collect();
        ok(table(args.flag("-H"), &["property", "value"], rows))
    }

    fn zfs_create(&mut self, args: &Args) -> CommandOutput {
        let Some(name) = args.positional.get(1) else {
            return fail(2, "missing dataset argument\n");
        };
        if self.datasets.contains_key(name) {
            return fail(1, format!("cannot create '{}': dataset already exists\n", name));
        }
        let parent = name.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
        if !self.datasets.contains_key(parent) {
            return fail(1, format!("cannot create '{}': parent does not exist\n", name));
        }
        let Some(volsize) = args.option("-V").and_then(|v| parse_size(v).ok()) else {
            return fail(2, "missing or invalid -V size\n");
        };

        let mut properties = BTreeMap::new();
        let mut refreservation = None;
        for assignment in args.all("-o") {
            let Some((key, value)) = assignment.split_once('=') else {
                return fail(2, format!("invalid property '{}'\n", assignment));
            };
            if key == "refreservation" {
                refreservation = parse_size(value).ok();
            } else {
                properties.insert(key.to_string(), value.to_string());
            }
        }
        if !args.flag("-s") && refreservation.is_none() {
            refreservation = Some(volsize);
        }
        if refreservation.unwrap_or(0) > self.available() {
            return fail(1, format!("cannot create '{}': out of space\n", name));
        }

        let txg = self.next_txg();
        self.datasets.insert(
            name.clone(),
            MockDataset {
                kind: Kind::Volume,
                volsize,
                volblocksize: args
                    .option("-b")
                    .and_then(|b| b.parse().ok())
                    .unwrap_or(8192),
                refreservation,
                origin: None,
                written: 0,
                properties,
                txg,
            },
        );
        ok(String::new())
    }

    /// Datasets whose origin is one of the given snapshots
    fn dependent_clones(&self, snapshots: &[String]) -> Vec<String> {
        self.datasets
            .iter()
            .filter(|(_, ds)| ds.origin.as_ref().is_some_and(|o| snapshots.contains(o)))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn zfs_destroy(&mut self, args: &Args) -> CommandOutput {
        let Some(name) = args.positional.get(1).cloned() else {
            return fail(2, "missing dataset argument\n");
        };
        if !self.datasets.contains_key(&name) {
            return match split_snapshot_path(&name) {
                Some((parent, _)) if self.datasets.contains_key(parent) => fail(
                    1,
                    "could not find any snapshots to destroy; check snapshot names.\n",
                ),
                _ => missing(&name),
            };
        }

        let children: Vec<String> = self
            .datasets
            .keys()
            .filter(|k| *k != &name && within(k, &name))
            .cloned()
            .collect();
        if !children.is_empty() && !args.flag("-r") {
            return fail(
                1,
                format!(
                    "cannot destroy '{}': volume has children\nuse '-r' to destroy the following datasets:\n{}\n",
                    name,
                    children.join("\n")
                ),
            );
        }

        let mut doomed = children;
        doomed.push(name.clone());
        let clones: Vec<String> = self
            .dependent_clones(&doomed)
            .into_iter()
            .filter(|c| !doomed.contains(c))
            .collect();
        if !clones.is_empty() {
            return fail(
                1,
                format!(
                    "cannot destroy '{}': filesystem has dependent clones\nuse '-R' to destroy the following datasets:\n{}\n",
                    name,
                    clones.join("\n")
                ),
            );
        }

        for dataset in &doomed {
            self.datasets.remove(dataset);
            let device = device_path(dataset);
            self.targets.retain(|_, t| t.backing_store != device);
        }
        ok(String::new())
    }

    fn zfs_snapshot(&mut self, args: &Args) -> CommandOutput {
        let Some(path) = args.positional.get(1) else {
            return fail(2, "missing snapshot argument\n");
        };
        let Some((dataset, _)) = split_snapshot_path(path) else {
            return fail(2, format!("invalid snapshot name '{}'\n", path));
        };
        let Some(parent) = self.datasets.get(dataset).cloned() else {
            return missing(dataset);
        };
        if self.datasets.contains_key(path) {
            return fail(
                1,
                format!("cannot create snapshot '{}': dataset already exists\n", path),
            );
        }
        let txg = self.next_txg();
        self.datasets.insert(
            path.clone(),
            MockDataset {
                kind: Kind::Snapshot,
                refreservation: None,
                origin: None,
                written: 0,
                txg,
                ..parent
            },
        );
        ok(String::new())
    }

    fn zfs_clone(&mut self, args: &Args) -> CommandOutput {
        let (Some(snapshot), Some(name)) = (args.positional.get(1), args.positional.get(2)) else {
            return fail(2, "missing snapshot or target\n");
        };
        let Some(source) = self.datasets.get(snapshot).cloned() else {
            return missing(snapshot);
        };
        if self.datasets.contains_key(name) {
            return fail(1, format!("cannot create '{}': dataset already exists\n", name));
        }
        let mut properties = source.properties;
        properties.remove(&self.share_property);
        let txg = self.next_txg();
        self.datasets.insert(
            name.clone(),
            MockDataset {
                kind: Kind::Volume,
                volsize: source.volsize,
                volblocksize: source.volblocksize,
                refreservation: None,
                origin: Some(snapshot.clone()),
                written: 0,
                properties,
                txg,
            },
        );
        ok(String::new())
    }

    /// Move the origin snapshot, and every older snapshot of the origin,
    /// from the origin dataset to the clone
    fn zfs_promote(&mut self, args: &Args) -> CommandOutput {
        let Some(name) = args.positional.get(1).cloned() else {
            return fail(2, "missing dataset argument\n");
        };
        let Some(clone) = self.datasets.get(&name) else {
            return missing(&name);
        };
        if self.faults.promote_fails {
            return fail(1, format!("cannot promote '{}': permission denied\n", name));
        }
        let Some(origin) = clone.origin.clone() else {
            return fail(1, format!("cannot promote '{}': not a cloned filesystem\n", name));
        };
        let Some((parent, _)) = split_snapshot_path(&origin) else {
            return fail(1, format!("cannot promote '{}': invalid origin\n", name));
        };
        let parent = parent.to_string();
        let cutoff = self.datasets.get(&origin).map(|s| s.txg).unwrap_or(0);

        let moved: Vec<String> = self
            .datasets
            .iter()
            .filter(|(k, ds)| {
                ds.kind == Kind::Snapshot
                    && split_snapshot_path(k).is_some_and(|(d, _)| d == parent)
                    && ds.txg <= cutoff
            })
            .map(|(k, _)| k.clone())
            .collect();

        let mut renames = Vec::new();
        for old in &moved {
            if let (Some((_, snap)), Some(ds)) = (split_snapshot_path(old), self.datasets.get(old)) {
                renames.push((old.clone(), format!("{}@{}", name, snap), ds.clone()));
            }
        }
        for (old, new, ds) in renames {
            self.datasets.remove(&old);
            self.datasets.insert(new.clone(), ds);
            for other in self.datasets.values_mut() {
                if other.origin.as_deref() == Some(old.as_str()) {
                    other.origin = Some(new.clone());
                }
            }
        }

        let new_origin = split_snapshot_path(&origin).map(|(_, snap)| format!("{}@{}", name, snap));
        if let Some(ds) = self.datasets.get_mut(&parent) {
            ds.origin = new_origin;
        }
        if let Some(ds) = self.datasets.get_mut(&name) {
            ds.origin = None;
        }
        ok(String::new())
    }

    fn zfs_set(&mut self, args: &Args) -> CommandOutput {
        let (Some(assignment), Some(name)) = (args.positional.get(1), args.positional.get(2)) else {
            return fail(2, "missing property or dataset\n");
        };
        let Some((key, value)) = assignment.split_once('=') else {
            return fail(2, format!("invalid property '{}'\n", assignment));
        };
        if !self.datasets.contains_key(name) {
            return missing(name);
        }
        let share_property = self.share_property.clone();

        match key {
            "volsize" | "refreservation" => {
                let parsed = if value == "none" {
                    None
                } else {
                    match parse_size(value) {
                        Ok(bytes) => Some(bytes),
                        Err(e) => return fail(2, format!("bad numeric value '{}': {}\n", value, e)),
                    }
                };
                if let Some(ds) = self.datasets.get_mut(name) {
                    if key == "volsize" {
                        ds.volsize = parsed.unwrap_or(ds.volsize);
                    } else {
                        ds.refreservation = parsed;
                    }
                }
            }
            k if k == share_property => {
                if let Some(ds) = self.datasets.get_mut(name) {
                    ds.properties.insert(key.to_string(), value.to_string());
                }
                let device = device_path(name);
                if value == "off" {
                    if !self.faults.targets_linger {
                        self.targets.retain(|_, t| t.backing_store != device);
                    }
                } else if !self.faults.targets_never_appear
                    && !self.targets.values().any(|t| t.backing_store == device)
                {
                    let volume_id = name.rsplit('/').next().unwrap_or(name.as_str());
                    let tid = self.next_tid;
                    self.next_tid += 1;
                    self.targets.insert(
                        tid,
                        MockTarget {
                            iqn: target_name(&self.target_prefix, volume_id),
                            backing_store: device,
                        },
                    );
                }
            }
            _ => {
                if let Some(ds) = self.datasets.get_mut(name) {
                    ds.properties.insert(key.to_string(), value.to_string());
                }
            }
        }
        ok(String::new())
    }

    fn zpool_list(&self, args: &Args) -> CommandOutput {
        let Some(pool) = args.positional.get(1) else {
            return fail(2, "missing pool argument\n");
        };
        if *pool != self.pool {
            return fail(1, format!("cannot open '{}': no such pool\n", pool));
        }
        let columns: Vec<&str> = args.option("-o").unwrap_or("name").split(',').collect();
        let row: Vec<String> = columns
            .iter()
            .map(|c| match *c {
                "name" => self.pool.clone(),
                "size" => self.pool_size.to_string(),
                "allocated" | "alloc" => self.allocated().to_string(),
                "free" => self.free().to_string(),
                _ => "-".to_string(),
            })
            .collect();
        ok(table(args.flag("-H"), &columns, vec![row]))
    }

    fn tgtadm_show(&self) -> CommandOutput {
        let mut out = String::new();
        for (tid, target) in &self.targets {
            out.push_str(&format!(
                "Target {}: {}\n    System information:\n        Driver: iscsi\n        State: ready\n    LUN information:\n        LUN: 0\n            Type: controller\n            Backing store path: None\n        LUN: 1\n            Type: disk\n            Backing store path: {}\n",
                tid, target.iqn, target.backing_store
            ));
        }
        ok(out)
    }
}

/// In-memory ZFS appliance for testing
///
/// Implements `Transport` by interpreting the `zfs`, `zpool` and `tgtadm`
/// command lines the driver issues and answering in the same text formats
/// as the real tools, so tests exercise the runner, parser and managers
/// end to end.
pub struct MockAppliance {
    state: Arc<RwLock<MockState>>,
}

impl MockAppliance {
    /// Appliance with an empty pool and the given base dataset (and its
    /// parents) already created
    pub fn new(base_dataset: &str, pool_size: u64) -> Self {
        let base = base_dataset.trim_end_matches('/');
        let mut datasets = BTreeMap::new();
        let mut path = String::new();
        for (i, part) in base.split('/').enumerate() {
            if i > 0 {
                path.push('/');
            }
            path.push_str(part);
            datasets.insert(path.clone(), MockDataset::filesystem(0));
        }

        Self {
            state: Arc::new(RwLock::new(MockState {
                pool: pool_name(base).to_string(),
                pool_size,
                share_property: "shareiscsi".to_string(),
                target_prefix: "iqn.2010-10.org.openstack:".to_string(),
                datasets,
                targets: BTreeMap::new(),
                next_tid: 1,
                txg: 0,
                faults: MockFaults::default(),
                history: Vec::new(),
            })),
        }
    }

    pub async fn set_faults(&self, faults: MockFaults) {
        self.state.write().await.faults = faults;
    }

    pub async fn exists(&self, dataset: &str) -> bool {
        self.state.read().await.datasets.contains_key(dataset)
    }

    /// Property as `zfs get` would report it
    pub async fn property(&self, dataset: &str, property: &str) -> Option<String> {
        let state = self.state.read().await;
        state
            .datasets
            .get(dataset)
            .map(|ds| state.column(dataset, ds, property))
    }

    /// IQN of the target exporting a dataset's device, if any
    pub async fn target_for(&self, dataset: &str) -> Option<String> {
        let device = device_path(dataset);
        self.state
            .read()
            .await
            .targets
            .values()
            .find(|t| t.backing_store == device)
            .map(|t| t.iqn.clone())
    }

    /// Simulate a client writing `bytes` to a volume
    pub async fn write(&self, dataset: &str, bytes: u64) {
        if let Some(ds) = self.state.write().await.datasets.get_mut(dataset) {
            ds.written = ds.volsize.min(ds.written + bytes);
        }
    }

    /// Every argv received, in order
    pub async fn history(&self) -> Vec<Vec<String>> {
        self.state.read().await.history.clone()
    }
}

#[async_trait]
impl Transport for MockAppliance {
    async fn execute(
        &self,
        argv: &[String],
    ) -> std::result::Result<CommandOutput, TransportFailure> {
        let mut state = self.state.write().await;
        if state.faults.transport_failures > 0 {
            state.faults.transport_failures -= 1;
            return Err(TransportFailure::retryable("Connection reset by peer"));
        }
        state.history.push(argv.to_vec());
        let output = state.dispatch(argv);
        debug!("Mock: {} -> exit {}", argv.join(" "), output.exit_code);
        Ok(output)
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}
