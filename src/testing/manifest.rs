//! Kernels defined by TOML manifests.
//!
//! A manifest describes one kernel (resources, loops, operations) plus what
//! scheduling it should produce. The golden fixtures under `fixtures/` are
//! manifests, and the CLI takes one as input.
//!
//! # Example Manifest
//!
//! ```toml
//! [kernel]
//! name = "double_buffer"
//!
//! [[resources]]
//! name = "a"
//! width = 2
//!
//! [[loops]]
//! id = "i"
//! trip = 4
//!
//! [[ops]]
//! name = "load"
//! unit = "load"
//! work = "copy"
//! layout = "nd2nz"
//! writes = ["a"]
//! loops = ["i"]
//!
//! [[ops]]
//! name = "mm"
//! unit = "compute"
//! work = "matmul"
//! reads = ["a"]
//! loops = ["i"]
//!
//! [expected]
//! events = 2
//! ```
//!
//! Optional sections:
//!
//! - `[[branches]]`: conditional chains (`id`, `arms`, `else = true` when
//!   the last arm is an `else`); ops join one with `branch` + `arm`
//! - `[[regions]]`: auto-sync regions as `first`/`last` op names; ops
//!   outside every region are hand-synchronized
//! - `[[user_events]]`: identities kept for hand-written sync

use crate::error::SyncError;
use crate::model::{
    BranchSpec, BufferResource, Kernel, LoopSpec, Operation, Position, RotationWidth, TripCount, UserEvent, WorkKind,
};
use crate::schedule::{Schedule, ScheduleOptions, Scheduler};
use crate::target::{CoreGroup, ExecutionUnit, Lane, UnitGraph};
use anyhow::{anyhow, Context};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Kernel manifest defining a single scheduling case.
#[derive(Debug, Clone, Deserialize)]
pub struct KernelManifest {
    pub kernel: KernelInfo,
    #[serde(default)]
    pub resources: Vec<ResourceDef>,
    #[serde(default)]
    pub loops: Vec<LoopDef>,
    #[serde(default)]
    pub branches: Vec<BranchDef>,
    #[serde(default)]
    pub ops: Vec<OpDef>,
    #[serde(default)]
    pub regions: Vec<RegionDef>,
    #[serde(default)]
    pub user_events: Vec<UserEventDef>,
    #[serde(default)]
    pub expected: ExpectedDef,
}

/// Basic kernel metadata and per-kernel option overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct KernelInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Default unroll factor for this kernel.
    #[serde(default)]
    pub unroll: Option<u32>,
    /// Event pool size for this kernel.
    #[serde(default)]
    pub event_pool: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceDef {
    pub name: String,
    #[serde(default = "default_width")]
    pub width: u8,
    /// Units allowed to touch the buffer; empty means all.
    #[serde(default)]
    pub visible: Vec<String>,
    #[serde(default)]
    pub external: bool,
    /// Loop whose iterations rotate the buffer, overriding the inferred one.
    #[serde(default)]
    pub rotate: Option<String>,
}

fn default_width() -> u8 {
    1
}

/// A trip count: a number, or the name of a runtime value.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TripDef {
    Known(u64),
    Symbolic(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoopDef {
    pub id: String,
    pub trip: TripDef,
    /// Known divisor of a symbolic trip count.
    #[serde(default)]
    pub multiple_of: Option<u64>,
    #[serde(default)]
    pub unroll: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BranchDef {
    pub id: String,
    pub arms: u32,
    #[serde(default, rename = "else")]
    pub exhaustive: bool,
}

/// Auto-sync region spanning two ops, both inclusive.
#[derive(Debug, Clone, Deserialize)]
pub struct RegionDef {
    pub first: String,
    pub last: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserEventDef {
    pub name: String,
    pub producer: String,
    pub consumer: String,
    pub id: u8,
    /// Core group of both units; their home group when unset.
    #[serde(default)]
    pub group: Option<CoreGroup>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpDef {
    pub name: String,
    pub unit: String,
    #[serde(default)]
    pub work: Option<String>,
    #[serde(default)]
    pub layout: Option<String>,
    #[serde(default)]
    pub group: Option<CoreGroup>,
    #[serde(default)]
    pub reads: Vec<String>,
    #[serde(default)]
    pub writes: Vec<String>,
    #[serde(default)]
    pub loops: Vec<String>,
    #[serde(default)]
    pub crossing: bool,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub arm: u32,
}

/// What scheduling the kernel must produce. Unset fields are not checked.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExpectedDef {
    pub events: Option<usize>,
    pub barriers: Option<usize>,
    /// Full plan listing.
    pub plan: Option<String>,
    /// Error variant name, e.g. "UseBeforeProduce".
    pub error: Option<String>,
}

/// Result of running one manifest.
#[derive(Debug)]
pub struct ManifestResult {
    pub name: String,
    pub schedule: Option<Schedule>,
    /// Variant name and message of the scheduling error, if any.
    pub error: Option<(String, String)>,
    pub mismatches: Vec<String>,
}

impl ManifestResult {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

impl KernelManifest {
    /// Load a manifest from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("in manifest {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("failed to parse manifest")
    }

    /// Build the kernel. Name lookups that fail surface as the matching
    /// [`SyncError`] so expected errors can name them.
    pub fn to_kernel(&self) -> anyhow::Result<Kernel> {
        let mut kernel = Kernel::new(self.kernel.name.clone());

        for res in &self.resources {
            let width = RotationWidth::new(res.width)?;
            let visible = res
                .visible
                .iter()
                .map(|u| parse_unit(u))
                .collect::<anyhow::Result<Vec<_>>>()
                .with_context(|| format!("resource '{}'", res.name))?;
            let mut buffer = BufferResource::new(res.name.clone(), width);
            if !visible.is_empty() {
                buffer = buffer.visible_to(&visible);
            }
            if res.external {
                buffer = buffer.external();
            }
            if let Some(id) = &res.rotate {
                buffer = buffer.rotating_in(id);
            }
            kernel.add_resource(buffer)?;
        }

        for def in &self.loops {
            let trip = match &def.trip {
                TripDef::Known(n) => TripCount::Known(*n),
                TripDef::Symbolic(name) => TripCount::Symbolic {
                    name: name.clone(),
                    multiple_of: def.multiple_of.unwrap_or(1).max(1),
                },
            };
            let mut spec = LoopSpec::new(def.id.clone(), trip);
            spec.unroll = def.unroll;
            kernel.add_loop(spec)?;
        }

        for def in &self.branches {
            let mut spec = BranchSpec::new(def.id.clone(), def.arms);
            if def.exhaustive {
                spec = spec.with_else();
            }
            kernel.add_branch(spec)?;
        }

        for (index, def) in self.ops.iter().enumerate() {
            let unit = parse_unit(&def.unit).with_context(|| format!("op '{}'", def.name))?;
            let work = match &def.work {
                Some(kind) => WorkKind::parse(kind, def.layout.as_deref())
                    .ok_or_else(|| anyhow!("op '{}': unknown work kind '{}'", def.name, kind))?,
                None => WorkKind::Opaque,
            };
            let resolve = |names: &[String]| {
                names
                    .iter()
                    .map(|n| {
                        kernel.resources().lookup(n).ok_or_else(|| SyncError::UnknownResource {
                            name: n.clone(),
                            position: Position::op(index),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            };
            let reads = resolve(&def.reads)?;
            let writes = resolve(&def.writes)?;
            let loops: Vec<&str> = def.loops.iter().map(String::as_str).collect();

            let mut op = Operation::new(def.name.clone(), unit)
                .work(work)
                .reads(&reads)
                .writes(&writes)
                .in_loops(&loops);
            if let Some(group) = def.group {
                op = op.in_group(group);
            }
            if def.crossing {
                op = op.crossing();
            }
            if let Some(branch) = &def.branch {
                op = op.in_arm(branch, def.arm);
            }
            kernel.push(op);
        }

        let op_index = |name: &str| {
            self.ops
                .iter()
                .position(|o| o.name == name)
                .ok_or_else(|| SyncError::InvalidRegion {
                    reason: format!("no op named '{}'", name),
                    position: Position::default(),
                })
        };
        for region in &self.regions {
            kernel.sync_region(op_index(&region.first)?, op_index(&region.last)?);
        }

        for def in &self.user_events {
            let lane = |name: &str| -> anyhow::Result<Lane> {
                let unit = parse_unit(name).with_context(|| format!("user event '{}'", def.name))?;
                Ok(Lane::new(def.group.unwrap_or_else(|| unit.home_group()), unit))
            };
            kernel.reserve_event(UserEvent {
                name: def.name.clone(),
                producer: lane(&def.producer)?,
                consumer: lane(&def.consumer)?,
                id: def.id,
            })?;
        }

        Ok(kernel)
    }

    /// Apply this manifest's overrides on top of `base`.
    pub fn options(&self, base: ScheduleOptions) -> ScheduleOptions {
        let mut options = base;
        if let Some(unroll) = self.kernel.unroll {
            options = options.with_unroll(unroll);
        }
        if let Some(pool) = self.kernel.event_pool {
            options = options.with_event_pool(pool);
        }
        options
    }

    /// Schedule the kernel and compare against the expectations.
    pub fn run(&self, base: ScheduleOptions) -> ManifestResult {
        let scheduler = Scheduler::new(UnitGraph::standard(), self.options(base));
        let outcome = self.to_kernel().and_then(|k| Ok(scheduler.schedule(&k)?));

        let mut result = ManifestResult {
            name: self.kernel.name.clone(),
            schedule: None,
            error: None,
            mismatches: Vec::new(),
        };
        let expected = &self.expected;

        match outcome {
            Ok(schedule) => {
                if let Some(name) = &expected.error {
                    result.mismatches.push(format!("expected error {}, but scheduling succeeded", name));
                }
                if let Some(n) = expected.events {
                    if schedule.plan.events.len() != n {
                        result
                            .mismatches
                            .push(format!("expected {} events, got {}", n, schedule.plan.events.len()));
                    }
                }
                if let Some(n) = expected.barriers {
                    if schedule.plan.barriers.len() != n {
                        result
                            .mismatches
                            .push(format!("expected {} barriers, got {}", n, schedule.plan.barriers.len()));
                    }
                }
                if let Some(golden) = &expected.plan {
                    let listing = schedule.plan.to_string();
                    if listing.trim_end() != golden.trim_end() {
                        result
                            .mismatches
                            .push(format!("plan differs:\n--- expected\n{}\n--- actual\n{}", golden, listing));
                    }
                }
                result.schedule = Some(schedule);
            }
            Err(err) => {
                let name = err
                    .downcast_ref::<SyncError>()
                    .map_or("Error", SyncError::name)
                    .to_string();
                if expected.error.as_deref() != Some(name.as_str()) {
                    result.mismatches.push(format!("unexpected error: {:#}", err));
                }
                result.error = Some((name, format!("{:#}", err)));
            }
        }
        result
    }
}

fn parse_unit(name: &str) -> anyhow::Result<ExecutionUnit> {
    ExecutionUnit::parse(name).ok_or_else(|| anyhow!("unknown execution unit '{}'", name))
}

/// Manifests in a directory, sorted by path.
pub fn discover(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map_or(false, |ext| ext == "toml"))
        .collect();
    paths.sort();
    Ok(paths)
}

/// Run every manifest in a directory.
pub fn run_dir(dir: &Path, base: &ScheduleOptions) -> anyhow::Result<Vec<(PathBuf, ManifestResult)>> {
    discover(dir)?
        .into_iter()
        .map(|path| {
            let manifest = KernelManifest::from_file(&path)?;
            let result = manifest.run(base.clone());
            Ok((path, result))
        })
        .collect()
}
