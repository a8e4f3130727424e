//! Operations, loops and source positions.

use super::resource::ResourceId;
use crate::target::{CoreGroup, ExecutionUnit, Lane};
use smallvec::SmallVec;
use std::fmt;

/// Name of a loop in the kernel's loop nest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(pub String);

impl LoopId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LoopId {
    fn from(s: &str) -> Self {
        LoopId(s.to_string())
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Number of iterations a loop runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TripCount {
    /// Known at planning time.
    Known(u64),
    /// Only known at run time (e.g. a tiling parameter). `multiple_of` is a
    /// guaranteed divisor, used to decide how far the loop may be unrolled.
    Symbolic { name: String, multiple_of: u64 },
}

impl TripCount {
    pub fn symbolic(name: impl Into<String>) -> Self {
        TripCount::Symbolic {
            name: name.into(),
            multiple_of: 1,
        }
    }

    /// Largest value every trip count is known to be divisible by.
    pub fn divisor(&self) -> u64 {
        match self {
            TripCount::Known(n) => *n,
            TripCount::Symbolic { multiple_of, .. } => (*multiple_of).max(1),
        }
    }

    /// Trip count of the loop after grouping `factor` iterations per batch.
    pub fn batched(&self, factor: u32) -> TripCount {
        let factor = factor.max(1) as u64;
        match self {
            TripCount::Known(n) => TripCount::Known(n / factor),
            TripCount::Symbolic { name, multiple_of } => TripCount::Symbolic {
                name: if factor > 1 {
                    format!("{}/{}", name, factor)
                } else {
                    name.clone()
                },
                multiple_of: (multiple_of / factor).max(1),
            },
        }
    }

    pub fn known(&self) -> Option<u64> {
        match self {
            TripCount::Known(n) => Some(*n),
            TripCount::Symbolic { .. } => None,
        }
    }
}

impl fmt::Display for TripCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TripCount::Known(n) => write!(f, "{}", n),
            TripCount::Symbolic { name, .. } => f.write_str(name),
        }
    }
}

/// Declaration of one loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSpec {
    pub id: LoopId,
    pub trip: TripCount,
    /// Requested unroll factor; `None` uses the configured default.
    pub unroll: Option<u32>,
}

impl LoopSpec {
    pub fn new(id: impl Into<LoopId>, trip: TripCount) -> Self {
        Self {
            id: id.into(),
            trip,
            unroll: None,
        }
    }

    pub fn unrolled(mut self, factor: u32) -> Self {
        self.unroll = Some(factor);
        self
    }
}

impl From<String> for LoopId {
    fn from(s: String) -> Self {
        LoopId(s)
    }
}

/// Name of a conditional chain (`if` / `elif` / `else`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchId(pub String);

impl BranchId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BranchId {
    fn from(s: &str) -> Self {
        BranchId(s.to_string())
    }
}

impl From<String> for BranchId {
    fn from(s: String) -> Self {
        BranchId(s)
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Declaration of a conditional chain with `arms` alternatives.
///
/// At most one arm runs per visit. An exhaustive chain ends in `else`, so
/// exactly one arm runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSpec {
    pub id: BranchId,
    pub arms: u32,
    pub exhaustive: bool,
}

impl BranchSpec {
    pub fn new(id: impl Into<BranchId>, arms: u32) -> Self {
        Self {
            id: id.into(),
            arms,
            exhaustive: false,
        }
    }

    /// The last arm is an `else`.
    pub fn with_else(mut self) -> Self {
        self.exhaustive = true;
        self
    }
}

/// Arm of a conditional chain an operation sits in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArmRef {
    pub branch: BranchId,
    pub arm: u32,
}

/// Tensor layout a data-movement operation converts between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    Plain,
    Nd2Nz,
    Nz2Nd,
    Nz2Zz,
    Pad,
}

/// What an operation does. Opaque to the scheduler, which only looks at
/// reads, writes and the unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkKind {
    Copy(Layout),
    Transpose,
    MatMul,
    Elementwise,
    Reduce,
    Sort,
    Opaque,
}

impl WorkKind {
    /// Parse a work name plus optional layout descriptor.
    pub fn parse(kind: &str, layout: Option<&str>) -> Option<Self> {
        let layout = match layout.map(|l| l.to_ascii_lowercase()) {
            None => Layout::Plain,
            Some(l) => match l.as_str() {
                "plain" | "nd" => Layout::Plain,
                "nd2nz" => Layout::Nd2Nz,
                "nz2nd" => Layout::Nz2Nd,
                "nz2zz" => Layout::Nz2Zz,
                "pad" => Layout::Pad,
                _ => return None,
            },
        };
        match kind.to_ascii_lowercase().as_str() {
            "copy" => Some(WorkKind::Copy(layout)),
            "transpose" => Some(WorkKind::Transpose),
            "matmul" | "mmad" => Some(WorkKind::MatMul),
            "elementwise" | "vec" => Some(WorkKind::Elementwise),
            "reduce" => Some(WorkKind::Reduce),
            "sort" => Some(WorkKind::Sort),
            "opaque" => Some(WorkKind::Opaque),
            _ => None,
        }
    }
}

/// One work item of the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub name: String,
    pub work: WorkKind,
    pub unit: ExecutionUnit,
    /// Core group override; defaults to the unit's home group.
    pub group: Option<CoreGroup>,
    pub reads: SmallVec<[ResourceId; 4]>,
    pub writes: SmallVec<[ResourceId; 2]>,
    /// Enclosing loops, outermost first.
    pub loops: SmallVec<[LoopId; 3]>,
    /// Hands data to (or takes data from) the other core group.
    pub group_crossing: bool,
    /// Conditional arm the operation is guarded by.
    pub arm: Option<ArmRef>,
}

impl Operation {
    pub fn new(name: impl Into<String>, unit: ExecutionUnit) -> Self {
        Self {
            name: name.into(),
            work: WorkKind::Opaque,
            unit,
            group: None,
            reads: SmallVec::new(),
            writes: SmallVec::new(),
            loops: SmallVec::new(),
            group_crossing: false,
            arm: None,
        }
    }

    pub fn work(mut self, work: WorkKind) -> Self {
        self.work = work;
        self
    }

    pub fn reads(mut self, resources: &[ResourceId]) -> Self {
        self.reads.extend(resources.iter().copied());
        self
    }

    pub fn writes(mut self, resources: &[ResourceId]) -> Self {
        self.writes.extend(resources.iter().copied());
        self
    }

    pub fn in_loops(mut self, loops: &[&str]) -> Self {
        self.loops = loops.iter().map(|l| LoopId::from(*l)).collect();
        self
    }

    pub fn in_group(mut self, group: CoreGroup) -> Self {
        self.group = Some(group);
        self
    }

    pub fn crossing(mut self) -> Self {
        self.group_crossing = true;
        self
    }

    /// Guard the operation by arm `arm` of chain `branch`.
    pub fn in_arm(mut self, branch: &str, arm: u32) -> Self {
        self.arm = Some(ArmRef {
            branch: BranchId::from(branch),
            arm,
        });
        self
    }

    /// Lane this operation is issued on.
    pub fn lane(&self) -> Lane {
        Lane::new(self.group.unwrap_or_else(|| self.unit.home_group()), self.unit)
    }

    /// Whether the operation touches `resource` at all.
    pub fn touches(&self, resource: ResourceId) -> bool {
        self.reads.contains(&resource) || self.writes.contains(&resource)
    }
}

/// One level of a position's loop path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoopFrame {
    pub id: LoopId,
    /// Unrolled copy the position lies in, when the loop was unrolled.
    pub replica: Option<u32>,
    /// Iteration (batch) index, when the position is a dynamic instance.
    pub iteration: Option<u64>,
}

impl fmt::Display for LoopFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        if let Some(r) = self.replica {
            write!(f, "#{}", r)?;
        }
        if let Some(i) = self.iteration {
            write!(f, "[{}]", i)?;
        }
        Ok(())
    }
}

/// Where something happened: operation index plus loop path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Position {
    /// Index into the kernel's operation list.
    pub op: usize,
    /// Enclosing loops, outermost first.
    pub path: Vec<LoopFrame>,
}

impl Position {
    /// Position of a top-level operation.
    pub fn op(op: usize) -> Self {
        Self {
            op,
            path: Vec::new(),
        }
    }

    /// Position of an operation with a static loop path.
    pub fn with_loops(op: usize, loops: &[LoopId]) -> Self {
        Self {
            op,
            path: loops
                .iter()
                .map(|id| LoopFrame {
                    id: id.clone(),
                    replica: None,
                    iteration: None,
                })
                .collect(),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op #{}", self.op)?;
        if !self.path.is_empty() {
            write!(f, " in ")?;
            for (i, frame) in self.path.iter().enumerate() {
                if i > 0 {
                    write!(f, "/")?;
                }
                write!(f, "{}", frame)?;
            }
        }
        Ok(())
    }
}
