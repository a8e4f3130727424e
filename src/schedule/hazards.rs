//! Hazard analysis.
//!
//! Walks operation instances of the program in issue order (loops expanded
//! with bounded trip counts) and tracks, per (resource, physical slot):
//!
//! - the last writers,
//! - the lanes already synchronized after those writes,
//! - the last reader on each lane since then.
//!
//! Each arm of a conditional chain is walked from the state at the chain's
//! entry and the arm states are joined afterwards, so a slot may have several
//! possible last writers. An edge with only one end inside a chain is
//! anchored at the chain itself.
//!
//! Cross-lane conflicts become instance edges which are folded onto static
//! program points: (source node, destination node, resource, kind, scope)
//! with the minimum iteration distance seen. Only operations in the same sync
//! region are related; operations outside every region are synchronized by
//! the kernel author.

use super::program::{FlatCounters, NodeId, NodeKind, Program};
use crate::error::SyncError;
use crate::model::{Position, ResourceId, SlotRing, TripCount};
use crate::target::spec;
use crate::target::Lane;
use log::debug;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;

/// Dependency kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HazardKind {
    ReadAfterWrite,
    WriteAfterRead,
    WriteAfterWrite,
}

impl HazardKind {
    pub fn short(self) -> &'static str {
        match self {
            HazardKind::ReadAfterWrite => "RAW",
            HazardKind::WriteAfterRead => "WAR",
            HazardKind::WriteAfterWrite => "WAW",
        }
    }
}

impl fmt::Display for HazardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

/// Whether an edge stays within one iteration of its scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EdgeClass {
    /// Source and destination in the same iteration.
    Forward,
    /// Destination one or more iterations later.
    Carried,
}

/// A static dependency between two program points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HazardEdge {
    pub kind: HazardKind,
    pub resource: ResourceId,
    pub src: NodeId,
    pub dst: NodeId,
    pub src_lane: Lane,
    pub dst_lane: Lane,
    /// Deepest loop whose single execution contains both endpoints;
    /// `None` for the kernel top level.
    pub scope: Option<NodeId>,
    /// Children of the scope body containing each endpoint.
    pub src_anchor: NodeId,
    pub dst_anchor: NodeId,
    /// Minimum iteration distance within the scope.
    pub distance: u64,
}

impl HazardEdge {
    pub fn class(&self) -> EdgeClass {
        if self.distance == 0 {
            EdgeClass::Forward
        } else {
            EdgeClass::Carried
        }
    }

    pub fn crosses_group(&self) -> bool {
        self.src_lane.crosses_group(self.dst_lane)
    }
}

impl fmt::Display for HazardEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} r{} {}({}) -> {}({})",
            self.kind, self.resource.0, self.src, self.src_lane, self.dst, self.dst_lane
        )?;
        match self.scope {
            Some(scope) => write!(f, " scope {} d={}", scope, self.distance),
            None => write!(f, " top"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    node: NodeId,
    exec: u64,
    iter: u64,
}

#[derive(Debug, Clone)]
struct Instance {
    node: NodeId,
    lane: Lane,
    frames: SmallVec<[Frame; 4]>,
}

#[derive(Debug, Clone, Default)]
struct SlotState {
    writers: SmallVec<[usize; 2]>,
    synced: SmallVec<[Lane; 4]>,
    readers: SmallVec<[usize; 4]>,
}

impl SlotState {
    /// Merge the state reached along another path.
    fn join(&mut self, other: &SlotState) {
        for &w in &other.writers {
            if !self.writers.contains(&w) {
                self.writers.push(w);
            }
        }
        self.synced.retain(|lane| other.synced.contains(lane));
        for &r in &other.readers {
            if !self.readers.contains(&r) {
                self.readers.push(r);
            }
        }
    }
}

fn join_rings(acc: &mut [SlotRing<SlotState>], other: &[SlotRing<SlotState>]) {
    for (mine, theirs) in acc.iter_mut().zip(other) {
        for slot in 0..mine.width().get() as usize {
            mine.slot_mut(slot).join(theirs.slot(slot));
        }
    }
}

type FoldKey = (NodeId, NodeId, ResourceId, HazardKind, Option<NodeId>);

/// Derives the static dependency edges of a program.
pub struct HazardAnalyzer<'p, 'k> {
    program: &'p Program<'k>,
    analysis_iterations: u64,
}

impl<'p, 'k> HazardAnalyzer<'p, 'k> {
    pub fn new(program: &'p Program<'k>) -> Self {
        Self {
            program,
            analysis_iterations: default_analysis_iterations(),
        }
    }

    /// Override how many iterations of each loop are expanded.
    pub fn with_analysis_iterations(mut self, iterations: u32) -> Self {
        self.analysis_iterations = iterations.max(1) as u64;
        self
    }

    /// Run the analysis.
    pub fn analyze(&self) -> Result<Vec<HazardEdge>, SyncError> {
        let program = self.program;
        let mut walker = Walker {
            program,
            iterations: self.analysis_iterations,
            counters: FlatCounters::new(program.loop_count()),
            executions: vec![0; program.nodes().len()],
            frames: SmallVec::new(),
            instances: Vec::new(),
            slots: program
                .rotations()
                .iter()
                .map(|rot| SlotRing::new(rot.width))
                .collect(),
            edges: Vec::new(),
            folded: HashMap::new(),
        };
        walker.walk(program.root())?;
        let edges = walker.finish();
        debug!(
            "kernel '{}': {} hazard edges from {} instances",
            program.kernel().name,
            edges.len(),
            walker.instances.len()
        );
        Ok(edges)
    }
}

/// Two full rotations of the widest buffer plus slack.
pub fn default_analysis_iterations() -> u64 {
    2 * spec::MAX_ROTATION_WIDTH as u64 + spec::ANALYSIS_SLACK_ITERATIONS as u64
}

struct Walker<'p, 'k> {
    program: &'p Program<'k>,
    iterations: u64,
    counters: FlatCounters,
    executions: Vec<u64>,
    frames: SmallVec<[Frame; 4]>,
    instances: Vec<Instance>,
    slots: Vec<SlotRing<SlotState>>,
    edges: Vec<HazardEdge>,
    folded: HashMap<FoldKey, usize>,
}

impl<'p, 'k> Walker<'p, 'k> {
    fn walk(&mut self, body: &[NodeId]) -> Result<(), SyncError> {
        let program = self.program;
        for &id in body {
            match &program.node(id).kind {
                NodeKind::Op(_) => self.visit(id)?,
                NodeKind::Loop(l) => {
                    let trips = match &l.trip {
                        TripCount::Known(n) => (*n).min(self.iterations),
                        TripCount::Symbolic { .. } => self.iterations,
                    };
                    let exec = self.executions[id.index()];
                    self.executions[id.index()] += 1;
                    for iter in 0..trips {
                        self.counters.begin_iteration(l.loop_ix);
                        self.frames.push(Frame { node: id, exec, iter });
                        self.walk(&l.body)?;
                        self.frames.pop();
                    }
                }
                NodeKind::Branch(b) => {
                    let exec = self.executions[id.index()];
                    self.executions[id.index()] += 1;
                    let entry = self.slots.clone();
                    // Without an else, falling through is one more path.
                    let mut joined = if b.exhaustive { None } else { Some(entry.clone()) };
                    for &arm in &b.arms {
                        self.slots = entry.clone();
                        self.frames.push(Frame { node: id, exec, iter: 0 });
                        self.frames.push(Frame { node: arm, exec, iter: 0 });
                        self.walk(program.body(Some(arm)))?;
                        self.frames.pop();
                        self.frames.pop();
                        let out = std::mem::take(&mut self.slots);
                        joined = Some(match joined {
                            None => out,
                            Some(mut acc) => {
                                join_rings(&mut acc, &out);
                                acc
                            }
                        });
                    }
                    self.slots = joined.unwrap_or(entry);
                }
                NodeKind::Arm(a) => self.walk(&a.body)?,
            }
        }
        Ok(())
    }

    fn visit(&mut self, id: NodeId) -> Result<(), SyncError> {
        let program = self.program;
        let Some(node) = program.as_op(id) else {
            return Ok(());
        };
        let op = program.kernel().operation(node.op);
        let manual = program.kernel().region_of(node.op).is_none();
        let lane = node.lane;
        let me = self.instances.len();
        self.instances.push(Instance {
            node: id,
            lane,
            frames: self.frames.clone(),
        });

        let mut found: SmallVec<[(usize, ResourceId, HazardKind); 4]> = SmallVec::new();
        for &r in &op.reads {
            let rot = program.rotation(r);
            let slot = rot.slot(&self.counters, &node.replicas) as usize;
            let state = self.slots[r.index()].slot_mut(slot);
            if state.writers.is_empty() && !rot.external && !manual {
                return Err(SyncError::UseBeforeProduce {
                    resource: program.kernel().resources().name(r).to_string(),
                    position: self.instance_position(me),
                });
            }
            if !state.synced.contains(&lane) {
                let before = found.len();
                for &w in &state.writers {
                    if self.instances[w].lane != lane {
                        found.push((w, r, HazardKind::ReadAfterWrite));
                    }
                }
                if found.len() > before {
                    state.synced.push(lane);
                }
            }
            let instances = &self.instances;
            state.readers.retain(|x| instances[*x].lane != lane);
            state.readers.push(me);
        }

        for &r in &op.writes {
            let rot = program.rotation(r);
            let slot = rot.slot(&self.counters, &node.replicas) as usize;
            let state = self.slots[r.index()].slot_mut(slot);
            let mut ordered = false;
            for &reader in &state.readers {
                if self.instances[reader].lane != lane {
                    found.push((reader, r, HazardKind::WriteAfterRead));
                    ordered = true;
                }
            }
            if !ordered && !state.synced.contains(&lane) {
                for &w in &state.writers {
                    if self.instances[w].lane != lane {
                        found.push((w, r, HazardKind::WriteAfterWrite));
                    }
                }
            }
            state.writers.clear();
            state.writers.push(me);
            state.synced.clear();
            state.synced.push(lane);
            state.readers.clear();
        }

        for (src, resource, kind) in found {
            self.record(src, me, resource, kind)?;
        }
        Ok(())
    }

    /// Position of an instance, with iteration coordinates.
    fn instance_position(&self, instance: usize) -> Position {
        let program = self.program;
        let inst = &self.instances[instance];
        let mut position = program.position(inst.node);
        let loops = inst.frames.iter().filter(|f| program.as_loop(f.node).is_some());
        for (frame, dynamic) in position.path.iter_mut().zip(loops) {
            frame.iteration = Some(dynamic.iter);
        }
        position
    }

    fn record(&mut self, src: usize, dst: usize, resource: ResourceId, kind: HazardKind) -> Result<(), SyncError> {
        let s = &self.instances[src];
        let d = &self.instances[dst];
        let kernel = self.program.kernel();
        let op_of = |n: NodeId| self.program.as_op(n).map(|o| o.op).unwrap_or_default();

        let region = kernel.region_of(op_of(s.node));
        if region.is_none() || region != kernel.region_of(op_of(d.node)) {
            return Ok(());
        }

        if s.lane.crosses_group(d.lane) {
            let crossing =
                kernel.operation(op_of(s.node)).group_crossing || kernel.operation(op_of(d.node)).group_crossing;
            if !crossing {
                return Err(SyncError::NoLegalPath {
                    producer: s.lane,
                    consumer: d.lane,
                    position: self.instance_position(dst),
                });
            }
        }

        let mut level = None;
        let mut distance = 0;
        for (i, (fs, fd)) in s.frames.iter().zip(d.frames.iter()).enumerate() {
            if fs.node != fd.node || fs.exec != fd.exec {
                break;
            }
            level = Some(i);
            if fs.iter != fd.iter {
                distance = fd.iter.saturating_sub(fs.iter);
                break;
            }
        }
        let scope = level.map(|i| s.frames[i].node);
        let depth = level.map_or(0, |i| i + 1);
        let src_anchor = s.frames.get(depth).map_or(s.node, |f| f.node);
        let dst_anchor = d.frames.get(depth).map_or(d.node, |f| f.node);

        let key = (s.node, d.node, resource, kind, scope);
        match self.folded.get(&key) {
            Some(&i) => {
                let edge = &mut self.edges[i];
                edge.distance = edge.distance.min(distance);
            }
            None => {
                let edge = HazardEdge {
                    kind,
                    resource,
                    src: s.node,
                    dst: d.node,
                    src_lane: s.lane,
                    dst_lane: d.lane,
                    scope,
                    src_anchor,
                    dst_anchor,
                    distance,
                };
                self.folded.insert(key, self.edges.len());
                self.edges.push(edge);
            }
        }
        Ok(())
    }

    /// Drop edges lifted across executions of an inner loop when an inner
    /// carried edge between the same operations already orders them through
    /// its drain.
    fn finish(&mut self) -> Vec<HazardEdge> {
        let program = self.program;
        let edges = std::mem::take(&mut self.edges);
        let kept: Vec<HazardEdge> = edges
            .iter()
            .filter(|e| {
                if e.src_anchor != e.dst_anchor || program.as_loop(e.src_anchor).is_none() {
                    return true;
                }
                let inner = e.src_anchor;
                !edges.iter().any(|o| {
                    o.src == e.src
                        && o.dst == e.dst
                        && o.resource == e.resource
                        && o.distance > 0
                        && o.scope.is_some_and(|s| program.is_within(s, inner))
                })
            })
            .cloned()
            .collect();
        for edge in &kept {
            debug!("edge {}", edge);
        }
        kept
    }
}
