//! Per-lane linearization of a plan.
//!
//! Expands loops with concrete trip counts, picks one arm per chain visit
//! and splits the result into one instruction stream per lane, resolving
//! every access to its physical slot.

use crate::model::{LoopFrame, Position, ResourceId, TripCount};
use crate::schedule::plan::{PlanNode, SyncAction, SyncTarget, SynchronizationPlan};
use crate::schedule::program::{FlatCounters, NodeId};
use crate::target::Lane;
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};

/// Which arm a conditional chain takes on each visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmChoice {
    /// Always the same option; clamped to the last one.
    Fixed(u32),
    /// Rotate through every option, one per visit.
    Cycle,
}

impl ArmChoice {
    /// Arm taken on `visit`, or `None` when a chain without `else` falls
    /// through.
    pub fn pick(self, arms: usize, exhaustive: bool, visit: u64) -> Option<usize> {
        let options = if exhaustive { arms } else { arms + 1 };
        if options == 0 {
            return None;
        }
        let k = match self {
            ArmChoice::Fixed(k) => (k as usize).min(options - 1),
            ArmChoice::Cycle => (visit % options as u64) as usize,
        };
        (k < arms).then_some(k)
    }
}

/// Concrete trip counts and arm choices used for one expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TripAssignment {
    /// Batches run by every symbolic loop.
    pub symbolic: u64,
    /// Upper bound on known trip counts.
    pub cap: u64,
    pub arm: ArmChoice,
}

impl TripAssignment {
    pub fn trips(&self, trip: &TripCount) -> u64 {
        match trip {
            TripCount::Known(n) => (*n).min(self.cap),
            TripCount::Symbolic { .. } => self.symbolic,
        }
    }
}

/// One slot access of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAccess {
    pub resource: ResourceId,
    pub slot: u8,
    pub write: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    /// Reads come before writes.
    Op {
        op: usize,
        /// Sync region of the operation; `None` when hand-synchronized.
        region: Option<usize>,
        accesses: SmallVec<[SlotAccess; 4]>,
    },
    Signal(SyncTarget),
    Wait(SyncTarget),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub kind: StepKind,
    pub position: Position,
}

#[derive(Debug, Clone)]
pub struct LaneStream {
    pub lane: Lane,
    pub steps: Vec<Step>,
}

/// Expand a plan into per-lane streams, ordered by lane.
pub fn linearize(plan: &SynchronizationPlan, trips: TripAssignment) -> Vec<LaneStream> {
    let mut expander = Expander {
        plan,
        trips,
        counters: FlatCounters::new(plan.loops.len()),
        stack: Vec::new(),
        visits: HashMap::new(),
        lanes: BTreeMap::new(),
    };
    expander.expand(&plan.body);
    expander
        .lanes
        .into_iter()
        .map(|(lane, steps)| LaneStream { lane, steps })
        .collect()
}

struct Expander<'a> {
    plan: &'a SynchronizationPlan,
    trips: TripAssignment,
    counters: FlatCounters,
    /// (loop index, iteration) of the enclosing loops.
    stack: Vec<(usize, u64)>,
    /// Times each chain has been reached so far.
    visits: HashMap<NodeId, u64>,
    lanes: BTreeMap<Lane, Vec<Step>>,
}

impl<'a> Expander<'a> {
    fn expand(&mut self, body: &'a [PlanNode]) {
        for node in body {
            match node {
                PlanNode::Op(op) => {
                    let access = &self.plan.operations[op.op];
                    let slot_of = |r: ResourceId| {
                        self.plan
                            .rotations
                            .get(r.index())
                            .map_or(0, |rot| rot.slot(&self.counters, &op.replicas))
                    };
                    let accesses = access
                        .reads
                        .iter()
                        .map(|&r| SlotAccess {
                            resource: r,
                            slot: slot_of(r),
                            write: false,
                        })
                        .chain(access.writes.iter().map(|&r| SlotAccess {
                            resource: r,
                            slot: slot_of(r),
                            write: true,
                        }))
                        .collect();
                    let position = self.position(op.op, &op.replicas);
                    let kind = StepKind::Op {
                        op: op.op,
                        region: access.region,
                        accesses,
                    };
                    self.push(op.lane, kind, position);
                }
                PlanNode::Sync(s) => {
                    let position = self.position(s.anchor_op, &[]);
                    let (kind, count) = match s.action {
                        SyncAction::Set => (StepKind::Signal(s.target), 1),
                        SyncAction::Preset(n) => (StepKind::Signal(s.target), n),
                        SyncAction::Wait => (StepKind::Wait(s.target), 1),
                        SyncAction::Drain(n) => (StepKind::Wait(s.target), n),
                    };
                    for _ in 0..count {
                        self.push(s.lane, kind.clone(), position.clone());
                    }
                }
                PlanNode::Loop(l) => {
                    for iter in 0..self.trips.trips(&l.trip) {
                        self.counters.begin_iteration(l.loop_ix);
                        self.stack.push((l.loop_ix, iter));
                        self.expand(&l.body);
                        self.stack.pop();
                    }
                }
                PlanNode::Branch(b) => {
                    let visit = self.visits.entry(b.node).or_insert(0);
                    let taken = self.trips.arm.pick(b.arms.len(), b.exhaustive, *visit);
                    *visit += 1;
                    if let Some(arm) = taken.and_then(|k| b.arms.get(k)) {
                        self.expand(arm);
                    }
                }
            }
        }
    }

    fn push(&mut self, lane: Lane, kind: StepKind, position: Position) {
        self.lanes.entry(lane).or_default().push(Step { kind, position });
    }

    fn position(&self, op: usize, replicas: &[(usize, u32)]) -> Position {
        let path = self
            .stack
            .iter()
            .map(|&(ix, iter)| LoopFrame {
                id: self.plan.loops[ix].clone(),
                replica: replicas.iter().find(|(l, _)| *l == ix).map(|(_, r)| *r),
                iteration: Some(iter),
            })
            .collect();
        Position { op, path }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Kernel, LoopSpec, Operation};
    use crate::schedule::Scheduler;
    use crate::target::ExecutionUnit;

    #[test]
    fn test_linearize_double_buffer() {
        let mut kernel = Kernel::new("b");
        kernel.add_loop(LoopSpec::new("l", TripCount::Known(3))).unwrap();
        let a = kernel.buffer("a", 2).unwrap();
        kernel.push(Operation::new("load", ExecutionUnit::Load).writes(&[a]).in_loops(&["l"]));
        kernel.push(Operation::new("use", ExecutionUnit::Compute).reads(&[a]).in_loops(&["l"]));
        let plan = Scheduler::default().schedule(&kernel).unwrap().plan;

        let streams = linearize(&plan, TripAssignment {
                symbolic: 0,
                cap: 64,
                arm: ArmChoice::Fixed(0),
            });
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].lane, Lane::home(ExecutionUnit::Load));

        let load_slots: Vec<u8> = streams[0]
            .steps
            .iter()
            .filter_map(|s| match &s.kind {
                StepKind::Op { accesses, .. } => Some(accesses[0].slot),
                _ => None,
            })
            .collect();
        assert_eq!(load_slots, vec![0, 1, 0]);

        let op_step = streams[1]
            .steps
            .iter()
            .filter(|s| matches!(s.kind, StepKind::Op { .. }))
            .nth(2)
            .unwrap();
        assert_eq!(op_step.position.to_string(), "op #1 in l[2]");
    }

    #[test]
    fn test_trip_assignment() {
        let trips = TripAssignment {
            symbolic: 3,
            cap: 4,
            arm: ArmChoice::Cycle,
        };
        assert_eq!(trips.trips(&TripCount::Known(10)), 4);
        assert_eq!(trips.trips(&TripCount::Known(2)), 2);
        assert_eq!(trips.trips(&TripCount::symbolic("N")), 3);
    }

    #[test]
    fn test_arm_choice() {
        // if/elif/else: three options, every one an arm
        assert_eq!(ArmChoice::Fixed(1).pick(3, true, 0), Some(1));
        assert_eq!(ArmChoice::Fixed(7).pick(3, true, 0), Some(2));
        // if/elif: the extra option skips the chain
        assert_eq!(ArmChoice::Fixed(2).pick(2, false, 0), None);
        assert_eq!(ArmChoice::Fixed(9).pick(2, false, 0), None);
        let cycled: Vec<_> = (0..4).map(|v| ArmChoice::Cycle.pick(2, false, v)).collect();
        assert_eq!(cycled, vec![Some(0), Some(1), None, Some(0)]);
    }

    #[test]
    fn test_linearize_follows_chosen_arm() {
        use crate::model::BranchSpec;
        let mut kernel = Kernel::new("chain");
        kernel.add_loop(LoopSpec::new("l", TripCount::Known(2))).unwrap();
        kernel.add_branch(BranchSpec::new("t", 2).with_else()).unwrap();
        let a = kernel.buffer("a", 1).unwrap();
        kernel.push(Operation::new("load", ExecutionUnit::Load).writes(&[a]).in_loops(&["l"]));
        kernel.push(
            Operation::new("mm", ExecutionUnit::Compute)
                .reads(&[a])
                .in_loops(&["l"])
                .in_arm("t", 0),
        );
        kernel.push(
            Operation::new("mv", ExecutionUnit::Transform)
                .reads(&[a])
                .in_loops(&["l"])
                .in_arm("t", 1),
        );
        let plan = Scheduler::default().schedule(&kernel).unwrap().plan;

        let ops = |arm| -> Vec<usize> {
            let trips = TripAssignment { symbolic: 0, cap: 64, arm };
            linearize(&plan, trips)
                .iter()
                .flat_map(|s| s.steps.iter())
                .filter_map(|s| match s.kind {
                    StepKind::Op { op, .. } => Some(op),
                    _ => None,
                })
                .collect()
        };
        let mut fixed = ops(ArmChoice::Fixed(1));
        fixed.sort_unstable();
        assert_eq!(fixed, vec![0, 0, 2, 2]);
        let mut cycled = ops(ArmChoice::Cycle);
        cycled.sort_unstable();
        assert_eq!(cycled, vec![0, 0, 1, 2]);
    }
}
