//! The synchronization plan: the program tree with sync instructions
//! inserted, plus the event and barrier tables.
//!
//! A plan owns everything the verifier needs (operation accesses, rotation
//! table), so it outlives the kernel it was built from. Its `Display` output
//! is a deterministic listing used for golden comparisons.

use super::barrier::{BarrierId, CrossGroupBarrier};
use super::events::{EventId, SyncEvent};
use super::program::{NodeId, Replicas, Rotation};
use crate::model::{BranchId, LoopId, ResourceId, TripCount, UserEvent};
use crate::target::Lane;
use smallvec::SmallVec;
use std::fmt;

/// What a sync instruction signals or waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyncTarget {
    Event(EventId),
    Barrier(BarrierId),
}

impl fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncTarget::Event(e) => write!(f, "{}", e),
            SyncTarget::Barrier(b) => write!(f, "{}", b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncAction {
    Set,
    Wait,
    /// `count` sets issued before a loop so the first waits pass.
    Preset(u32),
    /// `count` waits issued after a loop to consume the trailing sets.
    Drain(u32),
}

/// One inserted instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncInstr {
    pub lane: Lane,
    pub action: SyncAction,
    pub target: SyncTarget,
    /// Operation the instruction is attached to, for diagnostics.
    pub anchor_op: usize,
}

impl SyncInstr {
    /// Whether the instruction signals (never blocks).
    pub fn is_signal(&self) -> bool {
        matches!(self.action, SyncAction::Set | SyncAction::Preset(_))
    }

    /// Number of primitive sets or waits it expands to.
    pub fn count(&self) -> u32 {
        match self.action {
            SyncAction::Set | SyncAction::Wait => 1,
            SyncAction::Preset(n) | SyncAction::Drain(n) => n,
        }
    }
}

impl fmt::Display for SyncInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.action {
            SyncAction::Set => write!(f, "set {} @{}", self.target, self.lane),
            SyncAction::Wait => write!(f, "wait {} @{}", self.target, self.lane),
            SyncAction::Preset(n) => write!(f, "preset {} x{} @{}", self.target, n, self.lane),
            SyncAction::Drain(n) => write!(f, "drain {} x{} @{}", self.target, n, self.lane),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOp {
    pub node: NodeId,
    pub op: usize,
    pub lane: Lane,
    pub replicas: Replicas,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanLoop {
    pub node: NodeId,
    pub loop_ix: usize,
    /// Trip count in batches of `unroll` iterations.
    pub trip: TripCount,
    pub unroll: u32,
    pub replicas: Replicas,
    pub body: Vec<PlanNode>,
}

/// A conditional chain; at most one arm runs per visit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanBranch {
    pub node: NodeId,
    pub branch_ix: usize,
    /// The last arm is an `else`.
    pub exhaustive: bool,
    pub arms: Vec<Vec<PlanNode>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanNode {
    Op(PlanOp),
    Sync(SyncInstr),
    Loop(PlanLoop),
    Branch(PlanBranch),
}

/// Accesses of one kernel operation, as the verifier sees them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpAccess {
    pub name: String,
    pub reads: SmallVec<[ResourceId; 4]>,
    pub writes: SmallVec<[ResourceId; 2]>,
    /// Sync region; `None` for hand-synchronized operations.
    pub region: Option<usize>,
}

/// Result of planning one kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct SynchronizationPlan {
    pub kernel: String,
    pub body: Vec<PlanNode>,
    pub events: Vec<SyncEvent>,
    pub barriers: Vec<CrossGroupBarrier>,
    pub rotations: Vec<Rotation>,
    pub resources: Vec<String>,
    pub loops: Vec<LoopId>,
    pub branches: Vec<BranchId>,
    pub operations: Vec<OpAccess>,
    /// Identities the kernel synchronizes by hand.
    pub reserved: Vec<UserEvent>,
}

impl SynchronizationPlan {
    /// Whether any conditional chain is left in the plan.
    pub fn has_branches(&self) -> bool {
        fn any(body: &[PlanNode]) -> bool {
            body.iter().any(|node| match node {
                PlanNode::Branch(_) => true,
                PlanNode::Loop(l) => any(&l.body),
                PlanNode::Op(_) | PlanNode::Sync(_) => false,
            })
        }
        any(&self.body)
    }

    /// Most arms of any chain.
    pub fn max_arms(&self) -> usize {
        fn widest(body: &[PlanNode]) -> usize {
            body.iter()
                .map(|node| match node {
                    PlanNode::Branch(b) => b.arms.len(),
                    PlanNode::Loop(l) => widest(&l.body),
                    PlanNode::Op(_) | PlanNode::Sync(_) => 0,
                })
                .max()
                .unwrap_or(0)
        }
        widest(&self.body)
    }

    /// Producer and consumer lanes of a target.
    pub fn lanes_of(&self, target: SyncTarget) -> Option<(Lane, Lane)> {
        let key = match target {
            SyncTarget::Event(e) => self.events.get(e.0 as usize).map(|e| e.key),
            SyncTarget::Barrier(b) => self.barriers.get(b.0 as usize).map(|b| b.key),
        }?;
        Some((key.producer, key.consumer))
    }

    /// Number of signals that may be outstanding on a target.
    pub fn width_of(&self, target: SyncTarget) -> u32 {
        match target {
            SyncTarget::Event(e) => self.events.get(e.0 as usize).map_or(1, |e| e.kind.width()),
            SyncTarget::Barrier(b) => self.barriers.get(b.0 as usize).map_or(1, |b| b.config.depth),
        }
    }

    /// All sync instructions, in listing order.
    pub fn sync_instrs(&self) -> Vec<&SyncInstr> {
        fn collect<'a>(body: &'a [PlanNode], out: &mut Vec<&'a SyncInstr>) {
            for node in body {
                match node {
                    PlanNode::Sync(s) => out.push(s),
                    PlanNode::Loop(l) => collect(&l.body, out),
                    PlanNode::Branch(b) => {
                        for arm in &b.arms {
                            collect(arm, out);
                        }
                    }
                    PlanNode::Op(_) => {}
                }
            }
        }
        let mut out = Vec::new();
        collect(&self.body, &mut out);
        out
    }

    /// Static count of instructions with the given action shape.
    pub fn count_where<F: Fn(&SyncInstr) -> bool>(&self, pred: F) -> usize {
        self.sync_instrs().into_iter().filter(|s| pred(s)).count()
    }

    fn write_body(&self, f: &mut fmt::Formatter<'_>, body: &[PlanNode], depth: usize) -> fmt::Result {
        let indent = "  ".repeat(depth);
        for node in body {
            match node {
                PlanNode::Sync(s) => writeln!(f, "{}{}", indent, s)?,
                PlanNode::Op(op) => {
                    let name = self.operations.get(op.op).map_or("?", |o| o.name.as_str());
                    writeln!(f, "{}{}{} @{}", indent, name, replica_suffix(&op.replicas), op.lane)?;
                }
                PlanNode::Loop(l) => {
                    let id = self.loops.get(l.loop_ix).map_or("?", |id| id.as_str());
                    write!(f, "{}loop {}{} x{}", indent, id, replica_suffix(&l.replicas), l.trip)?;
                    if l.unroll > 1 {
                        write!(f, " unroll {}", l.unroll)?;
                    }
                    writeln!(f, " {{")?;
                    self.write_body(f, &l.body, depth + 1)?;
                    writeln!(f, "{}}}", indent)?;
                }
                PlanNode::Branch(b) => {
                    let id = self.branches.get(b.branch_ix).map_or("?", |id| id.as_str());
                    let last = b.arms.len().saturating_sub(1);
                    for (k, arm) in b.arms.iter().enumerate() {
                        match k {
                            0 => writeln!(f, "{}if {}[0] {{", indent, id)?,
                            k if k == last && b.exhaustive => writeln!(f, "{}}} else {{", indent)?,
                            k => writeln!(f, "{}}} elif {}[{}] {{", indent, id, k)?,
                        }
                        self.write_body(f, arm, depth + 1)?;
                    }
                    writeln!(f, "{}}}", indent)?;
                }
            }
        }
        Ok(())
    }
}

fn replica_suffix(replicas: &[(usize, u32)]) -> String {
    if replicas.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = replicas.iter().map(|(_, r)| r.to_string()).collect();
    format!("#{}", parts.join("."))
}

impl fmt::Display for SynchronizationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "kernel {}", self.kernel)?;
        let resource = |r: ResourceId| self.resources.get(r.index()).map_or("?", |s| s.as_str());
        for u in &self.reserved {
            writeln!(f, "user {} {} -> {} id={}", u.name, u.producer, u.consumer, u.id)?;
        }
        for e in &self.events {
            let ids: Vec<String> = e.identities.iter().map(|i| i.to_string()).collect();
            let carried: Vec<&str> = e.channels().map(|k| resource(k.resource)).collect();
            write!(
                f,
                "event {} {} -> {} [{}] {} ids={}",
                e.id,
                e.key.producer,
                e.key.consumer,
                carried.join("+"),
                e.kind,
                ids.join(",")
            )?;
            if e.preset {
                write!(f, " preset")?;
            }
            writeln!(f)?;
        }
        for b in &self.barriers {
            write!(
                f,
                "barrier {} {} -> {} [{}] flag={} depth={}",
                b.id,
                b.key.producer,
                b.key.consumer,
                resource(b.key.resource),
                b.flag,
                b.config.depth
            )?;
            if b.config.preset {
                write!(f, " preset")?;
            }
            writeln!(f)?;
        }
        self.write_body(f, &self.body, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::ExecutionUnit;

    #[test]
    fn test_sync_instr_display() {
        let instr = SyncInstr {
            lane: Lane::home(ExecutionUnit::Compute),
            action: SyncAction::Preset(2),
            target: SyncTarget::Event(EventId(1)),
            anchor_op: 0,
        };
        assert_eq!(instr.to_string(), "preset e1 x2 @cube.M");
        assert!(instr.is_signal());
        assert_eq!(instr.count(), 2);

        let wait = SyncInstr {
            action: SyncAction::Wait,
            target: SyncTarget::Barrier(BarrierId(0)),
            ..instr
        };
        assert_eq!(wait.to_string(), "wait b0 @cube.M");
        assert!(!wait.is_signal());
    }

    #[test]
    fn test_branch_listing() {
        let op = |op: usize| {
            PlanNode::Op(PlanOp {
                node: NodeId(op as u32),
                op,
                lane: Lane::home(ExecutionUnit::Compute),
                replicas: Replicas::new(),
            })
        };
        let access = |name: &str| OpAccess {
            name: name.into(),
            reads: SmallVec::new(),
            writes: SmallVec::new(),
            region: Some(0),
        };
        let plan = SynchronizationPlan {
            kernel: "k".into(),
            body: vec![PlanNode::Branch(PlanBranch {
                node: NodeId(9),
                branch_ix: 0,
                exhaustive: true,
                arms: vec![vec![op(0)], vec![op(1)], vec![op(2)]],
            })],
            events: Vec::new(),
            barriers: Vec::new(),
            rotations: Vec::new(),
            resources: Vec::new(),
            loops: Vec::new(),
            branches: vec![BranchId::from("tail")],
            operations: vec![access("a"), access("b"), access("c")],
            reserved: Vec::new(),
        };
        assert_eq!(
            plan.to_string(),
            "kernel k\n\
             if tail[0] {\n\
             \x20 a @cube.M\n\
             } elif tail[1] {\n\
             \x20 b @cube.M\n\
             } else {\n\
             \x20 c @cube.M\n\
             }\n"
        );
        assert!(plan.has_branches());
        assert_eq!(plan.max_arms(), 3);
    }

    #[test]
    fn test_replica_suffix() {
        assert_eq!(replica_suffix(&[]), "");
        assert_eq!(replica_suffix(&[(0, 1)]), "#1");
        assert_eq!(replica_suffix(&[(0, 1), (2, 0)]), "#1.0");
    }
}
