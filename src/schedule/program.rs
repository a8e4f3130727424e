//! Static program tree.
//!
//! The kernel's loop nest after partial unrolling, flattened into an arena of
//! nodes with stable [`NodeId`]s. Every later stage (hazard analysis,
//! planning, plan rendering) addresses program points through these ids.
//!
//! The program also resolves each resource's rotation: the declared rotation
//! loop or the innermost loop enclosing all of its in-loop accesses, and the
//! stride (unroll factor) that loop was given. Accesses outside that loop use
//! the ring pointer as it stands, slot 0 before the loop and the last
//! iteration's slot after it.

use super::unroll::{self, ItemSummary};
use crate::error::SyncError;
use crate::model::{Kernel, KernelItem, LoopFrame, LoopId, Position, ResourceId, RotationWidth, TripCount};
use crate::target::Lane;
use log::{debug, warn};
use smallvec::SmallVec;
use std::fmt;

/// Index of a node in the program arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Replica coordinates: (loop index, replica) for every enclosing unrolled
/// loop, outermost first.
pub type Replicas = SmallVec<[(usize, u32); 2]>;

/// One operation instance of the unrolled body.
#[derive(Debug, Clone)]
pub struct OpNode {
    /// Index into the kernel's operations.
    pub op: usize,
    pub lane: Lane,
    pub replicas: Replicas,
}

/// A loop of the unrolled program. Its trip count is in batches.
#[derive(Debug, Clone)]
pub struct LoopNode {
    /// Index into the kernel's loop declarations.
    pub loop_ix: usize,
    pub trip: TripCount,
    pub unroll: u32,
    pub body: Vec<NodeId>,
    pub replicas: Replicas,
}

/// A conditional chain. Its arms are [`ArmNode`]s, in source order.
#[derive(Debug, Clone)]
pub struct BranchNode {
    /// Index into the kernel's branch declarations.
    pub branch_ix: usize,
    pub exhaustive: bool,
    pub arms: Vec<NodeId>,
    pub replicas: Replicas,
}

#[derive(Debug, Clone)]
pub struct ArmNode {
    pub arm: u32,
    pub body: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Op(OpNode),
    Loop(LoopNode),
    Branch(BranchNode),
    Arm(ArmNode),
}

#[derive(Debug, Clone)]
pub struct ProgramNode {
    pub parent: Option<NodeId>,
    /// Index within the parent's body (or the root list).
    pub index: usize,
    pub kind: NodeKind,
}

/// How a resource's accesses map to physical slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rotation {
    pub width: RotationWidth,
    /// Loop whose iterations advance the buffer; `None` pins slot 0.
    pub loop_ix: Option<usize>,
    /// Unroll factor of the rotation loop.
    pub stride: u32,
    pub external: bool,
}

impl Rotation {
    /// Physical slot of an access, given the current flat iteration of
    /// every loop and the access's replica coordinates.
    pub fn slot(&self, counters: &FlatCounters, replicas: &[(usize, u32)]) -> u8 {
        let Some(ix) = self.loop_ix else {
            return 0;
        };
        let replica = replicas
            .iter()
            .find(|(l, _)| *l == ix)
            .map(|(_, r)| *r as u64)
            .unwrap_or(0);
        let generation = counters.current(ix) * self.stride as u64 + replica;
        (generation % self.width.get() as u64) as u8
    }

    /// Rotation period in iterations of loop `loop_ix`: how many batches
    /// pass before a slot comes back. 1 when the resource does not rotate
    /// there.
    pub fn period_at(&self, loop_ix: usize) -> u64 {
        let w = self.width.get() as u32;
        if self.loop_ix == Some(loop_ix) && self.stride < w {
            (w / self.stride.max(1)) as u64
        } else {
            1
        }
    }
}

/// Running iteration counters per loop, across all executions of the loop.
#[derive(Debug, Clone)]
pub struct FlatCounters {
    started: Vec<u64>,
}

impl FlatCounters {
    pub fn new(loops: usize) -> Self {
        Self {
            started: vec![0; loops],
        }
    }

    /// Record the start of a new iteration of loop `ix`.
    #[inline]
    pub fn begin_iteration(&mut self, ix: usize) {
        self.started[ix] += 1;
    }

    /// Flat index of the iteration of loop `ix` currently running.
    #[inline]
    pub fn current(&self, ix: usize) -> u64 {
        self.started[ix].saturating_sub(1)
    }
}

/// The unrolled program.
#[derive(Debug, Clone)]
pub struct Program<'k> {
    kernel: &'k Kernel,
    nodes: Vec<ProgramNode>,
    root: Vec<NodeId>,
    unroll: Vec<u32>,
    rotations: Vec<Rotation>,
}

impl<'k> Program<'k> {
    /// Build the program tree, unrolling each loop by its requested factor
    /// (or `default_unroll`), reduced to a legal factor.
    pub fn build(kernel: &'k Kernel, default_unroll: u32) -> Result<Self, SyncError> {
        let tree = kernel.loop_tree()?;
        let loop_ix = |id: &LoopId| kernel.loops().iter().position(|l| &l.id == id);

        // Rotation loop: longest common loop prefix of the accesses made
        // inside some loop.
        let mut prefixes: Vec<Option<SmallVec<[LoopId; 3]>>> = vec![None; kernel.resources().len()];
        for op in kernel.operations().iter().filter(|op| !op.loops.is_empty()) {
            for &r in op.reads.iter().chain(op.writes.iter()) {
                let slot = &mut prefixes[r.index()];
                *slot = Some(match slot.take() {
                    None => op.loops.clone(),
                    Some(prev) => prev
                        .iter()
                        .zip(op.loops.iter())
                        .take_while(|(a, b)| a == b)
                        .map(|(a, _)| a.clone())
                        .collect(),
                });
            }
        }
        let rotation_loops: Vec<Option<usize>> = kernel
            .resources()
            .iter()
            .map(|(r, res)| match &res.rotate_in {
                Some(id) => loop_ix(id),
                None => prefixes[r.index()]
                    .as_ref()
                    .and_then(|p| p.last())
                    .and_then(|id| loop_ix(id)),
            })
            .collect();

        let mut unroll = Vec::with_capacity(kernel.loops().len());
        for (ix, spec) in kernel.loops().iter().enumerate() {
            let requested = spec.unroll.unwrap_or(default_unroll).max(1);
            let widths: Vec<u8> = kernel
                .resources()
                .iter()
                .filter(|(r, _)| rotation_loops[r.index()] == Some(ix))
                .map(|(_, res)| res.width.get())
                .collect();
            let factor = unroll::choose_factor(requested, &spec.trip, &widths);
            if factor < requested {
                warn!(
                    "loop '{}': unroll {} reduced to {} (trip {}, widths {:?})",
                    spec.id, requested, factor, spec.trip, widths
                );
            }
            unroll.push(factor);
        }

        let rotations = kernel
            .resources()
            .iter()
            .map(|(r, res)| {
                let loop_ix = rotation_loops[r.index()];
                Rotation {
                    width: res.width,
                    loop_ix,
                    stride: loop_ix.map(|ix| unroll[ix]).unwrap_or(1),
                    external: res.external,
                }
            })
            .collect();

        let mut program = Program {
            kernel,
            nodes: Vec::new(),
            root: Vec::new(),
            unroll,
            rotations,
        };
        let replicas = Replicas::new();
        let root = program.lower_body(&tree, None, &replicas)?;
        program.root = root;
        debug!(
            "program '{}': {} nodes, unroll {:?}",
            kernel.name,
            program.nodes.len(),
            program.unroll
        );
        Ok(program)
    }

    fn lower_body(
        &mut self,
        items: &[KernelItem],
        parent: Option<NodeId>,
        replicas: &Replicas,
    ) -> Result<Vec<NodeId>, SyncError> {
        items
            .iter()
            .enumerate()
            .map(|(index, item)| self.lower_item(item, parent, index, replicas))
            .collect()
    }

    fn lower_item(
        &mut self,
        item: &KernelItem,
        parent: Option<NodeId>,
        index: usize,
        replicas: &Replicas,
    ) -> Result<NodeId, SyncError> {
        match item {
            KernelItem::Op(op) => Ok(self.push_node(ProgramNode {
                parent,
                index,
                kind: NodeKind::Op(OpNode {
                    op: *op,
                    lane: self.kernel.operation(*op).lane(),
                    replicas: replicas.clone(),
                }),
            })),
            KernelItem::Loop { id, body } => {
                let Some(loop_ix) = self.kernel.loops().iter().position(|l| &l.id == id) else {
                    return Err(SyncError::MalformedLoopNest {
                        reason: format!("loop '{}' is not declared", id),
                        position: self.nested_position(parent, body),
                    });
                };
                let factor = self.unroll[loop_ix];
                let trip = self.kernel.loops()[loop_ix].trip.batched(factor);
                let id = self.push_node(ProgramNode {
                    parent,
                    index,
                    kind: NodeKind::Loop(LoopNode {
                        loop_ix,
                        trip,
                        unroll: factor,
                        body: Vec::new(),
                        replicas: replicas.clone(),
                    }),
                });

                let summaries: Vec<ItemSummary> =
                    body.iter().map(|i| ItemSummary::of(self.kernel, i)).collect();
                let rotations = &self.rotations;
                let order = unroll::replica_order(&summaries, factor, |r, j, k| {
                    let rot = rotations[r.index()];
                    if rot.loop_ix == Some(loop_ix) {
                        (j as i64 - k as i64).rem_euclid(rot.width.get() as i64) == 0
                    } else {
                        true
                    }
                });

                let mut children = Vec::with_capacity(order.len());
                for (position, (item_ix, replica)) in order.into_iter().enumerate() {
                    let mut inner = replicas.clone();
                    if factor > 1 {
                        inner.push((loop_ix, replica));
                    }
                    children.push(self.lower_item(&body[item_ix], Some(id), position, &inner)?);
                }
                if let NodeKind::Loop(l) = &mut self.nodes[id.index()].kind {
                    l.body = children;
                }
                Ok(id)
            }
            KernelItem::Branch { id, arms, exhaustive } => {
                let Some(branch_ix) = self.kernel.branches().iter().position(|b| &b.id == id) else {
                    return Err(SyncError::UnknownBranch {
                        name: id.0.clone(),
                        position: self.nested_position(parent, &[]),
                    });
                };
                let branch = self.push_node(ProgramNode {
                    parent,
                    index,
                    kind: NodeKind::Branch(BranchNode {
                        branch_ix,
                        exhaustive: *exhaustive,
                        arms: Vec::new(),
                        replicas: replicas.clone(),
                    }),
                });
                let mut arm_nodes = Vec::with_capacity(arms.len());
                for (arm, ops) in arms.iter().enumerate() {
                    let arm_id = self.push_node(ProgramNode {
                        parent: Some(branch),
                        index: arm,
                        kind: NodeKind::Arm(ArmNode {
                            arm: arm as u32,
                            body: Vec::new(),
                        }),
                    });
                    let items: Vec<KernelItem> = ops.iter().map(|&op| KernelItem::Op(op)).collect();
                    let body = self.lower_body(&items, Some(arm_id), replicas)?;
                    if let NodeKind::Arm(a) = &mut self.nodes[arm_id.index()].kind {
                        a.body = body;
                    }
                    arm_nodes.push(arm_id);
                }
                if let NodeKind::Branch(b) = &mut self.nodes[branch.index()].kind {
                    b.arms = arm_nodes;
                }
                Ok(branch)
            }
        }
    }

    /// Position reported for an item that could not be lowered: its first
    /// operation if it has one, else the enclosing node's.
    fn nested_position(&self, parent: Option<NodeId>, body: &[KernelItem]) -> Position {
        let first = body.iter().find_map(|item| match item {
            KernelItem::Op(op) => Some(*op),
            _ => None,
        });
        match (first, parent) {
            (Some(op), _) => self.kernel.position(op),
            (None, Some(p)) => self.position(p),
            (None, None) => Position::default(),
        }
    }

    fn push_node(&mut self, node: ProgramNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn kernel(&self) -> &'k Kernel {
        self.kernel
    }

    pub fn nodes(&self) -> &[ProgramNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &ProgramNode {
        &self.nodes[id.index()]
    }

    pub fn root(&self) -> &[NodeId] {
        &self.root
    }

    /// Children of a scope: a loop's or an arm's body, or the root list for
    /// `None`.
    pub fn body(&self, scope: Option<NodeId>) -> &[NodeId] {
        match scope {
            None => &self.root,
            Some(id) => match &self.nodes[id.index()].kind {
                NodeKind::Loop(l) => &l.body,
                NodeKind::Arm(a) => &a.body,
                NodeKind::Op(_) | NodeKind::Branch(_) => &[],
            },
        }
    }

    pub fn as_loop(&self, id: NodeId) -> Option<&LoopNode> {
        match &self.nodes[id.index()].kind {
            NodeKind::Loop(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_op(&self, id: NodeId) -> Option<&OpNode> {
        match &self.nodes[id.index()].kind {
            NodeKind::Op(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_branch(&self, id: NodeId) -> Option<&BranchNode> {
        match &self.nodes[id.index()].kind {
            NodeKind::Branch(b) => Some(b),
            _ => None,
        }
    }

    /// Outermost ancestor of a node (the node itself at top level).
    pub fn root_ancestor(&self, id: NodeId) -> NodeId {
        let mut cursor = id;
        while let Some(parent) = self.nodes[cursor.index()].parent {
            cursor = parent;
        }
        cursor
    }

    /// Whether `node` is `ancestor` or nested inside it.
    pub fn is_within(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            if id == ancestor {
                return true;
            }
            cursor = self.nodes[id.index()].parent;
        }
        false
    }

    pub fn loop_id(&self, loop_ix: usize) -> &LoopId {
        &self.kernel.loops()[loop_ix].id
    }

    pub fn loop_count(&self) -> usize {
        self.kernel.loops().len()
    }

    /// Chosen unroll factor of a declared loop.
    pub fn unroll_of(&self, loop_ix: usize) -> u32 {
        self.unroll[loop_ix]
    }

    pub fn rotation(&self, resource: ResourceId) -> &Rotation {
        &self.rotations[resource.index()]
    }

    pub fn rotations(&self) -> &[Rotation] {
        &self.rotations
    }

    /// First operation of a subtree, in program order.
    pub fn first_op(&self, id: NodeId) -> usize {
        let mut cursor = id;
        loop {
            match &self.nodes[cursor.index()].kind {
                NodeKind::Op(op) => return op.op,
                NodeKind::Loop(l) => match l.body.first() {
                    Some(&first) => cursor = first,
                    None => return 0,
                },
                NodeKind::Arm(a) => match a.body.first() {
                    Some(&first) => cursor = first,
                    None => return 0,
                },
                NodeKind::Branch(b) => {
                    let filled = b.arms.iter().copied().find(|&arm| !self.body(Some(arm)).is_empty());
                    match filled {
                        Some(arm) => cursor = arm,
                        None => return 0,
                    }
                }
            }
        }
    }

    /// Static position of a node: its first operation plus the loop path,
    /// with replica coordinates of unrolled loops.
    pub fn position(&self, id: NodeId) -> Position {
        let op = self.first_op(id);
        let replicas: &[(usize, u32)] = match &self.nodes[id.index()].kind {
            NodeKind::Op(o) => &o.replicas,
            NodeKind::Loop(l) => &l.replicas,
            NodeKind::Branch(b) => &b.replicas,
            NodeKind::Arm(_) => match self.nodes[id.index()].parent.and_then(|p| self.as_branch(p)) {
                Some(b) => &b.replicas,
                None => &[],
            },
        };
        let mut path = Vec::new();
        let mut cursor = self.nodes[id.index()].parent;
        while let Some(p) = cursor {
            if let Some(l) = self.as_loop(p) {
                path.push(LoopFrame {
                    id: self.loop_id(l.loop_ix).clone(),
                    replica: replicas
                        .iter()
                        .find(|(ix, _)| *ix == l.loop_ix)
                        .map(|(_, r)| *r),
                    iteration: None,
                });
            }
            cursor = self.nodes[p.index()].parent;
        }
        path.reverse();
        Position { op, path }
    }

    /// Ids of all operation nodes, in program order.
    pub fn op_nodes(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_ops(&self.root, &mut out);
        out
    }

    fn collect_ops(&self, body: &[NodeId], out: &mut Vec<NodeId>) {
        for &id in body {
            match &self.nodes[id.index()].kind {
                NodeKind::Op(_) => out.push(id),
                NodeKind::Loop(l) => self.collect_ops(&l.body, out),
                NodeKind::Branch(b) => self.collect_ops(&b.arms, out),
                NodeKind::Arm(a) => self.collect_ops(&a.body, out),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LoopSpec, Operation};
    use crate::target::ExecutionUnit;

    fn two_stage(width: u8, trip: u64, unroll: u32) -> Kernel {
        let mut kernel = Kernel::new("two_stage");
        kernel
            .add_loop(LoopSpec::new("i", TripCount::Known(trip)).unrolled(unroll))
            .unwrap();
        let a = kernel.buffer("a", width).unwrap();
        kernel.push(Operation::new("p", ExecutionUnit::Load).writes(&[a]).in_loops(&["i"]));
        kernel.push(Operation::new("c", ExecutionUnit::Compute).reads(&[a]).in_loops(&["i"]));
        kernel
    }

    fn op_names(program: &Program) -> Vec<String> {
        program
            .op_nodes()
            .into_iter()
            .map(|id| {
                let op = program.as_op(id).unwrap();
                let replica = op.replicas.first().map(|(_, r)| *r).unwrap_or(0);
                format!("{}{}", program.kernel().operation(op.op).name, replica)
            })
            .collect()
    }

    #[test]
    fn test_rotation_loop_resolution() {
        let kernel = two_stage(2, 4, 1);
        let program = Program::build(&kernel, 1).unwrap();
        let rot = program.rotation(ResourceId(0));
        assert_eq!(rot.loop_ix, Some(0));
        assert_eq!(rot.stride, 1);
        assert_eq!(rot.period_at(0), 2);
    }

    #[test]
    fn test_unroll_groups_same_unit() {
        let kernel = two_stage(2, 4, 2);
        let program = Program::build(&kernel, 1).unwrap();
        assert_eq!(program.unroll_of(0), 2);
        assert_eq!(op_names(&program), vec!["p0", "p1", "c0", "c1"]);
        let l = program.as_loop(program.root()[0]).unwrap();
        assert_eq!(l.trip, TripCount::Known(2));
        assert_eq!(program.rotation(ResourceId(0)).period_at(0), 1);
    }

    #[test]
    fn test_unroll_collapses_single_buffer() {
        let kernel = two_stage(1, 5, 5);
        let program = Program::build(&kernel, 1).unwrap();
        assert_eq!(program.unroll_of(0), 5);
        assert_eq!(
            op_names(&program),
            vec!["p0", "c0", "p1", "c1", "p2", "c2", "p3", "c3", "p4", "c4"]
        );
    }

    #[test]
    fn test_unroll_reduced() {
        // Trip 6 and width 4: 3 does not divide into 4, 2 does.
        let kernel = two_stage(4, 6, 3);
        let program = Program::build(&kernel, 1).unwrap();
        assert_eq!(program.unroll_of(0), 2);
    }

    #[test]
    fn test_slot_formula() {
        let kernel = two_stage(2, 4, 2);
        let program = Program::build(&kernel, 1).unwrap();
        let rot = *program.rotation(ResourceId(0));
        let mut counters = FlatCounters::new(1);
        counters.begin_iteration(0);
        assert_eq!(rot.slot(&counters, &[(0, 0)]), 0);
        assert_eq!(rot.slot(&counters, &[(0, 1)]), 1);
        counters.begin_iteration(0);
        assert_eq!(rot.slot(&counters, &[(0, 1)]), 1);
    }

    #[test]
    fn test_init_write_outside_loop_keeps_rotation() {
        let mut kernel = Kernel::new("init");
        kernel.add_loop(LoopSpec::new("i", TripCount::Known(4))).unwrap();
        let a = kernel.buffer("a", 2).unwrap();
        kernel.push(Operation::new("init", ExecutionUnit::Load).writes(&[a]));
        kernel.push(Operation::new("p", ExecutionUnit::Load).writes(&[a]).in_loops(&["i"]));
        kernel.push(Operation::new("c", ExecutionUnit::Compute).reads(&[a]).in_loops(&["i"]));

        let program = Program::build(&kernel, 1).unwrap();
        let rot = program.rotation(a);
        assert_eq!(rot.loop_ix, Some(0));
        assert_eq!(rot.period_at(0), 2);
        // Before the loop starts the pointer sits on slot 0.
        assert_eq!(rot.slot(&FlatCounters::new(1), &[]), 0);
    }

    #[test]
    fn test_declared_rotation_loop() {
        let mut kernel = Kernel::new("declared");
        kernel.add_loop(LoopSpec::new("m", TripCount::Known(2))).unwrap();
        kernel.add_loop(LoopSpec::new("k", TripCount::Known(3))).unwrap();
        let acc = kernel
            .add_resource(crate::model::BufferResource::new("acc", RotationWidth::DOUBLE).rotating_in("m"))
            .unwrap();
        kernel.push(Operation::new("mm", ExecutionUnit::Compute).writes(&[acc]).in_loops(&["m", "k"]));
        kernel.push(Operation::new("fix", ExecutionUnit::Fixpipe).reads(&[acc]).in_loops(&["m"]));
        let program = Program::build(&kernel, 1).unwrap();
        assert_eq!(program.rotation(acc).loop_ix, Some(0));
    }

    #[test]
    fn test_undeclared_loop_item_is_rejected() {
        let kernel = two_stage(2, 4, 1);
        let mut program = Program::build(&kernel, 1).unwrap();
        let ghost = KernelItem::Loop {
            id: LoopId::from("ghost"),
            body: vec![KernelItem::Op(1)],
        };
        let err = program.lower_item(&ghost, None, 0, &Replicas::new()).unwrap_err();
        match err {
            SyncError::MalformedLoopNest { reason, position } => {
                assert!(reason.contains("ghost"));
                assert_eq!(position.op, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_branch_lowering() {
        let mut kernel = two_stage(2, 4, 2);
        kernel.add_branch(crate::model::BranchSpec::new("tail", 2)).unwrap();
        let a = ResourceId(0);
        kernel.push(
            Operation::new("t0", ExecutionUnit::Compute)
                .reads(&[a])
                .in_loops(&["i"])
                .in_arm("tail", 0),
        );
        kernel.push(
            Operation::new("t1", ExecutionUnit::Vector)
                .reads(&[a])
                .in_loops(&["i"])
                .in_arm("tail", 1),
        );
        let program = Program::build(&kernel, 1).unwrap();
        // The chain is one item, so it is replicated with the loop body.
        let names = op_names(&program);
        assert_eq!(names.len(), 8);
        let branch = program
            .nodes()
            .iter()
            .position(|n| matches!(n.kind, NodeKind::Branch(_)))
            .map(|i| NodeId(i as u32))
            .unwrap();
        let b = program.as_branch(branch).unwrap();
        assert_eq!(b.arms.len(), 2);
        assert!(!b.exhaustive);
        assert_eq!(program.first_op(branch), 2);
        assert_eq!(program.root_ancestor(branch), program.root()[0]);
        let arm1 = b.arms[1];
        assert_eq!(program.first_op(program.body(Some(arm1))[0]), 3);
    }

    #[test]
    fn test_positions() {
        let kernel = two_stage(2, 4, 2);
        let program = Program::build(&kernel, 1).unwrap();
        let ops = program.op_nodes();
        let pos = program.position(ops[1]);
        assert_eq!(pos.op, 0);
        assert_eq!(pos.to_string(), "op #0 in i#1");
        assert!(program.is_within(ops[1], program.root()[0]));
        assert!(!program.is_within(program.root()[0], ops[1]));
    }
}
