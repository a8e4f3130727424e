//! Kernel: resources, loops and the flat operation list.
//!
//! Operations are stored flat in issue order, each carrying its enclosing
//! loop path and, optionally, the arm of a conditional chain that guards it.
//! [`Kernel::loop_tree`] rebuilds the nest and rejects paths that reopen a
//! loop or a chain after it was closed.
//!
//! # Usage
//!
//! ```ignore
//! let mut kernel = Kernel::new("copy");
//! kernel.add_loop(LoopSpec::new("i", TripCount::Known(4)))?;
//! let a = kernel.buffer("a", 2)?;
//! kernel.push(Operation::new("load", ExecutionUnit::Load).writes(&[a]).in_loops(&["i"]));
//! kernel.push(Operation::new("use", ExecutionUnit::Compute).reads(&[a]).in_loops(&["i"]));
//! let tree = kernel.loop_tree()?;
//! ```

use super::operation::{BranchId, BranchSpec, LoopId, LoopSpec, Operation, Position};
use super::resource::{BufferResource, ResourceId, ResourceTable, RotationWidth};
use crate::error::SyncError;
use crate::target::Lane;
use std::collections::HashSet;
use std::ops::RangeInclusive;

/// Node of the reconstructed loop nest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelItem {
    /// Index into the operation list.
    Op(usize),
    Loop { id: LoopId, body: Vec<KernelItem> },
    /// Conditional chain; each arm is a straight run of operations.
    Branch {
        id: BranchId,
        arms: Vec<Vec<usize>>,
        exhaustive: bool,
    },
}

/// An event the kernel author synchronizes by hand. Its identity is kept
/// out of the pool the planner allocates from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEvent {
    pub name: String,
    pub producer: Lane,
    pub consumer: Lane,
    pub id: u8,
}

/// A kernel to be synchronized.
#[derive(Debug, Clone, Default)]
pub struct Kernel {
    pub name: String,
    resources: ResourceTable,
    loops: Vec<LoopSpec>,
    branches: Vec<BranchSpec>,
    operations: Vec<Operation>,
    /// Op index ranges synchronized automatically. Empty means all ops.
    regions: Vec<RangeInclusive<usize>>,
    user_events: Vec<UserEvent>,
}

impl Kernel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Declare a resource.
    pub fn add_resource(&mut self, resource: BufferResource) -> Result<ResourceId, SyncError> {
        self.resources.add(resource)
    }

    /// Declare a resource visible to every unit.
    pub fn buffer(&mut self, name: &str, width: u8) -> Result<ResourceId, SyncError> {
        self.add_resource(BufferResource::new(name, RotationWidth::new(width)?))
    }

    /// Declare a loop. Ids must be unique.
    pub fn add_loop(&mut self, spec: LoopSpec) -> Result<(), SyncError> {
        if self.loop_spec(&spec.id).is_some() {
            return Err(SyncError::DuplicateName {
                what: "loop",
                name: spec.id.0,
            });
        }
        self.loops.push(spec);
        Ok(())
    }

    /// Declare a conditional chain. Ids must be unique and a chain needs
    /// at least one arm.
    pub fn add_branch(&mut self, spec: BranchSpec) -> Result<(), SyncError> {
        if self.branch_spec(&spec.id).is_some() {
            return Err(SyncError::DuplicateName {
                what: "branch",
                name: spec.id.0,
            });
        }
        if spec.arms == 0 {
            return Err(SyncError::MalformedLoopNest {
                reason: format!("branch '{}' has no arms", spec.id),
                position: Position::default(),
            });
        }
        self.branches.push(spec);
        Ok(())
    }

    /// Synchronize ops `first..=last` automatically. Once any region is
    /// declared, ops outside every region are left to the author.
    pub fn sync_region(&mut self, first: usize, last: usize) {
        self.regions.push(first..=last);
    }

    /// Keep an event identity for hand-written synchronization.
    pub fn reserve_event(&mut self, event: UserEvent) -> Result<(), SyncError> {
        if self.user_events.iter().any(|e| e.name == event.name) {
            return Err(SyncError::DuplicateName {
                what: "event",
                name: event.name,
            });
        }
        self.user_events.push(event);
        Ok(())
    }

    /// Append an operation; returns its index.
    pub fn push(&mut self, op: Operation) -> usize {
        self.operations.push(op);
        self.operations.len() - 1
    }

    pub fn resources(&self) -> &ResourceTable {
        &self.resources
    }

    pub fn loops(&self) -> &[LoopSpec] {
        &self.loops
    }

    pub fn branches(&self) -> &[BranchSpec] {
        &self.branches
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn operation(&self, index: usize) -> &Operation {
        &self.operations[index]
    }

    pub fn user_events(&self) -> &[UserEvent] {
        &self.user_events
    }

    pub fn loop_spec(&self, id: &LoopId) -> Option<&LoopSpec> {
        self.loops.iter().find(|l| &l.id == id)
    }

    pub fn branch_spec(&self, id: &BranchId) -> Option<&BranchSpec> {
        self.branches.iter().find(|b| &b.id == id)
    }

    /// Sync region of an operation; `None` when the author synchronizes
    /// it by hand.
    pub fn region_of(&self, op: usize) -> Option<usize> {
        if self.regions.is_empty() {
            return Some(0);
        }
        self.regions.iter().position(|r| r.contains(&op))
    }

    /// Static position of an operation.
    pub fn position(&self, index: usize) -> Position {
        Position::with_loops(index, &self.operations[index].loops)
    }

    /// Check declared loops, branches, resource ids, unit visibility and
    /// sync regions.
    pub fn validate(&self) -> Result<(), SyncError> {
        for (index, op) in self.operations.iter().enumerate() {
            for id in &op.loops {
                if self.loop_spec(id).is_none() {
                    return Err(SyncError::UnknownLoop {
                        name: id.0.clone(),
                        position: self.position(index),
                    });
                }
            }
            if let Some(arm) = &op.arm {
                let Some(spec) = self.branch_spec(&arm.branch) else {
                    return Err(SyncError::UnknownBranch {
                        name: arm.branch.0.clone(),
                        position: self.position(index),
                    });
                };
                if arm.arm >= spec.arms {
                    return Err(SyncError::MalformedLoopNest {
                        reason: format!("branch '{}' has no arm {}", spec.id, arm.arm),
                        position: self.position(index),
                    });
                }
            }
            for &resource in op.reads.iter().chain(op.writes.iter()) {
                if resource.index() >= self.resources.len() {
                    return Err(SyncError::UnknownResource {
                        name: format!("#{}", resource.0),
                        position: self.position(index),
                    });
                }
                let buffer = self.resources.get(resource);
                if !buffer.is_visible(op.unit) {
                    return Err(SyncError::InvisibleResource {
                        resource: buffer.name.clone(),
                        unit: op.unit,
                        position: self.position(index),
                    });
                }
            }
        }
        for (_, buffer) in self.resources.iter() {
            if let Some(id) = &buffer.rotate_in {
                if self.loop_spec(id).is_none() {
                    return Err(SyncError::UnknownLoop {
                        name: id.0.clone(),
                        position: Position::default(),
                    });
                }
            }
        }
        self.validate_regions()
    }

    fn validate_regions(&self) -> Result<(), SyncError> {
        let mut sorted: Vec<&RangeInclusive<usize>> = self.regions.iter().collect();
        sorted.sort_by_key(|r| *r.start());
        let mut end: Option<usize> = None;
        for region in sorted {
            let (first, last) = (*region.start(), *region.end());
            let problem = if first > last {
                Some("region ends before it starts".to_string())
            } else if last >= self.operations.len() {
                Some(format!("region ends past the last op #{}", self.operations.len().saturating_sub(1)))
            } else if end.is_some_and(|e| first <= e) {
                Some("regions overlap".to_string())
            } else {
                None
            };
            if let Some(reason) = problem {
                return Err(SyncError::InvalidRegion {
                    reason,
                    position: Position::op(first),
                });
            }
            end = Some(last);
        }
        Ok(())
    }

    /// Validate, then rebuild the loop nest from the operations' loop paths.
    ///
    /// Operations of one loop must be contiguous and a loop may appear only
    /// once along a path. The same holds for a conditional chain, whose
    /// operations must also share one loop path and list their arms in order.
    pub fn loop_tree(&self) -> Result<Vec<KernelItem>, SyncError> {
        self.validate()?;

        let mut root = Vec::new();
        let mut stack: Vec<(LoopId, Vec<KernelItem>)> = Vec::new();
        let mut closed: HashSet<LoopId> = HashSet::new();
        let mut chains: HashSet<BranchId> = HashSet::new();

        for (index, op) in self.operations.iter().enumerate() {
            let common = stack
                .iter()
                .zip(op.loops.iter())
                .take_while(|((open, _), id)| open == *id)
                .count();
            while stack.len() > common {
                if let Some((id, body)) = stack.pop() {
                    close_loop(&mut stack, &mut root, &mut closed, id, body);
                }
            }
            for id in &op.loops[common..] {
                if closed.contains(id) {
                    return Err(SyncError::MalformedLoopNest {
                        reason: format!("loop '{}' is reopened after it was closed", id),
                        position: self.position(index),
                    });
                }
                if stack.iter().any(|(open, _)| open == id) {
                    return Err(SyncError::MalformedLoopNest {
                        reason: format!("loop '{}' is nested inside itself", id),
                        position: self.position(index),
                    });
                }
                stack.push((id.clone(), Vec::new()));
            }
            let body = match stack.last_mut() {
                Some((_, body)) => body,
                None => &mut root,
            };
            let Some(arm) = &op.arm else {
                body.push(KernelItem::Op(index));
                continue;
            };

            let continues = matches!(body.last(), Some(KernelItem::Branch { id, .. }) if id == &arm.branch);
            if !continues {
                if !chains.insert(arm.branch.clone()) {
                    return Err(SyncError::MalformedLoopNest {
                        reason: format!("branch '{}' is reopened after it was closed", arm.branch),
                        position: self.position(index),
                    });
                }
                let (count, exhaustive) = self
                    .branch_spec(&arm.branch)
                    .map_or((arm.arm + 1, false), |b| (b.arms, b.exhaustive));
                body.push(KernelItem::Branch {
                    id: arm.branch.clone(),
                    arms: vec![Vec::new(); count as usize],
                    exhaustive,
                });
            }
            if let Some(KernelItem::Branch { arms, .. }) = body.last_mut() {
                let latest = arms.iter().rposition(|a| !a.is_empty());
                if let Some(latest) = latest.filter(|&l| l > arm.arm as usize) {
                    return Err(SyncError::MalformedLoopNest {
                        reason: format!("arm {} of '{}' follows arm {}", arm.arm, arm.branch, latest),
                        position: self.position(index),
                    });
                }
                if let Some(ops) = arms.get_mut(arm.arm as usize) {
                    ops.push(index);
                }
            }
        }
        while let Some((id, body)) = stack.pop() {
            close_loop(&mut stack, &mut root, &mut closed, id, body);
        }
        Ok(root)
    }
}

fn close_loop(
    stack: &mut [(LoopId, Vec<KernelItem>)],
    root: &mut Vec<KernelItem>,
    closed: &mut HashSet<LoopId>,
    id: LoopId,
    body: Vec<KernelItem>,
) {
    closed.insert(id.clone());
    let item = KernelItem::Loop { id, body };
    match stack.last_mut() {
        Some((_, parent)) => parent.push(item),
        None => root.push(item),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TripCount;
    use crate::target::ExecutionUnit;

    fn nested_kernel() -> Kernel {
        let mut kernel = Kernel::new("nested");
        kernel.add_loop(LoopSpec::new("m", TripCount::Known(2))).unwrap();
        kernel.add_loop(LoopSpec::new("k", TripCount::Known(3))).unwrap();
        let a = kernel.buffer("a", 2).unwrap();
        let c = kernel.buffer("c", 1).unwrap();
        kernel.push(Operation::new("ld", ExecutionUnit::Load).writes(&[a]).in_loops(&["m", "k"]));
        kernel.push(
            Operation::new("mm", ExecutionUnit::Compute)
                .reads(&[a])
                .writes(&[c])
                .in_loops(&["m", "k"]),
        );
        kernel.push(Operation::new("fix", ExecutionUnit::Fixpipe).reads(&[c]).in_loops(&["m"]));
        kernel
    }

    #[test]
    fn test_loop_tree() {
        let tree = nested_kernel().loop_tree().unwrap();
        assert_eq!(
            tree,
            vec![KernelItem::Loop {
                id: LoopId::from("m"),
                body: vec![
                    KernelItem::Loop {
                        id: LoopId::from("k"),
                        body: vec![KernelItem::Op(0), KernelItem::Op(1)],
                    },
                    KernelItem::Op(2),
                ],
            }]
        );
    }

    #[test]
    fn test_reopened_loop() {
        let mut kernel = nested_kernel();
        kernel.push(Operation::new("late", ExecutionUnit::Load).in_loops(&["m", "k"]));
        let err = kernel.loop_tree().unwrap_err();
        assert!(matches!(err, SyncError::MalformedLoopNest { .. }));
        assert_eq!(err.position().map(|p| p.op), Some(3));
    }

    #[test]
    fn test_unknown_loop() {
        let mut kernel = Kernel::new("bad");
        kernel.push(Operation::new("x", ExecutionUnit::Load).in_loops(&["nope"]));
        assert!(matches!(
            kernel.validate(),
            Err(SyncError::UnknownLoop { .. })
        ));
    }

    #[test]
    fn test_invisible_resource() {
        let mut kernel = Kernel::new("vis");
        let l0 = kernel
            .add_resource(
                BufferResource::new("l0a", RotationWidth::DOUBLE)
                    .visible_to(&[ExecutionUnit::Transform, ExecutionUnit::Compute]),
            )
            .unwrap();
        kernel.push(Operation::new("v", ExecutionUnit::Vector).reads(&[l0]));
        match kernel.validate() {
            Err(SyncError::InvisibleResource { resource, unit, .. }) => {
                assert_eq!(resource, "l0a");
                assert_eq!(unit, ExecutionUnit::Vector);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_branch_tree() {
        let mut kernel = Kernel::new("tail");
        kernel.add_loop(LoopSpec::new("i", TripCount::Known(2))).unwrap();
        kernel.add_branch(BranchSpec::new("edge", 2).with_else()).unwrap();
        let a = kernel.buffer("a", 1).unwrap();
        kernel.push(Operation::new("ld", ExecutionUnit::Load).writes(&[a]).in_loops(&["i"]));
        kernel.push(Operation::new("full", ExecutionUnit::Compute).reads(&[a]).in_loops(&["i"]).in_arm("edge", 0));
        kernel.push(Operation::new("part", ExecutionUnit::Compute).reads(&[a]).in_loops(&["i"]).in_arm("edge", 1));
        kernel.push(Operation::new("fix", ExecutionUnit::Fixpipe).in_loops(&["i"]));

        let tree = kernel.loop_tree().unwrap();
        assert_eq!(
            tree,
            vec![KernelItem::Loop {
                id: LoopId::from("i"),
                body: vec![
                    KernelItem::Op(0),
                    KernelItem::Branch {
                        id: BranchId::from("edge"),
                        arms: vec![vec![1], vec![2]],
                        exhaustive: true,
                    },
                    KernelItem::Op(3),
                ],
            }]
        );
    }

    #[test]
    fn test_branch_reopened_or_out_of_order() {
        let mut kernel = Kernel::new("bad");
        kernel.add_branch(BranchSpec::new("c", 2)).unwrap();
        kernel.push(Operation::new("x", ExecutionUnit::Load).in_arm("c", 0));
        kernel.push(Operation::new("y", ExecutionUnit::Load));
        kernel.push(Operation::new("z", ExecutionUnit::Load).in_arm("c", 1));
        let err = kernel.loop_tree().unwrap_err();
        assert!(matches!(err, SyncError::MalformedLoopNest { ref reason, .. } if reason.contains("reopened")));

        let mut kernel = Kernel::new("order");
        kernel.add_branch(BranchSpec::new("c", 2)).unwrap();
        kernel.push(Operation::new("x", ExecutionUnit::Load).in_arm("c", 1));
        kernel.push(Operation::new("y", ExecutionUnit::Load).in_arm("c", 0));
        let err = kernel.loop_tree().unwrap_err();
        assert_eq!(err.position().map(|p| p.op), Some(1));

        let mut kernel = Kernel::new("ghost");
        kernel.push(Operation::new("x", ExecutionUnit::Load).in_arm("nope", 0));
        assert!(matches!(kernel.validate(), Err(SyncError::UnknownBranch { .. })));
    }

    #[test]
    fn test_sync_regions() {
        let mut kernel = nested_kernel();
        assert_eq!(kernel.region_of(2), Some(0));
        kernel.sync_region(0, 1);
        assert_eq!(kernel.region_of(1), Some(0));
        assert_eq!(kernel.region_of(2), None);
        assert!(kernel.validate().is_ok());

        kernel.sync_region(1, 2);
        assert!(matches!(kernel.validate(), Err(SyncError::InvalidRegion { .. })));
    }

    #[test]
    fn test_rotate_in_must_name_a_loop() {
        let mut kernel = Kernel::new("rot");
        kernel
            .add_resource(BufferResource::new("a", RotationWidth::DOUBLE).rotating_in("k"))
            .unwrap();
        assert!(matches!(kernel.validate(), Err(SyncError::UnknownLoop { ref name, .. }) if name == "k"));
    }

    #[test]
    fn test_reserve_event_names_unique() {
        let mut kernel = Kernel::new("user");
        let event = UserEvent {
            name: "host".into(),
            producer: Lane::home(ExecutionUnit::Load),
            consumer: Lane::home(ExecutionUnit::Compute),
            id: 0,
        };
        kernel.reserve_event(event.clone()).unwrap();
        assert!(matches!(kernel.reserve_event(event), Err(SyncError::DuplicateName { what: "event", .. })));
        assert_eq!(kernel.user_events().len(), 1);
    }

    #[test]
    fn test_duplicate_loop() {
        let mut kernel = Kernel::new("dup");
        kernel.add_loop(LoopSpec::new("i", TripCount::Known(1))).unwrap();
        assert!(kernel.add_loop(LoopSpec::new("i", TripCount::Known(2))).is_err());
    }
}
