//! Plan verification.
//!
//! Re-runs a finished plan lane by lane and rejects it if any lane could
//! block forever, reuse an event identity too early, or touch a buffer
//! slot without being ordered against the other lanes using it.
//!
//! - [`linearize`]: per-lane instruction streams with concrete trip counts
//! - [`checker`]: vector-clock simulation producing [`Violation`](crate::error::Violation)s
//! - [`deadlock`]: wait-for cycle detection for stuck states
//! - [`stats`]: per-event counters from the simulation

pub mod checker;
pub mod deadlock;
pub mod linearize;
pub mod stats;

pub use checker::{PlanVerifier, VerifyOptions};
pub use deadlock::{DeadlockCycle, DeadlockDetector};
pub use linearize::{linearize, ArmChoice, LaneStream, Step, StepKind, TripAssignment};
pub use stats::{AggregateStats, PlanStats, TargetStats};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SyncError, ViolationKind};
    use crate::model::{BranchSpec, BufferResource, Kernel, LoopSpec, Operation, RotationWidth, TripCount};
    use crate::schedule::plan::{PlanNode, SyncAction, SynchronizationPlan};
    use crate::schedule::Scheduler;
    use crate::target::ExecutionUnit;

    /// load writes `a`, compute reads it; one event e0.
    fn straight_line() -> SynchronizationPlan {
        let mut kernel = Kernel::new("line");
        let a = kernel.buffer("a", 1).unwrap();
        kernel.push(Operation::new("p", ExecutionUnit::Load).writes(&[a]));
        kernel.push(Operation::new("c", ExecutionUnit::Compute).reads(&[a]));
        Scheduler::default().schedule(&kernel).unwrap().plan
    }

    fn without(plan: &mut SynchronizationPlan, action: SyncAction) {
        plan.body
            .retain(|n| !matches!(n, PlanNode::Sync(s) if s.action == action));
    }

    fn violation(plan: &SynchronizationPlan) -> ViolationKind {
        match PlanVerifier::default().verify(plan) {
            Err(SyncError::Verification(v)) => v.kind,
            other => panic!("expected a violation, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_plan_passes() {
        let stats = PlanVerifier::default().verify(&straight_line()).unwrap();
        assert_eq!(stats.runs, 1);
        assert_eq!(stats.op_instances, 2);
        assert_eq!(stats.aggregate().total_signals, 1);
        assert_eq!(stats.aggregate().total_waits, 1);
    }

    #[test]
    fn test_missing_wait() {
        let mut plan = straight_line();
        without(&mut plan, SyncAction::Wait);
        plan.operations[1].reads.clear();
        assert_eq!(violation(&plan), ViolationKind::MissingWait);
    }

    #[test]
    fn test_unordered_access() {
        let mut plan = straight_line();
        without(&mut plan, SyncAction::Wait);
        assert_eq!(violation(&plan), ViolationKind::UnorderedAccess);
    }

    #[test]
    fn test_starved_wait() {
        let mut plan = straight_line();
        without(&mut plan, SyncAction::Set);
        assert_eq!(violation(&plan), ViolationKind::StarvedWait);
    }

    #[test]
    fn test_premature_reuse() {
        let mut plan = straight_line();
        let set = plan
            .body
            .iter()
            .position(|n| matches!(n, PlanNode::Sync(s) if s.action == SyncAction::Set))
            .unwrap();
        let dup = plan.body[set].clone();
        plan.body.insert(set, dup);
        assert_eq!(violation(&plan), ViolationKind::PrematureReuse);
    }

    #[test]
    fn test_self_deadlock() {
        let mut plan = straight_line();
        let wait = plan
            .body
            .iter()
            .find(|n| matches!(n, PlanNode::Sync(s) if s.action == SyncAction::Wait))
            .cloned()
            .unwrap();
        // The producer now waits on its own event before signalling it.
        if let PlanNode::Sync(mut s) = wait {
            s.lane = plan.events[0].key.producer;
            plan.body.insert(0, PlanNode::Sync(s));
        }
        match PlanVerifier::default().verify(&plan) {
            Err(SyncError::Verification(v)) => {
                assert_eq!(v.kind, ViolationKind::SelfDeadlock);
                assert_eq!(v.detail, "cube.MTE2 waits for e0 -> cube.MTE2");
            }
            other => panic!("expected a deadlock, got {:?}", other),
        }
    }

    #[test]
    fn test_orphan_write() {
        // load reads external `x`, compute overwrites it afterwards.
        let mut kernel = Kernel::new("war");
        let x = kernel
            .add_resource(BufferResource::new("x", RotationWidth::SINGLE).external())
            .unwrap();
        kernel.push(Operation::new("l", ExecutionUnit::Load).reads(&[x]));
        kernel.push(Operation::new("c", ExecutionUnit::Compute).writes(&[x]));
        let mut plan = Scheduler::default().schedule(&kernel).unwrap().plan;
        assert_eq!(plan.events.len(), 1);

        without(&mut plan, SyncAction::Wait);
        assert_eq!(violation(&plan), ViolationKind::OrphanWrite);
    }

    #[test]
    fn test_symbolic_runs() {
        let mut kernel = Kernel::new("sym");
        kernel.add_loop(LoopSpec::new("m", TripCount::symbolic("M"))).unwrap();
        let a = kernel.buffer("a", 2).unwrap();
        kernel.push(Operation::new("p", ExecutionUnit::Load).writes(&[a]).in_loops(&["m"]));
        kernel.push(Operation::new("c", ExecutionUnit::Compute).reads(&[a]).in_loops(&["m"]));
        let schedule = Scheduler::default().schedule(&kernel).unwrap();

        let verifier = PlanVerifier::new(VerifyOptions {
            symbolic_trips: vec![0, 2, 5],
            trip_cap: 8,
        });
        let stats = verifier.verify(&schedule.plan).unwrap();
        assert_eq!(stats.runs, 3);
        assert_eq!(stats.op_instances, 2 * (2 + 5));
    }

    #[test]
    fn test_accesses_outside_regions_are_unchecked() {
        let mut kernel = Kernel::new("regions");
        let a = kernel.buffer("a", 1).unwrap();
        kernel.push(Operation::new("p", ExecutionUnit::Load).writes(&[a]));
        kernel.push(Operation::new("c", ExecutionUnit::Compute).reads(&[a]));
        kernel.push(Operation::new("f", ExecutionUnit::Fixpipe).reads(&[a]));
        kernel.sync_region(0, 1);
        let mut plan = Scheduler::default().schedule(&kernel).unwrap().plan;
        assert_eq!(plan.events.len(), 1);
        assert_eq!(plan.operations[2].region, None);
        PlanVerifier::default().verify(&plan).unwrap();

        without(&mut plan, SyncAction::Wait);
        plan.operations[1].reads.clear();
        // f still reads without any ordering, but it is hand-synchronized
        assert_eq!(violation(&plan), ViolationKind::MissingWait);
    }

    #[test]
    fn test_chain_verified_for_every_arm() {
        let mut kernel = Kernel::new("chain");
        kernel.add_branch(BranchSpec::new("t", 2)).unwrap();
        let a = kernel.buffer("a", 1).unwrap();
        kernel.push(Operation::new("p", ExecutionUnit::Load).writes(&[a]));
        kernel.push(Operation::new("mm", ExecutionUnit::Compute).reads(&[a]).in_arm("t", 0));
        kernel.push(Operation::new("mv", ExecutionUnit::Transform).reads(&[a]).in_arm("t", 1));
        let mut plan = Scheduler::default().schedule(&kernel).unwrap().plan;

        // two arms, the fall-through, and a rotating choice
        let stats = PlanVerifier::default().verify(&plan).unwrap();
        assert_eq!(stats.runs, 4);
        assert_eq!(stats.op_instances, 2 + 2 + 1 + 2);

        without(&mut plan, SyncAction::Wait);
        assert_eq!(violation(&plan), ViolationKind::UnorderedAccess);
    }
}
