//! Wait-for graph over lanes.
//!
//! A lane blocked on a wait depends on the lanes that can still signal the
//! target. When every lane is blocked, a cycle in this graph is a
//! self-inflicted deadlock; a blocked lane whose signallers have all
//! finished is a starved wait instead.
//!
//! # Usage
//!
//! ```ignore
//! let mut detector = DeadlockDetector::new();
//! detector.add_signaller(e0, mte2);
//! detector.add_signaller(e1, cube_m);
//! detector.start_wait(cube_m, e0);
//! detector.start_wait(mte2, e1);
//! assert!(detector.detect_deadlock().is_some());
//! ```

use crate::schedule::plan::SyncTarget;
use crate::target::Lane;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A detected wait cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockCycle {
    /// Lanes in dependency order.
    pub lanes: Vec<Lane>,
    /// Each lane waits on the corresponding target.
    pub targets: Vec<SyncTarget>,
}

impl DeadlockCycle {
    pub fn involves(&self, lane: Lane) -> bool {
        self.lanes.contains(&lane)
    }
}

impl fmt::Display for DeadlockCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (lane, target)) in self.lanes.iter().zip(&self.targets).enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{} waits for {}", lane, target)?;
        }
        if let Some(first) = self.lanes.first() {
            write!(f, " -> {}", first)?;
        }
        Ok(())
    }
}

/// Wait-for graph built from blocked lanes.
#[derive(Debug, Default)]
pub struct DeadlockDetector {
    /// Target each blocked lane waits on.
    waiting_for: BTreeMap<Lane, SyncTarget>,
    /// Unfinished lanes that signal each target.
    signallers: BTreeMap<SyncTarget, BTreeSet<Lane>>,
}

impl DeadlockDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a lane still has signals to issue on a target.
    pub fn add_signaller(&mut self, target: SyncTarget, lane: Lane) {
        self.signallers.entry(target).or_default().insert(lane);
    }

    /// Record that a lane is blocked on a target.
    pub fn start_wait(&mut self, lane: Lane, target: SyncTarget) {
        self.waiting_for.insert(lane, target);
    }

    /// Lanes that could still signal a target.
    pub fn signallers(&self, target: SyncTarget) -> impl Iterator<Item = Lane> + '_ {
        self.signallers.get(&target).into_iter().flatten().copied()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting_for.len()
    }

    /// First blocked lane nobody can signal any more.
    pub fn starved(&self) -> Option<(Lane, SyncTarget)> {
        self.waiting_for
            .iter()
            .find(|(_, target)| self.signallers(**target).next().is_none())
            .map(|(&lane, &target)| (lane, target))
    }

    /// First wait cycle, scanning lanes in order.
    pub fn detect_deadlock(&self) -> Option<DeadlockCycle> {
        self.waiting_for
            .keys()
            .find_map(|&start| self.find_cycle_from(start))
    }

    fn find_cycle_from(&self, start: Lane) -> Option<DeadlockCycle> {
        let mut visited = BTreeSet::new();
        let mut lanes = Vec::new();
        let mut targets = Vec::new();
        self.dfs_cycle(start, start, &mut visited, &mut lanes, &mut targets)
    }

    fn dfs_cycle(
        &self,
        current: Lane,
        start: Lane,
        visited: &mut BTreeSet<Lane>,
        lanes: &mut Vec<Lane>,
        targets: &mut Vec<SyncTarget>,
    ) -> Option<DeadlockCycle> {
        let target = *self.waiting_for.get(&current)?;
        lanes.push(current);
        targets.push(target);

        for signaller in self.signallers(target) {
            if signaller == start {
                return Some(DeadlockCycle {
                    lanes: lanes.clone(),
                    targets: targets.clone(),
                });
            }
            if !visited.contains(&signaller) && self.waiting_for.contains_key(&signaller) {
                visited.insert(signaller);
                if let Some(cycle) = self.dfs_cycle(signaller, start, visited, lanes, targets) {
                    return Some(cycle);
                }
                visited.remove(&signaller);
            }
        }

        lanes.pop();
        targets.pop();
        None
    }
}
