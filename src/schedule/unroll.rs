//! Partial unrolling.
//!
//! A loop body unrolled by U' is replicated U' times and the replicas are
//! list-scheduled item-major: the scheduler always picks the ready
//! (item, replica) with the smallest item index, then the smallest replica.
//! Only two kinds of pairs keep their original relative order:
//!
//! - items sharing a lane (issue order on a lane is fixed),
//! - items touching the same physical slot of a resource with at least one
//!   write.
//!
//! With rotation width W >= U' the replicas of a load land in different
//! slots, so consecutive same-unit operations end up grouped and one
//! wait/set pair covers the whole batch. With W < U' the slot conflicts pull
//! the replicas back into their original interleaving.

use crate::model::{Kernel, KernelItem, ResourceId, TripCount};
use crate::target::Lane;
use smallvec::SmallVec;

/// Lanes and accesses of one loop-body item (an operation, a nested loop or
/// a conditional chain).
#[derive(Debug, Clone, Default)]
pub struct ItemSummary {
    pub lanes: SmallVec<[Lane; 4]>,
    pub reads: SmallVec<[ResourceId; 4]>,
    pub writes: SmallVec<[ResourceId; 4]>,
}

impl ItemSummary {
    /// Collect everything an item touches, nested loops included.
    pub fn of(kernel: &Kernel, item: &KernelItem) -> Self {
        let mut summary = ItemSummary::default();
        summary.collect(kernel, item);
        summary
    }

    fn collect(&mut self, kernel: &Kernel, item: &KernelItem) {
        match item {
            KernelItem::Op(index) => self.collect_op(kernel, *index),
            KernelItem::Loop { body, .. } => {
                for child in body {
                    self.collect(kernel, child);
                }
            }
            KernelItem::Branch { arms, .. } => {
                for &index in arms.iter().flatten() {
                    self.collect_op(kernel, index);
                }
            }
        }
    }

    fn collect_op(&mut self, kernel: &Kernel, index: usize) {
        let op = kernel.operation(index);
        push_unique(&mut self.lanes, op.lane());
        for &r in &op.reads {
            push_unique(&mut self.reads, r);
        }
        for &r in &op.writes {
            push_unique(&mut self.writes, r);
        }
    }

    fn shares_lane(&self, other: &ItemSummary) -> bool {
        self.lanes.iter().any(|l| other.lanes.contains(l))
    }

    /// Resources both items touch where at least one side writes.
    fn conflicting_resources<'a>(&'a self, other: &'a ItemSummary) -> impl Iterator<Item = ResourceId> + 'a {
        let write_any = self
            .writes
            .iter()
            .filter(move |r| other.reads.contains(r) || other.writes.contains(r));
        let read_write = self
            .reads
            .iter()
            .filter(move |r| other.writes.contains(r) && !self.writes.contains(r));
        write_any.chain(read_write).copied()
    }
}

fn push_unique<A: smallvec::Array>(v: &mut SmallVec<A>, x: A::Item)
where
    A::Item: PartialEq,
{
    if !v.contains(&x) {
        v.push(x);
    }
}

/// Largest factor <= `requested` that divides the trip count and is
/// compatible with every rotation width `w` rotating at the loop
/// (`w % d == 0 || d % w == 0`).
pub fn choose_factor(requested: u32, trip: &TripCount, widths: &[u8]) -> u32 {
    let divisor = trip.divisor();
    (1..=requested.max(1))
        .rev()
        .find(|&d| {
            divisor % d as u64 == 0
                && widths
                    .iter()
                    .all(|&w| w as u32 % d == 0 || d % w as u32 == 0)
        })
        .unwrap_or(1)
}

/// Order of (item, replica) pairs after unrolling by `factor`.
///
/// `same_slot(r, j, k)` tells whether replicas `j` and `k` of the body touch
/// the same physical slot of resource `r` within one batch.
pub fn replica_order<F>(items: &[ItemSummary], factor: u32, same_slot: F) -> Vec<(usize, u32)>
where
    F: Fn(ResourceId, u32, u32) -> bool,
{
    let n = items.len();
    let units: Vec<(usize, u32)> = (0..factor)
        .flat_map(|j| (0..n).map(move |a| (a, j)))
        .collect();
    if factor <= 1 {
        return units;
    }

    // Original order is replica-major: index = j * n + a.
    let depends = |earlier: (usize, u32), later: (usize, u32)| -> bool {
        let (a, j) = earlier;
        let (b, k) = later;
        items[a].shares_lane(&items[b])
            || items[a]
                .conflicting_resources(&items[b])
                .any(|r| same_slot(r, j, k))
    };

    let mut scheduled = vec![false; units.len()];
    let mut order = Vec::with_capacity(units.len());
    let mut candidates: Vec<usize> = (0..units.len()).collect();
    candidates.sort_by_key(|&u| (units[u].0, units[u].1));

    while order.len() < units.len() {
        let next = candidates.iter().copied().find(|&u| {
            !scheduled[u]
                && (0..u).all(|earlier| scheduled[earlier] || !depends(units[earlier], units[u]))
        });
        // The lowest unscheduled unit in original order is always ready.
        let pick = match next {
            Some(u) => u,
            None => match scheduled.iter().position(|s| !s) {
                Some(u) => u,
                None => break,
            },
        };
        scheduled[pick] = true;
        order.push(units[pick]);
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::ExecutionUnit;

    fn item(unit: ExecutionUnit, reads: &[u32], writes: &[u32]) -> ItemSummary {
        ItemSummary {
            lanes: [Lane::home(unit)].into_iter().collect(),
            reads: reads.iter().map(|&r| ResourceId(r)).collect(),
            writes: writes.iter().map(|&r| ResourceId(r)).collect(),
        }
    }

    #[test]
    fn test_choose_factor() {
        assert_eq!(choose_factor(2, &TripCount::Known(8), &[2]), 2);
        assert_eq!(choose_factor(4, &TripCount::Known(6), &[]), 3);
        // 3 is incompatible with width 2; 2 does not divide 9.
        assert_eq!(choose_factor(3, &TripCount::Known(9), &[2]), 1);
        assert_eq!(choose_factor(5, &TripCount::Known(5), &[1]), 5);
        assert_eq!(choose_factor(4, &TripCount::symbolic("M"), &[]), 1);
        let m4 = TripCount::Symbolic {
            name: "M".into(),
            multiple_of: 4,
        };
        assert_eq!(choose_factor(4, &m4, &[2]), 4);
        assert_eq!(choose_factor(0, &TripCount::Known(3), &[]), 1);
    }

    #[test]
    fn test_grouping_with_enough_slots() {
        // P writes r0, C reads r0, W = 2 = U'
        let items = vec![
            item(ExecutionUnit::Load, &[], &[0]),
            item(ExecutionUnit::Compute, &[0], &[]),
        ];
        let order = replica_order(&items, 2, |_, j, k| j % 2 == k % 2);
        assert_eq!(order, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
    }

    #[test]
    fn test_overlap_collapses_single_slot() {
        let items = vec![
            item(ExecutionUnit::Load, &[], &[0]),
            item(ExecutionUnit::Compute, &[0], &[]),
        ];
        let order = replica_order(&items, 3, |_, _, _| true);
        assert_eq!(order, vec![(0, 0), (1, 0), (0, 1), (1, 1), (0, 2), (1, 2)]);
    }

    #[test]
    fn test_no_unroll_keeps_order() {
        let items = vec![
            item(ExecutionUnit::Load, &[], &[0]),
            item(ExecutionUnit::Compute, &[0], &[1]),
        ];
        assert_eq!(replica_order(&items, 1, |_, _, _| true), vec![(0, 0), (1, 0)]);
    }
}
