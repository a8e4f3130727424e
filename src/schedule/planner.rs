//! Synchronization planning.
//!
//! Hazard edges are grouped into channels keyed by
//! (source lane, destination lane, resource, scope, class). Each channel is
//! then reduced to a short list of uses, where one use is a set placed after
//! a scope-body child and a wait placed before a later child:
//!
//! - Forward channels: edges sorted by (wait anchor, set anchor) are merged
//!   greedily while the latest set still precedes the earliest wait, then
//!   set positions are made monotone so sets and waits pair up in order.
//! - Carried channels: a single use (set after the latest source, wait
//!   before the earliest destination) with distance d. The outermost loop
//!   around the scope is wrapped in `Preset{d}` before and `Drain{d}` after,
//!   so counts balance for any trip count. Iterations are counted across
//!   executions of an inner loop, so the n-th wait still pairs with the set
//!   of iteration n-d.
//!
//! Every wait then pairs with a set that precedes it in the global program
//! order, which is what keeps the plan deadlock-free.
//!
//! # Width
//!
//! A channel's width K is the number of its signals that can be in flight.
//! The producer of use i reuses an identity only after it has itself waited
//! on a reverse channel (consumer to producer) of the same scope, and that
//! reverse wait orders it after some of the consumer's waits. Each such
//! fence bounds K; without one, K falls back to the rotation period times
//! the uses per iteration (or to d for carried channels).

use super::barrier::BarrierAllocator;
use super::events::{ChannelKey, EventAllocator, EventRequest, Grant, Span};
use super::hazards::{EdgeClass, HazardEdge};
use super::plan::{
    OpAccess, PlanBranch, PlanLoop, PlanNode, PlanOp, SyncAction, SyncInstr, SyncTarget, SynchronizationPlan,
};
use super::program::{NodeId, NodeKind, Program};
use crate::error::SyncError;
use log::{debug, info};
use std::collections::HashMap;

/// One set/wait pair of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelUse {
    /// Scope-body child the set follows.
    pub set_after: NodeId,
    /// Scope-body child the wait precedes.
    pub wait_before: NodeId,
}

/// Edges sharing one synchronization channel.
#[derive(Debug, Clone)]
pub struct Channel<'e> {
    pub key: ChannelKey,
    pub edges: Vec<&'e HazardEdge>,
}

/// A channel with its uses resolved.
struct Resolved<'e> {
    channel: Channel<'e>,
    uses: Vec<ChannelUse>,
    /// Presets of a carried channel; 0 when forward.
    depth: u64,
}

#[derive(Debug, Default)]
struct Insertions {
    presets: Vec<SyncInstr>,
    waits: Vec<SyncInstr>,
    sets: Vec<SyncInstr>,
    drains: Vec<SyncInstr>,
}

fn push_unique(list: &mut Vec<SyncInstr>, instr: SyncInstr) {
    if !list
        .iter()
        .any(|i| i.lane == instr.lane && i.action == instr.action && i.target == instr.target)
    {
        list.push(instr);
    }
}

/// Turns hazard edges into an annotated plan.
pub struct SynchronizationPlanner<'p, 'k> {
    program: &'p Program<'k>,
}

impl<'p, 'k> SynchronizationPlanner<'p, 'k> {
    pub fn new(program: &'p Program<'k>) -> Self {
        Self { program }
    }

    /// Group edges into channels, in order of first appearance.
    pub fn channels<'e>(&self, edges: &'e [HazardEdge]) -> Vec<Channel<'e>> {
        let mut channels: Vec<Channel<'e>> = Vec::new();
        let mut index: HashMap<ChannelKey, usize> = HashMap::new();
        for edge in edges {
            let key = ChannelKey {
                producer: edge.src_lane,
                consumer: edge.dst_lane,
                resource: edge.resource,
                scope: edge.scope,
                class: edge.class(),
            };
            match index.get(&key) {
                Some(&i) => channels[i].edges.push(edge),
                None => {
                    index.insert(key, channels.len());
                    channels.push(Channel {
                        key,
                        edges: vec![edge],
                    });
                }
            }
        }
        channels
    }

    /// Position of an anchor within its scope body.
    fn slot_of(&self, anchor: NodeId) -> usize {
        self.program.node(anchor).index
    }

    /// Minimal ordered uses of a forward channel.
    pub fn forward_uses(&self, channel: &Channel) -> Vec<ChannelUse> {
        let body = self.program.body(channel.key.scope);
        let mut pairs: Vec<(usize, usize)> = channel
            .edges
            .iter()
            .map(|e| (self.slot_of(e.src_anchor), self.slot_of(e.dst_anchor)))
            .collect();
        pairs.sort_by_key(|&(s, w)| (w, s));

        // (max set slot, min wait slot) per group
        let mut groups: Vec<(usize, usize)> = Vec::new();
        for (s, w) in pairs {
            match groups.last_mut() {
                Some((max_s, min_w)) if (*max_s).max(s) < *min_w => *max_s = (*max_s).max(s),
                _ => groups.push((s, w)),
            }
        }
        for g in 1..groups.len() {
            groups[g].0 = groups[g].0.max(groups[g - 1].0);
        }
        groups.dedup();

        groups
            .into_iter()
            .map(|(s, w)| ChannelUse {
                set_after: body[s],
                wait_before: body[w],
            })
            .collect()
    }

    /// The single use and distance of a carried channel.
    pub fn carried_use(&self, channel: &Channel) -> (ChannelUse, u64) {
        let body = self.program.body(channel.key.scope);
        let s = channel
            .edges
            .iter()
            .map(|e| self.slot_of(e.src_anchor))
            .max()
            .unwrap_or(0);
        let w = channel
            .edges
            .iter()
            .map(|e| self.slot_of(e.dst_anchor))
            .min()
            .unwrap_or(0);
        let d = channel.edges.iter().map(|e| e.distance).min().unwrap_or(1).max(1);
        (
            ChannelUse {
                set_after: body[s],
                wait_before: body[w],
            },
            d,
        )
    }

    /// Slot reuse period of the channel's resource, in iterations of the
    /// innermost loop at or around the scope.
    fn period(&self, key: &ChannelKey) -> u64 {
        let mut cursor = key.scope;
        while let Some(id) = cursor {
            if let Some(l) = self.program.as_loop(id) {
                let period = self.program.rotation(key.resource).period_at(l.loop_ix);
                return match l.trip.known() {
                    Some(n) => period.min(n.max(1)),
                    None => period,
                };
            }
            cursor = self.program.node(id).parent;
        }
        1
    }

    fn resolve<'e>(&self, channel: Channel<'e>) -> Resolved<'e> {
        match channel.key.class {
            EdgeClass::Forward => Resolved {
                uses: self.forward_uses(&channel),
                depth: 0,
                channel,
            },
            EdgeClass::Carried => {
                let (use_, d) = self.carried_use(&channel);
                Resolved {
                    uses: vec![use_],
                    depth: d,
                    channel,
                }
            }
        }
    }

    /// Signals a channel may have in flight.
    fn width(&self, resolved: &Resolved, all: &[Resolved]) -> u64 {
        let key = &resolved.channel.key;
        let n = resolved.uses.len().max(1) as u64;
        let d = resolved.depth;
        let scope = key.scope.map(|s| &self.program.node(s).kind);
        let looping = match scope {
            Some(NodeKind::Loop(l)) => l.trip.known().map_or(true, |t| t > 1),
            _ => false,
        };
        let in_arm = matches!(scope, Some(NodeKind::Arm(_)));

        // (set slot, wait slot, distance) of every reverse use. Arms run at
        // most once per visit, so their reverse uses say nothing about the
        // next visit.
        let fences: Vec<(usize, usize, u64)> = if in_arm {
            Vec::new()
        } else {
            all.iter()
                .filter(|o| {
                    let k = &o.channel.key;
                    k.scope == key.scope && k.producer == key.consumer && k.consumer == key.producer
                })
                .flat_map(|o| {
                    o.uses
                        .iter()
                        .map(move |u| (self.slot_of(u.set_after), self.slot_of(u.wait_before), o.depth))
                })
                .collect()
        };
        let waits: Vec<usize> = resolved.uses.iter().map(|u| self.slot_of(u.wait_before)).collect();

        let mut width = d.max(1);
        for (i, u) in resolved.uses.iter().enumerate() {
            let i = i as u64;
            let fallback = if in_arm {
                self.period(key) * n
            } else if !looping {
                d + i + 1
            } else if d > 0 {
                d
            } else {
                self.period(key) * n
            };
            let set = self.slot_of(u.set_after);
            let best = fences
                .iter()
                .map(|&(a, b, dist)| {
                    // Last own wait the consumer passed before the fence's set.
                    let j = waits.iter().rposition(|&w| w <= a).map_or(-1, |j| j as i64);
                    let late = u64::from(b > set);
                    let diff = (d + (dist + late) * n + i) as i64 - j;
                    diff.max(1) as u64
                })
                .fold(fallback, u64::min);
            width = width.max(best);
        }
        if let Some(NodeKind::Loop(l)) = scope {
            if let Some(trip) = l.trip.known() {
                width = width.min((d + trip * n).max(1));
            }
        }
        width
    }

    /// Top-level positions a channel's event is live over.
    fn span(&self, resolved: &Resolved) -> Span {
        let program = self.program;
        match resolved.channel.key.scope {
            Some(scope) => {
                let top = program.node(program.root_ancestor(scope)).index;
                Span::new(top, top)
            }
            None => {
                let start = resolved.uses.iter().map(|u| self.slot_of(u.set_after)).min();
                let end = resolved.uses.iter().map(|u| self.slot_of(u.wait_before)).max();
                Span::new(start.unwrap_or(0), end.unwrap_or(usize::MAX))
            }
        }
    }

    /// Plan every channel and build the annotated tree.
    pub fn plan(
        &self,
        edges: &[HazardEdge],
        mut events: EventAllocator<'_>,
        mut barriers: BarrierAllocator,
    ) -> Result<SynchronizationPlan, SyncError> {
        let program = self.program;
        let mut before: HashMap<NodeId, Insertions> = HashMap::new();
        let mut after: HashMap<NodeId, Insertions> = HashMap::new();

        let resolved: Vec<Resolved> = self.channels(edges).into_iter().map(|c| self.resolve(c)).collect();
        // Outermost loop whose drain currently closes each carried target.
        let mut hoisted: HashMap<SyncTarget, NodeId> = HashMap::new();

        for r in &resolved {
            let key = r.channel.key;
            let at = r
                .channel
                .edges
                .first()
                .map(|e| program.position(e.dst))
                .unwrap_or_default();
            let carried = key.class == EdgeClass::Carried;
            let width = u32::try_from(self.width(r, &resolved)).unwrap_or(u32::MAX);
            let depth = u32::try_from(r.depth).unwrap_or(u32::MAX);

            let mut resumed = false;
            let target = if key.producer.crosses_group(key.consumer) {
                let id = barriers.allocate(key, width, &at)?;
                if carried {
                    barriers.mark_preset(id);
                }
                SyncTarget::Barrier(id)
            } else {
                let request = EventRequest {
                    key,
                    width,
                    presets: depth,
                    span: self.span(r),
                };
                let grant = events.request(request, &at)?;
                if carried {
                    events.mark_preset(grant.id());
                }
                resumed = matches!(grant, Grant::Shared(_));
                SyncTarget::Event(grant.id())
            };
            debug!(
                "channel {} {}->{} r{} {:?}: {} uses, width {}",
                target,
                key.producer,
                key.consumer,
                key.resource.0,
                key.class,
                r.uses.len(),
                width
            );

            for u in &r.uses {
                push_unique(
                    &mut after.entry(u.set_after).or_default().sets,
                    SyncInstr {
                        lane: key.producer,
                        action: SyncAction::Set,
                        target,
                        anchor_op: program.first_op(u.set_after),
                    },
                );
                push_unique(
                    &mut before.entry(u.wait_before).or_default().waits,
                    SyncInstr {
                        lane: key.consumer,
                        action: SyncAction::Wait,
                        target,
                        anchor_op: program.first_op(u.wait_before),
                    },
                );
            }
            if let (true, Some(scope)) = (carried, key.scope) {
                let outer = program.root_ancestor(scope);
                let anchor_op = program.first_op(outer);
                let previous = if resumed { hoisted.get(&target).copied() } else { None };
                match previous {
                    // The earlier owner's outstanding signals carry over.
                    Some(prev) => {
                        if let Some(ins) = after.get_mut(&prev) {
                            ins.drains.retain(|i| i.target != target);
                        }
                    }
                    None => push_unique(
                        &mut before.entry(outer).or_default().presets,
                        SyncInstr {
                            lane: key.producer,
                            action: SyncAction::Preset(depth),
                            target,
                            anchor_op,
                        },
                    ),
                }
                push_unique(
                    &mut after.entry(outer).or_default().drains,
                    SyncInstr {
                        lane: key.consumer,
                        action: SyncAction::Drain(depth),
                        target,
                        anchor_op,
                    },
                );
                hoisted.insert(target, outer);
            }
        }

        let body = self.emit(program.root(), &mut before, &mut after);
        let kernel = program.kernel();
        let plan = SynchronizationPlan {
            kernel: kernel.name.clone(),
            body,
            events: events.into_events(),
            barriers: barriers.into_barriers(),
            rotations: program.rotations().to_vec(),
            resources: kernel.resources().iter().map(|(_, r)| r.name.clone()).collect(),
            loops: kernel.loops().iter().map(|l| l.id.clone()).collect(),
            branches: kernel.branches().iter().map(|b| b.id.clone()).collect(),
            operations: kernel
                .operations()
                .iter()
                .enumerate()
                .map(|(index, op)| OpAccess {
                    name: op.name.clone(),
                    reads: op.reads.clone(),
                    writes: op.writes.clone(),
                    region: kernel.region_of(index),
                })
                .collect(),
            reserved: kernel.user_events().to_vec(),
        };
        info!(
            "kernel '{}': {} events, {} barriers, {} sync instructions",
            plan.kernel,
            plan.events.len(),
            plan.barriers.len(),
            plan.sync_instrs().len()
        );
        Ok(plan)
    }

    fn emit(
        &self,
        body: &[NodeId],
        before: &mut HashMap<NodeId, Insertions>,
        after: &mut HashMap<NodeId, Insertions>,
    ) -> Vec<PlanNode> {
        let mut out = Vec::with_capacity(body.len());
        for &id in body {
            if let Some(ins) = before.remove(&id) {
                out.extend(ins.presets.into_iter().map(PlanNode::Sync));
                out.extend(ins.waits.into_iter().map(PlanNode::Sync));
            }
            match &self.program.node(id).kind {
                NodeKind::Op(op) => out.push(PlanNode::Op(PlanOp {
                    node: id,
                    op: op.op,
                    lane: op.lane,
                    replicas: op.replicas.clone(),
                })),
                NodeKind::Loop(l) => {
                    let inner = self.emit(&l.body, before, after);
                    out.push(PlanNode::Loop(PlanLoop {
                        node: id,
                        loop_ix: l.loop_ix,
                        trip: l.trip.clone(),
                        unroll: l.unroll,
                        replicas: l.replicas.clone(),
                        body: inner,
                    }));
                }
                NodeKind::Branch(b) => {
                    let arms = b
                        .arms
                        .iter()
                        .map(|&arm| self.emit(self.program.body(Some(arm)), before, after))
                        .collect();
                    out.push(PlanNode::Branch(PlanBranch {
                        node: id,
                        branch_ix: b.branch_ix,
                        exhaustive: b.exhaustive,
                        arms,
                    }));
                }
                NodeKind::Arm(a) => out.extend(self.emit(&a.body, before, after)),
            }
            if let Some(ins) = after.remove(&id) {
                out.extend(ins.sets.into_iter().map(PlanNode::Sync));
                out.extend(ins.drains.into_iter().map(PlanNode::Sync));
            }
        }
        out
    }
}
