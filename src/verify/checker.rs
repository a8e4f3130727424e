//! Plan verifier.
//!
//! Runs the linearized lanes against each other with vector clocks. The
//! n-th wait on a target consumes the n-th signal, so the outcome does not
//! depend on how lanes are interleaved; the checker runs each lane as far
//! as it can, in lane order, until every lane is finished or blocked.
//!
//! Checks per step:
//! - **signal**: the n-th signal on a K-wide target must be ordered after
//!   the (n-K)-th wait, else the identity is reused too early
//! - **wait**: blocks until its signal exists, then joins the signaller's clock
//! - **read**: must be ordered after the slot's last write from another lane
//! - **write**: must be ordered after every other-lane reader and writer
//!   since the previous write
//!
//! Accesses are only compared when both sit in the same sync region.
//! Hand-synchronized operations still update the slot state but are never
//! checked themselves.

use super::deadlock::DeadlockDetector;
use super::linearize::{linearize, ArmChoice, LaneStream, StepKind, TripAssignment};
use super::stats::{PlanStats, TargetStats};
use crate::error::{SyncError, Violation, ViolationKind};
use crate::model::{Position, SlotRing, TripCount};
use crate::schedule::plan::{PlanNode, SyncTarget, SynchronizationPlan};
use crate::target::{spec, Lane};
use log::debug;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOptions {
    /// Batch counts substituted for every symbolic loop, one run each.
    pub symbolic_trips: Vec<u64>,
    /// Known trip counts above this are truncated while simulating.
    pub trip_cap: u64,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            symbolic_trips: spec::DEFAULT_SYMBOLIC_TRIPS.to_vec(),
            trip_cap: spec::DEFAULT_VERIFY_TRIP_CAP as u64,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlanVerifier {
    options: VerifyOptions,
}

impl PlanVerifier {
    pub fn new(options: VerifyOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &VerifyOptions {
        &self.options
    }

    /// Check a plan under every configured trip assignment and, for plans
    /// with conditional chains, every way of choosing arms.
    pub fn verify(&self, plan: &SynchronizationPlan) -> Result<PlanStats, SyncError> {
        let mut symbolic = self.options.symbolic_trips.clone();
        if symbolic.is_empty() || !has_symbolic_loop(&plan.body) {
            symbolic = vec![symbolic.first().copied().unwrap_or(1)];
        }
        let choices = arm_choices(plan);

        let mut total = PlanStats::default();
        for value in symbolic {
            for &arm in &choices {
                let trips = TripAssignment {
                    symbolic: value,
                    cap: self.options.trip_cap,
                    arm,
                };
                let streams = linearize(plan, trips);
                let stats = Simulation::new(plan, &streams)
                    .run()
                    .map_err(SyncError::Verification)?;
                debug!(
                    "verified '{}' with {} symbolic batches, arms {:?}: {} op instances",
                    plan.kernel, value, arm, stats.op_instances
                );
                total.absorb(stats);
            }
        }
        Ok(total)
    }
}

/// Each fixed arm (plus fall-through) and a rotating choice.
fn arm_choices(plan: &SynchronizationPlan) -> Vec<ArmChoice> {
    if !plan.has_branches() {
        return vec![ArmChoice::Fixed(0)];
    }
    let mut choices: Vec<ArmChoice> = (0..=plan.max_arms() as u32).map(ArmChoice::Fixed).collect();
    choices.push(ArmChoice::Cycle);
    choices
}

fn has_symbolic_loop(body: &[PlanNode]) -> bool {
    body.iter().any(|node| match node {
        PlanNode::Loop(l) => matches!(l.trip, TripCount::Symbolic { .. }) || has_symbolic_loop(&l.body),
        PlanNode::Branch(b) => b.arms.iter().any(|arm| has_symbolic_loop(arm)),
        PlanNode::Op(_) | PlanNode::Sync(_) => false,
    })
}

type Clock = Vec<u64>;

/// A step already executed: its lane and local timestamp.
#[derive(Debug, Clone, Copy)]
struct Stamp {
    lane: usize,
    time: u64,
}

#[derive(Debug, Clone)]
struct Signal {
    stamp: Stamp,
    clock: Clock,
    position: Position,
}

#[derive(Debug, Default)]
struct TargetState {
    signals: Vec<Signal>,
    waits: Vec<Stamp>,
    stats: TargetStats,
}

#[derive(Debug, Default)]
struct SlotTrack {
    /// Last write and its sync region.
    writer: Option<(Stamp, Option<usize>)>,
    /// Latest read per lane since the last write, with its sync region.
    readers: BTreeMap<usize, (u64, Option<usize>)>,
}

struct Simulation<'a> {
    plan: &'a SynchronizationPlan,
    streams: &'a [LaneStream],
    pc: Vec<usize>,
    clocks: Vec<Clock>,
    /// Lanes whose current wait has already blocked once.
    stalled: Vec<bool>,
    targets: BTreeMap<SyncTarget, TargetState>,
    slots: Vec<SlotRing<SlotTrack>>,
    op_instances: u64,
}

enum Progress {
    Advanced,
    Blocked(SyncTarget),
    Finished,
}

impl<'a> Simulation<'a> {
    fn new(plan: &'a SynchronizationPlan, streams: &'a [LaneStream]) -> Self {
        let lanes = streams.len();
        Self {
            plan,
            streams,
            pc: vec![0; lanes],
            clocks: vec![vec![0; lanes]; lanes],
            stalled: vec![false; lanes],
            targets: BTreeMap::new(),
            slots: plan.rotations.iter().map(|r| SlotRing::new(r.width)).collect(),
            op_instances: 0,
        }
    }

    fn run(mut self) -> Result<PlanStats, Violation> {
        loop {
            let mut advanced = false;
            let mut blocked = BTreeMap::new();
            for lane in 0..self.streams.len() {
                loop {
                    match self.step(lane)? {
                        Progress::Advanced => advanced = true,
                        Progress::Blocked(target) => {
                            blocked.insert(lane, target);
                            break;
                        }
                        Progress::Finished => break,
                    }
                }
            }
            let Some((&lane, &target)) = blocked.iter().next() else {
                break;
            };
            if !advanced {
                return Err(self.stuck(&blocked, (lane, target)));
            }
        }
        self.finish()
    }

    fn step(&mut self, lane: usize) -> Result<Progress, Violation> {
        let streams = self.streams;
        let stream = &streams[lane];
        let Some(step) = stream.steps.get(self.pc[lane]) else {
            return Ok(Progress::Finished);
        };

        match &step.kind {
            StepKind::Wait(target) => {
                let state = self.targets.entry(*target).or_default();
                let n = state.waits.len();
                let Some(signal) = state.signals.get(n) else {
                    self.stalled[lane] = true;
                    return Ok(Progress::Blocked(*target));
                };
                let clock = &mut self.clocks[lane];
                for (mine, theirs) in clock.iter_mut().zip(&signal.clock) {
                    *mine = (*mine).max(*theirs);
                }
                clock[lane] += 1;
                state.waits.push(Stamp {
                    lane,
                    time: clock[lane],
                });
                state.stats.record_wait(self.stalled[lane]);
                self.stalled[lane] = false;
            }
            StepKind::Signal(target) => {
                self.clocks[lane][lane] += 1;
                let width = self.plan.width_of(*target) as usize;
                let state = self.targets.entry(*target).or_default();
                let n = state.signals.len();
                if n >= width {
                    let ordered = state
                        .waits
                        .get(n - width)
                        .map_or(false, |w| self.clocks[lane][w.lane] >= w.time);
                    if !ordered {
                        return Err(Violation {
                            kind: ViolationKind::PrematureReuse,
                            position: step.position.clone(),
                            lane: stream.lane,
                            detail: format!(
                                "signal #{} on {} (width {}) not ordered after wait #{}",
                                n,
                                target,
                                width,
                                n - width
                            ),
                        });
                    }
                }
                state.signals.push(Signal {
                    stamp: Stamp {
                        lane,
                        time: self.clocks[lane][lane],
                    },
                    clock: self.clocks[lane].clone(),
                    position: step.position.clone(),
                });
                let outstanding = (state.signals.len() - state.waits.len()) as u64;
                state.stats.record_signal(outstanding);
            }
            StepKind::Op { region, accesses, .. } => {
                self.clocks[lane][lane] += 1;
                let now = self.clocks[lane][lane];
                self.op_instances += 1;
                let region = *region;
                for access in accesses {
                    let track = self.slots[access.resource.index()].slot_mut(access.slot as usize);
                    let clock = &self.clocks[lane];
                    let checked = |other: Option<usize>| region.is_some() && other == region;
                    let unordered = |s: Stamp| s.lane != lane && clock[s.lane] < s.time;
                    let resource = self
                        .plan
                        .resources
                        .get(access.resource.index())
                        .map_or("?", |s| s.as_str());

                    if access.write {
                        let racing_reader = track
                            .readers
                            .iter()
                            .filter(|(_, (_, r))| checked(*r))
                            .map(|(&l, &(time, _))| Stamp { lane: l, time })
                            .find(|&s| unordered(s));
                        let racing_writer = track
                            .writer
                            .filter(|&(w, r)| checked(r) && unordered(w))
                            .map(|(w, _)| w);
                        if let Some((other, what)) = racing_reader
                            .map(|s| (s, "read"))
                            .or(racing_writer.map(|s| (s, "write")))
                        {
                            return Err(Violation {
                                kind: ViolationKind::OrphanWrite,
                                position: step.position.clone(),
                                lane: stream.lane,
                                detail: format!(
                                    "write of {}[{}] not ordered after {} on {}",
                                    resource, access.slot, what, self.streams[other.lane].lane
                                ),
                            });
                        }
                        track.writer = Some((Stamp { lane, time: now }, region));
                        track.readers.clear();
                    } else {
                        if let Some((w, _)) = track.writer.filter(|&(w, r)| checked(r) && unordered(w)) {
                            return Err(Violation {
                                kind: ViolationKind::UnorderedAccess,
                                position: step.position.clone(),
                                lane: stream.lane,
                                detail: format!(
                                    "read of {}[{}] not ordered after write on {}",
                                    resource, access.slot, self.streams[w.lane].lane
                                ),
                            });
                        }
                        track.readers.insert(lane, (now, region));
                    }
                }
            }
        }
        self.pc[lane] += 1;
        Ok(Progress::Advanced)
    }

    /// Diagnose a state where every unfinished lane is blocked.
    fn stuck(&self, blocked: &BTreeMap<usize, SyncTarget>, first: (usize, SyncTarget)) -> Violation {
        let mut detector = DeadlockDetector::new();
        for (lane, stream) in self.streams.iter().enumerate() {
            for step in &stream.steps[self.pc[lane]..] {
                if let StepKind::Signal(target) = step.kind {
                    detector.add_signaller(target, stream.lane);
                }
            }
        }
        for (&lane, &target) in blocked {
            detector.start_wait(self.streams[lane].lane, target);
        }

        let position_of = |lane: Lane| {
            self.streams
                .iter()
                .enumerate()
                .find(|(_, s)| s.lane == lane)
                .and_then(|(ix, s)| s.steps.get(self.pc[ix]))
                .map(|step| step.position.clone())
                .unwrap_or_default()
        };

        if let Some((lane, target)) = detector.starved() {
            return Violation {
                kind: ViolationKind::StarvedWait,
                position: position_of(lane),
                lane,
                detail: format!("wait on {} has no signaller left", target),
            };
        }
        let (lane, detail) = match detector.detect_deadlock() {
            Some(cycle) => (cycle.lanes[0], cycle.to_string()),
            None => {
                let lane = self.streams[first.0].lane;
                (lane, format!("{} waits for {}", lane, first.1))
            }
        };
        Violation {
            kind: ViolationKind::SelfDeadlock,
            position: position_of(lane),
            lane,
            detail,
        }
    }

    fn finish(self) -> Result<PlanStats, Violation> {
        for (target, state) in &self.targets {
            if let Some(signal) = state.signals.get(state.waits.len()) {
                return Err(Violation {
                    kind: ViolationKind::MissingWait,
                    position: signal.position.clone(),
                    lane: self.streams[signal.stamp.lane].lane,
                    detail: format!(
                        "{} signal(s) on {} never consumed",
                        state.signals.len() - state.waits.len(),
                        target
                    ),
                });
            }
        }
        Ok(PlanStats {
            targets: self.targets.into_iter().map(|(t, s)| (t, s.stats)).collect(),
            runs: 1,
            op_instances: self.op_instances,
        })
    }
}
