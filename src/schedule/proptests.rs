//! Property tests over generated kernels.
//!
//! Pipeline chains (each stage reads the previous stage's buffer and writes
//! its own) must always schedule, verify, stay within event widths and
//! produce byte-identical plans on repeated runs. Kernels on a single unit
//! must not get any synchronization at all.
//!
//! Wider shapes (nested loops, loops in sequence, one channel used several
//! times per iteration) may run out of identities, but whatever plan they
//! produce must have passed verification.

use super::*;
use crate::model::{LoopSpec, Operation, ResourceId, TripCount};
use crate::target::ExecutionUnit;
use proptest::prelude::*;

const CHAIN: [ExecutionUnit; 4] = [
    ExecutionUnit::Load,
    ExecutionUnit::Transform,
    ExecutionUnit::Compute,
    ExecutionUnit::Fixpipe,
];

#[derive(Debug, Clone)]
struct ChainShape {
    stages: usize,
    widths: Vec<u8>,
    trip: Option<TripCount>,
    unroll: u32,
    /// First stage also writes its buffer once before the loop.
    init: bool,
}

fn arb_trip() -> impl Strategy<Value = Option<TripCount>> {
    prop_oneof![
        1 => Just(None),
        3 => (1u64..=8).prop_map(|n| Some(TripCount::Known(n))),
        1 => (1u64..=3).prop_map(|m| Some(TripCount::Symbolic {
            name: "N".into(),
            multiple_of: m,
        })),
    ]
}

fn arb_chain() -> impl Strategy<Value = ChainShape> {
    (
        2usize..=4,
        prop::collection::vec(1u8..=5, 3),
        arb_trip(),
        1u32..=3,
        any::<bool>(),
    )
        .prop_map(|(stages, widths, trip, unroll, init)| ChainShape {
            stages,
            widths,
            trip,
            unroll,
            init,
        })
}

fn chain_kernel(shape: &ChainShape) -> Kernel {
    let mut kernel = Kernel::new("chain");
    let loops: &[&str] = match &shape.trip {
        Some(trip) => {
            kernel
                .add_loop(LoopSpec::new("i", trip.clone()).unrolled(shape.unroll))
                .unwrap();
            &["i"]
        }
        None => &[],
    };
    let buffers: Vec<ResourceId> = (0..shape.stages - 1)
        .map(|i| kernel.buffer(&format!("b{}", i), shape.widths[i]).unwrap())
        .collect();
    if shape.init {
        kernel.push(Operation::new("init", CHAIN[0]).writes(&[buffers[0]]));
    }
    for (i, unit) in CHAIN[..shape.stages].iter().enumerate() {
        let mut op = Operation::new(format!("s{}", i), *unit).in_loops(loops);
        if i > 0 {
            op = op.reads(&[buffers[i - 1]]);
        }
        if i + 1 < shape.stages {
            op = op.writes(&[buffers[i]]);
        }
        kernel.push(op);
    }
    kernel
}

#[derive(Debug, Clone)]
struct NestedShape {
    stages: usize,
    widths: Vec<u8>,
    outer: u64,
    inner: u64,
    /// Last stage runs once per outer iteration, after the inner loop.
    last_outside: bool,
}

fn arb_nested() -> impl Strategy<Value = NestedShape> {
    (
        2usize..=4,
        prop::collection::vec(1u8..=5, 3),
        1u64..=3,
        1u64..=4,
        any::<bool>(),
    )
        .prop_map(|(stages, widths, outer, inner, last_outside)| NestedShape {
            stages,
            widths,
            outer,
            inner,
            last_outside,
        })
}

fn nested_kernel(shape: &NestedShape) -> Kernel {
    let mut kernel = Kernel::new("nested");
    kernel
        .add_loop(LoopSpec::new("m", TripCount::Known(shape.outer)).unrolled(1))
        .unwrap();
    kernel
        .add_loop(LoopSpec::new("k", TripCount::Known(shape.inner)).unrolled(1))
        .unwrap();
    let buffers: Vec<ResourceId> = (0..shape.stages - 1)
        .map(|i| kernel.buffer(&format!("b{}", i), shape.widths[i]).unwrap())
        .collect();
    for (i, unit) in CHAIN[..shape.stages].iter().enumerate() {
        let last = i + 1 == shape.stages;
        let loops: &[&str] = if last && shape.last_outside { &["m"] } else { &["m", "k"] };
        let mut op = Operation::new(format!("s{}", i), *unit).in_loops(loops);
        if i > 0 {
            op = op.reads(&[buffers[i - 1]]);
        }
        if !last {
            op = op.writes(&[buffers[i]]);
        }
        kernel.push(op);
    }
    kernel
}

/// Two load/compute loops in sequence over their own buffers.
fn arb_sequential_kernel() -> impl Strategy<Value = Kernel> {
    prop::collection::vec((1u8..=5, 1u64..=8), 2..=3).prop_map(|loops| {
        let mut kernel = Kernel::new("sequential");
        for (i, (width, trip)) in loops.into_iter().enumerate() {
            let id = format!("l{}", i);
            kernel
                .add_loop(LoopSpec::new(id.as_str(), TripCount::Known(trip)).unrolled(1))
                .unwrap();
            let r = kernel.buffer(&format!("r{}", i), width).unwrap();
            kernel.push(
                Operation::new(format!("ld{}", i), ExecutionUnit::Load)
                    .writes(&[r])
                    .in_loops(&[id.as_str()]),
            );
            kernel.push(
                Operation::new(format!("mm{}", i), ExecutionUnit::Compute)
                    .reads(&[r])
                    .in_loops(&[id.as_str()]),
            );
        }
        kernel
    })
}

/// One load/compute channel used several times per iteration.
fn arb_multi_use_kernel() -> impl Strategy<Value = Kernel> {
    (1u8..=5, 1usize..=4, arb_trip()).prop_map(|(width, uses, trip)| {
        let mut kernel = Kernel::new("multi_use");
        let loops: &[&str] = match trip {
            Some(trip) => {
                kernel.add_loop(LoopSpec::new("i", trip).unrolled(1)).unwrap();
                &["i"]
            }
            None => &[],
        };
        let r = kernel.buffer("r", width).unwrap();
        for u in 0..uses {
            kernel.push(
                Operation::new(format!("p{}", u), ExecutionUnit::Load)
                    .writes(&[r])
                    .in_loops(loops),
            );
            kernel.push(
                Operation::new(format!("c{}", u), ExecutionUnit::Compute)
                    .reads(&[r])
                    .in_loops(loops),
            );
        }
        kernel
    })
}

/// Verified, or rejected only for lack of identities.
fn schedules_or_runs_out(kernel: &Kernel) -> Result<(), String> {
    match Scheduler::default().schedule(kernel) {
        Ok(_) | Err(SyncError::EventPoolExhausted { .. }) => Ok(()),
        Err(err) => Err(err.to_string()),
    }
}

/// Ops on one unit; the first writes every buffer, the rest read or write
/// a random subset.
fn arb_solo_kernel() -> impl Strategy<Value = Kernel> {
    (
        prop::sample::select(ExecutionUnit::ALL.to_vec()),
        prop::collection::vec((any::<bool>(), any::<bool>()), 1..6),
        prop::option::of(1u64..=6),
    )
        .prop_map(|(unit, ops, trip)| {
            let mut kernel = Kernel::new("solo");
            let loops: &[&str] = match trip {
                Some(n) => {
                    kernel.add_loop(LoopSpec::new("i", TripCount::Known(n))).unwrap();
                    &["i"]
                }
                None => &[],
            };
            let a = kernel.buffer("a", 1).unwrap();
            let b = kernel.buffer("b", 2).unwrap();
            kernel.push(Operation::new("init", unit).writes(&[a, b]).in_loops(loops));
            for (i, (read_a, write_b)) in ops.into_iter().enumerate() {
                let mut op = Operation::new(format!("op{}", i), unit).in_loops(loops);
                op = if read_a { op.reads(&[a]) } else { op.reads(&[b]) };
                if write_b {
                    op = op.writes(&[b]);
                }
                kernel.push(op);
            }
            kernel
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_pipeline_chains_verify(shape in arb_chain()) {
        let kernel = chain_kernel(&shape);
        let result = Scheduler::default().schedule(&kernel);
        prop_assert!(result.is_ok(), "{:?} failed: {:?}", shape, result.err());
    }

    #[test]
    fn prop_plans_are_deterministic(shape in arb_chain()) {
        let kernel = chain_kernel(&shape);
        let scheduler = Scheduler::default();
        let first = scheduler.schedule(&kernel).map(|s| s.plan.to_string());
        let second = scheduler.schedule(&kernel).map(|s| s.plan.to_string());
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_signals_bounded_and_drained(shape in arb_chain()) {
        let kernel = chain_kernel(&shape);
        let schedule = Scheduler::default().schedule(&kernel).unwrap();
        for (target, stats) in &schedule.stats.targets {
            prop_assert!(stats.max_outstanding <= schedule.plan.width_of(*target) as u64);
            prop_assert_eq!(stats.signals, stats.waits);
        }
    }

    #[test]
    fn prop_every_cross_lane_edge_has_a_channel(shape in arb_chain()) {
        let kernel = chain_kernel(&shape);
        let schedule = Scheduler::default().schedule(&kernel).unwrap();
        for edge in &schedule.edges {
            let covered = schedule.plan.events.iter().flat_map(|e| e.channels()).any(|key| {
                key.producer == edge.src_lane && key.consumer == edge.dst_lane && key.resource == edge.resource
            });
            prop_assert!(covered, "no event for {}", edge);
        }
    }

    #[test]
    fn prop_nested_loops_verify(shape in arb_nested()) {
        let kernel = nested_kernel(&shape);
        let result = schedules_or_runs_out(&kernel);
        prop_assert!(result.is_ok(), "{:?} failed: {:?}", shape, result);
    }

    #[test]
    fn prop_sequential_loops_verify(kernel in arb_sequential_kernel()) {
        let result = schedules_or_runs_out(&kernel);
        prop_assert!(result.is_ok(), "{:?}", result);
    }

    #[test]
    fn prop_multi_use_channels_verify(kernel in arb_multi_use_kernel()) {
        let result = schedules_or_runs_out(&kernel);
        prop_assert!(result.is_ok(), "{:?}", result);
    }

    #[test]
    fn prop_same_unit_needs_no_sync(kernel in arb_solo_kernel()) {
        let schedule = Scheduler::default().schedule(&kernel).unwrap();
        prop_assert!(schedule.edges.is_empty());
        prop_assert!(schedule.plan.events.is_empty());
        prop_assert!(schedule.plan.sync_instrs().is_empty());
    }
}
