//! Synchronization scheduling.
//!
//! The pipeline for one kernel:
//!
//! 1. [`program`]: resolve rotation loops, pick unroll factors and build the
//!    replicated program tree
//! 2. [`hazards`]: derive RAW / WAR / WAW edges between lanes
//! 3. [`planner`]: merge edges into channels and insert set/wait pairs,
//!    drawing identities from [`events`] and flags from [`barrier`]
//! 4. [`crate::verify`]: simulate the plan and reject it on any violation
//!
//! [`Scheduler`] runs all four with one set of options and owns the
//! allocation context for the duration of the call.

pub mod barrier;
pub mod events;
pub mod hazards;
pub mod plan;
pub mod planner;
pub mod program;
pub mod unroll;

#[cfg(test)]
mod proptests;

pub use barrier::{BarrierAllocator, BarrierConfig, BarrierId, CrossGroupBarrier};
pub use events::{ChannelKey, EventAllocator, EventId, EventKind, EventRequest, Grant, Span, SyncEvent};
pub use hazards::{EdgeClass, HazardAnalyzer, HazardEdge, HazardKind};
pub use plan::{PlanBranch, PlanNode, SyncAction, SyncInstr, SyncTarget, SynchronizationPlan};
pub use planner::SynchronizationPlanner;
pub use program::{NodeId, Program};

use crate::config::Config;
use crate::error::SyncError;
use crate::model::Kernel;
use crate::target::UnitGraph;
use crate::verify::{PlanStats, PlanVerifier, VerifyOptions};
use log::info;

/// Knobs of one scheduling run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleOptions {
    /// Unroll factor for loops without their own.
    pub default_unroll: u32,
    /// Replaces every pipe pair's identity pool when set.
    pub event_pool: Option<u8>,
    /// Loop iterations expanded by hazard analysis.
    pub analysis_iterations: u32,
    pub verify: VerifyOptions,
}

impl ScheduleOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_unroll: config.default_unroll(),
            event_pool: config.event_pool_size(),
            analysis_iterations: config.analysis_iterations(),
            verify: VerifyOptions {
                symbolic_trips: config.symbolic_trips(),
                trip_cap: config.verify_trip_cap(),
            },
        }
    }

    pub fn with_unroll(mut self, unroll: u32) -> Self {
        self.default_unroll = unroll.max(1);
        self
    }

    pub fn with_event_pool(mut self, pool: u8) -> Self {
        self.event_pool = Some(pool);
        self
    }
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A verified plan with what it took to get there.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub plan: SynchronizationPlan,
    pub edges: Vec<HazardEdge>,
    pub stats: PlanStats,
}

/// Runs the whole pipeline against one target description.
#[derive(Debug, Clone)]
pub struct Scheduler {
    graph: UnitGraph,
    options: ScheduleOptions,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(UnitGraph::standard(), ScheduleOptions::default())
    }
}

impl Scheduler {
    pub fn new(graph: UnitGraph, options: ScheduleOptions) -> Self {
        Self { graph, options }
    }

    pub fn graph(&self) -> &UnitGraph {
        &self.graph
    }

    pub fn options(&self) -> &ScheduleOptions {
        &self.options
    }

    /// Plan a kernel and verify the result. Fails on the first error; no
    /// partial plan is returned.
    pub fn schedule(&self, kernel: &Kernel) -> Result<Schedule, SyncError> {
        kernel.validate()?;
        let program = Program::build(kernel, self.options.default_unroll)?;
        let edges = HazardAnalyzer::new(&program)
            .with_analysis_iterations(self.options.analysis_iterations)
            .analyze()?;

        let mut events = EventAllocator::new(&self.graph).with_pool_size(self.options.event_pool);
        for user in kernel.user_events() {
            events.reserve(user.producer, user.consumer, user.id);
        }
        let plan = SynchronizationPlanner::new(&program).plan(&edges, events, BarrierAllocator::new())?;
        let stats = PlanVerifier::new(self.options.verify.clone()).verify(&plan)?;

        info!(
            "scheduled '{}': {} edges, {} events, {} barriers, {} runs verified",
            kernel.name,
            edges.len(),
            plan.events.len(),
            plan.barriers.len(),
            stats.runs
        );
        Ok(Schedule { plan, edges, stats })
    }
}
