//! Per-target counters gathered while simulating a plan.

use crate::schedule::plan::SyncTarget;
use std::collections::BTreeMap;
use std::fmt;

/// Statistics for a single event or barrier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetStats {
    /// Signals issued (sets and preset sets).
    pub signals: u64,
    /// Waits consumed (waits and drain waits).
    pub waits: u64,
    /// Waits that found no pending signal when first reached.
    pub blocked_waits: u64,
    /// Most signals pending at once.
    pub max_outstanding: u64,
}

impl TargetStats {
    /// Record a signal; `outstanding` counts it.
    pub fn record_signal(&mut self, outstanding: u64) {
        self.signals += 1;
        self.max_outstanding = self.max_outstanding.max(outstanding);
    }

    pub fn record_wait(&mut self, blocked: bool) {
        self.waits += 1;
        if blocked {
            self.blocked_waits += 1;
        }
    }

    pub fn outstanding(&self) -> u64 {
        self.signals - self.waits
    }
}

/// Statistics for all simulated runs of one plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanStats {
    pub targets: BTreeMap<SyncTarget, TargetStats>,
    /// Trip assignments simulated.
    pub runs: u32,
    /// Operation instances executed over all runs.
    pub op_instances: u64,
}

impl PlanStats {
    pub fn target(&self, target: SyncTarget) -> Option<&TargetStats> {
        self.targets.get(&target)
    }

    /// Merge one run's counters.
    pub fn absorb(&mut self, run: PlanStats) {
        self.runs += run.runs;
        self.op_instances += run.op_instances;
        for (target, stats) in run.targets {
            let entry = self.targets.entry(target).or_default();
            entry.signals += stats.signals;
            entry.waits += stats.waits;
            entry.blocked_waits += stats.blocked_waits;
            entry.max_outstanding = entry.max_outstanding.max(stats.max_outstanding);
        }
    }

    pub fn aggregate(&self) -> AggregateStats {
        let mut agg = AggregateStats::default();
        for stat in self.targets.values() {
            agg.total_signals += stat.signals;
            agg.total_waits += stat.waits;
            agg.total_blocked += stat.blocked_waits;
            agg.max_outstanding = agg.max_outstanding.max(stat.max_outstanding);
        }
        agg
    }
}

impl fmt::Display for PlanStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "runs {} op instances {}", self.runs, self.op_instances)?;
        for (target, s) in &self.targets {
            writeln!(
                f,
                "{:<4} signals {:>6} waits {:>6} blocked {:>6} max outstanding {}",
                target.to_string(),
                s.signals,
                s.waits,
                s.blocked_waits,
                s.max_outstanding
            )?;
        }
        let agg = self.aggregate();
        write!(f, "blocked rate {:.2}", agg.blocked_rate())
    }
}

/// Totals across all targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregateStats {
    pub total_signals: u64,
    pub total_waits: u64,
    pub total_blocked: u64,
    pub max_outstanding: u64,
}

impl AggregateStats {
    /// Fraction of waits that blocked.
    pub fn blocked_rate(&self) -> f64 {
        if self.total_waits == 0 {
            0.0
        } else {
            self.total_blocked as f64 / self.total_waits as f64
        }
    }
}
