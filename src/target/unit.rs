//! Execution units, core groups and lanes.
//!
//! An [`ExecutionUnit`] is one kind of pipe (load engine, compute engine...).
//! Pipes of the same kind exist in both core groups, so the planner works on
//! [`Lane`]s: a unit inside a specific [`CoreGroup`]. Each lane is one
//! independent, internally ordered instruction stream.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution unit (pipe) tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionUnit {
    /// Scalar unit (address arithmetic, control flow).
    Scalar,
    /// Global memory -> local buffer copies.
    Load,
    /// Local buffer -> operand buffer transforms.
    Transform,
    /// Matrix multiply-accumulate.
    Compute,
    /// Elementwise / reduction vector engine.
    Vector,
    /// Accumulator write-back (fixpipe).
    Fixpipe,
    /// Local buffer -> global memory copies.
    Store,
}

impl ExecutionUnit {
    /// All units, in table order.
    pub const ALL: [ExecutionUnit; 7] = [
        ExecutionUnit::Scalar,
        ExecutionUnit::Load,
        ExecutionUnit::Transform,
        ExecutionUnit::Compute,
        ExecutionUnit::Vector,
        ExecutionUnit::Fixpipe,
        ExecutionUnit::Store,
    ];

    /// Hardware pipe mnemonic.
    pub fn mnemonic(self) -> &'static str {
        match self {
            ExecutionUnit::Scalar => "S",
            ExecutionUnit::Load => "MTE2",
            ExecutionUnit::Transform => "MTE1",
            ExecutionUnit::Compute => "M",
            ExecutionUnit::Vector => "V",
            ExecutionUnit::Fixpipe => "FIX",
            ExecutionUnit::Store => "MTE3",
        }
    }

    /// Parse a unit from its name or its pipe mnemonic (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.to_ascii_lowercase();
        match lower.as_str() {
            "scalar" | "s" => Some(ExecutionUnit::Scalar),
            "load" | "mte2" => Some(ExecutionUnit::Load),
            "transform" | "mte1" => Some(ExecutionUnit::Transform),
            "compute" | "m" | "cube" => Some(ExecutionUnit::Compute),
            "vector" | "v" => Some(ExecutionUnit::Vector),
            "fixpipe" | "fix" => Some(ExecutionUnit::Fixpipe),
            "store" | "mte3" => Some(ExecutionUnit::Store),
            _ => None,
        }
    }

    /// Group an operation on this unit belongs to unless it says otherwise.
    pub fn home_group(self) -> CoreGroup {
        match self {
            ExecutionUnit::Vector | ExecutionUnit::Store => CoreGroup::Vector,
            _ => CoreGroup::Cube,
        }
    }
}

impl fmt::Display for ExecutionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Physical core group. Units in different groups never share events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreGroup {
    /// Matrix core (load, transform, compute, fixpipe).
    Cube,
    /// Vector core (load, vector, store).
    Vector,
}

impl CoreGroup {
    /// Short name used in listings.
    pub fn name(self) -> &'static str {
        match self {
            CoreGroup::Cube => "cube",
            CoreGroup::Vector => "vec",
        }
    }
}

impl fmt::Display for CoreGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One instruction stream: a unit inside a core group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Lane {
    pub group: CoreGroup,
    pub unit: ExecutionUnit,
}

impl Lane {
    /// Create a lane.
    #[inline]
    pub const fn new(group: CoreGroup, unit: ExecutionUnit) -> Self {
        Self { group, unit }
    }

    /// Lane of `unit` in its home group.
    #[inline]
    pub fn home(unit: ExecutionUnit) -> Self {
        Self::new(unit.home_group(), unit)
    }

    /// Whether two lanes are in different core groups.
    #[inline]
    pub fn crosses_group(self, other: Lane) -> bool {
        self.group != other.group
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mnemonics_round_trip() {
        for unit in ExecutionUnit::ALL {
            assert_eq!(ExecutionUnit::parse(unit.mnemonic()), Some(unit));
        }
        assert_eq!(ExecutionUnit::parse("Load"), Some(ExecutionUnit::Load));
        assert_eq!(ExecutionUnit::parse("dma"), None);
    }

    #[test]
    fn test_home_groups() {
        assert_eq!(ExecutionUnit::Compute.home_group(), CoreGroup::Cube);
        assert_eq!(ExecutionUnit::Fixpipe.home_group(), CoreGroup::Cube);
        assert_eq!(ExecutionUnit::Vector.home_group(), CoreGroup::Vector);
        assert_eq!(ExecutionUnit::Store.home_group(), CoreGroup::Vector);
    }

    #[test]
    fn test_lane_display() {
        let lane = Lane::home(ExecutionUnit::Load);
        assert_eq!(format!("{}", lane), "cube.MTE2");
        let vec_load = Lane::new(CoreGroup::Vector, ExecutionUnit::Load);
        assert_ne!(lane, vec_load);
        assert!(lane.crosses_group(vec_load));
    }
}
