//! Execution-unit graph: which producer/consumer pipe pairs can signal each
//! other, and with which hardware primitive.
//!
//! Only intra-group pairs live here. Traffic between core groups goes through
//! cross-group flags (see `schedule::barrier`).
//!
//! # Usage
//!
//! ```ignore
//! let graph = UnitGraph::standard();
//! if let Some(kind) = graph.look_up(ExecutionUnit::Load, ExecutionUnit::Transform) {
//!     println!("{} ids", kind.pool_size);
//! }
//! ```

use super::spec;
use super::unit::ExecutionUnit;
use std::collections::BTreeMap;
use std::fmt;

/// Opaque hardware event primitive for one pipe pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrimitiveKind {
    /// Hardware event type id.
    pub id: u16,
    /// Number of event identities the planner may allocate for this pair.
    pub pool_size: u8,
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}/{}", self.id, self.pool_size)
    }
}

/// Static table of legal (producer, consumer) unit pairs.
#[derive(Debug, Clone, Default)]
pub struct UnitGraph {
    table: BTreeMap<(ExecutionUnit, ExecutionUnit), PrimitiveKind>,
}

/// Data-flow pairs of the default target, besides the scalar unit.
fn standard_pairs() -> [(ExecutionUnit, ExecutionUnit); 18] {
    use ExecutionUnit::*;
    [
        // Matrix core
        (Load, Transform),
        (Transform, Load),
        (Load, Compute),
        (Compute, Load),
        (Transform, Compute),
        (Compute, Transform),
        (Compute, Fixpipe),
        (Fixpipe, Compute),
        (Fixpipe, Load),
        (Load, Fixpipe),
        (Fixpipe, Transform),
        (Transform, Fixpipe),
        // Vector core
        (Load, Vector),
        (Vector, Load),
        (Vector, Store),
        (Store, Vector),
        (Load, Store),
        (Store, Load),
    ]
}

fn primitive_id(producer: ExecutionUnit, consumer: ExecutionUnit) -> u16 {
    ((producer as u16) << 8) | consumer as u16
}

impl UnitGraph {
    /// Empty graph: every pair is illegal.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Default target description.
    ///
    /// The scalar unit can signal and be signalled by every other unit. The
    /// Transform -> Compute pool is reduced by the identities the runtime
    /// keeps for itself.
    pub fn standard() -> Self {
        let mut graph = Self::empty();
        for (p, c) in standard_pairs() {
            graph = graph.with_pair(p, c, spec::EVENT_IDS_PER_PIPE_PAIR);
        }
        for unit in ExecutionUnit::ALL {
            if unit != ExecutionUnit::Scalar {
                graph = graph
                    .with_pair(ExecutionUnit::Scalar, unit, spec::EVENT_IDS_PER_PIPE_PAIR)
                    .with_pair(unit, ExecutionUnit::Scalar, spec::EVENT_IDS_PER_PIPE_PAIR);
            }
        }
        graph.with_pair(
            ExecutionUnit::Transform,
            ExecutionUnit::Compute,
            spec::EVENT_IDS_PER_PIPE_PAIR - spec::RESERVED_TRANSFORM_COMPUTE_IDS,
        )
    }

    /// Every ordered pair of distinct units is legal.
    pub fn fully_connected() -> Self {
        let mut graph = Self::empty();
        for p in ExecutionUnit::ALL {
            for c in ExecutionUnit::ALL {
                if p != c {
                    graph = graph.with_pair(p, c, spec::EVENT_IDS_PER_PIPE_PAIR);
                }
            }
        }
        graph
    }

    /// Add (or replace) a legal pair.
    pub fn with_pair(mut self, producer: ExecutionUnit, consumer: ExecutionUnit, pool_size: u8) -> Self {
        self.table.insert(
            (producer, consumer),
            PrimitiveKind {
                id: primitive_id(producer, consumer),
                pool_size,
            },
        );
        self
    }

    /// Remove a pair.
    pub fn without_pair(mut self, producer: ExecutionUnit, consumer: ExecutionUnit) -> Self {
        self.table.remove(&(producer, consumer));
        self
    }

    /// Primitive for a pair, or `None` when the pair cannot synchronize.
    ///
    /// Callers turn `None` into `SyncError::NoLegalPath` with a position.
    pub fn look_up(&self, producer: ExecutionUnit, consumer: ExecutionUnit) -> Option<PrimitiveKind> {
        self.table.get(&(producer, consumer)).copied()
    }

    /// Number of legal pairs.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionUnit::*;

    #[test]
    fn test_standard_pairs() {
        let graph = UnitGraph::standard();
        let ld_tr = graph.look_up(Load, Transform).unwrap();
        assert_eq!(ld_tr.pool_size, spec::EVENT_IDS_PER_PIPE_PAIR);
        assert_eq!(graph.look_up(Vector, Store).unwrap().pool_size, 8);
        assert!(graph.look_up(Scalar, Compute).is_some());
        assert!(graph.look_up(Vector, Scalar).is_some());
    }

    #[test]
    fn test_reserved_transform_compute() {
        let graph = UnitGraph::standard();
        let kind = graph.look_up(Transform, Compute).unwrap();
        assert_eq!(
            kind.pool_size,
            spec::EVENT_IDS_PER_PIPE_PAIR - spec::RESERVED_TRANSFORM_COMPUTE_IDS
        );
        // The reverse direction keeps the full pool.
        assert_eq!(graph.look_up(Compute, Transform).unwrap().pool_size, 8);
    }

    #[test]
    fn test_illegal_pairs() {
        let graph = UnitGraph::standard();
        assert!(graph.look_up(Compute, Vector).is_none());
        assert!(graph.look_up(Transform, Store).is_none());
        assert!(graph.look_up(Load, Load).is_none());
    }

    #[test]
    fn test_custom_graph() {
        let graph = UnitGraph::fully_connected().without_pair(Load, Compute);
        assert!(graph.look_up(Load, Compute).is_none());
        assert!(graph.look_up(Compute, Vector).is_some());
        assert_eq!(graph.len(), 7 * 6 - 1);

        let tiny = UnitGraph::empty().with_pair(Load, Compute, 2);
        assert_eq!(tiny.look_up(Load, Compute).unwrap().pool_size, 2);
        assert_ne!(
            tiny.look_up(Load, Compute).unwrap().id,
            primitive_id(Compute, Load)
        );
    }
}
