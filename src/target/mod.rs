//! Target description: execution units, core groups and the pipe-pair graph.

pub mod graph;
pub mod spec;
pub mod unit;

pub use graph::{PrimitiveKind, UnitGraph};
pub use unit::{CoreGroup, ExecutionUnit, Lane};
