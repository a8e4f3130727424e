//! Kernel model: resources, operations, loops.

pub mod kernel;
pub mod operation;
pub mod resource;

pub use kernel::{Kernel, KernelItem, UserEvent};
pub use operation::{
    ArmRef, BranchId, BranchSpec, Layout, LoopFrame, LoopId, LoopSpec, Operation, Position, TripCount,
    WorkKind,
};
pub use resource::{BufferResource, ResourceId, ResourceTable, RotationWidth, SlotRing};
