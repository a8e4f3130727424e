//! pipesync library
//!
//! Inserts hazard synchronization between the execution units of an
//! accelerator core. A [`Kernel`] lists operations, the units they run on
//! and the rotating buffers they touch; the [`Scheduler`] derives the
//! hazards between units, allocates events and cross-group barriers for
//! them, and re-checks the resulting plan before handing it back.
//!
//! ```no_run
//! use pipesync::{Kernel, Operation, Scheduler};
//! use pipesync::target::ExecutionUnit;
//!
//! let mut kernel = Kernel::new("copy");
//! let r = kernel.buffer("r", 1)?;
//! kernel.push(Operation::new("load", ExecutionUnit::Load).writes(&[r]));
//! kernel.push(Operation::new("mm", ExecutionUnit::Compute).reads(&[r]));
//! let schedule = Scheduler::default().schedule(&kernel)?;
//! print!("{}", schedule.plan);
//! # Ok::<(), pipesync::SyncError>(())
//! ```

pub mod config;
pub mod error;
pub mod model;
pub mod schedule;
pub mod target;
pub mod testing;
pub mod verify;

pub use error::{SyncError, Violation, ViolationKind};
pub use model::{Kernel, LoopSpec, Operation, TripCount};
pub use schedule::{Schedule, ScheduleOptions, Scheduler, SynchronizationPlan};
