//! Target architecture constants for the synchronization planner.
//!
//! These values describe the hardware the emitted plan runs on: how many
//! event identities exist per producer/consumer pipe pair, how deep the
//! cross-group flags count, and how far buffers may rotate.

// ============================================================================
// Buffer rotation
// ============================================================================

/// Maximum rotation width of a buffer resource ("penta" buffering).
pub const MAX_ROTATION_WIDTH: u8 = 5;

/// Minimum rotation width (single buffering).
pub const MIN_ROTATION_WIDTH: u8 = 1;

// ============================================================================
// Intra-group events
// ============================================================================

/// Hardware event identities available per (producer pipe, consumer pipe).
/// Every slot of a round-robin event consumes one identity from this pool.
pub const EVENT_IDS_PER_PIPE_PAIR: u8 = 8;

/// Identities reserved by the runtime on the Transform -> Compute pair.
/// The remaining identities are what the planner may hand out.
pub const RESERVED_TRANSFORM_COMPUTE_IDS: u8 = 2;

// ============================================================================
// Cross-group flags
// ============================================================================

/// Number of cross-group flag ids per (source group, destination group).
pub const CROSS_GROUP_FLAG_IDS: u8 = 16;

/// Maximum count a cross-group flag can hold before a signal is lost.
pub const CROSS_GROUP_FLAG_DEPTH: u8 = 15;

// ============================================================================
// Analysis bounds
// ============================================================================

/// Extra analysis iterations beyond two full rotations, so that every
/// loop-carried slot reuse shows up at least twice during analysis.
pub const ANALYSIS_SLACK_ITERATIONS: u32 = 2;

/// Default cap on known trip counts when the verifier expands loops.
pub const DEFAULT_VERIFY_TRIP_CAP: u32 = 64;

/// Default stand-in values for symbolic trip counts during verification.
pub const DEFAULT_SYMBOLIC_TRIPS: [u64; 4] = [0, 1, 3, 8];
