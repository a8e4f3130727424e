//! Cross-group barrier allocation.
//!
//! Lanes in different core groups cannot share events. Dependencies between
//! them go through counting flags: the producing group raises a flag id,
//! the consuming group waits on it. A flag counts up to a fixed depth, so a
//! channel may have at most that many signals outstanding.
//!
//! - **Flag pool**: each (source group, destination group) direction owns
//!   its own set of flag ids.
//! - **Depth**: the outstanding-signal bound of a channel; must fit the
//!   hardware counter.
//! - **Caching**: one barrier per channel, reused across iterations.
//!
//! # Usage
//!
//! ```ignore
//! let mut barriers = BarrierAllocator::new();
//! let id = barriers.allocate(key, 2, &position)?;
//! let barrier = barriers.get(id);
//! assert_eq!(barrier.config.depth, 2);
//! ```

use super::events::ChannelKey;
use crate::error::SyncError;
use crate::model::Position;
use crate::target::{spec, CoreGroup};
use log::debug;
use std::collections::HashMap;
use std::fmt;

/// Barrier identifier within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BarrierId(pub u16);

impl fmt::Display for BarrierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Configuration of one cross-group flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierConfig {
    /// Maximum signals outstanding.
    pub depth: u32,
    /// Initially raised `depth` times (carried channels).
    pub preset: bool,
}

impl BarrierConfig {
    /// Create a new barrier configuration.
    pub fn new(depth: u32) -> Self {
        Self {
            depth,
            preset: false,
        }
    }

    /// Set preset behavior.
    pub fn with_preset(mut self, preset: bool) -> Self {
        self.preset = preset;
        self
    }
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

/// An allocated cross-group barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossGroupBarrier {
    pub id: BarrierId,
    pub key: ChannelKey,
    /// Hardware flag id within the direction's pool.
    pub flag: u8,
    pub config: BarrierConfig,
}

impl CrossGroupBarrier {
    /// Group raising the flag.
    pub fn source(&self) -> CoreGroup {
        self.key.producer.group
    }

    /// Group waiting on the flag.
    pub fn dest(&self) -> CoreGroup {
        self.key.consumer.group
    }
}

/// Allocator for cross-group flags.
#[derive(Debug)]
pub struct BarrierAllocator {
    /// Allocated barriers by id.
    barriers: Vec<CrossGroupBarrier>,
    /// Barrier per channel.
    by_key: HashMap<ChannelKey, BarrierId>,
    /// Next free flag id per direction.
    next_flag: HashMap<(CoreGroup, CoreGroup), u8>,
    /// Flag ids per direction.
    flag_ids: u8,
    /// Counter depth of one flag.
    max_depth: u32,
}

impl Default for BarrierAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BarrierAllocator {
    /// Create an allocator with the target's flag pool.
    pub fn new() -> Self {
        Self::with_limits(spec::CROSS_GROUP_FLAG_IDS, spec::CROSS_GROUP_FLAG_DEPTH as u32)
    }

    /// Create an allocator with custom limits.
    pub fn with_limits(flag_ids: u8, max_depth: u32) -> Self {
        Self {
            barriers: Vec::new(),
            by_key: HashMap::new(),
            next_flag: HashMap::new(),
            flag_ids,
            max_depth,
        }
    }

    /// Barrier for a channel, allocating a flag on first request.
    pub fn allocate(&mut self, key: ChannelKey, depth: u32, at: &Position) -> Result<BarrierId, SyncError> {
        if let Some(&id) = self.by_key.get(&key) {
            return Ok(id);
        }
        let direction = (key.producer.group, key.consumer.group);
        let next = self.next_flag.get(&direction).copied().unwrap_or(0);
        let depth = depth.max(1);
        if next >= self.flag_ids || depth > self.max_depth {
            return Err(SyncError::EventPoolExhausted {
                group: key.producer.group,
                producer: key.producer.unit,
                consumer: key.consumer.unit,
                requested: depth,
                available: if next >= self.flag_ids { 0 } else { self.max_depth },
                position: at.clone(),
            });
        }
        self.next_flag.insert(direction, next + 1);

        let id = BarrierId(self.barriers.len() as u16);
        debug!(
            "allocated {} {}->{} flag {} depth {}",
            id, key.producer, key.consumer, next, depth
        );
        self.barriers.push(CrossGroupBarrier {
            id,
            key,
            flag: next,
            config: BarrierConfig::new(depth),
        });
        self.by_key.insert(key, id);
        Ok(id)
    }

    /// Flag a barrier as initially raised.
    pub fn mark_preset(&mut self, id: BarrierId) {
        if let Some(barrier) = self.barriers.get_mut(id.0 as usize) {
            barrier.config = barrier.config.with_preset(true);
        }
    }

    /// Get a barrier.
    pub fn get(&self, id: BarrierId) -> &CrossGroupBarrier {
        &self.barriers[id.0 as usize]
    }

    /// Get the number of allocated barriers.
    pub fn barrier_count(&self) -> usize {
        self.barriers.len()
    }

    /// Flag ids still free in a direction.
    pub fn free_flags(&self, source: CoreGroup, dest: CoreGroup) -> u8 {
        let used = self.next_flag.get(&(source, dest)).copied().unwrap_or(0);
        self.flag_ids.saturating_sub(used)
    }

    pub fn into_barriers(self) -> Vec<CrossGroupBarrier> {
        self.barriers
    }
}
