//! Intra-group event allocation.
//!
//! Every synchronization channel (producer lane, consumer lane, resource,
//! scope, class) gets one [`SyncEvent`], allocated once and reused across
//! all iterations. A channel of width K draws the K lowest free hardware
//! identities from the pool of its (group, producer unit, consumer unit)
//! pair; identities the kernel reserved for its own events are never handed
//! out.
//!
//! When a pool runs dry, a channel may take over an earlier event of the
//! same pair whose live span ended before its own starts, provided the
//! event is wide enough and has the same class and preset depth. Both
//! channels then run one continuous sequence on the same identities.
//!
//! # Usage
//!
//! ```ignore
//! let graph = UnitGraph::standard();
//! let mut events = EventAllocator::new(&graph);
//! let id = events.allocate(key, 2, &position)?;
//! assert_eq!(events.get(id).kind, EventKind::RoundRobin(2));
//! ```

use super::hazards::EdgeClass;
use super::program::NodeId;
use crate::error::SyncError;
use crate::model::{Position, ResourceId};
use crate::target::{CoreGroup, ExecutionUnit, Lane, PrimitiveKind, UnitGraph};
use log::debug;
use smallvec::SmallVec;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// What an event or barrier synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey {
    pub producer: Lane,
    pub consumer: Lane,
    pub resource: ResourceId,
    pub scope: Option<NodeId>,
    pub class: EdgeClass,
}

/// Event identifier within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u32);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Event flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// One identity; sets and waits strictly alternate.
    Single,
    /// K identities used in round-robin order.
    RoundRobin(u32),
}

impl EventKind {
    pub fn for_width(width: u32) -> Self {
        if width <= 1 {
            EventKind::Single
        } else {
            EventKind::RoundRobin(width)
        }
    }

    /// Number of sets that may be outstanding.
    pub fn width(self) -> u32 {
        match self {
            EventKind::Single => 1,
            EventKind::RoundRobin(k) => k,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Single => write!(f, "single"),
            EventKind::RoundRobin(k) => write!(f, "round-robin({})", k),
        }
    }
}

/// Top-level program positions (indices into the root list) an event is
/// live over, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    /// The whole kernel; such an event is never shared.
    pub const WHOLE: Span = Span {
        start: 0,
        end: usize::MAX,
    };

    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// What a channel asks the allocator for.
#[derive(Debug, Clone, Copy)]
pub struct EventRequest {
    pub key: ChannelKey,
    pub width: u32,
    /// Signals issued before the first wait (carried distance).
    pub presets: u32,
    pub span: Span,
}

/// Outcome of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    /// Fresh identities.
    Fresh(EventId),
    /// An earlier event, now also carrying this channel.
    Shared(EventId),
}

impl Grant {
    pub fn id(self) -> EventId {
        match self {
            Grant::Fresh(id) | Grant::Shared(id) => id,
        }
    }
}

/// An allocated event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    pub id: EventId,
    pub key: ChannelKey,
    pub kind: EventKind,
    pub primitive: PrimitiveKind,
    /// Hardware identities, cycled in order.
    pub identities: SmallVec<[u8; 5]>,
    /// Initially satisfied (carried channels).
    pub preset: bool,
    /// Later channels that took this event over.
    pub shared: Vec<ChannelKey>,
}

impl SyncEvent {
    /// Every channel the event carries, first owner first.
    pub fn channels(&self) -> impl Iterator<Item = &ChannelKey> {
        std::iter::once(&self.key).chain(self.shared.iter())
    }
}

type Pair = (CoreGroup, ExecutionUnit, ExecutionUnit);

#[derive(Debug, Clone, Copy)]
struct Lifetime {
    span: Span,
    presets: u32,
}

/// Allocation context for one planning run.
#[derive(Debug)]
pub struct EventAllocator<'g> {
    graph: &'g UnitGraph,
    pool_override: Option<u8>,
    events: Vec<SyncEvent>,
    lifetimes: Vec<Lifetime>,
    by_key: HashMap<ChannelKey, EventId>,
    /// Identities allocated or reserved, per pair.
    taken: HashMap<Pair, BTreeSet<u8>>,
}

impl<'g> EventAllocator<'g> {
    pub fn new(graph: &'g UnitGraph) -> Self {
        Self {
            graph,
            pool_override: None,
            events: Vec::new(),
            lifetimes: Vec::new(),
            by_key: HashMap::new(),
            taken: HashMap::new(),
        }
    }

    /// Replace every pair's pool size.
    pub fn with_pool_size(mut self, pool: Option<u8>) -> Self {
        self.pool_override = pool;
        self
    }

    /// Keep identity `id` of a pair out of allocation.
    pub fn reserve(&mut self, producer: Lane, consumer: Lane, id: u8) {
        self.taken
            .entry((producer.group, producer.unit, consumer.unit))
            .or_default()
            .insert(id);
    }

    /// Event for a channel live over the whole kernel, allocating `width`
    /// identities on first request.
    ///
    /// `at` is reported in errors.
    pub fn allocate(&mut self, key: ChannelKey, width: u32, at: &Position) -> Result<EventId, SyncError> {
        let request = EventRequest {
            key,
            width,
            presets: 0,
            span: Span::WHOLE,
        };
        self.request(request, at).map(Grant::id)
    }

    /// Event for a channel, sharing an expired one when the pool is short.
    pub fn request(&mut self, request: EventRequest, at: &Position) -> Result<Grant, SyncError> {
        let key = request.key;
        if let Some(&id) = self.by_key.get(&key) {
            return Ok(Grant::Fresh(id));
        }
        let (producer, consumer) = (key.producer, key.consumer);
        let primitive = self
            .graph
            .look_up(producer.unit, consumer.unit)
            .filter(|_| !producer.crosses_group(consumer))
            .ok_or_else(|| SyncError::NoLegalPath {
                producer,
                consumer,
                position: at.clone(),
            })?;

        let pool = self.pool_override.unwrap_or(primitive.pool_size);
        let pair = (producer.group, producer.unit, consumer.unit);
        let width = request.width.max(1);
        let free: Vec<u8> = {
            let taken = self.taken.get(&pair);
            (0..pool).filter(|i| taken.map_or(true, |t| !t.contains(i))).collect()
        };

        if free.len() < width as usize {
            if let Some(id) = self.expired(pair, &request) {
                let ix = id.0 as usize;
                self.events[ix].shared.push(key);
                self.lifetimes[ix].span.end = request.span.end;
                self.by_key.insert(key, id);
                debug!("{} {}->{} shared by {:?}", id, producer, consumer, key.resource);
                return Ok(Grant::Shared(id));
            }
            return Err(SyncError::EventPoolExhausted {
                group: producer.group,
                producer: producer.unit,
                consumer: consumer.unit,
                requested: width,
                available: free.len() as u32,
                position: at.clone(),
            });
        }

        let identities: SmallVec<[u8; 5]> = free[..width as usize].iter().copied().collect();
        self.taken.entry(pair).or_default().extend(identities.iter().copied());
        let id = EventId(self.events.len() as u32);
        let event = SyncEvent {
            id,
            key,
            kind: EventKind::for_width(width),
            primitive,
            identities,
            preset: false,
            shared: Vec::new(),
        };
        debug!(
            "allocated {} {}->{} {} ids {:?}",
            id, producer, consumer, event.kind, event.identities
        );
        self.events.push(event);
        self.lifetimes.push(Lifetime {
            span: request.span,
            presets: request.presets,
        });
        self.by_key.insert(key, id);
        Ok(Grant::Fresh(id))
    }

    /// Narrowest event of the pair that is over before `request` starts and
    /// can carry it.
    fn expired(&self, pair: Pair, request: &EventRequest) -> Option<EventId> {
        self.events
            .iter()
            .zip(&self.lifetimes)
            .filter(|(e, life)| {
                (e.key.producer.group, e.key.producer.unit, e.key.consumer.unit) == pair
                    && e.key.class == request.key.class
                    && e.kind.width() >= request.width.max(1)
                    && life.presets == request.presets
                    && life.span.end < request.span.start
            })
            .min_by_key(|(e, _)| (e.kind.width(), e.id))
            .map(|(e, _)| e.id)
    }

    /// Flag an event as initially satisfied.
    pub fn mark_preset(&mut self, id: EventId) {
        if let Some(event) = self.events.get_mut(id.0 as usize) {
            event.preset = true;
        }
    }

    pub fn get(&self, id: EventId) -> &SyncEvent {
        &self.events[id.0 as usize]
    }

    pub fn events(&self) -> &[SyncEvent] {
        &self.events
    }

    /// Identities left for a pair.
    pub fn remaining(&self, group: CoreGroup, producer: ExecutionUnit, consumer: ExecutionUnit) -> u32 {
        let pool = self
            .graph
            .look_up(producer, consumer)
            .map(|p| self.pool_override.unwrap_or(p.pool_size))
            .unwrap_or(0);
        let taken = self.taken.get(&(group, producer, consumer));
        (0..pool).filter(|i| taken.map_or(true, |t| !t.contains(i))).count() as u32
    }

    pub fn into_events(self) -> Vec<SyncEvent> {
        self.events
    }
}
