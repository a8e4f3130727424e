//! Buffer resources and their rotation.
//!
//! A [`BufferResource`] is a logical buffer backed by W physical slots
//! (single through penta buffering). Which slot an access touches is decided
//! by the resource's rotation loop; per-slot bookkeeping lives in a
//! [`SlotRing`] whose width is carried by the resource's [`RotationWidth`].

use super::operation::LoopId;
use crate::error::SyncError;
use crate::target::spec;
use crate::target::ExecutionUnit;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;

/// Number of physical slots of a rotating buffer (1..=5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RotationWidth(u8);

impl RotationWidth {
    pub const SINGLE: RotationWidth = RotationWidth(1);
    pub const DOUBLE: RotationWidth = RotationWidth(2);
    pub const TRIPLE: RotationWidth = RotationWidth(3);
    pub const QUAD: RotationWidth = RotationWidth(4);
    pub const PENTA: RotationWidth = RotationWidth(5);

    /// Validate a raw width.
    pub fn new(width: u8) -> Result<Self, SyncError> {
        if (spec::MIN_ROTATION_WIDTH..=spec::MAX_ROTATION_WIDTH).contains(&width) {
            Ok(Self(width))
        } else {
            Err(SyncError::InvalidRotationWidth(width))
        }
    }

    #[inline]
    pub fn get(self) -> u8 {
        self.0
    }

    /// Conventional buffering name.
    pub fn name(self) -> &'static str {
        match self.0 {
            1 => "single",
            2 => "double",
            3 => "triple",
            4 => "quad",
            _ => "penta",
        }
    }
}

impl fmt::Display for RotationWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Index of a resource in its [`ResourceTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u32);

impl ResourceId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A logical buffer shared between execution units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferResource {
    /// Unique name within the kernel.
    pub name: String,
    /// Number of physical slots.
    pub width: RotationWidth,
    /// Units allowed to access the buffer. Empty means every unit.
    pub visible: SmallVec<[ExecutionUnit; 4]>,
    /// Initialized by the host before the kernel starts.
    pub external: bool,
    /// Loop whose iterations advance the slot pointer. `None` picks the
    /// innermost loop enclosing every in-loop access.
    pub rotate_in: Option<LoopId>,
}

impl BufferResource {
    /// Create a resource visible to every unit.
    pub fn new(name: impl Into<String>, width: RotationWidth) -> Self {
        Self {
            name: name.into(),
            width,
            visible: SmallVec::new(),
            external: false,
            rotate_in: None,
        }
    }

    /// Restrict access to the given units.
    pub fn visible_to(mut self, units: &[ExecutionUnit]) -> Self {
        self.visible = units.iter().copied().collect();
        self
    }

    /// Mark the buffer as host-initialized.
    pub fn external(mut self) -> Self {
        self.external = true;
        self
    }

    /// Advance the slot pointer once per iteration of `id`.
    pub fn rotating_in(mut self, id: &str) -> Self {
        self.rotate_in = Some(LoopId::from(id));
        self
    }

    /// Whether `unit` may read or write this buffer.
    pub fn is_visible(&self, unit: ExecutionUnit) -> bool {
        self.visible.is_empty() || self.visible.contains(&unit)
    }
}

/// All resources declared by a kernel.
#[derive(Debug, Clone, Default)]
pub struct ResourceTable {
    resources: Vec<BufferResource>,
    by_name: HashMap<String, ResourceId>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a resource. Names must be unique.
    pub fn add(&mut self, resource: BufferResource) -> Result<ResourceId, SyncError> {
        if self.by_name.contains_key(&resource.name) {
            return Err(SyncError::DuplicateName {
                what: "resource",
                name: resource.name,
            });
        }
        let id = ResourceId(self.resources.len() as u32);
        self.by_name.insert(resource.name.clone(), id);
        self.resources.push(resource);
        Ok(id)
    }

    /// Look up a resource id by name.
    pub fn lookup(&self, name: &str) -> Option<ResourceId> {
        self.by_name.get(name).copied()
    }

    /// Get a resource. Panics on ids from another table.
    pub fn get(&self, id: ResourceId) -> &BufferResource {
        &self.resources[id.index()]
    }

    /// Name of a resource, for diagnostics.
    pub fn name(&self, id: ResourceId) -> &str {
        &self.resources[id.index()].name
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceId, &BufferResource)> {
        self.resources
            .iter()
            .enumerate()
            .map(|(i, r)| (ResourceId(i as u32), r))
    }
}

/// Fixed-capacity ring of per-slot state.
///
/// Capacity is the hardware maximum; only the first `width` entries are
/// ever addressed.
#[derive(Debug, Clone)]
pub struct SlotRing<T> {
    width: RotationWidth,
    slots: [T; spec::MAX_ROTATION_WIDTH as usize],
}

impl<T: Default> SlotRing<T> {
    pub fn new(width: RotationWidth) -> Self {
        Self {
            width,
            slots: std::array::from_fn(|_| T::default()),
        }
    }
}

impl<T> SlotRing<T> {
    #[inline]
    pub fn width(&self) -> RotationWidth {
        self.width
    }

    /// Slot used by the given generation (running buffer counter).
    #[inline]
    pub fn slot_of(&self, generation: u64) -> usize {
        (generation % self.width.get() as u64) as usize
    }

    #[inline]
    pub fn slot(&self, slot: usize) -> &T {
        &self.slots[slot % self.width.get() as usize]
    }

    #[inline]
    pub fn slot_mut(&mut self, slot: usize) -> &mut T {
        &mut self.slots[slot % self.width.get() as usize]
    }

    /// State of the slot a generation lands in.
    #[inline]
    pub fn at_generation_mut(&mut self, generation: u64) -> &mut T {
        let slot = self.slot_of(generation);
        &mut self.slots[slot]
    }

    /// Iterate the addressable slots.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots[..self.width.get() as usize].iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_width_bounds() {
        assert!(RotationWidth::new(0).is_err());
        assert_eq!(RotationWidth::new(3).unwrap(), RotationWidth::TRIPLE);
        assert!(matches!(
            RotationWidth::new(6),
            Err(SyncError::InvalidRotationWidth(6))
        ));
        assert_eq!(RotationWidth::PENTA.name(), "penta");
    }

    #[test]
    fn test_resource_table() {
        let mut table = ResourceTable::new();
        let a = table
            .add(BufferResource::new("a", RotationWidth::DOUBLE))
            .unwrap();
        let b = table
            .add(BufferResource::new("b", RotationWidth::SINGLE).external())
            .unwrap();
        assert_eq!(table.lookup("a"), Some(a));
        assert_eq!(table.name(b), "b");
        assert!(table.get(b).external);
        assert_eq!(table.len(), 2);

        let dup = table.add(BufferResource::new("a", RotationWidth::SINGLE));
        assert!(matches!(dup, Err(SyncError::DuplicateName { .. })));
    }

    #[test]
    fn test_visibility() {
        let open = BufferResource::new("gm", RotationWidth::SINGLE);
        assert!(open.is_visible(ExecutionUnit::Vector));

        let l1 = BufferResource::new("l1", RotationWidth::DOUBLE)
            .visible_to(&[ExecutionUnit::Load, ExecutionUnit::Transform]);
        assert!(l1.is_visible(ExecutionUnit::Transform));
        assert!(!l1.is_visible(ExecutionUnit::Vector));
    }

    #[test]
    fn test_slot_ring_rotation() {
        let mut ring: SlotRing<u32> = SlotRing::new(RotationWidth::TRIPLE);
        for generation in 0..7 {
            *ring.at_generation_mut(generation) += 1;
        }
        // Generations 0,3,6 -> slot 0; 1,4 -> slot 1; 2,5 -> slot 2
        let counts: Vec<u32> = ring.iter().copied().collect();
        assert_eq!(counts, vec![3, 2, 2]);
        assert_eq!(ring.slot_of(4), 1);
    }
}
