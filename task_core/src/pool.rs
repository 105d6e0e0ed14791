//! Free-list record pool with generational keys.
//!
//! Records live in a growable slot array; destroyed slots go onto a free list
//! and are handed out again by the next `create`. Every slot carries a
//! generation that is bumped on destroy, so a key kept past its record's
//! lifetime never resolves to whatever occupies the slot afterwards.

use std::fmt;
use std::mem;
use std::sync::Arc;

use crate::alloc::{AllocError, CategoryAllocator, MemoryCategory};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey {
    index: u32,
    generation: u32,
}

impl PoolKey {
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    pub fn to_bits(self) -> u64 {
        (u64::from(self.index) << 32) | u64::from(self.generation)
    }

    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: (bits >> 32) as u32,
            generation: bits as u32,
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

// Zero is never a live generation.
fn next_generation(generation: u32) -> u32 {
    match generation.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

struct PoolSlot<T> {
    value: Option<T>,
    generation: u32,
}

pub struct Pool<T> {
    slots: Vec<PoolSlot<T>>,
    free: Vec<u32>,
    live: usize,
    category: MemoryCategory,
    allocator: Arc<dyn CategoryAllocator>,
}

impl<T> Pool<T> {
    pub fn new(category: MemoryCategory, allocator: Arc<dyn CategoryAllocator>) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            category,
            allocator,
        }
    }

    pub fn with_prewarm(
        category: MemoryCategory,
        allocator: Arc<dyn CategoryAllocator>,
        count: usize,
    ) -> Result<Self, AllocError> {
        let mut pool = Self::new(category, allocator);
        pool.grow(count)?;
        Ok(pool)
    }

    fn slot_bytes() -> usize {
        mem::size_of::<PoolSlot<T>>()
    }

    pub fn grow(&mut self, count: usize) -> Result<(), AllocError> {
        if count == 0 {
            return Ok(());
        }
        self.allocator
            .allocate(self.category, Self::slot_bytes() * count)?;
        self.slots.reserve(count);
        for _ in 0..count {
            let index = self.slots.len() as u32;
            self.slots.push(PoolSlot {
                value: None,
                generation: 1,
            });
            self.free.push(index);
        }
        // Hand out lower indices first.
        self.free.sort_unstable_by(|a, b| b.cmp(a));
        Ok(())
    }

    pub fn create(&mut self, value: T) -> Result<PoolKey, AllocError> {
        if self.free.is_empty() {
            self.grow(1)?;
        }
        let Some(index) = self.free.pop() else {
            unreachable!("pool grew without producing a free slot");
        };
        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        self.live += 1;
        Ok(PoolKey::new(index, slot.generation))
    }

    pub fn destroy(&mut self, key: PoolKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = next_generation(slot.generation);
        self.free.push(key.index);
        self.live -= 1;
        Some(value)
    }

    pub fn get(&self, key: PoolKey) -> Option<&T> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, key: PoolKey) -> Option<&mut T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn contains(&self, key: PoolKey) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    // Slots ever grown, which tracks peak occupancy.
    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn clear(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.live);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.generation = next_generation(slot.generation);
                self.free.push(index as u32);
                drained.push(value);
            }
        }
        self.live = 0;
        drained
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        self.allocator
            .free(self.category, Self::slot_bytes() * self.slots.len());
    }
}
