//! Rotating scratch buffers for message reassembly.
//!
//! The pool pre-allocates `depth` byte buffers and hands them out in strict
//! rotation. Buffers grow in place when a message is larger than anything
//! the slot held before and are never released, so after warm-up the
//! receive path performs no allocation beyond the final payload handoff.
//!
//! # Overrun detection
//!
//! Rotation means a slot is handed out again after `depth` acquisitions
//! whether or not its previous owner finished. Every acquisition bumps the
//! slot's generation; a [`SlotHandle`] remembers the generation it was
//! issued with, and any access through a stale handle returns `None`.
//! An overrun therefore drops the older message instead of letting two
//! messages write into the same bytes.

use std::mem;

/// Default number of slots.
pub const DEFAULT_POOL_DEPTH: usize = 100;

/// Ticket for one acquisition of a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle {
    index: usize,
    generation: u64,
}

#[derive(Debug, Default)]
struct Slot {
    buf: Vec<u8>,
    generation: u64,
}

#[derive(Debug)]
pub struct FragmentRingPool {
    slots: Vec<Slot>,
    cursor: usize,
    next_generation: u64,
}

impl FragmentRingPool {
    /// Creates a pool of `depth` slots, each pre-sized to `initial_capacity`.
    ///
    /// A depth of zero is treated as one.
    #[must_use]
    pub fn new(depth: usize, initial_capacity: usize) -> Self {
        let slots = (0..depth.max(1))
            .map(|_| Slot {
                buf: Vec::with_capacity(initial_capacity),
                generation: 0,
            })
            .collect();
        Self {
            slots,
            cursor: 0,
            next_generation: 1,
        }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Hands out the next slot in rotation, zero-filled to `min_size` bytes.
    ///
    /// Any handle previously issued for the same slot becomes stale.
    pub fn acquire(&mut self, min_size: usize) -> SlotHandle {
        let index = self.cursor;
        self.cursor = (self.cursor + 1) % self.slots.len();

        let generation = self.next_generation;
        self.next_generation += 1;

        let slot = &mut self.slots[index];
        slot.generation = generation;
        slot.buf.clear();
        slot.buf.resize(min_size, 0);

        SlotHandle { index, generation }
    }

    /// Returns `true` while no later acquisition has reused the slot.
    #[must_use]
    pub fn is_live(&self, handle: SlotHandle) -> bool {
        self.slots
            .get(handle.index)
            .is_some_and(|s| s.generation == handle.generation)
    }

    /// Mutable view of the slot, or `None` if the handle was overrun.
    pub fn get_mut(&mut self, handle: SlotHandle) -> Option<&mut [u8]> {
        let slot = self.slots.get_mut(handle.index)?;
        (slot.generation == handle.generation).then_some(slot.buf.as_mut_slice())
    }

    /// Moves the first `len` bytes out of the slot.
    ///
    /// The slot keeps no capacity afterwards and regrows on its next
    /// acquisition. Returns `None` if the handle was overrun.
    pub fn take(&mut self, handle: SlotHandle, len: usize) -> Option<Vec<u8>> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        // Invalidate so a second take through the same handle fails.
        slot.generation = 0;
        let mut buf = mem::take(&mut slot.buf);
        buf.truncate(len);
        Some(buf)
    }

    /// Invalidates a handle without moving its bytes out.
    pub fn release(&mut self, handle: SlotHandle) {
        if let Some(slot) = self.slots.get_mut(handle.index)
            && slot.generation == handle.generation
        {
            slot.generation = 0;
        }
    }
}
