//! Pooled reassembly slots for partial frames and partial encodings.
//!
//! A slot is a fixed-capacity byte buffer a connection borrows while a
//! partial inbound frame or unsent outbound encoding is pending. The
//! pool bounds total buffering across the engine: acquisition can
//! fail, and the caller must treat that as fatal for its connection.

use bytes::BytesMut;

/// Bounded pool of fixed-capacity reassembly buffers.
#[derive(Debug)]
pub struct SlotPool {
    slot_capacity: usize,
    max_slots: usize,
    free: Vec<BytesMut>,
    outstanding: usize,
}

impl SlotPool {
    /// Create a pool of at most `max_slots` buffers of `slot_capacity`
    /// bytes each. Buffers are allocated lazily on first acquisition.
    #[must_use]
    pub fn new(max_slots: usize, slot_capacity: usize) -> Self {
        Self {
            slot_capacity,
            max_slots,
            free: Vec::new(),
            outstanding: 0,
        }
    }

    /// Capacity in bytes of each slot.
    #[must_use]
    pub const fn slot_capacity(&self) -> usize { self.slot_capacity }

    /// Number of slots currently lent out.
    #[must_use]
    pub const fn outstanding(&self) -> usize { self.outstanding }

    /// Borrow a cleared slot, or `None` when the pool is exhausted.
    #[must_use]
    pub fn acquire(&mut self) -> Option<BytesMut> {
        if let Some(slot) = self.free.pop() {
            self.outstanding += 1;
            return Some(slot);
        }
        if self.outstanding >= self.max_slots {
            return None;
        }
        self.outstanding += 1;
        Some(BytesMut::with_capacity(self.slot_capacity))
    }

    /// Return a slot to the pool.
    pub fn release(&mut self, mut slot: BytesMut) {
        debug_assert!(self.outstanding > 0, "release without acquire");
        slot.clear();
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.free.len() + self.outstanding < self.max_slots {
            self.free.push(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SlotPool;

    #[test]
    fn acquire_fails_once_exhausted() {
        let mut pool = SlotPool::new(2, 64);
        let a = pool.acquire().expect("first slot");
        let _b = pool.acquire().expect("second slot");
        assert!(pool.acquire().is_none());

        pool.release(a);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn released_slots_come_back_cleared() {
        let mut pool = SlotPool::new(1, 64);
        let mut slot = pool.acquire().expect("slot");
        slot.extend_from_slice(b"leftover");
        pool.release(slot);

        let slot = pool.acquire().expect("slot again");
        assert!(slot.is_empty());
    }
}
