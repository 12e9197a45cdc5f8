//! Access Events - the unit the analyzer consumes, and a bounded ring of them.

use serde::{Deserialize, Serialize};

/// One observed memory access.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryAccessEvent {
    /// Absolute address of the first byte touched
    pub address: u64,
    /// Bytes touched (0 is treated as 1)
    pub size: u32,
    pub is_write: bool,
    /// Monotonic sequence number or cycle count
    pub timestamp: u64,
    /// Optional instruction address that issued the access
    pub instruction: Option<u64>,
    /// Optional id of the issuing thread
    pub thread_id: Option<u32>,
}

impl MemoryAccessEvent {
    #[inline]
    pub const fn new(address: u64, size: u32, is_write: bool, timestamp: u64) -> Self {
        Self {
            address,
            size,
            is_write,
            timestamp,
            instruction: None,
            thread_id: None,
        }
    }

    #[inline]
    pub const fn read(address: u64, size: u32, timestamp: u64) -> Self {
        Self::new(address, size, false, timestamp)
    }

    #[inline]
    pub const fn write(address: u64, size: u32, timestamp: u64) -> Self {
        Self::new(address, size, true, timestamp)
    }

    #[inline]
    pub const fn with_thread(mut self, thread_id: u32) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    #[inline]
    pub const fn with_instruction(mut self, instruction: u64) -> Self {
        self.instruction = Some(instruction);
        self
    }

    /// First and last line index touched, for a given line size.
    #[inline]
    pub const fn line_span(&self, line_size: u64) -> (u64, u64) {
        let len = if self.size == 0 { 1 } else { self.size as u64 };
        let first = self.address / line_size;
        let last = (self.address + len - 1) / line_size;
        (first, last)
    }
}

/// Fixed-capacity ring that overwrites its oldest entry when full.
#[derive(Clone, Debug)]
pub struct EventRing {
    slots: Vec<MemoryAccessEvent>,
    /// Index of the oldest entry
    head: usize,
    len: usize,
}

impl EventRing {
    /// A ring holding up to `capacity` events (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![MemoryAccessEvent::default(); capacity.max(1)],
            head: 0,
            len: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    /// Append an event. Returns the overwritten oldest event when full.
    #[inline]
    pub fn push(&mut self, event: MemoryAccessEvent) -> Option<MemoryAccessEvent> {
        let cap = self.slots.len();
        if self.len == cap {
            let evicted = std::mem::replace(&mut self.slots[self.head], event);
            self.head = (self.head + 1) % cap;
            Some(evicted)
        } else {
            let tail = (self.head + self.len) % cap;
            self.slots[tail] = event;
            self.len += 1;
            None
        }
    }

    /// The `index`-th event counting from the oldest.
    #[inline]
    pub fn get(&self, index: usize) -> Option<&MemoryAccessEvent> {
        (index < self.len).then(|| &self.slots[(self.head + index) % self.slots.len()])
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &MemoryAccessEvent> + '_ {
        (0..self.len).map(move |i| &self.slots[(self.head + i) % self.slots.len()])
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}
