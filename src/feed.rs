//! Event Feed - ships access events from an arena's thread to an analyzer
//! on another thread.
//!
//! Uses the rtrb crate for lock-free SPSC communication. The producing side
//! never blocks: when the ring is full the event is dropped and counted.

use rtrb::{Consumer, Producer, RingBuffer};

use crate::analyzer::L1Analyzer;
use crate::event::{EventRing, MemoryAccessEvent};

/// Create a feed holding up to `capacity` in-flight events.
pub fn event_channel(capacity: usize) -> (EventSink, EventSource) {
    let (producer, consumer) = RingBuffer::new(capacity.max(1));
    (
        EventSink { producer, dropped: 0 },
        EventSource { consumer },
    )
}

/// Producing end, owned by the thread that observes the accesses.
pub struct EventSink {
    producer: Producer<MemoryAccessEvent>,
    dropped: u64,
}

impl EventSink {
    /// Push one event. Returns false (and counts a drop) if the ring is full.
    #[inline]
    pub fn record(&mut self, event: MemoryAccessEvent) -> bool {
        match self.producer.push(event) {
            Ok(()) => true,
            Err(_) => {
                self.dropped += 1;
                false
            }
        }
    }

    /// Push every event of a window, oldest first. Returns how many fit.
    pub fn record_window(&mut self, window: &EventRing) -> usize {
        window.iter().filter(|&&event| self.record(event)).count()
    }

    /// Events lost to a full ring.
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Free slots right now.
    #[inline]
    pub fn slots(&self) -> usize {
        self.producer.slots()
    }

    /// Returns true once the consuming end is gone.
    #[inline]
    pub fn is_abandoned(&self) -> bool {
        self.producer.is_abandoned()
    }
}

/// Consuming end, owned by the analysis thread.
pub struct EventSource {
    consumer: Consumer<MemoryAccessEvent>,
}

impl EventSource {
    /// Move every queued event into `analyzer`. Returns the count.
    pub fn drain_into(&mut self, analyzer: &mut L1Analyzer) -> usize {
        let mut count = 0;
        while let Ok(event) = self.consumer.pop() {
            analyzer.record(event);
            count += 1;
        }
        count
    }

    /// Events waiting to be drained.
    #[inline]
    pub fn len(&self) -> usize {
        self.consumer.slots()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.consumer.is_empty()
    }

    /// Returns true once the producing end is gone.
    #[inline]
    pub fn is_abandoned(&self) -> bool {
        self.consumer.is_abandoned()
    }
}
