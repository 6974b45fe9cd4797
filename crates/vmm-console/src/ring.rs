use std::collections::VecDeque;

use vmm_core::wire::Timestamp;

/// Lines retained per VM before the oldest are overwritten.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Bounded circular log of timestamped console lines.
///
/// Entries are kept in insertion order. The producing clock is
/// non-decreasing, so insertion order is also timestamp order; nothing is
/// re-sorted on read. Single producer, single consumer, one event loop,
/// no internal locking.
#[derive(Debug)]
pub struct ConsoleRing {
    entries: VecDeque<(Timestamp, String)>,
    capacity: usize,
}

impl ConsoleRing {
    pub fn new(capacity: usize) -> ConsoleRing {
        ConsoleRing {
            entries: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Append a line, overwriting the oldest entry on wraparound.
    pub fn write(&mut self, ts: Timestamp, line: String) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((ts, line));
    }

    /// All retained entries with timestamp strictly after `since`, oldest
    /// first. Entries stamped exactly `since` are excluded.
    pub fn read_history(&self, since: Timestamp) -> Vec<(Timestamp, String)> {
        self.entries
            .iter()
            .filter(|(ts, _)| *ts > since)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
