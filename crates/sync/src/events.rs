//! Instrumentation events.
//!
//! The downloader and fetcher report every request they issue, answer, drop
//! or give up on as an [`Event`]. What happens to the events is up to the
//! [`EventSink`] the caller injects; nothing here keeps process-wide state.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Hashes,
    Blocks,
    Headers,
    Bodies,
    Receipts,
    States,
    Announces,
    Broadcasts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    /// Items received.
    In,
    /// Items requested.
    Out,
    /// Items discarded: malformed, stale or over a limit.
    Drop,
    /// Items whose request passed its deadline.
    Timeout,
    /// Items discarded because the sender exceeded its rate allowance.
    Dos,
    /// Announcements accepted for retrieval.
    FilterIn,
    /// Announcements filtered as already known or scheduled.
    FilterOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub category: Category,
    pub direction: Direction,
    pub count: u64,
    pub bytes: u64,
}

impl Event {
    pub fn new(category: Category, direction: Direction, count: usize, bytes: usize) -> Self {
        Self {
            category,
            direction,
            count: count as u64,
            bytes: bytes as u64,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?} count={} bytes={}",
            self.category, self.direction, self.count, self.bytes
        )
    }
}

/// Receiver of instrumentation events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn record(&self, event: Event);
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn record(&self, event: Event) {
        (**self).record(event)
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn record(&self, _event: Event) {}
}

/// Keeps every event in arrival order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn matching(&self, category: Category, direction: Direction) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.category == category && e.direction == direction)
            .copied()
            .collect()
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}

/// Running totals per (category, direction).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub events: u64,
    pub count: u64,
    pub bytes: u64,
}

#[derive(Debug, Default)]
pub struct CountingSink {
    totals: Mutex<BTreeMap<(Category, Direction), Totals>>,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn totals(&self, category: Category, direction: Direction) -> Totals {
        self.totals
            .lock()
            .get(&(category, direction))
            .copied()
            .unwrap_or_default()
    }

    pub fn count(&self, category: Category, direction: Direction) -> u64 {
        self.totals(category, direction).count
    }

    /// All non-zero totals, ordered by category then direction.
    pub fn snapshot(&self) -> Vec<(Category, Direction, Totals)> {
        self.totals
            .lock()
            .iter()
            .map(|(&(c, d), &t)| (c, d, t))
            .collect()
    }
}

impl EventSink for CountingSink {
    fn record(&self, event: Event) {
        let mut totals = self.totals.lock();
        let entry = totals.entry((event.category, event.direction)).or_default();
        entry.events += 1;
        entry.count += event.count;
        entry.bytes += event.bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_sink_accumulates() {
        let sink = CountingSink::new();
        sink.record(Event::new(Category::Headers, Direction::In, 192, 100_000));
        sink.record(Event::new(Category::Headers, Direction::In, 8, 4_000));
        sink.record(Event::new(Category::Bodies, Direction::Timeout, 128, 0));

        let headers = sink.totals(Category::Headers, Direction::In);
        assert_eq!(headers.events, 2);
        assert_eq!(headers.count, 200);
        assert_eq!(headers.bytes, 104_000);
        assert_eq!(sink.count(Category::Bodies, Direction::Timeout), 128);
        assert_eq!(sink.count(Category::Receipts, Direction::In), 0);
        assert_eq!(sink.snapshot().len(), 2);
    }

    #[test]
    fn memory_sink_through_arc() {
        let sink = Arc::new(MemorySink::new());
        let dyn_sink: Arc<dyn EventSink> = sink.clone();
        dyn_sink.record(Event::new(Category::Announces, Direction::Dos, 1, 0));
        assert_eq!(sink.matching(Category::Announces, Direction::Dos).len(), 1);
        assert!(sink.matching(Category::Announces, Direction::In).is_empty());
    }
}
