//! Ordered, finite event sequences.

use serde::{Deserialize, Serialize};
use std::ops::Index;

use crate::event::EventEnvelope;

/// A finite, ordered sequence of events for one aggregate.
///
/// Events are ordered by per-aggregate version ascending. The combinators
/// (`filter_by_type`, `limit`, `skip`, `reversed`) produce new streams and
/// leave the original untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventStream {
    events: Vec<EventEnvelope>,
}

impl EventStream {
    pub fn new(events: Vec<EventEnvelope>) -> Self {
        Self { events }
    }

    pub fn empty() -> Self {
        Self { events: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn first(&self) -> Option<&EventEnvelope> {
        self.events.first()
    }

    pub fn last(&self) -> Option<&EventEnvelope> {
        self.events.last()
    }

    /// Highest per-aggregate version in the stream, 0 when empty.
    pub fn last_version(&self) -> i64 {
        self.events.last().map(|e| e.version).unwrap_or(0)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EventEnvelope> {
        self.events.iter()
    }

    pub fn as_slice(&self) -> &[EventEnvelope] {
        &self.events
    }

    pub fn into_vec(self) -> Vec<EventEnvelope> {
        self.events
    }

    pub fn filter_by_type(&self, event_type: &str) -> Self {
        Self {
            events: self
                .events
                .iter()
                .filter(|e| e.event_type == event_type)
                .cloned()
                .collect(),
        }
    }

    pub fn limit(&self, count: usize) -> Self {
        Self {
            events: self.events.iter().take(count).cloned().collect(),
        }
    }

    pub fn skip(&self, count: usize) -> Self {
        Self {
            events: self.events.iter().skip(count).cloned().collect(),
        }
    }

    pub fn reversed(&self) -> Self {
        let mut events = self.events.clone();
        events.reverse();
        Self { events }
    }

    pub fn push(&mut self, event: EventEnvelope) {
        self.events.push(event);
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = EventEnvelope>) {
        self.events.extend(events);
    }
}

impl Index<usize> for EventStream {
    type Output = EventEnvelope;

    fn index(&self, index: usize) -> &Self::Output {
        &self.events[index]
    }
}

impl From<Vec<EventEnvelope>> for EventStream {
    fn from(events: Vec<EventEnvelope>) -> Self {
        Self::new(events)
    }
}

impl IntoIterator for EventStream {
    type Item = EventEnvelope;
    type IntoIter = std::vec::IntoIter<EventEnvelope>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}

impl<'a> IntoIterator for &'a EventStream {
    type Item = &'a EventEnvelope;
    type IntoIter = std::slice::Iter<'a, EventEnvelope>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

impl FromIterator<EventEnvelope> for EventStream {
    fn from_iter<T: IntoIterator<Item = EventEnvelope>>(iter: T) -> Self {
        Self {
            events: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::AggregateId;
    use serde_json::json;

    fn stream() -> EventStream {
        let id = AggregateId::new("U-1");
        let mut events = Vec::new();
        for (version, event_type) in [(1, "user.registered"), (2, "user.renamed"), (3, "user.renamed")] {
            events.push(EventEnvelope::new(
                id.clone(),
                "user",
                event_type,
                1,
                version,
                json!({}),
            ));
        }
        EventStream::new(events)
    }

    #[test]
    fn test_first_last_and_len() {
        let s = stream();
        assert_eq!(s.len(), 3);
        assert_eq!(s.first().unwrap().version, 1);
        assert_eq!(s.last().unwrap().version, 3);
        assert_eq!(s.last_version(), 3);
    }

    #[test]
    fn test_filter_limit_skip_reverse() {
        let s = stream();
        assert_eq!(s.filter_by_type("user.renamed").len(), 2);
        assert_eq!(s.limit(2).last().unwrap().version, 2);
        assert_eq!(s.skip(2).first().unwrap().version, 3);
        assert_eq!(s.reversed().first().unwrap().version, 3);
        // original untouched
        assert_eq!(s.first().unwrap().version, 1);
    }

    #[test]
    fn test_indexing_and_iteration() {
        let s = stream();
        assert_eq!(s[1].version, 2);
        let versions: Vec<i64> = s.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_stream_defaults() {
        let s = EventStream::empty();
        assert!(s.is_empty());
        assert_eq!(s.last_version(), 0);
        assert!(s.first().is_none());
    }
}
