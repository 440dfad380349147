//! Snapshot history.
//!
//! Each remote entity keeps a short, bounded buffer of timestamped samples in
//! arrival order. Velocity is derived on insert from the previous sample.

use std::collections::{HashMap, VecDeque};

use netsync_shared::{math::Vec2, protocol::ClientId};

/// Default number of records kept per entity.
pub const DEFAULT_HISTORY_CAPACITY: usize = 20;

/// One sample of one entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryRecord {
    /// Local-clock milliseconds (server time already converted).
    pub time_ms: f64,
    pub position: Vec2,
    /// Units per second, derived from the previous record.
    pub velocity: Vec2,
}

/// Bounded, arrival-ordered samples for one entity.
#[derive(Debug, Clone)]
pub struct EntityHistory {
    records: VecDeque<HistoryRecord>,
    capacity: usize,
}

impl EntityHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Appends a sample, evicting the oldest past capacity.
    ///
    /// A non-positive time step (duplicate or reordered timestamp) keeps the
    /// previous velocity instead of dividing by it.
    pub fn push(&mut self, time_ms: f64, position: Vec2) {
        let velocity = match self.records.back() {
            None => Vec2::ZERO,
            Some(prev) => {
                let dt_ms = time_ms - prev.time_ms;
                if dt_ms > 0.0 {
                    let v = (position - prev.position) * (1000.0 / dt_ms) as f32;
                    if v.is_finite() {
                        v
                    } else {
                        prev.velocity
                    }
                } else {
                    prev.velocity
                }
            }
        };

        self.records.push_back(HistoryRecord {
            time_ms,
            position,
            velocity,
        });
        while self.records.len() > self.capacity {
            self.records.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record `i`, counting from the oldest.
    pub fn get(&self, i: usize) -> Option<&HistoryRecord> {
        self.records.get(i)
    }

    pub fn newest(&self) -> Option<&HistoryRecord> {
        self.records.back()
    }

    pub fn oldest(&self) -> Option<&HistoryRecord> {
        self.records.front()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &HistoryRecord> + ExactSizeIterator {
        self.records.iter()
    }
}

/// Per-entity histories, owned by the consumer thread.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    buffers: HashMap<ClientId, EntityHistory>,
    capacity: usize,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl HistoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            capacity,
        }
    }

    /// Appends a sample for `id`, creating its buffer on first sight.
    pub fn record(&mut self, id: ClientId, time_ms: f64, position: Vec2) -> &EntityHistory {
        let capacity = self.capacity;
        let history = self
            .buffers
            .entry(id)
            .or_insert_with(|| EntityHistory::new(capacity));
        history.push(time_ms, position);
        history
    }

    pub fn get(&self, id: ClientId) -> Option<&EntityHistory> {
        self.buffers.get(&id)
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.buffers.contains_key(&id)
    }

    /// Drops every record of `id`.
    pub fn remove(&mut self, id: ClientId) -> Option<EntityHistory> {
        self.buffers.remove(&id)
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    /// Number of entities with a buffer.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_the_newest_records_in_arrival_order() {
        let mut store = HistoryStore::new(DEFAULT_HISTORY_CAPACITY);
        for i in 0..57 {
            store.record(ClientId(1), i as f64 * 10.0, Vec2::new(i as f32, 0.0));
        }
        let h = store.get(ClientId(1)).unwrap();
        assert_eq!(h.len(), 20);
        let times: Vec<f64> = h.iter().map(|r| r.time_ms).collect();
        let expected: Vec<f64> = (37..57).map(|i| i as f64 * 10.0).collect();
        assert_eq!(times, expected);
    }

    #[test]
    fn velocity_from_consecutive_samples() {
        let mut h = EntityHistory::new(20);
        h.push(1000.0, Vec2::new(0.0, 0.0));
        assert_eq!(h.newest().unwrap().velocity, Vec2::ZERO);
        h.push(1500.0, Vec2::new(5.0, -10.0));
        assert_eq!(h.newest().unwrap().velocity, Vec2::new(10.0, -20.0));
    }

    #[test]
    fn zero_time_step_leaves_velocity_unchanged() {
        let mut h = EntityHistory::new(20);
        h.push(100.0, Vec2::new(0.0, 0.0));
        h.push(100.0, Vec2::new(5.0, 5.0));
        let v = h.newest().unwrap().velocity;
        assert_eq!(v, Vec2::ZERO);
        assert!(v.is_finite());
    }

    #[test]
    fn backwards_time_step_carries_previous_velocity() {
        let mut h = EntityHistory::new(20);
        h.push(0.0, Vec2::new(0.0, 0.0));
        h.push(1000.0, Vec2::new(2.0, 0.0));
        h.push(900.0, Vec2::new(50.0, 50.0));
        assert_eq!(h.newest().unwrap().velocity, Vec2::new(2.0, 0.0));
        assert_eq!(h.len(), 3, "reordered samples are still recorded");
    }

    #[test]
    fn remove_and_clear() {
        let mut store = HistoryStore::default();
        store.record(ClientId(1), 0.0, Vec2::ZERO);
        store.record(ClientId(2), 0.0, Vec2::ZERO);
        assert!(store.remove(ClientId(1)).is_some());
        assert!(!store.contains(ClientId(1)));
        assert_eq!(store.len(), 1);
        store.clear();
        assert!(store.is_empty());
    }
}
