//! Consumer-owned view of the remote world.
//!
//! Everything here runs on the thread that calls `NetClient::tick`. Receive
//! workers reach it only through dispatched callbacks.
//!
//! Snapshot reconciliation:
//! 1. Record every entity's sample in the history store.
//! 2. Diff the snapshot's ids against the previous active set. Missing ids
//!    have left (representation and history dropped), new ids have joined.
//!    Absence from a snapshot is the only way a remote entity disappears.
//! 3. The local entity is recorded but never tracked as remote, and its
//!    authoritative position is never taken from the network.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use netsync_shared::{
    config::NetConfig,
    math::Vec2,
    protocol::{ClientId, Snapshot},
};
use tracing::{debug, info, trace};

use crate::{
    history::HistoryStore,
    interp::{InterpolatedEntity, InterpolationEngine},
    lifecycle::DisconnectReason,
    observer::{ListenerId, Listeners, SnapshotListener},
};

/// Ids that joined and left with one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityDelta {
    pub joined: Vec<ClientId>,
    pub left: Vec<ClientId>,
}

impl EntityDelta {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

/// Ids present in the most recent snapshot.
#[derive(Debug, Clone, Default)]
pub struct ActiveEntitySet {
    ids: BTreeSet<ClientId>,
}

impl ActiveEntitySet {
    /// Replaces the set with `ids` and reports what changed.
    pub fn update(&mut self, ids: impl IntoIterator<Item = ClientId>) -> EntityDelta {
        let next: BTreeSet<ClientId> = ids.into_iter().collect();
        let delta = EntityDelta {
            joined: next.difference(&self.ids).copied().collect(),
            left: self.ids.difference(&next).copied().collect(),
        };
        self.ids = next;
        delta
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.ids.contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.ids.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }
}

/// Server-to-local clock offset estimate.
///
/// The first sample seeds it; later samples pull it by a fixed fraction of
/// their error so one late packet cannot jerk the timeline.
#[derive(Debug, Clone)]
pub struct ClockSync {
    offset_ms: Option<f64>,
    correction_rate: f64,
}

impl ClockSync {
    pub fn new(correction_rate: f64) -> Self {
        Self {
            offset_ms: None,
            correction_rate,
        }
    }

    /// Folds in one `(server time, local receive time)` pair and returns the
    /// updated offset (server minus local).
    pub fn observe(&mut self, server_ms: f64, local_ms: f64) -> f64 {
        let sample = server_ms - local_ms;
        let offset = match self.offset_ms {
            None => sample,
            Some(current) => current + (sample - current) * self.correction_rate,
        };
        self.offset_ms = Some(offset);
        offset
    }

    pub fn offset_ms(&self) -> Option<f64> {
        self.offset_ms
    }

    /// Converts a server timestamp to local time with the current estimate.
    pub fn to_local(&self, server_ms: f64) -> f64 {
        server_ms - self.offset_ms.unwrap_or(0.0)
    }

    pub fn reset(&mut self) {
        self.offset_ms = None;
    }
}

/// Round-trip time from liveness probes.
#[derive(Debug, Clone, Default)]
pub struct RttEstimator {
    last: Option<Duration>,
    smoothed_ms: Option<f32>,
}

impl RttEstimator {
    pub fn sample(&mut self, rtt: Duration) {
        const ALPHA: f32 = 0.125;
        let ms = rtt.as_secs_f32() * 1000.0;
        self.smoothed_ms = Some(match self.smoothed_ms {
            None => ms,
            Some(s) => (1.0 - ALPHA) * s + ALPHA * ms,
        });
        self.last = Some(rtt);
    }

    pub fn last(&self) -> Option<Duration> {
        self.last
    }

    pub fn smoothed_ms(&self) -> Option<f32> {
        self.smoothed_ms
    }
}

/// All gameplay-facing network state. Owned by the consumer thread.
pub struct RemoteWorld {
    history: HistoryStore,
    active: ActiveEntitySet,
    entities: BTreeMap<ClientId, InterpolatedEntity>,
    interp: InterpolationEngine,
    clock: ClockSync,
    rtt: RttEstimator,
    local_id: ClientId,
    local_position: Option<Vec2>,
    last_server_ms: Option<i64>,
    generation: u64,
    pongs: u64,
    listeners: Listeners,
}

impl RemoteWorld {
    pub fn new(cfg: &NetConfig) -> Self {
        Self {
            history: HistoryStore::new(cfg.history_capacity),
            active: ActiveEntitySet::default(),
            entities: BTreeMap::new(),
            interp: InterpolationEngine::new(cfg),
            clock: ClockSync::new(cfg.clock_correction_rate),
            rtt: RttEstimator::default(),
            local_id: ClientId::UNASSIGNED,
            local_position: None,
            last_server_ms: None,
            generation: 0,
            pongs: 0,
            listeners: Listeners::default(),
        }
    }

    pub fn subscribe(&mut self, listener: Box<dyn SnapshotListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Applies one server snapshot received at local time `received_ms`.
    ///
    /// `local_id` is the identity held when the snapshot arrived. Snapshots
    /// older than the last applied one are dropped and yield `None`.
    pub fn apply_snapshot(
        &mut self,
        snapshot: Snapshot,
        local_id: ClientId,
        received_ms: f64,
    ) -> Option<EntityDelta> {
        if let Some(last) = self.last_server_ms {
            if snapshot.timestamp < last {
                debug!(
                    timestamp = snapshot.timestamp,
                    last, "Dropping stale snapshot"
                );
                return None;
            }
        }
        self.last_server_ms = Some(snapshot.timestamp);
        self.local_id = local_id;

        let server_ms = snapshot.timestamp as f64;
        self.clock.observe(server_ms, received_ms);
        let sample_ms = self.clock.to_local(server_ms);

        for (&id, state) in &snapshot.entities {
            self.history.record(id, sample_ms, state.position);
        }

        let remote_ids = snapshot.ids().filter(|&id| id != local_id);
        let delta = self.active.update(remote_ids);

        for &id in &delta.left {
            self.entities.remove(&id);
            self.history.remove(id);
            info!(entity = %id, "Remote entity left");
            self.listeners.notify(|l| l.on_entity_left(id));
        }
        for &id in &delta.joined {
            let position = snapshot.entities[&id].position;
            self.entities
                .insert(id, InterpolatedEntity::new(id, position));
            info!(entity = %id, x = position.x, y = position.y, "Remote entity joined");
            self.listeners.notify(|l| l.on_entity_joined(id, position));
        }

        trace!(
            timestamp = snapshot.timestamp,
            entities = snapshot.entities.len(),
            "Applied snapshot"
        );
        self.listeners.notify(|l| l.on_snapshot(&snapshot));
        Some(delta)
    }

    /// Advances every tracked entity's displayed position.
    pub fn interpolate(&mut self, now_ms: f64, dt: f32) {
        for (id, entity) in &mut self.entities {
            let Some(history) = self.history.get(*id) else {
                continue;
            };
            if let Some(bracket) = self.interp.step(entity, history, now_ms, dt) {
                trace!(
                    entity = %id,
                    t = bracket.t,
                    bracketed = bracket.bracketed,
                    x = entity.position.x,
                    y = entity.position.y,
                    "Interpolated"
                );
            }
        }
    }

    /// The motion controller's own position. Never written from snapshots.
    pub fn set_local_position(&mut self, position: Vec2) {
        self.local_position = Some(position);
    }

    pub fn local_position(&self) -> Option<Vec2> {
        self.local_position
    }

    pub fn on_identified(&mut self, id: ClientId) {
        self.local_id = id;
        self.listeners.notify(|l| l.on_identified(id));
    }

    /// Liveness acknowledgment. `sent_at` is when the matching probe left.
    pub fn on_pong(&mut self, sent_at: Option<Instant>, received_at: Instant) {
        self.pongs += 1;
        match sent_at {
            Some(sent) => {
                let rtt = received_at.saturating_duration_since(sent);
                self.rtt.sample(rtt);
                debug!(rtt_ms = rtt.as_secs_f32() * 1000.0, "Pong");
            }
            None => debug!("Pong without an outstanding probe"),
        }
    }

    /// Session generation of the state held here. Advanced by each
    /// [`RemoteWorld::on_disconnected`].
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether work read under `generation` still belongs to this world.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    /// Drops all session state. Every tracked entity is reported left first.
    pub fn on_disconnected(&mut self, reason: DisconnectReason) {
        let tracked: Vec<ClientId> = self.entities.keys().copied().collect();
        for id in tracked {
            self.listeners.notify(|l| l.on_entity_left(id));
        }
        self.entities.clear();
        self.history.clear();
        self.active.clear();
        self.clock.reset();
        self.local_id = ClientId::UNASSIGNED;
        self.last_server_ms = None;
        self.generation += 1;
        self.listeners.notify(|l| l.on_disconnected(reason));
    }

    pub fn entity(&self, id: ClientId) -> Option<&InterpolatedEntity> {
        self.entities.get(&id)
    }

    /// Tracked remote entities, ordered by id.
    pub fn entities(&self) -> impl Iterator<Item = &InterpolatedEntity> {
        self.entities.values()
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn active(&self) -> &ActiveEntitySet {
        &self.active
    }

    pub fn local_id(&self) -> Option<ClientId> {
        self.local_id.is_assigned().then_some(self.local_id)
    }

    pub fn clock_offset_ms(&self) -> Option<f64> {
        self.clock.offset_ms()
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Pongs received this process lifetime.
    pub fn pong_count(&self) -> u64 {
        self.pongs
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}
