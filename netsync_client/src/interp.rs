//! Interpolation.
//!
//! The server sends discrete snapshots at irregular intervals. The client
//! renders remote entities a fixed delay in the past, so that two samples
//! usually bracket the render time, and eases the displayed position towards
//! the newer sample every tick.

use netsync_shared::{
    config::{BlendMode, NetConfig},
    math::{smooth_damp, Vec2},
    protocol::ClientId,
};

use crate::history::{EntityHistory, HistoryRecord};

/// A remote entity as the presentation layer sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct InterpolatedEntity {
    pub id: ClientId,
    /// Currently displayed position.
    pub position: Vec2,
    /// Carried between ticks by [`BlendMode::Smoothed`].
    pub smoothed_velocity: Vec2,
    /// Bracket fraction used on the last tick.
    pub last_fraction: f32,
}

impl InterpolatedEntity {
    pub fn new(id: ClientId, position: Vec2) -> Self {
        Self {
            id,
            position,
            smoothed_velocity: Vec2::ZERO,
            last_fraction: 1.0,
        }
    }
}

/// The pair of samples chosen for a render time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bracket {
    pub from: HistoryRecord,
    pub to: HistoryRecord,
    /// Position of the render time between `from` and `to`, in $[0,1]$.
    pub t: f32,
    /// `false` when no pair straddled the render time and the two newest
    /// samples were used instead.
    pub bracketed: bool,
}

/// Fraction of the way from `from` to `to` at `target_ms`, clamped to $[0,1]$.
///
/// Coincident samples yield 1.
pub fn bracket_fraction(from: &HistoryRecord, to: &HistoryRecord, target_ms: f64) -> f32 {
    let span = to.time_ms - from.time_ms;
    if span == 0.0 {
        return 1.0;
    }
    let t = ((target_ms - from.time_ms) / span).clamp(0.0, 1.0);
    if t.is_nan() {
        1.0
    } else {
        t as f32
    }
}

/// Picks the samples to blend between at `target_ms`.
///
/// Scans newest to oldest for consecutive samples `s1.time <= target <=
/// s2.time` (the newest pairs with itself). Falls back to the two newest.
/// Needs at least two records.
pub fn find_bracket(history: &EntityHistory, target_ms: f64) -> Option<Bracket> {
    let n = history.len();
    if n < 2 {
        return None;
    }

    for i in (0..n).rev() {
        let s1 = *history.get(i)?;
        let s2 = if i + 1 < n { *history.get(i + 1)? } else { s1 };
        if s1.time_ms <= target_ms && target_ms <= s2.time_ms {
            return Some(Bracket {
                from: s1,
                to: s2,
                t: bracket_fraction(&s1, &s2, target_ms),
                bracketed: true,
            });
        }
    }

    let s1 = *history.get(n - 2)?;
    let s2 = *history.get(n - 1)?;
    Some(Bracket {
        from: s1,
        to: s2,
        t: bracket_fraction(&s1, &s2, target_ms),
        bracketed: false,
    })
}

/// Turns history plus the local clock into displayed positions.
#[derive(Debug, Clone)]
pub struct InterpolationEngine {
    render_delay_ms: f64,
    mode: BlendMode,
    smoothing_time_s: f32,
    max_speed: f32,
    extrapolation_limit_ms: f64,
}

impl InterpolationEngine {
    pub fn new(cfg: &NetConfig) -> Self {
        Self {
            render_delay_ms: cfg.render_delay_ms,
            mode: cfg.blend_mode,
            smoothing_time_s: (cfg.smoothing_time_ms / 1000.0) as f32,
            max_speed: cfg.max_smoothing_speed,
            extrapolation_limit_ms: cfg.extrapolation_limit_ms,
        }
    }

    pub fn mode(&self) -> BlendMode {
        self.mode
    }

    /// The render time for local time `now_ms`.
    pub fn target_time(&self, now_ms: f64) -> f64 {
        now_ms - self.render_delay_ms
    }

    /// Where the entity should be heading at `target_ms`.
    fn goal(&self, bracket: &Bracket, target_ms: f64) -> Vec2 {
        let newest = &bracket.to;
        if !bracket.bracketed && self.extrapolation_limit_ms > 0.0 && target_ms > newest.time_ms
        {
            let ahead_s = (target_ms - newest.time_ms).min(self.extrapolation_limit_ms) / 1000.0;
            return newest.position + newest.velocity * ahead_s as f32;
        }
        newest.position
    }

    /// Advances one entity by one tick. Does nothing with fewer than two
    /// records.
    pub fn step(
        &self,
        entity: &mut InterpolatedEntity,
        history: &EntityHistory,
        now_ms: f64,
        dt: f32,
    ) -> Option<Bracket> {
        let target = self.target_time(now_ms);
        let bracket = find_bracket(history, target)?;
        let goal = self.goal(&bracket, target);

        entity.position = match self.mode {
            BlendMode::Linear => entity.position.lerp(goal, bracket.t),
            BlendMode::Smoothed => smooth_damp(
                entity.position,
                goal,
                &mut entity.smoothed_velocity,
                self.smoothing_time_s,
                self.max_speed,
                dt,
            ),
        };
        entity.last_fraction = bracket.t;
        Some(bracket)
    }
}
