//! Interpolation.
//!
//! The server sends discrete snapshots. The client renders remote entities
//! slightly in the past (`render_time = now - offset - delay`) so there is
//! almost always a pair of samples bracketing the render time, interpolates
//! between them, then smooths the rendered position toward that target once
//! per tick.
//!
//! The shared object follows the same path while free. While grabbed it is
//! pinned to its owner's rendered position instead.

use std::collections::BTreeMap;

use netsync_shared::{
    clock::Millis,
    config::InterpolationConfig,
    math::Vec2,
    net::{BallState, ClientId},
    ring::RingBuffer,
};
use tracing::{debug, info, warn};

/// A position on the server timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub position: Vec2,
    pub timestamp: Millis,
}

/// Translates server timestamps into the local clock.
///
/// The offset is taken from the first timestamped snapshot and then held
/// for the lifetime of the connection; `resync` clears it so the next
/// snapshot establishes a fresh one.
#[derive(Debug, Clone, Default)]
pub struct ServerClock {
    offset: Option<Millis>,
}

impl ServerClock {
    pub fn observe(&mut self, local_now: Millis, server_ts: Millis) {
        if self.offset.is_none() {
            let offset = local_now - server_ts;
            debug!(offset_ms = offset, "Server clock offset established");
            self.offset = Some(offset);
        }
    }

    pub fn offset(&self) -> Option<Millis> {
        self.offset
    }

    /// Server time to render at, or `None` before any snapshot.
    pub fn render_time(&self, local_now: Millis, delay_ms: Millis) -> Option<Millis> {
        self.offset.map(|offset| local_now - offset - delay_ms)
    }

    /// Local time expressed on the server timeline.
    pub fn to_server_time(&self, local_now: Millis) -> Option<Millis> {
        self.offset.map(|offset| local_now - offset)
    }

    pub fn resync(&mut self) {
        self.offset = None;
    }
}

/// Index of the older sample of the pair to interpolate and the fraction.
fn bracket(history: &RingBuffer<Sample>, render_time: Millis) -> Option<(usize, f32)> {
    if history.len() < 2 {
        return None;
    }
    let last = history.len() - 1;
    let older = (0..last)
        .find(|&i| {
            history
                .get(i + 1)
                .is_some_and(|next| render_time <= next.timestamp)
        })
        .unwrap_or(last - 1);
    let (a, b) = (history.get(older)?, history.get(older + 1)?);
    let span = b.timestamp - a.timestamp;
    let t = if span <= 0.0 {
        1.0
    } else {
        ((render_time - a.timestamp) / span).clamp(0.0, 1.0)
    };
    Some((older, t as f32))
}

/// Linear position at `render_time`.
pub fn sample_at(history: &RingBuffer<Sample>, render_time: Millis) -> Option<Vec2> {
    if history.len() == 1 {
        return history.newest().map(|s| s.position);
    }
    let (i, t) = bracket(history, render_time)?;
    let a = history.get(i)?.position;
    let b = history.get(i + 1)?.position;
    Some(a.lerp(b, t))
}

/// Catmull-Rom position at `render_time`; linear below four samples.
pub fn spline_at(history: &RingBuffer<Sample>, render_time: Millis) -> Option<Vec2> {
    if history.len() < 4 {
        return sample_at(history, render_time);
    }
    let (i, t) = bracket(history, render_time)?;
    let last = history.len() - 1;
    let p = |idx: usize| history.get(idx.min(last)).map(|s| s.position);
    let p0 = p(i.saturating_sub(1))?;
    Some(Vec2::catmull_rom(p0, p(i)?, p(i + 1)?, p(i + 2)?, t))
}

fn smooth(rendered: Option<Vec2>, target: Vec2, factor: f32) -> Vec2 {
    match rendered {
        Some(current) => current.lerp(target, factor),
        None => target,
    }
}

#[derive(Debug, Clone)]
pub struct RemoteEntity {
    history: RingBuffer<Sample>,
    rendered: Option<Vec2>,
    pub team: u8,
    pub display_name: String,
}

impl RemoteEntity {
    fn new(capacity: usize) -> Self {
        Self {
            history: RingBuffer::new(capacity),
            rendered: None,
            team: 0,
            display_name: String::new(),
        }
    }

    pub fn history(&self) -> &RingBuffer<Sample> {
        &self.history
    }

    pub fn rendered(&self) -> Option<Vec2> {
        self.rendered
    }
}

/// What the render layer draws for one remote entity.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteView {
    pub id: ClientId,
    pub position: Vec2,
    pub team: u8,
    pub display_name: String,
}

/// Buffered histories for every remote entity.
#[derive(Debug, Clone)]
pub struct RemoteInterpolator {
    cfg: InterpolationConfig,
    entities: BTreeMap<ClientId, RemoteEntity>,
}

impl RemoteInterpolator {
    pub fn new(cfg: InterpolationConfig) -> Self {
        Self {
            cfg,
            entities: BTreeMap::new(),
        }
    }

    /// Records a sample. Samples older than the newest buffered one are
    /// ignored so the history stays ordered.
    pub fn push(&mut self, id: &ClientId, sample: Sample) {
        let capacity = self.cfg.entity_history;
        let entity = self
            .entities
            .entry(id.clone())
            .or_insert_with(|| RemoteEntity::new(capacity));
        if entity
            .history
            .newest()
            .is_some_and(|newest| sample.timestamp < newest.timestamp)
        {
            debug!(%id, "Dropping out-of-order remote sample");
            return;
        }
        entity.history.push(sample);
    }

    pub fn set_meta(&mut self, id: &ClientId, team: u8, display_name: &str) {
        if let Some(entity) = self.entities.get_mut(id) {
            entity.team = team;
            if entity.display_name != display_name {
                entity.display_name = display_name.to_string();
            }
        }
    }

    /// Drops every entity not in `present`.
    pub fn retain<'a>(&mut self, present: impl IntoIterator<Item = &'a ClientId>) {
        let keep: Vec<&ClientId> = present.into_iter().collect();
        self.entities.retain(|id, _| {
            let kept = keep.contains(&id);
            if !kept {
                info!(%id, "Remote entity left");
            }
            kept
        });
    }

    pub fn remove(&mut self, id: &ClientId) {
        self.entities.remove(id);
    }

    pub fn clear(&mut self) {
        self.entities.clear();
    }

    pub fn get(&self, id: &ClientId) -> Option<&RemoteEntity> {
        self.entities.get(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Current rendered position of an entity.
    pub fn position(&self, id: &ClientId) -> Option<Vec2> {
        self.entities.get(id).and_then(|e| e.rendered)
    }

    /// Advances every entity's rendered position for this tick.
    pub fn update(&mut self, render_time: Millis) {
        let factor = self.cfg.render_smoothing;
        for entity in self.entities.values_mut() {
            if let Some(target) = sample_at(&entity.history, render_time) {
                entity.rendered = Some(smooth(entity.rendered, target, factor));
            }
        }
    }

    pub fn views(&self) -> Vec<RemoteView> {
        self.entities
            .iter()
            .filter_map(|(id, e)| {
                e.rendered.map(|position| RemoteView {
                    id: id.clone(),
                    position,
                    team: e.team,
                    display_name: e.display_name.clone(),
                })
            })
            .collect()
    }
}

/// Draw-order hint for the shared object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthHint {
    Normal,
    /// Carried: draw on top of the owner.
    AboveOwner,
}

/// Last authoritative state of the shared object.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedObjectState {
    pub position: Vec2,
    pub active: bool,
    pub grabbed: bool,
    pub owner: Option<ClientId>,
}

/// What the render layer draws for the shared object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectView {
    pub position: Vec2,
    pub grabbed: bool,
    pub owner: Option<ClientId>,
    pub depth: DepthHint,
}

/// Tracks the shared contested object and its ownership.
#[derive(Debug, Clone)]
pub struct SharedObjectTracker {
    cfg: InterpolationConfig,
    state: Option<SharedObjectState>,
    history: RingBuffer<Sample>,
    rendered: Option<Vec2>,
    last_correction: Option<Millis>,
}

impl SharedObjectTracker {
    pub fn new(cfg: InterpolationConfig) -> Self {
        let capacity = cfg.object_history;
        Self {
            cfg,
            state: None,
            history: RingBuffer::new(capacity),
            rendered: None,
            last_correction: None,
        }
    }

    pub fn state(&self) -> Option<&SharedObjectState> {
        self.state.as_ref()
    }

    pub fn history(&self) -> &RingBuffer<Sample> {
        &self.history
    }

    /// Applies an authoritative update stamped `timestamp` (server timeline).
    /// Returns true if ownership changed.
    pub fn apply(&mut self, ball: &BallState, timestamp: Millis) -> bool {
        if !ball.active {
            if self.state.as_ref().is_some_and(|s| s.active) {
                debug!("Shared object deactivated");
            }
            self.history.clear();
            self.rendered = None;
            self.state = Some(SharedObjectState {
                position: Vec2::new(ball.x, ball.y),
                active: false,
                grabbed: false,
                owner: None,
            });
            return false;
        }

        if ball.grabbed && ball.owner.is_none() {
            warn!("Grabbed shared object without owner, treating as free");
        }
        let owner = ball.owner.clone();
        let grabbed = ball.grabbed && owner.is_some();

        let (was_active, owner_changed) = match &self.state {
            Some(prev) => (prev.active, prev.owner != owner),
            None => (false, false),
        };
        if !was_active {
            self.history.clear();
            self.rendered = None;
        } else if owner_changed {
            info!(
                from = ?self.state.as_ref().and_then(|s| s.owner.as_ref()),
                to = ?owner,
                "Shared object ownership changed"
            );
            self.history.clear();
        }

        let position = Vec2::new(ball.x, ball.y);
        if self
            .history
            .newest()
            .map_or(true, |newest| timestamp >= newest.timestamp)
        {
            self.history.push(Sample {
                position,
                timestamp,
            });
        }
        self.state = Some(SharedObjectState {
            position,
            active: true,
            grabbed,
            owner,
        });
        was_active && owner_changed
    }

    /// Resolves the rendered object for this tick.
    ///
    /// `local` is our id and predicted position; remote owners are looked
    /// up in `remotes`. An owner we cannot see falls back to the history.
    pub fn update(
        &mut self,
        now: Millis,
        render_time: Option<Millis>,
        local: Option<(&ClientId, Vec2)>,
        remotes: &RemoteInterpolator,
    ) -> Option<ObjectView> {
        let state = self.state.as_ref().filter(|s| s.active)?;

        if state.grabbed {
            let owner = state.owner.as_ref()?;
            let pinned = match local {
                Some((id, position)) if id == owner => Some(position),
                _ => remotes.position(owner),
            };
            if let Some(position) = pinned {
                self.rendered = Some(position);
                return Some(ObjectView {
                    position,
                    grabbed: true,
                    owner: Some(owner.clone()),
                    depth: DepthHint::AboveOwner,
                });
            }
        }

        let target = render_time
            .and_then(|rt| spline_at(&self.history, rt))
            .or_else(|| self.history.newest().map(|s| s.position))
            .unwrap_or(state.position);
        let mut position = smooth(self.rendered, target, self.cfg.render_smoothing);

        if !state.grabbed {
            let due = self
                .last_correction
                .map_or(true, |at| now - at >= self.cfg.correction_interval_ms);
            if due {
                position = position.lerp(state.position, self.cfg.correction_factor);
                self.last_correction = Some(now);
            }
        }

        self.rendered = Some(position);
        Some(ObjectView {
            position,
            grabbed: state.grabbed,
            owner: state.owner.clone(),
            depth: DepthHint::Normal,
        })
    }

    pub fn clear(&mut self) {
        self.state = None;
        self.history.clear();
        self.rendered = None;
        self.last_correction = None;
    }
}
