//! Sync session.
//!
//! [`SyncSession`] is the explicit context object that ties the sync core
//! together: it owns the channels, the inbound delivery buffer, the router,
//! prediction and interpolation state. It performs no I/O and reads no
//! clock; the host feeds it link events and calls [`SyncSession::tick`] with
//! the current time once per simulation step.
//!
//! Per tick:
//! 1. Channel timers (watchdog, reconnect, heartbeat) and the signaling sweep.
//! 2. Channel lifecycle events become session events.
//! 3. Due inbound payloads are decoded and dispatched.
//! 4. Local input is integrated and sent.
//! 5. Reconciliation, remote interpolation, shared-object resolution.

use bytes::Bytes;
use netsync_shared::{
    clock::Millis,
    config::SyncConfig,
    math::Vec2,
    net::{
        decode_from_bytes, BallState, ClientId, NetMsg, PositionUpdate, ProjectileUpdate,
        StateSnapshot,
    },
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    delivery::DeliveryBuffer,
    input::{InputSampler, InputState},
    interp::{ObjectView, RemoteInterpolator, RemoteView, Sample, ServerClock, SharedObjectTracker},
    prediction::{AuthoritativeState, PredictionEngine},
    router::{classify, peer_bound, MessageRouter, Route, RouterStats},
    signaling::{PeerTransport, SignalingCoordinator, SignalingEvent},
    transport::{
        ChannelEvent, ChannelRole, Connector, HandshakeId, Outlet, SendError, TransportChannel,
    },
};

/// Where an inbound payload came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSource {
    Reliable,
    Fast,
    Peer(ClientId),
}

/// Everything the I/O side reports to the session.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Opened {
        role: ChannelRole,
        handshake: HandshakeId,
    },
    Closed {
        role: ChannelRole,
        handshake: HandshakeId,
    },
    Error {
        role: ChannelRole,
        handshake: HandshakeId,
        reason: String,
    },
    Message {
        role: ChannelRole,
        payload: Bytes,
    },
    PeerOpened {
        peer: ClientId,
    },
    PeerClosed {
        peer: ClientId,
    },
    PeerMessage {
        peer: ClientId,
        payload: Bytes,
    },
    /// A connectivity candidate discovered locally for `peer`.
    PeerCandidate {
        peer: ClientId,
        candidate: Value,
    },
}

/// Notable things that happened during a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected(ChannelRole),
    Disconnected(ChannelRole),
    /// Reconnect attempts exhausted.
    ChannelDegraded(ChannelRole),
    /// The server assigned a second, different id. The session is now
    /// terminated and all sync state was reset.
    IdentityConflict {
        assigned: ClientId,
        received: ClientId,
    },
    Goal {
        team: u8,
        team1_score: u32,
        team2_score: u32,
    },
    Score {
        team1: u32,
        team2: u32,
    },
    Countdown {
        seconds: u32,
    },
    GameReset,
    TeamSwitched {
        client_id: Option<ClientId>,
        team: u8,
    },
    ServerError {
        message: String,
    },
    PeerJoined(ClientId),
    PeerLeft(ClientId),
}

/// What the render layer consumes after a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Predicted position of the local entity.
    pub local: Vec2,
    pub remotes: Vec<RemoteView>,
    /// `None` while the shared object is inactive or unknown.
    pub ball: Option<ObjectView>,
    pub projectiles: Vec<ProjectileUpdate>,
    pub events: Vec<SessionEvent>,
}

#[derive(Debug)]
struct Inbound {
    source: LinkSource,
    payload: Bytes,
}

pub struct SyncSession {
    cfg: SyncConfig,
    spawn: Vec2,

    reliable: TransportChannel,
    fast: Option<TransportChannel>,
    signaling: Option<SignalingCoordinator>,
    inbox: DeliveryBuffer<Inbound>,
    router: MessageRouter,

    sampler: InputSampler,
    prediction: PredictionEngine,
    remotes: RemoteInterpolator,
    ball: SharedObjectTracker,
    clock: ServerClock,

    client_id: Option<ClientId>,
    running: bool,
    terminated: bool,
    /// Fast handshake sent on the current fast connection.
    fast_ready: bool,
    reliable_opened: bool,
    frozen_until: Option<Millis>,
    scores: Option<(u32, u32)>,

    projectiles: Vec<ProjectileUpdate>,
    events: Vec<SessionEvent>,
}

impl SyncSession {
    pub fn new(
        cfg: SyncConfig,
        display_name: impl Into<String>,
        reliable: Box<dyn Connector>,
    ) -> Self {
        let reliable = TransportChannel::new(ChannelRole::Reliable, cfg.transport.clone(), reliable)
            .with_heartbeat();
        Self {
            spawn: Vec2::ZERO,
            reliable,
            fast: None,
            signaling: None,
            inbox: DeliveryBuffer::new(cfg.delivery.latency_ms),
            router: MessageRouter::new(),
            sampler: InputSampler::new(display_name),
            prediction: PredictionEngine::new(cfg.prediction.clone(), Vec2::ZERO),
            remotes: RemoteInterpolator::new(cfg.interpolation.clone()),
            ball: SharedObjectTracker::new(cfg.interpolation.clone()),
            clock: ServerClock::default(),
            client_id: None,
            running: false,
            terminated: false,
            fast_ready: false,
            reliable_opened: false,
            frozen_until: None,
            scores: None,
            projectiles: Vec::new(),
            events: Vec::new(),
            cfg,
        }
    }

    /// Adds a datagram channel to the server for fast traffic. It is opened
    /// once the server has assigned our id. Datagram links never report a
    /// close, so the channel keeps its own heartbeat.
    pub fn with_fast_channel(mut self, connector: Box<dyn Connector>) -> Self {
        self.fast = Some(
            TransportChannel::new(ChannelRole::Fast, self.cfg.transport.clone(), connector)
                .with_heartbeat(),
        );
        self
    }

    /// Negotiates direct peer channels through the server.
    pub fn with_peer_mesh(mut self, transport: Box<dyn PeerTransport>) -> Self {
        self.signaling = Some(SignalingCoordinator::new(
            self.cfg.signaling.clone(),
            transport,
        ));
        self
    }

    pub fn with_spawn(mut self, spawn: Vec2) -> Self {
        self.spawn = spawn;
        self.prediction.reset(spawn);
        self
    }

    pub fn client_id(&self) -> Option<&ClientId> {
        self.client_id.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn reliable(&self) -> &TransportChannel {
        &self.reliable
    }

    pub fn fast(&self) -> Option<&TransportChannel> {
        self.fast.as_ref()
    }

    pub fn signaling(&self) -> Option<&SignalingCoordinator> {
        self.signaling.as_ref()
    }

    pub fn prediction(&self) -> &PredictionEngine {
        &self.prediction
    }

    pub fn remotes(&self) -> &RemoteInterpolator {
        &self.remotes
    }

    pub fn shared_object(&self) -> &SharedObjectTracker {
        &self.ball
    }

    pub fn server_clock(&self) -> &ServerClock {
        &self.clock
    }

    pub fn router_stats(&self) -> RouterStats {
        self.router.stats()
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbox.len()
    }

    pub fn set_latency_ms(&mut self, latency_ms: Millis) {
        self.inbox.set_latency_ms(latency_ms);
    }

    /// Events raised outside of a tick (for example by `stop`).
    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Opens the reliable channel. A terminated session cannot be restarted.
    pub fn start(&mut self, now: Millis) {
        if self.terminated {
            warn!("Session terminated, build a new one");
            return;
        }
        if self.running {
            return;
        }
        self.running = true;
        self.reliable.reset();
        self.reliable.connect(now);
        info!("Session started");
    }

    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.shutdown_links();
        info!("Session stopped");
    }

    /// Host visibility. Reconnects due while hidden wait for the foreground.
    pub fn set_visibility(&mut self, now: Millis, visible: bool) {
        debug!(visible, "Visibility changed");
        self.reliable.set_suspended(now, !visible);
        if let Some(fast) = self.fast.as_mut() {
            fast.set_suspended(now, !visible);
        }
    }

    /// Feeds one event from the I/O side. Payloads are only queued here;
    /// they are decoded on the next tick.
    pub fn on_link_event(&mut self, now: Millis, event: LinkEvent) {
        if !self.running {
            debug!(?event, "Link event while stopped");
            return;
        }
        match event {
            LinkEvent::Opened { role, handshake } => {
                if let Some(ch) = self.channel_mut(role) {
                    ch.on_open(now, handshake);
                }
            }
            LinkEvent::Closed { role, handshake } => {
                if let Some(ch) = self.channel_mut(role) {
                    ch.on_close(now, handshake);
                }
            }
            LinkEvent::Error {
                role,
                handshake,
                reason,
            } => {
                if let Some(ch) = self.channel_mut(role) {
                    ch.on_error(now, handshake, &reason);
                }
            }
            LinkEvent::Message { role, payload } => {
                let source = match role {
                    ChannelRole::Reliable => LinkSource::Reliable,
                    ChannelRole::Fast => LinkSource::Fast,
                };
                self.inbox.push(now, Inbound { source, payload });
            }
            LinkEvent::PeerOpened { peer } => {
                if let Some(sig) = self.signaling.as_mut() {
                    sig.on_channel_open(&peer);
                }
            }
            LinkEvent::PeerClosed { peer } => {
                if let Some(sig) = self.signaling.as_mut() {
                    sig.on_channel_closed(&peer);
                }
            }
            LinkEvent::PeerMessage { peer, payload } => {
                self.inbox.push(
                    now,
                    Inbound {
                        source: LinkSource::Peer(peer),
                        payload,
                    },
                );
            }
            LinkEvent::PeerCandidate { peer, candidate } => {
                if let Some(sig) = self.signaling.as_mut() {
                    sig.local_candidate(&peer, candidate);
                }
            }
        }
    }

    /// Sends a message on the best route for its kind. Peer-bound kinds
    /// prefer the peer mesh; server-bound kinds only ever use the server's
    /// fast channel or the reliable one.
    pub fn send(&mut self, msg: &NetMsg) -> Result<Route, SendError> {
        let mesh_up = self.signaling.as_ref().is_some_and(|s| s.is_healthy());
        let server_fast = self.fast_ready && self.fast.as_ref().is_some_and(|f| f.is_open());
        let fast: Option<&mut dyn Outlet> = if peer_bound(msg.kind()) && mesh_up {
            self.signaling.as_mut().map(|s| s as &mut dyn Outlet)
        } else if server_fast {
            self.fast.as_mut().map(|f| f as &mut dyn Outlet)
        } else {
            None
        };
        self.router.send(msg, fast, &mut self.reliable)
    }

    /// Runs one simulation step of `dt_sec` at `now`.
    pub fn tick(&mut self, now: Millis, dt_sec: f32, input: Option<InputState>) -> Frame {
        if self.running {
            self.reliable.poll(now);
            if let Some(fast) = self.fast.as_mut() {
                fast.poll(now);
            }
            if let Some(sig) = self.signaling.as_mut() {
                sig.sweep(now);
            }
            self.collect_channel_events();
            self.process_inbox(now);
            self.flush_signaling();
            if self.running {
                self.apply_input(now, dt_sec, input);
            }
        }

        self.prediction.reconcile();
        let render_time = self
            .clock
            .render_time(now, self.cfg.interpolation.delay_ms);
        if let Some(rt) = render_time {
            self.remotes.update(rt);
        }
        let local = self.prediction.predicted();
        let ball = self.ball.update(
            now,
            render_time,
            self.client_id.as_ref().map(|id| (id, local)),
            &self.remotes,
        );

        Frame {
            local,
            remotes: self.remotes.views(),
            ball,
            projectiles: std::mem::take(&mut self.projectiles),
            events: std::mem::take(&mut self.events),
        }
    }

    fn channel_mut(&mut self, role: ChannelRole) -> Option<&mut TransportChannel> {
        match role {
            ChannelRole::Reliable => Some(&mut self.reliable),
            ChannelRole::Fast => self.fast.as_mut(),
        }
    }

    fn collect_channel_events(&mut self) {
        for event in self.reliable.take_events() {
            match event {
                ChannelEvent::Opened => {
                    if self.reliable_opened {
                        info!("Reliable channel reconnected, resyncing server clock");
                        self.clock.resync();
                    }
                    self.reliable_opened = true;
                    self.events.push(SessionEvent::Connected(ChannelRole::Reliable));
                    let join = NetMsg::Join {
                        display_name: self.sampler.display_name().to_string(),
                    };
                    if let Err(e) = self.reliable.send_msg(&join) {
                        warn!(error = %e, "Join failed");
                    }
                }
                ChannelEvent::Lost => {
                    self.events
                        .push(SessionEvent::Disconnected(ChannelRole::Reliable));
                }
                ChannelEvent::Degraded => {
                    self.events
                        .push(SessionEvent::ChannelDegraded(ChannelRole::Reliable));
                }
            }
        }

        let fast_events = self
            .fast
            .as_mut()
            .map(|f| f.take_events())
            .unwrap_or_default();
        for event in fast_events {
            match event {
                ChannelEvent::Opened => {
                    self.events.push(SessionEvent::Connected(ChannelRole::Fast));
                    self.send_fast_handshake();
                }
                ChannelEvent::Lost => {
                    self.fast_ready = false;
                    self.events.push(SessionEvent::Disconnected(ChannelRole::Fast));
                }
                ChannelEvent::Degraded => {
                    self.fast_ready = false;
                    info!("Fast channel degraded, routing over reliable");
                    self.events
                        .push(SessionEvent::ChannelDegraded(ChannelRole::Fast));
                }
            }
        }
    }

    fn send_fast_handshake(&mut self) {
        let (Some(fast), Some(id)) = (self.fast.as_mut(), self.client_id.as_ref()) else {
            return;
        };
        match fast.send_msg(&NetMsg::FastHandshake {
            client_id: id.clone(),
        }) {
            Ok(()) => {
                self.fast_ready = true;
                debug!(client_id = %id, "Fast handshake sent");
            }
            Err(e) => warn!(error = %e, "Fast handshake failed"),
        }
    }

    fn process_inbox(&mut self, now: Millis) {
        for Inbound { source, payload } in self.inbox.drain(now) {
            if !self.running {
                break;
            }
            let msg = match decode_from_bytes(&payload) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(?source, error = %e, "Dropping malformed message");
                    continue;
                }
            };
            let keepalive = matches!(msg, NetMsg::Ping { .. } | NetMsg::Pong { .. });
            let allowed = match source {
                LinkSource::Reliable => true,
                LinkSource::Fast => keepalive || classify(msg.kind()) == Route::Fast,
                LinkSource::Peer(_) => classify(msg.kind()) == Route::Fast,
            };
            if !allowed {
                debug!(?source, kind = msg.kind().tag(), "Authority message off the reliable channel dropped");
                continue;
            }
            self.dispatch(now, &source, msg);
        }
    }

    fn dispatch(&mut self, now: Millis, source: &LinkSource, msg: NetMsg) {
        match msg {
            NetMsg::Init { client_id } => self.on_init(now, client_id),
            NetMsg::Ping { t } => {
                let sent = match (source, self.fast.as_mut()) {
                    (LinkSource::Fast, Some(fast)) => fast.send_msg(&NetMsg::Pong { t }),
                    _ => self.reliable.send_msg(&NetMsg::Pong { t }),
                };
                if let Err(e) = sent {
                    debug!(?source, error = %e, "Pong not sent");
                }
            }
            NetMsg::Pong { t } => match (source, self.fast.as_mut()) {
                (LinkSource::Fast, Some(fast)) => fast.on_pong(now, t),
                _ => self.reliable.on_pong(now, t),
            },
            NetMsg::Error { message } => {
                warn!(%message, "Server error");
                self.events.push(SessionEvent::ServerError { message });
            }
            NetMsg::Goal {
                team,
                team1_score,
                team2_score,
            } => {
                info!(team, team1_score, team2_score, "Goal");
                self.scores = Some((team1_score, team2_score));
                self.events.push(SessionEvent::Goal {
                    team,
                    team1_score,
                    team2_score,
                });
            }
            NetMsg::Countdown { seconds } => {
                self.frozen_until = (seconds > 0).then(|| now + f64::from(seconds) * 1000.0);
                self.events.push(SessionEvent::Countdown { seconds });
            }
            NetMsg::GameReset => {
                info!("Game reset");
                self.remotes.clear();
                self.ball.clear();
                self.frozen_until = None;
                self.events.push(SessionEvent::GameReset);
            }
            NetMsg::SwitchTeam { client_id, team } => {
                self.events
                    .push(SessionEvent::TeamSwitched { client_id, team });
            }
            NetMsg::State(snapshot) => self.apply_snapshot(now, &snapshot),
            NetMsg::PositionUpdate(update) => self.on_peer_position(now, &update),
            NetMsg::BallPosition(ball) => {
                let Some(ts) = self.clock.to_server_time(now) else {
                    return;
                };
                let state = BallState {
                    x: ball.x,
                    y: ball.y,
                    active: true,
                    grabbed: ball.grabbed,
                    owner: ball.owner,
                };
                self.ball.apply(&state, ts);
            }
            NetMsg::ProjectileUpdate(p) => self.projectiles.push(p),
            NetMsg::WebrtcSignaling(signal) => match self.signaling.as_mut() {
                Some(sig) => sig.handle(now, &signal),
                None => debug!("Signaling without peer mesh ignored"),
            },
            other => debug!(kind = other.kind().tag(), "Ignoring server-bound message"),
        }
    }

    fn on_init(&mut self, now: Millis, id: ClientId) {
        match &self.client_id {
            Some(current) if *current == id => debug!(client_id = %id, "Duplicate init"),
            Some(current) => {
                warn!(assigned = %current, received = %id, "Identity conflict, terminating session");
                let assigned = current.clone();
                self.terminate();
                self.events.push(SessionEvent::IdentityConflict {
                    assigned,
                    received: id,
                });
            }
            None => {
                info!(client_id = %id, "Client id assigned");
                self.client_id = Some(id.clone());
                if let Some(sig) = self.signaling.as_mut() {
                    sig.set_local(id);
                    if let Some(request) = sig.request_peers() {
                        if let Err(e) = self.reliable.send_msg(&request) {
                            warn!(error = %e, "Peer request failed");
                        }
                    }
                }
                match self.fast.as_ref().map(|f| f.is_open()) {
                    Some(true) => self.send_fast_handshake(),
                    Some(false) => {
                        if let Some(fast) = self.fast.as_mut() {
                            fast.reset();
                            fast.connect(now);
                        }
                    }
                    None => {}
                }
            }
        }
    }

    fn apply_snapshot(&mut self, now: Millis, snapshot: &StateSnapshot) {
        self.clock.observe(now, snapshot.time);

        for (id, player) in &snapshot.players {
            if self.client_id.as_ref() == Some(id) {
                self.prediction
                    .apply_authoritative(AuthoritativeState::from(player));
            } else {
                self.remotes.push(
                    id,
                    Sample {
                        position: Vec2::new(player.x, player.y),
                        timestamp: snapshot.time,
                    },
                );
                self.remotes.set_meta(id, player.team, &player.display_name);
            }
        }
        let me = self.client_id.as_ref();
        self.remotes
            .retain(snapshot.players.keys().filter(|id| Some(*id) != me));

        if let Some(ball) = &snapshot.ball {
            self.ball.apply(ball, snapshot.time);
        }

        let scores = (snapshot.team1_score, snapshot.team2_score);
        if self.scores != Some(scores) {
            self.scores = Some(scores);
            self.events.push(SessionEvent::Score {
                team1: scores.0,
                team2: scores.1,
            });
        }
    }

    /// Peer positions are stamped with their arrival time on the server
    /// timeline, so they interleave with snapshot samples.
    fn on_peer_position(&mut self, now: Millis, update: &PositionUpdate) {
        if self.client_id.as_ref() == Some(&update.client_id) {
            return;
        }
        let Some(ts) = self.clock.to_server_time(now) else {
            debug!(peer = %update.client_id, "Peer position before server clock");
            return;
        };
        self.remotes.push(
            &update.client_id,
            Sample {
                position: Vec2::new(update.x, update.y),
                timestamp: ts,
            },
        );
    }

    fn apply_input(&mut self, now: Millis, dt_sec: f32, input: Option<InputState>) {
        let can_act = match self.frozen_until {
            Some(until) if now < until => false,
            Some(_) => {
                info!("Countdown finished");
                self.frozen_until = None;
                true
            }
            None => true,
        };
        let Some(input) = input else {
            return;
        };
        self.prediction
            .integrate(input.direction, input.actions, dt_sec, can_act);
        if !can_act {
            return;
        }
        let Some(id) = self.client_id.clone() else {
            return;
        };

        let sample = self.sampler.sample(input, now);
        if let Err(e) = self.send(&NetMsg::Input(sample)) {
            debug!(error = %e, "Input not sent");
        }

        if self.signaling.as_ref().is_some_and(|s| s.is_healthy()) {
            let p = self.prediction.predicted();
            let update = NetMsg::PositionUpdate(PositionUpdate {
                client_id: id,
                x: p.x,
                y: p.y,
                t: now,
            });
            if let Err(e) = self.send(&update) {
                debug!(error = %e, "Position not sent to peers");
            }
        }
    }

    /// Relays queued signaling messages over the reliable channel and turns
    /// signaling events into session events.
    fn flush_signaling(&mut self) {
        let Some(sig) = self.signaling.as_mut() else {
            return;
        };
        for msg in sig.take_outbox() {
            if let Err(e) = self.reliable.send_msg(&msg) {
                debug!(error = %e, "Signaling message not sent");
            }
        }
        for event in sig.take_events() {
            self.events.push(match event {
                SignalingEvent::PeerJoined(peer) => SessionEvent::PeerJoined(peer),
                SignalingEvent::PeerLeft(peer) => SessionEvent::PeerLeft(peer),
            });
        }
    }

    fn shutdown_links(&mut self) {
        let was_open = self.reliable.is_open();
        self.reliable.stop();
        self.reliable.take_events();
        if was_open {
            self.events
                .push(SessionEvent::Disconnected(ChannelRole::Reliable));
        }
        if let Some(fast) = self.fast.as_mut() {
            fast.stop();
            fast.take_events();
        }
        self.fast_ready = false;
        if let Some(sig) = self.signaling.as_mut() {
            sig.reset();
            sig.take_events();
        }
        self.inbox.clear();
    }

    fn terminate(&mut self) {
        self.running = false;
        self.terminated = true;
        self.shutdown_links();
        self.client_id = None;
        self.prediction.reset(self.spawn);
        self.remotes.clear();
        self.ball.clear();
        self.clock.resync();
        self.frozen_until = None;
        self.scores = None;
        self.projectiles.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    use netsync_shared::net::{encode_to_bytes, Direction, PlayerState, SignalMsg, SignalType};
    use serde_json::json;

    use super::*;
    use crate::transport::tests::MockConnector;
    use crate::transport::ConnectionState;

    struct Harness {
        session: SyncSession,
        reliable: MockConnector,
        fast: MockConnector,
    }

    fn cfg() -> SyncConfig {
        let mut cfg = SyncConfig::default();
        cfg.interpolation.render_smoothing = 1.0;
        cfg
    }

    fn harness_with(cfg: SyncConfig, with_fast: bool) -> Harness {
        let reliable = MockConnector::default();
        let fast = MockConnector::default();
        let mut session = SyncSession::new(cfg, "ace", Box::new(reliable.clone()));
        if with_fast {
            session = session.with_fast_channel(Box::new(fast.clone()));
        }
        Harness {
            session,
            reliable,
            fast,
        }
    }

    fn me() -> ClientId {
        ClientId::new("me")
    }

    impl Harness {
        fn open(&mut self, role: ChannelRole, now: Millis) {
            let link = match role {
                ChannelRole::Reliable => &self.reliable,
                ChannelRole::Fast => &self.fast,
            };
            let handshake = *link.0.borrow().opens.last().unwrap();
            self.session
                .on_link_event(now, LinkEvent::Opened { role, handshake });
        }

        fn deliver(&mut self, now: Millis, role: ChannelRole, msg: &NetMsg) {
            let payload = encode_to_bytes(msg).unwrap();
            self.session
                .on_link_event(now, LinkEvent::Message { role, payload });
        }

        /// Started, reliable open, id assigned.
        fn joined(mut self) -> Self {
            self.session.start(0.0);
            self.open(ChannelRole::Reliable, 0.0);
            self.deliver(0.0, ChannelRole::Reliable, &NetMsg::Init { client_id: me() });
            self.session.tick(0.0, 0.0, None);
            self
        }
    }

    fn sent(link: &MockConnector) -> Vec<NetMsg> {
        link.0
            .borrow()
            .sent
            .iter()
            .map(|b| decode_from_bytes(b).unwrap())
            .collect()
    }

    fn snapshot(time: f64, players: &[(&str, f32, f32, u64)]) -> NetMsg {
        let players: BTreeMap<ClientId, PlayerState> = players
            .iter()
            .map(|&(id, x, y, seq)| {
                (
                    ClientId::new(id),
                    PlayerState {
                        x,
                        y,
                        seq,
                        boost: 100.0,
                        team: 1,
                        display_name: id.to_string(),
                    },
                )
            })
            .collect();
        NetMsg::State(StateSnapshot {
            time,
            players,
            ball: None,
            team1_score: 0,
            team2_score: 0,
        })
    }

    fn right() -> Option<InputState> {
        Some(InputState {
            direction: Direction::RIGHT,
            ..Default::default()
        })
    }

    #[test]
    fn start_opens_reliable_and_joins() {
        let mut h = harness_with(cfg(), false);
        h.session.start(0.0);
        assert_eq!(h.session.reliable().state(), ConnectionState::Connecting);
        h.open(ChannelRole::Reliable, 1.0);
        let frame = h.session.tick(1.0, 0.016, None);
        assert!(frame
            .events
            .contains(&SessionEvent::Connected(ChannelRole::Reliable)));
        assert_eq!(
            sent(&h.reliable),
            vec![NetMsg::Join {
                display_name: "ace".into()
            }]
        );
    }

    #[test]
    fn init_opens_fast_channel_and_routes_input() {
        let mut h = harness_with(cfg(), true).joined();
        assert_eq!(h.session.client_id(), Some(&me()));
        assert_eq!(h.fast.0.borrow().opens.len(), 1);

        h.open(ChannelRole::Fast, 16.0);
        let frame = h.session.tick(16.0, 0.016, None);
        assert!(frame
            .events
            .contains(&SessionEvent::Connected(ChannelRole::Fast)));
        assert_eq!(
            sent(&h.fast),
            vec![NetMsg::FastHandshake { client_id: me() }]
        );

        h.session.tick(32.0, 0.016, right());
        let fast_sent = sent(&h.fast);
        assert!(matches!(&fast_sent[1], NetMsg::Input(s) if s.seq == 1));
        assert_eq!(h.session.router_stats().sent_fast, 1);
    }

    #[test]
    fn lost_fast_channel_reroutes_input_to_reliable() {
        let mut h = harness_with(cfg(), true).joined();
        h.open(ChannelRole::Fast, 16.0);
        h.session.tick(16.0, 0.016, None);

        let handshake = *h.fast.0.borrow().opens.last().unwrap();
        h.session.on_link_event(
            20.0,
            LinkEvent::Closed {
                role: ChannelRole::Fast,
                handshake,
            },
        );
        let frame = h.session.tick(32.0, 0.016, right());
        assert!(frame
            .events
            .contains(&SessionEvent::Disconnected(ChannelRole::Fast)));
        assert!(sent(&h.reliable)
            .iter()
            .any(|m| matches!(m, NetMsg::Input(_))));
        let stats = h.session.router_stats();
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.dropped, 0);
    }

    #[test]
    fn reconciliation_end_to_end() {
        let mut h = harness_with(cfg(), false);
        h.session = h.session.with_spawn(Vec2::new(100.0, 100.0));
        let mut h = h.joined();

        h.deliver(10.0, ChannelRole::Reliable, &snapshot(1000.0, &[("me", 150.0, 100.0, 1)]));
        let frame = h.session.tick(10.0, 0.016, None);
        assert!((frame.local.x - 105.0).abs() < 1e-3);

        h.deliver(26.0, ChannelRole::Reliable, &snapshot(1016.0, &[("me", 400.0, 100.0, 2)]));
        let frame = h.session.tick(26.0, 0.016, None);
        assert!((frame.local.x - 110.9).abs() < 1e-3);
        assert_eq!(frame.local.y, 100.0);
    }

    #[test]
    fn malformed_messages_are_dropped() {
        let mut h = harness_with(cfg(), false);
        h.session.start(0.0);
        h.open(ChannelRole::Reliable, 0.0);
        let garbage: [&[u8]; 3] = [b"{not json", br#"{"type":"warp"}"#, br#"{"x":1}"#];
        for raw in garbage {
            h.session.on_link_event(
                1.0,
                LinkEvent::Message {
                    role: ChannelRole::Reliable,
                    payload: Bytes::copy_from_slice(raw),
                },
            );
        }
        h.deliver(1.0, ChannelRole::Reliable, &NetMsg::Init { client_id: me() });
        h.session.tick(1.0, 0.016, None);
        assert!(h.session.reliable().is_open());
        assert_eq!(h.session.client_id(), Some(&me()));
    }

    #[test]
    fn identity_conflict_terminates() {
        let mut h = harness_with(cfg(), false).joined();
        h.deliver(5.0, ChannelRole::Reliable, &snapshot(1000.0, &[("me", 1.0, 1.0, 1), ("other", 0.0, 0.0, 1)]));
        h.session.tick(5.0, 0.016, None);
        assert_eq!(h.session.remotes().len(), 1);

        h.deliver(6.0, ChannelRole::Reliable, &NetMsg::Init {
            client_id: ClientId::new("intruder"),
        });
        let frame = h.session.tick(6.0, 0.016, None);
        assert!(frame.events.contains(&SessionEvent::IdentityConflict {
            assigned: me(),
            received: ClientId::new("intruder"),
        }));
        assert!(h.session.is_terminated());
        assert_eq!(h.session.client_id(), None);
        assert!(h.session.remotes().is_empty());
        assert_eq!(h.session.reliable().state(), ConnectionState::Stopped);

        h.session.start(7.0);
        assert!(!h.session.is_running());
    }

    #[test]
    fn countdown_freezes_input_only() {
        let mut h = harness_with(cfg(), false).joined();
        h.deliver(0.0, ChannelRole::Reliable, &NetMsg::Countdown { seconds: 3 });
        let frame = h.session.tick(0.0, 1.0, right());
        assert!(frame.events.contains(&SessionEvent::Countdown { seconds: 3 }));
        assert_eq!(frame.local.x, 0.0);
        assert!(!sent(&h.reliable)
            .iter()
            .any(|m| matches!(m, NetMsg::Input(_))));

        let frame = h.session.tick(3000.0, 0.1, right());
        assert!((frame.local.x - 30.0).abs() < 1e-3);
        assert!(sent(&h.reliable)
            .iter()
            .any(|m| matches!(m, NetMsg::Input(_))));
    }

    #[test]
    fn remote_entities_interpolate_and_leave() {
        let mut h = harness_with(cfg(), false).joined();
        h.deliver(0.0, ChannelRole::Reliable, &snapshot(1000.0, &[("me", 0.0, 0.0, 1), ("other", 0.0, 0.0, 1)]));
        h.session.tick(0.0, 0.016, None);
        h.deliver(100.0, ChannelRole::Reliable, &snapshot(1100.0, &[("me", 0.0, 0.0, 2), ("other", 100.0, 0.0, 2)]));

        // render time = 100 - (0 - 1000) - 50 = 1050, halfway.
        let frame = h.session.tick(100.0, 0.016, None);
        assert_eq!(frame.remotes.len(), 1);
        assert_eq!(frame.remotes[0].id, ClientId::new("other"));
        assert!((frame.remotes[0].position.x - 50.0).abs() < 1e-3);

        h.deliver(200.0, ChannelRole::Reliable, &snapshot(1200.0, &[("me", 0.0, 0.0, 3)]));
        let frame = h.session.tick(200.0, 0.016, None);
        assert!(frame.remotes.is_empty());
    }

    #[test]
    fn game_reset_clears_remote_state() {
        let mut h = harness_with(cfg(), false).joined();
        h.deliver(0.0, ChannelRole::Reliable, &snapshot(1000.0, &[("other", 5.0, 5.0, 1)]));
        h.session.tick(0.0, 0.016, None);
        h.deliver(1.0, ChannelRole::Reliable, &NetMsg::GameReset);
        let frame = h.session.tick(1.0, 0.016, None);
        assert!(frame.events.contains(&SessionEvent::GameReset));
        assert!(frame.remotes.is_empty());
        assert!(frame.ball.is_none());
    }

    #[test]
    fn ping_is_answered() {
        let mut h = harness_with(cfg(), false).joined();
        h.deliver(1.0, ChannelRole::Reliable, &NetMsg::Ping { t: 42.0 });
        h.session.tick(1.0, 0.016, None);
        assert!(sent(&h.reliable).contains(&NetMsg::Pong { t: 42.0 }));
    }

    #[test]
    fn authority_messages_only_count_on_reliable() {
        let mut h = harness_with(cfg(), true).joined();
        h.open(ChannelRole::Fast, 1.0);
        let goal = NetMsg::Goal {
            team: 1,
            team1_score: 1,
            team2_score: 0,
        };
        h.deliver(2.0, ChannelRole::Fast, &goal);
        let frame = h.session.tick(2.0, 0.016, None);
        assert!(!frame
            .events
            .iter()
            .any(|e| matches!(e, SessionEvent::Goal { .. })));

        h.deliver(3.0, ChannelRole::Reliable, &goal);
        let frame = h.session.tick(3.0, 0.016, None);
        assert!(frame.events.contains(&SessionEvent::Goal {
            team: 1,
            team1_score: 1,
            team2_score: 0,
        }));
    }

    #[test]
    fn delivery_latency_delays_processing() {
        let mut cfg = cfg();
        cfg.delivery.latency_ms = 100.0;
        let mut h = harness_with(cfg, false);
        h.session.start(0.0);
        h.open(ChannelRole::Reliable, 0.0);
        h.deliver(0.0, ChannelRole::Reliable, &NetMsg::Init { client_id: me() });
        h.session.tick(50.0, 0.016, None);
        assert_eq!(h.session.client_id(), None);
        assert_eq!(h.session.pending_inbound(), 1);
        h.session.tick(100.0, 0.016, None);
        assert_eq!(h.session.client_id(), Some(&me()));
    }

    #[test]
    fn reliable_reconnect_resyncs_server_clock() {
        let mut h = harness_with(cfg(), false).joined();
        h.deliver(0.0, ChannelRole::Reliable, &snapshot(1000.0, &[("me", 0.0, 0.0, 1)]));
        h.session.tick(0.0, 0.016, None);
        assert_eq!(h.session.server_clock().offset(), Some(-1000.0));

        let handshake = *h.reliable.0.borrow().opens.last().unwrap();
        h.session.on_link_event(
            10.0,
            LinkEvent::Closed {
                role: ChannelRole::Reliable,
                handshake,
            },
        );
        let frame = h.session.tick(10.0, 0.016, None);
        assert!(frame
            .events
            .contains(&SessionEvent::Disconnected(ChannelRole::Reliable)));

        // First reconnect after the base backoff delay.
        h.session.tick(1010.0, 0.016, None);
        assert_eq!(h.session.reliable().state(), ConnectionState::Connecting);
        h.open(ChannelRole::Reliable, 1020.0);
        h.session.tick(1020.0, 0.016, None);
        assert_eq!(h.session.server_clock().offset(), None);
    }

    #[test]
    fn stop_disconnects_and_ignores_late_events() {
        let mut h = harness_with(cfg(), false).joined();
        h.session.stop();
        assert_eq!(
            h.session.take_events(),
            vec![SessionEvent::Disconnected(ChannelRole::Reliable)]
        );
        h.deliver(1.0, ChannelRole::Reliable, &NetMsg::Ping { t: 1.0 });
        assert_eq!(h.session.pending_inbound(), 0);
    }

    /// Accepts every negotiation step and keeps what was sent to peers.
    #[derive(Default, Clone)]
    struct EchoPeers(Rc<RefCell<Vec<Vec<u8>>>>);

    impl EchoPeers {
        fn sent(&self) -> Vec<NetMsg> {
            self.0
                .borrow()
                .iter()
                .map(|b| decode_from_bytes(b).unwrap())
                .collect()
        }
    }

    impl PeerTransport for EchoPeers {
        fn create_offer(&mut self, _peer: &ClientId) -> anyhow::Result<Value> {
            Ok(json!({"addr": "127.0.0.1:1"}))
        }

        fn accept_offer(&mut self, _peer: &ClientId, _offer: &Value) -> anyhow::Result<Value> {
            Ok(json!({"addr": "127.0.0.1:2"}))
        }

        fn apply_answer(&mut self, _peer: &ClientId, _answer: &Value) -> anyhow::Result<()> {
            Ok(())
        }

        fn add_candidate(&mut self, _peer: &ClientId, _candidate: &Value) -> anyhow::Result<()> {
            Ok(())
        }

        fn send(&mut self, _peer: &ClientId, payload: &[u8]) -> anyhow::Result<()> {
            self.0.borrow_mut().push(payload.to_vec());
            Ok(())
        }

        fn close(&mut self, _peer: &ClientId) {}
    }

    impl Harness {
        /// Negotiates a direct channel to `p2` starting at `now`.
        fn establish_p2(&mut self, now: Millis) {
            let list = NetMsg::WebrtcSignaling(SignalMsg {
                from_peer: ClientId::new("server"),
                to_peer: Some(me()),
                signal_type: SignalType::PeerList,
                signal_data: json!(["me", "p2"]),
            });
            self.deliver(now, ChannelRole::Reliable, &list);
            self.session.tick(now, 0.016, None);

            let answer = NetMsg::WebrtcSignaling(SignalMsg {
                from_peer: ClientId::new("p2"),
                to_peer: Some(me()),
                signal_type: SignalType::Answer,
                signal_data: json!({"addr": "127.0.0.1:2"}),
            });
            self.deliver(now + 1.0, ChannelRole::Reliable, &answer);
            self.session.tick(now + 1.0, 0.016, None);
            self.session.on_link_event(
                now + 2.0,
                LinkEvent::PeerOpened {
                    peer: ClientId::new("p2"),
                },
            );
        }
    }

    #[test]
    fn peer_mesh_negotiates_over_reliable() {
        let peers = EchoPeers::default();
        let mut h = harness_with(cfg(), false);
        h.session = h.session.with_peer_mesh(Box::new(peers.clone()));
        let mut h = h.joined();
        assert!(sent(&h.reliable).contains(&NetMsg::RequestWebrtcPeers { from_peer: me() }));

        h.establish_p2(1.0);
        assert!(sent(&h.reliable).iter().any(|m| matches!(
            m,
            NetMsg::WebrtcSignaling(SignalMsg { signal_type: SignalType::Offer, to_peer: Some(to), .. })
                if to.as_str() == "p2"
        )));
        let frame = h.session.tick(3.0, 0.016, right());
        assert!(frame
            .events
            .contains(&SessionEvent::PeerJoined(ClientId::new("p2"))));

        // Position over the mesh, input to the server.
        assert_eq!(h.session.router_stats().sent_fast, 1);
        assert!(matches!(peers.sent().as_slice(), [NetMsg::PositionUpdate(_)]));
        assert!(sent(&h.reliable)
            .iter()
            .any(|m| matches!(m, NetMsg::Input(s) if s.seq == 1)));
    }

    #[test]
    fn input_reaches_server_while_mesh_is_up() {
        let peers = EchoPeers::default();
        let mut h = harness_with(cfg(), true);
        h.session = h.session.with_peer_mesh(Box::new(peers.clone()));
        let mut h = h.joined();
        h.open(ChannelRole::Fast, 0.5);
        h.session.tick(0.5, 0.016, None);
        h.establish_p2(1.0);

        let handshake = *h.fast.0.borrow().opens.last().unwrap();
        h.session.on_link_event(
            3.0,
            LinkEvent::Closed {
                role: ChannelRole::Fast,
                handshake,
            },
        );
        for i in 0..10 {
            h.session.tick(3.0 + f64::from(i) * 16.0, 0.016, right());
        }

        let inputs = sent(&h.reliable)
            .into_iter()
            .filter(|m| matches!(m, NetMsg::Input(_)))
            .count();
        assert_eq!(inputs, 10);
        let to_peers = peers.sent();
        assert_eq!(to_peers.len(), 10);
        assert!(to_peers
            .iter()
            .all(|m| matches!(m, NetMsg::PositionUpdate(_))));
        let stats = h.session.router_stats();
        assert_eq!(stats.sent_fast, 10);
        assert_eq!(stats.fallbacks, 10);
        assert_eq!(stats.dropped, 0);
    }

    impl Harness {
        /// Answers the latest ping on `role` and processes the pong.
        fn answer_ping(&mut self, role: ChannelRole, now: Millis) {
            let link = match role {
                ChannelRole::Reliable => &self.reliable,
                ChannelRole::Fast => &self.fast,
            };
            let t = sent(link)
                .into_iter()
                .filter_map(|m| match m {
                    NetMsg::Ping { t } => Some(t),
                    _ => None,
                })
                .last()
                .unwrap();
            self.deliver(now, role, &NetMsg::Pong { t });
            self.session.tick(now, 0.0, None);
        }
    }

    #[test]
    fn silent_fast_channel_is_detected() {
        let mut h = harness_with(cfg(), true).joined();
        h.open(ChannelRole::Fast, 0.0);
        h.session.tick(0.0, 0.0, None);
        let ping_at = h.session.cfg.transport.heartbeat_interval_ms;
        let deadline = h.session.cfg.transport.pong_deadline_ms;

        h.session.tick(ping_at, 0.0, None);
        assert!(sent(&h.fast).contains(&NetMsg::Ping { t: ping_at }));
        h.answer_ping(ChannelRole::Reliable, ping_at + 1.0);

        let frame = h.session.tick(ping_at + deadline, 0.0, None);
        assert!(frame
            .events
            .contains(&SessionEvent::Disconnected(ChannelRole::Fast)));
        assert_ne!(
            h.session.fast().map(|f| f.state()),
            Some(ConnectionState::Open)
        );
        assert!(h.session.reliable().is_open());
    }

    #[test]
    fn fast_pong_keeps_fast_channel_open() {
        let mut h = harness_with(cfg(), true).joined();
        h.open(ChannelRole::Fast, 0.0);
        h.session.tick(0.0, 0.0, None);
        let ping_at = h.session.cfg.transport.heartbeat_interval_ms;
        let deadline = h.session.cfg.transport.pong_deadline_ms;

        h.session.tick(ping_at, 0.0, None);
        h.answer_ping(ChannelRole::Reliable, ping_at + 1.0);
        h.answer_ping(ChannelRole::Fast, ping_at + 10.0);
        assert_eq!(h.session.fast().and_then(|f| f.last_rtt_ms()), Some(10.0));

        let frame = h.session.tick(ping_at + deadline, 0.0, None);
        assert!(!frame
            .events
            .contains(&SessionEvent::Disconnected(ChannelRole::Fast)));
        assert_eq!(
            h.session.fast().map(|f| f.state()),
            Some(ConnectionState::Open)
        );
    }

    #[test]
    fn fast_ping_is_answered_on_fast() {
        let mut h = harness_with(cfg(), true).joined();
        h.open(ChannelRole::Fast, 0.0);
        h.session.tick(0.0, 0.0, None);
        h.deliver(1.0, ChannelRole::Fast, &NetMsg::Ping { t: 7.0 });
        h.session.tick(1.0, 0.0, None);
        assert!(sent(&h.fast).contains(&NetMsg::Pong { t: 7.0 }));
        assert!(!sent(&h.reliable).contains(&NetMsg::Pong { t: 7.0 }));
    }
}
