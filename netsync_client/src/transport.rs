//! Transport channels.
//!
//! A [`TransportChannel`] owns the lifecycle of one physical connection
//! (reliable stream or fast datagram link). It never performs I/O itself:
//! a [`Connector`] starts opens and writes bytes, and the outcome comes back
//! through `on_open` / `on_close` / `on_error`, each tagged with the
//! [`HandshakeId`] of the attempt it belongs to. Events for any other
//! attempt are ignored, which makes late or duplicated callbacks harmless.
//!
//! Lifecycle:
//!
//! ```text
//! Idle -> Connecting -> Open -> (Closed | Errored) -> ReconnectScheduled -> Connecting
//!                                                  \-> Degraded (attempts exhausted)
//! ```
//!
//! Timers (connect watchdog, reconnect, heartbeat) are plain deadlines
//! checked by [`TransportChannel::poll`] on each tick, so a stale timer can
//! never fire into the wrong state.

use std::fmt;

use netsync_shared::{
    clock::Millis,
    config::TransportConfig,
    net::{encode_to_bytes, NetMsg},
};
use tracing::{debug, info, warn};

/// Which kind of traffic a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// Ordered, retransmitted (stream).
    Reliable,
    /// Unordered, no retransmission (datagrams).
    Fast,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRole::Reliable => f.write_str("reliable"),
            ChannelRole::Fast => f.write_str("fast"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, never connected.
    Idle,
    Connecting,
    Open,
    /// Closed by the remote side or by a missed heartbeat.
    Closed,
    /// Open failed or timed out.
    Errored,
    ReconnectScheduled,
    /// Reconnect attempts exhausted; stays here until reset.
    Degraded,
    /// Shut down by the owner; never reconnects.
    Stopped,
}

/// Identifies one connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandshakeId(pub u64);

impl HandshakeId {
    pub fn random() -> Self {
        HandshakeId(rand::random())
    }
}

impl fmt::Display for HandshakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// The physical side of a channel.
pub trait Connector {
    /// Starts opening a connection. Completion is reported later through
    /// the channel's `on_open`/`on_error` with the same `handshake`.
    fn open(&mut self, handshake: HandshakeId) -> anyhow::Result<()>;

    /// Queues bytes on the open connection without blocking.
    fn send(&mut self, payload: &[u8]) -> anyhow::Result<()>;

    /// Drops the current connection, if any.
    fn close(&mut self);
}

/// Why a payload was not handed to a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The channel is not in the `Open` state.
    NotOpen(ChannelRole),
    /// The link rejected the write.
    Link(String),
    /// The message could not be serialized.
    Encode(String),
    /// No channel was able to take the message.
    NoRoute,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::NotOpen(role) => write!(f, "{role} channel is not open"),
            SendError::Link(e) => write!(f, "link write failed: {e}"),
            SendError::Encode(e) => write!(f, "encode failed: {e}"),
            SendError::NoRoute => write!(f, "no open channel for message"),
        }
    }
}

impl std::error::Error for SendError {}

/// Something that can take an encoded payload right now.
pub trait Outlet {
    fn is_healthy(&self) -> bool;
    fn send_payload(&mut self, payload: &[u8]) -> Result<(), SendError>;
}

/// Exponential reconnect delay: `min(base * 2^attempt, cap)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base_ms: Millis,
    pub cap_ms: Millis,
}

impl Backoff {
    pub fn new(base_ms: Millis, cap_ms: Millis) -> Self {
        Self { base_ms, cap_ms }
    }

    pub fn delay_ms(&self, attempt: u32) -> Millis {
        let exp = 2f64.powi(attempt.min(62) as i32);
        (self.base_ms * exp).min(self.cap_ms)
    }
}

/// Lifecycle notifications for the channel owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    /// An open connection went away (explicit close, error or missed pong).
    Lost,
    Degraded,
}

#[derive(Debug, Clone, Copy)]
struct PendingPing {
    nonce: f64,
    deadline: Millis,
}

pub struct TransportChannel {
    role: ChannelRole,
    state: ConnectionState,
    reconnect_attempts: u32,
    last_handshake: Option<HandshakeId>,
    cfg: TransportConfig,
    backoff: Backoff,
    connector: Box<dyn Connector>,

    connect_deadline: Option<Millis>,
    reconnect_at: Option<Millis>,
    suspended: bool,
    pending_reconnect: bool,

    heartbeat: bool,
    next_ping_at: Option<Millis>,
    awaiting_pong: Option<PendingPing>,
    last_rtt_ms: Option<Millis>,

    events: Vec<ChannelEvent>,
}

impl TransportChannel {
    pub fn new(role: ChannelRole, cfg: TransportConfig, connector: Box<dyn Connector>) -> Self {
        let backoff = Backoff::new(cfg.backoff_base_ms, cfg.backoff_cap_ms);
        Self {
            role,
            state: ConnectionState::Idle,
            reconnect_attempts: 0,
            last_handshake: None,
            cfg,
            backoff,
            connector,
            connect_deadline: None,
            reconnect_at: None,
            suspended: false,
            pending_reconnect: false,
            heartbeat: false,
            next_ping_at: None,
            awaiting_pong: None,
            last_rtt_ms: None,
            events: Vec::new(),
        }
    }

    /// Enables ping/pong keepalive while open.
    pub fn with_heartbeat(mut self) -> Self {
        self.heartbeat = true;
        self
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn last_handshake(&self) -> Option<HandshakeId> {
        self.last_handshake
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn is_degraded(&self) -> bool {
        self.state == ConnectionState::Degraded
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.pending_reconnect
    }

    /// When the next reconnect attempt is due, if one is scheduled.
    pub fn reconnect_at(&self) -> Option<Millis> {
        self.reconnect_at
    }

    pub fn last_rtt_ms(&self) -> Option<Millis> {
        self.last_rtt_ms
    }

    pub fn take_events(&mut self) -> Vec<ChannelEvent> {
        std::mem::take(&mut self.events)
    }

    /// Starts a connect attempt. No-op while connecting, open, degraded or
    /// stopped.
    pub fn connect(&mut self, now: Millis) {
        match self.state {
            ConnectionState::Connecting
            | ConnectionState::Open
            | ConnectionState::Degraded
            | ConnectionState::Stopped => return,
            _ => {}
        }

        let handshake = HandshakeId::random();
        self.last_handshake = Some(handshake);
        self.state = ConnectionState::Connecting;
        self.connect_deadline = Some(now + self.cfg.connect_timeout_ms);
        self.reconnect_at = None;
        info!(role = %self.role, %handshake, attempt = self.reconnect_attempts, "Connecting");

        if let Err(e) = self.connector.open(handshake) {
            warn!(role = %self.role, error = %e, "Connect failed to start");
            self.fail(now, ConnectionState::Errored);
        }
    }

    pub fn on_open(&mut self, now: Millis, handshake: HandshakeId) {
        if !self.is_current(handshake) || self.state != ConnectionState::Connecting {
            debug!(role = %self.role, %handshake, state = ?self.state, "Ignoring stale open");
            return;
        }
        self.state = ConnectionState::Open;
        self.reconnect_attempts = 0;
        self.connect_deadline = None;
        self.reconnect_at = None;
        self.pending_reconnect = false;
        self.awaiting_pong = None;
        self.next_ping_at = self
            .heartbeat
            .then_some(now + self.cfg.heartbeat_interval_ms);
        self.events.push(ChannelEvent::Opened);
        info!(role = %self.role, %handshake, "Channel open");
    }

    pub fn on_close(&mut self, now: Millis, handshake: HandshakeId) {
        if !self.accepts_failure(handshake) {
            return;
        }
        info!(role = %self.role, %handshake, "Channel closed");
        self.fail(now, ConnectionState::Closed);
    }

    pub fn on_error(&mut self, now: Millis, handshake: HandshakeId, reason: &str) {
        if !self.accepts_failure(handshake) {
            return;
        }
        warn!(role = %self.role, %handshake, reason, "Channel error");
        self.fail(now, ConnectionState::Errored);
    }

    /// Records a pong; clears the outstanding ping if the nonce matches.
    pub fn on_pong(&mut self, now: Millis, nonce: f64) {
        if let Some(pending) = self.awaiting_pong {
            if pending.nonce == nonce {
                self.awaiting_pong = None;
                self.last_rtt_ms = Some(now - nonce);
            }
        }
    }

    /// Host went to background (`true`) or foreground (`false`).
    pub fn set_suspended(&mut self, now: Millis, suspended: bool) {
        self.suspended = suspended;
        if !suspended && self.pending_reconnect {
            self.pending_reconnect = false;
            info!(role = %self.role, "Foregrounded, running deferred reconnect");
            self.connect(now);
        }
    }

    /// Drives the watchdog, reconnect and heartbeat deadlines.
    pub fn poll(&mut self, now: Millis) {
        match self.state {
            ConnectionState::Connecting => {
                if self.connect_deadline.is_some_and(|d| now >= d) {
                    warn!(role = %self.role, "Connect attempt timed out");
                    self.fail(now, ConnectionState::Errored);
                }
            }
            ConnectionState::ReconnectScheduled => {
                if self.reconnect_at.is_some_and(|at| now >= at) {
                    self.reconnect_at = None;
                    if self.suspended {
                        debug!(role = %self.role, "Reconnect deferred while suspended");
                        self.pending_reconnect = true;
                    } else {
                        self.connect(now);
                    }
                }
            }
            ConnectionState::Open if self.heartbeat => self.poll_heartbeat(now),
            _ => {}
        }
    }

    /// Writes a payload; only valid while open.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), SendError> {
        if self.state != ConnectionState::Open {
            return Err(SendError::NotOpen(self.role));
        }
        self.connector
            .send(payload)
            .map_err(|e| SendError::Link(e.to_string()))
    }

    pub fn send_msg(&mut self, msg: &NetMsg) -> Result<(), SendError> {
        let payload = encode_to_bytes(msg).map_err(|e| SendError::Encode(e.to_string()))?;
        self.send(&payload)
    }

    /// Closes the connection for good.
    pub fn stop(&mut self) {
        if self.state == ConnectionState::Stopped {
            return;
        }
        let was_open = self.state == ConnectionState::Open;
        self.connector.close();
        self.state = ConnectionState::Stopped;
        self.last_handshake = None;
        self.connect_deadline = None;
        self.reconnect_at = None;
        self.pending_reconnect = false;
        self.awaiting_pong = None;
        self.next_ping_at = None;
        if was_open {
            self.events.push(ChannelEvent::Lost);
        }
        info!(role = %self.role, "Channel stopped");
    }

    /// Returns a stopped or degraded channel to `Idle` with a fresh budget.
    pub fn reset(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Stopped | ConnectionState::Degraded
        ) {
            self.state = ConnectionState::Idle;
            self.reconnect_attempts = 0;
        }
    }

    fn poll_heartbeat(&mut self, now: Millis) {
        if let Some(pending) = self.awaiting_pong {
            if now >= pending.deadline {
                warn!(role = %self.role, "Pong overdue, treating as disconnect");
                self.fail(now, ConnectionState::Closed);
            }
            return;
        }
        if self.next_ping_at.is_some_and(|at| now >= at) {
            self.next_ping_at = Some(now + self.cfg.heartbeat_interval_ms);
            match self.send_msg(&NetMsg::Ping { t: now }) {
                Ok(()) => {
                    self.awaiting_pong = Some(PendingPing {
                        nonce: now,
                        deadline: now + self.cfg.pong_deadline_ms,
                    });
                }
                Err(e) => {
                    warn!(role = %self.role, error = %e, "Ping failed");
                    self.fail(now, ConnectionState::Closed);
                }
            }
        }
    }

    fn is_current(&self, handshake: HandshakeId) -> bool {
        self.last_handshake == Some(handshake)
    }

    /// Close/error only count for the live attempt of a live channel.
    fn accepts_failure(&self, handshake: HandshakeId) -> bool {
        self.is_current(handshake)
            && matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Open
            )
    }

    fn fail(&mut self, now: Millis, terminal: ConnectionState) {
        let was_open = self.state == ConnectionState::Open;
        self.connector.close();
        self.state = terminal;
        self.last_handshake = None;
        self.connect_deadline = None;
        self.awaiting_pong = None;
        self.next_ping_at = None;
        if was_open {
            self.events.push(ChannelEvent::Lost);
        }
        self.schedule_reconnect(now);
    }

    fn schedule_reconnect(&mut self, now: Millis) {
        if self.reconnect_attempts >= self.cfg.max_reconnect_attempts {
            warn!(
                role = %self.role,
                attempts = self.reconnect_attempts,
                "Reconnect attempts exhausted, channel degraded"
            );
            self.state = ConnectionState::Degraded;
            self.reconnect_at = None;
            self.events.push(ChannelEvent::Degraded);
            return;
        }
        let delay = self.backoff.delay_ms(self.reconnect_attempts);
        self.reconnect_attempts += 1;
        self.reconnect_at = Some(now + delay);
        self.state = ConnectionState::ReconnectScheduled;
        info!(
            role = %self.role,
            attempt = self.reconnect_attempts,
            delay_ms = delay,
            "Reconnect scheduled"
        );
    }
}

impl Outlet for TransportChannel {
    fn is_healthy(&self) -> bool {
        self.is_open()
    }

    fn send_payload(&mut self, payload: &[u8]) -> Result<(), SendError> {
        self.send(payload)
    }
}
