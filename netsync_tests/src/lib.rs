//! Test harness shared by the integration tests.
//!
//! [`ScriptedLink`] stands in for a socket: it records what a channel asks
//! of it, and [`SessionRig`] feeds the session link events and ticks it on
//! a [`ManualClock`], so scenarios run without timers or I/O.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use netsync_client::{
    input::InputState,
    session::{Frame, LinkEvent, SyncSession},
    transport::{ChannelRole, Connector, HandshakeId},
};
use netsync_shared::{
    clock::{Clock, ManualClock, Millis},
    config::SyncConfig,
    math::Vec2,
    net::{decode_from_bytes, encode_to_bytes, ClientId, NetMsg},
};

/// Installs a test-writer subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Default)]
pub struct LinkRecord {
    pub opens: Vec<HandshakeId>,
    pub sent: Vec<Vec<u8>>,
    pub closes: usize,
    pub refuse_open: bool,
    pub refuse_send: bool,
}

/// Connector that only records; completions are injected by the test.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLink(pub Rc<RefCell<LinkRecord>>);

impl ScriptedLink {
    pub fn last_handshake(&self) -> Option<HandshakeId> {
        self.0.borrow().opens.last().copied()
    }

    pub fn open_count(&self) -> usize {
        self.0.borrow().opens.len()
    }

    /// Decoded messages written so far, oldest first.
    pub fn sent(&self) -> Vec<NetMsg> {
        self.0
            .borrow()
            .sent
            .iter()
            .filter_map(|raw| decode_from_bytes(raw).ok())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.0.borrow_mut().sent.clear();
    }

    pub fn set_refuse_open(&self, refuse: bool) {
        self.0.borrow_mut().refuse_open = refuse;
    }
}

impl Connector for ScriptedLink {
    fn open(&mut self, handshake: HandshakeId) -> anyhow::Result<()> {
        let mut rec = self.0.borrow_mut();
        rec.opens.push(handshake);
        if rec.refuse_open {
            anyhow::bail!("connection refused");
        }
        Ok(())
    }

    fn send(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        let mut rec = self.0.borrow_mut();
        if rec.refuse_send {
            anyhow::bail!("broken pipe");
        }
        rec.sent.push(payload.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        self.0.borrow_mut().closes += 1;
    }
}

/// A session wired to scripted links and a manual clock.
pub struct SessionRig {
    pub session: SyncSession,
    pub clock: ManualClock,
    pub reliable: ScriptedLink,
    pub fast: ScriptedLink,
    pub tick_hz: u32,
}

impl SessionRig {
    pub fn new(cfg: SyncConfig) -> Self {
        let reliable = ScriptedLink::default();
        let fast = ScriptedLink::default();
        let session = SyncSession::new(cfg, "rig".to_string(), Box::new(reliable.clone()))
            .with_fast_channel(Box::new(fast.clone()));
        Self {
            session,
            clock: ManualClock::new(1_000.0),
            reliable,
            fast,
            tick_hz: 60,
        }
    }

    pub fn spawn_at(mut self, spawn: Vec2) -> Self {
        self.session = self.session.with_spawn(spawn);
        self
    }

    pub fn now(&self) -> Millis {
        self.clock.now_ms()
    }

    pub fn start(&mut self) {
        let now = self.now();
        self.session.start(now);
    }

    pub fn event(&mut self, event: LinkEvent) {
        let now = self.now();
        self.session.on_link_event(now, event);
    }

    pub fn open(&mut self, role: ChannelRole) {
        let link = match role {
            ChannelRole::Reliable => &self.reliable,
            ChannelRole::Fast => &self.fast,
        };
        if let Some(handshake) = link.last_handshake() {
            self.event(LinkEvent::Opened { role, handshake });
        }
    }

    pub fn close(&mut self, role: ChannelRole) {
        let link = match role {
            ChannelRole::Reliable => &self.reliable,
            ChannelRole::Fast => &self.fast,
        };
        if let Some(handshake) = link.last_handshake() {
            self.event(LinkEvent::Closed { role, handshake });
        }
    }

    /// Delivers a server message as if it arrived on `role`.
    pub fn deliver(&mut self, role: ChannelRole, msg: &NetMsg) -> anyhow::Result<()> {
        let payload: Bytes = encode_to_bytes(msg)?;
        self.event(LinkEvent::Message { role, payload });
        Ok(())
    }

    pub fn deliver_raw(&mut self, role: ChannelRole, raw: &'static [u8]) {
        self.event(LinkEvent::Message {
            role,
            payload: Bytes::from_static(raw),
        });
    }

    /// Advances the clock by one step and ticks.
    pub fn step(&mut self, input: Option<InputState>) -> Frame {
        let dt_ms = 1000.0 / f64::from(self.tick_hz);
        self.clock.advance(dt_ms);
        let now = self.now();
        self.session.tick(now, (dt_ms / 1000.0) as f32, input)
    }

    /// Ticks at the current time without moving the clock.
    pub fn settle(&mut self) -> Frame {
        let now = self.now();
        self.session.tick(now, 0.0, None)
    }

    /// Starts, opens the reliable channel and applies `init`.
    pub fn connect_as(&mut self, id: &str) -> anyhow::Result<Frame> {
        self.start();
        self.open(ChannelRole::Reliable);
        self.deliver(
            ChannelRole::Reliable,
            &NetMsg::Init {
                client_id: ClientId::new(id),
            },
        )?;
        Ok(self.settle())
    }
}
