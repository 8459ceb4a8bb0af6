//! Client implementation.
//!
//! Bridges real sockets to the synchronous [`SyncSession`]:
//! - [`TcpConnector`]: reliable channel, length-prefixed JSON frames.
//! - [`UdpConnector`]: fast channel to the server, one JSON document per
//!   datagram.
//! - [`GameClient`]: owns the session, drains link events and runs fixed
//!   simulation steps against the wall clock.
//!
//! Every link runs its own reader and writer tasks and reports back through
//! one unbounded channel of [`LinkEvent`]s, so socket activity never blocks
//! the tick.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use netsync_shared::{
    clock::{Clock, Millis, SystemClock},
    config::ClientConfig,
    net::{ReliableConn, UnreliableConn},
};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::{
    input::InputState,
    peer_udp::UdpPeerTransport,
    scheduler::FixedStepScheduler,
    session::{Frame, LinkEvent, SessionEvent, SyncSession},
    transport::{ChannelRole, Connector, HandshakeId},
};

/// Where links report to.
pub type LinkSender = UnboundedSender<LinkEvent>;

/// Catch-up steps allowed per frame.
const MAX_STEPS_PER_FRAME: u32 = 5;

/// A running link: outbound queue plus the task that owns the socket.
struct LinkTask {
    outbound: UnboundedSender<Bytes>,
    task: JoinHandle<()>,
}

impl LinkTask {
    fn send(&self, payload: &[u8]) -> anyhow::Result<()> {
        self.outbound
            .send(Bytes::copy_from_slice(payload))
            .map_err(|_| anyhow::anyhow!("link task has exited"))
    }
}

impl Drop for LinkTask {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn report_error(events: &LinkSender, role: ChannelRole, handshake: HandshakeId, e: anyhow::Error) {
    let _ = events.send(LinkEvent::Error {
        role,
        handshake,
        reason: format!("{e:#}"),
    });
}

/// Reliable channel over TCP.
pub struct TcpConnector {
    addr: SocketAddr,
    events: LinkSender,
    link: Option<LinkTask>,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr, events: LinkSender) -> Self {
        Self {
            addr,
            events,
            link: None,
        }
    }
}

impl Connector for TcpConnector {
    fn open(&mut self, handshake: HandshakeId) -> anyhow::Result<()> {
        // Drops (and aborts) any previous attempt.
        self.link = None;
        let (outbound, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_tcp(self.addr, handshake, rx, self.events.clone()));
        self.link = Some(LinkTask { outbound, task });
        Ok(())
    }

    fn send(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        self.link.as_ref().context("tcp link not open")?.send(payload)
    }

    fn close(&mut self) {
        self.link = None;
    }
}

async fn run_tcp(
    addr: SocketAddr,
    handshake: HandshakeId,
    mut outbound: UnboundedReceiver<Bytes>,
    events: LinkSender,
) {
    let role = ChannelRole::Reliable;
    let conn = match ReliableConn::connect(addr).await {
        Ok(conn) => conn,
        Err(e) => return report_error(&events, role, handshake, e),
    };
    let (mut reader, mut writer) = conn.into_split();
    let _ = events.send(LinkEvent::Opened { role, handshake });

    let write_events = events.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            if let Err(e) = writer.send_frame(&payload).await {
                return report_error(&write_events, role, handshake, e);
            }
        }
    });

    loop {
        match reader.recv_frame().await {
            Ok(payload) => {
                if events.send(LinkEvent::Message { role, payload }).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(%handshake, error = %e, "Reliable read ended");
                let _ = events.send(LinkEvent::Closed { role, handshake });
                break;
            }
        }
    }
    writer_task.abort();
}

/// Fast channel to the server over UDP.
pub struct UdpConnector {
    addr: SocketAddr,
    events: LinkSender,
    link: Option<LinkTask>,
}

impl UdpConnector {
    pub fn new(addr: SocketAddr, events: LinkSender) -> Self {
        Self {
            addr,
            events,
            link: None,
        }
    }
}

impl Connector for UdpConnector {
    fn open(&mut self, handshake: HandshakeId) -> anyhow::Result<()> {
        self.link = None;
        let (outbound, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_udp(self.addr, handshake, rx, self.events.clone()));
        self.link = Some(LinkTask { outbound, task });
        Ok(())
    }

    fn send(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        self.link.as_ref().context("udp link not open")?.send(payload)
    }

    fn close(&mut self) {
        self.link = None;
    }
}

async fn run_udp(
    addr: SocketAddr,
    handshake: HandshakeId,
    mut outbound: UnboundedReceiver<Bytes>,
    events: LinkSender,
) {
    let role = ChannelRole::Fast;
    let any: IpAddr = if addr.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };
    let conn = match UnreliableConn::connect(SocketAddr::new(any, 0), addr).await {
        Ok(conn) => Arc::new(conn),
        Err(e) => return report_error(&events, role, handshake, e),
    };
    let _ = events.send(LinkEvent::Opened { role, handshake });

    let sender = Arc::clone(&conn);
    let write_events = events.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            if let Err(e) = sender.send_raw(&payload).await {
                return report_error(&write_events, role, handshake, e);
            }
        }
    });

    loop {
        match conn.recv_raw().await {
            Ok(payload) => {
                if events.send(LinkEvent::Message { role, payload }).is_err() {
                    break;
                }
            }
            Err(e) => {
                report_error(&events, role, handshake, e);
                break;
            }
        }
    }
    writer_task.abort();
}

/// High-level game client: a [`SyncSession`] wired to real sockets.
pub struct GameClient {
    cfg: ClientConfig,
    session: SyncSession,
    events: UnboundedReceiver<LinkEvent>,
    clock: Box<dyn Clock>,
    scheduler: FixedStepScheduler,
    last_frame_at: Option<Millis>,
}

impl GameClient {
    /// Builds the client; nothing connects until [`GameClient::start`].
    /// Must be called inside a tokio runtime.
    pub fn new(cfg: ClientConfig) -> anyhow::Result<Self> {
        Self::with_clock(cfg, Box::new(SystemClock::new()))
    }

    pub fn with_clock(cfg: ClientConfig, clock: Box<dyn Clock>) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let (tx, rx) = mpsc::unbounded_channel();

        let mut session = SyncSession::new(
            cfg.sync.clone(),
            cfg.display_name.clone(),
            Box::new(TcpConnector::new(addr, tx.clone())),
        );
        if cfg.fast_channel {
            session = session.with_fast_channel(Box::new(UdpConnector::new(addr, tx.clone())));
        }
        if cfg.peer_mesh {
            let ip: IpAddr = cfg.peer_bind_ip.parse().context("parse peer_bind_ip")?;
            session = session.with_peer_mesh(Box::new(UdpPeerTransport::new(ip, tx)));
        }

        info!(
            server = %addr,
            fast = cfg.fast_channel,
            peers = cfg.peer_mesh,
            tick_hz = cfg.tick_hz,
            "Client created"
        );
        Ok(Self {
            scheduler: FixedStepScheduler::new(cfg.tick_hz, MAX_STEPS_PER_FRAME),
            cfg,
            session,
            events: rx,
            clock,
            last_frame_at: None,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.cfg
    }

    pub fn session(&self) -> &SyncSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SyncSession {
        &mut self.session
    }

    pub fn start(&mut self) {
        let now = self.clock.now_ms();
        self.session.start(now);
    }

    pub fn stop(&mut self) -> Vec<SessionEvent> {
        self.session.stop();
        self.session.take_events()
    }

    pub fn set_visibility(&mut self, visible: bool) {
        let now = self.clock.now_ms();
        self.session.set_visibility(now, visible);
    }

    /// Hands every pending link event to the session.
    pub fn pump(&mut self) -> usize {
        let now = self.clock.now_ms();
        let mut n = 0;
        while let Ok(event) = self.events.try_recv() {
            self.session.on_link_event(now, event);
            n += 1;
        }
        n
    }

    /// Runs the simulation steps due since the previous call. Returns the
    /// latest frame with the events of every step, or `None` if no step was
    /// due.
    pub fn frame(&mut self, input: InputState) -> Option<Frame> {
        let now = self.clock.now_ms();
        let elapsed = self
            .last_frame_at
            .map_or(self.scheduler.step_ms(), |at| now - at);
        self.last_frame_at = Some(now);
        self.pump();

        let steps = self.scheduler.advance(elapsed);
        let dt = self.scheduler.step_secs();
        let mut merged: Option<Frame> = None;
        for _ in 0..steps {
            let mut frame = self.session.tick(now, dt, Some(input));
            if let Some(prev) = merged.take() {
                let mut events = prev.events;
                events.append(&mut frame.events);
                frame.events = events;
                let mut projectiles = prev.projectiles;
                projectiles.append(&mut frame.projectiles);
                frame.projectiles = projectiles;
            }
            merged = Some(frame);
        }
        merged
    }

    /// Drives the client on a tick interval for `duration` and returns the
    /// session events raised meanwhile.
    pub async fn run_for(&mut self, duration: Duration, input: InputState) -> Vec<SessionEvent> {
        let step = Duration::from_secs_f64(self.scheduler.step_ms() / 1000.0);
        let mut interval = tokio::time::interval(step);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = Instant::now() + duration;

        let mut events = Vec::new();
        while Instant::now() < deadline {
            interval.tick().await;
            if let Some(frame) = self.frame(input) {
                events.extend(frame.events);
            }
            if self.session.is_terminated() {
                break;
            }
        }
        events
    }
}
