//! Reference relay server.
//!
//! An authoritative tick loop for local play and integration tests:
//! - Assigns client ids (`init`) and answers `ping`
//! - Relays peer signaling, answers peer-list requests, announces `peer_left`
//! - Maps `fast_handshake` datagrams to client UDP addresses
//! - Integrates `input` (fast or reliable) into authoritative positions
//! - Broadcasts `state` snapshots over the reliable channel every tick
//!
//! Each client's TCP stream is served by a reader and a writer task; the
//! tick drains what the readers collected, so the loop never blocks on a
//! single client.
//!
//! Determinism notes:
//! - Fixed timestep simulation.
//! - Clients are kept in a `BTreeMap` so iteration order is stable.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::Context;
use netsync_shared::{
    config::ServerConfig,
    math::Vec2,
    net::{
        decode_from_bytes, encode_to_bytes, Actions, BallState, ClientId, Direction, InputSample,
        NetMsg, PlayerState, ReliableConn, ReliableListener, SignalMsg, SignalType,
        StateSnapshot, MAX_DATAGRAM_LEN,
    },
};
use tokio::{
    net::UdpSocket,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

/// Sender id used for server-originated signaling.
pub const SERVER_PEER_ID: &str = "server";

const BOOST_MULTIPLIER: f32 = 1.5;
const BOOST_MAX: f32 = 100.0;
const BOOST_DRAIN_PER_SEC: f32 = 50.0;
const BOOST_REGEN_PER_SEC: f32 = 10.0;
const GRAB_RANGE: f32 = 30.0;
const SHOT_SPEED: f32 = 600.0;
const BALL_FRICTION_PER_SEC: f32 = 0.5;
const FIELD_CENTER: Vec2 = Vec2::new(400.0, 300.0);

/// What the per-client reader tasks report.
#[derive(Debug)]
enum Inbound {
    Message(ClientId, NetMsg),
    Disconnected(ClientId),
}

/// Connected client state.
struct ClientSlot {
    outbound: UnboundedSender<NetMsg>,
    udp_peer: Option<SocketAddr>,
    player: PlayerState,
    direction: Direction,
    actions: Actions,
    aim: Vec2,
    tasks: [JoinHandle<()>; 2],
}

impl ClientSlot {
    fn send(&self, msg: NetMsg) {
        // A closed writer means the reader has already reported the drop.
        let _ = self.outbound.send(msg);
    }
}

impl Drop for ClientSlot {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Server-side shared object.
#[derive(Debug, Clone)]
struct Ball {
    position: Vec2,
    velocity: Vec2,
    owner: Option<ClientId>,
}

impl Ball {
    fn new() -> Self {
        Self {
            position: FIELD_CENTER,
            velocity: Vec2::ZERO,
            owner: None,
        }
    }

    fn state(&self) -> BallState {
        BallState {
            x: self.position.x,
            y: self.position.y,
            active: true,
            grabbed: self.owner.is_some(),
            owner: self.owner.clone(),
        }
    }
}

/// Relay and authority server.
pub struct RelayServer {
    pub cfg: ServerConfig,
    clients: BTreeMap<ClientId, ClientSlot>,

    tcp: ReliableListener,
    udp: UdpSocket,

    inbound_tx: UnboundedSender<Inbound>,
    inbound_rx: UnboundedReceiver<Inbound>,

    next_client: u64,
    tick: u64,
    epoch: Instant,
    ball: Ball,
    scores: (u32, u32),

    /// Channel for console commands from stdin.
    console_rx: Option<mpsc::Receiver<String>>,
}

impl RelayServer {
    /// Binds TCP and UDP on the configured address.
    pub async fn new(cfg: ServerConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.listen_addr.parse().context("parse listen_addr")?;
        let tcp = ReliableListener::bind(addr).await?;
        let udp = UdpSocket::bind(addr).await.context("udp bind")?;
        Ok(Self::from_parts(cfg, tcp, udp))
    }

    fn from_parts(cfg: ServerConfig, tcp: ReliableListener, udp: UdpSocket) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            cfg,
            clients: BTreeMap::new(),
            tcp,
            udp,
            inbound_tx,
            inbound_rx,
            next_client: 1,
            tick: 0,
            epoch: Instant::now(),
            ball: Ball::new(),
            scores: (0, 0),
            console_rx: None,
        }
    }

    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn client_ids(&self) -> impl Iterator<Item = &ClientId> {
        self.clients.keys()
    }

    pub fn player(&self, id: &ClientId) -> Option<&PlayerState> {
        self.clients.get(id).map(|c| &c.player)
    }

    pub fn udp_peer(&self, id: &ClientId) -> Option<SocketAddr> {
        self.clients.get(id).and_then(|c| c.udp_peer)
    }

    /// Milliseconds since the server started; the snapshot timeline.
    pub fn now_ms(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }

    /// Accepts exactly one client and assigns its id.
    pub async fn accept_one(&mut self) -> anyhow::Result<ClientId> {
        let conn = self.tcp.accept().await?;
        Ok(self.register(conn))
    }

    /// Accepts a client if one connects within `timeout`.
    pub async fn try_accept(&mut self, timeout: Duration) -> anyhow::Result<Option<ClientId>> {
        let accepted = tokio::time::timeout(timeout, self.tcp.accept()).await;
        match accepted {
            Ok(Ok(conn)) => Ok(Some(self.register(conn))),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    fn register(&mut self, conn: ReliableConn) -> ClientId {
        let id = ClientId::new(format!("c{}", self.next_client));
        self.next_client += 1;
        let peer = conn.peer_addr();
        let (mut reader, mut writer) = conn.into_split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<NetMsg>();

        let reader_id = id.clone();
        let inbound = self.inbound_tx.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match reader.recv_frame().await {
                    Ok(frame) => match decode_from_bytes(&frame) {
                        Ok(msg) => {
                            if inbound.send(Inbound::Message(reader_id.clone(), msg)).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(client_id = %reader_id, error = %e, "Dropping malformed message"),
                    },
                    Err(e) => {
                        debug!(client_id = %reader_id, error = %e, "Client stream ended");
                        let _ = inbound.send(Inbound::Disconnected(reader_id));
                        return;
                    }
                }
            }
        });
        let writer_id = id.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = writer.send(&msg).await {
                    debug!(client_id = %writer_id, error = %e, "Client write failed");
                    return;
                }
            }
        });

        let spawn = Vec2::new(100.0 + 50.0 * (self.clients.len() % 8) as f32, 100.0);
        let team = if self.clients.len() % 2 == 0 { 1 } else { 2 };
        let slot = ClientSlot {
            outbound,
            udp_peer: None,
            player: PlayerState {
                x: spawn.x,
                y: spawn.y,
                seq: 0,
                boost: BOOST_MAX,
                team,
                display_name: String::new(),
            },
            direction: Direction::empty(),
            actions: Actions::empty(),
            aim: Vec2::ZERO,
            tasks: [reader_task, writer_task],
        };
        slot.send(NetMsg::Init {
            client_id: id.clone(),
        });
        self.clients.insert(id.clone(), slot);

        info!(client_id = %id, %peer, team, "Client connected");
        id
    }

    /// Runs the server for a number of ticks, accepting clients as they
    /// arrive.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = Duration::from_secs_f64(1.0 / f64::from(self.cfg.tick_hz.max(1)));
        let mut next = Instant::now();

        for _ in 0..ticks {
            next += dt;
            self.try_accept(Duration::from_millis(1)).await?;
            self.step(dt.as_secs_f32()).await?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes one fixed simulation step.
    pub async fn step(&mut self, dt_sec: f32) -> anyhow::Result<()> {
        self.process_console_commands();
        self.drain_reliable();
        self.recv_datagrams()?;
        self.simulate(dt_sec);
        self.broadcast_state();
        self.tick += 1;
        Ok(())
    }

    fn process_console_commands(&mut self) {
        let lines: Vec<String> = match self.console_rx.as_mut() {
            Some(rx) => {
                let mut collected = Vec::new();
                while let Ok(line) = rx.try_recv() {
                    collected.push(line);
                }
                collected
            }
            None => Vec::new(),
        };
        for line in lines {
            for out in self.exec_console(&line) {
                println!("{out}");
            }
        }
    }

    /// Executes a console command.
    pub fn exec_console(&mut self, line: &str) -> Vec<String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = tokens.first() else {
            return Vec::new();
        };

        match command {
            "status" => {
                let mut out = vec![
                    format!("Tick: {}", self.tick),
                    format!("Score: {} - {}", self.scores.0, self.scores.1),
                    format!("Clients: {}", self.clients.len()),
                ];
                for (id, c) in &self.clients {
                    out.push(format!(
                        "  {id}: name={:?} team={} pos=({:.1},{:.1}) seq={} udp={:?}",
                        c.player.display_name, c.player.team, c.player.x, c.player.y, c.player.seq, c.udp_peer
                    ));
                }
                out
            }
            "countdown" => {
                let seconds = tokens.get(1).and_then(|s| s.parse().ok()).unwrap_or(3);
                self.broadcast(NetMsg::Countdown { seconds });
                vec![format!("Countdown {seconds}s")]
            }
            "reset" => {
                self.reset_game();
                vec!["Game reset".to_string()]
            }
            "goal" => {
                let team = tokens.get(1).and_then(|s| s.parse().ok()).unwrap_or(1);
                self.score_goal(team);
                vec![format!("Goal for team {team}")]
            }
            "quit" | "exit" => {
                info!("Server shutting down");
                std::process::exit(0);
            }
            other => vec![format!("Unknown command: {other}")],
        }
    }

    /// Sends a message to every client over the reliable channel.
    pub fn broadcast(&self, msg: NetMsg) {
        for c in self.clients.values() {
            c.send(msg.clone());
        }
    }

    pub fn reset_game(&mut self) {
        self.ball = Ball::new();
        self.scores = (0, 0);
        for c in self.clients.values_mut() {
            c.player.boost = BOOST_MAX;
        }
        info!("Game reset");
        self.broadcast(NetMsg::GameReset);
    }

    pub fn score_goal(&mut self, team: u8) {
        match team {
            1 => self.scores.0 += 1,
            _ => self.scores.1 += 1,
        }
        self.ball = Ball::new();
        info!(team, team1 = self.scores.0, team2 = self.scores.1, "Goal");
        self.broadcast(NetMsg::Goal {
            team,
            team1_score: self.scores.0,
            team2_score: self.scores.1,
        });
    }

    fn drain_reliable(&mut self) {
        while let Ok(inbound) = self.inbound_rx.try_recv() {
            match inbound {
                Inbound::Message(id, msg) => self.handle_reliable(id, msg),
                Inbound::Disconnected(id) => self.remove_client(&id),
            }
        }
    }

    fn handle_reliable(&mut self, id: ClientId, msg: NetMsg) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        match msg {
            NetMsg::Join { display_name } => {
                info!(client_id = %id, name = %display_name, "Client joined");
                client.player.display_name = display_name;
            }
            NetMsg::Ping { t } => client.send(NetMsg::Pong { t }),
            NetMsg::Pong { .. } => {}
            NetMsg::Input(sample) => self.apply_input(&id, sample),
            NetMsg::SwitchTeam { team, .. } => {
                client.player.team = team;
                info!(client_id = %id, team, "Team switched");
                self.broadcast(NetMsg::SwitchTeam {
                    client_id: Some(id),
                    team,
                });
            }
            NetMsg::WebrtcSignaling(signal) => self.relay_signal(&id, signal),
            NetMsg::RequestWebrtcPeers { .. } => {
                let peers: Vec<serde_json::Value> = self
                    .clients
                    .keys()
                    .map(|k| serde_json::Value::String(k.to_string()))
                    .collect();
                if let Some(client) = self.clients.get(&id) {
                    client.send(NetMsg::WebrtcSignaling(SignalMsg {
                        from_peer: ClientId::new(SERVER_PEER_ID),
                        to_peer: Some(id.clone()),
                        signal_type: SignalType::PeerList,
                        signal_data: serde_json::Value::Array(peers),
                    }));
                }
            }
            NetMsg::Leave => self.remove_client(&id),
            other => debug!(client_id = %id, kind = other.kind().tag(), "Unexpected reliable message"),
        }
    }

    fn relay_signal(&mut self, from: &ClientId, mut signal: SignalMsg) {
        let Some(to) = signal.to_peer.clone() else {
            debug!(client_id = %from, "Signal without recipient");
            return;
        };
        let Some(target) = self.clients.get(&to) else {
            debug!(client_id = %from, %to, "Signal for unknown peer");
            return;
        };
        // Senders cannot speak for someone else.
        signal.from_peer = from.clone();
        debug!(%from, %to, signal = ?signal.signal_type, "Relaying signal");
        target.send(NetMsg::WebrtcSignaling(signal));
    }

    fn remove_client(&mut self, id: &ClientId) {
        if self.clients.remove(id).is_none() {
            return;
        }
        if self.ball.owner.as_ref() == Some(id) {
            self.ball.owner = None;
        }
        info!(client_id = %id, "Client disconnected");
        for (other, c) in &self.clients {
            c.send(NetMsg::WebrtcSignaling(SignalMsg {
                from_peer: ClientId::new(SERVER_PEER_ID),
                to_peer: Some(other.clone()),
                signal_type: SignalType::PeerLeft,
                signal_data: serde_json::Value::String(id.to_string()),
            }));
        }
    }

    fn recv_datagrams(&mut self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        loop {
            match self.udp.try_recv_from(&mut buf) {
                Ok((n, from)) => match decode_from_bytes(&buf[..n]) {
                    Ok(msg) => self.handle_datagram(from, msg),
                    Err(e) => debug!(%from, error = %e, "Dropping malformed datagram"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                // Loopback ICMP errors surface here on some platforms.
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e).context("udp recv"),
            }
        }
        Ok(())
    }

    fn handle_datagram(&mut self, from: SocketAddr, msg: NetMsg) {
        match msg {
            NetMsg::FastHandshake { client_id } => match self.clients.get_mut(&client_id) {
                Some(c) => {
                    if c.udp_peer != Some(from) {
                        info!(%client_id, %from, "Fast channel mapped");
                    }
                    c.udp_peer = Some(from);
                }
                None => debug!(%client_id, %from, "Fast handshake for unknown client"),
            },
            NetMsg::Input(sample) => {
                let id = self
                    .clients
                    .iter()
                    .find(|(_, c)| c.udp_peer == Some(from))
                    .map(|(id, _)| id.clone());
                match id {
                    Some(id) => self.apply_input(&id, sample),
                    None => debug!(%from, "Input from unmapped address"),
                }
            }
            NetMsg::Ping { t } => {
                let sent = encode_to_bytes(&NetMsg::Pong { t })
                    .and_then(|payload| self.udp.try_send_to(&payload, from).context("udp send"));
                if let Err(e) = sent {
                    debug!(%from, error = %e, "Datagram pong not sent");
                }
            }
            NetMsg::Pong { .. } => {}
            other => debug!(%from, kind = other.kind().tag(), "Unexpected datagram"),
        }
    }

    /// Latest input wins; older sequences (reordered datagrams) are ignored.
    fn apply_input(&mut self, id: &ClientId, sample: InputSample) {
        let Some(c) = self.clients.get_mut(id) else {
            return;
        };
        if sample.seq <= c.player.seq {
            return;
        }
        c.player.seq = sample.seq;
        c.direction = sample.direction;
        c.actions = sample.actions;
        c.aim = sample.aim;
        if !sample.display_name.is_empty() && c.player.display_name != sample.display_name {
            c.player.display_name = sample.display_name;
        }
    }

    fn simulate(&mut self, dt_sec: f32) {
        let speed = self.cfg.speed;
        for c in self.clients.values_mut() {
            let boosting = c.actions.contains(Actions::BOOST) && c.player.boost > 0.0;
            if boosting && !c.direction.is_empty() {
                c.player.boost = (c.player.boost - BOOST_DRAIN_PER_SEC * dt_sec).max(0.0);
            } else {
                c.player.boost = (c.player.boost + BOOST_REGEN_PER_SEC * dt_sec).min(BOOST_MAX);
            }
            let step = (if boosting { speed * BOOST_MULTIPLIER } else { speed }) * dt_sec;
            let moved = Vec2::new(c.player.x, c.player.y) + c.direction.axis() * step;
            c.player.x = moved.x;
            c.player.y = moved.y;
        }
        self.simulate_ball(dt_sec);
    }

    fn simulate_ball(&mut self, dt_sec: f32) {
        if let Some(owner) = self.ball.owner.clone() {
            let Some(c) = self.clients.get(&owner) else {
                self.ball.owner = None;
                return;
            };
            let position = Vec2::new(c.player.x, c.player.y);
            self.ball.position = position;
            if c.actions.contains(Actions::SHOOT) {
                let dir = (c.aim - position).normalized();
                self.ball.velocity = dir * SHOT_SPEED;
                self.ball.owner = None;
                info!(client_id = %owner, "Ball released");
            }
            return;
        }

        self.ball.position = self.ball.position + self.ball.velocity * dt_sec;
        self.ball.velocity = self.ball.velocity * (1.0 - BALL_FRICTION_PER_SEC * dt_sec).max(0.0);

        let grabber = self.clients.iter().find(|(_, c)| {
            c.actions.contains(Actions::GRAB)
                && Vec2::new(c.player.x, c.player.y).distance(self.ball.position) <= GRAB_RANGE
        });
        if let Some((id, _)) = grabber {
            info!(client_id = %id, "Ball grabbed");
            self.ball.owner = Some(id.clone());
            self.ball.velocity = Vec2::ZERO;
        }
    }

    fn state_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            time: self.now_ms(),
            players: self
                .clients
                .iter()
                .map(|(id, c)| (id.clone(), c.player.clone()))
                .collect(),
            ball: Some(self.ball.state()),
            team1_score: self.scores.0,
            team2_score: self.scores.1,
        }
    }

    fn broadcast_state(&self) {
        if self.clients.is_empty() {
            return;
        }
        self.broadcast(NetMsg::State(self.state_snapshot()));
    }

    /// Sends a datagram to a client's mapped fast address.
    pub async fn send_fast(&self, id: &ClientId, msg: &NetMsg) -> anyhow::Result<()> {
        let peer = self
            .udp_peer(id)
            .with_context(|| format!("no fast address for {id}"))?;
        let payload = encode_to_bytes(msg)?;
        self.udp.send_to(&payload, peer).await.context("udp send")?;
        Ok(())
    }
}

/// Helper for tests: bind to an ephemeral port.
pub async fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<(RelayServer, ServerConfig)> {
    let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);

    // Bind TCP first to get an ephemeral port, then bind UDP to that same port.
    let tcp = ReliableListener::bind(SocketAddr::new(localhost, 0)).await?;
    let addr = tcp.local_addr()?;
    let udp = UdpSocket::bind(SocketAddr::new(localhost, addr.port()))
        .await
        .context("udp bind")?;

    let cfg = ServerConfig {
        listen_addr: addr.to_string(),
        tick_hz,
        ..Default::default()
    };
    Ok((RelayServer::from_parts(cfg.clone(), tcp, udp), cfg))
}
