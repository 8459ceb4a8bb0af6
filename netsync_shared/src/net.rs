//! Wire protocol and links.
//!
//! Goals:
//! - One closed, `type`-tagged message enum for every channel (reliable, fast,
//!   signaling), decoded once at the transport boundary.
//! - A length-prefixed reliable stream (TCP) and a datagram fast link (UDP).
//! - Keep serialization explicit: JSON documents, field names as they appear
//!   on the wire.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, UdpSocket,
    },
    time,
};

use crate::math::Vec2;

/// Largest reliable frame accepted from the wire.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Largest datagram read from the fast link.
pub const MAX_DATAGRAM_LEN: usize = 64 * 1024;

/// Identifies a connected client (and its entity).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        ClientId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

bitflags::bitflags! {
    /// Held movement keys.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Direction: u8 {
        const UP = 1 << 0;
        const DOWN = 1 << 1;
        const LEFT = 1 << 2;
        const RIGHT = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Held action buttons.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Actions: u8 {
        const BOOST = 1 << 0;
        const SHOOT = 1 << 1;
        const GRAB = 1 << 2;
    }
}

impl Default for Direction {
    fn default() -> Self {
        Self::empty()
    }
}

impl Default for Actions {
    fn default() -> Self {
        Self::empty()
    }
}

impl Direction {
    /// Unnormalized movement axis; screen coordinates, so UP is -y.
    pub fn axis(self) -> Vec2 {
        let mut v = Vec2::ZERO;
        if self.contains(Direction::UP) {
            v.y -= 1.0;
        }
        if self.contains(Direction::DOWN) {
            v.y += 1.0;
        }
        if self.contains(Direction::LEFT) {
            v.x -= 1.0;
        }
        if self.contains(Direction::RIGHT) {
            v.x += 1.0;
        }
        v
    }
}

/// Flags travel as integer bitmasks.
mod flag_bits {
    use bitflags::Flags;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<F, S>(flags: &F, s: S) -> Result<S::Ok, S::Error>
    where
        F: Flags<Bits = u8>,
        S: Serializer,
    {
        s.serialize_u8(flags.bits())
    }

    pub fn deserialize<'de, F, D>(d: D) -> Result<F, D::Error>
    where
        F: Flags<Bits = u8>,
        D: Deserializer<'de>,
    {
        Ok(F::from_bits_truncate(u8::deserialize(d)?))
    }
}

/// One sampled frame of local input. Immutable once sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputSample {
    pub seq: u64,
    #[serde(with = "flag_bits", default)]
    pub direction: Direction,
    pub aim: Vec2,
    #[serde(with = "flag_bits", default)]
    pub actions: Actions,
    #[serde(default)]
    pub display_name: String,
    /// Client timestamp (ms).
    pub t: f64,
}

/// Peer-reported position of its own entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionUpdate {
    pub client_id: ClientId,
    pub x: f32,
    pub y: f32,
    pub t: f64,
}

/// Peer-reported position of the shared object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BallPosition {
    pub client_id: ClientId,
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub grabbed: bool,
    #[serde(default)]
    pub owner: Option<ClientId>,
    pub t: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectileUpdate {
    pub client_id: ClientId,
    pub projectile_id: u64,
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub vx: f32,
    #[serde(default)]
    pub vy: f32,
    pub t: f64,
}

/// Authoritative per-player entry of a state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerState {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub boost: f32,
    #[serde(default)]
    pub team: u8,
    #[serde(default)]
    pub display_name: String,
}

/// Authoritative shared-object entry of a state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BallState {
    pub x: f32,
    pub y: f32,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub grabbed: bool,
    #[serde(default)]
    pub owner: Option<ClientId>,
}

fn default_true() -> bool {
    true
}

/// Server world snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StateSnapshot {
    /// Server timestamp (ms).
    pub time: f64,
    #[serde(default)]
    pub players: BTreeMap<ClientId, PlayerState>,
    #[serde(default)]
    pub ball: Option<BallState>,
    #[serde(default)]
    pub team1_score: u32,
    #[serde(default)]
    pub team2_score: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
    PeerList,
    PeerLeft,
}

/// Signaling envelope relayed by the server between two peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalMsg {
    pub from_peer: ClientId,
    #[serde(default)]
    pub to_peer: Option<ClientId>,
    pub signal_type: SignalType,
    #[serde(default)]
    pub signal_data: serde_json::Value,
}

/// Every message on every channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetMsg {
    // ─── Session ───
    /// Server assigns the client id.
    Init { client_id: ClientId },
    Join { display_name: String },
    Leave,
    Error { message: String },

    // ─── Health ───
    Ping { t: f64 },
    Pong { t: f64 },

    // ─── Game events (reliable only) ───
    Goal {
        team: u8,
        #[serde(default)]
        team1_score: u32,
        #[serde(default)]
        team2_score: u32,
    },
    Countdown { seconds: u32 },
    GameReset,
    SwitchTeam {
        #[serde(default)]
        client_id: Option<ClientId>,
        team: u8,
    },

    // ─── Replication ───
    State(StateSnapshot),

    // ─── Fast channel ───
    FastHandshake { client_id: ClientId },
    Input(InputSample),
    PositionUpdate(PositionUpdate),
    BallPosition(BallPosition),
    ProjectileUpdate(ProjectileUpdate),

    // ─── Signaling ───
    WebrtcSignaling(SignalMsg),
    RequestWebrtcPeers {
        #[serde(rename = "fromPeer")]
        from_peer: ClientId,
    },
}

/// Payload-free discriminant of [`NetMsg`], used for routing tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Init,
    Join,
    Leave,
    Error,
    Ping,
    Pong,
    Goal,
    Countdown,
    GameReset,
    SwitchTeam,
    State,
    FastHandshake,
    Input,
    PositionUpdate,
    BallPosition,
    ProjectileUpdate,
    WebrtcSignaling,
    RequestWebrtcPeers,
}

impl MessageKind {
    pub const ALL: [MessageKind; 18] = [
        MessageKind::Init,
        MessageKind::Join,
        MessageKind::Leave,
        MessageKind::Error,
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::Goal,
        MessageKind::Countdown,
        MessageKind::GameReset,
        MessageKind::SwitchTeam,
        MessageKind::State,
        MessageKind::FastHandshake,
        MessageKind::Input,
        MessageKind::PositionUpdate,
        MessageKind::BallPosition,
        MessageKind::ProjectileUpdate,
        MessageKind::WebrtcSignaling,
        MessageKind::RequestWebrtcPeers,
    ];

    /// The `type` string on the wire.
    pub fn tag(self) -> &'static str {
        match self {
            MessageKind::Init => "init",
            MessageKind::Join => "join",
            MessageKind::Leave => "leave",
            MessageKind::Error => "error",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Goal => "goal",
            MessageKind::Countdown => "countdown",
            MessageKind::GameReset => "game_reset",
            MessageKind::SwitchTeam => "switch_team",
            MessageKind::State => "state",
            MessageKind::FastHandshake => "fast_handshake",
            MessageKind::Input => "input",
            MessageKind::PositionUpdate => "position_update",
            MessageKind::BallPosition => "ball_position",
            MessageKind::ProjectileUpdate => "projectile_update",
            MessageKind::WebrtcSignaling => "webrtc_signaling",
            MessageKind::RequestWebrtcPeers => "request_webrtc_peers",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag() == tag)
    }
}

impl NetMsg {
    pub fn kind(&self) -> MessageKind {
        match self {
            NetMsg::Init { .. } => MessageKind::Init,
            NetMsg::Join { .. } => MessageKind::Join,
            NetMsg::Leave => MessageKind::Leave,
            NetMsg::Error { .. } => MessageKind::Error,
            NetMsg::Ping { .. } => MessageKind::Ping,
            NetMsg::Pong { .. } => MessageKind::Pong,
            NetMsg::Goal { .. } => MessageKind::Goal,
            NetMsg::Countdown { .. } => MessageKind::Countdown,
            NetMsg::GameReset => MessageKind::GameReset,
            NetMsg::SwitchTeam { .. } => MessageKind::SwitchTeam,
            NetMsg::State(_) => MessageKind::State,
            NetMsg::FastHandshake { .. } => MessageKind::FastHandshake,
            NetMsg::Input(_) => MessageKind::Input,
            NetMsg::PositionUpdate(_) => MessageKind::PositionUpdate,
            NetMsg::BallPosition(_) => MessageKind::BallPosition,
            NetMsg::ProjectileUpdate(_) => MessageKind::ProjectileUpdate,
            NetMsg::WebrtcSignaling(_) => MessageKind::WebrtcSignaling,
            NetMsg::RequestWebrtcPeers { .. } => MessageKind::RequestWebrtcPeers,
        }
    }
}

/// Why an inbound payload could not be turned into a [`NetMsg`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not JSON, or fields do not match the declared type.
    Malformed(String),
    /// JSON object without a string `type`.
    MissingType,
    /// A `type` this protocol does not know.
    UnknownType(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Malformed(e) => write!(f, "malformed message: {e}"),
            DecodeError::MissingType => write!(f, "message has no type"),
            DecodeError::UnknownType(t) => write!(f, "unknown message type {t:?}"),
        }
    }
}

impl std::error::Error for DecodeError {}

pub fn encode_to_bytes(msg: &NetMsg) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize")?;
    Ok(Bytes::from(payload))
}

pub fn decode_from_bytes(b: &[u8]) -> Result<NetMsg, DecodeError> {
    match serde_json::from_slice::<NetMsg>(b) {
        Ok(msg) => Ok(msg),
        Err(err) => {
            let value: serde_json::Value =
                serde_json::from_slice(b).map_err(|e| DecodeError::Malformed(e.to_string()))?;
            match value.get("type").and_then(|t| t.as_str()) {
                None => Err(DecodeError::MissingType),
                Some(tag) if MessageKind::from_tag(tag).is_none() => {
                    Err(DecodeError::UnknownType(tag.to_string()))
                }
                Some(_) => Err(DecodeError::Malformed(err.to_string())),
            }
        }
    }
}

/// Reads length-prefixed frames (u32 big-endian length, then payload).
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub async fn recv_frame(&mut self) -> anyhow::Result<Bytes> {
        let mut len_buf = [0u8; 4];
        self.inner
            .read_exact(&mut len_buf)
            .await
            .context("tcp read len")?;
        let len = u32::from_be_bytes(len_buf) as usize;
        anyhow::ensure!(len <= MAX_FRAME_LEN, "frame of {len} bytes exceeds limit");
        let mut payload = BytesMut::zeroed(len);
        self.inner
            .read_exact(&mut payload)
            .await
            .context("tcp read payload")?;
        Ok(payload.freeze())
    }

    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        let frame = self.recv_frame().await?;
        decode_from_bytes(&frame).context("deserialize msg")
    }
}

/// Writes length-prefixed frames.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send_frame(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        anyhow::ensure!(
            payload.len() <= MAX_FRAME_LEN,
            "frame of {} bytes exceeds limit",
            payload.len()
        );
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(payload);
        self.inner.write_all(&buf).await.context("tcp write")?;
        Ok(())
    }

    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        let payload = encode_to_bytes(msg)?;
        self.send_frame(&payload).await
    }
}

pub type ReliableReader = FrameReader<OwnedReadHalf>;
pub type ReliableWriter = FrameWriter<OwnedWriteHalf>;

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    reader: ReliableReader,
    writer: ReliableWriter,
    peer: SocketAddr,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> anyhow::Result<Self> {
        let peer = stream.peer_addr().context("tcp peer_addr")?;
        stream.set_nodelay(true).context("tcp nodelay")?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: FrameReader::new(read),
            writer: FrameWriter::new(write),
            peer,
        })
    }

    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await.context("tcp connect")?;
        Self::new(stream)
    }

    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        self.writer.send(msg).await
    }

    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        self.reader.recv().await
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Splits into independently owned halves for reader/writer tasks.
    pub fn into_split(self) -> (ReliableReader, ReliableWriter) {
        (self.reader, self.writer)
    }
}

/// Unreliable channel over UDP.
#[derive(Debug)]
pub struct UnreliableConn {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UnreliableConn {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.context("udp bind")?;
        socket.connect(peer).await.context("udp connect")?;
        Ok(Self { socket, peer })
    }

    pub async fn send_raw(&self, payload: &[u8]) -> anyhow::Result<()> {
        self.socket.send(payload).await.context("udp send")?;
        Ok(())
    }

    pub async fn send(&self, msg: &NetMsg) -> anyhow::Result<()> {
        let payload = encode_to_bytes(msg)?;
        self.send_raw(&payload).await
    }

    pub async fn recv_raw(&self) -> anyhow::Result<Bytes> {
        let mut buf = BytesMut::zeroed(MAX_DATAGRAM_LEN);
        let n = self.socket.recv(&mut buf).await.context("udp recv")?;
        buf.truncate(n);
        Ok(buf.freeze())
    }

    /// Receives a datagram within the given timeout.
    pub async fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Option<NetMsg>> {
        match time::timeout(timeout, self.recv_raw()).await {
            Ok(Ok(raw)) => Ok(Some(
                decode_from_bytes(&raw).context("deserialize udp msg")?,
            )),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<ReliableConn> {
        let (stream, _) = self.listener.accept().await.context("tcp accept")?;
        ReliableConn::new(stream)
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_snapshot_decodes_from_wire_json() {
        let raw = br#"{
            "type": "state",
            "time": 1700000000123.5,
            "players": {
                "a1": {"x": 10, "y": 20, "seq": 7, "boost": 80, "team": 1, "display_name": "ann"}
            },
            "ball": {"x": 1, "y": 2, "active": true, "grabbed": true, "owner": "a1"},
            "team1_score": 2,
            "team2_score": 3
        }"#;
        let NetMsg::State(snap) = decode_from_bytes(raw).unwrap() else {
            panic!("expected state");
        };
        assert_eq!(snap.time, 1700000000123.5);
        let p = &snap.players[&ClientId::new("a1")];
        assert_eq!((p.x, p.y, p.seq, p.team), (10.0, 20.0, 7, 1));
        let ball = snap.ball.unwrap();
        assert_eq!(ball.owner, Some(ClientId::new("a1")));
        assert_eq!(snap.team2_score, 3);
    }

    #[test]
    fn signaling_uses_camel_case_fields() {
        let msg = NetMsg::WebrtcSignaling(SignalMsg {
            from_peer: ClientId::new("a"),
            to_peer: Some(ClientId::new("b")),
            signal_type: SignalType::IceCandidate,
            signal_data: serde_json::json!({"addr": "127.0.0.1:9"}),
        });
        let value: serde_json::Value =
            serde_json::from_slice(&encode_to_bytes(&msg).unwrap()).unwrap();
        assert_eq!(value["type"], "webrtc_signaling");
        assert_eq!(value["fromPeer"], "a");
        assert_eq!(value["toPeer"], "b");
        assert_eq!(value["signalType"], "ice_candidate");
    }

    #[test]
    fn input_flags_travel_as_bitmasks() {
        let msg = NetMsg::Input(InputSample {
            seq: 3,
            direction: Direction::UP | Direction::RIGHT,
            aim: Vec2::new(5.0, 6.0),
            actions: Actions::BOOST,
            display_name: "ann".into(),
            t: 12.0,
        });
        let value: serde_json::Value =
            serde_json::from_slice(&encode_to_bytes(&msg).unwrap()).unwrap();
        assert_eq!(value["type"], "input");
        assert_eq!(value["direction"], 9);
        assert_eq!(value["actions"], 1);
        assert_eq!(decode_from_bytes(&encode_to_bytes(&msg).unwrap()).unwrap(), msg);
    }

    #[test]
    fn decode_errors_are_classified() {
        assert!(matches!(
            decode_from_bytes(b"not json"),
            Err(DecodeError::Malformed(_))
        ));
        assert_eq!(
            decode_from_bytes(br#"{"x": 1}"#),
            Err(DecodeError::MissingType)
        );
        assert_eq!(
            decode_from_bytes(br#"{"type": "teleport"}"#),
            Err(DecodeError::UnknownType("teleport".into()))
        );
        assert!(matches!(
            decode_from_bytes(br#"{"type": "countdown", "seconds": "three"}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn every_kind_tag_round_trips() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(NetMsg::GameReset.kind().tag(), "game_reset");
    }

    #[test]
    fn direction_axis_screen_space() {
        assert_eq!(Direction::UP.axis(), Vec2::new(0.0, -1.0));
        assert_eq!((Direction::LEFT | Direction::RIGHT).axis(), Vec2::ZERO);
    }

    #[tokio::test]
    async fn frames_cross_a_duplex_pipe() -> anyhow::Result<()> {
        let (a, b) = tokio::io::duplex(256);
        let mut writer = FrameWriter::new(a);
        let mut reader = FrameReader::new(b);
        writer.send(&NetMsg::Ping { t: 42.0 }).await?;
        writer.send(&NetMsg::Leave).await?;
        assert_eq!(reader.recv().await?, NetMsg::Ping { t: 42.0 });
        assert_eq!(reader.recv().await?, NetMsg::Leave);
        Ok(())
    }
}
