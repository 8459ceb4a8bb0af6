//! Full socket-based integration tests for client ↔ server communication.

use std::time::Duration;

use anyhow::Context;
use netsync_client::input::InputState;
use netsync_client::transport::ChannelRole;
use netsync_client::{GameClient, SessionEvent};
use netsync_server::server::bind_ephemeral;
use netsync_shared::config::ClientConfig;
use netsync_shared::net::{
    decode_from_bytes, encode_to_bytes, ClientId, Direction, InputSample, NetMsg, ReliableConn,
    SignalMsg, SignalType,
};
use netsync_shared::math::Vec2;
use netsync_tests::init_tracing;

async fn recv_until(
    conn: &mut ReliableConn,
    pred: impl Fn(&NetMsg) -> bool,
) -> anyhow::Result<NetMsg> {
    let wait = async {
        loop {
            let msg = conn.recv().await?;
            if pred(&msg) {
                return anyhow::Ok(msg);
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .context("timed out waiting for message")?
}

async fn connect_raw(addr: &str) -> anyhow::Result<(ReliableConn, ClientId)> {
    let mut conn = ReliableConn::connect(addr.parse()?).await?;
    match recv_until(&mut conn, |m| matches!(m, NetMsg::Init { .. })).await? {
        NetMsg::Init { client_id } => Ok((conn, client_id)),
        other => anyhow::bail!("expected init, got {other:?}"),
    }
}

fn client_cfg(server_addr: &str, name: &str) -> ClientConfig {
    ClientConfig {
        server_addr: server_addr.to_string(),
        display_name: name.to_string(),
        ..Default::default()
    }
}

fn hold(direction: Direction) -> InputState {
    InputState {
        direction,
        ..Default::default()
    }
}

/// Drives two clients side by side on one tick interval.
async fn drive_pair(
    a: &mut GameClient,
    b: &mut GameClient,
    duration: Duration,
) -> (Vec<SessionEvent>, Vec<SessionEvent>) {
    let mut interval = tokio::time::interval(Duration::from_millis(16));
    let deadline = tokio::time::Instant::now() + duration;
    let (mut events_a, mut events_b) = (Vec::new(), Vec::new());
    while tokio::time::Instant::now() < deadline {
        interval.tick().await;
        if let Some(frame) = a.frame(hold(Direction::RIGHT)) {
            events_a.extend(frame.events);
        }
        if let Some(frame) = b.frame(hold(Direction::DOWN)) {
            events_b.extend(frame.events);
        }
    }
    (events_a, events_b)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relay_answers_heartbeats_and_relays_signals() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, cfg) = bind_ephemeral(60).await?;
    let addr = cfg.listen_addr.clone();
    let server_handle = tokio::spawn(async move {
        server.run_for_ticks(90).await?;
        Ok::<_, anyhow::Error>(())
    });

    let (mut a, id_a) = connect_raw(&addr).await?;
    let (mut b, id_b) = connect_raw(&addr).await?;
    assert_ne!(id_a, id_b);

    a.send(&NetMsg::Ping { t: 7.0 }).await?;
    let pong = recv_until(&mut a, |m| matches!(m, NetMsg::Pong { .. })).await?;
    assert_eq!(pong, NetMsg::Pong { t: 7.0 });

    a.send(&NetMsg::WebrtcSignaling(SignalMsg {
        from_peer: ClientId::new("someone-else"),
        to_peer: Some(id_b.clone()),
        signal_type: SignalType::Offer,
        signal_data: serde_json::json!({"addr": "127.0.0.1:9"}),
    }))
    .await?;
    let relayed = recv_until(&mut b, |m| matches!(m, NetMsg::WebrtcSignaling(_))).await?;
    let NetMsg::WebrtcSignaling(signal) = relayed else {
        unreachable!();
    };
    assert_eq!(signal.from_peer, id_a);
    assert_eq!(signal.signal_type, SignalType::Offer);
    assert_eq!(signal.signal_data["addr"], "127.0.0.1:9");

    b.send(&NetMsg::RequestWebrtcPeers {
        from_peer: id_b.clone(),
    })
    .await?;
    let list = recv_until(&mut b, |m| {
        matches!(m, NetMsg::WebrtcSignaling(s) if s.signal_type == SignalType::PeerList)
    })
    .await?;
    let NetMsg::WebrtcSignaling(list) = list else {
        unreachable!();
    };
    let ids: Vec<&str> = list
        .signal_data
        .as_array()
        .context("peer list is an array")?
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert!(ids.contains(&id_a.as_str()) && ids.contains(&id_b.as_str()));

    b.send(&NetMsg::Input(InputSample {
        seq: 1,
        direction: Direction::RIGHT,
        aim: Vec2::ZERO,
        actions: Default::default(),
        display_name: "raw".into(),
        t: 0.0,
    }))
    .await?;
    let moved = recv_until(&mut b, |m| match m {
        NetMsg::State(s) => s.players.get(&id_b).is_some_and(|p| p.seq == 1),
        _ => false,
    })
    .await?;
    let NetMsg::State(snapshot) = moved else {
        unreachable!();
    };
    assert_eq!(snapshot.players[&id_b].display_name, "raw");

    drop(a);
    let left = recv_until(&mut b, |m| {
        matches!(m, NetMsg::WebrtcSignaling(s) if s.signal_type == SignalType::PeerLeft)
    })
    .await?;
    let NetMsg::WebrtcSignaling(left) = left else {
        unreachable!();
    };
    assert_eq!(left.signal_data, serde_json::json!(id_a.as_str()));

    server_handle.await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relay_answers_datagram_heartbeats() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, cfg) = bind_ephemeral(60).await?;
    let addr: std::net::SocketAddr = cfg.listen_addr.parse()?;
    let server_handle = tokio::spawn(async move {
        server.run_for_ticks(30).await?;
        Ok::<_, anyhow::Error>(())
    });

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await?;
    socket.connect(addr).await?;
    socket.send(&encode_to_bytes(&NetMsg::Ping { t: 11.0 })?).await?;

    let mut buf = vec![0u8; 2048];
    let n = tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf))
        .await
        .context("timed out waiting for datagram pong")??;
    assert_eq!(decode_from_bytes(&buf[..n])?, NetMsg::Pong { t: 11.0 });

    server_handle.await??;
    Ok(())
}

/// Full integration: spawn server, connect client, exchange input/snapshots.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_server_full_roundtrip() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, cfg) = bind_ephemeral(60).await?;
    let addr = cfg.listen_addr.clone();
    let server_handle = tokio::spawn(async move {
        server.run_for_ticks(75).await?;
        Ok::<_, anyhow::Error>(server)
    });

    let mut client = GameClient::new(client_cfg(&addr, "TestPlayer"))?;
    client.start();
    let events = client
        .run_for(Duration::from_millis(900), hold(Direction::RIGHT))
        .await;

    assert!(events.contains(&SessionEvent::Connected(ChannelRole::Reliable)));
    assert!(events.contains(&SessionEvent::Connected(ChannelRole::Fast)));
    let id = client
        .session()
        .client_id()
        .cloned()
        .context("client id assigned")?;
    let auth = client
        .session()
        .prediction()
        .authoritative()
        .copied()
        .context("at least one snapshot")?;
    assert!(auth.seq > 0);
    assert!(client.session().router_stats().sent_fast > 0);

    let server = server_handle.await??;
    assert!(server.udp_peer(&id).is_some(), "fast handshake mapped");
    let player = server.player(&id).context("player on server")?;
    assert_eq!(player.display_name, "TestPlayer");
    assert!(player.x > 100.0, "input moved the player: x = {}", player.x);

    client.stop();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peers_negotiate_a_direct_channel() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, cfg) = bind_ephemeral(60).await?;
    let addr = cfg.listen_addr.clone();
    let server_handle = tokio::spawn(async move {
        server.run_for_ticks(150).await?;
        Ok::<_, anyhow::Error>(())
    });

    let mut cfg_a = client_cfg(&addr, "a");
    cfg_a.peer_mesh = true;
    let mut cfg_b = client_cfg(&addr, "b");
    cfg_b.peer_mesh = true;

    let mut a = GameClient::new(cfg_a)?;
    a.start();
    a.run_for(Duration::from_millis(200), InputState::default())
        .await;
    let id_a = a.session().client_id().cloned().context("a has an id")?;

    let mut b = GameClient::new(cfg_b)?;
    b.start();
    let (events_a, events_b) = drive_pair(&mut a, &mut b, Duration::from_millis(800)).await;
    let id_b = b.session().client_id().cloned().context("b has an id")?;

    assert!(events_a.contains(&SessionEvent::PeerJoined(id_b.clone())), "{events_a:?}");
    assert!(events_b.contains(&SessionEvent::PeerJoined(id_a.clone())), "{events_b:?}");
    assert!(a.session().remotes().get(&id_b).is_some());

    b.stop();
    let mut events_a = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(16)).await;
        if let Some(frame) = a.frame(InputState::default()) {
            events_a.extend(frame.events);
        }
    }
    assert!(events_a.contains(&SessionEvent::PeerLeft(id_b.clone())), "{events_a:?}");
    assert!(a.session().remotes().get(&id_b).is_none());

    server_handle.await??;
    Ok(())
}
