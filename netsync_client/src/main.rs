//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p netsync_client -- [--addr 127.0.0.1:40000] [--name Player]
//!       [--tick-hz 60] [--latency-ms 0] [--no-fast] [--peers] [--config client.json]
//!
//! The client connects to the server, holds a scripted input pattern, and
//! logs its predicted position, remote entities and session events. A
//! session terminated by an identity conflict is replaced by a fresh one.

use std::env;
use std::time::Duration;

use anyhow::Context;
use netsync_client::{input::InputState, GameClient, SessionEvent};
use netsync_shared::{
    config::ClientConfig,
    net::{Actions, Direction},
};
use tracing::{info, warn};

fn parse_args() -> anyhow::Result<ClientConfig> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let path = &args[i + 1];
            let text = std::fs::read_to_string(path).with_context(|| format!("read {path}"))?;
            ClientConfig::from_json_str(&text).with_context(|| format!("parse {path}"))?
        }
        _ => ClientConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                cfg.display_name = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(60);
                i += 2;
            }
            "--latency-ms" if i + 1 < args.len() => {
                cfg.sync.delivery.latency_ms = args[i + 1].parse().unwrap_or(0.0);
                i += 2;
            }
            "--no-fast" => {
                cfg.fast_channel = false;
                i += 1;
            }
            "--peers" => {
                cfg.peer_mesh = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

/// Walks a slow square so the prediction path has something to do.
fn scripted_input(step: u64) -> InputState {
    let direction = match (step / 120) % 4 {
        0 => Direction::RIGHT,
        1 => Direction::DOWN,
        2 => Direction::LEFT,
        _ => Direction::UP,
    };
    InputState {
        direction,
        actions: if step % 240 < 30 {
            Actions::BOOST
        } else {
            Actions::empty()
        },
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(
        server = %cfg.server_addr,
        name = %cfg.display_name,
        latency_ms = cfg.sync.delivery.latency_ms,
        "Starting client"
    );

    let mut client = GameClient::new(cfg.clone()).context("create client")?;
    client.start();

    let tick_interval = Duration::from_secs_f64(1.0 / f64::from(cfg.tick_hz.max(1)));
    let mut step: u64 = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = tokio::time::sleep(tick_interval) => {}
        }

        let Some(frame) = client.frame(scripted_input(step)) else {
            continue;
        };
        step += 1;

        for event in &frame.events {
            match event {
                SessionEvent::IdentityConflict { .. } | SessionEvent::ChannelDegraded(_) => {
                    warn!(?event, "Session event");
                }
                _ => info!(?event, "Session event"),
            }
        }

        if client.session().is_terminated() {
            warn!("Session terminated, starting a fresh one");
            client = GameClient::new(cfg.clone()).context("recreate client")?;
            client.start();
            continue;
        }

        if step % 60 == 0 {
            let stats = client.session().router_stats();
            info!(
                x = frame.local.x,
                y = frame.local.y,
                remotes = frame.remotes.len(),
                ball = frame.ball.is_some(),
                sent_fast = stats.sent_fast,
                sent_reliable = stats.sent_reliable,
                fallbacks = stats.fallbacks,
                "Frame"
            );
        }
    }

    for event in client.stop() {
        info!(?event, "Session event");
    }
    Ok(())
}
