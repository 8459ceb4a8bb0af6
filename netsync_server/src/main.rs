//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p netsync_server -- [--addr 127.0.0.1:40000] [--tick-hz 60] [--speed 300]
//!       [--config server.json]
//!
//! The server accepts clients, relays their signaling, integrates their
//! input and broadcasts state snapshots every tick.
//!
//! Console commands:
//!   status         - Show server status
//!   countdown [n]  - Broadcast a countdown
//!   goal [team]    - Score a goal
//!   reset          - Reset the game
//!   quit           - Shutdown server

use std::env;
use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::Context;
use netsync_server::RelayServer;
use netsync_shared::config::ServerConfig;
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<ServerConfig> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let path = &args[i + 1];
            let text = std::fs::read_to_string(path).with_context(|| format!("read {path}"))?;
            ServerConfig::from_json_str(&text).with_context(|| format!("parse {path}"))?
        }
        _ => ServerConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.listen_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(60);
                i += 2;
            }
            "--speed" if i + 1 < args.len() => {
                cfg.speed = args[i + 1].parse().unwrap_or(300.0);
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(addr = %cfg.listen_addr, tick_hz = cfg.tick_hz, speed = cfg.speed, "Starting server");

    let mut server = RelayServer::new(cfg.clone())
        .await
        .context("create server")?;
    let local = server.local_addr()?;
    info!(%local, "Server listening");

    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'status' for info, 'quit' to exit.");
    println!();

    let tick_interval = Duration::from_secs_f64(1.0 / f64::from(cfg.tick_hz.max(1)));
    let mut next_tick = tokio::time::Instant::now();

    loop {
        if let Some(cid) = server.try_accept(Duration::from_millis(1)).await? {
            info!(client_id = %cid, "New client accepted");
        }

        server.step(tick_interval.as_secs_f32()).await?;

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }
}
