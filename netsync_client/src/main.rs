//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p netsync_client -- [--host 127.0.0.1] [--control-port 7777]
//!       [--data-port 7778] [--tick-hz 60] [--blend smoothed] [--config net.json]
//!
//! Connects to the server, walks the local entity around a circle, and logs
//! remote entities as they join and leave.
//!
//! Console commands:
//!   status     - Show connection and world status
//!   ping       - Send a liveness probe
//!   disconnect - Disconnect from server
//!   connect    - Connect again with the same settings
//!   quit       - Exit client

use std::env;
use std::io::{BufRead, Write};
use std::time::{Duration, Instant};

use anyhow::Context;
use netsync_client::{ConnectionState, DisconnectReason, NetClient, SnapshotListener};
use netsync_shared::{config::NetConfig, math::Vec2, protocol::ClientId};
use tokio::sync::mpsc;
use tracing::{info, warn};

fn parse_args() -> anyhow::Result<NetConfig> {
    let args: Vec<String> = env::args().collect();

    // A config file sets the base; flags override it.
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let path = args.get(i + 1).context("--config needs a path")?;
            NetConfig::from_json_file(path).with_context(|| format!("load config {path}"))?
        }
        None => NetConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--host", Some(v)) => {
                cfg.host = v.clone();
                i += 2;
            }
            ("--control-port", Some(v)) => {
                cfg.control_port = v.parse().context("--control-port")?;
                i += 2;
            }
            ("--data-port", Some(v)) => {
                cfg.data_port = v.parse().context("--data-port")?;
                i += 2;
            }
            ("--tick-hz", Some(v)) => {
                cfg.tick_hz = v.parse().context("--tick-hz")?;
                i += 2;
            }
            ("--blend", Some(v)) => {
                cfg.blend_mode = v.parse().context("--blend")?;
                i += 2;
            }
            ("--config", Some(_)) => i += 2,
            _ => i += 1,
        }
    }
    cfg.validate().context("invalid settings")?;
    Ok(cfg)
}

/// Logs world changes to the console.
struct ConsoleListener;

impl SnapshotListener for ConsoleListener {
    fn on_entity_joined(&mut self, id: ClientId, position: Vec2) {
        info!(client_id = %id, x = position.x, y = position.y, "Entity joined");
    }

    fn on_entity_left(&mut self, id: ClientId) {
        info!(client_id = %id, "Entity left");
    }

    fn on_identified(&mut self, id: ClientId) {
        info!(client_id = %id, "Identified by server");
    }

    fn on_disconnected(&mut self, reason: DisconnectReason) {
        info!(?reason, "Session ended");
    }
}

async fn exec_console(client: &mut NetClient, line: &str) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::new();
    match line {
        "status" => {
            let world = client.world();
            out.push(format!("state: {:?}", client.state()));
            out.push(format!(
                "identity: {}",
                client
                    .identity()
                    .map_or_else(|| "none".to_string(), |id| id.to_string())
            ));
            if let Some(reason) = client.last_disconnect_reason() {
                out.push(format!("last disconnect: {reason:?}"));
            }
            out.push(format!("remote entities: {}", world.active().len()));
            if let Some(rtt) = world.rtt().smoothed_ms() {
                out.push(format!("rtt: {rtt:.1} ms"));
            }
            if let Some(offset) = world.clock_offset_ms() {
                out.push(format!("clock offset: {offset:.1} ms"));
            }
            for entity in world.entities() {
                out.push(format!(
                    "  {} at ({:.2}, {:.2})",
                    entity.id, entity.position.x, entity.position.y
                ));
            }
        }
        "ping" => {
            client.ping().await?;
            out.push("ping sent".to_string());
        }
        "disconnect" => {
            client.disconnect().await;
            out.push("disconnected".to_string());
        }
        "connect" => {
            client.connect().await?;
            out.push("connected".to_string());
        }
        other => out.push(format!("unknown command: {other}")),
    }
    Ok(out)
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
        control = %cfg.control_addr(),
        data = %cfg.data_addr(),
        blend = ?cfg.blend_mode,
        "Starting client"
    );

    let tick_interval = Duration::from_secs_f32(1.0 / cfg.tick_hz as f32);
    let mut client = NetClient::new(cfg).context("build client")?;
    client.subscribe(Box::new(ConsoleListener));
    client.connect().await.context("connect")?;

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

    // Spawn stdin reader thread.
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

    println!("Client started. Type 'status' for info, 'quit' to exit.");
    println!();

    let started = Instant::now();
    let mut ticker = tokio::time::interval(tick_interval);
    let dt = tick_interval.as_secs_f32();

    'main: loop {
        ticker.tick().await;

        while let Ok(line) = console_rx.try_recv() {
            if line == "quit" {
                break 'main;
            }
            match exec_console(&mut client, &line).await {
                Ok(output) => {
                    for line in output {
                        println!("{}", line);
                    }
                }
                Err(e) => println!("Error: {}", e),
            }
        }

        client.tick(dt);

        if client.state() == ConnectionState::Identified {
            // Stand-in for a motion controller: a slow circle around the origin.
            let phase = started.elapsed().as_secs_f32() * 0.5;
            let position = Vec2::new(phase.cos() * 5.0, phase.sin() * 5.0);
            if let Err(e) = client.send_local_state(position).await {
                warn!(error = %e, "Failed to send local state");
            }
        }
    }

    client.shutdown().await;
    Ok(())
}
