//! Standalone object server binary.
//!
//! Usage:
//!   cargo run -p dist_server -- [--addr 127.0.0.1:40000] [--tick-rate 60]
//!                               [--password x] [--max-clients 16]
//!
//! The server accepts client connections, runs a fixed timestep tick loop,
//! and replicates object state via delta-compressed snapshots. A small demo
//! schema with one "Avatar" class is registered so clients have something to
//! observe; real deployments embed `ObjectServer` and register their own
//! classes.

use std::env;

use anyhow::Context;
use dist_server::server::ObjectServer;
use dist_shared::config::ServerConfig;
use dist_shared::schema::{ClassSchema, FieldDef, FieldValue, SchemaRegistry, ZoneId};
use tracing::info;

fn parse_args() -> ServerConfig {
    let mut cfg = ServerConfig::default();
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.listen_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-rate" if i + 1 < args.len() => {
                cfg.tick_rate = args[i + 1].parse().unwrap_or(60);
                i += 2;
            }
            "--password" if i + 1 < args.len() => {
                cfg.password = args[i + 1].clone();
                i += 2;
            }
            "--max-clients" if i + 1 < args.len() => {
                cfg.max_clients = args[i + 1].parse().unwrap_or(16);
                i += 2;
            }
            "--idle-timeout" if i + 1 < args.len() => {
                cfg.idle_timeout_secs = args[i + 1].parse().ok();
                i += 2;
            }
            _ => i += 1,
        }
    }
    cfg
}

/// Demo schema shared with the demo client binary.
pub fn demo_schema() -> anyhow::Result<SchemaRegistry> {
    let mut registry = SchemaRegistry::new();
    registry.register(ClassSchema::new(
        1,
        "Avatar",
        vec![
            FieldDef::new("x", FieldValue::Float(0.0)),
            FieldDef::new("y", FieldValue::Float(0.0)),
            FieldDef::new("z", FieldValue::Float(0.0)),
            FieldDef::new("name", FieldValue::String(String::new())),
        ],
    ))?;
    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args();
    info!(addr = %cfg.listen_addr, tick_rate = cfg.tick_rate, "Starting object server");

    let mut server = ObjectServer::bind(cfg, demo_schema()?)
        .await
        .context("bind server")?;

    // One server-owned demo object so connecting clients see traffic.
    server.generate_object(1, ZoneId(100), None, None).await?;

    server.run().await
}
