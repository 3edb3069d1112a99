//! Demo client binary.
//!
//! Usage:
//!   cargo run -p dist_client -- [--addr 127.0.0.1:40000] [--password x]
//!                               [--zone 100]
//!
//! Connects, opens interest in one zone, and logs the objects it observes.
//! The schema must match the server's (see the server binary's demo schema).

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use dist_client::NetClient;
use dist_shared::schema::{ClassSchema, FieldDef, FieldValue, SchemaRegistry, ZoneId};
use tracing::info;

struct Args {
    addr: String,
    password: String,
    zone: u32,
}

fn parse_args() -> Args {
    let mut parsed = Args {
        addr: "127.0.0.1:40000".to_string(),
        password: String::new(),
        zone: 100,
    };
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                parsed.addr = args[i + 1].clone();
                i += 2;
            }
            "--password" if i + 1 < args.len() => {
                parsed.password = args[i + 1].clone();
                i += 2;
            }
            "--zone" if i + 1 < args.len() => {
                parsed.zone = args[i + 1].parse().unwrap_or(100);
                i += 2;
            }
            _ => i += 1,
        }
    }
    parsed
}

/// Must match the server binary's demo schema.
fn demo_schema() -> anyhow::Result<SchemaRegistry> {
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

    let args = parse_args();
    let addr: SocketAddr = args.addr.parse().context("parse addr")?;

    let mut client =
        NetClient::connect(addr, demo_schema()?, &args.password, 20, 30).await?;
    client.set_interest(1, vec![ZoneId(args.zone)]).await?;

    loop {
        if client.poll(Duration::from_millis(100)).await?.is_some() {
            client.send_ack().await?;
        }
        for (do_id, obj) in client.objects() {
            info!(
                do_id = do_id.0,
                zone = obj.zone_id.0,
                fields = ?client.object_fields(*do_id).ok(),
                "object"
            );
        }
    }
}
