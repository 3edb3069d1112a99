//! Networking primitives.
//!
//! Goals:
//! - Provide a reliable, ordered message channel (TCP, length-prefixed).
//! - Provide the client/server wire messages for the distributed-object
//!   protocol: handshake, rate negotiation, interest management, object
//!   generate/delete, and tick snapshots.
//! - Keep serialization explicit and versionable.
//!
//! The transport carries one serialized [`NetMsg`] per frame. Ordering is
//! guaranteed per connection, which the protocol relies on: a client always
//! sees an object's generate message before any snapshot that references it.

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    time,
};

use crate::schema::{ClientId, DoId, PackedState, ZoneId};

/// Hard cap on one frame's payload, to bound allocation on malformed input.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// High-level message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NetMsg {
    // ─── Client -> server ───
    /// Handshake: credentials, schema hash, and requested rates.
    Hello {
        password: String,
        schema_hash: u32,
        update_rate: u8,
        cmd_rate: u8,
    },
    /// Requests a new snapshot rate (clamped server-side).
    SetUpdateRate { rate: u8 },
    /// Announces a new command send rate (clamped server-side).
    SetCmdRate { rate: u8 },
    /// Adds zones to the client's explicit interest set.
    AddInterest { handle: u8, zones: Vec<ZoneId> },
    /// Removes zones from the client's explicit interest set.
    RemoveInterest { handle: u8, zones: Vec<ZoneId> },
    /// Replaces the client's explicit interest set entirely.
    SetInterest { handle: u8, zones: Vec<ZoneId> },
    /// Acknowledges the last fully received snapshot tick.
    TickAck { tick: u32 },
    /// Graceful teardown.
    Disconnect,

    // ─── Server -> client ───
    /// Handshake reply. On success carries the assigned client id and the
    /// server's fixed tick rate.
    HelloResp {
        ok: bool,
        reason: Option<String>,
        client_id: Option<ClientId>,
        tick_rate: Option<u8>,
    },
    /// Objects entering the client's visible set.
    GenerateObject { entries: Vec<ObjectGenerate> },
    /// Owner-only variant: objects this client controls.
    GenerateOwnerObject { entries: Vec<ObjectGenerate> },
    /// Objects leaving the client's visible set (or destroyed).
    DeleteObject { do_ids: Vec<DoId> },
    /// All generate/delete traffic for an interest change has been queued.
    InterestComplete { handle: u8 },
    /// Per-tick state transfer, full or delta-encoded.
    Tick(TickPayload),
}

/// Announces one object to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectGenerate {
    pub class_id: u16,
    pub do_id: DoId,
    pub zone_id: ZoneId,
    /// Most recently packed state, when the server has one cached. Absent
    /// means the client starts from the class defaults.
    pub prior_state: Option<PackedState>,
}

/// One tick's outgoing state for one client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TickPayload {
    /// Every field of every visible object.
    Full {
        tick: u32,
        objects: Vec<FullObjectState>,
    },
    /// Only fields changed since the client's acknowledged baseline tick.
    Delta {
        tick: u32,
        baseline_tick: u32,
        objects: Vec<DeltaObjectState>,
    },
}

impl TickPayload {
    pub fn tick(&self) -> u32 {
        match self {
            TickPayload::Full { tick, .. } | TickPayload::Delta { tick, .. } => *tick,
        }
    }
}

/// Complete state of one object within a full snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FullObjectState {
    pub do_id: DoId,
    pub zone_id: ZoneId,
    pub class_id: u16,
    pub state: PackedState,
}

/// Changed fields of one object within a delta snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeltaObjectState {
    pub do_id: DoId,
    pub zone_id: ZoneId,
    /// (field index, packed field bytes) for each changed field.
    pub fields: Vec<(u8, Vec<u8>)>,
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await.context("tcp connect")?;
        stream.set_nodelay(true).context("set nodelay")?;
        Ok(Self::new(stream))
    }

    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        let buf = encode_frame(msg)?;
        self.stream.write_all(&buf).await.context("tcp write")?;
        Ok(())
    }

    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        recv_frame(&mut self.stream).await
    }

    /// Receives a message within the given timeout. `None` on timeout.
    pub async fn recv_timeout(
        &mut self,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Option<NetMsg>> {
        match time::timeout(timeout, self.recv()).await {
            Ok(Ok(msg)) => Ok(Some(msg)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Splits into independently owned read/write halves, so a reader task
    /// can block on inbound frames while the owner keeps sending.
    pub fn into_split(self) -> (ReliableRecv, ReliableSend) {
        let (read, write) = self.stream.into_split();
        (ReliableRecv { read }, ReliableSend { write })
    }
}

/// Read half of a split reliable connection.
#[derive(Debug)]
pub struct ReliableRecv {
    read: OwnedReadHalf,
}

impl ReliableRecv {
    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        recv_frame(&mut self.read).await
    }
}

/// Write half of a split reliable connection.
#[derive(Debug)]
pub struct ReliableSend {
    write: OwnedWriteHalf,
}

impl ReliableSend {
    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        let buf = encode_frame(msg)?;
        self.write.write_all(&buf).await.context("tcp write")?;
        Ok(())
    }
}

/// Serializes a message and prepends the length prefix. Frames over
/// [`MAX_FRAME_LEN`] are refused here so the sender sees the error instead
/// of the peer tearing the connection down on receipt.
fn encode_frame(msg: &NetMsg) -> anyhow::Result<BytesMut> {
    let payload = serde_json::to_vec(msg).context("serialize msg")?;
    if payload.len() > MAX_FRAME_LEN {
        anyhow::bail!("outbound frame too large: {} bytes", payload.len());
    }
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

async fn recv_frame<R>(read: &mut R) -> anyhow::Result<NetMsg>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    read.read_exact(&mut len_buf).await.context("tcp read len")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame too large: {len} bytes");
    }
    let mut payload = vec![0u8; len];
    read.read_exact(&mut payload)
        .await
        .context("tcp read payload")?;
    let msg = serde_json::from_slice(&payload).context("deserialize msg")?;
    Ok(msg)
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

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        stream.set_nodelay(true).context("set nodelay")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Convenience codec helpers.
pub fn encode_to_bytes(msg: &NetMsg) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize")?;
    Ok(Bytes::from(payload))
}

pub fn decode_from_bytes(b: &[u8]) -> anyhow::Result<NetMsg> {
    serde_json::from_slice(b).context("deserialize")
}
