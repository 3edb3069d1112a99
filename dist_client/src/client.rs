//! Client implementation.
//!
//! The client maintains:
//! - A reliable ordered connection to the server
//! - The verified session state (assigned client id, server tick rate)
//! - A table of visible objects, reconstructed from generate/delete
//!   notifications and full/delta tick snapshots
//! - Completed interest handles, so callers can gate on an interest change
//!
//! Snapshot application works on packed bytes: a full payload replaces each
//! object's packed state, a delta patches only the listed field buffers.
//! Decoded field values are produced on demand through the schema.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use anyhow::{bail, Context};
use dist_shared::{
    net::{NetMsg, ObjectGenerate, ReliableConn, TickPayload},
    schema::{ClientId, DoId, FieldValue, PackedState, SchemaRegistry, ZoneId},
};
use tracing::{debug, info, warn};

/// One visible object as reconstructed on the client.
#[derive(Debug, Clone)]
pub struct ClientObject {
    pub class_id: u16,
    pub zone_id: ZoneId,
    /// Whether this client owns (controls) the object.
    pub owned: bool,
    /// Packed per-field state; starts from the generate's prior state or the
    /// class defaults, then tracks snapshots.
    pub state: PackedState,
}

/// High-level client for the distributed-object protocol.
#[derive(Debug)]
pub struct NetClient {
    pub client_id: ClientId,
    pub tick_rate: u8,

    conn: ReliableConn,
    schema: SchemaRegistry,

    objects: BTreeMap<DoId, ClientObject>,
    /// Last snapshot tick applied (acknowledged back to the server by
    /// [`NetClient::send_ack`]).
    last_tick: Option<u32>,
    completed_interests: BTreeSet<u8>,
}

impl NetClient {
    /// Connects and performs the hello handshake. Fails if the server
    /// rejects the credentials or schema hash.
    pub async fn connect(
        addr: SocketAddr,
        schema: SchemaRegistry,
        password: &str,
        update_rate: u8,
        cmd_rate: u8,
    ) -> anyhow::Result<Self> {
        info!(server = %addr, "Connecting to server");
        let mut conn = ReliableConn::connect(addr).await?;

        conn.send(&NetMsg::Hello {
            password: password.to_string(),
            schema_hash: schema.schema_hash(),
            update_rate,
            cmd_rate,
        })
        .await?;

        let resp = conn.recv().await.context("await hello response")?;
        let (client_id, tick_rate) = match resp {
            NetMsg::HelloResp {
                ok: true,
                client_id: Some(id),
                tick_rate: Some(rate),
                ..
            } => (id, rate),
            NetMsg::HelloResp { ok: false, reason, .. } => {
                bail!("server refused connection: {}", reason.unwrap_or_default())
            }
            other => bail!("expected HelloResp, got {other:?}"),
        };

        info!(client_id = client_id.0, tick_rate, "Connected and verified");

        Ok(Self {
            client_id,
            tick_rate,
            conn,
            schema,
            objects: BTreeMap::new(),
            last_tick: None,
            completed_interests: BTreeSet::new(),
        })
    }

    // ───────────────────────── requests ─────────────────────────

    pub async fn add_interest(&mut self, handle: u8, zones: Vec<ZoneId>) -> anyhow::Result<()> {
        self.conn.send(&NetMsg::AddInterest { handle, zones }).await
    }

    pub async fn remove_interest(&mut self, handle: u8, zones: Vec<ZoneId>) -> anyhow::Result<()> {
        self.conn.send(&NetMsg::RemoveInterest { handle, zones }).await
    }

    pub async fn set_interest(&mut self, handle: u8, zones: Vec<ZoneId>) -> anyhow::Result<()> {
        self.conn.send(&NetMsg::SetInterest { handle, zones }).await
    }

    pub async fn set_update_rate(&mut self, rate: u8) -> anyhow::Result<()> {
        self.conn.send(&NetMsg::SetUpdateRate { rate }).await
    }

    pub async fn set_cmd_rate(&mut self, rate: u8) -> anyhow::Result<()> {
        self.conn.send(&NetMsg::SetCmdRate { rate }).await
    }

    /// Acknowledges the last applied snapshot tick, making it the server's
    /// delta baseline for this client.
    pub async fn send_ack(&mut self) -> anyhow::Result<()> {
        if let Some(tick) = self.last_tick {
            self.conn.send(&NetMsg::TickAck { tick }).await?;
        }
        Ok(())
    }

    pub async fn disconnect(&mut self) -> anyhow::Result<()> {
        self.conn.send(&NetMsg::Disconnect).await
    }

    // ───────────────────────── inbound ─────────────────────────

    /// Receives and applies one server message, if any arrives within
    /// `timeout`. Returns the message for callers that assert on traffic.
    pub async fn poll(
        &mut self,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Option<NetMsg>> {
        match self.conn.recv_timeout(timeout).await? {
            Some(msg) => {
                self.apply(&msg)?;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    /// Applies one server message to the local object table.
    pub fn apply(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        match msg {
            NetMsg::GenerateObject { entries } => {
                for entry in entries {
                    self.apply_generate(entry, false)?;
                }
            }
            NetMsg::GenerateOwnerObject { entries } => {
                for entry in entries {
                    self.apply_generate(entry, true)?;
                }
            }
            NetMsg::DeleteObject { do_ids } => {
                for do_id in do_ids {
                    if self.objects.remove(do_id).is_none() {
                        warn!(do_id = do_id.0, "Delete for unknown object");
                    }
                }
            }
            NetMsg::InterestComplete { handle } => {
                debug!(handle, "Interest change complete");
                self.completed_interests.insert(*handle);
            }
            NetMsg::Tick(payload) => self.apply_tick(payload)?,
            other => {
                debug!(?other, "Unhandled server message");
            }
        }
        Ok(())
    }

    fn apply_generate(&mut self, entry: &ObjectGenerate, owned: bool) -> anyhow::Result<()> {
        let class = self
            .schema
            .get(entry.class_id)
            .with_context(|| format!("generate for unknown class {}", entry.class_id))?;
        let state = match &entry.prior_state {
            Some(state) => state.clone(),
            None => PackedState::pack(&class.default_fields()),
        };
        debug!(
            do_id = entry.do_id.0,
            zone_id = entry.zone_id.0,
            class = %class.name,
            owned,
            prior = entry.prior_state.is_some(),
            "Object generated"
        );
        self.objects.insert(
            entry.do_id,
            ClientObject {
                class_id: entry.class_id,
                zone_id: entry.zone_id,
                owned,
                state,
            },
        );
        Ok(())
    }

    fn apply_tick(&mut self, payload: &TickPayload) -> anyhow::Result<()> {
        match payload {
            TickPayload::Full { tick, objects } => {
                for obj in objects {
                    let entry = self.objects.entry(obj.do_id).or_insert_with(|| ClientObject {
                        class_id: obj.class_id,
                        zone_id: obj.zone_id,
                        owned: false,
                        state: PackedState::default(),
                    });
                    entry.zone_id = obj.zone_id;
                    entry.state = obj.state.clone();
                }
                self.last_tick = Some(*tick);
            }
            TickPayload::Delta {
                tick,
                baseline_tick,
                objects,
            } => {
                debug!(tick, baseline_tick, objects = objects.len(), "Applying delta");
                for obj in objects {
                    let Some(entry) = self.objects.get_mut(&obj.do_id) else {
                        // Generate for this object must have been dropped;
                        // skip rather than fabricate state.
                        warn!(do_id = obj.do_id.0, "Delta for unknown object");
                        continue;
                    };
                    entry.zone_id = obj.zone_id;
                    for (index, bytes) in &obj.fields {
                        let index = usize::from(*index);
                        if index >= entry.state.fields.len() {
                            bail!(
                                "delta field index {index} out of range for object {}",
                                obj.do_id.0
                            );
                        }
                        entry.state.fields[index] = bytes.clone();
                    }
                }
                self.last_tick = Some(*tick);
            }
        }
        Ok(())
    }

    // ───────────────────────── queries ─────────────────────────

    pub fn objects(&self) -> &BTreeMap<DoId, ClientObject> {
        &self.objects
    }

    pub fn last_tick(&self) -> Option<u32> {
        self.last_tick
    }

    pub fn interest_complete(&self, handle: u8) -> bool {
        self.completed_interests.contains(&handle)
    }

    /// Decodes an object's current field values through the schema.
    pub fn object_fields(&self, do_id: DoId) -> anyhow::Result<Vec<FieldValue>> {
        let obj = self
            .objects
            .get(&do_id)
            .with_context(|| format!("unknown object {}", do_id.0))?;
        let class = self
            .schema
            .get(obj.class_id)
            .with_context(|| format!("unknown class {}", obj.class_id))?;
        obj.state.unpack(class)
    }

    /// Decodes one named field of an object.
    pub fn object_field(&self, do_id: DoId, name: &str) -> anyhow::Result<FieldValue> {
        let obj = self
            .objects
            .get(&do_id)
            .with_context(|| format!("unknown object {}", do_id.0))?;
        let class = self
            .schema
            .get(obj.class_id)
            .with_context(|| format!("unknown class {}", obj.class_id))?;
        let index = class
            .field_index(name)
            .with_context(|| format!("class '{}' has no field '{name}'", class.name))?;
        let def = &class.fields[index];
        dist_shared::schema::decode_field(def.kind, &mut obj.state.fields[index].as_slice())
    }
}
