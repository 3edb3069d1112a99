//! Server implementation.
//!
//! This is an authoritative distributed-object server with a fixed timestep
//! tick loop. It supports:
//! - Client verification (password + schema hash handshake)
//! - Per-client update/command rate negotiation
//! - Zone-scoped interest management with generate/delete notifications
//! - Delta-compressed tick snapshots against acknowledged baselines
//!
//! Concurrency model:
//! - All mutable state is owned by the task driving [`ObjectServer::step`].
//! - An accept task and one reader task per connection forward work into a
//!   single inbound queue; every tick drains that queue to empty before any
//!   simulation work, so a tick never observes a partially drained queue.
//! - Per-client faults never escape the client: send failures and protocol
//!   violations tear down or ignore that one connection only.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dist_shared::{
    config::ServerConfig,
    net::{NetMsg, ObjectGenerate, ReliableConn, ReliableListener, ReliableSend},
    schema::{ClientId, DoId, FieldValue, SchemaRegistry, ZoneId},
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::TickClock;
use crate::directory::{ConnId, IdAllocator, NetworkObject, ObjectDirectory};
use crate::interest::{
    apply_interest_op, compute_interest, diff_zones, InterestOp, ZoneObservers,
};
use crate::snapshot::{ClientFrame, ClientFrameManager, FrameSnapshot, SnapshotManager};

/// Connection verification state. One-way: a verified client never reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unverified,
    Verified,
}

/// Connected client state.
struct ClientState {
    conn: ConnId,
    addr: SocketAddr,
    state: SessionState,
    /// Allocated only once verified.
    id: Option<ClientId>,

    /// How many snapshots per second this client receives.
    update_rate: u8,
    update_interval: f64,
    next_update_time: f64,
    /// How many commands per second this client is expected to send.
    cmd_rate: u8,
    cmd_interval: f64,

    /// Last tick the client acknowledged receiving, and the one before it.
    ack_tick: Option<u32>,
    prev_ack_tick: Option<u32>,

    frames: ClientFrameManager,
    last_snapshot: Option<Arc<FrameSnapshot>>,

    /// Objects this client exclusively controls.
    owned: BTreeSet<DoId>,
    owned_by_zone: BTreeMap<ZoneId, BTreeSet<DoId>>,

    /// Zones requested directly by the client.
    explicit_zones: BTreeSet<ZoneId>,
    /// Explicit zones plus owned-object zones. Mutated only by the interest
    /// recompute routine.
    current_zones: BTreeSet<ZoneId>,

    last_message_time: f64,
}

impl ClientState {
    fn new(conn: ConnId, addr: SocketAddr, history_depth: usize, now: f64) -> Self {
        Self {
            conn,
            addr,
            state: SessionState::Unverified,
            id: None,
            update_rate: 0,
            update_interval: 0.0,
            next_update_time: 0.0,
            cmd_rate: 0,
            cmd_interval: 0.0,
            ack_tick: None,
            prev_ack_tick: None,
            frames: ClientFrameManager::new(history_depth),
            last_snapshot: None,
            owned: BTreeSet::new(),
            owned_by_zone: BTreeMap::new(),
            explicit_zones: BTreeSet::new(),
            current_zones: BTreeSet::new(),
            last_message_time: now,
        }
    }

    fn is_verified(&self) -> bool {
        self.state == SessionState::Verified && self.id.is_some()
    }

    fn index_owned(&mut self, do_id: DoId, zone: ZoneId) {
        self.owned.insert(do_id);
        self.owned_by_zone.entry(zone).or_default().insert(do_id);
    }

    fn unindex_owned(&mut self, do_id: DoId, zone: ZoneId) {
        self.owned.remove(&do_id);
        if let Some(set) = self.owned_by_zone.get_mut(&zone) {
            set.remove(&do_id);
            if set.is_empty() {
                self.owned_by_zone.remove(&zone);
            }
        }
    }
}

/// Notifications for the embedding application, drained between frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ClientConnected(ClientId),
    ClientDisconnected(ClientId),
}

/// Inbound work forwarded from the accept/reader tasks.
enum ConnEvent {
    Incoming { conn: ReliableConn, addr: SocketAddr },
    Message { conn: ConnId, msg: NetMsg },
    Closed { conn: ConnId },
}

/// Per-tick simulation hook supplied by the embedding application.
pub type TickHook = Box<dyn FnMut(&mut ObjectDirectory, f64) + Send>;

/// Authoritative object server.
pub struct ObjectServer {
    cfg: ServerConfig,
    schema: SchemaRegistry,
    schema_hash: u32,

    clock: TickClock,
    directory: ObjectDirectory,
    snapshot_mgr: SnapshotManager,
    observers: ZoneObservers,

    clients: HashMap<ConnId, ClientState>,
    peers: HashMap<ConnId, ReliableSend>,
    client_ids: IdAllocator,
    next_conn: u64,

    inbound_tx: mpsc::UnboundedSender<ConnEvent>,
    inbound_rx: mpsc::UnboundedReceiver<ConnEvent>,
    events: Vec<ServerEvent>,

    local_addr: SocketAddr,
    tick_hook: Option<TickHook>,
}

impl ObjectServer {
    /// Binds the listen socket and spawns the accept task.
    pub async fn bind(cfg: ServerConfig, schema: SchemaRegistry) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.listen_addr.parse().context("parse listen_addr")?;
        let listener = ReliableListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let accept_tx = inbound_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((conn, addr)) => {
                        if accept_tx.send(ConnEvent::Incoming { conn, addr }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                    }
                }
            }
        });

        let schema_hash = schema.schema_hash();
        info!(%local_addr, tick_rate = cfg.tick_rate, schema_hash, "Server listening");

        Ok(Self {
            clock: TickClock::new(cfg.tick_rate),
            cfg,
            schema,
            schema_hash,
            directory: ObjectDirectory::new(),
            snapshot_mgr: SnapshotManager::new(),
            observers: ZoneObservers::default(),
            clients: HashMap::new(),
            peers: HashMap::new(),
            // Client id 0 is reserved; the first verified client gets 1.
            client_ids: IdAllocator::with_base(1, 0xFFFF),
            next_conn: 1,
            inbound_tx,
            inbound_rx,
            events: Vec::new(),
            local_addr,
            tick_hook: None,
        })
    }

    /// Returns the local address (after binding).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn tick_count(&self) -> u32 {
        self.clock.tick_count()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_full(&self) -> bool {
        self.clients.len() >= self.cfg.max_clients
    }

    /// Connection handle of a verified client, e.g. for assigning object
    /// ownership.
    pub fn conn_of(&self, id: ClientId) -> Option<ConnId> {
        self.clients
            .values()
            .find(|c| c.id == Some(id))
            .map(|c| c.conn)
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    /// Direct access for simulation code and tests.
    pub fn directory_mut(&mut self) -> &mut ObjectDirectory {
        &mut self.directory
    }

    pub fn directory(&self) -> &ObjectDirectory {
        &self.directory
    }

    /// Installs a hook invoked once per tick, before the snapshot is taken.
    pub fn set_tick_hook(&mut self, hook: TickHook) {
        self.tick_hook = Some(hook);
    }

    /// Drains queued application events.
    pub fn drain_events(&mut self) -> Vec<ServerEvent> {
        std::mem::take(&mut self.events)
    }

    /// Human-readable status summary, one line per client.
    pub fn status(&self) -> Vec<String> {
        let mut out = vec![
            format!("Tick: {}", self.clock.tick_count()),
            format!("Objects: {}", self.directory.len()),
            format!("Clients: {}/{}", self.clients.len(), self.cfg.max_clients),
        ];
        for client in self.clients.values() {
            out.push(format!(
                "  conn {} ({}): id={:?} update={}hz cmd={}hz ({:.3}s) ack={:?} zones={} last_snap={:?}",
                client.conn.0,
                client.addr,
                client.id.map(|i| i.0),
                client.update_rate,
                client.cmd_rate,
                client.cmd_interval,
                client.ack_tick,
                client.current_zones.len(),
                client.last_snapshot.as_ref().map(|s| s.tick),
            ));
        }
        out
    }

    /// Runs the server loop forever at the configured tick rate.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let frame = Duration::from_secs_f64(self.clock.interval());
        let mut next = tokio::time::Instant::now();
        loop {
            next += frame;
            self.step(frame.as_secs_f64()).await?;
            tokio::time::sleep_until(next).await;
        }
    }

    /// Advances the simulation by one frame of wall time, running zero or
    /// more fixed-interval ticks.
    pub async fn step(&mut self, frame_dt: f64) -> anyhow::Result<()> {
        let num_ticks = self.clock.advance(frame_dt);
        for _ in 0..num_ticks {
            self.run_tick().await?;
            self.clock.complete_tick();
        }
        Ok(())
    }

    async fn run_tick(&mut self) -> anyhow::Result<()> {
        let now = self.clock.tick_start_time();

        // Drain every pending inbound message before simulating, so the tick
        // sees a consistent queue state.
        self.poll_until_empty(now).await?;
        self.check_idle_clients(now).await?;

        if let Some(mut hook) = self.tick_hook.take() {
            hook(&mut self.directory, self.clock.interval());
            self.tick_hook = Some(hook);
        }

        self.take_tick_snapshot(now).await?;
        Ok(())
    }

    // ───────────────────────── inbound plumbing ─────────────────────────

    async fn poll_until_empty(&mut self, now: f64) -> anyhow::Result<()> {
        loop {
            match self.inbound_rx.try_recv() {
                Ok(event) => self.handle_event(event, now).await?,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            }
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: ConnEvent, now: f64) -> anyhow::Result<()> {
        match event {
            ConnEvent::Incoming { conn, addr } => {
                self.register_connection(conn, addr, now);
            }
            ConnEvent::Message { conn, msg } => {
                self.handle_message(conn, msg, now).await?;
            }
            ConnEvent::Closed { conn } => {
                if self.clients.contains_key(&conn) {
                    info!(conn = conn.0, "Client connection closed by transport");
                    self.disconnect_client(conn).await?;
                }
            }
        }
        Ok(())
    }

    fn register_connection(&mut self, conn: ReliableConn, addr: SocketAddr, now: f64) {
        if self.is_full() {
            warn!(%addr, max_clients = self.cfg.max_clients, "Refusing connection, server full");
            drop(conn);
            return;
        }

        let conn_id = ConnId(self.next_conn);
        self.next_conn += 1;

        let (mut recv, send) = conn.into_split();
        let tx = self.inbound_tx.clone();
        tokio::spawn(async move {
            loop {
                match recv.recv().await {
                    Ok(msg) => {
                        if tx.send(ConnEvent::Message { conn: conn_id, msg }).is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        let _ = tx.send(ConnEvent::Closed { conn: conn_id });
                        break;
                    }
                }
            }
        });

        self.peers.insert(conn_id, send);
        self.clients.insert(
            conn_id,
            ClientState::new(conn_id, addr, self.cfg.history_depth, now),
        );
        info!(conn = conn_id.0, %addr, "Got client, awaiting hello");
    }

    /// Sends a message to one connection. A failed send schedules transport
    /// teardown for that client; it never fails the tick loop.
    async fn send_to(&mut self, conn: ConnId, msg: &NetMsg) {
        if let Some(peer) = self.peers.get_mut(&conn) {
            if let Err(e) = peer.send(msg).await {
                warn!(conn = conn.0, error = %e, "Send failed, closing connection");
                let _ = self.inbound_tx.send(ConnEvent::Closed { conn });
            }
        }
    }

    // ───────────────────────── message dispatch ─────────────────────────

    async fn handle_message(&mut self, conn: ConnId, msg: NetMsg, now: f64) -> anyhow::Result<()> {
        let Some(client) = self.clients.get_mut(&conn) else {
            warn!(conn = conn.0, "SECURITY: message from unknown connection");
            return Ok(());
        };
        client.last_message_time = now;
        let state = client.state;

        match (state, msg) {
            (SessionState::Unverified, NetMsg::Hello {
                password,
                schema_hash,
                update_rate,
                cmd_rate,
            }) => {
                self.handle_hello(conn, password, schema_hash, update_rate, cmd_rate, now)
                    .await?;
            }
            (SessionState::Verified, NetMsg::SetUpdateRate { rate }) => {
                let rate = self.cfg.clamp_update_rate(rate);
                if let Some(client) = self.clients.get_mut(&conn) {
                    client.update_rate = rate;
                    client.update_interval = 1.0 / f64::from(rate);
                }
            }
            (SessionState::Verified, NetMsg::SetCmdRate { rate }) => {
                let rate = self.cfg.clamp_cmd_rate(rate);
                if let Some(client) = self.clients.get_mut(&conn) {
                    client.cmd_rate = rate;
                    client.cmd_interval = 1.0 / f64::from(rate);
                }
            }
            (SessionState::Verified, NetMsg::TickAck { tick }) => {
                if let Some(client) = self.clients.get_mut(&conn) {
                    client.prev_ack_tick = client.ack_tick;
                    client.ack_tick = Some(tick);
                    debug!(
                        conn = conn.0,
                        tick,
                        prev = ?client.prev_ack_tick,
                        "Client acknowledged tick"
                    );
                }
            }
            (SessionState::Verified, NetMsg::AddInterest { handle, zones }) => {
                self.handle_interest(conn, InterestOp::Add, handle, zones).await?;
            }
            (SessionState::Verified, NetMsg::RemoveInterest { handle, zones }) => {
                self.handle_interest(conn, InterestOp::Remove, handle, zones).await?;
            }
            (SessionState::Verified, NetMsg::SetInterest { handle, zones }) => {
                self.handle_interest(conn, InterestOp::Set, handle, zones).await?;
            }
            (SessionState::Verified, NetMsg::Disconnect) => {
                info!(conn = conn.0, "Client disconnecting");
                self.disconnect_client(conn).await?;
            }
            // Out-of-state or nonsensical messages are protocol no-ops:
            // logged and dropped, never fatal.
            (state, other) => {
                warn!(conn = conn.0, ?state, msg = ?other, "Ignoring out-of-state message");
            }
        }
        Ok(())
    }

    async fn handle_hello(
        &mut self,
        conn: ConnId,
        password: String,
        schema_hash: u32,
        update_rate: u8,
        cmd_rate: u8,
        now: f64,
    ) -> anyhow::Result<()> {
        let reject = if password != self.cfg.password {
            Some("incorrect password")
        } else if schema_hash != self.schema_hash {
            Some("schema hash mismatch")
        } else {
            None
        };

        if let Some(reason) = reject {
            warn!(conn = conn.0, reason, "Could not verify client");
            self.send_to(
                conn,
                &NetMsg::HelloResp {
                    ok: false,
                    reason: Some(reason.to_string()),
                    client_id: None,
                    tick_rate: None,
                },
            )
            .await;
            self.close_connection(conn);
            return Ok(());
        }

        let client_id = match self.client_ids.allocate() {
            Ok(id) => ClientId(id as u16),
            Err(e) => {
                warn!(conn = conn.0, error = %e, "Client id pool exhausted");
                self.send_to(
                    conn,
                    &NetMsg::HelloResp {
                        ok: false,
                        reason: Some("server full".to_string()),
                        client_id: None,
                        tick_rate: None,
                    },
                )
                .await;
                self.close_connection(conn);
                return Ok(());
            }
        };

        let update_rate = self.cfg.clamp_update_rate(update_rate);
        let cmd_rate = self.cfg.clamp_cmd_rate(cmd_rate);
        let tick_rate = self.cfg.tick_rate.min(255) as u8;

        if let Some(client) = self.clients.get_mut(&conn) {
            client.update_rate = update_rate;
            client.update_interval = 1.0 / f64::from(update_rate);
            client.next_update_time = now;
            client.cmd_rate = cmd_rate;
            client.cmd_interval = 1.0 / f64::from(cmd_rate);
            client.state = SessionState::Verified;
            client.id = Some(client_id);
        }

        info!(
            conn = conn.0,
            client_id = client_id.0,
            update_rate,
            cmd_rate,
            "Client verified"
        );

        self.send_to(
            conn,
            &NetMsg::HelloResp {
                ok: true,
                reason: None,
                client_id: Some(client_id),
                tick_rate: Some(tick_rate),
            },
        )
        .await;

        self.events.push(ServerEvent::ClientConnected(client_id));
        Ok(())
    }

    // ───────────────────────── interest management ─────────────────────────

    async fn handle_interest(
        &mut self,
        conn: ConnId,
        op: InterestOp,
        handle: u8,
        zones: Vec<ZoneId>,
    ) -> anyhow::Result<()> {
        if let Some(client) = self.clients.get_mut(&conn) {
            apply_interest_op(&mut client.explicit_zones, op, &zones);
        }
        self.update_client_interest(conn).await?;
        // The acknowledgment goes out after all generate/delete traffic for
        // this change, so the client can gate on it.
        self.send_to(conn, &NetMsg::InterestComplete { handle }).await;
        Ok(())
    }

    /// Recomputes a client's interest set (explicit ∪ owned-object zones) and
    /// emits generate/delete notifications for the zones gained and lost.
    /// No-op when the computed set is unchanged.
    async fn update_client_interest(&mut self, conn: ConnId) -> anyhow::Result<()> {
        let Some(client) = self.clients.get_mut(&conn) else {
            return Ok(());
        };
        let new_zones = compute_interest(
            &client.explicit_zones,
            client.owned_by_zone.keys().copied(),
        );
        if new_zones == client.current_zones {
            return Ok(());
        }
        let (added, removed) = diff_zones(&client.current_zones, &new_zones);
        client.current_zones = new_zones;
        let owned = client.owned.clone();

        for &zone in &added {
            self.observers.add(zone, conn);
        }
        for &zone in &removed {
            self.observers.remove(zone, conn);
        }

        // Entering zones: the client needs a generate for every live object
        // there, except objects it owns (those arrived via owner-generate).
        let mut entries = Vec::new();
        for &zone in &added {
            for obj in self.directory.objects_in_zone(zone) {
                if owned.contains(&obj.do_id) {
                    continue;
                }
                entries.push(generate_entry(&self.snapshot_mgr, obj));
            }
        }

        // Leaving zones: every live object there disappears from the
        // client's view. The objects themselves stay alive.
        let mut do_ids = Vec::new();
        for &zone in &removed {
            for obj in self.directory.objects_in_zone(zone) {
                do_ids.push(obj.do_id);
            }
        }

        debug!(
            conn = conn.0,
            added = added.len(),
            removed = removed.len(),
            generates = entries.len(),
            deletes = do_ids.len(),
            "Interest recomputed"
        );

        if !entries.is_empty() {
            self.send_to(conn, &NetMsg::GenerateObject { entries }).await;
        }
        if !do_ids.is_empty() {
            self.send_to(conn, &NetMsg::DeleteObject { do_ids }).await;
        }
        Ok(())
    }

    // ───────────────────────── object lifecycle ─────────────────────────

    /// Generates a networked object: allocates an id, registers it in its
    /// zone (and owner index), and notifies every interested client.
    ///
    /// `fields` of `None` start the object from its class defaults.
    pub async fn generate_object(
        &mut self,
        class_id: u16,
        zone_id: ZoneId,
        owner: Option<ConnId>,
        fields: Option<Vec<FieldValue>>,
    ) -> anyhow::Result<DoId> {
        let class = self
            .schema
            .get(class_id)
            .with_context(|| format!("unknown class id {class_id}"))?;
        let fields = fields.unwrap_or_else(|| class.default_fields());
        anyhow::ensure!(
            fields.len() == class.fields.len(),
            "class '{}' declares {} fields, got {}",
            class.name,
            class.fields.len(),
            fields.len()
        );
        if let Some(owner) = owner {
            anyhow::ensure!(
                self.clients.get(&owner).is_some_and(|c| c.is_verified()),
                "owner connection {} is not a verified client",
                owner.0
            );
        }

        let do_id = self
            .directory
            .insert(class_id, zone_id, owner, fields)
            .context("allocate object id")?;

        info!(do_id = do_id.0, zone_id = zone_id.0, class_id, "Generated object");

        let entry = generate_entry(
            &self.snapshot_mgr,
            self.directory.get(do_id).expect("just inserted"),
        );

        // Inform clients interested in the object's zone. The owner is
        // excluded here; it gets the distinguished owner-generate below.
        let targets: Vec<ConnId> = self
            .observers
            .observers(zone_id)
            .filter(|&c| Some(c) != owner)
            .collect();
        for target in targets {
            self.send_to(
                target,
                &NetMsg::GenerateObject {
                    entries: vec![entry.clone()],
                },
            )
            .await;
        }

        if let Some(owner) = owner {
            if let Some(client) = self.clients.get_mut(&owner) {
                client.index_owned(do_id, zone_id);
            }
            self.send_to(
                owner,
                &NetMsg::GenerateOwnerObject {
                    entries: vec![entry],
                },
            )
            .await;
            // Owning an object implies interest in its zone.
            self.update_client_interest(owner).await?;
        }

        Ok(do_id)
    }

    /// Deletes a networked object: notifies interested clients, unindexes
    /// it, frees its id, and purges its cached packed state so a recycled id
    /// never deltas against the dead object's bytes.
    pub async fn delete_object(&mut self, do_id: DoId) -> anyhow::Result<()> {
        let obj = self
            .directory
            .remove(do_id)
            .with_context(|| format!("delete unknown object {}", do_id.0))?;

        info!(do_id = do_id.0, zone_id = obj.zone_id.0, "Deleting object");

        if let Some(owner) = obj.owner {
            if let Some(client) = self.clients.get_mut(&owner) {
                client.unindex_owned(do_id, obj.zone_id);
            }
        }

        let targets: Vec<ConnId> = self.observers.observers(obj.zone_id).collect();
        for target in targets {
            self.send_to(target, &NetMsg::DeleteObject { do_ids: vec![do_id] })
                .await;
        }

        self.snapshot_mgr.purge(do_id);

        if let Some(owner) = obj.owner {
            // The owner may have just lost its implicit interest in the zone.
            self.update_client_interest(owner).await?;
        }
        Ok(())
    }

    /// Moves an object to a new zone, notifying clients whose view of it
    /// changes and recomputing the owner's implicit interest.
    pub async fn set_object_zone(&mut self, do_id: DoId, zone_id: ZoneId) -> anyhow::Result<()> {
        let old_zone = self
            .directory
            .set_zone(do_id, zone_id)
            .with_context(|| format!("move unknown object {}", do_id.0))?;
        if old_zone == zone_id {
            return Ok(());
        }
        let obj = self.directory.get(do_id).expect("just moved");
        let owner = obj.owner;
        let entry = generate_entry(&self.snapshot_mgr, obj);

        if let Some(owner) = owner {
            if let Some(client) = self.clients.get_mut(&owner) {
                client.unindex_owned(do_id, old_zone);
                client.index_owned(do_id, zone_id);
            }
        }

        // Clients observing only the old zone lose the object; clients
        // observing only the new zone gain it. The owner keeps it either way.
        let old_obs: BTreeSet<ConnId> = self.observers.observers(old_zone).collect();
        let new_obs: BTreeSet<ConnId> = self.observers.observers(zone_id).collect();
        for &target in old_obs.difference(&new_obs) {
            if Some(target) == owner {
                continue;
            }
            self.send_to(target, &NetMsg::DeleteObject { do_ids: vec![do_id] })
                .await;
        }
        for &target in new_obs.difference(&old_obs) {
            if Some(target) == owner {
                continue;
            }
            self.send_to(
                target,
                &NetMsg::GenerateObject {
                    entries: vec![entry.clone()],
                },
            )
            .await;
        }

        if let Some(owner) = owner {
            self.update_client_interest(owner).await?;
        }
        Ok(())
    }

    // ───────────────────────── client teardown ─────────────────────────

    /// Full teardown: force-deletes owned objects, releases the client id,
    /// and drops the connection.
    async fn disconnect_client(&mut self, conn: ConnId) -> anyhow::Result<()> {
        let Some(client) = self.clients.remove(&conn) else {
            return Ok(());
        };
        // Stop all traffic to this client first.
        self.peers.remove(&conn);
        for &zone in &client.current_zones {
            self.observers.remove(zone, conn);
        }

        for do_id in client.owned.iter().copied().collect::<Vec<_>>() {
            // Owned objects die with their client. The owner entry is
            // already gone, so delete_object only notifies the others.
            self.delete_object(do_id).await?;
        }

        if let Some(id) = client.id {
            self.client_ids.free(u32::from(id.0));
            self.events.push(ServerEvent::ClientDisconnected(id));
        }
        info!(conn = conn.0, addr = %client.addr, "Client removed");
        Ok(())
    }

    /// Drops the transport without the owned-object teardown; used for
    /// failed verification, where the client never owned anything.
    fn close_connection(&mut self, conn: ConnId) {
        self.peers.remove(&conn);
        self.clients.remove(&conn);
    }

    async fn check_idle_clients(&mut self, now: f64) -> anyhow::Result<()> {
        let Some(timeout) = self.cfg.idle_timeout_secs else {
            return Ok(());
        };
        let idle: Vec<ConnId> = self
            .clients
            .values()
            .filter(|c| c.is_verified() && now - c.last_message_time > timeout)
            .map(|c| c.conn)
            .collect();
        for conn in idle {
            info!(conn = conn.0, timeout, "Dropping idle client");
            self.disconnect_client(conn).await?;
        }
        Ok(())
    }

    // ───────────────────────── snapshots ─────────────────────────

    /// Builds this tick's snapshot and sends a full or delta payload to each
    /// client whose update timer has elapsed.
    async fn take_tick_snapshot(&mut self, now: f64) -> anyhow::Result<()> {
        let tick = self.clock.tick_count();

        // Clients due an update this tick, and the union of their zones.
        let mut due = Vec::new();
        let mut zones: BTreeSet<ZoneId> = BTreeSet::new();
        for client in self.clients.values() {
            if client.is_verified() && client.next_update_time <= now {
                zones.extend(client.current_zones.iter().copied());
                due.push(client.conn);
            }
        }
        if due.is_empty() {
            // No clients need snapshots, punt.
            return Ok(());
        }
        due.sort();

        debug!(tick, clients = due.len(), zones = zones.len(), "Taking tick snapshot");

        // Pack every object visible to at least one due client.
        let mut snap = FrameSnapshot::new(tick);
        for obj in self.directory.iter() {
            if zones.contains(&obj.zone_id) {
                self.snapshot_mgr.pack_object(&mut snap, obj);
            }
        }
        let snap = Arc::new(snap);

        for conn in due {
            let Some(client) = self.clients.get_mut(&conn) else {
                continue;
            };
            client.next_update_time = now + client.update_interval;

            // Delta against the acknowledged frame when it is still in the
            // ring; otherwise (new client, or baseline aged out) fall back
            // to a full snapshot.
            let baseline = client
                .ack_tick
                .and_then(|t| client.frames.get_frame(t))
                .map(|f| f.snapshot.clone());
            let payload = match baseline {
                Some(old) => self.snapshot_mgr.format_delta(&old, &snap, &client.current_zones),
                None => self.snapshot_mgr.format_full(&snap, &client.current_zones),
            };

            client.frames.add_frame(ClientFrame {
                tick,
                snapshot: snap.clone(),
            });
            client.last_snapshot = Some(snap.clone());

            self.send_to(conn, &NetMsg::Tick(payload)).await;
        }
        Ok(())
    }
}

fn generate_entry(snapshot_mgr: &SnapshotManager, obj: &NetworkObject) -> ObjectGenerate {
    ObjectGenerate {
        class_id: obj.class_id,
        do_id: obj.do_id,
        zone_id: obj.zone_id,
        // Ship the last packed state as the baseline when we have one, so
        // clients start from current values instead of class defaults.
        prior_state: snapshot_mgr.prev_sent_state(obj.do_id).cloned(),
    }
}

/// Helper for tests: bind to an ephemeral port.
pub async fn bind_ephemeral(
    mut cfg: ServerConfig,
    schema: SchemaRegistry,
) -> anyhow::Result<(ObjectServer, SocketAddr)> {
    cfg.listen_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).to_string();
    let server = ObjectServer::bind(cfg, schema).await?;
    let addr = server.local_addr();
    Ok((server, addr))
}
