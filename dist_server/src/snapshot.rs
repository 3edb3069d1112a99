//! Tick snapshots and delta encoding.
//!
//! Each tick the server captures the packed state of every object visible to
//! at least one client that is due an update. Clients keep a bounded ring of
//! previously sent frames; once a client acknowledges tick N, the frame for N
//! becomes the delta baseline for later sends. A baseline that aged out of
//! the ring transparently falls back to a full snapshot.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use dist_shared::net::{DeltaObjectState, FullObjectState, TickPayload};
use dist_shared::schema::{DoId, PackedState, ZoneId};

use crate::directory::NetworkObject;

/// One object's captured state within a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    pub zone_id: ZoneId,
    pub class_id: u16,
    pub state: PackedState,
}

/// Immutable point-in-time capture of object state for one tick. Shared
/// between every client frame that references it.
#[derive(Debug, Default, PartialEq)]
pub struct FrameSnapshot {
    pub tick: u32,
    pub entries: std::collections::BTreeMap<DoId, SnapshotEntry>,
}

impl FrameSnapshot {
    pub fn new(tick: u32) -> Self {
        Self {
            tick,
            entries: Default::default(),
        }
    }
}

/// A (tick, snapshot) pair recorded in a client's frame history.
#[derive(Debug, Clone)]
pub struct ClientFrame {
    pub tick: u32,
    pub snapshot: Arc<FrameSnapshot>,
}

/// Bounded ring of recently sent frames for one client. Oldest frames are
/// evicted on overflow, which is what eventually forces full-snapshot
/// fallback for clients that stop acknowledging.
#[derive(Debug)]
pub struct ClientFrameManager {
    frames: VecDeque<ClientFrame>,
    capacity: usize,
}

impl ClientFrameManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity.min(256)),
            capacity: capacity.max(1),
        }
    }

    /// Records a sent frame, evicting the oldest if over capacity.
    pub fn add_frame(&mut self, frame: ClientFrame) {
        self.frames.push_back(frame);
        while self.frames.len() > self.capacity {
            self.frames.pop_front();
        }
    }

    /// The retained frame for `tick`, if it has not been evicted.
    pub fn get_frame(&self, tick: u32) -> Option<&ClientFrame> {
        self.frames.iter().rev().find(|f| f.tick == tick)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Packs object state into snapshots and formats per-client full or delta
/// payloads.
///
/// Also keeps the most recently packed state per live object. That cache is
/// shipped as the `prior_state` baseline when an object newly enters a
/// client's visible set, and is purged when an id is released so a recycled
/// id can never delta against a dead object's bytes.
#[derive(Debug, Default)]
pub struct SnapshotManager {
    prev_sent: HashMap<DoId, PackedState>,
}

impl SnapshotManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packs one object into `snap` and refreshes the prev-sent cache.
    pub fn pack_object(&mut self, snap: &mut FrameSnapshot, obj: &NetworkObject) {
        let state = PackedState::pack(&obj.fields);
        self.prev_sent.insert(obj.do_id, state.clone());
        snap.entries.insert(
            obj.do_id,
            SnapshotEntry {
                zone_id: obj.zone_id,
                class_id: obj.class_id,
                state,
            },
        );
    }

    /// Last packed state for an object, if any snapshot has carried it.
    pub fn prev_sent_state(&self, do_id: DoId) -> Option<&PackedState> {
        self.prev_sent.get(&do_id)
    }

    /// Forgets an object's packed state. Must run when its id is released.
    pub fn purge(&mut self, do_id: DoId) {
        self.prev_sent.remove(&do_id);
    }

    /// Formats a full payload: every field of every object in `zones`.
    pub fn format_full(&self, snap: &FrameSnapshot, zones: &BTreeSet<ZoneId>) -> TickPayload {
        let objects = snap
            .entries
            .iter()
            .filter(|(_, e)| zones.contains(&e.zone_id))
            .map(|(&do_id, e)| FullObjectState {
                do_id,
                zone_id: e.zone_id,
                class_id: e.class_id,
                state: e.state.clone(),
            })
            .collect();
        TickPayload::Full {
            tick: snap.tick,
            objects,
        }
    }

    /// Formats a delta payload against a baseline snapshot, restricted to
    /// `zones`.
    ///
    /// Objects absent from the baseline (newly visible or newly created)
    /// carry all of their fields. Objects present in the baseline but gone
    /// from `snap` are omitted; their disappearance is communicated by the
    /// generate/delete channel, not the delta stream.
    pub fn format_delta(
        &self,
        baseline: &FrameSnapshot,
        snap: &FrameSnapshot,
        zones: &BTreeSet<ZoneId>,
    ) -> TickPayload {
        let mut objects = Vec::new();
        for (&do_id, entry) in &snap.entries {
            if !zones.contains(&entry.zone_id) {
                continue;
            }
            let fields: Vec<(u8, Vec<u8>)> = match baseline.entries.get(&do_id) {
                Some(old) => entry
                    .state
                    .changed_fields(&old.state)
                    .into_iter()
                    .map(|i| (i as u8, entry.state.fields[i].clone()))
                    .collect(),
                None => entry
                    .state
                    .fields
                    .iter()
                    .enumerate()
                    .map(|(i, buf)| (i as u8, buf.clone()))
                    .collect(),
            };
            if fields.is_empty() && baseline.entries.contains_key(&do_id) {
                // Unchanged object, omit from the delta entirely.
                continue;
            }
            objects.push(DeltaObjectState {
                do_id,
                zone_id: entry.zone_id,
                fields,
            });
        }
        TickPayload::Delta {
            tick: snap.tick,
            baseline_tick: baseline.tick,
            objects,
        }
    }
}
