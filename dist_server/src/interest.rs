//! Server-side interest management helpers.
//!
//! A zone is observed by a client iff it is in the client's explicit interest
//! set or holds an object the client owns. The pure computations (merge,
//! diff) live here so the invariants are testable without a running server;
//! the notification side effects are wired up in [`crate::server`].

use std::collections::{BTreeMap, BTreeSet};

use dist_shared::schema::ZoneId;

use crate::directory::ConnId;

/// How an interest request mutates the explicit zone set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestOp {
    /// Union the given zones into the explicit set.
    Add,
    /// Subtract the given zones from the explicit set.
    Remove,
    /// Replace the explicit set entirely.
    Set,
}

/// Applies an interest request to an explicit zone set.
pub fn apply_interest_op(explicit: &mut BTreeSet<ZoneId>, op: InterestOp, zones: &[ZoneId]) {
    match op {
        InterestOp::Add => explicit.extend(zones.iter().copied()),
        InterestOp::Remove => {
            for z in zones {
                explicit.remove(z);
            }
        }
        InterestOp::Set => {
            explicit.clear();
            explicit.extend(zones.iter().copied());
        }
    }
}

/// The full interest set: explicit zones plus the zones of owned objects.
pub fn compute_interest(
    explicit: &BTreeSet<ZoneId>,
    owned_zones: impl Iterator<Item = ZoneId>,
) -> BTreeSet<ZoneId> {
    let mut zones = explicit.clone();
    zones.extend(owned_zones);
    zones
}

/// Zones entering and leaving between two interest sets.
pub fn diff_zones(
    old: &BTreeSet<ZoneId>,
    new: &BTreeSet<ZoneId>,
) -> (Vec<ZoneId>, Vec<ZoneId>) {
    let added = new.difference(old).copied().collect();
    let removed = old.difference(new).copied().collect();
    (added, removed)
}

/// Which clients observe which zones. Kept in step with every client's
/// current interest set by the server's recompute routine.
#[derive(Debug, Default)]
pub struct ZoneObservers {
    map: BTreeMap<ZoneId, BTreeSet<ConnId>>,
}

impl ZoneObservers {
    pub fn add(&mut self, zone: ZoneId, conn: ConnId) {
        self.map.entry(zone).or_default().insert(conn);
    }

    pub fn remove(&mut self, zone: ZoneId, conn: ConnId) {
        if let Some(set) = self.map.get_mut(&zone) {
            set.remove(&conn);
            if set.is_empty() {
                self.map.remove(&zone);
            }
        }
    }

    /// Connections currently observing `zone`, in id order.
    pub fn observers(&self, zone: ZoneId) -> impl Iterator<Item = ConnId> + '_ {
        self.map.get(&zone).into_iter().flatten().copied()
    }

    pub fn is_observing(&self, zone: ZoneId, conn: ConnId) -> bool {
        self.map.get(&zone).is_some_and(|set| set.contains(&conn))
    }
}
