//! Authoritative object directory.
//!
//! Owns the live set of networked objects: id allocation from a bounded
//! 16-bit pool, the per-zone index, and the generate/delete lifecycle. The
//! networking side effects of generate/delete (observer notifications, packed
//! state purging) live in the server; this module is pure bookkeeping so it
//! can be tested without sockets.

use std::collections::{BTreeMap, BTreeSet};

use dist_shared::schema::{DoId, FieldValue, ZoneId};
use thiserror::Error;

/// Identifies one transport connection, verified or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u64);

/// Raised when a bounded id pool has no free ids left.
#[derive(Debug, Error)]
#[error("id pool exhausted ({capacity} ids in use)")]
pub struct PoolExhausted {
    pub capacity: u32,
}

/// Free-list id allocator over `base..=max`. Released ids are recycled
/// most-recently-freed first.
#[derive(Debug)]
pub struct IdAllocator {
    base: u32,
    max: u32,
    next_fresh: u32,
    free: Vec<u32>,
    live: u32,
}

impl IdAllocator {
    pub fn new(max: u32) -> Self {
        Self::with_base(0, max)
    }

    pub fn with_base(base: u32, max: u32) -> Self {
        Self {
            base,
            max,
            next_fresh: base,
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn allocate(&mut self) -> Result<u32, PoolExhausted> {
        let id = if let Some(id) = self.free.pop() {
            id
        } else if self.next_fresh <= self.max {
            let id = self.next_fresh;
            self.next_fresh += 1;
            id
        } else {
            return Err(PoolExhausted {
                capacity: self.max - self.base + 1,
            });
        };
        self.live += 1;
        Ok(id)
    }

    pub fn free(&mut self, id: u32) {
        debug_assert!(
            (self.base..self.next_fresh).contains(&id),
            "freeing id that was never allocated"
        );
        self.free.push(id);
        self.live -= 1;
    }

    pub fn live_count(&self) -> u32 {
        self.live
    }
}

/// A live, server-owned networked object.
#[derive(Debug)]
pub struct NetworkObject {
    pub do_id: DoId,
    pub zone_id: ZoneId,
    pub class_id: u16,
    /// Connection that exclusively controls this object; `None` for
    /// server/AI-owned objects.
    pub owner: Option<ConnId>,
    /// Current field values, in schema order.
    pub fields: Vec<FieldValue>,
}

/// The authoritative set of live objects, indexed by id and by zone.
#[derive(Debug)]
pub struct ObjectDirectory {
    ids: IdAllocator,
    objects: BTreeMap<DoId, NetworkObject>,
    by_zone: BTreeMap<ZoneId, BTreeSet<DoId>>,
}

impl Default for ObjectDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectDirectory {
    pub fn new() -> Self {
        Self {
            // 16-bit pool starting at 1; ids are recycled, so wire-level
            // doIds stay small. 0 is reserved as a never-valid id.
            ids: IdAllocator::with_base(1, 0xFFFF),
            objects: BTreeMap::new(),
            by_zone: BTreeMap::new(),
        }
    }

    /// Allocates an id and registers the object under its zone.
    pub fn insert(
        &mut self,
        class_id: u16,
        zone_id: ZoneId,
        owner: Option<ConnId>,
        fields: Vec<FieldValue>,
    ) -> Result<DoId, PoolExhausted> {
        let do_id = DoId(self.ids.allocate()?);
        self.objects.insert(
            do_id,
            NetworkObject {
                do_id,
                zone_id,
                class_id,
                owner,
                fields,
            },
        );
        self.by_zone.entry(zone_id).or_default().insert(do_id);
        Ok(do_id)
    }

    /// Removes the object, unindexes it, and frees its id.
    pub fn remove(&mut self, do_id: DoId) -> Option<NetworkObject> {
        let obj = self.objects.remove(&do_id)?;
        if let Some(set) = self.by_zone.get_mut(&obj.zone_id) {
            set.remove(&do_id);
            if set.is_empty() {
                self.by_zone.remove(&obj.zone_id);
            }
        }
        self.ids.free(do_id.0);
        Some(obj)
    }

    /// Moves an object to a new zone, reindexing it. Returns the old zone.
    pub fn set_zone(&mut self, do_id: DoId, zone_id: ZoneId) -> Option<ZoneId> {
        let obj = self.objects.get_mut(&do_id)?;
        let old = obj.zone_id;
        if old == zone_id {
            return Some(old);
        }
        obj.zone_id = zone_id;
        if let Some(set) = self.by_zone.get_mut(&old) {
            set.remove(&do_id);
            if set.is_empty() {
                self.by_zone.remove(&old);
            }
        }
        self.by_zone.entry(zone_id).or_default().insert(do_id);
        Some(old)
    }

    pub fn get(&self, do_id: DoId) -> Option<&NetworkObject> {
        self.objects.get(&do_id)
    }

    pub fn get_mut(&mut self, do_id: DoId) -> Option<&mut NetworkObject> {
        self.objects.get_mut(&do_id)
    }

    pub fn contains(&self, do_id: DoId) -> bool {
        self.objects.contains_key(&do_id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Iterates live objects in id order.
    pub fn iter(&self) -> impl Iterator<Item = &NetworkObject> {
        self.objects.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NetworkObject> {
        self.objects.values_mut()
    }

    /// Objects currently registered in `zone`, in id order.
    pub fn objects_in_zone(&self, zone: ZoneId) -> impl Iterator<Item = &NetworkObject> {
        self.by_zone
            .get(&zone)
            .into_iter()
            .flatten()
            .filter_map(|id| self.objects.get(id))
    }

    /// Zones that currently contain at least one object.
    pub fn occupied_zones(&self) -> impl Iterator<Item = ZoneId> + '_ {
        self.by_zone.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dist_shared::schema::FieldValue;

    fn fields() -> Vec<FieldValue> {
        vec![FieldValue::Float(0.0)]
    }

    #[test]
    fn ids_stay_unique_across_churn() {
        let mut dir = ObjectDirectory::new();
        let mut live = BTreeSet::new();
        for round in 0..50u32 {
            let id = dir.insert(1, ZoneId(round % 3), None, fields()).unwrap();
            assert!(live.insert(id), "allocator reissued a live id");
            if round % 2 == 1 {
                let victim = *live.iter().next().unwrap();
                dir.remove(victim).unwrap();
                live.remove(&victim);
            }
        }
        assert_eq!(dir.len(), live.len());
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        let mut ids = IdAllocator::new(2);
        assert!(ids.allocate().is_ok());
        assert!(ids.allocate().is_ok());
        assert!(ids.allocate().is_ok());
        assert!(ids.allocate().is_err());
        ids.free(1);
        assert_eq!(ids.allocate().unwrap(), 1);
    }

    #[test]
    fn empty_zone_entries_are_dropped() {
        let mut dir = ObjectDirectory::new();
        let id = dir.insert(1, ZoneId(100), None, fields()).unwrap();
        assert_eq!(dir.occupied_zones().count(), 1);
        dir.remove(id).unwrap();
        assert_eq!(dir.occupied_zones().count(), 0);
    }

    #[test]
    fn set_zone_reindexes() {
        let mut dir = ObjectDirectory::new();
        let id = dir.insert(1, ZoneId(100), None, fields()).unwrap();
        assert_eq!(dir.set_zone(id, ZoneId(200)), Some(ZoneId(100)));
        assert_eq!(dir.objects_in_zone(ZoneId(100)).count(), 0);
        assert_eq!(dir.objects_in_zone(ZoneId(200)).count(), 1);
        assert_eq!(dir.get(id).unwrap().zone_id, ZoneId(200));
    }
}
