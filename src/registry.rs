//! Tuplespace registry (component C): id -> Engine map with ref-count-aware
//! deletion, grounded on `tscontainer.py`'s `TupleSpaceContainer`.

use crate::engine::Engine;
use crate::error::{Result, TsMeshError};
use crate::ids::{HolderId, TupleSpaceId};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

pub struct Registry {
    spaces: DashMap<TupleSpaceId, Arc<Engine>>,
    /// Serializes "create if absent" so two concurrent `create_tuplespace`
    /// calls for the same id can't both win.
    create_lock: parking_lot::Mutex<()>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            spaces: DashMap::new(),
            create_lock: parking_lot::Mutex::new(()),
        }
    }

    pub fn get(&self, id: TupleSpaceId) -> Option<Arc<Engine>> {
        self.spaces.get(&id).map(|e| e.clone())
    }

    pub fn contains(&self, id: TupleSpaceId) -> bool {
        self.spaces.contains_key(&id)
    }

    /// Creates the tuplespace if it does not already exist; returns the
    /// (possibly pre-existing) engine either way.
    pub fn new_tuplespace(&self, id: TupleSpaceId) -> Arc<Engine> {
        let _guard = self.create_lock.lock();
        if let Some(existing) = self.spaces.get(&id) {
            return existing.clone();
        }
        let engine = Arc::new(Engine::new(id));
        self.spaces.insert(id, engine.clone());
        info!(ts = %id, "tuplespace created");
        engine
    }

    /// Removes one reference from `id`'s engine; deletes the engine if that
    /// was its last reference. Re-checks presence before removing to avoid a
    /// race with a concurrent deletion of the same id.
    pub fn delete_reference(&self, id: TupleSpaceId, holder: HolderId) -> Result<()> {
        let remaining = {
            let engine = self
                .spaces
                .get(&id)
                .ok_or_else(|| TsMeshError::NoSuchTupleSpace(id.to_string()))?;
            engine.remove_reference(holder)?
        };
        if remaining == 0 {
            self.remove_if_still_unreferenced(id);
        }
        Ok(())
    }

    /// Removes every reference `holder` holds across `id`'s engine (used
    /// when a process or node dies); deletes the engine if it becomes
    /// unreferenced.
    pub fn delete_all_references(&self, id: TupleSpaceId, holder: HolderId) {
        let Some(engine) = self.spaces.get(&id).map(|e| e.clone()) else {
            return;
        };
        engine.remove_all_references(holder);
        if engine.refs_snapshot().is_empty() {
            self.remove_if_still_unreferenced(id);
        }
    }

    /// Called by the GC walk (component H) once a clique of tuplespaces is
    /// confirmed unreachable from any root.
    pub fn remove_unreachable(&self, id: TupleSpaceId) {
        if self.spaces.remove(&id).is_some() {
            info!(ts = %id, "tuplespace garbage collected");
        }
    }

    fn remove_if_still_unreferenced(&self, id: TupleSpaceId) {
        let still_empty = self
            .spaces
            .get(&id)
            .map(|e| e.refs_snapshot().is_empty())
            .unwrap_or(false);
        if still_empty && self.spaces.remove(&id).is_some() {
            info!(ts = %id, "tuplespace deleted: no remaining references");
        }
    }

    pub fn ids(&self) -> Vec<TupleSpaceId> {
        self.spaces.iter().map(|e| *e.key()).collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::NodeId;

    fn ts(seq: u64) -> TupleSpaceId {
        TupleSpaceId {
            node: NodeId(1),
            seq,
        }
    }

    #[test]
    fn create_is_idempotent() {
        let reg = Registry::new();
        let a = reg.new_tuplespace(ts(1));
        let b = reg.new_tuplespace(ts(1));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn delete_reference_removes_at_zero() {
        let reg = Registry::new();
        let id = ts(2);
        let engine = reg.new_tuplespace(id);
        let holder = HolderId::Node(NodeId(9));
        engine.add_reference(holder);
        assert!(reg.contains(id));
        reg.delete_reference(id, holder).unwrap();
        assert!(!reg.contains(id));
    }

    #[test]
    fn delete_reference_keeps_if_other_refs_remain() {
        let reg = Registry::new();
        let id = ts(3);
        let engine = reg.new_tuplespace(id);
        let a = HolderId::Node(NodeId(9));
        let b = HolderId::Node(NodeId(10));
        engine.add_reference(a);
        engine.add_reference(b);
        reg.delete_reference(id, a).unwrap();
        assert!(reg.contains(id));
    }

    #[test]
    fn missing_tuplespace_is_an_error() {
        let reg = Registry::new();
        assert!(reg
            .delete_reference(ts(99), HolderId::Node(NodeId(1)))
            .is_err());
    }
}
