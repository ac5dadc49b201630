//! In-memory artifact registry (C4) plus catalog sync against the store
//! (C7). Owns the canonical `Rc<Artifact>` handles every other module
//! borrows from.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::artifact::Artifact;
use crate::error::{EngineError, EngineResult};
use crate::store::{QueryFilter, Store};
use crate::types::ArtifactDef;

pub struct Registry {
    store: Rc<Store>,
    artifacts: RefCell<HashMap<String, Rc<Artifact>>>,
}

impl Registry {
    /// Loads every row from `store` into memory (§4.4).
    pub fn load(store: Rc<Store>) -> EngineResult<Self> {
        let registry = Self {
            store,
            artifacts: RefCell::new(HashMap::new()),
        };
        registry.reload()?;
        Ok(registry)
    }

    pub fn get(&self, object_id: &str) -> EngineResult<Rc<Artifact>> {
        self.artifacts
            .borrow()
            .get(object_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound {
                object_id: object_id.to_string(),
            })
    }

    pub fn exists(&self, object_id: &str) -> bool {
        self.artifacts.borrow().contains_key(object_id)
    }

    pub fn query(&self, filter: &QueryFilter) -> EngineResult<Vec<ArtifactDef>> {
        self.store.query(filter)
    }

    /// Persists a new artifact and makes it visible in the registry.
    pub fn add(&self, def: ArtifactDef) -> EngineResult<ArtifactDef> {
        let saved = self.store.insert(def)?;
        self.artifacts
            .borrow_mut()
            .insert(saved.object_id.clone(), Rc::new(Artifact::new(saved.clone())));
        Ok(saved)
    }

    /// Replaces an existing artifact's definition. The old namespace and
    /// cache are dropped — both are derived from `python_code`/knobs that may
    /// have just changed (§4.3 Invariant 2: a namespace is only ever
    /// materialized once *per Artifact instance*, so a redefinition needs a
    /// fresh instance).
    pub fn update(&self, object_id: &str, def: ArtifactDef) -> EngineResult<ArtifactDef> {
        let saved = self.store.update_by_id(object_id, def)?;
        self.artifacts
            .borrow_mut()
            .insert(saved.object_id.clone(), Rc::new(Artifact::new(saved.clone())));
        Ok(saved)
    }

    pub fn delete(&self, object_id: &str) -> EngineResult<()> {
        self.store.delete_by_id(object_id)?;
        self.artifacts.borrow_mut().remove(object_id);
        Ok(())
    }

    /// Clears the in-memory registry and rebuilds it from the store, picking
    /// up any out-of-band catalog edits.
    pub fn reload(&self) -> EngineResult<()> {
        let defs = self.store.load_all()?;
        let mut map = HashMap::with_capacity(defs.len());
        for def in defs {
            map.insert(def.object_id.clone(), Rc::new(Artifact::new(def)));
        }
        *self.artifacts.borrow_mut() = map;
        Ok(())
    }

    /// Clears every artifact's private cache in place, without touching
    /// namespaces or the persisted catalog.
    pub fn clear_cache(&self) {
        for artifact in self.artifacts.borrow().values() {
            if let Some(cache) = artifact.cache() {
                cache.clear();
            }
        }
    }

    /// A point-in-time snapshot of every live artifact handle, for the cache
    /// janitor (C6) to sweep without holding the registry borrow for the
    /// whole pass.
    pub fn artifacts_snapshot(&self) -> Vec<Rc<Artifact>> {
        self.artifacts.borrow().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.artifacts.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> ArtifactDef {
        ArtifactDef {
            object_id: id.to_string(),
            python_expr: "1 + 1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn add_then_get_succeeds() {
        let store = Rc::new(Store::open_in_memory().unwrap());
        let registry = Registry::load(store).unwrap();
        registry.add(sample("a")).unwrap();
        assert!(registry.exists("a"));
        registry.get("a").unwrap();
    }

    #[test]
    fn get_missing_is_not_found() {
        let store = Rc::new(Store::open_in_memory().unwrap());
        let registry = Registry::load(store).unwrap();
        let err = registry.get("missing").unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[test]
    fn delete_removes_from_registry_and_store() {
        let store = Rc::new(Store::open_in_memory().unwrap());
        let registry = Registry::load(store).unwrap();
        registry.add(sample("a")).unwrap();
        registry.delete("a").unwrap();
        assert!(!registry.exists("a"));
    }

    #[test]
    fn reload_picks_up_out_of_band_store_changes() {
        let store = Rc::new(Store::open_in_memory().unwrap());
        let registry = Registry::load(store.clone()).unwrap();
        assert!(registry.is_empty());
        store.insert(sample("a")).unwrap();
        registry.reload().unwrap();
        assert!(registry.exists("a"));
    }
}
