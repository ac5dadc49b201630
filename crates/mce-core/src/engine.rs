//! Top-level engine: wires the VM, registry, and store together and exposes
//! the handful of entry points the dispatcher and janitor loop need.

use std::rc::Rc;
use std::time::Duration;

use crate::error::EngineResult;
use crate::evaluator::{self, TraceRecord};
use crate::fingerprint::Fingerprint;
use crate::registry::Registry;
use crate::store::Store;
use crate::vm::{PyValue, PyVm};

pub struct Engine {
    pub vm: Rc<PyVm>,
    pub registry: Rc<Registry>,
    pub store: Rc<Store>,
    pub check_interval: Duration,
}

impl Engine {
    /// Opens the store at `db_path`, loads the catalog into the registry, and
    /// brings up a fresh VM. Must be called on, and the returned `Engine`
    /// must only ever be used from, the VM actor thread.
    pub fn init(db_path: &str, check_interval: Duration) -> EngineResult<Self> {
        let store = Rc::new(Store::open(db_path)?);
        let registry = Rc::new(Registry::load(store.clone())?);
        let vm = Rc::new(PyVm::new());
        Ok(Self {
            vm,
            registry,
            store,
            check_interval,
        })
    }

    #[cfg(test)]
    pub fn init_in_memory() -> EngineResult<Self> {
        let store = Rc::new(Store::open_in_memory()?);
        let registry = Rc::new(Registry::load(store.clone())?);
        let vm = Rc::new(PyVm::new());
        Ok(Self {
            vm,
            registry,
            store,
            check_interval: Duration::from_secs(crate::janitor::DEFAULT_CHECK_INTERVAL_SECS),
        })
    }

    pub fn evaluate(&self, object_id: &str, kwargs: Vec<(String, PyValue)>) -> EngineResult<PyValue> {
        evaluator::evaluate(self.registry.clone(), self.vm.clone(), object_id, kwargs)
    }

    pub fn trace(&self, object_id: &str, kwargs: Vec<(String, PyValue)>) -> EngineResult<(Vec<TraceRecord>, std::collections::HashMap<Fingerprint, PyValue>)> {
        evaluator::trace(self.registry.clone(), self.vm.clone(), object_id, kwargs)
    }

    /// Runs one janitor sweep (§C6); called from the server's periodic tick.
    pub fn sweep_caches(&self) -> usize {
        crate::janitor::sweep_once(&self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ArtifactDef;

    #[test]
    fn evaluate_simple_artifact_expression() {
        let engine = Engine::init_in_memory().unwrap();
        engine
            .registry
            .add(ArtifactDef {
                object_id: "two".to_string(),
                python_expr: "1 + 1".to_string(),
                ..Default::default()
            })
            .unwrap();
        let result = engine.evaluate("two", Vec::new()).unwrap();
        assert!(matches!(result, PyValue::Int(2)));
    }

    #[test]
    fn evaluate_with_kwargs_binds_locals() {
        let engine = Engine::init_in_memory().unwrap();
        engine
            .registry
            .add(ArtifactDef {
                object_id: "inc".to_string(),
                python_expr: "x + 1".to_string(),
                ..Default::default()
            })
            .unwrap();
        let result = engine.evaluate("inc", vec![("x".to_string(), PyValue::Int(41))]).unwrap();
        assert!(matches!(result, PyValue::Int(42)));
    }

    #[test]
    fn nested_artifact_call_via_coe() {
        let engine = Engine::init_in_memory().unwrap();
        engine
            .registry
            .add(ArtifactDef {
                object_id: "double".to_string(),
                python_expr: "x * 2".to_string(),
                ..Default::default()
            })
            .unwrap();
        engine
            .registry
            .add(ArtifactDef {
                object_id: "quadruple".to_string(),
                python_expr: "coe('double', x=coe('double', x=x))".to_string(),
                ..Default::default()
            })
            .unwrap();
        let result = engine.evaluate("quadruple", vec![("x".to_string(), PyValue::Int(3))]).unwrap();
        assert!(matches!(result, PyValue::Int(12)));
    }

    #[test]
    fn cached_artifact_returns_same_value_without_recompute() {
        let engine = Engine::init_in_memory().unwrap();
        engine
            .registry
            .add(ArtifactDef {
                object_id: "counter".to_string(),
                python_code: "calls = [0]".to_string(),
                python_expr: "(calls.__setitem__(0, calls[0] + 1), calls[0])[1]".to_string(),
                lru_maxsize: 4,
                ttl_seconds: 60,
                ..Default::default()
            })
            .unwrap();
        let first = engine.evaluate("counter", Vec::new()).unwrap();
        let second = engine.evaluate("counter", Vec::new()).unwrap();
        assert!(matches!((first, second), (PyValue::Int(a), PyValue::Int(b)) if a == b));
    }

    #[test]
    fn trace_records_nested_calls() {
        let engine = Engine::init_in_memory().unwrap();
        engine
            .registry
            .add(ArtifactDef {
                object_id: "leaf".to_string(),
                python_expr: "1".to_string(),
                ..Default::default()
            })
            .unwrap();
        engine
            .registry
            .add(ArtifactDef {
                object_id: "root".to_string(),
                python_expr: "coe('leaf') + coe('leaf')".to_string(),
                ..Default::default()
            })
            .unwrap();
        let (records, _) = engine.trace("root", Vec::new()).unwrap();
        assert_eq!(records.iter().filter(|r| r.object_id == "leaf").count(), 2);
        assert!(records.iter().any(|r| r.object_id == "root"));
    }
}
