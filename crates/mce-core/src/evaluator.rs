//! Per-invocation evaluation context (C5) — the heart of the engine.
//!
//! An [`Evaluator`] is created fresh for each top-level `execute`/`trace`
//! call and threaded explicitly through every *Rust-level* recursive call
//! (`Evaluator::eval` calling itself via `Registry`/`Artifact`). The one
//! boundary where explicit argument passing is impossible is the `coe` /
//! `calc_object_execute` kernel function: it is invoked by the embedded
//! interpreter's own calling convention, with no channel to thread a Rust
//! argument through. Since exactly one OS thread ever executes artifact code
//! (the VM actor thread owns the whole process's evaluation), a single
//! thread-local slot — populated only at top-level entry/exit — stands in
//! for that missing argument, mirroring the source's thread-identity-keyed
//! evaluator table without needing one slot per thread.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use crate::error::EngineResult;
use crate::fingerprint::Fingerprint;
use crate::registry::Registry;
use crate::vm::{PyValue, PyVm};

thread_local! {
    static CURRENT_EVALUATOR: RefCell<Option<Rc<Evaluator>>> = const { RefCell::new(None) };
}

/// One entry in a trace's call tree.
#[derive(Clone, Debug)]
pub struct TraceRecord {
    pub sn: String,
    pub object_id: String,
    pub params: Vec<(String, PyValue)>,
    pub result_key: String,
    pub spend_time_secs: f64,
    pub parent_sn: String,
}

/// Per-top-level-invocation context: a temp memo, an optional trace recorder,
/// and a synthetic call stack for assigning parent/child serial numbers.
pub struct Evaluator {
    registry: Rc<Registry>,
    vm: Rc<PyVm>,
    is_trace: bool,
    temp_cache: RefCell<HashMap<Fingerprint, PyValue>>,
    trace_info: RefCell<Vec<TraceRecord>>,
    serial_counter: RefCell<u64>,
    call_stack: RefCell<Vec<String>>,
}

impl Evaluator {
    fn new(registry: Rc<Registry>, vm: Rc<PyVm>, is_trace: bool) -> Self {
        Self {
            registry,
            vm,
            is_trace,
            temp_cache: RefCell::new(HashMap::new()),
            trace_info: RefCell::new(Vec::new()),
            serial_counter: RefCell::new(0),
            call_stack: RefCell::new(vec![String::new()]),
        }
    }

    /// Top-level per-call dispatch (§4.5): traced calls always go through
    /// `eval_traced` so a trace entry is recorded even on a memo hit;
    /// untraced calls go straight to the memo check.
    pub fn eval(&self, object_id: &str, kwargs: Vec<(String, PyValue)>) -> EngineResult<PyValue> {
        let fp = Fingerprint::new(object_id, &kwargs);
        if self.is_trace {
            self.eval_traced(object_id, &fp, kwargs)
        } else {
            self.eval_memoized(object_id, &fp, kwargs)
        }
    }

    /// Per-invocation memo, then per-artifact cache with a lock held across
    /// compute-and-put to avoid a thundering herd.
    fn eval_memoized(&self, object_id: &str, fp: &Fingerprint, kwargs: Vec<(String, PyValue)>) -> EngineResult<PyValue> {
        if let Some(v) = self.temp_cache.borrow().get(fp) {
            return Ok(v.clone());
        }
        let value = self.eval_inner(object_id, fp, kwargs)?;
        self.temp_cache.borrow_mut().insert(fp.clone(), value.clone());
        Ok(value)
    }

    /// Wraps `eval_memoized` with call-tree bookkeeping. Always appends a
    /// `TraceRecord`, whether the call was freshly computed or served from
    /// the temp memo — mirroring the source, which records in the public
    /// `eval`'s finally block and does the memo check one level deeper.
    fn eval_traced(&self, object_id: &str, fp: &Fingerprint, kwargs: Vec<(String, PyValue)>) -> EngineResult<PyValue> {
        let sn = {
            let mut counter = self.serial_counter.borrow_mut();
            let sn = format!("sn-{counter}");
            *counter += 1;
            sn
        };
        let parent_sn = self.call_stack.borrow().last().cloned().unwrap_or_default();
        self.call_stack.borrow_mut().push(sn.clone());

        let start = Instant::now();
        let recorded_params = kwargs.clone();
        let result = self.eval_memoized(object_id, fp, kwargs);
        let spend_time_secs = start.elapsed().as_secs_f64();

        self.call_stack.borrow_mut().pop();
        self.trace_info.borrow_mut().push(TraceRecord {
            sn,
            object_id: object_id.to_string(),
            params: recorded_params,
            result_key: format!("{fp:?}"),
            spend_time_secs,
            parent_sn,
        });

        result
    }

    fn eval_inner(&self, object_id: &str, fp: &Fingerprint, kwargs: Vec<(String, PyValue)>) -> EngineResult<PyValue> {
        let artifact = self.registry.get(object_id)?;
        match artifact.cache() {
            None => artifact.evaluate(&self.vm, &self.registry, &kwargs),
            Some(cache) => {
                if let Some(v) = cache.get(fp) {
                    return Ok(v);
                }
                cache.with_lock(|locked| -> EngineResult<PyValue> {
                    if let Some(v) = locked.get(fp) {
                        return Ok(v);
                    }
                    let v = artifact.evaluate(&self.vm, &self.registry, &kwargs)?;
                    locked.put(fp.clone(), v.clone());
                    Ok(v)
                })
            }
        }
    }

    pub fn trace_info(&self) -> Vec<TraceRecord> {
        self.trace_info.borrow().clone()
    }

    pub fn temp_cache_snapshot(&self) -> HashMap<Fingerprint, PyValue> {
        self.temp_cache.borrow().clone()
    }
}

/// Top-level entry for `execute`/`get_params`/the `coe` kernel function.
/// Reuses the thread-local evaluator if one is already bound (a nested call
/// arriving back through the dispatcher), otherwise creates, binds, runs, and
/// unbinds one.
pub fn evaluate(registry: Rc<Registry>, vm: Rc<PyVm>, object_id: &str, kwargs: Vec<(String, PyValue)>) -> EngineResult<PyValue> {
    if let Some(ev) = current() {
        return ev.eval(object_id, kwargs);
    }
    let ev = Rc::new(Evaluator::new(registry, vm, false));
    bind(ev.clone());
    let result = ev.eval(object_id, kwargs);
    unbind();
    result
}

/// Top-level entry for `trace`. Always runs a fresh Evaluator — it does not
/// reuse one already bound — but still publishes itself to the thread-local
/// slot for the duration of the call so nested `coe` invocations route to it.
pub fn trace(
    registry: Rc<Registry>,
    vm: Rc<PyVm>,
    object_id: &str,
    kwargs: Vec<(String, PyValue)>,
) -> EngineResult<(Vec<TraceRecord>, HashMap<Fingerprint, PyValue>)> {
    let ev = Rc::new(Evaluator::new(registry, vm, true));
    let previous = CURRENT_EVALUATOR.with(|c| c.borrow_mut().replace(ev.clone()));
    let result = ev.eval(object_id, kwargs);
    CURRENT_EVALUATOR.with(|c| *c.borrow_mut() = previous);
    result.map(|_| (ev.trace_info(), ev.temp_cache_snapshot()))
}

/// Called by the `coe` / `calc_object_execute` kernel function closure.
pub fn current() -> Option<Rc<Evaluator>> {
    CURRENT_EVALUATOR.with(|c| c.borrow().clone())
}

/// Binds a fresh Evaluator for the duration of `f` if none is already bound,
/// so a `coe`/`calc_object_execute` call inside `f` has a context to route
/// through. Used by the debug sandbox (§4.8), which injects the same kernel
/// functions as artifact code but is not itself an `evaluate`/`trace` call.
pub(crate) fn with_bound_evaluator<T>(registry: Rc<Registry>, vm: Rc<PyVm>, f: impl FnOnce() -> T) -> T {
    if current().is_some() {
        return f();
    }
    let ev = Rc::new(Evaluator::new(registry, vm, false));
    bind(ev);
    let result = f();
    unbind();
    result
}

fn bind(ev: Rc<Evaluator>) {
    CURRENT_EVALUATOR.with(|c| *c.borrow_mut() = Some(ev));
}

fn unbind() {
    CURRENT_EVALUATOR.with(|c| *c.borrow_mut() = None);
}
