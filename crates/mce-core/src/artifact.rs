//! Artifact (C3): a definition plus its lazily materialized namespace and
//! optional private cache.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use rustpython_vm::{function::FuncArgs, PyObjectRef, PyResult, VirtualMachine};

use crate::cache::LruTtlCache;
use crate::error::{EngineError, EngineResult};
use crate::evaluator;
use crate::registry::Registry;
use crate::types::ArtifactDef;
use crate::vm::{PyNamespace, PyValue, PyVm};

/// In-memory wrapper around a persisted [`ArtifactDef`].
pub struct Artifact {
    def: ArtifactDef,
    namespace: RefCell<Option<PyNamespace>>,
    cache: Option<LruTtlCache>,
}

impl Artifact {
    pub fn new(def: ArtifactDef) -> Self {
        let cache = if def.has_cache() {
            Some(LruTtlCache::new(def.lru_maxsize, def.ttl_seconds))
        } else {
            None
        };
        Self {
            def,
            namespace: RefCell::new(None),
            cache,
        }
    }

    pub fn def(&self) -> &ArtifactDef {
        &self.def
    }

    pub fn cache(&self) -> Option<&LruTtlCache> {
        self.cache.as_ref()
    }

    /// Materializes the namespace on first access (under the namespace
    /// cell's borrow, which is exclusive since everything runs on the single
    /// VM actor thread) and evaluates `python_expr` against it.
    pub fn evaluate(&self, vm: &Rc<PyVm>, registry: &Rc<Registry>, kwargs: &[(String, PyValue)]) -> EngineResult<PyValue> {
        let namespace = self.namespace(vm, registry)?;
        vm.enter(|py| {
            let code = vm.compile_eval(py, &self.def.python_expr, &self.def.object_id)?;
            vm.eval_expr(py, code, &namespace, kwargs, &self.def.object_id)
        })
    }

    /// Returns the materialized namespace, building it on first access.
    pub fn namespace(&self, vm: &Rc<PyVm>, registry: &Rc<Registry>) -> EngineResult<PyNamespace> {
        if let Some(ns) = self.namespace.borrow().as_ref() {
            return Ok(ns.clone());
        }
        let ns = build_namespace(vm, registry, &self.def)?;
        *self.namespace.borrow_mut() = Some(ns.clone());
        Ok(ns)
    }

    /// Discards a materialized namespace, e.g. when the registry replaces
    /// this artifact's definition via `set`.
    pub fn invalidate_namespace(&self) {
        *self.namespace.borrow_mut() = None;
    }

    /// Parameter discovery (§4.3): names loaded by `python_expr` that are
    /// neither assigned within it nor already bound in the namespace.
    pub fn get_params(&self, vm: &Rc<PyVm>, registry: &Rc<Registry>) -> EngineResult<Vec<String>> {
        let namespace = self.namespace(vm, registry)?;
        let bound: HashSet<String> = vm.enter(|py| namespace_keys(py, &namespace));

        let loaded = parse_loaded_and_assigned(&self.def.python_expr).map_err(|message| EngineError::CompileError {
            object_id: self.def.object_id.clone(),
            message,
        })?;

        let mut params: Vec<String> = loaded
            .loaded
            .into_iter()
            .filter(|n| !loaded.assigned.contains(n) && !bound.contains(n) && n != "locals")
            .collect();
        params.sort();
        Ok(params)
    }
}

fn namespace_keys(_vm: &VirtualMachine, namespace: &PyNamespace) -> HashSet<String> {
    let mut keys = HashSet::new();
    for (key, _value) in &*namespace.dict {
        if let Some(s) = key.downcast_ref::<rustpython_vm::builtins::PyStr>() {
            keys.insert(s.as_str().to_string());
        }
    }
    keys
}

struct LoadedAssigned {
    loaded: HashSet<String>,
    assigned: HashSet<String>,
}

/// Statically parses `expr` and collects Load-context names vs. Store-context
/// (assignment target) names, mirroring an `ast.walk` over the expression.
fn parse_loaded_and_assigned(expr: &str) -> Result<LoadedAssigned, String> {
    use rustpython_parser::{ast, Parse};

    let parsed = ast::Expr::parse(expr, "<expr>").map_err(|e| e.to_string())?;

    let mut loaded = HashSet::new();
    let mut assigned = HashSet::new();
    walk_expr(&parsed, &mut loaded, &mut assigned);
    Ok(LoadedAssigned { loaded, assigned })
}

fn walk_expr(expr: &rustpython_parser::ast::Expr, loaded: &mut HashSet<String>, assigned: &mut HashSet<String>) {
    use rustpython_parser::ast::Expr;
    match expr {
        Expr::Name(n) => {
            loaded.insert(n.id.as_str().to_string());
        }
        Expr::NamedExpr(n) => {
            if let Expr::Name(target) = n.target.as_ref() {
                assigned.insert(target.id.as_str().to_string());
            }
            walk_expr(&n.value, loaded, assigned);
        }
        Expr::Call(c) => {
            walk_expr(&c.func, loaded, assigned);
            for a in &c.args {
                walk_expr(a, loaded, assigned);
            }
            for kw in &c.keywords {
                walk_expr(&kw.value, loaded, assigned);
            }
        }
        Expr::BinOp(b) => {
            walk_expr(&b.left, loaded, assigned);
            walk_expr(&b.right, loaded, assigned);
        }
        Expr::UnaryOp(u) => walk_expr(&u.operand, loaded, assigned),
        Expr::BoolOp(b) => {
            for v in &b.values {
                walk_expr(v, loaded, assigned);
            }
        }
        Expr::Compare(c) => {
            walk_expr(&c.left, loaded, assigned);
            for v in &c.comparators {
                walk_expr(v, loaded, assigned);
            }
        }
        Expr::List(l) => {
            for e in &l.elts {
                walk_expr(e, loaded, assigned);
            }
        }
        Expr::Tuple(t) => {
            for e in &t.elts {
                walk_expr(e, loaded, assigned);
            }
        }
        Expr::Dict(d) => {
            for k in d.keys.iter().flatten() {
                walk_expr(k, loaded, assigned);
            }
            for v in &d.values {
                walk_expr(v, loaded, assigned);
            }
        }
        Expr::Subscript(s) => {
            walk_expr(&s.value, loaded, assigned);
            walk_expr(&s.slice, loaded, assigned);
        }
        Expr::Attribute(a) => walk_expr(&a.value, loaded, assigned),
        Expr::IfExp(i) => {
            walk_expr(&i.test, loaded, assigned);
            walk_expr(&i.body, loaded, assigned);
            walk_expr(&i.orelse, loaded, assigned);
        }
        Expr::ListComp(lc) => walk_expr(&lc.elt, loaded, assigned),
        _ => {}
    }
}

/// Builds a fresh namespace dict, injects the cross-artifact importers and
/// kernel functions (§4.3), and executes `python_code` against it.
fn build_namespace(vm: &Rc<PyVm>, registry: &Rc<Registry>, def: &ArtifactDef) -> EngineResult<PyNamespace> {
    let namespace = vm.new_namespace();

    vm.enter(|py| inject_kernel_surface(py, vm, registry, &namespace));

    if !def.python_code.trim().is_empty() {
        vm.enter(|py| {
            let code = vm.compile_exec(py, &def.python_code, &def.object_id)?;
            vm.exec_namespace(py, code, &namespace, &def.object_id)
        })?;
    }

    Ok(namespace)
}

/// Injects `import_code`/`from_import_code`/`coe`/`calc_object_execute` into
/// `namespace` — the kernel-function surface every artifact namespace and the
/// debug sandbox (§4.8) both get.
pub(crate) fn inject_kernel_surface(py: &VirtualMachine, vm: &Rc<PyVm>, registry: &Rc<Registry>, namespace: &PyNamespace) {
    inject_import_code(py, vm, registry, namespace);
    inject_from_import_code(py, vm, registry, namespace);
    inject_kernel_funcs(py, vm, registry, namespace);
}

/// Mirrors the source's `partial(self.import_code, self.__globals)`: the
/// caller's own namespace is bound into the closure at injection time, not
/// passed as an argument, so artifact code just calls `import_code(co_id)`.
fn inject_import_code(py: &VirtualMachine, vm: &Rc<PyVm>, registry: &Rc<Registry>, namespace: &PyNamespace) {
    let vm_h = vm.clone();
    let registry_h = registry.clone();
    let caller_dict = namespace.dict.clone();
    let func = py.new_function(
        "import_code",
        move |args: FuncArgs, inner_vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let object_id: String = arg_str(&args, 0, inner_vm)?;
            let alias: Option<String> = arg_opt_str(&args, 1, inner_vm);

            let target = registry_h.get(&object_id).map_err(|e| inner_vm.new_runtime_error(e.to_string()))?;
            let target_ns = target.namespace(&vm_h, &registry_h).map_err(|e| inner_vm.new_runtime_error(e.to_string()))?;

            let binding_name = alias.unwrap_or(object_id);
            caller_dict.set_item(binding_name.as_str(), target_ns.dict.into(), inner_vm)?;
            Ok(inner_vm.ctx.none())
        },
    );
    namespace.dict.set_item("import_code", func, py).expect("namespace dict set_item never fails for str keys");
}

fn inject_from_import_code(py: &VirtualMachine, vm: &Rc<PyVm>, registry: &Rc<Registry>, namespace: &PyNamespace) {
    let vm_h = vm.clone();
    let registry_h = registry.clone();
    let caller_dict = namespace.dict.clone();
    let func = py.new_function(
        "from_import_code",
        move |args: FuncArgs, inner_vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let object_id: String = arg_str(&args, 0, inner_vm)?;
            let target = registry_h.get(&object_id).map_err(|e| inner_vm.new_runtime_error(e.to_string()))?;
            let target_ns = target.namespace(&vm_h, &registry_h).map_err(|e| inner_vm.new_runtime_error(e.to_string()))?;

            // Positional names after `object_id` are imported as-is; keyword
            // args rename `old=new` (old read from the callee, bound as new
            // in the caller) — mirrors `from_import_code(co_id, *args, **kwargs)`.
            let positional_names: Vec<String> = args.args.iter().skip(1).filter_map(|o| o.str(inner_vm).ok()).map(|s| s.as_str().to_string()).collect();

            if positional_names.is_empty() && args.kwargs.is_empty() {
                for (k, v) in &*target_ns.dict {
                    let key = k.str(inner_vm)?.as_str().to_string();
                    caller_dict.set_item(key.as_str(), v.clone(), inner_vm)?;
                }
            } else {
                for name in &positional_names {
                    if let Ok(v) = target_ns.dict.get_item(name.as_str(), inner_vm) {
                        caller_dict.set_item(name.as_str(), v, inner_vm)?;
                    }
                }
                for (old_name, new_name_value) in &args.kwargs {
                    let new_name = new_name_value.str(inner_vm)?;
                    if let Ok(v) = target_ns.dict.get_item(old_name.as_str(), inner_vm) {
                        caller_dict.set_item(new_name.as_str(), v, inner_vm)?;
                    }
                }
            }
            Ok(inner_vm.ctx.none())
        },
    );
    namespace.dict.set_item("from_import_code", func, py).expect("namespace dict set_item never fails for str keys");
}

fn inject_kernel_funcs(py: &VirtualMachine, vm: &Rc<PyVm>, _registry: &Rc<Registry>, namespace: &PyNamespace) {
    for name in ["calc_object_execute", "coe"] {
        let vm_h = vm.clone();
        let func = py.new_function(
            name,
            move |args: FuncArgs, inner_vm: &VirtualMachine| -> PyResult<PyObjectRef> {
                let object_id: String = arg_str(&args, 0, inner_vm)?;
                let kwargs: Vec<(String, PyValue)> = args
                    .kwargs
                    .iter()
                    .map(|(k, v)| (k.clone(), vm_h.to_py_value(inner_vm, v)))
                    .collect();

                let ev = evaluator::current().expect("coe called outside a bound evaluator");
                let result = ev.eval(&object_id, kwargs).map_err(|e| inner_vm.new_runtime_error(e.to_string()))?;
                Ok(vm_h.to_py_object(inner_vm, &result))
            },
        );
        namespace
            .dict
            .set_item(name, func, py)
            .expect("namespace dict set_item never fails for str keys");
    }
}

fn arg_str(args: &FuncArgs, idx: usize, vm: &VirtualMachine) -> PyResult<String> {
    args.args
        .get(idx)
        .ok_or_else(|| vm.new_type_error(format!("expected argument at position {idx}")))?
        .str(vm)
        .map(|s| s.as_str().to_string())
}

fn arg_opt_str(args: &FuncArgs, idx: usize, vm: &VirtualMachine) -> Option<String> {
    args.args.get(idx).filter(|o| !vm.is_none(o)).and_then(|o| o.str(vm).ok()).map(|s| s.as_str().to_string())
}
