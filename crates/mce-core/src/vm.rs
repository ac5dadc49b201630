//! Embedded RustPython VM lifecycle and the host/Python value bridge.
//!
//! Unlike a per-call VM, this engine keeps a single [`PyVm`] alive for the
//! whole process: artifact namespaces are long-lived Python scopes, so the
//! interpreter that owns them must persist too. Because RustPython's
//! `Interpreter` cannot cross OS thread boundaries, `PyVm` is `!Send` and is
//! meant to live on exactly one dedicated thread (see
//! `mce-server`'s actor module).

use rustpython_vm::{
    builtins::{PyCode, PyDict},
    compiler::Mode,
    scope::Scope,
    Interpreter, PyObjectRef, PyRef, PyResult, VirtualMachine,
};

use crate::compile_cache::{CompileCache, CompileMode};
use crate::error::EngineError;

pub type CodeRef = PyRef<PyCode>;

/// A host-side materialized Python value.
///
/// Scalar variants participate in [`Fingerprint`](crate::fingerprint::Fingerprint)
/// by value; [`PyValue::Object`] is the fallback for lists, dicts, and any
/// user-defined type, which fingerprint by identity instead.
#[derive(Clone, Debug)]
pub enum PyValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<PyValue>),
    Set(Vec<PyValue>),
    Object(PyObjectRef),
}

impl PyValue {
    pub fn get_id(&self) -> usize {
        match self {
            PyValue::Object(obj) => obj.get_id(),
            _ => 0,
        }
    }
}

/// A long-lived, attribute-accessible artifact namespace: a Python dict used
/// as both the `globals` and `locals` of its artifact's compiled body.
#[derive(Clone)]
pub struct PyNamespace {
    pub dict: PyRef<PyDict>,
}

/// Owns the single process-wide RustPython interpreter plus the compiled-code
/// memo (C2). Not `Send`: must only ever be touched from the VM actor thread.
pub struct PyVm {
    interp: Interpreter,
    compiled: CompileCache<CodeRef>,
}

impl PyVm {
    pub fn new() -> Self {
        let inner = Interpreter::with_init(rustpython_vm::Settings::default(), |vm| {
            vm.add_native_modules(rustpython_stdlib::get_module_inits());
        });
        Self {
            interp: inner,
            compiled: CompileCache::from_env(),
        }
    }

    /// Runs `f` with access to the `VirtualMachine`. All artifact namespace
    /// materialization and evaluation goes through this.
    pub fn enter<R>(&self, f: impl FnOnce(&VirtualMachine) -> R) -> R {
        self.interp.enter(f)
    }

    pub fn new_namespace(&self) -> PyNamespace {
        self.enter(|vm| PyNamespace {
            dict: vm.ctx.new_dict(),
        })
    }

    /// Compiles `source` as a module body (`exec` mode), via the compile
    /// cache keyed on `(source, artifact_id, Exec)`.
    pub fn compile_exec(&self, vm: &VirtualMachine, source: &str, artifact_id: &str) -> Result<CodeRef, EngineError> {
        self.compiled
            .get_or_compile(source, artifact_id, CompileMode::Exec, || {
                vm.compile(source, Mode::Exec, format!("<artifact:{artifact_id}>"))
                    .map_err(|e| e.to_string())
            })
            .map_err(|message| EngineError::CompileError {
                object_id: artifact_id.to_string(),
                message,
            })
    }

    /// Compiles `source` as a single expression (`eval` mode).
    pub fn compile_eval(&self, vm: &VirtualMachine, source: &str, artifact_id: &str) -> Result<CodeRef, EngineError> {
        self.compiled
            .get_or_compile(source, artifact_id, CompileMode::Eval, || {
                vm.compile(source, Mode::Eval, format!("<artifact:{artifact_id}>.expr"))
                    .map_err(|e| e.to_string())
            })
            .map_err(|message| EngineError::CompileError {
                object_id: artifact_id.to_string(),
                message,
            })
    }

    /// Executes a compiled module body with `namespace` as both globals and
    /// locals, mutating it in place.
    pub fn exec_namespace(
        &self,
        vm: &VirtualMachine,
        code: CodeRef,
        namespace: &PyNamespace,
        artifact_id: &str,
    ) -> Result<(), EngineError> {
        let scope = Scope::new(None, namespace.dict.clone());
        vm.run_code_obj(code, scope)
            .map(|_| ())
            .map_err(|exc| extract_evaluation_error(vm, exc, artifact_id))
    }

    /// Evaluates a compiled expression with globals=`namespace`, locals=`kwargs`.
    pub fn eval_expr(
        &self,
        vm: &VirtualMachine,
        code: CodeRef,
        namespace: &PyNamespace,
        kwargs: &[(String, PyValue)],
        artifact_id: &str,
    ) -> Result<PyValue, EngineError> {
        let locals = vm.ctx.new_dict();
        for (k, v) in kwargs {
            let obj = self.to_py_object(vm, v);
            locals
                .set_item(k.as_str(), obj, vm)
                .expect("dict set_item never fails for str keys");
        }
        let scope = Scope::new(Some(locals), namespace.dict.clone());
        let result = vm
            .run_code_obj(code, scope)
            .map_err(|exc| extract_evaluation_error(vm, exc, artifact_id))?;
        Ok(self.to_py_value(vm, &result))
    }

    /// Converts a [`PyValue`] into a live RustPython object.
    pub fn to_py_object(&self, vm: &VirtualMachine, value: &PyValue) -> PyObjectRef {
        match value {
            PyValue::None => vm.ctx.none(),
            PyValue::Bool(b) => vm.ctx.new_bool(*b).into(),
            PyValue::Int(i) => vm.ctx.new_int(*i).into(),
            PyValue::Float(f) => vm.ctx.new_float(*f).into(),
            PyValue::Str(s) => vm.ctx.new_str(s.as_str()).into(),
            PyValue::Tuple(items) => {
                let objs: Vec<PyObjectRef> = items.iter().map(|v| self.to_py_object(vm, v)).collect();
                vm.ctx.new_tuple(objs).into()
            }
            PyValue::Set(items) => {
                let objs: Vec<PyObjectRef> = items.iter().map(|v| self.to_py_object(vm, v)).collect();
                vm.ctx.new_tuple(objs).into()
            }
            PyValue::Object(obj) => obj.clone(),
        }
    }

    /// Classifies a live RustPython object into a [`PyValue`], by value for
    /// the scalar-ish types the fingerprint cares about, by reference
    /// otherwise.
    pub fn to_py_value(&self, vm: &VirtualMachine, obj: &PyObjectRef) -> PyValue {
        use rustpython_vm::convert::ToPyObject;
        let _ = ToPyObject::to_pyobject; // keep trait in scope for downstream extension
        if vm.is_none(obj) {
            return PyValue::None;
        }
        if let Some(b) = obj.downcast_ref::<rustpython_vm::builtins::PyInt>() {
            if let Some(i) = b.as_bigint().to_i64() {
                return PyValue::Int(i);
            }
        }
        if let Some(f) = obj.downcast_ref::<rustpython_vm::builtins::PyFloat>() {
            return PyValue::Float(f.to_f64());
        }
        if let Some(s) = obj.downcast_ref::<rustpython_vm::builtins::PyStr>() {
            return PyValue::Str(s.as_str().to_string());
        }
        if let Some(t) = obj.downcast_ref::<rustpython_vm::builtins::PyTuple>() {
            let items = t.as_slice().iter().map(|o| self.to_py_value(vm, o)).collect();
            return PyValue::Tuple(items);
        }
        PyValue::Object(obj.clone())
    }
}

impl Default for PyVm {
    fn default() -> Self {
        Self::new()
    }
}

fn extract_evaluation_error(
    vm: &VirtualMachine,
    exc: rustpython_vm::builtins::PyBaseExceptionRef,
    artifact_id: &str,
) -> EngineError {
    let message = exc
        .as_object()
        .str(vm)
        .map(|s| s.as_str().to_owned())
        .unwrap_or_else(|_| "unknown runtime error".to_owned());

    let mut traceback = String::new();
    let _ = vm.write_exception(&mut traceback, &exc);

    EngineError::EvaluationError {
        object_id: artifact_id.to_string(),
        message: if traceback.is_empty() {
            message
        } else {
            format!("{message}\n{traceback}")
        },
    }
}

trait BigIntExt {
    fn to_i64(&self) -> Option<i64>;
}

impl BigIntExt for num_bigint::BigInt {
    fn to_i64(&self) -> Option<i64> {
        use num_traits::ToPrimitive;
        ToPrimitive::to_i64(self)
    }
}

/// Used by the debug sandbox (C9) and `get_params`'s caller-facing errors to
/// render a value for display.
pub fn repr(vm: &VirtualMachine, obj: &PyObjectRef) -> String {
    obj.repr(vm)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| "<unreprable>".to_string())
}
