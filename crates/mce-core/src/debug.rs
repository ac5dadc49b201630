//! Ad-hoc debug sandbox (C9): runs an arbitrary snippet against a fresh
//! namespace (with the same importer/kernel functions artifact code gets),
//! capturing anything written to `sys.stdout`.
//!
//! The original implementation forks a child process per debug call; this
//! engine has one persistent VM actor thread and no process to fork, so the
//! sandbox instead runs in a throwaway namespace on that same thread (§4.9).
//! Isolation from persisted artifacts is namespace-level, not process-level.

use std::cell::RefCell;
use std::rc::Rc;

use rustpython_vm::{function::FuncArgs, PyResult, VirtualMachine};

use crate::artifact::inject_kernel_surface;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::evaluator;
use crate::vm::{repr, PyValue};

pub struct DebugOutput {
    pub stdout: String,
    pub result: Option<serde_json::Value>,
}

/// Executes `source` with `kwargs` bound as locals, returning captured stdout
/// plus the value of a trailing bare expression, if any (mirrors
/// `python_expr` evaluation: the snippet is compiled in `exec` mode, with a
/// best-effort fallback to `eval` mode when it is a single expression).
pub fn run(engine: &Rc<Engine>, source: &str, kwargs: Vec<(String, PyValue)>) -> Result<DebugOutput, EngineError> {
    evaluator::with_bound_evaluator(engine.registry.clone(), engine.vm.clone(), || run_inner(engine, source, kwargs))
}

fn run_inner(engine: &Rc<Engine>, source: &str, kwargs: Vec<(String, PyValue)>) -> Result<DebugOutput, EngineError> {
    let namespace = engine.vm.new_namespace();
    let captured = Rc::new(RefCell::new(String::new()));

    engine.vm.enter(|py| {
        inject_kernel_surface(py, &engine.vm, &engine.registry, &namespace);
        redirect_stdout(py, captured.clone());
        for (k, v) in &kwargs {
            let obj = engine.vm.to_py_object(py, v);
            namespace.dict.set_item(k.as_str(), obj, py).expect("dict set_item never fails for str keys");
        }
    });

    let result = engine.vm.enter(|py| -> Result<Option<PyValue>, EngineError> {
        match py.compile(source, rustpython_vm::compiler::Mode::Eval, "<debug>".to_string()) {
            Ok(code) => {
                let value = engine.vm.eval_expr(py, code, &namespace, &[], "<debug>")?;
                Ok(Some(value))
            }
            Err(_) => {
                let code = engine.vm.compile_exec(py, source, "<debug>")?;
                engine.vm.exec_namespace(py, code, &namespace, "<debug>")?;
                Ok(None)
            }
        }
    });

    let stdout = captured.borrow().clone();
    match result {
        Ok(value) => Ok(DebugOutput {
            stdout,
            result: value.map(|v| render_debug_value(engine, &v)),
        }),
        Err(e) => Err(e),
    }
}

fn render_debug_value(engine: &Rc<Engine>, value: &PyValue) -> serde_json::Value {
    match value {
        PyValue::None => serde_json::Value::Null,
        PyValue::Bool(b) => serde_json::json!(b),
        PyValue::Int(i) => serde_json::json!(i),
        PyValue::Float(f) => serde_json::json!(f),
        PyValue::Str(s) => serde_json::json!(s),
        PyValue::Tuple(items) | PyValue::Set(items) => serde_json::json!(items.iter().map(|v| render_debug_value(engine, v)).collect::<Vec<_>>()),
        PyValue::Object(obj) => engine.vm.enter(|py| serde_json::json!(repr(py, obj))),
    }
}

/// Replaces `sys.stdout` with a minimal write-only object whose `write`
/// method appends to `buffer` instead of the process's real stdout.
fn redirect_stdout(vm: &VirtualMachine, buffer: Rc<RefCell<String>>) {
    let write = vm.new_function(
        "write",
        move |args: FuncArgs, inner_vm: &VirtualMachine| -> PyResult<rustpython_vm::PyObjectRef> {
            let text = args
                .args
                .first()
                .ok_or_else(|| inner_vm.new_type_error("write() takes one argument".to_string()))?
                .str(inner_vm)?;
            let s = text.as_str();
            buffer.borrow_mut().push_str(s);
            Ok(inner_vm.ctx.new_int(s.len()).into())
        },
    );
    let flush = vm.new_function("flush", |_args: FuncArgs, inner_vm: &VirtualMachine| -> PyResult<rustpython_vm::PyObjectRef> { Ok(inner_vm.ctx.none()) });

    // A Python module doubles as a minimal writable namespace with get_attr/set_attr.
    let writer = vm.new_module("<debug-stdout>", vm.ctx.new_dict(), None);
    let _ = writer.set_attr("write", write, vm);
    let _ = writer.set_attr("flush", flush, vm);
    let _ = vm.sys_module.set_attr("stdout", writer, vm);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ArtifactDef;

    #[test]
    fn debug_snippet_can_call_coe() {
        let engine = Rc::new(Engine::init_in_memory().unwrap());
        engine
            .registry
            .add(ArtifactDef {
                object_id: "inc".to_string(),
                python_expr: "x + 1".to_string(),
                ..Default::default()
            })
            .unwrap();

        let output = run(&engine, "coe('inc', x=41)", Vec::new()).unwrap();
        assert!(matches!(output.result, Some(serde_json::Value::Number(ref n)) if n.as_i64() == Some(42)));
    }

    #[test]
    fn debug_snippet_captures_stdout() {
        let engine = Rc::new(Engine::init_in_memory().unwrap());
        let output = run(&engine, "print('hi')", Vec::new()).unwrap();
        assert_eq!(output.stdout, "hi\n");
    }

    #[test]
    fn debug_snippet_binds_kwargs() {
        let engine = Rc::new(Engine::init_in_memory().unwrap());
        let output = run(&engine, "x * 2", vec![("x".to_string(), PyValue::Int(21))]).unwrap();
        assert!(matches!(output.result, Some(serde_json::Value::Number(ref n)) if n.as_i64() == Some(42)));
    }
}
