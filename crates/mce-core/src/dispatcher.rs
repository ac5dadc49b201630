//! Operation dispatcher (C8): maps the named operations the HTTP front door
//! exposes onto the engine's core functions, always returning an [`Envelope`]
//! rather than a raw [`EngineError`] so the HTTP layer never has to branch on
//! success vs. failure shape.

use std::rc::Rc;

use serde_json::json;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::store::QueryFilter;
use crate::types::{ArtifactDef, Envelope};
use crate::vm::PyValue;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Every operation name `POST /run/<op_name>` may route to (§4.7, §6).
pub const OPERATIONS: &[&str] = &[
    "get_version",
    "add",
    "delete",
    "update",
    "query",
    "get_params",
    "execute",
    "trace",
    "debug",
    "reload",
    "clear_cache",
];

/// One operation's signature and docstring, for `GET /help` (§6: "signature
/// + docstring" per operation, mirroring the original rendering each
/// exposed function's real `__doc__`).
pub struct OperationHelp {
    pub name: &'static str,
    pub signature: &'static str,
    pub doc: &'static str,
}

pub const OPERATION_HELP: &[OperationHelp] = &[
    OperationHelp {
        name: "get_version",
        signature: "get_version()",
        doc: "Returns the engine's version string.",
    },
    OperationHelp {
        name: "add",
        signature: "add(object_id, python_code='', python_expr='', ...)",
        doc: "Persists a new artifact and adds it to the registry. Fails if object_id already exists.",
    },
    OperationHelp {
        name: "delete",
        signature: "delete(object_id)",
        doc: "Removes an artifact from the registry and the persistent catalog.",
    },
    OperationHelp {
        name: "update",
        signature: "update(object_id, python_code='', python_expr='', ...)",
        doc: "Replaces an existing artifact's definition, invalidating its materialized namespace.",
    },
    OperationHelp {
        name: "query",
        signature: "query(object_id=None, custom_tag=None, parent_id=None)",
        doc: "Lists catalog entries matching any combination of the given filters.",
    },
    OperationHelp {
        name: "get_params",
        signature: "get_params(object_id)",
        doc: "Returns the names python_expr reads that are neither assigned within it nor already bound in the namespace.",
    },
    OperationHelp {
        name: "execute",
        signature: "execute(object_id, **kwargs)",
        doc: "Evaluates an artifact's python_expr with kwargs bound as locals, using the per-artifact and per-invocation caches.",
    },
    OperationHelp {
        name: "trace",
        signature: "trace(object_id, **kwargs)",
        doc: "Evaluates an artifact like execute, additionally returning the call tree of every coe() invocation along the way.",
    },
    OperationHelp {
        name: "debug",
        signature: "debug(source, **kwargs)",
        doc: "Runs an ad-hoc snippet with the same importer/kernel functions as artifact code, returning captured stdout and the value of a trailing expression, if any.",
    },
    OperationHelp {
        name: "reload",
        signature: "reload()",
        doc: "Rebuilds the in-memory registry from the persistent catalog, picking up out-of-band edits.",
    },
    OperationHelp {
        name: "clear_cache",
        signature: "clear_cache()",
        doc: "Clears every artifact's private result cache without touching namespaces or the catalog.",
    },
];

/// Dispatches `op_name` against `body`, producing the response envelope.
/// Unknown operations are a framework-level error (§6); everything else that
/// goes wrong inside a known operation is a dispatcher-level error.
pub fn dispatch(engine: &Rc<Engine>, op_name: &str, body: serde_json::Value) -> Envelope {
    if !OPERATIONS.contains(&op_name) {
        warn!(op_name, "unknown operation");
        return Envelope::framework_error(format!("unknown operation: {op_name}"));
    }

    let result = run(engine, op_name, body);
    match result {
        Ok(data) => post_process(engine, data),
        Err(e) => {
            info!(op_name, error = %e, "operation failed");
            Envelope::dispatch_error(e.to_string())
        }
    }
}

/// If the registry has an artifact named `api_json_encoder`, runs the
/// envelope's `data` through it before returning — lets deployments customize
/// response shaping without touching this crate (§4.7).
fn post_process(engine: &Rc<Engine>, data: serde_json::Value) -> Envelope {
    if !engine.registry.exists("api_json_encoder") {
        return Envelope::ok(data);
    }
    let kwargs = vec![("data".to_string(), PyValue::Str(data.to_string()))];
    match engine.evaluate("api_json_encoder", kwargs) {
        Ok(PyValue::Str(s)) => match serde_json::from_str(&s) {
            Ok(encoded) => Envelope::ok(encoded),
            Err(_) => Envelope::ok(json!(s)),
        },
        Ok(_) | Err(_) => Envelope::ok(data),
    }
}

fn run(engine: &Rc<Engine>, op_name: &str, body: serde_json::Value) -> Result<serde_json::Value, EngineError> {
    match op_name {
        "get_version" => Ok(json!({ "version": VERSION })),
        "add" => {
            let def: ArtifactDef = parse(body)?;
            let saved = engine.registry.add(def)?;
            Ok(serde_json::to_value(saved).expect("ArtifactDef serializes"))
        }
        "delete" => {
            let object_id = require_str(&body, "object_id")?;
            engine.registry.delete(&object_id)?;
            Ok(json!({ "object_id": object_id }))
        }
        "update" => {
            let object_id = require_str(&body, "object_id")?;
            let def: ArtifactDef = parse(body)?;
            let saved = engine.registry.update(&object_id, def)?;
            Ok(serde_json::to_value(saved).expect("ArtifactDef serializes"))
        }
        "query" => {
            let filter = QueryFilter {
                object_id: optional_str(&body, "object_id"),
                custom_tag: optional_str(&body, "custom_tag"),
                parent_id: optional_str(&body, "parent_id"),
            };
            let defs = engine.registry.query(&filter)?;
            Ok(serde_json::to_value(defs).expect("Vec<ArtifactDef> serializes"))
        }
        "get_params" => {
            let object_id = require_str(&body, "object_id")?;
            let artifact = engine.registry.get(&object_id)?;
            let params = artifact.get_params(&engine.vm, &engine.registry)?;
            Ok(json!({ "params": params }))
        }
        "execute" => {
            let object_id = require_str(&body, "object_id")?;
            let kwargs = parse_kwargs(&body, &["object_id"])?;
            let result = engine.evaluate(&object_id, kwargs)?;
            Ok(json!({ "result": render(engine, &result) }))
        }
        "trace" => {
            let object_id = require_str(&body, "object_id")?;
            let kwargs = parse_kwargs(&body, &["object_id"])?;
            let (records, _temp) = engine.trace(&object_id, kwargs)?;
            let rendered: Vec<_> = records
                .iter()
                .map(|r| {
                    json!({
                        "sn": r.sn,
                        "object_id": r.object_id,
                        "params": r.params.iter().map(|(k, v)| (k.clone(), render(engine, v))).collect::<serde_json::Map<_, _>>(),
                        "result_key": r.result_key,
                        "spend_time_secs": r.spend_time_secs,
                        "parent_sn": r.parent_sn,
                    })
                })
                .collect();
            Ok(json!({ "trace": rendered }))
        }
        "debug" => {
            let source = require_str(&body, "source")?;
            let kwargs = parse_kwargs(&body, &["source"])?;
            let output = crate::debug::run(engine, &source, kwargs)?;
            Ok(json!({ "stdout": output.stdout, "result": output.result }))
        }
        "reload" => {
            engine.registry.reload()?;
            Ok(json!({ "count": engine.registry.len() }))
        }
        "clear_cache" => {
            engine.registry.clear_cache();
            Ok(json!({}))
        }
        _ => unreachable!("validated by OPERATIONS above"),
    }
}

fn render(engine: &Rc<Engine>, value: &PyValue) -> serde_json::Value {
    match value {
        PyValue::None => serde_json::Value::Null,
        PyValue::Bool(b) => json!(b),
        PyValue::Int(i) => json!(i),
        PyValue::Float(f) => json!(f),
        PyValue::Str(s) => json!(s),
        PyValue::Tuple(items) | PyValue::Set(items) => json!(items.iter().map(|v| render(engine, v)).collect::<Vec<_>>()),
        PyValue::Object(obj) => engine.vm.enter(|py| json!(crate::vm::repr(py, obj))),
    }
}

fn parse<T: serde::de::DeserializeOwned>(body: serde_json::Value) -> Result<T, EngineError> {
    serde_json::from_value(body).map_err(|e| EngineError::BadArgument(e.to_string()))
}

fn require_str(body: &serde_json::Value, field: &str) -> Result<String, EngineError> {
    body.get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| EngineError::BadArgument(format!("missing required field: {field}")))
}

fn optional_str(body: &serde_json::Value, field: &str) -> Option<String> {
    body.get(field).and_then(|v| v.as_str()).map(str::to_string)
}

/// Forwards every body field except `reserved` (the operation's own named
/// arguments, e.g. `object_id`) as an ordered `(name, PyValue)` kwarg list —
/// the body itself is the kwargs, mirroring `exec_api(func_name, **kwargs)`
/// forwarding the whole request payload. Only JSON scalars and arrays of
/// scalars are accepted; an object value (a rich Python object) cannot be
/// constructed from JSON, by design.
fn parse_kwargs(body: &serde_json::Value, reserved: &[&str]) -> Result<Vec<(String, PyValue)>, EngineError> {
    let Some(obj) = body.as_object() else {
        return Ok(Vec::new());
    };
    obj.iter()
        .filter(|(k, _)| !reserved.contains(&k.as_str()))
        .map(|(k, v)| Ok((k.clone(), json_to_pyvalue(v)?)))
        .collect()
}

fn json_to_pyvalue(v: &serde_json::Value) -> Result<PyValue, EngineError> {
    Ok(match v {
        serde_json::Value::Null => PyValue::None,
        serde_json::Value::Bool(b) => PyValue::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                PyValue::Int(i)
            } else if let Some(f) = n.as_f64() {
                PyValue::Float(f)
            } else {
                return Err(EngineError::BadArgument(format!("unsupported number: {n}")));
            }
        }
        serde_json::Value::String(s) => PyValue::Str(s.clone()),
        serde_json::Value::Array(items) => {
            let converted: Result<Vec<PyValue>, EngineError> = items.iter().map(json_to_pyvalue).collect();
            PyValue::Tuple(converted?)
        }
        serde_json::Value::Object(_) => return Err(EngineError::BadArgument("object-valued kwargs are not supported".into())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ArtifactDef;

    #[test]
    fn execute_forwards_flat_body_fields_as_kwargs() {
        let engine = Rc::new(Engine::init_in_memory().unwrap());
        engine
            .registry
            .add(ArtifactDef {
                object_id: "inc".to_string(),
                python_expr: "x + 1".to_string(),
                ..Default::default()
            })
            .unwrap();

        let envelope = dispatch(&engine, "execute", json!({ "object_id": "inc", "x": 41 }));
        assert_eq!(envelope.code, 0);
        assert_eq!(envelope.data.unwrap()["result"], json!(42));
    }

    #[test]
    fn unknown_operation_is_framework_error() {
        let engine = Rc::new(Engine::init_in_memory().unwrap());
        let envelope = dispatch(&engine, "nonexistent", json!({}));
        assert_ne!(envelope.code, 0);
    }
}
