//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the engine returns [`EngineError`]. The HTTP
//! dispatcher renders any variant as `{code:-1, msg:<text>, data:null}`; it
//! never forwards a Rust panic message to a client.

use thiserror::Error;

/// Unified error type for the computation engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// `object_id` is not present in the registry.
    #[error("artifact not found: {object_id}")]
    NotFound { object_id: String },

    /// The caller supplied a malformed request (non-object body, unknown
    /// operation arguments, wrong argument types).
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// `python_code` or `python_expr` failed to compile.
    #[error("compile error in artifact {object_id}: {message}")]
    CompileError { object_id: String, message: String },

    /// A compiled artifact raised during execution.
    #[error("evaluation error in artifact {object_id}: {message}")]
    EvaluationError { object_id: String, message: String },

    /// The persistent catalog store failed.
    #[error("storage error: {0}")]
    StorageError(String),

    /// `POST /run/<op_name>` named an operation the dispatcher does not know.
    #[error("unknown operation: {0}")]
    DispatchError(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::StorageError(e.to_string())
    }
}
