//! HTTP front door (C10, §6): `GET /`, `GET /help`, `POST /run/<op_name>`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::info;

use mce_core::dispatcher::OPERATION_HELP;
use mce_core::types::Envelope;

use crate::actor::ActorHandle;

#[derive(Clone)]
pub struct AppState {
    pub actor: Arc<ActorHandle>,
    pub version: &'static str,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/help", get(help))
        .route("/run/:op_name", post(run_operation))
        .with_state(state)
}

async fn root(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, format!("MCE web application serving. version={}\n", state.version))
}

async fn help() -> impl IntoResponse {
    let body = OPERATION_HELP
        .iter()
        .map(|op| format!("{}\n    {}\n", op.signature, op.doc))
        .collect::<Vec<_>>()
        .join("\n");
    (StatusCode::OK, body)
}

async fn run_operation(State(state): State<AppState>, Path(op_name): Path<String>, body: axum::body::Bytes) -> Response {
    let parsed: Result<serde_json::Value, _> = if body.is_empty() {
        Ok(serde_json::json!({}))
    } else {
        serde_json::from_slice(&body)
    };

    let payload = match parsed {
        Ok(serde_json::Value::Object(map)) => serde_json::Value::Object(map),
        Ok(_) => return framework_error(StatusCode::BAD_REQUEST, "request body must be a JSON object"),
        Err(e) => return framework_error(StatusCode::BAD_REQUEST, &format!("invalid JSON body: {e}")),
    };

    info!(op_name = %op_name, "dispatching operation");
    let envelope = state.actor.submit(op_name, payload).await;
    (StatusCode::OK, Json(envelope)).into_response()
}

fn framework_error(status: StatusCode, msg: &str) -> Response {
    (status, Json(Envelope::framework_error(msg))).into_response()
}
