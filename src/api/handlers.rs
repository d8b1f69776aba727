//! HTTP route handlers.

use crate::api::middleware::{error_response, Principal};
use crate::api::ApiState;
use crate::meta::Proposal;
use crate::query::ShardQueryRequest;
use crate::store::StoredPoint;
use crate::{Error, ErrorKind};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::debug;

fn json_response<T: Serialize>(status: StatusCode, value: &T, pretty: bool) -> Response {
    let body = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .unwrap_or_else(|_| r#"{"error":"internal error"}"#.to_string());
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

/// Hide internal error details; everything else is reported verbatim.
fn error_message(err: &Error) -> String {
    if err.is_internal() {
        debug!(error = %err, "internal error on request path");
        "internal error".to_string()
    } else {
        err.to_string()
    }
}

fn require_admin(principal: &Principal) -> Result<(), Response> {
    match &principal.0 {
        None => Ok(()),
        Some(user) if user.is_admin() => Ok(()),
        Some(user) => Err(error_response(
            StatusCode::UNAUTHORIZED,
            Error::Unauthorized {
                user: user.name.clone(),
                privilege: "administer",
                database: "*".into(),
            }
            .to_string(),
            false,
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct QueryParams {
    #[serde(default)]
    pub q: String,
    #[serde(default)]
    pub db: String,
    #[serde(default)]
    pub pretty: Option<String>,
}

impl QueryParams {
    fn pretty(&self) -> bool {
        self.pretty.as_deref() == Some("true")
    }
}

/// GET /query — parse and execute a statement list.
pub async fn serve_query(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Query(params): Query<QueryParams>,
) -> Response {
    let pretty = params.pretty();
    match state
        .server
        .executor
        .execute(&params.q, &params.db, principal.0.as_ref())
        .await
    {
        Ok(results) => json_response(StatusCode::OK, &results, pretty),
        Err(e) if e.kind() == ErrorKind::Authorization => {
            error_response(e.status(), error_message(&e), pretty)
        }
        Err(e) => error_response(
            StatusCode::BAD_REQUEST,
            format!("error parsing query: {e}"),
            pretty,
        ),
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct WriteParams {
    #[serde(default)]
    pub pretty: Option<String>,
}

/// POST /write — decode a batch and push it through the write pipeline.
pub async fn serve_write(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Query(params): Query<WriteParams>,
    body: axum::body::Bytes,
) -> Response {
    let pretty = params.pretty.as_deref() == Some("true");
    if body.is_empty() {
        return StatusCode::OK.into_response();
    }
    let batch: crate::write::BatchPoints = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(e) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), pretty)
        }
    };
    match state
        .server
        .pipeline
        .write(principal.0.as_ref(), &batch)
        .await
    {
        Ok(_) => StatusCode::OK.into_response(),
        // The empty-database case predates the error taxonomy and keeps
        // its historical status code.
        Err(e @ Error::DatabaseRequired) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), pretty)
        }
        Err(e) => error_response(e.status(), error_message(&e), pretty),
    }
}

/// GET /ping
pub async fn serve_ping() -> StatusCode {
    StatusCode::NO_CONTENT
}

#[derive(Debug, Serialize)]
struct StatusBody {
    id: u64,
    index: u64,
}

/// GET /status — node id and last applied log index.
pub async fn serve_status(
    State(state): State<ApiState>,
    Query(params): Query<QueryParams>,
) -> Response {
    let body = StatusBody {
        id: state.server.id(),
        index: state.server.index(),
    };
    json_response(StatusCode::OK, &body, params.pretty())
}

/// GET /metastore — streamed catalog snapshot, loadable by a peer.
pub async fn serve_metastore(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
) -> Response {
    if let Err(resp) = require_admin(&principal) {
        return resp;
    }
    match state.server.meta.snapshot() {
        Ok(blob) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/octet-stream"),
                (
                    header::CONTENT_DISPOSITION,
                    r#"attachment; filename="meta""#,
                ),
            ],
            bytes::Bytes::from(blob),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, error_message(&e), false),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DataNodeBody {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub url: String,
}

/// GET /data_nodes
pub async fn list_data_nodes(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
) -> Response {
    if let Err(resp) = require_admin(&principal) {
        return resp;
    }
    let nodes: Vec<DataNodeBody> = state
        .server
        .registry
        .all()
        .into_iter()
        .map(|n| DataNodeBody { id: n.id, url: n.url })
        .collect();
    json_response(StatusCode::OK, &nodes, false)
}

/// POST /data_nodes — register a data node and provision its broker
/// replica.
pub async fn create_data_node(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    body: axum::body::Bytes,
) -> Response {
    if let Err(resp) = require_admin(&principal) {
        return resp;
    }
    let request: DataNodeBody = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string(), false),
    };
    if url::Url::parse(&request.url).is_err() {
        return error_response(StatusCode::BAD_REQUEST, "invalid data node url".into(), false);
    }
    let node = match state.server.registry.register(&request.url).await {
        Ok(node) => node,
        Err(e @ Error::DataNodeExists) => {
            return error_response(StatusCode::CONFLICT, e.to_string(), false)
        }
        Err(e) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, error_message(&e), false)
        }
    };
    if let Err(e) = state.server.create_broker_replica(node.id).await {
        return error_response(StatusCode::BAD_GATEWAY, error_message(&e), false);
    }
    if state.server.is_self(&node) {
        state.server.adopt_identity(&node);
    }
    json_response(
        StatusCode::CREATED,
        &DataNodeBody {
            id: node.id,
            url: node.url,
        },
        false,
    )
}

/// DELETE /data_nodes/:id
pub async fn delete_data_node(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<u64>,
) -> Response {
    if let Err(resp) = require_admin(&principal) {
        return resp;
    }
    match state.server.registry.unregister(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e @ Error::DataNodeNotFound) => {
            error_response(StatusCode::NOT_FOUND, e.to_string(), false)
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, error_message(&e), false),
    }
}

/// POST /process_continuous_queries — run any due continuous queries.
pub async fn process_continuous_queries(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
) -> Response {
    if let Err(resp) = require_admin(&principal) {
        return resp;
    }
    match state.server.cq.process().await {
        Ok(_) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, error_message(&e), false),
    }
}

/// POST /shards/:id/write — replica write from a peer coordinator.
pub async fn shard_write(
    State(state): State<ApiState>,
    Path(shard_id): Path<u64>,
    Json(points): Json<Vec<StoredPoint>>,
) -> Response {
    match state.server.store.write(shard_id, &points).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, error_message(&e), false),
    }
}

/// POST /shards/:id/query — scatter scan from a peer coordinator.
pub async fn shard_query(
    State(state): State<ApiState>,
    Path(shard_id): Path<u64>,
    Json(request): Json<ShardQueryRequest>,
) -> Response {
    match state
        .server
        .store
        .scan(shard_id, &request.measurement, request.range)
        .await
    {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, error_message(&e), false),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ProposeBody {
    index: u64,
}

fn redirect_to_leader(state: &ApiState, suffix: &str) -> Response {
    match state.server.leader_url() {
        Some(leader) => (
            StatusCode::TEMPORARY_REDIRECT,
            [(header::LOCATION, format!("{leader}{suffix}"))],
        )
            .into_response(),
        None => error_response(
            StatusCode::BAD_GATEWAY,
            Error::BrokerUnavailable("leadership unknown".into()).to_string(),
            false,
        ),
    }
}

/// POST /broker/propose — order a proposal (leader only).
pub async fn broker_propose(
    State(state): State<ApiState>,
    Json(proposal): Json<Proposal>,
) -> Response {
    let Some(broker) = state.server.local_broker() else {
        return redirect_to_leader(&state, "/broker/propose");
    };
    match crate::broker::Broker::propose(broker.as_ref(), proposal).await {
        Ok(index) => json_response(StatusCode::OK, &ProposeBody { index }, false),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, error_message(&e), false),
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    #[serde(default = "default_from")]
    pub from: u64,
}

fn default_from() -> u64 {
    1
}

/// Cap on entries returned per poll so responses stay bounded.
const STREAM_CHUNK: usize = 1024;

/// GET /broker/stream?from=N — committed entries from index N.
pub async fn broker_stream(
    State(state): State<ApiState>,
    Query(params): Query<StreamParams>,
) -> Response {
    let Some(broker) = state.server.local_broker() else {
        return redirect_to_leader(&state, "/broker/stream");
    };
    let mut entries = broker.entries_from(params.from);
    entries.truncate(STREAM_CHUNK);
    Json(entries).into_response()
}
