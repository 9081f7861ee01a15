//! HTTP management API
//!
//! RESTful transport over the controller operations. Every reply uses the
//! `{success, data, error}` envelope; error kinds map onto status codes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{ControllerError, ErrorKind, Result};
use crate::metadata::{NodeId, NodeRole, SlotRange};
use crate::Controller;

/// HTTP API service
pub struct HttpApi {
    controller: Arc<Controller>,
}

impl HttpApi {
    pub fn new(controller: Arc<Controller>) -> Self {
        Self { controller }
    }

    pub fn router(self) -> Router {
        let controller = self.controller;
        let cluster = "/api/v1/namespaces/:ns/clusters/:cluster";

        Router::new()
            .route("/api/v1/leader", get(get_leader))
            // namespaces
            .route("/api/v1/namespaces", get(list_namespaces).post(create_namespace))
            .route("/api/v1/namespaces/:ns", delete(delete_namespace))
            // clusters
            .route(
                "/api/v1/namespaces/:ns/clusters",
                get(list_clusters).post(create_cluster),
            )
            .route(cluster, get(get_cluster).delete(delete_cluster))
            .route(&format!("{cluster}/migrate"), post(migrate))
            // shards
            .route(
                &format!("{cluster}/shards"),
                get(list_shards).post(create_shard),
            )
            .route(
                &format!("{cluster}/shards/:shard"),
                get(get_shard).delete(delete_shard),
            )
            .route(&format!("{cluster}/shards/:shard/failover"), post(failover))
            .route(
                &format!("{cluster}/shards/:shard/migration/abort"),
                post(abort_migration),
            )
            // nodes
            .route(
                &format!("{cluster}/shards/:shard/nodes"),
                get(list_nodes).post(create_node),
            )
            .route(
                &format!("{cluster}/shards/:shard/nodes/:node"),
                delete(delete_node),
            )
            .route(
                &format!("{cluster}/nodes/:node/observations"),
                post(record_observation),
            )
            .with_state(controller)
    }
}

// ==================== Response types ====================

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

impl ApiResponse<()> {
    fn err(msg: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        })
    }
}

pub fn status_of(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Contention => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::LockLost => StatusCode::MISDIRECTED_REQUEST,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(err: ControllerError) -> Response {
    (status_of(err.kind()), ApiResponse::err(err.to_string())).into_response()
}

fn reply<T: Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(data) => ApiResponse::ok(data).into_response(),
        Err(e) => failure(e),
    }
}

fn created<T: Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(data) => (StatusCode::CREATED, ApiResponse::ok(data)).into_response(),
        Err(e) => failure(e),
    }
}

// ==================== Request types ====================

#[derive(Deserialize)]
struct CreateNamespaceRequest {
    name: String,
}

#[derive(Deserialize)]
struct CreateClusterRequest {
    name: String,
    nodes: Vec<String>,
    #[serde(default)]
    replicas: usize,
    password: Option<String>,
}

#[derive(Deserialize)]
struct CreateShardRequest {
    nodes: Vec<String>,
    password: Option<String>,
}

#[derive(Deserialize)]
struct CreateNodeRequest {
    addr: String,
    /// master, replica or slave
    role: String,
    password: Option<String>,
}

#[derive(Deserialize)]
struct MigrateRequest {
    target: usize,
    /// "100" or "100-200"
    slot: String,
    #[serde(default)]
    slot_only: bool,
}

#[derive(Deserialize, Default)]
struct FailoverBody {
    preferred_node_id: Option<NodeId>,
}

#[derive(Deserialize)]
struct ObservationRequest {
    observer: String,
    down: bool,
}

#[derive(Serialize)]
struct ShardCreated {
    index: usize,
}

#[derive(Serialize)]
struct FailoverDone {
    new_master_id: NodeId,
}

// ==================== Handlers ====================

async fn get_leader(State(controller): State<Arc<Controller>>) -> Response {
    reply(controller.leader_info().await)
}

// Namespaces
async fn list_namespaces(State(controller): State<Arc<Controller>>) -> Response {
    reply(controller.list_namespaces().await)
}

async fn create_namespace(
    State(controller): State<Arc<Controller>>,
    Json(req): Json<CreateNamespaceRequest>,
) -> Response {
    created(controller.create_namespace(&req.name).await)
}

async fn delete_namespace(
    State(controller): State<Arc<Controller>>,
    Path(ns): Path<String>,
) -> Response {
    reply(controller.delete_namespace(&ns).await)
}

// Clusters
async fn list_clusters(
    State(controller): State<Arc<Controller>>,
    Path(ns): Path<String>,
) -> Response {
    reply(controller.list_clusters(&ns).await)
}

async fn create_cluster(
    State(controller): State<Arc<Controller>>,
    Path(ns): Path<String>,
    Json(req): Json<CreateClusterRequest>,
) -> Response {
    created(
        controller
            .create_cluster(&ns, &req.name, &req.nodes, req.replicas, req.password)
            .await,
    )
}

async fn get_cluster(
    State(controller): State<Arc<Controller>>,
    Path((ns, cluster)): Path<(String, String)>,
) -> Response {
    reply(controller.get_cluster(&ns, &cluster).await)
}

async fn delete_cluster(
    State(controller): State<Arc<Controller>>,
    Path((ns, cluster)): Path<(String, String)>,
) -> Response {
    reply(controller.delete_cluster(&ns, &cluster).await)
}

async fn migrate(
    State(controller): State<Arc<Controller>>,
    Path((ns, cluster)): Path<(String, String)>,
    Json(req): Json<MigrateRequest>,
) -> Response {
    let range: SlotRange = match req.slot.parse() {
        Ok(range) => range,
        Err(e) => return failure(e),
    };
    reply(
        controller
            .migrate(&ns, &cluster, req.target, range, req.slot_only)
            .await,
    )
}

// Shards
async fn list_shards(
    State(controller): State<Arc<Controller>>,
    Path((ns, cluster)): Path<(String, String)>,
) -> Response {
    reply(controller.list_shards(&ns, &cluster).await)
}

async fn create_shard(
    State(controller): State<Arc<Controller>>,
    Path((ns, cluster)): Path<(String, String)>,
    Json(req): Json<CreateShardRequest>,
) -> Response {
    created(
        controller
            .create_shard(&ns, &cluster, &req.nodes, req.password)
            .await
            .map(|index| ShardCreated { index }),
    )
}

async fn get_shard(
    State(controller): State<Arc<Controller>>,
    Path((ns, cluster, shard)): Path<(String, String, usize)>,
) -> Response {
    reply(controller.get_shard(&ns, &cluster, shard).await)
}

async fn delete_shard(
    State(controller): State<Arc<Controller>>,
    Path((ns, cluster, shard)): Path<(String, String, usize)>,
) -> Response {
    reply(controller.delete_shard(&ns, &cluster, shard).await)
}

async fn failover(
    State(controller): State<Arc<Controller>>,
    Path((ns, cluster, shard)): Path<(String, String, usize)>,
    body: Option<Json<FailoverBody>>,
) -> Response {
    let Json(body) = body.unwrap_or_default();
    reply(
        controller
            .failover(&ns, &cluster, shard, body.preferred_node_id)
            .await
            .map(|new_master_id| FailoverDone { new_master_id }),
    )
}

async fn abort_migration(
    State(controller): State<Arc<Controller>>,
    Path((ns, cluster, shard)): Path<(String, String, usize)>,
) -> Response {
    reply(controller.abort_migration(&ns, &cluster, shard).await)
}

// Nodes
async fn list_nodes(
    State(controller): State<Arc<Controller>>,
    Path((ns, cluster, shard)): Path<(String, String, usize)>,
) -> Response {
    reply(controller.list_nodes(&ns, &cluster, shard).await)
}

async fn create_node(
    State(controller): State<Arc<Controller>>,
    Path((ns, cluster, shard)): Path<(String, String, usize)>,
    Json(req): Json<CreateNodeRequest>,
) -> Response {
    let role: NodeRole = match req.role.parse() {
        Ok(role) => role,
        Err(e) => return failure(e),
    };
    created(
        controller
            .create_node(&ns, &cluster, shard, &req.addr, role, req.password)
            .await,
    )
}

async fn delete_node(
    State(controller): State<Arc<Controller>>,
    Path((ns, cluster, shard, node)): Path<(String, String, usize, String)>,
) -> Response {
    reply(controller.delete_node(&ns, &cluster, shard, &node).await)
}

async fn record_observation(
    State(controller): State<Arc<Controller>>,
    Path((ns, cluster, node)): Path<(String, String, String)>,
    Json(req): Json<ObservationRequest>,
) -> Response {
    created(
        controller
            .record_observation(&ns, &cluster, &node, &req.observer, req.down)
            .await,
    )
}
