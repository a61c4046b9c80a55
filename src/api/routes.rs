/*
* Proxmox Provisioner API Routes
* ------------------------------
* @project: proxmox-provisioner
*
* The thin HTTP skin over the provisioning engine. Nothing in here decides
* whether a VM is admissible or how its config is spelled; handlers parse,
* call the engine, and wrap whatever comes back in the envelope.
*
* API Endpoints (all under server.api_prefix, bearer token required):
* -----------------------------------------------------------------
* POST   /vms                   - create a VM (direct, or clone when `template` is set)
* GET    /vms                   - raw VM listing for the node
* GET    /vms/{vmid}            - VM status
* DELETE /vms/{vmid}            - delete a VM
* POST   /vms/{vmid}/start      - power on
* POST   /vms/{vmid}/stop       - power off
* POST   /containers            - create a container
* GET    /containers            - raw container listing
* GET    /containers/{ctid}     - container status
* DELETE /containers/{ctid}     - delete a container
* POST   /containers/{ctid}/start
* POST   /containers/{ctid}/stop
* GET    /resources             - catalog snapshot (storage, bridges, media, templates)
* GET    /nodes                 - cluster nodes
* GET    /health                - unauthenticated liveness probe
*
* Every endpoint takes an optional `?node=`; without it the configured
* default node is used. Status codes come from ProvisionError::status_code().
*
* Layers: request tracing, a global concurrency cap and a body size limit.
* The cap is not a rate limiter; a slow cluster still makes requests queue.
*/

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::api::error::ApiResponse;
use crate::api::middleware::require_bearer;
use crate::config::ServerSettings;
use crate::core::lifecycle::{InstanceKind, InstanceLifecycle};
use crate::core::provision::Provisioner;
use crate::core::vm::{ContainerSpec, VmSpec};
use crate::errors::ProvisionError;

#[derive(Clone)]
pub struct AppState {
    pub provisioner: Arc<Provisioner>,
    pub api_token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct NodeQuery {
    pub node: Option<String>,
}

type ApiResult<T> = Result<T, ProvisionError>;

pub fn create_router(state: Arc<AppState>, server: &ServerSettings) -> Router {
    let api = Router::new()
        .route("/vms", post(create_vm).get(list_vms))
        .route("/vms/{vmid}", get(get_vm).delete(delete_vm))
        .route("/vms/{vmid}/start", post(start_vm))
        .route("/vms/{vmid}/stop", post(stop_vm))
        .route("/containers", post(create_container).get(list_containers))
        .route("/containers/{ctid}", get(get_container).delete(delete_container))
        .route("/containers/{ctid}/start", post(start_container))
        .route("/containers/{ctid}/stop", post(stop_container))
        .route("/resources", get(get_resources))
        .route("/nodes", get(list_nodes))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    let prefix = server.api_prefix.trim_end_matches('/');
    let router = if prefix.is_empty() {
        Router::new().merge(api)
    } else {
        Router::new().nest(prefix, api)
    };

    router
        .route("/health", get(health))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(ConcurrencyLimitLayer::new(server.max_concurrent_requests.max(1)))
                .layer(RequestBodyLimitLayer::new(server.body_limit_bytes)),
        )
}

async fn health() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

fn node_of(state: &AppState, query: &NodeQuery) -> String {
    state.provisioner.resolve_node(query.node.as_deref())
}

async fn create_vm(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NodeQuery>,
    Json(mut spec): Json<VmSpec>,
) -> ApiResult<impl IntoResponse> {
    if spec.node.is_none() {
        spec.node = query.node;
    }
    let outcome = state.provisioner.provision_vm(spec).await?;
    Ok((StatusCode::CREATED, ApiResponse::ok(outcome)))
}

async fn list_vms(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NodeQuery>,
) -> ApiResult<impl IntoResponse> {
    let node = node_of(&state, &query);
    let vms = InstanceLifecycle::new(state.provisioner.api())
        .list(&node, InstanceKind::Vm)
        .await?;
    Ok(ApiResponse::ok(vms))
}

async fn get_vm(
    State(state): State<Arc<AppState>>,
    Path(vmid): Path<u32>,
    Query(query): Query<NodeQuery>,
) -> ApiResult<impl IntoResponse> {
    let node = node_of(&state, &query);
    let status = InstanceLifecycle::new(state.provisioner.api())
        .get(&node, InstanceKind::Vm, vmid)
        .await?;
    Ok(ApiResponse::ok(status))
}

async fn delete_vm(
    State(state): State<Arc<AppState>>,
    Path(vmid): Path<u32>,
    Query(query): Query<NodeQuery>,
) -> ApiResult<impl IntoResponse> {
    let node = node_of(&state, &query);
    let result = InstanceLifecycle::new(state.provisioner.api())
        .delete(&node, InstanceKind::Vm, vmid)
        .await?;
    Ok(ApiResponse::ok(result))
}

async fn start_vm(
    State(state): State<Arc<AppState>>,
    Path(vmid): Path<u32>,
    Query(query): Query<NodeQuery>,
) -> ApiResult<impl IntoResponse> {
    let node = node_of(&state, &query);
    let result = InstanceLifecycle::new(state.provisioner.api())
        .start(&node, InstanceKind::Vm, vmid)
        .await?;
    Ok(ApiResponse::ok(result))
}

async fn stop_vm(
    State(state): State<Arc<AppState>>,
    Path(vmid): Path<u32>,
    Query(query): Query<NodeQuery>,
) -> ApiResult<impl IntoResponse> {
    let node = node_of(&state, &query);
    let result = InstanceLifecycle::new(state.provisioner.api())
        .stop(&node, InstanceKind::Vm, vmid)
        .await?;
    Ok(ApiResponse::ok(result))
}

async fn create_container(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NodeQuery>,
    Json(mut spec): Json<ContainerSpec>,
) -> ApiResult<impl IntoResponse> {
    if spec.node.is_none() {
        spec.node = query.node;
    }
    let outcome = state.provisioner.provision_container(spec).await?;
    Ok((StatusCode::CREATED, ApiResponse::ok(outcome)))
}

async fn list_containers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NodeQuery>,
) -> ApiResult<impl IntoResponse> {
    let node = node_of(&state, &query);
    let cts = InstanceLifecycle::new(state.provisioner.api())
        .list(&node, InstanceKind::Container)
        .await?;
    Ok(ApiResponse::ok(cts))
}

async fn get_container(
    State(state): State<Arc<AppState>>,
    Path(ctid): Path<u32>,
    Query(query): Query<NodeQuery>,
) -> ApiResult<impl IntoResponse> {
    let node = node_of(&state, &query);
    let status = InstanceLifecycle::new(state.provisioner.api())
        .get(&node, InstanceKind::Container, ctid)
        .await?;
    Ok(ApiResponse::ok(status))
}

async fn delete_container(
    State(state): State<Arc<AppState>>,
    Path(ctid): Path<u32>,
    Query(query): Query<NodeQuery>,
) -> ApiResult<impl IntoResponse> {
    let node = node_of(&state, &query);
    let result = InstanceLifecycle::new(state.provisioner.api())
        .delete(&node, InstanceKind::Container, ctid)
        .await?;
    Ok(ApiResponse::ok(result))
}

async fn start_container(
    State(state): State<Arc<AppState>>,
    Path(ctid): Path<u32>,
    Query(query): Query<NodeQuery>,
) -> ApiResult<impl IntoResponse> {
    let node = node_of(&state, &query);
    let result = InstanceLifecycle::new(state.provisioner.api())
        .start(&node, InstanceKind::Container, ctid)
        .await?;
    Ok(ApiResponse::ok(result))
}

async fn stop_container(
    State(state): State<Arc<AppState>>,
    Path(ctid): Path<u32>,
    Query(query): Query<NodeQuery>,
) -> ApiResult<impl IntoResponse> {
    let node = node_of(&state, &query);
    let result = InstanceLifecycle::new(state.provisioner.api())
        .stop(&node, InstanceKind::Container, ctid)
        .await?;
    Ok(ApiResponse::ok(result))
}

async fn get_resources(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NodeQuery>,
) -> ApiResult<impl IntoResponse> {
    let node = node_of(&state, &query);
    let catalog = state.provisioner.fetch_catalog(&node).await?;
    Ok(ApiResponse::ok(catalog))
}

async fn list_nodes(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let nodes = state.provisioner.api().nodes().await?;
    Ok(ApiResponse::ok(nodes))
}
