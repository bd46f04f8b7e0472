//! Registry API handlers
//!
//! Thin translation layer: validate the wire request, call the registry
//! façade, map error kinds onto HTTP status codes. No registry semantics
//! live here.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info};

use fleetmap_registry::{Agent, Relay, RegistryError};

use crate::models::*;
use crate::AppState;

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Register a relay (idempotent; refreshes an existing entry)
#[utoipa::path(
    post,
    path = "/api/relays",
    request_body = RegisterRelayRequest,
    responses(
        (status = 204, description = "Relay registered"),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "relays"
)]
pub async fn register_relay(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRelayRequest>,
) -> Result<StatusCode, ApiError> {
    if req.relay_id.is_empty() {
        return Err(invalid("relay_id is required"));
    }
    if req.address.is_empty() {
        return Err(invalid("address is required"));
    }

    info!(
        relay_id = %req.relay_id,
        address = %req.address,
        grpc_port = req.grpc_port,
        "registering relay"
    );

    let relay = Relay {
        id: req.relay_id,
        address: req.address,
        grpc_port: req.grpc_port,
        last_seen: Utc::now(),
    };

    state
        .registry
        .register_relay(&state.shutdown, relay)
        .await
        .map_err(error_response)?;

    Ok(StatusCode::NO_CONTENT)
}

/// Record a relay heartbeat
#[utoipa::path(
    post,
    path = "/api/relays/{id}/heartbeat",
    params(("id" = String, Path, description = "Relay ID")),
    request_body = HeartbeatRelayRequest,
    responses(
        (status = 204, description = "Heartbeat recorded"),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 404, description = "Relay not registered", body = ErrorResponse)
    ),
    tag = "relays"
)]
pub async fn heartbeat_relay(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<HeartbeatRelayRequest>,
) -> Result<StatusCode, ApiError> {
    if id.is_empty() {
        return Err(invalid("relay id is required"));
    }
    if req.timestamp_unix_ms == 0 {
        return Err(invalid("timestamp_unix_ms is required"));
    }

    debug!(relay_id = %id, "relay heartbeat");

    state
        .registry
        .heartbeat_relay(&state.shutdown, &id)
        .await
        .map_err(error_response)?;

    Ok(StatusCode::NO_CONTENT)
}

/// List registered relays
#[utoipa::path(
    get,
    path = "/api/relays",
    responses(
        (status = 200, description = "Snapshot of registered relays", body = RelayList),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "relays"
)]
pub async fn list_relays(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RelayList>, ApiError> {
    debug!("listing relays");

    let relays = state
        .registry
        .list_relays(&state.shutdown)
        .await
        .map_err(error_response)?;

    let relays: Vec<RelayInfo> = relays
        .into_iter()
        .map(|relay| RelayInfo {
            relay_id: relay.id,
            address: relay.address,
            grpc_port: relay.grpc_port,
            last_seen_unix_ms: relay.last_seen.timestamp_millis(),
        })
        .collect();

    let total = relays.len();
    Ok(Json(RelayList { relays, total }))
}

/// Remove a relay and every agent placed on it
#[utoipa::path(
    delete,
    path = "/api/relays/{id}",
    params(("id" = String, Path, description = "Relay ID")),
    responses(
        (status = 204, description = "Relay and placed agents removed"),
        (status = 404, description = "Relay not registered", body = ErrorResponse)
    ),
    tag = "relays"
)]
pub async fn remove_relay(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if id.is_empty() {
        return Err(invalid("relay id is required"));
    }

    info!(relay_id = %id, "removing relay");

    state
        .registry
        .remove_relay(&state.shutdown, &id)
        .await
        .map_err(error_response)?;

    Ok(StatusCode::NO_CONTENT)
}

/// List the agents currently placed on a relay
#[utoipa::path(
    get,
    path = "/api/relays/{id}/agents",
    params(("id" = String, Path, description = "Relay ID")),
    responses(
        (status = 200, description = "Agents placed on the relay", body = AgentList),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "relays"
)]
pub async fn list_relay_agents(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<AgentList>, ApiError> {
    debug!(relay_id = %id, "listing relay agents");

    let agents = state
        .registry
        .list_relay_agents(&state.shutdown, &id)
        .await
        .map_err(error_response)?;

    Ok(Json(to_agent_list(agents)))
}

/// Register an agent on a relay
///
/// Re-registering an agent against a different relay reassigns the
/// placement.
#[utoipa::path(
    post,
    path = "/api/agents",
    request_body = RegisterAgentRequest,
    responses(
        (status = 204, description = "Agent registered"),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 404, description = "Relay not registered", body = ErrorResponse)
    ),
    tag = "agents"
)]
pub async fn register_agent(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterAgentRequest>,
) -> Result<StatusCode, ApiError> {
    if req.agent_id.is_empty() {
        return Err(invalid("agent_id is required"));
    }
    if req.relay_id.is_empty() {
        return Err(invalid("relay_id is required"));
    }

    info!(agent_id = %req.agent_id, relay_id = %req.relay_id, "registering agent");

    let agent = Agent {
        id: req.agent_id,
        last_heartbeat: Utc::now(),
    };

    state
        .registry
        .register_agent(&state.shutdown, agent, &req.relay_id)
        .await
        .map_err(error_response)?;

    Ok(StatusCode::NO_CONTENT)
}

/// Record an agent heartbeat
#[utoipa::path(
    post,
    path = "/api/agents/{id}/heartbeat",
    params(("id" = String, Path, description = "Agent ID")),
    responses(
        (status = 204, description = "Heartbeat recorded"),
        (status = 404, description = "Agent not registered", body = ErrorResponse)
    ),
    tag = "agents"
)]
pub async fn heartbeat_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if id.is_empty() {
        return Err(invalid("agent id is required"));
    }

    debug!(agent_id = %id, "agent heartbeat");

    state
        .registry
        .heartbeat_agent(&state.shutdown, &id)
        .await
        .map_err(error_response)?;

    Ok(StatusCode::NO_CONTENT)
}

/// List registered agents
#[utoipa::path(
    get,
    path = "/api/agents",
    responses(
        (status = 200, description = "Snapshot of registered agents", body = AgentList),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "agents"
)]
pub async fn list_agents(
    State(state): State<Arc<AppState>>,
) -> Result<Json<AgentList>, ApiError> {
    debug!("listing agents");

    let agents = state
        .registry
        .list_agents(&state.shutdown)
        .await
        .map_err(error_response)?;

    Ok(Json(to_agent_list(agents)))
}

/// Look up which relay an agent is placed on
#[utoipa::path(
    get,
    path = "/api/agents/{id}/placement",
    params(("id" = String, Path, description = "Agent ID")),
    responses(
        (status = 200, description = "Current placement", body = PlacementInfo),
        (status = 404, description = "Agent not registered", body = ErrorResponse)
    ),
    tag = "agents"
)]
pub async fn get_agent_placement(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<PlacementInfo>, ApiError> {
    if id.is_empty() {
        return Err(invalid("agent id is required"));
    }

    debug!(agent_id = %id, "fetching agent placement");

    let placement = state
        .registry
        .get_agent_placement(&state.shutdown, &id)
        .await
        .map_err(error_response)?;

    Ok(Json(PlacementInfo {
        agent_id: placement.agent_id,
        relay_id: placement.relay_id,
        updated_at_unix_ms: placement.updated_at.timestamp_millis(),
    }))
}

/// Remove a batch of agents; absent IDs are ignored
#[utoipa::path(
    delete,
    path = "/api/agents",
    request_body = RemoveAgentsRequest,
    responses(
        (status = 204, description = "Agents removed"),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "agents"
)]
pub async fn remove_agents(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RemoveAgentsRequest>,
) -> Result<StatusCode, ApiError> {
    info!(count = req.agent_ids.len(), "removing agents");

    state
        .registry
        .remove_agents(&state.shutdown, &req.agent_ids)
        .await
        .map_err(error_response)?;

    Ok(StatusCode::NO_CONTENT)
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let cfg = state.registry.config();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: cfg.backend.kind.to_string(),
        heartbeat_interval_ms: cfg.heartbeat_interval.as_millis() as u64,
    })
}

fn to_agent_list(agents: Vec<Agent>) -> AgentList {
    let agents: Vec<AgentInfo> = agents
        .into_iter()
        .map(|agent| AgentInfo {
            agent_id: agent.id,
            last_heartbeat_unix_ms: agent.last_heartbeat.timestamp_millis(),
        })
        .collect();
    let total = agents.len();
    AgentList { agents, total }
}

fn invalid(message: &str) -> ApiError {
    error_response(RegistryError::Invalid(message.to_string()))
}

/// Maps registry error kinds onto wire status codes. Unclassified errors
/// come back as 500 with the message redacted.
fn error_response(err: RegistryError) -> ApiError {
    let (status, code, message) = match &err {
        RegistryError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string()),
        RegistryError::Invalid(_) => (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", err.to_string()),
        RegistryError::Conflict(_) => (StatusCode::CONFLICT, "ALREADY_EXISTS", err.to_string()),
        RegistryError::Unsupported(_) => {
            (StatusCode::NOT_IMPLEMENTED, "UNSUPPORTED", err.to_string())
        }
        RegistryError::Canceled => (StatusCode::REQUEST_TIMEOUT, "CANCELED", err.to_string()),
        RegistryError::DeadlineExceeded => (
            StatusCode::REQUEST_TIMEOUT,
            "DEADLINE_EXCEEDED",
            err.to_string(),
        ),
        RegistryError::Internal(_) => {
            error!(error = %err, "unclassified registry error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL",
                "internal error".to_string(),
            )
        }
    };

    (
        status,
        Json(ErrorResponse {
            error: message,
            code: Some(code.to_string()),
        }),
    )
}
