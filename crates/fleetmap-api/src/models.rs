//! Wire models for the registry API
//!
//! Timestamps cross the wire as Unix milliseconds; the core keeps native
//! timestamp resolution.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Request to register (or refresh) a relay
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegisterRelayRequest {
    /// Client-assigned relay identifier
    pub relay_id: String,
    /// Address the relay is reachable at
    pub address: String,
    /// Port of the relay's gRPC endpoint
    pub grpc_port: u16,
}

/// Relay heartbeat payload
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HeartbeatRelayRequest {
    /// Client clock at heartbeat time, Unix milliseconds
    pub timestamp_unix_ms: i64,
}

/// Relay entry as reported to clients
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RelayInfo {
    pub relay_id: String,
    pub address: String,
    pub grpc_port: u16,
    /// Last registration or heartbeat, Unix milliseconds
    pub last_seen_unix_ms: i64,
}

/// Snapshot of the registered relays
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RelayList {
    pub relays: Vec<RelayInfo>,
    pub total: usize,
}

/// Request to register an agent on a relay
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegisterAgentRequest {
    /// Client-assigned agent identifier
    pub agent_id: String,
    /// Relay the agent is placed on; must already be registered
    pub relay_id: String,
}

/// Agent entry as reported to clients
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentInfo {
    pub agent_id: String,
    /// Last registration or heartbeat, Unix milliseconds
    pub last_heartbeat_unix_ms: i64,
}

/// Snapshot of the registered agents
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentList {
    pub agents: Vec<AgentInfo>,
    pub total: usize,
}

/// Current agent-to-relay placement
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PlacementInfo {
    pub agent_id: String,
    pub relay_id: String,
    /// Last placement mutation, Unix milliseconds
    pub updated_at_unix_ms: i64,
}

/// Batch agent removal; absent IDs are ignored
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RemoveAgentsRequest {
    pub agent_ids: Vec<String>,
}

/// Service liveness and advisory client settings
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Configured backend kind
    pub backend: String,
    /// Advisory heartbeat cadence clients should follow, milliseconds
    pub heartbeat_interval_ms: u64,
}

/// Error payload returned for failed requests
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}
