//! Registry domain entities

use chrono::{DateTime, Utc};

/// A relay instance registered with the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relay {
    /// Client-assigned opaque identifier
    pub id: String,
    /// Address the relay is reachable at
    pub address: String,
    /// Port of the relay's gRPC endpoint
    pub grpc_port: u16,
    /// Last time the relay registered or heartbeat
    pub last_seen: DateTime<Utc>,
}

/// An agent (drone or edge worker process) registered with the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agent {
    /// Client-assigned opaque identifier
    pub id: String,
    /// Last time the agent registered or heartbeat
    pub last_heartbeat: DateTime<Utc>,
}

/// The association between an agent and the relay it is placed on.
///
/// An agent is placed on exactly one relay at a time; re-registering an
/// agent against a different relay reassigns the placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPlacement {
    pub agent_id: String,
    pub relay_id: String,
    /// Last time the placement was written (register or heartbeat)
    pub updated_at: DateTime<Utc>,
}
