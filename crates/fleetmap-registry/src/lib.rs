//! Fleetmap registry control plane.
//!
//! The registry tracks the liveness, identity, and placement of fleetmap
//! relays and agents. It acts as a coordination layer between stateless
//! relay instances and higher-level control plane components such as APIs,
//! operator dashboards, and fleet-wide management services.
//!
//! The registry is backend-agnostic: it defines a stable contract
//! ([`Backend`]) while allowing multiple implementations (in-memory, Redis,
//! etcd, Consul) to be plugged in via configuration. Liveness semantics
//! such as heartbeats and time-to-live (TTL) enforcement live at the
//! registry layer so behavior is consistent across all backends.

pub mod backend;
pub mod config;
pub mod error;
pub mod error_recorder;
pub mod model;
pub mod registry;

pub use backend::{ensure_active, Backend};
pub use config::{
    BackendConfig, BackendKind, Config, ConsulConfig, EtcdConfig, ListenConfig, RedisConfig,
    TlsConfig, TtlConfig,
};
pub use error::{RegistryError, Result};
pub use error_recorder::ErrorRecorder;
pub use model::{Agent, AgentPlacement, Relay};
pub use registry::Registry;
