//! Backend contract consumed by the registry façade

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{RegistryError, Result};
use crate::model::{Agent, AgentPlacement, Relay};

/// Persistence and coordination contract required by the registry.
///
/// All operations are safe to call concurrently. Each takes a cancellation
/// handle; implementations check it at entry and must not report
/// [`RegistryError::Canceled`] after a mutation has become visible.
/// `list_*` operations return point-in-time snapshots of copied values;
/// callers can never mutate or race backend entries through a snapshot.
#[async_trait]
pub trait Backend: Send + Sync {
    // Relay lifecycle
    async fn register_relay(&self, cancel: &CancellationToken, relay: Relay) -> Result<()>;
    async fn heartbeat_relay(&self, cancel: &CancellationToken, relay_id: &str) -> Result<()>;
    async fn list_relays(&self, cancel: &CancellationToken) -> Result<Vec<Relay>>;
    /// Removes the relay and cascades removal of every agent placed on it.
    async fn remove_relay(&self, cancel: &CancellationToken, relay_id: &str) -> Result<()>;

    // Agent lifecycle
    /// Fails `NotFound` when `relay_id` does not reference an existing
    /// relay. Re-registration against a different relay reassigns the
    /// placement atomically.
    async fn register_agent(
        &self,
        cancel: &CancellationToken,
        agent: Agent,
        relay_id: &str,
    ) -> Result<()>;
    async fn heartbeat_agent(&self, cancel: &CancellationToken, agent_id: &str) -> Result<()>;
    async fn get_agent_placement(
        &self,
        cancel: &CancellationToken,
        agent_id: &str,
    ) -> Result<AgentPlacement>;
    async fn list_agents(&self, cancel: &CancellationToken) -> Result<Vec<Agent>>;

    // Control plane helpers
    async fn list_relay_agents(
        &self,
        cancel: &CancellationToken,
        relay_id: &str,
    ) -> Result<Vec<Agent>>;
    /// Best-effort batch delete; absent IDs are silently ignored.
    async fn remove_agents(&self, cancel: &CancellationToken, agent_ids: &[String]) -> Result<()>;

    // Shutdown
    async fn close(&self) -> Result<()>;
}

/// Fails with [`RegistryError::Canceled`] once the handle has fired.
///
/// Backends call this at operation entry, and snapshot operations may call
/// it again between the structural-lock phase and the per-entry copy phase.
pub fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(RegistryError::Canceled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_active() {
        let cancel = CancellationToken::new();
        assert!(ensure_active(&cancel).is_ok());

        cancel.cancel();
        assert_eq!(ensure_active(&cancel), Err(RegistryError::Canceled));
    }
}
