//! In-memory registry backend
//!
//! Reference implementation of the backend contract. Its concurrency
//! discipline defines the semantics external drivers must emulate:
//!
//! - the relay map is guarded by one `RwLock`; the agent and placement maps
//!   share a second `RwLock` so agent/placement writes are atomic to
//!   readers;
//! - each entry carries its own mutex for field updates;
//! - lock order is strict: relay map, then agent tables, then entry mutex.
//!   Readers take the map read guard, clone out entry handles, release the
//!   guard, and only then touch entry mutexes.
//!
//! Snapshots copy values out; callers never observe live entries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use fleetmap_registry::{
    ensure_active, Agent, AgentPlacement, Backend, RegistryError, Relay, Result,
};

struct RelayEntry {
    relay: Mutex<Relay>,
}

struct AgentEntry {
    agent: Mutex<Agent>,
}

/// Agent and placement maps share one lock so that placement rewrites and
/// cascades are atomic to readers.
#[derive(Default)]
struct AgentTables {
    agents: HashMap<String, Arc<AgentEntry>>,
    placements: HashMap<String, AgentPlacement>,
}

/// In-memory backend. Cheap to construct; holds no durable state.
#[derive(Default)]
pub struct MemoryBackend {
    relays: RwLock<HashMap<String, Arc<RelayEntry>>>,
    agent_tables: RwLock<AgentTables>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn register_relay(&self, cancel: &CancellationToken, relay: Relay) -> Result<()> {
        ensure_active(cancel)?;

        let existing = {
            let relays = self.relays.read().map_err(lock_poisoned)?;
            relays.get(&relay.id).cloned()
        };

        if let Some(entry) = existing {
            let mut stored = entry.relay.lock().map_err(lock_poisoned)?;
            // Idempotent update
            stored.address = relay.address;
            stored.grpc_port = relay.grpc_port;
            stored.last_seen = Utc::now();
            return Ok(());
        }

        let new_entry = Arc::new(RelayEntry {
            relay: Mutex::new(Relay {
                id: relay.id.clone(),
                address: relay.address,
                grpc_port: relay.grpc_port,
                last_seen: Utc::now(),
            }),
        });

        // Double-checked insert: the ID may have been created between the
        // read-guard check and this write guard.
        let mut relays = self.relays.write().map_err(lock_poisoned)?;
        if let Some(existing) = relays.get(&relay.id).cloned() {
            drop(relays);

            let mut stored = existing.relay.lock().map_err(lock_poisoned)?;
            stored.last_seen = Utc::now();
            return Ok(());
        }

        relays.insert(relay.id.clone(), new_entry);
        Ok(())
    }

    async fn heartbeat_relay(&self, cancel: &CancellationToken, relay_id: &str) -> Result<()> {
        ensure_active(cancel)?;

        let entry = {
            let relays = self.relays.read().map_err(lock_poisoned)?;
            relays
                .get(relay_id)
                .cloned()
                .ok_or_else(|| RegistryError::relay_not_found(relay_id))?
        };

        let mut stored = entry.relay.lock().map_err(lock_poisoned)?;
        stored.last_seen = Utc::now();
        Ok(())
    }

    async fn list_relays(&self, cancel: &CancellationToken) -> Result<Vec<Relay>> {
        ensure_active(cancel)?;

        let entries: Vec<Arc<RelayEntry>> = {
            let relays = self.relays.read().map_err(lock_poisoned)?;
            relays.values().cloned().collect()
        };

        ensure_active(cancel)?;

        let mut relays = Vec::with_capacity(entries.len());
        for entry in entries {
            let stored = entry.relay.lock().map_err(lock_poisoned)?;
            relays.push(stored.clone());
        }
        Ok(relays)
    }

    async fn remove_relay(&self, cancel: &CancellationToken, relay_id: &str) -> Result<()> {
        ensure_active(cancel)?;

        // Both write guards are held for the whole cascade: readers observe
        // either the full pre-state or the full post-state.
        let mut relays = self.relays.write().map_err(lock_poisoned)?;
        let mut tables = self.agent_tables.write().map_err(lock_poisoned)?;

        if relays.remove(relay_id).is_none() {
            return Err(RegistryError::relay_not_found(relay_id));
        }

        let cascaded: Vec<String> = tables
            .placements
            .iter()
            .filter(|(_, placement)| placement.relay_id == relay_id)
            .map(|(agent_id, _)| agent_id.clone())
            .collect();

        for agent_id in cascaded {
            tables.placements.remove(&agent_id);
            tables.agents.remove(&agent_id);
        }

        Ok(())
    }

    async fn register_agent(
        &self,
        cancel: &CancellationToken,
        agent: Agent,
        relay_id: &str,
    ) -> Result<()> {
        ensure_active(cancel)?;

        {
            let relays = self.relays.read().map_err(lock_poisoned)?;
            if !relays.contains_key(relay_id) {
                return Err(RegistryError::relay_not_found(relay_id));
            }
        }

        let now = Utc::now();
        let existing = {
            let tables = self.agent_tables.read().map_err(lock_poisoned)?;
            tables.agents.get(&agent.id).cloned()
        };

        if let Some(entry) = existing {
            {
                let mut stored = entry.agent.lock().map_err(lock_poisoned)?;
                stored.last_heartbeat = now;
            }

            let mut tables = self.agent_tables.write().map_err(lock_poisoned)?;
            tables.placements.insert(
                agent.id.clone(),
                AgentPlacement {
                    agent_id: agent.id,
                    relay_id: relay_id.to_string(),
                    updated_at: now,
                },
            );
            return Ok(());
        }

        let new_entry = Arc::new(AgentEntry {
            agent: Mutex::new(Agent {
                id: agent.id.clone(),
                last_heartbeat: now,
            }),
        });

        let mut tables = self.agent_tables.write().map_err(lock_poisoned)?;
        if let Some(existing) = tables.agents.get(&agent.id).cloned() {
            // Lost the insert race; fall back to the update path.
            {
                let mut stored = existing.agent.lock().map_err(lock_poisoned)?;
                stored.last_heartbeat = now;
            }
            tables.placements.insert(
                agent.id.clone(),
                AgentPlacement {
                    agent_id: agent.id,
                    relay_id: relay_id.to_string(),
                    updated_at: now,
                },
            );
            return Ok(());
        }

        tables.agents.insert(agent.id.clone(), new_entry);
        tables.placements.insert(
            agent.id.clone(),
            AgentPlacement {
                agent_id: agent.id,
                relay_id: relay_id.to_string(),
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn heartbeat_agent(&self, cancel: &CancellationToken, agent_id: &str) -> Result<()> {
        ensure_active(cancel)?;

        let entry = {
            let tables = self.agent_tables.read().map_err(lock_poisoned)?;
            tables
                .agents
                .get(agent_id)
                .cloned()
                .ok_or_else(|| RegistryError::agent_not_found(agent_id))?
        };

        {
            let mut stored = entry.agent.lock().map_err(lock_poisoned)?;
            stored.last_heartbeat = Utc::now();
        }

        let mut tables = self.agent_tables.write().map_err(lock_poisoned)?;
        if let Some(placement) = tables.placements.get_mut(agent_id) {
            placement.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_agent_placement(
        &self,
        cancel: &CancellationToken,
        agent_id: &str,
    ) -> Result<AgentPlacement> {
        ensure_active(cancel)?;

        let tables = self.agent_tables.read().map_err(lock_poisoned)?;
        tables
            .placements
            .get(agent_id)
            .cloned()
            .ok_or_else(|| RegistryError::agent_not_found(agent_id))
    }

    async fn list_agents(&self, cancel: &CancellationToken) -> Result<Vec<Agent>> {
        ensure_active(cancel)?;

        let entries: Vec<Arc<AgentEntry>> = {
            let tables = self.agent_tables.read().map_err(lock_poisoned)?;
            tables.agents.values().cloned().collect()
        };

        ensure_active(cancel)?;

        let mut agents = Vec::with_capacity(entries.len());
        for entry in entries {
            let stored = entry.agent.lock().map_err(lock_poisoned)?;
            agents.push(stored.clone());
        }
        Ok(agents)
    }

    async fn list_relay_agents(
        &self,
        cancel: &CancellationToken,
        relay_id: &str,
    ) -> Result<Vec<Agent>> {
        ensure_active(cancel)?;

        // Membership is derived from the placement map.
        let entries: Vec<Arc<AgentEntry>> = {
            let tables = self.agent_tables.read().map_err(lock_poisoned)?;
            tables
                .placements
                .values()
                .filter(|placement| placement.relay_id == relay_id)
                .filter_map(|placement| tables.agents.get(&placement.agent_id).cloned())
                .collect()
        };

        let mut agents = Vec::with_capacity(entries.len());
        for entry in entries {
            let stored = entry.agent.lock().map_err(lock_poisoned)?;
            agents.push(stored.clone());
        }
        Ok(agents)
    }

    async fn remove_agents(&self, cancel: &CancellationToken, agent_ids: &[String]) -> Result<()> {
        ensure_active(cancel)?;

        let mut tables = self.agent_tables.write().map_err(lock_poisoned)?;
        for agent_id in agent_ids {
            // Absent IDs are ignored: batch delete is best-effort.
            tables.agents.remove(agent_id);
            tables.placements.remove(agent_id);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn lock_poisoned<T>(_: std::sync::PoisonError<T>) -> RegistryError {
    RegistryError::Internal("backend lock poisoned".to_string())
}
