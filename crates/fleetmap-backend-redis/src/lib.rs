//! Redis-backed registry driver
//!
//! Entities live in per-ID hashes with `relays`/`agents` index sets and a
//! placement hash per agent. Redis has no cross-key locks, so every
//! multi-key write goes through an atomic (`MULTI`/`EXEC`) pipeline; a
//! cascade interleaving with a concurrent write converges on the next TTL
//! sweep.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use fleetmap_registry::{
    ensure_active, Agent, AgentPlacement, Backend, RedisConfig, RegistryError, Relay, Result,
};

const RELAYS_INDEX_KEY: &str = "fleetmap:registry:relays";
const AGENTS_INDEX_KEY: &str = "fleetmap:registry:agents";
const RELAY_KEY_PREFIX: &str = "fleetmap:registry:relay:";
const AGENT_KEY_PREFIX: &str = "fleetmap:registry:agent:";
const PLACEMENT_KEY_PREFIX: &str = "fleetmap:registry:placement:";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Registry backend over a Redis instance.
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    /// Connects and pings the configured instance; fails fast when Redis
    /// is unreachable.
    pub async fn connect(cfg: &RedisConfig) -> Result<Self> {
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(cfg.address.clone(), cfg.port),
            redis: redis::RedisConnectionInfo {
                db: cfg.db,
                username: (!cfg.username.is_empty()).then(|| cfg.username.clone()),
                password: (!cfg.password.is_empty()).then(|| cfg.password.clone()),
                ..Default::default()
            },
        };

        let client = Client::open(info).map_err(backend_error)?;
        let mut conn = tokio::time::timeout(CONNECT_TIMEOUT, client.get_connection_manager())
            .await
            .map_err(|_| RegistryError::DeadlineExceeded)?
            .map_err(backend_error)?;

        let pong: String =
            tokio::time::timeout(CONNECT_TIMEOUT, redis::cmd("PING").query_async(&mut conn))
                .await
                .map_err(|_| RegistryError::DeadlineExceeded)?
                .map_err(backend_error)?;
        debug!(address = %cfg.address, port = cfg.port, response = %pong, "connected to redis");

        Ok(Self { conn })
    }

    async fn relay_exists(&self, relay_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.sismember(RELAYS_INDEX_KEY, relay_id)
            .await
            .map_err(backend_error)
    }

    async fn fetch_placements(&self, agent_ids: &[String]) -> Result<Vec<AgentPlacement>> {
        if agent_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for agent_id in agent_ids {
            pipe.hgetall(placement_key(agent_id));
        }
        let rows: Vec<HashMap<String, String>> =
            pipe.query_async(&mut conn).await.map_err(backend_error)?;

        let mut placements = Vec::with_capacity(rows.len());
        for row in rows {
            if row.is_empty() {
                continue;
            }
            placements.push(parse_placement(&row)?);
        }
        Ok(placements)
    }

    async fn fetch_agents(&self, agent_ids: &[String]) -> Result<Vec<Agent>> {
        if agent_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for agent_id in agent_ids {
            pipe.hgetall(agent_key(agent_id));
        }
        let rows: Vec<HashMap<String, String>> =
            pipe.query_async(&mut conn).await.map_err(backend_error)?;

        let mut agents = Vec::with_capacity(rows.len());
        for row in rows {
            if row.is_empty() {
                continue;
            }
            agents.push(parse_agent(&row)?);
        }
        Ok(agents)
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn register_relay(&self, cancel: &CancellationToken, relay: Relay) -> Result<()> {
        ensure_active(cancel)?;

        let last_seen = to_nanos(relay.last_seen);
        let key = relay_key(&relay.id);

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&key, "id", relay.id.as_str())
            .ignore()
            .hset(&key, "address", relay.address.as_str())
            .ignore()
            .hset(&key, "grpc_port", i64::from(relay.grpc_port))
            .ignore()
            .hset(&key, "last_seen_ns", last_seen)
            .ignore()
            .sadd(RELAYS_INDEX_KEY, relay.id.as_str())
            .ignore();
        let _: () = pipe.query_async(&mut conn).await.map_err(backend_error)?;
        Ok(())
    }

    async fn heartbeat_relay(&self, cancel: &CancellationToken, relay_id: &str) -> Result<()> {
        ensure_active(cancel)?;

        if !self.relay_exists(relay_id).await? {
            return Err(RegistryError::relay_not_found(relay_id));
        }

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(relay_key(relay_id), "last_seen_ns", to_nanos(Utc::now()))
            .ignore()
            .sadd(RELAYS_INDEX_KEY, relay_id)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await.map_err(backend_error)?;
        Ok(())
    }

    async fn list_relays(&self, cancel: &CancellationToken) -> Result<Vec<Relay>> {
        ensure_active(cancel)?;

        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(RELAYS_INDEX_KEY)
            .await
            .map_err(backend_error)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        ensure_active(cancel)?;

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(relay_key(id));
        }
        let rows: Vec<HashMap<String, String>> =
            pipe.query_async(&mut conn).await.map_err(backend_error)?;

        let mut relays = Vec::with_capacity(rows.len());
        for row in rows {
            if row.is_empty() {
                continue;
            }
            relays.push(parse_relay(&row)?);
        }
        Ok(relays)
    }

    async fn remove_relay(&self, cancel: &CancellationToken, relay_id: &str) -> Result<()> {
        ensure_active(cancel)?;

        if !self.relay_exists(relay_id).await? {
            return Err(RegistryError::relay_not_found(relay_id));
        }

        // Find the agents placed here, then delete relay and cascade in one
        // transaction.
        let mut conn = self.conn.clone();
        let agent_ids: Vec<String> = conn
            .smembers(AGENTS_INDEX_KEY)
            .await
            .map_err(backend_error)?;
        let placements = self.fetch_placements(&agent_ids).await?;
        let cascaded: Vec<&str> = placements
            .iter()
            .filter(|placement| placement.relay_id == relay_id)
            .map(|placement| placement.agent_id.as_str())
            .collect();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(relay_key(relay_id))
            .ignore()
            .srem(RELAYS_INDEX_KEY, relay_id)
            .ignore();
        for agent_id in &cascaded {
            pipe.del(agent_key(agent_id))
                .ignore()
                .del(placement_key(agent_id))
                .ignore()
                .srem(AGENTS_INDEX_KEY, *agent_id)
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(backend_error)?;
        Ok(())
    }

    async fn register_agent(
        &self,
        cancel: &CancellationToken,
        agent: Agent,
        relay_id: &str,
    ) -> Result<()> {
        ensure_active(cancel)?;

        if !self.relay_exists(relay_id).await? {
            return Err(RegistryError::relay_not_found(relay_id));
        }

        let last_heartbeat = to_nanos(agent.last_heartbeat);
        let agent_hash = agent_key(&agent.id);
        let placement_hash = placement_key(&agent.id);

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&agent_hash, "id", agent.id.as_str())
            .ignore()
            .hset(&agent_hash, "last_heartbeat_ns", last_heartbeat)
            .ignore()
            .hset(&placement_hash, "agent_id", agent.id.as_str())
            .ignore()
            .hset(&placement_hash, "relay_id", relay_id)
            .ignore()
            .hset(&placement_hash, "updated_at_ns", last_heartbeat)
            .ignore()
            .sadd(AGENTS_INDEX_KEY, agent.id.as_str())
            .ignore();
        let _: () = pipe.query_async(&mut conn).await.map_err(backend_error)?;
        Ok(())
    }

    async fn heartbeat_agent(&self, cancel: &CancellationToken, agent_id: &str) -> Result<()> {
        ensure_active(cancel)?;

        let mut conn = self.conn.clone();
        let known: bool = conn
            .sismember(AGENTS_INDEX_KEY, agent_id)
            .await
            .map_err(backend_error)?;
        if !known {
            return Err(RegistryError::agent_not_found(agent_id));
        }

        let now = to_nanos(Utc::now());
        let placement_present: bool = conn
            .exists(placement_key(agent_id))
            .await
            .map_err(backend_error)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(agent_key(agent_id), "last_heartbeat_ns", now)
            .ignore();
        if placement_present {
            pipe.hset(placement_key(agent_id), "updated_at_ns", now)
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(backend_error)?;
        Ok(())
    }

    async fn get_agent_placement(
        &self,
        cancel: &CancellationToken,
        agent_id: &str,
    ) -> Result<AgentPlacement> {
        ensure_active(cancel)?;

        let mut conn = self.conn.clone();
        let row: HashMap<String, String> = conn
            .hgetall(placement_key(agent_id))
            .await
            .map_err(backend_error)?;
        if row.is_empty() {
            return Err(RegistryError::agent_not_found(agent_id));
        }

        parse_placement(&row)
    }

    async fn list_agents(&self, cancel: &CancellationToken) -> Result<Vec<Agent>> {
        ensure_active(cancel)?;

        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(AGENTS_INDEX_KEY)
            .await
            .map_err(backend_error)?;

        ensure_active(cancel)?;
        self.fetch_agents(&ids).await
    }

    async fn list_relay_agents(
        &self,
        cancel: &CancellationToken,
        relay_id: &str,
    ) -> Result<Vec<Agent>> {
        ensure_active(cancel)?;

        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(AGENTS_INDEX_KEY)
            .await
            .map_err(backend_error)?;
        let placements = self.fetch_placements(&ids).await?;

        let placed: Vec<String> = placements
            .into_iter()
            .filter(|placement| placement.relay_id == relay_id)
            .map(|placement| placement.agent_id)
            .collect();

        self.fetch_agents(&placed).await
    }

    async fn remove_agents(&self, cancel: &CancellationToken, agent_ids: &[String]) -> Result<()> {
        ensure_active(cancel)?;

        if agent_ids.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for agent_id in agent_ids {
            // Deleting an absent key is a no-op, which is exactly the
            // best-effort batch semantics the contract asks for.
            pipe.del(agent_key(agent_id))
                .ignore()
                .del(placement_key(agent_id))
                .ignore()
                .srem(AGENTS_INDEX_KEY, agent_id.as_str())
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(backend_error)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // The connection manager closes with its last clone.
        Ok(())
    }
}

fn relay_key(relay_id: &str) -> String {
    format!("{RELAY_KEY_PREFIX}{relay_id}")
}

fn agent_key(agent_id: &str) -> String {
    format!("{AGENT_KEY_PREFIX}{agent_id}")
}

fn placement_key(agent_id: &str) -> String {
    format!("{PLACEMENT_KEY_PREFIX}{agent_id}")
}

fn backend_error(err: redis::RedisError) -> RegistryError {
    RegistryError::Internal(format!("redis: {err}"))
}

fn to_nanos(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt().unwrap_or(0)
}

fn from_nanos(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}

fn parse_field_i64(row: &HashMap<String, String>, field: &str) -> Result<i64> {
    match row.get(field) {
        None => Ok(0),
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| RegistryError::Internal(format!("invalid {field} value: {raw}"))),
    }
}

fn parse_relay(row: &HashMap<String, String>) -> Result<Relay> {
    let grpc_port = parse_field_i64(row, "grpc_port")?;
    let grpc_port = u16::try_from(grpc_port)
        .map_err(|_| RegistryError::Internal(format!("relay grpc_port out of range: {grpc_port}")))?;

    Ok(Relay {
        id: row.get("id").cloned().unwrap_or_default(),
        address: row.get("address").cloned().unwrap_or_default(),
        grpc_port,
        last_seen: from_nanos(parse_field_i64(row, "last_seen_ns")?),
    })
}

fn parse_agent(row: &HashMap<String, String>) -> Result<Agent> {
    Ok(Agent {
        id: row.get("id").cloned().unwrap_or_default(),
        last_heartbeat: from_nanos(parse_field_i64(row, "last_heartbeat_ns")?),
    })
}

fn parse_placement(row: &HashMap<String, String>) -> Result<AgentPlacement> {
    Ok(AgentPlacement {
        agent_id: row.get("agent_id").cloned().unwrap_or_default(),
        relay_id: row.get("relay_id").cloned().unwrap_or_default(),
        updated_at: from_nanos(parse_field_i64(row, "updated_at_ns")?),
    })
}
