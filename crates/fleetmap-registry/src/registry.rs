//! Registry façade and TTL sweeper
//!
//! The façade passes lifecycle calls straight through to the configured
//! backend; it holds no entity state of its own. Its distinctive
//! responsibility is the TTL sweeper: a background loop that reaps relays
//! and agents whose heartbeats have gone quiet, without racing concurrent
//! heartbeats and without ever running two passes at once.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::config::Config;
use crate::error::{RegistryError, Result};
use crate::error_recorder::ErrorRecorder;
use crate::model::{Agent, AgentPlacement, Relay};

/// Backend-agnostic registry control plane.
pub struct Registry {
    cfg: Config,
    backend: Arc<dyn Backend>,

    ttl_loop_running: AtomicBool,
    cleanup_in_progress: AtomicBool,
}

impl Registry {
    /// Creates a registry over a backend, validating the configuration.
    pub fn new(cfg: Config, backend: Arc<dyn Backend>) -> Result<Self> {
        cfg.validate()?;

        Ok(Self {
            cfg,
            backend,
            ttl_loop_running: AtomicBool::new(false),
            cleanup_in_progress: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub async fn register_relay(&self, cancel: &CancellationToken, relay: Relay) -> Result<()> {
        self.backend.register_relay(cancel, relay).await
    }

    pub async fn heartbeat_relay(&self, cancel: &CancellationToken, relay_id: &str) -> Result<()> {
        self.backend.heartbeat_relay(cancel, relay_id).await
    }

    pub async fn list_relays(&self, cancel: &CancellationToken) -> Result<Vec<Relay>> {
        self.backend.list_relays(cancel).await
    }

    pub async fn remove_relay(&self, cancel: &CancellationToken, relay_id: &str) -> Result<()> {
        self.backend.remove_relay(cancel, relay_id).await
    }

    pub async fn register_agent(
        &self,
        cancel: &CancellationToken,
        agent: Agent,
        relay_id: &str,
    ) -> Result<()> {
        self.backend.register_agent(cancel, agent, relay_id).await
    }

    pub async fn heartbeat_agent(&self, cancel: &CancellationToken, agent_id: &str) -> Result<()> {
        self.backend.heartbeat_agent(cancel, agent_id).await
    }

    pub async fn get_agent_placement(
        &self,
        cancel: &CancellationToken,
        agent_id: &str,
    ) -> Result<AgentPlacement> {
        self.backend.get_agent_placement(cancel, agent_id).await
    }

    pub async fn list_agents(&self, cancel: &CancellationToken) -> Result<Vec<Agent>> {
        self.backend.list_agents(cancel).await
    }

    pub async fn list_relay_agents(
        &self,
        cancel: &CancellationToken,
        relay_id: &str,
    ) -> Result<Vec<Agent>> {
        self.backend.list_relay_agents(cancel, relay_id).await
    }

    pub async fn remove_agents(
        &self,
        cancel: &CancellationToken,
        agent_ids: &[String],
    ) -> Result<()> {
        self.backend.remove_agents(cancel, agent_ids).await
    }

    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }

    /// Starts the TTL sweeper loop.
    ///
    /// At most one loop runs per registry; a duplicate call logs a warning
    /// and returns without starting anything. The loop stops when `shutdown`
    /// fires.
    pub fn run_ttl(self: &Arc<Self>, shutdown: CancellationToken) {
        if self
            .ttl_loop_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(method = "run_ttl", "ttl loop already running; ignoring duplicate call");
            return;
        }

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let interval = registry.next_cleanup_interval();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let errors = registry.run_ttl_cleanup(&shutdown, Utc::now()).await;
                        if !errors.is_empty() && !errors.iter().all(RegistryError::is_cancellation) {
                            let joined: Vec<String> =
                                errors.iter().map(|err| err.to_string()).collect();
                            error!(
                                method = "run_ttl_cleanup",
                                errors = %joined.join("; "),
                                "ttl cleanup pass failed"
                            );
                        }
                    }
                }
            }
            registry.ttl_loop_running.store(false, Ordering::SeqCst);
        });
    }

    /// Runs a single cleanup pass over the backend.
    ///
    /// Skips entirely (zero backend calls) when another pass is still in
    /// flight. Returns every sub-step error in the order it occurred; the
    /// pass never aborts early on an individual relay or agent failure.
    pub async fn run_ttl_cleanup(
        &self,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Vec<RegistryError> {
        if self
            .cleanup_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(
                method = "run_ttl_cleanup",
                skipped_in_progress = true,
                "ttl cleanup skipped; previous cleanup still in progress"
            );
            return Vec::new();
        }

        let started = Instant::now();
        let recorder = ErrorRecorder::new();
        let (stale_relays_removed, stale_agents_removed) =
            self.cleanup_pass(cancel, now, &recorder).await;
        self.cleanup_in_progress.store(false, Ordering::SeqCst);

        let errors = recorder.into_errors();
        let duration_ms = started.elapsed().as_millis() as u64;
        if errors.is_empty() {
            info!(
                method = "run_ttl_cleanup",
                duration_ms,
                stale_relays_removed,
                stale_agents_removed,
                "ttl cleanup completed"
            );
        } else {
            warn!(
                method = "run_ttl_cleanup",
                duration_ms,
                stale_relays_removed,
                stale_agents_removed,
                errors_count = errors.len(),
                "ttl cleanup completed"
            );
        }

        errors
    }

    /// Relay pass first, then a leftover pass for orphaned or never-placed
    /// agents. Removing a relay cascades its agents, so this order keeps
    /// the observable sequence "relay gone, then its agents gone" and
    /// avoids redundant per-agent work.
    async fn cleanup_pass(
        &self,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
        recorder: &ErrorRecorder,
    ) -> (usize, usize) {
        let mut stale_relays_removed = 0usize;
        let mut stale_agents_removed = 0usize;

        let relays = match self.backend.list_relays(cancel).await {
            Ok(relays) => relays,
            Err(err) => {
                recorder.record(err);
                return (stale_relays_removed, stale_agents_removed);
            }
        };

        for relay in relays {
            if is_stale(relay.last_seen, now, self.cfg.ttl.relay) {
                // Stale-confirm: the snapshot may predate a heartbeat.
                match self.is_relay_still_stale(cancel, &relay.id).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(err) => {
                        recorder.record(err);
                        continue;
                    }
                }

                match self.remove_relay_agents(cancel, &relay.id, recorder).await {
                    Ok(removed) => stale_agents_removed += removed,
                    Err(err) => recorder.record(err),
                }

                match self.backend.remove_relay(cancel, &relay.id).await {
                    Ok(()) => stale_relays_removed += 1,
                    Err(err) => recorder.record(err),
                }
                continue;
            }

            let relay_agents = match self.backend.list_relay_agents(cancel, &relay.id).await {
                Ok(agents) => agents,
                Err(err) => {
                    recorder.record(err);
                    continue;
                }
            };

            let mut candidates: Vec<String> = relay_agents
                .into_iter()
                .filter(|agent| is_stale(agent.last_heartbeat, now, self.cfg.ttl.agent))
                .map(|agent| agent.id)
                .collect();

            if !candidates.is_empty() {
                candidates = match self.filter_still_stale_agents(cancel, candidates).await {
                    Ok(still_stale) => still_stale,
                    Err(err) => {
                        recorder.record(err);
                        continue;
                    }
                };
            }

            if !candidates.is_empty() {
                match self.backend.remove_agents(cancel, &candidates).await {
                    Ok(()) => stale_agents_removed += candidates.len(),
                    Err(err) => recorder.record(err),
                }
            }
        }

        // Leftover pass: agents the relay pass did not reach.
        let agents = match self.backend.list_agents(cancel).await {
            Ok(agents) => agents,
            Err(err) => {
                recorder.record(err);
                return (stale_relays_removed, stale_agents_removed);
            }
        };

        let mut stale_agent_ids: Vec<String> = agents
            .into_iter()
            .filter(|agent| is_stale(agent.last_heartbeat, now, self.cfg.ttl.agent))
            .map(|agent| agent.id)
            .collect();

        if !stale_agent_ids.is_empty() {
            stale_agent_ids = match self.filter_still_stale_agents(cancel, stale_agent_ids).await {
                Ok(still_stale) => still_stale,
                Err(err) => {
                    recorder.record(err);
                    Vec::new()
                }
            };
        }

        if !stale_agent_ids.is_empty() {
            match self.backend.remove_agents(cancel, &stale_agent_ids).await {
                Ok(()) => stale_agents_removed += stale_agent_ids.len(),
                Err(err) => recorder.record(err),
            }
        }

        (stale_relays_removed, stale_agents_removed)
    }

    /// Base period equal to the tighter TTL, plus up to 10% uniform jitter
    /// to decorrelate sweepers across deployed registry instances.
    fn next_cleanup_interval(&self) -> Duration {
        let ttl = self.cfg.ttl.relay.min(self.cfg.ttl.agent);
        let max_jitter = ttl / 10;

        if max_jitter.is_zero() {
            return ttl;
        }

        ttl + max_jitter.mul_f64(rand::random::<f64>())
    }

    /// Removes the agents still placed on `relay_id`, returning how many
    /// were removed. Agents reassigned to another relay mid-sweep are left
    /// alone.
    async fn remove_relay_agents(
        &self,
        cancel: &CancellationToken,
        relay_id: &str,
        recorder: &ErrorRecorder,
    ) -> Result<usize> {
        let agents = self.backend.list_relay_agents(cancel, relay_id).await?;
        let agent_ids: Vec<String> = agents.into_iter().map(|agent| agent.id).collect();
        if agent_ids.is_empty() {
            return Ok(0);
        }

        let agent_ids = self
            .filter_agents_still_placed_on_relay(cancel, relay_id, agent_ids, recorder)
            .await;
        if agent_ids.is_empty() {
            return Ok(0);
        }

        self.backend.remove_agents(cancel, &agent_ids).await?;
        Ok(agent_ids.len())
    }

    /// Re-reads relay state immediately before deletion. A relay refreshed
    /// by a heartbeat after the sweep snapshot is no longer stale; one that
    /// vanished entirely needs no removal.
    async fn is_relay_still_stale(
        &self,
        cancel: &CancellationToken,
        relay_id: &str,
    ) -> Result<bool> {
        let relays = self.backend.list_relays(cancel).await?;
        let now = Utc::now();

        Ok(relays
            .iter()
            .find(|relay| relay.id == relay_id)
            .map(|relay| is_stale(relay.last_seen, now, self.cfg.ttl.relay))
            .unwrap_or(false))
    }

    /// Intersects candidates with a fresh agent snapshot and keeps only the
    /// ones still past TTL, closing the window against concurrent
    /// heartbeats.
    async fn filter_still_stale_agents(
        &self,
        cancel: &CancellationToken,
        candidate_ids: Vec<String>,
    ) -> Result<Vec<String>> {
        if candidate_ids.is_empty() {
            return Ok(Vec::new());
        }

        let agents = self.backend.list_agents(cancel).await?;
        let now = Utc::now();
        let candidates: HashSet<&str> = candidate_ids.iter().map(String::as_str).collect();

        Ok(agents
            .into_iter()
            .filter(|agent| candidates.contains(agent.id.as_str()))
            .filter(|agent| is_stale(agent.last_heartbeat, now, self.cfg.ttl.agent))
            .map(|agent| agent.id)
            .collect())
    }

    /// Keeps only candidates whose placement still points at `relay_id`.
    /// Placements gone missing are skipped; lookup failures are recorded
    /// and that agent is left for the next sweep.
    async fn filter_agents_still_placed_on_relay(
        &self,
        cancel: &CancellationToken,
        relay_id: &str,
        candidate_ids: Vec<String>,
        recorder: &ErrorRecorder,
    ) -> Vec<String> {
        let mut filtered = Vec::with_capacity(candidate_ids.len());

        for agent_id in candidate_ids {
            match self.backend.get_agent_placement(cancel, &agent_id).await {
                Ok(placement) => {
                    if placement.relay_id == relay_id {
                        filtered.push(agent_id);
                    }
                }
                Err(RegistryError::NotFound(_)) => continue,
                Err(err) => recorder.record(err),
            }
        }

        filtered
    }
}

/// True when `last` is at least `ttl` in the past relative to `now`.
/// Timestamps in the future are treated as fresh.
fn is_stale(last: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    match now.signed_duration_since(last).to_std() {
        Ok(elapsed) => elapsed >= ttl,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, ListenConfig, TlsConfig, TtlConfig};
    use async_trait::async_trait;

    struct NoopBackend;

    #[async_trait]
    impl Backend for NoopBackend {
        async fn register_relay(&self, _: &CancellationToken, _: Relay) -> Result<()> {
            Ok(())
        }
        async fn heartbeat_relay(&self, _: &CancellationToken, _: &str) -> Result<()> {
            Ok(())
        }
        async fn list_relays(&self, _: &CancellationToken) -> Result<Vec<Relay>> {
            Ok(Vec::new())
        }
        async fn remove_relay(&self, _: &CancellationToken, _: &str) -> Result<()> {
            Ok(())
        }
        async fn register_agent(&self, _: &CancellationToken, _: Agent, _: &str) -> Result<()> {
            Ok(())
        }
        async fn heartbeat_agent(&self, _: &CancellationToken, _: &str) -> Result<()> {
            Ok(())
        }
        async fn get_agent_placement(
            &self,
            _: &CancellationToken,
            agent_id: &str,
        ) -> Result<AgentPlacement> {
            Err(RegistryError::agent_not_found(agent_id))
        }
        async fn list_agents(&self, _: &CancellationToken) -> Result<Vec<Agent>> {
            Ok(Vec::new())
        }
        async fn list_relay_agents(&self, _: &CancellationToken, _: &str) -> Result<Vec<Agent>> {
            Ok(Vec::new())
        }
        async fn remove_agents(&self, _: &CancellationToken, _: &[String]) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn test_config(relay_ttl: Duration, agent_ttl: Duration) -> Config {
        Config {
            backend: BackendConfig::memory(),
            listen: ListenConfig {
                address: "127.0.0.1".to_string(),
                port: 7070,
                tls: TlsConfig::default(),
            },
            ttl: TtlConfig {
                relay: relay_ttl,
                agent: agent_ttl,
            },
            heartbeat_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    fn test_registry(relay_ttl: Duration, agent_ttl: Duration) -> Registry {
        Registry {
            cfg: test_config(relay_ttl, agent_ttl),
            backend: Arc::new(NoopBackend),
            ttl_loop_running: AtomicBool::new(false),
            cleanup_in_progress: AtomicBool::new(false),
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let cfg = test_config(Duration::ZERO, Duration::from_secs(30));
        let result = Registry::new(cfg, Arc::new(NoopBackend));
        assert!(matches!(result, Err(RegistryError::Invalid(_))));
    }

    #[test]
    fn test_next_cleanup_interval_uses_tighter_ttl_with_jitter() {
        let registry = test_registry(Duration::from_secs(30), Duration::from_secs(10));

        for _ in 0..100 {
            let interval = registry.next_cleanup_interval();
            assert!(interval >= Duration::from_secs(10));
            assert!(interval <= Duration::from_secs(11));
        }
    }

    #[test]
    fn test_next_cleanup_interval_sub_jitter_base() {
        // A base so small that a tenth of it truncates to zero: no jitter.
        let registry = test_registry(Duration::from_nanos(5), Duration::from_nanos(5));
        assert_eq!(registry.next_cleanup_interval(), Duration::from_nanos(5));
    }

    #[test]
    fn test_is_stale() {
        let now = Utc::now();
        let ttl = Duration::from_secs(30);

        assert!(is_stale(now - chrono::Duration::seconds(45), now, ttl));
        assert!(is_stale(now - chrono::Duration::seconds(30), now, ttl));
        assert!(!is_stale(now - chrono::Duration::seconds(5), now, ttl));
        // A timestamp in the future is never stale.
        assert!(!is_stale(now + chrono::Duration::seconds(120), now, ttl));
    }

    #[tokio::test]
    async fn test_run_ttl_second_call_is_noop() {
        let registry = Arc::new(test_registry(
            Duration::from_secs(30),
            Duration::from_secs(30),
        ));
        let shutdown = CancellationToken::new();

        registry.run_ttl(shutdown.clone());
        assert!(registry.ttl_loop_running.load(Ordering::SeqCst));

        // Second call must not start another loop: the flag owner stays the
        // first loop, which only resets it once `shutdown` fires.
        let second = CancellationToken::new();
        registry.run_ttl(second.clone());
        second.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.ttl_loop_running.load(Ordering::SeqCst));

        shutdown.cancel();
        for _ in 0..50 {
            if !registry.ttl_loop_running.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!registry.ttl_loop_running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_ttl_can_restart_after_shutdown() {
        let registry = Arc::new(test_registry(
            Duration::from_secs(30),
            Duration::from_secs(30),
        ));

        let shutdown = CancellationToken::new();
        registry.run_ttl(shutdown.clone());
        shutdown.cancel();
        for _ in 0..50 {
            if !registry.ttl_loop_running.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let restart = CancellationToken::new();
        registry.run_ttl(restart.clone());
        assert!(registry.ttl_loop_running.load(Ordering::SeqCst));
        restart.cancel();
    }
}
