//! Fleetmap registry server
//!
//! Wires CLI flags into a validated configuration, selects the backend,
//! starts the API server and the TTL sweeper, and handles graceful
//! shutdown.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use fleetmap_api::{ApiServer, ApiServerConfig};
use fleetmap_backend_memory::MemoryBackend;
use fleetmap_backend_redis::RedisBackend;
use fleetmap_registry::{
    Backend, BackendConfig, BackendKind, Config, ListenConfig, RedisConfig, Registry,
    RegistryError, TlsConfig, TtlConfig,
};

/// Fleetmap registry - tracks relay and agent liveness and placement
#[derive(Parser, Debug)]
#[command(name = "fleetmap-server")]
#[command(about = "Run the fleetmap registry control plane", long_about = None)]
#[command(version)]
struct ServerArgs {
    /// Backend store for registry state (memory, redis, etcd, consul)
    #[arg(long, default_value = "memory")]
    backend: String,

    /// Address the API server should listen on
    #[arg(long, default_value = "0.0.0.0")]
    listen_addr: String,

    /// Port the API server will listen on
    #[arg(long, default_value = "7070")]
    listen_port: u16,

    /// Enable TLS on the API listener
    #[arg(long)]
    tls_enabled: bool,

    /// Path to the TLS certificate file (PEM format)
    #[arg(long, default_value = "")]
    tls_cert: String,

    /// Path to the TLS private key file (PEM format)
    #[arg(long, default_value = "")]
    tls_key: String,

    /// Relay liveness window in seconds
    #[arg(long, default_value = "30")]
    relay_ttl_secs: u64,

    /// Agent liveness window in seconds
    #[arg(long, default_value = "30")]
    agent_ttl_secs: u64,

    /// Advisory heartbeat interval reported to clients, in seconds
    #[arg(long, default_value = "1")]
    heartbeat_interval_secs: u64,

    /// Budget enforced during graceful shutdown, in seconds
    #[arg(long, default_value = "30")]
    shutdown_timeout_secs: u64,

    /// Redis instance address
    #[arg(long, default_value = "localhost")]
    redis_addr: String,

    /// Redis instance port
    #[arg(long, default_value = "6379")]
    redis_port: u16,

    /// Redis username
    #[arg(long, default_value = "default")]
    redis_username: String,

    /// Redis password
    #[arg(long, default_value = "", env = "FLEETMAP_REDIS_PASSWORD")]
    redis_password: String,

    /// Redis database to use
    #[arg(long, default_value = "0")]
    redis_db: i64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn build_config(args: &ServerArgs) -> Result<Config> {
    let kind: BackendKind = args.backend.parse()?;

    let redis = (kind == BackendKind::Redis).then(|| RedisConfig {
        address: args.redis_addr.clone(),
        port: args.redis_port,
        username: args.redis_username.clone(),
        password: args.redis_password.clone(),
        db: args.redis_db,
    });

    let cfg = Config {
        backend: BackendConfig {
            kind,
            redis,
            etcd: None,
            consul: None,
        },
        listen: ListenConfig {
            address: args.listen_addr.clone(),
            port: args.listen_port,
            tls: TlsConfig {
                enabled: args.tls_enabled,
                cert_path: args.tls_cert.clone(),
                key_path: args.tls_key.clone(),
            },
        },
        ttl: TtlConfig {
            relay: Duration::from_secs(args.relay_ttl_secs),
            agent: Duration::from_secs(args.agent_ttl_secs),
        },
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval_secs),
        shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
    };

    cfg.validate()?;
    Ok(cfg)
}

async fn build_backend(cfg: &Config) -> fleetmap_registry::Result<Arc<dyn Backend>> {
    match cfg.backend.kind {
        BackendKind::Memory => Ok(Arc::new(MemoryBackend::new())),
        BackendKind::Redis => {
            let redis_cfg = cfg.backend.redis.as_ref().ok_or_else(|| {
                RegistryError::Invalid("redis backend selected but not configured".into())
            })?;
            Ok(Arc::new(RedisBackend::connect(redis_cfg).await?))
        }
        BackendKind::Etcd => Err(RegistryError::Unsupported(
            "etcd driver is not implemented; use memory or redis".into(),
        )),
        BackendKind::Consul => Err(RegistryError::Unsupported(
            "consul driver is not implemented; use memory or redis".into(),
        )),
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();
    init_logging(&args.log_level)?;

    let cfg = build_config(&args)?;
    let backend = build_backend(&cfg).await?;

    info!(
        backend = %cfg.backend.kind,
        relay_ttl_secs = cfg.ttl.relay.as_secs(),
        agent_ttl_secs = cfg.ttl.agent.as_secs(),
        "starting fleetmap registry"
    );

    let registry = Arc::new(Registry::new(cfg.clone(), backend)?);

    let shutdown = CancellationToken::new();
    registry.run_ttl(shutdown.clone());

    let bind_addr: SocketAddr = format!("{}:{}", cfg.listen.address, cfg.listen.port).parse()?;
    let api_config = ApiServerConfig {
        bind_addr,
        tls_cert_path: cfg
            .listen
            .tls
            .enabled
            .then(|| cfg.listen.tls.cert_path.clone()),
        tls_key_path: cfg
            .listen
            .tls
            .enabled
            .then(|| cfg.listen.tls.key_path.clone()),
    };
    let server = ApiServer::new(api_config, registry.clone(), shutdown.clone());
    let mut server_handle = tokio::spawn(server.start());

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping registry");
        }
        result = &mut server_handle => {
            shutdown.cancel();
            if let Err(err) = registry.close().await {
                error!("failed to close backend: {err}");
            }
            return match result {
                Ok(Ok(())) => Err(anyhow::anyhow!("API server exited unexpectedly")),
                Ok(Err(err)) => Err(err),
                Err(err) => Err(anyhow::anyhow!("API server task failed: {err}")),
            };
        }
    }

    shutdown.cancel();

    match tokio::time::timeout(cfg.shutdown_timeout, server_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => error!("API server error during shutdown: {err}"),
        Ok(Err(err)) => error!("API server task failed: {err}"),
        Err(_) => warn!(
            timeout_secs = cfg.shutdown_timeout.as_secs(),
            "API server did not stop within the shutdown budget"
        ),
    }

    info!("shutting down backend");
    if let Err(err) = registry.close().await {
        error!("failed to close backend: {err}");
    }

    info!("registry stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_args(args: &[&str]) -> ServerArgs {
        let mut full = vec!["fleetmap-server"];
        full.extend_from_slice(args);
        ServerArgs::try_parse_from(full).expect("args should parse")
    }

    #[test]
    fn test_build_config_memory_backend() {
        let args = parse_args(&[
            "--backend",
            "memory",
            "--listen-addr",
            "127.0.0.1",
            "--listen-port",
            "50055",
            "--relay-ttl-secs",
            "45",
            "--agent-ttl-secs",
            "15",
        ]);

        let cfg = build_config(&args).expect("config should build");
        assert_eq!(cfg.backend.kind, BackendKind::Memory);
        assert!(cfg.backend.redis.is_none());
        assert_eq!(cfg.listen.address, "127.0.0.1");
        assert_eq!(cfg.listen.port, 50055);
        assert_eq!(cfg.ttl.relay, Duration::from_secs(45));
        assert_eq!(cfg.ttl.agent, Duration::from_secs(15));
    }

    #[test]
    fn test_build_config_redis_backend() {
        let args = parse_args(&[
            "--backend",
            "redis",
            "--redis-addr",
            "cache.internal",
            "--redis-port",
            "6380",
            "--redis-username",
            "svc",
            "--redis-password",
            "secret",
            "--redis-db",
            "2",
        ]);

        let cfg = build_config(&args).expect("config should build");
        assert_eq!(cfg.backend.kind, BackendKind::Redis);

        let redis = cfg.backend.redis.expect("redis config present");
        assert_eq!(redis.address, "cache.internal");
        assert_eq!(redis.port, 6380);
        assert_eq!(redis.username, "svc");
        assert_eq!(redis.password, "secret");
        assert_eq!(redis.db, 2);
    }

    #[test]
    fn test_build_config_rejects_unknown_backend() {
        let args = parse_args(&["--backend", "zookeeper"]);
        let err = build_config(&args).expect_err("unknown backend");
        assert!(err.to_string().contains("unknown backend type"));
    }

    #[test]
    fn test_build_config_rejects_zero_ttl() {
        let args = parse_args(&["--relay-ttl-secs", "0"]);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn test_build_config_tls_requires_paths() {
        let args = parse_args(&["--tls-enabled"]);
        assert!(build_config(&args).is_err());

        let args = parse_args(&[
            "--tls-enabled",
            "--tls-cert",
            "/etc/fleetmap/tls.crt",
            "--tls-key",
            "/etc/fleetmap/tls.key",
        ]);
        let cfg = build_config(&args).expect("config should build");
        assert!(cfg.listen.tls.enabled);
    }

    #[tokio::test]
    async fn test_build_backend_memory() {
        let args = parse_args(&[]);
        let cfg = build_config(&args).expect("config should build");
        assert!(build_backend(&cfg).await.is_ok());
    }

    #[tokio::test]
    async fn test_build_backend_unimplemented_drivers() {
        let args = parse_args(&[]);
        let mut cfg = build_config(&args).expect("config should build");

        cfg.backend.kind = BackendKind::Etcd;
        let err = match build_backend(&cfg).await {
            Err(e) => e,
            Ok(_) => panic!("etcd driver"),
        };
        assert!(matches!(err, RegistryError::Unsupported(_)));

        cfg.backend.kind = BackendKind::Consul;
        let err = match build_backend(&cfg).await {
            Err(e) => e,
            Ok(_) => panic!("consul driver"),
        };
        assert!(matches!(err, RegistryError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_build_backend_redis_without_settings() {
        let args = parse_args(&[]);
        let mut cfg = build_config(&args).expect("config should build");

        cfg.backend.kind = BackendKind::Redis;
        let err = match build_backend(&cfg).await {
            Err(e) => e,
            Ok(_) => panic!("missing redis config"),
        };
        assert!(matches!(err, RegistryError::Invalid(_)));
    }
}
