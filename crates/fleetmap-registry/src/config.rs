//! Registry configuration
//!
//! Configuration is validated at construction; a registry never runs with
//! zero TTLs or a half-configured backend driver.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{RegistryError, Result};

/// Concrete backend selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Redis,
    Etcd,
    Consul,
}

impl FromStr for BackendKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            "etcd" => Ok(Self::Etcd),
            "consul" => Ok(Self::Consul),
            other => Err(RegistryError::Invalid(format!(
                "unknown backend type: {other}"
            ))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Memory => "memory",
            Self::Redis => "redis",
            Self::Etcd => "etcd",
            Self::Consul => "consul",
        };
        f.write_str(name)
    }
}

/// Redis driver connection settings.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub db: i64,
}

/// etcd driver connection settings.
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
}

/// Consul driver connection settings.
#[derive(Debug, Clone)]
pub struct ConsulConfig {
    pub address: String,
}

/// Backend selection plus driver-specific settings.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub redis: Option<RedisConfig>,
    pub etcd: Option<EtcdConfig>,
    pub consul: Option<ConsulConfig>,
}

impl BackendConfig {
    pub fn memory() -> Self {
        Self {
            kind: BackendKind::Memory,
            redis: None,
            etcd: None,
            consul: None,
        }
    }
}

/// TLS settings for the RPC listener. Wiring is owned by the transport.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: String,
    pub key_path: String,
}

/// RPC listener bind settings.
#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub address: String,
    pub port: u16,
    pub tls: TlsConfig,
}

/// Liveness windows for relays and agents.
#[derive(Debug, Clone, Copy)]
pub struct TtlConfig {
    pub relay: Duration,
    pub agent: Duration,
}

/// Top-level registry configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendConfig,
    pub listen: ListenConfig,
    pub ttl: TtlConfig,
    /// Advisory heartbeat cadence reported to clients
    pub heartbeat_interval: Duration,
    /// Budget enforced during graceful shutdown
    pub shutdown_timeout: Duration,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.ttl.relay.is_zero() {
            return Err(RegistryError::Invalid("relay ttl must be positive".into()));
        }
        if self.ttl.agent.is_zero() {
            return Err(RegistryError::Invalid("agent ttl must be positive".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(RegistryError::Invalid(
                "heartbeat interval must be positive".into(),
            ));
        }
        if self.listen.address.is_empty() {
            return Err(RegistryError::Invalid("listen address is required".into()));
        }
        if self.listen.tls.enabled
            && (self.listen.tls.cert_path.is_empty() || self.listen.tls.key_path.is_empty())
        {
            return Err(RegistryError::Invalid(
                "tls enabled but cert or key path is missing".into(),
            ));
        }

        match self.backend.kind {
            BackendKind::Memory => {}
            BackendKind::Redis => {
                let redis = self.backend.redis.as_ref().ok_or_else(|| {
                    RegistryError::Invalid("redis backend selected but not configured".into())
                })?;
                if redis.address.is_empty() {
                    return Err(RegistryError::Invalid("redis address is required".into()));
                }
                if redis.port == 0 {
                    return Err(RegistryError::Invalid("redis port is required".into()));
                }
            }
            BackendKind::Etcd => {
                let etcd = self.backend.etcd.as_ref().ok_or_else(|| {
                    RegistryError::Invalid("etcd backend selected but not configured".into())
                })?;
                if etcd.endpoints.is_empty() {
                    return Err(RegistryError::Invalid(
                        "etcd backend requires at least one endpoint".into(),
                    ));
                }
            }
            BackendKind::Consul => {
                let consul = self.backend.consul.as_ref().ok_or_else(|| {
                    RegistryError::Invalid("consul backend selected but not configured".into())
                })?;
                if consul.address.is_empty() {
                    return Err(RegistryError::Invalid("consul address is required".into()));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            backend: BackendConfig::memory(),
            listen: ListenConfig {
                address: "0.0.0.0".to_string(),
                port: 7070,
                tls: TlsConfig::default(),
            },
            ttl: TtlConfig {
                relay: Duration::from_secs(30),
                agent: Duration::from_secs(30),
            },
            heartbeat_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let mut cfg = valid_config();
        cfg.ttl.relay = Duration::ZERO;
        assert!(matches!(cfg.validate(), Err(RegistryError::Invalid(_))));

        let mut cfg = valid_config();
        cfg.ttl.agent = Duration::ZERO;
        assert!(matches!(cfg.validate(), Err(RegistryError::Invalid(_))));
    }

    #[test]
    fn test_redis_backend_requires_connection_settings() {
        let mut cfg = valid_config();
        cfg.backend.kind = BackendKind::Redis;
        assert!(matches!(cfg.validate(), Err(RegistryError::Invalid(_))));

        cfg.backend.redis = Some(RedisConfig {
            address: String::new(),
            port: 6379,
            username: "default".to_string(),
            password: String::new(),
            db: 0,
        });
        assert!(matches!(cfg.validate(), Err(RegistryError::Invalid(_))));

        cfg.backend.redis = Some(RedisConfig {
            address: "cache.internal".to_string(),
            port: 6380,
            username: "svc".to_string(),
            password: "secret".to_string(),
            db: 2,
        });
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_tls_requires_cert_and_key() {
        let mut cfg = valid_config();
        cfg.listen.tls.enabled = true;
        assert!(matches!(cfg.validate(), Err(RegistryError::Invalid(_))));

        cfg.listen.tls.cert_path = "/etc/fleetmap/tls.crt".to_string();
        cfg.listen.tls.key_path = "/etc/fleetmap/tls.key".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("memory".parse::<BackendKind>(), Ok(BackendKind::Memory));
        assert_eq!("redis".parse::<BackendKind>(), Ok(BackendKind::Redis));
        assert_eq!("etcd".parse::<BackendKind>(), Ok(BackendKind::Etcd));
        assert_eq!("consul".parse::<BackendKind>(), Ok(BackendKind::Consul));
        assert!("zookeeper".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_backend_kind_display_round_trips() {
        for kind in [
            BackendKind::Memory,
            BackendKind::Redis,
            BackendKind::Etcd,
            BackendKind::Consul,
        ] {
            assert_eq!(kind.to_string().parse::<BackendKind>(), Ok(kind));
        }
    }
}
