// Delivery node configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The node id must be unique per process in a cluster; when
// unset it falls back to `<hostname>:<port>` so two nodes on one host with
// different ports stay distinguishable.

use std::net::SocketAddr;
use std::time::Duration;

/// Core node configuration.
///
/// Constructed via [`NodeConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Cluster-unique identity of this node, used in presence records and
    /// broker channel names.
    pub node_id: String,
    /// JWT signing secret for connection tokens.
    pub jwt_secret: String,
    /// Redis connection string for the shared presence/lock store and the
    /// inter-node broker. When unset the node runs on in-memory stores
    /// (single-node / test mode).
    pub redis_url: Option<String>,
    /// Base URL of the external message-storage service.
    pub message_service_url: Option<String>,
    /// Presence lease TTL.
    pub lease_ttl: Duration,
    /// Offline-push suppression window.
    pub push_suppression: Duration,
    /// Log filter directive (e.g. `info`, `pulse_node=debug`).
    pub log_filter: String,
}

const DEV_JWT_SECRET: &str = "pulse_local_development_jwt_secret_must_be_32_chars";

/// Default presence lease TTL in seconds. Clients heartbeat every 30-60s,
/// so at least one renewal lands before expiry under normal jitter.
pub const DEFAULT_LEASE_TTL_SECS: u64 = 80;

/// Default offline-push suppression window in seconds.
pub const DEFAULT_PUSH_SUPPRESSION_SECS: u64 = 3600;

impl NodeConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `PULSE_NODE_HOST` | `0.0.0.0` |
    /// | `PULSE_NODE_PORT` | `9430` |
    /// | `PULSE_NODE_ID` | `<hostname>:<port>` |
    /// | `PULSE_NODE_JWT_SECRET` | dev-only placeholder |
    /// | `PULSE_NODE_REDIS_URL` | *(none, in-memory stores)* |
    /// | `PULSE_NODE_MESSAGE_SERVICE_URL` | *(none, in-memory store)* |
    /// | `PULSE_NODE_LEASE_TTL_SECS` | `80` |
    /// | `PULSE_NODE_PUSH_SUPPRESSION_SECS` | `3600` |
    /// | `PULSE_NODE_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("PULSE_NODE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("PULSE_NODE_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(9430);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let node_id = env("PULSE_NODE_ID")
            .ok()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| default_node_id(port));

        let jwt_secret = env("PULSE_NODE_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());

        let redis_url = env("PULSE_NODE_REDIS_URL").ok();
        let message_service_url = env("PULSE_NODE_MESSAGE_SERVICE_URL").ok();

        let lease_ttl = Duration::from_secs(
            env("PULSE_NODE_LEASE_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_LEASE_TTL_SECS),
        );
        let push_suppression = Duration::from_secs(
            env("PULSE_NODE_PUSH_SUPPRESSION_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PUSH_SUPPRESSION_SECS),
        );

        let log_filter = env("PULSE_NODE_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self {
            listen_addr,
            node_id,
            jwt_secret,
            redis_url,
            message_service_url,
            lease_ttl,
            push_suppression,
            log_filter,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn default_node_id(port: u16) -> String {
    match hostname() {
        Some(host) => format!("{host}:{port}"),
        None => format!("node-{port}"),
    }
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = NodeConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 9430);
        assert!(cfg.is_dev_jwt_secret());
        assert!(cfg.redis_url.is_none());
        assert!(cfg.message_service_url.is_none());
        assert_eq!(cfg.lease_ttl, Duration::from_secs(80));
        assert_eq!(cfg.push_suppression, Duration::from_secs(3600));
        assert_eq!(cfg.log_filter, "info");
    }

    #[test]
    fn explicit_node_id_wins() {
        let mut m = HashMap::new();
        m.insert("PULSE_NODE_ID", "node-east-2");
        let cfg = NodeConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.node_id, "node-east-2");
    }

    #[test]
    fn blank_node_id_falls_back_to_generated() {
        let mut m = HashMap::new();
        m.insert("PULSE_NODE_ID", "   ");
        m.insert("PULSE_NODE_PORT", "9431");
        let cfg = NodeConfig::from_env_fn(env_from_map(m));
        assert!(cfg.node_id.ends_with(":9431") || cfg.node_id == "node-9431");
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("PULSE_NODE_HOST", "127.0.0.1");
        m.insert("PULSE_NODE_PORT", "3000");
        let cfg = NodeConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn custom_jwt_secret_is_not_dev() {
        let mut m = HashMap::new();
        m.insert("PULSE_NODE_JWT_SECRET", "production_secret_at_least_32_chars!!");
        let cfg = NodeConfig::from_env_fn(env_from_map(m));
        assert!(!cfg.is_dev_jwt_secret());
    }

    #[test]
    fn lease_ttl_override() {
        let mut m = HashMap::new();
        m.insert("PULSE_NODE_LEASE_TTL_SECS", "120");
        let cfg = NodeConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.lease_ttl, Duration::from_secs(120));
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("PULSE_NODE_PORT", "not_a_number");
        let cfg = NodeConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 9430);
    }

    #[test]
    fn redis_url_from_env() {
        let mut m = HashMap::new();
        m.insert("PULSE_NODE_REDIS_URL", "redis://127.0.0.1:6379/0");
        let cfg = NodeConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://127.0.0.1:6379/0"));
    }
}
