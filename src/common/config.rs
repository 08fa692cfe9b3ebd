//! Configuration for shardkeeper nodes

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides, e.g. `SHARDKEEPER__NUM_PARTITIONS=16`
/// or `SHARDKEEPER__BACKEND__ENDPOINTS=etcd-0:2379,etcd-1:2379`.
pub const ENV_PREFIX: &str = "SHARDKEEPER";

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logical service name; scopes registry and lock keys
    pub service_name: String,

    /// Address advertised to peers (host:port)
    pub node_address: String,

    /// Registry member id; defaults to the node address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,

    /// Fixed, cluster-wide partition count
    pub num_partitions: u32,

    /// Coordination backend
    pub backend: BackendConfig,

    /// Lease time-to-live
    pub lease_ttl_secs: u64,

    /// Keepalive period (defaults to half the lease TTL)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keepalive_interval_ms: Option<u64>,

    /// Reconciliation period
    pub reconcile_interval_ms: u64,

    /// Upper bound for a single partition lock attempt
    pub lock_timeout_ms: u64,

    /// Upper bound for registry and session calls
    pub op_timeout_ms: u64,

    /// Prefix scan page size (0 = backend default)
    pub page_limit: u32,

    /// Ring points per member
    pub virtual_nodes: u32,

    /// Bind address for the status API (disabled when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_addr: Option<SocketAddr>,

    /// Re-join with a fresh lease instead of exiting when the lease is lost
    pub rejoin_on_lease_loss: bool,

    /// Logging level
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Etcd,
    Memory,
}

impl std::str::FromStr for BackendKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "etcd" => Ok(BackendKind::Etcd),
            "memory" => Ok(BackendKind::Memory),
            other => Err(crate::Error::InvalidConfig(format!(
                "unknown backend kind: {}",
                other
            ))),
        }
    }
}

/// Coordination backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,

    /// Backend endpoints (host:port)
    pub endpoints: Vec<String>,

    /// Connection timeout
    pub dial_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Etcd,
            endpoints: vec!["localhost:2379".to_string()],
            dial_timeout_ms: 5_000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "shardkeeper".to_string(),
            node_address: "127.0.0.1:8177".to_string(),
            member_id: None,
            num_partitions: 10,
            backend: BackendConfig::default(),
            lease_ttl_secs: 2,
            keepalive_interval_ms: None,
            reconcile_interval_ms: 1_000,
            lock_timeout_ms: 1_000,
            op_timeout_ms: 2_000,
            page_limit: 0,
            virtual_nodes: 160,
            status_addr: None,
            rejoin_on_lease_loss: false,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then apply
    /// `SHARDKEEPER__*` environment overrides.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("backend.endpoints")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the node cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error::InvalidConfig;

        if self.service_name.trim().is_empty() {
            return Err(InvalidConfig("service_name cannot be empty".into()));
        }
        if self.service_name.contains('/') {
            return Err(InvalidConfig("service_name cannot contain '/'".into()));
        }
        if self.node_address.trim().is_empty() {
            return Err(InvalidConfig("node_address cannot be empty".into()));
        }
        if self.num_partitions == 0 {
            return Err(InvalidConfig("num_partitions must be at least 1".into()));
        }
        if self.virtual_nodes == 0 {
            return Err(InvalidConfig("virtual_nodes must be at least 1".into()));
        }
        if self.lease_ttl_secs == 0 {
            return Err(InvalidConfig("lease_ttl_secs must be at least 1".into()));
        }
        if self.keepalive_interval() >= self.lease_ttl() {
            return Err(InvalidConfig(format!(
                "keepalive interval {:?} must be shorter than the lease TTL {:?}",
                self.keepalive_interval(),
                self.lease_ttl()
            )));
        }
        if self.reconcile_interval_ms == 0 || self.lock_timeout_ms == 0 || self.op_timeout_ms == 0
        {
            return Err(InvalidConfig("intervals and timeouts must be non-zero".into()));
        }
        if self.backend.kind == BackendKind::Etcd && self.backend.endpoints.is_empty() {
            return Err(InvalidConfig("etcd backend needs at least one endpoint".into()));
        }

        Ok(())
    }

    pub fn member_id(&self) -> &str {
        self.member_id.as_deref().unwrap_or(&self.node_address)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        match self.keepalive_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.lease_ttl() / 2,
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.dial_timeout_ms)
    }
}
