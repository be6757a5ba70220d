//! Replication server configuration.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::changelog::DbImplementation;
use crate::csn::{GroupId, ServerId};
use crate::error::ReplError;

/// Options of one replication server. Keys are snake_case; the camelCase
/// names used by directory-server deployments are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplServerConfig {
    /// Listen port.
    #[serde(alias = "replicationPort")]
    pub replication_port: u16,
    /// Bind address.
    pub listen_addr: IpAddr,
    /// Changelog directory.
    #[serde(alias = "replicationDBDirectory")]
    pub replication_db_directory: PathBuf,
    /// Changelog backend.
    #[serde(alias = "replicationDBImplementation")]
    pub replication_db_implementation: DbImplementation,
    /// Changelog retention in seconds; 0 keeps everything.
    #[serde(alias = "replicationPurgeDelay")]
    pub replication_purge_delay: u64,
    /// This server's id.
    #[serde(alias = "replicationServerId")]
    pub replication_server_id: ServerId,
    /// Outbound messages buffered per connection.
    #[serde(alias = "queueSize")]
    pub queue_size: usize,
    /// Flow-control window per connection.
    #[serde(alias = "windowSize")]
    pub window_size: u32,
    /// Bootstrap peer replication servers (`host:port`).
    #[serde(alias = "replicationServer")]
    pub replication_server: Vec<String>,
    /// Domains served; empty accepts any domain a directory server asks for.
    pub domains: Vec<String>,
    /// Durability group of this server.
    #[serde(alias = "groupId")]
    pub group_id: GroupId,
    /// Assured-write timeout in milliseconds.
    #[serde(alias = "assuredTimeout")]
    pub assured_timeout: u64,
    /// Outstanding acks that mark a peer degraded; 0 disables.
    #[serde(alias = "degradedStatusThreshold")]
    pub degraded_status_threshold: usize,
    /// Relative routing weight.
    pub weight: u32,
    /// Topology broadcast period in milliseconds.
    #[serde(alias = "monitoringPeriod")]
    pub monitoring_period: u64,
    /// Publish the change-number watermark.
    #[serde(alias = "computeChangeNumber")]
    pub compute_change_number: bool,
    /// Seconds between purge runs.
    pub purge_interval_secs: u64,
    /// Heartbeat period in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a peer is considered dead, in milliseconds.
    pub idle_timeout_ms: u64,
    /// First reconnect delay in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Reconnect delay cap in milliseconds.
    pub max_reconnect_delay_ms: u64,
}

impl Default for ReplServerConfig {
    fn default() -> Self {
        Self {
            replication_port: 8989,
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            replication_db_directory: PathBuf::from("changelogDb"),
            replication_db_implementation: DbImplementation::File,
            replication_purge_delay: 86_400,
            replication_server_id: 0,
            queue_size: 10_000,
            window_size: 100,
            replication_server: Vec::new(),
            domains: Vec::new(),
            group_id: 1,
            assured_timeout: 1_000,
            degraded_status_threshold: 5_000,
            weight: 1,
            monitoring_period: 3_000,
            compute_change_number: false,
            purge_interval_secs: 60,
            heartbeat_interval_ms: 1_000,
            idle_timeout_ms: 10_000,
            reconnect_delay_ms: 100,
            max_reconnect_delay_ms: 30_000,
        }
    }
}

impl ReplServerConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Volatile server on an ephemeral loopback port.
    pub fn in_memory(server_id: ServerId) -> Self {
        Self {
            replication_server_id: server_id,
            replication_port: 0,
            listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            replication_db_implementation: DbImplementation::Memory,
            ..Self::default()
        }
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ReplError> {
        let fail = |msg: &str| {
            Err(ReplError::Config {
                msg: msg.to_string(),
            })
        };
        if self.replication_server_id == 0 {
            return fail("replication_server_id must be between 1 and 65535");
        }
        if !(1..=127).contains(&self.group_id) {
            return fail("group_id must be between 1 and 127");
        }
        if self.window_size == 0 {
            return fail("window_size must be positive");
        }
        if self.queue_size == 0 {
            return fail("queue_size must be positive");
        }
        if self.weight == 0 {
            return fail("weight must be positive");
        }
        if self.monitoring_period == 0 {
            return fail("monitoring_period must be positive");
        }
        if self.idle_timeout_ms <= self.heartbeat_interval_ms {
            return fail("idle_timeout_ms must exceed heartbeat_interval_ms");
        }
        Ok(())
    }

    /// Address to bind.
    pub fn listen_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.replication_port)
    }

    /// Retention, `None` when purge is disabled.
    pub fn purge_delay(&self) -> Option<Duration> {
        (self.replication_purge_delay > 0).then(|| Duration::from_secs(self.replication_purge_delay))
    }

    /// Assured-write timeout.
    pub fn assured_timeout(&self) -> Duration {
        Duration::from_millis(self.assured_timeout)
    }

    /// Topology broadcast period.
    pub fn monitoring_period(&self) -> Duration {
        Duration::from_millis(self.monitoring_period)
    }

    /// Gossip not refreshed within three monitoring periods is dropped.
    pub fn gossip_ttl(&self) -> Duration {
        self.monitoring_period() * 3
    }

    /// Purge cadence.
    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }

    /// Heartbeat period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Dead-peer timeout.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// First reconnect delay.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms.max(1))
    }

    /// Reconnect delay cap.
    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms.max(self.reconnect_delay_ms))
    }

    /// True if this server replicates `domain`.
    pub fn serves_domain(&self, domain: &str) -> bool {
        self.domains.is_empty() || self.domains.iter().any(|d| d == domain)
    }
}
