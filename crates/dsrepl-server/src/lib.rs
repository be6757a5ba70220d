#![warn(missing_docs)]

//! dsrepl: replication server for a multi-master directory service.
//!
//! Directory-server replicas stream their changes to a replication server,
//! which stores them in a durable per-origin changelog, forwards them to every
//! other replica and replication server under credit-based flow control, and
//! coordinates assured (acknowledged) replication.

pub mod assured;
pub mod broker;
pub mod change;
pub mod changelog;
pub mod config;
pub mod connection;
pub mod csn;
pub mod degraded;
pub mod error;
pub mod message;
pub mod scheduler;
pub mod server;
pub mod topology;
pub mod window;

pub use assured::{AssuredCoordinator, AssuredHandle, AssuredOutcome};
pub use broker::{BrokerConfig, PublishReceipt, ReplicaBroker};
pub use change::{AssuredMode, ChangeRecord};
pub use changelog::{ChangelogStore, DbImplementation, StoredChange};
pub use config::ReplServerConfig;
pub use csn::{Csn, CsnGenerator, GroupId, ServerId, ServerState};
pub use error::ReplError;
pub use server::{LifecycleState, ReplicationServer};
pub use topology::{ServerRole, ServerStatus, TopologyRouter};
