//! Error types for the replication server.

use crate::csn::{Csn, ServerId};
use thiserror::Error;

/// Errors that can occur in the replication server.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Append of a CSN that is not strictly greater than the origin's last CSN.
    #[error("out-of-order CSN for server {server_id} in {domain}: last={last}, got={got}")]
    OutOfOrderCsn {
        /// Replicated domain.
        domain: String,
        /// Originating server of the rejected record.
        server_id: ServerId,
        /// Last CSN stored for that origin.
        last: Csn,
        /// The rejected CSN.
        got: Csn,
    },

    /// No flow-control credit left on a connection.
    #[error("flow-control window exhausted")]
    WindowExhausted,

    /// Assured write could not be confirmed within the configured timeout.
    #[error("assured write {csn} not acknowledged in time (missing: {missing:?})")]
    AssuredTimeout {
        /// The write that timed out.
        csn: Csn,
        /// Servers that had not acknowledged it.
        missing: Vec<ServerId>,
    },

    /// Peer connection failed or was torn down.
    #[error("peer {server_id} unreachable: {msg}")]
    PeerUnreachable {
        /// The peer, 0 when not yet identified.
        server_id: ServerId,
        /// Error message describing the failure.
        msg: String,
    },

    /// On-disk changelog data could not be read back; the domain is halted.
    #[error("changelog corrupted for {domain}: {msg}")]
    ChangelogCorruption {
        /// Halted domain.
        domain: String,
        /// Error message describing the corruption.
        msg: String,
    },

    /// Malformed frame or unexpected message.
    #[error("protocol error: {msg}")]
    Protocol {
        /// Error message describing the violation.
        msg: String,
    },

    /// Handshake refused.
    #[error("handshake rejected: {msg}")]
    Handshake {
        /// Reason for the rejection.
        msg: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {msg}")]
    Config {
        /// Error message describing the invalid option.
        msg: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Replication server was shut down.
    #[error("replication server shut down")]
    Shutdown,
}

impl ReplError {
    /// True for data-integrity failures that must always reach the caller.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            ReplError::OutOfOrderCsn { .. } | ReplError::ChangelogCorruption { .. }
        )
    }
}
