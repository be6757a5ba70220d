//! Degraded-status analyzer.
//!
//! Tracks, per directly connected peer, how many assured writes still wait
//! on it and how fast it acks. A peer whose backlog crosses the threshold is
//! marked degraded and only recovers once the backlog falls clearly below
//! it, so a count hovering on the threshold does not flap.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::csn::ServerId;
use crate::topology::ServerStatus;

/// Weight of the newest sample in the latency average.
const LATENCY_EWMA_ALPHA: f64 = 0.2;

/// Health of one peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PeerHealth {
    /// Current status.
    pub status: ServerStatus,
    /// Outstanding acks seen at the last evaluation.
    pub outstanding: usize,
    /// Most recent ack latency.
    pub last_ack_latency: Option<Duration>,
    /// Smoothed ack latency in milliseconds.
    pub avg_ack_latency_ms: f64,
}

/// A status change produced by [`DegradedStatusAnalyzer::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransition {
    /// Affected peer.
    pub server_id: ServerId,
    /// New status.
    pub status: ServerStatus,
    /// Outstanding acks that triggered the change.
    pub outstanding: usize,
}

/// Per-peer hysteresis over outstanding assured acks.
#[derive(Debug)]
pub struct DegradedStatusAnalyzer {
    threshold: usize,
    peers: Mutex<HashMap<ServerId, PeerHealth>>,
}

impl DegradedStatusAnalyzer {
    /// Analyzer degrading peers above `threshold` outstanding acks; 0 disables.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Backlog strictly below which a degraded peer recovers. Never 0, so an
    /// idle peer always recovers.
    pub fn recovery_level(&self) -> usize {
        self.threshold.saturating_sub((self.threshold / 4).max(1)).max(1)
    }

    /// Start tracking a peer as normal.
    pub fn track(&self, server_id: ServerId) {
        self.peers.lock().entry(server_id).or_default();
    }

    /// Stop tracking a peer.
    pub fn forget(&self, server_id: ServerId) {
        self.peers.lock().remove(&server_id);
    }

    /// Fold one ack latency into the peer's average.
    pub fn record_ack_latency(&self, server_id: ServerId, latency: Duration) {
        let mut peers = self.peers.lock();
        if let Some(peer) = peers.get_mut(&server_id) {
            let sample = latency.as_secs_f64() * 1000.0;
            peer.avg_ack_latency_ms = match peer.last_ack_latency {
                None => sample,
                Some(_) => LATENCY_EWMA_ALPHA * sample + (1.0 - LATENCY_EWMA_ALPHA) * peer.avg_ack_latency_ms,
            };
            peer.last_ack_latency = Some(latency);
        }
    }

    /// Compare each tracked peer's backlog against the thresholds. Peers
    /// missing from `outstanding` have no backlog.
    pub fn evaluate(&self, outstanding: &HashMap<ServerId, usize>) -> Vec<StatusTransition> {
        let mut transitions = Vec::new();
        let recovery = self.recovery_level();
        let mut peers = self.peers.lock();
        for (server_id, peer) in peers.iter_mut() {
            let count = outstanding.get(server_id).copied().unwrap_or(0);
            peer.outstanding = count;
            if self.threshold == 0 {
                continue;
            }
            let next = match peer.status {
                ServerStatus::Normal if count > self.threshold => ServerStatus::Degraded,
                ServerStatus::Degraded if count < recovery => ServerStatus::Normal,
                current => current,
            };
            if next != peer.status {
                match next {
                    ServerStatus::Degraded => {
                        warn!(server_id = *server_id, outstanding = count, threshold = self.threshold, "peer degraded")
                    }
                    ServerStatus::Normal => {
                        info!(server_id = *server_id, outstanding = count, "peer back to normal")
                    }
                }
                peer.status = next;
                transitions.push(StatusTransition {
                    server_id: *server_id,
                    status: next,
                    outstanding: count,
                });
            }
        }
        transitions.sort_by_key(|t| t.server_id);
        transitions
    }

    /// Status of a tracked peer.
    pub fn status(&self, server_id: ServerId) -> Option<ServerStatus> {
        self.peers.lock().get(&server_id).map(|p| p.status)
    }

    /// Health of a tracked peer.
    pub fn health(&self, server_id: ServerId) -> Option<PeerHealth> {
        self.peers.lock().get(&server_id).cloned()
    }

    /// Health of every tracked peer.
    pub fn snapshot(&self) -> Vec<(ServerId, PeerHealth)> {
        let mut all: Vec<_> = self
            .peers
            .lock()
            .iter()
            .map(|(id, p)| (*id, p.clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backlog(id: ServerId, n: usize) -> HashMap<ServerId, usize> {
        HashMap::from([(id, n)])
    }

    #[test]
    fn test_recovery_level() {
        assert_eq!(DegradedStatusAnalyzer::new(100).recovery_level(), 75);
        assert_eq!(DegradedStatusAnalyzer::new(2).recovery_level(), 1);
        assert_eq!(DegradedStatusAnalyzer::new(1).recovery_level(), 1);
    }

    #[test]
    fn test_threshold_one_recovers_when_idle() {
        let analyzer = DegradedStatusAnalyzer::new(1);
        analyzer.track(2);
        assert_eq!(analyzer.evaluate(&backlog(2, 2))[0].status, ServerStatus::Degraded);
        assert!(analyzer.evaluate(&backlog(2, 1)).is_empty());
        let t = analyzer.evaluate(&HashMap::new());
        assert_eq!(
            t,
            vec![StatusTransition {
                server_id: 2,
                status: ServerStatus::Normal,
                outstanding: 0
            }]
        );
        assert_eq!(analyzer.status(2), Some(ServerStatus::Normal));
    }

    #[test]
    fn test_degrades_above_threshold() {
        let analyzer = DegradedStatusAnalyzer::new(10);
        analyzer.track(2);
        assert!(analyzer.evaluate(&backlog(2, 10)).is_empty());
        let t = analyzer.evaluate(&backlog(2, 11));
        assert_eq!(
            t,
            vec![StatusTransition {
                server_id: 2,
                status: ServerStatus::Degraded,
                outstanding: 11
            }]
        );
        assert_eq!(analyzer.status(2), Some(ServerStatus::Degraded));
    }

    #[test]
    fn test_hysteresis_prevents_flapping() {
        let analyzer = DegradedStatusAnalyzer::new(8);
        analyzer.track(2);
        analyzer.evaluate(&backlog(2, 9));
        // Hovering between the recovery level (6) and the threshold stays degraded.
        for n in [8, 7, 6, 9, 7] {
            assert!(analyzer.evaluate(&backlog(2, n)).is_empty(), "flapped at {}", n);
        }
        let t = analyzer.evaluate(&backlog(2, 5));
        assert_eq!(t[0].status, ServerStatus::Normal);
        assert!(analyzer.evaluate(&backlog(2, 8)).is_empty());
    }

    #[test]
    fn test_missing_peer_counts_as_zero() {
        let analyzer = DegradedStatusAnalyzer::new(4);
        analyzer.track(3);
        analyzer.evaluate(&backlog(3, 5));
        let t = analyzer.evaluate(&HashMap::new());
        assert_eq!(t[0].status, ServerStatus::Normal);
    }

    #[test]
    fn test_zero_threshold_disables() {
        let analyzer = DegradedStatusAnalyzer::new(0);
        analyzer.track(2);
        assert!(analyzer.evaluate(&backlog(2, 1_000_000)).is_empty());
        assert_eq!(analyzer.health(2).unwrap().outstanding, 1_000_000);
    }

    #[test]
    fn test_untracked_peers_ignored() {
        let analyzer = DegradedStatusAnalyzer::new(1);
        assert!(analyzer.evaluate(&backlog(9, 50)).is_empty());
        analyzer.track(9);
        analyzer.forget(9);
        assert!(analyzer.status(9).is_none());
    }

    #[test]
    fn test_latency_average() {
        let analyzer = DegradedStatusAnalyzer::new(10);
        analyzer.track(2);
        analyzer.record_ack_latency(2, Duration::from_millis(100));
        analyzer.record_ack_latency(2, Duration::from_millis(200));
        let health = analyzer.health(2).unwrap();
        assert_eq!(health.last_ack_latency, Some(Duration::from_millis(200)));
        assert!((health.avg_ack_latency_ms - 120.0).abs() < 1e-6);
    }
}
