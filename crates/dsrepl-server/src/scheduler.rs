//! Periodic work: topology broadcast, degraded evaluation, change-number
//! watermark and changelog purge.

use std::sync::Arc;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::server::ReplicationServer;

/// What one monitoring pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitoringReport {
    /// Gossip entries dropped for not being refreshed.
    pub expired_gossip: usize,
    /// Degraded/normal transitions applied.
    pub status_changes: usize,
    /// Assured writes resolved by re-evaluation.
    pub assured_resolved: usize,
    /// Change-number watermark, when published.
    pub change_number: Option<u64>,
}

/// One monitoring pass over every domain.
pub fn monitoring_tick(server: &ReplicationServer) -> MonitoringReport {
    let now = Instant::now();
    let contexts = server.domain_contexts();
    let mut report = MonitoringReport::default();

    for ctx in &contexts {
        let expired = ctx.topology.expire_gossip(now);
        if !expired.is_empty() {
            debug!(domain = %ctx.name, servers = ?expired, "stale gossip expired");
            report.expired_gossip += expired.len();
        }
        ctx.prune_relays(now, server.config().assured_timeout() * 2);
    }

    let transitions = server.analyzer().evaluate(&server.outstanding_by_peer());
    for transition in &transitions {
        for ctx in &contexts {
            if ctx.topology.set_status(transition.server_id, transition.status) {
                report.status_changes += 1;
            }
        }
    }

    for ctx in &contexts {
        report.assured_resolved += ctx.assured.reevaluate(&ctx.topology.snapshot());
        server.broadcast_topology(ctx);
    }

    if server.config().compute_change_number {
        let n = server.store().last_change_number();
        server.publish_change_number(n);
        report.change_number = Some(n);
    }
    report
}

/// Run [`monitoring_tick`] every monitoring period until shutdown.
pub(crate) async fn run_monitoring(server: Arc<ReplicationServer>) {
    let mut shutdown = server.shutdown_signal();
    let mut ticker = tokio::time::interval(server.config().monitoring_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = monitoring_tick(&server);
                if report.status_changes > 0 || report.expired_gossip > 0 {
                    info!(
                        status_changes = report.status_changes,
                        expired_gossip = report.expired_gossip,
                        resolved = report.assured_resolved,
                        "topology updated"
                    );
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("monitoring stopped");
}

/// Purge the changelog every purge interval. Does nothing when the purge
/// delay is 0.
pub(crate) async fn run_purge(server: Arc<ReplicationServer>) {
    let Some(delay) = server.config().purge_delay() else {
        debug!("changelog purge disabled");
        return;
    };
    let mut shutdown = server.shutdown_signal();
    let mut ticker = tokio::time::interval(server.config().purge_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let pinned = server.pinned_csns();
        let store = Arc::clone(server.store());
        match tokio::task::spawn_blocking(move || store.purge_older_than(delay, &pinned)).await {
            Ok(Ok(removed)) => {
                server.stats().record_purged(removed);
                if removed > 0 {
                    debug!(removed, "purge pass done");
                }
            }
            Ok(Err(e)) => error!(error = %e, "changelog purge failed"),
            Err(e) => error!(error = %e, "changelog purge task failed"),
        }
    }
    debug!("purge stopped");
}
