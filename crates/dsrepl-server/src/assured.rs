//! Assured-replication coordinator.
//!
//! An assured change is registered with the set of servers whose
//! acknowledgment it may wait on. The originator holds an [`AssuredHandle`]
//! and suspends on it; acks, topology changes and the timeout sweeper
//! resolve the handle. Pending writes are owned here and mutated only
//! through [`AssuredCoordinator::on_ack`], [`AssuredCoordinator::reevaluate`]
//! and [`AssuredCoordinator::expire`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::change::{AssuredMode, ChangeRecord};
use crate::csn::{Csn, GroupId, ServerId};
use crate::error::ReplError;
use crate::topology::TopologyView;

/// How an assured write ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssuredOutcome {
    /// The requirement was met.
    Acknowledged {
        /// Servers whose ack counted.
        acked_by: Vec<ServerId>,
    },
    /// The deadline passed first. The write stays in the changelog.
    TimedOut {
        /// Required servers that never acked.
        missing: Vec<ServerId>,
    },
}

impl AssuredOutcome {
    /// True for [`AssuredOutcome::Acknowledged`].
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, AssuredOutcome::Acknowledged { .. })
    }

    /// Turn a timeout into [`ReplError::AssuredTimeout`].
    pub fn into_result(self, csn: Csn) -> Result<Vec<ServerId>, ReplError> {
        match self {
            AssuredOutcome::Acknowledged { acked_by } => Ok(acked_by),
            AssuredOutcome::TimedOut { missing } => Err(ReplError::AssuredTimeout { csn, missing }),
        }
    }
}

enum HandleState {
    Ready(AssuredOutcome),
    Waiting(oneshot::Receiver<AssuredOutcome>),
}

/// Future-like handle on one assured write, keyed by its CSN.
///
/// Dropping the handle does not cancel the write; the coordinator still
/// resolves it.
pub struct AssuredHandle {
    csn: Csn,
    state: HandleState,
}

impl AssuredHandle {
    fn ready(csn: Csn, outcome: AssuredOutcome) -> Self {
        Self {
            csn,
            state: HandleState::Ready(outcome),
        }
    }

    /// CSN of the write.
    pub fn csn(&self) -> Csn {
        self.csn
    }

    /// Wait for the outcome. Fails with `Shutdown` if the coordinator went
    /// away before resolving the write.
    pub async fn wait(self) -> Result<AssuredOutcome, ReplError> {
        match self.state {
            HandleState::Ready(outcome) => Ok(outcome),
            HandleState::Waiting(rx) => rx.await.map_err(|_| ReplError::Shutdown),
        }
    }
}

struct PendingAssuredWrite {
    originator: ServerId,
    mode: AssuredMode,
    group_id: GroupId,
    candidates: BTreeSet<ServerId>,
    received: BTreeSet<ServerId>,
    registered_at: Instant,
    deadline: Instant,
    tx: oneshot::Sender<AssuredOutcome>,
}

impl PendingAssuredWrite {
    /// Candidates still eligible in `view`. Never grows past the
    /// registration-time set.
    fn live_requirement(&self, view: &TopologyView) -> BTreeSet<ServerId> {
        let eligible = view.compute_required_acks(self.mode, self.group_id, self.originator);
        self.candidates.intersection(&eligible).copied().collect()
    }

    fn satisfied(&self, view: &TopologyView) -> bool {
        let live = self.live_requirement(view);
        match self.mode {
            AssuredMode::None => true,
            AssuredMode::SafeData => !self.received.is_empty() || live.is_empty(),
            AssuredMode::SafeRead => live.is_subset(&self.received),
        }
    }

    fn missing(&self) -> Vec<ServerId> {
        self.candidates.difference(&self.received).copied().collect()
    }
}

/// Tracks every unresolved assured write of this replication server.
pub struct AssuredCoordinator {
    timeout: Duration,
    pending: Mutex<BTreeMap<Csn, PendingAssuredWrite>>,
    deadline_added: Notify,
}

impl AssuredCoordinator {
    /// Coordinator whose writes time out after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: Mutex::new(BTreeMap::new()),
            deadline_added: Notify::new(),
        }
    }

    /// Configured assured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register `record`, received from `originator`, against `view`.
    pub fn register(&self, record: &ChangeRecord, originator: ServerId, view: &TopologyView) -> AssuredHandle {
        let csn = record.csn;
        if !record.assured_mode.is_assured() {
            return AssuredHandle::ready(csn, AssuredOutcome::Acknowledged { acked_by: Vec::new() });
        }
        let candidates = view.compute_required_acks(record.assured_mode, record.group_id, originator);
        if candidates.is_empty() {
            debug!(csn = %csn, "assured write has no eligible peers");
            return AssuredHandle::ready(csn, AssuredOutcome::Acknowledged { acked_by: Vec::new() });
        }

        let now = Instant::now();
        let (tx, rx) = oneshot::channel();
        debug!(csn = %csn, mode = ?record.assured_mode, required = ?candidates, "assured write registered");
        self.pending.lock().insert(
            csn,
            PendingAssuredWrite {
                originator,
                mode: record.assured_mode,
                group_id: record.group_id,
                candidates,
                received: BTreeSet::new(),
                registered_at: now,
                deadline: now + self.timeout,
                tx,
            },
        );
        self.deadline_added.notify_one();
        AssuredHandle {
            csn,
            state: HandleState::Waiting(rx),
        }
    }

    /// Record an ack from `server_id` for `csn`. Returns the ack latency
    /// when the ack counted towards a pending write.
    pub fn on_ack(&self, server_id: ServerId, csn: Csn, view: &TopologyView) -> Option<Duration> {
        let mut pending = self.pending.lock();
        let write = pending.get_mut(&csn)?;
        if !write.candidates.contains(&server_id) || !write.received.insert(server_id) {
            return None;
        }
        let latency = write.registered_at.elapsed();
        if write.satisfied(view) {
            if let Some(write) = pending.remove(&csn) {
                resolve_acknowledged(csn, write);
            }
        }
        Some(latency)
    }

    /// Drop a pending write without resolving it; its handle then fails
    /// with `Shutdown`. Used when the change never made it into the changelog.
    pub fn cancel(&self, csn: &Csn) -> bool {
        let removed = self.pending.lock().remove(csn).is_some();
        if removed {
            debug!(csn = %csn, "assured write cancelled");
        }
        removed
    }

    /// Recompute every requirement against `view`, resolving writes whose
    /// live requirement is now met. Returns the number resolved.
    pub fn reevaluate(&self, view: &TopologyView) -> usize {
        let mut pending = self.pending.lock();
        let done: Vec<Csn> = pending
            .iter()
            .filter(|(_, w)| w.satisfied(view))
            .map(|(csn, _)| *csn)
            .collect();
        for csn in &done {
            if let Some(write) = pending.remove(csn) {
                resolve_acknowledged(*csn, write);
            }
        }
        done.len()
    }

    /// Resolve every write whose deadline is at or before `now` as timed out.
    pub fn expire(&self, now: Instant) -> Vec<Csn> {
        let mut pending = self.pending.lock();
        let expired: Vec<Csn> = pending
            .iter()
            .filter(|(_, w)| w.deadline <= now)
            .map(|(csn, _)| *csn)
            .collect();
        for csn in &expired {
            if let Some(write) = pending.remove(csn) {
                let missing = write.missing();
                warn!(csn = %csn, missing = ?missing, "assured write timed out");
                let _ = write.tx.send(AssuredOutcome::TimedOut { missing });
            }
        }
        expired
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.lock().values().map(|w| w.deadline).min()
    }

    /// Sleep until the earliest deadline, expire, repeat. Stops when
    /// `shutdown` flips to true.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let added = self.deadline_added.notified();
            match self.next_deadline() {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {
                            self.expire(Instant::now());
                        }
                        _ = added => {}
                        res = shutdown.changed() => if res.is_err() { break },
                    }
                }
                None => {
                    tokio::select! {
                        _ = added => {}
                        res = shutdown.changed() => if res.is_err() { break },
                    }
                }
            }
        }
        debug!("assured sweeper stopped");
    }

    /// Unacked required writes per server.
    pub fn outstanding_by_peer(&self) -> HashMap<ServerId, usize> {
        let mut counts = HashMap::new();
        for write in self.pending.lock().values() {
            for id in write.candidates.difference(&write.received) {
                *counts.entry(*id).or_insert(0) += 1;
            }
        }
        counts
    }

    /// CSNs that purge must keep.
    pub fn pinned_csns(&self) -> HashSet<Csn> {
        self.pending.lock().keys().copied().collect()
    }

    /// Number of unresolved writes.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// True while `csn` is unresolved.
    pub fn is_pending(&self, csn: &Csn) -> bool {
        self.pending.lock().contains_key(csn)
    }
}

fn resolve_acknowledged(csn: Csn, write: PendingAssuredWrite) {
    let acked_by: Vec<ServerId> = write.received.iter().copied().collect();
    debug!(csn = %csn, acked_by = ?acked_by, "assured write acknowledged");
    let _ = write.tx.send(AssuredOutcome::Acknowledged { acked_by });
}
