//! Server topology: who is connected, in which group, with which weight and
//! status.
//!
//! The view is rebuilt from direct connections plus gossip from peer
//! replication servers. Updates swap in a fresh `Arc<TopologyView>` so a
//! reader always works on one consistent snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::change::AssuredMode;
use crate::csn::{GroupId, ServerId};
use crate::message::{TopologyEntry, TopologyMessage};

/// Kind of peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerRole {
    /// Directory server replica.
    Ds,
    /// Replication server.
    Rs,
}

/// Health of a server as seen by the assured-replication machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ServerStatus {
    /// Keeping up with acknowledgments.
    #[default]
    Normal,
    /// Falling behind; excluded from blocking requirements.
    Degraded,
}

/// How an entry got into the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// This replication server.
    Local,
    /// A peer with a live connection to this server.
    Direct,
    /// Reported by the replication server `via`.
    Gossip {
        /// Replication server that advertised the entry.
        via: ServerId,
    },
}

/// One server in the view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSummary {
    /// Server id.
    pub server_id: ServerId,
    /// Group id.
    pub group_id: GroupId,
    /// Routing weight.
    pub weight: u32,
    /// Directory or replication server.
    pub role: ServerRole,
    /// Normal or degraded.
    pub status: ServerStatus,
    /// Where the entry came from.
    pub provenance: Provenance,
    /// Last time the entry was confirmed.
    pub last_seen: Instant,
}

impl ServerSummary {
    fn to_entry(&self) -> TopologyEntry {
        TopologyEntry {
            server_id: self.server_id,
            group_id: self.group_id,
            weight: self.weight,
            status: self.status,
            role: self.role,
        }
    }
}

/// Immutable snapshot of the known servers.
#[derive(Debug, Clone)]
pub struct TopologyView {
    local_id: ServerId,
    servers: BTreeMap<ServerId, ServerSummary>,
}

impl TopologyView {
    /// This replication server's id.
    pub fn local_id(&self) -> ServerId {
        self.local_id
    }

    /// Look up one server.
    pub fn get(&self, server_id: ServerId) -> Option<&ServerSummary> {
        self.servers.get(&server_id)
    }

    /// All servers, ordered by id.
    pub fn servers(&self) -> impl Iterator<Item = &ServerSummary> {
        self.servers.values()
    }

    /// Number of known servers, including the local one.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// True if no server is known.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Servers whose acknowledgment an assured write from `originator` in
    /// `group_id` may wait on. The local replication server and the
    /// originator are never included, and degraded servers are skipped.
    pub fn compute_required_acks(
        &self,
        mode: AssuredMode,
        group_id: GroupId,
        originator: ServerId,
    ) -> BTreeSet<ServerId> {
        let eligible = self.servers.values().filter(|s| {
            s.server_id != self.local_id
                && s.server_id != originator
                && s.status == ServerStatus::Normal
        });
        match mode {
            AssuredMode::None => BTreeSet::new(),
            AssuredMode::SafeData => eligible
                .filter(|s| s.group_id == group_id)
                .map(|s| s.server_id)
                .collect(),
            AssuredMode::SafeRead => eligible.map(|s| s.server_id).collect(),
        }
    }

    fn entries(&self, filter: impl Fn(&ServerSummary) -> bool) -> Vec<TopologyEntry> {
        self.servers
            .values()
            .filter(|s| filter(s))
            .map(ServerSummary::to_entry)
            .collect()
    }
}

/// Maintains the local topology view and answers routing questions.
pub struct TopologyRouter {
    view: RwLock<Arc<TopologyView>>,
    gossip_ttl: Duration,
}

impl TopologyRouter {
    /// Create a router whose view initially holds only the local server.
    pub fn new(local_id: ServerId, group_id: GroupId, weight: u32, gossip_ttl: Duration) -> Self {
        let mut servers = BTreeMap::new();
        servers.insert(
            local_id,
            ServerSummary {
                server_id: local_id,
                group_id,
                weight,
                role: ServerRole::Rs,
                status: ServerStatus::Normal,
                provenance: Provenance::Local,
                last_seen: Instant::now(),
            },
        );
        Self {
            view: RwLock::new(Arc::new(TopologyView { local_id, servers })),
            gossip_ttl,
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<TopologyView> {
        Arc::clone(&self.view.read())
    }

    fn update<R>(&self, f: impl FnOnce(&mut TopologyView) -> R) -> R {
        let mut guard = self.view.write();
        let mut next = TopologyView::clone(&guard);
        let result = f(&mut next);
        *guard = Arc::new(next);
        result
    }

    /// Register a directly connected peer.
    pub fn add_direct(&self, server_id: ServerId, group_id: GroupId, weight: u32, role: ServerRole) {
        self.update(|view| {
            view.servers.insert(
                server_id,
                ServerSummary {
                    server_id,
                    group_id,
                    weight,
                    role,
                    status: ServerStatus::Normal,
                    provenance: Provenance::Direct,
                    last_seen: Instant::now(),
                },
            );
        });
    }

    /// Drop a disconnected peer and every entry only it advertised.
    /// Returns the ids removed.
    pub fn remove_direct(&self, server_id: ServerId) -> Vec<ServerId> {
        self.update(|view| {
            let removed: Vec<ServerId> = view
                .servers
                .values()
                .filter(|s| match s.provenance {
                    Provenance::Direct => s.server_id == server_id,
                    Provenance::Gossip { via } => via == server_id,
                    Provenance::Local => false,
                })
                .map(|s| s.server_id)
                .collect();
            for id in &removed {
                view.servers.remove(id);
            }
            removed
        })
    }

    /// Merge a topology broadcast from replication server `msg.from`.
    /// Direct and local entries are never overridden; entries previously
    /// advertised by the same sender but now absent are dropped.
    pub fn apply_gossip(&self, msg: &TopologyMessage) {
        let now = Instant::now();
        self.update(|view| {
            let advertised: BTreeSet<ServerId> = msg.servers.iter().map(|e| e.server_id).collect();
            view.servers.retain(|id, s| match s.provenance {
                Provenance::Gossip { via } if via == msg.from => advertised.contains(id),
                _ => true,
            });
            for entry in &msg.servers {
                match view.servers.get(&entry.server_id).map(|s| s.provenance) {
                    Some(Provenance::Local) | Some(Provenance::Direct) => continue,
                    _ => {}
                }
                view.servers.insert(
                    entry.server_id,
                    ServerSummary {
                        server_id: entry.server_id,
                        group_id: entry.group_id,
                        weight: entry.weight,
                        role: entry.role,
                        status: entry.status,
                        provenance: Provenance::Gossip { via: msg.from },
                        last_seen: now,
                    },
                );
            }
        });
        debug!(from = msg.from, entries = msg.servers.len(), "topology gossip applied");
    }

    /// Drop gossip entries not refreshed within the TTL. Returns the ids removed.
    pub fn expire_gossip(&self, now: Instant) -> Vec<ServerId> {
        let ttl = self.gossip_ttl;
        let stale: Vec<ServerId> = self
            .snapshot()
            .servers
            .values()
            .filter(|s| {
                matches!(s.provenance, Provenance::Gossip { .. })
                    && now.saturating_duration_since(s.last_seen) > ttl
            })
            .map(|s| s.server_id)
            .collect();
        if stale.is_empty() {
            return stale;
        }
        self.update(|view| {
            for id in &stale {
                view.servers.remove(id);
            }
        });
        stale
    }

    /// Change a server's status. Returns true if it changed.
    pub fn set_status(&self, server_id: ServerId, status: ServerStatus) -> bool {
        if self
            .snapshot()
            .get(server_id)
            .map(|s| s.status == status)
            .unwrap_or(true)
        {
            return false;
        }
        self.update(|view| match view.servers.get_mut(&server_id) {
            Some(s) => {
                s.status = status;
                true
            }
            None => false,
        })
    }

    /// Pick a replication server for a new directory-server connection in
    /// `group_id`, proportionally to weight. Falls back to every normal
    /// replication server when none is in the group.
    pub fn select_target_for_new_client(&self, group_id: GroupId) -> Option<ServerId> {
        self.select_target_with_rng(group_id, &mut rand::thread_rng())
    }

    /// [`select_target_for_new_client`](Self::select_target_for_new_client)
    /// with an explicit random source.
    pub fn select_target_with_rng<R: Rng + ?Sized>(&self, group_id: GroupId, rng: &mut R) -> Option<ServerId> {
        let view = self.snapshot();
        let live: Vec<&ServerSummary> = view
            .servers
            .values()
            .filter(|s| s.role == ServerRole::Rs && s.status == ServerStatus::Normal && s.weight > 0)
            .collect();
        let in_group: Vec<&ServerSummary> =
            live.iter().copied().filter(|s| s.group_id == group_id).collect();
        let candidates = if in_group.is_empty() { live } else { in_group };
        if candidates.is_empty() {
            return None;
        }
        let dist = WeightedIndex::new(candidates.iter().map(|s| s.weight)).ok()?;
        Some(candidates[dist.sample(rng)].server_id)
    }

    /// What this server advertises to replication-server peers: itself and
    /// its direct connections.
    pub fn local_fragment(&self) -> TopologyMessage {
        let view = self.snapshot();
        TopologyMessage {
            from: view.local_id,
            servers: view.entries(|s| !matches!(s.provenance, Provenance::Gossip { .. })),
        }
    }

    /// Everything this server knows, sent to directory servers.
    pub fn full_message(&self) -> TopologyMessage {
        let view = self.snapshot();
        TopologyMessage {
            from: view.local_id,
            servers: view.entries(|_| true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn router() -> TopologyRouter {
        TopologyRouter::new(100, 1, 1, Duration::from_secs(9))
    }

    fn entry(id: ServerId, group: GroupId, role: ServerRole) -> TopologyEntry {
        TopologyEntry {
            server_id: id,
            group_id: group,
            weight: 1,
            status: ServerStatus::Normal,
            role,
        }
    }

    #[test]
    fn test_required_acks_safe_data_is_group_scoped() {
        let r = router();
        r.add_direct(1, 1, 1, ServerRole::Ds);
        r.add_direct(2, 1, 1, ServerRole::Ds);
        r.add_direct(3, 2, 1, ServerRole::Ds);
        let view = r.snapshot();
        let req = view.compute_required_acks(AssuredMode::SafeData, 1, 1);
        assert_eq!(req.into_iter().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_required_acks_safe_read_skips_degraded() {
        let r = router();
        r.add_direct(1, 1, 1, ServerRole::Ds);
        r.add_direct(2, 1, 1, ServerRole::Ds);
        r.add_direct(3, 2, 1, ServerRole::Ds);
        assert!(r.set_status(3, ServerStatus::Degraded));
        let req = r.snapshot().compute_required_acks(AssuredMode::SafeRead, 1, 1);
        assert_eq!(req.into_iter().collect::<Vec<_>>(), vec![2]);
        assert!(r
            .snapshot()
            .compute_required_acks(AssuredMode::None, 1, 1)
            .is_empty());
    }

    #[test]
    fn test_snapshot_is_stable_across_updates() {
        let r = router();
        let before = r.snapshot();
        r.add_direct(5, 1, 1, ServerRole::Rs);
        assert!(before.get(5).is_none());
        assert!(r.snapshot().get(5).is_some());
    }

    #[test]
    fn test_gossip_never_overrides_direct() {
        let r = router();
        r.add_direct(5, 1, 1, ServerRole::Ds);
        let mut degraded = entry(5, 1, ServerRole::Ds);
        degraded.status = ServerStatus::Degraded;
        r.apply_gossip(&TopologyMessage {
            from: 200,
            servers: vec![degraded, entry(6, 1, ServerRole::Ds)],
        });
        let view = r.snapshot();
        assert_eq!(view.get(5).unwrap().status, ServerStatus::Normal);
        assert_eq!(view.get(6).unwrap().provenance, Provenance::Gossip { via: 200 });
    }

    #[test]
    fn test_gossip_replaces_previous_fragment() {
        let r = router();
        r.apply_gossip(&TopologyMessage {
            from: 200,
            servers: vec![entry(200, 1, ServerRole::Rs), entry(6, 1, ServerRole::Ds)],
        });
        r.apply_gossip(&TopologyMessage {
            from: 200,
            servers: vec![entry(200, 1, ServerRole::Rs)],
        });
        assert!(r.snapshot().get(6).is_none());
    }

    #[test]
    fn test_remove_direct_drops_gossip_from_that_peer() {
        let r = router();
        r.add_direct(200, 1, 1, ServerRole::Rs);
        r.apply_gossip(&TopologyMessage {
            from: 200,
            servers: vec![entry(7, 1, ServerRole::Ds), entry(8, 2, ServerRole::Ds)],
        });
        assert_eq!(r.snapshot().len(), 4);
        let mut removed = r.remove_direct(200);
        removed.sort();
        assert_eq!(removed, vec![7, 8, 200]);
        assert_eq!(r.snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_gossip_expires() {
        let r = router();
        r.apply_gossip(&TopologyMessage {
            from: 200,
            servers: vec![entry(7, 1, ServerRole::Ds)],
        });
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(r.expire_gossip(Instant::now()).is_empty());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(r.expire_gossip(Instant::now()), vec![7]);
        assert_eq!(r.snapshot().len(), 1);
    }

    #[test]
    fn test_weighted_selection_is_proportional() {
        let r = TopologyRouter::new(100, 1, 1, Duration::from_secs(9));
        r.set_status(100, ServerStatus::Degraded);
        r.add_direct(1, 1, 2, ServerRole::Rs);
        r.add_direct(2, 1, 1, ServerRole::Rs);
        let mut rng = StdRng::seed_from_u64(42);
        let mut a = 0;
        let mut b = 0;
        for _ in 0..300 {
            match r.select_target_with_rng(1, &mut rng) {
                Some(1) => a += 1,
                Some(2) => b += 1,
                other => panic!("unexpected target {:?}", other),
            }
        }
        assert!((160..=240).contains(&a), "A selected {} times", a);
        assert!((60..=140).contains(&b), "B selected {} times", b);
    }

    #[test]
    fn test_selection_skips_degraded_and_ds() {
        let r = router();
        r.add_direct(1, 2, 5, ServerRole::Rs);
        r.add_direct(2, 2, 5, ServerRole::Ds);
        r.add_direct(3, 2, 5, ServerRole::Rs);
        r.set_status(3, ServerStatus::Degraded);
        for _ in 0..20 {
            assert_eq!(r.select_target_for_new_client(2), Some(1));
        }
        // No replication server in group 9: any normal one will do.
        let fallback = r.select_target_for_new_client(9).unwrap();
        assert!(fallback == 1 || fallback == 100);
    }

    #[test]
    fn test_fragment_excludes_gossip() {
        let r = router();
        r.add_direct(1, 1, 1, ServerRole::Ds);
        r.apply_gossip(&TopologyMessage {
            from: 200,
            servers: vec![entry(7, 1, ServerRole::Ds)],
        });
        let ids: Vec<ServerId> = r.local_fragment().servers.iter().map(|e| e.server_id).collect();
        assert_eq!(ids, vec![1, 100]);
        assert_eq!(r.full_message().servers.len(), 3);
    }
}
