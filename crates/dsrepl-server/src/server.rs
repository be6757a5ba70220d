//! The replication server context.
//!
//! One [`ReplicationServer`] owns everything a running server needs: the
//! changelog, one [`DomainContext`] per replicated domain, the registry of
//! connected peers, the degraded-status analyzer and the background tasks.
//! It is created by [`ReplicationServer::start`] and torn down by
//! [`ReplicationServer::shutdown`]; nothing lives in globals.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::assured::{AssuredCoordinator, AssuredOutcome};
use crate::changelog::ChangelogStore;
use crate::config::ReplServerConfig;
use crate::connection::{self, ServerHandle};
use crate::csn::{Csn, GroupId, ServerId};
use crate::degraded::{DegradedStatusAnalyzer, PeerHealth};
use crate::error::ReplError;
use crate::message::ReplMessage;
use crate::scheduler;
use crate::topology::{ServerRole, TopologyRouter, TopologyView};

/// Lifecycle of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    /// Accepting and replicating.
    Running,
    /// Shutdown requested; tasks are stopping.
    Draining,
    /// Changelog flushed, nothing running.
    Stopped,
}

/// Per-domain replication state.
pub struct DomainContext {
    /// Domain name.
    pub name: String,
    /// Servers known for this domain.
    pub topology: TopologyRouter,
    /// Unresolved assured writes of this domain.
    pub assured: Arc<AssuredCoordinator>,
    relays: DashMap<Csn, (ServerId, Instant)>,
}

impl DomainContext {
    /// Remember that assured change `csn` came from replication server `rs`,
    /// so acks from our directory servers can be sent back to it.
    pub(crate) fn remember_relay(&self, csn: Csn, rs: ServerId) {
        self.relays.insert(csn, (rs, Instant::now()));
    }

    /// Replication server that forwarded `csn`, if any.
    pub(crate) fn relay_target(&self, csn: &Csn) -> Option<ServerId> {
        self.relays.get(csn).map(|r| r.0)
    }

    /// Forget relay routes older than `max_age`.
    pub(crate) fn prune_relays(&self, now: Instant, max_age: Duration) -> usize {
        let before = self.relays.len();
        self.relays
            .retain(|_, (_, at)| now.saturating_duration_since(*at) <= max_age);
        before - self.relays.len()
    }
}

/// Counters of one server.
#[derive(Debug, Default)]
pub struct ServerStats {
    connections_accepted: AtomicU64,
    handshakes_rejected: AtomicU64,
    protocol_errors: AtomicU64,
    changes_received: AtomicU64,
    acks_received: AtomicU64,
    acks_relayed: AtomicU64,
    assured_acknowledged: AtomicU64,
    assured_timed_out: AtomicU64,
    purged_records: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerStatsSnapshot {
    /// Inbound TCP connections accepted.
    pub connections_accepted: u64,
    /// Handshakes refused or failed.
    pub handshakes_rejected: u64,
    /// Malformed frames or unexpected messages.
    pub protocol_errors: u64,
    /// Changes appended from peers.
    pub changes_received: u64,
    /// Acks received.
    pub acks_received: u64,
    /// Acks relayed to another replication server.
    pub acks_relayed: u64,
    /// Assured writes acknowledged in time.
    pub assured_acknowledged: u64,
    /// Assured writes that timed out.
    pub assured_timed_out: u64,
    /// Records removed by purge.
    pub purged_records: u64,
}

impl ServerStats {
    pub(crate) fn record_connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handshake_rejected(&self) {
        self.handshakes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_change_received(&self) {
        self.changes_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ack_received(&self) {
        self.acks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ack_relayed(&self) {
        self.acks_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_assured_outcome(&self, outcome: &AssuredOutcome) {
        let counter = if outcome.is_acknowledged() {
            &self.assured_acknowledged
        } else {
            &self.assured_timed_out
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_purged(&self, n: usize) {
        self.purged_records.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Copy the counters.
    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            handshakes_rejected: self.handshakes_rejected.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            changes_received: self.changes_received.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            acks_relayed: self.acks_relayed.load(Ordering::Relaxed),
            assured_acknowledged: self.assured_acknowledged.load(Ordering::Relaxed),
            assured_timed_out: self.assured_timed_out.load(Ordering::Relaxed),
            purged_records: self.purged_records.load(Ordering::Relaxed),
        }
    }
}

/// A connected peer as listed by [`ReplicationServer::connected_peers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Domain of the connection.
    pub domain: String,
    /// Peer id.
    pub server_id: ServerId,
    /// Peer group.
    pub group_id: GroupId,
    /// Directory server or replication server.
    pub role: ServerRole,
    /// Remote address.
    pub addr: SocketAddr,
}

/// A running replication server.
pub struct ReplicationServer {
    config: ReplServerConfig,
    store: Arc<ChangelogStore>,
    domains: DashMap<String, Arc<DomainContext>>,
    links: DashMap<(String, ServerId), Arc<ServerHandle>>,
    dialers: DashSet<(String, String)>,
    analyzer: DegradedStatusAnalyzer,
    stats: ServerStats,
    local_addr: SocketAddr,
    state: Mutex<LifecycleState>,
    shutdown_tx: watch::Sender<bool>,
    change_number_tx: watch::Sender<u64>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicationServer {
    /// Validate `config`, open the changelog, bind the listener and spawn
    /// the background tasks.
    pub async fn start(config: ReplServerConfig) -> Result<Arc<Self>, ReplError> {
        config.validate()?;
        let store = {
            let implementation = config.replication_db_implementation;
            let dir = config.replication_db_directory.clone();
            tokio::task::spawn_blocking(move || ChangelogStore::open(implementation, &dir))
                .await
                .map_err(|e| ReplError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??
        };
        for (domain, reason) in store.halted_domains() {
            warn!(domain = %domain, reason = %reason, "domain starts halted");
        }

        let listener = TcpListener::bind(config.listen_socket_addr()).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, _) = watch::channel(false);
        let (change_number_tx, _) = watch::channel(store.last_change_number());

        let server = Arc::new(Self {
            analyzer: DegradedStatusAnalyzer::new(config.degraded_status_threshold),
            config,
            store: Arc::new(store),
            domains: DashMap::new(),
            links: DashMap::new(),
            dialers: DashSet::new(),
            stats: ServerStats::default(),
            local_addr,
            state: Mutex::new(LifecycleState::Running),
            shutdown_tx,
            change_number_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let mut initial: Vec<String> = server.config.domains.clone();
        initial.extend(server.store.domains());
        for domain in initial {
            server.domain(&domain);
        }

        let accept = tokio::spawn(Arc::clone(&server).accept_loop(listener));
        let monitoring = tokio::spawn(scheduler::run_monitoring(Arc::clone(&server)));
        let purge = tokio::spawn(scheduler::run_purge(Arc::clone(&server)));
        server.tasks.lock().extend([accept, monitoring, purge]);

        info!(
            server_id = server.server_id(),
            addr = %local_addr,
            group_id = server.config.group_id,
            "replication server started"
        );
        Ok(server)
    }

    /// This server's id.
    pub fn server_id(&self) -> ServerId {
        self.config.replication_server_id
    }

    /// Configuration in use.
    pub fn config(&self) -> &ReplServerConfig {
        &self.config
    }

    /// Shared changelog.
    pub fn store(&self) -> &Arc<ChangelogStore> {
        &self.store
    }

    /// Bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Counters.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Degraded-status analyzer.
    pub fn analyzer(&self) -> &DegradedStatusAnalyzer {
        &self.analyzer
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Receiver that flips to true when shutdown starts.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Change-number watermark; only moves forward. Updated every monitoring
    /// period when `compute_change_number` is on.
    pub fn subscribe_change_number(&self) -> watch::Receiver<u64> {
        self.change_number_tx.subscribe()
    }

    pub(crate) fn publish_change_number(&self, n: u64) -> bool {
        self.change_number_tx.send_if_modified(|current| {
            if n > *current {
                *current = n;
                true
            } else {
                false
            }
        })
    }

    /// Context of `name`, created on first use together with its timeout
    /// sweeper and bootstrap dialers.
    pub fn domain(self: &Arc<Self>, name: &str) -> Arc<DomainContext> {
        if let Some(ctx) = self.domains.get(name) {
            return Arc::clone(ctx.value());
        }
        let mut created = false;
        let ctx = Arc::clone(
            self.domains
                .entry(name.to_string())
                .or_insert_with(|| {
                    created = true;
                    Arc::new(DomainContext {
                        name: name.to_string(),
                        topology: TopologyRouter::new(
                            self.server_id(),
                            self.config.group_id,
                            self.config.weight,
                            self.config.gossip_ttl(),
                        ),
                        assured: Arc::new(AssuredCoordinator::new(self.config.assured_timeout())),
                        relays: DashMap::new(),
                    })
                })
                .value(),
        );
        if created {
            debug!(domain = %name, "domain context created");
            let sweeper = tokio::spawn(Arc::clone(&ctx.assured).run_sweeper(self.shutdown_signal()));
            self.tasks.lock().push(sweeper);
            for addr in &self.config.replication_server {
                self.spawn_dialer(name, addr);
            }
        }
        ctx
    }

    /// Every domain context.
    pub fn domain_contexts(&self) -> Vec<Arc<DomainContext>> {
        self.domains.iter().map(|d| Arc::clone(d.value())).collect()
    }

    /// Snapshot of a domain's topology.
    pub fn topology(&self, domain: &str) -> Option<Arc<TopologyView>> {
        self.domains.get(domain).map(|d| d.topology.snapshot())
    }

    /// Weighted choice of a replication server for a new directory server.
    pub fn select_target_for_new_client(&self, domain: &str, group_id: GroupId) -> Option<ServerId> {
        self.domains
            .get(domain)
            .and_then(|d| d.topology.select_target_for_new_client(group_id))
    }

    /// Unresolved assured writes across all domains.
    pub fn pending_assured(&self) -> usize {
        self.domains.iter().map(|d| d.assured.pending_count()).sum()
    }

    /// Health of directly connected peers.
    pub fn peer_health(&self) -> Vec<(ServerId, PeerHealth)> {
        self.analyzer.snapshot()
    }

    /// Connected peers, ordered by domain then id.
    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .links
            .iter()
            .map(|l| PeerInfo {
                domain: l.domain.clone(),
                server_id: l.server_id,
                group_id: l.group_id,
                role: l.role,
                addr: l.addr,
            })
            .collect();
        peers.sort_by(|a, b| (&a.domain, a.server_id).cmp(&(&b.domain, b.server_id)));
        peers
    }

    /// Whether a new link to `existing`'s peer should take its place. Only
    /// crossed replication-server links are replaced: both sides keep the
    /// link dialed by the lower server id.
    pub(crate) fn replaces(&self, existing: &ServerHandle, role: ServerRole, outbound: bool) -> bool {
        let local = self.server_id();
        role == ServerRole::Rs
            && existing.role == ServerRole::Rs
            && preferred_link(local, existing.server_id, outbound)
            && !preferred_link(local, existing.server_id, existing.outbound)
    }

    pub(crate) fn link(&self, domain: &str, server_id: ServerId) -> Option<Arc<ServerHandle>> {
        self.links
            .get(&(domain.to_string(), server_id))
            .map(|l| Arc::clone(l.value()))
    }

    /// Add a handshaken peer. Fails if the same server is already connected
    /// for the domain, unless the new link wins a crossed dial; the losing
    /// connection is then evicted.
    pub(crate) fn register(self: &Arc<Self>, handle: Arc<ServerHandle>) -> Result<(), ReplError> {
        let key = (handle.domain.clone(), handle.server_id);
        match self.links.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut o) => {
                if !self.replaces(o.get(), handle.role, handle.outbound) {
                    self.stats.record_handshake_rejected();
                    return Err(ReplError::Handshake {
                        msg: format!("server {} already connected for {}", handle.server_id, handle.domain),
                    });
                }
                let old = o.insert(Arc::clone(&handle));
                info!(
                    server_id = handle.server_id,
                    domain = %handle.domain,
                    outbound = handle.outbound,
                    "crossed connection replaced"
                );
                old.evict();
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(Arc::clone(&handle));
            }
        }
        let ctx = self.domain(&handle.domain);
        ctx.topology
            .add_direct(handle.server_id, handle.group_id, handle.weight, handle.role);
        self.analyzer.track(handle.server_id);
        if let Some(status) = self.analyzer.status(handle.server_id) {
            ctx.topology.set_status(handle.server_id, status);
        }
        self.broadcast_topology(&ctx);
        Ok(())
    }

    /// Remove a peer whose connection ended and let everything that
    /// depended on it catch up.
    pub(crate) fn unregister(self: &Arc<Self>, handle: &Arc<ServerHandle>) {
        let key = (handle.domain.clone(), handle.server_id);
        if self
            .links
            .remove_if(&key, |_, current| Arc::ptr_eq(current, handle))
            .is_none()
        {
            return;
        }
        let ctx = self.domain(&handle.domain);
        let dropped = ctx.topology.remove_direct(handle.server_id);
        if !self.links.iter().any(|l| l.server_id == handle.server_id) {
            self.analyzer.forget(handle.server_id);
        }
        let resolved = ctx.assured.reevaluate(&ctx.topology.snapshot());
        debug!(
            server_id = handle.server_id,
            domain = %handle.domain,
            dropped = ?dropped,
            resolved,
            "peer removed from topology"
        );
        self.broadcast_topology(&ctx);
    }

    /// Send the domain's topology to its peers: the local fragment to
    /// replication servers, the full view to directory servers.
    pub(crate) fn broadcast_topology(&self, ctx: &DomainContext) {
        let fragment = ctx.topology.local_fragment();
        let full = ctx.topology.full_message();
        for link in self.links.iter().filter(|l| l.domain == ctx.name) {
            let msg = match link.role {
                ServerRole::Rs => fragment.clone(),
                ServerRole::Ds => full.clone(),
            };
            link.try_send_control(ReplMessage::Topology(msg));
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown_signal();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        self.stats.record_connection_accepted();
                        debug!(%addr, "connection accepted");
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = connection::run(server, stream, None).await {
                                debug!(%addr, error = %e, "inbound connection ended");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("listener stopped");
    }

    fn spawn_dialer(self: &Arc<Self>, domain: &str, addr: &str) {
        if !self.dialers.insert((domain.to_string(), addr.to_string())) {
            return;
        }
        let task = tokio::spawn(Arc::clone(self).dial_loop(domain.to_string(), addr.to_string()));
        self.tasks.lock().push(task);
    }

    /// Keep a connection to a bootstrap peer for `domain`, backing off
    /// exponentially (with jitter) between attempts.
    async fn dial_loop(self: Arc<Self>, domain: String, addr: String) {
        let mut shutdown = self.shutdown_signal();
        let base = self.config.reconnect_delay();
        let cap = self.config.max_reconnect_delay();
        let mut delay = base;
        loop {
            if *shutdown.borrow() {
                break;
            }
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    let started = Instant::now();
                    match connection::run(Arc::clone(&self), stream, Some(domain.clone())).await {
                        Ok(()) => debug!(%addr, domain = %domain, "outbound connection closed"),
                        Err(e) => debug!(%addr, domain = %domain, error = %e, "outbound connection ended"),
                    }
                    if started.elapsed() >= self.config.idle_timeout() {
                        delay = base;
                    }
                }
                Err(e) => warn!(%addr, domain = %domain, error = %e, "cannot reach replication server"),
            }
            let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
            tokio::select! {
                _ = tokio::time::sleep(delay + Duration::from_millis(jitter)) => {}
                _ = shutdown.changed() => break,
            }
            delay = (delay * 2).min(cap);
        }
        debug!(%addr, domain = %domain, "dialer stopped");
    }

    /// CSNs referenced by unresolved assured writes, across all domains.
    pub(crate) fn pinned_csns(&self) -> HashSet<Csn> {
        let mut pinned = HashSet::new();
        for ctx in self.domains.iter() {
            pinned.extend(ctx.assured.pinned_csns());
        }
        pinned
    }

    /// Outstanding assured acks per server, across all domains.
    pub(crate) fn outstanding_by_peer(&self) -> HashMap<ServerId, usize> {
        let mut total = HashMap::new();
        for ctx in self.domains.iter() {
            for (id, n) in ctx.assured.outstanding_by_peer() {
                *total.entry(id).or_insert(0) += n;
            }
        }
        total
    }

    /// Stop every task, close every window and flush the changelog.
    /// Pending assured writes are not resolved early.
    pub async fn shutdown(&self) -> Result<(), ReplError> {
        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Running {
                return Ok(());
            }
            *state = LifecycleState::Draining;
        }
        info!(server_id = self.server_id(), "replication server draining");
        self.shutdown_tx.send_replace(true);
        for link in self.links.iter() {
            link.window().close();
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), &mut task).await.is_err() {
                task.abort();
            }
        }

        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.flush())
            .await
            .map_err(|e| ReplError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        *self.state.lock() = LifecycleState::Stopped;
        info!(server_id = self.server_id(), "replication server stopped");
        Ok(())
    }
}

/// True if a link between `local` and `peer` in this direction is the one
/// both sides keep.
fn preferred_link(local: ServerId, peer: ServerId, outbound: bool) -> bool {
    if outbound {
        local < peer
    } else {
        peer < local
    }
}
