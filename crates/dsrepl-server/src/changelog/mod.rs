//! Durable, ordered changelog shared by every connection of the server.
//!
//! Records are kept per domain and per originating server. Appends for one
//! origin are serialized by that origin's writer lock; appends for different
//! origins proceed concurrently. Readers never take a writer lock: they read
//! the in-memory index and park on the domain's watch channel until the next
//! append is published.

pub mod backend;

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::change::ChangeRecord;
use crate::csn::{now_ms, Csn, ServerId, ServerState};
use crate::error::ReplError;
use backend::{ChangelogBackend, StorageRoot};

pub use backend::DbImplementation;

/// A change as held by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredChange {
    /// Server-local position, increasing across all domains.
    pub change_number: u64,
    /// True if the change was received from another replication server.
    pub via_replication_server: bool,
    /// The change itself.
    pub record: ChangeRecord,
}

struct OriginWriter {
    last_csn: Option<Csn>,
    backend: Box<dyn ChangelogBackend>,
}

struct OriginLog {
    writer: Mutex<OriginWriter>,
    index: RwLock<BTreeMap<Csn, (u64, Arc<StoredChange>)>>,
}

#[derive(Default)]
struct Arrivals {
    next_seq: u64,
    entries: BTreeMap<u64, Arc<StoredChange>>,
}

struct DomainChangelog {
    name: String,
    origins: DashMap<ServerId, Arc<OriginLog>>,
    arrivals: RwLock<Arrivals>,
    published: watch::Sender<u64>,
    halted: RwLock<Option<String>>,
}

impl DomainChangelog {
    fn new(name: &str) -> Self {
        let (published, _) = watch::channel(0);
        Self {
            name: name.to_string(),
            origins: DashMap::new(),
            arrivals: RwLock::new(Arrivals::default()),
            published,
            halted: RwLock::new(None),
        }
    }

    fn check_halted(&self) -> Result<(), ReplError> {
        match self.halted.read().as_ref() {
            Some(msg) => Err(ReplError::ChangelogCorruption {
                domain: self.name.clone(),
                msg: msg.clone(),
            }),
            None => Ok(()),
        }
    }

    fn halt(&self, msg: String) {
        error!(domain = %self.name, reason = %msg, "replication halted for domain");
        *self.halted.write() = Some(msg);
        self.published.send_modify(|_| {});
    }

    /// Publish a change to readers. Must be called with the origin's writer
    /// lock held so arrival order follows CSN order within the origin.
    fn publish(&self, origin: &OriginLog, change: Arc<StoredChange>) {
        let seq = {
            let mut arrivals = self.arrivals.write();
            let seq = arrivals.next_seq;
            arrivals.next_seq += 1;
            arrivals.entries.insert(seq, Arc::clone(&change));
            seq
        };
        origin
            .index
            .write()
            .insert(change.record.csn, (seq, Arc::clone(&change)));
        self.published.send_replace(seq);
    }
}

/// The changelog of one replication server.
pub struct ChangelogStore {
    root: StorageRoot,
    domains: DashMap<String, Arc<DomainChangelog>>,
    last_change_number: AtomicU64,
}

impl ChangelogStore {
    /// A store that keeps everything in memory.
    pub fn in_memory() -> Self {
        Self {
            root: StorageRoot::Memory,
            domains: DashMap::new(),
            last_change_number: AtomicU64::new(0),
        }
    }

    /// Open the store, replaying any logs already present in `dir`.
    ///
    /// A damaged log halts its domain (reported through [`halted_domains`]
    /// and [`ReplError::ChangelogCorruption`] on use); it does not fail the open.
    ///
    /// [`halted_domains`]: ChangelogStore::halted_domains
    pub fn open(implementation: DbImplementation, dir: &Path) -> Result<Self, ReplError> {
        let store = Self {
            root: StorageRoot::new(implementation, dir),
            domains: DashMap::new(),
            last_change_number: AtomicU64::new(0),
        };

        let mut loaded: BTreeMap<String, Vec<(ServerId, Vec<StoredChange>)>> = BTreeMap::new();
        for log in store.root.discover()? {
            let domain = store.domain(&log.domain);
            match log.changes {
                Ok(changes) => {
                    if let Some(bad) = changes.iter().find(|c| c.record.origin() != log.server_id) {
                        domain.halt(format!(
                            "log of server {} contains record {} of another origin",
                            log.server_id, bad.record.csn
                        ));
                        continue;
                    }
                    loaded
                        .entry(log.domain)
                        .or_default()
                        .push((log.server_id, changes));
                }
                Err(msg) => domain.halt(msg),
            }
        }

        for (name, logs) in loaded {
            let domain = store.domain(&name);
            if domain.check_halted().is_err() {
                continue;
            }
            let mut all: Vec<Arc<StoredChange>> = Vec::new();
            for (server_id, changes) in logs {
                let writer = OriginWriter {
                    last_csn: changes.last().map(|c| c.record.csn),
                    backend: store.root.open_log(&name, server_id)?,
                };
                domain.origins.insert(
                    server_id,
                    Arc::new(OriginLog {
                        writer: Mutex::new(writer),
                        index: RwLock::new(BTreeMap::new()),
                    }),
                );
                all.extend(changes.into_iter().map(Arc::new));
            }
            all.sort_by_key(|c| c.change_number);
            let count = all.len();
            for change in all {
                store
                    .last_change_number
                    .fetch_max(change.change_number, Ordering::AcqRel);
                let origin = domain
                    .origins
                    .get(&change.record.origin())
                    .map(|o| Arc::clone(o.value()));
                if let Some(origin) = origin {
                    domain.publish(&origin, change);
                }
            }
            info!(domain = %name, records = count, "changelog replayed");
        }

        Ok(store)
    }

    fn domain(&self, name: &str) -> Arc<DomainChangelog> {
        if let Some(d) = self.domains.get(name) {
            return Arc::clone(d.value());
        }
        Arc::clone(
            self.domains
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(DomainChangelog::new(name)))
                .value(),
        )
    }

    fn origin(&self, domain: &DomainChangelog, server_id: ServerId) -> Result<Arc<OriginLog>, ReplError> {
        if let Some(o) = domain.origins.get(&server_id) {
            return Ok(Arc::clone(o.value()));
        }
        let backend = self.root.open_log(&domain.name, server_id)?;
        Ok(Arc::clone(
            domain
                .origins
                .entry(server_id)
                .or_insert_with(|| {
                    Arc::new(OriginLog {
                        writer: Mutex::new(OriginWriter {
                            last_csn: None,
                            backend,
                        }),
                        index: RwLock::new(BTreeMap::new()),
                    })
                })
                .value(),
        ))
    }

    /// Append a record. Fails with [`ReplError::OutOfOrderCsn`] unless its CSN
    /// is strictly greater than the last one stored for its origin; the store
    /// is left unchanged in that case. The change is durable before it is
    /// visible to readers.
    pub fn append(
        &self,
        record: ChangeRecord,
        via_replication_server: bool,
    ) -> Result<Arc<StoredChange>, ReplError> {
        let domain = self.domain(&record.domain);
        domain.check_halted()?;
        let origin = self.origin(&domain, record.origin())?;

        let mut writer = origin.writer.lock();
        if let Some(last) = writer.last_csn {
            if record.csn <= last {
                return Err(ReplError::OutOfOrderCsn {
                    domain: record.domain,
                    server_id: record.csn.server_id,
                    last,
                    got: record.csn,
                });
            }
        }

        let change = Arc::new(StoredChange {
            change_number: self.last_change_number.fetch_add(1, Ordering::AcqRel) + 1,
            via_replication_server,
            record,
        });
        if let Err(e) = writer.backend.append(&change) {
            domain.halt(format!("append of {} failed: {}", change.record.csn, e));
            return Err(e);
        }
        writer.last_csn = Some(change.record.csn);
        domain.publish(&origin, Arc::clone(&change));
        drop(writer);

        debug!(
            domain = %change.record.domain,
            csn = %change.record.csn,
            change_number = change.change_number,
            "change appended"
        );
        Ok(change)
    }

    /// Tailing read of one origin's records with CSN greater than `after`.
    pub fn read_from(
        &self,
        domain: &str,
        server_id: ServerId,
        after: Csn,
    ) -> Result<ChangelogCursor, ReplError> {
        let domain = self.domain(domain);
        domain.check_halted()?;
        let updates = domain.published.subscribe();
        Ok(ChangelogCursor {
            domain,
            server_id,
            position: after,
            updates,
        })
    }

    /// Tailing read of every record of a domain in arrival order, skipping
    /// whatever `since` already covers.
    pub fn feed(&self, domain: &str, since: ServerState) -> Result<DomainFeed, ReplError> {
        let domain = self.domain(domain);
        domain.check_halted()?;
        let updates = domain.published.subscribe();
        Ok(DomainFeed {
            domain,
            next_seq: 0,
            since,
            updates,
        })
    }

    /// Remove records older than `age` across all domains. See
    /// [`purge_before`](ChangelogStore::purge_before).
    pub fn purge_older_than(&self, age: Duration, pinned: &HashSet<Csn>) -> Result<usize, ReplError> {
        let cutoff_ms = now_ms().saturating_sub(age.as_millis() as u64);
        self.purge_before(cutoff_ms, pinned)
    }

    /// Remove records whose CSN time is below `cutoff_ms`. Within an origin,
    /// purge stops at the first pinned record and always keeps the newest
    /// record so the origin's last CSN survives a restart.
    pub fn purge_before(&self, cutoff_ms: u64, pinned: &HashSet<Csn>) -> Result<usize, ReplError> {
        let domains: Vec<Arc<DomainChangelog>> =
            self.domains.iter().map(|d| Arc::clone(d.value())).collect();

        let mut removed_total = 0;
        for domain in domains {
            if domain.check_halted().is_err() {
                continue;
            }
            let origins: Vec<Arc<OriginLog>> =
                domain.origins.iter().map(|o| Arc::clone(o.value())).collect();
            for origin in origins {
                let mut writer = origin.writer.lock();
                let doomed: Vec<(Csn, u64)> = {
                    let index = origin.index.read();
                    let keep_last = index.len().saturating_sub(1);
                    index
                        .iter()
                        .take(keep_last)
                        .take_while(|(csn, _)| csn.time_ms < cutoff_ms && !pinned.contains(csn))
                        .map(|(csn, (seq, _))| (*csn, *seq))
                        .collect()
                };
                if doomed.is_empty() {
                    continue;
                }

                let retained: Vec<Arc<StoredChange>> = {
                    let mut index = origin.index.write();
                    for (csn, _) in &doomed {
                        index.remove(csn);
                    }
                    index.values().map(|(_, c)| Arc::clone(c)).collect()
                };
                {
                    let mut arrivals = domain.arrivals.write();
                    for (_, seq) in &doomed {
                        arrivals.entries.remove(seq);
                    }
                }
                if let Err(e) = writer.backend.rewrite(&retained) {
                    domain.halt(format!("compaction failed: {}", e));
                    return Err(e);
                }
                removed_total += doomed.len();
            }
        }
        if removed_total > 0 {
            info!(removed = removed_total, cutoff_ms, "changelog purged");
        }
        Ok(removed_total)
    }

    /// Highest CSN stored per origin for a domain.
    pub fn server_state(&self, domain: &str) -> ServerState {
        let mut state = ServerState::new();
        if let Some(d) = self.domains.get(domain) {
            for origin in d.origins.iter() {
                if let Some(csn) = origin.writer.lock().last_csn {
                    state.update(csn);
                }
            }
        }
        state
    }

    /// Last CSN stored for one origin.
    pub fn last_csn(&self, domain: &str, server_id: ServerId) -> Option<Csn> {
        let d = self.domains.get(domain)?;
        let origin = d.origins.get(&server_id)?;
        let last = origin.writer.lock().last_csn;
        last
    }

    /// Number of records currently held for a domain.
    pub fn record_count(&self, domain: &str) -> usize {
        self.domains
            .get(domain)
            .map(|d| d.arrivals.read().entries.len())
            .unwrap_or(0)
    }

    /// Known domains.
    pub fn domains(&self) -> Vec<String> {
        let mut names: Vec<String> = self.domains.iter().map(|d| d.key().clone()).collect();
        names.sort();
        names
    }

    /// Domains halted by a data-integrity failure, with the reason.
    pub fn halted_domains(&self) -> Vec<(String, String)> {
        let mut halted: Vec<(String, String)> = self
            .domains
            .iter()
            .filter_map(|d| d.halted.read().clone().map(|msg| (d.key().clone(), msg)))
            .collect();
        halted.sort();
        halted
    }

    /// Change number of the most recent append.
    pub fn last_change_number(&self) -> u64 {
        self.last_change_number.load(Ordering::Acquire)
    }

    /// Flush every backend.
    pub fn flush(&self) -> Result<(), ReplError> {
        for domain in self.domains.iter() {
            for origin in domain.origins.iter() {
                origin.writer.lock().backend.flush()?;
            }
        }
        Ok(())
    }
}

/// Tailing cursor over one origin's records, in CSN order.
pub struct ChangelogCursor {
    domain: Arc<DomainChangelog>,
    server_id: ServerId,
    position: Csn,
    updates: watch::Receiver<u64>,
}

impl ChangelogCursor {
    /// Next record if one is already stored.
    pub fn try_next(&mut self) -> Result<Option<Arc<StoredChange>>, ReplError> {
        self.domain.check_halted()?;
        let origin = match self.domain.origins.get(&self.server_id) {
            Some(o) => Arc::clone(o.value()),
            None => return Ok(None),
        };
        let index = origin.index.read();
        let next = index
            .range((std::ops::Bound::Excluded(self.position), std::ops::Bound::Unbounded))
            .next()
            .map(|(_, (_, change))| Arc::clone(change));
        if let Some(change) = &next {
            self.position = change.record.csn;
        }
        Ok(next)
    }

    /// Next record, waiting for one to be appended if necessary.
    pub async fn next(&mut self) -> Result<Arc<StoredChange>, ReplError> {
        loop {
            self.updates.borrow_and_update();
            if let Some(change) = self.try_next()? {
                return Ok(change);
            }
            self.updates.changed().await.map_err(|_| ReplError::Shutdown)?;
        }
    }

    /// CSN of the last record returned (or the starting cursor).
    pub fn position(&self) -> Csn {
        self.position
    }
}

/// Tailing feed over a whole domain in arrival order.
pub struct DomainFeed {
    domain: Arc<DomainChangelog>,
    next_seq: u64,
    since: ServerState,
    updates: watch::Receiver<u64>,
}

impl DomainFeed {
    /// Next record if one is already stored.
    pub fn try_next(&mut self) -> Result<Option<Arc<StoredChange>>, ReplError> {
        self.domain.check_halted()?;
        let arrivals = self.domain.arrivals.read();
        for (seq, change) in arrivals.entries.range(self.next_seq..) {
            self.next_seq = seq + 1;
            if self.since.covers(&change.record.csn) {
                continue;
            }
            return Ok(Some(Arc::clone(change)));
        }
        Ok(None)
    }

    /// Next record, waiting for one to be appended if necessary.
    pub async fn next(&mut self) -> Result<Arc<StoredChange>, ReplError> {
        loop {
            self.updates.borrow_and_update();
            if let Some(change) = self.try_next()? {
                return Ok(change);
            }
            self.updates.changed().await.map_err(|_| ReplError::Shutdown)?;
        }
    }

    /// Domain this feed reads.
    pub fn domain(&self) -> &str {
        &self.domain.name
    }
}
