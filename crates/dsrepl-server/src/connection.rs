//! Server connection: one actor per (domain, peer).
//!
//! After the hello exchange the connection runs four concurrent parts:
//! the reader (this task), a writer that owns the socket's write half, a
//! feed that streams the changelog to the peer through the flow-control
//! window, and a heartbeat loop that also detects a silent peer. Any part
//! failing tears the whole connection down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::change::ChangeRecord;
use crate::changelog::ChangelogStore;
use crate::csn::{GroupId, ServerId};
use crate::error::ReplError;
use crate::message::{read_message, write_message, AckMessage, HelloMessage, ReplMessage, PROTOCOL_VERSION};
use crate::server::{DomainContext, ReplicationServer};
use crate::topology::ServerRole;
use crate::window::FlowControlWindow;

/// A connected peer. Created on handshake, dropped on teardown.
pub struct ServerHandle {
    /// Peer id.
    pub server_id: ServerId,
    /// Peer group.
    pub group_id: GroupId,
    /// Peer routing weight.
    pub weight: u32,
    /// Directory server or replication server.
    pub role: ServerRole,
    /// Domain replicated over this connection.
    pub domain: String,
    /// Remote socket address.
    pub addr: SocketAddr,
    /// When the handshake completed.
    pub connected_at: Instant,
    /// True if we dialed the peer.
    pub outbound: bool,
    window: FlowControlWindow,
    control_tx: mpsc::Sender<ReplMessage>,
    data_tx: mpsc::Sender<ReplMessage>,
    evicted: Notify,
}

type Queues = (mpsc::Receiver<ReplMessage>, mpsc::Receiver<ReplMessage>);

impl ServerHandle {
    /// Handle for a peer that sent `peer`, with its control and data queues.
    pub(crate) fn new(
        peer: &HelloMessage,
        addr: SocketAddr,
        outbound: bool,
        queue_size: usize,
    ) -> (Arc<Self>, Queues) {
        let (control_tx, control_rx) = mpsc::channel(queue_size);
        let (data_tx, data_rx) = mpsc::channel(queue_size);
        let handle = Arc::new(Self {
            server_id: peer.server_id,
            group_id: peer.group_id,
            weight: peer.weight,
            role: peer.role,
            domain: peer.domain.clone(),
            addr,
            connected_at: Instant::now(),
            outbound,
            window: FlowControlWindow::new(peer.server_id, peer.window_size.max(1)),
            control_tx,
            data_tx,
            evicted: Notify::new(),
        });
        (handle, (control_rx, data_rx))
    }

    /// Ask the connection to shut down because another link replaced it.
    pub(crate) fn evict(&self) {
        self.evicted.notify_one();
    }

    pub(crate) async fn wait_evicted(&self) {
        self.evicted.notified().await
    }

    /// Credit window towards the peer.
    pub fn window(&self) -> &FlowControlWindow {
        &self.window
    }

    /// Queue a control message, waiting for room.
    pub async fn send_control(&self, msg: ReplMessage) -> Result<(), ReplError> {
        self.control_tx.send(msg).await.map_err(|_| self.closed())
    }

    /// Queue a control message if there is room. Returns false if dropped.
    pub fn try_send_control(&self, msg: ReplMessage) -> bool {
        match self.control_tx.try_send(msg) {
            Ok(()) => true,
            Err(e) => {
                debug!(server_id = self.server_id, kind = e.into_inner().kind(), "control message dropped");
                false
            }
        }
    }

    async fn send_change(&self, record: ChangeRecord) -> Result<(), ReplError> {
        self.data_tx
            .send(ReplMessage::Change(record))
            .await
            .map_err(|_| self.closed())
    }

    fn closed(&self) -> ReplError {
        ReplError::PeerUnreachable {
            server_id: self.server_id,
            msg: "connection closed".to_string(),
        }
    }
}

/// Heartbeat and idle-timeout state, independent of the send path.
#[derive(Debug)]
pub(crate) struct Liveness {
    last_received: Mutex<Instant>,
    idle_timeout: Duration,
}

impl Liveness {
    pub(crate) fn new(idle_timeout: Duration) -> Self {
        Self {
            last_received: Mutex::new(Instant::now()),
            idle_timeout,
        }
    }

    /// Note inbound traffic.
    pub(crate) fn touch(&self) {
        *self.last_received.lock() = Instant::now();
    }

    /// True once nothing has been received for longer than the idle timeout.
    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(*self.last_received.lock()) > self.idle_timeout
    }

    /// Send a heartbeat every `interval` through `send`; fail once the peer
    /// has been silent for too long.
    pub(crate) async fn run<F>(&self, server_id: ServerId, interval: Duration, mut send: F) -> Result<(), ReplError>
    where
        F: FnMut(ReplMessage),
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.is_expired(Instant::now()) {
                return Err(ReplError::PeerUnreachable {
                    server_id,
                    msg: format!("nothing received for {:?}", self.idle_timeout),
                });
            }
            send(ReplMessage::Heartbeat);
        }
    }
}

/// Credits to hand back after every `batch` consumed change records.
pub(crate) fn credit_batch(window_size: u32) -> u32 {
    (window_size / 2).max(1)
}

/// Write queued messages, control before data.
pub(crate) async fn write_loop<W>(
    writer: W,
    mut control_rx: mpsc::Receiver<ReplMessage>,
    mut data_rx: mpsc::Receiver<ReplMessage>,
) -> Result<(), ReplError>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);
    loop {
        let msg = tokio::select! {
            biased;
            Some(msg) = control_rx.recv() => msg,
            Some(msg) = data_rx.recv() => msg,
            else => return Ok(()),
        };
        write_message(&mut writer, &msg).await?;
    }
}

async fn read_hello<R>(reader: &mut R) -> Result<HelloMessage, ReplError>
where
    R: AsyncRead + Unpin,
{
    match read_message(reader).await? {
        Some(ReplMessage::Hello(hello)) => Ok(hello),
        Some(other) => Err(ReplError::Handshake {
            msg: format!("expected hello, got {}", other.kind()),
        }),
        None => Err(ReplError::Handshake {
            msg: "peer closed the connection during handshake".to_string(),
        }),
    }
}

fn local_hello(server: &ReplicationServer, domain: &str) -> HelloMessage {
    let config = server.config();
    HelloMessage {
        protocol_version: PROTOCOL_VERSION,
        server_id: config.replication_server_id,
        group_id: config.group_id,
        weight: config.weight,
        role: ServerRole::Rs,
        domain: domain.to_string(),
        window_size: config.window_size,
        server_state: server.store().server_state(domain),
    }
}

fn validate_hello(server: &ReplicationServer, peer: &HelloMessage, dialed: Option<&str>) -> Result<(), ReplError> {
    let reject = |msg: String| Err(ReplError::Handshake { msg });
    if peer.protocol_version != PROTOCOL_VERSION {
        return reject(format!("unsupported protocol version {}", peer.protocol_version));
    }
    if peer.server_id == 0 {
        return reject("server id 0 is reserved".to_string());
    }
    if peer.server_id == server.server_id() {
        return reject(format!("peer uses our own server id {}", peer.server_id));
    }
    match dialed {
        Some(domain) if peer.domain != domain => {
            return reject(format!("peer answered for {} instead of {}", peer.domain, domain));
        }
        Some(_) => {}
        None if peer.domain.is_empty() || !server.config().serves_domain(&peer.domain) => {
            return reject(format!("domain {:?} is not served here", peer.domain));
        }
        None => {}
    }
    if dialed.is_some() && peer.role != ServerRole::Rs {
        return reject(format!("server {} is not a replication server", peer.server_id));
    }
    if let Some(existing) = server.link(&peer.domain, peer.server_id) {
        if !server.replaces(&existing, peer.role, dialed.is_some()) {
            return reject(format!("server {} already connected for {}", peer.server_id, peer.domain));
        }
    }
    Ok(())
}

/// Exchange hellos. When we dialed, we speak first; otherwise we learn the
/// peer's domain from its hello before answering.
async fn handshake<R, W>(
    server: &ReplicationServer,
    reader: &mut R,
    writer: &mut W,
    dialed: Option<&str>,
) -> Result<HelloMessage, ReplError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match dialed {
        Some(domain) => {
            write_message(writer, &ReplMessage::Hello(local_hello(server, domain))).await?;
            let peer = read_hello(reader).await?;
            validate_hello(server, &peer, dialed)?;
            Ok(peer)
        }
        None => {
            let peer = read_hello(reader).await?;
            validate_hello(server, &peer, None)?;
            write_message(writer, &ReplMessage::Hello(local_hello(server, &peer.domain))).await?;
            Ok(peer)
        }
    }
}

/// Run one connection until it fails, the peer leaves or the server shuts
/// down. `dialed` is the domain we connected for, `None` for accepted
/// connections.
pub(crate) async fn run(
    server: Arc<ReplicationServer>,
    stream: TcpStream,
    dialed: Option<String>,
) -> Result<(), ReplError> {
    let addr = stream.peer_addr()?;
    stream.set_nodelay(true)?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let peer = match tokio::time::timeout(
        server.config().idle_timeout(),
        handshake(&server, &mut reader, &mut write_half, dialed.as_deref()),
    )
    .await
    {
        Ok(Ok(peer)) => peer,
        Ok(Err(e)) => {
            server.stats().record_handshake_rejected();
            return Err(e);
        }
        Err(_) => {
            server.stats().record_handshake_rejected();
            return Err(ReplError::Handshake {
                msg: format!("no hello from {} in time", addr),
            });
        }
    };

    let (handle, (control_rx, data_rx)) =
        ServerHandle::new(&peer, addr, dialed.is_some(), server.config().queue_size);
    let ctx = server.domain(&peer.domain);
    server.register(Arc::clone(&handle))?;
    info!(
        server_id = peer.server_id,
        role = ?peer.role,
        domain = %peer.domain,
        %addr,
        "peer connected"
    );

    let liveness = Arc::new(Liveness::new(server.config().idle_timeout()));
    let mut writer_task = tokio::spawn(write_loop(write_half, control_rx, data_rx));
    let mut feed_task = tokio::spawn(feed_loop(
        Arc::clone(server.store()),
        Arc::clone(&handle),
        peer.server_state.clone(),
    ));
    let mut heartbeat_task: JoinHandle<Result<(), ReplError>> = {
        let liveness = Arc::clone(&liveness);
        let handle = Arc::clone(&handle);
        let interval = server.config().heartbeat_interval();
        tokio::spawn(async move {
            let id = handle.server_id;
            liveness
                .run(id, interval, |msg| {
                    handle.try_send_control(msg);
                })
                .await
        })
    };
    let mut shutdown = server.shutdown_signal();

    let outcome = tokio::select! {
        r = read_loop(&server, &ctx, &handle, &liveness, &mut reader) => r,
        r = &mut writer_task => joined(r),
        r = &mut feed_task => joined(r),
        r = &mut heartbeat_task => joined(r),
        _ = handle.wait_evicted() => Ok(()),
        _ = shutdown.changed() => Ok(()),
    };

    handle.window.close();
    writer_task.abort();
    feed_task.abort();
    heartbeat_task.abort();
    server.unregister(&handle);

    match &outcome {
        Ok(()) => info!(server_id = handle.server_id, domain = %handle.domain, "peer disconnected"),
        Err(e) if e.is_integrity_failure() => {
            error!(server_id = handle.server_id, domain = %handle.domain, error = %e, "connection stopped")
        }
        Err(e) => warn!(server_id = handle.server_id, domain = %handle.domain, error = %e, "connection lost"),
    }
    outcome
}

fn joined(r: Result<Result<(), ReplError>, tokio::task::JoinError>) -> Result<(), ReplError> {
    match r {
        Ok(inner) => inner,
        Err(e) => Err(ReplError::Protocol {
            msg: format!("connection task failed: {}", e),
        }),
    }
}

/// Stream the domain's changelog to the peer, starting after what its
/// handshake state already covers.
async fn feed_loop(
    store: Arc<ChangelogStore>,
    handle: Arc<ServerHandle>,
    since: crate::csn::ServerState,
) -> Result<(), ReplError> {
    let mut feed = store.feed(&handle.domain, since)?;
    loop {
        let change = feed.next().await?;
        if change.record.origin() == handle.server_id {
            continue;
        }
        if handle.role == ServerRole::Rs && change.via_replication_server {
            continue;
        }
        handle.window.acquire().await?;
        debug!(server_id = handle.server_id, csn = %change.record.csn, "forwarding change");
        handle.send_change(change.record.clone()).await?;
    }
}

async fn read_loop<R>(
    server: &Arc<ReplicationServer>,
    ctx: &Arc<DomainContext>,
    handle: &Arc<ServerHandle>,
    liveness: &Liveness,
    reader: &mut R,
) -> Result<(), ReplError>
where
    R: AsyncRead + Unpin,
{
    let batch = credit_batch(server.config().window_size);
    let mut consumed = 0u32;
    loop {
        let msg = match read_message(reader).await {
            Ok(Some(msg)) => msg,
            Ok(None) => return Ok(()),
            Err(e) => {
                if matches!(e, ReplError::Protocol { .. } | ReplError::Serialization(_)) {
                    server.stats().record_protocol_error();
                }
                return Err(e);
            }
        };
        liveness.touch();
        match msg {
            ReplMessage::Change(record) => {
                on_change(server, ctx, handle, record).await?;
                consumed += 1;
                if consumed >= batch {
                    handle
                        .send_control(ReplMessage::WindowCredit { n: consumed })
                        .await?;
                    consumed = 0;
                }
            }
            ReplMessage::Ack(ack) => on_ack(server, ctx, handle, ack),
            ReplMessage::WindowCredit { n } => {
                handle.window.return_credit(n);
            }
            ReplMessage::Topology(msg) => {
                if handle.role == ServerRole::Rs {
                    ctx.topology.apply_gossip(&msg);
                    ctx.assured.reevaluate(&ctx.topology.snapshot());
                }
            }
            ReplMessage::Heartbeat => {}
            ReplMessage::Hello(_) => {
                server.stats().record_protocol_error();
                return Err(ReplError::Protocol {
                    msg: "hello after handshake".to_string(),
                });
            }
        }
    }
}

async fn on_change(
    server: &Arc<ReplicationServer>,
    ctx: &Arc<DomainContext>,
    handle: &Arc<ServerHandle>,
    record: ChangeRecord,
) -> Result<(), ReplError> {
    if record.domain != handle.domain {
        return Err(ReplError::Protocol {
            msg: format!("change for {} on a {} connection", record.domain, handle.domain),
        });
    }
    if handle.role == ServerRole::Ds && record.origin() != handle.server_id {
        return Err(ReplError::Protocol {
            msg: format!("server {} sent change {} of another origin", handle.server_id, record.csn),
        });
    }
    if !record.validate_crc() {
        return Err(ReplError::Protocol {
            msg: format!("change {} fails its checksum", record.csn),
        });
    }

    let from_rs = handle.role == ServerRole::Rs;
    let assured = record.assured_mode.is_assured();
    // Waiters and relay routes go in before the append publishes the change,
    // so an ack racing the feed still finds them.
    let waiter = if assured && !from_rs && !ctx.assured.is_pending(&record.csn) {
        Some(
            ctx.assured
                .register(&record, handle.server_id, &ctx.topology.snapshot()),
        )
    } else {
        None
    };
    if assured && from_rs {
        ctx.remember_relay(record.csn, handle.server_id);
    }

    let store = Arc::clone(server.store());
    let appended = {
        let record = record.clone();
        tokio::task::spawn_blocking(move || store.append(record, from_rs))
            .await
            .map_err(|e| ReplError::Protocol {
                msg: format!("append task failed: {}", e),
            })
    };
    match appended {
        Ok(Ok(_)) => server.stats().record_change_received(),
        Ok(Err(ReplError::OutOfOrderCsn { last, got, .. })) => {
            if waiter.is_some() {
                ctx.assured.cancel(&got);
            }
            if from_rs {
                debug!(server_id = handle.server_id, csn = %got, last = %last, "change already stored");
                return Ok(());
            }
            error!(server_id = handle.server_id, csn = %got, last = %last, "out-of-order change rejected");
            handle
                .send_control(ReplMessage::Ack(AckMessage::rejected(got, server.server_id(), last)))
                .await?;
            return Ok(());
        }
        Ok(Err(e)) | Err(e) => {
            if waiter.is_some() {
                ctx.assured.cancel(&record.csn);
            }
            return Err(e);
        }
    }

    if !assured {
        return Ok(());
    }
    if from_rs {
        // Durable here: ack for ourselves; our directory servers' acks are
        // relayed through the route recorded above.
        handle
            .send_control(ReplMessage::Ack(AckMessage::new(record.csn, server.server_id())))
            .await?;
        return Ok(());
    }
    let Some(waiter) = waiter else {
        return Ok(());
    };

    let originator = Arc::clone(handle);
    let server = Arc::clone(server);
    tokio::spawn(async move {
        let csn = waiter.csn();
        let reply = match waiter.wait().await {
            Ok(outcome) => {
                server.stats().record_assured_outcome(&outcome);
                let mut ack = AckMessage::new(csn, server.server_id());
                if let crate::assured::AssuredOutcome::TimedOut { missing } = outcome {
                    ack.timed_out = true;
                    ack.failed_servers = missing;
                }
                ack
            }
            Err(_) => return,
        };
        if originator.send_control(ReplMessage::Ack(reply)).await.is_err() {
            debug!(server_id = originator.server_id, csn = %csn, "originator gone before ack");
        }
    });
    Ok(())
}

fn on_ack(server: &Arc<ReplicationServer>, ctx: &Arc<DomainContext>, handle: &Arc<ServerHandle>, ack: AckMessage) {
    server.stats().record_ack_received();
    let view = ctx.topology.snapshot();
    if let Some(latency) = ctx.assured.on_ack(ack.server_id, ack.csn, &view) {
        server.analyzer().record_ack_latency(ack.server_id, latency);
    }
    if handle.role != ServerRole::Ds {
        return;
    }
    if let Some(rs) = ctx.relay_target(&ack.csn) {
        if let Some(link) = server.link(&handle.domain, rs) {
            if link.try_send_control(ReplMessage::Ack(ack)) {
                server.stats().record_ack_relayed();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credit_batch() {
        assert_eq!(credit_batch(100), 50);
        assert_eq!(credit_batch(3), 1);
        assert_eq!(credit_batch(1), 1);
    }

    #[tokio::test]
    async fn test_writer_prefers_control() {
        let (control_tx, control_rx) = mpsc::channel(8);
        let (data_tx, data_rx) = mpsc::channel(8);
        let change = ChangeRecord::new(
            crate::csn::Csn::new(1, 1, 0),
            "dc=x",
            vec![],
            crate::change::AssuredMode::None,
            1,
        );
        data_tx.send(ReplMessage::Change(change)).await.unwrap();
        control_tx.send(ReplMessage::Heartbeat).await.unwrap();
        drop(control_tx);
        drop(data_tx);

        let (a, mut b) = tokio::io::duplex(4096);
        write_loop(a, control_rx, data_rx).await.unwrap();
        assert_eq!(read_message(&mut b).await.unwrap(), Some(ReplMessage::Heartbeat));
        assert_eq!(read_message(&mut b).await.unwrap().unwrap().kind(), "change");
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_expires_silent_peer() {
        let liveness = Liveness::new(Duration::from_millis(300));
        let mut sent = 0;
        let err = liveness
            .run(4, Duration::from_millis(100), |_| sent += 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::PeerUnreachable { server_id: 4, .. }));
        assert!(sent >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_kept_alive_by_traffic() {
        let liveness = Arc::new(Liveness::new(Duration::from_millis(300)));
        let toucher = Arc::clone(&liveness);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(200)).await;
                toucher.touch();
            }
        });
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            liveness.run(4, Duration::from_millis(100), |_| {}),
        )
        .await;
        assert!(result.is_err(), "live peer was declared dead");
    }
}
