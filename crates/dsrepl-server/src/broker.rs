//! Directory-server side of the protocol.
//!
//! A [`ReplicaBroker`] connects one replica of a domain to a replication
//! server. It stamps local changes with CSNs, publishes them through the
//! flow-control window, waits for assured acknowledgments, and hands
//! replicated changes to the application while returning window credit and
//! acking assured records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::change::{AssuredMode, ChangeRecord};
use crate::connection::{credit_batch, write_loop, Liveness};
use crate::csn::{Csn, CsnGenerator, GroupId, ServerId, ServerState};
use crate::error::ReplError;
use crate::message::{
    read_message, write_message, AckMessage, HelloMessage, ReplMessage, TopologyMessage, PROTOCOL_VERSION,
};
use crate::topology::ServerRole;
use crate::window::FlowControlWindow;

/// Connection options of a replica.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Replica id.
    pub server_id: ServerId,
    /// Replica group.
    pub group_id: GroupId,
    /// Domain replicated.
    pub domain: String,
    /// Changes the replica is willing to buffer.
    pub window_size: u32,
    /// Heartbeat period.
    pub heartbeat_interval: Duration,
    /// Silence after which the replication server is considered dead.
    pub idle_timeout: Duration,
    /// Ack assured changes as soon as [`ReplicaBroker::recv`] returns them.
    pub auto_ack: bool,
}

impl BrokerConfig {
    /// Defaults for replica `server_id` of `domain`.
    pub fn new(server_id: ServerId, domain: impl Into<String>) -> Self {
        Self {
            server_id,
            group_id: 1,
            domain: domain.into(),
            window_size: 100,
            heartbeat_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(10),
            auto_ack: true,
        }
    }
}

/// A published change, possibly waiting for its assured outcome.
pub struct PublishReceipt {
    /// CSN given to the change.
    pub csn: Csn,
    domain: String,
    ack: Option<oneshot::Receiver<AckMessage>>,
}

impl PublishReceipt {
    /// Wait for the replication server's verdict. Non-assured changes return
    /// immediately with a plain ack. A timed-out assured write is reported as
    /// [`ReplError::AssuredTimeout`]; the change itself stays replicated. A
    /// change the replication server refused as out of order is reported as
    /// [`ReplError::OutOfOrderCsn`].
    pub async fn wait(self) -> Result<AckMessage, ReplError> {
        let ack = match self.ack {
            None => return Ok(AckMessage::new(self.csn, 0)),
            Some(rx) => rx.await.map_err(|_| ReplError::PeerUnreachable {
                server_id: 0,
                msg: "connection lost before the ack arrived".to_string(),
            })?,
        };
        if let Some(last) = ack.rejected_after {
            return Err(ReplError::OutOfOrderCsn {
                domain: self.domain,
                server_id: ack.csn.server_id,
                last,
                got: ack.csn,
            });
        }
        if ack.timed_out {
            return Err(ReplError::AssuredTimeout {
                csn: ack.csn,
                missing: ack.failed_servers,
            });
        }
        Ok(ack)
    }
}

struct Shared {
    window: FlowControlWindow,
    pending_acks: Mutex<HashMap<Csn, oneshot::Sender<AckMessage>>>,
    topology: Mutex<Option<TopologyMessage>>,
    state: Mutex<ServerState>,
    liveness: Liveness,
}

/// One replica's connection to a replication server.
pub struct ReplicaBroker {
    config: BrokerConfig,
    rs_id: ServerId,
    generator: CsnGenerator,
    shared: Arc<Shared>,
    control_tx: mpsc::Sender<ReplMessage>,
    data_tx: mpsc::Sender<ReplMessage>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<ChangeRecord>>,
    publishing: tokio::sync::Mutex<()>,
    consumed: Mutex<u32>,
    tasks: Vec<JoinHandle<()>>,
}

impl ReplicaBroker {
    /// Connect to the replication server at `addr`, announcing `state` as
    /// what the replica already holds.
    pub async fn connect(addr: &str, config: BrokerConfig, state: ServerState) -> Result<Self, ReplError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let hello = HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            server_id: config.server_id,
            group_id: config.group_id,
            weight: 1,
            role: ServerRole::Ds,
            domain: config.domain.clone(),
            window_size: config.window_size,
            server_state: state.clone(),
        };
        write_message(&mut write_half, &ReplMessage::Hello(hello)).await?;
        let reply = tokio::time::timeout(config.idle_timeout, read_message(&mut reader))
            .await
            .map_err(|_| ReplError::Handshake {
                msg: "no hello from the replication server".to_string(),
            })??;
        let rs = match reply {
            Some(ReplMessage::Hello(hello)) if hello.role == ServerRole::Rs => hello,
            Some(other) => {
                return Err(ReplError::Handshake {
                    msg: format!("expected hello, got {}", other.kind()),
                })
            }
            None => {
                return Err(ReplError::Handshake {
                    msg: "replication server refused the connection".to_string(),
                })
            }
        };
        info!(
            server_id = config.server_id,
            rs = rs.server_id,
            domain = %config.domain,
            "replica connected"
        );

        let generator = CsnGenerator::resume(config.server_id, state.get(config.server_id));
        for (_, csn) in state.iter() {
            generator.adjust(csn);
        }
        for (_, csn) in rs.server_state.iter() {
            generator.adjust(csn);
        }

        let shared = Arc::new(Shared {
            window: FlowControlWindow::new(rs.server_id, rs.window_size.max(1)),
            pending_acks: Mutex::new(HashMap::new()),
            topology: Mutex::new(None),
            state: Mutex::new(state),
            liveness: Liveness::new(config.idle_timeout),
        });
        let (control_tx, control_rx) = mpsc::channel(1024);
        let (data_tx, data_rx) = mpsc::channel(config.window_size.max(1) as usize);
        let (incoming_tx, incoming_rx) = mpsc::channel(config.window_size.max(1) as usize);

        let writer = tokio::spawn(async move {
            if let Err(e) = write_loop(write_half, control_rx, data_rx).await {
                debug!(error = %e, "replica writer stopped");
            }
        });
        let reader_task = tokio::spawn(read_loop(reader, Arc::clone(&shared), incoming_tx));
        let heartbeat = {
            let shared = Arc::clone(&shared);
            let control_tx = control_tx.clone();
            let interval = config.heartbeat_interval;
            let rs_id = rs.server_id;
            tokio::spawn(async move {
                let result = shared
                    .liveness
                    .run(rs_id, interval, |msg| {
                        let _ = control_tx.try_send(msg);
                    })
                    .await;
                if let Err(e) = result {
                    warn!(error = %e, "replication server went silent");
                    shared.window.close();
                }
            })
        };

        Ok(Self {
            config,
            rs_id: rs.server_id,
            generator,
            shared,
            control_tx,
            data_tx,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            publishing: tokio::sync::Mutex::new(()),
            consumed: Mutex::new(0),
            tasks: vec![writer, reader_task, heartbeat],
        })
    }

    /// Replica id.
    pub fn server_id(&self) -> ServerId {
        self.config.server_id
    }

    /// Id of the replication server this replica is connected to.
    pub fn replication_server_id(&self) -> ServerId {
        self.rs_id
    }

    /// Highest CSN per origin this replica has produced or received.
    pub fn server_state(&self) -> ServerState {
        self.shared.state.lock().clone()
    }

    /// Last topology the replication server sent.
    pub fn topology(&self) -> Option<TopologyMessage> {
        self.shared.topology.lock().clone()
    }

    /// Publish a local change. Waits for window credit. Concurrent callers
    /// are serialized so CSNs reach the wire in the order they are issued.
    pub async fn publish(&self, payload: Vec<u8>, mode: AssuredMode) -> Result<PublishReceipt, ReplError> {
        let _turn = self.publishing.lock().await;
        self.shared.window.acquire().await?;
        let csn = self.generator.next_csn();
        let record = ChangeRecord::new(csn, self.config.domain.clone(), payload, mode, self.config.group_id);

        let ack = if mode.is_assured() {
            let (tx, rx) = oneshot::channel();
            self.shared.pending_acks.lock().insert(csn, tx);
            Some(rx)
        } else {
            None
        };
        self.shared.state.lock().update(csn);
        if self.data_tx.send(ReplMessage::Change(record)).await.is_err() {
            self.shared.pending_acks.lock().remove(&csn);
            return Err(ReplError::PeerUnreachable {
                server_id: self.rs_id,
                msg: "connection closed".to_string(),
            });
        }
        debug!(server_id = self.config.server_id, csn = %csn, "change published");
        Ok(PublishReceipt {
            csn,
            domain: self.config.domain.clone(),
            ack,
        })
    }

    /// Next replicated change. Returns `None` once the connection is gone
    /// and everything received was consumed.
    pub async fn recv(&self) -> Option<ChangeRecord> {
        let record = self.incoming.lock().await.recv().await?;
        self.generator.adjust(record.csn);
        self.shared.state.lock().update(record.csn);
        self.consumed(&record).await;
        Some(record)
    }

    /// [`recv`](ReplicaBroker::recv) with a deadline.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<ChangeRecord> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }

    async fn consumed(&self, record: &ChangeRecord) {
        if self.config.auto_ack && record.assured_mode.is_assured() {
            let _ = self.ack(record.csn).await;
        }
        let batch = credit_batch(self.config.window_size);
        let credit = {
            let mut consumed = self.consumed.lock();
            *consumed += 1;
            if *consumed >= batch {
                std::mem::take(&mut *consumed)
            } else {
                0
            }
        };
        if credit > 0 {
            let _ = self.control_tx.send(ReplMessage::WindowCredit { n: credit }).await;
        }
    }

    /// Acknowledge an assured change.
    pub async fn ack(&self, csn: Csn) -> Result<(), ReplError> {
        self.control_tx
            .send(ReplMessage::Ack(AckMessage::new(csn, self.config.server_id)))
            .await
            .map_err(|_| ReplError::PeerUnreachable {
                server_id: self.rs_id,
                msg: "connection closed".to_string(),
            })
    }

    /// Drop the connection.
    pub fn close(&self) {
        self.shared.window.close();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for ReplicaBroker {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(mut reader: BufReader<OwnedReadHalf>, shared: Arc<Shared>, incoming: mpsc::Sender<ChangeRecord>) {
    loop {
        let msg = match read_message(&mut reader).await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "replica connection failed");
                break;
            }
        };
        shared.liveness.touch();
        match msg {
            ReplMessage::Change(record) => {
                if incoming.send(record).await.is_err() {
                    break;
                }
            }
            ReplMessage::Ack(ack) => {
                let waiter = shared.pending_acks.lock().remove(&ack.csn);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(ack);
                    }
                    None => {
                        if let Some(last) = ack.rejected_after {
                            error!(csn = %ack.csn, last = %last, "change refused as out of order");
                        }
                    }
                }
            }
            ReplMessage::WindowCredit { n } => {
                shared.window.return_credit(n);
            }
            ReplMessage::Topology(msg) => {
                *shared.topology.lock() = Some(msg);
            }
            ReplMessage::Heartbeat => {}
            ReplMessage::Hello(_) => {
                warn!("unexpected hello from the replication server");
                break;
            }
        }
    }
    shared.window.close();
    shared.pending_acks.lock().clear();
}
