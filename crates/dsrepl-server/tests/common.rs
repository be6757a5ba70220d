//! Shared fixtures for end-to-end replication tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use dsrepl_server::message::{read_message, write_message, HelloMessage, ReplMessage, PROTOCOL_VERSION};
use dsrepl_server::{
    BrokerConfig, ReplServerConfig, ReplicaBroker, ReplicationServer, ServerId, ServerRole, ServerState,
};
use tokio::net::TcpStream;

pub const DOMAIN: &str = "dc=example,dc=com";

/// Test server with fast timers.
pub fn rs_config(server_id: ServerId) -> ReplServerConfig {
    ReplServerConfig {
        monitoring_period: 100,
        heartbeat_interval_ms: 100,
        idle_timeout_ms: 2_000,
        assured_timeout: 1_000,
        reconnect_delay_ms: 20,
        max_reconnect_delay_ms: 200,
        ..ReplServerConfig::in_memory(server_id)
    }
}

pub async fn start_rs(server_id: ServerId) -> Arc<ReplicationServer> {
    ReplicationServer::start(rs_config(server_id))
        .await
        .expect("replication server starts")
}

pub fn ds_config(server_id: ServerId) -> BrokerConfig {
    BrokerConfig {
        heartbeat_interval: Duration::from_millis(100),
        idle_timeout: Duration::from_secs(2),
        ..BrokerConfig::new(server_id, DOMAIN)
    }
}

pub async fn connect_ds(server: &ReplicationServer, server_id: ServerId) -> ReplicaBroker {
    connect_ds_with(server, ds_config(server_id), ServerState::new()).await
}

pub async fn connect_ds_with(server: &ReplicationServer, config: BrokerConfig, state: ServerState) -> ReplicaBroker {
    let addr = server.local_addr().to_string();
    let id = config.server_id;
    let broker = ReplicaBroker::connect(&addr, config, state)
        .await
        .expect("replica connects");
    wait_until("replica registered", || {
        server
            .connected_peers()
            .iter()
            .any(|p| p.server_id == id && p.role == ServerRole::Ds)
    })
    .await;
    broker
}

/// Handshake as directory server `server_id` over a bare socket. The caller
/// drives the protocol from there, or stays silent.
pub async fn connect_raw_ds(server: &ReplicationServer, server_id: ServerId) -> TcpStream {
    let mut stream = TcpStream::connect(server.local_addr()).await.expect("tcp connect");
    let hello = HelloMessage {
        protocol_version: PROTOCOL_VERSION,
        server_id,
        group_id: 1,
        weight: 1,
        role: ServerRole::Ds,
        domain: DOMAIN.to_string(),
        window_size: 100,
        server_state: ServerState::new(),
    };
    write_message(&mut stream, &ReplMessage::Hello(hello)).await.expect("hello sent");
    match read_message(&mut stream).await.expect("hello answered") {
        Some(ReplMessage::Hello(_)) => {}
        other => panic!("expected hello, got {:?}", other),
    }
    wait_until("raw replica registered", || {
        server.connected_peers().iter().any(|p| p.server_id == server_id)
    })
    .await;
    stream
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
