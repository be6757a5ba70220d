//! End-to-end replication over TCP: replicas, replication servers, assured
//! writes, flow control and restart.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{connect_ds, connect_ds_with, connect_raw_ds, ds_config, rs_config, start_rs, wait_until, DOMAIN};
use dsrepl_server::message::{read_message, write_message, ReplMessage};
use dsrepl_server::{
    AssuredMode, BrokerConfig, ChangeRecord, Csn, DbImplementation, ReplError, ReplServerConfig, ReplicaBroker,
    ReplicationServer, ServerRole, ServerState,
};

async fn drain(broker: &ReplicaBroker, n: usize) -> Vec<ChangeRecord> {
    let mut out = Vec::new();
    while out.len() < n {
        match broker.recv_timeout(Duration::from_secs(5)).await {
            Some(record) => out.push(record),
            None => panic!("only {} of {} changes arrived", out.len(), n),
        }
    }
    out
}

#[tokio::test]
async fn test_changes_reach_other_replica_in_csn_order() {
    let rs = start_rs(100).await;
    let ds1 = connect_ds(&rs, 1).await;
    let ds2 = connect_ds(&rs, 2).await;

    let mut published = Vec::new();
    for i in 0..25 {
        let receipt = ds1
            .publish(format!("modify {}", i).into_bytes(), AssuredMode::None)
            .await
            .unwrap();
        published.push(receipt.csn);
    }

    let received = drain(&ds2, 25).await;
    let csns: Vec<_> = received.iter().map(|r| r.csn).collect();
    assert_eq!(csns, published);
    assert!(csns.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(received[3].payload, b"modify 3".to_vec());
    assert!(ds1.recv_timeout(Duration::from_millis(100)).await.is_none(), "echoed to originator");

    rs.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_safe_data_resolves_after_peer_ack() {
    let rs = start_rs(100).await;
    let ds1 = connect_ds(&rs, 1).await;
    let ds2 = Arc::new(connect_ds(&rs, 2).await);

    let consumer = {
        let ds2 = Arc::clone(&ds2);
        tokio::spawn(async move { ds2.recv_timeout(Duration::from_secs(5)).await })
    };
    let receipt = ds1.publish(b"add".to_vec(), AssuredMode::SafeData).await.unwrap();
    let csn = receipt.csn;
    let ack = receipt.wait().await.unwrap();
    assert_eq!(ack.csn, csn);
    assert!(!ack.timed_out);
    assert_eq!(consumer.await.unwrap().unwrap().csn, csn);
    assert_eq!(rs.stats().snapshot().assured_acknowledged, 1);

    rs.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_safe_read_times_out_without_acks() {
    let rs = start_rs(100).await;
    let ds1 = connect_ds(&rs, 1).await;
    let silent = BrokerConfig {
        auto_ack: false,
        ..ds_config(2)
    };
    let ds2 = connect_ds_with(&rs, silent, ServerState::new()).await;

    let started = tokio::time::Instant::now();
    let receipt = ds1.publish(b"delete".to_vec(), AssuredMode::SafeRead).await.unwrap();
    let csn = receipt.csn;
    match receipt.wait().await {
        Err(ReplError::AssuredTimeout { csn: got, missing }) => {
            assert_eq!(got, csn);
            assert_eq!(missing, vec![2]);
        }
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert!(started.elapsed() >= Duration::from_millis(1_000));

    // The write is not rolled back.
    assert_eq!(ds2.recv_timeout(Duration::from_secs(1)).await.unwrap().csn, csn);
    assert_eq!(rs.store().last_csn(DOMAIN, 1), Some(csn));
    rs.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_server_id_rejected() {
    let rs = start_rs(100).await;
    let _first = connect_ds(&rs, 7).await;
    let addr = rs.local_addr().to_string();
    let second = ReplicaBroker::connect(&addr, ds_config(7), ServerState::new()).await;
    assert!(matches!(second, Err(ReplError::Handshake { .. })));
    let own_id = ReplicaBroker::connect(&addr, ds_config(100), ServerState::new()).await;
    assert!(own_id.is_err());
    assert!(rs.stats().snapshot().handshakes_rejected >= 2);
    rs.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconnecting_replica_gets_only_missing_changes() {
    let rs = start_rs(100).await;
    let ds1 = connect_ds(&rs, 1).await;
    let ds2 = connect_ds(&rs, 2).await;

    for i in 0..5 {
        ds1.publish(vec![i], AssuredMode::None).await.unwrap();
    }
    drain(&ds2, 5).await;
    let state = ds2.server_state();
    drop(ds2);
    wait_until("replica 2 gone", || rs.connected_peers().len() == 1).await;

    let mut missed = Vec::new();
    for i in 5..8 {
        missed.push(ds1.publish(vec![i], AssuredMode::None).await.unwrap().csn);
    }
    let ds2 = connect_ds_with(&rs, ds_config(2), state).await;
    let replayed: Vec<_> = drain(&ds2, 3).await.iter().map(|r| r.csn).collect();
    assert_eq!(replayed, missed);
    assert!(ds2.recv_timeout(Duration::from_millis(100)).await.is_none());
    rs.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_slow_consumer_is_throttled_not_dropped() {
    let rs = start_rs(100).await;
    let ds1 = connect_ds(&rs, 1).await;
    let small = BrokerConfig {
        window_size: 4,
        ..ds_config(2)
    };
    let ds2 = connect_ds_with(&rs, small, ServerState::new()).await;

    let mut published = Vec::new();
    for i in 0..40u8 {
        published.push(ds1.publish(vec![i], AssuredMode::None).await.unwrap().csn);
    }
    wait_until("all changes stored", || rs.store().record_count(DOMAIN) == 40).await;
    let link = rs
        .connected_peers()
        .into_iter()
        .find(|p| p.server_id == 2)
        .expect("replica 2 connected");
    assert_eq!(link.role, ServerRole::Ds);

    let received: Vec<_> = drain(&ds2, 40).await.iter().map(|r| r.csn).collect();
    assert_eq!(received, published);
    rs.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_two_replication_servers_forward_and_ack() {
    let rs_a = start_rs(100).await;
    let config_b = dsrepl_server::ReplServerConfig {
        replication_server: vec![rs_a.local_addr().to_string()],
        domains: vec![DOMAIN.to_string()],
        ..rs_config(200)
    };
    let rs_b = ReplicationServer::start(config_b).await.unwrap();
    wait_until("replication servers linked", || {
        rs_a
            .connected_peers()
            .iter()
            .any(|p| p.server_id == 200 && p.role == ServerRole::Rs)
    })
    .await;

    let ds1 = connect_ds(&rs_a, 1).await;
    let ds2 = Arc::new(connect_ds(&rs_b, 2).await);
    wait_until("replica 2 gossiped to server A", || {
        rs_a.topology(DOMAIN).map(|v| v.get(2).is_some()).unwrap_or(false)
    })
    .await;

    let consumer = {
        let ds2 = Arc::clone(&ds2);
        tokio::spawn(async move { ds2.recv_timeout(Duration::from_secs(5)).await })
    };
    let receipt = ds1.publish(b"moddn".to_vec(), AssuredMode::SafeRead).await.unwrap();
    let csn = receipt.csn;
    receipt.wait().await.unwrap();
    assert_eq!(consumer.await.unwrap().unwrap().csn, csn);
    assert_eq!(rs_b.store().last_csn(DOMAIN, 1), Some(csn));
    wait_until("ack relayed", || rs_b.stats().snapshot().acks_relayed >= 1).await;

    rs_b.shutdown().await.unwrap();
    rs_a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_file_changelog_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = dsrepl_server::ReplServerConfig {
        replication_db_implementation: DbImplementation::File,
        replication_db_directory: dir.path().to_path_buf(),
        ..rs_config(100)
    };

    let rs = ReplicationServer::start(config.clone()).await.unwrap();
    let ds1 = connect_ds(&rs, 1).await;
    let mut published = Vec::new();
    for i in 0..6u8 {
        published.push(ds1.publish(vec![i], AssuredMode::None).await.unwrap().csn);
    }
    wait_until("changes stored", || rs.store().record_count(DOMAIN) == 6).await;
    drop(ds1);
    rs.shutdown().await.unwrap();

    let rs = ReplicationServer::start(config).await.unwrap();
    assert_eq!(rs.store().record_count(DOMAIN), 6);
    let ds2 = connect_ds(&rs, 2).await;
    let replayed: Vec<_> = drain(&ds2, 6).await.iter().map(|r| r.csn).collect();
    assert_eq!(replayed, published);
    rs.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_back_to_back_safe_data_all_acknowledged() {
    let rs = start_rs(100).await;
    let ds1 = connect_ds(&rs, 1).await;
    let ds2 = Arc::new(connect_ds(&rs, 2).await);

    let consumer = {
        let ds2 = Arc::clone(&ds2);
        tokio::spawn(async move { drain(&ds2, 300).await.len() })
    };
    let mut receipts = Vec::new();
    for i in 0..300u32 {
        receipts.push(
            ds1.publish(i.to_be_bytes().to_vec(), AssuredMode::SafeData)
                .await
                .unwrap(),
        );
    }
    for receipt in receipts {
        let csn = receipt.csn;
        let ack = receipt.wait().await.unwrap_or_else(|e| panic!("{} not acknowledged: {}", csn, e));
        assert_eq!(ack.csn, csn);
        assert!(!ack.timed_out);
    }
    assert_eq!(consumer.await.unwrap(), 300);
    assert_eq!(rs.stats().snapshot().assured_acknowledged, 300);
    rs.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_out_of_order_change_from_replica_is_refused() {
    let rs = start_rs(100).await;
    let mut raw = connect_raw_ds(&rs, 2).await;

    let newer = Csn::new(10_000, 2, 0);
    let older = Csn::new(5_000, 2, 0);
    for record in [
        ChangeRecord::new(newer, DOMAIN, b"add".to_vec(), AssuredMode::None, 1),
        ChangeRecord::new(older, DOMAIN, b"modify".to_vec(), AssuredMode::SafeData, 1),
    ] {
        write_message(&mut raw, &ReplMessage::Change(record)).await.unwrap();
    }

    let ack = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match read_message(&mut raw).await.unwrap() {
                Some(ReplMessage::Ack(ack)) => break ack,
                Some(_) => continue,
                None => panic!("connection closed before the refusal arrived"),
            }
        }
    })
    .await
    .expect("refusal ack");
    assert_eq!(ack.csn, older);
    assert_eq!(ack.rejected_after, Some(newer));
    assert_eq!(rs.store().last_csn(DOMAIN, 2), Some(newer));
    assert_eq!(rs.store().record_count(DOMAIN), 1);
    assert!(rs.connected_peers().iter().any(|p| p.server_id == 2));
    rs.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publishers_keep_csn_order() {
    let config = ReplServerConfig {
        window_size: 1,
        ..rs_config(100)
    };
    let rs = ReplicationServer::start(config).await.unwrap();
    let ds1 = Arc::new(connect_ds(&rs, 1).await);
    let ds2 = connect_ds(&rs, 2).await;

    let publishers: Vec<_> = (0..4u8)
        .map(|task| {
            let ds1 = Arc::clone(&ds1);
            tokio::spawn(async move {
                for i in 0..50u8 {
                    ds1.publish(vec![task, i], AssuredMode::None).await.unwrap();
                }
            })
        })
        .collect();
    let received = drain(&ds2, 200).await;
    for publisher in publishers {
        publisher.await.unwrap();
    }

    assert_eq!(rs.store().record_count(DOMAIN), 200);
    assert!(received.windows(2).all(|w| w[0].csn < w[1].csn));
    assert_eq!(rs.store().last_csn(DOMAIN, 1), Some(received[199].csn));
    rs.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_silent_replica_is_dropped_and_releases_writes() {
    let config = ReplServerConfig {
        idle_timeout_ms: 500,
        assured_timeout: 10_000,
        ..rs_config(100)
    };
    let rs = ReplicationServer::start(config).await.unwrap();
    let ds1 = connect_ds(&rs, 1).await;
    let _silent = connect_raw_ds(&rs, 2).await;

    let started = tokio::time::Instant::now();
    let receipt = ds1.publish(b"delete".to_vec(), AssuredMode::SafeRead).await.unwrap();
    let ack = receipt.wait().await.unwrap();
    assert!(!ack.timed_out);
    assert!(started.elapsed() < Duration::from_secs(10));

    wait_until("silent replica dropped", || {
        rs.connected_peers().iter().all(|p| p.server_id != 2)
    })
    .await;
    assert!(rs.topology(DOMAIN).unwrap().get(2).is_none());
    assert!(rs.connected_peers().iter().any(|p| p.server_id == 1));
    rs.shutdown().await.unwrap();
}
