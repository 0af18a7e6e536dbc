//! Cluster-state end-to-end behavior: epoch handling, splits, the store
//! lifecycle, and heartbeat-driven operator execution.

mod common;

use std::collections::HashSet;

use common::{bootstrap_cluster, healthy_stats, new_env, region_with_peers};
use meridian_pd::operator::{OpKind, OpStatus, OpStep, Operator};
use meridian_pd::region::{Peer, RegionEpoch};
use meridian_pd::store::StoreMeta;
use meridian_pd::store_limit::{StoreLimitType, REGION_INFLUENCE};

#[tokio::test]
async fn epoch_decrease_is_rejected_until_cache_dropped() {
    let env = new_env().await;
    bootstrap_cluster(&env, &[1, 2, 3]).await;

    let mut region = region_with_peers(1, b"", b"", &[1]);
    region.epoch = RegionEpoch::new(100, 100);
    env.server
        .region_heartbeat(region)
        .await
        .expect("heartbeat accepted");

    let mut stale = region_with_peers(1, b"", b"", &[1]);
    stale.epoch = RegionEpoch::new(50, 50);
    let err = env
        .server
        .region_heartbeat(stale.clone())
        .await
        .expect_err("stale epoch rejected");
    assert_eq!(err.code(), "EpochStale");
    assert_eq!(
        env.server.get_region_by_id(1).expect("cached").epoch,
        RegionEpoch::new(100, 100)
    );

    // Dropping the cache entry readmits the lower epoch.
    let response = env.server.admin_drop_region_cache(1);
    assert_eq!(response.status, 200);
    env.server
        .region_heartbeat(stale)
        .await
        .expect("readmitted after cache drop");
    assert_eq!(
        env.server.get_region_by_id(1).expect("cached").epoch,
        RegionEpoch::new(50, 50)
    );
}

#[tokio::test]
async fn ask_batch_split_grants_fresh_ids_and_marks_suspects() {
    let env = new_env().await;
    bootstrap_cluster(&env, &[1, 2, 3]).await;

    // Give the region a full peer set first, with peer ids the cluster
    // would have granted out-of-band.
    let mut region = region_with_peers(1, b"", b"", &[1, 2, 3]);
    for (i, peer) in region.peers.iter_mut().enumerate() {
        peer.id = 901 + i as u64;
    }
    region.leader = Some(region.peers[0]);
    region.epoch = RegionEpoch::new(2, 1);
    env.server.region_heartbeat(region.clone()).await.unwrap();

    let arms = env
        .server
        .ask_batch_split(&region, 2)
        .await
        .expect("batch split");
    assert_eq!(arms.len(), 2);

    let mut all_ids: HashSet<u64> = HashSet::new();
    for arm in &arms {
        assert_eq!(arm.peer_ids.len(), region.peers.len());
        assert!(all_ids.insert(arm.region_id), "region id reused");
        for peer_id in &arm.peer_ids {
            assert!(all_ids.insert(*peer_id), "peer id reused");
        }
    }
    // Ids must be fresh, beyond anything the cluster already uses.
    for existing in region.peers.iter().map(|p| p.id).chain([region.id]) {
        assert!(!all_ids.contains(&existing));
    }

    let suspects: HashSet<u64> = env
        .server
        .coordinator
        .checkers
        .get_suspect_regions()
        .into_iter()
        .collect();
    assert!(suspects.contains(&region.id));
    for arm in &arms {
        assert!(suspects.contains(&arm.region_id));
    }

    let err = env
        .server
        .ask_batch_split(&region, 0)
        .await
        .expect_err("zero split count");
    assert_eq!(err.code(), "InvalidArgument");
}

#[tokio::test]
async fn store_lifecycle_over_the_service_surface() {
    let env = new_env().await;
    bootstrap_cluster(&env, &[1, 2, 3, 4]).await;

    env.server.remove_store(4, false).await.expect("remove");
    assert!(env.server.get_store(4).unwrap().is_removing());

    // Draining store gets unlimited remove-peer; the previous limit comes
    // back with the store.
    assert_eq!(
        env.server.controller.limiter.rate(4, StoreLimitType::RemovePeer),
        None
    );
    env.server.up_store(4).await.expect("up again");
    assert!(env.server.get_store(4).unwrap().is_serving());

    env.server.remove_store(4, false).await.expect("remove");
    env.server.bury_store(4, false).await.expect("bury drained");
    assert!(env.server.get_store(4).unwrap().is_removed());
    assert_eq!(
        env.server.up_store(4).await.expect_err("tombstone").code(),
        "StoreRemoved"
    );

    let visible = env.server.get_all_stores(true);
    assert!(visible.iter().all(|s| s.id() != 4));
    let all = env.server.get_all_stores(false);
    assert!(all.iter().any(|s| s.id() == 4));
}

#[tokio::test]
async fn store_heartbeat_reports_limits_to_apply() {
    let env = new_env().await;
    bootstrap_cluster(&env, &[1, 2, 3]).await;

    env.server
        .set_store_limit(2, StoreLimitType::AddPeer, 30.0, None)
        .expect("set limit");
    let limits = env
        .server
        .store_heartbeat(healthy_stats(2))
        .await
        .expect("heartbeat");
    assert_eq!(limits.add_peer, Some(30.0));
    assert_eq!(limits.remove_peer, Some(15.0));
}

#[tokio::test]
async fn add_peer_admission_respects_rate_and_burst() {
    let env = new_env().await;
    bootstrap_cluster(&env, &[1, 2, 3]).await;
    // Rate 2/min means a burst of two region moves and nothing more.
    env.server
        .set_store_limit(3, StoreLimitType::AddPeer, 2.0, None)
        .expect("set limit");

    let mut admitted = 0;
    for id in 10..20u64 {
        let mut region = region_with_peers(id, &[id as u8], &[id as u8 + 1], &[1, 2]);
        region.approximate_size = 50;
        env.server.controller.cluster.put_region(region.clone());
        let op = Operator::new(
            "test-add-peer",
            &region,
            OpKind::Region,
            vec![OpStep::AddPeer {
                store_id: 3,
                peer_id: id * 1000,
            }],
        );
        env.server.op_controller.add_operator(op);
        if env.server.op_controller.get_operator(id).is_some() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 2, "admitted add-peer steps exceed rate + burst");

    // Tokens must be spent.
    assert!(!env
        .server
        .controller
        .limiter
        .available(3, StoreLimitType::AddPeer, REGION_INFLUENCE));
}

#[tokio::test]
async fn heartbeats_drive_an_operator_to_completion() {
    let env = new_env().await;
    bootstrap_cluster(&env, &[1, 2, 3]).await;

    // The bootstrap region has one replica; the rule checker wants three.
    let region = env.server.get_region_by_id(1).expect("region");
    let ops = env
        .server
        .coordinator
        .checkers
        .check_region(&region)
        .await
        .expect("check");
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].desc, "add-rule-peer");
    assert!(env.server.op_controller.add_operator(ops.into_iter().next().unwrap()));

    // Simulate the storage node executing steps reported via heartbeat.
    let mut current = (*region).clone();
    for _ in 0..4 {
        let step = match env.server.region_heartbeat(current.clone()).await.unwrap() {
            Some(step) => step,
            None => break,
        };
        current = match step {
            OpStep::AddPeer { store_id, peer_id } => {
                let mut next = current.with_add_peer(Peer::voter(peer_id, store_id));
                next.leader = current.leader;
                next
            }
            OpStep::AddLearner { store_id, peer_id } => {
                let mut next = current.clone();
                next.peers.push(Peer::learner(peer_id, store_id));
                next.epoch.conf_ver += 1;
                next
            }
            OpStep::PromoteLearner { store_id, .. } => {
                let mut next = current.clone();
                for peer in &mut next.peers {
                    if peer.store_id == store_id {
                        peer.role = meridian_pd::region::PeerRole::Voter;
                    }
                }
                next.epoch.conf_ver += 1;
                next
            }
            other => panic!("unexpected step for repair: {other:?}"),
        };
    }

    // Operator completed and left a success record behind.
    assert!(env.server.op_controller.get_operator(1).is_none());
    let (desc, status, _) = env.server.get_operator(1).expect("record");
    assert_eq!(desc, "add-rule-peer");
    assert_eq!(status, OpStatus::Success);
    assert_eq!(
        env.server.get_region_by_id(1).unwrap().voters().count(),
        2
    );
}

#[tokio::test]
async fn region_queries_cover_ranges() {
    let env = new_env().await;
    bootstrap_cluster(&env, &[1, 2, 3]).await;
    let splits: [(u64, &[u8], &[u8]); 3] = [(2, b"", b"g"), (3, b"g", b"p"), (4, b"p", b"")];
    for (id, start, end) in splits {
        let mut region = region_with_peers(id, start, end, &[1, 2, 3]);
        region.epoch = RegionEpoch::new(1, 2);
        env.server.region_heartbeat(region).await.unwrap();
    }

    assert_eq!(env.server.get_region(b"h").unwrap().id, 3);
    assert_eq!(env.server.get_prev_region(b"h").unwrap().id, 2);
    let scanned = env.server.scan_regions(b"", b"", 0);
    assert_eq!(scanned.len(), 3);
    let stats = env.server.get_region_stats(b"", b"");
    assert_eq!(stats.count, 3);
    assert_eq!(stats.storage_size, 30);
}

#[tokio::test]
async fn cancel_operator_and_inspect_records() {
    let env = new_env().await;
    bootstrap_cluster(&env, &[1, 2, 3]).await;

    let mut region = region_with_peers(7, b"a", b"b", &[1, 2]);
    region.epoch = RegionEpoch::new(1, 2);
    env.server.controller.cluster.put_region(region.clone());
    env.server.op_controller.add_operator(Operator::new(
        "test-remove",
        &region,
        OpKind::Region,
        vec![OpStep::RemovePeer { store_id: 2 }],
    ));
    env.server.cancel_operator(7).expect("cancel");
    let (_, status, _) = env.server.get_operator(7).expect("record");
    assert_eq!(status, OpStatus::Cancelled);
    assert_eq!(
        env.server.cancel_operator(7).expect_err("gone").code(),
        "OperatorNotFound"
    );
}

#[tokio::test]
async fn min_resolved_ts_tracks_serving_stores() {
    let env = new_env().await;
    bootstrap_cluster(&env, &[1, 2, 3]).await;
    for (id, ts) in [(1u64, 120u64), (2, 80), (3, 100)] {
        let mut stats = healthy_stats(id);
        stats.min_resolved_ts = ts;
        env.server.store_heartbeat(stats).await.unwrap();
    }
    env.server
        .controller
        .persist_min_resolved_ts()
        .await
        .expect("persist");
    assert_eq!(env.server.min_resolved_ts(), 80);
}

#[tokio::test]
async fn put_store_rejects_address_conflicts() {
    let env = new_env().await;
    bootstrap_cluster(&env, &[1, 2, 3]).await;
    let err = env
        .server
        .put_store(StoreMeta::new(9, "s2"))
        .await
        .expect_err("address in use");
    assert_eq!(err.code(), "StoreServing");
}
