//! Anti-entropy: late joiners, partitions, and large state transfers.

mod common;

use common::*;
use meshdb_net_sim::SimNetwork;
use std::time::Duration;

const NID: &str = "net-1";
const TABLE: &str = "endpoints";

#[tokio::test]
async fn late_joiner_pulls_existing_state() {
    init_tracing();
    let sim = SimNetwork::new();
    let dbs = start_cluster(&sim, &["a", "b"]).await;
    dbs[0].join_network(NID).await.unwrap();
    dbs[1].join_network(NID).await.unwrap();

    for i in 0..10 {
        dbs[0]
            .create_entry(NID, TABLE, &format!("k{i}"), format!("v{i}"))
            .unwrap();
    }
    assert!(wait_for_value(&dbs[1], NID, TABLE, "k9", b"v9").await);

    let late = start_node(&sim, "c").await;
    late.join(&["a".to_string()]).await.unwrap();
    late.join_network(NID).await.unwrap();

    for i in 0..10 {
        assert!(
            wait_for_value(&late, NID, TABLE, &format!("k{i}"), format!("v{i}").as_bytes()).await,
            "late joiner missing k{i}"
        );
    }
}

#[tokio::test]
async fn late_joiner_does_not_resurrect_a_reaped_deletion() {
    init_tracing();
    let sim = SimNetwork::new();
    let dbs = start_cluster(&sim, &["a", "b"]).await;
    dbs[0].join_network(NID).await.unwrap();
    dbs[1].join_network(NID).await.unwrap();

    dbs[0].create_entry(NID, TABLE, "keep", "v").unwrap();
    dbs[0].create_entry(NID, TABLE, "gone", "v").unwrap();
    assert!(wait_for_value(&dbs[1], NID, TABLE, "gone", b"v").await);

    dbs[0].delete_entry(NID, TABLE, "gone").unwrap();
    assert!(wait_for_absent(&dbs[1], NID, TABLE, "gone").await);
    // Wait out the residual window on both replicas
    for db in &dbs {
        assert!(
            wait_until(Duration::from_secs(10), || {
                db.list_network_entries(NID).iter().all(|(_, key, _)| key != "gone")
            })
            .await
        );
    }

    let late = start_node(&sim, "c").await;
    late.join(&["b".to_string()]).await.unwrap();
    late.join_network(NID).await.unwrap();

    assert!(wait_for_value(&late, NID, TABLE, "keep", b"v").await);
    assert!(late.get_entry(NID, TABLE, "gone").is_err());
    assert!(late
        .list_network_entries(NID)
        .iter()
        .all(|(_, key, _)| key != "gone"));
}

#[tokio::test]
async fn partitioned_writes_merge_after_heal() {
    init_tracing();
    let sim = SimNetwork::new();
    let dbs = start_cluster(&sim, &["a", "b"]).await;
    dbs[0].join_network(NID).await.unwrap();
    dbs[1].join_network(NID).await.unwrap();

    dbs[0].create_entry(NID, TABLE, "shared", "v").unwrap();
    assert!(wait_for_value(&dbs[1], NID, TABLE, "shared", b"v").await);

    sim.partition(&["a"], &["b"]);
    dbs[0].create_entry(NID, TABLE, "from-a", "va").unwrap();
    dbs[1].create_entry(NID, TABLE, "from-b", "vb").unwrap();
    tokio::time::sleep(BULK_SYNC_INTERVAL * 3).await;

    // Divergence while partitioned
    assert!(dbs[1].get_entry(NID, TABLE, "from-a").is_err());
    assert!(dbs[0].get_entry(NID, TABLE, "from-b").is_err());

    sim.heal();
    assert!(wait_for_value(&dbs[1], NID, TABLE, "from-a", b"va").await);
    assert!(wait_for_value(&dbs[0], NID, TABLE, "from-b", b"vb").await);
}

#[tokio::test]
async fn bulk_sync_carries_more_entries_than_one_compound_frame() {
    init_tracing();
    let sim = SimNetwork::new();
    let dbs = start_cluster(&sim, &["a"]).await;
    dbs[0].join_network(NID).await.unwrap();

    // 300 entries forces the payload across multiple compound chunks
    for i in 0..300 {
        dbs[0]
            .create_entry(NID, TABLE, &format!("k{i:03}"), "v")
            .unwrap();
    }

    let late = start_node(&sim, "b").await;
    late.join(&["a".to_string()]).await.unwrap();
    late.join_network(NID).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            let mut count = 0;
            late.walk_table(TABLE, |_, _, _| {
                count += 1;
                false
            });
            count == 300
        })
        .await,
        "late joiner did not receive the full table"
    );
}

#[tokio::test]
async fn leaving_node_serves_syncs_through_its_leaving_window() {
    init_tracing();
    let sim = SimNetwork::new();
    let dbs = start_cluster(&sim, &["a", "b"]).await;
    dbs[0].join_network(NID).await.unwrap();
    dbs[1].join_network(NID).await.unwrap();

    dbs[0].create_entry(NID, TABLE, "k", "v").unwrap();
    assert!(wait_for_value(&dbs[1], NID, TABLE, "k", b"v").await);

    // a leaves the network; its own entry must become a tombstone on b
    dbs[0].leave_network(NID).unwrap();
    assert!(wait_for_absent(&dbs[1], NID, TABLE, "k").await);
}
