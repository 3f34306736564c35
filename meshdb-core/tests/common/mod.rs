// Each integration test compiles as a separate binary that includes this module via `mod common;`.
// Not every test binary uses every helper, so Rust emits spurious dead_code warnings.
#![allow(dead_code)]
//! Shared harness for meshdb-core integration tests: small simulated
//! clusters with compressed timers.

use bytes::Bytes;
use meshdb_core::{Config, NetworkDb};
use meshdb_net_sim::{SimMembership, SimNetwork};
use std::sync::Arc;
use std::time::Duration;

pub const GOSSIP_INTERVAL: Duration = Duration::from_millis(50);
pub const BULK_SYNC_INTERVAL: Duration = Duration::from_millis(500);

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Production-shaped config with intervals compressed for tests.
pub fn test_config(name: &str) -> Config {
    let mut config = Config::new(name);
    config.gossip_interval = GOSSIP_INTERVAL;
    config.bulk_sync_interval = BULK_SYNC_INTERVAL;
    config.reap_period = Duration::from_millis(200);
    config.reap_entry_interval = Duration::from_secs(2);
    config.reap_network_interval = Duration::from_secs(2);
    config.retry_interval = Duration::from_millis(200);
    config.rejoin_cluster_interval = Duration::from_secs(5);
    config.rng_seed = Some(0xdb);
    config
}

pub async fn start_node_with(sim: &SimNetwork, config: Config) -> Arc<NetworkDb> {
    let name = config.node_id.clone();
    let membership = Arc::new(
        SimMembership::new(name, sim).with_gossip_interval(Duration::from_millis(50)),
    );
    NetworkDb::new(config, membership)
        .await
        .expect("start node")
}

pub async fn start_node(sim: &SimNetwork, name: &str) -> Arc<NetworkDb> {
    start_node_with(sim, test_config(name)).await
}

/// Start `names` as one cluster: every node after the first joins
/// through the first.
pub async fn start_cluster(sim: &SimNetwork, names: &[&str]) -> Vec<Arc<NetworkDb>> {
    let mut dbs = Vec::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        let db = start_node(sim, name).await;
        if i > 0 {
            db.join(&[names[0].to_string()]).await.expect("cluster join");
        }
        dbs.push(db);
    }
    dbs
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait until `db` holds `value` for the key.
pub async fn wait_for_value(
    db: &NetworkDb,
    nid: &str,
    table: &str,
    key: &str,
    value: &[u8],
) -> bool {
    let value = Bytes::copy_from_slice(value);
    wait_until(Duration::from_secs(10), || {
        db.get_entry(nid, table, key).map(|v| v == value).unwrap_or(false)
    })
    .await
}

/// Wait until `db` reports no live entry for the key.
pub async fn wait_for_absent(db: &NetworkDb, nid: &str, table: &str, key: &str) -> bool {
    wait_until(Duration::from_secs(10), || {
        db.get_entry(nid, table, key).is_err()
    })
    .await
}
