//! Database configuration
//!
//! Defaults mirror a LAN deployment: 1400-byte gossip packets to stay
//! under typical MTUs, 30-minute tombstone retention, and reap/retry
//! periods tuned for clusters of tens of nodes. Tests shrink the
//! intervals to compress wall-clock time.

use bytes::Bytes;
use std::time::Duration;

/// Configuration for a [`crate::NetworkDb`] instance.
#[derive(Clone, Debug)]
pub struct Config {
    /// Stable identifier of this node within the cluster.
    pub node_id: String,
    /// Human-readable name used in log lines next to the node id.
    pub hostname: String,
    /// Initial symmetric keys; the first becomes the primary. Empty
    /// means a plaintext cluster.
    pub keys: Vec<Bytes>,

    /// Gossip datagram budget per send.
    pub packet_buffer_size: usize,
    /// Multiplier on `log10(cluster size)` bounding per-item
    /// retransmissions.
    pub retransmit_mult: usize,

    /// How often queued table events are drained to random peers.
    pub gossip_interval: Duration,
    /// How often full network state is reconciled with one peer.
    pub bulk_sync_interval: Duration,

    /// Minimum tombstone retention before an entry is purged.
    pub reap_entry_interval: Duration,
    /// Retention of a `leaving` network membership.
    pub reap_network_interval: Duration,
    /// Tick of the entry/network reaper.
    pub reap_period: Duration,
    /// Tick of the failed-node reconnect probe.
    pub retry_interval: Duration,
    /// Retention of failed/left nodes before they are forgotten.
    pub node_reap_interval: Duration,
    /// Tick of the dead-node reaper.
    pub node_reap_period: Duration,

    /// How often the bootstrap list is re-checked to heal split
    /// clusters.
    pub rejoin_cluster_interval: Duration,
    /// How long a single rejoin attempt keeps retrying.
    pub rejoin_cluster_duration: Duration,

    /// Cadence of the per-network queue statistics log line.
    pub stats_print_period: Duration,

    /// Seed for the internal RNG (peer sampling, jitter). `None`
    /// seeds from the OS; tests pin it for determinism.
    pub rng_seed: Option<u64>,
}

impl Config {
    /// A configuration with production defaults for the given node id.
    pub fn new(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            hostname: node_id.clone(),
            node_id,
            keys: Vec::new(),
            packet_buffer_size: 1400,
            retransmit_mult: 4,
            gossip_interval: Duration::from_millis(200),
            bulk_sync_interval: Duration::from_secs(30),
            reap_entry_interval: Duration::from_secs(30 * 60),
            reap_network_interval: Duration::from_secs(30 * 60),
            reap_period: Duration::from_secs(5),
            retry_interval: Duration::from_secs(1),
            node_reap_interval: Duration::from_secs(24 * 60 * 60),
            node_reap_period: Duration::from_secs(2 * 60 * 60),
            rejoin_cluster_interval: Duration::from_secs(60),
            rejoin_cluster_duration: Duration::from_secs(10),
            stats_print_period: Duration::from_secs(5 * 60),
            rng_seed: None,
        }
    }
}
