//! NetworkDb - the gossip-backed network database
//!
//! Holds the authoritative local replica: two prefix indexes over the
//! same entries, the cluster membership maps, and per-network
//! metadata, all guarded by a single reader/writer lock. Mutations
//! stamp a Lamport time, install locally, then queue a gossip event;
//! convergence with remote state happens in `handlers`.

use crate::broadcast::{BroadcastId, TransmitLimitedQueue};
use crate::entry::{network_path, network_prefix, split_path, table_path, table_prefix, Entry};
use crate::error::{ClusterError, StoreError};
use crate::watch::{WatchEvent, WatchEventKind};
use crate::Config;
use bytes::Bytes;
use meshdb_model::{
    encode_message, LamportClock, Message, NetworkEvent, NetworkEventType, NetworkId, NodeEvent,
    NodeEventType, NodeId, TableEvent, TableEventType,
};
use meshdb_net_types::{Keyring, KeyringError, MemberInfo, MembershipLayer};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

/// A cluster member as seen by this node.
#[derive(Clone, Debug)]
pub(crate) struct NodeRecord {
    pub info: MemberInfo,
    /// Residual retention once the node is failed or left.
    pub reap_time: Duration,
}

/// A remote node's attachment to a network, deduplicated by ltime.
#[derive(Clone, Debug)]
pub(crate) struct RemoteAttachment {
    pub ltime: u64,
    pub leaving: bool,
    pub reap_time: Duration,
}

/// Local membership record for a joined network.
pub(crate) struct LocalNetwork {
    pub ltime: u64,
    pub leaving: bool,
    pub reap_time: Duration,
    /// Number of live entries scoped to this network.
    pub entries_number: Arc<AtomicI64>,
    /// Gossip messages drained since the last stats line.
    pub messages_sent: Arc<AtomicU64>,
    pub table_broadcasts: Arc<TransmitLimitedQueue>,
    pub table_rebroadcasts: Arc<TransmitLimitedQueue>,
}

/// Everything guarded by the database lock.
#[derive(Default)]
pub(crate) struct DbState {
    pub nodes: HashMap<NodeId, NodeRecord>,
    pub failed_nodes: HashMap<NodeId, NodeRecord>,
    pub left_nodes: HashMap<NodeId, NodeRecord>,

    /// Networks this node has joined.
    pub this_node_networks: HashMap<NetworkId, LocalNetwork>,
    /// Remote nodes' network attachments.
    pub remote_networks: HashMap<NodeId, HashMap<NetworkId, RemoteAttachment>>,
    /// All nodes (including self) attached to each network.
    pub network_nodes: HashMap<NetworkId, Vec<NodeId>>,

    /// Index keyed `/table/network/key`.
    pub by_table: BTreeMap<String, Entry>,
    /// Index keyed `/network/table/key`.
    pub by_network: BTreeMap<String, Entry>,

    /// Pending unsolicited bulk syncs awaiting a solicited reply.
    pub bulk_sync_ack: HashMap<NodeId, oneshot::Sender<()>>,
    /// Addresses given to `join`, probed by the rejoin worker.
    pub bootstrap_addrs: Vec<String>,
}

impl DbState {
    pub(crate) fn get_table_entry(&self, table: &str, nid: &str, key: &str) -> Option<&Entry> {
        self.by_table.get(&table_path(table, nid, key))
    }

    /// Install an entry in both indexes, maintaining the live-entry
    /// counter. Returns the previous version, if any.
    pub(crate) fn install_entry(
        &mut self,
        nid: &str,
        table: &str,
        key: &str,
        entry: Entry,
    ) -> Option<Entry> {
        let now_live = !entry.deleting;
        self.by_table
            .insert(table_path(table, nid, key), entry.clone());
        let prev = self.by_network.insert(network_path(nid, table, key), entry);
        let was_live = prev.as_ref().map(|e| !e.deleting).unwrap_or(false);
        let delta = match (was_live, now_live) {
            (false, true) => 1,
            (true, false) => -1,
            _ => 0,
        };
        if delta != 0 {
            if let Some(network) = self.this_node_networks.get(nid) {
                network.entries_number.fetch_add(delta, Ordering::Relaxed);
            }
        }
        prev
    }

    /// Remove an entry from both indexes. Returns per-index hit flags.
    pub(crate) fn remove_entry(&mut self, nid: &str, table: &str, key: &str) -> (bool, bool) {
        let from_table = self.by_table.remove(&table_path(table, nid, key));
        let from_network = self.by_network.remove(&network_path(nid, table, key));
        if from_network.as_ref().map(|e| !e.deleting).unwrap_or(false) {
            if let Some(network) = self.this_node_networks.get(nid) {
                network.entries_number.fetch_sub(1, Ordering::Relaxed);
            }
        }
        (from_table.is_some(), from_network.is_some())
    }

    pub(crate) fn add_network_node(&mut self, nid: &str, node: NodeId) {
        let nodes = self.network_nodes.entry(nid.to_owned()).or_default();
        if !nodes.contains(&node) {
            nodes.push(node);
        }
        self.refresh_network_estimate(nid);
    }

    pub(crate) fn delete_network_node(&mut self, nid: &str, node: &str) {
        if let Some(nodes) = self.network_nodes.get_mut(nid) {
            nodes.retain(|n| n != node);
        }
        self.refresh_network_estimate(nid);
    }

    fn refresh_network_estimate(&self, nid: &str) {
        let count = self.network_nodes.get(nid).map(|n| n.len()).unwrap_or(0);
        if let Some(network) = self.this_node_networks.get(nid) {
            network.table_broadcasts.set_num_nodes(count);
            network.table_rebroadcasts.set_num_nodes(count);
        }
    }
}

/// Timestamps driving the periodic statistics log line.
pub(crate) struct StatsClock {
    pub last_stats: Instant,
}

/// The database handle. Cheap to share: all methods take `&self`.
pub struct NetworkDb {
    pub(crate) config: Config,
    pub(crate) state: RwLock<DbState>,
    pub(crate) table_clock: LamportClock,
    pub(crate) network_clock: LamportClock,
    pub(crate) rng: Mutex<StdRng>,
    pub(crate) watch_tx: broadcast::Sender<WatchEvent>,
    pub(crate) keyring: Arc<Keyring>,
    pub(crate) substrate: Arc<dyn MembershipLayer>,
    pub(crate) cancel: CancellationToken,
    /// Cluster-wide queue for network join/leave events.
    pub(crate) network_broadcasts: Arc<TransmitLimitedQueue>,
    /// Cluster-wide queue for node-level events.
    pub(crate) node_broadcasts: Arc<TransmitLimitedQueue>,
    pub(crate) stats: Mutex<StatsClock>,
    me: OnceLock<Weak<NetworkDb>>,
}

impl std::fmt::Debug for NetworkDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkDb")
            .field("node_id", &self.config.node_id)
            .finish_non_exhaustive()
    }
}

impl NetworkDb {
    /// Create a database bound to a membership substrate and start the
    /// background workers. The node forms a cluster of one until
    /// [`NetworkDb::join`] is called.
    pub async fn new(
        config: Config,
        substrate: Arc<dyn MembershipLayer>,
    ) -> Result<Arc<Self>, ClusterError> {
        let keyring = Arc::new(Keyring::new(config.keys.clone()));
        for (i, key) in config.keys.iter().enumerate() {
            tracing::debug!(
                index = i + 1,
                key = %hex::encode(&key[..key.len().min(3)]),
                "Encryption key installed"
            );
        }

        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (watch_tx, _) = broadcast::channel(1024);

        let db = Arc::new(Self {
            network_broadcasts: Arc::new(TransmitLimitedQueue::new(config.retransmit_mult)),
            node_broadcasts: Arc::new(TransmitLimitedQueue::new(config.retransmit_mult)),
            state: RwLock::new(DbState::default()),
            table_clock: LamportClock::new(),
            network_clock: LamportClock::new(),
            rng: Mutex::new(rng),
            watch_tx,
            keyring,
            substrate,
            cancel: CancellationToken::new(),
            stats: Mutex::new(StatsClock {
                last_stats: Instant::now(),
            }),
            me: OnceLock::new(),
            config,
        });
        let _ = db.me.set(Arc::downgrade(&db));

        db.substrate
            .start(db.clone(), db.keyring.clone())
            .await
            .map_err(ClusterError::Transport)?;
        db.cluster_init();
        Ok(db)
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    // ==================== Entry CRUD ====================

    /// Create a new entry. Fails if a live entry already exists for
    /// the key; re-creating over a tombstone is allowed.
    pub fn create_entry(
        &self,
        nid: &str,
        table: &str,
        key: &str,
        value: impl Into<Bytes>,
    ) -> Result<(), StoreError> {
        let value = value.into();
        let entry = {
            let mut state = self.state_write();
            self.ensure_joined(&state, nid)?;
            if let Some(existing) = state.get_table_entry(table, nid, key) {
                if !existing.deleting {
                    return Err(StoreError::AlreadyExists(
                        nid.into(),
                        table.into(),
                        key.into(),
                    ));
                }
            }
            let entry = Entry {
                ltime: self.table_clock.increment(),
                node: self.config.node_id.clone(),
                value,
                deleting: false,
                reap_time: Duration::ZERO,
            };
            state.install_entry(nid, table, key, entry.clone());
            entry
        };
        self.send_table_event(TableEventType::Create, nid, table, key, &entry);
        self.notify_watchers(
            WatchEventKind::Create,
            nid,
            table,
            key,
            entry.value,
            &self.config.node_id,
        );
        Ok(())
    }

    /// Supersede the value of an existing live entry.
    pub fn update_entry(
        &self,
        nid: &str,
        table: &str,
        key: &str,
        value: impl Into<Bytes>,
    ) -> Result<(), StoreError> {
        let value = value.into();
        let entry = {
            let mut state = self.state_write();
            self.ensure_joined(&state, nid)?;
            let live = state
                .get_table_entry(table, nid, key)
                .map(|e| !e.deleting)
                .unwrap_or(false);
            if !live {
                return Err(StoreError::NotFound(nid.into(), table.into(), key.into()));
            }
            let entry = Entry {
                ltime: self.table_clock.increment(),
                node: self.config.node_id.clone(),
                value,
                deleting: false,
                reap_time: Duration::ZERO,
            };
            state.install_entry(nid, table, key, entry.clone());
            entry
        };
        self.send_table_event(TableEventType::Update, nid, table, key, &entry);
        self.notify_watchers(
            WatchEventKind::Update,
            nid,
            table,
            key,
            entry.value,
            &self.config.node_id,
        );
        Ok(())
    }

    /// Tombstone an existing live entry. The value is preserved until
    /// the reaper purges the tombstone after `reap_entry_interval`.
    pub fn delete_entry(&self, nid: &str, table: &str, key: &str) -> Result<(), StoreError> {
        let entry = {
            let mut state = self.state_write();
            self.ensure_joined(&state, nid)?;
            let value = match state.get_table_entry(table, nid, key) {
                Some(e) if !e.deleting => e.value.clone(),
                _ => return Err(StoreError::NotFound(nid.into(), table.into(), key.into())),
            };
            let entry = Entry {
                ltime: self.table_clock.increment(),
                node: self.config.node_id.clone(),
                value,
                deleting: true,
                reap_time: self.config.reap_entry_interval,
            };
            state.install_entry(nid, table, key, entry.clone());
            entry
        };
        self.send_table_event(TableEventType::Delete, nid, table, key, &entry);
        self.notify_watchers(
            WatchEventKind::Delete,
            nid,
            table,
            key,
            entry.value,
            &self.config.node_id,
        );
        Ok(())
    }

    /// Fetch the value of a live entry.
    pub fn get_entry(&self, nid: &str, table: &str, key: &str) -> Result<Bytes, StoreError> {
        let state = self.state_read();
        match state.get_table_entry(table, nid, key) {
            Some(e) if !e.deleting => Ok(e.value.clone()),
            _ => Err(StoreError::NotFound(nid.into(), table.into(), key.into())),
        }
    }

    /// Iterate all live entries of a table across networks. The
    /// callback returns `true` to stop early.
    pub fn walk_table<F>(&self, table: &str, mut f: F)
    where
        F: FnMut(&str, &str, &Bytes) -> bool,
    {
        let state = self.state_read();
        let prefix = table_prefix(table);
        for (path, entry) in state.by_table.range(prefix.clone()..) {
            if !path.starts_with(&prefix) {
                break;
            }
            if entry.deleting {
                continue;
            }
            let Some((_, nid, key)) = split_path(path) else {
                continue;
            };
            if f(nid, key, &entry.value) {
                break;
            }
        }
    }

    // ==================== Network membership ====================

    /// Join a network: start replicating its tables, announce the
    /// attachment, and pull current state from its peers.
    pub async fn join_network(&self, nid: &str) -> Result<(), ClusterError> {
        let ltime = self.network_clock.increment();
        let peers = {
            let mut state = self.state_write();
            // A rejoin during the leaving window keeps the counter
            let entries = state
                .this_node_networks
                .get(nid)
                .map(|n| n.entries_number.load(Ordering::Relaxed))
                .unwrap_or(0);
            state.this_node_networks.insert(
                nid.to_owned(),
                LocalNetwork {
                    ltime,
                    leaving: false,
                    reap_time: Duration::ZERO,
                    entries_number: Arc::new(AtomicI64::new(entries)),
                    messages_sent: Arc::new(AtomicU64::new(0)),
                    table_broadcasts: Arc::new(TransmitLimitedQueue::new(
                        self.config.retransmit_mult,
                    )),
                    table_rebroadcasts: Arc::new(TransmitLimitedQueue::new(
                        self.config.retransmit_mult,
                    )),
                },
            );
            state.add_network_node(nid, self.config.node_id.clone());
            state.network_nodes.get(nid).cloned().unwrap_or_default()
        };

        self.send_network_event(NetworkEventType::Join, nid, ltime);
        tracing::debug!(
            hostname = %self.config.hostname,
            node = %self.config.node_id,
            network_id = %nid,
            "Joined network"
        );

        if let Err(e) = self.bulk_sync(peers, true).await {
            tracing::error!(network_id = %nid, error = %e, "Bulk sync while joining network failed");
        }
        Ok(())
    }

    /// Leave a network: tombstone own entries, drop remote ones,
    /// announce the departure and keep serving bulk syncs until the
    /// membership record is reaped.
    pub fn leave_network(&self, nid: &str) -> Result<(), StoreError> {
        let ltime = self.network_clock.increment();
        self.send_network_event(NetworkEventType::Leave, nid, ltime);

        let mut state = self.state_write();
        state.delete_network_node(nid, &self.config.node_id);
        self.delete_node_network_entries(&mut state, nid, &self.config.node_id);

        let Some(network) = state.this_node_networks.get_mut(nid) else {
            return Err(StoreError::NotJoined(nid.into()));
        };
        network.ltime = ltime;
        network.reap_time = self.config.reap_network_interval;
        network.leaving = true;
        Ok(())
    }

    /// Tombstone `node`'s entries in `nid`; when the local node itself
    /// is leaving, other nodes' entries are removed outright and own
    /// tombstones get a bumped ltime so they supersede the last write.
    pub(crate) fn delete_node_network_entries(&self, state: &mut DbState, nid: &str, node: &str) {
        let is_node_local = node == self.config.node_id;
        let prefix = network_prefix(nid);
        let mut tombstones = Vec::new();
        let mut removals = Vec::new();

        for (path, entry) in state.by_network.range(prefix.clone()..) {
            if !path.starts_with(&prefix) {
                break;
            }
            let Some((_, table, key)) = split_path(path) else {
                continue;
            };
            if entry.node != node && !is_node_local {
                continue;
            }
            if entry.deleting && !is_node_local {
                // Already garbage-collecting under its current residual
                continue;
            }
            if entry.node == node {
                let mut tombstone = entry.clone();
                tombstone.deleting = true;
                tombstone.reap_time = self.config.reap_entry_interval;
                if is_node_local {
                    tombstone.ltime += 1;
                }
                tombstones.push((table.to_owned(), key.to_owned(), tombstone));
            } else {
                removals.push((table.to_owned(), key.to_owned()));
            }
        }

        for (table, key, tombstone) in tombstones {
            state.install_entry(nid, &table, &key, tombstone);
        }
        for (table, key) in removals {
            state.remove_entry(nid, &table, &key);
        }
    }

    // ==================== Introspection ====================

    /// Networks this node is currently attached to (including ones in
    /// their leaving window).
    pub fn joined_networks(&self) -> Vec<NetworkId> {
        let mut nids: Vec<_> = self
            .state_read()
            .this_node_networks
            .keys()
            .cloned()
            .collect();
        nids.sort();
        nids
    }

    /// All cluster members this node currently considers active.
    pub fn cluster_peers(&self) -> Vec<MemberInfo> {
        self.state_read()
            .nodes
            .values()
            .map(|n| n.info.clone())
            .collect()
    }

    /// Nodes attached to a network, including self when joined.
    pub fn network_peers(&self, nid: &str) -> Vec<NodeId> {
        self.state_read()
            .network_nodes
            .get(nid)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of a network's index: `(table, key, tombstoned)`.
    /// Diagnostic surface; tombstones are visible here but not via
    /// [`NetworkDb::get_entry`].
    pub fn list_network_entries(&self, nid: &str) -> Vec<(String, String, bool)> {
        let state = self.state_read();
        let prefix = network_prefix(nid);
        let mut out = Vec::new();
        for (path, entry) in state.by_network.range(prefix.clone()..) {
            if !path.starts_with(&prefix) {
                break;
            }
            if let Some((_, table, key)) = split_path(path) {
                out.push((table.to_owned(), key.to_owned(), entry.deleting));
            }
        }
        out
    }

    // ==================== Keyring ====================

    /// Install a new symmetric key; a no-op when already present.
    pub fn set_key(&self, key: Bytes) {
        tracing::debug!(key = %hex::encode(&key[..key.len().min(3)]), "Adding key");
        self.keyring.add_key(key);
    }

    /// Promote an installed key to primary for outbound encryption.
    pub fn set_primary_key(&self, key: &[u8]) -> Result<(), KeyringError> {
        tracing::debug!(key = %hex::encode(&key[..key.len().min(3)]), "Primary key");
        self.keyring.use_key(key)
    }

    /// Drop an installed, non-primary key.
    pub fn remove_key(&self, key: &[u8]) -> Result<(), KeyringError> {
        tracing::debug!(key = %hex::encode(&key[..key.len().min(3)]), "Removing key");
        self.keyring.remove_key(key)
    }

    // ==================== Event emission ====================

    pub(crate) fn send_table_event(
        &self,
        event: TableEventType,
        nid: &str,
        table: &str,
        key: &str,
        entry: &Entry,
    ) {
        let msg = encode_message(&Message::Table(TableEvent {
            event,
            ltime: entry.ltime,
            node: entry.node.clone(),
            network_id: nid.to_owned(),
            table: table.to_owned(),
            key: key.to_owned(),
            value: entry.value.clone(),
            residual_reap_secs: entry.reap_time.as_secs() as i32,
        }));
        // The network may already be gone; the event is dropped then.
        let queue = self
            .state_read()
            .this_node_networks
            .get(nid)
            .map(|n| n.table_broadcasts.clone());
        if let Some(queue) = queue {
            queue.queue_broadcast(
                BroadcastId::Table {
                    network_id: nid.to_owned(),
                    table: table.to_owned(),
                    key: key.to_owned(),
                },
                entry.ltime,
                msg,
            );
        }
    }

    pub(crate) fn send_network_event(&self, event: NetworkEventType, nid: &str, ltime: u64) {
        let msg = encode_message(&Message::Network(NetworkEvent {
            event,
            node: self.config.node_id.clone(),
            network_id: nid.to_owned(),
            ltime,
        }));
        self.network_broadcasts.queue_broadcast(
            BroadcastId::Network {
                node: self.config.node_id.clone(),
                network_id: nid.to_owned(),
            },
            ltime,
            msg,
        );
    }

    pub(crate) fn send_node_event(&self, event: NodeEventType) {
        let ltime = self.network_clock.increment();
        let msg = encode_message(&Message::Node(NodeEvent {
            event,
            node: self.config.node_id.clone(),
            ltime,
        }));
        self.node_broadcasts.queue_broadcast(
            BroadcastId::Node {
                node: self.config.node_id.clone(),
            },
            ltime,
            msg,
        );
    }

    // ==================== Internals ====================

    fn ensure_joined(&self, state: &DbState, nid: &str) -> Result<(), StoreError> {
        let joined = state
            .this_node_networks
            .get(nid)
            .map(|n| !n.leaving)
            .unwrap_or(false);
        if joined {
            Ok(())
        } else {
            Err(StoreError::NotJoined(nid.into()))
        }
    }

    /// Select up to `m` random peers, never including self.
    pub(crate) fn random_nodes(&self, m: usize, nodes: &[NodeId]) -> Vec<NodeId> {
        let mut pool: Vec<NodeId> = nodes
            .iter()
            .filter(|n| **n != self.config.node_id)
            .cloned()
            .collect();
        pool.shuffle(&mut *self.rng_lock());
        pool.truncate(m);
        pool
    }

    pub(crate) fn random_stagger(&self, period: Duration) -> Duration {
        let millis = period.as_millis().max(1) as u64;
        Duration::from_millis(self.rng_lock().gen_range(0..millis))
    }

    pub(crate) fn rng_lock(&self) -> std::sync::MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn state_read(&self) -> std::sync::RwLockReadGuard<'_, DbState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn state_write(&self) -> std::sync::RwLockWriteGuard<'_, DbState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Upgradeable self-reference for handlers that spawn work.
    pub(crate) fn me(&self) -> Option<Arc<NetworkDb>> {
        self.me.get()?.upgrade()
    }

    /// Refresh the cluster-size estimate on the cluster-wide queues.
    pub(crate) fn refresh_cluster_estimate(&self, state: &DbState) {
        let n = state.nodes.len();
        self.network_broadcasts.set_num_nodes(n);
        self.node_broadcasts.set_num_nodes(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::NullMembership;
    use crate::StoreError;

    async fn joined_db(name: &str, nid: &str) -> Arc<NetworkDb> {
        let mut config = Config::new(name);
        config.rng_seed = Some(1);
        let db = NetworkDb::new(config, Arc::new(NullMembership))
            .await
            .unwrap();
        db.join_network(nid).await.unwrap();
        db
    }

    #[tokio::test]
    async fn entry_ops_require_joined_network() {
        let db = joined_db("node-a", "net-1").await;
        let err = db.create_entry("other-net", "t", "k", "v").unwrap_err();
        assert!(matches!(err, StoreError::NotJoined(_)));
        let err = db.get_entry("other-net", "t", "k").unwrap_err();
        assert!(matches!(err, StoreError::NotFound(..)));
    }

    #[tokio::test]
    async fn create_then_get_roundtrips() {
        let db = joined_db("node-a", "net-1").await;
        db.create_entry("net-1", "endpoints", "svc", "10.0.0.1")
            .unwrap();
        assert_eq!(db.get_entry("net-1", "endpoints", "svc").unwrap(), "10.0.0.1");
    }

    #[tokio::test]
    async fn create_fails_on_live_entry_but_not_on_tombstone() {
        let db = joined_db("node-a", "net-1").await;
        db.create_entry("net-1", "t", "k", "v0").unwrap();
        let err = db.create_entry("net-1", "t", "k", "v1").unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(..)));

        db.delete_entry("net-1", "t", "k").unwrap();
        // Recreating over a tombstone is allowed and revives the key
        db.create_entry("net-1", "t", "k", "v2").unwrap();
        assert_eq!(db.get_entry("net-1", "t", "k").unwrap(), "v2");
    }

    #[tokio::test]
    async fn update_and_delete_require_live_entry() {
        let db = joined_db("node-a", "net-1").await;
        assert!(matches!(
            db.update_entry("net-1", "t", "k", "v").unwrap_err(),
            StoreError::NotFound(..)
        ));
        assert!(matches!(
            db.delete_entry("net-1", "t", "k").unwrap_err(),
            StoreError::NotFound(..)
        ));

        db.create_entry("net-1", "t", "k", "v0").unwrap();
        db.update_entry("net-1", "t", "k", "v1").unwrap();
        assert_eq!(db.get_entry("net-1", "t", "k").unwrap(), "v1");

        db.delete_entry("net-1", "t", "k").unwrap();
        assert!(db.get_entry("net-1", "t", "k").is_err());
        // The tombstone preserves the value and stays in the index
        let entries = db.list_network_entries("net-1");
        assert_eq!(entries, vec![("t".to_owned(), "k".to_owned(), true)]);
    }

    #[tokio::test]
    async fn local_writes_advance_the_table_clock() {
        let db = joined_db("node-a", "net-1").await;
        db.create_entry("net-1", "t", "k", "v0").unwrap();
        let t0 = db.table_clock.time();
        db.update_entry("net-1", "t", "k", "v1").unwrap();
        assert!(db.table_clock.time() > t0);
    }

    #[tokio::test]
    async fn walk_table_skips_tombstones_and_other_tables() {
        let db = joined_db("node-a", "net-1").await;
        db.join_network("net-2").await.unwrap();
        db.create_entry("net-1", "t", "a", "1").unwrap();
        db.create_entry("net-2", "t", "b", "2").unwrap();
        db.create_entry("net-1", "other", "c", "3").unwrap();
        db.create_entry("net-1", "t", "dead", "4").unwrap();
        db.delete_entry("net-1", "t", "dead").unwrap();

        let mut seen = Vec::new();
        db.walk_table("t", |nid, key, value| {
            seen.push((nid.to_owned(), key.to_owned(), value.clone()));
            false
        });
        seen.sort();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "net-1");
        assert_eq!(seen[0].1, "a");
        assert_eq!(seen[1].0, "net-2");
        assert_eq!(seen[1].1, "b");
    }

    #[tokio::test]
    async fn walk_table_stops_when_asked() {
        let db = joined_db("node-a", "net-1").await;
        for key in ["a", "b", "c"] {
            db.create_entry("net-1", "t", key, "v").unwrap();
        }
        let mut count = 0;
        db.walk_table("t", |_, _, _| {
            count += 1;
            true
        });
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn leave_network_tombstones_own_entries() {
        let db = joined_db("node-a", "net-1").await;
        db.create_entry("net-1", "t", "k", "v").unwrap();
        db.leave_network("net-1").unwrap();

        assert!(db.get_entry("net-1", "t", "k").is_err());
        let entries = db.list_network_entries("net-1");
        assert_eq!(entries, vec![("t".to_owned(), "k".to_owned(), true)]);
        // Entry ops are refused while the membership is winding down
        assert!(matches!(
            db.create_entry("net-1", "t", "k2", "v").unwrap_err(),
            StoreError::NotJoined(_)
        ));
    }

    #[tokio::test]
    async fn random_nodes_never_includes_self() {
        let db = joined_db("node-a", "net-1").await;
        let pool: Vec<String> = vec!["node-a".into(), "node-b".into(), "node-c".into()];
        for _ in 0..20 {
            let picked = db.random_nodes(2, &pool);
            assert!(!picked.contains(&"node-a".to_string()));
            assert!(picked.len() <= 2);
        }
    }
}
