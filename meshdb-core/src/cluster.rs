//! Cluster lifecycle and periodic workers
//!
//! Six long-running tasks drive convergence: the entry/network
//! reaper, the gossip drainer, the bulk-sync tick, the failed-node
//! reconnect probe, the dead-node reaper and the bootstrap rejoiner.
//! Each starts with a random stagger within its period so clusters
//! deployed together do not tick in lockstep, and all observe one
//! root cancellation token.

use crate::broadcast::gather_broadcasts;
use crate::db::NetworkDb;
use crate::entry::{network_prefix, split_path};
use crate::error::ClusterError;
use meshdb_model::{make_compound, NodeEventType, COMPOUND_HEADER_OVERHEAD, COMPOUND_OVERHEAD};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

impl NetworkDb {
    pub(crate) fn cluster_init(self: &Arc<Self>) {
        self.spawn_worker("reaper", self.config.reap_period, |db| async move {
            db.reap_state();
        });
        self.spawn_worker("gossip", self.config.gossip_interval, |db| async move {
            db.gossip().await;
        });
        self.spawn_worker("bulk-sync", self.config.bulk_sync_interval, |db| async move {
            db.bulk_sync_tables().await;
        });
        self.spawn_worker("reconnect", self.config.retry_interval, |db| async move {
            db.reconnect_node().await;
        });
        self.spawn_worker("node-reaper", self.config.node_reap_period, |db| async move {
            db.reap_dead_nodes();
        });
        self.spawn_worker(
            "rejoin-bootstrap",
            self.config.rejoin_cluster_interval,
            |db| async move {
                db.rejoin_cluster_bootstrap().await;
            },
        );
    }

    fn spawn_worker<F, Fut>(self: &Arc<Self>, name: &'static str, period: Duration, f: F)
    where
        F: Fn(Arc<NetworkDb>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let db = self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let stagger = db.random_stagger(period);
            tokio::select! {
                _ = tokio::time::sleep(stagger) => {}
                _ = cancel.cancelled() => return,
            }
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => f(db.clone()).await,
                    _ = cancel.cancelled() => {
                        tracing::debug!(worker = name, "Worker stopped");
                        return;
                    }
                }
            }
        });
    }

    // ==================== Cluster membership ====================

    /// Join an existing cluster through the given addresses and
    /// announce this node. The addresses are remembered as bootstrap
    /// targets for split-cluster healing.
    pub async fn join(&self, members: &[String]) -> Result<(), ClusterError> {
        {
            self.state_write().bootstrap_addrs = members.to_vec();
        }
        self.substrate
            .join(members)
            .await
            .map_err(ClusterError::Transport)?;
        self.send_node_event(NodeEventType::Join);
        Ok(())
    }

    /// Leave the cluster: announce the departure, give the substrate a
    /// moment to flush outgoing broadcasts, then stop all workers.
    pub async fn leave(&self) -> Result<(), ClusterError> {
        self.send_node_event(NodeEventType::Leave);
        if let Err(e) = self.substrate.leave(Duration::from_secs(1)).await {
            tracing::error!(error = %e, "Failed to broadcast leave message");
        }

        self.cancel.cancel();
        // Unblock any in-flight bulk-sync ack waits
        self.state_write().bulk_sync_ack.clear();

        self.substrate
            .shutdown()
            .await
            .map_err(ClusterError::Transport)
    }

    // ==================== Gossip ====================

    /// One gossip round: per joined network, drain the transmit
    /// queues into a compound datagram and send it best-effort to up
    /// to three random peers of that network.
    pub(crate) async fn gossip(&self) {
        struct NetworkSnapshot {
            nid: String,
            peers: Vec<String>,
            leaving: bool,
            entries: i64,
            fresh: Arc<crate::broadcast::TransmitLimitedQueue>,
            rebroadcast: Arc<crate::broadcast::TransmitLimitedQueue>,
            messages_sent: Arc<std::sync::atomic::AtomicU64>,
        }

        let (snapshots, print_stats) = {
            let state = self.state_read();
            let snapshots: Vec<NetworkSnapshot> = state
                .this_node_networks
                .iter()
                .map(|(nid, network)| NetworkSnapshot {
                    nid: nid.clone(),
                    peers: state.network_nodes.get(nid).cloned().unwrap_or_default(),
                    leaving: network.leaving,
                    entries: network.entries_number.load(Ordering::Relaxed),
                    fresh: network.table_broadcasts.clone(),
                    rebroadcast: network.table_rebroadcasts.clone(),
                    messages_sent: network.messages_sent.clone(),
                })
                .collect();
            let print_stats = {
                let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
                stats.last_stats.elapsed() >= self.config.stats_print_period
            };
            (snapshots, print_stats)
        };

        for snapshot in snapshots {
            let targets = self.random_nodes(3, &snapshot.peers);
            let bytes_avail = self
                .config
                .packet_buffer_size
                .saturating_sub(COMPOUND_HEADER_OVERHEAD);
            let msgs = gather_broadcasts(
                COMPOUND_OVERHEAD,
                bytes_avail,
                &[&snapshot.fresh, &snapshot.rebroadcast],
            );
            snapshot
                .messages_sent
                .fetch_add(msgs.len() as u64, Ordering::Relaxed);

            if print_stats {
                let sent = snapshot.messages_sent.swap(0, Ordering::Relaxed);
                let per_sec = sent / self.config.stats_print_period.as_secs().max(1);
                tracing::info!(
                    hostname = %self.config.hostname,
                    node = %self.config.node_id,
                    network_id = %snapshot.nid,
                    leaving = snapshot.leaving,
                    peers = snapshot.peers.len(),
                    entries = snapshot.entries,
                    queued = snapshot.fresh.len(),
                    requeued = snapshot.rebroadcast.len(),
                    msgs_per_sec = per_sec,
                    "NetworkDB stats"
                );
            }

            if msgs.is_empty() {
                continue;
            }
            let compound = make_compound(&msgs);

            for node in targets {
                let known = self.state_read().nodes.contains_key(&node);
                if !known {
                    // Stale attachment; membership will catch up
                    continue;
                }
                if let Err(e) = self.substrate.send_best_effort(&node, compound.clone()).await {
                    tracing::error!(node = %node, error = %e, "Failed to send gossip");
                }
            }
        }

        if print_stats {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.last_stats = Instant::now();
        }
    }

    // ==================== Reapers ====================

    /// Entry tombstones are garbage-collected before networks so the
    /// per-network walk still sees its membership record.
    pub(crate) fn reap_state(&self) {
        self.reap_table_entries();
        self.reap_networks();
    }

    fn reap_table_entries(&self) {
        let networks: Vec<String> = {
            let state = self.state_read();
            state.this_node_networks.keys().cloned().collect()
        };

        let reap_period = self.config.reap_period;
        let cycle_start = Instant::now();
        // Lock per network rather than across the whole cycle; the
        // compensation term accounts for the time other writers held
        // the lock in between.
        for nid in networks {
            let mut state = self.state_write();
            let crate::db::DbState {
                by_network,
                by_table,
                ..
            } = &mut *state;

            let prefix = network_prefix(&nid);
            let mut expired = Vec::new();
            for (path, entry) in by_network.range_mut(prefix.clone()..) {
                if !path.starts_with(&prefix) {
                    break;
                }
                if !entry.deleting {
                    continue;
                }
                let compensation = cycle_start.elapsed();
                // The extra second keeps the residual strictly
                // positive when truncated to whole seconds on the wire
                if entry.reap_time > reap_period + compensation + Duration::from_secs(1) {
                    entry.reap_time -= reap_period + compensation;
                    if let Some((enid, table, key)) = split_path(path) {
                        let mirror = crate::entry::table_path(table, enid, key);
                        if let Some(twin) = by_table.get_mut(&mirror) {
                            twin.reap_time = entry.reap_time;
                        }
                    }
                    continue;
                }
                if let Some((enid, table, key)) = split_path(path) {
                    expired.push((enid.to_owned(), table.to_owned(), key.to_owned()));
                }
            }

            for (enid, table, key) in expired {
                let (ok_table, ok_network) = state.remove_entry(&enid, &table, &key);
                if !ok_table || !ok_network {
                    tracing::error!(
                        network_id = %enid,
                        table = %table,
                        key = %key,
                        "Index delete failed for expired tombstone"
                    );
                }
            }
        }
    }

    fn reap_networks(&self) {
        let reap_period = self.config.reap_period;
        let mut state = self.state_write();
        state.this_node_networks.retain(|nid, network| {
            if !network.leaving {
                return true;
            }
            if network.reap_time.is_zero() {
                tracing::debug!(network_id = %nid, "Garbage collected left network");
                return false;
            }
            network.reap_time = network.reap_time.saturating_sub(reap_period);
            true
        });
        for attachments in state.remote_networks.values_mut() {
            attachments.retain(|_, attachment| {
                if !attachment.leaving {
                    return true;
                }
                if attachment.reap_time.is_zero() {
                    return false;
                }
                attachment.reap_time = attachment.reap_time.saturating_sub(reap_period);
                true
            });
        }
    }

    pub(crate) fn reap_dead_nodes(&self) {
        let period = self.config.node_reap_period;
        let mut state = self.state_write();
        let crate::db::DbState {
            failed_nodes,
            left_nodes,
            ..
        } = &mut *state;
        for map in [failed_nodes, left_nodes] {
            map.retain(|name, record| {
                if record.reap_time > period {
                    record.reap_time -= period;
                    return true;
                }
                tracing::debug!(node = %name, "Garbage collected node");
                false
            });
        }
    }

    // ==================== Healing ====================

    /// Try to re-establish contact with one random failed node; on
    /// success re-announce ourselves and converge via bulk sync.
    pub(crate) async fn reconnect_node(&self) {
        let candidates: Vec<crate::db::NodeRecord> = {
            let state = self.state_read();
            if state.failed_nodes.is_empty() {
                return;
            }
            state.failed_nodes.values().cloned().collect()
        };

        let pick = {
            let mut rng = self.rng_lock();
            rand::Rng::gen_range(&mut *rng, 0..candidates.len())
        };
        let target = &candidates[pick];
        let addr = format!("{}:{}", target.info.addr, target.info.port);

        if self.substrate.join(&[addr]).await.is_err() {
            return;
        }
        self.send_node_event(NodeEventType::Join);

        tracing::debug!(node = %target.info.name, "Initiating bulk sync after reconnect");
        if let Err(e) = self.bulk_sync(vec![target.info.name.clone()], true).await {
            tracing::warn!(node = %target.info.name, error = %e, "Bulk sync after reconnect failed");
        }
    }

    /// If none of the configured bootstrap nodes is currently an
    /// active member, two clusters may have formed out of a common
    /// restart; keep retrying a join against the bootstrap list for a
    /// bounded window.
    pub(crate) async fn rejoin_cluster_bootstrap(&self) {
        let targets: Vec<String> = {
            let state = self.state_read();
            if state.bootstrap_addrs.is_empty() {
                return;
            }
            if !state.nodes.contains_key(&self.config.node_id) {
                tracing::warn!(
                    node = %self.config.node_id,
                    "Rejoin bootstrap could not find local node info"
                );
                return;
            }
            let mut targets = Vec::new();
            for addr in &state.bootstrap_addrs {
                let connected = state.nodes.values().any(|record| {
                    record.info.name != self.config.node_id
                        && (record.info.name == *addr
                            || format!("{}:{}", record.info.addr, record.info.port) == *addr)
                });
                if connected {
                    // A bootstrap node is already in our cluster
                    return;
                }
                targets.push(addr.clone());
            }
            targets
        };
        if targets.is_empty() {
            return;
        }

        tracing::debug!(targets = ?targets, "Rejoining cluster through bootstrap nodes");
        let deadline = Instant::now() + self.config.rejoin_cluster_duration;
        let mut ticker = tokio::time::interval(self.config.retry_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        while Instant::now() < deadline {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    match self.substrate.join(&targets).await {
                        Ok(_) => {
                            self.send_node_event(NodeEventType::Join);
                            return;
                        }
                        Err(e) => {
                            tracing::error!(targets = ?targets, error = %e, "Bootstrap rejoin attempt failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::NullMembership;
    use crate::{Config, NetworkDb};
    use std::sync::Arc;
    use std::time::Duration;

    async fn db_with(reap_entry: Duration, reap_period: Duration) -> Arc<NetworkDb> {
        let mut config = Config::new("node-a");
        config.rng_seed = Some(1);
        config.reap_entry_interval = reap_entry;
        config.reap_network_interval = reap_entry;
        config.reap_period = reap_period;
        NetworkDb::new(config, Arc::new(NullMembership))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn tombstone_is_purged_once_its_residual_is_inside_one_period() {
        // Residual (1s) below reap_period + 1s margin: first pass purges
        let db = db_with(Duration::from_secs(1), Duration::from_secs(5)).await;
        db.join_network("net-1").await.unwrap();
        db.create_entry("net-1", "t", "k", "v").unwrap();
        db.delete_entry("net-1", "t", "k").unwrap();
        assert_eq!(db.list_network_entries("net-1").len(), 1);

        db.reap_state();
        assert!(db.list_network_entries("net-1").is_empty());
    }

    #[tokio::test]
    async fn long_lived_tombstone_is_decremented_in_both_indexes() {
        let db = db_with(Duration::from_secs(3600), Duration::from_secs(5)).await;
        db.join_network("net-1").await.unwrap();
        db.create_entry("net-1", "t", "k", "v").unwrap();
        db.delete_entry("net-1", "t", "k").unwrap();

        db.reap_state();
        let state = db.state_read();
        let by_network = state
            .by_network
            .get(&crate::entry::network_path("net-1", "t", "k"))
            .unwrap();
        let by_table = state
            .by_table
            .get(&crate::entry::table_path("t", "net-1", "k"))
            .unwrap();
        assert!(by_network.reap_time < Duration::from_secs(3600));
        assert_eq!(by_network.reap_time, by_table.reap_time);
        // Residual stays strictly positive for wire encoding
        assert!(by_network.reap_time >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn leaving_network_is_reaped_after_its_window() {
        let db = db_with(Duration::from_secs(1), Duration::from_secs(5)).await;
        db.join_network("net-1").await.unwrap();
        db.leave_network("net-1").unwrap();
        assert_eq!(db.joined_networks(), vec!["net-1".to_owned()]);

        // reap_network_interval (1s) is consumed in one period, the
        // record goes on the pass after it reaches zero
        db.reap_state();
        db.reap_state();
        assert!(db.joined_networks().is_empty());
    }

    #[tokio::test]
    async fn dead_nodes_are_reaped_after_their_interval() {
        let db = db_with(Duration::from_secs(1), Duration::from_secs(5)).await;
        {
            let mut state = db.state_write();
            state.failed_nodes.insert(
                "node-b".to_owned(),
                crate::db::NodeRecord {
                    info: crate::test_support::member("node-b"),
                    reap_time: db.config.node_reap_period,
                },
            );
        }
        db.reap_dead_nodes();
        assert!(db.state_read().failed_nodes.is_empty());
    }
}
