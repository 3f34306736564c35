//! Bulk sync engine
//!
//! Anti-entropy over the substrate's reliable channel: snapshot every
//! entry (tombstones included) of the chosen networks, frame them as
//! compound table events, and exchange with one peer. An unsolicited
//! sync waits for the solicited reply as its acknowledgement.

use crate::db::NetworkDb;
use crate::entry::{network_prefix, split_path};
use crate::error::ClusterError;
use meshdb_model::{
    encode_message, make_compound_chunks, BulkSyncMessage, Message, NetworkId, NodeId, TableEvent,
    TableEventType,
};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

const BULK_SYNC_ACK_TIMEOUT: Duration = Duration::from_secs(30);

impl NetworkDb {
    /// Periodic tick: reconcile every joined network with one random
    /// peer, pruning networks already covered by an earlier exchange
    /// in the same tick.
    pub(crate) async fn bulk_sync_tables(&self) {
        let mut networks: Vec<NetworkId> = {
            let state = self.state_read();
            state
                .this_node_networks
                .iter()
                .filter(|(_, n)| !n.leaving)
                .map(|(nid, _)| nid.clone())
                .collect()
        };

        while let Some(nid) = networks.pop() {
            let nodes = self
                .state_read()
                .network_nodes
                .get(&nid)
                .cloned()
                .unwrap_or_default();
            if nodes.is_empty() {
                continue;
            }

            match self.bulk_sync(nodes, false).await {
                Ok(completed) => networks.retain(|n| !completed.contains(n)),
                Err(e) => {
                    tracing::error!(network_id = %nid, error = %e, "Periodic bulk sync failed");
                }
            }
        }
    }

    /// Sync all common networks with one of the given nodes. With
    /// `all = false`, two random candidates are drawn and the second
    /// only tried if the first fails; with `all = true` every node is
    /// synced. Returns the networks covered on success.
    pub(crate) async fn bulk_sync(
        &self,
        mut nodes: Vec<NodeId>,
        all: bool,
    ) -> Result<Vec<NetworkId>, ClusterError> {
        if !all {
            nodes = self.random_nodes(2, &nodes);
        }
        if nodes.is_empty() {
            return Ok(Vec::new());
        }

        let mut networks = Vec::new();
        let mut success = false;
        let mut last_err = None;
        for node in &nodes {
            if *node == self.config.node_id {
                continue;
            }
            tracing::debug!(
                hostname = %self.config.hostname,
                node = %node,
                "Initiating bulk sync"
            );
            networks = self.find_common_networks(node);
            match self.bulk_sync_node(networks.clone(), node.clone(), true).await {
                Ok(()) => {
                    success = true;
                    if !all {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(node = %node, error = %e, "Bulk sync failed");
                    last_err = Some(e);
                }
            }
        }

        if success {
            Ok(networks)
        } else {
            match last_err {
                Some(e) => Err(e),
                None => Ok(Vec::new()),
            }
        }
    }

    /// Send the full table state of `networks` to `node`. Unsolicited
    /// syncs register an ack and wait for the solicited reply; the
    /// wait is bounded and cancellation-safe.
    pub(crate) async fn bulk_sync_node(
        &self,
        networks: Vec<NetworkId>,
        node: NodeId,
        unsolicited: bool,
    ) -> Result<(), ClusterError> {
        let msgs = {
            let state = self.state_read();
            if !state.nodes.contains_key(&node) {
                // The node vanished between selection and send
                return Ok(());
            }
            let mut msgs = Vec::new();
            for nid in &networks {
                let prefix = network_prefix(nid);
                for (path, entry) in state.by_network.range(prefix.clone()..) {
                    if !path.starts_with(&prefix) {
                        break;
                    }
                    let Some((_, table, key)) = split_path(path) else {
                        continue;
                    };
                    let event = TableEvent {
                        event: if entry.deleting {
                            TableEventType::Delete
                        } else {
                            TableEventType::Create
                        },
                        ltime: entry.ltime,
                        node: entry.node.clone(),
                        network_id: nid.clone(),
                        table: table.to_owned(),
                        key: key.to_owned(),
                        value: entry.value.clone(),
                        // Truncation to whole seconds; the reaper keeps
                        // this strictly positive for live tombstones.
                        residual_reap_secs: entry.reap_time.as_secs() as i32,
                    };
                    msgs.push(encode_message(&Message::Table(event)));
                }
            }
            msgs
        };

        let message = BulkSyncMessage {
            ltime: self.table_clock.time(),
            unsolicited,
            node: self.config.node_id.clone(),
            networks,
            payload: make_compound_chunks(&msgs),
        };
        let buf = encode_message(&Message::BulkSync(message));

        let ack = if unsolicited {
            let (tx, rx) = oneshot::channel();
            self.state_write().bulk_sync_ack.insert(node.clone(), tx);
            Some(rx)
        } else {
            None
        };

        if let Err(e) = self.substrate.send_reliable(&node, buf).await {
            if unsolicited {
                self.state_write().bulk_sync_ack.remove(&node);
            }
            return Err(ClusterError::Transport(e));
        }

        if let Some(rx) = ack {
            let started = Instant::now();
            tokio::select! {
                res = tokio::time::timeout(BULK_SYNC_ACK_TIMEOUT, rx) => match res {
                    Ok(Ok(())) => {
                        tracing::debug!(
                            hostname = %self.config.hostname,
                            node = %node,
                            elapsed = ?started.elapsed(),
                            "Bulk sync acknowledged"
                        );
                    }
                    // Ack table cleared (shutdown) or waiter replaced
                    Ok(Err(_)) => {}
                    Err(_) => {
                        tracing::error!(node = %node, "Bulk sync to node timed out");
                        self.state_write().bulk_sync_ack.remove(&node);
                    }
                },
                _ = self.cancel.cancelled() => {
                    self.state_write().bulk_sync_ack.remove(&node);
                }
            }
        }
        Ok(())
    }

    /// Networks both this node and `node` are attached to, neither
    /// side leaving.
    pub(crate) fn find_common_networks(&self, node: &str) -> Vec<NetworkId> {
        let state = self.state_read();
        let mut common: Vec<NetworkId> = state
            .this_node_networks
            .iter()
            .filter(|(_, n)| !n.leaving)
            .filter(|(nid, _)| {
                state
                    .remote_networks
                    .get(node)
                    .and_then(|m| m.get(*nid))
                    .map(|a| !a.leaving)
                    .unwrap_or(false)
            })
            .map(|(nid, _)| nid.clone())
            .collect();
        common.sort();
        common
    }
}
