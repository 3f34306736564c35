//! Inbound event processing
//!
//! The membership substrate delivers raw payloads and node liveness
//! callbacks here. Events are deduplicated by Lamport time, applied
//! under the write lock, and rebroadcast when they carried news.
//! Equal logical times on the same key break deterministically: the
//! lexicographically larger author id wins everywhere.

use crate::broadcast::{gather_broadcasts, BroadcastId};
use crate::db::{NetworkDb, NodeRecord, RemoteAttachment};
use crate::entry::Entry;
use crate::watch::WatchEventKind;
use bytes::Bytes;
use meshdb_model::{
    decode_compound_stream, decode_message, encode_message, BulkSyncMessage, Message, NetworkEntry,
    NetworkEvent, NetworkEventType, NetworkPushPull, NodeEvent, NodeEventType, TableEvent,
    TableEventType,
};
use meshdb_net_types::{MemberInfo, MembershipDelegate};
use std::time::Duration;

impl MembershipDelegate for NetworkDb {
    fn notify_msg(&self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        self.handle_message(payload, false);
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Bytes> {
        gather_broadcasts(
            overhead,
            limit,
            &[&self.node_broadcasts, &self.network_broadcasts],
        )
    }

    fn local_state(&self, _join: bool) -> Bytes {
        let state = self.state_read();
        let mut networks = Vec::new();
        for (nid, network) in &state.this_node_networks {
            networks.push(NetworkEntry {
                network_id: nid.clone(),
                node: self.config.node_id.clone(),
                ltime: network.ltime,
                leaving: network.leaving,
            });
        }
        for (node, attachments) in &state.remote_networks {
            for (nid, attachment) in attachments {
                networks.push(NetworkEntry {
                    network_id: nid.clone(),
                    node: node.clone(),
                    ltime: attachment.ltime,
                    leaving: attachment.leaving,
                });
            }
        }
        drop(state);
        encode_message(&Message::PushPull(NetworkPushPull {
            ltime: self.network_clock.time(),
            node: self.config.node_id.clone(),
            networks,
        }))
    }

    fn merge_remote_state(&self, buf: &[u8], _join: bool) {
        match decode_message(buf) {
            Ok(Message::PushPull(push_pull)) => self.handle_push_pull(push_pull),
            Ok(other) => {
                tracing::warn!(message = ?other, "Unexpected message in push-pull exchange")
            }
            Err(e) => tracing::warn!(error = %e, "Failed to decode push-pull state"),
        }
    }

    fn notify_join(&self, member: &MemberInfo) {
        let was_failed = {
            let mut state = self.state_write();
            let was_failed = state.failed_nodes.remove(&member.name).is_some();
            state.left_nodes.remove(&member.name);
            state.nodes.insert(
                member.name.clone(),
                NodeRecord {
                    info: member.clone(),
                    reap_time: Duration::ZERO,
                },
            );
            self.refresh_cluster_estimate(&state);
            was_failed
        };
        tracing::info!(node = %member.name, "Node join");

        // Recovery from a failure window: converge immediately rather
        // than waiting for the next periodic sync.
        if was_failed {
            let name = member.name.clone();
            if let Some(db) = self.me() {
                tokio::spawn(async move {
                    tracing::debug!(node = %name, "Initiating bulk sync with recovered node");
                    if let Err(e) = db.bulk_sync(vec![name.clone()], true).await {
                        tracing::warn!(node = %name, error = %e, "Bulk sync with recovered node failed");
                    }
                });
            }
        }
    }

    fn notify_leave(&self, member: &MemberInfo) {
        let mut state = self.state_write();
        // A graceful NodeEvent may have already moved it to left_nodes
        if state.left_nodes.contains_key(&member.name) {
            return;
        }
        if let Some(mut record) = state.nodes.remove(&member.name) {
            record.reap_time = self.config.node_reap_interval;
            state.failed_nodes.insert(member.name.clone(), record);
            self.refresh_cluster_estimate(&state);
            drop(state);
            tracing::warn!(node = %member.name, "Node failure detected");
        }
    }
}

impl NetworkDb {
    /// Demultiplex one wire payload. `is_bulk_sync` suppresses
    /// rebroadcast: bulk-synced state is already converging reliably.
    pub(crate) fn handle_message(&self, buf: &[u8], is_bulk_sync: bool) {
        match decode_message(buf) {
            Ok(Message::Compound(parts)) => {
                for part in parts {
                    self.handle_message(&part, is_bulk_sync);
                }
            }
            Ok(Message::Table(event)) => {
                if self.handle_table_event(&event) && !is_bulk_sync {
                    self.rebroadcast_table_event(buf, &event);
                }
            }
            Ok(Message::Network(event)) => {
                if self.handle_network_event(&event) {
                    self.network_broadcasts.queue_broadcast(
                        BroadcastId::Network {
                            node: event.node.clone(),
                            network_id: event.network_id.clone(),
                        },
                        event.ltime,
                        Bytes::copy_from_slice(buf),
                    );
                }
            }
            Ok(Message::Node(event)) => {
                if self.handle_node_event(&event) {
                    self.node_broadcasts.queue_broadcast(
                        BroadcastId::Node {
                            node: event.node.clone(),
                        },
                        event.ltime,
                        Bytes::copy_from_slice(buf),
                    );
                }
            }
            Ok(Message::BulkSync(message)) => self.handle_bulk_sync(message),
            Ok(Message::PushPull(_)) => {
                tracing::warn!("Push-pull payload outside a state exchange, dropping")
            }
            Err(e) => tracing::warn!(error = %e, "Failed to decode inbound message"),
        }
    }

    fn rebroadcast_table_event(&self, buf: &[u8], event: &TableEvent) {
        let queue = self
            .state_read()
            .this_node_networks
            .get(&event.network_id)
            .map(|n| n.table_rebroadcasts.clone());
        if let Some(queue) = queue {
            queue.queue_broadcast(
                BroadcastId::Table {
                    network_id: event.network_id.clone(),
                    table: event.table.clone(),
                    key: event.key.clone(),
                },
                event.ltime,
                Bytes::copy_from_slice(buf),
            );
        }
    }

    /// Apply a remote table event. Returns whether it carried news
    /// (and therefore should be rebroadcast).
    pub(crate) fn handle_table_event(&self, event: &TableEvent) -> bool {
        self.table_clock.witness(event.ltime);

        let mut state = self.state_write();

        // Drop events for networks we are not (or no longer) part of,
        // and events whose author has left the network.
        let attached = state
            .this_node_networks
            .get(&event.network_id)
            .map(|n| !n.leaving)
            .unwrap_or(false);
        let author_present = state
            .network_nodes
            .get(&event.network_id)
            .map(|nodes| nodes.contains(&event.node))
            .unwrap_or(false);
        if !attached || !author_present {
            tracing::debug!(
                network_id = %event.network_id,
                table = %event.table,
                key = %event.key,
                author = %event.node,
                "Ignoring table event outside current membership"
            );
            return false;
        }

        let existing = state
            .get_table_entry(&event.table, &event.network_id, &event.key)
            .cloned();
        if let Some(current) = &existing {
            if current.ltime > event.ltime {
                return false;
            }
            if current.ltime == event.ltime && current.node >= event.node {
                return false;
            }
        }

        let reap_time = if event.event == TableEventType::Delete {
            // Adopt the residual if sane so late deletions don't get a
            // fresh full retention on every hop. Residuals travel as
            // whole seconds, so anything accepted here is at least 1s.
            let residual = Duration::from_secs(event.residual_reap_secs.max(0) as u64);
            if !residual.is_zero() && residual <= self.config.reap_entry_interval {
                residual.max(Duration::from_secs(1))
            } else {
                self.config.reap_entry_interval
            }
        } else {
            Duration::ZERO
        };

        state.install_entry(
            &event.network_id,
            &event.table,
            &event.key,
            Entry {
                ltime: event.ltime,
                node: event.node.clone(),
                value: event.value.clone(),
                deleting: event.event == TableEventType::Delete,
                reap_time,
            },
        );
        drop(state);

        let was_live = existing.as_ref().map(|e| !e.deleting).unwrap_or(false);
        let kind = match event.event {
            TableEventType::Delete => {
                if !was_live {
                    // Tombstone for a key local observers never saw
                    return true;
                }
                WatchEventKind::Delete
            }
            _ if was_live => WatchEventKind::Update,
            _ => WatchEventKind::Create,
        };
        self.notify_watchers(
            kind,
            &event.network_id,
            &event.table,
            &event.key,
            event.value.clone(),
            &event.node,
        );
        true
    }

    /// Apply a remote network join/leave. Returns whether it carried
    /// news.
    pub(crate) fn handle_network_event(&self, event: &NetworkEvent) -> bool {
        self.network_clock.witness(event.ltime);

        let mut state = self.state_write();
        if event.node == self.config.node_id {
            return false;
        }

        let known = state
            .remote_networks
            .get(&event.node)
            .and_then(|m| m.get(&event.network_id))
            .map(|a| a.ltime);
        match known {
            Some(ltime) if ltime >= event.ltime => false,
            Some(_) => {
                let leaving = event.event == NetworkEventType::Leave;
                if let Some(attachment) = state
                    .remote_networks
                    .get_mut(&event.node)
                    .and_then(|m| m.get_mut(&event.network_id))
                {
                    attachment.ltime = event.ltime;
                    attachment.leaving = leaving;
                    if leaving {
                        attachment.reap_time = self.config.reap_network_interval;
                    }
                }
                if leaving {
                    // The node leaves the network but not the cluster:
                    // tombstone its entries so bulk syncs propagate
                    // the deletions.
                    self.delete_node_network_entries(&mut state, &event.network_id, &event.node);
                    state.delete_network_node(&event.network_id, &event.node);
                } else {
                    state.add_network_node(&event.network_id, event.node.clone());
                }
                true
            }
            None => {
                if event.event == NetworkEventType::Leave {
                    // Never heard of this attachment; nothing to undo
                    return false;
                }
                // An attachment for a node the membership layer has
                // not reported would never be cleaned up; wait for it.
                if !state.nodes.contains_key(&event.node) {
                    return false;
                }
                state
                    .remote_networks
                    .entry(event.node.clone())
                    .or_default()
                    .insert(
                        event.network_id.clone(),
                        RemoteAttachment {
                            ltime: event.ltime,
                            leaving: false,
                            reap_time: Duration::ZERO,
                        },
                    );
                state.add_network_node(&event.network_id, event.node.clone());
                true
            }
        }
    }

    /// Apply a cluster-level node event. Returns whether it carried
    /// news.
    pub(crate) fn handle_node_event(&self, event: &NodeEvent) -> bool {
        self.network_clock.witness(event.ltime);

        let mut state = self.state_write();
        if event.node == self.config.node_id {
            return false;
        }

        match event.event {
            NodeEventType::Join => {
                let record = state
                    .failed_nodes
                    .remove(&event.node)
                    .or_else(|| state.left_nodes.remove(&event.node));
                match record {
                    Some(mut record) => {
                        record.reap_time = Duration::ZERO;
                        state.nodes.insert(event.node.clone(), record);
                        self.refresh_cluster_estimate(&state);
                        tracing::info!(node = %event.node, "Node rejoin announcement");
                        true
                    }
                    // Active already, or unknown to the substrate
                    None => false,
                }
            }
            NodeEventType::Leave => {
                if state.left_nodes.contains_key(&event.node) {
                    return false;
                }
                let record = state
                    .nodes
                    .remove(&event.node)
                    .or_else(|| state.failed_nodes.remove(&event.node));
                let Some(mut record) = record else {
                    return false;
                };
                record.reap_time = self.config.node_reap_interval;
                state.left_nodes.insert(event.node.clone(), record);
                self.refresh_cluster_estimate(&state);

                // A node that left the cluster left every network:
                // tombstone its entries and drop its attachments.
                let networks: Vec<String> = state
                    .remote_networks
                    .remove(&event.node)
                    .map(|m| m.keys().cloned().collect())
                    .unwrap_or_default();
                for nid in networks {
                    self.delete_node_network_entries(&mut state, &nid, &event.node);
                    state.delete_network_node(&nid, &event.node);
                }
                drop(state);
                tracing::info!(node = %event.node, "Node leave announcement");
                true
            }
        }
    }

    fn handle_push_pull(&self, push_pull: NetworkPushPull) {
        if push_pull.ltime > 0 {
            self.network_clock.witness(push_pull.ltime);
        }
        for entry in push_pull.networks {
            if entry.node == self.config.node_id {
                continue;
            }
            let event = NetworkEvent {
                event: if entry.leaving {
                    NetworkEventType::Leave
                } else {
                    NetworkEventType::Join
                },
                node: entry.node,
                network_id: entry.network_id,
                ltime: entry.ltime,
            };
            self.handle_network_event(&event);
        }
    }

    fn handle_bulk_sync(&self, message: BulkSyncMessage) {
        if message.ltime > 0 {
            self.table_clock.witness(message.ltime);
        }
        match decode_compound_stream(&message.payload) {
            Ok(parts) => {
                for part in parts {
                    self.handle_message(&part, true);
                }
            }
            Err(e) => {
                tracing::warn!(node = %message.node, error = %e, "Failed to decode bulk sync payload")
            }
        }

        if !message.unsolicited {
            // This is the solicited reply: release the waiter.
            let mut state = self.state_write();
            if let Some(ack) = state.bulk_sync_ack.remove(&message.node) {
                let _ = ack.send(());
            }
            return;
        }

        let Some(db) = self.me() else { return };
        tokio::spawn(async move {
            if let Err(e) = db
                .bulk_sync_node(message.networks, message.node.clone(), false)
                .await
            {
                tracing::warn!(node = %message.node, error = %e, "Bulk sync reply failed");
            }
        });
    }
}
