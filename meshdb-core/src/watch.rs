//! Change notifications for external consumers
//!
//! Every applied change (local or remote) is published on a broadcast
//! channel; `watch` layers a table/network/key filter on top and hands
//! the caller a private stream plus a cancellation handle.

use crate::NetworkDb;
use bytes::Bytes;
use meshdb_model::{NetworkId, NodeId};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    Create,
    Update,
    Delete,
}

/// One applied change to the local replica.
#[derive(Clone, Debug)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub network_id: NetworkId,
    pub table: String,
    pub key: String,
    /// For deletes this is the last value the entry held.
    pub value: Bytes,
    /// Node that authored the change.
    pub node: NodeId,
}

impl NetworkDb {
    /// Subscribe to changes matching the filter; empty strings are
    /// wildcards. Dropping the receiver or cancelling the token ends
    /// the subscription.
    pub fn watch(
        &self,
        table: &str,
        network_id: &str,
        key: &str,
    ) -> (mpsc::UnboundedReceiver<WatchEvent>, CancellationToken) {
        let mut rx = self.watch_tx.subscribe();
        let (tx, out_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let (table, network_id, key) = (table.to_owned(), network_id.to_owned(), key.to_owned());

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    event = rx.recv() => match event {
                        Ok(ev) => {
                            let matches = (table.is_empty() || table == ev.table)
                                && (network_id.is_empty() || network_id == ev.network_id)
                                && (key.is_empty() || key == ev.key);
                            if matches && tx.send(ev).is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(lagged = n, "Watch subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });

        (out_rx, cancel)
    }

    pub(crate) fn notify_watchers(
        &self,
        kind: WatchEventKind,
        network_id: &str,
        table: &str,
        key: &str,
        value: Bytes,
        node: &str,
    ) {
        let _ = self.watch_tx.send(WatchEvent {
            kind,
            network_id: network_id.to_owned(),
            table: table.to_owned(),
            key: key.to_owned(),
            value,
            node: node.to_owned(),
        });
    }
}
