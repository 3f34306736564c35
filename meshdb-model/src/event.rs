//! Gossip event types
//!
//! One struct per wire message plus the tagged [`Message`] union the
//! decoder returns. Event payloads carry the author's Lamport time so
//! receivers can witness their clocks and discard stale state.

use crate::{NetworkId, NodeId};
use bytes::Bytes;

/// Network membership event kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NetworkEventType {
    Join = 0,
    Leave = 1,
}

/// Node-level cluster event kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeEventType {
    Join = 0,
    Leave = 1,
}

/// Table entry event kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TableEventType {
    Create = 0,
    Update = 1,
    Delete = 2,
}

/// A node joining or leaving a specific network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkEvent {
    pub event: NetworkEventType,
    pub node: NodeId,
    pub network_id: NetworkId,
    pub ltime: u64,
}

/// A node joining or gracefully leaving the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeEvent {
    pub event: NodeEventType,
    pub node: NodeId,
    pub ltime: u64,
}

/// A create/update/delete of one table entry.
///
/// `residual_reap_secs` is only meaningful for deletes: the remaining
/// tombstone lifetime in whole seconds, so receivers bound their own
/// retention independently of clock skew.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableEvent {
    pub event: TableEventType,
    pub ltime: u64,
    pub node: NodeId,
    pub network_id: NetworkId,
    pub table: String,
    pub key: String,
    pub value: Bytes,
    pub residual_reap_secs: i32,
}

/// One network attachment inside a push-pull exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkEntry {
    pub network_id: NetworkId,
    pub node: NodeId,
    pub ltime: u64,
    pub leaving: bool,
}

/// Full-state node/network metadata exchange, carried over the
/// substrate's push-pull channel. Never contains table entries; those
/// travel via [`BulkSyncMessage`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkPushPull {
    pub ltime: u64,
    pub node: NodeId,
    pub networks: Vec<NetworkEntry>,
}

/// Anti-entropy exchange of table state for a set of networks.
///
/// `payload` is one or more compound-framed [`TableEvent`]s. An
/// unsolicited message asks the receiver to reply with a solicited one
/// covering the same networks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BulkSyncMessage {
    pub ltime: u64,
    pub unsolicited: bool,
    pub node: NodeId,
    pub networks: Vec<NetworkId>,
    pub payload: Bytes,
}

/// Tagged union of everything the wire decoder can produce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Network(NetworkEvent),
    Table(TableEvent),
    PushPull(NetworkPushPull),
    BulkSync(BulkSyncMessage),
    Compound(Vec<Bytes>),
    Node(NodeEvent),
}
