//! Core types for the meshdb network database
//!
//! Leaf crate of the workspace: identifier aliases, Lamport clocks,
//! the gossip event structs and the big-endian wire codec. Everything
//! here is transport-agnostic; the substrate seam lives in
//! `meshdb-net-types` and the database itself in `meshdb-core`.

pub mod clock;
pub mod event;
pub mod wire;

pub use clock::LamportClock;
pub use event::{
    BulkSyncMessage, Message, NetworkEntry, NetworkEvent, NetworkEventType, NetworkPushPull,
    NodeEvent, NodeEventType, TableEvent, TableEventType,
};
pub use wire::{
    decode_compound_stream, decode_message, encode_message, make_compound, make_compound_chunks,
    WireError, COMPOUND_HEADER_OVERHEAD, COMPOUND_OVERHEAD,
};

/// Stable identifier of a cluster node, assigned by the orchestrator.
pub type NodeId = String;

/// Identifier of a network scoping a set of tables.
pub type NetworkId = String;
