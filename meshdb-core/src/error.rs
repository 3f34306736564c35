//! Error types for the public database API
//!
//! Gossip-path failures (lost packets, decode errors, failed bulk
//! syncs) are logged and never surfaced; only local misuse and
//! cluster lifecycle failures reach callers.

use meshdb_net_types::MembershipError;

/// Errors from the entry CRUD surface.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no entry in network {0} table {1} for key {2}")]
    NotFound(String, String, String),
    #[error("entry already exists in network {0} table {1} for key {2}")]
    AlreadyExists(String, String, String),
    #[error("network {0} not joined")]
    NotJoined(String),
}

/// Errors from cluster lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("membership transport: {0}")]
    Transport(#[from] MembershipError),
}
