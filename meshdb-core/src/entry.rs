//! Entry records and index path encoding
//!
//! Both indexes key entries by a slash-joined path so that a
//! `BTreeMap` range scan gives prefix iteration per table or per
//! network. The key component may itself contain slashes; table and
//! network identifiers may not.

use bytes::Bytes;
use meshdb_model::NodeId;
use std::time::Duration;

/// One replicated record, live or tombstoned.
#[derive(Clone, Debug)]
pub(crate) struct Entry {
    /// Lamport time of the authoring node's table clock.
    pub ltime: u64,
    /// Node that authored this version.
    pub node: NodeId,
    pub value: Bytes,
    /// Tombstone flag; the value is preserved until the reaper runs.
    pub deleting: bool,
    /// Remaining tombstone lifetime, decremented by the reaper.
    pub reap_time: Duration,
}

/// Path in the by-table index: `/table/network/key`.
pub(crate) fn table_path(table: &str, nid: &str, key: &str) -> String {
    format!("/{table}/{nid}/{key}")
}

/// Path in the by-network index: `/network/table/key`.
pub(crate) fn network_path(nid: &str, table: &str, key: &str) -> String {
    format!("/{nid}/{table}/{key}")
}

/// Range-scan prefix covering every entry of one network.
pub(crate) fn network_prefix(nid: &str) -> String {
    format!("/{nid}/")
}

/// Range-scan prefix covering every entry of one table.
pub(crate) fn table_prefix(table: &str) -> String {
    format!("/{table}/")
}

/// Split an index path into its three components. The trailing
/// component keeps any embedded slashes.
pub(crate) fn split_path(path: &str) -> Option<(&str, &str, &str)> {
    let mut parts = path.strip_prefix('/')?.splitn(3, '/');
    Some((parts.next()?, parts.next()?, parts.next()?))
}
