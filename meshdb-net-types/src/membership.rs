//! Membership layer abstraction
//!
//! Pure transport-level seam: cluster join/leave, best-effort UDP-style
//! fan-out and reliable point-to-point delivery. Encoding/decoding and
//! convergence rules live in `meshdb-core`.

use crate::Keyring;
use bytes::Bytes;
use meshdb_model::NodeId;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Error type for membership operations.
#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("cluster join failed: {0}")]
    Join(String),
    #[error("send to {0} failed: {1}")]
    Send(String, String),
    #[error("unknown member: {0}")]
    UnknownMember(String),
    #[error("membership layer not started")]
    NotStarted,
    #[error("shutdown failed: {0}")]
    Shutdown(String),
}

/// Identity and address of a cluster member as reported by the
/// membership layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberInfo {
    pub name: NodeId,
    pub addr: IpAddr,
    pub port: u16,
}

/// Callbacks the membership layer invokes on the database.
///
/// The database implements this trait; the natural back-reference
/// between the two is broken by handing the substrate an
/// `Arc<dyn MembershipDelegate>` whose lifetime is tied to the
/// database handle.
pub trait MembershipDelegate: Send + Sync + 'static {
    /// A user-level payload arrived (gossip packet or reliable stream).
    fn notify_msg(&self, payload: &[u8]);

    /// Up to `limit` bytes of pending cluster-wide broadcasts to
    /// piggyback on the substrate's own gossip, `overhead` bytes of
    /// framing charged per message.
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Bytes>;

    /// Encode local node/network metadata for a push-pull exchange.
    fn local_state(&self, join: bool) -> Bytes;

    /// Merge a remote peer's push-pull metadata.
    fn merge_remote_state(&self, buf: &[u8], join: bool);

    /// A member became reachable (initial join or probe recovery).
    fn notify_join(&self, member: &MemberInfo);

    /// A member became unreachable (probe failure or shutdown).
    fn notify_leave(&self, member: &MemberInfo);
}

/// Transport-level membership interface.
///
/// Implementations own the gossip/membership library lifecycle and
/// deal only in raw bytes and member names; this is the primary seam
/// for swapping a real substrate with in-memory channels.
#[async_trait::async_trait]
pub trait MembershipLayer: Send + Sync + 'static {
    /// Wire in the delegate and keyring and start background delivery.
    /// Must be called exactly once, before any other method.
    async fn start(
        &self,
        delegate: Arc<dyn MembershipDelegate>,
        keyring: Arc<Keyring>,
    ) -> Result<(), MembershipError>;

    /// Join an existing cluster through any of the given addresses.
    /// Returns the number of members successfully contacted.
    async fn join(&self, members: &[String]) -> Result<usize, MembershipError>;

    /// Announce a graceful leave and wait up to `flush` for pending
    /// broadcasts to drain.
    async fn leave(&self, flush: Duration) -> Result<(), MembershipError>;

    /// Tear down the membership layer.
    async fn shutdown(&self) -> Result<(), MembershipError>;

    /// Fire-and-forget datagram to a member. Failures are logged by
    /// callers, never surfaced to the write path.
    async fn send_best_effort(&self, node: &str, payload: Bytes) -> Result<(), MembershipError>;

    /// Reliable delivery to a member (bulk sync path).
    async fn send_reliable(&self, node: &str, payload: Bytes) -> Result<(), MembershipError>;

    /// Current cluster size estimate, used to scale retransmit limits.
    fn num_members(&self) -> usize;
}
