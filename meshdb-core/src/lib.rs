//! meshdb-core - gossip-backed eventually-consistent network database
//!
//! Each node holds a replica of small key/value entries grouped by
//! network. Local writes stamp a Lamport time and fan out over
//! best-effort gossip; periodic bulk syncs reconcile full network
//! state over the reliable channel; deletions leave tombstones that
//! are garbage-collected after a bounded residual interval.
//!
//! The database is bound to a [`meshdb_net_types::MembershipLayer`]
//! at construction and implements the substrate's delegate callbacks
//! itself.

mod broadcast;
mod cluster;
mod config;
mod db;
mod entry;
mod error;
mod handlers;
mod sync;
mod watch;

pub use config::Config;
pub use db::NetworkDb;
pub use error::{ClusterError, StoreError};
pub use watch::{WatchEvent, WatchEventKind};

pub use meshdb_model::{NetworkId, NodeId};
pub use meshdb_net_types::KeyringError;

#[cfg(test)]
pub(crate) mod test_support {
    use bytes::Bytes;
    use meshdb_net_types::{
        Keyring, MemberInfo, MembershipDelegate, MembershipError, MembershipLayer,
    };
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;

    /// Substrate stub for unit tests: accepts everything, sends
    /// nothing, reports a single member.
    #[derive(Debug, Default)]
    pub struct NullMembership;

    #[async_trait::async_trait]
    impl MembershipLayer for NullMembership {
        async fn start(
            &self,
            delegate: Arc<dyn MembershipDelegate>,
            _keyring: Arc<Keyring>,
        ) -> Result<(), MembershipError> {
            let _ = delegate;
            Ok(())
        }

        async fn join(&self, _members: &[String]) -> Result<usize, MembershipError> {
            Ok(0)
        }

        async fn leave(&self, _flush: Duration) -> Result<(), MembershipError> {
            Ok(())
        }

        async fn shutdown(&self) -> Result<(), MembershipError> {
            Ok(())
        }

        async fn send_best_effort(
            &self,
            _node: &str,
            _payload: Bytes,
        ) -> Result<(), MembershipError> {
            Ok(())
        }

        async fn send_reliable(&self, _node: &str, _payload: Bytes) -> Result<(), MembershipError> {
            Ok(())
        }

        fn num_members(&self) -> usize {
            1
        }
    }

    pub fn member(name: &str) -> MemberInfo {
        MemberInfo {
            name: name.to_owned(),
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 7946,
        }
    }
}
