//! Substrate abstraction for meshdb networking
//!
//! The database never talks to a socket directly: it drives a
//! [`MembershipLayer`] (cluster membership, best-effort and reliable
//! delivery) and receives callbacks through [`MembershipDelegate`].
//! Production wires in a real gossip/membership library; the
//! simulation harness in `meshdb-net-sim` provides an in-memory one.

pub mod keyring;
pub mod membership;

pub use keyring::{Keyring, KeyringError};
pub use membership::{MemberInfo, MembershipDelegate, MembershipError, MembershipLayer};
