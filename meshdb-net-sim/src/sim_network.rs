//! SimNetwork - shared broker routing bytes between sim members

use bytes::Bytes;
use meshdb_net_types::{Keyring, MemberInfo, MembershipDelegate, MembershipError};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard};

struct Member {
    info: MemberInfo,
    delegate: Arc<dyn MembershipDelegate>,
    keyring: Arc<Keyring>,
    /// Names of cluster members this node can currently see.
    peers: HashSet<String>,
    alive: bool,
}

#[derive(Default)]
struct Inner {
    members: HashMap<String, Member>,
    /// Unordered name pairs with delivery blocked (partition model).
    blocked: HashSet<(String, String)>,
    next_port: u16,
}

fn pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_owned(), b.to_owned())
    } else {
        (b.to_owned(), a.to_owned())
    }
}

/// Shared in-memory cluster. Clone handles freely; all state lives
/// behind one mutex.
#[derive(Clone, Default)]
pub struct SimNetwork {
    inner: Arc<Mutex<Inner>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ==================== Test hooks ====================

    /// Block delivery between the two groups in both directions.
    pub fn partition(&self, left: &[&str], right: &[&str]) {
        let mut inner = self.lock();
        for l in left {
            for r in right {
                inner.blocked.insert(pair(l, r));
            }
        }
    }

    /// Remove every partition.
    pub fn heal(&self) {
        self.lock().blocked.clear();
    }

    /// Simulate a probe failure: the node goes dark and every peer is
    /// notified, but cluster membership is retained for recovery.
    pub fn fail_node(&self, name: &str) {
        let notify = {
            let mut inner = self.lock();
            let Some(member) = inner.members.get_mut(name) else {
                return;
            };
            member.alive = false;
            let info = member.info.clone();
            let peers = member.peers.clone();
            peers
                .iter()
                .filter_map(|p| inner.members.get(p))
                .filter(|p| p.alive)
                .map(|p| (p.delegate.clone(), info.clone()))
                .collect::<Vec<_>>()
        };
        for (delegate, info) in notify {
            delegate.notify_leave(&info);
        }
    }

    /// Bring a failed node back; peers observe it as a fresh join,
    /// the way a heartbeat recovery is surfaced.
    pub fn recover_node(&self, name: &str) {
        let notify = {
            let mut inner = self.lock();
            let Some(member) = inner.members.get_mut(name) else {
                return;
            };
            member.alive = true;
            let info = member.info.clone();
            let my_delegate = member.delegate.clone();
            let peers = member.peers.clone();
            peers
                .iter()
                .filter_map(|p| inner.members.get(p))
                .filter(|p| p.alive)
                .map(|p| {
                    (
                        p.delegate.clone(),
                        p.info.clone(),
                        my_delegate.clone(),
                        info.clone(),
                    )
                })
                .collect::<Vec<_>>()
        };
        for (peer_delegate, peer_info, my_delegate, my_info) in notify {
            peer_delegate.notify_join(&my_info);
            my_delegate.notify_join(&peer_info);
        }
    }

    // ==================== Membership backend ====================

    pub(crate) fn register(
        &self,
        name: &str,
        delegate: Arc<dyn MembershipDelegate>,
        keyring: Arc<Keyring>,
    ) -> MemberInfo {
        let (info, self_delegate) = {
            let mut inner = self.lock();
            inner.next_port += 1;
            let info = MemberInfo {
                name: name.to_owned(),
                addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 7000 + inner.next_port,
            };
            inner.members.insert(
                name.to_owned(),
                Member {
                    info: info.clone(),
                    delegate: delegate.clone(),
                    keyring,
                    peers: HashSet::new(),
                    alive: true,
                },
            );
            (info, delegate)
        };
        // A node is a member of its own cluster from the start
        self_delegate.notify_join(&info);
        info
    }

    /// Resolve an address (member name or `ip:port`) to a member name.
    fn resolve(inner: &Inner, addr: &str) -> Option<String> {
        if inner.members.contains_key(addr) {
            return Some(addr.to_owned());
        }
        inner
            .members
            .values()
            .find(|m| format!("{}:{}", m.info.addr, m.info.port) == addr)
            .map(|m| m.info.name.clone())
    }

    /// Merge the joiner's cluster with the target's: every pair of
    /// nodes across the two groups learns about each other, and the
    /// joiner exchanges push-pull state with the target.
    pub(crate) fn join(&self, name: &str, targets: &[String]) -> Result<usize, MembershipError> {
        let (join_callbacks, push_pull) = {
            let mut inner = self.lock();
            let Some(target) = targets.iter().find_map(|t| {
                Self::resolve(&inner, t)
                    .filter(|t| t != name)
                    .filter(|t| !inner.blocked.contains(&pair(name, t)))
                    .filter(|t| inner.members.get(t).map(|m| m.alive).unwrap_or(false))
            }) else {
                return Err(MembershipError::Join(format!(
                    "no reachable member among {targets:?}"
                )));
            };

            if !inner.members.get(name).map(|m| m.alive).unwrap_or(false) {
                return Err(MembershipError::NotStarted);
            }

            let mut group_a: HashSet<String> = inner.members[name].peers.clone();
            group_a.insert(name.to_owned());
            let mut group_b: HashSet<String> = inner.members[&target].peers.clone();
            group_b.insert(target.clone());

            let mut callbacks = Vec::new();
            for a in &group_a {
                for b in &group_b {
                    if a == b {
                        continue;
                    }
                    let (Some(info_a), Some(info_b)) = (
                        inner.members.get(a).map(|m| m.info.clone()),
                        inner.members.get(b).map(|m| m.info.clone()),
                    ) else {
                        continue;
                    };
                    if let Some(ma) = inner.members.get_mut(a) {
                        if ma.peers.insert(b.clone()) {
                            callbacks.push((ma.delegate.clone(), info_b));
                        }
                    }
                    if let Some(mb) = inner.members.get_mut(b) {
                        if mb.peers.insert(a.clone()) {
                            callbacks.push((mb.delegate.clone(), info_a));
                        }
                    }
                }
            }

            let joiner = &inner.members[name];
            let target_member = &inner.members[&target];
            let push_pull = (
                joiner.delegate.clone(),
                target_member.delegate.clone(),
            );
            (callbacks, push_pull)
        };

        for (delegate, info) in &join_callbacks {
            delegate.notify_join(info);
        }

        // Push-pull state exchange between joiner and target, both
        // directions, outside the broker lock.
        let (joiner, target) = push_pull;
        let joiner_state = joiner.local_state(true);
        let target_state = target.local_state(true);
        target.merge_remote_state(&joiner_state, true);
        joiner.merge_remote_state(&target_state, true);

        Ok(1)
    }

    /// Graceful leave: flush pending piggyback broadcasts to every
    /// reachable peer, then detach from the cluster.
    pub(crate) fn leave(&self, name: &str, packet_budget: usize) {
        self.flush_broadcasts(name, packet_budget);

        let notify = {
            let mut inner = self.lock();
            let Some(member) = inner.members.get_mut(name) else {
                return;
            };
            let info = member.info.clone();
            let peers: Vec<String> = member.peers.drain().collect();
            let mut notify = Vec::new();
            for peer in peers {
                if let Some(p) = inner.members.get_mut(&peer) {
                    p.peers.remove(name);
                    if p.alive {
                        notify.push((p.delegate.clone(), info.clone()));
                    }
                }
            }
            notify
        };
        for (delegate, info) in notify {
            delegate.notify_leave(&info);
        }
    }

    pub(crate) fn shutdown(&self, name: &str) {
        if let Some(member) = self.lock().members.get_mut(name) {
            member.alive = false;
        }
    }

    pub(crate) fn num_members(&self, name: &str) -> usize {
        self.lock()
            .members
            .get(name)
            .map(|m| m.peers.len() + 1)
            .unwrap_or(0)
    }

    // ==================== Delivery ====================

    fn key_compatible(sender: &Member, receiver: &Member) -> bool {
        match sender.keyring.primary_key() {
            None => receiver.keyring.is_empty(),
            Some(key) => receiver.keyring.accepts(&key),
        }
    }

    /// Deliverability check shared by both channels. `None` means the
    /// message must be dropped; the error string says why.
    fn check_deliverable(inner: &Inner, from: &str, to: &str) -> Result<(), String> {
        let Some(sender) = inner.members.get(from) else {
            return Err("sender not registered".into());
        };
        let Some(receiver) = inner.members.get(to) else {
            return Err("receiver not registered".into());
        };
        if !sender.alive || !receiver.alive {
            return Err("node down".into());
        }
        if !sender.peers.contains(to) {
            return Err("not in cluster".into());
        }
        if inner.blocked.contains(&pair(from, to)) {
            return Err("partitioned".into());
        }
        if !Self::key_compatible(sender, receiver) {
            return Err("no shared encryption key".into());
        }
        Ok(())
    }

    /// Best-effort datagram: undeliverable messages vanish silently,
    /// like UDP across a partition.
    pub(crate) fn send_best_effort(&self, from: &str, to: &str, payload: Bytes) {
        let delegate = {
            let inner = self.lock();
            match Self::check_deliverable(&inner, from, to) {
                Ok(()) => inner.members.get(to).map(|m| m.delegate.clone()),
                Err(reason) => {
                    tracing::trace!(from, to, reason, "Dropping datagram");
                    None
                }
            }
        };
        if let Some(delegate) = delegate {
            tokio::spawn(async move { delegate.notify_msg(&payload) });
        }
    }

    /// Reliable delivery: undeliverable messages surface an error.
    pub(crate) fn send_reliable(
        &self,
        from: &str,
        to: &str,
        payload: Bytes,
    ) -> Result<(), MembershipError> {
        let delegate = {
            let inner = self.lock();
            Self::check_deliverable(&inner, from, to)
                .map_err(|reason| MembershipError::Send(to.to_owned(), reason))?;
            inner
                .members
                .get(to)
                .map(|m| m.delegate.clone())
                .ok_or_else(|| MembershipError::UnknownMember(to.to_owned()))?
        };
        tokio::spawn(async move { delegate.notify_msg(&payload) });
        Ok(())
    }

    /// Drain a member's piggyback broadcasts into one compound and
    /// fan it out to every reachable peer.
    pub(crate) fn flush_broadcasts(&self, name: &str, packet_budget: usize) {
        use meshdb_model::{make_compound, COMPOUND_HEADER_OVERHEAD, COMPOUND_OVERHEAD};

        let (delegate, peers) = {
            let inner = self.lock();
            let Some(member) = inner.members.get(name) else {
                return;
            };
            if !member.alive {
                return;
            }
            (
                member.delegate.clone(),
                member.peers.iter().cloned().collect::<Vec<_>>(),
            )
        };
        if peers.is_empty() {
            // Don't burn transmit credits while alone in the cluster
            return;
        }

        let msgs = delegate.get_broadcasts(
            COMPOUND_OVERHEAD,
            packet_budget.saturating_sub(COMPOUND_HEADER_OVERHEAD),
        );
        if msgs.is_empty() {
            return;
        }
        let compound = make_compound(&msgs);
        for peer in peers {
            self.send_best_effort(name, &peer, compound.clone());
        }
    }
}
