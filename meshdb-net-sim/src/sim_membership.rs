//! SimMembership - per-node MembershipLayer backed by SimNetwork

use crate::SimNetwork;
use bytes::Bytes;
use meshdb_net_types::{Keyring, MembershipDelegate, MembershipError, MembershipLayer};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_PACKET_BUDGET: usize = 1400;

/// One node's view of the simulated cluster.
pub struct SimMembership {
    name: String,
    network: SimNetwork,
    gossip_interval: Duration,
    packet_budget: usize,
    started: Mutex<Option<CancellationToken>>,
}

impl SimMembership {
    pub fn new(name: impl Into<String>, network: &SimNetwork) -> Self {
        Self {
            name: name.into(),
            network: network.clone(),
            gossip_interval: DEFAULT_GOSSIP_INTERVAL,
            packet_budget: DEFAULT_PACKET_BUDGET,
            started: Mutex::new(None),
        }
    }

    /// Override the piggyback gossip cadence (tests shrink it).
    pub fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }
}

impl std::fmt::Debug for SimMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimMembership")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl MembershipLayer for SimMembership {
    async fn start(
        &self,
        delegate: Arc<dyn MembershipDelegate>,
        keyring: Arc<Keyring>,
    ) -> Result<(), MembershipError> {
        let cancel = CancellationToken::new();
        {
            let mut started = self.started.lock().unwrap_or_else(|e| e.into_inner());
            if started.is_some() {
                return Err(MembershipError::Join("already started".into()));
            }
            *started = Some(cancel.clone());
        }
        self.network.register(&self.name, delegate, keyring);

        // Piggyback gossip: periodically drain the delegate's
        // cluster-wide broadcasts to every reachable peer, the way a
        // membership library attaches them to its probe traffic.
        let network = self.network.clone();
        let name = self.name.clone();
        let interval = self.gossip_interval;
        let budget = self.packet_budget;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => network.flush_broadcasts(&name, budget),
                }
            }
        });
        Ok(())
    }

    async fn join(&self, members: &[String]) -> Result<usize, MembershipError> {
        self.ensure_started()?;
        self.network.join(&self.name, members)
    }

    async fn leave(&self, flush: Duration) -> Result<(), MembershipError> {
        self.ensure_started()?;
        // Give queued broadcasts one real tick to drain, then flush
        // the remainder synchronously on the way out.
        tokio::time::sleep(flush.min(self.gossip_interval)).await;
        self.network.leave(&self.name, self.packet_budget);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), MembershipError> {
        if let Some(cancel) = self
            .started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            cancel.cancel();
        }
        self.network.shutdown(&self.name);
        Ok(())
    }

    async fn send_best_effort(&self, node: &str, payload: Bytes) -> Result<(), MembershipError> {
        self.ensure_started()?;
        self.network.send_best_effort(&self.name, node, payload);
        Ok(())
    }

    async fn send_reliable(&self, node: &str, payload: Bytes) -> Result<(), MembershipError> {
        self.ensure_started()?;
        self.network.send_reliable(&self.name, node, payload)
    }

    fn num_members(&self) -> usize {
        self.network.num_members(&self.name)
    }
}

impl SimMembership {
    fn ensure_started(&self) -> Result<(), MembershipError> {
        if self
            .started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
        {
            Ok(())
        } else {
            Err(MembershipError::NotStarted)
        }
    }
}
