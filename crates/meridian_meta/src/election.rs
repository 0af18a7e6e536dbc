//! Leader election contract and the in-process implementation.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::{MetaError, Result};

/// Current leadership as observed by one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadershipState {
    /// Member name of the current leader, if any.
    pub leader: Option<String>,
    /// Monotonic term; increments on every leadership change. Late writes
    /// from a resigned leader carry a stale term and can be fenced with it.
    pub term: u64,
}

/// Contract for the external election service (etcd campaign/lease in
/// production).
#[async_trait]
pub trait Election: Send + Sync {
    /// Attempt to become leader. Resolves once the campaign concludes;
    /// returns the term granted when this member won.
    async fn campaign(&self, lease_ttl: Duration) -> Result<u64>;

    /// Whether this member currently holds leadership.
    fn is_leader(&self) -> bool;

    /// Term of the most recent leadership this member won (0 = never led).
    fn term(&self) -> u64;

    /// Watch leadership changes.
    fn subscribe(&self) -> watch::Receiver<LeadershipState>;

    /// Give up leadership voluntarily.
    async fn resign(&self) -> Result<()>;

    /// Ask the election service to move leadership to `target`.
    async fn transfer(&self, target: &str) -> Result<()>;
}

/// In-process election: a single participant wins immediately.
///
/// Tests drive leadership churn through `resign` + `campaign`; the term
/// counter makes each new leadership distinguishable, which the TSO
/// allocator relies on.
pub struct MemElection {
    name: String,
    state: RwLock<LeadershipState>,
    tx: watch::Sender<LeadershipState>,
}

impl MemElection {
    pub fn new(name: impl Into<String>) -> Self {
        let initial = LeadershipState {
            leader: None,
            term: 0,
        };
        let (tx, _) = watch::channel(initial.clone());
        Self {
            name: name.into(),
            state: RwLock::new(initial),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, state: LeadershipState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state.clone();
        let _ = self.tx.send(state);
    }
}

#[async_trait]
impl Election for MemElection {
    async fn campaign(&self, _lease_ttl: Duration) -> Result<u64> {
        let next = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if state.leader.as_deref() == Some(self.name.as_str()) {
                return Ok(state.term);
            }
            state.term + 1
        };
        self.publish(LeadershipState {
            leader: Some(self.name.clone()),
            term: next,
        });
        Ok(next)
    }

    fn is_leader(&self) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.leader.as_deref() == Some(self.name.as_str())
    }

    fn term(&self) -> u64 {
        self.state.read().unwrap_or_else(|e| e.into_inner()).term
    }

    fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.tx.subscribe()
    }

    async fn resign(&self) -> Result<()> {
        let term = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if state.leader.as_deref() != Some(self.name.as_str()) {
                return Err(MetaError::LeaderNotFound);
            }
            state.term
        };
        self.publish(LeadershipState { leader: None, term });
        Ok(())
    }

    async fn transfer(&self, target: &str) -> Result<()> {
        if target == self.name {
            return Ok(());
        }
        let next = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if state.leader.as_deref() != Some(self.name.as_str()) {
                return Err(MetaError::MoveLeaderFailed(
                    "not the current leader".to_string(),
                ));
            }
            state.term + 1
        };
        self.publish(LeadershipState {
            leader: Some(target.to_string()),
            term: next,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn campaign_resign_recampaign_bumps_term() {
        let election = MemElection::new("pd-1");
        assert!(!election.is_leader());

        let term1 = election.campaign(Duration::from_secs(3)).await.unwrap();
        assert!(election.is_leader());
        // Re-campaigning while leading keeps the term.
        assert_eq!(
            election.campaign(Duration::from_secs(3)).await.unwrap(),
            term1
        );

        election.resign().await.unwrap();
        assert!(!election.is_leader());

        let term2 = election.campaign(Duration::from_secs(3)).await.unwrap();
        assert!(term2 > term1);
    }

    #[tokio::test]
    async fn transfer_moves_leadership_away() {
        let election = MemElection::new("pd-1");
        election.campaign(Duration::from_secs(3)).await.unwrap();
        election.transfer("pd-2").await.unwrap();
        assert!(!election.is_leader());
        let state = election.subscribe().borrow().clone();
        assert_eq!(state.leader.as_deref(), Some("pd-2"));
    }
}
