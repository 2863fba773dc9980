//! Per-session conversation lock.
//!
//! The lock only moves in response to a decision computed for a user-authored
//! line, or an explicit unlock. State is published on a `watch` channel so
//! other components can follow it without polling.

use tokio::sync::watch;

use crate::{routing::RoutingDecision, types::AgentName};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockTransition {
    Locked(AgentName),
    Unlocked,
}

/// Lock state after `decision`.
pub fn next_state(current: Option<&AgentName>, decision: &RoutingDecision) -> Option<AgentName> {
    match decision {
        RoutingDecision::ParallelBroadcast { .. } => None,
        RoutingDecision::SingleLock { target } => Some(target.clone()),
        RoutingDecision::Delegation { .. } | RoutingDecision::DefaultRoute { .. } => {
            current.cloned()
        }
    }
}

#[derive(Debug)]
pub struct LockStateTracker {
    tx: watch::Sender<Option<AgentName>>,
}

impl Default for LockStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LockStateTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn current(&self) -> Option<AgentName> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<AgentName>> {
        self.tx.subscribe()
    }

    /// Applies the decision for an outbound line. Returns the transition when
    /// the state actually changed.
    pub fn apply(&self, decision: &RoutingDecision) -> Option<LockTransition> {
        let next = next_state(self.current().as_ref(), decision);
        self.set(next)
    }

    /// Manual override.
    pub fn unlock(&self) -> Option<LockTransition> {
        self.set(None)
    }

    fn set(&self, next: Option<AgentName>) -> Option<LockTransition> {
        let changed = self.tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next.clone();
            true
        });
        if !changed {
            return None;
        }

        tracing::debug!(target = "router::dispatch", lock = ?next, "lock state changed");
        Some(match next {
            Some(agent) => LockTransition::Locked(agent),
            None => LockTransition::Unlocked,
        })
    }
}
