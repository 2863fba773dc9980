//! Start-and-wait for agents that are not yet running.

use std::{collections::HashSet, sync::Arc, time::Duration};

use parking_lot::Mutex;

use crate::{registry::AgentRegistry, types::AgentName};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessSettings {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    /// Pause after the agent reports running, letting its mailbox
    /// subscription settle before anything is delivered.
    pub grace: Duration,
    /// Settle time before a freshly created agent is stopped, and again
    /// between that stop and its restart.
    pub reinit_delay: Duration,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_attempts: 10,
            grace: Duration::from_millis(500),
            reinit_delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    AlreadyRunning,
    StartedAndReady { attempts: u32 },
    TimedOut { attempts: u32 },
    StartFailed { reason: String },
}

impl ReadinessOutcome {
    /// Whether held messages should still be delivered.
    pub fn should_deliver(&self) -> bool {
        !matches!(self, Self::StartFailed { .. })
    }
}

#[derive(Clone)]
pub struct ReadinessCoordinator {
    registry: Arc<dyn AgentRegistry>,
    settings: ReadinessSettings,
    reinitialized: Arc<Mutex<HashSet<AgentName>>>,
}

impl ReadinessCoordinator {
    pub fn new(registry: Arc<dyn AgentRegistry>, settings: ReadinessSettings) -> Self {
        Self {
            registry,
            settings,
            reinitialized: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn settings(&self) -> ReadinessSettings {
        self.settings
    }

    /// Makes sure `agent` is running, polling its status after asking the
    /// registry to start it. Every registry call is bounded: a status check
    /// that does not answer within one poll interval counts as "not running",
    /// and the start request gets the whole polling budget.
    pub async fn ensure_ready(&self, agent: &AgentName) -> ReadinessOutcome {
        if self.check_running(agent).await {
            tracing::debug!(target = "router::readiness", agent = %agent, "already running");
            return ReadinessOutcome::AlreadyRunning;
        }

        let start_budget = self.settings.poll_interval * self.settings.max_attempts;
        match tokio::time::timeout(start_budget, self.registry.request_start(agent)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::warn!(
                    target = "router::readiness",
                    agent = %agent,
                    error = %error,
                    "start request failed"
                );
                return ReadinessOutcome::StartFailed {
                    reason: error.to_string(),
                };
            }
            Err(_) => {
                tracing::warn!(
                    target = "router::readiness",
                    agent = %agent,
                    budget_ms = start_budget.as_millis() as u64,
                    "start request did not answer"
                );
                return ReadinessOutcome::StartFailed {
                    reason: "start request timed out".to_string(),
                };
            }
        }
        tracing::info!(target = "router::readiness", agent = %agent, "start requested, waiting for readiness");

        // Ticks stay on the poll grid even when a check eats its slot.
        let period = self.settings.poll_interval.max(Duration::from_millis(1));
        let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut attempts = 0;
        while attempts < self.settings.max_attempts {
            ticks.tick().await;
            attempts += 1;

            if self.check_running(agent).await {
                tokio::time::sleep(self.settings.grace).await;
                tracing::info!(
                    target = "router::readiness",
                    agent = %agent,
                    attempts = attempts,
                    "agent ready"
                );
                return ReadinessOutcome::StartedAndReady { attempts };
            }
        }

        tracing::warn!(
            target = "router::readiness",
            agent = %agent,
            attempts = attempts,
            "agent did not report running in time"
        );
        ReadinessOutcome::TimedOut { attempts }
    }

    async fn check_running(&self, agent: &AgentName) -> bool {
        match tokio::time::timeout(self.settings.poll_interval, self.registry.status(agent)).await {
            Ok(Ok(status)) => status.is_running(),
            Ok(Err(error)) => {
                tracing::debug!(
                    target = "router::readiness",
                    agent = %agent,
                    error = %error,
                    "status check failed, treating as stopped"
                );
                false
            }
            Err(_) => {
                tracing::debug!(
                    target = "router::readiness",
                    agent = %agent,
                    "status check timed out, treating as stopped"
                );
                false
            }
        }
    }

    /// Stops and restarts a newly created agent once so it comes up with a
    /// clean state. Runs at most once per agent for the life of the process.
    /// Call it only after anything held for the agent has been handed over;
    /// the stop is requested after `reinit_delay`, the restart one more
    /// `reinit_delay` later.
    pub fn schedule_reinit(&self, agent: &AgentName) {
        if !self.reinitialized.lock().insert(agent.clone()) {
            return;
        }

        let registry = Arc::clone(&self.registry);
        let delay = self.settings.reinit_delay;
        let agent = agent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracing::info!(target = "router::readiness", agent = %agent, "re-initializing new agent");
            if let Err(error) = registry.request_stop(&agent).await {
                tracing::warn!(target = "router::readiness", agent = %agent, error = %error, "re-init stop failed");
                return;
            }
            tokio::time::sleep(delay).await;
            if let Err(error) = registry.request_start(&agent).await {
                tracing::warn!(target = "router::readiness", agent = %agent, error = %error, "re-init start failed");
            }
        });
    }
}
