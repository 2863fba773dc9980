//! Debounced "agent is typing" indicators.
//!
//! Timers run as spawned tasks that post a [`TypingTimer`] back into the
//! owning session's event loop; the scheduler itself is only touched from
//! that loop. Every entry owns the abort handle of its single live timer, so
//! replacing, resolving or dropping an entry cancels the timer with it.

use std::{collections::HashMap, time::Duration};

use tokio::{sync::mpsc, task::AbortHandle};

use crate::types::AgentName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingSettings {
    /// Delay before an indicator becomes visible.
    pub debounce: Duration,
    /// Visible indicators with no reply are cleared after this long.
    pub timeout: Duration,
}

impl Default for TypingSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            timeout: Duration::from_secs(60),
        }
    }
}

/// A fired timer, tagged with the generation of the entry that armed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypingTimer {
    Debounce { agent: AgentName, generation: u64 },
    Timeout { agent: AgentName, generation: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypingSignal {
    Started(AgentName),
    Stopped(AgentName),
}

#[derive(Debug)]
struct TypingEntry {
    generation: u64,
    visible: bool,
    timer: AbortHandle,
}

#[derive(Debug)]
pub struct TypingScheduler {
    settings: TypingSettings,
    entries: HashMap<AgentName, TypingEntry>,
    next_generation: u64,
    timer_tx: mpsc::Sender<TypingTimer>,
}

impl TypingScheduler {
    pub fn new(settings: TypingSettings, timer_tx: mpsc::Sender<TypingTimer>) -> Self {
        Self {
            settings,
            entries: HashMap::new(),
            next_generation: 0,
            timer_tx,
        }
    }

    pub fn is_visible(&self, agent: &AgentName) -> bool {
        self.entries.get(agent).is_some_and(|entry| entry.visible)
    }

    pub fn is_pending(&self, agent: &AgentName) -> bool {
        self.entries.get(agent).is_some_and(|entry| !entry.visible)
    }

    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    /// Arms a debounce timer for each target, replacing any timer already
    /// armed for it. A target whose indicator is already showing keeps it
    /// and only has its timeout pushed back.
    pub fn on_outbound_send(&mut self, targets: &[AgentName]) {
        for agent in targets {
            let visible = self.is_visible(agent);
            if let Some(previous) = self.entries.remove(agent) {
                previous.timer.abort();
            }

            let generation = self.bump();
            let timer = if visible {
                self.arm(
                    TypingTimer::Timeout {
                        agent: agent.clone(),
                        generation,
                    },
                    self.settings.timeout,
                )
            } else {
                self.arm(
                    TypingTimer::Debounce {
                        agent: agent.clone(),
                        generation,
                    },
                    self.settings.debounce,
                )
            };

            tracing::trace!(target = "router::typing", agent = %agent, generation, visible, "armed typing timer");
            self.entries.insert(
                agent.clone(),
                TypingEntry {
                    generation,
                    visible,
                    timer,
                },
            );
        }
    }

    /// Handles a fired timer. Stale timers (from a replaced or resolved
    /// entry) are ignored.
    pub fn on_timer(&mut self, fired: TypingTimer) -> Option<TypingSignal> {
        match fired {
            TypingTimer::Debounce { agent, generation } => {
                let entry = self.entries.get(&agent)?;
                if entry.generation != generation || entry.visible {
                    return None;
                }

                let generation = self.bump();
                let timer = self.arm(
                    TypingTimer::Timeout {
                        agent: agent.clone(),
                        generation,
                    },
                    self.settings.timeout,
                );
                self.entries.insert(
                    agent.clone(),
                    TypingEntry {
                        generation,
                        visible: true,
                        timer,
                    },
                );
                Some(TypingSignal::Started(agent))
            }
            TypingTimer::Timeout { agent, generation } => {
                let entry = self.entries.get(&agent)?;
                if entry.generation != generation {
                    return None;
                }
                self.entries.remove(&agent);
                tracing::debug!(target = "router::typing", agent = %agent, "typing indicator timed out");
                Some(TypingSignal::Stopped(agent))
            }
        }
    }

    /// A message from `agent` arrived: cancel its pending timer, or hide the
    /// indicator if it is already showing.
    pub fn on_inbound_message(&mut self, agent: &AgentName) -> Option<TypingSignal> {
        let entry = self.entries.remove(agent)?;
        entry.timer.abort();
        entry.visible.then(|| TypingSignal::Stopped(agent.clone()))
    }

    /// Same as an inbound message; used when delivery to `agent` failed.
    pub fn clear(&mut self, agent: &AgentName) -> Option<TypingSignal> {
        self.on_inbound_message(agent)
    }

    pub fn cancel_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.timer.abort();
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn arm(&self, fired: TypingTimer, delay: Duration) -> AbortHandle {
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(fired).await;
        })
        .abort_handle()
    }
}

impl Drop for TypingScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
