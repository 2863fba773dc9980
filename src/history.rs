//! Per-session, per-agent conversation history kept in memory.
//!
//! Each agent sees only its own thread with the user. Threads are capped;
//! the oldest entries fall off first.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{AgentName, SessionKey};

pub const DEFAULT_HISTORY_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

impl HistoryEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

type Threads = HashMap<AgentName, VecDeque<HistoryEntry>>;

#[derive(Clone)]
pub struct HistoryStore {
    sessions: Arc<Mutex<HashMap<SessionKey, Threads>>>,
    limit: usize,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl HistoryStore {
    pub fn new(limit: usize) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            limit: limit.max(1),
        }
    }

    /// Appends to the agent's thread and returns the whole thread, oldest
    /// first, as it should be sent to the agent.
    pub fn append(
        &self,
        session: &SessionKey,
        agent: &AgentName,
        entry: HistoryEntry,
    ) -> Vec<HistoryEntry> {
        let mut sessions = self.sessions.lock();
        let thread = sessions
            .entry(session.clone())
            .or_default()
            .entry(agent.clone())
            .or_default();
        if thread.len() >= self.limit {
            thread.pop_front();
        }
        thread.push_back(entry);
        thread.iter().cloned().collect()
    }

    pub fn thread(&self, session: &SessionKey, agent: &AgentName) -> Vec<HistoryEntry> {
        self.sessions
            .lock()
            .get(session)
            .and_then(|threads| threads.get(agent))
            .map(|thread| thread.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All threads of a session, sorted by agent name.
    pub fn snapshot(&self, session: &SessionKey) -> BTreeMap<AgentName, Vec<HistoryEntry>> {
        self.sessions
            .lock()
            .get(session)
            .map(|threads| {
                threads
                    .iter()
                    .map(|(agent, thread)| (agent.clone(), thread.iter().cloned().collect()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_session(&self, session: &SessionKey) -> bool {
        self.sessions.lock().contains_key(session)
    }

    /// Drops every thread of the session. Returns the number of entries
    /// removed.
    pub fn clear(&self, session: &SessionKey) -> usize {
        self.sessions
            .lock()
            .remove(session)
            .map(|threads| threads.values().map(VecDeque::len).sum())
            .unwrap_or(0)
    }
}
