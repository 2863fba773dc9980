use std::{borrow::Borrow, fmt};

use serde::{Deserialize, Serialize};

/// Case-insensitive agent identifier. The stored form is always the
/// trimmed, lower-cased name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct AgentName(String);

impl AgentName {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Title-cased form used for chat attribution, e.g. `data_analyst` ->
    /// `Data_Analyst`.
    pub fn display_name(&self) -> String {
        let mut out = String::with_capacity(self.0.len());
        let mut at_word_start = true;
        for ch in self.0.chars() {
            if ch.is_alphabetic() {
                if at_word_start {
                    out.extend(ch.to_uppercase());
                } else {
                    out.push(ch);
                }
                at_word_start = false;
            } else {
                out.push(ch);
                at_word_start = true;
            }
        }
        out
    }
}

impl From<String> for AgentName {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for AgentName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<AgentName> for String {
    fn from(value: AgentName) -> Self {
        value.0
    }
}

impl AsRef<str> for AgentName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for AgentName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Stopped,
}

impl AgentStatus {
    /// Lifecycle services report free-form status strings; anything other
    /// than `running` counts as stopped.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("running") {
            AgentStatus::Running
        } else {
            AgentStatus::Stopped
        }
    }

    pub fn is_running(self) -> bool {
        matches!(self, AgentStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Running => "running",
            AgentStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const REPLY_TOPIC_PREFIX: &str = "user_session:";

/// Identifies one chat session; taken from the connection path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Topic agents publish their replies to for this session.
    pub fn reply_topic(&self) -> String {
        format!("{REPLY_TOPIC_PREFIX}{}", self.0)
    }

    pub fn from_reply_topic(topic: &str) -> Option<Self> {
        topic
            .trim()
            .strip_prefix(REPLY_TOPIC_PREFIX)
            .filter(|key| !key.is_empty())
            .map(Self::new)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::{AgentName, AgentStatus, SessionKey};

    #[test]
    fn agent_names_are_canonical_lowercase() {
        assert_eq!(AgentName::new("  Bob "), AgentName::new("bob"));
        assert_eq!(AgentName::new("DataAnalyst").as_str(), "dataanalyst");
    }

    #[test]
    fn agent_name_deserializes_to_canonical_form() {
        let name: AgentName = serde_json::from_str("\"Translator\"").unwrap();
        assert_eq!(name.as_str(), "translator");
        assert_eq!(serde_json::to_string(&name).unwrap(), "\"translator\"");
    }

    #[test]
    fn display_name_title_cases_each_word() {
        assert_eq!(AgentName::new("bob").display_name(), "Bob");
        assert_eq!(AgentName::new("data_analyst").display_name(), "Data_Analyst");
        assert_eq!(AgentName::new("agent2go").display_name(), "Agent2Go");
    }

    #[test]
    fn unknown_status_strings_count_as_stopped() {
        assert_eq!(AgentStatus::parse("RUNNING"), AgentStatus::Running);
        assert_eq!(AgentStatus::parse("failed"), AgentStatus::Stopped);
        assert_eq!(AgentStatus::parse(""), AgentStatus::Stopped);
    }

    #[test]
    fn reply_topic_round_trips() {
        let key = SessionKey::new("main");
        assert_eq!(key.reply_topic(), "user_session:main");
        assert_eq!(SessionKey::from_reply_topic("user_session:main"), Some(key));
        assert_eq!(SessionKey::from_reply_topic("user_session:"), None);
        assert_eq!(SessionKey::from_reply_topic("agent:bob:inbox"), None);
    }
}
