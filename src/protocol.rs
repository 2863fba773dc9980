//! Wire types for the chat socket and the agent mailbox, plus recognition
//! of sentinels and control lines.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    history::HistoryEntry,
    types::{AgentName, AgentStatus},
};

/// Published on a session's reply topic once the primary is up.
pub const READY_SENTINEL: &str = "[ASSISTANT_READY]";
/// Sent by an agent when it has finished streaming a reply.
pub const END_OF_STREAM: &str = "[END_OF_STREAM]";
pub const SYSTEM_PREFIX: &str = "[SYSTEM]";

/// Router-to-client frames on the chat socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<AgentName>,
        text: String,
    },
    AgentTyping {
        agent: AgentName,
    },
    AgentStoppedTyping {
        agent: AgentName,
    },
    AgentStatus {
        agent: AgentName,
        status: AgentStatus,
    },
    ConversationLocked {
        agent: AgentName,
    },
    ConversationUnlocked,
    Notice {
        text: String,
    },
    Warning {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<AgentName>,
        text: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<AgentName>,
        text: String,
    },
}

impl SessionEvent {
    /// A chat line attributed to `sender`. Lines from the primary are shown
    /// unprefixed; everyone else gets a `[Name]: ` prefix.
    pub fn chat(sender: &AgentName, content: &str, primary: &AgentName) -> Self {
        let text = if sender == primary {
            content.to_string()
        } else {
            format!("[{}]: {}", sender.display_name(), content)
        };
        SessionEvent::Message {
            sender: Some(sender.clone()),
            text,
        }
    }

    pub fn warning(agent: Option<&AgentName>, text: impl Into<String>) -> Self {
        SessionEvent::Warning {
            agent: agent.cloned(),
            text: text.into(),
        }
    }

    pub fn error(agent: Option<&AgentName>, text: impl Into<String>) -> Self {
        SessionEvent::Error {
            agent: agent.cloned(),
            text: text.into(),
        }
    }

    pub fn notice(text: impl Into<String>) -> Self {
        SessionEvent::Notice { text: text.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Message { .. } => "message",
            SessionEvent::AgentTyping { .. } => "agent_typing",
            SessionEvent::AgentStoppedTyping { .. } => "agent_stopped_typing",
            SessionEvent::AgentStatus { .. } => "agent_status",
            SessionEvent::ConversationLocked { .. } => "conversation_locked",
            SessionEvent::ConversationUnlocked => "conversation_unlocked",
            SessionEvent::Notice { .. } => "notice",
            SessionEvent::Warning { .. } => "warning",
            SessionEvent::Error { .. } => "error",
        }
    }
}

/// Router-to-agent frame: the agent's whole thread for the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxDelivery {
    pub agent: AgentName,
    pub reply_to: String,
    pub messages: Vec<HistoryEntry>,
    pub delivery_id: String,
}

impl MailboxDelivery {
    pub fn new(agent: AgentName, reply_to: String, messages: Vec<HistoryEntry>) -> Self {
        Self {
            agent,
            reply_to,
            messages,
            delivery_id: format!("del_{}", uuid::Uuid::new_v4().simple()),
        }
    }
}

/// Agent-to-router reply frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEnvelope {
    #[serde(default)]
    pub sender: Option<AgentName>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentReply {
    /// The primary announced it is ready.
    Ready,
    Envelope { from: AgentName, content: String },
    /// Anything that is not an envelope; shown verbatim.
    Raw(String),
}

/// Decodes one payload from a session's reply topic. Envelopes without a
/// sender are attributed to the primary.
pub fn parse_reply(raw: &str, primary: &AgentName) -> AgentReply {
    if raw.trim() == READY_SENTINEL {
        return AgentReply::Ready;
    }
    match serde_json::from_str::<AgentEnvelope>(raw) {
        Ok(envelope) => AgentReply::Envelope {
            from: envelope
                .sender
                .filter(|sender| !sender.is_empty())
                .unwrap_or_else(|| primary.clone()),
            content: envelope.content,
        },
        Err(_) => AgentReply::Raw(raw.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentKind<'a> {
    EndOfStream,
    SystemNotice(&'a str),
    Chat(&'a str),
}

pub fn classify(content: &str) -> ContentKind<'_> {
    let trimmed = content.trim();
    if trimmed == END_OF_STREAM {
        return ContentKind::EndOfStream;
    }
    if let Some(rest) = trimmed.strip_prefix(SYSTEM_PREFIX) {
        return ContentKind::SystemNotice(rest.trim());
    }
    ContentKind::Chat(content)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Start,
    Stop,
    Restart,
}

impl LifecycleAction {
    pub fn verb(self) -> &'static str {
        match self {
            LifecycleAction::Start => "Starting",
            LifecycleAction::Stop => "Stopping",
            LifecycleAction::Restart => "Restarting",
        }
    }
}

/// User lines handled by the router itself instead of being routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    Clear,
    Unlock,
    Lifecycle {
        action: LifecycleAction,
        /// Free-form name as typed, or `all`.
        target: String,
    },
}

static LIFECYCLE_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^/(start|stop|restart)\s+@?([\w-]+)$").expect("valid regex")
});

impl ControlLine {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.eq_ignore_ascii_case("/clear") {
            return Some(ControlLine::Clear);
        }
        if line.eq_ignore_ascii_case("/unlock") {
            return Some(ControlLine::Unlock);
        }

        let caps = LIFECYCLE_COMMAND.captures(line)?;
        let action = match caps[1].to_ascii_lowercase().as_str() {
            "start" => LifecycleAction::Start,
            "stop" => LifecycleAction::Stop,
            _ => LifecycleAction::Restart,
        };
        Some(ControlLine::Lifecycle {
            action,
            target: caps[2].to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        classify, parse_reply, AgentReply, ContentKind, ControlLine, LifecycleAction,
        MailboxDelivery, SessionEvent,
    };
    use crate::{
        history::HistoryEntry,
        types::{AgentName, AgentStatus},
    };

    fn primary() -> AgentName {
        AgentName::new("assistant")
    }

    #[test]
    fn session_events_are_tagged_by_kind() {
        let value = serde_json::to_value(SessionEvent::AgentStatus {
            agent: AgentName::new("bob"),
            status: AgentStatus::Running,
        })
        .expect("serialize");
        assert_eq!(
            value,
            json!({"kind": "agent_status", "agent": "bob", "status": "running"})
        );

        let value = serde_json::to_value(SessionEvent::ConversationUnlocked).expect("serialize");
        assert_eq!(value, json!({"kind": "conversation_unlocked"}));

        let value =
            serde_json::to_value(SessionEvent::warning(None, "careful")).expect("serialize");
        assert_eq!(value, json!({"kind": "warning", "text": "careful"}));
    }

    #[test]
    fn chat_lines_are_prefixed_for_non_primary_senders() {
        let event = SessionEvent::chat(&AgentName::new("data_analyst"), "done", &primary());
        assert_eq!(
            event,
            SessionEvent::Message {
                sender: Some(AgentName::new("data_analyst")),
                text: "[Data_Analyst]: done".to_string(),
            }
        );

        let event = SessionEvent::chat(&primary(), "hi", &primary());
        assert!(matches!(event, SessionEvent::Message { text, .. } if text == "hi"));
    }

    #[test]
    fn delivery_payload_shape() {
        let delivery = MailboxDelivery::new(
            AgentName::new("bob"),
            "user_session:main".to_string(),
            vec![HistoryEntry::user("hello")],
        );
        let value = serde_json::to_value(&delivery).expect("serialize");
        assert_eq!(value["agent"], "bob");
        assert_eq!(value["reply_to"], "user_session:main");
        assert_eq!(value["messages"], json!([{"role": "user", "content": "hello"}]));
        assert!(delivery.delivery_id.starts_with("del_"));
    }

    #[test]
    fn reply_parsing() {
        assert_eq!(parse_reply("[ASSISTANT_READY]", &primary()), AgentReply::Ready);
        assert_eq!(
            parse_reply(
                r#"{"sender": "Bob", "content": "hi", "timestamp": 1712.5}"#,
                &primary()
            ),
            AgentReply::Envelope {
                from: AgentName::new("bob"),
                content: "hi".to_string()
            }
        );
        assert_eq!(
            parse_reply(r#"{"content": "from the top"}"#, &primary()),
            AgentReply::Envelope {
                from: primary(),
                content: "from the top".to_string()
            }
        );
        assert_eq!(
            parse_reply("plain words", &primary()),
            AgentReply::Raw("plain words".to_string())
        );
    }

    #[test]
    fn content_classification() {
        assert_eq!(classify(" [END_OF_STREAM] "), ContentKind::EndOfStream);
        assert_eq!(
            classify("[SYSTEM] bob restarted"),
            ContentKind::SystemNotice("bob restarted")
        );
        assert_eq!(classify("@bob hi"), ContentKind::Chat("@bob hi"));
    }

    #[test]
    fn control_lines() {
        assert_eq!(ControlLine::parse(" /CLEAR "), Some(ControlLine::Clear));
        assert_eq!(ControlLine::parse("/unlock"), Some(ControlLine::Unlock));
        assert_eq!(
            ControlLine::parse("/restart @Translater"),
            Some(ControlLine::Lifecycle {
                action: LifecycleAction::Restart,
                target: "Translater".to_string()
            })
        );
        assert_eq!(
            ControlLine::parse("/stop all"),
            Some(ControlLine::Lifecycle {
                action: LifecycleAction::Stop,
                target: "all".to_string()
            })
        );
        assert_eq!(ControlLine::parse("/start"), None);
        assert_eq!(ControlLine::parse("/start two names"), None);
        assert_eq!(ControlLine::parse("please /clear"), None);
    }
}
