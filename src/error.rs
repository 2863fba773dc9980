//! Error types for registry access, mailbox hand-off, and per-target
//! delivery outcomes.

use thiserror::Error;

use crate::types::AgentName;

/// Errors returned by an [`AgentRegistry`](crate::registry::AgentRegistry).
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Transport failure talking to the lifecycle service.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The lifecycle service answered with a non-success status code.
    #[error("lifecycle service returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The lifecycle service accepted the request but reported `ok: false`.
    #[error("lifecycle request rejected: {0}")]
    Lifecycle(String),

    /// The named agent is not known to the registry.
    #[error("agent '{0}' is not registered")]
    UnknownAgent(AgentName),
}

impl RegistryError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_connect() || e.is_timeout(),
            Self::Status { status, .. } => (500..=599).contains(status),
            _ => false,
        }
    }
}

/// Errors handing a delivery to an agent mailbox.
#[derive(Error, Debug)]
pub enum MailboxError {
    #[error("inbox backlog for '{agent}' is full ({capacity} pending deliveries)")]
    BacklogFull { agent: AgentName, capacity: usize },
}

/// Failures scoped to a single routing target. None of these abort delivery
/// to the other targets of the same message.
#[derive(Error, Debug)]
pub enum TargetError {
    #[error("failed to start agent '{agent}': {reason}")]
    StartFailed { agent: AgentName, reason: String },

    #[error("agent '{agent}' was not running after {attempts} status checks; delivered anyway")]
    ReadinessTimeout { agent: AgentName, attempts: u32 },

    #[error("could not hand off to the mailbox of '{agent}': {source}")]
    MailboxDelivery {
        agent: AgentName,
        #[source]
        source: MailboxError,
    },
}

impl TargetError {
    pub fn agent(&self) -> &AgentName {
        match self {
            Self::StartFailed { agent, .. }
            | Self::ReadinessTimeout { agent, .. }
            | Self::MailboxDelivery { agent, .. } => agent,
        }
    }

    /// Whether the message did not reach the target at all.
    pub fn is_undelivered(&self) -> bool {
        !matches!(self, Self::ReadinessTimeout { .. })
    }
}
