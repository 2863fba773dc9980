//! Agent mailbox transport.
//!
//! [`LocalMailbox`] is an in-process hub: one inbox per agent (fed to the
//! agent's socket when attached, buffered otherwise) and one broadcast reply
//! topic per session.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::{
    error::MailboxError,
    protocol::MailboxDelivery,
    types::{AgentName, SessionKey},
};

pub const DEFAULT_BACKLOG_CAPACITY: usize = 256;
const REPLY_CHANNEL_CAPACITY: usize = 256;

#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Hands a delivery to the target agent's inbox.
    async fn deliver(&self, delivery: &MailboxDelivery) -> Result<(), MailboxError>;

    /// Raw payloads published on the session's reply topic.
    fn subscribe_replies(&self, session: &SessionKey) -> broadcast::Receiver<String>;

    /// Called when a session ends and has dropped its reply subscription.
    fn release_session(&self, _session: &SessionKey) {}
}

#[derive(Default)]
struct Inbox {
    subscriber: Option<mpsc::Sender<MailboxDelivery>>,
    backlog: VecDeque<MailboxDelivery>,
}

#[derive(Default)]
struct Hub {
    inboxes: HashMap<AgentName, Inbox>,
    replies: HashMap<SessionKey, broadcast::Sender<String>>,
}

#[derive(Clone)]
pub struct LocalMailbox {
    hub: Arc<Mutex<Hub>>,
    backlog_capacity: usize,
}

impl Default for LocalMailbox {
    fn default() -> Self {
        Self::new(DEFAULT_BACKLOG_CAPACITY)
    }
}

impl LocalMailbox {
    pub fn new(backlog_capacity: usize) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub::default())),
            backlog_capacity,
        }
    }

    /// Attaches a consumer for the agent's inbox, replacing any previous
    /// one. Deliveries buffered while nobody was attached are replayed into
    /// the new consumer in order.
    pub fn attach_inbox(&self, agent: &AgentName, buffer: usize) -> mpsc::Receiver<MailboxDelivery> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let mut hub = self.hub.lock();
        let inbox = hub.inboxes.entry(agent.clone()).or_default();

        let mut replayed = 0;
        while let Some(delivery) = inbox.backlog.pop_front() {
            if let Err(err) = tx.try_send(delivery) {
                inbox.backlog.push_front(err.into_inner());
                break;
            }
            replayed += 1;
        }
        inbox.subscriber = Some(tx);

        tracing::info!(
            target = "router::mailbox",
            agent = %agent,
            replayed = replayed,
            still_buffered = inbox.backlog.len(),
            "agent inbox attached"
        );
        rx
    }

    pub fn detach_inbox(&self, agent: &AgentName) {
        if let Some(inbox) = self.hub.lock().inboxes.get_mut(agent) {
            inbox.subscriber = None;
        }
        tracing::info!(target = "router::mailbox", agent = %agent, "agent inbox detached");
    }

    pub fn pending(&self, agent: &AgentName) -> usize {
        self.hub
            .lock()
            .inboxes
            .get(agent)
            .map(|inbox| inbox.backlog.len())
            .unwrap_or(0)
    }

    /// Publishes a raw reply payload on the session's topic. Returns the
    /// number of listeners that received it. Only a subscribed session has a
    /// topic; publishing never creates one, and a topic whose listeners are
    /// all gone is dropped here.
    pub fn publish_reply(&self, session: &SessionKey, payload: impl Into<String>) -> usize {
        let mut hub = self.hub.lock();
        let Some(sender) = hub.replies.get(session) else {
            tracing::debug!(
                target = "router::mailbox",
                session = %session,
                "reply dropped, no session listening"
            );
            return 0;
        };
        match sender.send(payload.into()) {
            Ok(receivers) => receivers,
            Err(_) => {
                hub.replies.remove(session);
                tracing::debug!(
                    target = "router::mailbox",
                    session = %session,
                    "reply dropped, session listeners gone"
                );
                0
            }
        }
    }

    fn buffer(&self, delivery: MailboxDelivery) -> Result<(), MailboxError> {
        let mut hub = self.hub.lock();
        let inbox = hub.inboxes.entry(delivery.agent.clone()).or_default();
        if inbox.backlog.len() >= self.backlog_capacity {
            return Err(MailboxError::BacklogFull {
                agent: delivery.agent,
                capacity: self.backlog_capacity,
            });
        }
        inbox.backlog.push_back(delivery);
        Ok(())
    }
}

#[async_trait]
impl Mailbox for LocalMailbox {
    async fn deliver(&self, delivery: &MailboxDelivery) -> Result<(), MailboxError> {
        let subscriber = self
            .hub
            .lock()
            .inboxes
            .get(&delivery.agent)
            .and_then(|inbox| inbox.subscriber.clone());

        let Some(subscriber) = subscriber else {
            tracing::debug!(
                target = "router::mailbox",
                agent = %delivery.agent,
                "no agent attached, buffering delivery"
            );
            return self.buffer(delivery.clone());
        };

        match subscriber.send(delivery.clone()).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(returned)) => {
                tracing::debug!(
                    target = "router::mailbox",
                    agent = %returned.agent,
                    "agent socket gone, buffering delivery"
                );
                self.detach_inbox(&returned.agent);
                self.buffer(returned)
            }
        }
    }

    fn subscribe_replies(&self, session: &SessionKey) -> broadcast::Receiver<String> {
        self.hub
            .lock()
            .replies
            .entry(session.clone())
            .or_insert_with(|| broadcast::channel(REPLY_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    fn release_session(&self, session: &SessionKey) {
        let mut hub = self.hub.lock();
        if hub
            .replies
            .get(session)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            hub.replies.remove(session);
        }
    }
}
