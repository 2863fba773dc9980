//! Per-session orchestration of routing, readiness, typing and delivery.
//!
//! A [`MessageDispatcher`] is driven by its session loop one input at a
//! time: user lines, agent replies, fired typing timers and finished
//! readiness waits. Readiness waits and typing timers run as separate tasks
//! and only ever report back through the dispatcher's input channels, so
//! delivery order is decided here and nowhere else.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use tokio::{sync::mpsc, task::AbortHandle};

use crate::{
    error::TargetError,
    events::{EventEmitter, RouterEvent},
    fuzzy,
    history::{HistoryEntry, HistoryStore, DEFAULT_HISTORY_LIMIT},
    lock::{LockStateTracker, LockTransition},
    mailbox::Mailbox,
    mention,
    protocol::{
        self, AgentReply, ContentKind, ControlLine, LifecycleAction, MailboxDelivery,
        SessionEvent,
    },
    readiness::{ReadinessCoordinator, ReadinessOutcome, ReadinessSettings},
    registry::{AgentRegistry, RegistrySnapshot},
    routing::{self, RoutingDecision},
    typing::{TypingScheduler, TypingSettings, TypingSignal, TypingTimer},
    types::{AgentName, AgentStatus, SessionKey},
};

const INPUT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    pub primary: AgentName,
    /// Maximum number of nested hops an agent reply may fan out through.
    pub max_delegation_depth: u32,
    /// How long a routing decision waits for the registry view.
    pub registry_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            primary: AgentName::new("assistant"),
            max_delegation_depth: 3,
            registry_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub readiness: ReadinessSettings,
    pub typing: TypingSettings,
    pub dispatch: DispatchSettings,
    pub history_limit: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            readiness: ReadinessSettings::default(),
            typing: TypingSettings::default(),
            dispatch: DispatchSettings::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Process-wide services shared by every session.
#[derive(Clone)]
pub struct RouterContext {
    pub registry: Arc<dyn AgentRegistry>,
    pub mailbox: Arc<dyn Mailbox>,
    pub readiness: ReadinessCoordinator,
    pub history: HistoryStore,
    pub events: EventEmitter,
    pub dispatch: DispatchSettings,
    pub typing: TypingSettings,
}

impl RouterContext {
    pub fn new(
        registry: Arc<dyn AgentRegistry>,
        mailbox: Arc<dyn Mailbox>,
        settings: RouterSettings,
        events: EventEmitter,
    ) -> Self {
        Self {
            readiness: ReadinessCoordinator::new(Arc::clone(&registry), settings.readiness),
            registry,
            mailbox,
            history: HistoryStore::new(settings.history_limit),
            events,
            dispatch: settings.dispatch,
            typing: settings.typing,
        }
    }

    pub fn primary(&self) -> &AgentName {
        &self.dispatch.primary
    }

    /// Current registry view; an unreachable or unresponsive registry yields
    /// an empty one so routing degrades to the primary.
    pub async fn snapshot(&self) -> RegistrySnapshot {
        let timeout = self.dispatch.registry_timeout;
        match tokio::time::timeout(timeout, self.registry.snapshot()).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(error)) => {
                tracing::warn!(
                    target = "router::registry",
                    error = %error,
                    "registry snapshot failed, routing with an empty registry"
                );
                RegistrySnapshot::default()
            }
            Err(_) => {
                tracing::warn!(
                    target = "router::registry",
                    timeout_ms = timeout.as_millis() as u64,
                    "registry snapshot timed out, routing with an empty registry"
                );
                RegistrySnapshot::default()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessOrigin {
    /// Started because a message is waiting for the agent.
    Delivery,
    /// Started by a `/start` or `/restart` command.
    Command(LifecycleAction),
}

#[derive(Debug, Clone)]
pub struct ReadinessReport {
    pub agent: AgentName,
    pub outcome: ReadinessOutcome,
    pub origin: ReadinessOrigin,
    /// The agent had been created but never launched before this start.
    pub never_started: bool,
}

/// Receivers the session loop polls alongside user lines and replies.
pub struct DispatcherInputs {
    pub timers: mpsc::Receiver<TypingTimer>,
    pub readiness: mpsc::Receiver<ReadinessReport>,
}

#[derive(Debug)]
struct PendingDelivery {
    content: String,
    depth: u32,
}

#[derive(Debug, PartialEq, Eq)]
enum RouteOutcome {
    Delivered,
    Held,
    Failed(&'static str),
}

pub struct MessageDispatcher {
    ctx: RouterContext,
    session: SessionKey,
    lock: LockStateTracker,
    typing: TypingScheduler,
    /// Delegation depth of the work most recently handed to each agent.
    depths: HashMap<AgentName, u32>,
    /// Deliveries waiting on an in-flight readiness check, per agent.
    held: HashMap<AgentName, VecDeque<PendingDelivery>>,
    readiness_tasks: HashMap<AgentName, AbortHandle>,
    readiness_tx: mpsc::Sender<ReadinessReport>,
    out: mpsc::Sender<SessionEvent>,
}

impl MessageDispatcher {
    pub fn new(
        ctx: RouterContext,
        session: SessionKey,
        out: mpsc::Sender<SessionEvent>,
    ) -> (Self, DispatcherInputs) {
        let (timer_tx, timers) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        let (readiness_tx, readiness) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        let typing = TypingScheduler::new(ctx.typing, timer_tx);
        let dispatcher = Self {
            ctx,
            session,
            lock: LockStateTracker::new(),
            typing,
            depths: HashMap::new(),
            held: HashMap::new(),
            readiness_tasks: HashMap::new(),
            readiness_tx,
            out,
        };
        (dispatcher, DispatcherInputs { timers, readiness })
    }

    pub fn session(&self) -> &SessionKey {
        &self.session
    }

    pub fn lock_state(&self) -> &LockStateTracker {
        &self.lock
    }

    fn primary(&self) -> AgentName {
        self.ctx.primary().clone()
    }

    async fn emit(&self, event: SessionEvent) {
        if self.out.send(event).await.is_err() {
            tracing::debug!(target = "router::dispatch", session = %self.session, "client gone, event dropped");
        }
    }

    async fn emit_typing(&self, signal: Option<TypingSignal>) {
        match signal {
            Some(TypingSignal::Started(agent)) => self.emit(SessionEvent::AgentTyping { agent }).await,
            Some(TypingSignal::Stopped(agent)) => {
                self.emit(SessionEvent::AgentStoppedTyping { agent }).await
            }
            None => {}
        }
    }

    async fn emit_lock(&self, transition: Option<LockTransition>) {
        match transition {
            Some(LockTransition::Locked(agent)) => {
                self.emit(SessionEvent::ConversationLocked { agent }).await
            }
            Some(LockTransition::Unlocked) => self.emit(SessionEvent::ConversationUnlocked).await,
            None => {}
        }
    }

    /// Session start: announce the initial unlocked state and kick off the
    /// primary if it is not running yet.
    pub async fn open(&mut self) {
        self.ctx.events.emit(RouterEvent::SessionOpened {
            session: self.session.clone(),
        });
        self.emit(SessionEvent::ConversationUnlocked).await;

        let restored = self.ctx.history.snapshot(&self.session).len();
        if restored > 0 {
            self.emit(SessionEvent::notice(format!(
                "Restored {restored} agent conversation(s)."
            )))
            .await;
        }

        let primary = self.primary();
        let status = tokio::time::timeout(
            self.ctx.dispatch.registry_timeout,
            self.ctx.registry.status(&primary),
        )
        .await;
        match status {
            Ok(Ok(AgentStatus::Running)) => {}
            Ok(Ok(AgentStatus::Stopped)) => {
                tracing::info!(target = "router::dispatch", agent = %primary, "primary not running, requesting start");
                let registry = Arc::clone(&self.ctx.registry);
                let agent = primary.clone();
                tokio::spawn(async move {
                    if let Err(error) = registry.request_start(&agent).await {
                        tracing::warn!(target = "router::dispatch", agent = %agent, error = %error, "primary start failed");
                    }
                });
                self.emit(SessionEvent::notice(format!(
                    "Starting {}...",
                    primary.display_name()
                )))
                .await;
            }
            Ok(Err(error)) => {
                tracing::warn!(target = "router::dispatch", agent = %primary, error = %error, "primary status unavailable");
            }
            Err(_) => {
                tracing::warn!(target = "router::dispatch", agent = %primary, "primary status check timed out");
            }
        }
    }

    /// One line typed by the user.
    pub async fn handle_user_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if let Some(control) = ControlLine::parse(line) {
            self.handle_control(control).await;
            return;
        }

        let primary = self.primary();
        let snapshot = self.ctx.snapshot().await;
        let lock = self.lock.current();
        let plan = routing::plan_outbound(line, &snapshot, lock.as_ref(), &primary);
        let targets = plan.decision.targets();

        self.ctx.events.emit(RouterEvent::RoutingDecision {
            session: self.session.clone(),
            decision: plan.decision.clone(),
            ignored: plan.ignored.clone(),
        });

        let transition = self.lock.apply(&plan.decision);
        self.emit_lock(transition).await;
        self.typing.on_outbound_send(&targets);
        if let RoutingDecision::Delegation { to } = &plan.decision {
            // agents the primary is expected to hand work to
            let delegates: Vec<AgentName> =
                routing::valid_targets(&mention::extract(line), &snapshot)
                    .into_iter()
                    .filter(|name| name != to && snapshot.status(name).is_running())
                    .collect();
            self.typing.on_outbound_send(&delegates);
        }

        let may_start = matches!(
            plan.decision,
            RoutingDecision::SingleLock { .. } | RoutingDecision::DefaultRoute { .. }
        );
        let mut handled = 0;
        let mut unavailable = Vec::new();
        for target in &targets {
            match self
                .route_to(target, plan.text.clone(), 0, &snapshot, may_start)
                .await
            {
                RouteOutcome::Delivered | RouteOutcome::Held => handled += 1,
                RouteOutcome::Failed(reason) => unavailable.push(format!("{target} ({reason})")),
            }
        }

        if !unavailable.is_empty() {
            self.emit(SessionEvent::warning(
                None,
                format!("Some agents were unavailable: {}", unavailable.join(", ")),
            ))
            .await;
        }
        if handled == 0 {
            self.emit(SessionEvent::error(
                None,
                "No agents were available to handle your message.",
            ))
            .await;
        }
    }

    /// One payload from the session's reply topic.
    pub async fn handle_agent_reply(&mut self, raw: &str) {
        let primary = self.primary();
        let (from, content) = match protocol::parse_reply(raw, &primary) {
            AgentReply::Ready => {
                self.emit(SessionEvent::AgentStatus {
                    agent: primary.clone(),
                    status: AgentStatus::Running,
                })
                .await;
                self.emit(SessionEvent::notice(format!(
                    "{} is ready.",
                    primary.display_name()
                )))
                .await;
                return;
            }
            AgentReply::Raw(text) => {
                let stopped = self.typing.on_inbound_message(&primary);
                self.emit_typing(stopped).await;
                self.emit(SessionEvent::Message {
                    sender: Some(primary),
                    text,
                })
                .await;
                return;
            }
            AgentReply::Envelope { from, content } => (from, content),
        };

        let stopped = self.typing.on_inbound_message(&from);
        self.emit_typing(stopped).await;

        match protocol::classify(&content) {
            ContentKind::EndOfStream => return,
            ContentKind::SystemNotice(text) => {
                self.emit(SessionEvent::notice(text)).await;
                return;
            }
            ContentKind::Chat(_) => {}
        }

        self.ctx
            .history
            .append(&self.session, &from, HistoryEntry::assistant(content.clone()));
        self.emit(SessionEvent::chat(&from, &content, &primary)).await;

        self.dispatch_nested(&from, &content).await;
    }

    /// Re-routes the agent-mentions inside a reply. The lock is never
    /// touched here.
    async fn dispatch_nested(&mut self, from: &AgentName, content: &str) {
        let snapshot = self.ctx.snapshot().await;
        let Some(plan) = routing::plan_nested(from, content, &snapshot) else {
            return;
        };

        let depth = self.depths.get(from).copied().unwrap_or(0) + 1;
        let max_depth = self.ctx.dispatch.max_delegation_depth;
        if depth > max_depth {
            tracing::warn!(
                target = "router::dispatch",
                session = %self.session,
                from = %from,
                targets = ?plan.targets(),
                depth = depth,
                "delegation depth exceeded, nested dispatch skipped"
            );
            self.emit(SessionEvent::warning(
                Some(from),
                format!(
                    "Not forwarding {}'s message to {}: delegation is limited to {max_depth} hops.",
                    from.display_name(),
                    plan.targets()
                        .iter()
                        .map(AgentName::display_name)
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            ))
            .await;
            return;
        }

        self.typing.on_outbound_send(&plan.targets());

        let mut unavailable = Vec::new();
        for (target, share) in plan.deliveries {
            if let RouteOutcome::Failed(reason) =
                self.route_to(&target, share, depth, &snapshot, false).await
            {
                unavailable.push(format!("{target} ({reason})"));
            }
        }
        if !unavailable.is_empty() {
            self.emit(SessionEvent::warning(
                Some(from),
                format!(
                    "Could not forward {}'s message to: {}",
                    from.display_name(),
                    unavailable.join(", ")
                ),
            ))
            .await;
        }
    }

    /// Delivers to one target, holding the content behind a readiness wait
    /// when the target is not running yet.
    async fn route_to(
        &mut self,
        target: &AgentName,
        content: String,
        depth: u32,
        snapshot: &RegistrySnapshot,
        may_start: bool,
    ) -> RouteOutcome {
        if let Some(queue) = self.held.get_mut(target) {
            queue.push_back(PendingDelivery { content, depth });
            tracing::debug!(target = "router::dispatch", agent = %target, queued = queue.len(), "queued behind readiness wait");
            return RouteOutcome::Held;
        }

        let primary = self.primary();
        if *target != primary && !snapshot.status(target).is_running() {
            if !may_start {
                let stopped = self.typing.clear(target);
                self.emit_typing(stopped).await;
                return RouteOutcome::Failed("not running");
            }

            let never_started = snapshot
                .record(target)
                .is_some_and(|record| record.never_started);
            self.held
                .entry(target.clone())
                .or_default()
                .push_back(PendingDelivery { content, depth });
            self.spawn_readiness(target, never_started, ReadinessOrigin::Delivery);
            self.emit(SessionEvent::notice(format!(
                "Starting {}...",
                target.display_name()
            )))
            .await;
            return RouteOutcome::Held;
        }

        match self.deliver_now(target, content, depth).await {
            Ok(()) => RouteOutcome::Delivered,
            Err(error) => {
                self.report_target_error(&error).await;
                RouteOutcome::Failed("delivery failed")
            }
        }
    }

    /// Surfaces a per-target failure scoped to its agent: a warning when the
    /// message still went out, an error when it did not.
    async fn report_target_error(&self, error: &TargetError) {
        let agent = Some(error.agent());
        let event = if error.is_undelivered() {
            SessionEvent::error(agent, error.to_string())
        } else {
            SessionEvent::warning(agent, error.to_string())
        };
        self.emit(event).await;
    }

    async fn deliver_now(
        &mut self,
        target: &AgentName,
        content: String,
        depth: u32,
    ) -> Result<(), TargetError> {
        let messages = self
            .ctx
            .history
            .append(&self.session, target, HistoryEntry::user(content));
        let delivery = MailboxDelivery::new(target.clone(), self.session.reply_topic(), messages);

        match self.ctx.mailbox.deliver(&delivery).await {
            Ok(()) => {
                self.depths.insert(target.clone(), depth);
                tracing::debug!(
                    target = "router::dispatch",
                    session = %self.session,
                    agent = %target,
                    depth = depth,
                    delivery_id = %delivery.delivery_id,
                    history = delivery.messages.len(),
                    "delivered to mailbox"
                );
                Ok(())
            }
            Err(source) => {
                tracing::warn!(
                    target = "router::dispatch",
                    session = %self.session,
                    agent = %target,
                    error = %source,
                    "mailbox delivery failed"
                );
                self.ctx.events.emit(RouterEvent::DeliveryFailed {
                    session: self.session.clone(),
                    agent: target.clone(),
                    error: source.to_string(),
                });
                let stopped = self.typing.clear(target);
                self.emit_typing(stopped).await;
                Err(TargetError::MailboxDelivery {
                    agent: target.clone(),
                    source,
                })
            }
        }
    }

    fn spawn_readiness(&mut self, agent: &AgentName, never_started: bool, origin: ReadinessOrigin) {
        self.held.entry(agent.clone()).or_default();
        if self.readiness_tasks.contains_key(agent) {
            return;
        }

        let coordinator = self.ctx.readiness.clone();
        let tx = self.readiness_tx.clone();
        let name = agent.clone();
        let handle = tokio::spawn(async move {
            let outcome = coordinator.ensure_ready(&name).await;
            let _ = tx
                .send(ReadinessReport {
                    agent: name,
                    outcome,
                    origin,
                    never_started,
                })
                .await;
        });
        self.readiness_tasks
            .insert(agent.clone(), handle.abort_handle());
    }

    /// A readiness wait finished: flush or drop what was held for the agent.
    /// A freshly created agent is only re-initialized once the flush is done.
    pub async fn handle_readiness(&mut self, report: ReadinessReport) {
        let ReadinessReport {
            agent,
            outcome,
            origin,
            never_started,
        } = report;
        self.readiness_tasks.remove(&agent);
        let queued = self.held.remove(&agent).unwrap_or_default();

        match &outcome {
            ReadinessOutcome::AlreadyRunning => {
                if let ReadinessOrigin::Command(LifecycleAction::Start) = origin {
                    self.emit(SessionEvent::notice(format!(
                        "{} is already running.",
                        agent.display_name()
                    )))
                    .await;
                }
            }
            ReadinessOutcome::StartedAndReady { .. } => {
                self.emit(SessionEvent::AgentStatus {
                    agent: agent.clone(),
                    status: AgentStatus::Running,
                })
                .await;
                if let ReadinessOrigin::Command(_) = origin {
                    self.emit(SessionEvent::notice(format!(
                        "{} is running.",
                        agent.display_name()
                    )))
                    .await;
                }
            }
            ReadinessOutcome::TimedOut { attempts } => {
                let error = TargetError::ReadinessTimeout {
                    agent: agent.clone(),
                    attempts: *attempts,
                };
                self.ctx.events.emit(RouterEvent::ReadinessTimeout {
                    session: self.session.clone(),
                    agent: agent.clone(),
                    attempts: *attempts,
                });
                self.report_target_error(&error).await;
            }
            ReadinessOutcome::StartFailed { reason } => {
                let error = TargetError::StartFailed {
                    agent: agent.clone(),
                    reason: reason.clone(),
                };
                self.report_target_error(&error).await;
                let stopped = self.typing.clear(&agent);
                self.emit_typing(stopped).await;
                if !queued.is_empty() {
                    tracing::warn!(
                        target = "router::dispatch",
                        session = %self.session,
                        agent = %agent,
                        dropped = queued.len(),
                        "dropping held deliveries after failed start"
                    );
                }
                return;
            }
        }

        for pending in queued {
            if let Err(error) = self.deliver_now(&agent, pending.content, pending.depth).await {
                self.report_target_error(&error).await;
            }
        }

        if never_started && matches!(outcome, ReadinessOutcome::StartedAndReady { .. }) {
            self.ctx.readiness.schedule_reinit(&agent);
        }
    }

    pub async fn handle_typing_timer(&mut self, timer: TypingTimer) {
        let signal = self.typing.on_timer(timer);
        self.emit_typing(signal).await;
    }

    async fn handle_control(&mut self, control: ControlLine) {
        match control {
            ControlLine::Clear => {
                let removed = self.ctx.history.clear(&self.session);
                self.depths.clear();
                tracing::info!(target = "router::session", session = %self.session, removed = removed, "history cleared");
                self.emit(SessionEvent::notice(format!(
                    "Conversation history cleared ({removed} messages)."
                )))
                .await;
            }
            ControlLine::Unlock => match self.lock.unlock() {
                Some(transition) => self.emit_lock(Some(transition)).await,
                None => {
                    self.emit(SessionEvent::notice("Conversation is not locked."))
                        .await
                }
            },
            ControlLine::Lifecycle { action, target } => {
                self.handle_lifecycle(action, &target).await;
            }
        }
    }

    async fn handle_lifecycle(&mut self, action: LifecycleAction, target: &str) {
        let primary = self.primary();
        let snapshot = self.ctx.snapshot().await;
        let managed: Vec<AgentName> = snapshot
            .names()
            .into_iter()
            .filter(|name| *name != primary)
            .collect();

        let targets: Vec<AgentName> = if target.eq_ignore_ascii_case("all") {
            managed
        } else if AgentName::new(target.trim_start_matches('@')) == primary {
            self.emit(SessionEvent::error(
                Some(&primary),
                format!("{} cannot be managed from chat.", primary.display_name()),
            ))
            .await;
            return;
        } else {
            match fuzzy::resolve_name(target, &managed) {
                Some(name) => vec![name],
                None => {
                    self.emit(SessionEvent::error(
                        None,
                        format!("Agent '{target}' not found or not available for management."),
                    ))
                    .await;
                    return;
                }
            }
        };

        // start only touches stopped agents, stop only running ones
        let targets: Vec<AgentName> = targets
            .into_iter()
            .filter(|name| match action {
                LifecycleAction::Start => !snapshot.status(name).is_running(),
                LifecycleAction::Stop => snapshot.status(name).is_running(),
                LifecycleAction::Restart => true,
            })
            .collect();
        if targets.is_empty() {
            let state = match action {
                LifecycleAction::Stop => "stopped",
                _ => "running",
            };
            self.emit(SessionEvent::notice(format!(
                "All target agents are already {state}."
            )))
            .await;
            return;
        }

        self.emit(SessionEvent::notice(format!(
            "{} {} agent(s): {}",
            action.verb(),
            targets.len(),
            targets
                .iter()
                .map(AgentName::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        )))
        .await;

        for agent in targets {
            let never_started = snapshot
                .record(&agent)
                .is_some_and(|record| record.never_started);
            match action {
                LifecycleAction::Start => {
                    self.spawn_readiness(&agent, never_started, ReadinessOrigin::Command(action))
                }
                LifecycleAction::Stop => {
                    if self.stop_agent(&agent).await {
                        self.emit(SessionEvent::notice(format!(
                            "{} stopped.",
                            agent.display_name()
                        )))
                        .await;
                    }
                }
                LifecycleAction::Restart => {
                    if self.stop_agent(&agent).await {
                        self.spawn_readiness(&agent, never_started, ReadinessOrigin::Command(action));
                    }
                }
            }
        }
    }

    async fn stop_agent(&mut self, agent: &AgentName) -> bool {
        let request = tokio::time::timeout(
            self.ctx.dispatch.registry_timeout,
            self.ctx.registry.request_stop(agent),
        )
        .await;
        let reason = match request {
            Ok(Ok(())) => {
                let stopped = self.typing.clear(agent);
                self.emit_typing(stopped).await;
                self.emit(SessionEvent::AgentStatus {
                    agent: agent.clone(),
                    status: AgentStatus::Stopped,
                })
                .await;
                return true;
            }
            Ok(Err(error)) => error.to_string(),
            Err(_) => "request timed out".to_string(),
        };
        tracing::warn!(target = "router::dispatch", agent = %agent, error = %reason, "stop request failed");
        self.emit(SessionEvent::error(
            Some(agent),
            format!("Failed to stop {}: {reason}", agent.display_name()),
        ))
        .await;
        false
    }

    /// Session teardown: cancels every timer and readiness wait it owns.
    pub fn close(&mut self) {
        self.typing.cancel_all();
        for (_, task) in self.readiness_tasks.drain() {
            task.abort();
        }
        let dropped: usize = self.held.drain().map(|(_, queue)| queue.len()).sum();
        self.ctx.events.emit(RouterEvent::SessionClosed {
            session: self.session.clone(),
            dropped_deliveries: dropped,
        });
        tracing::info!(target = "router::session", session = %self.session, dropped = dropped, "session closed");
    }
}

impl Drop for MessageDispatcher {
    fn drop(&mut self) {
        for (_, task) in self.readiness_tasks.drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::Arc, time::Duration};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::{DispatcherInputs, MessageDispatcher, RouterContext, RouterSettings};
    use crate::{
        error::RegistryError,
        events::EventEmitter,
        mailbox::LocalMailbox,
        protocol::SessionEvent,
        registry::{AgentRecord, AgentRegistry, LocalRegistry},
        types::{AgentName, AgentStatus, SessionKey},
    };

    struct Harness {
        dispatcher: MessageDispatcher,
        inputs: DispatcherInputs,
        events: mpsc::Receiver<SessionEvent>,
        router_events: Arc<Mutex<Vec<serde_json::Value>>>,
        registry: LocalRegistry,
        mailbox: LocalMailbox,
    }

    fn harness(running: &[&str]) -> Harness {
        harness_with(
            LocalRegistry::with_running(running.iter().copied()),
            LocalMailbox::default(),
        )
    }

    fn harness_with(registry: LocalRegistry, mailbox: LocalMailbox) -> Harness {
        let (recorder, router_events) = EventEmitter::recording();
        let (dispatcher, inputs, events) =
            dispatcher_over(Arc::new(registry.clone()), mailbox.clone(), recorder);
        Harness {
            dispatcher,
            inputs,
            events,
            router_events,
            registry,
            mailbox,
        }
    }

    fn dispatcher_over(
        registry: Arc<dyn AgentRegistry>,
        mailbox: LocalMailbox,
        router_events: EventEmitter,
    ) -> (MessageDispatcher, DispatcherInputs, mpsc::Receiver<SessionEvent>) {
        let ctx = RouterContext::new(
            registry,
            Arc::new(mailbox),
            RouterSettings::default(),
            router_events,
        );
        let (out, events) = mpsc::channel(64);
        let (dispatcher, inputs) = MessageDispatcher::new(ctx, SessionKey::new("test"), out);
        (dispatcher, inputs, events)
    }

    fn drain(events: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[tokio::test]
    async fn single_mention_locks_and_delivers_cleaned_text() {
        let mut h = harness(&["assistant", "bob"]);
        h.dispatcher.handle_user_line("@bob write tests").await;

        assert_eq!(
            drain(&mut h.events),
            vec![SessionEvent::ConversationLocked {
                agent: AgentName::new("bob")
            }]
        );
        let bob = AgentName::new("bob");
        assert_eq!(h.mailbox.pending(&bob), 1);
        let mut inbox = h.mailbox.attach_inbox(&bob, 4);
        let delivery = inbox.recv().await.expect("delivery");
        assert_eq!(delivery.messages.last().expect("message").content, "write tests");
        assert_eq!(delivery.reply_to, "user_session:test");
    }

    #[tokio::test]
    async fn broadcast_with_stopped_target_reports_it_unavailable() {
        let mut h = harness(&["assistant", "bob"]);
        h.registry.insert(AgentName::new("alice"), AgentStatus::Stopped, false);

        h.dispatcher.handle_user_line("@bob @alice status?").await;

        let events = drain(&mut h.events);
        assert!(events.contains(&SessionEvent::warning(
            None,
            "Some agents were unavailable: alice (not running)"
        )));
        assert_eq!(h.mailbox.pending(&AgentName::new("bob")), 1);
        assert_eq!(h.mailbox.pending(&AgentName::new("alice")), 0);
    }

    #[tokio::test]
    async fn unlock_control_line_clears_lock() {
        let mut h = harness(&["assistant", "bob"]);
        h.dispatcher.handle_user_line("@bob hi").await;
        drain(&mut h.events);

        h.dispatcher.handle_user_line("/unlock").await;
        assert_eq!(drain(&mut h.events), vec![SessionEvent::ConversationUnlocked]);
        assert_eq!(h.dispatcher.lock_state().current(), None);
    }

    #[tokio::test]
    async fn nested_mentions_fan_out_without_touching_lock() {
        let mut h = harness(&["assistant", "bob", "alice"]);
        h.dispatcher.handle_user_line("@assistant plan it").await;
        drain(&mut h.events);

        let reply = serde_json::json!({
            "sender": "assistant",
            "content": "Splitting up.\n@bob take the API\n@alice take the docs",
        })
        .to_string();
        h.dispatcher.handle_agent_reply(&reply).await;

        assert_eq!(h.mailbox.pending(&AgentName::new("bob")), 1);
        assert_eq!(h.mailbox.pending(&AgentName::new("alice")), 1);
        assert_eq!(h.dispatcher.lock_state().current(), None);

        let mut inbox = h.mailbox.attach_inbox(&AgentName::new("alice"), 4);
        let delivery = inbox.recv().await.expect("delivery");
        assert_eq!(
            delivery.messages.last().expect("message").content,
            "Splitting up.\ntake the docs"
        );
    }

    #[tokio::test]
    async fn delegation_chain_stops_at_depth_limit() {
        let mut h = harness(&["assistant", "a", "b", "c", "d"]);
        h.dispatcher.handle_user_line("@assistant go").await;

        for (from, next) in [("assistant", "a"), ("a", "b"), ("b", "c"), ("c", "d")] {
            let reply = serde_json::json!({"sender": from, "content": format!("@{next} continue")})
                .to_string();
            h.dispatcher.handle_agent_reply(&reply).await;
        }

        assert_eq!(h.mailbox.pending(&AgentName::new("c")), 1);
        assert_eq!(h.mailbox.pending(&AgentName::new("d")), 0);
        let events = drain(&mut h.events);
        assert!(events.iter().any(|event| matches!(
            event,
            SessionEvent::Warning { agent: Some(agent), .. } if agent.as_str() == "c"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_lock_target_is_started_before_delivery() {
        let mut h = harness(&["assistant"]);
        h.registry.insert(AgentName::new("bob"), AgentStatus::Stopped, false);
        let bob = AgentName::new("bob");

        h.dispatcher.handle_user_line("@bob first").await;
        h.dispatcher.handle_user_line("second").await;
        assert_eq!(h.mailbox.pending(&bob), 0);

        let report = h.inputs.readiness.recv().await.expect("readiness report");
        h.dispatcher.handle_readiness(report).await;

        let mut inbox = h.mailbox.attach_inbox(&bob, 4);
        let first = inbox.recv().await.expect("first delivery");
        let second = inbox.recv().await.expect("second delivery");
        assert_eq!(first.messages.len(), 1);
        assert_eq!(first.messages[0].content, "first");
        assert_eq!(second.messages.len(), 2);
        assert_eq!(second.messages[1].content, "second");

        let events = drain(&mut h.events);
        assert!(events.contains(&SessionEvent::AgentStatus {
            agent: bob.clone(),
            status: AgentStatus::Running
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_drops_held_message_with_error() {
        let mut h = harness(&["assistant"]);
        h.registry.insert(AgentName::new("bob"), AgentStatus::Stopped, false);
        h.registry.refuse_starts_for("bob");

        h.dispatcher.handle_user_line("@bob hi").await;
        let report = h.inputs.readiness.recv().await.expect("readiness report");
        h.dispatcher.handle_readiness(report).await;

        assert_eq!(h.mailbox.pending(&AgentName::new("bob")), 0);
        let events = drain(&mut h.events);
        assert!(events.iter().any(|event| matches!(
            event,
            SessionEvent::Error { agent: Some(agent), .. } if agent.as_str() == "bob"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn typing_indicator_shows_then_clears_on_reply() {
        let mut h = harness(&["assistant"]);
        h.dispatcher.handle_user_line("hello").await;

        let timer = tokio::time::timeout(Duration::from_secs(1), h.inputs.timers.recv())
            .await
            .expect("timer fired")
            .expect("timer");
        h.dispatcher.handle_typing_timer(timer).await;

        h.dispatcher
            .handle_agent_reply(r#"{"sender": "assistant", "content": "hi!"}"#)
            .await;

        let primary = AgentName::new("assistant");
        assert_eq!(
            drain(&mut h.events),
            vec![
                SessionEvent::AgentTyping {
                    agent: primary.clone()
                },
                SessionEvent::AgentStoppedTyping {
                    agent: primary.clone()
                },
                SessionEvent::Message {
                    sender: Some(primary),
                    text: "hi!".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn lifecycle_commands_resolve_fuzzy_names_and_skip_primary() {
        let mut h = harness(&["assistant", "translator"]);

        h.dispatcher.handle_user_line("/stop translater").await;
        let events = drain(&mut h.events);
        assert!(events.contains(&SessionEvent::AgentStatus {
            agent: AgentName::new("translator"),
            status: AgentStatus::Stopped
        }));

        h.dispatcher.handle_user_line("/stop assistant").await;
        let events = drain(&mut h.events);
        assert!(matches!(events.as_slice(), [SessionEvent::Error { .. }]));
    }

    #[tokio::test(start_paused = true)]
    async fn delegation_anticipates_typing_for_mentioned_agents() {
        let mut h = harness(&["assistant", "bob"]);
        h.dispatcher
            .handle_user_line("@assistant ask @bob for the numbers")
            .await;

        for _ in 0..2 {
            let timer = h.inputs.timers.recv().await.expect("timer");
            h.dispatcher.handle_typing_timer(timer).await;
        }

        let events = drain(&mut h.events);
        assert!(events.contains(&SessionEvent::AgentTyping {
            agent: AgentName::new("bob")
        }));
        assert_eq!(h.mailbox.pending(&AgentName::new("bob")), 0);
        assert_eq!(h.mailbox.pending(&AgentName::new("assistant")), 1);
    }

    #[tokio::test]
    async fn clear_control_line_empties_history() {
        let mut h = harness(&["assistant"]);
        h.dispatcher.handle_user_line("remember this").await;
        h.dispatcher.handle_user_line("/clear").await;

        let events = drain(&mut h.events);
        assert_eq!(
            events.last(),
            Some(&SessionEvent::notice("Conversation history cleared (1 messages)."))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_timeout_still_delivers_with_warning() {
        let registry = LocalRegistry::with_running(["assistant"])
            .with_start_latency(Duration::from_secs(3600));
        registry.insert(AgentName::new("bob"), AgentStatus::Stopped, false);
        let mut h = harness_with(registry, LocalMailbox::default());
        let bob = AgentName::new("bob");

        h.dispatcher.handle_user_line("@bob are you there?").await;
        let report = h.inputs.readiness.recv().await.expect("readiness report");
        h.dispatcher.handle_readiness(report).await;

        assert_eq!(h.mailbox.pending(&bob), 1);
        let events = drain(&mut h.events);
        assert!(events.iter().any(|event| matches!(
            event,
            SessionEvent::Warning { agent: Some(agent), .. } if *agent == bob
        )));
        assert!(!events
            .iter()
            .any(|event| matches!(event, SessionEvent::Error { .. })));

        let router_events = h.router_events.lock();
        let timeout = router_events
            .iter()
            .find(|line| line["type"] == "readiness_timeout")
            .expect("readiness_timeout event");
        assert_eq!(timeout["payload"]["agent"], "bob");
        assert_eq!(timeout["payload"]["attempts"], 10);
    }

    #[tokio::test]
    async fn full_backlog_fails_only_that_broadcast_target() {
        let mut h = harness_with(
            LocalRegistry::with_running(["assistant", "bob", "alice"]),
            LocalMailbox::new(1),
        );
        h.dispatcher.handle_user_line("@bob first").await;
        drain(&mut h.events);

        h.dispatcher.handle_user_line("@bob @alice sync up").await;

        assert_eq!(h.mailbox.pending(&AgentName::new("bob")), 1);
        assert_eq!(h.mailbox.pending(&AgentName::new("alice")), 1);
        let events = drain(&mut h.events);
        let errors: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Error { agent, .. } => agent.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec![AgentName::new("bob")]);
        assert!(events.contains(&SessionEvent::warning(
            None,
            "Some agents were unavailable: bob (delivery failed)"
        )));

        let kinds: Vec<String> = h
            .router_events
            .lock()
            .iter()
            .map(|line| line["type"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(
            kinds,
            vec!["routing_decision", "routing_decision", "delivery_failed"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_agent_gets_held_message_before_reinit() {
        let mut h = harness(&["assistant"]);
        h.registry.create("bob");
        let bob = AgentName::new("bob");

        h.dispatcher.handle_user_line("@bob welcome aboard").await;
        let report = h.inputs.readiness.recv().await.expect("readiness report");
        assert!(report.never_started);
        h.dispatcher.handle_readiness(report).await;

        assert_eq!(h.mailbox.pending(&bob), 1);
        assert_eq!(h.registry.status(&bob).await.expect("status"), AgentStatus::Running);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(h.registry.status(&bob).await.expect("status"), AgentStatus::Stopped);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(h.registry.status(&bob).await.expect("status"), AgentStatus::Running);
    }

    /// Registry that accepts every request and never answers any of them.
    struct UnresponsiveRegistry;

    #[async_trait]
    impl AgentRegistry for UnresponsiveRegistry {
        async fn list_available_names(&self) -> Result<BTreeSet<AgentName>, RegistryError> {
            std::future::pending().await
        }

        async fn list_agents(&self) -> Result<Vec<AgentRecord>, RegistryError> {
            std::future::pending().await
        }

        async fn status(&self, _name: &AgentName) -> Result<AgentStatus, RegistryError> {
            std::future::pending().await
        }

        async fn request_start(&self, _name: &AgentName) -> Result<(), RegistryError> {
            std::future::pending().await
        }

        async fn request_stop(&self, _name: &AgentName) -> Result<(), RegistryError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_registry_falls_back_to_primary() {
        let mailbox = LocalMailbox::default();
        let (mut dispatcher, _inputs, mut events) =
            dispatcher_over(Arc::new(UnresponsiveRegistry), mailbox.clone(), EventEmitter::disabled());

        let started = tokio::time::Instant::now();
        dispatcher.open().await;
        dispatcher.handle_user_line("@bob are you up?").await;

        assert!(started.elapsed() <= Duration::from_secs(10));
        assert_eq!(mailbox.pending(&AgentName::new("assistant")), 1);
        assert_eq!(mailbox.pending(&AgentName::new("bob")), 0);

        dispatcher.handle_user_line("/stop bob").await;
        assert!(started.elapsed() <= Duration::from_secs(15));
        let seen = drain(&mut events);
        assert_eq!(
            seen.last(),
            Some(&SessionEvent::error(
                None,
                "Agent 'bob' not found or not available for management."
            ))
        );
    }
}
