//! Routing decisions for user lines and nested agent replies.
//!
//! Pure functions over a registry snapshot and the current lock; this module
//! is shared by the dispatcher and the routing preview endpoint so both
//! always agree.

use serde::{Deserialize, Serialize};

use crate::{
    mention::{self, Mention},
    registry::RegistrySnapshot,
    types::AgentName,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RoutingDecision {
    /// The line opened with a mention of the primary; only the primary
    /// receives it and any later mentions stay in the text for it.
    Delegation { to: AgentName },
    /// Two or more non-primary agents, in first-mention order.
    ParallelBroadcast { targets: Vec<AgentName> },
    SingleLock { target: AgentName },
    /// No valid mention: the locked agent, or the primary when unlocked.
    DefaultRoute { target: AgentName },
}

impl RoutingDecision {
    pub fn targets(&self) -> Vec<AgentName> {
        match self {
            Self::Delegation { to } => vec![to.clone()],
            Self::ParallelBroadcast { targets } => targets.clone(),
            Self::SingleLock { target } | Self::DefaultRoute { target } => vec![target.clone()],
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Self::Delegation { .. } => "delegation",
            Self::ParallelBroadcast { .. } => "parallel_broadcast",
            Self::SingleLock { .. } => "single_lock",
            Self::DefaultRoute { .. } => "default_route",
        }
    }
}

/// Mentions that name a registered agent, de-duplicated in first-occurrence
/// order. The primary is no exception: a registry that does not list it
/// makes `@primary` an ordinary unknown mention.
pub fn valid_targets(mentions: &[Mention], snapshot: &RegistrySnapshot) -> Vec<AgentName> {
    mention::unique_names(mentions)
        .into_iter()
        .filter(|name| snapshot.contains(name))
        .collect()
}

/// Where un-annotated lines go. A lock on an agent that has since left the
/// registry falls back to the primary, which is the one target that does
/// not need to be registered.
pub fn default_target(
    snapshot: &RegistrySnapshot,
    lock: Option<&AgentName>,
    primary: &AgentName,
) -> AgentName {
    match lock {
        Some(locked) if snapshot.contains(locked) => locked.clone(),
        _ => primary.clone(),
    }
}

pub fn resolve(
    mentions: &[Mention],
    snapshot: &RegistrySnapshot,
    lock: Option<&AgentName>,
    primary: &AgentName,
) -> RoutingDecision {
    let valid = valid_targets(mentions, snapshot);

    let decision = match valid.as_slice() {
        [] => RoutingDecision::DefaultRoute {
            target: default_target(snapshot, lock, primary),
        },
        [first, ..] if first == primary => RoutingDecision::Delegation {
            to: primary.clone(),
        },
        [only] => RoutingDecision::SingleLock {
            target: only.clone(),
        },
        _ => RoutingDecision::ParallelBroadcast {
            targets: valid.clone(),
        },
    };

    tracing::debug!(
        target = "router::routing",
        mode = decision.mode(),
        targets = ?decision.targets(),
        mentions = mentions.len(),
        "resolved routing decision"
    );
    decision
}

/// A routing decision together with the text each target receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundPlan {
    pub decision: RoutingDecision,
    /// Text forwarded to every target.
    pub text: String,
    /// Mentioned names that matched no agent.
    pub ignored: Vec<AgentName>,
}

/// Resolves one user-authored line and prepares the forwarded text:
/// a delegation drops only the leading primary mention, a lock or broadcast
/// drops every valid mention, and a default route forwards the line as is.
pub fn plan_outbound(
    text: &str,
    snapshot: &RegistrySnapshot,
    lock: Option<&AgentName>,
    primary: &AgentName,
) -> OutboundPlan {
    let mentions = mention::extract(text);
    let decision = resolve(&mentions, snapshot, lock, primary);
    let valid = valid_targets(&mentions, snapshot);
    let ignored = mention::unique_names(&mentions)
        .into_iter()
        .filter(|name| !valid.contains(name))
        .collect();

    let forwarded = match &decision {
        RoutingDecision::Delegation { to } => mention::strip_first(text, to),
        RoutingDecision::ParallelBroadcast { .. } | RoutingDecision::SingleLock { .. } => {
            mention::strip_mentions(text, &valid)
        }
        RoutingDecision::DefaultRoute { .. } => text.trim().to_string(),
    };

    OutboundPlan {
        decision,
        text: forwarded,
        ignored,
    }
}

/// Fan-out of an agent reply that mentions other agents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestedPlan {
    pub deliveries: Vec<(AgentName, String)>,
}

impl NestedPlan {
    pub fn targets(&self) -> Vec<AgentName> {
        self.deliveries.iter().map(|(name, _)| name.clone()).collect()
    }
}

/// Plans the re-dispatch of an agent reply. Mentions of the sender itself
/// are ignored. Returns `None` when the reply names no other agent.
pub fn plan_nested(
    sender: &AgentName,
    text: &str,
    snapshot: &RegistrySnapshot,
) -> Option<NestedPlan> {
    let mentions = mention::extract(text);
    let targets: Vec<AgentName> = valid_targets(&mentions, snapshot)
        .into_iter()
        .filter(|name| name != sender)
        .collect();
    if targets.is_empty() {
        return None;
    }

    tracing::debug!(
        target = "router::routing",
        from = %sender,
        targets = ?targets,
        "planned nested dispatch"
    );
    Some(NestedPlan {
        deliveries: mention::split_by_target(text, &targets),
    })
}

#[cfg(test)]
mod tests {
    use super::{plan_nested, plan_outbound, resolve, RoutingDecision};
    use crate::{
        mention::extract,
        registry::{AgentRecord, RegistrySnapshot},
        types::{AgentName, AgentStatus},
    };

    fn primary() -> AgentName {
        AgentName::new("assistant")
    }

    fn snapshot(names: &[&str]) -> RegistrySnapshot {
        RegistrySnapshot::from_records(names.iter().map(|n| AgentRecord {
            name: AgentName::new(*n),
            status: AgentStatus::Running,
            never_started: false,
        }))
    }

    fn decide(text: &str, lock: Option<&str>) -> RoutingDecision {
        let lock = lock.map(AgentName::new);
        resolve(
            &extract(text),
            &snapshot(&["assistant", "x", "y", "bob"]),
            lock.as_ref(),
            &primary(),
        )
    }

    #[test]
    fn no_mention_routes_to_primary_when_unlocked() {
        assert_eq!(
            decide("hello there", None),
            RoutingDecision::DefaultRoute { target: primary() }
        );
    }

    #[test]
    fn no_mention_routes_to_lock_holder() {
        assert_eq!(
            decide("hello there", Some("x")),
            RoutingDecision::DefaultRoute {
                target: AgentName::new("x")
            }
        );
    }

    #[test]
    fn lock_on_departed_agent_falls_back_to_primary() {
        assert_eq!(
            decide("hello", Some("gone")),
            RoutingDecision::DefaultRoute { target: primary() }
        );
    }

    #[test]
    fn primary_first_is_delegation() {
        assert_eq!(
            decide("@assistant ask @x about it", Some("y")),
            RoutingDecision::Delegation { to: primary() }
        );
    }

    #[test]
    fn two_agents_broadcast_in_mention_order() {
        assert_eq!(
            decide("@y @x hello", None),
            RoutingDecision::ParallelBroadcast {
                targets: vec![AgentName::new("y"), AgentName::new("x")]
            }
        );
    }

    #[test]
    fn repeated_single_agent_is_a_lock() {
        assert_eq!(
            decide("@x hello @X again", None),
            RoutingDecision::SingleLock {
                target: AgentName::new("x")
            }
        );
    }

    #[test]
    fn primary_not_first_joins_broadcast() {
        assert_eq!(
            decide("@x and @assistant", None),
            RoutingDecision::ParallelBroadcast {
                targets: vec![AgentName::new("x"), primary()]
            }
        );
    }

    #[test]
    fn unregistered_primary_is_an_unknown_mention() {
        let registry = snapshot(&["x", "y"]);
        let route = |text: &str, lock: Option<&str>| {
            let lock = lock.map(AgentName::new);
            resolve(&extract(text), &registry, lock.as_ref(), &primary())
        };

        assert_eq!(
            route("@x @assistant sync", None),
            RoutingDecision::SingleLock {
                target: AgentName::new("x")
            }
        );
        assert_eq!(
            route("@assistant ask @y", None),
            RoutingDecision::SingleLock {
                target: AgentName::new("y")
            }
        );
        // Unaddressed lines still reach it.
        assert_eq!(
            route("@assistant hi", None),
            RoutingDecision::DefaultRoute { target: primary() }
        );

        let plan = plan_outbound("@x @assistant sync", &registry, None, &primary());
        assert_eq!(plan.ignored, vec![primary()]);
        assert!(plan_nested(&AgentName::new("x"), "over to @assistant", &registry).is_none());
    }

    #[test]
    fn unknown_mentions_are_ignored() {
        assert_eq!(
            decide("@zzz hello", Some("bob")),
            RoutingDecision::DefaultRoute {
                target: AgentName::new("bob")
            }
        );
        assert_eq!(
            decide("@zzz @x hello", None),
            RoutingDecision::SingleLock {
                target: AgentName::new("x")
            }
        );
    }

    #[test]
    fn email_domain_is_not_routed() {
        assert_eq!(
            decide("mail it to someone@x.com", None),
            RoutingDecision::DefaultRoute { target: primary() }
        );
    }

    #[test]
    fn resolution_is_repeatable() {
        let first = decide("@x @y @zzz hi", Some("bob"));
        let second = decide("@x @y @zzz hi", Some("bob"));
        assert_eq!(first, second);
    }

    #[test]
    fn decision_serializes_with_mode_tag() {
        let decision = RoutingDecision::SingleLock {
            target: AgentName::new("x"),
        };
        let value = serde_json::to_value(&decision).expect("serialize");
        assert_eq!(value, serde_json::json!({"mode": "single_lock", "target": "x"}));
    }

    #[test]
    fn outbound_text_is_cleaned_per_mode() {
        let registry = snapshot(&["assistant", "x", "y"]);

        let plan = plan_outbound("@assistant ask @x to help", &registry, None, &primary());
        assert_eq!(plan.text, "ask @x to help");

        let plan = plan_outbound("hey @x @y do something", &registry, None, &primary());
        assert_eq!(plan.text, "hey do something");

        let plan = plan_outbound("@x summarize @zzz", &registry, None, &primary());
        assert_eq!(plan.text, "summarize @zzz");
        assert_eq!(plan.ignored, vec![AgentName::new("zzz")]);

        let plan = plan_outbound("  just chatting ", &registry, None, &primary());
        assert_eq!(plan.text, "just chatting");
    }

    #[test]
    fn nested_plan_skips_sender_and_unknown_names() {
        let registry = snapshot(&["assistant", "x", "y"]);
        assert!(plan_nested(&AgentName::new("x"), "note to @x and @zzz", &registry).is_none());

        let plan = plan_nested(
            &primary(),
            "Here is the plan.\n@x draft it\n@y review it",
            &registry,
        )
        .expect("nested plan");
        assert_eq!(plan.targets(), vec![AgentName::new("x"), AgentName::new("y")]);
        assert_eq!(plan.deliveries[0].1, "Here is the plan.\ndraft it");
        assert_eq!(plan.deliveries[1].1, "Here is the plan.\nreview it");
    }
}
