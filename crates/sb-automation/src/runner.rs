//! Action runner
//!
//! Binds one rule's trigger to its ordered executor list. The runner owns
//! the per-entity cooldown ledger: the trigger decides when to fire, the
//! runner decides whether the fire is allowed and dispatches the actions on
//! a worker task so the event pipeline never blocks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use sb_core::{topic_matches, AliasTable, SourceKind, StateObject};

use crate::condition::ConditionSet;
use crate::error::{AutomationError, AutomationResult};
use crate::executor::{build_executors, ActionExecutor, ExecutorContext};
use crate::rule::{AutomationRule, Scalar};
use crate::trigger::{DurationTrigger, EdgeTrigger};

enum TriggerMode {
    Edge(EdgeTrigger),
    Duration(DurationTrigger),
}

/// One rule wired to its trigger and executors.
pub struct ActionRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    name: String,
    source: SourceKind,
    topic: Option<String>,
    cooldown: Option<Duration>,
    trigger: TriggerMode,
    executors: Vec<Box<dyn ActionExecutor>>,
    last_fired: DashMap<String, Instant>,
    in_flight: AtomicUsize,
}

impl ActionRunner {
    /// Build a runner from one rule config.
    pub fn from_rule(
        rule: &AutomationRule,
        index: usize,
        ctx: &ExecutorContext,
    ) -> AutomationResult<Self> {
        let name = rule.display_name(index);
        let executors = build_executors(&rule.then, ctx, &name)?;
        Self::with_executors(rule, index, &ctx.aliases, executors)
    }

    /// Build a runner with pre-built executors. Validation of the trigger
    /// block is identical to [`ActionRunner::from_rule`].
    pub fn with_executors(
        rule: &AutomationRule,
        index: usize,
        aliases: &AliasTable,
        executors: Vec<Box<dyn ActionExecutor>>,
    ) -> AutomationResult<Self> {
        rule.validate(index, aliases)?;
        let name = rule.display_name(index);

        let mut conditions = rule.when.conditions.clone();
        if let Some(alias) = &rule.when.device {
            let entry = aliases
                .get(alias)
                .ok_or_else(|| AutomationError::UnknownAlias {
                    rule: name.clone(),
                    alias: alias.clone(),
                })?;
            // Pin the rule to the aliased device.
            conditions.insert("address".to_string(), Scalar(entry.address.clone()));
        }
        let conditions = ConditionSet::new(&conditions);

        let trigger = match rule.when.duration {
            Some(duration) => TriggerMode::Duration(DurationTrigger::new(conditions, duration)),
            None => TriggerMode::Edge(EdgeTrigger::new(conditions)),
        };

        Ok(Self {
            inner: Arc::new(RunnerInner {
                name,
                source: rule.when.source,
                topic: rule.when.topic.clone(),
                cooldown: rule.cooldown,
                trigger,
                executors,
                last_fired: DashMap::new(),
                in_flight: AtomicUsize::new(0),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The subscription pattern, for MQTT-bound rules.
    pub fn topic(&self) -> Option<&str> {
        self.inner.topic.as_deref()
    }

    /// Whether this runner wants events from the given state object.
    pub fn matches(&self, state: &StateObject) -> bool {
        if state.kind() != self.inner.source {
            return false;
        }
        match &self.inner.topic {
            Some(pattern) => topic_matches(pattern, state.id()),
            None => true,
        }
    }

    /// Feed one event through the trigger. Runs to completion without
    /// suspending; action execution happens on worker tasks.
    pub fn run(&self, state: &Arc<StateObject>) {
        match &self.inner.trigger {
            TriggerMode::Edge(trigger) => {
                if trigger.on_event(state) {
                    RunnerInner::fire(self.inner.clone(), state.clone());
                }
            }
            TriggerMode::Duration(trigger) => {
                let inner = self.inner.clone();
                trigger.on_event(state, move |captured| async move {
                    RunnerInner::fire(inner, captured);
                });
            }
        }
    }

    /// Cancel all pending duration timers.
    pub fn shutdown(&self) {
        if let TriggerMode::Duration(trigger) = &self.inner.trigger {
            trigger.cancel_all();
        }
    }

    /// Number of action batches currently executing.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }
}

impl RunnerInner {
    fn fire(self: Arc<Self>, state: Arc<StateObject>) {
        let now = Instant::now();
        let on_cooldown = self.cooldown.is_some_and(|cooldown| {
            self.last_fired
                .get(state.id())
                .is_some_and(|last| now.duration_since(*last) < cooldown)
        });
        if on_cooldown {
            debug!(rule = %self.name, entity = %state.id(), "On cooldown, skipping");
            return;
        }
        self.last_fired.insert(state.id().to_string(), now);

        debug!(rule = %self.name, entity = %state.id(), "Rule fired, dispatching actions");
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let inner = self;
        tokio::spawn(async move {
            for executor in &inner.executors {
                if let Err(e) = executor.execute(&state).await {
                    warn!(
                        rule = %inner.name,
                        action = executor.kind(),
                        error = %e,
                        "Action failed"
                    );
                }
            }
            inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }
}
