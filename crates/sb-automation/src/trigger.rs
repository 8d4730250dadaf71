//! Edge and duration trigger state machines
//!
//! Both variants keep a per-entity ledger of the last condition result.
//! The edge trigger fires on false→true transitions; the duration trigger
//! arms a per-entity timer on that transition and only fires if the
//! conditions stay true until the timer expires.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

use sb_core::StateObject;

use crate::condition::ConditionSet;

/// Fires on each false→true transition of the condition result.
///
/// A newly seen entity starts low, so the first true result fires; with an
/// empty condition set this is the first-seen-per-entity behavior.
pub struct EdgeTrigger {
    conditions: ConditionSet,
    last_results: DashMap<String, bool>,
}

impl EdgeTrigger {
    pub fn new(conditions: ConditionSet) -> Self {
        Self {
            conditions,
            last_results: DashMap::new(),
        }
    }

    /// Evaluate the conditions for this event and report whether the rule
    /// should fire.
    pub fn on_event(&self, state: &StateObject) -> bool {
        let result = self.conditions.evaluate(state);
        let last = self
            .last_results
            .insert(state.id().to_string(), result)
            .unwrap_or(false);
        result && !last
    }
}

/// Fires after the conditions have stayed true for a configured interval.
///
/// Cancellation is made safe against late firing with a per-entity
/// generation token: the timer callback only fires when its token is still
/// the current one for the entity.
pub struct DurationTrigger {
    conditions: ConditionSet,
    duration: Duration,
    last_results: DashMap<String, bool>,
    armed: Arc<DashMap<String, u64>>,
    tasks: Arc<DashMap<String, JoinHandle<()>>>,
    next_generation: AtomicU64,
}

impl DurationTrigger {
    pub fn new(conditions: ConditionSet, duration: Duration) -> Self {
        Self {
            conditions,
            duration,
            last_results: DashMap::new(),
            armed: Arc::new(DashMap::new()),
            tasks: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Evaluate the conditions for this event, arming or cancelling the
    /// entity's timer on transitions. `on_fire` runs when a timer expires
    /// with the conditions still armed, receiving the state captured at
    /// arming time.
    pub fn on_event<F, Fut>(&self, state: &Arc<StateObject>, on_fire: F)
    where
        F: FnOnce(Arc<StateObject>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let result = self.conditions.evaluate(state);
        let last = self
            .last_results
            .insert(state.id().to_string(), result)
            .unwrap_or(false);

        if result && !last {
            self.arm(state.clone(), on_fire);
        } else if !result && last {
            self.cancel(state.id());
        }
    }

    /// Number of currently armed timers.
    pub fn active_timers(&self) -> usize {
        self.armed.len()
    }

    /// Cancel every armed timer. Called on shutdown and reload; a cancelled
    /// timer never fires afterwards.
    pub fn cancel_all(&self) {
        self.armed.clear();
        let entities: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for entity in entities {
            if let Some((_, task)) = self.tasks.remove(&entity) {
                task.abort();
            }
        }
    }

    fn arm<F, Fut>(&self, state: Arc<StateObject>, on_fire: F)
    where
        F: FnOnce(Arc<StateObject>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let entity = state.id().to_string();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        // The token must be current before the task exists so an immediate
        // expiry cannot observe a half-armed timer.
        self.armed.insert(entity.clone(), generation);
        debug!(entity = %entity, duration = ?self.duration, "Timer armed");

        let armed = self.armed.clone();
        let tasks = self.tasks.clone();
        let duration = self.duration;
        let task_entity = entity.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;

            // A cancelled or superseded timer must never fire.
            let current = armed.get(&task_entity).map(|g| *g) == Some(generation);
            if !current {
                debug!(entity = %task_entity, "Timer expired after cancellation, ignoring");
                return;
            }
            armed.remove(&task_entity);
            tasks.remove(&task_entity);

            debug!(entity = %task_entity, "Timer expired, firing");
            on_fire(state).await;
        });

        if let Some(old) = self.tasks.insert(entity, task) {
            old.abort();
        }
    }

    fn cancel(&self, entity: &str) {
        self.armed.remove(entity);
        if let Some((_, task)) = self.tasks.remove(entity) {
            task.abort();
            debug!(entity = %entity, "Timer cancelled");
        }
    }
}
