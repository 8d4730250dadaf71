//! Event routing
//!
//! The handler owns the runner set, the state store, and the alias table.
//! For every raw event it atomically swaps the stored predecessor, takes a
//! snapshot, wraps the three into a StateObject, and feeds it to every
//! runner whose source (and, for MQTT, topic pattern) matches.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use sb_core::{AliasTable, RawEvent, StateObject};
use sb_store::SharedStateStore;

use crate::error::AutomationResult;
use crate::executor::ExecutorContext;
use crate::rule::AutomationRule;
use crate::runner::ActionRunner;

const EXECUTOR_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AutomationHandler {
    store: SharedStateStore,
    aliases: Arc<AliasTable>,
    runners: Vec<ActionRunner>,
}

impl AutomationHandler {
    /// Build runners for every configured rule.
    pub fn new(
        rules: &[AutomationRule],
        store: SharedStateStore,
        aliases: Arc<AliasTable>,
        ctx: &ExecutorContext,
    ) -> AutomationResult<Self> {
        let runners = rules
            .iter()
            .enumerate()
            .map(|(index, rule)| ActionRunner::from_rule(rule, index, ctx))
            .collect::<AutomationResult<Vec<_>>>()?;

        info!("Automation handler initialized with {} rule(s)", runners.len());
        Ok(Self {
            store,
            aliases,
            runners,
        })
    }

    /// Build a handler around pre-built runners.
    pub fn with_runners(
        runners: Vec<ActionRunner>,
        store: SharedStateStore,
        aliases: Arc<AliasTable>,
    ) -> Self {
        Self {
            store,
            aliases,
            runners,
        }
    }

    /// Route one raw event through the store and the matching runners.
    ///
    /// Per entity key this runs in arrival order on the pipeline task; the
    /// snapshot is taken after the event is stored, so it includes the
    /// triggering event itself.
    pub fn handle_event(&self, event: RawEvent) {
        let key = event.key().to_string();
        let current = Arc::new(event);
        let previous = self.store.get_and_update(&key, current.clone());
        let snapshot = self.store.snapshot();

        let state = Arc::new(StateObject::new(
            &current,
            previous.as_deref(),
            snapshot,
            self.aliases.clone(),
        ));

        debug!(key = %key, kind = %state.kind(), "Dispatching event");
        for runner in &self.runners {
            if runner.matches(&state) {
                runner.run(&state);
            }
        }
    }

    /// Union of the topic patterns the MQTT-bound rules subscribe to.
    pub fn subscription_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .runners
            .iter()
            .filter_map(|runner| runner.topic().map(str::to_string))
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    pub fn runner_count(&self) -> usize {
        self.runners.len()
    }

    /// Cancel all pending timers and wait (bounded) for in-flight actions.
    pub async fn stop(&self) {
        for runner in &self.runners {
            runner.shutdown();
        }

        let deadline = tokio::time::Instant::now() + EXECUTOR_DRAIN_TIMEOUT;
        loop {
            let in_flight: usize = self.runners.iter().map(ActionRunner::in_flight).sum();
            if in_flight == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                debug!(in_flight, "Giving up waiting for in-flight actions");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_core::{AttrValue, BleAdvertisement, MqttMessage};
    use sb_store::StateStore;
    use std::collections::HashMap;

    fn handler_with_no_rules() -> AutomationHandler {
        AutomationHandler::with_runners(
            Vec::new(),
            Arc::new(StateStore::new()),
            Arc::new(HashMap::new()),
        )
    }

    #[tokio::test]
    async fn test_store_tracks_latest_event() {
        let store = Arc::new(StateStore::new());
        let handler = AutomationHandler::with_runners(
            Vec::new(),
            store.clone(),
            Arc::new(HashMap::new()),
        );

        handler.handle_event(RawEvent::Ble(BleAdvertisement::new(
            "aa:aa",
            -50,
            HashMap::from([("temperature".to_string(), AttrValue::Float(20.0))]),
        )));
        handler.handle_event(RawEvent::Ble(BleAdvertisement::new(
            "aa:aa",
            -50,
            HashMap::from([("temperature".to_string(), AttrValue::Float(21.0))]),
        )));

        let stored = store.get("aa:aa").unwrap();
        assert_eq!(stored.attribute("temperature"), Some(AttrValue::Float(21.0)));
    }

    #[tokio::test]
    async fn test_mqtt_key_is_concrete_topic() {
        let store = Arc::new(StateStore::new());
        let handler = AutomationHandler::with_runners(
            Vec::new(),
            store.clone(),
            Arc::new(HashMap::new()),
        );

        handler.handle_event(RawEvent::Mqtt(MqttMessage::new("home/living/temp", "21")));
        assert!(store.get("home/living/temp").is_some());
        assert!(store.get("home/+/temp").is_none());
    }

    #[tokio::test]
    async fn test_stop_with_no_rules() {
        handler_with_no_rules().stop().await;
    }
}
