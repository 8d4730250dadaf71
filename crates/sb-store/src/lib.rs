//! Last-known state storage for observed entities
//!
//! This crate provides the StateStore, which tracks the latest raw event
//! seen for every entity key. It supports the atomic swap the automation
//! handler needs to recover an event's predecessor, and point-in-time
//! snapshots for cross-device condition evaluation.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use sb_core::{RawEvent, StoreView};

/// The state store tracks the latest raw event per entity key.
///
/// Concurrent readers and writers are safe; readers never observe torn
/// writes. Events are shared as `Arc` so a snapshot is a shallow copy.
#[derive(Default)]
pub struct StateStore {
    states: DashMap<String, Arc<RawEvent>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
        }
    }

    /// Atomically replace the stored event for `key` and return the prior
    /// one, or `None` when the key has not been seen before.
    pub fn get_and_update(&self, key: &str, event: Arc<RawEvent>) -> Option<Arc<RawEvent>> {
        let previous = self.states.insert(key.to_string(), event);
        debug!(key, replaced = previous.is_some(), "State updated");
        previous
    }

    /// The latest event stored for `key`.
    pub fn get(&self, key: &str) -> Option<Arc<RawEvent>> {
        self.states.get(key).map(|entry| entry.value().clone())
    }

    /// A consistent point-in-time copy of the whole store.
    ///
    /// The returned view is immutable: writes that happen after the call do
    /// not show through it.
    pub fn snapshot(&self) -> StoreView {
        Arc::new(
            self.states
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect::<HashMap<_, _>>(),
        )
    }

    pub fn entity_count(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Thread-safe wrapper for StateStore
pub type SharedStateStore = Arc<StateStore>;
