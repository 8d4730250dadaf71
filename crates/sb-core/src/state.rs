//! The StateObject handed to rule runners
//!
//! A StateObject bundles one event with the flattened view of its immediate
//! predecessor and a point-in-time snapshot of every other known entity.
//! It is created once per dispatch by the automation handler and never
//! mutated afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use crate::device::AliasTable;
use crate::event::{RawEvent, SourceKind};
use crate::value::AttrValue;

/// A read-consistent view over the state store at dispatch time.
///
/// The view is taken after the triggering event has been stored, so it
/// contains an entry for the triggering key as well; an alias that resolves
/// to the triggering entity therefore observes the triggering event itself.
pub type StoreView = Arc<HashMap<String, Arc<RawEvent>>>;

/// Immutable bundle of {triggering event, previous event, snapshot}.
///
/// Cross-device lookups go through the configured alias table: the snapshot
/// is addressable only by alias name, never by raw entity key.
#[derive(Debug, Clone)]
pub struct StateObject {
    kind: SourceKind,
    id: String,
    attributes: HashMap<String, AttrValue>,
    previous: Option<HashMap<String, AttrValue>>,
    snapshot: StoreView,
    aliases: Arc<AliasTable>,
}

impl StateObject {
    pub fn new(
        current: &RawEvent,
        previous: Option<&RawEvent>,
        snapshot: StoreView,
        aliases: Arc<AliasTable>,
    ) -> Self {
        Self {
            kind: current.kind(),
            id: current.key().to_string(),
            attributes: current.attributes(),
            previous: previous.map(|event| event.attributes()),
            snapshot,
            aliases,
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// The entity key of the triggering event.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// An attribute of the triggering event.
    pub fn attribute(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name)
    }

    /// The flat attribute map of the triggering event.
    pub fn attributes(&self) -> &HashMap<String, AttrValue> {
        &self.attributes
    }

    /// An attribute of the last event seen for the same key, if any.
    pub fn previous_attribute(&self, name: &str) -> Option<&AttrValue> {
        self.previous.as_ref().and_then(|attrs| attrs.get(name))
    }

    pub fn has_previous(&self) -> bool {
        self.previous.is_some()
    }

    /// Whether `name` is a configured device alias.
    pub fn has_alias(&self, name: &str) -> bool {
        self.aliases.contains_key(name)
    }

    /// The entity key a configured alias resolves to.
    pub fn alias_id(&self, alias: &str) -> Option<&str> {
        self.aliases.get(alias).map(|entry| entry.address.as_str())
    }

    /// An attribute of another entity, addressed by configured alias.
    ///
    /// Returns `None` when the alias is unknown, the aliased entity has not
    /// been observed yet, or the attribute is missing on its latest event.
    pub fn alias_attribute(&self, alias: &str, name: &str) -> Option<AttrValue> {
        let entry = self.aliases.get(alias)?;
        let event = self.snapshot.get(&entry.address)?;
        event.attribute(name)
    }
}
