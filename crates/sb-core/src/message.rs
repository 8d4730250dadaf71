//! Channel message types between components
//!
//! Sources hand raw events to the pipeline through an mpsc channel, and
//! mqtt_publish actions hand publish requests to the application, which owns
//! the broker client. Components never call back into sources directly.

use tokio::sync::mpsc;

use crate::event::RawEvent;

/// A request to publish one MQTT message, routed through the application.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

/// Sender half used by sources to feed the event pipeline.
pub type EventSender = mpsc::Sender<RawEvent>;

/// Sender half used by mqtt_publish executors.
pub type PublishSender = mpsc::Sender<PublishRequest>;
