//! Core types for the switchbot-actions automation engine
//!
//! This crate defines the vocabulary shared by every other crate: attribute
//! values, raw events from the two sources, the immutable StateObject handed
//! to rule runners, the device alias table, and the component lifecycle
//! contract the server supervises.

pub mod component;
pub mod device;
pub mod event;
pub mod message;
pub mod state;
pub mod topic;
pub mod value;

pub use component::Component;
pub use device::{alias_for_address, AliasTable, DeviceCommandError, DeviceController, DeviceEntry};
pub use event::{BleAdvertisement, MqttMessage, RawEvent, SourceKind};
pub use message::{EventSender, PublishRequest, PublishSender};
pub use state::{StateObject, StoreView};
pub use topic::topic_matches;
pub use value::AttrValue;
