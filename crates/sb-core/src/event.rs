//! Raw events from the two ingest sources
//!
//! A raw event is a source-specific record carrying a stable entity key and
//! a flat attribute map. BLE advertisements are keyed by device address,
//! MQTT messages by the concrete topic they arrived on.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::value::AttrValue;

/// Which source produced an event. Rules select on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    #[serde(rename = "ble-event")]
    BleEvent,
    #[serde(rename = "mqtt-event")]
    MqttEvent,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::BleEvent => write!(f, "ble-event"),
            SourceKind::MqttEvent => write!(f, "mqtt-event"),
        }
    }
}

/// One observed BLE advertisement.
///
/// `data` holds the decoded model attributes (`modelName`, `battery`,
/// `temperature`, ...) as delivered by the radio driver. `address` and
/// `rssi` are promoted into the flat attribute view alongside them.
#[derive(Debug, Clone, PartialEq)]
pub struct BleAdvertisement {
    pub address: String,
    pub rssi: i64,
    pub data: HashMap<String, AttrValue>,
}

impl BleAdvertisement {
    /// Create an advertisement, normalising the address to lowercase
    /// colon-separated hex so it can serve as a stable entity key.
    pub fn new(address: impl Into<String>, rssi: i64, data: HashMap<String, AttrValue>) -> Self {
        Self {
            address: address.into().to_ascii_lowercase(),
            rssi,
            data,
        }
    }

    /// An advertisement with no decoded payload carries no usable state.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn attribute(&self, name: &str) -> Option<AttrValue> {
        match name {
            "address" => Some(AttrValue::Str(self.address.clone())),
            "rssi" => Some(AttrValue::Int(self.rssi)),
            _ => self.data.get(name).cloned(),
        }
    }

    fn attributes(&self) -> HashMap<String, AttrValue> {
        let mut flat = self.data.clone();
        flat.insert("address".to_string(), AttrValue::Str(self.address.clone()));
        flat.insert("rssi".to_string(), AttrValue::Int(self.rssi));
        flat
    }
}

/// One received MQTT message.
///
/// When the payload parses as a JSON object, its top-level keys are promoted
/// into the attribute view next to `topic` and `payload`. The promotion is
/// computed once at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    promoted: HashMap<String, AttrValue>,
}

impl MqttMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        let mut promoted = HashMap::new();
        if let Ok(serde_json::Value::Object(map)) =
            serde_json::from_slice::<serde_json::Value>(&payload)
        {
            for (key, value) in &map {
                if let Some(attr) = AttrValue::from_json(value) {
                    promoted.insert(key.clone(), attr);
                }
            }
        }
        Self {
            topic: topic.into(),
            payload,
            promoted,
        }
    }

    /// The payload as text, replacing invalid UTF-8.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    fn attribute(&self, name: &str) -> Option<AttrValue> {
        match name {
            "topic" => Some(AttrValue::Str(self.topic.clone())),
            "payload" => Some(AttrValue::Str(self.payload_text())),
            _ => self.promoted.get(name).cloned(),
        }
    }

    fn attributes(&self) -> HashMap<String, AttrValue> {
        let mut flat = self.promoted.clone();
        flat.insert("topic".to_string(), AttrValue::Str(self.topic.clone()));
        flat.insert("payload".to_string(), AttrValue::Str(self.payload_text()));
        flat
    }
}

/// A raw event from either source.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    Ble(BleAdvertisement),
    Mqtt(MqttMessage),
}

impl RawEvent {
    /// The stable entity key: device address or concrete topic.
    pub fn key(&self) -> &str {
        match self {
            RawEvent::Ble(adv) => &adv.address,
            RawEvent::Mqtt(msg) => &msg.topic,
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            RawEvent::Ble(_) => SourceKind::BleEvent,
            RawEvent::Mqtt(_) => SourceKind::MqttEvent,
        }
    }

    /// Look up a single attribute without materialising the full map.
    pub fn attribute(&self, name: &str) -> Option<AttrValue> {
        match self {
            RawEvent::Ble(adv) => adv.attribute(name),
            RawEvent::Mqtt(msg) => msg.attribute(name),
        }
    }

    /// The flat attribute map for this event.
    pub fn attributes(&self) -> HashMap<String, AttrValue> {
        match self {
            RawEvent::Ble(adv) => adv.attributes(),
            RawEvent::Mqtt(msg) => msg.attributes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ble() -> BleAdvertisement {
        BleAdvertisement::new(
            "AA:BB:CC:DD:EE:FF",
            -60,
            HashMap::from([
                ("modelName".to_string(), AttrValue::Str("WoSensorTH".into())),
                ("temperature".to_string(), AttrValue::Float(28.5)),
                ("battery".to_string(), AttrValue::Int(90)),
            ]),
        )
    }

    #[test]
    fn test_ble_address_normalised() {
        let adv = sample_ble();
        assert_eq!(adv.address, "aa:bb:cc:dd:ee:ff");
        assert_eq!(RawEvent::Ble(adv).key(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_ble_flat_attributes() {
        let event = RawEvent::Ble(sample_ble());
        assert_eq!(
            event.attribute("address"),
            Some(AttrValue::Str("aa:bb:cc:dd:ee:ff".into()))
        );
        assert_eq!(event.attribute("rssi"), Some(AttrValue::Int(-60)));
        assert_eq!(event.attribute("temperature"), Some(AttrValue::Float(28.5)));
        assert_eq!(event.attribute("missing"), None);

        let flat = event.attributes();
        assert_eq!(flat.len(), 5);
        assert!(flat.contains_key("modelName"));
    }

    #[test]
    fn test_mqtt_json_payload_promotion() {
        let msg = MqttMessage::new("home/sensor", r#"{"temperature": 21.5, "isOn": true}"#);
        let event = RawEvent::Mqtt(msg);
        assert_eq!(event.key(), "home/sensor");
        assert_eq!(event.kind(), SourceKind::MqttEvent);
        assert_eq!(event.attribute("temperature"), Some(AttrValue::Float(21.5)));
        assert_eq!(event.attribute("isOn"), Some(AttrValue::Bool(true)));
        assert_eq!(
            event.attribute("payload"),
            Some(AttrValue::Str(r#"{"temperature": 21.5, "isOn": true}"#.into()))
        );
    }

    #[test]
    fn test_mqtt_non_json_payload() {
        let event = RawEvent::Mqtt(MqttMessage::new("home/door", "open"));
        assert_eq!(event.attribute("payload"), Some(AttrValue::Str("open".into())));
        assert_eq!(event.attribute("topic"), Some(AttrValue::Str("home/door".into())));
        assert_eq!(event.attributes().len(), 2);
    }

    #[test]
    fn test_mqtt_json_array_not_promoted() {
        let event = RawEvent::Mqtt(MqttMessage::new("t", "[1, 2, 3]"));
        assert_eq!(event.attributes().len(), 2);
    }

    #[test]
    fn test_source_kind_tags() {
        let kind: SourceKind = serde_json::from_str("\"ble-event\"").unwrap();
        assert_eq!(kind, SourceKind::BleEvent);
        assert_eq!(SourceKind::MqttEvent.to_string(), "mqtt-event");
    }
}
