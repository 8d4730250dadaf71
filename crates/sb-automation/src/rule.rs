//! Rule configuration model
//!
//! An automation rule binds one trigger block (`if`) to one or more action
//! configs (`then`). Rules with a `duration` are sustained (duration
//! trigger); all others are edge triggered.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use sb_core::{AliasTable, SourceKind};

use crate::error::{AutomationError, AutomationResult};

/// One automation rule as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRule {
    /// Optional label used in logs; unnamed rules get an index-based one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Minimum time between fires per entity.
    #[serde(default, with = "opt_duration_serde", skip_serializing_if = "Option::is_none")]
    pub cooldown: Option<Duration>,

    /// The trigger block.
    #[serde(rename = "if")]
    pub when: TriggerSpec,

    /// Actions executed in order when the rule fires.
    #[serde(deserialize_with = "one_or_many")]
    pub then: Vec<ActionConfig>,
}

impl AutomationRule {
    /// Label for logs and error messages.
    pub fn display_name(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("automation #{}", index))
    }

    /// Structural validation of one rule against the alias table.
    ///
    /// Runs at load and reload, before any component is built, and again
    /// when runners are constructed.
    pub fn validate(&self, index: usize, aliases: &AliasTable) -> AutomationResult<()> {
        let name = self.display_name(index);
        let invalid = |reason: String| AutomationError::InvalidRule {
            rule: name.clone(),
            reason,
        };

        match self.when.source {
            SourceKind::MqttEvent => {
                if self.when.topic.is_none() {
                    return Err(invalid("mqtt-event rules require 'topic'".to_string()));
                }
            }
            SourceKind::BleEvent => {
                if self.when.topic.is_some() {
                    return Err(invalid(
                        "'topic' is only valid for mqtt-event rules".to_string(),
                    ));
                }
            }
        }

        if let Some(duration) = self.when.duration {
            if duration.is_zero() {
                return Err(invalid("duration must be greater than zero".to_string()));
            }
        }

        if let Some(alias) = &self.when.device {
            if !aliases.contains_key(alias) {
                return Err(AutomationError::UnknownAlias {
                    rule: name.clone(),
                    alias: alias.clone(),
                });
            }
        }

        if self.then.is_empty() {
            return Err(invalid("rule has no actions".to_string()));
        }
        for action in &self.then {
            validate_action(action, &name, aliases)?;
        }
        Ok(())
    }
}

fn validate_action(action: &ActionConfig, rule: &str, aliases: &AliasTable) -> AutomationResult<()> {
    let invalid = |reason: String| AutomationError::InvalidAction {
        rule: rule.to_string(),
        reason,
    };

    match action {
        ActionConfig::Log { .. } => Ok(()),

        ActionConfig::Shell { command } => {
            if command.is_empty() {
                return Err(invalid("shell command must not be empty".to_string()));
            }
            Ok(())
        }

        ActionConfig::Webhook {
            method, payload, ..
        } => {
            if *method == HttpMethod::Get {
                if let Some(serde_json::Value::Object(map)) = payload {
                    if map.values().any(|v| v.is_array() || v.is_object()) {
                        return Err(invalid(
                            "GET webhook payloads must map to scalar query values".to_string(),
                        ));
                    }
                }
            }
            Ok(())
        }

        ActionConfig::MqttPublish { qos, .. } => {
            if *qos > 2 {
                return Err(invalid(format!("invalid QoS {}, must be 0, 1, or 2", qos)));
            }
            Ok(())
        }

        ActionConfig::DeviceCommand {
            device, address, ..
        } => {
            match (device, address) {
                (Some(alias), None) => {
                    if !aliases.contains_key(alias) {
                        return Err(AutomationError::UnknownAlias {
                            rule: rule.to_string(),
                            alias: alias.clone(),
                        });
                    }
                }
                (None, Some(_)) => {}
                _ => {
                    return Err(invalid(
                        "device_command requires exactly one of 'device' or 'address'".to_string(),
                    ))
                }
            }
            Ok(())
        }
    }
}

/// The `if` block of a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub source: SourceKind,

    /// Subscription pattern; required for MQTT sources, forbidden otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    /// Device alias; injects that device's address into the conditions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Present on duration-sustained rules, absent on edge-triggered ones.
    #[serde(default, with = "opt_duration_serde", skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,

    /// Flat map of attribute reference -> "operator value".
    #[serde(default)]
    pub conditions: HashMap<String, Scalar>,
}

/// A YAML scalar canonicalised to its string form.
///
/// Condition values and device-command parameters may be written as bare
/// booleans or numbers; the evaluator and formatter operate on their
/// literal text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Scalar(pub String);

impl Scalar {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar(s.to_string())
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ScalarVisitor;

        impl serde::de::Visitor<'_> for ScalarVisitor {
            type Value = Scalar;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a boolean, number, or string")
            }

            fn visit_bool<E: serde::de::Error>(self, v: bool) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }

            fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }
        }

        deserializer.deserialize_any(ScalarVisitor)
    }
}

/// One action config, dispatched on its `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionConfig {
    Log {
        #[serde(default)]
        level: LogLevel,
        message: String,
    },
    Shell {
        /// Argv vector: program first, arguments after, no shell involved.
        command: Vec<String>,
    },
    Webhook {
        url: String,
        #[serde(default)]
        method: HttpMethod,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    MqttPublish {
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(default)]
        qos: u8,
        #[serde(default)]
        retain: bool,
    },
    DeviceCommand {
        /// Target by configured alias. Mutually exclusive with `address`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device: Option<String>,
        /// Target by explicit address. Mutually exclusive with `device`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
        command: String,
        #[serde(default)]
        params: HashMap<String, Scalar>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Post,
    Get,
}

/// Parse a duration string.
///
/// Accepts plain seconds (`600`), suffixed components (`90s`, `10m`,
/// `1h30m`, `500ms`), and clock form (`HH:MM:SS` or `MM:SS`).
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty duration".to_string());
    }

    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    if text.contains(':') {
        return parse_clock(text);
    }

    parse_suffixed(text)
}

fn parse_clock(text: &str) -> Result<Duration, String> {
    let parts: Vec<&str> = text.split(':').collect();
    let parse_part = |p: &str| -> Result<u64, String> {
        p.parse::<u64>()
            .map_err(|_| format!("invalid duration component '{}'", p))
    };
    match parts.as_slice() {
        [mins, secs] => Ok(Duration::from_secs(parse_part(mins)? * 60 + parse_part(secs)?)),
        [hours, mins, secs] => Ok(Duration::from_secs(
            parse_part(hours)? * 3600 + parse_part(mins)? * 60 + parse_part(secs)?,
        )),
        _ => Err(format!("invalid duration '{}'", text)),
    }
}

fn parse_suffixed(text: &str) -> Result<Duration, String> {
    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in duration '{}'", text))?;
        if digits_end == 0 {
            return Err(format!("invalid duration '{}'", text));
        }
        let value: u64 = rest[..digits_end]
            .parse()
            .map_err(|_| format!("invalid duration '{}'", text))?;
        let unit_end = rest[digits_end..]
            .find(|c: char| c.is_ascii_digit())
            .map(|i| digits_end + i)
            .unwrap_or(rest.len());
        let unit = &rest[digits_end..unit_end];
        total += match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            "d" => Duration::from_secs(value * 86400),
            other => return Err(format!("unknown duration unit '{}'", other)),
        };
        rest = &rest[unit_end..];
    }
    Ok(total)
}

pub(crate) mod opt_duration_serde {
    use super::parse_duration;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_str(&format!("{}s", d.as_secs())),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Seconds(u64),
            Text(String),
        }

        let repr: Option<Repr> = Option::deserialize(deserializer)?;
        match repr {
            None => Ok(None),
            Some(Repr::Seconds(s)) => Ok(Some(Duration::from_secs(s))),
            Some(Repr::Text(text)) => parse_duration(&text)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<ActionConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(Box<ActionConfig>),
        Many(Vec<ActionConfig>),
    }

    match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(action) => Ok(vec![*action]),
        OneOrMany::Many(actions) => Ok(actions),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("600").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("01:30").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1:00:00").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("abc").is_err());
    }

    #[test]
    fn test_rule_deserialize_full() {
        let rule: AutomationRule = serde_yaml::from_str(
            r#"
name: hot alert
cooldown: 10m
if:
  source: ble-event
  conditions:
    modelName: WoSensorTH
    temperature: "> 28.0"
then:
  - type: webhook
    url: https://x/alert
    payload:
      message: "hot: {temperature}"
"#,
        )
        .unwrap();

        assert_eq!(rule.name.as_deref(), Some("hot alert"));
        assert_eq!(rule.cooldown, Some(Duration::from_secs(600)));
        assert_eq!(rule.when.source, SourceKind::BleEvent);
        assert!(rule.when.duration.is_none());
        assert_eq!(
            rule.when.conditions.get("temperature"),
            Some(&Scalar("> 28.0".to_string()))
        );
        assert_eq!(rule.then.len(), 1);
    }

    #[test]
    fn test_scalar_conditions_from_yaml_scalars() {
        let rule: AutomationRule = serde_yaml::from_str(
            r#"
if:
  source: ble-event
  duration: 5m
  conditions:
    motion_detected: false
    button_count: 3
then:
  type: log
  message: quiet
"#,
        )
        .unwrap();

        assert_eq!(rule.when.duration, Some(Duration::from_secs(300)));
        assert_eq!(
            rule.when.conditions.get("motion_detected"),
            Some(&Scalar("false".to_string()))
        );
        assert_eq!(
            rule.when.conditions.get("button_count"),
            Some(&Scalar("3".to_string()))
        );
        // single action accepted without a list
        assert_eq!(rule.then.len(), 1);
        assert!(matches!(rule.then[0], ActionConfig::Log { .. }));
    }

    #[test]
    fn test_action_defaults() {
        let action: ActionConfig = serde_yaml::from_str(
            r#"
type: mqtt_publish
topic: home/alert
"#,
        )
        .unwrap();
        match action {
            ActionConfig::MqttPublish {
                qos,
                retain,
                payload,
                ..
            } => {
                assert_eq!(qos, 0);
                assert!(!retain);
                assert!(payload.is_none());
            }
            other => panic!("unexpected action: {:?}", other),
        }

        let action: ActionConfig = serde_yaml::from_str(
            r#"
type: webhook
url: https://x
"#,
        )
        .unwrap();
        match action {
            ActionConfig::Webhook { method, .. } => assert_eq!(method, HttpMethod::Post),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_source_rejected() {
        let result: Result<AutomationRule, _> = serde_yaml::from_str(
            r#"
if:
  source: zigbee-event
  conditions: {}
then:
  - type: log
    message: hi
"#,
        );
        assert!(result.is_err());
    }

    fn rule(yaml: &str) -> AutomationRule {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_validate_qos() {
        let bad = rule(
            r#"
if:
  source: ble-event
then:
  - type: mqtt_publish
    topic: t
    qos: 3
"#,
        );
        assert!(bad.validate(0, &AliasTable::new()).is_err());

        let ok = rule(
            r#"
if:
  source: ble-event
then:
  - type: mqtt_publish
    topic: t
    qos: 2
"#,
        );
        assert!(ok.validate(0, &AliasTable::new()).is_ok());
    }

    #[test]
    fn test_validate_get_payload_must_be_flat() {
        let nested = rule(
            r#"
if:
  source: ble-event
then:
  - type: webhook
    url: https://x
    method: GET
    payload:
      values: [1, 2]
"#,
        );
        assert!(nested.validate(0, &AliasTable::new()).is_err());

        let flat = rule(
            r#"
if:
  source: ble-event
then:
  - type: webhook
    url: https://x
    method: GET
    payload:
      message: ok
"#,
        );
        assert!(flat.validate(0, &AliasTable::new()).is_ok());
    }

    #[test]
    fn test_validate_empty_shell_command() {
        let bad = rule(
            r#"
if:
  source: ble-event
then:
  - type: shell
    command: []
"#,
        );
        assert!(bad.validate(0, &AliasTable::new()).is_err());
    }

    #[test]
    fn test_validate_device_command_target() {
        let by_address = rule(
            r#"
if:
  source: ble-event
then:
  - type: device_command
    address: "aa:bb"
    command: turn_on
"#,
        );
        assert!(by_address.validate(0, &AliasTable::new()).is_ok());

        let by_unknown_alias = rule(
            r#"
if:
  source: ble-event
then:
  - type: device_command
    device: ghost
    command: turn_on
"#,
        );
        assert!(matches!(
            by_unknown_alias.validate(0, &AliasTable::new()),
            Err(AutomationError::UnknownAlias { .. })
        ));
    }

    #[test]
    fn test_display_name() {
        let rule: AutomationRule = serde_yaml::from_str(
            r#"
if:
  source: ble-event
then:
  - type: log
    message: hi
"#,
        )
        .unwrap();
        assert_eq!(rule.display_name(3), "automation #3");
    }
}
