//! Settings model and the defaults → file → CLI merge

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

use sb_automation::AutomationRule;
use sb_core::AliasTable;

use crate::error::{ConfigError, ConfigResult};

/// Attribute names commonly produced by the sources. An alias that shadows
/// one of these can never be referenced by a bare placeholder, because
/// triggering attributes win; flag it at load time.
const COMMON_ATTRIBUTES: [&str; 14] = [
    "address",
    "rssi",
    "modelName",
    "battery",
    "temperature",
    "humidity",
    "isOn",
    "contact_open",
    "motion_detected",
    "button_count",
    "position",
    "in_motion",
    "is_light",
    "topic",
];

/// The full application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub scanner: ScannerSettings,
    pub mqtt: Option<MqttSettings>,
    #[serde(alias = "prometheus")]
    pub prometheus_exporter: PrometheusSettings,
    pub logging: LoggingSettings,
    pub devices: AliasTable,
    pub automations: Vec<AutomationRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScannerSettings {
    pub enabled: bool,
    /// Seconds between scan cycle starts.
    pub cycle: u64,
    /// Seconds spent actively scanning per cycle. Must not exceed `cycle`.
    pub duration: u64,
    /// Bluetooth adapter number (0 for hci0).
    pub interface: u16,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cycle: 10,
            duration: 3,
            interface: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Seconds to wait before reconnecting after a broker error.
    pub reconnect_interval: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            reconnect_interval: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrometheusSettings {
    pub enabled: bool,
    pub port: u16,
    pub target: TargetFilter,
}

impl Default for PrometheusSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8000,
            target: TargetFilter::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetFilter {
    /// Allow-list of device addresses to export.
    pub addresses: Option<Vec<String>>,
    /// Allow-list of metric (attribute) names to export.
    pub metrics: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    pub level: String,
    /// Per-target level overrides, merged into the filter
    /// (e.g. `rumqttc: warn` to quiet a chatty dependency).
    pub loggers: HashMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            loggers: HashMap::new(),
        }
    }
}

/// Command-line overrides, applied on top of the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub debug: bool,
    pub log_level: Option<String>,
    pub scanner_cycle: Option<u64>,
    pub scanner_duration: Option<u64>,
    pub scanner_interface: Option<u16>,
    pub mqtt_enabled: Option<bool>,
    pub mqtt_host: Option<String>,
    pub mqtt_port: Option<u16>,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_reconnect_interval: Option<u64>,
    pub exporter_enabled: Option<bool>,
    pub exporter_port: Option<u16>,
}

impl Settings {
    /// Load settings from a YAML file. A missing file is not an error: the
    /// defaults apply, matching first-run behavior.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Settings> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Settings::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;

        // An empty or comment-only file parses as null: use the defaults.
        let settings: Option<Settings> =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::ParseYaml {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(settings.unwrap_or_default())
    }

    /// Load, merge CLI overrides, and validate: the one entry point used by
    /// both startup and reload.
    pub fn load_with_overrides(
        path: impl AsRef<Path>,
        overrides: &Overrides,
    ) -> ConfigResult<Settings> {
        let mut settings = Settings::load(path)?;
        settings.apply_overrides(overrides);
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(level) = &overrides.log_level {
            self.logging.level = level.clone();
        }
        if overrides.debug {
            self.logging.level = "debug".to_string();
        }

        if let Some(cycle) = overrides.scanner_cycle {
            self.scanner.cycle = cycle;
        }
        if let Some(duration) = overrides.scanner_duration {
            self.scanner.duration = duration;
        }
        if let Some(interface) = overrides.scanner_interface {
            self.scanner.interface = interface;
        }

        match overrides.mqtt_enabled {
            Some(false) => self.mqtt = None,
            Some(true) => {
                if self.mqtt.is_none() {
                    self.mqtt = Some(MqttSettings::default());
                }
            }
            None => {}
        }
        let mqtt_overridden = overrides.mqtt_host.is_some()
            || overrides.mqtt_port.is_some()
            || overrides.mqtt_username.is_some()
            || overrides.mqtt_password.is_some()
            || overrides.mqtt_reconnect_interval.is_some();
        if mqtt_overridden && overrides.mqtt_enabled != Some(false) {
            let mqtt = self.mqtt.get_or_insert_with(MqttSettings::default);
            if let Some(host) = &overrides.mqtt_host {
                mqtt.host = host.clone();
            }
            if let Some(port) = overrides.mqtt_port {
                mqtt.port = port;
            }
            if let Some(username) = &overrides.mqtt_username {
                mqtt.username = Some(username.clone());
            }
            if let Some(password) = &overrides.mqtt_password {
                mqtt.password = Some(password.clone());
            }
            if let Some(interval) = overrides.mqtt_reconnect_interval {
                mqtt.reconnect_interval = interval;
            }
        }

        if let Some(enabled) = overrides.exporter_enabled {
            self.prometheus_exporter.enabled = enabled;
        }
        if let Some(port) = overrides.exporter_port {
            self.prometheus_exporter.port = port;
        }
    }

    /// Validate the merged settings. Called before any component is built,
    /// at startup and again on every reload.
    pub fn validate(&mut self) -> ConfigResult<()> {
        let invalid = |section: &str, reason: String| ConfigError::Invalid {
            section: section.to_string(),
            reason,
        };

        if self.scanner.enabled {
            if self.scanner.duration == 0 {
                return Err(invalid("scanner", "duration must be at least 1 second".into()));
            }
            if self.scanner.cycle < self.scanner.duration {
                return Err(invalid(
                    "scanner",
                    format!(
                        "cycle ({}) must be >= duration ({})",
                        self.scanner.cycle, self.scanner.duration
                    ),
                ));
            }
        }

        if let Some(mqtt) = &self.mqtt {
            if mqtt.host.is_empty() {
                return Err(invalid("mqtt", "host must not be empty".into()));
            }
            if mqtt.reconnect_interval == 0 {
                return Err(invalid("mqtt", "reconnect_interval must be at least 1 second".into()));
            }
        }

        parse_level(&self.logging.level)
            .map_err(|reason| invalid("logging", reason))?;
        for (target, level) in &self.logging.loggers {
            parse_level(level)
                .map_err(|reason| invalid("logging", format!("logger '{}': {}", target, reason)))?;
        }

        for (alias, entry) in self.devices.iter_mut() {
            if alias.contains('.') {
                return Err(invalid(
                    "devices",
                    format!("alias '{}' must not contain '.'", alias),
                ));
            }
            if alias == "previous" {
                return Err(invalid(
                    "devices",
                    "'previous' is reserved for previous-state references".into(),
                ));
            }
            if entry.address.is_empty() {
                return Err(invalid(
                    "devices",
                    format!("device '{}' has an empty address", alias),
                ));
            }
            entry.normalise();
            if COMMON_ATTRIBUTES.contains(&alias.as_str()) {
                warn!(
                    alias = %alias,
                    "Device alias shadows a common attribute name; bare placeholders will resolve to the attribute"
                );
            }
        }

        for (index, rule) in self.automations.iter().enumerate() {
            rule.validate(index, &self.devices)?;
        }

        if self.mqtt.is_none() {
            let mqtt_rules = self
                .automations
                .iter()
                .filter(|r| r.when.topic.is_some())
                .count();
            if mqtt_rules > 0 {
                warn!(
                    rules = mqtt_rules,
                    "MQTT rules configured but MQTT is disabled; they will never fire"
                );
            }
        }

        Ok(())
    }
}

/// Accepted log levels, lowercase or uppercase.
pub(crate) fn parse_level(level: &str) -> Result<(), String> {
    match level.to_ascii_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "warning" | "error" => Ok(()),
        other => Err(format!("unknown log level '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    const SAMPLE: &str = r#"
scanner:
  cycle: 20
  duration: 5
mqtt:
  host: broker.local
  port: 1884
prometheus_exporter:
  enabled: true
  port: 9100
  target:
    addresses: ["aa:bb:cc:dd:ee:ff"]
logging:
  level: debug
  loggers:
    rumqttc: warn
devices:
  meter:
    address: "AA:BB:CC:DD:EE:FF"
automations:
  - name: hot
    if:
      source: ble-event
      conditions:
        temperature: "> 28.0"
    then:
      - type: log
        message: "hot: {temperature}"
"#;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(settings.scanner.enabled);
        assert_eq!(settings.scanner.cycle, 10);
        assert_eq!(settings.scanner.duration, 3);
        assert!(settings.mqtt.is_none());
        assert!(!settings.prometheus_exporter.enabled);
        assert_eq!(settings.logging.level, "info");
        assert!(settings.automations.is_empty());
    }

    #[test]
    fn test_load_full_config() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, SAMPLE);

        let settings = Settings::load_with_overrides(&path, &Overrides::default()).unwrap();
        assert_eq!(settings.scanner.cycle, 20);
        let mqtt = settings.mqtt.as_ref().unwrap();
        assert_eq!(mqtt.host, "broker.local");
        assert_eq!(mqtt.port, 1884);
        assert_eq!(mqtt.reconnect_interval, 10);
        assert!(settings.prometheus_exporter.enabled);
        assert_eq!(settings.prometheus_exporter.port, 9100);
        assert_eq!(settings.automations.len(), 1);
        // validation normalises device addresses
        assert_eq!(
            settings.devices.get("meter").unwrap().address,
            "aa:bb:cc:dd:ee:ff"
        );
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let settings =
            Settings::load_with_overrides(dir.path().join("nope.yaml"), &Overrides::default())
                .unwrap();
        assert!(settings.mqtt.is_none());
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "");
        let settings = Settings::load(&path).unwrap();
        assert!(settings.automations.is_empty());
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "scanner: [not: a: mapping");
        assert!(matches!(
            Settings::load(&path),
            Err(ConfigError::ParseYaml { .. })
        ));
    }

    #[test]
    fn test_unknown_section_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "scannner:\n  cycle: 10\n");
        assert!(Settings::load(&path).is_err());
    }

    #[test]
    fn test_overrides_take_precedence() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, SAMPLE);

        let overrides = Overrides {
            debug: true,
            scanner_cycle: Some(30),
            mqtt_port: Some(8883),
            exporter_enabled: Some(false),
            ..Overrides::default()
        };
        let settings = Settings::load_with_overrides(&path, &overrides).unwrap();

        assert_eq!(settings.logging.level, "debug");
        assert_eq!(settings.scanner.cycle, 30);
        assert_eq!(settings.mqtt.as_ref().unwrap().port, 8883);
        assert!(!settings.prometheus_exporter.enabled);
    }

    #[test]
    fn test_no_mqtt_override_disables() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, SAMPLE);

        let overrides = Overrides {
            mqtt_enabled: Some(false),
            ..Overrides::default()
        };
        let settings = Settings::load_with_overrides(&path, &overrides).unwrap();
        assert!(settings.mqtt.is_none());
    }

    #[test]
    fn test_mqtt_host_override_enables() {
        let mut settings = Settings::default();
        settings.apply_overrides(&Overrides {
            mqtt_host: Some("broker".to_string()),
            ..Overrides::default()
        });
        assert_eq!(settings.mqtt.as_ref().unwrap().host, "broker");
        assert_eq!(settings.mqtt.as_ref().unwrap().port, 1883);
    }

    #[test]
    fn test_scanner_cycle_shorter_than_duration_rejected() {
        let mut settings = Settings::default();
        settings.scanner.cycle = 2;
        settings.scanner.duration = 5;
        assert!(settings.validate().is_err());

        // a disabled scanner is not validated
        settings.scanner.enabled = false;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let mut settings = Settings::default();
        settings.logging.level = "loud".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_alias_with_dot_rejected() {
        let mut settings = Settings::default();
        settings.devices.insert(
            "living.meter".to_string(),
            sb_core::DeviceEntry::with_address("aa:aa"),
        );
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_previous_alias_rejected() {
        let mut settings = Settings::default();
        settings.devices.insert(
            "previous".to_string(),
            sb_core::DeviceEntry::with_address("aa:aa"),
        );
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rule_validation_runs_at_load() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
automations:
  - if:
      source: mqtt-event
    then:
      - type: log
        message: hi
"#,
        );
        // mqtt-event without a topic
        assert!(Settings::load_with_overrides(&path, &Overrides::default()).is_err());
    }

    #[test]
    fn test_unknown_rule_alias_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
automations:
  - if:
      source: ble-event
      device: ghost
    then:
      - type: log
        message: hi
"#,
        );
        assert!(Settings::load_with_overrides(&path, &Overrides::default()).is_err());
    }
}
