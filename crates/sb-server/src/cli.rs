//! Command-line interface

use clap::Parser;
use std::path::PathBuf;

use sb_config::Overrides;

#[derive(Debug, Parser)]
#[command(
    name = "switchbot-actions",
    version,
    about = "A YAML-driven automation engine for SwitchBot BLE sensors and MQTT events"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short = 'c', long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Force debug-level logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Seconds between BLE scan cycles
    #[arg(long)]
    pub scanner_cycle: Option<u64>,

    /// Seconds to actively scan per cycle
    #[arg(long)]
    pub scanner_duration: Option<u64>,

    /// Bluetooth adapter number (0 for hci0)
    #[arg(long)]
    pub scanner_interface: Option<u16>,

    /// Enable MQTT even if the config file omits it
    #[arg(long, conflicts_with = "no_mqtt")]
    pub mqtt: bool,

    /// Disable MQTT regardless of the config file
    #[arg(long)]
    pub no_mqtt: bool,

    /// MQTT broker host
    #[arg(long)]
    pub mqtt_host: Option<String>,

    /// MQTT broker port
    #[arg(long)]
    pub mqtt_port: Option<u16>,

    /// MQTT broker username
    #[arg(long)]
    pub mqtt_username: Option<String>,

    /// MQTT broker password
    #[arg(long)]
    pub mqtt_password: Option<String>,

    /// Seconds between broker reconnect attempts
    #[arg(long)]
    pub mqtt_reconnect_interval: Option<u64>,

    /// Enable the Prometheus exporter
    #[arg(long, conflicts_with = "no_prometheus_exporter_enabled")]
    pub prometheus_exporter_enabled: bool,

    /// Disable the Prometheus exporter
    #[arg(long)]
    pub no_prometheus_exporter_enabled: bool,

    /// Prometheus exporter port
    #[arg(long)]
    pub prometheus_exporter_port: Option<u16>,

    /// Log level (e.g. info, debug)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    pub check: bool,
}

impl Cli {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            debug: self.debug,
            log_level: self.log_level.clone(),
            scanner_cycle: self.scanner_cycle,
            scanner_duration: self.scanner_duration,
            scanner_interface: self.scanner_interface,
            mqtt_enabled: flag_pair(self.mqtt, self.no_mqtt),
            mqtt_host: self.mqtt_host.clone(),
            mqtt_port: self.mqtt_port,
            mqtt_username: self.mqtt_username.clone(),
            mqtt_password: self.mqtt_password.clone(),
            mqtt_reconnect_interval: self.mqtt_reconnect_interval,
            exporter_enabled: flag_pair(
                self.prometheus_exporter_enabled,
                self.no_prometheus_exporter_enabled,
            ),
            exporter_port: self.prometheus_exporter_port,
        }
    }
}

fn flag_pair(enable: bool, disable: bool) -> Option<bool> {
    match (enable, disable) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}
