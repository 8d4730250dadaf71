//! Configuration loading and validation
//!
//! Settings come from three layers with rising precedence: built-in
//! defaults, the YAML config file, and command-line overrides. Validation
//! happens after the merge so a reload sees exactly what startup saw.

pub mod error;
pub mod settings;

pub use error::{ConfigError, ConfigResult};
pub use settings::{
    LoggingSettings, MqttSettings, Overrides, PrometheusSettings, ScannerSettings, Settings,
    TargetFilter,
};
