//! Logging setup with reload support
//!
//! The filter is built from `logging.level` plus per-target directives from
//! `logging.loggers`. A reload handle lets SIGHUP re-apply the logging
//! section without touching the rest of the subscriber stack.

use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use sb_config::LoggingSettings;

pub struct LogHandle {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogHandle {
    /// Re-apply the logging section, e.g. after a config reload.
    pub fn apply(&self, settings: &LoggingSettings) {
        if let Err(e) = self.handle.reload(build_filter(settings)) {
            warn!(error = %e, "Failed to apply logging settings");
        }
    }
}

/// Install the global subscriber. Must be called once, before any
/// component starts.
pub fn init(settings: &LoggingSettings) -> LogHandle {
    let (filter, handle) = reload::Layer::new(build_filter(settings));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
    LogHandle { handle }
}

fn build_filter(settings: &LoggingSettings) -> EnvFilter {
    let mut directives = normalize_level(&settings.level).to_string();
    for (target, level) in &settings.loggers {
        directives.push_str(&format!(",{}={}", target, normalize_level(level)));
    }
    EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("invalid log filter '{}': {}; falling back to info", directives, e);
        EnvFilter::new("info")
    })
}

fn normalize_level(level: &str) -> String {
    let lowered = level.to_ascii_lowercase();
    if lowered == "warning" {
        "warn".to_string()
    } else {
        lowered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_build_filter_with_loggers() {
        let settings = LoggingSettings {
            level: "DEBUG".to_string(),
            loggers: HashMap::from([("rumqttc".to_string(), "warning".to_string())]),
        };
        // EnvFilter has no public inspection API; building without the
        // fallback path is the contract.
        let filter = build_filter(&settings).to_string();
        assert!(filter.contains("debug"));
        assert!(filter.contains("rumqttc=warn"));
    }

    #[test]
    fn test_normalize_level() {
        assert_eq!(normalize_level("WARNING"), "warn");
        assert_eq!(normalize_level("Info"), "info");
    }
}
