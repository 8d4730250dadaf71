//! Error types for rule loading and validation

use thiserror::Error;

/// Result type for automation operations
pub type AutomationResult<T> = Result<T, AutomationError>;

/// Errors raised while building runners from rule configuration.
///
/// These surface at load or reload time; per-event evaluation problems are
/// never errors, they make the affected condition false.
#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("rule '{rule}' references unknown device alias '{alias}'")]
    UnknownAlias { rule: String, alias: String },

    #[error("rule '{rule}': invalid action: {reason}")]
    InvalidAction { rule: String, reason: String },
}
