//! Device alias table and the device-control contract
//!
//! Users bind friendly names to device addresses in configuration. Rules
//! and actions refer to devices only through those aliases; the table is
//! fixed at (re)load time. Actual device control is an external collaborator
//! reached through the [`DeviceController`] trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Name -> device binding, fixed at reload time.
pub type AliasTable = HashMap<String, DeviceEntry>;

/// One configured device: its address plus construction parameters
/// (password, retry count, ...) passed through to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub address: String,
    #[serde(flatten, default)]
    pub params: HashMap<String, serde_json::Value>,
}

impl DeviceEntry {
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into().to_ascii_lowercase(),
            params: HashMap::new(),
        }
    }

    /// Normalise the address in place. Called once during config validation.
    pub fn normalise(&mut self) {
        self.address = self.address.to_ascii_lowercase();
    }
}

/// Reverse lookup: the alias a given entity key is bound to, if any.
pub fn alias_for_address<'a>(aliases: &'a AliasTable, address: &str) -> Option<&'a str> {
    aliases
        .iter()
        .find(|(_, entry)| entry.address == address)
        .map(|(name, _)| name.as_str())
}

#[derive(Debug, Error)]
pub enum DeviceCommandError {
    #[error("device command '{command}' failed for {address}: {reason}")]
    Failed {
        address: String,
        command: String,
        reason: String,
    },

    #[error("device command '{command}' timed out for {address}")]
    Timeout { address: String, command: String },

    #[error("no device control backend is available")]
    Unavailable,
}

/// External collaborator that executes commands on physical devices.
///
/// `entry` carries the alias table entry when the target was addressed by
/// alias, so controllers can use per-device construction parameters.
#[async_trait]
pub trait DeviceController: Send + Sync {
    async fn invoke(
        &self,
        address: &str,
        entry: Option<&DeviceEntry>,
        command: &str,
        params: &HashMap<String, String>,
    ) -> Result<(), DeviceCommandError>;
}
