//! Action executors
//!
//! One executor per action type. Executors format their configuration
//! against the StateObject at execution time and report failures as
//! warnings; a failing action never interrupts its siblings and never
//! reaches back into the trigger.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use sb_core::{
    AliasTable, DeviceCommandError, DeviceController, DeviceEntry, PublishRequest, PublishSender,
    StateObject,
};

use crate::error::{AutomationError, AutomationResult};
use crate::format::{format_json, format_str};
use crate::rule::{ActionConfig, HttpMethod, LogLevel};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_PREVIEW_LIMIT: usize = 200;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("publish channel closed")]
    PublishChannelClosed,

    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Device(#[from] DeviceCommandError),
}

/// A single configured action, bound to its collaborators.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Action type name for logs.
    fn kind(&self) -> &'static str;

    async fn execute(&self, state: &StateObject) -> Result<(), ActionError>;
}

/// Collaborators shared by all executors of a handler.
#[derive(Clone)]
pub struct ExecutorContext {
    pub publisher: PublishSender,
    pub controller: Arc<dyn DeviceController>,
    pub http: reqwest::Client,
    pub aliases: Arc<AliasTable>,
}

/// Build the executor list for one rule, validating action configs.
pub fn build_executors(
    actions: &[ActionConfig],
    ctx: &ExecutorContext,
    rule: &str,
) -> AutomationResult<Vec<Box<dyn ActionExecutor>>> {
    actions
        .iter()
        .map(|action| build_executor(action, ctx, rule))
        .collect()
}

fn build_executor(
    action: &ActionConfig,
    ctx: &ExecutorContext,
    rule: &str,
) -> AutomationResult<Box<dyn ActionExecutor>> {
    let invalid = |reason: String| AutomationError::InvalidAction {
        rule: rule.to_string(),
        reason,
    };

    match action {
        ActionConfig::Log { level, message } => Ok(Box::new(LogExecutor {
            level: *level,
            message: message.clone(),
        })),

        ActionConfig::Shell { command } => Ok(Box::new(ShellExecutor {
            command: command.clone(),
        })),

        ActionConfig::Webhook {
            url,
            method,
            payload,
            headers,
        } => Ok(Box::new(WebhookExecutor {
            url: url.clone(),
            method: *method,
            payload: payload.clone(),
            headers: headers.clone(),
            client: ctx.http.clone(),
        })),

        ActionConfig::MqttPublish {
            topic,
            payload,
            qos,
            retain,
        } => {
            Ok(Box::new(MqttPublishExecutor {
                topic: topic.clone(),
                payload: payload.clone(),
                qos: *qos,
                retain: *retain,
                publisher: ctx.publisher.clone(),
            }))
        }

        ActionConfig::DeviceCommand {
            device,
            address,
            command,
            params,
        } => {
            let target = match (device, address) {
                (Some(alias), None) => {
                    let entry = ctx.aliases.get(alias).ok_or_else(|| {
                        AutomationError::UnknownAlias {
                            rule: rule.to_string(),
                            alias: alias.clone(),
                        }
                    })?;
                    CommandTarget::Alias {
                        entry: entry.clone(),
                    }
                }
                (None, Some(address)) => CommandTarget::Address(address.to_ascii_lowercase()),
                _ => {
                    return Err(invalid(
                        "device_command requires exactly one of 'device' or 'address'".to_string(),
                    ))
                }
            };
            Ok(Box::new(DeviceCommandExecutor {
                target,
                command: command.clone(),
                params: params
                    .iter()
                    .map(|(k, v)| (k.clone(), v.as_str().to_string()))
                    .collect(),
                controller: ctx.controller.clone(),
            }))
        }
    }
}

struct LogExecutor {
    level: LogLevel,
    message: String,
}

#[async_trait]
impl ActionExecutor for LogExecutor {
    fn kind(&self) -> &'static str {
        "log"
    }

    async fn execute(&self, state: &StateObject) -> Result<(), ActionError> {
        let message = format_str(&self.message, state);
        match self.level {
            LogLevel::Debug => debug!("{}", message),
            LogLevel::Info => info!("{}", message),
            LogLevel::Warn => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }
        Ok(())
    }
}

struct ShellExecutor {
    command: Vec<String>,
}

#[async_trait]
impl ActionExecutor for ShellExecutor {
    fn kind(&self) -> &'static str {
        "shell"
    }

    async fn execute(&self, state: &StateObject) -> Result<(), ActionError> {
        let argv: Vec<String> = self
            .command
            .iter()
            .map(|part| format_str(part, state))
            .collect();
        debug!(command = ?argv, "Executing shell command");

        let output = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .output()
            .await
            .map_err(|source| ActionError::Spawn {
                command: argv[0].clone(),
                source,
            })?;

        if !output.stdout.is_empty() {
            debug!(stdout = %String::from_utf8_lossy(&output.stdout).trim(), "Shell command stdout");
        }
        if !output.status.success() {
            warn!(
                command = ?argv,
                code = output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Shell command exited non-zero"
            );
        }
        Ok(())
    }
}

struct WebhookExecutor {
    url: String,
    method: HttpMethod,
    payload: Option<serde_json::Value>,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

#[async_trait]
impl ActionExecutor for WebhookExecutor {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    async fn execute(&self, state: &StateObject) -> Result<(), ActionError> {
        let url = format_str(&self.url, state);
        let mut request = match self.method {
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Get => self.client.get(&url),
        };

        for (name, value) in &self.headers {
            request = request.header(name.as_str(), format_str(value, state));
        }

        match &self.payload {
            Some(value @ serde_json::Value::Object(_)) => {
                let formatted = format_json(value, state);
                request = match self.method {
                    HttpMethod::Post => request.json(&formatted),
                    HttpMethod::Get => {
                        // Each top-level pair becomes one query parameter.
                        let pairs: Vec<(String, String)> = formatted
                            .as_object()
                            .map(|map| {
                                map.iter()
                                    .map(|(k, v)| (k.clone(), json_scalar_text(v)))
                                    .collect()
                            })
                            .unwrap_or_default();
                        request.query(&pairs)
                    }
                };
            }
            Some(other) => {
                request = request.body(format_str(&json_scalar_text(other), state));
            }
            None => {}
        }

        debug!(method = ?self.method, url = %url, "Sending webhook");
        let response = request.timeout(WEBHOOK_TIMEOUT).send().await?;

        let status = response.status();
        if status.is_success() {
            debug!(url = %url, status = %status, "Webhook succeeded");
        } else {
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(RESPONSE_PREVIEW_LIMIT).collect();
            warn!(url = %url, status = %status, body = %preview, "Webhook returned non-success status");
        }
        Ok(())
    }
}

struct MqttPublishExecutor {
    topic: String,
    payload: Option<serde_json::Value>,
    qos: u8,
    retain: bool,
    publisher: PublishSender,
}

#[async_trait]
impl ActionExecutor for MqttPublishExecutor {
    fn kind(&self) -> &'static str {
        "mqtt_publish"
    }

    async fn execute(&self, state: &StateObject) -> Result<(), ActionError> {
        let topic = format_str(&self.topic, state);
        let payload = match &self.payload {
            Some(value @ serde_json::Value::Object(_)) => {
                serde_json::to_string(&format_json(value, state))?
            }
            Some(other) => format_str(&json_scalar_text(other), state),
            None => String::new(),
        };

        debug!(topic = %topic, qos = self.qos, retain = self.retain, "Requesting MQTT publish");
        self.publisher
            .send(PublishRequest {
                topic,
                payload,
                qos: self.qos,
                retain: self.retain,
            })
            .await
            .map_err(|_| ActionError::PublishChannelClosed)
    }
}

enum CommandTarget {
    Alias { entry: DeviceEntry },
    Address(String),
}

struct DeviceCommandExecutor {
    target: CommandTarget,
    command: String,
    params: HashMap<String, String>,
    controller: Arc<dyn DeviceController>,
}

#[async_trait]
impl ActionExecutor for DeviceCommandExecutor {
    fn kind(&self) -> &'static str {
        "device_command"
    }

    async fn execute(&self, state: &StateObject) -> Result<(), ActionError> {
        let params: HashMap<String, String> = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), format_str(v, state)))
            .collect();

        let (address, entry) = match &self.target {
            CommandTarget::Alias { entry } => (entry.address.as_str(), Some(entry)),
            CommandTarget::Address(address) => (address.as_str(), None),
        };

        debug!(address, command = %self.command, "Invoking device command");
        self.controller
            .invoke(address, entry, &self.command, &params)
            .await?;
        Ok(())
    }
}

/// Render a scalar JSON value without the quotes `to_string` would add.
fn json_scalar_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
