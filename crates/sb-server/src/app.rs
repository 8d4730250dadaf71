//! Application lifecycle controller
//!
//! Builds the component graph from settings, starts it in dependency order
//! (pipeline before event sources), fails fast when an enabled component
//! cannot start, and performs SIGHUP reloads with rollback to the
//! last-known-good graph.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use sb_automation::{AutomationHandler, ExecutorContext};
use sb_config::{Overrides, Settings};
use sb_core::{
    Component, DeviceCommandError, DeviceController, DeviceEntry, PublishRequest, PublishSender,
};
use sb_exporter::PrometheusExporter;
use sb_mqtt::MqttClient;
use sb_scanner::{BleScanner, SourceFactory};
use sb_store::{SharedStateStore, StateStore};

use crate::logging::LogHandle;
use crate::pipeline::Pipeline;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const PUBLISH_CHANNEL_CAPACITY: usize = 64;
const RELOAD_PUBLISH_WAIT: Duration = Duration::from_secs(5);

pub struct Application {
    config_path: PathBuf,
    overrides: Overrides,
    settings: Settings,
    store: SharedStateStore,
    source_factory: SourceFactory,
    controller: Arc<dyn DeviceController>,
    http: reqwest::Client,
    publish_tx: PublishSender,
    mqtt_slot: Arc<RwLock<Option<Arc<MqttClient>>>>,
    reloading: Arc<AtomicBool>,
    components: Vec<Arc<dyn Component>>,
    pump: Option<JoinHandle<()>>,
    log_handle: Option<LogHandle>,
}

impl Application {
    pub fn new(
        config_path: PathBuf,
        overrides: Overrides,
        settings: Settings,
        source_factory: SourceFactory,
        controller: Arc<dyn DeviceController>,
        log_handle: Option<LogHandle>,
    ) -> Self {
        let (publish_tx, publish_rx) = mpsc::channel(PUBLISH_CHANNEL_CAPACITY);
        let mqtt_slot: Arc<RwLock<Option<Arc<MqttClient>>>> = Arc::new(RwLock::new(None));
        let reloading = Arc::new(AtomicBool::new(false));
        let pump = tokio::spawn(publish_pump(
            publish_rx,
            mqtt_slot.clone(),
            reloading.clone(),
        ));

        Self {
            config_path,
            overrides,
            settings,
            store: Arc::new(StateStore::new()),
            source_factory,
            controller,
            http: reqwest::Client::new(),
            publish_tx,
            mqtt_slot,
            reloading,
            components: Vec::new(),
            pump: Some(pump),
            log_handle,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Names of the components that report themselves running.
    pub fn running_components(&self) -> Vec<&'static str> {
        self.components
            .iter()
            .filter(|c| c.is_running())
            .map(|c| c.name())
            .collect()
    }

    /// Build and start the full component graph. Any failure tears down
    /// what already started and is fatal to the process.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let (components, mqtt) = self.build_components(&self.settings)?;
        Self::start_components(&components).await?;
        *self.mqtt_slot.write().await = mqtt;
        self.components = components;
        Ok(())
    }

    /// Stop every component in reverse start order.
    pub async fn stop(&mut self) {
        Self::stop_components(&self.components).await;
        self.components.clear();
        *self.mqtt_slot.write().await = None;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }

    /// Reload configuration from disk.
    ///
    /// Invalid new configuration keeps the old graph untouched. When the
    /// new graph fails to start, the last-known-good graph is restarted;
    /// only a failed rollback is an error (the process must exit).
    pub async fn reload(&mut self) -> anyhow::Result<()> {
        if self.reloading.swap(true, Ordering::SeqCst) {
            warn!("Reload already in progress, ignoring request");
            return Ok(());
        }
        let result = self.reload_inner().await;
        self.reloading.store(false, Ordering::SeqCst);
        result
    }

    async fn reload_inner(&mut self) -> anyhow::Result<()> {
        info!("Reloading configuration");

        let new_settings = match Settings::load_with_overrides(&self.config_path, &self.overrides)
        {
            Ok(settings) => settings,
            Err(e) => {
                error!("Failed to load new configuration, keeping the old. Reason: {}", e);
                return Ok(());
            }
        };

        let (new_components, new_mqtt) = match self.build_components(&new_settings) {
            Ok(built) => built,
            Err(e) => {
                error!("Failed to build new components, keeping the old. Reason: {:#}", e);
                return Ok(());
            }
        };

        if let Some(handle) = &self.log_handle {
            handle.apply(&new_settings.logging);
        }

        info!("Stopping old components");
        Self::stop_components(&self.components).await;

        info!("Starting new components");
        match Self::start_components(&new_components).await {
            Ok(()) => {
                *self.mqtt_slot.write().await = new_mqtt;
                self.components = new_components;
                self.settings = new_settings;
                info!("Configuration reloaded and components restarted successfully");
                Ok(())
            }
            Err(e) => {
                error!("Failed to apply new configuration: {:#}", e);
                info!("Rolling back to the previous configuration");
                if let Some(handle) = &self.log_handle {
                    handle.apply(&self.settings.logging);
                }
                match Self::start_components(&self.components).await {
                    Ok(()) => {
                        info!("Rollback successful");
                        Ok(())
                    }
                    Err(rollback_error) => {
                        Err(rollback_error.context("rollback to previous configuration failed"))
                    }
                }
            }
        }
    }

    fn build_components(
        &self,
        settings: &Settings,
    ) -> anyhow::Result<(Vec<Arc<dyn Component>>, Option<Arc<MqttClient>>)> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let aliases = Arc::new(settings.devices.clone());

        let ctx = ExecutorContext {
            publisher: self.publish_tx.clone(),
            controller: self.controller.clone(),
            http: self.http.clone(),
            aliases: aliases.clone(),
        };
        let handler = AutomationHandler::new(
            &settings.automations,
            self.store.clone(),
            aliases.clone(),
            &ctx,
        )?;
        let topics = handler.subscription_topics();

        let mut components: Vec<Arc<dyn Component>> = Vec::new();
        components.push(Arc::new(Pipeline::new(handler, event_tx.clone(), event_rx)));

        if settings.prometheus_exporter.enabled {
            components.push(Arc::new(PrometheusExporter::new(
                settings.prometheus_exporter.port,
                settings.prometheus_exporter.target.clone(),
                self.store.clone(),
                aliases.clone(),
            )));
        }

        let mut mqtt_client = None;
        if let Some(mqtt_settings) = &settings.mqtt {
            let client = Arc::new(MqttClient::new(
                mqtt_settings.clone(),
                topics,
                event_tx.clone(),
            ));
            components.push(client.clone());
            mqtt_client = Some(client);
        }

        if settings.scanner.enabled {
            let source = (self.source_factory)(settings.scanner.interface)
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            components.push(Arc::new(BleScanner::new(
                source,
                Duration::from_secs(settings.scanner.cycle),
                Duration::from_secs(settings.scanner.duration),
                event_tx,
            )));
        }

        Ok((components, mqtt_client))
    }

    async fn start_components(components: &[Arc<dyn Component>]) -> anyhow::Result<()> {
        for (index, component) in components.iter().enumerate() {
            if let Err(e) = component.start().await {
                error!(component = component.name(), "Component failed to start: {:#}", e);
                for started in components[..index].iter().rev() {
                    started.stop().await;
                }
                return Err(e.context(format!("component '{}' failed to start", component.name())));
            }
        }
        info!("Components started successfully");
        Ok(())
    }

    async fn stop_components(components: &[Arc<dyn Component>]) {
        // Reverse start order: sources first, the pipeline last.
        for component in components.iter().rev() {
            component.stop().await;
        }
    }
}

/// Forwards publish requests from executors to the broker client owned by
/// the application. Requests raised mid-reload wait (bounded) for the
/// reload to finish.
async fn publish_pump(
    mut requests: mpsc::Receiver<PublishRequest>,
    slot: Arc<RwLock<Option<Arc<MqttClient>>>>,
    reloading: Arc<AtomicBool>,
) {
    while let Some(request) = requests.recv().await {
        let deadline = tokio::time::Instant::now() + RELOAD_PUBLISH_WAIT;
        while reloading.load(Ordering::SeqCst) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if reloading.load(Ordering::SeqCst) {
            error!(
                "Failed to publish MQTT message: reload did not finish within {}s",
                RELOAD_PUBLISH_WAIT.as_secs()
            );
            continue;
        }

        let guard = slot.read().await;
        match guard.as_ref() {
            Some(client) => {
                if let Err(e) = client.publish(request).await {
                    warn!(error = %e, "MQTT publish failed");
                }
            }
            None => warn!("MQTT component is not configured, cannot publish message"),
        }
    }
}

/// Placeholder device controller used when no control backend is wired in.
/// Commands fail with a warning-level action error instead of crashing the
/// rule that issued them.
pub struct UnavailableController;

#[async_trait]
impl DeviceController for UnavailableController {
    async fn invoke(
        &self,
        _address: &str,
        _entry: Option<&DeviceEntry>,
        _command: &str,
        _params: &HashMap<String, String>,
    ) -> Result<(), DeviceCommandError> {
        Err(DeviceCommandError::Unavailable)
    }
}
