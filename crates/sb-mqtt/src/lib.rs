//! MQTT broker client component
//!
//! Subscribes to the union of the topic patterns the rules need (falling
//! back to `#` when none are configured), delivers inbound messages to the
//! event pipeline, reconnects with a configured backoff, and accepts
//! publish requests routed through the application.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use sb_config::MqttSettings;
use sb_core::{Component, EventSender, MqttMessage, PublishRequest, RawEvent};

const CLIENT_ID: &str = "switchbot-actions";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_CAPACITY: usize = 64;

pub type MqttResult<T> = Result<T, MqttError>;

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("MQTT client is not connected")]
    NotConnected,

    #[error("MQTT connection failed: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("MQTT request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("timed out connecting to the broker")]
    ConnectTimeout,
}

/// The broker client component.
pub struct MqttClient {
    settings: MqttSettings,
    topics: Vec<String>,
    events: EventSender,
    client: Arc<RwLock<Option<AsyncClient>>>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttClient {
    /// `topics` is the union of subscription patterns the handler needs;
    /// with no MQTT rules configured the client still subscribes to `#` so
    /// the store keeps observing state.
    pub fn new(settings: MqttSettings, topics: Vec<String>, events: EventSender) -> Self {
        let topics = if topics.is_empty() {
            vec!["#".to_string()]
        } else {
            topics
        };
        Self {
            settings,
            topics,
            events,
            client: Arc::new(RwLock::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Publish one message. Fails when the client has not connected yet.
    pub async fn publish(&self, request: PublishRequest) -> MqttResult<()> {
        let client = self.client.read().await.clone().ok_or(MqttError::NotConnected)?;
        client
            .publish(
                request.topic,
                qos_from(request.qos),
                request.retain,
                request.payload,
            )
            .await?;
        Ok(())
    }

    async fn subscribe_all(client: &AsyncClient, topics: &[String]) -> MqttResult<()> {
        for topic in topics {
            client.subscribe(topic.clone(), QoS::AtMostOnce).await?;
            debug!(topic = %topic, "Subscribed");
        }
        Ok(())
    }

    async fn event_loop(
        mut eventloop: rumqttc::EventLoop,
        client: AsyncClient,
        topics: Vec<String>,
        events: EventSender,
        running: Arc<AtomicBool>,
        reconnect_interval: Duration,
    ) {
        while running.load(Ordering::SeqCst) {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("MQTT client connected");
                    // Subscriptions do not survive a reconnect.
                    if let Err(e) = Self::subscribe_all(&client, &topics).await {
                        warn!(error = %e, "Failed to restore subscriptions");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = MqttMessage::new(publish.topic, publish.payload.to_vec());
                    if events.send(RawEvent::Mqtt(message)).await.is_err() {
                        info!("Event pipeline closed, stopping MQTT loop");
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    if !running.load(Ordering::SeqCst) {
                        return;
                    }
                    error!(
                        error = %e,
                        "MQTT error, reconnecting in {}s",
                        reconnect_interval.as_secs()
                    );
                    tokio::time::sleep(reconnect_interval).await;
                }
            }
        }
    }
}

#[async_trait]
impl Component for MqttClient {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("MQTT client is already running");
            return Ok(());
        }

        info!(
            host = %self.settings.host,
            port = self.settings.port,
            "Starting MQTT client"
        );

        let mut options = MqttOptions::new(CLIENT_ID, self.settings.host.clone(), self.settings.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some(username) = &self.settings.username {
            options.set_credentials(
                username.clone(),
                self.settings.password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(options, CHANNEL_CAPACITY);

        // Wait for the initial connection so an unreachable broker fails
        // startup instead of spinning in the background.
        let connected = tokio::time::timeout(CONNECT_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(MqttError::from(e)),
                }
            }
        })
        .await
        .unwrap_or(Err(MqttError::ConnectTimeout));

        if let Err(e) = connected {
            self.running.store(false, Ordering::SeqCst);
            return Err(anyhow::anyhow!("MQTT broker unreachable: {}", e));
        }
        info!("MQTT client connected");

        Self::subscribe_all(&client, &self.topics)
            .await
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                anyhow::anyhow!("MQTT subscribe failed: {}", e)
            })?;

        *self.client.write().await = Some(client.clone());
        let handle = tokio::spawn(Self::event_loop(
            eventloop,
            client,
            self.topics.clone(),
            self.events.clone(),
            self.running.clone(),
            Duration::from_secs(self.settings.reconnect_interval),
        ));
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping MQTT client");

        if let Some(client) = self.client.write().await.take() {
            let _ = client.disconnect().await;
        }
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }
}

fn qos_from(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}
