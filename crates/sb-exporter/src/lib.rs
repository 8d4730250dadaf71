//! Prometheus scrape endpoint over the state store
//!
//! Exposes the latest observed value of every numeric or boolean device
//! attribute as a gauge labelled by address and model, plus one
//! `switchbot_device_info` identity series carrying the configured alias.
//! Metrics are collected fresh on every scrape; nothing is pre-registered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sb_config::TargetFilter;
use sb_core::{alias_for_address, AliasTable, AttrValue, Component, RawEvent};
use sb_store::SharedStateStore;

pub type ExporterResult<T> = Result<T, ExporterError>;

#[derive(Debug, Error)]
pub enum ExporterError {
    #[error("failed to bind metrics port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("metrics collection failed: {0}")]
    Collect(#[from] prometheus::Error),
}

struct MetricsState {
    store: SharedStateStore,
    aliases: Arc<AliasTable>,
    target: TargetFilter,
}

/// The scrape endpoint component.
pub struct PrometheusExporter {
    port: u16,
    state: Arc<MetricsState>,
    running: Arc<AtomicBool>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PrometheusExporter {
    pub fn new(
        port: u16,
        target: TargetFilter,
        store: SharedStateStore,
        aliases: Arc<AliasTable>,
    ) -> Self {
        Self {
            port,
            state: Arc::new(MetricsState {
                store,
                aliases,
                target,
            }),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Component for PrometheusExporter {
    fn name(&self) -> &'static str {
        "prometheus_exporter"
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Exporter is already running");
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(|source| {
                self.running.store(false, Ordering::SeqCst);
                ExporterError::Bind {
                    port: self.port,
                    source,
                }
            })?;
        info!(port = self.port, "Prometheus exporter listening");

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone());

        let (tx, rx) = oneshot::channel::<()>();
        *self.shutdown.lock().await = Some(tx);

        let running = self.running.clone();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "Metrics server terminated");
            }
            running.store(false, Ordering::SeqCst);
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping Prometheus exporter");
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

async fn metrics_handler(State(state): State<Arc<MetricsState>>) -> Response {
    debug!("Collecting metrics for scrape");
    match render_metrics(&state.store, &state.aliases, &state.target) {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Metrics collection failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Collect the current store contents into scrape text.
///
/// Only BLE entities are devices; MQTT topics are not exported. Attributes
/// that are not numeric or boolean are skipped.
pub fn render_metrics(
    store: &SharedStateStore,
    aliases: &AliasTable,
    target: &TargetFilter,
) -> ExporterResult<String> {
    let registry = Registry::new();

    let device_info = GaugeVec::new(
        Opts::new("switchbot_device_info", "Device identity"),
        &["address", "name", "model"],
    )?;
    registry.register(Box::new(device_info.clone()))?;

    let mut gauges: std::collections::HashMap<String, GaugeVec> = std::collections::HashMap::new();

    for (key, event) in store.snapshot().iter() {
        let RawEvent::Ble(advertisement) = event.as_ref() else {
            continue;
        };
        if let Some(allowed) = &target.addresses {
            if !allowed.iter().any(|a| a.eq_ignore_ascii_case(key)) {
                continue;
            }
        }

        let model = match advertisement.data.get("modelName") {
            Some(AttrValue::Str(model)) => model.clone(),
            _ => "Unknown".to_string(),
        };
        let name = alias_for_address(aliases, key).unwrap_or_default();
        device_info
            .with_label_values(&[key.as_str(), name, model.as_str()])
            .set(1.0);

        let mut series: Vec<(&str, f64)> = vec![("rssi", advertisement.rssi as f64)];
        for (attr, value) in &advertisement.data {
            let number = match value {
                AttrValue::Int(i) => *i as f64,
                AttrValue::Float(f) => *f,
                AttrValue::Bool(b) => {
                    if *b {
                        1.0
                    } else {
                        0.0
                    }
                }
                AttrValue::Str(_) => continue,
            };
            series.push((attr.as_str(), number));
        }

        for (attr, number) in series {
            if let Some(allowed) = &target.metrics {
                if !allowed.iter().any(|m| m == attr) {
                    continue;
                }
            }
            let metric_name = format!("switchbot_{}", sanitize(attr));
            let gauge = match gauges.get(&metric_name) {
                Some(gauge) => gauge.clone(),
                None => {
                    let gauge = GaugeVec::new(
                        Opts::new(&metric_name, format!("SwitchBot attribute {}", attr)),
                        &["address", "model"],
                    )?;
                    registry.register(Box::new(gauge.clone()))?;
                    gauges.insert(metric_name.clone(), gauge.clone());
                    gauge
                }
            };
            gauge
                .with_label_values(&[key.as_str(), model.as_str()])
                .set(number);
        }
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Metric name characters outside [a-zA-Z0-9_] become underscores.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_core::{BleAdvertisement, DeviceEntry, MqttMessage};
    use sb_store::StateStore;
    use std::collections::HashMap;

    fn store_with_events() -> SharedStateStore {
        let store = Arc::new(StateStore::new());
        let meter = RawEvent::Ble(BleAdvertisement::new(
            "aa:bb:cc:dd:ee:ff",
            -60,
            HashMap::from([
                ("modelName".to_string(), AttrValue::Str("WoSensorTH".into())),
                ("temperature".to_string(), AttrValue::Float(28.5)),
                ("isOn".to_string(), AttrValue::Bool(true)),
                ("battery".to_string(), AttrValue::Int(90)),
            ]),
        ));
        store.get_and_update(meter.key(), Arc::new(meter.clone()));
        let mqtt = RawEvent::Mqtt(MqttMessage::new("home/temp", "21"));
        let mqtt_key = mqtt.key().to_string();
        store.get_and_update(&mqtt_key, Arc::new(mqtt));
        store
    }

    fn aliases() -> AliasTable {
        HashMap::from([(
            "meter".to_string(),
            DeviceEntry::with_address("aa:bb:cc:dd:ee:ff"),
        )])
    }

    #[test]
    fn test_render_gauges_and_identity() {
        let text =
            render_metrics(&store_with_events(), &aliases(), &TargetFilter::default()).unwrap();

        assert!(text.contains(
            r#"switchbot_temperature{address="aa:bb:cc:dd:ee:ff",model="WoSensorTH"} 28.5"#
        ));
        assert!(text
            .contains(r#"switchbot_rssi{address="aa:bb:cc:dd:ee:ff",model="WoSensorTH"} -60"#));
        assert!(text.contains(r#"switchbot_isOn{address="aa:bb:cc:dd:ee:ff",model="WoSensorTH"} 1"#));
        assert!(text.contains(
            r#"switchbot_device_info{address="aa:bb:cc:dd:ee:ff",model="WoSensorTH",name="meter"} 1"#
        ));
        // strings and MQTT topics are not exported
        assert!(!text.contains("switchbot_modelName"));
        assert!(!text.contains("home/temp"));
    }

    #[test]
    fn test_address_allow_list() {
        let target = TargetFilter {
            addresses: Some(vec!["11:11:11:11:11:11".to_string()]),
            metrics: None,
        };
        let text = render_metrics(&store_with_events(), &aliases(), &target).unwrap();
        assert!(!text.contains("switchbot_temperature"));
    }

    #[test]
    fn test_metric_allow_list() {
        let target = TargetFilter {
            addresses: None,
            metrics: Some(vec!["temperature".to_string()]),
        };
        let text = render_metrics(&store_with_events(), &aliases(), &target).unwrap();
        assert!(text.contains("switchbot_temperature"));
        assert!(!text.contains("switchbot_battery"));
        assert!(!text.contains("switchbot_rssi"));
    }

    #[test]
    fn test_device_without_alias_has_empty_name() {
        let text = render_metrics(
            &store_with_events(),
            &AliasTable::new(),
            &TargetFilter::default(),
        )
        .unwrap();
        assert!(text.contains(
            r#"switchbot_device_info{address="aa:bb:cc:dd:ee:ff",model="WoSensorTH",name=""} 1"#
        ));
    }

    #[tokio::test]
    async fn test_start_fails_when_port_in_use() {
        let occupied = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let exporter = PrometheusExporter::new(
            port,
            TargetFilter::default(),
            Arc::new(StateStore::new()),
            Arc::new(AliasTable::new()),
        );
        assert!(exporter.start().await.is_err());
        assert!(!exporter.is_running());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let exporter = PrometheusExporter::new(
            0, // any free port
            TargetFilter::default(),
            store_with_events(),
            Arc::new(aliases()),
        );
        exporter.start().await.unwrap();
        assert!(exporter.is_running());
        exporter.stop().await;
        assert!(!exporter.is_running());
    }
}
