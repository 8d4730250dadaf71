//! BLE duty-cycle scanner component
//!
//! The radio itself is an external collaborator reached through the
//! [`AdvertisementSource`] trait; this crate owns the duty cycle (scan for
//! `duration` seconds, rest until `cycle` seconds have passed) and forwards
//! each observed advertisement to the event pipeline once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use sb_core::{BleAdvertisement, Component, EventSender, RawEvent};

pub type ScanResult<T> = Result<T, ScanError>;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("no BLE adapter available on interface hci{interface}")]
    AdapterUnavailable { interface: u16 },

    #[error("BLE scan failed: {0}")]
    Scan(String),
}

/// The thin interface the scanner consumes from the radio driver.
///
/// One `scan` call performs one active scan window and returns every
/// advertisement observed during it, decoded into flat attribute maps.
#[async_trait]
pub trait AdvertisementSource: Send + Sync {
    /// Cheap adapter availability check, called once at startup so a
    /// missing adapter fails fast instead of logging forever.
    async fn probe(&self) -> ScanResult<()>;

    async fn scan(&self, duration: Duration) -> ScanResult<Vec<BleAdvertisement>>;
}

/// Factory the application uses to build the platform radio source.
pub type SourceFactory =
    Arc<dyn Fn(u16) -> ScanResult<Arc<dyn AdvertisementSource>> + Send + Sync>;

/// The default factory. No radio backend ships with the engine itself; the
/// scanner requires an [`AdvertisementSource`] implementation wired in at
/// composition time, and startup fails fast without one.
pub fn system_source(interface: u16) -> ScanResult<Arc<dyn AdvertisementSource>> {
    Err(ScanError::AdapterUnavailable { interface })
}

/// Continuously scans for BLE advertisements and serves as the central
/// publisher of device events.
pub struct BleScanner {
    source: Arc<dyn AdvertisementSource>,
    cycle: Duration,
    duration: Duration,
    events: EventSender,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BleScanner {
    pub fn new(
        source: Arc<dyn AdvertisementSource>,
        cycle: Duration,
        duration: Duration,
        events: EventSender,
    ) -> Self {
        Self {
            source,
            cycle,
            duration,
            events,
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    async fn scan_loop(
        source: Arc<dyn AdvertisementSource>,
        cycle: Duration,
        duration: Duration,
        events: EventSender,
        running: Arc<AtomicBool>,
    ) {
        while running.load(Ordering::SeqCst) {
            debug!(duration = ?duration, "Starting BLE scan window");
            match source.scan(duration).await {
                Ok(advertisements) => {
                    for advertisement in advertisements {
                        // Advertisements without a decoded payload carry no state.
                        if advertisement.is_empty() {
                            continue;
                        }
                        debug!(address = %advertisement.address, "Received advertisement");
                        if events.send(RawEvent::Ble(advertisement)).await.is_err() {
                            info!("Event pipeline closed, stopping scan loop");
                            return;
                        }
                    }
                    let rest = cycle.saturating_sub(duration);
                    if running.load(Ordering::SeqCst) && !rest.is_zero() {
                        debug!(rest = ?rest, "Scan window finished, resting");
                        tokio::time::sleep(rest).await;
                    }
                }
                Err(e) => {
                    error!("{}", describe_scan_error(&e));
                    // Back off for the full cycle so a broken adapter does
                    // not produce a tight error loop.
                    if running.load(Ordering::SeqCst) {
                        tokio::time::sleep(cycle).await;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Component for BleScanner {
    fn name(&self) -> &'static str {
        "scanner"
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scanner is already running");
            return Ok(());
        }

        self.source.probe().await.map_err(|e| {
            self.running.store(false, Ordering::SeqCst);
            anyhow::anyhow!("{}", describe_scan_error(&e))
        })?;

        info!("Starting BLE scanner");
        let handle = tokio::spawn(Self::scan_loop(
            self.source.clone(),
            self.cycle,
            self.duration,
            self.events.clone(),
            self.running.clone(),
        ));
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping BLE scanner");
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }
}

/// Map scan failures to operator hints where the cause is recognisable.
fn describe_scan_error(error: &ScanError) -> String {
    let text = error.to_string();
    let lowered = text.to_ascii_lowercase();

    let hint = if lowered.contains("turned off") {
        "Please ensure your Bluetooth adapter is turned on."
    } else if lowered.contains("not authorized") {
        "Check your OS's privacy settings for Bluetooth."
    } else if lowered.contains("permission denied")
        || lowered.contains("not permitted")
        || lowered.contains("access denied")
    {
        "Check that the program has Bluetooth permissions (e.g. run with elevated privileges or set udev rules)."
    } else if lowered.contains("no ble adapter") || lowered.contains("no such device") {
        "Bluetooth adapter not found. Ensure the hardware is present and working."
    } else {
        "This might be due to adapter issues, permissions, or other environmental factors."
    };

    format!("Error during BLE scan: {}. {}", text, hint)
}
