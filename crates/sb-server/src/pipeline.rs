//! The event pipeline component
//!
//! Owns the automation handler and the receiving end of the event channel.
//! Events are processed one at a time on a single task, which gives every
//! entity key arrival-order semantics for state, ledgers, and timers.
//!
//! Stopping parks the receiver so the component can be started again; a
//! failed reload restarts the previous graph, pipeline included.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use sb_automation::AutomationHandler;
use sb_core::{Component, EventSender, RawEvent};

pub struct Pipeline {
    handler: Arc<AutomationHandler>,
    receiver: Arc<Mutex<Option<mpsc::Receiver<RawEvent>>>>,
    // Keeps the channel open even when no source is configured.
    _keepalive: EventSender,
    running: Arc<AtomicBool>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn new(
        handler: AutomationHandler,
        keepalive: EventSender,
        receiver: mpsc::Receiver<RawEvent>,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
            receiver: Arc::new(Mutex::new(Some(receiver))),
            _keepalive: keepalive,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

}

#[async_trait]
impl Component for Pipeline {
    fn name(&self) -> &'static str {
        "automations"
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(mut receiver) = self.receiver.lock().await.take() else {
            self.running.store(false, Ordering::SeqCst);
            return Err(anyhow::anyhow!("event pipeline receiver is gone"));
        };

        info!(
            rules = self.handler.runner_count(),
            "Starting automation pipeline"
        );

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        *self.shutdown.lock().await = Some(shutdown_tx);

        let handler = self.handler.clone();
        let running = self.running.clone();
        let slot = self.receiver.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    event = receiver.recv() => match event {
                        Some(event) => handler.handle_event(event),
                        None => break,
                    },
                }
            }
            // Park the receiver so the component can be restarted.
            *slot.lock().await = Some(receiver);
            running.store(false, Ordering::SeqCst);
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        info!("Stopping automation pipeline");
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        // Cancel outstanding timers and wait for in-flight actions.
        self.handler.stop().await;
    }
}
