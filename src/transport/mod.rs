//! The realtime half of the dual transport.
//!
//! One [`TransportChannel`] exists per signed-in session and is owned by the
//! dashboard root. Handlers are kept in a registry that outlives any single
//! socket, so reconnecting neither loses nor duplicates them; each
//! registration is a [`Subscription`] that unregisters itself on drop.

mod registry;
mod ws;

pub use registry::{Handler, HandlerRegistry, Subscription};
pub use ws::{Connector, Link, WsConnector};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use url::Url;

use crate::api::events::{self, Envelope};
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct Active {
    generation: u64,
    outbound: mpsc::UnboundedSender<Envelope>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Active {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

pub struct TransportChannel {
    url: Url,
    connector: Arc<dyn Connector>,
    registry: Arc<HandlerRegistry>,
    state: Arc<watch::Sender<ConnectionState>>,
    active: Arc<Mutex<Option<Active>>>,
    generation: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
}

fn lock(slot: &Mutex<Option<Active>>) -> MutexGuard<'_, Option<Active>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

impl TransportChannel {
    pub fn new(url: Url, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            url,
            connector,
            registry: HandlerRegistry::new(),
            state: Arc::new(state),
            active: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Opens the socket with `token` attached. A no-op when already
    /// connected; concurrent callers wait for the first attempt.
    pub async fn connect(&self, token: &str) -> Result<(), SyncError> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        self.state.send_replace(ConnectionState::Connecting);

        let link = match self.connector.connect(&self.url, token).await {
            Ok(link) => link,
            Err(e) => {
                self.state.send_replace(ConnectionState::Disconnected);
                log::warn!("realtime connect to {} failed: {}", self.url, e);
                self.registry
                    .dispatch(events::CONNECT_ERROR, &json!({ "message": e.to_string() }));
                return Err(e);
            }
        };

        let Link { outbound, mut inbound, mut tasks } = link;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        {
            // Held across the spawn so the pump cannot observe the slot
            // before this link is stored in it.
            let mut slot = lock(&self.active);
            let registry = self.registry.clone();
            let state = self.state.clone();
            let active = self.active.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(envelope) = inbound.recv().await {
                    log::debug!("<- {}", envelope.event);
                    registry.dispatch(&envelope.event, &envelope.data);
                }
                let ended = {
                    let mut slot = lock(&active);
                    if slot.as_ref().is_some_and(|a| a.generation == generation) {
                        slot.take()
                    } else {
                        None
                    }
                };
                if ended.is_some() {
                    log::info!("realtime link closed by peer");
                    state.send_replace(ConnectionState::Disconnected);
                    registry.dispatch(events::DISCONNECT, &json!({ "reason": "transport close" }));
                }
                // Dropping `ended` aborts this task's own handle; nothing awaits after this.
                drop(ended);
            }));
            *slot = Some(Active { generation, outbound, tasks });
            self.state.send_replace(ConnectionState::Connected);
        }

        log::info!("realtime channel connected ({})", self.url);
        self.registry.dispatch(events::CONNECT, &Value::Null);
        Ok(())
    }

    /// Same as [`connect`](Self::connect); named for the periodic backstop.
    pub async fn ensure_connected(&self, token: &str) -> Result<(), SyncError> {
        self.connect(token).await
    }

    pub fn disconnect(&self) {
        let taken = lock(&self.active).take();
        if let Some(active) = taken {
            drop(active);
            self.state.send_replace(ConnectionState::Disconnected);
            log::info!("realtime channel disconnected");
            self.registry
                .dispatch(events::DISCONNECT, &json!({ "reason": "io client disconnect" }));
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Publishes one frame. Fails with `NotConnected` when there is no link.
    pub fn emit(&self, event: &str, data: Value) -> Result<(), SyncError> {
        let slot = lock(&self.active);
        let active = slot.as_ref().ok_or(SyncError::NotConnected)?;
        log::debug!("-> {}", event);
        active
            .outbound
            .send(Envelope::new(event, data))
            .map_err(|_| SyncError::NotConnected)
    }

    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.registry.register(event, Arc::new(handler))
    }

    pub fn off(&self, subscription: &Subscription) -> bool {
        subscription.cancel()
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.registry.handler_count(event)
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        lock(&self.active).take();
    }
}
