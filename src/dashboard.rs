//! Root of a signed-in session.
//!
//! Owns the realtime channel and everything built on it. `init` wires the
//! engines to the channel and starts the periodic refresh; `dispose` (or
//! dropping the dashboard) tears all of it down again.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::api::events;
use crate::api::{ApiClient, RestApi};
use crate::app::AppState;
use crate::chat::ChatSyncEngine;
use crate::dispatch::CommandDispatcher;
use crate::error::SyncError;
use crate::notify::NotificationBroker;
use crate::status::StatusSyncEngine;
use crate::transport::{Connector, Subscription, TransportChannel, WsConnector};

pub struct Dashboard {
    transport: Arc<TransportChannel>,
    dispatcher: Arc<CommandDispatcher>,
    status: Arc<StatusSyncEngine>,
    chats: Arc<ChatSyncEngine>,
    notifications: Arc<NotificationBroker>,
    subscriptions: Vec<Subscription>,
    tasks: Vec<JoinHandle<()>>,
}

impl Dashboard {
    pub async fn init(state: &AppState) -> Result<Self, SyncError> {
        let api = Arc::new(ApiClient::new(&state.base_url, state.token.clone()));
        Self::init_with(state, api, Arc::new(WsConnector)).await
    }

    /// Same as [`init`](Self::init) over caller-supplied transports.
    pub async fn init_with(
        state: &AppState,
        api: Arc<dyn RestApi>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, SyncError> {
        let (Some(token), Some(user)) = (state.token.clone(), state.user.as_ref()) else {
            return Err(SyncError::Config("no saved session, sign in first".to_string()));
        };
        let settings = &state.sync;

        let transport = Arc::new(TransportChannel::new(state.realtime_url()?, connector));
        let dispatcher = Arc::new(CommandDispatcher::new(
            transport.clone(),
            api,
            settings.ack_timeout(),
        ));
        let status = StatusSyncEngine::new(dispatcher.clone(), settings.refetch_after_realtime);
        let chats = ChatSyncEngine::new(&user.id, dispatcher.clone(), settings.typing_idle());
        let notifications = NotificationBroker::new(chats.clone(), settings.notification_ttl());

        let mut subscriptions = chats.attach(&transport);
        subscriptions.extend(status.attach(&transport));
        subscriptions.push(transport.on(events::CONNECT_ERROR, |data: &Value| {
            log::warn!("realtime unavailable: {}", data);
        }));
        subscriptions.push(transport.on(events::DISCONNECT, |_: &Value| {
            log::info!("realtime disconnected, commands will use REST");
        }));

        let mut tasks = vec![notifications.start()];

        if let Err(e) = transport.connect(&token).await {
            log::warn!("starting without realtime: {}", e);
        }
        if let Err(e) = chats.load_chats().await {
            log::warn!("initial chat list not loaded: {}", e);
        }

        tasks.push(spawn_refresh(
            settings.refresh_interval(),
            token,
            transport.clone(),
            chats.clone(),
            status.clone(),
        ));

        log::info!("dashboard ready for {} ({})", user.username, user.role);
        Ok(Self {
            transport,
            dispatcher,
            status,
            chats,
            notifications,
            subscriptions,
            tasks,
        })
    }

    pub fn transport(&self) -> &Arc<TransportChannel> {
        &self.transport
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn status(&self) -> &Arc<StatusSyncEngine> {
        &self.status
    }

    pub fn chats(&self) -> &Arc<ChatSyncEngine> {
        &self.chats
    }

    pub fn notifications(&self) -> &Arc<NotificationBroker> {
        &self.notifications
    }

    pub fn dispose(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.subscriptions.clear();
        self.notifications.dispose();
        self.chats.dispose();
        self.transport.disconnect();
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The consistency backstop: reconnect if needed, then pull chats and
/// tracked orders from REST.
fn spawn_refresh(
    period: Duration,
    token: String,
    transport: Arc<TransportChannel>,
    chats: Arc<ChatSyncEngine>,
    status: Arc<StatusSyncEngine>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = transport.ensure_connected(&token).await {
                log::debug!("realtime still unavailable: {}", e);
            }
            if let Err(e) = chats.load_chats().await {
                log::warn!("chat refresh failed: {}", e);
            }
            let refreshed = status.refresh_tracked().await;
            log::debug!("refresh done, {} orders reconciled", refreshed);
        }
    })
}
