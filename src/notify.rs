//! Short-lived alerts for messages that arrive outside the chat in view.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::api::models::Message;
use crate::chat::{ChatEvent, ChatSyncEngine};
use crate::error::SyncError;
use crate::timer::TimerSet;

pub const DEFAULT_NOTIFICATION_TTL: Duration = Duration::from_millis(10_000);

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationItem {
    pub id: Uuid,
    pub chat_id: String,
    pub message: Message,
    pub customer_name: String,
    pub expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    items: Vec<NotificationItem>,
    expiry: TimerSet<Uuid>,
}

pub struct NotificationBroker {
    chats: Arc<ChatSyncEngine>,
    ttl: Duration,
    inner: Mutex<Inner>,
    published: watch::Sender<Vec<NotificationItem>>,
    this: Weak<Self>,
}

impl NotificationBroker {
    pub fn new(chats: Arc<ChatSyncEngine>, ttl: Duration) -> Arc<Self> {
        let (published, _) = watch::channel(Vec::new());
        Arc::new_cyclic(|this| Self {
            chats,
            ttl,
            inner: Mutex::new(Inner::default()),
            published,
            this: this.clone(),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn items(&self) -> Vec<NotificationItem> {
        self.inner().items.clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<NotificationItem>> {
        self.published.subscribe()
    }

    /// Follows the chat engine's events until the engine goes away or the
    /// returned task is aborted.
    pub fn start(&self) -> JoinHandle<()> {
        let mut events = self.chats.subscribe();
        let this = self.this.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match this.upgrade() {
                        Some(broker) => broker.handle_event(&event),
                        None => break,
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("notification broker skipped {} chat events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn handle_event(&self, event: &ChatEvent) {
        match event {
            ChatEvent::MessageAppended { message, notify: true } => self.publish(message),
            ChatEvent::ChatOpened(chat_id) => {
                self.dismiss_chat(chat_id);
            }
            _ => {}
        }
    }

    fn publish(&self, message: &Message) {
        let customer_name = self
            .chats
            .chat(&message.chat_id)
            .map(|c| c.display_name().to_string())
            .unwrap_or_else(|| "Customer".to_string());

        let mut inner = self.inner();
        if inner
            .items
            .iter()
            .any(|n| n.chat_id == message.chat_id && n.message.id == message.id)
        {
            return;
        }
        let item = NotificationItem {
            id: Uuid::new_v4(),
            chat_id: message.chat_id.clone(),
            message: message.clone(),
            customer_name,
            expires_at: Instant::now() + self.ttl,
        };
        let id = item.id;
        let this = self.this.clone();
        inner.expiry.schedule(id, self.ttl, move |_| {
            if let Some(broker) = this.upgrade() {
                broker.dismiss(id);
            }
        });
        log::debug!("notification {} for chat {}", id, item.chat_id);
        inner.items.push(item);
        self.published.send_replace(inner.items.clone());
    }

    pub fn dismiss(&self, id: Uuid) -> bool {
        let mut inner = self.inner();
        inner.expiry.cancel(&id);
        let before = inner.items.len();
        inner.items.retain(|n| n.id != id);
        let removed = inner.items.len() != before;
        if removed {
            self.published.send_replace(inner.items.clone());
        }
        removed
    }

    pub fn dismiss_chat(&self, chat_id: &str) -> usize {
        let mut inner = self.inner();
        let (gone, kept): (Vec<_>, Vec<_>) =
            inner.items.drain(..).partition(|n| n.chat_id == chat_id);
        inner.items = kept;
        for item in &gone {
            inner.expiry.cancel(&item.id);
        }
        if !gone.is_empty() {
            self.published.send_replace(inner.items.clone());
        }
        gone.len()
    }

    /// Clears the chat's alerts and opens it, which also marks it read.
    pub async fn open_chat(&self, chat_id: &str) -> Result<(), SyncError> {
        self.dismiss_chat(chat_id);
        self.chats.open_chat(chat_id).await
    }

    pub fn dispose(&self) {
        let mut inner = self.inner();
        inner.expiry.cancel_all();
        inner.items.clear();
        self.published.send_replace(Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{CommandDispatcher, DEFAULT_ACK_TIMEOUT};
    use crate::testing::{chat, message, FakeRest, LoopbackConnector, RestCall};
    use crate::transport::TransportChannel;
    use url::Url;

    fn broker(rest: Arc<FakeRest>) -> (Arc<NotificationBroker>, Arc<ChatSyncEngine>) {
        let transport = Arc::new(TransportChannel::new(
            Url::parse("ws://shop.test/socket").unwrap(),
            LoopbackConnector::new(),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(transport, rest, DEFAULT_ACK_TIMEOUT));
        let chats = ChatSyncEngine::new("A1", dispatcher, Duration::from_millis(2_000));
        (NotificationBroker::new(chats.clone(), DEFAULT_NOTIFICATION_TTL), chats)
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_messages_raise_one_expiring_alert() {
        let rest = FakeRest::new().with_chat(chat("C1", "U1", "A1"), Vec::new());
        let (broker, chats) = broker(rest);
        chats.load_chats().await.unwrap();
        let _task = broker.start();
        let mut watch = broker.watch();

        chats.append_message(message("M1", "C1", "U1", 1));
        chats.append_message(message("M1", "C1", "U1", 1));
        tokio::time::sleep(Duration::from_millis(1)).await;

        let items = broker.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].customer_name, "Customer U1");
        assert!(watch.has_changed().unwrap());
        assert_eq!(watch.borrow_and_update().len(), 1);

        tokio::time::sleep(Duration::from_millis(9_990)).await;
        assert_eq!(broker.items().len(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(broker.items().is_empty());
        assert!(watch.borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_events_for_one_message_are_suppressed() {
        let (broker, _chats) = broker(FakeRest::new());
        let event = ChatEvent::MessageAppended {
            message: message("M1", "C1", "U1", 1),
            notify: true,
        };

        broker.handle_event(&event);
        broker.handle_event(&event);

        assert_eq!(broker.items().len(), 1);
        assert_eq!(broker.items()[0].customer_name, "Customer");
    }

    #[tokio::test(start_paused = true)]
    async fn own_and_visible_messages_stay_quiet() {
        let rest = FakeRest::new().with_chat(chat("C1", "U1", "A1"), Vec::new());
        let (broker, chats) = broker(rest);
        let _task = broker.start();
        chats.open_chat("C1").await.unwrap();

        chats.append_message(message("M1", "C1", "U1", 1));
        chats.append_message(message("M2", "C2", "A1", 2));
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(broker.items().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn opening_a_chat_clears_its_alerts_and_marks_it_read() {
        let rest = FakeRest::new().with_chat(chat("C1", "U1", "A1"), Vec::new());
        let (broker, chats) = broker(rest.clone());
        chats.load_chats().await.unwrap();
        let _task = broker.start();
        chats.append_message(message("M1", "C1", "U1", 1));
        chats.append_message(message("M2", "C1", "U1", 2));
        chats.append_message(message("M3", "C2", "U2", 3));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(broker.items().len(), 3);

        broker.open_chat("C1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let left = broker.items();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].chat_id, "C2");
        assert_eq!(chats.chat("C1").unwrap().unread_count, 0);
        assert_eq!(rest.count(|c| *c == RestCall::MarkRead("C1".into())), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dismissal_cancels_the_expiry_timer() {
        let (broker, _chats) = broker(FakeRest::new());
        broker.handle_event(&ChatEvent::MessageAppended {
            message: message("M1", "C1", "U1", 1),
            notify: true,
        });
        let id = broker.items()[0].id;

        assert!(broker.dismiss(id));
        assert!(!broker.dismiss(id));
        assert!(broker.inner().expiry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_drops_everything() {
        let (broker, _chats) = broker(FakeRest::new());
        for id in ["M1", "M2"] {
            broker.handle_event(&ChatEvent::MessageAppended {
                message: message(id, "C1", "U1", 1),
                notify: true,
            });
        }

        broker.dispose();

        assert!(broker.items().is_empty());
        assert!(broker.inner().expiry.is_empty());
    }
}
