//! Chat state shared by every view.
//!
//! Messages are deduplicated by id, so history loads, pushed messages and
//! our own send echoes can arrive in any order and any number of times.
//! Unread counts are always derived from the stored messages; once a chat's
//! history has been loaded its count is exactly the number of unread
//! messages from the other party. The badge is the sum over all chats.

mod commands;

pub use commands::SendMessage;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};

use crate::api::events::{self, MarkReadEvent, TypingEvent};
use crate::api::models::{Chat, Message, MessageKind, MessagePayload, OutgoingMessage};
use crate::dispatch::{CommandDispatcher, CommandOutcome};
use crate::error::SyncError;
use crate::timer::{Ticket, TimerSet};
use crate::transport::{Subscription, TransportChannel};

pub const DEFAULT_TYPING_IDLE: Duration = Duration::from_millis(2_000);

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    MessageAppended {
        message: Message,
        /// The message came from the other party and its chat is not in view.
        notify: bool,
    },
    ChatOpened(String),
    ChatRead { chat_id: String, cleared: usize },
    TypingChanged(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    Inserted,
    Duplicate,
}

/// Result of [`ChatSyncEngine::send_message`]. A failed send hands the
/// draft back so the admin can retry it; nothing retries automatically.
#[derive(Debug, Clone, PartialEq)]
pub struct SendResult {
    pub outcome: CommandOutcome<Message>,
    pub retry: Option<OutgoingMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatView {
    pub active: Option<String>,
    pub minimized: bool,
}

impl ChatView {
    pub fn shows(&self, chat_id: &str) -> bool {
        !self.minimized && self.active.as_deref() == Some(chat_id)
    }
}

struct ChatEntry {
    chat: Chat,
    messages: Vec<Message>,
    ids: HashSet<String>,
    history_loaded: bool,
    /// Server-reported unread count, used until the history is loaded.
    server_unread: usize,
    /// Messages held when `server_unread` was reported; already part of it.
    counted: HashSet<String>,
}

impl ChatEntry {
    fn new(chat: Chat) -> Self {
        let server_unread = chat.unread_count;
        Self {
            chat,
            messages: Vec::new(),
            ids: HashSet::new(),
            history_loaded: false,
            server_unread,
            counted: HashSet::new(),
        }
    }

    fn insert(&mut self, msg: Message) -> bool {
        if !self.ids.insert(msg.id.clone()) {
            return false;
        }
        if self.chat.last_message_at.is_none_or(|t| msg.created_at >= t) {
            self.chat.last_message = Some(preview(&msg));
            self.chat.last_message_at = Some(msg.created_at);
        }
        self.messages.push(msg);
        true
    }

    fn recount(&mut self, me: &str) {
        let unread = self
            .messages
            .iter()
            .filter(|m| !m.is_read && m.sender_id != me)
            .filter(|m| self.history_loaded || !self.counted.contains(&m.id))
            .count();
        self.chat.unread_count = if self.history_loaded {
            unread
        } else {
            self.server_unread + unread
        };
    }

    /// Takes a fresh server count; every message held now is included in it.
    fn set_server_unread(&mut self, count: usize) {
        self.server_unread = count;
        self.counted = self.ids.clone();
    }

    /// Marks everything not written by `reader` as read.
    fn read_by(&mut self, reader: &str) {
        for msg in self.messages.iter_mut().filter(|m| m.sender_id != reader) {
            msg.is_read = true;
        }
    }
}

fn preview(msg: &Message) -> String {
    match msg.kind {
        MessageKind::Text => msg.content.clone(),
        MessageKind::Image => "[image]".to_string(),
        MessageKind::Location => "[location]".to_string(),
    }
}

#[derive(Default)]
struct ChatState {
    chats: HashMap<String, ChatEntry>,
    view: ChatView,
    typing: HashSet<(String, String)>,
    typing_expiry: TimerSet<(String, String)>,
    stop_typing: TimerSet<String>,
}

pub struct ChatSyncEngine {
    me: String,
    dispatcher: Arc<CommandDispatcher>,
    state: Mutex<ChatState>,
    events: broadcast::Sender<ChatEvent>,
    badge: watch::Sender<usize>,
    typing_idle: Duration,
    this: Weak<Self>,
}

impl ChatSyncEngine {
    pub fn new(me: &str, dispatcher: Arc<CommandDispatcher>, typing_idle: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let (badge, _) = watch::channel(0);
        Arc::new_cyclic(|this| Self {
            me: me.to_string(),
            dispatcher,
            state: Mutex::new(ChatState::default()),
            events,
            badge,
            typing_idle,
            this: this.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, ChatState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current_user(&self) -> &str {
        &self.me
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn unread_badge(&self) -> watch::Receiver<usize> {
        self.badge.subscribe()
    }

    pub fn total_unread(&self) -> usize {
        *self.badge.borrow()
    }

    pub fn view(&self) -> ChatView {
        self.state().view.clone()
    }

    pub fn chat(&self, chat_id: &str) -> Option<Chat> {
        self.state().chats.get(chat_id).map(|e| e.chat.clone())
    }

    /// Most recently active first.
    pub fn chats(&self) -> Vec<Chat> {
        let mut chats: Vec<Chat> = self.state().chats.values().map(|e| e.chat.clone()).collect();
        chats.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        chats
    }

    /// Messages in display order: by creation time, arrival order on ties.
    pub fn messages(&self, chat_id: &str) -> Vec<Message> {
        let mut messages = self
            .state()
            .chats
            .get(chat_id)
            .map(|e| e.messages.clone())
            .unwrap_or_default();
        messages.sort_by_key(|m| m.created_at);
        messages
    }

    pub fn typing_users(&self, chat_id: &str) -> Vec<String> {
        let mut users: Vec<String> = self
            .state()
            .typing
            .iter()
            .filter(|(chat, _)| chat == chat_id)
            .map(|(_, user)| user.clone())
            .collect();
        users.sort();
        users
    }

    fn publish_badge(&self) {
        let total = self.state().chats.values().map(|e| e.chat.unread_count).sum::<usize>();
        self.badge.send_if_modified(|badge| {
            if *badge == total {
                return false;
            }
            *badge = total;
            true
        });
    }

    fn emit_if_connected(&self, event: &str, data: Value) {
        let transport = self.dispatcher.transport();
        if !transport.is_connected() {
            return;
        }
        if let Err(e) = transport.emit(event, data) {
            log::debug!("{} not sent: {}", event, e);
        }
    }

    /// Adds a message to its chat, creating a placeholder chat if needed.
    /// Appending a message that is already stored changes nothing.
    pub fn append_message(&self, msg: Message) -> Appended {
        let notify = {
            let mut state = self.state();
            let notify = msg.sender_id != self.me && !state.view.shows(&msg.chat_id);
            let entry = state
                .chats
                .entry(msg.chat_id.clone())
                .or_insert_with(|| ChatEntry::new(Chat::from_message(&msg, &self.me)));
            if !entry.insert(msg.clone()) {
                return Appended::Duplicate;
            }
            entry.recount(&self.me);
            notify
        };
        self.publish_badge();
        let _ = self.events.send(ChatEvent::MessageAppended { message: msg, notify });
        Appended::Inserted
    }

    /// Refreshes the chat list, keeping any messages already held.
    pub async fn load_chats(&self) -> Result<usize, SyncError> {
        let chats = self.dispatcher.api().list_chats().await?;
        let count = chats.len();
        {
            let mut state = self.state();
            for chat in chats {
                match state.chats.get_mut(&chat.id) {
                    Some(entry) => {
                        if !entry.history_loaded {
                            entry.set_server_unread(chat.unread_count);
                        }
                        if chat.last_message_at > entry.chat.last_message_at {
                            entry.chat.last_message = chat.last_message;
                            entry.chat.last_message_at = chat.last_message_at;
                        }
                        entry.chat.customer_name = chat.customer_name.or(entry.chat.customer_name.take());
                        if !chat.customer_id.is_empty() {
                            entry.chat.customer_id = chat.customer_id;
                        }
                        if !chat.admin_id.is_empty() {
                            entry.chat.admin_id = chat.admin_id;
                        }
                        entry.recount(&self.me);
                    }
                    None => {
                        state.chats.insert(chat.id.clone(), ChatEntry::new(chat));
                    }
                }
            }
        }
        self.publish_badge();
        Ok(count)
    }

    /// Merges a chat's history. History is not announced as new messages.
    pub async fn load_messages(&self, chat_id: &str) -> Result<usize, SyncError> {
        let history = self.dispatcher.api().chat_messages(chat_id).await?;
        let inserted = {
            let mut state = self.state();
            if !state.chats.contains_key(chat_id) {
                let Some(first) = history.first() else {
                    return Ok(0);
                };
                let chat = Chat::from_message(first, &self.me);
                state.chats.insert(chat_id.to_string(), ChatEntry::new(chat));
            }
            let Some(entry) = state.chats.get_mut(chat_id) else {
                return Ok(0);
            };
            let inserted = history.into_iter().filter(|m| entry.insert(m.clone())).count();
            entry.history_loaded = true;
            entry.recount(&self.me);
            inserted
        };
        self.publish_badge();
        Ok(inserted)
    }

    /// Clears the chat's unread messages locally and tells the server over
    /// both transports. The REST call is not awaited.
    pub fn mark_as_read(&self, chat_id: &str) -> usize {
        let cleared = {
            let mut state = self.state();
            let Some(entry) = state.chats.get_mut(chat_id) else {
                return 0;
            };
            let cleared = entry.chat.unread_count;
            entry.read_by(&self.me);
            entry.server_unread = 0;
            entry.recount(&self.me);
            cleared
        };
        self.publish_badge();

        self.emit_if_connected(
            events::MARK_AS_READ,
            json!({ "chatId": chat_id, "userId": self.me }),
        );
        let api = self.dispatcher.api().clone();
        let chat = chat_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = api.mark_read(&chat).await {
                log::error!("mark-read for chat {} failed: {}", chat, e);
            }
        });

        let _ = self.events.send(ChatEvent::ChatRead {
            chat_id: chat_id.to_string(),
            cleared,
        });
        cleared
    }

    /// Someone else read the chat: everything they did not write is read.
    fn apply_remote_read(&self, chat_id: &str, reader: &str) {
        {
            let mut state = self.state();
            let Some(entry) = state.chats.get_mut(chat_id) else {
                return;
            };
            entry.read_by(reader);
            if reader == self.me {
                entry.server_unread = 0;
            }
            entry.recount(&self.me);
        }
        self.publish_badge();
    }

    /// Brings a chat into view: joins its room, loads its history and marks
    /// it read.
    pub async fn open_chat(&self, chat_id: &str) -> Result<(), SyncError> {
        {
            let mut state = self.state();
            state.view = ChatView {
                active: Some(chat_id.to_string()),
                minimized: false,
            };
        }
        self.emit_if_connected(events::JOIN_CHAT, json!({ "chatId": chat_id }));
        let _ = self.events.send(ChatEvent::ChatOpened(chat_id.to_string()));

        let loaded = self.load_messages(chat_id).await;
        if let Err(e) = &loaded {
            log::warn!("history for chat {} not loaded: {}", chat_id, e);
        }
        self.mark_as_read(chat_id);
        loaded.map(|_| ())
    }

    /// Leaves the active chat, ending our typing indicator there.
    pub fn close_chat(&self) {
        let closed = self.state().view.active.take();
        if let Some(chat_id) = closed {
            self.stop_typing(&chat_id);
        }
    }

    pub fn set_minimized(&self, minimized: bool) {
        self.state().view.minimized = minimized;
    }

    /// Sends over REST, then stores the server's copy and announces it on
    /// the realtime channel.
    pub async fn send_message(
        &self,
        chat_id: &str,
        content: &str,
        kind: MessageKind,
        payload: MessagePayload,
    ) -> SendResult {
        let receiver_id = self
            .chat(chat_id)
            .map(|c| if c.customer_id == self.me { c.admin_id } else { c.customer_id })
            .unwrap_or_default();
        self.resend(OutgoingMessage {
            chat_id: chat_id.to_string(),
            receiver_id,
            content: content.to_string(),
            kind,
            payload,
        })
        .await
    }

    /// Sends a draft, typically one handed back by a failed send.
    pub async fn resend(&self, draft: OutgoingMessage) -> SendResult {
        let command = SendMessage { draft };
        let outcome = self.dispatcher.execute(&command).await;
        if let (true, Some(msg)) = (outcome.success, outcome.value.clone()) {
            match serde_json::to_value(&msg) {
                Ok(data) => self.emit_if_connected(events::SEND_MESSAGE, data),
                Err(e) => log::warn!("message {} not announced: {}", msg.id, e),
            }
            self.append_message(msg);
            return SendResult { outcome, retry: None };
        }

        log::warn!(
            "message to chat {} not sent: {}",
            command.draft.chat_id,
            outcome.error.as_ref().map(ToString::to_string).unwrap_or_default()
        );
        SendResult {
            outcome,
            retry: Some(command.draft),
        }
    }

    /// Announces that the admin is typing. Each call pushes the automatic
    /// stop further out; only one stop is ever pending per chat.
    pub fn set_typing(&self, chat_id: &str) {
        self.emit_if_connected(events::TYPING, json!({ "chatId": chat_id, "userId": self.me }));
        let this = self.this.clone();
        let chat = chat_id.to_string();
        self.state()
            .stop_typing
            .schedule(chat_id.to_string(), self.typing_idle, move |ticket| {
                let Some(engine) = this.upgrade() else { return };
                let current = engine.state().stop_typing.finish(&chat, ticket);
                if current {
                    engine.send_stop_typing(&chat);
                }
            });
    }

    /// Stops the typing indicator now instead of waiting for the idle timer.
    pub fn stop_typing(&self, chat_id: &str) {
        let pending = {
            let mut state = self.state();
            let pending = state.stop_typing.is_pending(&chat_id.to_string());
            state.stop_typing.cancel(&chat_id.to_string());
            pending
        };
        if pending {
            self.send_stop_typing(chat_id);
        }
    }

    fn send_stop_typing(&self, chat_id: &str) {
        self.emit_if_connected(
            events::STOP_TYPING,
            json!({ "chatId": chat_id, "userId": self.me }),
        );
    }

    fn remote_typing(&self, ev: TypingEvent, typing: bool) {
        if ev.user_id == self.me {
            return;
        }
        let key = (ev.chat_id.clone(), ev.user_id);
        let changed = {
            let mut state = self.state();
            if typing {
                let this = self.this.clone();
                let expired = key.clone();
                state.typing_expiry.schedule(key.clone(), self.typing_idle, move |ticket| {
                    if let Some(engine) = this.upgrade() {
                        engine.expire_remote_typing(&expired, ticket);
                    }
                });
                state.typing.insert(key)
            } else {
                state.typing_expiry.cancel(&key);
                state.typing.remove(&key)
            }
        };
        if changed {
            let _ = self.events.send(ChatEvent::TypingChanged(ev.chat_id));
        }
    }

    /// Drops an indicator whose expiry fired, unless a newer typing event
    /// rescheduled it meanwhile.
    fn expire_remote_typing(&self, key: &(String, String), ticket: Ticket) {
        let removed = {
            let mut state = self.state();
            state.typing_expiry.finish(key, ticket) && state.typing.remove(key)
        };
        if removed {
            log::debug!("typing indicator for {} in chat {} expired", key.1, key.0);
            let _ = self.events.send(ChatEvent::TypingChanged(key.0.clone()));
        }
    }

    /// Registers the inbound chat handlers. They stay registered across
    /// reconnects; the active chat's room is rejoined on each connect.
    pub fn attach(self: &Arc<Self>, transport: &TransportChannel) -> Vec<Subscription> {
        let weak = Arc::downgrade(self);
        vec![
            transport.on(events::RECEIVE_MESSAGE, Self::message_handler(weak.clone())),
            transport.on(events::SEND_MESSAGE, Self::message_handler(weak.clone())),
            transport.on(events::TYPING, Self::typing_handler(weak.clone(), true)),
            transport.on(events::STOP_TYPING, Self::typing_handler(weak.clone(), false)),
            transport.on(events::MARK_AS_READ, {
                let weak = weak.clone();
                move |data: &Value| {
                    let Some(engine) = weak.upgrade() else { return };
                    match serde_json::from_value::<MarkReadEvent>(data.clone()) {
                        Ok(ev) => engine.apply_remote_read(&ev.chat_id, &ev.user_id),
                        Err(e) => log::warn!("bad markAsRead payload: {}", e),
                    }
                }
            }),
            transport.on(events::CONNECT, move |_: &Value| {
                let Some(engine) = weak.upgrade() else { return };
                if let Some(chat_id) = engine.view().active {
                    engine.emit_if_connected(events::JOIN_CHAT, json!({ "chatId": chat_id }));
                }
            }),
        ]
    }

    fn message_handler(engine: Weak<Self>) -> impl Fn(&Value) + Send + Sync + 'static {
        move |data| {
            let Some(engine) = engine.upgrade() else { return };
            let body = data.get("message").filter(|m| m.is_object()).unwrap_or(data);
            match serde_json::from_value::<Message>(body.clone()) {
                Ok(msg) => {
                    engine.append_message(msg);
                }
                Err(e) => log::warn!("bad message payload: {}", e),
            }
        }
    }

    fn typing_handler(engine: Weak<Self>, typing: bool) -> impl Fn(&Value) + Send + Sync + 'static {
        move |data| {
            let Some(engine) = engine.upgrade() else { return };
            match serde_json::from_value::<TypingEvent>(data.clone()) {
                Ok(ev) => engine.remote_typing(ev, typing),
                Err(e) => log::warn!("bad typing payload: {}", e),
            }
        }
    }

    /// Cancels every timer the engine owns.
    pub fn dispose(&self) {
        let mut state = self.state();
        state.stop_typing.cancel_all();
        state.typing_expiry.cancel_all();
        state.typing.clear();
    }
}
