//! In-memory stand-ins for both transports.
//!
//! `FakeRest` behaves like a small backend (it remembers orders and applies
//! status changes) and records every call; `LoopbackConnector` hands out
//! links whose far end the test drives through [`ServerEnd`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use crate::api::events::Envelope;
use crate::api::models::{
    Chat, Message, MessageKind, Order, OrderStatus, OutgoingMessage, Payment, PaymentStatus,
};
use crate::api::RestApi;
use crate::error::SyncError;
use crate::transport::{Connector, Link};

fn guard<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap_or_default()
}

pub fn message(id: &str, chat_id: &str, sender_id: &str, secs: i64) -> Message {
    Message {
        id: id.to_string(),
        chat_id: chat_id.to_string(),
        sender_id: sender_id.to_string(),
        receiver_id: String::new(),
        content: format!("message {}", id),
        kind: MessageKind::Text,
        payload: None,
        created_at: at(secs),
        is_read: false,
    }
}

pub fn chat(id: &str, customer_id: &str, admin_id: &str) -> Chat {
    Chat {
        id: id.to_string(),
        customer_id: customer_id.to_string(),
        admin_id: admin_id.to_string(),
        customer_name: Some(format!("Customer {}", customer_id)),
        last_message: None,
        last_message_at: None,
        unread_count: 0,
    }
}

pub fn order(id: &str, status: OrderStatus, payment: PaymentStatus) -> Order {
    Order {
        id: id.to_string(),
        order_status: status,
        payment: Some(Payment {
            id: format!("P-{}", id),
            status: payment,
        }),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RestCall {
    ListChats,
    ChatMessages(String),
    SendMessage(OutgoingMessage),
    MarkRead(String),
    ChangeOrderStatus(String, OrderStatus),
    ChangePaymentStatus(String, PaymentStatus),
    OrderDetail(String),
}

#[derive(Default)]
pub struct FakeRest {
    calls: Mutex<Vec<RestCall>>,
    chats: Mutex<Vec<Chat>>,
    messages: Mutex<HashMap<String, Vec<Message>>>,
    orders: Mutex<HashMap<String, Order>>,
    failures: Mutex<HashMap<&'static str, VecDeque<SyncError>>>,
    sent: AtomicUsize,
}

impl FakeRest {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_order(self: Arc<Self>, order: Order) -> Arc<Self> {
        guard(&self.orders).insert(order.id.clone(), order);
        self
    }

    pub fn with_chat(self: Arc<Self>, chat: Chat, history: Vec<Message>) -> Arc<Self> {
        guard(&self.messages).insert(chat.id.clone(), history);
        guard(&self.chats).push(chat);
        self
    }

    /// The next call to `method` fails with `err` instead of doing its work.
    pub fn fail_next(&self, method: &'static str, err: SyncError) {
        guard(&self.failures).entry(method).or_default().push_back(err);
    }

    pub fn calls(&self) -> Vec<RestCall> {
        guard(&self.calls).clone()
    }

    pub fn count(&self, pred: impl Fn(&RestCall) -> bool) -> usize {
        guard(&self.calls).iter().filter(|c| pred(c)).count()
    }

    /// Changes server-side truth without going through the API, as another
    /// admin or the realtime server would.
    pub fn put_order(&self, order: Order) {
        guard(&self.orders).insert(order.id.clone(), order);
    }

    /// Replaces the server's copy of a chat, as a refetch would see it.
    pub fn put_chat(&self, chat: Chat) {
        let mut chats = guard(&self.chats);
        match chats.iter_mut().find(|c| c.id == chat.id) {
            Some(existing) => *existing = chat,
            None => chats.push(chat),
        }
    }

    pub fn stored_order(&self, id: &str) -> Option<Order> {
        guard(&self.orders).get(id).cloned()
    }

    async fn enter(&self, method: &'static str, call: RestCall) -> Result<(), SyncError> {
        guard(&self.calls).push(call);
        match guard(&self.failures).get_mut(method).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RestApi for FakeRest {
    async fn list_chats(&self) -> Result<Vec<Chat>, SyncError> {
        self.enter("list_chats", RestCall::ListChats).await?;
        Ok(guard(&self.chats).clone())
    }

    async fn chat_messages(&self, chat_id: &str) -> Result<Vec<Message>, SyncError> {
        self.enter("chat_messages", RestCall::ChatMessages(chat_id.to_string())).await?;
        Ok(guard(&self.messages).get(chat_id).cloned().unwrap_or_default())
    }

    async fn send_message(&self, draft: &OutgoingMessage) -> Result<Message, SyncError> {
        self.enter("send_message", RestCall::SendMessage(draft.clone())).await?;
        let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Message {
            id: format!("srv-{}", n),
            chat_id: draft.chat_id.clone(),
            sender_id: "A1".to_string(),
            receiver_id: draft.receiver_id.clone(),
            content: draft.content.clone(),
            kind: draft.kind,
            payload: None,
            created_at: at(1_000 + n as i64),
            is_read: false,
        })
    }

    async fn mark_read(&self, chat_id: &str) -> Result<(), SyncError> {
        self.enter("mark_read", RestCall::MarkRead(chat_id.to_string())).await
    }

    async fn change_order_status(&self, order_id: &str, status: OrderStatus) -> Result<(), SyncError> {
        self.enter(
            "change_order_status",
            RestCall::ChangeOrderStatus(order_id.to_string(), status),
        )
        .await?;
        if let Some(order) = guard(&self.orders).get_mut(order_id) {
            order.order_status = status;
        }
        Ok(())
    }

    async fn change_payment_status(
        &self,
        payment_id: &str,
        status: PaymentStatus,
    ) -> Result<(), SyncError> {
        self.enter(
            "change_payment_status",
            RestCall::ChangePaymentStatus(payment_id.to_string(), status),
        )
        .await?;
        for order in guard(&self.orders).values_mut() {
            if let Some(payment) = order.payment.as_mut().filter(|p| p.id == payment_id) {
                payment.status = status;
            }
        }
        Ok(())
    }

    async fn order_detail(&self, order_id: &str) -> Result<Order, SyncError> {
        self.enter("order_detail", RestCall::OrderDetail(order_id.to_string())).await?;
        guard(&self.orders).get(order_id).cloned().ok_or(SyncError::NotFound)
    }
}

/// The server side of a loopback link.
pub struct ServerEnd {
    to_client: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    from_client: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
}

impl ServerEnd {
    pub fn push(&self, event: &str, data: Value) {
        if let Some(tx) = guard(&self.to_client).as_ref() {
            let _ = tx.send(Envelope::new(event, data));
        }
    }

    /// Closes the server half, as a dropped connection would.
    pub fn hang_up(&self) {
        guard(&self.to_client).take();
    }

    /// Waits for the next frame the client sent.
    pub async fn next(&self) -> Option<Envelope> {
        self.from_client.lock().await.recv().await
    }

    /// Everything the client has sent so far.
    pub fn drain(&self) -> Vec<Envelope> {
        let Ok(mut rx) = self.from_client.try_lock() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }
}

#[derive(Default)]
struct LoopState {
    server: Option<Arc<ServerEnd>>,
    connects: usize,
    last_token: Option<String>,
    fail_next: bool,
}

#[derive(Default)]
pub struct LoopbackConnector {
    state: Mutex<LoopState>,
}

impl LoopbackConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Far end of the most recent link.
    pub fn server(&self) -> Option<Arc<ServerEnd>> {
        guard(&self.state).server.clone()
    }

    pub fn connect_count(&self) -> usize {
        guard(&self.state).connects
    }

    pub fn last_token(&self) -> Option<String> {
        guard(&self.state).last_token.clone()
    }

    pub fn fail_next_connect(&self) {
        guard(&self.state).fail_next = true;
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, _url: &Url, token: &str) -> Result<Link, SyncError> {
        let mut state = guard(&self.state);
        if std::mem::take(&mut state.fail_next) {
            return Err(SyncError::Transport("connection refused".into()));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        state.server = Some(Arc::new(ServerEnd {
            to_client: Mutex::new(Some(in_tx)),
            from_client: tokio::sync::Mutex::new(out_rx),
        }));
        state.connects += 1;
        state.last_token = Some(token.to_string());
        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
            tasks: Vec::new(),
        })
    }
}
