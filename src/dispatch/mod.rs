//! "Try realtime, fall back to REST."
//!
//! A [`Command`] describes one logical mutation: its target key, an optional
//! realtime route, and its REST equivalent. [`CommandDispatcher::execute`]
//! publishes it on the realtime channel when connected and races the
//! acknowledgment against an error event, a disconnect and the fallback timer.
//! Anything other than an ack or a business rejection ends in exactly one
//! REST request. The result is always a [`CommandOutcome`], never an `Err`.

mod pending;

pub use pending::{
    CommandKey, CommandKind, ConflictPolicy, PendingCommand, PendingCommands, PendingGuard,
};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::api::events::{self, ErrorEvent, CORRELATION_FIELD};
use crate::api::RestApi;
use crate::error::SyncError;
use crate::transport::TransportChannel;

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(10_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Realtime,
    Rest,
    /// Applied locally from the last snapshot; not server-confirmed.
    Local,
    /// Nothing was sent (no-op transition, or the key was busy).
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome<T> {
    pub success: bool,
    pub method: Method,
    pub value: Option<T>,
    pub error: Option<SyncError>,
}

impl<T> CommandOutcome<T> {
    pub fn ok(method: Method, value: T) -> Self {
        Self {
            success: true,
            method,
            value: Some(value),
            error: None,
        }
    }

    pub fn failed(method: Method, error: SyncError) -> Self {
        Self {
            success: false,
            method,
            value: None,
            error: Some(error),
        }
    }

    pub fn skipped() -> Self {
        Self {
            success: true,
            method: Method::Skipped,
            value: None,
            error: None,
        }
    }

    /// Succeeded, but only as a local patch.
    pub fn is_degraded(&self) -> bool {
        self.success && self.method == Method::Local
    }

    /// The message to show the admin, if any.
    pub fn user_message(&self) -> Option<String> {
        if self.success {
            return None;
        }
        self.error
            .as_ref()
            .filter(|e| e.is_user_visible())
            .map(ToString::to_string)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CommandOutcome<U> {
        CommandOutcome {
            success: self.success,
            method: self.method,
            value: self.value.map(f),
            error: self.error,
        }
    }
}

/// How a command travels on the realtime channel.
#[derive(Debug, Clone)]
pub struct RealtimeRoute {
    pub event: &'static str,
    pub ack_event: &'static str,
    /// Payload field holding the entity key; used when the ack does not echo
    /// a correlation id.
    pub key_field: &'static str,
    pub payload: Value,
}

#[async_trait]
pub trait Command: Send + Sync {
    type Output: Send;

    fn key(&self) -> CommandKey;

    fn conflict_policy(&self) -> ConflictPolicy {
        ConflictPolicy::Reject
    }

    /// `None` makes the command REST-primary.
    fn realtime(&self) -> Option<RealtimeRoute> {
        None
    }

    /// Builds the result from a matching ack. `None` keeps waiting.
    fn from_ack(&self, _payload: &Value) -> Option<Self::Output> {
        None
    }

    async fn send_rest(&self, api: &dyn RestApi) -> Result<Self::Output, SyncError>;

    /// Best-effort result from the last known server snapshot, used when
    /// REST fails with a network error or 5xx.
    fn local_patch(&self) -> Option<Self::Output> {
        None
    }
}

enum Signal {
    Ack(Value),
    /// `shared` is whether other commands were waiting when it arrived.
    Error { data: Value, shared: bool },
    Disconnected,
}

enum RealtimeResult<T> {
    Acked(T),
    Rejected(SyncError),
    Fallback(SyncError),
}

/// Who an error event was meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attribution {
    Ours,
    Foreign,
    /// Neither a correlation id nor a key to go by.
    Unknown,
}

/// Counts commands waiting on a realtime answer for as long as it lives.
struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct CommandDispatcher {
    transport: Arc<TransportChannel>,
    api: Arc<dyn RestApi>,
    pending: PendingCommands,
    waiting: Arc<AtomicUsize>,
    ack_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(transport: Arc<TransportChannel>, api: Arc<dyn RestApi>, ack_timeout: Duration) -> Self {
        Self {
            transport,
            api,
            pending: PendingCommands::new(),
            waiting: Arc::new(AtomicUsize::new(0)),
            ack_timeout,
        }
    }

    pub fn transport(&self) -> &Arc<TransportChannel> {
        &self.transport
    }

    pub fn api(&self) -> &Arc<dyn RestApi> {
        &self.api
    }

    pub fn pending(&self) -> &PendingCommands {
        &self.pending
    }

    pub async fn execute<C: Command>(&self, command: &C) -> CommandOutcome<C::Output> {
        let key = command.key();
        let slot = match self
            .pending
            .acquire(PendingCommand::new(key.clone()), command.conflict_policy())
            .await
        {
            Ok(slot) => slot,
            Err(e) => {
                log::warn!("{}: {}", key, e);
                return CommandOutcome::failed(Method::Skipped, e);
            }
        };

        if let Some(route) = command.realtime() {
            if self.transport.is_connected() {
                match self.try_realtime(command, &key, route, slot.correlation_id()).await {
                    RealtimeResult::Acked(value) => {
                        log::debug!("{} acknowledged over realtime", key);
                        return CommandOutcome::ok(Method::Realtime, value);
                    }
                    RealtimeResult::Rejected(e) => {
                        log::warn!("{} rejected over realtime: {}", key, e);
                        return CommandOutcome::failed(Method::Realtime, e);
                    }
                    RealtimeResult::Fallback(reason) => {
                        log::warn!("{} falling back to REST ({})", key, reason);
                    }
                }
            }
        }

        let outcome = self.via_rest(command, &key).await;
        drop(slot);
        outcome
    }

    async fn try_realtime<C: Command>(
        &self,
        command: &C,
        key: &CommandKey,
        route: RealtimeRoute,
        correlation_id: Uuid,
    ) -> RealtimeResult<C::Output> {
        let _waiting = Waiting::enter(&self.waiting);
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Released when this function returns, however it returns.
        let _subscriptions = {
            let ack_tx = tx.clone();
            let err_tx = tx.clone();
            let disc_tx = tx;
            let waiting = self.waiting.clone();
            [
                self.transport.on(route.ack_event, move |data| {
                    let _ = ack_tx.send(Signal::Ack(data.clone()));
                }),
                self.transport.on(events::ERROR, move |data| {
                    let _ = err_tx.send(Signal::Error {
                        data: data.clone(),
                        shared: waiting.load(Ordering::SeqCst) > 1,
                    });
                }),
                self.transport.on(events::DISCONNECT, move |_| {
                    let _ = disc_tx.send(Signal::Disconnected);
                }),
            ]
        };

        let mut payload = route.payload;
        if let Value::Object(map) = &mut payload {
            map.insert(CORRELATION_FIELD.to_string(), Value::String(correlation_id.to_string()));
        }
        if let Err(e) = self.transport.emit(route.event, payload) {
            return RealtimeResult::Fallback(e);
        }

        let deadline = tokio::time::sleep(self.ack_timeout);
        tokio::pin!(deadline);
        let cid = correlation_id.to_string();

        loop {
            tokio::select! {
                signal = rx.recv() => match signal {
                    Some(Signal::Ack(data)) => {
                        if !correlates(&data, &cid, key, route.key_field) {
                            continue;
                        }
                        if let Some(value) = command.from_ack(&data) {
                            return RealtimeResult::Acked(value);
                        }
                    }
                    Some(Signal::Error { data, shared }) => {
                        let error = ErrorEvent::from_value(&data);
                        match attribute(&error, &data, &cid, key, route.key_field) {
                            Attribution::Foreign => continue,
                            // Could be anyone's; let REST give this command its own verdict.
                            Attribution::Unknown if shared => {
                                return RealtimeResult::Fallback(SyncError::Transport(format!(
                                    "unattributed realtime error: {}",
                                    error.message
                                )));
                            }
                            Attribution::Ours | Attribution::Unknown => {}
                        }
                        return match SyncError::from_realtime_message(&error.message) {
                            SyncError::TargetOffline => RealtimeResult::Fallback(SyncError::TargetOffline),
                            other => RealtimeResult::Rejected(other),
                        };
                    }
                    Some(Signal::Disconnected) | None => {
                        return RealtimeResult::Fallback(SyncError::NotConnected);
                    }
                },
                _ = &mut deadline => return RealtimeResult::Fallback(SyncError::Timeout),
            }
        }
    }

    async fn via_rest<C: Command>(&self, command: &C, key: &CommandKey) -> CommandOutcome<C::Output> {
        match command.send_rest(self.api.as_ref()).await {
            Ok(value) => CommandOutcome::ok(Method::Rest, value),
            Err(e) if e.allows_local_patch() => match command.local_patch() {
                Some(value) => {
                    log::warn!("{} applied locally, server unconfirmed: {}", key, e);
                    CommandOutcome {
                        success: true,
                        method: Method::Local,
                        value: Some(value),
                        error: Some(e),
                    }
                }
                None => CommandOutcome::failed(Method::Rest, e),
            },
            Err(e) => CommandOutcome::failed(Method::Rest, e),
        }
    }
}

/// An ack belongs to us if it echoes our correlation id, or, when it echoes
/// none, if it names our key.
fn correlates(data: &Value, cid: &str, key: &CommandKey, key_field: &str) -> bool {
    match events::correlation_of(data) {
        Some(other) => other == cid,
        None => data.get(key_field).and_then(Value::as_str) == Some(key.id()),
    }
}

/// Error events rarely say whose they are. A correlation id decides, then
/// the key field; with neither the event is [`Attribution::Unknown`].
fn attribute(
    error: &ErrorEvent,
    data: &Value,
    cid: &str,
    key: &CommandKey,
    key_field: &str,
) -> Attribution {
    let owned = match error.correlation_id.as_deref() {
        Some(other) => other == cid,
        None => match data.get(key_field).and_then(Value::as_str) {
            Some(id) => id == key.id(),
            None => return Attribution::Unknown,
        },
    };
    if owned {
        Attribution::Ours
    } else {
        Attribution::Foreign
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::{OrderStatus, PaymentStatus};
    use crate::status::SetOrderStatus;
    use crate::testing::{order, FakeRest, LoopbackConnector, RestCall};
    use serde_json::json;
    use url::Url;

    fn deliver(id: &str) -> SetOrderStatus {
        SetOrderStatus {
            order_id: id.to_string(),
            status: OrderStatus::Delivered,
            has_snapshot: true,
        }
    }

    async fn setup() -> (Arc<CommandDispatcher>, Arc<FakeRest>, Arc<LoopbackConnector>) {
        let rest = FakeRest::new().with_order(order("O1", OrderStatus::Ontheway, PaymentStatus::Paid));
        let connector = LoopbackConnector::new();
        let transport = Arc::new(TransportChannel::new(
            Url::parse("ws://shop.test/socket").unwrap(),
            connector.clone(),
        ));
        transport.connect("tok").await.unwrap();
        let dispatcher = Arc::new(CommandDispatcher::new(transport, rest.clone(), DEFAULT_ACK_TIMEOUT));
        (dispatcher, rest, connector)
    }

    fn rest_status_calls(rest: &FakeRest) -> usize {
        rest.count(|c| matches!(c, RestCall::ChangeOrderStatus(..)))
    }

    #[tokio::test(start_paused = true)]
    async fn ack_resolves_over_realtime_without_rest() {
        let (dispatcher, rest, connector) = setup().await;
        let server = connector.server().unwrap();
        let responder = tokio::spawn(async move {
            let frame = server.next().await.unwrap();
            assert_eq!(frame.event, events::UPDATE_ORDER_STATUS);
            assert!(frame.data[CORRELATION_FIELD].is_string());
            tokio::time::sleep(Duration::from_millis(300)).await;
            server.push(events::STATUS_UPDATED, json!({"orderId": "O1"}));
        });

        let outcome = dispatcher.execute(&deliver("O1")).await;
        responder.await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.method, Method::Realtime);
        assert_eq!(rest_status_calls(&rest), 0);
        assert!(dispatcher.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn offline_error_falls_back_to_rest() {
        let (dispatcher, rest, connector) = setup().await;
        let server = connector.server().unwrap();
        tokio::spawn(async move {
            server.next().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            server.push(events::ERROR, json!({"message": "User is not online"}));
        });

        let outcome = dispatcher.execute(&deliver("O1")).await;

        assert!(outcome.success);
        assert_eq!(outcome.method, Method::Rest);
        assert_eq!(
            rest.calls(),
            vec![RestCall::ChangeOrderStatus("O1".into(), OrderStatus::Delivered)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silence_triggers_exactly_one_rest_call() {
        let (dispatcher, rest, _connector) = setup().await;
        let started = tokio::time::Instant::now();

        let outcome = dispatcher.execute(&deliver("O1")).await;

        assert!(started.elapsed() >= DEFAULT_ACK_TIMEOUT);
        assert!(outcome.success);
        assert_eq!(outcome.method, Method::Rest);
        assert_eq!(outcome.error, None);
        tokio::time::sleep(DEFAULT_ACK_TIMEOUT * 3).await;
        assert_eq!(rest_status_calls(&rest), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn business_error_is_not_retried() {
        let (dispatcher, rest, connector) = setup().await;
        let server = connector.server().unwrap();
        tokio::spawn(async move {
            server.next().await;
            server.push(events::ERROR, json!({"message": "Cannot deliver without payment"}));
        });

        let outcome = dispatcher.execute(&deliver("O1")).await;

        assert!(!outcome.success);
        assert_eq!(outcome.method, Method::Realtime);
        assert_eq!(outcome.user_message().as_deref(), Some("Cannot deliver without payment"));
        assert_eq!(rest_status_calls(&rest), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_acks_are_ignored() {
        let (dispatcher, rest, connector) = setup().await;
        let server = connector.server().unwrap();
        tokio::spawn(async move {
            server.next().await;
            server.push(events::STATUS_UPDATED, json!({"orderId": "O2"}));
            server.push(events::STATUS_UPDATED, json!({"orderId": "O1", "correlationId": "someone-else"}));
        });

        let outcome = dispatcher.execute(&deliver("O1")).await;

        assert_eq!(outcome.method, Method::Rest);
        assert_eq!(rest_status_calls(&rest), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_waiting_falls_back_immediately() {
        let (dispatcher, rest, connector) = setup().await;
        let server = connector.server().unwrap();
        tokio::spawn(async move {
            server.next().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            server.hang_up();
        });
        let started = tokio::time::Instant::now();

        let outcome = dispatcher.execute(&deliver("O1")).await;

        assert!(started.elapsed() < DEFAULT_ACK_TIMEOUT);
        assert_eq!(outcome.method, Method::Rest);
        assert_eq!(rest_status_calls(&rest), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_transport_goes_straight_to_rest() {
        let (dispatcher, rest, _connector) = setup().await;
        dispatcher.transport().disconnect();

        let outcome = dispatcher.execute(&deliver("O1")).await;

        assert_eq!(outcome.method, Method::Rest);
        assert_eq!(rest_status_calls(&rest), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn server_fault_degrades_to_local_patch() {
        let (dispatcher, rest, _connector) = setup().await;
        dispatcher.transport().disconnect();
        rest.fail_next("change_order_status", SyncError::ServerFault(503));

        let outcome = dispatcher.execute(&deliver("O1")).await;
        assert!(outcome.is_degraded());
        assert_eq!(outcome.error, Some(SyncError::ServerFault(503)));

        rest.fail_next("change_order_status", SyncError::ServerFault(503));
        let no_snapshot = SetOrderStatus {
            has_snapshot: false,
            ..deliver("O1")
        };
        let outcome = dispatcher.execute(&no_snapshot).await;
        assert!(!outcome.success);
        assert_eq!(outcome.method, Method::Rest);
    }

    #[tokio::test(start_paused = true)]
    async fn rest_business_rejection_is_surfaced_verbatim() {
        let (dispatcher, rest, _connector) = setup().await;
        dispatcher.transport().disconnect();
        rest.fail_next(
            "change_order_status",
            SyncError::BusinessRuleRejected("cannot deliver without payment".into()),
        );

        let outcome = dispatcher.execute(&deliver("O1")).await;

        assert!(!outcome.success);
        assert_eq!(outcome.user_message().as_deref(), Some("cannot deliver without payment"));
    }

    #[tokio::test(start_paused = true)]
    async fn second_command_for_same_key_is_rejected_while_first_waits() {
        let (dispatcher, rest, _connector) = setup().await;
        let d = dispatcher.clone();
        let first = tokio::spawn(async move { d.execute(&deliver("O1")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(dispatcher.pending().is_pending(&CommandKey::Order("O1".into())));

        let second = dispatcher.execute(&deliver("O1")).await;
        assert!(!second.success);
        assert!(matches!(second.error, Some(SyncError::CommandInFlight(_))));

        let first = first.await.unwrap();
        assert!(first.success);
        assert_eq!(rest_status_calls(&rest), 1);
        assert!(dispatcher.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unattributed_error_does_not_reject_concurrent_commands() {
        let (dispatcher, rest, connector) = setup().await;
        rest.put_order(order("O2", OrderStatus::Pending, PaymentStatus::Unpaid));
        let server = connector.server().unwrap();
        tokio::spawn(async move {
            server.next().await;
            server.next().await;
            server.push(events::ERROR, json!({"message": "Payment required for preparation"}));
        });

        let d = dispatcher.clone();
        let first = tokio::spawn(async move { d.execute(&deliver("O1")).await });
        let prepare = SetOrderStatus {
            order_id: "O2".into(),
            status: OrderStatus::Preparation,
            has_snapshot: true,
        };
        let second = dispatcher.execute(&prepare).await;
        let first = first.await.unwrap();

        assert!(first.success);
        assert_eq!(first.method, Method::Rest);
        assert_eq!(first.user_message(), None);
        assert_eq!(second.method, Method::Rest);
        assert_eq!(
            rest.count(|c| *c == RestCall::ChangeOrderStatus("O1".into(), OrderStatus::Delivered)),
            1
        );
        assert_eq!(rest_status_calls(&rest), 2);
        assert!(dispatcher.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn keyed_error_only_rejects_its_own_command() {
        let (dispatcher, rest, connector) = setup().await;
        rest.put_order(order("O2", OrderStatus::Pending, PaymentStatus::Unpaid));
        let server = connector.server().unwrap();
        tokio::spawn(async move {
            server.next().await;
            server.next().await;
            server.push(
                events::ERROR,
                json!({"orderId": "O2", "message": "Payment required for preparation"}),
            );
            server.push(events::STATUS_UPDATED, json!({"orderId": "O1"}));
        });

        let d = dispatcher.clone();
        let first = tokio::spawn(async move { d.execute(&deliver("O1")).await });
        let prepare = SetOrderStatus {
            order_id: "O2".into(),
            status: OrderStatus::Preparation,
            has_snapshot: true,
        };
        let second = dispatcher.execute(&prepare).await;
        let first = first.await.unwrap();

        assert_eq!(first.method, Method::Realtime);
        assert!(first.success);
        assert!(!second.success);
        assert_eq!(second.user_message().as_deref(), Some("Payment required for preparation"));
        assert_eq!(rest_status_calls(&rest), 0);
    }
}
