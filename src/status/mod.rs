//! Order and payment status, kept in step with the server.
//!
//! Transitions are checked against the last snapshot before anything is
//! sent; the server may still refuse, and its refusal is surfaced the same
//! way. A successful command is followed by a refetch of the order so the
//! stored snapshot is server truth, not our own patch.

mod commands;
mod guard;

pub use commands::{SetOrderStatus, SetPaymentStatus};
pub use guard::{check_order_transition, check_payment_transition, Transition};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::api::events;
use crate::api::models::{Order, OrderStatus, Payment, PaymentStatus};
use crate::dispatch::{CommandDispatcher, CommandOutcome, Method};
use crate::error::SyncError;
use crate::transport::{Subscription, TransportChannel};

#[derive(Debug, Clone, PartialEq)]
pub struct OrderSnapshot {
    pub order: Order,
    /// False while the snapshot carries a local patch the server has not confirmed.
    pub confirmed: bool,
}

pub struct StatusSyncEngine {
    dispatcher: Arc<CommandDispatcher>,
    orders: Mutex<HashMap<String, OrderSnapshot>>,
    updates: broadcast::Sender<OrderSnapshot>,
    refetch_after_realtime: bool,
}

impl StatusSyncEngine {
    pub fn new(dispatcher: Arc<CommandDispatcher>, refetch_after_realtime: bool) -> Arc<Self> {
        let (updates, _) = broadcast::channel(256);
        Arc::new(Self {
            dispatcher,
            orders: Mutex::new(HashMap::new()),
            updates,
            refetch_after_realtime,
        })
    }

    fn orders(&self) -> MutexGuard<'_, HashMap<String, OrderSnapshot>> {
        self.orders.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn order(&self, order_id: &str) -> Option<OrderSnapshot> {
        self.orders().get(order_id).cloned()
    }

    pub fn tracked(&self) -> Vec<String> {
        self.orders().keys().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrderSnapshot> {
        self.updates.subscribe()
    }

    /// Seeds a snapshot from an order the UI already fetched.
    pub fn track(&self, order: Order) {
        self.store(OrderSnapshot { order, confirmed: true });
    }

    fn store(&self, snapshot: OrderSnapshot) {
        self.orders().insert(snapshot.order.id.clone(), snapshot.clone());
        let _ = self.updates.send(snapshot);
    }

    fn patch<F>(&self, order_id: &str, confirmed: bool, f: F)
    where
        F: FnOnce(&mut Order),
    {
        let snapshot = {
            let mut orders = self.orders();
            let Some(snapshot) = orders.get_mut(order_id) else {
                return;
            };
            f(&mut snapshot.order);
            snapshot.confirmed = confirmed;
            snapshot.clone()
        };
        let _ = self.updates.send(snapshot);
    }

    pub async fn load_order(&self, order_id: &str) -> Result<OrderSnapshot, SyncError> {
        let order = self.dispatcher.api().order_detail(order_id).await?;
        let snapshot = OrderSnapshot { order, confirmed: true };
        self.store(snapshot.clone());
        Ok(snapshot)
    }

    async fn snapshot_or_load(&self, order_id: &str) -> Option<OrderSnapshot> {
        if let Some(snapshot) = self.order(order_id) {
            return Some(snapshot);
        }
        match self.load_order(order_id).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                log::warn!("order {} unknown locally and not loadable: {}", order_id, e);
                None
            }
        }
    }

    pub async fn set_order_status(&self, order_id: &str, status: OrderStatus) -> CommandOutcome<()> {
        let snapshot = self.snapshot_or_load(order_id).await;
        if let Some(snapshot) = &snapshot {
            match check_order_transition(&snapshot.order, status) {
                Ok(Transition::Apply) => {}
                Ok(Transition::NoOp) => return CommandOutcome::skipped(),
                Err(e) => return CommandOutcome::failed(Method::Skipped, e),
            }
        }

        let command = SetOrderStatus {
            order_id: order_id.to_string(),
            status,
            has_snapshot: snapshot.is_some(),
        };
        let outcome = self.dispatcher.execute(&command).await;
        if outcome.success {
            self.reconcile(order_id, outcome.method, |order| order.order_status = status)
                .await;
        }
        outcome
    }

    pub async fn set_payment_status(
        &self,
        order_id: &str,
        payment_id: &str,
        status: PaymentStatus,
    ) -> CommandOutcome<()> {
        let snapshot = self.snapshot_or_load(order_id).await;
        if let Some(snapshot) = &snapshot {
            match check_payment_transition(&snapshot.order, status) {
                Ok(Transition::Apply) => {}
                Ok(Transition::NoOp) => return CommandOutcome::skipped(),
                Err(e) => return CommandOutcome::failed(Method::Skipped, e),
            }
        }

        let command = SetPaymentStatus {
            order_id: order_id.to_string(),
            payment_id: payment_id.to_string(),
            status,
            has_snapshot: snapshot.is_some(),
        };
        let outcome = self.dispatcher.execute(&command).await;
        if outcome.success {
            let payment_id = payment_id.to_string();
            self.reconcile(order_id, outcome.method, move |order| {
                order.payment = Some(Payment { id: payment_id, status });
            })
            .await;
        }
        outcome
    }

    async fn reconcile<F>(&self, order_id: &str, method: Method, patch: F)
    where
        F: FnOnce(&mut Order),
    {
        match method {
            Method::Local => {
                self.patch(order_id, false, patch);
                return;
            }
            Method::Realtime if !self.refetch_after_realtime => {
                self.patch(order_id, true, patch);
                return;
            }
            _ => {}
        }
        if let Err(e) = self.load_order(order_id).await {
            log::warn!("refetch of order {} failed, keeping local patch: {}", order_id, e);
            self.patch(order_id, false, patch);
        }
    }

    /// Refetches every tracked order; the periodic consistency backstop.
    pub async fn refresh_tracked(&self) -> usize {
        let mut refreshed = 0;
        for order_id in self.tracked() {
            match self.load_order(&order_id).await {
                Ok(_) => refreshed += 1,
                Err(e) => log::warn!("refresh of order {} failed: {}", order_id, e),
            }
        }
        refreshed
    }

    /// Applies status broadcasts from the server. Last write observed wins.
    pub fn attach(self: &Arc<Self>, transport: &TransportChannel) -> Vec<Subscription> {
        let weak = Arc::downgrade(self);
        vec![
            transport.on(events::ORDER_STATUS_UPDATED, Self::order_handler(weak.clone())),
            transport.on(events::STATUS_UPDATED, Self::order_handler(weak.clone())),
            transport.on(events::PAYMENT_STATUS_UPDATED, move |data| {
                if let Some(engine) = weak.upgrade() {
                    engine.apply_payment_broadcast(data);
                }
            }),
        ]
    }

    fn order_handler(engine: Weak<Self>) -> impl Fn(&Value) + Send + Sync + 'static {
        move |data| {
            if let Some(engine) = engine.upgrade() {
                engine.apply_order_broadcast(data);
            }
        }
    }

    fn apply_order_broadcast(&self, data: &Value) {
        let Some(order_id) = data.get("orderId").and_then(Value::as_str) else {
            return;
        };
        let status = data
            .get("orderStatus")
            .or_else(|| data.get("status"))
            .and_then(|v| serde_json::from_value::<OrderStatus>(v.clone()).ok());
        if let Some(status) = status {
            log::debug!("order {} is now {} (broadcast)", order_id, status);
            self.patch(order_id, true, |order| order.order_status = status);
        }
    }

    fn apply_payment_broadcast(&self, data: &Value) {
        let Some(payment_id) = data.get("paymentId").and_then(Value::as_str) else {
            return;
        };
        let Some(status) = data
            .get("status")
            .and_then(|v| serde_json::from_value::<PaymentStatus>(v.clone()).ok())
        else {
            return;
        };
        let order_id = data
            .get("orderId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                self.orders()
                    .values()
                    .find(|s| s.order.payment.as_ref().is_some_and(|p| p.id == payment_id))
                    .map(|s| s.order.id.clone())
            });
        if let Some(order_id) = order_id {
            let payment_id = payment_id.to_string();
            self.patch(&order_id, true, move |order| {
                order.payment = Some(Payment { id: payment_id, status });
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DEFAULT_ACK_TIMEOUT;
    use crate::testing::{order, FakeRest, LoopbackConnector, RestCall};
    use serde_json::json;
    use std::time::Duration;
    use url::Url;
    use OrderStatus::*;
    use PaymentStatus::*;

    struct Fixture {
        engine: Arc<StatusSyncEngine>,
        rest: Arc<FakeRest>,
        connector: Arc<LoopbackConnector>,
        transport: Arc<TransportChannel>,
    }

    async fn fixture(seed: Order, connected: bool) -> Fixture {
        let rest = FakeRest::new().with_order(seed.clone());
        let connector = LoopbackConnector::new();
        let transport = Arc::new(TransportChannel::new(
            Url::parse("ws://shop.test/socket").unwrap(),
            connector.clone(),
        ));
        if connected {
            transport.connect("tok").await.unwrap();
        }
        let dispatcher = Arc::new(CommandDispatcher::new(
            transport.clone(),
            rest.clone(),
            DEFAULT_ACK_TIMEOUT,
        ));
        let engine = StatusSyncEngine::new(dispatcher, true);
        engine.track(seed);
        Fixture { engine, rest, connector, transport }
    }

    fn writes(rest: &FakeRest) -> usize {
        rest.count(|c| {
            matches!(c, RestCall::ChangeOrderStatus(..) | RestCall::ChangePaymentStatus(..))
        })
    }

    #[tokio::test(start_paused = true)]
    async fn delivered_is_rejected_while_unpaid() {
        let f = fixture(order("O1", Ontheway, Unpaid), true).await;

        let outcome = f.engine.set_order_status("O1", Delivered).await;

        assert!(!outcome.success);
        assert!(matches!(outcome.error, Some(SyncError::BusinessRuleRejected(_))));
        assert_eq!(f.engine.order("O1").unwrap().order.order_status, Ontheway);
        assert_eq!(writes(&f.rest), 0);
        assert!(f.connector.server().unwrap().drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unpaid_regression_is_rejected_after_delivery() {
        let f = fixture(order("O1", Delivered, Paid), false).await;

        let outcome = f.engine.set_payment_status("O1", "P-O1", Unpaid).await;

        assert!(!outcome.success);
        assert!(matches!(outcome.error, Some(SyncError::BusinessRuleRejected(_))));
        assert!(outcome.user_message().is_some());
        let snapshot = f.engine.order("O1").unwrap();
        assert_eq!(snapshot.order.payment_status(), Paid);
        assert!(snapshot.confirmed);
        assert_eq!(writes(&f.rest), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn same_state_is_a_no_op() {
        let f = fixture(order("O1", Cancelled, Unpaid), true).await;

        let outcome = f.engine.set_order_status("O1", Cancelled).await;

        assert!(outcome.success);
        assert_eq!(outcome.method, Method::Skipped);
        assert_eq!(writes(&f.rest), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn realtime_ack_is_followed_by_refetch() {
        let f = fixture(order("O1", Ontheway, Paid), true).await;
        let server = f.connector.server().unwrap();
        let rest = f.rest.clone();
        tokio::spawn(async move {
            let frame = server.next().await.unwrap();
            assert_eq!(frame.data["orderStatus"], "delivered");
            tokio::time::sleep(Duration::from_millis(300)).await;
            rest.put_order(order("O1", Delivered, Paid));
            server.push(events::STATUS_UPDATED, json!({"orderId": "O1"}));
        });

        let outcome = f.engine.set_order_status("O1", Delivered).await;

        assert!(outcome.success);
        assert_eq!(outcome.method, Method::Realtime);
        assert_eq!(writes(&f.rest), 0);
        assert_eq!(f.rest.count(|c| matches!(c, RestCall::OrderDetail(_))), 1);
        let snapshot = f.engine.order("O1").unwrap();
        assert_eq!(snapshot.order.order_status, Delivered);
        assert!(snapshot.confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn rest_fallback_reconciles_with_server_truth() {
        let f = fixture(order("O1", Pending, Unpaid), false).await;

        let outcome = f.engine.set_payment_status("O1", "P-O1", Paid).await;

        assert!(outcome.success);
        assert_eq!(outcome.method, Method::Rest);
        assert_eq!(
            f.rest.calls(),
            vec![
                RestCall::ChangePaymentStatus("P-O1".into(), Paid),
                RestCall::OrderDetail("O1".into()),
            ]
        );
        assert_eq!(f.engine.order("O1").unwrap().order.payment_status(), Paid);
    }

    #[tokio::test(start_paused = true)]
    async fn server_fault_keeps_an_unconfirmed_patch_until_refresh() {
        let f = fixture(order("O1", Pending, Paid), false).await;
        f.rest.fail_next("change_order_status", SyncError::ServerFault(500));

        let outcome = f.engine.set_order_status("O1", Preparation).await;

        assert!(outcome.is_degraded());
        let snapshot = f.engine.order("O1").unwrap();
        assert_eq!(snapshot.order.order_status, Preparation);
        assert!(!snapshot.confirmed);

        assert_eq!(f.engine.refresh_tracked().await, 1);
        let snapshot = f.engine.order("O1").unwrap();
        assert_eq!(snapshot.order.order_status, Pending);
        assert!(snapshot.confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_orders_are_loaded_before_guarding() {
        let f = fixture(order("O1", Pending, Paid), false).await;
        f.rest.put_order(order("O2", Ontheway, Unpaid));

        let outcome = f.engine.set_order_status("O2", Delivered).await;

        assert!(matches!(outcome.error, Some(SyncError::BusinessRuleRejected(_))));
        assert_eq!(f.rest.calls(), vec![RestCall::OrderDetail("O2".into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcasts_update_tracked_orders() {
        let f = fixture(order("O1", Pending, Unpaid), true).await;
        let _subs = f.engine.attach(&f.transport);
        let mut updates = f.engine.subscribe();
        let server = f.connector.server().unwrap();

        server.push(events::ORDER_STATUS_UPDATED, json!({"orderId": "O1", "orderStatus": "cancelled"}));
        server.push(events::PAYMENT_STATUS_UPDATED, json!({"paymentId": "P-O1", "status": "paid"}));
        server.push(events::ORDER_STATUS_UPDATED, json!({"orderId": "O9", "orderStatus": "pending"}));
        tokio::time::sleep(Duration::from_millis(1)).await;

        let snapshot = f.engine.order("O1").unwrap();
        assert_eq!(snapshot.order.order_status, Cancelled);
        assert_eq!(snapshot.order.payment_status(), Paid);
        assert!(f.engine.order("O9").is_none());
        assert_eq!(updates.recv().await.unwrap().order.order_status, Cancelled);
    }
}
