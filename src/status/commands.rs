use async_trait::async_trait;
use serde_json::{json, Value};

use crate::api::events;
use crate::api::models::{OrderStatus, PaymentStatus};
use crate::api::RestApi;
use crate::dispatch::{Command, CommandKey, RealtimeRoute};
use crate::error::SyncError;

pub struct SetOrderStatus {
    pub order_id: String,
    pub status: OrderStatus,
    pub has_snapshot: bool,
}

#[async_trait]
impl Command for SetOrderStatus {
    type Output = ();

    fn key(&self) -> CommandKey {
        CommandKey::Order(self.order_id.clone())
    }

    fn realtime(&self) -> Option<RealtimeRoute> {
        Some(RealtimeRoute {
            event: events::UPDATE_ORDER_STATUS,
            ack_event: events::STATUS_UPDATED,
            key_field: "orderId",
            payload: json!({ "orderId": self.order_id, "orderStatus": self.status }),
        })
    }

    fn from_ack(&self, _payload: &Value) -> Option<()> {
        Some(())
    }

    async fn send_rest(&self, api: &dyn RestApi) -> Result<(), SyncError> {
        api.change_order_status(&self.order_id, self.status).await
    }

    fn local_patch(&self) -> Option<()> {
        self.has_snapshot.then_some(())
    }
}

pub struct SetPaymentStatus {
    pub order_id: String,
    pub payment_id: String,
    pub status: PaymentStatus,
    pub has_snapshot: bool,
}

#[async_trait]
impl Command for SetPaymentStatus {
    type Output = ();

    fn key(&self) -> CommandKey {
        CommandKey::Payment(self.payment_id.clone())
    }

    fn realtime(&self) -> Option<RealtimeRoute> {
        Some(RealtimeRoute {
            event: events::UPDATE_PAYMENT_STATUS,
            ack_event: events::PAYMENT_STATUS_UPDATED,
            key_field: "paymentId",
            payload: json!({
                "paymentId": self.payment_id,
                "orderId": self.order_id,
                "status": self.status,
            }),
        })
    }

    fn from_ack(&self, _payload: &Value) -> Option<()> {
        Some(())
    }

    async fn send_rest(&self, api: &dyn RestApi) -> Result<(), SyncError> {
        api.change_payment_status(&self.payment_id, self.status).await
    }

    fn local_patch(&self) -> Option<()> {
        self.has_snapshot.then_some(())
    }
}
