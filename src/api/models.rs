use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Location,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(alias = "_id")]
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub receiver_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "messageType", alias = "type", default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub customer_id: String,
    #[serde(default)]
    pub admin_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: usize,
}

impl Chat {
    /// Placeholder for a chat first seen through a pushed message.
    pub fn from_message(msg: &Message, current_user: &str) -> Self {
        let (customer_id, admin_id) = if msg.sender_id == current_user {
            (msg.receiver_id.clone(), msg.sender_id.clone())
        } else {
            (msg.sender_id.clone(), msg.receiver_id.clone())
        };
        Self {
            id: msg.chat_id.clone(),
            customer_id,
            admin_id,
            customer_name: None,
            last_message: None,
            last_message_at: None,
            unread_count: 0,
        }
    }

    pub fn display_name(&self) -> &str {
        self.customer_name.as_deref().unwrap_or("Customer")
    }
}

/// Attachment carried by an outgoing message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    None,
    Image {
        file_name: String,
        mime: String,
        bytes: Vec<u8>,
    },
    Location {
        latitude: f64,
        longitude: f64,
    },
}

/// A message the admin wants to send; kept around so a failed send can be retried.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub chat_id: String,
    pub receiver_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub payload: MessagePayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Preparation,
    Ontheway,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Preparation => "preparation",
            OrderStatus::Ontheway => "ontheway",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    #[default]
    Unpaid,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Paid => "paid",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub status: PaymentStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(alias = "status")]
    pub order_status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<Payment>,
}

impl Order {
    pub fn payment_status(&self) -> PaymentStatus {
        self.payment.as_ref().map(|p| p.status).unwrap_or_default()
    }
}

/// The signed-in admin, persisted next to the auth token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    pub role: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_accepts_backend_field_names() {
        let json = serde_json::json!({
            "_id": "M1",
            "chatId": "C1",
            "senderId": "U1",
            "receiverId": "A1",
            "content": "hello",
            "messageType": "location",
            "payload": {"lat": 1.0, "lng": 2.0},
            "createdAt": "2024-05-01T10:00:00Z",
        });
        let msg: Message = serde_json::from_value(json).unwrap();
        assert_eq!(msg.id, "M1");
        assert_eq!(msg.kind, MessageKind::Location);
        assert!(!msg.is_read);
    }

    #[test]
    fn order_reads_nested_payment() {
        let json = serde_json::json!({
            "_id": "O1",
            "orderStatus": "ontheway",
            "payment": {"_id": "P1", "status": "paid"}
        });
        let order: Order = serde_json::from_value(json).unwrap();
        assert_eq!(order.order_status, OrderStatus::Ontheway);
        assert_eq!(order.payment_status(), PaymentStatus::Paid);
        assert!(!order.order_status.is_terminal());
    }
}
