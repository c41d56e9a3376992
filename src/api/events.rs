use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One realtime frame: `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data,
        }
    }
}

// Chat
pub const SEND_MESSAGE: &str = "sendMessage";
pub const RECEIVE_MESSAGE: &str = "receiveMessage";
pub const TYPING: &str = "typing";
pub const STOP_TYPING: &str = "stopTyping";
pub const MARK_AS_READ: &str = "markAsRead";
pub const JOIN_CHAT: &str = "joinChat";

// Orders
pub const UPDATE_ORDER_STATUS: &str = "updateOrderStatus";
pub const STATUS_UPDATED: &str = "statusUpdated";
pub const UPDATE_PAYMENT_STATUS: &str = "updatePaymentStatus";
pub const PAYMENT_STATUS_UPDATED: &str = "paymentStatusUpdated";
pub const ORDER_STATUS_UPDATED: &str = "orderStatusUpdated";
pub const ERROR: &str = "error";

// Local pseudo-events raised by the transport itself.
pub const CONNECT: &str = "connect";
pub const DISCONNECT: &str = "disconnect";
pub const CONNECT_ERROR: &str = "connect_error";

/// Key under which every outgoing command carries its correlation id.
pub const CORRELATION_FIELD: &str = "correlationId";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub chat_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadEvent {
    pub chat_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorEvent {
    #[serde(alias = "error", default)]
    pub message: String,
    #[serde(rename = "correlationId", default)]
    pub correlation_id: Option<String>,
}

impl ErrorEvent {
    /// Servers send either a bare string or an object; anything else is an
    /// error without a message.
    pub fn from_value(data: &Value) -> Self {
        match data {
            Value::String(message) => Self {
                message: message.clone(),
                correlation_id: None,
            },
            other => serde_json::from_value(other.clone()).unwrap_or_else(|_| Self {
                message: other
                    .get("message")
                    .or_else(|| other.get("error"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                correlation_id: correlation_of(other).map(str::to_string),
            }),
        }
    }
}

/// Reads the correlation id echoed back in an ack or error payload.
pub fn correlation_of(data: &Value) -> Option<&str> {
    data.get(CORRELATION_FIELD).and_then(Value::as_str)
}
