use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client as HttpClient, RequestBuilder, Response};
use serde_json::{json, Value};

use crate::api::models::{
    Chat, Message, MessagePayload, Order, OrderStatus, OutgoingMessage, PaymentStatus,
};
use crate::error::SyncError;

/// The REST half of the dual transport.
///
/// Implemented by [`ApiClient`] against the store backend; tests script it
/// with an in-memory fake.
#[async_trait]
pub trait RestApi: Send + Sync {
    async fn list_chats(&self) -> Result<Vec<Chat>, SyncError>;
    async fn chat_messages(&self, chat_id: &str) -> Result<Vec<Message>, SyncError>;
    async fn send_message(&self, draft: &OutgoingMessage) -> Result<Message, SyncError>;
    async fn mark_read(&self, chat_id: &str) -> Result<(), SyncError>;
    async fn change_order_status(&self, order_id: &str, status: OrderStatus) -> Result<(), SyncError>;
    async fn change_payment_status(
        &self,
        payment_id: &str,
        status: PaymentStatus,
    ) -> Result<(), SyncError>;
    async fn order_detail(&self, order_id: &str) -> Result<Order, SyncError>;
}

pub struct ApiClient {
    http: HttpClient,
    base: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            http: HttpClient::new(),
            base: Self::base_api(base_url),
            token,
        }
    }

    fn base_api(base_url: &str) -> String {
        let trimmed = base_url.trim_end_matches('/');
        if trimmed.ends_with("/api") { trimmed.to_string() } else { format!("{}/api", trimmed) }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn with_auth(&self, mut req: RequestBuilder) -> RequestBuilder {
        if let Some(t) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", t));
        }
        req
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, SyncError> {
        let resp = self.with_auth(req).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body: Option<Value> = resp.json().await.ok();
        let message = body
            .as_ref()
            .and_then(|b| b.get("message").or_else(|| b.get("error")))
            .and_then(Value::as_str)
            .map(str::to_string);
        log::debug!("HTTP {} ({:?})", status, message);
        Err(SyncError::from_http_status(status.as_u16(), message))
    }

    async fn send_json(&self, req: RequestBuilder) -> Result<Value, SyncError> {
        let resp = self.send(req).await?;
        Ok(resp.json::<Value>().await?)
    }
}

/// Strips the `{data: ...}` wrapper the backend puts around most payloads.
fn unwrap_data(json: Value) -> Value {
    match json {
        Value::Object(mut map) if map.contains_key("data") => map.remove("data").unwrap_or(Value::Null),
        other => other,
    }
}

/// Pulls a list out of a bare array, `{<field>: [...]}` or `{data: [...]}`.
fn items_of(json: Value, field: &str) -> Vec<Value> {
    let json = unwrap_data(json);
    if let Some(arr) = json.as_array() {
        arr.clone()
    } else if let Some(arr) = json.get(field).and_then(|v| v.as_array()) {
        arr.clone()
    } else {
        Vec::new()
    }
}

fn decode_items<T: serde::de::DeserializeOwned>(items: Vec<Value>) -> Result<Vec<T>, SyncError> {
    items
        .into_iter()
        .map(|item| serde_json::from_value(item).map_err(SyncError::from))
        .collect()
}

fn draft_json(draft: &OutgoingMessage) -> Value {
    let payload = match &draft.payload {
        MessagePayload::Location { latitude, longitude } => {
            json!({"latitude": latitude, "longitude": longitude})
        }
        _ => Value::Null,
    };
    json!({
        "chatId": draft.chat_id,
        "receiverId": draft.receiver_id,
        "content": draft.content,
        "messageType": draft.kind,
        "payload": payload,
    })
}

#[async_trait]
impl RestApi for ApiClient {
    async fn list_chats(&self) -> Result<Vec<Chat>, SyncError> {
        let json = self.send_json(self.http.get(self.url("/chats/all"))).await?;
        decode_items(items_of(json, "chats"))
    }

    async fn chat_messages(&self, chat_id: &str) -> Result<Vec<Message>, SyncError> {
        let endpoint = self.url(&format!("/chats/{}/messages", chat_id));
        let json = self.send_json(self.http.get(endpoint)).await?;
        decode_items(items_of(json, "messages"))
    }

    async fn send_message(&self, draft: &OutgoingMessage) -> Result<Message, SyncError> {
        let endpoint = self.url("/chats/send-message");
        let req = match &draft.payload {
            MessagePayload::Image { file_name, mime, bytes } => {
                let part = Part::bytes(bytes.clone())
                    .file_name(file_name.clone())
                    .mime_str(mime)?;
                let form = Form::new()
                    .text("chatId", draft.chat_id.clone())
                    .text("receiverId", draft.receiver_id.clone())
                    .text("content", draft.content.clone())
                    .text("messageType", "image")
                    .part("image", part);
                self.http.post(endpoint).multipart(form)
            }
            _ => self.http.post(endpoint).json(&draft_json(draft)),
        };
        let json = unwrap_data(self.send_json(req).await?);
        let json = match json {
            Value::Object(mut map) if map.get("message").is_some_and(Value::is_object) => {
                map.remove("message").unwrap_or(Value::Null)
            }
            other => other,
        };
        Ok(serde_json::from_value(json)?)
    }

    async fn mark_read(&self, chat_id: &str) -> Result<(), SyncError> {
        let endpoint = self.url(&format!("/chats/{}/mark-read", chat_id));
        self.send(self.http.post(endpoint)).await?;
        Ok(())
    }

    async fn change_order_status(&self, order_id: &str, status: OrderStatus) -> Result<(), SyncError> {
        let endpoint = self.url(&format!("/order/admin/change-status/{}", order_id));
        let body = json!({ "orderStatus": status });
        self.send(self.http.patch(endpoint).json(&body)).await?;
        Ok(())
    }

    async fn change_payment_status(
        &self,
        payment_id: &str,
        status: PaymentStatus,
    ) -> Result<(), SyncError> {
        let endpoint = self.url(&format!("/order/admin/change-payment-status/{}", payment_id));
        let body = json!({ "paymentId": payment_id, "status": status });
        self.send(self.http.patch(endpoint).json(&body)).await?;
        Ok(())
    }

    async fn order_detail(&self, order_id: &str) -> Result<Order, SyncError> {
        let endpoint = self.url(&format!("/order/{}", order_id));
        let json = unwrap_data(self.send_json(self.http.get(endpoint)).await?);
        let json = match json {
            Value::Object(mut map) if map.get("order").is_some_and(Value::is_object) => {
                map.remove("order").unwrap_or(Value::Null)
            }
            other => other,
        };
        Ok(serde_json::from_value(json)?)
    }
}
