use async_trait::async_trait;

use crate::api::models::{Message, OutgoingMessage};
use crate::api::RestApi;
use crate::dispatch::{Command, CommandKey, ConflictPolicy};
use crate::error::SyncError;

/// Sending is REST-only; the realtime channel just announces the result.
pub struct SendMessage {
    pub draft: OutgoingMessage,
}

#[async_trait]
impl Command for SendMessage {
    type Output = Message;

    fn key(&self) -> CommandKey {
        CommandKey::Chat(self.draft.chat_id.clone())
    }

    // Messages in one chat go out in the order they were written.
    fn conflict_policy(&self) -> ConflictPolicy {
        ConflictPolicy::Queue
    }

    async fn send_rest(&self, api: &dyn RestApi) -> Result<Message, SyncError> {
        api.send_message(&self.draft).await
    }
}
