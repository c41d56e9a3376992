use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    OrderStatus,
    PaymentStatus,
    SendMessage,
}

/// The entity a command targets. At most one command per key is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandKey {
    Order(String),
    Payment(String),
    Chat(String),
}

impl CommandKey {
    pub fn id(&self) -> &str {
        match self {
            CommandKey::Order(id) | CommandKey::Payment(id) | CommandKey::Chat(id) => id,
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            CommandKey::Order(_) => CommandKind::OrderStatus,
            CommandKey::Payment(_) => CommandKind::PaymentStatus,
            CommandKey::Chat(_) => CommandKind::SendMessage,
        }
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKey::Order(id) => write!(f, "order:{}", id),
            CommandKey::Payment(id) => write!(f, "payment:{}", id),
            CommandKey::Chat(id) => write!(f, "chat:{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub key: CommandKey,
    pub kind: CommandKind,
    pub correlation_id: Uuid,
    pub issued_at: Instant,
}

impl PendingCommand {
    pub fn new(key: CommandKey) -> Self {
        Self {
            kind: key.kind(),
            key,
            correlation_id: Uuid::new_v4(),
            issued_at: Instant::now(),
        }
    }
}

/// What happens to a command whose key already has one in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Fail fast with `CommandInFlight`.
    Reject,
    /// Wait for the in-flight one to resolve, then run.
    Queue,
}

#[derive(Default)]
struct PendingInner {
    slots: Mutex<HashMap<CommandKey, Arc<tokio::sync::Mutex<()>>>>,
    entries: Mutex<HashMap<CommandKey, PendingCommand>>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Single-slot-per-key registry of in-flight commands.
#[derive(Clone, Default)]
pub struct PendingCommands {
    inner: Arc<PendingInner>,
}

impl PendingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(
        &self,
        command: PendingCommand,
        policy: ConflictPolicy,
    ) -> Result<PendingGuard, SyncError> {
        let slot = locked(&self.inner.slots)
            .entry(command.key.clone())
            .or_default()
            .clone();
        let held = match policy {
            ConflictPolicy::Reject => slot
                .try_lock_owned()
                .map_err(|_| SyncError::CommandInFlight(command.key.to_string()))?,
            ConflictPolicy::Queue => slot.lock_owned().await,
        };
        let key = command.key.clone();
        let correlation_id = command.correlation_id;
        locked(&self.inner.entries).insert(key.clone(), command);
        Ok(PendingGuard {
            inner: self.inner.clone(),
            key,
            correlation_id,
            held: Some(held),
        })
    }

    pub fn get(&self, key: &CommandKey) -> Option<PendingCommand> {
        locked(&self.inner.entries).get(key).cloned()
    }

    pub fn is_pending(&self, key: &CommandKey) -> bool {
        locked(&self.inner.entries).contains_key(key)
    }

    pub fn len(&self) -> usize {
        locked(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Proof of holding a key's slot. Dropping it clears the pending entry,
/// whichever way the command ended.
pub struct PendingGuard {
    inner: Arc<PendingInner>,
    key: CommandKey,
    correlation_id: Uuid,
    held: Option<OwnedMutexGuard<()>>,
}

impl PendingGuard {
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        {
            let mut entries = locked(&self.inner.entries);
            if entries
                .get(&self.key)
                .is_some_and(|p| p.correlation_id == self.correlation_id)
            {
                entries.remove(&self.key);
            }
        }
        let mut slots = locked(&self.inner.slots);
        // Map + our guard are the only owners: nobody is queued behind us.
        if slots.get(&self.key).is_some_and(|s| Arc::strong_count(s) == 2) {
            slots.remove(&self.key);
        }
        self.held.take();
    }
}
