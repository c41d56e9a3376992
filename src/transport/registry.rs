use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;

pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Event name → handlers, independent of any particular socket.
#[derive(Default)]
pub struct HandlerRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    handlers: HashMap<String, Vec<(u64, Handler)>>,
}

impl HandlerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(self: &Arc<Self>, event: &str, handler: Handler) -> Subscription {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .handlers
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        Subscription {
            registry: Arc::downgrade(self),
            event: event.to_string(),
            id,
        }
    }

    fn unregister(&self, event: &str, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(list) = inner.handlers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(hid, _)| *hid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            inner.handlers.remove(event);
        }
        removed
    }

    /// Invokes every handler for `event`. Handlers run outside the lock, so
    /// they may register or drop subscriptions themselves.
    pub fn dispatch(&self, event: &str, data: &Value) -> usize {
        let handlers: Vec<Handler> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            match inner.handlers.get(event) {
                Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
                None => return 0,
            }
        };
        for handler in &handlers {
            handler(data);
        }
        handlers.len()
    }

    pub fn handler_count(&self, event: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.handlers.get(event).map_or(0, Vec::len)
    }
}

/// Registration handle. Dropping it removes the handler.
#[must_use = "dropping a Subscription unregisters its handler immediately"]
pub struct Subscription {
    registry: Weak<HandlerRegistry>,
    event: String,
    id: u64,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Explicit unregistration. Returns false if it was already gone.
    pub fn cancel(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.unregister(&self.event, self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("id", &self.id)
            .finish()
    }
}
