//! Handler registry
//!
//! One request handler per method (last registration wins) and an ordered
//! list of notification handlers per method. Lists that become empty are
//! dropped so the registry never accumulates dead keys.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;

/// Handler answering requests for one method
///
/// Returning an error that downcasts to
/// [`RpcErrorObject`](crate::protocol::RpcErrorObject) sends that object
/// back verbatim; any other error becomes a server error.
pub type RequestHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Handler receiving notifications for one method
///
/// Errors are logged and otherwise ignored.
pub type NotificationHandler =
    Arc<dyn Fn(Notification) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// An inbound notification
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    /// Method name
    pub method: String,
    /// Parameters (`Null` when absent)
    pub params: Value,
    /// Binary attachment, only on buffer-capable transports
    pub binary: Option<Bytes>,
}

/// Identifies one registered notification handler
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    requests: RwLock<HashMap<String, RequestHandler>>,
    notifications: RwLock<HashMap<String, Vec<(HandlerId, NotificationHandler)>>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    pub(crate) fn set_request(&self, method: &str, handler: RequestHandler) {
        self.requests.write().insert(method.to_string(), handler);
    }

    pub(crate) fn remove_request(&self, method: &str) -> bool {
        self.requests.write().remove(method).is_some()
    }

    pub(crate) fn request(&self, method: &str) -> Option<RequestHandler> {
        self.requests.read().get(method).cloned()
    }

    pub(crate) fn add_notification(&self, method: &str, handler: NotificationHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.notifications
            .write()
            .entry(method.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    pub(crate) fn remove_notification(&self, method: &str, id: HandlerId) -> bool {
        let mut notifications = self.notifications.write();
        let Some(handlers) = notifications.get_mut(method) else {
            return false;
        };

        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        let removed = handlers.len() != before;

        if handlers.is_empty() {
            notifications.remove(method);
        }
        removed
    }

    pub(crate) fn remove_all_notifications(&self, method: &str) -> usize {
        self.notifications
            .write()
            .remove(method)
            .map_or(0, |handlers| handlers.len())
    }

    /// Snapshot of the handlers for `method`, in registration order
    pub(crate) fn notification_handlers(&self, method: &str) -> Vec<NotificationHandler> {
        self.notifications
            .read()
            .get(method)
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn notification_count(&self, method: &str) -> usize {
        self.notifications.read().get(method).map_or(0, Vec::len)
    }
}

/// Handle to a registered notification handler
///
/// Dropping it leaves the handler in place; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<HandlerRegistry>,
    method: String,
    id: HandlerId,
}

impl Subscription {
    pub(crate) fn new(registry: &Arc<HandlerRegistry>, method: &str, id: HandlerId) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            method: method.to_string(),
            id,
        }
    }

    /// Id of the handler
    #[must_use]
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Method the handler is registered for
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Remove the handler
    ///
    /// Returns `false` if it was already gone (or the bus was dropped).
    pub fn unsubscribe(self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove_notification(&self.method, self.id))
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("requests", &self.requests.read().len())
            .field("notifications", &self.notifications.read().len())
            .finish()
    }
}
