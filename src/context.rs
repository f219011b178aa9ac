//! Per-connection context and cancellation.
//!
//! Every accepted connection gets a [`ConnContext`]: a cheaply clonable
//! handle carrying the connection id, the peer address when known, a
//! cancellable scope, and a small typed key/value store. The context is
//! passed to every handler invocation; the scope is cancelled when the
//! connection terminates so long-running handlers can bail out.

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::Notify;

/// A cancellable scope shared across tasks.
///
/// Cloning is cheap; all clones observe the same cancellation.
#[derive(Clone, Default)]
pub struct CancelScope {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until the scope is cancelled.
    pub async fn cancelled(&self) {
        // Register before checking the flag so a concurrent cancel between
        // the check and the await cannot be missed.
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

struct ContextInner {
    conn_id: u64,
    peer: Option<SocketAddr>,
    scope: CancelScope,
    values: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

/// Handle to one connection's ambient state.
#[derive(Clone)]
pub struct ConnContext {
    inner: Arc<ContextInner>,
}

impl ConnContext {
    /// Create a context for a freshly accepted connection.
    pub fn new(conn_id: u64, peer: Option<SocketAddr>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                conn_id,
                peer,
                scope: CancelScope::new(),
                values: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Identifier of the connection this context belongs to.
    #[inline]
    pub fn conn_id(&self) -> u64 {
        self.inner.conn_id
    }

    /// Remote address, when the connection came over a socket.
    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// The connection's cancellation scope.
    #[inline]
    pub fn scope(&self) -> &CancelScope {
        &self.inner.scope
    }

    /// Whether the connection has been cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.scope.is_cancelled()
    }

    /// Wait for the connection to be cancelled.
    pub async fn cancelled(&self) {
        self.inner.scope.cancelled().await
    }

    /// Attach a value to this connection under a key.
    pub fn set_value<V: Any + Send + Sync>(&self, key: &str, value: V) {
        self.inner
            .values
            .write()
            .expect("context lock poisoned")
            .insert(key.to_string(), Arc::new(value));
    }

    /// Retrieve a previously attached value.
    pub fn get_value<V: Any + Send + Sync>(&self, key: &str) -> Option<Arc<V>> {
        let values = self.inner.values.read().expect("context lock poisoned");
        values.get(key).cloned().and_then(|v| v.downcast::<V>().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_scope_starts_uncancelled() {
        let scope = CancelScope::new();
        assert!(!scope.is_cancelled());
    }

    #[test]
    fn test_cancel_is_visible_to_clones() {
        let scope = CancelScope::new();
        let clone = scope.clone();
        scope.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let scope = CancelScope::new();
        let waiter = scope.clone();

        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        scope.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter did not wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let scope = CancelScope::new();
        scope.cancel();
        tokio::time::timeout(Duration::from_millis(100), scope.cancelled())
            .await
            .expect("should not block");
    }

    #[test]
    fn test_context_accessors() {
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let ctx = ConnContext::new(7, Some(peer));
        assert_eq!(ctx.conn_id(), 7);
        assert_eq!(ctx.peer_addr(), Some(peer));
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn test_context_values() {
        let ctx = ConnContext::new(1, None);
        ctx.set_value("user", "alice".to_string());

        let user = ctx.get_value::<String>("user").unwrap();
        assert_eq!(user.as_str(), "alice");

        assert!(ctx.get_value::<String>("missing").is_none());
        assert!(ctx.get_value::<u64>("user").is_none());
    }

    #[test]
    fn test_context_clone_shares_state() {
        let ctx = ConnContext::new(1, None);
        let clone = ctx.clone();
        ctx.scope().cancel();
        assert!(clone.is_cancelled());
    }
}
