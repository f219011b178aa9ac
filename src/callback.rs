//! Type-indexed publish/subscribe.
//!
//! The [`CallbackManager`] fans a value out to every handler subscribed to
//! that value's type. It backs both the client's push dispatch and its
//! disconnect notifications: wire pushes arrive as raw tagged bytes and are
//! routed by tag; local events go through [`CallbackManager::send_to_all`],
//! which encodes once and reuses the same path.
//!
//! Each matching handler runs on its own spawned task; dispatch returns
//! immediately and guarantees no ordering between handlers or between
//! successive dispatches.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::type_tag;
use crate::error::Result;

type CallbackFn = Arc<dyn Fn(Bytes) + Send + Sync>;

struct Subscription {
    id: u64,
    handler: CallbackFn,
}

/// Handle identifying one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackId {
    tag: String,
    id: u64,
}

#[derive(Default)]
struct CallbackState {
    subscriptions: HashMap<String, Vec<Subscription>>,
    next_id: u64,
}

/// Subscription registry keyed by canonical type tag.
#[derive(Default)]
pub struct CallbackManager {
    state: RwLock<CallbackState>,
}

impl CallbackManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler for values of type `T`.
    ///
    /// The handler argument is an owned value, which is what makes the
    /// subscription routable: the subscription key is `T`'s canonical tag.
    /// Handlers run on their own task per dispatched value.
    pub fn subscribe<T, F>(&self, handler: F) -> CallbackId
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let tag = type_tag::<T>().to_string();
        let warn_tag = tag.clone();
        let wrapped: CallbackFn = Arc::new(move |raw: Bytes| {
            match rmp_serde::from_slice::<T>(&raw) {
                Ok(value) => handler(value),
                Err(e) => tracing::warn!("dropping value tagged {}: {}", warn_tag, e),
            }
        });

        let mut state = self.state.write().expect("callback lock poisoned");
        let id = state.next_id;
        state.next_id += 1;
        state
            .subscriptions
            .entry(tag.clone())
            .or_default()
            .push(Subscription {
                id,
                handler: wrapped,
            });
        CallbackId { tag, id }
    }

    /// Remove a subscription. Unknown ids are silently ignored.
    pub fn unsubscribe(&self, id: &CallbackId) {
        let mut state = self.state.write().expect("callback lock poisoned");
        if let Some(subs) = state.subscriptions.get_mut(&id.tag) {
            subs.retain(|s| s.id != id.id);
        }
    }

    /// Dispatch a value to every subscriber of its type.
    ///
    /// Encodes once, then hands the bytes to each matching handler on its
    /// own task. Returns as soon as the tasks are spawned.
    pub fn send_to_all<T: Serialize>(&self, value: &T) -> Result<()> {
        let bytes = Bytes::from(rmp_serde::to_vec_named(value)?);
        self.send_raw(type_tag::<T>(), bytes);
        Ok(())
    }

    /// Dispatch already-encoded bytes to every subscriber of `tag`.
    ///
    /// The subscriber list is snapshotted under the read lock before any
    /// task is spawned, so concurrent subscribe/unsubscribe calls see a
    /// consistent boundary.
    pub fn send_raw(&self, tag: &str, bytes: Bytes) {
        let snapshot: Vec<CallbackFn> = {
            let state = self.state.read().expect("callback lock poisoned");
            state
                .subscriptions
                .get(tag)
                .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
                .unwrap_or_default()
        };

        for handler in snapshot {
            let payload = bytes.clone();
            tokio::spawn(async move {
                handler(payload);
            });
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, tag: &str) -> usize {
        self.state
            .read()
            .unwrap()
            .subscriptions
            .get(tag)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Serialize, Deserialize, Clone, Debug)]
    struct PushData {
        a: i32,
        b: i32,
    }

    #[derive(Serialize, Deserialize, Debug)]
    struct Other {
        text: String,
    }

    async fn recv_timeout(rx: &mut mpsc::UnboundedReceiver<i32>) -> Option<i32> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers_of_type() {
        let mgr = CallbackManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let tx1 = tx.clone();
        mgr.subscribe::<PushData, _>(move |p| {
            let _ = tx1.send(p.a + p.b);
        });
        let tx2 = tx.clone();
        mgr.subscribe::<PushData, _>(move |p| {
            let _ = tx2.send(p.a + p.b);
        });

        mgr.send_to_all(&PushData { a: 1, b: 2 }).unwrap();

        let mut total = 0;
        total += recv_timeout(&mut rx).await.unwrap();
        total += recv_timeout(&mut rx).await.unwrap();
        assert_eq!(total, 6);
    }

    #[tokio::test]
    async fn test_dispatch_only_matches_value_type() {
        let mgr = CallbackManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let tx1 = tx.clone();
        mgr.subscribe::<PushData, _>(move |p| {
            let _ = tx1.send(p.a);
        });

        mgr.send_to_all(&Other {
            text: "ignored".to_string(),
        })
        .unwrap();
        mgr.send_to_all(&PushData { a: 42, b: 0 }).unwrap();

        assert_eq!(recv_timeout(&mut rx).await, Some(42));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let mgr = CallbackManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let tx1 = tx.clone();
        let id = mgr.subscribe::<PushData, _>(move |p| {
            let _ = tx1.send(p.a);
        });
        assert_eq!(mgr.subscriber_count(type_tag::<PushData>()), 1);

        mgr.unsubscribe(&id);
        assert_eq!(mgr.subscriber_count(type_tag::<PushData>()), 0);

        mgr.send_to_all(&PushData { a: 1, b: 2 }).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_id_is_noop() {
        let mgr = CallbackManager::new();
        let id = mgr.subscribe::<PushData, _>(|_| {});
        mgr.unsubscribe(&id);
        // Second removal of the same id.
        mgr.unsubscribe(&id);
    }

    #[tokio::test]
    async fn test_ids_are_distinct() {
        let mgr = CallbackManager::new();
        let first = mgr.subscribe::<PushData, _>(|_| {});
        let second = mgr.subscribe::<PushData, _>(|_| {});
        assert_ne!(first, second);

        // Removing one leaves the other in place.
        mgr.unsubscribe(&first);
        assert_eq!(mgr.subscriber_count(type_tag::<PushData>()), 1);
    }

    #[tokio::test]
    async fn test_send_raw_routes_wire_bytes() {
        let mgr = CallbackManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let tx1 = tx.clone();
        mgr.subscribe::<PushData, _>(move |p| {
            let _ = tx1.send(p.a + p.b);
        });

        let bytes = Bytes::from(rmp_serde::to_vec_named(&PushData { a: 2, b: 3 }).unwrap());
        mgr.send_raw(type_tag::<PushData>(), bytes);

        assert_eq!(recv_timeout(&mut rx).await, Some(5));
    }

    #[tokio::test]
    async fn test_undecodable_value_is_dropped_not_fatal() {
        let mgr = CallbackManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let tx1 = tx.clone();
        mgr.subscribe::<PushData, _>(move |p| {
            let _ = tx1.send(p.a);
        });

        mgr.send_raw(type_tag::<PushData>(), Bytes::from_static(&[0xc1]));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }
}
