//! Pub/sub por `estimate_id`.
//!
//! Contrato:
//! - Los callbacks de una clave se invocan en orden de suscripción.
//! - `Subscription::unsubscribe` es idempotente y sólo desacopla el callback;
//!   no cancela trabajo en vuelo.
//! - El pánico de un suscriptor no interrumpe la entrega al resto.
//! - Los callbacks se invocan sin ningún lock tomado, de modo que pueden
//!   suscribir/desuscribir desde dentro del callback.
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use log::warn;
use tokio::sync::mpsc;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

trait Detach: Send + Sync {
    fn detach(&self, key: &str, id: u64) -> bool;
}

struct HubInner<T> {
    name: &'static str,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<String, Vec<(u64, Callback<T>)>>>,
}

impl<T: 'static> Detach for HubInner<T> {
    fn detach(&self, key: &str, id: u64) -> bool {
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = subs.get_mut(key) else { return false };
        let before = list.len();
        list.retain(|(sid, _)| *sid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subs.remove(key);
        }
        removed
    }
}

/// Registro de callbacks por clave.
pub struct SubscriptionHub<T> {
    inner: Arc<HubInner<T>>,
}

impl<T> Clone for SubscriptionHub<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Send + Sync + 'static> SubscriptionHub<T> {
    pub fn new(name: &'static str) -> Self {
        Self { inner: Arc::new(HubInner { name,
                                          next_id: AtomicU64::new(0),
                                          subscribers: Mutex::new(HashMap::new()) }) }
    }

    pub fn subscribe<F>(&self, key: &str, callback: F) -> Subscription
        where F: Fn(&T) + Send + Sync + 'static
    {
        let id = self.next_id();
        self.register(key, id, Arc::new(callback))
    }

    /// Adaptador a canal: cada publicación de `key` se reenvía al receptor.
    /// Si el receptor ya se soltó, la primera publicación fallida desacopla
    /// el callback.
    pub fn channel(&self, key: &str) -> (Subscription, mpsc::UnboundedReceiver<T>)
        where T: Clone
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id();
        let hub = Arc::downgrade(&self.inner);
        let owner = key.to_string();
        let forward = move |value: &T| {
            if tx.send(value.clone()).is_err() {
                if let Some(hub) = hub.upgrade() {
                    hub.detach(&owner, id);
                }
            }
        };
        (self.register(key, id, Arc::new(forward)), rx)
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn register(&self, key: &str, id: u64, callback: Callback<T>) -> Subscription {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .push((id, callback));
        let weak: Weak<HubInner<T>> = Arc::downgrade(&self.inner);
        let detach: Weak<dyn Detach> = weak;
        Subscription { id,
                       estimate_id: key.to_string(),
                       hub: detach,
                       active: AtomicBool::new(true) }
    }

    /// Entrega `value` a todos los suscriptores de `key`. Devuelve cuántos
    /// callbacks terminaron sin pánico.
    pub fn publish(&self, key: &str, value: &T) -> usize {
        let callbacks: Vec<(u64, Callback<T>)> = self.inner
                                                     .subscribers
                                                     .lock()
                                                     .unwrap_or_else(PoisonError::into_inner)
                                                     .get(key)
                                                     .cloned()
                                                     .unwrap_or_default();
        let mut delivered = 0;
        for (id, cb) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| cb(value))) {
                Ok(()) => delivered += 1,
                Err(_) => warn!("{}:publish:subscriber_panicked key={key} subscription={id}", self.inner.name),
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

/// Handle de una suscripción. Soltarlo NO desuscribe: hay que llamar a
/// `unsubscribe` explícitamente.
pub struct Subscription {
    id: u64,
    estimate_id: String,
    hub: Weak<dyn Detach>,
    active: AtomicBool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn estimate_id(&self) -> &str {
        &self.estimate_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Desacopla el callback. Idempotente: sólo la primera llamada tiene
    /// efecto y devuelve `true`.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        match self.hub.upgrade() {
            Some(hub) => hub.detach(&self.estimate_id, self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
         .field("id", &self.id)
         .field("estimate_id", &self.estimate_id)
         .field("active", &self.is_active())
         .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn delivery_follows_subscription_order_per_key() {
        let hub = SubscriptionHub::<u32>::new("test");
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s1 = seen.clone();
        let s2 = seen.clone();
        let _a = hub.subscribe("e1", move |v| s1.lock().unwrap().push(("a", *v)));
        let _b = hub.subscribe("e1", move |v| s2.lock().unwrap().push(("b", *v)));
        assert_eq!(hub.publish("e1", &7), 2);
        assert_eq!(hub.publish("other", &9), 0);
        assert_eq!(*seen.lock().unwrap(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let hub = SubscriptionHub::<u32>::new("test");
        let sub = hub.subscribe("e1", |_| {});
        assert_eq!(hub.subscriber_count("e1"), 1);
        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        assert!(!sub.is_active());
        assert_eq!(hub.subscriber_count("e1"), 0);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let hub = SubscriptionHub::<u32>::new("test");
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = seen.clone();
        let _p = hub.subscribe("e1", |_| panic!("boom"));
        let _ok = hub.subscribe("e1", move |v| s.lock().unwrap().push(*v));
        assert_eq!(hub.publish("e1", &1), 1);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn callback_may_unsubscribe_itself() {
        let hub = SubscriptionHub::<u32>::new("test");
        let slot: Arc<StdMutex<Option<Subscription>>> = Arc::new(StdMutex::new(None));
        let inner = slot.clone();
        let sub = hub.subscribe("e1", move |_| {
                         if let Some(s) = inner.lock().unwrap().as_ref() {
                             s.unsubscribe();
                         }
                     });
        *slot.lock().unwrap() = Some(sub);
        hub.publish("e1", &1);
        assert_eq!(hub.subscriber_count("e1"), 0);
    }

    #[tokio::test]
    async fn channel_forwards_publications() {
        let hub = SubscriptionHub::<u32>::new("test");
        let (sub, mut rx) = hub.channel("e1");
        hub.publish("e1", &3);
        hub.publish("e1", &4);
        assert_eq!(rx.recv().await, Some(3));
        assert_eq!(rx.recv().await, Some(4));
        sub.unsubscribe();
        hub.publish("e1", &5);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_receiver_detaches_on_next_publish() {
        let hub = SubscriptionHub::<u32>::new("test");
        let (_sub, rx) = hub.channel("e1");
        let _other = hub.subscribe("e1", |_| {});
        assert_eq!(hub.subscriber_count("e1"), 2);
        drop(rx);
        hub.publish("e1", &1);
        assert_eq!(hub.subscriber_count("e1"), 1);
    }
}
