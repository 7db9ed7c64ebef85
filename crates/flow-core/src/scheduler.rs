//! Debouncer por clave sobre tokio.
//!
//! `schedule(key, delay, task)` programa `task` tras `delay`; reprogramar la
//! misma clave aborta la tarea pendiente anterior. Una vez vencido el plazo la
//! entrada se retira antes de ejecutar `task`, de modo que `cancel` sólo
//! afecta a trabajo aún no iniciado (el trabajo en vuelo nunca se aborta).
//!
//! Los tiempos usan `tokio::time`, por lo que los tests pueden correr con el
//! reloj pausado (`start_paused = true`) sin esperas reales.
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use log::debug;
use tokio::task::JoinHandle;

struct PendingTask {
    ticket: u64,
    handle: JoinHandle<()>,
}

pub struct Debouncer<K>
    where K: Eq + Hash
{
    name: &'static str,
    tasks: DashMap<K, PendingTask>,
    tickets: AtomicU64,
}

impl<K> Debouncer<K> where K: Eq + Hash + Clone + Debug + Send + Sync + 'static
{
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self { name,
                        tasks: DashMap::new(),
                        tickets: AtomicU64::new(0) })
    }

    /// Programa `task` para `key` tras `delay`, reemplazando (y abortando)
    /// cualquier tarea pendiente de la misma clave.
    pub fn schedule<F>(self: &Arc<Self>, key: K, delay: Duration, task: F)
        where F: Future<Output = ()> + Send + 'static
    {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed) + 1;
        let weak: Weak<Self> = Arc::downgrade(self);
        let fired_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(this) = weak.upgrade() {
                this.tasks.remove_if(&fired_key, |_, p| p.ticket == ticket);
            }
            task.await;
        });
        if let Some(previous) = self.tasks.insert(key.clone(), PendingTask { ticket, handle }) {
            previous.handle.abort();
            debug!("{}:debounce:reschedule key={:?}", self.name, key);
        } else {
            debug!("{}:debounce:schedule key={:?} delay_ms={}", self.name, key, delay.as_millis());
        }
    }

    /// Cancela la tarea pendiente de `key`. Devuelve `true` si había una.
    pub fn cancel(&self, key: &K) -> bool {
        match self.tasks.remove(key) {
            Some((_, pending)) => {
                pending.handle.abort();
                debug!("{}:debounce:cancel key={:?}", self.name, key);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.tasks.get(key).map(|p| !p.handle.is_finished()).unwrap_or(false)
    }

    /// Cancela todo lo pendiente y devuelve las claves afectadas.
    pub fn cancel_all(&self) -> Vec<K> {
        let mut cancelled = Vec::new();
        self.tasks.retain(|key, p| {
                      if !p.handle.is_finished() {
                          cancelled.push(key.clone());
                      }
                      p.handle.abort();
                      false
                  });
        cancelled
    }
}

impl<K> Drop for Debouncer<K> where K: Eq + Hash
{
    fn drop(&mut self) {
        for entry in self.tasks.iter() {
            entry.value().handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn rescheduling_keeps_only_the_last_task() {
        let d = Debouncer::<String>::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(AtomicUsize::new(0));
        for i in 1..=3 {
            let hits = hits.clone();
            let last = last.clone();
            d.schedule("k".to_string(), Duration::from_millis(100), async move {
                 hits.fetch_add(1, Ordering::SeqCst);
                 last.store(i, Ordering::SeqCst);
             });
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(d.is_pending(&"k".to_string()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(last.load(Ordering::SeqCst), 3);
        assert!(!d.is_pending(&"k".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_execution_and_keys_are_independent() {
        let d = Debouncer::<String>::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        for key in ["a", "b"] {
            let hits = hits.clone();
            d.schedule(key.to_string(), Duration::from_millis(50), async move {
                 hits.fetch_add(1, Ordering::SeqCst);
             });
        }
        assert!(d.cancel(&"a".to_string()));
        assert!(!d.cancel(&"a".to_string()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_reports_only_unfired_keys() {
        let d = Debouncer::<String>::new("test");
        d.schedule("early".to_string(), Duration::from_millis(10), async {});
        d.schedule("late".to_string(), Duration::from_millis(500), async {});
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(d.cancel_all(), vec!["late".to_string()]);
        assert!(!d.is_pending(&"late".to_string()));
    }
}
