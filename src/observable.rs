//! Observer lists used for event fan-out between subsystems.
//!
//! Every entity that raises events (client, presence, registry, metadata views,
//! component state) owns a [`Subject`]. Observers attach with `subscribe` and
//! receive events on their own unbounded channel, so notifying never blocks the
//! notifier and never runs foreign code under its locks. Dropping an
//! [`Observer`] detaches it.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

type Senders<T> = Mutex<HashMap<u64, mpsc::UnboundedSender<T>>>;

struct SubjectInner<T> {
    senders: Senders<T>,
    next_token: AtomicU64,
}

/// Fan-out point for events of type `T`.
pub struct Subject<T> {
    inner: Arc<SubjectInner<T>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Subject<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SubjectInner {
                senders: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(&self) -> Observer<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.register(tx);
        Observer {
            token,
            receiver: rx,
            subject: Arc::downgrade(&self.inner),
        }
    }

    /// Attaches an observer that first receives `initial`, then live events.
    /// Callers serialize this against their own `notify` calls so that no
    /// event is lost or duplicated between the two.
    pub fn subscribe_with<I: IntoIterator<Item = T>>(&self, initial: I) -> Observer<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in initial {
            let _ = tx.send(event);
        }
        let token = self.register(tx);
        Observer {
            token,
            receiver: rx,
            subject: Arc::downgrade(&self.inner),
        }
    }

    fn register(&self, sender: mpsc::UnboundedSender<T>) -> u64 {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        self.inner.senders.lock().insert(token, sender);
        token
    }

    /// Sends `event` to every attached observer. Observers whose receiving side
    /// is gone are pruned.
    pub fn notify(&self, event: T) {
        let mut senders = self.inner.senders.lock();
        senders.retain(|_, sender| sender.send(event.clone()).is_ok());
    }

    pub fn observer_count(&self) -> usize {
        self.inner.senders.lock().len()
    }
}

/// Receiving end of a [`Subject`] registration.
pub struct Observer<T> {
    token: u64,
    receiver: mpsc::UnboundedReceiver<T>,
    subject: Weak<SubjectInner<T>>,
}

impl<T> Observer<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

impl<T> Drop for Observer<T> {
    fn drop(&mut self) {
        if let Some(subject) = self.subject.upgrade() {
            subject.senders.lock().remove(&self.token);
        }
    }
}

/// A value with change notifications. Updates with an equal value are
/// suppressed.
pub struct ObservableValue<T> {
    inner: Arc<ValueInner<T>>,
}

struct ValueInner<T> {
    value: RwLock<T>,
    subject: Subject<T>,
}

impl<T> Clone for ObservableValue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> ObservableValue<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(ValueInner {
                value: RwLock::new(initial),
                subject: Subject::new(),
            }),
        }
    }

    pub fn get(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Returns `true` when the value actually changed.
    pub fn update(&self, new_value: T) -> bool {
        // notify under the write lock so a concurrent subscribe(send_current)
        // sees either the old value plus this event, or the new value alone
        let mut value = self.inner.value.write();
        if *value == new_value {
            return false;
        }

        *value = new_value.clone();
        self.inner.subject.notify(new_value);
        true
    }

    pub fn subscribe(&self, send_current: bool) -> Observer<T> {
        let value = self.inner.value.read();
        if send_current {
            self.inner.subject.subscribe_with([value.clone()])
        } else {
            self.inner.subject.subscribe()
        }
    }

    /// Same value cell (clones share one cell).
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone + std::fmt::Debug> std::fmt::Debug for ObservableValue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ObservableValue")
            .field(&*self.inner.value.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subject_fans_out_to_every_observer() {
        let subject = Subject::<u32>::new();
        let mut first = subject.subscribe();
        let mut second = subject.subscribe();

        subject.notify(7);

        assert_eq!(first.recv().await, Some(7));
        assert_eq!(second.recv().await, Some(7));
    }

    #[test]
    fn dropped_observer_is_detached() {
        let subject = Subject::<u32>::new();
        let observer = subject.subscribe();
        assert_eq!(subject.observer_count(), 1);

        drop(observer);
        assert_eq!(subject.observer_count(), 0);
    }

    #[test]
    fn value_suppresses_identical_updates() {
        let value = ObservableValue::new(false);
        let mut observer = value.subscribe(false);

        assert!(value.update(true));
        assert!(!value.update(true));

        assert_eq!(observer.try_recv(), Some(true));
        assert_eq!(observer.try_recv(), None);
    }

    #[test]
    fn value_subscribe_can_send_current() {
        let value = ObservableValue::new(Some(3));
        let mut observer = value.subscribe(true);
        assert_eq!(observer.try_recv(), Some(Some(3)));
    }
}
