//! External extension points: extra consumers of broker events.

use crate::mqtt::{ConnectOutcome, DisconnectReason, MQTTMessage, SubscribeAck};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

pub struct CallbackList<A: ?Sized> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(CallbackId, Arc<dyn Fn(&A) + Send + Sync>)>>,
}

impl<A: ?Sized> Default for CallbackList<A> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<A: ?Sized> CallbackList<A> {
    pub fn add<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let callback: Arc<dyn Fn(&A) + Send + Sync> = Arc::new(callback);
        self.entries.lock().push((id, callback));
        id
    }

    /// Returns `false` if the id was not registered.
    pub fn remove(&self, id: CallbackId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Calls every callback outside the lock, so callbacks may re-register.
    pub fn emit(&self, arg: &A) {
        let callbacks: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(arg);
        }
    }
}

#[derive(Default)]
pub struct BridgeObservers {
    pub connect: CallbackList<ConnectOutcome>,
    pub disconnect: CallbackList<DisconnectReason>,
    pub subscribe: CallbackList<SubscribeAck>,
    pub message: CallbackList<MQTTMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_add_emit_remove() {
        let list: CallbackList<str> = CallbackList::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = list.add(move |topic: &str| {
            assert_eq!(topic, "a/b");
            counter.fetch_add(1, Ordering::SeqCst);
        });
        list.emit("a/b");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(list.remove(id));
        assert!(!list.remove(id));
        assert!(list.is_empty());
        list.emit("a/b");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_register_another() {
        let list: Arc<CallbackList<u8>> = Arc::new(CallbackList::default());
        let inner = list.clone();
        list.add(move |_| {
            inner.add(|_| {});
        });
        list.emit(&0);
        assert_eq!(list.len(), 2);
    }
}
