//! Minimal publish/subscribe helper.
//!
//! Components compose an `Emitter` rather than inheriting from one; they
//! expose `on`/`off` that delegate to it.

use crate::util::lock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Event name whose listeners receive every emitted event.
pub const ANY_EVENT: &str = "*";

type Listener<T> = Arc<dyn Fn(&str, &T) + Send + Sync>;

/// Handle returned by [`Emitter::on`], used to remove that listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration<T> {
    id: ListenerId,
    once: bool,
    listener: Listener<T>,
}

/// Listener registry keyed by event name.
pub struct Emitter<T> {
    listeners: Mutex<HashMap<String, Vec<Registration<T>>>>,
    next_id: AtomicU64,
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = lock(&self.listeners);
        let counts: HashMap<&str, usize> = listeners
            .iter()
            .map(|(event, regs)| (event.as_str(), regs.len()))
            .collect();
        f.debug_struct("Emitter").field("listeners", &counts).finish()
    }
}

impl<T> Emitter<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a listener for `event`.
    pub fn on<F>(&self, event: &str, f: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.register(event, false, Arc::new(move |_, data| f(data)))
    }

    /// Add a listener that is removed before its first invocation.
    pub fn once<F>(&self, event: &str, f: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.register(event, true, Arc::new(move |_, data| f(data)))
    }

    /// Add a listener for every event; it also receives the event name.
    pub fn on_any<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&str, &T) + Send + Sync + 'static,
    {
        self.register(ANY_EVENT, false, Arc::new(f))
    }

    fn register(&self, event: &str, once: bool, listener: Listener<T>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners)
            .entry(event.to_string())
            .or_default()
            .push(Registration { id, once, listener });
        id
    }

    /// Remove one listener. Returns false if it was not registered.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let Some(regs) = listeners.get_mut(event) else {
            return false;
        };
        let before = regs.len();
        regs.retain(|reg| reg.id != id);
        before != regs.len()
    }

    /// Remove every listener of `event`.
    pub fn off_event(&self, event: &str) {
        lock(&self.listeners).remove(event);
    }

    /// Remove every listener.
    pub fn off_all(&self) {
        lock(&self.listeners).clear();
    }

    pub fn listener_count(&self, event: &str) -> usize {
        lock(&self.listeners).get(event).map_or(0, Vec::len)
    }

    /// Call every listener of `event`, then every wildcard listener.
    ///
    /// Listeners run outside the registry lock, so they may add or remove
    /// listeners (including themselves) while being called.
    pub fn emit(&self, event: &str, data: &T) {
        let mut targets = Vec::new();
        {
            let mut listeners = lock(&self.listeners);
            for name in [event, ANY_EVENT] {
                if let Some(regs) = listeners.get_mut(name) {
                    targets.extend(regs.iter().map(|reg| reg.listener.clone()));
                    regs.retain(|reg| !reg.once);
                }
                if event == ANY_EVENT {
                    break;
                }
            }
        }

        for listener in targets {
            listener(event, data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_listener() {
        let emitter = Emitter::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        emitter.on("tick", move |n| sink.lock().unwrap().push(*n));
        emitter.emit("tick", &1);
        emitter.emit("tock", &2);
        emitter.emit("tick", &3);

        assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_off_removes_single_listener() {
        let emitter = Emitter::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c1 = calls.clone();
        let first = emitter.on("ping", move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = calls.clone();
        emitter.on("ping", move |_| {
            c2.fetch_add(10, Ordering::SeqCst);
        });

        assert!(emitter.off("ping", first));
        assert!(!emitter.off("ping", first));
        emitter.emit("ping", &());

        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_once_fires_once() {
        let emitter = Emitter::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();

        emitter.once("redundant", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        emitter.emit("redundant", &());
        emitter.emit("redundant", &());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count("redundant"), 0);
    }

    #[test]
    fn test_wildcard_receives_event_name() {
        let emitter = Emitter::<i32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        emitter.on_any(move |event, n| sink.lock().unwrap().push((event.to_string(), *n)));
        emitter.emit("a", &1);
        emitter.emit("b", &2);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("a".to_string(), 1), ("b".to_string(), 2)]
        );
    }

    #[test]
    fn test_listener_can_unsubscribe_itself() {
        let emitter = Arc::new(Emitter::<()>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let id_slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let e = emitter.clone();
        let c = calls.clone();
        let slot = id_slot.clone();
        let id = emitter.on("x", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *slot.lock().unwrap() {
                e.off("x", id);
            }
        });
        *id_slot.lock().unwrap() = Some(id);

        emitter.emit("x", &());
        emitter.emit("x", &());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
